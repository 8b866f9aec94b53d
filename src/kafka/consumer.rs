//! The consumer group host: the one owner of the broker client and of the
//! poll thread that everything else hangs off.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use rdkafka::consumer::{BaseConsumer, Consumer};
use rdkafka::error::KafkaError;
use rdkafka::ClientConfig;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use crate::health::HealthHandle;
use crate::kafka::codec::PayloadDecoder;
use crate::kafka::context::{EntryFactory, HostContext};
use crate::kafka::filter::StreamFilter;
use crate::kafka::processor::ProcessorProvider;
use crate::kafka::types::Record;
use crate::kafka::ShutdownSignals;
use crate::metrics_consts::{BROKER_EVENTS, CONSUME_ERRORS, SUBSCRIPTION_REFRESHES};

/// Knobs for the poll loop and the processor hosts it creates.
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Single poll tick; also the idle sleep while nothing matches the filter
    pub polling_interval: Duration,
    /// Minimum period between metadata-driven subscription refreshes
    pub update_subscription_interval: Duration,
    /// Deadline for one metadata fetch
    pub metadata_timeout: Duration,
    /// Upper bound on records handed to a processor per call
    pub max_batch_size: usize,
    /// Bound for each per-stream queue; controls backpressure onset
    pub max_queue_size: usize,
}

pub struct ConsumerGroupHost<T: Send + 'static> {
    consumer: BaseConsumer<HostContext<T>>,
    filter: Arc<dyn StreamFilter>,
    host_config: HostConfig,
    signals: ShutdownSignals,
    liveness: Option<HealthHandle>,
}

impl<T: Send + 'static> ConsumerGroupHost<T> {
    /// Build the host and its broker client. The client is owned here
    /// exclusively and dropped only after the poll loop has finished.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client_config: ClientConfig,
        host_config: HostConfig,
        filter: Arc<dyn StreamFilter>,
        provider: Arc<dyn ProcessorProvider<T>>,
        decoder: Arc<dyn PayloadDecoder<T>>,
        signals: ShutdownSignals,
        liveness: Option<HealthHandle>,
        rt: Handle,
    ) -> Result<Self> {
        let context = HostContext::new(EntryFactory {
            decoder,
            provider,
            signals: signals.clone(),
            max_batch_size: host_config.max_batch_size,
            max_queue_size: host_config.max_queue_size,
            rt,
        });

        let consumer: BaseConsumer<HostContext<T>> = client_config
            .create_with_context(context)
            .context("failed to create Kafka consumer")?;

        Ok(Self {
            consumer,
            filter,
            host_config,
            signals,
            liveness,
        })
    }

    /// Run the poll loop until shutdown is requested. Blocks the calling
    /// thread; run it on a dedicated thread (`spawn_blocking`). All broker
    /// callbacks fire synchronously inside `poll()` on this thread.
    pub fn run(self) -> Result<()> {
        info!("starting consumer group host poll loop");

        let mut subscribed = match self.refresh_subscription() {
            Ok(subscribed) => subscribed,
            Err(e) => {
                warn!("initial subscription refresh failed: {e:#}");
                false
            }
        };
        let mut last_refresh = Instant::now();

        while !self.signals.shutdown().is_cancelled() {
            if let Some(handle) = &self.liveness {
                handle.report_healthy();
            }

            if subscribed {
                match self.consumer.poll(self.host_config.polling_interval) {
                    None => {}
                    Some(Ok(message)) => {
                        let record = Record::from_borrowed_message(&message);
                        if self.consumer.context().dispatch(record).is_err() {
                            // Entry table corruption; the fatal path has
                            // already requested shutdown
                            break;
                        }
                    }
                    Some(Err(KafkaError::PartitionEOF(partition))) => {
                        metrics::counter!(BROKER_EVENTS, "kind" => "partition_eof").increment(1);
                        info!(partition = partition, "reached end of partition");
                    }
                    Some(Err(e)) => {
                        metrics::counter!(CONSUME_ERRORS).increment(1);
                        warn!("failed to consume record, dropping: {e}");
                    }
                }
            } else {
                // Nothing matches the filter yet; idle instead of
                // hot-spinning an unsubscribed consumer
                std::thread::sleep(self.host_config.polling_interval);
            }

            if last_refresh.elapsed() >= self.host_config.update_subscription_interval {
                match self.refresh_subscription() {
                    Ok(any) => subscribed = any,
                    Err(e) => warn!("subscription refresh failed: {e:#}"),
                }
                last_refresh = Instant::now();
            }
        }

        info!("poll loop exiting, draining processor hosts");
        self.consumer.context().drain_all();
        // The consumer drops here, after every worker has joined
        Ok(())
    }

    /// Discover streams from cluster metadata and subscribe to the ones the
    /// filter owns. Returns whether anything matched. Never creates or
    /// destroys processor hosts; that happens in the assignment callback.
    fn refresh_subscription(&self) -> Result<bool> {
        let metadata = self
            .consumer
            .fetch_metadata(None, self.host_config.metadata_timeout)
            .context("failed to fetch cluster metadata")?;

        let matches = select_streams(
            metadata.topics().iter().map(|topic| topic.name()),
            self.filter.as_ref(),
        );

        if matches.is_empty() {
            metrics::counter!(SUBSCRIPTION_REFRESHES, "outcome" => "empty").increment(1);
            debug!("no discovered streams match the filter");
            return Ok(false);
        }

        let topic_refs: Vec<&str> = matches.iter().map(String::as_str).collect();
        self.consumer
            .subscribe(&topic_refs)
            .with_context(|| format!("failed to subscribe to {} streams", matches.len()))?;

        metrics::counter!(SUBSCRIPTION_REFRESHES, "outcome" => "subscribed").increment(1);
        info!(streams = matches.len(), "subscription refreshed");
        Ok(true)
    }
}

/// Apply the stream filter to a discovered topic listing. Sorted so the
/// subscription list is stable across refreshes of unchanged metadata.
fn select_streams<'a>(
    discovered: impl Iterator<Item = &'a str>,
    filter: &dyn StreamFilter,
) -> Vec<String> {
    let mut matches: Vec<String> = discovered
        .filter(|name| filter.matches(name))
        .map(str::to_string)
        .collect();
    matches.sort_unstable();
    matches.dedup();
    matches
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kafka::filter::SuffixStreamFilter;

    #[test]
    fn test_select_streams_filters_and_sorts() {
        let filter = SuffixStreamFilter::new("-T");
        let discovered = vec!["metrics-T", "__consumer_offsets", "traces-T", "other"];
        let selected = select_streams(discovered.into_iter(), &filter);
        assert_eq!(selected, vec!["metrics-T".to_string(), "traces-T".to_string()]);
    }

    #[test]
    fn test_select_streams_is_idempotent() {
        let filter = SuffixStreamFilter::new("-T");
        let discovered = ["traces-T", "metrics-T"];
        let first = select_streams(discovered.iter().copied(), &filter);
        let second = select_streams(discovered.iter().copied(), &filter);
        assert_eq!(first, second);
    }

    #[test]
    fn test_select_streams_empty_metadata() {
        let filter = SuffixStreamFilter::new("-T");
        let selected = select_streams(std::iter::empty(), &filter);
        assert!(selected.is_empty());
    }
}
