//! Broker-facing context for the consumer group host.
//!
//! librdkafka drives every callback here synchronously from within `poll()`
//! on the poll thread: rebalances, client-level errors, log and statistics
//! events, commit results. The processor entry table is therefore only ever
//! touched from that one thread; the `Mutex` around it exists to satisfy
//! `Send + Sync` on the context, not to coordinate concurrent access.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use anyhow::{Context as _, Result};
use chrono::{DateTime, Utc};
use rdkafka::config::RDKafkaLogLevel;
use rdkafka::consumer::{BaseConsumer, Consumer, ConsumerContext};
use rdkafka::error::{KafkaError, KafkaResult};
use rdkafka::types::RDKafkaRespErr;
use rdkafka::util::Timeout;
use rdkafka::{ClientContext, Offset, TopicPartitionList};
use thiserror::Error;
use tokio::runtime::Handle;
use tracing::{debug, error, info, warn};

use crate::kafka::assignment::{plan_assignment, AssignmentPlan};
use crate::kafka::codec::PayloadDecoder;
use crate::kafka::processor::{ProcessorProvider, StreamProcessor};
use crate::kafka::processor_host::ProcessorHost;
use crate::kafka::types::{Record, StreamPartition};
use crate::kafka::ShutdownSignals;
use crate::metrics_consts::{
    BROKER_EVENTS, OFFSET_LOOKUP_FAILURES, REBALANCE_ASSIGNMENTS, REBALANCE_REVOCATIONS,
    RECORDS_DISPATCHED,
};

#[derive(Debug, Error)]
pub enum DispatchError {
    /// The broker handed us a record for a stream we never accepted; the
    /// entry table is corrupt and the process must not keep consuming.
    #[error("record for unassigned stream '{0}'")]
    UnknownStream(String),
}

/// One owned stream: its processor, its host (queue + worker), and the
/// partition set most recently accepted from the broker.
pub struct ProcessorEntry<T: Send + 'static> {
    pub processor: Arc<dyn StreamProcessor<T>>,
    pub host: ProcessorHost<T>,
    pub assigned_partitions: BTreeSet<i32>,
}

/// Everything needed to build and start a processor host for a stream.
pub(crate) struct EntryFactory<T: Send + 'static> {
    pub decoder: Arc<dyn PayloadDecoder<T>>,
    pub provider: Arc<dyn ProcessorProvider<T>>,
    pub signals: ShutdownSignals,
    pub max_batch_size: usize,
    pub max_queue_size: usize,
    pub rt: Handle,
}

impl<T: Send + 'static> EntryFactory<T> {
    fn create_entry(&self, stream: &str) -> Result<ProcessorEntry<T>> {
        let processor = self
            .provider
            .get_processor(stream)
            .with_context(|| format!("no processor available for stream '{stream}'"))?;
        let mut host = ProcessorHost::new(
            stream.to_string(),
            self.decoder.clone(),
            processor.clone(),
            self.signals.clone(),
            self.max_batch_size,
            self.max_queue_size,
            self.rt.clone(),
        );
        host.start()
            .with_context(|| format!("failed to start worker for stream '{stream}'"))?;
        Ok(ProcessorEntry {
            processor,
            host,
            assigned_partitions: BTreeSet::new(),
        })
    }
}

pub struct HostContext<T: Send + 'static> {
    // Poll-thread-only; see module docs
    table: Mutex<HashMap<String, ProcessorEntry<T>>>,
    factory: EntryFactory<T>,
    signals: ShutdownSignals,
}

impl<T: Send + 'static> HostContext<T> {
    pub(crate) fn new(factory: EntryFactory<T>) -> Self {
        let signals = factory.signals.clone();
        Self {
            table: Mutex::new(HashMap::new()),
            factory,
            signals,
        }
    }

    /// Streams currently owned, for logging and assertions.
    pub fn assigned_streams(&self) -> Vec<String> {
        let table = self.lock_table();
        let mut streams: Vec<String> = table.keys().cloned().collect();
        streams.sort_unstable();
        streams
    }

    /// The partition set most recently accepted for a stream, if owned.
    pub fn assigned_partitions(&self, stream: &str) -> Option<BTreeSet<i32>> {
        self.lock_table()
            .get(stream)
            .map(|entry| entry.assigned_partitions.clone())
    }

    /// Hand one polled record to its stream's host. Blocks while the queue
    /// is full; that stalls `poll()` and is the intended backpressure.
    pub(crate) fn dispatch(&self, record: Record) -> Result<(), DispatchError> {
        let table = self.lock_table();
        let Some(entry) = table.get(&record.stream) else {
            let stream = record.stream.clone();
            error!(
                stream = %stream,
                partition = record.partition,
                offset = record.offset,
                "record for a stream with no processor entry; state is corrupt"
            );
            self.signals.trigger_fatal();
            return Err(DispatchError::UnknownStream(stream));
        };

        match entry.host.enqueue_blocking(record) {
            Ok(()) => {
                metrics::counter!(RECORDS_DISPATCHED).increment(1);
            }
            Err(e) => {
                // The worker is gone. During a shutdown that is expected;
                // otherwise it died on a processor failure and the fatal
                // path is already driving the process down.
                if !self.signals.shutdown().is_cancelled() {
                    error!("dropping record for dead worker: {e}");
                    self.signals.trigger_fatal();
                } else {
                    debug!("dropping record during shutdown: {e}");
                }
            }
        }
        Ok(())
    }

    /// Seal every queue, then join each worker in turn. Called by the poll
    /// loop after it exits, before the consumer is dropped.
    pub(crate) fn drain_all(&self) {
        let mut table = self.lock_table();
        let mut entries: Vec<ProcessorEntry<T>> = table.drain().map(|(_, entry)| entry).collect();
        for entry in &mut entries {
            entry.host.complete_adding();
        }
        for entry in &mut entries {
            entry.host.join_blocking();
        }
    }

    /// Create hosts for newly granted streams, compute the assignment plan,
    /// update the table and drain orphaned hosts. Returns the plan so the
    /// caller can hand the offsets to the broker's assign call.
    ///
    /// Split from `handle_assign` so the table bookkeeping can be exercised
    /// with an injected offset resolver.
    pub(crate) fn plan_and_apply<FResolve>(
        &self,
        incoming: BTreeMap<String, BTreeSet<i32>>,
        resolve: FResolve,
    ) -> Result<AssignmentPlan>
    where
        FResolve: FnMut(&str, &BTreeSet<i32>, DateTime<Utc>) -> HashMap<i32, Option<i64>>,
    {
        let mut table = self.lock_table();

        for stream in incoming.keys() {
            if !table.contains_key(stream) {
                let entry = self.factory.create_entry(stream)?;
                info!(stream = %stream, "created processor host for newly assigned stream");
                table.insert(stream.clone(), entry);
            }
        }

        let current: HashMap<String, BTreeSet<i32>> = table
            .iter()
            .map(|(stream, entry)| (stream.clone(), entry.assigned_partitions.clone()))
            .collect();

        let plan = plan_assignment(
            &current,
            &incoming,
            |stream| {
                table
                    .get(stream)
                    .and_then(|entry| entry.processor.start_timestamp_on_rebalance(stream))
            },
            resolve,
        );

        for (stream, partitions) in &incoming {
            if let Some(entry) = table.get_mut(stream) {
                entry.assigned_partitions = partitions.clone();
            }
        }

        for stream in &plan.removed {
            if let Some(mut entry) = table.remove(stream) {
                info!(stream = %stream, "stream no longer assigned, draining processor host");
                entry.host.complete_adding();
                entry.host.join_blocking();
            }
        }

        Ok(plan)
    }

    fn handle_assign(&self, consumer: &BaseConsumer<Self>, tpl: &TopicPartitionList) {
        let incoming = group_by_stream(tpl);
        info!(
            streams = incoming.len(),
            partitions = tpl.count(),
            "accepting partition assignment"
        );
        metrics::counter!(REBALANCE_ASSIGNMENTS).increment(1);

        let plan = match self.plan_and_apply(incoming, |stream, partitions, timestamp| {
            resolve_offsets_for_times(consumer, stream, partitions, timestamp)
        }) {
            Ok(plan) => plan,
            Err(e) => {
                error!("failed to apply partition assignment: {e:#}");
                self.signals.trigger_fatal();
                return;
            }
        };

        let mut assign_tpl = TopicPartitionList::with_capacity(plan.offsets.len());
        for spo in &plan.offsets {
            if let Err(e) = assign_tpl.add_partition_offset(&spo.stream, spo.partition, spo.offset)
            {
                error!(
                    stream = %spo.stream,
                    partition = spo.partition,
                    "invalid resume position: {e}"
                );
            }
        }

        if let Err(e) = consumer.assign(&assign_tpl) {
            error!("broker rejected partition assignment: {e}");
            self.signals.trigger_fatal();
        }
    }

    fn handle_revoke(&self, consumer: &BaseConsumer<Self>, tpl: &TopicPartitionList) {
        let revoked: Vec<StreamPartition> =
            tpl.elements().into_iter().map(StreamPartition::from).collect();
        info!(partitions = revoked.len(), "partitions revoked, unassigning");
        debug!(revoked = ?revoked, "revoked partition set");
        metrics::counter!(REBALANCE_REVOCATIONS).increment(1);

        // Hosts are not torn down here. A revoke is usually followed at
        // once by a fresh assignment, and keeping the queues live lets
        // in-flight batches survive a no-op rebalance without replay.
        if let Err(e) = consumer.unassign() {
            error!("failed to unassign partitions: {e}");
        }
    }

    fn lock_table(&self) -> std::sync::MutexGuard<'_, HashMap<String, ProcessorEntry<T>>> {
        self.table.lock().expect("processor entry table poisoned")
    }
}

/// Resolve "earliest offset at or after this wall time" for a set of
/// partitions. Waits on the broker without a deadline: an accurate seek is
/// preferred over racing the rebalance. Per-partition failures resolve to
/// `None` so only that partition falls back to the stored commit.
fn resolve_offsets_for_times<C: ConsumerContext>(
    consumer: &BaseConsumer<C>,
    stream: &str,
    partitions: &BTreeSet<i32>,
    timestamp: DateTime<Utc>,
) -> HashMap<i32, Option<i64>> {
    let mut query = TopicPartitionList::with_capacity(partitions.len());
    for partition in partitions {
        if let Err(e) = query.add_partition_offset(
            stream,
            *partition,
            Offset::Offset(timestamp.timestamp_millis()),
        ) {
            warn!(
                stream = %stream,
                partition = *partition,
                "could not query offset for timestamp: {e}"
            );
        }
    }

    let resolved = match consumer.offsets_for_times(query, Timeout::Never) {
        Ok(resolved) => resolved,
        Err(e) => {
            error!(stream = %stream, "offsets_for_times failed: {e}");
            metrics::counter!(OFFSET_LOOKUP_FAILURES).increment(partitions.len() as u64);
            return partitions.iter().map(|p| (*p, None)).collect();
        }
    };

    let mut out: HashMap<i32, Option<i64>> = partitions.iter().map(|p| (*p, None)).collect();
    for elem in resolved.elements() {
        if elem.topic() != stream {
            continue;
        }
        let offset = match (elem.error(), elem.offset()) {
            (Ok(()), Offset::Offset(offset)) => Some(offset),
            (Ok(()), other) => {
                warn!(
                    stream = %stream,
                    partition = elem.partition(),
                    "no offset at or after timestamp, resuming from stored commit: {other:?}"
                );
                metrics::counter!(OFFSET_LOOKUP_FAILURES).increment(1);
                None
            }
            (Err(e), _) => {
                warn!(
                    stream = %stream,
                    partition = elem.partition(),
                    "offset lookup failed, resuming from stored commit: {e}"
                );
                metrics::counter!(OFFSET_LOOKUP_FAILURES).increment(1);
                None
            }
        };
        out.insert(elem.partition(), offset);
    }
    out
}

pub(crate) fn group_by_stream(tpl: &TopicPartitionList) -> BTreeMap<String, BTreeSet<i32>> {
    let mut grouped: BTreeMap<String, BTreeSet<i32>> = BTreeMap::new();
    for elem in tpl.elements() {
        grouped
            .entry(elem.topic().to_string())
            .or_default()
            .insert(elem.partition());
    }
    grouped
}

impl<T: Send + 'static> ClientContext for HostContext<T> {
    /// Map librdkafka's syslog-style levels onto the tracing macros.
    fn log(&self, level: RDKafkaLogLevel, fac: &str, log_message: &str) {
        metrics::counter!(BROKER_EVENTS, "kind" => "log").increment(1);
        match level {
            RDKafkaLogLevel::Emerg
            | RDKafkaLogLevel::Alert
            | RDKafkaLogLevel::Critical
            | RDKafkaLogLevel::Error => {
                error!(facility = fac, "librdkafka: {log_message}")
            }
            RDKafkaLogLevel::Warning => warn!(facility = fac, "librdkafka: {log_message}"),
            RDKafkaLogLevel::Notice | RDKafkaLogLevel::Info => {
                info!(facility = fac, "librdkafka: {log_message}")
            }
            RDKafkaLogLevel::Debug => debug!(facility = fac, "librdkafka: {log_message}"),
        }
    }

    fn error(&self, error: KafkaError, reason: &str) {
        // Client-level errors are retried internally by librdkafka; log and
        // keep consuming.
        metrics::counter!(BROKER_EVENTS, "kind" => "error").increment(1);
        error!("broker client error: {error} ({reason})");
    }

    fn stats_raw(&self, statistics: &[u8]) {
        metrics::counter!(BROKER_EVENTS, "kind" => "stats").increment(1);
        match std::str::from_utf8(statistics) {
            Ok(json) => info!(stats = %json, "broker statistics"),
            Err(_) => warn!("broker statistics were not valid utf-8"),
        }
    }
}

impl<T: Send + 'static> ConsumerContext for HostContext<T> {
    fn rebalance(
        &self,
        base_consumer: &BaseConsumer<Self>,
        err: RDKafkaRespErr,
        tpl: &mut TopicPartitionList,
    ) {
        match err {
            RDKafkaRespErr::RD_KAFKA_RESP_ERR__ASSIGN_PARTITIONS => {
                self.handle_assign(base_consumer, tpl)
            }
            RDKafkaRespErr::RD_KAFKA_RESP_ERR__REVOKE_PARTITIONS => {
                self.handle_revoke(base_consumer, tpl)
            }
            e => error!("rebalance error: {e:?}"),
        }
    }

    fn commit_callback(&self, result: KafkaResult<()>, offsets: &TopicPartitionList) {
        metrics::counter!(BROKER_EVENTS, "kind" => "commit").increment(1);
        match result {
            Ok(()) => debug!(
                partitions = offsets.count(),
                "offsets committed successfully"
            ),
            Err(e) => warn!("failed to commit offsets: {e}"),
        }
    }
}
