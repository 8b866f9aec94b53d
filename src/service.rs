//! Process-level supervisor: wires signals, runs the consumer group host on
//! a dedicated thread, waits for shutdown and classifies the outcome so the
//! binary can pick an exit code.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::runtime::Handle;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::health::HealthRegistry;
use crate::kafka::{
    ConsumerConfigBuilder, ConsumerGroupHost, HostConfig, PayloadDecoder, ProcessorProvider,
    ShutdownSignals, StreamFilter,
};

const POLL_LOOP_HEALTH_DEADLINE: std::time::Duration = std::time::Duration::from_secs(30);

/// How a service run ended. Setup failures surface as `Err` from `run`
/// instead; the caller maps each case to its exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceOutcome {
    /// Stop was requested and every worker drained and joined
    CleanShutdown,
    /// The poll thread or a worker died; the process should exit non-zero
    /// so the orchestrator restarts it
    BackgroundFailure,
}

pub struct ConsumerHostService<T: Send + 'static> {
    config: Config,
    signals: ShutdownSignals,
    host: Option<ConsumerGroupHost<T>>,
}

impl<T: Send + 'static> ConsumerHostService<T> {
    /// Validate configuration and construct the consumer group host. Must
    /// be called from within a tokio runtime; worker tasks are spawned onto
    /// it from the poll thread later.
    pub fn new(
        config: Config,
        liveness: HealthRegistry,
        filter: Arc<dyn StreamFilter>,
        provider: Arc<dyn ProcessorProvider<T>>,
        decoder: Arc<dyn PayloadDecoder<T>>,
    ) -> Result<Self> {
        config.validate().context("configuration validation failed")?;

        let signals = ShutdownSignals::new();

        let client_config =
            ConsumerConfigBuilder::new(&config.kafka_hosts, &config.consumer_group())
                .with_offset_reset(&config.kafka_consumer_offset_reset)
                .with_tls(config.kafka_tls)
                .with_statistics_interval_ms(config.kafka_statistics_interval_ms)
                .with_partition_eof(config.kafka_partition_eof)
                .with_client_id(config.pod_hostname.as_deref())
                .build();

        let poll_health = liveness.register("poll_loop", POLL_LOOP_HEALTH_DEADLINE);

        let host = ConsumerGroupHost::new(
            client_config,
            HostConfig {
                polling_interval: config.polling_interval(),
                update_subscription_interval: config.update_subscription_interval(),
                metadata_timeout: config.metadata_timeout(),
                max_batch_size: config.max_batch_size,
                max_queue_size: config.max_processor_queue_size,
            },
            filter,
            provider,
            decoder,
            signals.clone(),
            Some(poll_health),
            Handle::current(),
        )
        .with_context(|| {
            format!(
                "failed to create consumer group host for group '{}'",
                config.consumer_group()
            )
        })?;

        Ok(Self {
            config,
            signals,
            host: Some(host),
        })
    }

    /// Shared stop machinery, for callers that want to request shutdown
    /// programmatically (tests, embedding).
    pub fn signals(&self) -> ShutdownSignals {
        self.signals.clone()
    }

    /// Run until a stop signal or a background failure. Blocks the caller.
    pub async fn run(mut self) -> Result<ServiceOutcome> {
        let host = self
            .host
            .take()
            .ok_or_else(|| anyhow::anyhow!("service already running"))?;

        install_panic_hook(self.signals.clone());

        info!(
            group = %self.config.consumer_group(),
            suffix = %self.config.stream_suffix,
            "starting consumer group host"
        );

        let mut poll_handle = tokio::task::spawn_blocking(move || host.run());

        let signals = self.signals.clone();
        tokio::spawn(async move {
            wait_for_stop_signal().await;
            info!("stop signal received, shutting down gracefully");
            signals.request_shutdown();
        });

        let poll_result = tokio::select! {
            result = &mut poll_handle => result,
            _ = self.signals.shutdown().cancelled() => {
                match tokio::time::timeout(self.config.shutdown_timeout(), &mut poll_handle).await {
                    Ok(result) => result,
                    Err(_) => {
                        warn!(
                            "graceful drain exceeded {:?}, cancelling in-flight work",
                            self.config.shutdown_timeout()
                        );
                        self.signals.request_cancel();
                        poll_handle.await
                    }
                }
            }
        };

        match poll_result {
            Ok(Ok(())) if self.signals.is_fatal() => {
                error!("consumer group host stopped after a background failure");
                Ok(ServiceOutcome::BackgroundFailure)
            }
            Ok(Ok(())) => {
                info!("consumer group host stopped cleanly");
                Ok(ServiceOutcome::CleanShutdown)
            }
            Ok(Err(e)) => {
                error!("poll loop failed: {e:#}");
                Ok(ServiceOutcome::BackgroundFailure)
            }
            Err(join_error) => {
                error!("poll thread panicked: {join_error}");
                Ok(ServiceOutcome::BackgroundFailure)
            }
        }
    }
}

/// Translate otherwise-unhandled panics anywhere in the process into the
/// cooperative stop so the supervisor can drain and exit non-zero.
fn install_panic_hook(signals: ShutdownSignals) {
    let previous = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        signals.trigger_fatal();
        previous(panic_info);
    }));
}

async fn wait_for_stop_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to listen for SIGTERM");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}
