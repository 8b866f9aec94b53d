use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::level_filters::LevelFilter;
use tracing::{debug, error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use kafka_consumer_host::health::HealthRegistry;
use kafka_consumer_host::kafka::CachingProcessorProvider;
use kafka_consumer_host::{
    server, Config, ConsumerHostService, JsonDecoder, ServiceOutcome, StreamProcessor,
    SuffixStreamFilter,
};

fn setup_tracing() {
    let log_layer = tracing_subscriber::fmt::layer().with_filter(
        EnvFilter::builder()
            .with_default_directive(LevelFilter::INFO.into())
            .from_env_lossy()
            .add_directive("rdkafka=warn".parse().unwrap()),
    );
    tracing_subscriber::registry().with(log_layer).init();
}

/// Default deployment: counts decoded events and logs batch sizes. Real
/// deployments bring their own decoder and processor pair through the
/// library API.
struct LogSinkProcessor {
    events_seen: AtomicU64,
}

#[async_trait]
impl StreamProcessor<Value> for LogSinkProcessor {
    async fn process(&self, batch: Vec<Value>, _cancel: &CancellationToken) -> Result<()> {
        let total = self
            .events_seen
            .fetch_add(batch.len() as u64, Ordering::Relaxed)
            + batch.len() as u64;
        debug!(batch_size = batch.len(), events_seen = total, "processed batch");
        Ok(())
    }
}

async fn run() -> Result<ServiceOutcome> {
    let config = Config::init_with_defaults()
        .context("failed to load configuration from environment variables")?;

    info!(
        kafka_hosts = %config.kafka_hosts,
        group = %config.consumer_group(),
        suffix = %config.stream_suffix,
        "configuration loaded"
    );

    let liveness = HealthRegistry::new("liveness");

    // Liveness and metrics server
    let router = server::router(liveness.clone());
    let bind = config.bind_address();
    tokio::task::spawn(async move {
        server::serve(router, &bind)
            .await
            .expect("failed to start serving metrics");
    });
    info!("started liveness and metrics server on {}", config.bind_address());

    let processor_options = config.processor_env();
    let provider = CachingProcessorProvider::new(
        |stream: &str| stream.to_string(),
        move |stream: &str| {
            info!(
                stream = %stream,
                options = processor_options.len(),
                "creating log sink processor"
            );
            Ok(Arc::new(LogSinkProcessor {
                events_seen: AtomicU64::new(0),
            }) as Arc<dyn StreamProcessor<Value>>)
        },
    );

    let service = ConsumerHostService::new(
        config.clone(),
        liveness,
        Arc::new(SuffixStreamFilter::new(config.stream_suffix.clone())),
        Arc::new(provider),
        Arc::new(JsonDecoder::<Value>::default()),
    )?;

    service.run().await
}

#[tokio::main]
async fn main() {
    setup_tracing();
    info!("starting consumer group host service");

    match run().await {
        Ok(ServiceOutcome::CleanShutdown) => {
            info!("consumer group host shut down");
        }
        Ok(ServiceOutcome::BackgroundFailure) => {
            error!("exiting after unhandled background failure");
            std::process::exit(1);
        }
        Err(e) => {
            error!("consumer group host failed to start: {e:#}");
            std::process::exit(3);
        }
    }
}
