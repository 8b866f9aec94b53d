use std::collections::HashMap;
use std::time::Duration;

use anyhow::Result;
use envconfig::Envconfig;

/// Environment variables starting with this prefix are collected into a string
/// map and handed to the processor provider untouched.
pub const PROCESSOR_ENV_PREFIX: &str = "PROCESSOR_";

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    // Kafka configuration
    #[envconfig(default = "localhost:9092")]
    pub kafka_hosts: String,

    /// Consumer group id; defaults to `<app>@<hostname>` when unset
    pub kafka_consumer_group: Option<String>,

    // supplied by k8s deploy env, used for the consumer group default
    // and as kafka client ID for sticky partition mappings
    #[envconfig(from = "HOSTNAME")]
    pub pod_hostname: Option<String>,

    #[envconfig(default = "earliest")]
    pub kafka_consumer_offset_reset: String,

    #[envconfig(default = "false")]
    pub kafka_tls: bool,

    #[envconfig(default = "10000")]
    pub kafka_statistics_interval_ms: u32,

    #[envconfig(default = "false")]
    pub kafka_partition_eof: bool,

    // Stream discovery
    /// Discovered topics must end in this suffix to be owned by this host
    #[envconfig(default = "-events")]
    pub stream_suffix: String,

    #[envconfig(default = "60")]
    pub update_subscription_interval_secs: u64,

    #[envconfig(default = "10")]
    pub metadata_timeout_secs: u64,

    // Poll loop and processor hosts
    #[envconfig(default = "100")]
    pub polling_interval_ms: u64,

    #[envconfig(default = "100")]
    pub max_batch_size: usize,

    #[envconfig(default = "1000")]
    pub max_processor_queue_size: usize,

    #[envconfig(default = "30")]
    pub shutdown_timeout_secs: u64,

    // HTTP server configuration
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "8000")]
    pub port: u16,
}

impl Config {
    /// Initialize from environment variables (for production and tests)
    pub fn init_with_defaults() -> Result<Self, envconfig::Error> {
        Config::init_from_env()
    }

    /// Validate configuration settings
    pub fn validate(&self) -> Result<()> {
        if self.polling_interval_ms == 0 {
            return Err(anyhow::anyhow!("POLLING_INTERVAL_MS must be positive"));
        }
        if self.max_batch_size == 0 {
            return Err(anyhow::anyhow!("MAX_BATCH_SIZE must be positive"));
        }
        if self.max_processor_queue_size == 0 {
            return Err(anyhow::anyhow!(
                "MAX_PROCESSOR_QUEUE_SIZE must be positive"
            ));
        }
        if self.stream_suffix.is_empty() {
            return Err(anyhow::anyhow!("STREAM_SUFFIX must not be empty"));
        }
        Ok(())
    }

    /// Effective consumer group id; `<app>@<hostname>` when not configured
    pub fn consumer_group(&self) -> String {
        match &self.kafka_consumer_group {
            Some(group) => group.clone(),
            None => {
                let hostname = self.pod_hostname.as_deref().unwrap_or("localhost");
                format!("{}@{}", env!("CARGO_PKG_NAME"), hostname)
            }
        }
    }

    /// Get server bind address
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Get polling interval as Duration
    pub fn polling_interval(&self) -> Duration {
        Duration::from_millis(self.polling_interval_ms)
    }

    /// Get subscription refresh interval as Duration
    pub fn update_subscription_interval(&self) -> Duration {
        Duration::from_secs(self.update_subscription_interval_secs)
    }

    /// Get metadata fetch timeout as Duration
    pub fn metadata_timeout(&self) -> Duration {
        Duration::from_secs(self.metadata_timeout_secs)
    }

    /// Get graceful shutdown timeout as Duration
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    /// Collect `PROCESSOR_*` environment variables into a map for the
    /// processor provider. Keys are stripped of the prefix and lowercased.
    pub fn processor_env(&self) -> HashMap<String, String> {
        Self::processor_env_from(std::env::vars())
    }

    fn processor_env_from(
        vars: impl Iterator<Item = (String, String)>,
    ) -> HashMap<String, String> {
        vars.filter_map(|(key, value)| {
            key.strip_prefix(PROCESSOR_ENV_PREFIX)
                .map(|stripped| (stripped.to_lowercase(), value))
        })
        .collect()
    }
}
