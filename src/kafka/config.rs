use rdkafka::ClientConfig;

/// Consumer configuration builder with the host's defaults.
pub struct ConsumerConfigBuilder {
    config: ClientConfig,
}

impl ConsumerConfigBuilder {
    pub fn new(bootstrap_servers: &str, group_id: &str) -> Self {
        let mut config = ClientConfig::new();

        // Required settings
        config
            .set("bootstrap.servers", bootstrap_servers)
            .set("group.id", group_id);

        // Host defaults. Offsets are auto-committed: the broker's stored
        // commit is the only persistent state, and delivery is
        // at-least-once.
        config
            .set("enable.auto.commit", "true")
            .set("enable.auto.offset.store", "true")
            .set("statistics.interval.ms", "10000")
            .set("socket.timeout.ms", "10000")
            .set("session.timeout.ms", "30000")
            .set("heartbeat.interval.ms", "5000")
            .set("max.poll.interval.ms", "300000");

        Self { config }
    }

    /// Override offset reset policy
    pub fn with_offset_reset(mut self, policy: &str) -> Self {
        self.config.set("auto.offset.reset", policy);
        self
    }

    /// Enable TLS/SSL for the broker connection
    pub fn with_tls(mut self, enabled: bool) -> Self {
        if enabled {
            self.config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        }
        self
    }

    /// Override the statistics emission interval
    pub fn with_statistics_interval_ms(mut self, ms: u32) -> Self {
        self.config.set("statistics.interval.ms", ms.to_string());
        self
    }

    /// Surface end-of-partition events from the broker
    pub fn with_partition_eof(mut self, enabled: bool) -> Self {
        self.config
            .set("enable.partition.eof", if enabled { "true" } else { "false" });
        self
    }

    /// Pin the kafka client ID and enable static group membership, for
    /// sticky partition mappings across pod restarts.
    pub fn with_client_id(mut self, client_id: Option<&str>) -> Self {
        if let Some(client_id) = client_id {
            self.config.set("client.id", client_id);
            self.config.set("group.instance.id", client_id);
        }
        self
    }

    /// Add any custom configuration
    pub fn set(mut self, key: &str, value: &str) -> Self {
        self.config.set(key, value);
        self
    }

    /// Build the final configuration
    pub fn build(self) -> ClientConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ConsumerConfigBuilder::new("broker:9092", "group").build();
        assert_eq!(config.get("bootstrap.servers"), Some("broker:9092"));
        assert_eq!(config.get("group.id"), Some("group"));
        assert_eq!(config.get("enable.auto.commit"), Some("true"));
        assert_eq!(config.get("security.protocol"), None);
    }

    #[test]
    fn test_tls_and_overrides() {
        let config = ConsumerConfigBuilder::new("broker:9092", "group")
            .with_tls(true)
            .with_offset_reset("latest")
            .with_partition_eof(true)
            .with_client_id(Some("pod-3"))
            .build();
        assert_eq!(config.get("security.protocol"), Some("ssl"));
        assert_eq!(config.get("auto.offset.reset"), Some("latest"));
        assert_eq!(config.get("enable.partition.eof"), Some("true"));
        assert_eq!(config.get("group.instance.id"), Some("pod-3"));
    }
}
