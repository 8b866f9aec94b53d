pub mod config;
pub mod health;
pub mod kafka;
pub mod metrics_consts;
pub mod server;
pub mod service;

// Re-export commonly used types for convenience
pub use config::Config;
pub use kafka::{
    ConsumerGroupHost, JsonDecoder, PayloadDecoder, ProcessorProvider, Record, StreamFilter,
    StreamProcessor, SuffixStreamFilter,
};
pub use service::{ConsumerHostService, ServiceOutcome};
