// Consumer group host - dispatches dynamically discovered streams to
// per-stream processors and keeps their assignments in step with the broker.
pub mod assignment;
pub mod codec;
pub mod config;
pub mod consumer;
pub mod context;
pub mod filter;
pub mod processor;
pub mod processor_host;
pub mod types;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

// Public API - what deployments of the host should use
pub use codec::{DecodeError, JsonDecoder, PayloadDecoder};
pub use config::ConsumerConfigBuilder;
pub use consumer::{ConsumerGroupHost, HostConfig};
pub use filter::{StreamFilter, SuffixStreamFilter};
pub use processor::{CachingProcessorProvider, ProcessorProvider, StreamProcessor};
pub use processor_host::ProcessorHost;
pub use types::{Record, StreamPartition, StreamPartitionOffset};

/// Process-wide stop machinery, shared by the supervisor, the poll thread
/// and every worker.
///
/// `shutdown` requests a graceful stop: the poll loop exits, seals every
/// queue and joins the workers as they drain. `cancel` is the hard abort
/// handed into each `process` call; firing it means "abandon in-flight work
/// and exit". `fatal` marks an unhandled background failure so the
/// supervisor can exit non-zero after the drain.
#[derive(Clone)]
pub struct ShutdownSignals {
    shutdown: CancellationToken,
    cancel: CancellationToken,
    fatal: Arc<AtomicBool>,
}

impl ShutdownSignals {
    pub fn new() -> Self {
        Self {
            shutdown: CancellationToken::new(),
            cancel: CancellationToken::new(),
            fatal: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn shutdown(&self) -> &CancellationToken {
        &self.shutdown
    }

    pub fn cancel(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Request a graceful stop.
    pub fn request_shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Abort in-flight work everywhere. Also implies shutdown.
    pub fn request_cancel(&self) {
        self.cancel.cancel();
        self.shutdown.cancel();
    }

    /// Record an unhandled background failure and stop the process.
    pub fn trigger_fatal(&self) {
        self.fatal.store(true, Ordering::SeqCst);
        self.shutdown.cancel();
    }

    pub fn is_fatal(&self) -> bool {
        self.fatal.load(Ordering::SeqCst)
    }
}

impl Default for ShutdownSignals {
    fn default() -> Self {
        Self::new()
    }
}
