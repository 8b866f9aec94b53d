use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

/// A domain-specific consumer of decoded events for a single stream.
///
/// `process` is called sequentially on the stream's worker; it may block,
/// and must watch the cancel token so a hard shutdown is not held up by
/// in-flight work.
#[async_trait]
pub trait StreamProcessor<T>: Send + Sync {
    /// Asked once per stream per rebalance, before the host accepts the
    /// assignment. Returning a wall time makes the host resume newly
    /// assigned partitions from the earliest offset at or after it;
    /// returning `None` resumes from the broker's stored commit.
    fn start_timestamp_on_rebalance(&self, _stream: &str) -> Option<DateTime<Utc>> {
        None
    }

    async fn process(&self, batch: Vec<T>, cancel: &CancellationToken) -> Result<()>;
}

/// Returns (or creates and caches) the processor for a stream. Called only
/// from the poll thread, never concurrently. Implementations may hand the
/// same processor instance to multiple streams; the host asks
/// `start_timestamp_on_rebalance` per stream, not per processor.
pub trait ProcessorProvider<T>: Send + Sync {
    fn get_processor(&self, stream: &str) -> Result<Arc<dyn StreamProcessor<T>>>;
}

/// Provider that caches processors under a derived key, so several streams
/// (for example the traces and errors topics of one project/env) can share
/// one processor instance.
pub struct CachingProcessorProvider<T> {
    key_fn: Box<dyn Fn(&str) -> String + Send + Sync>,
    factory: Box<dyn Fn(&str) -> Result<Arc<dyn StreamProcessor<T>>> + Send + Sync>,
    cache: Mutex<HashMap<String, Arc<dyn StreamProcessor<T>>>>,
}

impl<T> CachingProcessorProvider<T> {
    pub fn new(
        key_fn: impl Fn(&str) -> String + Send + Sync + 'static,
        factory: impl Fn(&str) -> Result<Arc<dyn StreamProcessor<T>>> + Send + Sync + 'static,
    ) -> Self {
        Self {
            key_fn: Box::new(key_fn),
            factory: Box::new(factory),
            cache: Mutex::new(HashMap::new()),
        }
    }
}

impl<T> ProcessorProvider<T> for CachingProcessorProvider<T> {
    fn get_processor(&self, stream: &str) -> Result<Arc<dyn StreamProcessor<T>>> {
        let key = (self.key_fn)(stream);
        let mut cache = self.cache.lock().expect("processor cache poisoned");
        if let Some(processor) = cache.get(&key) {
            return Ok(processor.clone());
        }
        let processor = (self.factory)(stream)?;
        cache.insert(key, processor.clone());
        Ok(processor)
    }
}
