//! Processor host - owns one stream: a bounded record queue plus one worker
//! that batches records, decodes them and invokes the domain processor.
//!
//! The queue has exactly one producer (the poll thread) and one consumer
//! (the worker), which is what preserves per-partition offset order. A full
//! queue blocks the poll thread; that is the backpressure mechanism.

use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::kafka::codec::PayloadDecoder;
use crate::kafka::processor::StreamProcessor;
use crate::kafka::types::Record;
use crate::kafka::ShutdownSignals;
use crate::metrics_consts::{
    ACTIVE_STREAM_WORKERS, BATCHES_PROCESSED, BATCH_SIZE, DECODE_FAILURES, ENQUEUE_BLOCKED_MS,
    PROCESSOR_FAILURES,
};

#[derive(Debug, Error)]
pub enum ProcessorHostError {
    #[error("worker for stream '{0}' already started")]
    AlreadyStarted(String),
    #[error("queue for stream '{0}' is sealed")]
    Sealed(String),
    #[error("worker for stream '{0}' is gone")]
    WorkerGone(String),
}

enum WorkerExit {
    Drained,
    Cancelled,
    Failed,
}

struct WorkerSeed<T> {
    receiver: mpsc::Receiver<Record>,
    decoder: Arc<dyn PayloadDecoder<T>>,
    processor: Arc<dyn StreamProcessor<T>>,
    signals: ShutdownSignals,
    max_batch_size: usize,
}

pub struct ProcessorHost<T: Send + 'static> {
    stream: String,
    sender: Option<mpsc::Sender<Record>>,
    handle: Option<JoinHandle<()>>,
    rt: Handle,
    seed: Option<WorkerSeed<T>>,
}

impl<T: Send + 'static> ProcessorHost<T> {
    /// Create a host for one stream. The worker does not run until
    /// `start()` is called.
    ///
    /// The runtime handle is taken explicitly because hosts are created
    /// inside broker callbacks on the poll thread, which has no ambient
    /// runtime.
    pub fn new(
        stream: String,
        decoder: Arc<dyn PayloadDecoder<T>>,
        processor: Arc<dyn StreamProcessor<T>>,
        signals: ShutdownSignals,
        max_batch_size: usize,
        max_queue_size: usize,
        rt: Handle,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(max_queue_size);
        Self {
            stream,
            sender: Some(sender),
            handle: None,
            rt,
            seed: Some(WorkerSeed {
                receiver,
                decoder,
                processor,
                signals,
                max_batch_size,
            }),
        }
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }

    /// Spawn the worker. Fails if called twice.
    pub fn start(&mut self) -> Result<(), ProcessorHostError> {
        let seed = self
            .seed
            .take()
            .ok_or_else(|| ProcessorHostError::AlreadyStarted(self.stream.clone()))?;
        let stream = self.stream.clone();
        self.handle = Some(self.rt.spawn(run_worker(stream, seed)));
        Ok(())
    }

    /// Queue one record for the worker. Blocks the calling thread while the
    /// queue is full; unblocks as soon as the worker dequeues.
    pub fn enqueue_blocking(&self, record: Record) -> Result<(), ProcessorHostError> {
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| ProcessorHostError::Sealed(self.stream.clone()))?;

        let start = Instant::now();
        sender
            .blocking_send(record)
            .map_err(|_| ProcessorHostError::WorkerGone(self.stream.clone()))?;
        metrics::histogram!(ENQUEUE_BLOCKED_MS).record(start.elapsed().as_millis() as f64);
        Ok(())
    }

    /// Seal the queue; no further enqueues are accepted and the worker
    /// exits once it has drained what is already queued.
    pub fn complete_adding(&mut self) {
        self.sender.take();
    }

    /// Wait for the worker to exit, from a non-async thread. The queue must
    /// be sealed (or the cancel token fired) first, or this waits forever.
    pub fn join_blocking(&mut self) {
        if let Some(handle) = self.handle.take() {
            let stream = self.stream.clone();
            let rt = self.rt.clone();
            if let Err(e) = rt.block_on(handle) {
                warn!(stream = %stream, "stream worker panicked during join: {e}");
            }
        }
    }

    /// Async variant of `join_blocking`, for supervisor-side shutdown.
    pub async fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                warn!(stream = %self.stream, "stream worker panicked during join: {e}");
            }
        }
    }
}

async fn run_worker<T: Send + 'static>(stream: String, seed: WorkerSeed<T>) {
    info!(stream = %stream, "starting stream worker");
    metrics::gauge!(ACTIVE_STREAM_WORKERS).increment(1.0);

    let exit = worker_loop(&stream, seed).await;
    metrics::gauge!(ACTIVE_STREAM_WORKERS).decrement(1.0);

    match exit {
        WorkerExit::Drained => info!(stream = %stream, "stream worker drained and exiting"),
        WorkerExit::Cancelled => {
            info!(stream = %stream, "stream worker cancelled, discarding in-flight work")
        }
        WorkerExit::Failed => error!(stream = %stream, "stream worker exiting after fatal processor failure"),
    }
}

async fn worker_loop<T: Send + 'static>(stream: &str, mut seed: WorkerSeed<T>) -> WorkerExit {
    let cancel = seed.signals.cancel().clone();

    loop {
        // Block for at least one record; a closed, empty queue means the
        // host sealed it and the final batch has already been flushed.
        let first = tokio::select! {
            _ = cancel.cancelled() => return WorkerExit::Cancelled,
            record = seed.receiver.recv() => match record {
                Some(record) => record,
                None => return WorkerExit::Drained,
            },
        };

        let mut records = vec![first];
        while records.len() < seed.max_batch_size {
            match seed.receiver.try_recv() {
                Ok(record) => records.push(record),
                Err(_) => break,
            }
        }

        let first_offset = records.first().map(|r| r.offset);
        let last_offset = records.last().map(|r| r.offset);

        let mut batch = Vec::with_capacity(records.len());
        for record in &records {
            match seed.decoder.decode(record) {
                Ok(event) => batch.push(event),
                Err(e) => {
                    warn!(
                        stream = %stream,
                        partition = record.partition,
                        offset = record.offset,
                        "skipping undecodable record: {e}"
                    );
                    metrics::counter!(DECODE_FAILURES).increment(1);
                }
            }
        }

        if batch.is_empty() {
            continue;
        }

        debug!(
            stream = %stream,
            batch_size = batch.len(),
            first_offset = ?first_offset,
            last_offset = ?last_offset,
            "processing batch"
        );
        metrics::histogram!(BATCH_SIZE).record(batch.len() as f64);

        let result = tokio::select! {
            _ = cancel.cancelled() => return WorkerExit::Cancelled,
            result = seed.processor.process(batch, &cancel) => result,
        };

        match result {
            Ok(()) => {
                metrics::counter!(BATCHES_PROCESSED).increment(1);
            }
            Err(e) => {
                error!(
                    stream = %stream,
                    first_offset = ?first_offset,
                    last_offset = ?last_offset,
                    error = %e,
                    error_chain = ?e,
                    "processor failed, escalating to process shutdown"
                );
                metrics::counter!(PROCESSOR_FAILURES).increment(1);
                seed.signals.trigger_fatal();
                return WorkerExit::Failed;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::time::sleep;
    use tokio_util::sync::CancellationToken;

    /// Decoder that surfaces the record coordinates, so tests can assert on
    /// delivery order without a real payload format.
    struct CoordinateDecoder;

    impl PayloadDecoder<(i32, i64)> for CoordinateDecoder {
        fn decode(&self, record: &Record) -> Result<(i32, i64), crate::kafka::DecodeError> {
            Ok((record.partition, record.offset))
        }
    }

    struct RecordingProcessor {
        seen: Mutex<Vec<(i32, i64)>>,
        delay_per_record: Duration,
    }

    impl RecordingProcessor {
        fn new(delay_per_record: Duration) -> Self {
            Self {
                seen: Mutex::new(Vec::new()),
                delay_per_record,
            }
        }
    }

    #[async_trait]
    impl StreamProcessor<(i32, i64)> for RecordingProcessor {
        async fn process(
            &self,
            batch: Vec<(i32, i64)>,
            _cancel: &CancellationToken,
        ) -> Result<()> {
            for coords in batch {
                if !self.delay_per_record.is_zero() {
                    sleep(self.delay_per_record).await;
                }
                self.seen.lock().unwrap().push(coords);
            }
            Ok(())
        }
    }

    struct FailingProcessor;

    #[async_trait]
    impl StreamProcessor<(i32, i64)> for FailingProcessor {
        async fn process(
            &self,
            _batch: Vec<(i32, i64)>,
            _cancel: &CancellationToken,
        ) -> Result<()> {
            Err(anyhow::anyhow!("sink unavailable"))
        }
    }

    struct CountingProcessor {
        batches: AtomicUsize,
        records: AtomicUsize,
    }

    #[async_trait]
    impl StreamProcessor<(i32, i64)> for CountingProcessor {
        async fn process(
            &self,
            batch: Vec<(i32, i64)>,
            _cancel: &CancellationToken,
        ) -> Result<()> {
            self.batches.fetch_add(1, Ordering::SeqCst);
            self.records.fetch_add(batch.len(), Ordering::SeqCst);
            Ok(())
        }
    }

    fn make_host(
        processor: Arc<dyn StreamProcessor<(i32, i64)>>,
        signals: ShutdownSignals,
        max_batch_size: usize,
        max_queue_size: usize,
    ) -> ProcessorHost<(i32, i64)> {
        ProcessorHost::new(
            "traces-events".to_string(),
            Arc::new(CoordinateDecoder),
            processor,
            signals,
            max_batch_size,
            max_queue_size,
            Handle::current(),
        )
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_start_twice_fails() {
        let processor = Arc::new(RecordingProcessor::new(Duration::ZERO));
        let mut host = make_host(processor, ShutdownSignals::new(), 10, 10);

        host.start().unwrap();
        assert!(matches!(
            host.start(),
            Err(ProcessorHostError::AlreadyStarted(_))
        ));

        host.complete_adding();
        host.join().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_drains_queue_on_seal() {
        let processor = Arc::new(CountingProcessor {
            batches: AtomicUsize::new(0),
            records: AtomicUsize::new(0),
        });
        let mut host = make_host(processor.clone(), ShutdownSignals::new(), 3, 20);
        host.start().unwrap();

        let sender_host = &host;
        tokio::task::block_in_place(|| {
            for offset in 0..10 {
                sender_host
                    .enqueue_blocking(Record::new_for_test("traces-events", 0, offset, b"x"))
                    .unwrap();
            }
        });

        host.complete_adding();
        host.join().await;

        // Every queued record was processed before the worker exited, in
        // batches bounded by the configured max
        assert_eq!(processor.records.load(Ordering::SeqCst), 10);
        assert!(processor.batches.load(Ordering::SeqCst) >= 4);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_enqueue_after_seal_rejected() {
        let processor = Arc::new(RecordingProcessor::new(Duration::ZERO));
        let mut host = make_host(processor, ShutdownSignals::new(), 10, 10);
        host.start().unwrap();
        host.complete_adding();

        let result = host.enqueue_blocking(Record::new_for_test("traces-events", 0, 0, b"x"));
        assert!(matches!(result, Err(ProcessorHostError::Sealed(_))));

        host.join().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_backpressure_blocks_producer_and_preserves_order() {
        // Queue of 4, worker takes ~10ms per record: a burst of 20 records
        // must block the producer and still come out in offset order.
        let processor = Arc::new(RecordingProcessor::new(Duration::from_millis(10)));
        let mut host = make_host(processor.clone(), ShutdownSignals::new(), 1, 4);
        host.start().unwrap();

        let start = Instant::now();
        tokio::task::block_in_place(|| {
            for offset in 0..20 {
                host.enqueue_blocking(Record::new_for_test("traces-events", 0, offset, b"x"))
                    .unwrap();
            }
        });
        // The producer cannot have finished before the worker consumed at
        // least 20 - 4 - 1 records, so the burst takes most of the total
        // processing time.
        assert!(start.elapsed() >= Duration::from_millis(100));

        host.complete_adding();
        host.join().await;

        let seen = processor.seen.lock().unwrap().clone();
        assert_eq!(seen.len(), 20);
        let offsets: Vec<i64> = seen.iter().map(|(_, o)| *o).collect();
        let mut sorted = offsets.clone();
        sorted.sort_unstable();
        assert_eq!(offsets, sorted);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancel_discards_in_flight() {
        let signals = ShutdownSignals::new();
        let processor = Arc::new(RecordingProcessor::new(Duration::from_millis(50)));
        let mut host = make_host(processor.clone(), signals.clone(), 1, 20);
        host.start().unwrap();

        tokio::task::block_in_place(|| {
            for offset in 0..10 {
                host.enqueue_blocking(Record::new_for_test("traces-events", 0, offset, b"x"))
                    .unwrap();
            }
        });

        signals.request_cancel();
        host.join().await;

        // Cancellation wins over draining: most of the queue was abandoned
        assert!(processor.seen.lock().unwrap().len() < 10);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_processor_failure_sets_fatal() {
        let signals = ShutdownSignals::new();
        let mut host = make_host(Arc::new(FailingProcessor), signals.clone(), 10, 10);
        host.start().unwrap();

        tokio::task::block_in_place(|| {
            host.enqueue_blocking(Record::new_for_test("traces-events", 0, 0, b"x"))
                .unwrap();
        });
        host.join().await;

        assert!(signals.is_fatal());
        assert!(signals.shutdown().is_cancelled());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_undecodable_records_skipped() {
        struct PickyDecoder;
        impl PayloadDecoder<(i32, i64)> for PickyDecoder {
            fn decode(&self, record: &Record) -> Result<(i32, i64), crate::kafka::DecodeError> {
                if record.payload.is_empty() {
                    Err(crate::kafka::DecodeError::Empty)
                } else {
                    Ok((record.partition, record.offset))
                }
            }
        }

        let processor = Arc::new(RecordingProcessor::new(Duration::ZERO));
        let mut host = ProcessorHost::new(
            "traces-events".to_string(),
            Arc::new(PickyDecoder),
            processor.clone(),
            ShutdownSignals::new(),
            10,
            10,
            Handle::current(),
        );
        host.start().unwrap();

        tokio::task::block_in_place(|| {
            host.enqueue_blocking(Record::new_for_test("traces-events", 0, 0, b"ok"))
                .unwrap();
            host.enqueue_blocking(Record::new_for_test("traces-events", 0, 1, b""))
                .unwrap();
            host.enqueue_blocking(Record::new_for_test("traces-events", 0, 2, b"ok"))
                .unwrap();
        });
        host.complete_adding();
        host.join().await;

        let seen = processor.seen.lock().unwrap().clone();
        assert_eq!(seen, vec![(0, 0), (0, 2)]);
    }
}
