// ==== Poll loop metrics ====
/// Counter for records pulled from the broker and handed to a processor host
pub const RECORDS_DISPATCHED: &str = "consumer_host_records_dispatched_total";

/// Counter for per-record consume errors reported by the broker (record dropped)
pub const CONSUME_ERRORS: &str = "consumer_host_consume_errors_total";

/// Histogram for time the poll thread spent blocked on a full processor queue (ms)
pub const ENQUEUE_BLOCKED_MS: &str = "consumer_host_enqueue_blocked_ms";

/// Counter for subscription refreshes, labelled by outcome (subscribed/empty/error)
pub const SUBSCRIPTION_REFRESHES: &str = "consumer_host_subscription_refreshes_total";

// ==== Rebalance metrics ====
/// Counter for assignment callbacks handled
pub const REBALANCE_ASSIGNMENTS: &str = "consumer_host_rebalance_assignments_total";

/// Counter for revocation callbacks handled
pub const REBALANCE_REVOCATIONS: &str = "consumer_host_rebalance_revocations_total";

/// Counter for per-partition timestamp offset lookups that failed (fell back to committed)
pub const OFFSET_LOOKUP_FAILURES: &str = "consumer_host_offset_lookup_failures_total";

/// Gauge for processor hosts currently alive
pub const ACTIVE_STREAM_WORKERS: &str = "consumer_host_active_stream_workers";

// ==== Worker metrics ====
/// Counter for batches handed to a processor
pub const BATCHES_PROCESSED: &str = "consumer_host_batches_processed_total";

/// Histogram for the number of records per processed batch
pub const BATCH_SIZE: &str = "consumer_host_batch_size";

/// Counter for records whose payload failed to decode (record skipped)
pub const DECODE_FAILURES: &str = "consumer_host_decode_failures_total";

/// Counter for fatal processor failures (worker exits, process escalates)
pub const PROCESSOR_FAILURES: &str = "consumer_host_processor_failures_total";

// ==== Broker event metrics ====
/// Counter for broker events forwarded to the log, labelled by kind
pub const BROKER_EVENTS: &str = "consumer_host_broker_events_total";
