// ==== Fetching ====
/// Counter for records handed out by the fetcher
pub const RECORDS_FETCHED: &str = "activity_consumer_records_fetched_total";

/// Histogram for the number of records per non-empty fetch
pub const FETCH_BATCH_SIZE: &str = "activity_consumer_fetch_batch_size";

/// Counter for fetches that timed out without records
pub const FETCH_EMPTY: &str = "activity_consumer_fetch_empty_total";

/// Counter for fetches failing because the broker is unreachable
pub const FETCH_BROKER_UNAVAILABLE: &str = "activity_consumer_fetch_broker_unavailable_total";

/// Counter for broker messages dropped by the router (partition not owned)
pub const ROUTER_UNOWNED_DROPPED: &str = "activity_consumer_router_unowned_dropped_total";

/// Counter for librdkafka errors seen by the consumer pump, labelled by level
pub const KAFKA_CONSUMER_ERROR: &str = "activity_consumer_kafka_error_total";

// ==== Dispatching ====
/// Counter for terminal outcomes, labelled by outcome
pub const RECORDS_DISPATCHED: &str = "activity_consumer_records_dispatched_total";

/// Counter for every callback invocation, retries included
pub const CALLBACK_ATTEMPTS: &str = "activity_consumer_callback_attempts_total";

/// Counter for records skipped after exhausting their attempts
pub const POISON_RECORDS: &str = "activity_consumer_poison_records_total";

/// Counter for records the broker delivered twice or out of order
pub const DUPLICATE_RECORDS_DROPPED: &str = "activity_consumer_duplicate_records_dropped_total";

/// Histogram for callback duration in seconds
pub const CALLBACK_DURATION: &str = "activity_consumer_callback_duration_seconds";

// ==== Offsets ====
/// Counter for checkpoint commits, labelled by status
pub const OFFSET_COMMITS: &str = "activity_consumer_offset_commits_total";

/// Gauge for the last committed offset per partition
pub const PARTITION_LAST_COMMITTED_OFFSET: &str = "activity_consumer_partition_last_committed_offset";

// ==== Group membership ====
/// Counter for rebalance events, labelled by event type
pub const REBALANCE_EVENTS: &str = "activity_consumer_rebalance_events_total";

/// Gauge for the number of partitions currently owned
pub const ASSIGNED_PARTITIONS: &str = "activity_consumer_assigned_partitions";

/// Counter for worker state transitions, labelled by the new state
pub const WORKER_STATE_TRANSITIONS: &str = "activity_consumer_state_transitions_total";
