pub const RECORDS_RECEIVED: &str = "batch_consumer_records_received_total";
pub const RECORDS_REJECTED: &str = "batch_consumer_records_rejected_total";
pub const RECORDS_COMMITTED: &str = "batch_consumer_records_committed_total";
pub const RECORDS_FAILED: &str = "batch_consumer_records_failed_total";

pub const BATCHES_FLUSHED: &str = "batch_consumer_batches_flushed_total";
pub const BATCHES_FAILED: &str = "batch_consumer_batches_failed_total";
pub const BATCH_RECORDS: &str = "batch_consumer_batch_records";
pub const BATCH_BYTES: &str = "batch_consumer_batch_bytes";
pub const BATCH_WRITE_TIME: &str = "batch_consumer_batch_write_seconds";
pub const BUFFERED_RECORDS: &str = "batch_consumer_buffered_records";

pub const RETRY_FORWARDED: &str = "batch_consumer_retry_forwarded_total";
pub const RETRY_FORWARD_FAILED: &str = "batch_consumer_retry_forward_failed_total";
// Persist failures with no publisher configured, i.e. data loss
pub const RETRY_DROPPED: &str = "batch_consumer_retry_dropped_total";

pub const ACKS_RELEASED: &str = "batch_consumer_acks_released_total";
pub const ACKS_FAILED: &str = "batch_consumer_acks_failed_total";
pub const RECEIVE_ERRORS: &str = "batch_consumer_receive_errors_total";
pub const KAFKA_CONSUMER_ERRORS: &str = "batch_consumer_kafka_consumer_errors_total";
