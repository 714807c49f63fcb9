use async_trait::async_trait;
use thiserror::Error;

use crate::message::Record;

/// A record the sink refused, identified by its position in the written batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordFailure {
    pub index: usize,
    pub error: String,
}

impl RecordFailure {
    pub fn new(index: usize, error: impl Into<String>) -> Self {
        Self {
            index,
            error: error.into(),
        }
    }
}

/// Outcome of a batch write the sink accepted at least in part.
/// Records not listed as failures are committed.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct WriteReport {
    failures: Vec<RecordFailure>,
}

impl WriteReport {
    pub fn committed() -> Self {
        Self::default()
    }

    pub fn with_failures(failures: Vec<RecordFailure>) -> Self {
        Self { failures }
    }

    pub fn failures(&self) -> &[RecordFailure] {
        &self.failures
    }

    pub fn into_failures(self) -> Vec<RecordFailure> {
        self.failures
    }

    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// A whole-batch failure: nothing in the batch was committed.
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("invalid table name: {0}")]
    InvalidTable(String),
    #[error("sink unavailable: {0}")]
    Unavailable(String),
}

/// Durable destination for validated batches.
#[async_trait]
pub trait BatchSink<T: Send + Sync>: Send + Sync {
    /// Persist `records` in order. `Err` means the whole batch failed, a report
    /// with failures means only those records failed.
    async fn write_batch(&self, records: &[Record<T>]) -> Result<WriteReport, SinkError>;
}
