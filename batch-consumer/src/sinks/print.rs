use std::fmt::Debug;
use std::marker::PhantomData;

use async_trait::async_trait;

use crate::message::Record;
use crate::sink::{BatchSink, SinkError, WriteReport};

/// Logs batches instead of persisting them.
pub struct PrintSink<T> {
    _records: PhantomData<fn(&T)>,
}

impl<T> Default for PrintSink<T> {
    fn default() -> Self {
        Self {
            _records: PhantomData,
        }
    }
}

#[async_trait]
impl<T: Debug + Send + Sync> BatchSink<T> for PrintSink<T> {
    async fn write_batch(&self, records: &[Record<T>]) -> Result<WriteReport, SinkError> {
        let span = tracing::span!(tracing::Level::INFO, "batch of records");
        let _enter = span.enter();

        for record in records {
            tracing::info!("record {}: {:?}", record.id, record.value);
        }

        Ok(WriteReport::committed())
    }
}
