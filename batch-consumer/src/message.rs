use std::collections::HashMap;

use bytes::Bytes;
use chrono::{DateTime, Utc};

/// Sequence number assigned to a delivery when it enters the pipeline.
/// Monotonic per process, used to settle acknowledgements and to identify
/// records in logs.
pub type RecordId = u64;

/// A raw message as handed over by a receiver. Immutable once received.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    payload: Bytes,
    attributes: HashMap<String, String>,
    received_at: DateTime<Utc>,
}

impl Message {
    pub fn new(payload: impl Into<Bytes>, attributes: HashMap<String, String>) -> Self {
        Self::with_timestamp(payload, attributes, Utc::now())
    }

    pub fn with_timestamp(
        payload: impl Into<Bytes>,
        attributes: HashMap<String, String>,
        received_at: DateTime<Utc>,
    ) -> Self {
        Self {
            payload: payload.into(),
            attributes,
            received_at,
        }
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn attributes(&self) -> &HashMap<String, String> {
        &self.attributes
    }

    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }

    pub fn received_at(&self) -> DateTime<Utc> {
        self.received_at
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// A message decoded into the deployment's record type.
#[derive(Debug, Clone)]
pub struct Record<T> {
    pub id: RecordId,
    pub message: Message,
    pub value: T,
}

impl<T> Record<T> {
    pub fn new(id: RecordId, message: Message, value: T) -> Self {
        Self { id, message, value }
    }
}
