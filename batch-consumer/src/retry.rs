use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use rdkafka::error::KafkaError;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use crate::ack::{Acknowledger, Settlement};
use crate::message::Record;
use crate::metrics_consts::{RETRY_DROPPED, RETRY_FORWARDED, RETRY_FORWARD_FAILED};

/// Attribute carrying the error that sent a record to the retry path.
pub const RETRY_ERROR_ATTRIBUTE: &str = "retry_error";

/// A re-serialized record on its way back to a queue.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub payload: Bytes,
    pub attributes: HashMap<String, String>,
}

#[derive(Error, Debug)]
pub enum PublishError {
    #[error("failed to produce to kafka: {0}")]
    Kafka(#[from] KafkaError),
    #[error("failed to produce to kafka (timeout)")]
    Canceled,
    #[error("publisher is closed")]
    Closed,
}

/// Transport used to re-emit records that failed to persist.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, message: &OutboundMessage) -> Result<(), PublishError>;
}

/// A record that failed to persist, with its reprocessing attempt.
#[derive(Debug)]
pub struct RetryEnvelope<T> {
    pub record: Record<T>,
    pub attempt: u32,
    pub last_error: String,
}

impl<T> RetryEnvelope<T> {
    /// The attempt is one more than the count found under `attempt_attribute`,
    /// so a record that was never retried starts at 1.
    pub fn new(record: Record<T>, last_error: impl Into<String>, attempt_attribute: &str) -> Self {
        let previous = record
            .message
            .attribute(attempt_attribute)
            .and_then(|raw| raw.trim().parse::<u32>().ok())
            .unwrap_or(0);

        Self {
            record,
            attempt: previous.saturating_add(1),
            last_error: last_error.into(),
        }
    }
}

impl<T: Serialize> RetryEnvelope<T> {
    pub fn to_outbound(
        &self,
        attempt_attribute: &str,
    ) -> Result<OutboundMessage, serde_json::Error> {
        let payload = serde_json::to_vec(&self.record.value)?;

        let mut attributes = self.record.message.attributes().clone();
        attributes.insert(attempt_attribute.to_owned(), self.attempt.to_string());
        attributes.insert(RETRY_ERROR_ATTRIBUTE.to_owned(), self.last_error.clone());

        Ok(OutboundMessage {
            payload: Bytes::from(payload),
            attributes,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    Forwarded { attempt: u32 },
    /// No publisher configured, the record is logged and dropped.
    Dropped,
    /// The publisher could not take the record. It is not retried again.
    ForwardFailed,
}

#[derive(Clone)]
struct Forwarder {
    publisher: Option<Arc<dyn Publisher>>,
    attempt_attribute: Arc<str>,
    acknowledger: Arc<dyn Acknowledger>,
}

impl Forwarder {
    async fn forward<T: Serialize>(&self, envelope: RetryEnvelope<T>) -> RetryOutcome {
        let record_id = envelope.record.id;
        let attempt = envelope.attempt;

        let outcome = match &self.publisher {
            None => {
                error!(
                    record_id,
                    attempt,
                    attributes = ?envelope.record.message.attributes(),
                    error = %envelope.last_error,
                    "no retry publisher configured, dropping record"
                );
                metrics::counter!(RETRY_DROPPED).increment(1);
                RetryOutcome::Dropped
            }
            Some(publisher) => match envelope.to_outbound(&self.attempt_attribute) {
                Err(error) => {
                    error!(
                        record_id,
                        attempt,
                        %error,
                        "failed to serialize record for retry, dropping record"
                    );
                    metrics::counter!(RETRY_FORWARD_FAILED).increment(1);
                    RetryOutcome::ForwardFailed
                }
                Ok(outbound) => match publisher.publish(&outbound).await {
                    Ok(()) => {
                        info!(record_id, attempt, "forwarded record for retry");
                        metrics::counter!(RETRY_FORWARDED).increment(1);
                        RetryOutcome::Forwarded { attempt }
                    }
                    Err(error) => {
                        error!(
                            record_id,
                            attempt,
                            attributes = ?outbound.attributes,
                            %error,
                            "failed to forward record for retry, dropping record"
                        );
                        metrics::counter!(RETRY_FORWARD_FAILED).increment(1);
                        RetryOutcome::ForwardFailed
                    }
                },
            },
        };

        let settlement = match outcome {
            RetryOutcome::Forwarded { .. } => Settlement::Forwarded,
            RetryOutcome::Dropped | RetryOutcome::ForwardFailed => Settlement::Dropped,
        };
        self.acknowledger.settle(record_id, settlement);

        outcome
    }
}

/// Forwards records that failed to persist to the publisher, one at a time.
///
/// Forwarding happens at most once per failure: a record the publisher can't
/// take is logged and dropped, the retry queue owns any further policy.
pub struct RetryCoordinator {
    forwarder: Forwarder,
    permits: Arc<Semaphore>,
    tasks: TaskTracker,
}

impl RetryCoordinator {
    pub fn new(
        publisher: Option<Arc<dyn Publisher>>,
        concurrency: usize,
        attempt_attribute: &str,
        acknowledger: Arc<dyn Acknowledger>,
    ) -> Self {
        Self {
            forwarder: Forwarder {
                publisher,
                attempt_attribute: Arc::from(attempt_attribute),
                acknowledger,
            },
            permits: Arc::new(Semaphore::new(concurrency)),
            tasks: TaskTracker::new(),
        }
    }

    pub fn has_publisher(&self) -> bool {
        self.forwarder.publisher.is_some()
    }

    pub fn envelope<T>(
        &self,
        record: Record<T>,
        last_error: impl Into<String>,
    ) -> RetryEnvelope<T> {
        RetryEnvelope::new(record, last_error, &self.forwarder.attempt_attribute)
    }

    /// Forward one record and wait for the outcome.
    pub async fn retry<T: Serialize>(&self, envelope: RetryEnvelope<T>) -> RetryOutcome {
        self.forwarder.forward(envelope).await
    }

    /// Forward one record in the background. Only waits for a free slot in the pool.
    pub async fn dispatch<T>(&self, envelope: RetryEnvelope<T>)
    where
        T: Serialize + Send + Sync + 'static,
    {
        let permit = match self.permits.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                warn!("retry pool is closed, forwarding inline");
                self.forwarder.forward(envelope).await;
                return;
            }
        };

        let forwarder = self.forwarder.clone();
        self.tasks.spawn(async move {
            forwarder.forward(envelope).await;
            drop(permit);
        });
    }

    /// Forwards still running.
    pub fn in_flight(&self) -> usize {
        self.tasks.len()
    }

    /// Wait for every dispatched forward to finish.
    pub async fn close(&self) {
        self.tasks.close();
        self.tasks.wait().await;
    }
}
