use std::sync::Arc;

use async_trait::async_trait;
use rdkafka::error::KafkaError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::ack::{AckLedger, Acknowledge};
use crate::message::{Message, Record};
use crate::metrics_consts::RECEIVE_ERRORS;
use crate::validator::FieldError;
use crate::worker::{BatchWorker, Handled};

#[derive(Error, Debug)]
pub enum ReceiveError {
    #[error("receiver is closed")]
    Closed,
    #[error("kafka error: {0}")]
    Kafka(#[from] KafkaError),
    #[error("transport error: {0}")]
    Transport(String),
}

/// A message along with the handle that acknowledges it to the receiver.
pub struct Delivery {
    pub message: Message,
    pub ack: Box<dyn Acknowledge>,
}

/// Source of messages, delivered one at a time.
#[async_trait]
pub trait Receiver: Send + Sync {
    /// Wait for the next message. An error is terminal for the subscription.
    async fn receive(&self) -> Result<Delivery, ReceiveError>;

    /// Commit whatever was acknowledged so far.
    async fn close(&self) -> Result<(), ReceiveError> {
        Ok(())
    }
}

/// Feeds deliveries from a receiver into a batch worker, decoding JSON payloads
/// into `T` and tracking each delivery's acknowledgement in the ledger.
pub struct Subscription<T> {
    worker: Arc<BatchWorker<T>>,
    ledger: Arc<AckLedger>,
}

impl<T> Subscription<T>
where
    T: DeserializeOwned + Serialize + Send + Sync + 'static,
{
    pub fn new(worker: Arc<BatchWorker<T>>, ledger: Arc<AckLedger>) -> Self {
        Self { worker, ledger }
    }

    pub async fn on_delivery(&self, delivery: Delivery) -> Handled {
        let Delivery { message, ack } = delivery;
        let id = self.ledger.register(ack);

        if message.is_empty() {
            let errors = [FieldError::new("payload", "decode", "payload is empty")];
            self.worker.reject(id, &message, &errors);
            return Handled::Rejected;
        }

        match serde_json::from_slice::<T>(message.payload()) {
            Ok(value) => self.worker.handle(Record::new(id, message, value)).await,
            Err(error) => {
                let errors = [FieldError::new("payload", "decode", error.to_string())];
                self.worker.reject(id, &message, &errors);
                Handled::Rejected
            }
        }
    }

    /// Receive and handle deliveries until `shutdown` fires or the receiver fails.
    /// Does not flush: the worker drains its buffer when its own loop stops.
    pub async fn run(
        &self,
        receiver: &dyn Receiver,
        shutdown: CancellationToken,
    ) -> Result<(), ReceiveError> {
        info!("starting subscription");

        loop {
            let delivery = tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    info!("subscription stopped");
                    return Ok(());
                }
                delivery = receiver.receive() => delivery,
            };

            match delivery {
                Ok(delivery) => {
                    self.on_delivery(delivery).await;
                }
                Err(error) => {
                    error!(%error, "failed to receive message, stopping subscription");
                    metrics::counter!(RECEIVE_ERRORS).increment(1);
                    return Err(error);
                }
            }
        }
    }
}
