//! In-memory collaborators over tokio channels, for tests and local runs.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::ack::{AckError, Acknowledge};
use crate::message::Message;
use crate::retry::{OutboundMessage, PublishError, Publisher};
use crate::subscription::{Delivery, ReceiveError, Receiver};

type AckLog = Arc<Mutex<Vec<u64>>>;

struct ChannelAck {
    sequence: u64,
    acked: AckLog,
}

impl Acknowledge for ChannelAck {
    fn ack(self: Box<Self>) -> Result<(), AckError> {
        self.acked
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(self.sequence);
        Ok(())
    }
}

/// Receives messages sent through the paired `mpsc::Sender`, numbering them
/// from 0 in arrival order. Acknowledged numbers are recorded in ack order.
pub struct ChannelReceiver {
    messages: tokio::sync::Mutex<mpsc::Receiver<Message>>,
    next_sequence: AtomicU64,
    acked: AckLog,
}

impl ChannelReceiver {
    pub fn new(capacity: usize) -> (mpsc::Sender<Message>, Self) {
        let (tx, rx) = mpsc::channel(capacity);
        let receiver = Self {
            messages: tokio::sync::Mutex::new(rx),
            next_sequence: AtomicU64::new(0),
            acked: Arc::default(),
        };
        (tx, receiver)
    }

    pub fn acked(&self) -> Vec<u64> {
        self.acked
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl Receiver for ChannelReceiver {
    async fn receive(&self) -> Result<Delivery, ReceiveError> {
        let message = self
            .messages
            .lock()
            .await
            .recv()
            .await
            .ok_or(ReceiveError::Closed)?;

        let sequence = self.next_sequence.fetch_add(1, Ordering::SeqCst);
        Ok(Delivery {
            message,
            ack: Box::new(ChannelAck {
                sequence,
                acked: self.acked.clone(),
            }),
        })
    }
}

/// Publishes into an `mpsc` channel. Fails once the other side is dropped.
pub struct ChannelPublisher {
    outbound: mpsc::Sender<OutboundMessage>,
}

impl ChannelPublisher {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<OutboundMessage>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { outbound: tx }, rx)
    }
}

#[async_trait]
impl Publisher for ChannelPublisher {
    async fn publish(&self, message: &OutboundMessage) -> Result<(), PublishError> {
        self.outbound
            .send(message.clone())
            .await
            .map_err(|_| PublishError::Closed)
    }
}
