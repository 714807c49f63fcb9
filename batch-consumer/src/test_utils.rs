use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::ack::{Acknowledger, Settlement};
use crate::message::{Message, Record, RecordId};
use crate::retry::{OutboundMessage, PublishError, Publisher};
use crate::sink::{BatchSink, SinkError, WriteReport};
use crate::validator::FieldError;
use crate::worker::RejectionHandler;

/// A sink that records every batch it sees and answers from a script.
/// Once the script runs out, every batch is committed.
pub struct MockSink<T> {
    batches: Mutex<Vec<Vec<T>>>,
    script: Mutex<VecDeque<Result<WriteReport, String>>>,
}

impl<T> Default for MockSink<T> {
    fn default() -> Self {
        Self {
            batches: Mutex::new(Vec::new()),
            script: Mutex::new(VecDeque::new()),
        }
    }
}

impl<T: Clone> MockSink<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn then_report(self, report: WriteReport) -> Self {
        self.script.lock().unwrap().push_back(Ok(report));
        self
    }

    pub fn then_fail(self, error: &str) -> Self {
        self.script.lock().unwrap().push_back(Err(error.to_owned()));
        self
    }

    pub fn batches(&self) -> Vec<Vec<T>> {
        self.batches.lock().unwrap().clone()
    }
}

#[async_trait]
impl<T: Clone + Send + Sync> BatchSink<T> for MockSink<T> {
    async fn write_batch(&self, records: &[Record<T>]) -> Result<WriteReport, SinkError> {
        self.batches
            .lock()
            .unwrap()
            .push(records.iter().map(|r| r.value.clone()).collect());

        match self.script.lock().unwrap().pop_front() {
            None => Ok(WriteReport::committed()),
            Some(Ok(report)) => Ok(report),
            Some(Err(error)) => Err(SinkError::Unavailable(error)),
        }
    }
}

#[derive(Default)]
pub struct MockPublisher {
    published: Mutex<Vec<OutboundMessage>>,
    attempts: AtomicUsize,
    failing: bool,
}

impl MockPublisher {
    pub fn failing() -> Self {
        Self {
            failing: true,
            ..Default::default()
        }
    }

    pub fn published(&self) -> Vec<OutboundMessage> {
        self.published.lock().unwrap().clone()
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Publisher for MockPublisher {
    async fn publish(&self, message: &OutboundMessage) -> Result<(), PublishError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.failing {
            return Err(PublishError::Closed);
        }
        self.published.lock().unwrap().push(message.clone());
        Ok(())
    }
}

/// Records settlements in the order they are reported.
#[derive(Default)]
pub struct SettlementLog {
    settled: Mutex<Vec<(RecordId, Settlement)>>,
}

impl SettlementLog {
    pub fn all(&self) -> Vec<(RecordId, Settlement)> {
        self.settled.lock().unwrap().clone()
    }

    pub fn of(&self, id: RecordId) -> Option<Settlement> {
        self.all()
            .into_iter()
            .find_map(|(settled, s)| (settled == id).then_some(s))
    }
}

impl Acknowledger for SettlementLog {
    fn settle(&self, id: RecordId, settlement: Settlement) {
        self.settled.lock().unwrap().push((id, settlement));
    }
}

/// Collects rejections passed to the worker's rejection handler.
#[derive(Clone, Default)]
pub struct RejectionLog {
    rejected: Arc<Mutex<Vec<(RecordId, Vec<FieldError>)>>>,
}

impl RejectionLog {
    pub fn handler(&self) -> RejectionHandler {
        let rejected = self.rejected.clone();
        Arc::new(move |id: RecordId, _message: &Message, errors: &[FieldError]| {
            rejected.lock().unwrap().push((id, errors.to_vec()));
        })
    }

    pub fn all(&self) -> Vec<(RecordId, Vec<FieldError>)> {
        self.rejected.lock().unwrap().clone()
    }
}
