use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use rdkafka::error::KafkaError;
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::message::RecordId;
use crate::metrics_consts::{ACKS_FAILED, ACKS_RELEASED};

#[derive(Error, Debug)]
pub enum AckError {
    #[error("kafka error: {0}")]
    Kafka(#[from] KafkaError),
    #[error("receiver is gone")]
    Gone,
}

/// Receiver-side acknowledgement for one delivery, such as a Kafka offset.
pub trait Acknowledge: Send {
    fn ack(self: Box<Self>) -> Result<(), AckError>;
}

/// Final outcome of a delivery, after which it may be acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    /// Failed decoding or validation, never buffered.
    Rejected,
    /// Written by the sink.
    Committed,
    /// Handed off to the publisher for reprocessing.
    Forwarded,
    /// Failed to persist and could not be forwarded. Logged as data loss.
    Dropped,
}

impl Settlement {
    pub fn as_str(&self) -> &'static str {
        match self {
            Settlement::Rejected => "rejected",
            Settlement::Committed => "committed",
            Settlement::Forwarded => "forwarded",
            Settlement::Dropped => "dropped",
        }
    }
}

/// Where pipeline stages report the final outcome of each record.
pub trait Acknowledger: Send + Sync {
    fn settle(&self, id: RecordId, settlement: Settlement);
}

struct Pending {
    ack: Box<dyn Acknowledge>,
    settled: Option<Settlement>,
}

#[derive(Default)]
struct LedgerState {
    next_id: RecordId,
    pending: BTreeMap<RecordId, Pending>,
}

/// Tracks in-flight deliveries and releases their acknowledgements in delivery
/// order: a settled delivery is held back until every earlier one has settled,
/// so an offset-based receiver never commits past an unsettled message.
#[derive(Default)]
pub struct AckLedger {
    state: Mutex<LedgerState>,
}

impl AckLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, LedgerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start tracking a delivery, returning the id its record will carry.
    pub fn register(&self, ack: Box<dyn Acknowledge>) -> RecordId {
        let mut state = self.lock();
        let id = state.next_id;
        state.next_id += 1;
        state.pending.insert(id, Pending { ack, settled: None });
        id
    }

    /// Deliveries registered but not yet acknowledged.
    pub fn pending(&self) -> usize {
        self.lock().pending.len()
    }
}

impl Acknowledger for AckLedger {
    fn settle(&self, id: RecordId, settlement: Settlement) {
        let mut state = self.lock();

        match state.pending.get_mut(&id) {
            Some(pending) if pending.settled.is_none() => pending.settled = Some(settlement),
            Some(pending) => {
                warn!(
                    record_id = id,
                    previous = ?pending.settled,
                    ?settlement,
                    "record settled twice"
                );
                return;
            }
            None => {
                warn!(record_id = id, ?settlement, "settled an unknown record");
                return;
            }
        }

        // Acks are released under the lock so concurrent settles can't reorder them
        while let Some(entry) = state.pending.first_entry() {
            let Some(settlement) = entry.get().settled else {
                break;
            };
            let (id, pending) = entry.remove_entry();
            match pending.ack.ack() {
                Ok(()) => {
                    debug!(record_id = id, settlement = settlement.as_str(), "acknowledged");
                    metrics::counter!(ACKS_RELEASED, "settlement" => settlement.as_str())
                        .increment(1);
                }
                Err(error) => {
                    // The receiver will redeliver it, which the sink tolerates
                    error!(record_id = id, %error, "failed to acknowledge record");
                    metrics::counter!(ACKS_FAILED).increment(1);
                }
            }
        }
    }
}
