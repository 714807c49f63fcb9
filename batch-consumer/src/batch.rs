use std::mem;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

use crate::message::Record;

/// What closed a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushTrigger {
    /// The batch reached the maximum record count.
    Size,
    /// The batch stayed open for the maximum wait interval.
    Timer,
    /// The worker is shutting down and drains whatever is buffered.
    Shutdown,
}

impl FlushTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlushTrigger::Size => "size",
            FlushTrigger::Timer => "timer",
            FlushTrigger::Shutdown => "shutdown",
        }
    }
}

/// A closed batch of validated records, in arrival order.
#[derive(Debug)]
pub struct Batch<T> {
    records: Vec<Record<T>>,
    opened_at: Instant,
    size_bytes: usize,
}

impl<T> Batch<T> {
    pub fn records(&self) -> &[Record<T>] {
        &self.records
    }

    pub fn into_records(self) -> Vec<Record<T>> {
        self.records
    }

    pub fn opened_at(&self) -> Instant {
        self.opened_at
    }

    pub fn size_bytes(&self) -> usize {
        self.size_bytes
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Result of appending a record to the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Appended {
    /// The record opened a new batch.
    pub opened: bool,
    /// The open batch is ready to be flushed.
    pub due: Option<FlushTrigger>,
}

struct Filling<T> {
    records: Vec<Record<T>>,
    opened_at: Option<Instant>,
    size_bytes: usize,
}

/// Upper bound on the records reserved up front, large batch sizes grow on demand.
const MAX_PREALLOCATED: usize = 1024;

/// The open batch. Appends and takes are serialized through a mutex, and a take
/// swaps the whole batch out at once, so each record is flushed exactly once.
pub struct BatchBuffer<T> {
    max_size: usize,
    capacity: usize,
    max_wait: Duration,
    state: Mutex<Filling<T>>,
}

impl<T> BatchBuffer<T> {
    pub fn new(max_size: usize, max_wait: Duration) -> Self {
        let capacity = max_size.min(MAX_PREALLOCATED);
        Self {
            max_size,
            capacity,
            max_wait,
            state: Mutex::new(Filling {
                records: Vec::with_capacity(capacity),
                opened_at: None,
                size_bytes: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Filling<T>> {
        // Nothing in here can leave the state half-updated, so a poisoned lock is still usable
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, record: Record<T>) -> Appended {
        let now = Instant::now();
        let mut state = self.lock();

        let opened = state.opened_at.is_none();
        let opened_at = *state.opened_at.get_or_insert(now);
        state.size_bytes += record.message.len();
        state.records.push(record);

        let due = if state.records.len() >= self.max_size {
            Some(FlushTrigger::Size)
        } else if now.duration_since(opened_at) >= self.max_wait {
            Some(FlushTrigger::Timer)
        } else {
            None
        };

        Appended { opened, due }
    }

    /// Close the open batch if `trigger` applies to it. Never returns an empty batch.
    ///
    /// At most `max_size` records are taken; if concurrent appends overshot the
    /// maximum, the remainder stays behind as a freshly opened batch.
    pub fn take(&self, trigger: FlushTrigger) -> Option<Batch<T>> {
        let now = Instant::now();
        let mut state = self.lock();

        let opened_at = state.opened_at?;
        let ready = match trigger {
            FlushTrigger::Size => state.records.len() >= self.max_size,
            FlushTrigger::Timer => now.duration_since(opened_at) >= self.max_wait,
            FlushTrigger::Shutdown => true,
        };
        if !ready || state.records.is_empty() {
            return None;
        }

        let records = if state.records.len() > self.max_size {
            let rest = state.records.split_off(self.max_size);
            mem::replace(&mut state.records, rest)
        } else {
            mem::replace(&mut state.records, Vec::with_capacity(self.capacity))
        };

        let size_bytes: usize = records.iter().map(|r| r.message.len()).sum();
        state.size_bytes -= size_bytes;
        state.opened_at = (!state.records.is_empty()).then_some(now);

        Some(Batch {
            records,
            opened_at,
            size_bytes,
        })
    }

    /// When the open batch is due for a timer flush, if a batch is open.
    pub fn deadline(&self) -> Option<Instant> {
        self.lock().opened_at.map(|opened| opened + self.max_wait)
    }

    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn size_bytes(&self) -> usize {
        self.lock().size_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;
    use std::collections::HashMap;

    fn record(id: u64) -> Record<u64> {
        Record::new(id, Message::new(format!("{id}"), HashMap::new()), id)
    }

    fn ids(batch: &Batch<u64>) -> Vec<u64> {
        batch.records().iter().map(|r| r.value).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn size_trigger_takes_records_in_arrival_order() {
        let buffer = BatchBuffer::new(3, Duration::from_millis(500));

        assert!(buffer.push(record(1)).opened);
        assert_eq!(buffer.push(record(2)).due, None);
        assert!(buffer.take(FlushTrigger::Size).is_none());
        assert_eq!(buffer.push(record(3)).due, Some(FlushTrigger::Size));

        let batch = buffer.take(FlushTrigger::Size).expect("batch is full");
        assert_eq!(ids(&batch), vec![1, 2, 3]);
        assert_eq!(batch.size_bytes(), 3);
        assert!(buffer.is_empty());
        assert_eq!(buffer.deadline(), None);

        // a batch is only taken once
        assert!(buffer.take(FlushTrigger::Size).is_none());
        assert!(buffer.take(FlushTrigger::Shutdown).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn timer_trigger_waits_for_the_open_batch() {
        let buffer = BatchBuffer::new(10, Duration::from_millis(500));
        assert!(buffer.take(FlushTrigger::Timer).is_none());

        buffer.push(record(1));
        let deadline = buffer.deadline().expect("batch is open");
        assert!(buffer.take(FlushTrigger::Timer).is_none());

        tokio::time::sleep_until(deadline).await;
        let batch = buffer.take(FlushTrigger::Timer).expect("batch is due");
        assert_eq!(ids(&batch), vec![1]);

        // Timer firing on an empty buffer is a no-op
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(buffer.take(FlushTrigger::Timer).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn late_append_reports_timer_due() {
        let buffer = BatchBuffer::new(10, Duration::from_millis(500));
        assert_eq!(buffer.push(record(1)).due, None);

        tokio::time::advance(Duration::from_millis(600)).await;
        let appended = buffer.push(record(2));

        assert!(!appended.opened);
        assert_eq!(appended.due, Some(FlushTrigger::Timer));
    }

    #[tokio::test(start_paused = true)]
    async fn overshoot_leaves_remainder_in_a_new_batch() {
        let buffer = BatchBuffer::new(2, Duration::from_millis(500));
        for id in 1..=5 {
            buffer.push(record(id));
        }

        let first = buffer.take(FlushTrigger::Size).expect("full");
        let second = buffer.take(FlushTrigger::Size).expect("still full");
        assert_eq!(ids(&first), vec![1, 2]);
        assert_eq!(ids(&second), vec![3, 4]);
        assert!(buffer.take(FlushTrigger::Size).is_none());

        let last = buffer.take(FlushTrigger::Shutdown).expect("drained");
        assert_eq!(ids(&last), vec![5]);
        assert!(buffer.take(FlushTrigger::Shutdown).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn huge_max_size_does_not_reserve_it_up_front() {
        let buffer = BatchBuffer::new(usize::MAX / 2, Duration::from_millis(500));
        for id in 1..=3 {
            assert_eq!(buffer.push(record(id)).due, None);
        }

        assert!(buffer.take(FlushTrigger::Size).is_none());
        let batch = buffer.take(FlushTrigger::Shutdown).expect("drained");
        assert_eq!(ids(&batch), vec![1, 2, 3]);
    }
}
