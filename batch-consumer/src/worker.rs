use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use health::HealthHandle;
use serde::Serialize;
use tokio::sync::{Mutex, Notify};
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::ack::{Acknowledger, Settlement};
use crate::batch::{Batch, BatchBuffer, FlushTrigger};
use crate::config::BatchConfig;
use crate::message::{Message, Record, RecordId};
use crate::metrics_consts::{
    BATCHES_FAILED, BATCHES_FLUSHED, BATCH_BYTES, BATCH_RECORDS, BATCH_WRITE_TIME,
    BUFFERED_RECORDS, RECORDS_COMMITTED, RECORDS_FAILED, RECORDS_RECEIVED, RECORDS_REJECTED,
};
use crate::retry::RetryCoordinator;
use crate::sink::BatchSink;
use crate::validator::{FieldError, Validator};

/// How often the flush loop wakes up to report liveness when idle.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// Called with every record that failed decoding or validation.
pub type RejectionHandler = Arc<dyn Fn(RecordId, &Message, &[FieldError]) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handled {
    /// Failed validation, never buffered.
    Rejected,
    Buffered,
    /// Closed a batch, which was written before returning. Holds the number of
    /// records written.
    Flushed(usize),
}

fn log_rejection(id: RecordId, message: &Message, errors: &[FieldError]) {
    let errors: Vec<String> = errors.iter().map(ToString::to_string).collect();
    warn!(
        record_id = id,
        attributes = ?message.attributes(),
        ?errors,
        "rejected invalid record"
    );
}

/// Validates records, batches them, and writes the batches to the sink.
/// Records the sink could not persist go to the retry coordinator.
pub struct BatchWorker<T> {
    buffer: BatchBuffer<T>,
    validator: Validator<T>,
    sink: Arc<dyn BatchSink<T>>,
    retry: Arc<RetryCoordinator>,
    acknowledger: Arc<dyn Acknowledger>,
    on_rejected: RejectionHandler,
    liveness: Option<HealthHandle>,
    // Held while taking and writing a batch, so batches reach the sink in order
    write_lock: Mutex<()>,
    batch_opened: Notify,
}

impl<T> BatchWorker<T>
where
    T: Serialize + Send + Sync + 'static,
{
    pub fn new(
        config: &BatchConfig,
        validator: Validator<T>,
        sink: Arc<dyn BatchSink<T>>,
        retry: Arc<RetryCoordinator>,
        acknowledger: Arc<dyn Acknowledger>,
    ) -> Self {
        Self {
            buffer: BatchBuffer::new(config.max_batch_size, config.max_batch_wait.0),
            validator,
            sink,
            retry,
            acknowledger,
            on_rejected: Arc::new(log_rejection),
            liveness: None,
            write_lock: Mutex::new(()),
            batch_opened: Notify::new(),
        }
    }

    pub fn with_rejection_handler(mut self, handler: RejectionHandler) -> Self {
        self.on_rejected = handler;
        self
    }

    /// Report liveness of the flush loop through `handle`.
    pub fn with_liveness(mut self, handle: HealthHandle) -> Self {
        self.liveness = Some(handle);
        self
    }

    pub async fn handle(&self, record: Record<T>) -> Handled {
        metrics::counter!(RECORDS_RECEIVED).increment(1);

        let outcome = self.validator.validate(&record);
        if !outcome.is_valid() {
            self.reject(record.id, &record.message, &outcome.field_errors);
            return Handled::Rejected;
        }

        let appended = self.buffer.push(record);
        if appended.opened {
            self.batch_opened.notify_one();
        }
        metrics::gauge!(BUFFERED_RECORDS).set(self.buffer.len() as f64);

        match appended.due {
            Some(trigger) => Handled::Flushed(self.flush(trigger).await),
            None => Handled::Buffered,
        }
    }

    /// Report a record that can't enter a batch. It is acknowledged right away.
    pub fn reject(&self, id: RecordId, message: &Message, errors: &[FieldError]) {
        metrics::counter!(RECORDS_REJECTED).increment(1);
        (self.on_rejected)(id, message, errors);
        self.acknowledger.settle(id, Settlement::Rejected);
    }

    /// Write every batch `trigger` applies to, returning the number of records written.
    pub async fn flush(&self, trigger: FlushTrigger) -> usize {
        let _writing = self.write_lock.lock().await;

        let mut written = 0;
        while let Some(batch) = self.buffer.take(trigger) {
            written += batch.len();
            self.write(batch, trigger).await;
        }
        metrics::gauge!(BUFFERED_RECORDS).set(self.buffer.len() as f64);

        written
    }

    async fn write(&self, batch: Batch<T>, trigger: FlushTrigger) {
        let count = batch.len();
        let waited = batch.opened_at().elapsed();
        metrics::counter!(BATCHES_FLUSHED, "trigger" => trigger.as_str()).increment(1);
        metrics::histogram!(BATCH_RECORDS).record(count as f64);
        metrics::histogram!(BATCH_BYTES).record(batch.size_bytes() as f64);

        let started = Instant::now();
        let result = self.sink.write_batch(batch.records()).await;
        metrics::histogram!(BATCH_WRITE_TIME).record(started.elapsed().as_secs_f64());

        match result {
            Ok(report) => {
                let mut failed: HashMap<usize, String> = HashMap::new();
                for failure in report.into_failures() {
                    if failure.index >= count {
                        warn!(
                            index = failure.index,
                            count, "sink reported a failure outside the batch"
                        );
                        continue;
                    }
                    failed.entry(failure.index).or_insert(failure.error);
                }

                debug!(
                    records = count,
                    failed = failed.len(),
                    trigger = trigger.as_str(),
                    ?waited,
                    "wrote batch"
                );
                metrics::counter!(RECORDS_COMMITTED).increment((count - failed.len()) as u64);

                for (index, record) in batch.into_records().into_iter().enumerate() {
                    match failed.remove(&index) {
                        None => self.acknowledger.settle(record.id, Settlement::Committed),
                        Some(error) => self.fail(record, error).await,
                    }
                }
            }
            Err(error) => {
                error!(
                    records = count,
                    trigger = trigger.as_str(),
                    %error,
                    "failed to write batch, forwarding every record to retry"
                );
                metrics::counter!(BATCHES_FAILED).increment(1);

                let error = error.to_string();
                for record in batch.into_records() {
                    self.fail(record, error.clone()).await;
                }
            }
        }
    }

    async fn fail(&self, record: Record<T>, error: String) {
        error!(
            record_id = record.id,
            attributes = ?record.message.attributes(),
            %error,
            "failed to persist record"
        );
        metrics::counter!(RECORDS_FAILED).increment(1);

        let envelope = self.retry.envelope(record, error);
        self.retry.dispatch(envelope).await;
    }

    /// Flush batches as their wait interval runs out, until `shutdown` fires.
    /// Whatever is still buffered is written before returning.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!("starting batch flush loop");

        loop {
            if let Some(liveness) = &self.liveness {
                liveness.report_healthy();
            }

            let heartbeat = Instant::now() + HEARTBEAT_INTERVAL;
            let wake = match self.buffer.deadline() {
                Some(deadline) => deadline.min(heartbeat),
                None => heartbeat,
            };

            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = self.batch_opened.notified() => continue,
                _ = sleep_until(wake) => {
                    self.flush(FlushTrigger::Timer).await;
                }
            }
        }

        let drained = self.flush(FlushTrigger::Shutdown).await;
        info!(records = drained, "batch flush loop stopped");
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::{RecordFailure, SinkError, WriteReport};
    use crate::test_utils::{MockPublisher, MockSink, RejectionLog, SettlementLog};
    use async_trait::async_trait;

    struct Harness {
        worker: Arc<BatchWorker<String>>,
        sink: Arc<MockSink<String>>,
        publisher: Arc<MockPublisher>,
        retry: Arc<RetryCoordinator>,
        settlements: Arc<SettlementLog>,
        rejections: RejectionLog,
    }

    fn harness(sink: MockSink<String>, publisher: Option<MockPublisher>) -> Harness {
        let sink = Arc::new(sink);
        let settlements = Arc::new(SettlementLog::default());
        let publisher = Arc::new(publisher.unwrap_or_default());
        let retry = Arc::new(RetryCoordinator::new(
            Some(publisher.clone()),
            4,
            "retry",
            settlements.clone(),
        ));
        let rejections = RejectionLog::default();
        let validator = Validator::new().required("name", |name: &String| name.as_str());

        let worker = BatchWorker::new(
            &BatchConfig::new(3, Duration::from_millis(500)),
            validator,
            sink.clone(),
            retry.clone(),
            settlements.clone(),
        )
        .with_rejection_handler(rejections.handler());

        Harness {
            worker: Arc::new(worker),
            sink,
            publisher,
            retry,
            settlements,
            rejections,
        }
    }

    fn record(id: u64, name: &str) -> Record<String> {
        Record::new(id, Message::new(name.to_owned(), HashMap::new()), name.to_owned())
    }

    fn names(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn size_then_timer_flush() {
        let h = harness(MockSink::new(), None);
        let shutdown = CancellationToken::new();
        let worker = h.worker.clone();
        let token = shutdown.clone();
        let flush_loop = tokio::spawn(async move { worker.run(token).await });

        assert_eq!(h.worker.handle(record(0, "a")).await, Handled::Buffered);
        assert_eq!(h.worker.handle(record(1, "b")).await, Handled::Buffered);
        assert_eq!(h.worker.handle(record(2, "c")).await, Handled::Flushed(3));
        assert_eq!(h.worker.handle(record(3, "d")).await, Handled::Buffered);

        assert_eq!(h.sink.batches(), vec![names(&["a", "b", "c"])]);
        assert_eq!(h.worker.buffered(), 1);

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(
            h.sink.batches(),
            vec![names(&["a", "b", "c"]), names(&["d"])]
        );

        shutdown.cancel();
        flush_loop.await.unwrap();
        assert_eq!(h.sink.batches().len(), 2);
        assert_eq!(h.settlements.all().len(), 4);
    }

    #[tokio::test]
    async fn partial_failure_retries_only_the_failed_record() {
        let sink = MockSink::new().then_report(WriteReport::with_failures(vec![
            RecordFailure::new(1, "duplicate email"),
        ]));
        let h = harness(sink, None);

        h.worker.handle(record(0, "a")).await;
        h.worker.handle(record(1, "b")).await;
        h.worker.handle(record(2, "c")).await;
        h.retry.close().await;

        let published = h.publisher.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].payload.as_ref(), br#""b""#);
        assert_eq!(published[0].attributes.get("retry").unwrap(), "1");
        assert_eq!(h.settlements.of(0), Some(Settlement::Committed));
        assert_eq!(h.settlements.of(1), Some(Settlement::Forwarded));
        assert_eq!(h.settlements.of(2), Some(Settlement::Committed));
    }

    #[tokio::test]
    async fn whole_batch_failure_retries_every_record() {
        let h = harness(MockSink::new().then_fail("connection refused"), None);

        for (id, name) in ["a", "b", "c"].into_iter().enumerate() {
            h.worker.handle(record(id as u64, name)).await;
        }
        h.retry.close().await;

        assert_eq!(h.publisher.published().len(), 3);
        assert!(h
            .settlements
            .all()
            .iter()
            .all(|(_, s)| *s == Settlement::Forwarded));
    }

    #[tokio::test]
    async fn out_of_range_failures_are_ignored() {
        let sink = MockSink::new().then_report(WriteReport::with_failures(vec![
            RecordFailure::new(7, "nonsense"),
        ]));
        let h = harness(sink, None);

        for (id, name) in ["a", "b", "c"].into_iter().enumerate() {
            h.worker.handle(record(id as u64, name)).await;
        }
        h.retry.close().await;

        assert!(h.publisher.published().is_empty());
        assert_eq!(h.settlements.all().len(), 3);
    }

    #[tokio::test]
    async fn invalid_records_never_reach_the_sink() {
        let h = harness(MockSink::new(), None);

        assert_eq!(h.worker.handle(record(0, "")).await, Handled::Rejected);
        assert_eq!(h.worker.buffered(), 0);

        let rejections = h.rejections.all();
        assert_eq!(rejections.len(), 1);
        assert_eq!(rejections[0].0, 0);
        assert_eq!(
            rejections[0].1,
            vec![FieldError::new("name", "required", "name is required")]
        );
        assert_eq!(h.settlements.of(0), Some(Settlement::Rejected));

        h.worker.flush(FlushTrigger::Shutdown).await;
        assert!(h.sink.batches().is_empty());
    }

    #[tokio::test]
    async fn failure_without_publisher_is_dropped() {
        let sink = Arc::new(MockSink::new().then_fail("connection refused"));
        let settlements = Arc::new(SettlementLog::default());
        let retry = Arc::new(RetryCoordinator::new(None, 4, "retry", settlements.clone()));
        let worker = BatchWorker::new(
            &BatchConfig::new(1, Duration::from_millis(500)),
            Validator::new(),
            sink.clone(),
            retry.clone(),
            settlements.clone(),
        );

        assert_eq!(worker.handle(record(0, "a")).await, Handled::Flushed(1));
        retry.close().await;

        assert_eq!(settlements.all(), vec![(0, Settlement::Dropped)]);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_drains_the_partial_batch() {
        let h = harness(MockSink::new(), None);
        let shutdown = CancellationToken::new();
        let worker = h.worker.clone();
        let token = shutdown.clone();
        let flush_loop = tokio::spawn(async move { worker.run(token).await });

        h.worker.handle(record(0, "a")).await;
        h.worker.handle(record(1, "b")).await;
        shutdown.cancel();
        flush_loop.await.unwrap();

        assert_eq!(h.sink.batches(), vec![names(&["a", "b"])]);
        assert_eq!(h.worker.buffered(), 0);
    }

    /// Takes a while to write, so appends pile up behind the write lock.
    #[derive(Default)]
    struct SlowSink {
        batches: std::sync::Mutex<Vec<Vec<String>>>,
    }

    #[async_trait]
    impl BatchSink<String> for SlowSink {
        async fn write_batch(&self, records: &[Record<String>]) -> Result<WriteReport, SinkError> {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let batch = records.iter().map(|r| r.value.clone()).collect();
            self.batches.lock().unwrap().push(batch);
            Ok(WriteReport::committed())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_appends_never_overshoot_a_batch() {
        let sink = Arc::new(SlowSink::default());
        let settlements = Arc::new(SettlementLog::default());
        let retry = Arc::new(RetryCoordinator::new(None, 4, "retry", settlements.clone()));
        let worker = Arc::new(BatchWorker::new(
            &BatchConfig::new(3, Duration::from_secs(60)),
            Validator::new(),
            sink.clone(),
            retry,
            settlements.clone(),
        ));

        let handles: Vec<_> = (0..10)
            .map(|id| {
                let worker = worker.clone();
                tokio::spawn(async move { worker.handle(record(id, &format!("r{id}"))).await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }
        worker.flush(FlushTrigger::Shutdown).await;

        let batches = sink.batches.lock().unwrap().clone();
        assert!(batches.iter().all(|batch| batch.len() <= 3), "{batches:?}");
        assert_eq!(batches.len(), 4);

        let arrived: Vec<String> = batches.into_iter().flatten().collect();
        let expected: Vec<String> = (0..10).map(|id| format!("r{id}")).collect();
        assert_eq!(arrived, expected);
        assert_eq!(settlements.all().len(), 10);
    }
}
