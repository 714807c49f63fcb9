use std::sync::Arc;
use std::time::Duration;

use health::{spawn_probe, HealthCheck, HealthRegistry};
use rdkafka::error::KafkaError;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::ack::AckLedger;
use crate::config::{Config, ConfigError};
use crate::kafka::{KafkaPublisher, KafkaReceiver};
use crate::retry::{Publisher, RetryCoordinator};
use crate::sink::{BatchSink, SinkError};
use crate::sinks::{PgUserSink, PrintSink};
use crate::subscription::Subscription;
use crate::user::{user_validator, User};
use crate::worker::BatchWorker;

const PROBE_INTERVAL: Duration = Duration::from_secs(10);
const PROBE_DEADLINE: Duration = Duration::from_secs(30);

#[derive(Error, Debug)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to connect to kafka: {0}")]
    Kafka(#[from] KafkaError),
    #[error("failed to set up the sink: {0}")]
    Sink(#[from] SinkError),
}

/// Every long-lived piece of the consumer, wired together.
pub struct AppContext {
    pub liveness: HealthRegistry,
    pub readiness: HealthRegistry,
    pub receiver: Arc<KafkaReceiver>,
    pub ledger: Arc<AckLedger>,
    pub retry: Arc<RetryCoordinator>,
    pub worker: Arc<BatchWorker<User>>,
    pub subscription: Subscription<User>,
    probes: Vec<JoinHandle<()>>,
}

impl AppContext {
    /// Connects to every driver. Any unreachable driver aborts startup.
    pub async fn new(config: &Config) -> Result<Self, StartupError> {
        config.batch.validate()?;

        let liveness = HealthRegistry::new("liveness");
        let readiness = HealthRegistry::new("readiness");
        let mut probes = Vec::new();

        let receiver = Arc::new(KafkaReceiver::new(&config.kafka, &config.consumer)?);
        probes.push(spawn_probe(
            receiver.clone(),
            readiness.register("kafka_receiver", PROBE_DEADLINE),
            PROBE_INTERVAL,
        ));

        let sink: Arc<dyn BatchSink<User>> = if config.print_sink {
            warn!("printing batches instead of writing them");
            Arc::new(PrintSink::<User>::default())
        } else {
            let sink = Arc::new(
                PgUserSink::connect(
                    &config.database_url,
                    config.max_pg_connections,
                    config.users_table.as_str(),
                )
                .await?,
            );
            sink.check().await.map_err(SinkError::Unavailable)?;
            probes.push(spawn_probe(
                sink.clone(),
                readiness.register("database", PROBE_DEADLINE),
                PROBE_INTERVAL,
            ));
            sink
        };

        let publisher: Option<Arc<dyn Publisher>> =
            match (&config.kafka_retry_topic, config.batch.retry_enabled) {
                (Some(topic), true) => {
                    // Liveness is reported by the producer's statistics callback
                    let handle = liveness.register("retry_publisher", PROBE_DEADLINE);
                    Some(Arc::new(KafkaPublisher::new(&config.kafka, topic.as_str(), handle)?))
                }
                (None, true) => {
                    warn!("no KAFKA_RETRY_TOPIC set, records that fail to persist will be dropped");
                    None
                }
                (_, false) => {
                    warn!("retries are disabled, records that fail to persist will be dropped");
                    None
                }
            };

        let ledger = Arc::new(AckLedger::new());
        let retry = Arc::new(RetryCoordinator::new(
            publisher,
            config.batch.retry_concurrency,
            &config.batch.retry_attempt_attribute,
            ledger.clone(),
        ));

        let worker = Arc::new(
            BatchWorker::new(
                &config.batch,
                user_validator(),
                sink,
                retry.clone(),
                ledger.clone(),
            )
            .with_liveness(liveness.register("flush_loop", PROBE_DEADLINE)),
        );
        let subscription = Subscription::new(worker.clone(), ledger.clone());

        info!(
            batch_size = config.batch.max_batch_size,
            batch_wait = ?config.batch.max_batch_wait.0,
            retries = retry.has_publisher(),
            "consumer ready"
        );

        Ok(Self {
            liveness,
            readiness,
            receiver,
            ledger,
            retry,
            worker,
            subscription,
            probes,
        })
    }

    pub fn stop_probes(&self) {
        for probe in &self.probes {
            probe.abort();
        }
    }
}
