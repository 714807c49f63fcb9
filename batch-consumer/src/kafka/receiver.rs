use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use health::HealthCheck;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::message::{BorrowedMessage, Headers};
use rdkafka::types::RDKafkaErrorCode;
use rdkafka::Message as _;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::ack::{AckError, Acknowledge};
use crate::kafka::config::{ConsumerConfig, KafkaConfig};
use crate::message::Message;
use crate::metrics_consts::KAFKA_CONSUMER_ERRORS;
use crate::subscription::{Delivery, ReceiveError, Receiver};

/// Attribute carrying the Kafka message key, if the message has one.
pub const KEY_ATTRIBUTE: &str = "key";

const METADATA_TIMEOUT: Duration = Duration::from_secs(10);

/// Consecutive recoverable errors after which the receiver gives up.
const MAX_CONSECUTIVE_ERRORS: u64 = 60;

/// What the receiver does after a consumer error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Recovery {
    Retry(Duration),
    Stop,
}

/// Sort a consumer error into a metric label and a recovery. Consumption and
/// broker connection errors are retried with a growing backoff, fatal ones stop
/// the receiver, as does a recoverable error that keeps coming back.
fn classify(error: &KafkaError, consecutive: u64) -> (&'static str, Recovery) {
    let retry = |step: Duration, cap: u64| Recovery::Retry(step * consecutive.min(cap) as u32);

    let (kind, recovery) = match error {
        KafkaError::MessageConsumption(code) => match code {
            RDKafkaErrorCode::PartitionEOF => ("partition_eof", Recovery::Retry(Duration::ZERO)),
            RDKafkaErrorCode::OperationTimedOut => {
                ("op_timed_out", Recovery::Retry(Duration::ZERO))
            }
            // auto.offset.reset seeks to the head or tail of the partition
            RDKafkaErrorCode::OffsetOutOfRange => {
                ("offset_out_of_range", retry(Duration::from_millis(500), 1))
            }
            _ => ("consumer", retry(Duration::from_millis(100), 10)),
        },
        KafkaError::MessageConsumptionFatal(_) => ("consumer_fatal", Recovery::Stop),
        KafkaError::Global(code) => match code {
            RDKafkaErrorCode::AllBrokersDown => {
                ("all_brokers_down", retry(Duration::from_secs(1), 5))
            }
            RDKafkaErrorCode::BrokerTransportFailure => {
                ("broker_transport", retry(Duration::from_secs(1), 3))
            }
            RDKafkaErrorCode::Authentication => ("authentication", Recovery::Stop),
            _ => ("global", retry(Duration::from_millis(500), 6)),
        },
        KafkaError::Canceled => ("canceled", Recovery::Stop),
        _ => ("unexpected", retry(Duration::from_millis(100), 10)),
    };

    match recovery {
        Recovery::Retry(_) if consecutive >= MAX_CONSECUTIVE_ERRORS => (kind, Recovery::Stop),
        recovery => (kind, recovery),
    }
}

struct Inner {
    consumer: StreamConsumer,
    topic: String,
}

/// Consumes a single topic. Offsets are stored only when a delivery is
/// acknowledged, and committed by the consumer's auto commit and on close.
#[derive(Clone)]
pub struct KafkaReceiver {
    inner: Arc<Inner>,
}

impl KafkaReceiver {
    pub fn new(
        common_config: &KafkaConfig,
        consumer_config: &ConsumerConfig,
    ) -> Result<Self, KafkaError> {
        let mut client_config = common_config.client_config();
        client_config
            .set("group.id", &consumer_config.kafka_consumer_group)
            .set("auto.offset.reset", &consumer_config.kafka_consumer_offset_reset)
            .set(
                "enable.auto.commit",
                consumer_config.kafka_consumer_auto_commit.to_string(),
            )
            .set(
                "auto.commit.interval.ms",
                consumer_config.kafka_consumer_auto_commit_interval_ms.to_string(),
            )
            .set("enable.auto.offset.store", "false");

        debug!("rdkafka configuration: {:?}", client_config);
        let consumer: StreamConsumer = client_config.create()?;

        // "Ping" the Kafka brokers by requesting metadata
        match consumer.fetch_metadata(
            Some(consumer_config.kafka_consumer_topic.as_str()),
            METADATA_TIMEOUT,
        ) {
            Ok(metadata) => info!(
                topic = consumer_config.kafka_consumer_topic.as_str(),
                partitions = metadata
                    .topics()
                    .first()
                    .map(|t| t.partitions().len())
                    .unwrap_or_default(),
                "connected to Kafka brokers"
            ),
            Err(error) => {
                error!("failed to fetch metadata from Kafka brokers: {:?}", error);
                return Err(error);
            }
        }

        consumer.subscribe(&[consumer_config.kafka_consumer_topic.as_str()])?;

        Ok(Self {
            inner: Arc::new(Inner {
                consumer,
                topic: consumer_config.kafka_consumer_topic.clone(),
            }),
        })
    }

    fn to_message(message: &BorrowedMessage<'_>) -> Message {
        let mut attributes = HashMap::new();
        if let Some(headers) = message.headers() {
            for header in headers.iter() {
                if let Some(value) = header.value {
                    attributes.insert(
                        header.key.to_owned(),
                        String::from_utf8_lossy(value).into_owned(),
                    );
                }
            }
        }
        if let Some(key) = message.key() {
            attributes.insert(KEY_ATTRIBUTE.to_owned(), String::from_utf8_lossy(key).into_owned());
        }

        let received_at = message
            .timestamp()
            .to_millis()
            .and_then(DateTime::<Utc>::from_timestamp_millis)
            .unwrap_or_else(Utc::now);

        let payload = message.payload().map(Bytes::copy_from_slice).unwrap_or_default();
        Message::with_timestamp(payload, attributes, received_at)
    }
}

/// Stores the offset of one message once it is settled.
struct Offset {
    handle: Weak<Inner>,
    partition: i32,
    offset: i64,
}

impl Acknowledge for Offset {
    fn ack(self: Box<Self>) -> Result<(), AckError> {
        let inner = self.handle.upgrade().ok_or(AckError::Gone)?;
        // The committed offset is the next one to consume
        inner
            .consumer
            .store_offset(&inner.topic, self.partition, self.offset + 1)?;
        Ok(())
    }
}

#[async_trait]
impl Receiver for KafkaReceiver {
    async fn receive(&self) -> Result<Delivery, ReceiveError> {
        let mut consecutive = 0;
        let message = loop {
            let error = match self.inner.consumer.recv().await {
                Ok(message) => break message,
                Err(error) => error,
            };

            consecutive += 1;
            let (kind, recovery) = classify(&error, consecutive);
            match recovery {
                Recovery::Retry(backoff) => {
                    metrics::counter!(KAFKA_CONSUMER_ERRORS, "error" => kind, "level" => "warn")
                        .increment(1);
                    warn!(%error, consecutive, ?backoff, "kafka consumer error, retrying");
                    sleep(backoff).await;
                }
                Recovery::Stop => {
                    metrics::counter!(KAFKA_CONSUMER_ERRORS, "error" => kind, "level" => "fatal")
                        .increment(1);
                    return Err(error.into());
                }
            }
        };

        let ack = Box::new(Offset {
            handle: Arc::downgrade(&self.inner),
            partition: message.partition(),
            offset: message.offset(),
        });

        Ok(Delivery {
            message: Self::to_message(&message),
            ack,
        })
    }

    async fn close(&self) -> Result<(), ReceiveError> {
        match self.inner.consumer.commit_consumer_state(CommitMode::Sync) {
            Ok(()) => Ok(()),
            // Nothing was stored since the last commit
            Err(KafkaError::ConsumerCommit(rdkafka::types::RDKafkaErrorCode::NoOffset)) => Ok(()),
            Err(error) => Err(error.into()),
        }
    }
}

#[async_trait]
impl HealthCheck for KafkaReceiver {
    async fn check(&self) -> Result<(), String> {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            inner
                .consumer
                .fetch_metadata(Some(inner.topic.as_str()), METADATA_TIMEOUT)
                .map(|_| ())
                .map_err(|e| e.to_string())
        })
        .await
        .map_err(|e| e.to_string())?
    }
}
