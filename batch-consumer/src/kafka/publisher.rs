use async_trait::async_trait;
use health::HealthHandle;
use rdkafka::error::KafkaError;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::ClientConfig;
use tracing::{debug, error, info};

use crate::kafka::config::KafkaConfig;
use crate::kafka::receiver::KEY_ATTRIBUTE;
use crate::retry::{OutboundMessage, PublishError, Publisher};

pub struct KafkaContext {
    liveness: HealthHandle,
}

impl From<HealthHandle> for KafkaContext {
    fn from(value: HealthHandle) -> Self {
        KafkaContext { liveness: value }
    }
}

impl rdkafka::ClientContext for KafkaContext {
    fn stats(&self, _: rdkafka::Statistics) {
        // Signal liveness, as the main rdkafka loop is running and calling us
        self.liveness.report_healthy();
    }
}

/// Republishes records that failed to persist to the retry topic.
pub struct KafkaPublisher {
    producer: FutureProducer<KafkaContext>,
    topic: String,
}

impl KafkaPublisher {
    pub fn new(
        config: &KafkaConfig,
        topic: &str,
        liveness: HealthHandle,
    ) -> Result<Self, KafkaError> {
        let mut client_config: ClientConfig = config.client_config();
        client_config
            .set("linger.ms", config.kafka_producer_linger_ms.to_string())
            .set(
                "message.timeout.ms",
                config.kafka_message_timeout_ms.to_string(),
            )
            .set(
                "compression.codec",
                config.kafka_compression_codec.to_owned(),
            )
            .set(
                "queue.buffering.max.kbytes",
                (config.kafka_producer_queue_mib * 1024).to_string(),
            );

        debug!("rdkafka configuration: {:?}", client_config);
        let producer: FutureProducer<KafkaContext> =
            client_config.create_with_context(liveness.into())?;

        // "Ping" the Kafka brokers by requesting metadata
        match producer
            .client()
            .fetch_metadata(Some(topic), std::time::Duration::from_secs(15))
        {
            Ok(_) => info!(topic, "connected retry publisher to Kafka brokers"),
            Err(error) => {
                error!("failed to fetch metadata from Kafka brokers: {:?}", error);
                return Err(error);
            }
        }

        Ok(Self {
            producer,
            topic: topic.to_owned(),
        })
    }
}

fn headers(message: &OutboundMessage) -> OwnedHeaders {
    // Sorted so republished headers don't depend on map order
    let mut attributes: Vec<(&String, &String)> = message
        .attributes
        .iter()
        .filter(|(name, _)| name.as_str() != KEY_ATTRIBUTE)
        .collect();
    attributes.sort();

    attributes
        .into_iter()
        .fold(OwnedHeaders::new(), |headers, (name, value)| {
            headers.insert(Header {
                key: name.as_str(),
                value: Some(value.as_str()),
            })
        })
}

#[async_trait]
impl Publisher for KafkaPublisher {
    async fn publish(&self, message: &OutboundMessage) -> Result<(), PublishError> {
        let record = FutureRecord {
            topic: &self.topic,
            key: message.attributes.get(KEY_ATTRIBUTE).map(String::as_str),
            payload: Some(message.payload.as_ref()),
            timestamp: None,
            partition: None,
            headers: Some(headers(message)),
        };

        let delivery = match self.producer.send_result(record) {
            Ok(future) => future,
            Err((error, _)) => return Err(PublishError::Kafka(error)),
        };

        match delivery.await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err((error, _))) => Err(PublishError::Kafka(error)),
            Err(_) => Err(PublishError::Canceled),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use health::HealthRegistry;
    use rdkafka::message::Headers;
    use rdkafka::mocking::MockCluster;
    use rdkafka::producer::DefaultProducerContext;
    use std::collections::HashMap;
    use std::time::Duration;

    #[test]
    fn headers_skip_the_key_and_keep_the_rest() {
        let message = OutboundMessage {
            payload: Bytes::from_static(b"{}"),
            attributes: HashMap::from([
                ("key".to_owned(), "u1".to_owned()),
                ("retry".to_owned(), "2".to_owned()),
                ("retry_error".to_owned(), "boom".to_owned()),
            ]),
        };

        let headers = headers(&message);

        let pairs: Vec<(String, String)> = headers
            .iter()
            .map(|h| {
                (
                    h.key.to_owned(),
                    String::from_utf8_lossy(h.value.unwrap_or_default()).into_owned(),
                )
            })
            .collect();
        assert_eq!(
            pairs,
            vec![
                ("retry".to_owned(), "2".to_owned()),
                ("retry_error".to_owned(), "boom".to_owned()),
            ]
        );
    }

    #[tokio::test]
    async fn publishes_to_a_mock_cluster() {
        let cluster = MockCluster::<'static, DefaultProducerContext>::new(1)
            .expect("failed to create mock brokers");
        cluster.create_topic("users_retry", 1, 1).unwrap();

        let config = KafkaConfig {
            kafka_producer_linger_ms: 0,
            kafka_producer_queue_mib: 50,
            kafka_message_timeout_ms: 5000,
            kafka_compression_codec: "none".to_string(),
            kafka_tls: false,
            kafka_hosts: cluster.bootstrap_servers(),
        };
        let registry = HealthRegistry::new("liveness");
        let handle = registry.register("retry_publisher", Duration::from_secs(30));
        let publisher = KafkaPublisher::new(&config, "users_retry", handle).unwrap();

        let message = OutboundMessage {
            payload: Bytes::from_static(br#"{"id":"u1"}"#),
            attributes: HashMap::from([("retry".to_owned(), "1".to_owned())]),
        };
        publisher.publish(&message).await.unwrap();
    }
}
