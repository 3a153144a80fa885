//! Kafka/Redpanda transport. Producers fire with a bounded delivery timeout;
//! consumers run with `enable.auto.commit=false` and commit each message's
//! offset only after its handler returned.

use std::time::Duration;

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::Message;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use rdkafka::{Offset, TopicPartitionList};

use crate::bus::{BusError, BusMessage, EventPublisher, TopicConsumer};

const DELIVERY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct KafkaPublisher {
    producer: FutureProducer,
    close_timeout: Duration,
}

impl KafkaPublisher {
    pub fn new(brokers: &str, close_timeout: Duration) -> Result<Self, BusError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("message.timeout.ms", "5000")
            .set("acks", "1")
            .create()
            .map_err(|err| BusError::Publish {
                topic: "*".to_string(),
                reason: err.to_string(),
            })?;

        Ok(Self {
            producer,
            close_timeout,
        })
    }
}

#[async_trait]
impl EventPublisher for KafkaPublisher {
    async fn publish(&self, topic: &str, key: &str, payload: Vec<u8>) -> Result<(), BusError> {
        let record = FutureRecord::to(topic).key(key).payload(&payload);

        self.producer
            .send(record, Timeout::After(DELIVERY_TIMEOUT))
            .await
            .map(|_| ())
            .map_err(|(err, _)| BusError::Publish {
                topic: topic.to_string(),
                reason: err.to_string(),
            })
    }

    async fn close(&self) {
        let producer = self.producer.clone();
        let timeout = self.close_timeout;
        let flushed =
            tokio::task::spawn_blocking(move || producer.flush(Timeout::After(timeout))).await;

        match flushed {
            Ok(Ok(())) => tracing::info!("kafka producer flushed"),
            Ok(Err(err)) => tracing::warn!(error = %err, "kafka producer flush failed"),
            Err(err) => tracing::warn!(error = %err, "kafka producer flush task failed"),
        }
    }
}

pub struct KafkaConsumer {
    consumer: StreamConsumer,
    topic: String,
}

impl KafkaConsumer {
    pub fn subscribe(brokers: &str, group: &str, topic: &str) -> Result<Self, BusError> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("group.id", group)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .set("session.timeout.ms", "6000")
            .set("enable.partition.eof", "false")
            .create()
            .map_err(|err| BusError::Fetch(err.to_string()))?;

        consumer
            .subscribe(&[topic])
            .map_err(|err| BusError::Fetch(err.to_string()))?;

        tracing::info!(topic, group, "kafka consumer subscribed");
        Ok(Self {
            consumer,
            topic: topic.to_string(),
        })
    }
}

#[async_trait]
impl TopicConsumer for KafkaConsumer {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn fetch(&mut self, timeout: Duration) -> Result<Option<BusMessage>, BusError> {
        let received = match tokio::time::timeout(timeout, self.consumer.recv()).await {
            Err(_) => return Ok(None),
            Ok(received) => received.map_err(|err| BusError::Fetch(err.to_string()))?,
        };

        Ok(Some(BusMessage {
            topic: received.topic().to_string(),
            partition: received.partition(),
            offset: received.offset(),
            key: received
                .key()
                .map(|key| String::from_utf8_lossy(key).into_owned()),
            payload: received.payload().unwrap_or_default().to_vec(),
        }))
    }

    async fn commit(&mut self, message: &BusMessage) -> Result<(), BusError> {
        let mut offsets = TopicPartitionList::new();
        offsets
            .add_partition_offset(
                &message.topic,
                message.partition,
                Offset::Offset(message.offset + 1),
            )
            .map_err(|err| BusError::Commit(err.to_string()))?;

        self.consumer
            .commit(&offsets, CommitMode::Async)
            .map_err(|err| BusError::Commit(err.to_string()))
    }
}
