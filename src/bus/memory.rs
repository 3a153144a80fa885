//! Single-process broker with Kafka-like offsets: every topic is an append-only
//! log, every consumer group keeps a committed offset per topic, and a new
//! consumer resumes from its group's committed offset.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{Notify, RwLock};
use tokio::time::Instant;

use crate::bus::{BusError, BusMessage, EventPublisher, TopicConsumer};

#[derive(Default)]
struct TopicLog {
    messages: RwLock<Vec<BusMessage>>,
    appended: Notify,
}

impl TopicLog {
    async fn read(&self, offset: i64) -> Option<BusMessage> {
        let messages = self.messages.read().await;
        usize::try_from(offset)
            .ok()
            .and_then(|index| messages.get(index))
            .cloned()
    }
}

#[derive(Default)]
struct Inner {
    topics: DashMap<String, Arc<TopicLog>>,
    committed: DashMap<(String, String), i64>,
}

#[derive(Clone, Default)]
pub struct InMemoryBroker {
    inner: Arc<Inner>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn log(&self, topic: &str) -> Arc<TopicLog> {
        self.inner
            .topics
            .entry(topic.to_string())
            .or_default()
            .value()
            .clone()
    }

    /// Joins `group` on `topic`, starting after the group's last commit.
    pub fn consumer(&self, group: &str, topic: &str) -> InMemoryConsumer {
        let position = self
            .inner
            .committed
            .get(&(group.to_string(), topic.to_string()))
            .map(|entry| *entry.value())
            .unwrap_or(0);

        InMemoryConsumer {
            broker: self.clone(),
            log: self.log(topic),
            group: group.to_string(),
            topic: topic.to_string(),
            position,
        }
    }

    /// Snapshot of everything published to `topic`.
    pub async fn messages(&self, topic: &str) -> Vec<BusMessage> {
        self.log(topic).messages.read().await.clone()
    }

    pub fn committed_offset(&self, group: &str, topic: &str) -> Option<i64> {
        self.inner
            .committed
            .get(&(group.to_string(), topic.to_string()))
            .map(|entry| *entry.value())
    }
}

#[async_trait]
impl EventPublisher for InMemoryBroker {
    async fn publish(&self, topic: &str, key: &str, payload: Vec<u8>) -> Result<(), BusError> {
        let log = self.log(topic);
        {
            let mut messages = log.messages.write().await;
            let offset = messages.len() as i64;
            messages.push(BusMessage {
                topic: topic.to_string(),
                partition: 0,
                offset,
                key: Some(key.to_string()),
                payload,
            });
        }
        log.appended.notify_waiters();
        Ok(())
    }
}

pub struct InMemoryConsumer {
    broker: InMemoryBroker,
    log: Arc<TopicLog>,
    group: String,
    topic: String,
    position: i64,
}

#[async_trait]
impl TopicConsumer for InMemoryConsumer {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn fetch(&mut self, timeout: Duration) -> Result<Option<BusMessage>, BusError> {
        let deadline = Instant::now() + timeout;
        loop {
            let appended = self.log.appended.notified();
            tokio::pin!(appended);
            appended.as_mut().enable();

            if let Some(message) = self.log.read(self.position).await {
                self.position += 1;
                return Ok(Some(message));
            }

            if tokio::time::timeout_at(deadline, appended).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn commit(&mut self, message: &BusMessage) -> Result<(), BusError> {
        let next = message.offset + 1;
        self.broker
            .inner
            .committed
            .entry((self.group.clone(), self.topic.clone()))
            .and_modify(|committed| *committed = (*committed).max(next))
            .or_insert(next);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::InMemoryBroker;
    use crate::bus::{EventPublisher, TopicConsumer};

    #[tokio::test]
    async fn empty_topic_times_out_with_none() {
        let broker = InMemoryBroker::new();
        let mut consumer = broker.consumer("g", "t");
        let fetched = consumer.fetch(Duration::from_millis(20)).await.unwrap();
        assert!(fetched.is_none());
    }

    #[tokio::test]
    async fn waiting_fetch_wakes_on_publish() {
        let broker = InMemoryBroker::new();
        let mut consumer = broker.consumer("g", "t");

        let publisher = broker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            publisher.publish("t", "k", b"hello".to_vec()).await.unwrap();
        });

        let message = consumer
            .fetch(Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message.payload, b"hello");
        assert_eq!(message.offset, 0);
    }

    #[tokio::test]
    async fn uncommitted_messages_are_redelivered_to_the_next_member() {
        let broker = InMemoryBroker::new();
        for n in 0..3u8 {
            broker.publish("t", "k", vec![n]).await.unwrap();
        }

        let mut first = broker.consumer("g", "t");
        let m0 = first.fetch(Duration::from_millis(10)).await.unwrap().unwrap();
        first.commit(&m0).await.unwrap();
        let _m1 = first.fetch(Duration::from_millis(10)).await.unwrap().unwrap();
        drop(first);

        let mut second = broker.consumer("g", "t");
        let again = second.fetch(Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(again.payload, vec![1]);
        assert_eq!(broker.committed_offset("g", "t"), Some(1));
    }

    #[tokio::test]
    async fn groups_track_offsets_independently() {
        let broker = InMemoryBroker::new();
        broker.publish("t", "k", b"x".to_vec()).await.unwrap();

        let mut a = broker.consumer("a", "t");
        let message = a.fetch(Duration::from_millis(10)).await.unwrap().unwrap();
        a.commit(&message).await.unwrap();

        let mut b = broker.consumer("b", "t");
        assert!(b.fetch(Duration::from_millis(10)).await.unwrap().is_some());
    }
}
