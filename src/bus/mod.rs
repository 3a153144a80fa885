//! Durable event backbone.
//!
//! Three logical topics connect the relay, the lifecycle manager and the
//! location cache. Consumers commit only after their handler ran, so a crash
//! between delivery and commit redelivers the message.

pub mod memory;
#[cfg(feature = "kafka")]
pub mod kafka;

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

/// Booking offers for operators that were not connected to this instance.
pub const DRIVER_NOTIFICATION: &str = "driver-notification";
/// Operator positions, including the `(0, 0)` offline sentinel.
pub const DRIVER_LOCATIONS: &str = "driver-locations";
/// Lifecycle events for requesters.
pub const BOOKING_NOTIFICATIONS: &str = "booking-notifications";

#[derive(Debug, Error)]
pub enum BusError {
    #[error("publish to {topic} failed: {reason}")]
    Publish { topic: String, reason: String },

    #[error("fetch failed: {0}")]
    Fetch(String),

    #[error("commit failed: {0}")]
    Commit(String),

    #[error("payload serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq)]
pub struct BusMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
    pub payload: Vec<u8>,
}

#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, topic: &str, key: &str, payload: Vec<u8>) -> Result<(), BusError>;

    /// Flushes anything still buffered. Called once during shutdown.
    async fn close(&self) {}
}

/// JSON-encodes `value` and publishes it.
pub async fn publish_json<T>(
    publisher: &dyn EventPublisher,
    topic: &str,
    key: &str,
    value: &T,
) -> Result<(), BusError>
where
    T: Serialize + Sync,
{
    let payload = serde_json::to_vec(value)?;
    publisher.publish(topic, key, payload).await
}

/// One consumer-group member reading one topic.
#[async_trait]
pub trait TopicConsumer: Send {
    fn topic(&self) -> &str;

    /// `Ok(None)` means nothing arrived within `timeout`; transport problems
    /// are reported as `Err`.
    async fn fetch(&mut self, timeout: Duration) -> Result<Option<BusMessage>, BusError>;

    async fn commit(&mut self, message: &BusMessage) -> Result<(), BusError>;
}
