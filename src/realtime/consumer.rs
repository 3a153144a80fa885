//! Long-lived topic consumers. Each loop fetches with a timeout, runs its
//! handler and commits afterwards, giving at-least-once delivery. Payloads
//! that fail to decode are logged and committed so one bad message cannot
//! stall the group.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::auth::Role;
use crate::bus::{BusError, BusMessage, TopicConsumer};
use crate::geo::cache::LocationCache;
use crate::models::event::{BookingOffer, LifecycleEvent, OutboundFrame};
use crate::models::location::LiveLocation;
use crate::observability::metrics::Metrics;
use crate::realtime::router::NotificationRouter;

#[derive(Debug, thiserror::Error)]
pub enum HandleError {
    #[error("malformed payload: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("{0}")]
    Failed(String),
}

#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &BusMessage) -> Result<(), HandleError>;
}

/// `driver-notification`: offers for operators connected to this instance.
pub struct OfferRelay {
    pub router: Arc<NotificationRouter>,
}

#[async_trait]
impl MessageHandler for OfferRelay {
    async fn handle(&self, message: &BusMessage) -> Result<(), HandleError> {
        let offer: BookingOffer = serde_json::from_slice(&message.payload)?;
        let operator_id = offer.operator_id.clone();
        self.router
            .deliver_live(&operator_id, Role::Operator, OutboundFrame::BookingOffer(offer));
        Ok(())
    }
}

/// `booking-notifications`: same reactions as a locally emitted event, then
/// live delivery to the requester unless this instance already delivered it.
pub struct LifecycleRelay {
    pub router: Arc<NotificationRouter>,
}

#[async_trait]
impl MessageHandler for LifecycleRelay {
    async fn handle(&self, message: &BusMessage) -> Result<(), HandleError> {
        let event: LifecycleEvent = serde_json::from_slice(&message.payload)?;
        self.router.relay_lifecycle(event).await;
        Ok(())
    }
}

/// `driver-locations`: keeps the location cache current.
pub struct LocationSink {
    pub locations: Arc<dyn LocationCache>,
}

#[async_trait]
impl MessageHandler for LocationSink {
    async fn handle(&self, message: &BusMessage) -> Result<(), HandleError> {
        let mut location: LiveLocation = serde_json::from_slice(&message.payload)?;
        if location.operator_id.is_empty() {
            location.operator_id = message.key.clone().unwrap_or_default();
        }
        if location.operator_id.is_empty() {
            return Err(HandleError::Failed("location without operator id".to_string()));
        }

        self.locations
            .apply(location)
            .await
            .map_err(|err| HandleError::Failed(err.to_string()))
    }
}

pub struct ConsumerLoop {
    pub consumer: Box<dyn TopicConsumer>,
    pub handler: Arc<dyn MessageHandler>,
    pub fetch_timeout: Duration,
    pub idle_backoff: Duration,
    pub metrics: Metrics,
}

impl ConsumerLoop {
    pub async fn run(mut self, shutdown: CancellationToken) {
        let topic = self.consumer.topic().to_string();
        tracing::info!(topic = %topic, "consumer started");

        loop {
            let fetched = tokio::select! {
                _ = shutdown.cancelled() => break,
                fetched = self.consumer.fetch(self.fetch_timeout) => fetched,
            };

            match fetched {
                Ok(Some(message)) => self.process(&topic, message).await,
                Ok(None) => {
                    if pause(self.idle_backoff, &shutdown).await {
                        break;
                    }
                }
                Err(err) => {
                    tracing::warn!(topic = %topic, error = %err, "fetch failed, retrying");
                    self.count(&topic, "fetch_error");
                    if pause(self.idle_backoff, &shutdown).await {
                        break;
                    }
                }
            }
        }

        tracing::info!(topic = %topic, "consumer stopped");
    }

    async fn process(&mut self, topic: &str, message: BusMessage) {
        match self.handler.handle(&message).await {
            Ok(()) => self.count(topic, "handled"),
            Err(HandleError::Malformed(err)) => {
                tracing::warn!(topic, offset = message.offset, error = %err, "skipping malformed message");
                self.count(topic, "skipped");
            }
            Err(err) => {
                tracing::warn!(topic, offset = message.offset, error = %err, "handler failed");
                self.count(topic, "failed");
            }
        }

        if let Err(err) = self.consumer.commit(&message).await {
            log_commit_failure(topic, &message, &err);
        }
    }

    fn count(&self, topic: &str, outcome: &str) {
        self.metrics
            .consumer_messages_total
            .with_label_values(&[topic, outcome])
            .inc();
    }
}

/// Returns true when shutdown was requested during the pause.
async fn pause(backoff: Duration, shutdown: &CancellationToken) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => true,
        _ = tokio::time::sleep(backoff) => false,
    }
}

fn log_commit_failure(topic: &str, message: &BusMessage, err: &BusError) {
    tracing::warn!(
        topic,
        offset = message.offset,
        error = %err,
        "offset commit failed, message may be redelivered"
    );
}
