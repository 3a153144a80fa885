//! Bridges live channels and the durable topics.

use std::sync::Arc;

use dashmap::DashSet;

use crate::auth::Role;
use crate::bus::{self, EventPublisher};
use crate::geo::cache::LocationCache;
use crate::models::event::{LifecycleEvent, LifecycleStatus, OutboundFrame};
use crate::models::location::LiveLocation;
use crate::observability::metrics::Metrics;
use crate::realtime::registry::ConnectionRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Live,
    Published,
    Dropped,
}

impl Delivery {
    fn route(self) -> &'static str {
        match self {
            Delivery::Live => "live",
            Delivery::Published => "topic",
            Delivery::Dropped => "dropped",
        }
    }
}

/// Identifies one lifecycle event; each status is reached at most once per
/// booking.
type EventKey = (String, String, LifecycleStatus);

fn event_key(event: &LifecycleEvent) -> EventKey {
    (
        event.requester_id.clone(),
        event.operator_id.clone(),
        event.status,
    )
}

pub struct NotificationRouter {
    registry: Arc<ConnectionRegistry>,
    publisher: Arc<dyn EventPublisher>,
    locations: Arc<dyn LocationCache>,
    metrics: Metrics,
    /// Events already delivered live here whose topic echo is still due.
    sent_live: DashSet<EventKey>,
}

impl NotificationRouter {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        publisher: Arc<dyn EventPublisher>,
        locations: Arc<dyn LocationCache>,
        metrics: Metrics,
    ) -> Self {
        Self {
            registry,
            publisher,
            locations,
            metrics,
            sent_live: DashSet::new(),
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Live channel first, otherwise the role's topic. Never fails: a publish
    /// error is logged and reported as [`Delivery::Dropped`].
    pub async fn route_to_party(&self, party_id: &str, role: Role, frame: OutboundFrame) -> Delivery {
        let frame = match self.registry.try_send(role, party_id, frame) {
            Ok(()) => return self.record(Delivery::Live),
            Err(frame) => frame,
        };

        let published = match (role, &frame) {
            (Role::Operator, OutboundFrame::BookingOffer(offer)) => {
                bus::publish_json(
                    self.publisher.as_ref(),
                    bus::DRIVER_NOTIFICATION,
                    party_id,
                    offer,
                )
                .await
            }
            (Role::Requester, OutboundFrame::Lifecycle(event)) => {
                bus::publish_json(
                    self.publisher.as_ref(),
                    bus::BOOKING_NOTIFICATIONS,
                    party_id,
                    event,
                )
                .await
            }
            _ => {
                tracing::debug!(party_id, %role, "no topic for frame, dropped");
                return self.record(Delivery::Dropped);
            }
        };

        match published {
            Ok(()) => self.record(Delivery::Published),
            Err(err) => {
                tracing::warn!(party_id, %role, error = %err, "fallback publish failed");
                self.record(Delivery::Dropped)
            }
        }
    }

    /// Inbound path for consumed messages: live channel or nothing.
    pub fn deliver_live(&self, party_id: &str, role: Role, frame: OutboundFrame) -> Delivery {
        match self.registry.try_send(role, party_id, frame) {
            Ok(()) => self.record(Delivery::Live),
            Err(_) => {
                tracing::debug!(party_id, %role, "party not connected here, event dropped");
                self.record(Delivery::Dropped)
            }
        }
    }

    /// Idempotent reactions every instance applies when it sees a lifecycle
    /// event, whether emitted locally or consumed from the topic.
    pub async fn observe_lifecycle(&self, event: &LifecycleEvent) {
        if event.status == LifecycleStatus::Booked {
            self.registry.pair(&event.operator_id, &event.requester_id);
            if let Err(err) = self.locations.remove(&event.operator_id).await {
                tracing::warn!(
                    operator_id = %event.operator_id,
                    error = %err,
                    "failed to evict booked operator from location cache"
                );
            }
        } else if event.status.is_terminal() {
            self.registry.unpair(&event.operator_id, &event.requester_id);
        }
    }

    /// Applies the event locally, delivers it live when the requester is
    /// connected here, and always publishes it so every other instance can
    /// apply the same reactions.
    pub async fn emit_lifecycle(&self, event: LifecycleEvent) -> Delivery {
        self.observe_lifecycle(&event).await;

        let key = event_key(&event);
        let live = self
            .registry
            .try_send(
                Role::Requester,
                &event.requester_id,
                OutboundFrame::Lifecycle(event.clone()),
            )
            .is_ok();
        if live {
            self.sent_live.insert(key.clone());
        }

        let published = bus::publish_json(
            self.publisher.as_ref(),
            bus::BOOKING_NOTIFICATIONS,
            &event.requester_id,
            &event,
        )
        .await;

        if let Err(err) = &published {
            self.sent_live.remove(&key);
            tracing::warn!(
                requester_id = %event.requester_id,
                status = ?event.status,
                error = %err,
                "lifecycle publish failed"
            );
        }

        match (live, published.is_ok()) {
            (true, _) => self.record(Delivery::Live),
            (false, true) => self.record(Delivery::Published),
            (false, false) => self.record(Delivery::Dropped),
        }
    }

    /// Consumed lifecycle events: apply the reactions, then deliver live
    /// unless this instance already did when it emitted the event.
    pub async fn relay_lifecycle(&self, event: LifecycleEvent) -> Delivery {
        self.observe_lifecycle(&event).await;
        if self.sent_live.remove(&event_key(&event)).is_some() {
            return Delivery::Live;
        }

        let requester_id = event.requester_id.clone();
        self.deliver_live(&requester_id, Role::Requester, OutboundFrame::Lifecycle(event))
    }

    /// Position reported by a connected operator.
    pub async fn relay_location(&self, location: LiveLocation) -> Delivery {
        if !location.is_offline() {
            if let Some(requester_id) = self.registry.trip_requester(&location.operator_id) {
                return self.deliver_live(
                    &requester_id,
                    Role::Requester,
                    OutboundFrame::Location(location),
                );
            }
        }

        let published = bus::publish_json(
            self.publisher.as_ref(),
            bus::DRIVER_LOCATIONS,
            &location.operator_id,
            &location,
        )
        .await;

        match published {
            Ok(()) => self.record(Delivery::Published),
            Err(err) => {
                tracing::warn!(
                    operator_id = %location.operator_id,
                    error = %err,
                    "location publish failed, applying to local cache"
                );
                if let Err(err) = self.locations.apply(location).await {
                    tracing::warn!(error = %err, "local location apply failed");
                }
                self.record(Delivery::Dropped)
            }
        }
    }

    /// Synthetic `(0, 0)` position so the location consumer evicts the operator.
    pub async fn operator_offline(&self, operator_id: &str) -> Delivery {
        self.relay_location(LiveLocation::offline(operator_id)).await
    }

    fn record(&self, delivery: Delivery) -> Delivery {
        self.metrics
            .deliveries_total
            .with_label_values(&[delivery.route()])
            .inc();
        delivery
    }
}
