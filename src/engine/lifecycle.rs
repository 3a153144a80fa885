//! Booking state machine.
//!
//! `none -> pending -> enroute_to_pickup -> in_progress -> completed | cancelled`
//!
//! The pending store's atomic take decides which operator wins an accept;
//! the booking store's conditional update decides which status change wins.
//! Every applied change is followed by a lifecycle event through the router.

use std::sync::Arc;

use chrono::Utc;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};
use uuid::Uuid;

use crate::auth::{Identity, Role};
use crate::engine::matching::Matcher;
use crate::engine::retry::{retry_transient, RetryPolicy};
use crate::error::AppError;
use crate::models::booking::{
    Booking, BookingStatus, CurrentBooking, NewBooking, NewBookingRequest, PendingRequest,
};
use crate::models::event::{LifecycleEvent, LifecycleStatus};
use crate::observability::metrics::Metrics;
use crate::realtime::router::NotificationRouter;
use crate::store::{BookingStore, PendingRequestStore};

pub struct BookingLifecycle {
    pending: Arc<dyn PendingRequestStore>,
    bookings: Arc<dyn BookingStore>,
    matcher: Arc<Matcher>,
    router: Arc<NotificationRouter>,
    tasks: TaskTracker,
    retry: RetryPolicy,
    metrics: Metrics,
}

impl BookingLifecycle {
    pub fn new(
        pending: Arc<dyn PendingRequestStore>,
        bookings: Arc<dyn BookingStore>,
        matcher: Arc<Matcher>,
        router: Arc<NotificationRouter>,
        tasks: TaskTracker,
        metrics: Metrics,
    ) -> Self {
        Self {
            pending,
            bookings,
            matcher,
            router,
            tasks,
            retry: RetryPolicy::default(),
            metrics,
        }
    }

    /// Stores a pending request and starts matching in the background.
    pub async fn create_request(
        &self,
        requester: &Identity,
        body: NewBookingRequest,
    ) -> Result<PendingRequest, AppError> {
        requester.require(Role::Requester)?;
        validate_request(&body)?;

        let request = PendingRequest {
            pending_id: Uuid::new_v4(),
            requester_id: requester.party_id.clone(),
            requester_name: requester.name.clone(),
            pickup: body.pickup,
            dropoff: body.dropoff,
            vehicle_class: body.vehicle_class.trim().to_string(),
            price: body.price,
            created_at: Utc::now(),
        };

        self.pending.insert(request.clone()).await?;
        info!(
            pending_id = %request.pending_id,
            requester_id = %request.requester_id,
            vehicle_class = %request.vehicle_class,
            "pending request created"
        );

        let matcher = self.matcher.clone();
        let background = request.clone();
        self.tasks.spawn(async move {
            matcher.match_and_notify(background).await;
        });

        Ok(request)
    }

    pub async fn accept_request(
        &self,
        operator: &Identity,
        pending_id: Uuid,
    ) -> Result<Booking, AppError> {
        operator.require(Role::Operator)?;

        let request = self.pending.take(pending_id).await?.ok_or_else(|| {
            AppError::NotFound("pending request already matched or expired".to_string())
        })?;

        let new = NewBooking::accept(&request, &operator.party_id, &operator.name);
        let booking = match self.bookings.insert(new).await {
            Ok(booking) => booking,
            Err(err) => {
                warn!(%pending_id, error = %err, "booking insert failed, restoring pending request");
                if let Err(restore_err) = self.pending.insert(request).await {
                    warn!(%pending_id, error = %restore_err, "failed to restore pending request");
                }
                return Err(err.into());
            }
        };

        info!(
            booking_id = booking.id,
            %pending_id,
            requester_id = %booking.requester_id,
            operator_id = %booking.operator_id,
            "booking accepted"
        );

        self.emit(&booking, LifecycleStatus::Booked).await;
        Ok(booking)
    }

    pub async fn update_status(
        &self,
        operator: &Identity,
        requester_id: &str,
        next: BookingStatus,
    ) -> Result<Booking, AppError> {
        operator.require(Role::Operator)?;

        if next.allowed_predecessors().is_empty() {
            return Err(AppError::Validation(format!(
                "status {next} cannot be set directly"
            )));
        }

        let booking = self
            .bookings
            .transition(requester_id, &operator.party_id, next)
            .await?
            .ok_or_else(|| {
                AppError::NotFound("booking not found or already terminal".to_string())
            })?;

        info!(
            booking_id = booking.id,
            requester_id,
            operator_id = %operator.party_id,
            status = %next,
            "booking status updated"
        );

        self.emit(&booking, next.into()).await;
        Ok(booking)
    }

    /// An outstanding pending request takes precedence over the durable store.
    pub async fn current_for_requester(
        &self,
        requester: &Identity,
    ) -> Result<CurrentBooking, AppError> {
        requester.require(Role::Requester)?;
        let party_id = requester.party_id.as_str();

        let pending = retry_transient(self.retry, "pending_by_requester", || {
            self.pending.find_by_requester(party_id)
        })
        .await?;
        if let Some(pending) = pending {
            return Ok(CurrentBooking::Pending(pending));
        }

        retry_transient(self.retry, "current_for_requester", || {
            self.bookings.current_for_requester(party_id)
        })
        .await?
        .map(CurrentBooking::Booked)
        .ok_or_else(|| AppError::NotFound("no active booking".to_string()))
    }

    pub async fn current_for_operator(&self, operator: &Identity) -> Result<Booking, AppError> {
        operator.require(Role::Operator)?;
        let party_id = operator.party_id.as_str();

        retry_transient(self.retry, "current_for_operator", || {
            self.bookings.current_for_operator(party_id)
        })
        .await?
        .ok_or_else(|| AppError::NotFound("no active booking".to_string()))
    }

    /// Sweeps pending requests nobody accepted before their TTL.
    pub async fn purge_expired_pending(&self) -> usize {
        match self.pending.purge_expired().await {
            Ok(0) => 0,
            Ok(purged) => {
                info!(purged, "expired pending requests purged");
                purged
            }
            Err(err) => {
                warn!(error = %err, "pending request purge failed");
                0
            }
        }
    }

    pub async fn history(&self, party: &Identity, role: Role) -> Result<Vec<Booking>, AppError> {
        party.require(role)?;
        let party_id = party.party_id.as_str();

        let history = retry_transient(self.retry, "booking_history", || match role {
            Role::Requester => self.bookings.history_for_requester(party_id),
            Role::Operator => self.bookings.history_for_operator(party_id),
        })
        .await?;

        if history.is_empty() {
            return Err(AppError::NotFound("no bookings found".to_string()));
        }
        Ok(history)
    }

    async fn emit(&self, booking: &Booking, status: LifecycleStatus) {
        self.metrics
            .booking_transitions_total
            .with_label_values(&[status_label(status)])
            .inc();

        self.router
            .emit_lifecycle(LifecycleEvent {
                requester_id: booking.requester_id.clone(),
                operator_id: booking.operator_id.clone(),
                operator_name: booking.operator_name.clone(),
                status,
            })
            .await;
    }
}

fn validate_request(body: &NewBookingRequest) -> Result<(), AppError> {
    body.pickup
        .validate()
        .map_err(|err| AppError::Validation(format!("pickup: {err}")))?;
    body.dropoff
        .validate()
        .map_err(|err| AppError::Validation(format!("dropoff: {err}")))?;

    if body.vehicle_class.trim().is_empty() {
        return Err(AppError::Validation("vehicle_class is required".to_string()));
    }
    if !body.price.is_finite() || body.price < 0.0 {
        return Err(AppError::Validation("price must be a non-negative number".to_string()));
    }
    Ok(())
}

fn status_label(status: LifecycleStatus) -> &'static str {
    match status {
        LifecycleStatus::Booked => "booked",
        LifecycleStatus::EnrouteToPickup => "enroute_to_pickup",
        LifecycleStatus::InProgress => "in_progress",
        LifecycleStatus::Completed => "completed",
        LifecycleStatus::Cancelled => "cancelled",
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio_util::task::TaskTracker;
    use uuid::Uuid;

    use super::BookingLifecycle;
    use crate::auth::{Identity, Role};
    use crate::bus;
    use crate::bus::memory::InMemoryBroker;
    use crate::engine::matching::Matcher;
    use crate::error::AppError;
    use crate::geo::index::GeoIndex;
    use crate::geo::GeoPoint;
    use crate::models::booking::{
        Booking, BookingStatus, CurrentBooking, NewBooking, NewBookingRequest,
    };
    use crate::models::event::LifecycleEvent;
    use crate::observability::metrics::Metrics;
    use crate::realtime::registry::ConnectionRegistry;
    use crate::realtime::router::NotificationRouter;
    use crate::store::memory::{
        InMemoryBookingStore, InMemoryOperatorDirectory, InMemoryPendingStore,
        InMemoryVehicleClassCache,
    };
    use crate::store::{BookingStore, PendingRequestStore, StoreError};

    struct Harness {
        lifecycle: Arc<BookingLifecycle>,
        pending: Arc<InMemoryPendingStore>,
        broker: InMemoryBroker,
        registry: Arc<ConnectionRegistry>,
    }

    fn harness_with(bookings: Arc<dyn BookingStore>) -> Harness {
        let broker = InMemoryBroker::new();
        let registry = Arc::new(ConnectionRegistry::new(8));
        let locations = Arc::new(GeoIndex::new(0.25));
        let pending = Arc::new(InMemoryPendingStore::new(Duration::from_secs(600)));
        let metrics = Metrics::new();
        let router = Arc::new(NotificationRouter::new(
            registry.clone(),
            Arc::new(broker.clone()),
            locations.clone(),
            metrics.clone(),
        ));
        let matcher = Arc::new(Matcher::new(
            locations,
            Arc::new(InMemoryOperatorDirectory::new()),
            Arc::new(InMemoryVehicleClassCache::new()),
            router.clone(),
            100.0,
            Duration::from_secs(3600),
            4,
            metrics.clone(),
        ));
        let lifecycle = Arc::new(BookingLifecycle::new(
            pending.clone(),
            bookings,
            matcher,
            router,
            TaskTracker::new(),
            metrics,
        ));

        Harness {
            lifecycle,
            pending,
            broker,
            registry,
        }
    }

    fn harness() -> Harness {
        harness_with(Arc::new(InMemoryBookingStore::new()))
    }

    fn requester() -> Identity {
        Identity {
            party_id: "u1".into(),
            name: "Uma".into(),
            role: Role::Requester,
        }
    }

    fn operator(id: &str) -> Identity {
        Identity {
            party_id: id.into(),
            name: format!("Operator {id}"),
            role: Role::Operator,
        }
    }

    fn body() -> NewBookingRequest {
        NewBookingRequest {
            pickup: GeoPoint::labelled(1.0, 1.0, "Depot"),
            dropoff: GeoPoint::labelled(1.1, 1.1, "Harbour"),
            vehicle_class: "van".into(),
            price: 42.5,
        }
    }

    #[tokio::test]
    async fn create_rejects_bad_input_and_wrong_role() {
        let h = harness();

        let mut out_of_range = body();
        out_of_range.pickup = GeoPoint::new(91.0, 0.0);
        assert!(matches!(
            h.lifecycle.create_request(&requester(), out_of_range).await,
            Err(AppError::Validation(_))
        ));

        let mut negative = body();
        negative.price = -1.0;
        assert!(matches!(
            h.lifecycle.create_request(&requester(), negative).await,
            Err(AppError::Validation(_))
        ));

        assert!(matches!(
            h.lifecycle.create_request(&operator("d1"), body()).await,
            Err(AppError::Unauthorized(_))
        ));
        assert!(h.pending.is_empty());
    }

    #[tokio::test]
    async fn accept_moves_pending_into_bookings_and_emits_booked() {
        let h = harness();
        let pending = h.lifecycle.create_request(&requester(), body()).await.unwrap();

        let booking = h
            .lifecycle
            .accept_request(&operator("d1"), pending.pending_id)
            .await
            .unwrap();

        assert_eq!(booking.status, BookingStatus::EnrouteToPickup);
        assert_eq!(booking.requester_name, "Uma");
        assert_eq!(booking.operator_name, "Operator d1");
        assert_eq!(booking.pickup.label.as_deref(), Some("Depot"));
        assert!(h.pending.get(pending.pending_id).await.unwrap().is_none());
        assert_eq!(h.registry.trip_requester("d1").as_deref(), Some("u1"));

        let published = h.broker.messages(bus::BOOKING_NOTIFICATIONS).await;
        let event: LifecycleEvent = serde_json::from_slice(&published[0].payload).unwrap();
        assert_eq!(event.status, crate::models::event::LifecycleStatus::Booked);
        assert_eq!(event.operator_id, "d1");

        let current = h.lifecycle.current_for_requester(&requester()).await.unwrap();
        assert!(matches!(current, CurrentBooking::Booked(b) if b.id == booking.id));
    }

    #[tokio::test]
    async fn double_accept_has_one_winner() {
        let h = harness();
        let pending = h.lifecycle.create_request(&requester(), body()).await.unwrap();

        let first = h.lifecycle.clone();
        let second = h.lifecycle.clone();
        let id = pending.pending_id;
        let (a, b) = tokio::join!(
            async move { first.accept_request(&operator("d1"), id).await },
            async move { second.accept_request(&operator("d2"), id).await },
        );

        let outcomes = [a.is_ok(), b.is_ok()];
        assert_eq!(outcomes.iter().filter(|ok| **ok).count(), 1);
        let loser = if a.is_err() { a } else { b };
        assert!(matches!(loser, Err(AppError::NotFound(_))));
    }

    #[tokio::test]
    async fn pending_request_is_current_until_accepted() {
        let h = harness();
        assert!(matches!(
            h.lifecycle.current_for_requester(&requester()).await,
            Err(AppError::NotFound(_))
        ));

        let pending = h.lifecycle.create_request(&requester(), body()).await.unwrap();
        let current = h.lifecycle.current_for_requester(&requester()).await.unwrap();
        assert_eq!(current, CurrentBooking::Pending(pending));
    }

    #[tokio::test]
    async fn status_updates_follow_the_state_machine() {
        let h = harness();
        let pending = h.lifecycle.create_request(&requester(), body()).await.unwrap();
        h.lifecycle
            .accept_request(&operator("d1"), pending.pending_id)
            .await
            .unwrap();

        assert!(matches!(
            h.lifecycle
                .update_status(&operator("d1"), "u1", BookingStatus::EnrouteToPickup)
                .await,
            Err(AppError::Validation(_))
        ));
        assert!(matches!(
            h.lifecycle
                .update_status(&operator("d2"), "u1", BookingStatus::InProgress)
                .await,
            Err(AppError::NotFound(_))
        ));

        let moving = h
            .lifecycle
            .update_status(&operator("d1"), "u1", BookingStatus::InProgress)
            .await
            .unwrap();
        assert_eq!(moving.status, BookingStatus::InProgress);

        let done = h
            .lifecycle
            .update_status(&operator("d1"), "u1", BookingStatus::Completed)
            .await
            .unwrap();
        assert!(done.completed_at.is_some());
        assert_eq!(h.registry.trip_requester("d1"), None);

        assert!(matches!(
            h.lifecycle
                .update_status(&operator("d1"), "u1", BookingStatus::Cancelled)
                .await,
            Err(AppError::NotFound(_))
        ));

        let history = h.lifecycle.history(&operator("d1"), Role::Operator).await.unwrap();
        assert_eq!(history.len(), 1);
        assert!(matches!(
            h.lifecycle.history(&operator("d9"), Role::Operator).await,
            Err(AppError::NotFound(_))
        ));
    }

    struct FailingBookings;

    #[async_trait]
    impl BookingStore for FailingBookings {
        async fn insert(&self, _booking: NewBooking) -> Result<Booking, StoreError> {
            Err(StoreError::Backend("disk full".into()))
        }

        async fn transition(
            &self,
            _requester_id: &str,
            _operator_id: &str,
            _next: BookingStatus,
        ) -> Result<Option<Booking>, StoreError> {
            Ok(None)
        }

        async fn current_for_requester(&self, _: &str) -> Result<Option<Booking>, StoreError> {
            Err(StoreError::Unavailable("timeout".into()))
        }

        async fn current_for_operator(&self, _: &str) -> Result<Option<Booking>, StoreError> {
            Ok(None)
        }

        async fn history_for_requester(&self, _: &str) -> Result<Vec<Booking>, StoreError> {
            Ok(Vec::new())
        }

        async fn history_for_operator(&self, _: &str) -> Result<Vec<Booking>, StoreError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn failed_insert_restores_pending_request() {
        let h = harness_with(Arc::new(FailingBookings));
        let pending = h.lifecycle.create_request(&requester(), body()).await.unwrap();

        let err = h
            .lifecycle
            .accept_request(&operator("d1"), pending.pending_id)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Store(_)));
        assert!(h.pending.get(pending.pending_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn unknown_pending_id_is_not_found() {
        let h = harness();
        assert!(matches!(
            h.lifecycle.accept_request(&operator("d1"), Uuid::new_v4()).await,
            Err(AppError::NotFound(_))
        ));
    }
}
