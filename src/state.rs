//! The dispatch server: one value owning every registry, store handle and
//! background task of the process. Built once at startup, drained once at
//! shutdown.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use crate::auth::Authenticator;
use crate::backends::{close_all, Backends, Closer, ConsumerFactory};
use crate::bus::{self, BusError};
use crate::config::DispatchSettings;
use crate::engine::lifecycle::BookingLifecycle;
use crate::engine::matching::Matcher;
use crate::geo::cache::LocationCache;
use crate::observability::metrics::Metrics;
use crate::realtime::consumer::{
    ConsumerLoop, LifecycleRelay, LocationSink, MessageHandler, OfferRelay,
};
use crate::realtime::registry::ConnectionRegistry;
use crate::realtime::router::NotificationRouter;

pub struct AppState {
    pub settings: DispatchSettings,
    pub registry: Arc<ConnectionRegistry>,
    pub router: Arc<NotificationRouter>,
    pub lifecycle: Arc<BookingLifecycle>,
    pub locations: Arc<dyn LocationCache>,
    pub authenticator: Arc<dyn Authenticator>,
    pub metrics: Metrics,
    pub shutdown: CancellationToken,
    pub tasks: TaskTracker,
    consumers: ConsumerFactory,
    closers: Mutex<Vec<Closer>>,
}

impl AppState {
    pub fn new(
        settings: DispatchSettings,
        backends: Backends,
        authenticator: Arc<dyn Authenticator>,
    ) -> Self {
        let metrics = Metrics::new();
        let tasks = TaskTracker::new();
        let registry = Arc::new(ConnectionRegistry::new(settings.outbound_buffer));

        let router = Arc::new(NotificationRouter::new(
            registry.clone(),
            backends.publisher.clone(),
            backends.locations.clone(),
            metrics.clone(),
        ));

        let matcher = Arc::new(Matcher::new(
            backends.locations.clone(),
            backends.directory,
            backends.class_cache,
            router.clone(),
            settings.match_radius_km,
            settings.vehicle_class_ttl,
            settings.fan_out_concurrency,
            metrics.clone(),
        ));

        let lifecycle = Arc::new(BookingLifecycle::new(
            backends.pending,
            backends.bookings,
            matcher,
            router.clone(),
            tasks.clone(),
            metrics.clone(),
        ));

        Self {
            settings,
            registry,
            router,
            lifecycle,
            locations: backends.locations,
            authenticator,
            metrics,
            shutdown: CancellationToken::new(),
            tasks,
            consumers: backends.consumers,
            closers: Mutex::new(backends.closers),
        }
    }

    /// Starts the three topic consumers on the task tracker.
    pub fn start_consumers(&self) -> Result<(), BusError> {
        let notification_group = self.settings.notification_group.as_str();
        let location_group = self.settings.location_group.as_str();

        let plan: [(&str, &str, Arc<dyn MessageHandler>); 3] = [
            (
                notification_group,
                bus::DRIVER_NOTIFICATION,
                Arc::new(OfferRelay {
                    router: self.router.clone(),
                }),
            ),
            (
                notification_group,
                bus::BOOKING_NOTIFICATIONS,
                Arc::new(LifecycleRelay {
                    router: self.router.clone(),
                }),
            ),
            (
                location_group,
                bus::DRIVER_LOCATIONS,
                Arc::new(LocationSink {
                    locations: self.locations.clone(),
                }),
            ),
        ];

        for (group, topic, handler) in plan {
            let consumer = ConsumerLoop {
                consumer: (self.consumers)(group, topic)?,
                handler,
                fetch_timeout: self.settings.consumer_fetch_timeout,
                idle_backoff: self.settings.consumer_idle_backoff,
                metrics: self.metrics.clone(),
            };
            self.tasks.spawn(consumer.run(self.shutdown.clone()));
        }

        Ok(())
    }

    /// Periodically purges expired pending requests until shutdown.
    pub fn start_pending_sweeper(&self) {
        let lifecycle = self.lifecycle.clone();
        let shutdown = self.shutdown.clone();
        let period = self
            .settings
            .pending_ttl
            .max(Duration::from_secs(1));

        self.tasks.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        lifecycle.purge_expired_pending().await;
                    }
                }
            }
        });
    }

    /// Stops background work and releases transport resources. Waits for
    /// in-flight tasks at most `overall`, then gives each resource
    /// `per_resource` to close.
    pub async fn drain(&self, overall: Duration, per_resource: Duration) {
        self.shutdown.cancel();
        self.tasks.close();

        match tokio::time::timeout(overall, self.tasks.wait()).await {
            Ok(()) => info!("background tasks finished"),
            Err(_) => warn!(
                remaining = self.tasks.len(),
                timeout_secs = overall.as_secs(),
                "shutdown timed out waiting for background tasks"
            ),
        }

        let closers = std::mem::take(&mut *self.closers.lock().await);
        close_all(closers, per_resource).await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::Utc;
    use uuid::Uuid;

    use super::AppState;
    use crate::auth::JwtAuthenticator;
    use crate::backends::Backends;
    use crate::config::DispatchSettings;
    use crate::geo::GeoPoint;
    use crate::models::booking::PendingRequest;
    use crate::store::PendingRequestStore;

    #[tokio::test]
    async fn consumers_stop_on_drain() {
        let settings = DispatchSettings {
            consumer_fetch_timeout: Duration::from_millis(20),
            consumer_idle_backoff: Duration::from_millis(5),
            ..DispatchSettings::default()
        };
        let (backends, _) = Backends::in_memory(&settings, Vec::new());
        let state = AppState::new(settings, backends, Arc::new(JwtAuthenticator::hs256("s")));

        state.start_consumers().unwrap();
        assert_eq!(state.tasks.len(), 3);

        state
            .drain(Duration::from_secs(2), Duration::from_secs(1))
            .await;
        assert!(state.tasks.is_empty());
        assert!(state.shutdown.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_purges_expired_pending_requests() {
        let settings = DispatchSettings {
            pending_ttl: Duration::from_secs(60),
            ..DispatchSettings::default()
        };
        let (backends, memory) = Backends::in_memory(&settings, Vec::new());
        let state = AppState::new(settings, backends, Arc::new(JwtAuthenticator::hs256("s")));

        for requester in ["u1", "u2", "u3"] {
            memory
                .pending
                .insert(PendingRequest {
                    pending_id: Uuid::new_v4(),
                    requester_id: requester.to_string(),
                    requester_name: "Rae".to_string(),
                    pickup: GeoPoint::new(1.0, 1.0),
                    dropoff: GeoPoint::new(1.1, 1.1),
                    vehicle_class: "van".to_string(),
                    price: 10.0,
                    created_at: Utc::now() - chrono::Duration::seconds(120),
                })
                .await
                .unwrap();
        }

        state.start_pending_sweeper();
        for _ in 0..10 {
            if memory.pending.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(memory.pending.is_empty());

        state
            .drain(Duration::from_secs(2), Duration::from_secs(1))
            .await;
        assert!(state.tasks.is_empty());
    }
}
