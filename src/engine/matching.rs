use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::auth::Role;
use crate::engine::retry::{retry_transient, RetryPolicy};
use crate::geo::cache::LocationCache;
use crate::models::booking::PendingRequest;
use crate::models::event::{BookingOffer, OutboundFrame};
use crate::observability::metrics::Metrics;
use crate::realtime::router::{Delivery, NotificationRouter};
use crate::store::{OperatorDirectory, StoreError, VehicleClassCache};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FanOut {
    Live,
    Published,
    SkippedClass,
    Failed,
}

impl FanOut {
    fn label(self) -> &'static str {
        match self {
            FanOut::Live => "live",
            FanOut::Published => "published",
            FanOut::SkippedClass => "skipped_class",
            FanOut::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatchSummary {
    pub candidates: usize,
    pub live: usize,
    pub published: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl MatchSummary {
    fn record(&mut self, outcome: FanOut) {
        match outcome {
            FanOut::Live => self.live += 1,
            FanOut::Published => self.published += 1,
            FanOut::SkippedClass => self.skipped += 1,
            FanOut::Failed => self.failed += 1,
        }
    }

    pub fn notified(&self) -> usize {
        self.live + self.published
    }
}

pub struct Matcher {
    locations: Arc<dyn LocationCache>,
    directory: Arc<dyn OperatorDirectory>,
    class_cache: Arc<dyn VehicleClassCache>,
    router: Arc<NotificationRouter>,
    radius_km: f64,
    class_ttl: Duration,
    concurrency: usize,
    retry: RetryPolicy,
    metrics: Metrics,
}

impl Matcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        locations: Arc<dyn LocationCache>,
        directory: Arc<dyn OperatorDirectory>,
        class_cache: Arc<dyn VehicleClassCache>,
        router: Arc<NotificationRouter>,
        radius_km: f64,
        class_ttl: Duration,
        concurrency: usize,
        metrics: Metrics,
    ) -> Self {
        Self {
            locations,
            directory,
            class_cache,
            router,
            radius_km,
            class_ttl,
            concurrency: concurrency.max(1),
            retry: RetryPolicy::default(),
            metrics,
        }
    }

    /// Offers `request` to every live operator of the requested class within
    /// the match radius. Candidates are independent: one failing does not
    /// affect the others.
    pub async fn match_and_notify(self: &Arc<Self>, request: PendingRequest) -> MatchSummary {
        let started = Instant::now();
        let mut summary = MatchSummary::default();

        let nearby = retry_transient(self.retry, "query_radius", || {
            self.locations.query_radius(&request.pickup, self.radius_km)
        })
        .await;

        let nearby = match nearby {
            Ok(nearby) => nearby,
            Err(err) => {
                warn!(pending_id = %request.pending_id, error = %err, "radius query failed");
                return summary;
            }
        };
        summary.candidates = nearby.len();

        let request = Arc::new(request);
        let permits = Arc::new(Semaphore::new(self.concurrency));
        let mut fan_out = JoinSet::new();

        for candidate in nearby {
            let matcher = self.clone();
            let request = request.clone();
            let permits = permits.clone();

            fan_out.spawn(async move {
                let _permit = permits.acquire_owned().await;
                matcher.notify_candidate(&candidate.member_id, &request).await
            });
        }

        while let Some(joined) = fan_out.join_next().await {
            let outcome = match joined {
                Ok(outcome) => outcome,
                Err(err) => {
                    warn!(pending_id = %request.pending_id, error = %err, "fan-out task failed");
                    FanOut::Failed
                }
            };
            self.metrics
                .fan_out_total
                .with_label_values(&[outcome.label()])
                .inc();
            summary.record(outcome);
        }

        self.metrics
            .match_latency_seconds
            .observe(started.elapsed().as_secs_f64());

        info!(
            pending_id = %request.pending_id,
            candidates = summary.candidates,
            notified = summary.notified(),
            skipped = summary.skipped,
            failed = summary.failed,
            "fan-out finished"
        );

        summary
    }

    async fn notify_candidate(&self, operator_id: &str, request: &PendingRequest) -> FanOut {
        let class = match self.vehicle_class(operator_id).await {
            Ok(class) => class,
            Err(err) => {
                warn!(operator_id, error = %err, "vehicle class lookup failed");
                return FanOut::Failed;
            }
        };

        if class.as_deref() != Some(request.vehicle_class.as_str()) {
            return FanOut::SkippedClass;
        }

        let offer = OutboundFrame::BookingOffer(BookingOffer::for_operator(request, operator_id));
        match self.router.route_to_party(operator_id, Role::Operator, offer).await {
            Delivery::Live => FanOut::Live,
            Delivery::Published => FanOut::Published,
            Delivery::Dropped => FanOut::Failed,
        }
    }

    /// Cache-aside lookup. A cache failure degrades to a directory read.
    async fn vehicle_class(&self, operator_id: &str) -> Result<Option<String>, StoreError> {
        match self.class_cache.get(operator_id).await {
            Ok(Some(class)) => return Ok(Some(class)),
            Ok(None) => {}
            Err(err) => warn!(operator_id, error = %err, "vehicle class cache read failed"),
        }

        let class = retry_transient(self.retry, "operator_vehicle_class", || {
            self.directory.vehicle_class(operator_id)
        })
        .await?;

        if let Some(class) = &class {
            if let Err(err) = self.class_cache.put(operator_id, class, self.class_ttl).await {
                warn!(operator_id, error = %err, "vehicle class cache write failed");
            }
        }

        Ok(class)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::Utc;
    use uuid::Uuid;

    use super::{MatchSummary, Matcher};
    use crate::auth::Role;
    use crate::bus;
    use crate::bus::memory::InMemoryBroker;
    use crate::geo::index::GeoIndex;
    use crate::geo::GeoPoint;
    use crate::models::booking::PendingRequest;
    use crate::models::event::{BookingOffer, OutboundFrame};
    use crate::models::location::LiveLocation;
    use crate::observability::metrics::Metrics;
    use crate::realtime::registry::ConnectionRegistry;
    use crate::realtime::router::NotificationRouter;
    use crate::store::memory::{InMemoryOperatorDirectory, InMemoryVehicleClassCache};

    struct Fixture {
        matcher: Arc<Matcher>,
        registry: Arc<ConnectionRegistry>,
        locations: Arc<GeoIndex>,
        directory: Arc<InMemoryOperatorDirectory>,
        broker: InMemoryBroker,
    }

    fn fixture() -> Fixture {
        let broker = InMemoryBroker::new();
        let registry = Arc::new(ConnectionRegistry::new(8));
        let locations = Arc::new(GeoIndex::new(0.25));
        let directory = Arc::new(InMemoryOperatorDirectory::new());
        let metrics = Metrics::new();
        let router = Arc::new(NotificationRouter::new(
            registry.clone(),
            Arc::new(broker.clone()),
            locations.clone(),
            metrics.clone(),
        ));
        let matcher = Arc::new(Matcher::new(
            locations.clone(),
            directory.clone(),
            Arc::new(InMemoryVehicleClassCache::new()),
            router,
            100.0,
            Duration::from_secs(3600),
            4,
            metrics,
        ));

        Fixture {
            matcher,
            registry,
            locations,
            directory,
            broker,
        }
    }

    fn place(locations: &GeoIndex, operator_id: &str, lat: f64, lng: f64) {
        locations
            .upsert(LiveLocation {
                operator_id: operator_id.to_string(),
                location: GeoPoint::new(lat, lng),
                timestamp: Utc::now(),
            })
            .unwrap();
    }

    fn van_request() -> PendingRequest {
        PendingRequest {
            pending_id: Uuid::new_v4(),
            requester_id: "u1".into(),
            requester_name: "Uma".into(),
            pickup: GeoPoint::new(1.0, 1.0),
            dropoff: GeoPoint::new(1.1, 1.1),
            vehicle_class: "van".into(),
            price: 30.0,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn only_matching_class_is_offered() {
        let f = fixture();
        f.directory.register("van-1", "van");
        f.directory.register("truck-1", "truck");
        place(&f.locations, "van-1", 1.01, 1.01);
        place(&f.locations, "truck-1", 1.02, 1.0);
        let mut van = f.registry.register(Role::Operator, "van-1");
        let mut truck = f.registry.register(Role::Operator, "truck-1");

        let request = van_request();
        let summary = f.matcher.match_and_notify(request.clone()).await;

        assert_eq!(
            summary,
            MatchSummary {
                candidates: 2,
                live: 1,
                published: 0,
                skipped: 1,
                failed: 0,
            }
        );
        assert_eq!(
            van.outbound.try_recv().unwrap(),
            OutboundFrame::BookingOffer(BookingOffer::for_operator(&request, "van-1"))
        );
        assert!(truck.outbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn offline_operator_offer_goes_to_topic() {
        let f = fixture();
        f.directory.register("van-1", "van");
        place(&f.locations, "van-1", 1.0, 1.0);

        let summary = f.matcher.match_and_notify(van_request()).await;
        assert_eq!(summary.published, 1);

        let messages = f.broker.messages(bus::DRIVER_NOTIFICATION).await;
        let offer: BookingOffer = serde_json::from_slice(&messages[0].payload).unwrap();
        assert_eq!(offer.operator_id, "van-1");
    }

    #[tokio::test]
    async fn out_of_radius_and_unknown_operators_are_not_offered() {
        let f = fixture();
        f.directory.register("far", "van");
        place(&f.locations, "far", 10.0, 10.0);
        place(&f.locations, "ghost", 1.0, 1.0);

        let summary = f.matcher.match_and_notify(van_request()).await;
        assert_eq!(summary.candidates, 1);
        assert_eq!(summary.notified(), 0);
        assert_eq!(summary.skipped, 1);
    }

    #[tokio::test]
    async fn vehicle_class_is_cached_between_requests() {
        let f = fixture();
        f.directory.register("van-1", "van");
        place(&f.locations, "van-1", 1.0, 1.0);

        f.matcher.match_and_notify(van_request()).await;
        f.matcher.match_and_notify(van_request()).await;

        assert_eq!(f.directory.lookups(), 1);
    }

    #[tokio::test]
    async fn many_candidates_respect_the_concurrency_bound() {
        let f = fixture();
        for n in 0..20 {
            let id = format!("van-{n}");
            f.directory.register(id.clone(), "van");
            place(&f.locations, &id, 1.0 + n as f64 * 0.001, 1.0);
        }

        let summary = f.matcher.match_and_notify(van_request()).await;
        assert_eq!(summary.candidates, 20);
        assert_eq!(summary.published, 20);
    }
}
