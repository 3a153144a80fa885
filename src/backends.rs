//! Wiring of store, cache and broker implementations.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;

use crate::bus::memory::InMemoryBroker;
use crate::bus::{BusError, EventPublisher, TopicConsumer};
use crate::config::DispatchSettings;
use crate::geo::cache::LocationCache;
use crate::geo::index::GeoIndex;
use crate::store::memory::{
    InMemoryBookingStore, InMemoryOperatorDirectory, InMemoryPendingStore,
    InMemoryVehicleClassCache,
};
use crate::store::{BookingStore, OperatorDirectory, PendingRequestStore, VehicleClassCache};

pub type ConsumerFactory =
    Arc<dyn Fn(&str, &str) -> Result<Box<dyn TopicConsumer>, BusError> + Send + Sync>;

/// A transport resource released during shutdown.
pub struct Closer {
    pub name: &'static str,
    pub close: Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>,
}

pub struct Backends {
    pub pending: Arc<dyn PendingRequestStore>,
    pub bookings: Arc<dyn BookingStore>,
    pub directory: Arc<dyn OperatorDirectory>,
    pub class_cache: Arc<dyn VehicleClassCache>,
    pub locations: Arc<dyn LocationCache>,
    pub publisher: Arc<dyn EventPublisher>,
    pub consumers: ConsumerFactory,
    pub closers: Vec<Closer>,
}

/// Concrete handles to the in-memory backends, for seeding and inspection.
#[derive(Clone)]
pub struct MemoryHandles {
    pub broker: InMemoryBroker,
    pub directory: Arc<InMemoryOperatorDirectory>,
    pub locations: Arc<GeoIndex>,
    pub pending: Arc<InMemoryPendingStore>,
    pub bookings: Arc<InMemoryBookingStore>,
}

impl Backends {
    pub fn in_memory(
        settings: &DispatchSettings,
        operator_classes: Vec<(String, String)>,
    ) -> (Self, MemoryHandles) {
        let handles = MemoryHandles {
            broker: InMemoryBroker::new(),
            directory: Arc::new(InMemoryOperatorDirectory::from_pairs(operator_classes)),
            locations: Arc::new(GeoIndex::new(settings.geo_cell_degrees)),
            pending: Arc::new(InMemoryPendingStore::new(settings.pending_ttl)),
            bookings: Arc::new(InMemoryBookingStore::new()),
        };

        let broker = handles.broker.clone();
        let consumers: ConsumerFactory = Arc::new(move |group: &str, topic: &str| {
            Ok(Box::new(broker.consumer(group, topic)) as Box<dyn TopicConsumer>)
        });

        let backends = Self {
            pending: handles.pending.clone(),
            bookings: handles.bookings.clone(),
            directory: handles.directory.clone(),
            class_cache: Arc::new(InMemoryVehicleClassCache::new()),
            locations: handles.locations.clone(),
            publisher: Arc::new(handles.broker.clone()),
            consumers,
            closers: Vec::new(),
        };

        (backends, handles)
    }

    /// Postgres for bookings and the operator directory, Redis for the pending
    /// store and both caches, Kafka for the topics.
    #[cfg(feature = "external")]
    pub async fn external(
        config: &crate::config::Config,
    ) -> Result<Self, crate::error::AppError> {
        use crate::bus::kafka::{KafkaConsumer, KafkaPublisher};
        use crate::error::AppError;
        use crate::store::postgres::PgStore;
        use crate::store::redis::{
            RedisLocationCache, RedisPendingStore, RedisVehicleClassCache, connect,
        };

        let database_url = config
            .database_url
            .as_deref()
            .ok_or_else(|| AppError::Internal("DATABASE_URL is required".to_string()))?;
        let redis_url = config
            .redis_url
            .as_deref()
            .ok_or_else(|| AppError::Internal("REDIS_URL is required".to_string()))?;

        let pg = PgStore::connect(database_url).await?;
        pg.ensure_schema().await?;
        let redis = connect(redis_url).await?;

        let publisher = KafkaPublisher::new(&config.kafka_brokers, config.resource_close_timeout)
            .map_err(|err| AppError::Internal(err.to_string()))?;

        let brokers = config.kafka_brokers.clone();
        let consumers: ConsumerFactory = Arc::new(move |group: &str, topic: &str| {
            let consumer = KafkaConsumer::subscribe(&brokers, group, topic)?;
            Ok(Box::new(consumer) as Box<dyn TopicConsumer>)
        });

        let closing_pg = pg.clone();
        let closing_publisher = publisher.clone();
        let closers = vec![
            Closer {
                name: "kafka-producer",
                close: Box::new(move || {
                    Box::pin(async move { closing_publisher.close().await })
                }),
            },
            Closer {
                name: "postgres-pool",
                close: Box::new(move || Box::pin(async move { closing_pg.close().await })),
            },
        ];

        let pg = Arc::new(pg);
        Ok(Self {
            pending: Arc::new(RedisPendingStore::new(
                redis.clone(),
                config.dispatch.pending_ttl,
            )),
            bookings: pg.clone(),
            directory: pg,
            class_cache: Arc::new(RedisVehicleClassCache::new(redis.clone())),
            locations: Arc::new(RedisLocationCache::new(redis)),
            publisher: Arc::new(publisher),
            consumers,
            closers,
        })
    }
}

/// Runs each closer with its own time budget; a stuck resource is logged and
/// skipped.
pub async fn close_all(closers: Vec<Closer>, per_resource: Duration) {
    for closer in closers {
        match tokio::time::timeout(per_resource, (closer.close)()).await {
            Ok(()) => tracing::info!(resource = closer.name, "resource closed"),
            Err(_) => tracing::warn!(resource = closer.name, "resource close timed out"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use super::{close_all, Closer};

    #[tokio::test(start_paused = true)]
    async fn stuck_resource_does_not_block_the_rest() {
        let closed = Arc::new(AtomicBool::new(false));
        let flag = closed.clone();

        let closers = vec![
            Closer {
                name: "stuck",
                close: Box::new(|| Box::pin(futures::future::pending::<()>())),
            },
            Closer {
                name: "fine",
                close: Box::new(move || {
                    Box::pin(async move { flag.store(true, Ordering::SeqCst) })
                }),
            },
        ];

        close_all(closers, Duration::from_secs(5)).await;
        assert!(closed.load(Ordering::SeqCst));
    }
}
