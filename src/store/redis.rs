//! Redis-backed pending store, location cache and vehicle-class cache.
//!
//! All three share one multiplexed [`ConnectionManager`]; cloning it is cheap
//! and every clone reconnects on its own.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use uuid::Uuid;

use crate::geo::cache::LocationCache;
use crate::geo::index::Nearby;
use crate::geo::GeoPoint;
use crate::models::booking::PendingRequest;
use crate::models::location::LiveLocation;
use crate::store::{PendingRequestStore, StoreError, VehicleClassCache};

const LOCATIONS_KEY: &str = "operator-locations";
const REQUESTER_KEY_PREFIX: &str = "pending-by-requester:";

/// GETDEL the request, then clear the requester index if it still points at
/// this request. KEYS[1] = request key, ARGV[1] = index prefix, ARGV[2] = id.
const TAKE_SCRIPT: &str = r#"
local raw = redis.call('GETDEL', KEYS[1])
if not raw then
  return false
end
local ok, request = pcall(cjson.decode, raw)
if ok and type(request) == 'table' and type(request.requester_id) == 'string' then
  local index = ARGV[1] .. request.requester_id
  if redis.call('GET', index) == ARGV[2] then
    redis.call('DEL', index)
  end
end
return raw
"#;

pub async fn connect(redis_url: &str) -> Result<ConnectionManager, StoreError> {
    let client = redis::Client::open(redis_url).map_err(map_err)?;
    ConnectionManager::new(client).await.map_err(map_err)
}

#[derive(Clone)]
pub struct RedisPendingStore {
    conn: ConnectionManager,
    ttl: Duration,
}

impl RedisPendingStore {
    pub fn new(conn: ConnectionManager, ttl: Duration) -> Self {
        Self { conn, ttl }
    }

    fn request_key(pending_id: Uuid) -> String {
        format!("pending:{pending_id}")
    }

    fn requester_key(requester_id: &str) -> String {
        format!("{REQUESTER_KEY_PREFIX}{requester_id}")
    }

    fn ttl_secs(&self) -> u64 {
        self.ttl.as_secs().max(1)
    }
}

#[async_trait]
impl PendingRequestStore for RedisPendingStore {
    async fn insert(&self, request: PendingRequest) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let pending_id = request.pending_id.to_string();
        let payload =
            serde_json::to_string(&request).map_err(|err| StoreError::Backend(err.to_string()))?;

        let (previous,): (Option<String>,) = redis::pipe()
            .atomic()
            .set_ex(Self::request_key(request.pending_id), payload, self.ttl_secs())
            .ignore()
            .cmd("SET")
            .arg(Self::requester_key(&request.requester_id))
            .arg(&pending_id)
            .arg("EX")
            .arg(self.ttl_secs())
            .arg("GET")
            .query_async(&mut conn)
            .await
            .map_err(map_err)?;

        if let Some(previous) = previous.filter(|previous| *previous != pending_id) {
            let removed: Result<i64, _> = conn.del(format!("pending:{previous}")).await;
            if let Err(err) = removed {
                tracing::warn!(%previous, error = %err, "failed to drop replaced pending request");
            }
        }

        tracing::debug!(%pending_id, "pending request stored");
        Ok(())
    }

    async fn get(&self, pending_id: Uuid) -> Result<Option<PendingRequest>, StoreError> {
        let mut conn = self.conn.clone();
        let payload: Option<String> = conn
            .get(Self::request_key(pending_id))
            .await
            .map_err(map_err)?;

        payload.map(|raw| decode(&raw)).transpose()
    }

    async fn take(&self, pending_id: Uuid) -> Result<Option<PendingRequest>, StoreError> {
        let mut conn = self.conn.clone();
        // One script: the request and its requester index go together or not at all.
        let script = redis::Script::new(TAKE_SCRIPT);
        let payload: Option<String> = script
            .key(Self::request_key(pending_id))
            .arg(REQUESTER_KEY_PREFIX)
            .arg(pending_id.to_string())
            .invoke_async(&mut conn)
            .await
            .map_err(map_err)?;

        payload.map(|raw| decode(&raw)).transpose()
    }

    async fn find_by_requester(
        &self,
        requester_id: &str,
    ) -> Result<Option<PendingRequest>, StoreError> {
        let mut conn = self.conn.clone();
        let pending_id: Option<String> = conn
            .get(Self::requester_key(requester_id))
            .await
            .map_err(map_err)?;

        match pending_id.and_then(|raw| raw.parse::<Uuid>().ok()) {
            Some(pending_id) => self.get(pending_id).await,
            None => Ok(None),
        }
    }
}

#[derive(Clone)]
pub struct RedisLocationCache {
    conn: ConnectionManager,
}

impl RedisLocationCache {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl LocationCache for RedisLocationCache {
    async fn upsert(&self, location: LiveLocation) -> Result<(), StoreError> {
        location
            .location
            .validate()
            .map_err(|err| StoreError::Rejected(err.to_string()))?;

        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("GEOADD")
            .arg(LOCATIONS_KEY)
            .arg(location.location.lng)
            .arg(location.location.lat)
            .arg(&location.operator_id)
            .query_async(&mut conn)
            .await
            .map_err(map_err)?;
        Ok(())
    }

    async fn remove(&self, operator_id: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.zrem(LOCATIONS_KEY, operator_id).await.map_err(map_err)?;
        Ok(())
    }

    async fn query_radius(
        &self,
        center: &GeoPoint,
        radius_km: f64,
    ) -> Result<Vec<Nearby>, StoreError> {
        let mut conn = self.conn.clone();
        let hits: Vec<(String, f64)> = redis::cmd("GEORADIUS")
            .arg(LOCATIONS_KEY)
            .arg(center.lng)
            .arg(center.lat)
            .arg(radius_km)
            .arg("km")
            .arg("WITHDIST")
            .arg("ASC")
            .query_async(&mut conn)
            .await
            .map_err(map_err)?;

        Ok(hits
            .into_iter()
            .map(|(member_id, distance_km)| Nearby {
                member_id,
                distance_km,
            })
            .collect())
    }
}

#[derive(Clone)]
pub struct RedisVehicleClassCache {
    conn: ConnectionManager,
}

impl RedisVehicleClassCache {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    fn key(operator_id: &str) -> String {
        format!("{operator_id}-veh")
    }
}

#[async_trait]
impl VehicleClassCache for RedisVehicleClassCache {
    async fn get(&self, operator_id: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        conn.get(Self::key(operator_id)).await.map_err(map_err)
    }

    async fn put(&self, operator_id: &str, class: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.set_ex(Self::key(operator_id), class, ttl.as_secs().max(1))
            .await
            .map_err(map_err)
    }
}

fn decode(raw: &str) -> Result<PendingRequest, StoreError> {
    serde_json::from_str(raw).map_err(|err| StoreError::Backend(err.to_string()))
}

fn map_err(err: redis::RedisError) -> StoreError {
    if err.is_timeout() || err.is_connection_dropped() || err.is_io_error() {
        StoreError::Unavailable(err.to_string())
    } else {
        StoreError::Backend(err.to_string())
    }
}
