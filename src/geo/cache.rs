use async_trait::async_trait;

use crate::geo::index::{GeoIndex, Nearby};
use crate::geo::GeoPoint;
use crate::models::location::LiveLocation;
use crate::store::StoreError;

/// Live operator positions, queried by the matcher.
#[async_trait]
pub trait LocationCache: Send + Sync {
    /// Upserts a position. The `(0, 0)` sentinel removes the operator instead.
    async fn apply(&self, location: LiveLocation) -> Result<(), StoreError> {
        if location.location.is_offline_sentinel() {
            self.remove(&location.operator_id).await
        } else {
            self.upsert(location).await
        }
    }

    async fn upsert(&self, location: LiveLocation) -> Result<(), StoreError>;

    async fn remove(&self, operator_id: &str) -> Result<(), StoreError>;

    async fn query_radius(
        &self,
        center: &GeoPoint,
        radius_km: f64,
    ) -> Result<Vec<Nearby>, StoreError>;
}

#[async_trait]
impl LocationCache for GeoIndex {
    async fn upsert(&self, location: LiveLocation) -> Result<(), StoreError> {
        GeoIndex::upsert(self, location).map_err(|err| StoreError::Rejected(err.to_string()))
    }

    async fn remove(&self, operator_id: &str) -> Result<(), StoreError> {
        GeoIndex::remove(self, operator_id);
        Ok(())
    }

    async fn query_radius(
        &self,
        center: &GeoPoint,
        radius_km: f64,
    ) -> Result<Vec<Nearby>, StoreError> {
        Ok(GeoIndex::query_radius(self, center, radius_km))
    }
}
