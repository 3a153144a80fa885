use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::geo::GeoPoint;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveLocation {
    #[serde(default)]
    pub operator_id: String,
    pub location: GeoPoint,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl LiveLocation {
    /// The synthetic event published when an operator disconnects.
    pub fn offline(operator_id: impl Into<String>) -> Self {
        Self {
            operator_id: operator_id.into(),
            location: GeoPoint::new(0.0, 0.0),
            timestamp: Utc::now(),
        }
    }

    pub fn is_offline(&self) -> bool {
        self.location.is_offline_sentinel()
    }
}
