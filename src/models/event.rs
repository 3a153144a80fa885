use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::geo::GeoPoint;
use crate::models::booking::{BookingStatus, PendingRequest};
use crate::models::location::LiveLocation;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleStatus {
    Booked,
    EnrouteToPickup,
    InProgress,
    Completed,
    Cancelled,
}

impl LifecycleStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, LifecycleStatus::Completed | LifecycleStatus::Cancelled)
    }
}

impl From<BookingStatus> for LifecycleStatus {
    fn from(status: BookingStatus) -> Self {
        match status {
            BookingStatus::EnrouteToPickup => LifecycleStatus::EnrouteToPickup,
            BookingStatus::InProgress => LifecycleStatus::InProgress,
            BookingStatus::Completed => LifecycleStatus::Completed,
            BookingStatus::Cancelled => LifecycleStatus::Cancelled,
        }
    }
}

/// Carried on `booking-notifications` and relayed to the requester.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleEvent {
    pub requester_id: String,
    pub operator_id: String,
    pub operator_name: String,
    pub status: LifecycleStatus,
}

/// Fan-out payload offered to one candidate operator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookingOffer {
    pub pending_id: Uuid,
    pub operator_id: String,
    pub requester_id: String,
    pub requester_name: String,
    pub pickup: GeoPoint,
    pub dropoff: GeoPoint,
    pub vehicle_class: String,
    pub price: f64,
}

impl BookingOffer {
    pub fn for_operator(pending: &PendingRequest, operator_id: &str) -> Self {
        Self {
            pending_id: pending.pending_id,
            operator_id: operator_id.to_string(),
            requester_id: pending.requester_id.clone(),
            requester_name: pending.requester_name.clone(),
            pickup: pending.pickup.clone(),
            dropoff: pending.dropoff.clone(),
            vehicle_class: pending.vehicle_class.clone(),
            price: pending.price,
        }
    }
}

/// Server → client WebSocket frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundFrame {
    BookingOffer(BookingOffer),
    Lifecycle(LifecycleEvent),
    Location(LiveLocation),
}
