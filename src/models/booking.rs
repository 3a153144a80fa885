use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::geo::GeoPoint;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingStatus {
    EnrouteToPickup,
    InProgress,
    Completed,
    Cancelled,
}

impl BookingStatus {
    pub const TERMINAL: [BookingStatus; 2] = [BookingStatus::Completed, BookingStatus::Cancelled];

    pub fn is_terminal(self) -> bool {
        Self::TERMINAL.contains(&self)
    }

    /// Statuses a booking may currently hold for a move to `self` to apply.
    /// Empty when `self` can never be the target of an update.
    pub fn allowed_predecessors(self) -> &'static [BookingStatus] {
        match self {
            BookingStatus::EnrouteToPickup => &[],
            BookingStatus::InProgress => &[BookingStatus::EnrouteToPickup],
            BookingStatus::Completed | BookingStatus::Cancelled => {
                &[BookingStatus::EnrouteToPickup, BookingStatus::InProgress]
            }
        }
    }

    pub fn can_transition_to(self, next: BookingStatus) -> bool {
        next.allowed_predecessors().contains(&self)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BookingStatus::EnrouteToPickup => "enroute_to_pickup",
            BookingStatus::InProgress => "in_progress",
            BookingStatus::Completed => "completed",
            BookingStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BookingStatus {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "enroute_to_pickup" => Ok(BookingStatus::EnrouteToPickup),
            "in_progress" => Ok(BookingStatus::InProgress),
            "completed" => Ok(BookingStatus::Completed),
            "cancelled" => Ok(BookingStatus::Cancelled),
            other => Err(format!("unknown booking status {other}")),
        }
    }
}

/// Body of `POST /booking`. Requester identity comes from the auth header.
#[derive(Debug, Clone, Deserialize)]
pub struct NewBookingRequest {
    pub pickup: GeoPoint,
    pub dropoff: GeoPoint,
    pub vehicle_class: String,
    pub price: f64,
}

/// A request waiting for an operator. Lives only in the pending store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingRequest {
    pub pending_id: Uuid,
    pub requester_id: String,
    pub requester_name: String,
    pub pickup: GeoPoint,
    pub dropoff: GeoPoint,
    pub vehicle_class: String,
    pub price: f64,
    pub created_at: DateTime<Utc>,
}

impl PendingRequest {
    pub fn is_expired(&self, ttl: std::time::Duration, now: DateTime<Utc>) -> bool {
        match chrono::Duration::from_std(ttl) {
            Ok(ttl) => self.created_at + ttl <= now,
            Err(_) => false,
        }
    }
}

/// Everything a booking row needs except what the store assigns.
#[derive(Debug, Clone, PartialEq)]
pub struct NewBooking {
    pub requester_id: String,
    pub requester_name: String,
    pub operator_id: String,
    pub operator_name: String,
    pub price: f64,
    pub pickup: GeoPoint,
    pub dropoff: GeoPoint,
    pub vehicle_class: String,
}

impl NewBooking {
    pub fn accept(pending: &PendingRequest, operator_id: &str, operator_name: &str) -> Self {
        Self {
            requester_id: pending.requester_id.clone(),
            requester_name: pending.requester_name.clone(),
            operator_id: operator_id.to_string(),
            operator_name: operator_name.to_string(),
            price: pending.price,
            pickup: pending.pickup.clone(),
            dropoff: pending.dropoff.clone(),
            vehicle_class: pending.vehicle_class.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Booking {
    pub id: i64,
    pub requester_id: String,
    pub requester_name: String,
    pub operator_id: String,
    pub operator_name: String,
    pub price: f64,
    pub pickup: GeoPoint,
    pub dropoff: GeoPoint,
    pub vehicle_class: String,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: BookingStatus,
}

impl Booking {
    pub fn from_new(id: i64, new: NewBooking, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            requester_id: new.requester_id,
            requester_name: new.requester_name,
            operator_id: new.operator_id,
            operator_name: new.operator_name,
            price: new.price,
            pickup: new.pickup,
            dropoff: new.dropoff,
            vehicle_class: new.vehicle_class,
            created_at,
            completed_at: None,
            status: BookingStatus::EnrouteToPickup,
        }
    }
}

/// What "check current booking" returns for a requester.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "data")]
pub enum CurrentBooking {
    Pending(PendingRequest),
    Booked(Booking),
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;
    use uuid::Uuid;

    use super::{BookingStatus, PendingRequest};
    use crate::geo::GeoPoint;

    #[test]
    fn terminal_states_are_absorbing() {
        for terminal in BookingStatus::TERMINAL {
            for next in [
                BookingStatus::EnrouteToPickup,
                BookingStatus::InProgress,
                BookingStatus::Completed,
                BookingStatus::Cancelled,
            ] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn lifecycle_moves_forward_only() {
        use BookingStatus::*;
        assert!(EnrouteToPickup.can_transition_to(InProgress));
        assert!(EnrouteToPickup.can_transition_to(Cancelled));
        assert!(InProgress.can_transition_to(Completed));
        assert!(!InProgress.can_transition_to(EnrouteToPickup));
        assert!(!InProgress.can_transition_to(InProgress));
    }

    #[test]
    fn status_uses_snake_case_on_the_wire() {
        let json = serde_json::to_string(&BookingStatus::EnrouteToPickup).unwrap();
        assert_eq!(json, "\"enroute_to_pickup\"");
        assert_eq!(
            "in_progress".parse::<BookingStatus>().unwrap(),
            BookingStatus::InProgress
        );
    }

    #[test]
    fn pending_request_expires_after_ttl() {
        let created_at = Utc::now() - chrono::Duration::seconds(601);
        let pending = PendingRequest {
            pending_id: Uuid::new_v4(),
            requester_id: "u1".into(),
            requester_name: "Uma".into(),
            pickup: GeoPoint::new(1.0, 1.0),
            dropoff: GeoPoint::new(1.1, 1.1),
            vehicle_class: "van".into(),
            price: 12.0,
            created_at,
        };

        assert!(pending.is_expired(Duration::from_secs(600), Utc::now()));
        assert!(!pending.is_expired(Duration::from_secs(3600), Utc::now()));
    }
}
