//! Repositories behind the booking lifecycle.
//!
//! Pending requests and bookings live in two different stores. Moving a
//! record from one to the other happens only in
//! [`crate::engine::lifecycle::BookingLifecycle::accept_request`].

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;
#[cfg(feature = "redis")]
pub mod redis;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::models::booking::{Booking, BookingStatus, NewBooking, PendingRequest};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum StoreError {
    /// Timeouts, dropped connections. Safe to retry on read paths.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("duplicate record: {0}")]
    Duplicate(String),

    #[error("rejected by store: {0}")]
    Rejected(String),

    #[error("store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

/// Ephemeral store of requests that have not been matched yet.
#[async_trait]
pub trait PendingRequestStore: Send + Sync {
    /// A requester holds at most one pending request; inserting a newer one
    /// discards the older.
    async fn insert(&self, request: PendingRequest) -> Result<(), StoreError>;

    async fn get(&self, pending_id: Uuid) -> Result<Option<PendingRequest>, StoreError>;

    /// Atomic remove-if-present: of any number of concurrent callers for the
    /// same id, exactly one receives `Some`.
    async fn take(&self, pending_id: Uuid) -> Result<Option<PendingRequest>, StoreError>;

    async fn find_by_requester(
        &self,
        requester_id: &str,
    ) -> Result<Option<PendingRequest>, StoreError>;

    /// Drops expired requests and returns how many went. Stores with native
    /// key expiry have nothing to do.
    async fn purge_expired(&self) -> Result<usize, StoreError> {
        Ok(0)
    }
}

/// Durable, append-only booking history.
#[async_trait]
pub trait BookingStore: Send + Sync {
    /// Fails with [`StoreError::Duplicate`] when the pair already has a
    /// non-terminal booking.
    async fn insert(&self, booking: NewBooking) -> Result<Booking, StoreError>;

    /// Conditional update of the pair's non-terminal booking. Only rows whose
    /// current status is one of `next.allowed_predecessors()` change; the
    /// returned booking is `None` when no row matched.
    async fn transition(
        &self,
        requester_id: &str,
        operator_id: &str,
        next: BookingStatus,
    ) -> Result<Option<Booking>, StoreError>;

    async fn current_for_requester(&self, requester_id: &str)
    -> Result<Option<Booking>, StoreError>;

    async fn current_for_operator(&self, operator_id: &str) -> Result<Option<Booking>, StoreError>;

    async fn history_for_requester(&self, requester_id: &str) -> Result<Vec<Booking>, StoreError>;

    async fn history_for_operator(&self, operator_id: &str) -> Result<Vec<Booking>, StoreError>;
}

/// Durable record of each operator's registered vehicle class.
#[async_trait]
pub trait OperatorDirectory: Send + Sync {
    async fn vehicle_class(&self, operator_id: &str) -> Result<Option<String>, StoreError>;
}

/// Short-lived cache in front of [`OperatorDirectory`].
#[async_trait]
pub trait VehicleClassCache: Send + Sync {
    async fn get(&self, operator_id: &str) -> Result<Option<String>, StoreError>;

    async fn put(&self, operator_id: &str, class: &str, ttl: Duration) -> Result<(), StoreError>;
}
