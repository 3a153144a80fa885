//! In-process store implementations, backed by `DashMap` shards so unrelated
//! requests never contend on one lock.

use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::time::Instant;
use uuid::Uuid;

use crate::models::booking::{Booking, BookingStatus, NewBooking, PendingRequest};
use crate::store::{
    BookingStore, OperatorDirectory, PendingRequestStore, StoreError, VehicleClassCache,
};

pub struct InMemoryPendingStore {
    requests: DashMap<Uuid, PendingRequest>,
    by_requester: DashMap<String, Uuid>,
    ttl: Duration,
}

impl InMemoryPendingStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            requests: DashMap::new(),
            by_requester: DashMap::new(),
            ttl,
        }
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    fn forget_requester(&self, request: &PendingRequest) {
        self.by_requester
            .remove_if(&request.requester_id, |_, id| *id == request.pending_id);
    }
}

#[async_trait]
impl PendingRequestStore for InMemoryPendingStore {
    async fn insert(&self, request: PendingRequest) -> Result<(), StoreError> {
        let pending_id = request.pending_id;
        let previous = self
            .by_requester
            .insert(request.requester_id.clone(), pending_id);
        self.requests.insert(pending_id, request);

        if let Some(previous) = previous.filter(|previous| *previous != pending_id) {
            if self.requests.remove(&previous).is_some() {
                tracing::debug!(%previous, replaced_by = %pending_id, "pending request replaced");
            }
        }
        Ok(())
    }

    async fn get(&self, pending_id: Uuid) -> Result<Option<PendingRequest>, StoreError> {
        let found = self.requests.get(&pending_id).map(|entry| entry.value().clone());

        match found {
            Some(request) if request.is_expired(self.ttl, Utc::now()) => {
                if let Some((_, expired)) = self.requests.remove(&pending_id) {
                    self.forget_requester(&expired);
                }
                Ok(None)
            }
            other => Ok(other),
        }
    }

    async fn take(&self, pending_id: Uuid) -> Result<Option<PendingRequest>, StoreError> {
        let Some((_, request)) = self.requests.remove(&pending_id) else {
            return Ok(None);
        };
        self.forget_requester(&request);

        if request.is_expired(self.ttl, Utc::now()) {
            return Ok(None);
        }
        Ok(Some(request))
    }

    async fn find_by_requester(
        &self,
        requester_id: &str,
    ) -> Result<Option<PendingRequest>, StoreError> {
        let pending_id = self.by_requester.get(requester_id).map(|entry| *entry.value());
        match pending_id {
            Some(pending_id) => self.get(pending_id).await,
            None => Ok(None),
        }
    }

    async fn purge_expired(&self) -> Result<usize, StoreError> {
        let now = Utc::now();
        let expired: Vec<PendingRequest> = self
            .requests
            .iter()
            .filter(|entry| entry.is_expired(self.ttl, now))
            .map(|entry| entry.value().clone())
            .collect();

        let mut purged = 0;
        for request in expired {
            if self
                .requests
                .remove_if(&request.pending_id, |_, current| current.is_expired(self.ttl, now))
                .is_some()
            {
                self.forget_requester(&request);
                purged += 1;
            }
        }
        Ok(purged)
    }
}

type Pair = (String, String);

pub struct InMemoryBookingStore {
    bookings: DashMap<i64, Booking>,
    active: DashMap<Pair, i64>,
    next_id: AtomicI64,
}

impl InMemoryBookingStore {
    pub fn new() -> Self {
        Self {
            bookings: DashMap::new(),
            active: DashMap::new(),
            next_id: AtomicI64::new(1),
        }
    }

    pub fn len(&self) -> usize {
        self.bookings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bookings.is_empty()
    }

    fn is_terminal(&self, id: i64) -> bool {
        self.bookings
            .get(&id)
            .is_none_or(|booking| booking.status.is_terminal())
    }

    fn newest_active<F>(&self, matches: F) -> Option<Booking>
    where
        F: Fn(&Booking) -> bool,
    {
        self.bookings
            .iter()
            .filter(|entry| !entry.status.is_terminal() && matches(entry.value()))
            .max_by_key(|entry| *entry.key())
            .map(|entry| entry.value().clone())
    }

    fn history<F>(&self, matches: F) -> Vec<Booking>
    where
        F: Fn(&Booking) -> bool,
    {
        let mut found: Vec<Booking> = self
            .bookings
            .iter()
            .filter(|entry| matches(entry.value()))
            .map(|entry| entry.value().clone())
            .collect();
        found.sort_by(|a, b| b.id.cmp(&a.id));
        found
    }
}

impl Default for InMemoryBookingStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BookingStore for InMemoryBookingStore {
    async fn insert(&self, new: NewBooking) -> Result<Booking, StoreError> {
        let pair = (new.requester_id.clone(), new.operator_id.clone());

        match self.active.entry(pair) {
            Entry::Occupied(mut occupied) => {
                let existing = *occupied.get();
                if !self.is_terminal(existing) {
                    return Err(StoreError::Duplicate(format!(
                        "booking {existing} is still active for this requester and operator"
                    )));
                }
                let booking = self.allocate(new);
                occupied.insert(booking.id);
                Ok(booking)
            }
            Entry::Vacant(vacant) => {
                let booking = self.allocate(new);
                vacant.insert(booking.id);
                Ok(booking)
            }
        }
    }

    async fn transition(
        &self,
        requester_id: &str,
        operator_id: &str,
        next: BookingStatus,
    ) -> Result<Option<Booking>, StoreError> {
        let pair = (requester_id.to_string(), operator_id.to_string());
        let Some(id) = self.active.get(&pair).map(|entry| *entry.value()) else {
            return Ok(None);
        };

        let updated = {
            let Some(mut booking) = self.bookings.get_mut(&id) else {
                return Ok(None);
            };
            if !next.allowed_predecessors().contains(&booking.status) {
                return Ok(None);
            }
            booking.status = next;
            if next.is_terminal() {
                booking.completed_at = Some(Utc::now());
            }
            booking.clone()
        };

        if next.is_terminal() {
            self.active.remove_if(&pair, |_, active_id| *active_id == id);
        }

        Ok(Some(updated))
    }

    async fn current_for_requester(
        &self,
        requester_id: &str,
    ) -> Result<Option<Booking>, StoreError> {
        Ok(self.newest_active(|booking| booking.requester_id == requester_id))
    }

    async fn current_for_operator(&self, operator_id: &str) -> Result<Option<Booking>, StoreError> {
        Ok(self.newest_active(|booking| booking.operator_id == operator_id))
    }

    async fn history_for_requester(&self, requester_id: &str) -> Result<Vec<Booking>, StoreError> {
        Ok(self.history(|booking| booking.requester_id == requester_id))
    }

    async fn history_for_operator(&self, operator_id: &str) -> Result<Vec<Booking>, StoreError> {
        Ok(self.history(|booking| booking.operator_id == operator_id))
    }
}

impl InMemoryBookingStore {
    fn allocate(&self, new: NewBooking) -> Booking {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let booking = Booking::from_new(id, new, Utc::now());
        self.bookings.insert(id, booking.clone());
        booking
    }
}

#[derive(Default)]
pub struct InMemoryOperatorDirectory {
    classes: DashMap<String, String>,
    lookups: AtomicUsize,
}

impl InMemoryOperatorDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs<I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let directory = Self::new();
        for (operator_id, class) in pairs {
            directory.register(operator_id, class);
        }
        directory
    }

    pub fn register(&self, operator_id: impl Into<String>, class: impl Into<String>) {
        self.classes.insert(operator_id.into(), class.into());
    }

    /// How many times the durable lookup ran; lets tests observe cache hits.
    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl OperatorDirectory for InMemoryOperatorDirectory {
    async fn vehicle_class(&self, operator_id: &str) -> Result<Option<String>, StoreError> {
        self.lookups.fetch_add(1, Ordering::Relaxed);
        Ok(self.classes.get(operator_id).map(|entry| entry.value().clone()))
    }
}

#[derive(Default)]
pub struct InMemoryVehicleClassCache {
    entries: DashMap<String, (String, Instant)>,
}

impl InMemoryVehicleClassCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VehicleClassCache for InMemoryVehicleClassCache {
    async fn get(&self, operator_id: &str) -> Result<Option<String>, StoreError> {
        let now = Instant::now();
        let hit = self
            .entries
            .get(operator_id)
            .filter(|entry| entry.value().1 > now)
            .map(|entry| entry.value().0.clone());

        if hit.is_none() {
            self.entries.remove_if(operator_id, |_, (_, expires)| *expires <= now);
        }
        Ok(hit)
    }

    async fn put(&self, operator_id: &str, class: &str, ttl: Duration) -> Result<(), StoreError> {
        self.entries.insert(
            operator_id.to_string(),
            (class.to_string(), Instant::now() + ttl),
        );
        Ok(())
    }
}
