//! Live channel bookkeeping.
//!
//! Each connected party owns one bounded outbound queue. The registry holds
//! the sending half keyed by party id; the socket writer task drains the
//! receiving half. Entries carry a connection id so a reconnect can replace a
//! stale entry and the stale socket's cleanup cannot evict the new one.

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use uuid::Uuid;

use crate::auth::Role;
use crate::models::event::OutboundFrame;

struct ConnectionHandle {
    conn_id: Uuid,
    tx: mpsc::Sender<OutboundFrame>,
}

/// Returned to the connection task that registered.
pub struct Registration {
    pub conn_id: Uuid,
    pub outbound: mpsc::Receiver<OutboundFrame>,
}

pub struct ConnectionRegistry {
    requesters: DashMap<String, ConnectionHandle>,
    operators: DashMap<String, ConnectionHandle>,
    /// operator id -> requester id, for trips in progress
    active_trips: DashMap<String, String>,
    buffer: usize,
}

impl ConnectionRegistry {
    pub fn new(buffer: usize) -> Self {
        Self {
            requesters: DashMap::new(),
            operators: DashMap::new(),
            active_trips: DashMap::new(),
            buffer: buffer.max(1),
        }
    }

    fn channels(&self, role: Role) -> &DashMap<String, ConnectionHandle> {
        match role {
            Role::Requester => &self.requesters,
            Role::Operator => &self.operators,
        }
    }

    /// Registers a fresh channel, replacing whatever was there for `party_id`.
    /// Dropping the replaced sender ends the stale writer.
    pub fn register(&self, role: Role, party_id: &str) -> Registration {
        let (tx, outbound) = mpsc::channel(self.buffer);
        let conn_id = Uuid::new_v4();

        let replaced = self
            .channels(role)
            .insert(party_id.to_string(), ConnectionHandle { conn_id, tx });
        if replaced.is_some() {
            tracing::info!(party_id, %role, "replaced stale live channel");
        }

        Registration { conn_id, outbound }
    }

    /// Removes the entry only if it still belongs to `conn_id`. Returns false
    /// when a newer connection owns the party; an entry already evicted by a
    /// failed send still counts as this connection going away.
    pub fn unregister(&self, role: Role, party_id: &str, conn_id: Uuid) -> bool {
        let channels = self.channels(role);
        if channels
            .remove_if(party_id, |_, handle| handle.conn_id == conn_id)
            .is_some()
        {
            return true;
        }
        !channels.contains_key(party_id)
    }

    pub fn is_connected(&self, role: Role, party_id: &str) -> bool {
        self.channels(role)
            .get(party_id)
            .is_some_and(|handle| !handle.tx.is_closed())
    }

    /// Queues `frame` on the party's live channel. A full or closed queue is
    /// treated as "not connected" and the frame is handed back.
    pub fn try_send(
        &self,
        role: Role,
        party_id: &str,
        frame: OutboundFrame,
    ) -> Result<(), OutboundFrame> {
        let channels = self.channels(role);
        let (conn_id, result) = match channels.get(party_id) {
            Some(handle) => (handle.conn_id, handle.tx.try_send(frame)),
            None => return Err(frame),
        };

        match result {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(frame)) => {
                tracing::warn!(party_id, %role, "outbound queue full");
                Err(frame)
            }
            Err(TrySendError::Closed(frame)) => {
                channels.remove_if(party_id, |_, handle| handle.conn_id == conn_id);
                Err(frame)
            }
        }
    }

    pub fn connected(&self, role: Role) -> usize {
        self.channels(role).len()
    }

    pub fn pair(&self, operator_id: &str, requester_id: &str) {
        self.active_trips
            .insert(operator_id.to_string(), requester_id.to_string());
    }

    /// Clears the pairing if it still points at `requester_id`.
    pub fn unpair(&self, operator_id: &str, requester_id: &str) -> bool {
        self.active_trips
            .remove_if(operator_id, |_, paired| paired == requester_id)
            .is_some()
    }

    pub fn trip_requester(&self, operator_id: &str) -> Option<String> {
        self.active_trips
            .get(operator_id)
            .map(|entry| entry.value().clone())
    }

    pub fn active_trips(&self) -> usize {
        self.active_trips.len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Utc;

    use super::ConnectionRegistry;
    use crate::auth::Role;
    use crate::models::event::{LifecycleEvent, LifecycleStatus, OutboundFrame};
    use crate::models::location::LiveLocation;

    fn frame() -> OutboundFrame {
        OutboundFrame::Lifecycle(LifecycleEvent {
            requester_id: "u1".into(),
            operator_id: "d1".into(),
            operator_name: "Dee".into(),
            status: LifecycleStatus::Booked,
        })
    }

    #[tokio::test]
    async fn delivers_to_registered_party_only() {
        let registry = ConnectionRegistry::new(4);
        let mut registration = registry.register(Role::Requester, "u1");

        assert!(registry.try_send(Role::Requester, "u1", frame()).is_ok());
        assert!(registry.try_send(Role::Operator, "u1", frame()).is_err());
        assert!(registry.try_send(Role::Requester, "u2", frame()).is_err());
        assert_eq!(registration.outbound.recv().await, Some(frame()));
    }

    #[test]
    fn reconnect_replaces_and_stale_cleanup_is_a_no_op() {
        let registry = ConnectionRegistry::new(4);
        let stale = registry.register(Role::Operator, "d1");
        let fresh = registry.register(Role::Operator, "d1");

        assert!(!registry.unregister(Role::Operator, "d1", stale.conn_id));
        assert!(registry.is_connected(Role::Operator, "d1"));

        assert!(registry.unregister(Role::Operator, "d1", fresh.conn_id));
        assert!(!registry.is_connected(Role::Operator, "d1"));
    }

    #[test]
    fn full_queue_counts_as_not_connected() {
        let registry = ConnectionRegistry::new(1);
        let _registration = registry.register(Role::Operator, "d1");
        let location = OutboundFrame::Location(LiveLocation {
            operator_id: "d1".into(),
            location: crate::geo::GeoPoint::new(1.0, 1.0),
            timestamp: Utc::now(),
        });

        assert!(registry.try_send(Role::Operator, "d1", location.clone()).is_ok());
        assert!(registry.try_send(Role::Operator, "d1", location).is_err());
    }

    #[test]
    fn closed_channel_is_evicted_on_send() {
        let registry = ConnectionRegistry::new(4);
        let registration = registry.register(Role::Requester, "u1");
        drop(registration);

        assert!(registry.try_send(Role::Requester, "u1", frame()).is_err());
        assert_eq!(registry.connected(Role::Requester), 0);
    }

    #[test]
    fn cleanup_after_send_eviction_still_reports_departure() {
        let registry = ConnectionRegistry::new(4);
        let registration = registry.register(Role::Operator, "d1");
        let conn_id = registration.conn_id;
        drop(registration.outbound);

        assert!(registry.try_send(Role::Operator, "d1", frame()).is_err());
        assert_eq!(registry.connected(Role::Operator), 0);
        assert!(registry.unregister(Role::Operator, "d1", conn_id));

        let _fresh = registry.register(Role::Operator, "d1");
        assert!(!registry.unregister(Role::Operator, "d1", conn_id));
    }

    #[test]
    fn unpair_ignores_newer_trip() {
        let registry = ConnectionRegistry::new(4);
        registry.pair("d1", "u1");
        registry.pair("d1", "u2");

        assert!(!registry.unpair("d1", "u1"));
        assert_eq!(registry.trip_requester("d1").as_deref(), Some("u2"));
        assert!(registry.unpair("d1", "u2"));
        assert_eq!(registry.active_trips(), 0);
    }

    #[test]
    fn concurrent_registrations_do_not_interfere() {
        let registry = Arc::new(ConnectionRegistry::new(4));
        let handles: Vec<_> = (0..32)
            .map(|n| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    let id = format!("d{n}");
                    let registration = registry.register(Role::Operator, &id);
                    registration.conn_id
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(registry.connected(Role::Operator), 32);
    }
}
