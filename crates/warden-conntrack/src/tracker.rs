//! The live connection map
//!
//! Creation is single-inflight per fingerprint: concurrent packets of the
//! same new connection converge on one record, everyone else observes it.
//! The map lock is sharded (dashmap); per-connection work happens under the
//! connection's own lock.

use crate::connection::Connection;
use crate::fingerprint::Fingerprint;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use warden_packet::PacketInfo;

/// Result of a tracker lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackResult {
    /// This call created the record
    pub created: bool,
    /// The record was shared with earlier packets (diagnostics)
    pub shared: bool,
}

/// Process-wide connection map
#[derive(Default)]
pub struct ConnectionTracker {
    map: DashMap<Fingerprint, Arc<Connection>>,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up the connection for a packet, creating it from the first
    /// packet if needed.
    ///
    /// The dashmap entry holds the shard lock across the creation callback,
    /// so at most one creation happens per fingerprint no matter how many
    /// packets race.
    pub fn get_or_create(&self, info: &PacketInfo) -> (Arc<Connection>, TrackResult) {
        let fingerprint = Fingerprint::from_info(info);
        match self.map.entry(fingerprint) {
            Entry::Occupied(entry) => {
                let conn = entry.get().clone();
                conn.touch();
                (conn, TrackResult { created: false, shared: true })
            }
            Entry::Vacant(entry) => {
                let conn = Arc::new(Connection::from_first_packet(info));
                entry.insert(conn.clone());
                (conn, TrackResult { created: true, shared: false })
            }
        }
    }

    /// Look up without creating
    pub fn get(&self, fingerprint: &Fingerprint) -> Option<Arc<Connection>> {
        self.map.get(fingerprint).map(|e| e.clone())
    }

    /// Snapshot of all live connections (re-evaluation path)
    pub fn get_all(&self) -> Vec<Arc<Connection>> {
        self.map.iter().map(|e| e.value().clone()).collect()
    }

    /// Remove a connection and return it for teardown
    pub fn delete(&self, fingerprint: &Fingerprint) -> Option<Arc<Connection>> {
        self.map.remove(fingerprint).map(|(_, conn)| {
            conn.mark_ended();
            conn
        })
    }

    /// Remove ended and idle connections; returns them for teardown
    pub fn prune(&self, idle_secs: u64) -> Vec<Arc<Connection>> {
        let dead: Vec<Fingerprint> = self
            .map
            .iter()
            .filter(|e| e.value().has_ended() || e.value().idle_secs() >= idle_secs)
            .map(|e| *e.key())
            .collect();
        dead.iter().filter_map(|fp| self.delete(fp)).collect()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}
