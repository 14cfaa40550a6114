//! Own-port registry
//!
//! Components of the firewall process register the local source ports of
//! connections they are about to open (resolver queries, update checks,
//! tunnel control). The initial handler treats packets from these ports as
//! pre-authenticated internal traffic and never submits them to policy.

use dashmap::DashMap;
use warden_common::Timestamp;
use warden_packet::Protocol;

/// Registrations expire if the connection never shows up
const REGISTRATION_TTL_SECS: u64 = 180;

#[derive(Default)]
pub struct OwnPortRegistry {
    ports: DashMap<(u8, u16), Timestamp>,
}

impl OwnPortRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Announce an upcoming connection from a local port
    pub fn register(&self, protocol: Protocol, port: u16) {
        self.ports.insert((protocol.number(), port), Timestamp::now());
    }

    /// Whether the port was pre-authenticated (and still fresh)
    pub fn is_own(&self, protocol: Protocol, port: u16) -> bool {
        match self.ports.get(&(protocol.number(), port)) {
            Some(entry) => entry.elapsed_secs() < REGISTRATION_TTL_SECS,
            None => false,
        }
    }

    /// Drop a registration once the connection is established
    pub fn release(&self, protocol: Protocol, port: u16) {
        self.ports.remove(&(protocol.number(), port));
    }

    /// Remove expired registrations
    pub fn sweep(&self) {
        self.ports
            .retain(|_, registered| registered.elapsed_secs() < REGISTRATION_TTL_SECS);
    }

    pub fn len(&self) -> usize {
        self.ports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }
}
