//! Global packet counters
//!
//! One instance is shared by the reconciler and the stats worker. The stats
//! worker drains (`take`) every reporting interval.

use crate::AtomicCounter;

/// Aggregate counters over all handled packets
#[derive(Debug, Default)]
pub struct PacketCounters {
    /// Packets accepted (including permanent accepts)
    pub accepted: AtomicCounter,
    /// Packets blocked
    pub blocked: AtomicCounter,
    /// Packets dropped
    pub dropped: AtomicCounter,
    /// Packets whose connection entered the Failed state
    pub failed: AtomicCounter,
    /// Packets rerouted to the local nameserver
    pub rerouted_dns: AtomicCounter,
    /// Packets rerouted to the tunnel entry
    pub rerouted_tunnel: AtomicCounter,
    /// Packets short-circuited by the fast-track filter
    pub fast_tracked: AtomicCounter,
    /// Undecided/Undeterminable verdicts downgraded to drop at issue time
    pub undecided_downgrades: AtomicCounter,
}

/// Snapshot of all counters, taken (and reset) by the stats worker
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub accepted: u64,
    pub blocked: u64,
    pub dropped: u64,
    pub failed: u64,
    pub rerouted_dns: u64,
    pub rerouted_tunnel: u64,
    pub fast_tracked: u64,
    pub undecided_downgrades: u64,
}

impl CounterSnapshot {
    /// Total packets that received any disposition
    pub fn total(&self) -> u64 {
        self.accepted
            + self.blocked
            + self.dropped
            + self.failed
            + self.rerouted_dns
            + self.rerouted_tunnel
            + self.fast_tracked
    }
}

impl PacketCounters {
    /// Drain all counters into a snapshot, resetting them to zero
    pub fn drain(&self) -> CounterSnapshot {
        CounterSnapshot {
            accepted: self.accepted.take(),
            blocked: self.blocked.take(),
            dropped: self.dropped.take(),
            failed: self.failed.take(),
            rerouted_dns: self.rerouted_dns.take(),
            rerouted_tunnel: self.rerouted_tunnel.take(),
            fast_tracked: self.fast_tracked.take(),
            undecided_downgrades: self.undecided_downgrades.take(),
        }
    }
}
