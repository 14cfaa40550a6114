//! Portscan detector
//!
//! Keeps an in-memory score per remote IP. Inbound packets that no local
//! process asked for accrue score weighted by how suspicious the probed
//! port is; scores decay over time, and a source that crosses the block
//! threshold is flagged. State is memory-only and expires after 24 idle
//! hours, taking the ignore and previous-offender flags with it.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::net::IpAddr;
use warden_common::{PortscanConfig, Timestamp};
use warden_packet::{PacketInfo, Protocol};

/// Score removed per idle minute
const DECAY_PER_MINUTE: u32 = 10;

/// Ports that regularly receive unsolicited local chatter
const DHCP_PORTS: [u16; 4] = [67, 68, 546, 547];
const NETBIOS_PORTS: [u16; 3] = [137, 138, 139];

#[derive(Debug)]
struct SourceEntry {
    score: u32,
    blocked: bool,
    previous_offender: bool,
    ignore: bool,
    last_seen: Timestamp,
}

/// In-memory portscan scoring table
pub struct PortscanDetector {
    config: PortscanConfig,
    table: DashMap<IpAddr, Mutex<SourceEntry>>,
}

impl PortscanDetector {
    pub fn new(config: PortscanConfig) -> Self {
        Self { config, table: DashMap::new() }
    }

    /// Record a packet. Returns true when the source is currently blocked.
    pub fn record(&self, info: &PacketInfo) -> bool {
        if !Self::counts(info) {
            return self.is_blocked(info.remote_ip());
        }

        let source = info.remote_ip();
        let score = self.port_score(info.local_port());

        let entry = self.table.entry(source).or_insert_with(|| {
            Mutex::new(SourceEntry {
                score: 0,
                blocked: false,
                previous_offender: false,
                ignore: false,
                last_seen: Timestamp::now(),
            })
        });
        let mut state = entry.lock();

        Self::decay(&mut state);
        state.score = (state.score + score).min(self.config.max_score);
        state.last_seen = Timestamp::now();

        if state.ignore {
            return false;
        }
        if !state.blocked && state.score >= self.config.block_threshold {
            state.blocked = true;
            state.previous_offender = true;
            tracing::info!(source = %source, score = state.score, "portscan source blocked");
        }
        state.blocked
    }

    /// Whether packets from `source` should be treated as a scan
    pub fn is_blocked(&self, source: IpAddr) -> bool {
        self.table
            .get(&source)
            .map(|e| {
                let state = e.lock();
                state.blocked && !state.ignore
            })
            .unwrap_or(false)
    }

    /// The source offended before (survives unblocking, not expiry)
    pub fn is_previous_offender(&self, source: IpAddr) -> bool {
        self.table
            .get(&source)
            .map(|e| e.lock().previous_offender)
            .unwrap_or(false)
    }

    /// Exempt a source from blocking
    pub fn set_ignore(&self, source: IpAddr, ignore: bool) {
        if let Some(entry) = self.table.get(&source) {
            entry.lock().ignore = ignore;
        }
    }

    /// Drop entries idle past the configured expiry
    pub fn expire(&self) {
        let expiry = self.config.idle_expiry_secs;
        self.table
            .retain(|_, entry| entry.lock().last_seen.elapsed_secs() < expiry);
    }

    pub fn tracked(&self) -> usize {
        self.table.len()
    }

    /// Accrual preconditions: inbound, unattributed, TCP/UDP, unicast,
    /// neither DHCP nor NetBIOS
    fn counts(info: &PacketInfo) -> bool {
        if !info.direction.is_inbound() || info.process_id.is_some() {
            return false;
        }
        if !matches!(info.protocol, Protocol::Tcp | Protocol::Udp) {
            return false;
        }
        let local = info.local_ip();
        let unicast = match local {
            IpAddr::V4(v4) => !v4.is_multicast() && !v4.is_broadcast(),
            IpAddr::V6(v6) => !v6.is_multicast(),
        };
        if !unicast {
            return false;
        }
        let port = info.local_port();
        !DHCP_PORTS.contains(&port) && !NETBIOS_PORTS.contains(&port)
    }

    fn port_score(&self, port: u16) -> u32 {
        if port < 1024 {
            self.config.score_well_known
        } else if port < 49152 {
            self.config.score_registered
        } else {
            self.config.score_dynamic
        }
    }

    fn decay(state: &mut SourceEntry) {
        let idle_minutes = (state.last_seen.elapsed_secs() / 60) as u32;
        if idle_minutes > 0 {
            state.score = state.score.saturating_sub(idle_minutes * DECAY_PER_MINUTE);
        }
    }
}
