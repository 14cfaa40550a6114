//! Connection records
//!
//! A connection is created on its first packet and lives until the OS
//! reports it ended or it idles out. All handler work for one connection
//! runs under its async lock; byte counters and liveness stamps are atomics
//! so the sweeper and bandwidth accounting never contend with the pipeline.

use crate::fingerprint::Fingerprint;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use warden_common::Timestamp;
use warden_packet::{Direction, PacketInfo, Protocol, Verdict};

/// Handle into a running tunnel, owned by the tunnel collaborator.
///
/// The connection only keeps a non-owning reference; dropping it does not
/// tear the tunnel down, `stop` does.
pub trait TunnelContext: std::fmt::Debug + Send + Sync {
    fn stop(&self);
}

/// Which firewall handler receives the connection's next packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Handler {
    /// First-packet handler: fast decisions and handler selection
    #[default]
    Initial,
    /// Stream inspection in progress
    Inspecting,
    /// Decision is settled; packets only re-apply the stored verdict
    None,
}

/// Network scope of a remote address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetScope {
    /// Loopback / own host
    Host,
    /// Link-local
    Link,
    /// Private / site-local
    Site,
    /// Multicast
    Multicast,
    /// Public internet
    Global,
}

impl NetScope {
    /// Classify an address into its scope
    pub fn classify(ip: IpAddr) -> Self {
        match ip {
            IpAddr::V4(v4) => {
                if v4.is_loopback() || v4.is_unspecified() {
                    NetScope::Host
                } else if v4.is_link_local() {
                    NetScope::Link
                } else if v4.is_private() {
                    NetScope::Site
                } else if v4.is_multicast() || v4.is_broadcast() {
                    NetScope::Multicast
                } else {
                    NetScope::Global
                }
            }
            IpAddr::V6(v6) => {
                if v6.is_loopback() || v6.is_unspecified() {
                    NetScope::Host
                } else if (v6.segments()[0] & 0xffc0) == 0xfe80 {
                    NetScope::Link
                } else if (v6.segments()[0] & 0xfe00) == 0xfc00 {
                    NetScope::Site
                } else if v6.is_multicast() {
                    NetScope::Multicast
                } else {
                    NetScope::Global
                }
            }
        }
    }

    /// Scopes that count as "local" for the fast-track DHCP rule
    pub fn is_local(self) -> bool {
        !matches!(self, NetScope::Global)
    }
}

/// What this connection talks to.
///
/// Mutable until the first verdict: the policy collaborator and inspectors
/// may annotate domain, filter lists and the client fingerprint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entity {
    pub remote_ip: IpAddr,
    pub remote_port: u16,
    pub protocol: Protocol,
    pub scope: NetScope,
    /// Domain the connection was resolved from, when known
    pub domain: Option<String>,
    /// Filter-list memberships annotated by policy
    pub lists: Vec<String>,
    /// JA3 client fingerprint recorded by the TLS inspector
    pub ja3: Option<String>,
}

impl Entity {
    pub fn from_info(info: &PacketInfo) -> Self {
        let remote_ip = info.remote_ip();
        Self {
            remote_ip,
            remote_port: info.remote_port(),
            protocol: info.protocol,
            scope: NetScope::classify(remote_ip),
            domain: None,
            lists: Vec::new(),
            ja3: None,
        }
    }
}

/// Sample accounting method
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleMethod {
    /// Replace the stored counters
    Absolute,
    /// Add to the stored counters
    Additive,
}

/// Per-connection byte counters emitted by the OS integration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BandwidthSample {
    pub fingerprint: Fingerprint,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub method: SampleMethod,
}

/// Mutable connection state, serialized by the connection lock
#[derive(Debug)]
pub struct ConnState {
    pub process_id: Option<u32>,
    pub entity: Entity,
    /// What the policy collaborator decided
    pub firewall_verdict: Verdict,
    /// What the pipeline will actually apply
    pub active_verdict: Verdict,
    /// Most severe (lowest-rated) firewall verdict ever held
    pub worst_verdict: Verdict,
    /// Verdict is installed (or due to be installed) in the kernel cache
    pub permanent: bool,
    pub reason: Option<String>,
    pub handler: Handler,
    pub inspecting: bool,
    pub encrypted: bool,
    /// Originated by the firewall process itself; never shown to policy
    pub internal: bool,
    pub tunnel: Option<Arc<dyn TunnelContext>>,
    /// Needs an external save
    pub dirty: bool,
}

impl ConnState {
    fn new(info: &PacketInfo) -> Self {
        Self {
            process_id: info.process_id,
            entity: Entity::from_info(info),
            firewall_verdict: Verdict::Undecided,
            active_verdict: Verdict::Undecided,
            worst_verdict: Verdict::Undecided,
            permanent: false,
            reason: None,
            handler: Handler::Initial,
            inspecting: false,
            encrypted: false,
            internal: false,
            tunnel: None,
            dirty: false,
        }
    }

    /// Upgrade the active verdict; lower-severity values are ignored.
    ///
    /// Returns whether the verdict changed. The re-evaluation path bypasses
    /// this via `set_verdicts_reevaluated`.
    pub fn upgrade_active(&mut self, verdict: Verdict) -> bool {
        if verdict > self.active_verdict {
            self.active_verdict = verdict;
            true
        } else {
            false
        }
    }

    /// Replace both verdicts atomically on re-evaluation
    pub fn set_verdicts_reevaluated(&mut self, firewall: Verdict, active: Verdict) {
        self.firewall_verdict = firewall;
        self.active_verdict = active;
    }

    /// Track the most severe firewall verdict this connection has held
    pub fn update_worst(&mut self) {
        if self.firewall_verdict == Verdict::Undecided {
            return;
        }
        if self.worst_verdict == Verdict::Undecided
            || self.firewall_verdict.rating() < self.worst_verdict.rating()
        {
            self.worst_verdict = self.firewall_verdict;
        }
    }

    /// Whether the worst-seen verdict denies the connection
    pub fn worst_is_denying(&self) -> bool {
        matches!(
            self.worst_verdict,
            Verdict::Block | Verdict::Drop | Verdict::Failed | Verdict::Undeterminable
        )
    }
}

/// One live connection
pub struct Connection {
    pub fingerprint: Fingerprint,
    /// Direction of the first packet
    pub direction: Direction,
    pub started_at: Timestamp,
    state: tokio::sync::Mutex<ConnState>,
    last_seen: AtomicU64,
    ended: AtomicBool,
    rx_bytes: AtomicU64,
    tx_bytes: AtomicU64,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("fingerprint", &self.fingerprint)
            .field("direction", &self.direction)
            .field("ended", &self.ended.load(Ordering::Relaxed))
            .finish()
    }
}

impl Connection {
    /// Create from the first packet of a connection
    pub fn from_first_packet(info: &PacketInfo) -> Self {
        let now = Timestamp::now();
        Self {
            fingerprint: Fingerprint::from_info(info),
            direction: info.direction,
            started_at: now,
            state: tokio::sync::Mutex::new(ConnState::new(info)),
            last_seen: AtomicU64::new(now.as_nanos()),
            ended: AtomicBool::new(false),
            rx_bytes: AtomicU64::new(0),
            tx_bytes: AtomicU64::new(0),
        }
    }

    /// Lock the mutable state; all handler work happens under this lock
    pub async fn lock(&self) -> tokio::sync::MutexGuard<'_, ConnState> {
        self.state.lock().await
    }

    /// Non-async lock attempt, for sync contexts that can tolerate failure
    pub fn try_lock(&self) -> Option<tokio::sync::MutexGuard<'_, ConnState>> {
        self.state.try_lock().ok()
    }

    /// Refresh the liveness stamp
    pub fn touch(&self) {
        self.last_seen
            .store(Timestamp::now().as_nanos(), Ordering::Relaxed);
    }

    /// Seconds since the last packet or sample
    pub fn idle_secs(&self) -> u64 {
        Timestamp::from_nanos(self.last_seen.load(Ordering::Relaxed)).elapsed_secs()
    }

    /// The OS reported this connection terminated
    pub fn mark_ended(&self) {
        self.ended.store(true, Ordering::Release);
    }

    pub fn has_ended(&self) -> bool {
        self.ended.load(Ordering::Acquire)
    }

    /// Apply a bandwidth sample from the OS integration
    pub fn apply_bandwidth(&self, sample: &BandwidthSample) {
        match sample.method {
            SampleMethod::Absolute => {
                self.rx_bytes.store(sample.rx_bytes, Ordering::Relaxed);
                self.tx_bytes.store(sample.tx_bytes, Ordering::Relaxed);
            }
            SampleMethod::Additive => {
                self.rx_bytes.fetch_add(sample.rx_bytes, Ordering::Relaxed);
                self.tx_bytes.fetch_add(sample.tx_bytes, Ordering::Relaxed);
            }
        }
        self.touch();
    }

    pub fn bytes(&self) -> (u64, u64) {
        (
            self.rx_bytes.load(Ordering::Relaxed),
            self.tx_bytes.load(Ordering::Relaxed),
        )
    }
}
