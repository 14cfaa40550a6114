//! Warden Kernel - platform integrations
//!
//! One logical interface, three realizations with identical semantics:
//!
//! - `nfqueue`: kernel packet queues plus firewall-table rules (Linux)
//! - `kext`: kernel extension spoken to over device I/O control (Windows)
//! - `probe`: observation-only kernel-probe event stream
//!
//! Every realization guarantees: each emitted packet receives exactly one
//! verdict within the deadline or is defaulted to drop; `clear_cache`
//! removes all persistent entries; `update_verdict` is idempotent per
//! (connection, verdict); start/stop are reentrant-safe.

#![warn(clippy::all)]

pub mod marks;

pub mod kext;
#[cfg(target_os = "linux")]
pub mod nfqueue;
pub mod probe;

use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use warden_common::{Error, Result};
use warden_conntrack::{BandwidthSample, Connection, Fingerprint};
use warden_packet::{Decision, Packet, PacketInfo, Verdict};

/// Attributes a packet to the local process that owns its socket.
///
/// `None` means undefined; undefined counts as unattributed for the
/// portscan detector.
pub trait ProcessAttributor: Send + Sync {
    fn attribute(&self, info: &PacketInfo) -> Option<u32>;
}

/// Attributor that never attributes; used by observation-only setups and
/// tests
pub struct NoAttribution;

impl ProcessAttributor for NoAttribution {
    fn attribute(&self, _info: &PacketInfo) -> Option<u32> {
        None
    }
}

/// Platform-specific source of packets and sink of verdicts
#[async_trait]
pub trait OsIntegration: Send + Sync {
    /// Install kernel rules/handles and begin feeding packets. Reentrant:
    /// a second start is a no-op. On error no residue is left behind.
    async fn start(&self) -> Result<()>;

    /// Stop feeding packets and remove kernel state. Reentrant.
    async fn stop(&self) -> Result<()>;

    /// The packet stream; the dispatcher takes it exactly once
    fn take_packet_stream(&self) -> Option<mpsc::Receiver<Packet>>;

    /// The bandwidth sample stream; taken exactly once
    fn take_bandwidth_stream(&self) -> Option<mpsc::Receiver<BandwidthSample>>;

    /// Remove all persistent verdict entries from the kernel cache
    async fn clear_cache(&self) -> Result<()>;

    /// Update the cached verdict for a connection; idempotent for the same
    /// (connection, verdict) pair
    async fn update_verdict(&self, conn: &Connection, verdict: Verdict) -> Result<()>;

    /// Forget kernel tracking state for one connection
    async fn delete_tracked_connection(&self, conn: &Connection) -> Result<()>;

    /// Version of the kernel-side counterpart
    fn version(&self) -> String;

    /// Forget kernel tracking state for all connections
    async fn reset_all_tracked_connections(&self) -> Result<()>;

    /// Register a callback for kernel-reported connection terminations.
    /// Realizations without termination reports leave this a no-op.
    fn set_connection_end_handler(&self, _handler: Box<dyn Fn(Fingerprint) + Send + Sync>) {}
}

/// Integration used when interception is disabled: no kernel sockets, all
/// packet paths are no-ops.
pub struct NoopIntegration {
    packets: parking_lot::Mutex<Option<mpsc::Receiver<Packet>>>,
    bandwidth: parking_lot::Mutex<Option<mpsc::Receiver<BandwidthSample>>>,
}

impl NoopIntegration {
    pub fn new() -> Self {
        let (_ptx, prx) = mpsc::channel(1);
        let (_btx, brx) = mpsc::channel(1);
        // senders drop immediately; streams stay empty and close
        Self {
            packets: parking_lot::Mutex::new(Some(prx)),
            bandwidth: parking_lot::Mutex::new(Some(brx)),
        }
    }
}

impl Default for NoopIntegration {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OsIntegration for NoopIntegration {
    async fn start(&self) -> Result<()> {
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        Ok(())
    }

    fn take_packet_stream(&self) -> Option<mpsc::Receiver<Packet>> {
        self.packets.lock().take()
    }

    fn take_bandwidth_stream(&self) -> Option<mpsc::Receiver<BandwidthSample>> {
        self.bandwidth.lock().take()
    }

    async fn clear_cache(&self) -> Result<()> {
        Ok(())
    }

    async fn update_verdict(&self, _conn: &Connection, _verdict: Verdict) -> Result<()> {
        Ok(())
    }

    async fn delete_tracked_connection(&self, _conn: &Connection) -> Result<()> {
        Ok(())
    }

    fn version(&self) -> String {
        "noop/0.0.0".into()
    }

    async fn reset_all_tracked_connections(&self) -> Result<()> {
        Ok(())
    }
}

/// Await a packet's decision, bounded by the verdict deadline. A dropped
/// sender (shutdown drain) or an elapsed deadline yields the default drop.
pub async fn await_decision(rx: oneshot::Receiver<Decision>, deadline: Duration) -> Decision {
    match tokio::time::timeout(deadline, rx).await {
        Ok(Ok(decision)) => decision,
        Ok(Err(_)) => Decision { verdict: Verdict::Drop, permanent: false },
        Err(_) => {
            tracing::warn!("verdict deadline elapsed, defaulting to drop");
            Decision { verdict: Verdict::Drop, permanent: false }
        }
    }
}

/// Await the packet's decision with the configured deadline, then hand it
/// to the realization's kernel writer.
pub fn spawn_verdict_wait<F>(
    rx: oneshot::Receiver<Decision>,
    deadline: Duration,
    apply: F,
) -> tokio::task::JoinHandle<()>
where
    F: FnOnce(Decision) + Send + 'static,
{
    tokio::spawn(async move {
        apply(await_decision(rx, deadline).await);
    })
}

/// Join a reader thread, bounded.
///
/// Stop paths must not hang on a kernel read that never returns; a thread
/// that misses the limit is left detached and `Error::Timeout` reported.
pub fn join_timeout(handle: std::thread::JoinHandle<()>, limit: Duration) -> Result<()> {
    let deadline = std::time::Instant::now() + limit;
    while !handle.is_finished() {
        if std::time::Instant::now() >= deadline {
            return Err(Error::Timeout);
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    let _ = handle.join();
    Ok(())
}

/// Bounded exponential backoff for kernel socket reconnects
#[derive(Debug, Clone)]
pub struct Backoff {
    attempt: u32,
    max_attempts: u32,
    base: Duration,
    cap: Duration,
}

impl Backoff {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            attempt: 0,
            max_attempts,
            base: Duration::from_millis(100),
            cap: Duration::from_secs(30),
        }
    }

    /// Next delay, or `None` once the attempts are exhausted
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.max_attempts {
            return None;
        }
        let exp = self.base.saturating_mul(1u32 << self.attempt.min(16));
        self.attempt += 1;
        Some(exp.min(self.cap))
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// Userspace mirror of the kernel's permanent-verdict cache.
///
/// The kernel owns the authoritative cache; the mirror exists so
/// `update_verdict` can stay idempotent and `clear_cache` knows what it
/// invalidated.
#[derive(Default)]
pub struct VerdictCacheMirror {
    entries: dashmap::DashMap<warden_conntrack::Fingerprint, Verdict>,
}

impl VerdictCacheMirror {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an entry; returns false when the identical pair is already
    /// present (the kernel write can be skipped)
    pub fn record(&self, fingerprint: warden_conntrack::Fingerprint, verdict: Verdict) -> bool {
        match self.entries.insert(fingerprint, verdict) {
            Some(previous) if previous == verdict => false,
            _ => true,
        }
    }

    pub fn forget(&self, fingerprint: &warden_conntrack::Fingerprint) {
        self.entries.remove(fingerprint);
    }

    /// Drop all entries, returning how many were installed
    pub fn clear(&self) -> usize {
        let count = self.entries.len();
        self.entries.clear();
        count
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Build a `Packet` plus the verdict-wait wiring in one step.
///
/// Returns the packet and the receiver half the realization awaits.
pub fn packet_with_sink(
    info: PacketInfo,
    handle: warden_packet::PacketHandle,
    raw: Option<bytes::Bytes>,
) -> (Packet, oneshot::Receiver<Decision>) {
    let (tx, rx) = oneshot::channel();
    (Packet::new(info, handle, raw, tx), rx)
}
