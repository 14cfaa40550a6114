//! The packet handed to the decision pipeline
//!
//! Owns the pending decision channel back to the OS integration. The
//! channel is single-consumer and single-shot: the first verdict wins,
//! later attempts deliver nothing and report `VerdictAlreadySet`. The
//! race between an inspector returning and an independent deadline firing
//! stays harmless because the reconciler logs and swallows every verdict
//! delivery error.

use crate::info::PacketInfo;
use crate::parse;
use crate::verdict::Verdict;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use warden_common::{Error, Result};

/// Identifies the packet to its OS integration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketHandle {
    /// Kernel packet queue: queue number plus per-queue packet id
    Queue { queue: u16, packet_id: u32 },
    /// Kernel device: verdict-request id
    Device { verdict_id: u64 },
    /// Observation event; there is nothing to verdict
    Observation,
}

/// Final disposition sent back to the integration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub verdict: Verdict,
    /// Also install in the kernel cache so future packets of this
    /// connection skip userspace
    pub permanent: bool,
}

/// Late payload fetch, for integrations that deliver headers first
pub trait PayloadSource: Send + Sync {
    fn fetch(&self, handle: &PacketHandle) -> Result<Bytes>;
}

/// One intercepted packet
pub struct Packet {
    info: PacketInfo,
    handle: PacketHandle,
    raw: Mutex<Option<Bytes>>,
    source: Option<Arc<dyn PayloadSource>>,
    sink: Mutex<Option<oneshot::Sender<Decision>>>,
    verdicted: AtomicBool,
    fast_tracked: bool,
    info_only: bool,
}

impl std::fmt::Debug for Packet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Packet")
            .field("info", &self.info)
            .field("handle", &self.handle)
            .field("verdicted", &self.verdicted.load(Ordering::Relaxed))
            .field("fast_tracked", &self.fast_tracked)
            .field("info_only", &self.info_only)
            .finish()
    }
}

impl Packet {
    /// A packet awaiting a verdict through `sink`
    pub fn new(
        info: PacketInfo,
        handle: PacketHandle,
        raw: Option<Bytes>,
        sink: oneshot::Sender<Decision>,
    ) -> Self {
        Self {
            info,
            handle,
            raw: Mutex::new(raw),
            source: None,
            sink: Mutex::new(Some(sink)),
            verdicted: AtomicBool::new(false),
            fast_tracked: false,
            info_only: false,
        }
    }

    /// An observation-only packet; verdict operations report
    /// `InfoOnlyPacket` and touch nothing
    pub fn observation(info: PacketInfo) -> Self {
        Self {
            info,
            handle: PacketHandle::Observation,
            raw: Mutex::new(None),
            source: None,
            sink: Mutex::new(None),
            verdicted: AtomicBool::new(false),
            fast_tracked: false,
            info_only: true,
        }
    }

    /// Attach a late payload fetcher
    pub fn with_payload_source(mut self, source: Arc<dyn PayloadSource>) -> Self {
        self.source = Some(source);
        self
    }

    /// Mark as already fast-tracked by the integration
    pub fn with_integration_fast_track(mut self) -> Self {
        self.fast_tracked = true;
        self
    }

    pub fn info(&self) -> &PacketInfo {
        &self.info
    }

    pub fn handle(&self) -> PacketHandle {
        self.handle
    }

    /// The integration already applied its own shortcut to this packet
    pub fn fast_tracked_by_integration(&self) -> bool {
        self.fast_tracked
    }

    /// Metadata-only packet from an observation event
    pub fn info_only(&self) -> bool {
        self.info_only
    }

    /// Whether a verdict has been delivered
    pub fn verdict_set(&self) -> bool {
        self.verdicted.load(Ordering::Acquire)
    }

    /// Raw L3 bytes, fetching them from the integration if necessary
    pub fn load_packet_data(&self) -> Result<Bytes> {
        let mut raw = self.raw.lock();
        if let Some(data) = raw.as_ref() {
            return Ok(data.clone());
        }
        let source = self.source.as_ref().ok_or_else(|| {
            Error::PayloadLoadFailed("integration does not support late payload fetch".into())
        })?;
        let data = source.fetch(&self.handle)?;
        *raw = Some(data.clone());
        Ok(data)
    }

    /// The L4 payload view of the raw bytes (empty for header-only packets)
    pub fn l4_payload(&self) -> Result<Bytes> {
        let data = self.load_packet_data()?;
        let offset = parse::l4_payload_offset(&data).unwrap_or(data.len());
        Ok(data.slice(offset..))
    }

    pub fn accept(&self) -> Result<()> {
        self.deliver(Verdict::Accept, false)
    }

    pub fn permanent_accept(&self) -> Result<()> {
        self.deliver(Verdict::Accept, true)
    }

    pub fn block(&self) -> Result<()> {
        self.deliver(Verdict::Block, false)
    }

    pub fn permanent_block(&self) -> Result<()> {
        self.deliver(Verdict::Block, true)
    }

    pub fn drop_packet(&self) -> Result<()> {
        self.deliver(Verdict::Drop, false)
    }

    pub fn permanent_drop(&self) -> Result<()> {
        self.deliver(Verdict::Drop, true)
    }

    pub fn reroute_to_nameserver(&self) -> Result<()> {
        self.deliver(Verdict::RerouteToNameserver, true)
    }

    pub fn reroute_to_tunnel(&self) -> Result<()> {
        self.deliver(Verdict::RerouteToTunnel, true)
    }

    /// Deliver an arbitrary decision (used by the reconciler)
    pub fn deliver(&self, verdict: Verdict, permanent: bool) -> Result<()> {
        if self.info_only {
            return Err(Error::InfoOnlyPacket);
        }
        if self.verdicted.swap(true, Ordering::AcqRel) {
            // at-most-once; nothing reaches the kernel twice
            return Err(Error::VerdictAlreadySet);
        }
        let sender = self.sink.lock().take().ok_or(Error::IntegrationNotReady)?;
        sender
            .send(Decision { verdict, permanent })
            .map_err(|_| Error::ChannelClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::info::{Direction, IpVersion, Protocol};
    use std::net::{IpAddr, Ipv4Addr};
    use warden_common::Timestamp;

    fn info() -> PacketInfo {
        PacketInfo {
            direction: Direction::Outbound,
            version: IpVersion::V4,
            protocol: Protocol::Tcp,
            src_ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5)),
            dst_ip: IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)),
            src_port: 40000,
            dst_port: 443,
            process_id: None,
            seen_at: Timestamp::now(),
            in_tunnel: false,
            icmp: None,
        }
    }

    fn packet() -> (Packet, oneshot::Receiver<Decision>) {
        let (tx, rx) = oneshot::channel();
        (
            Packet::new(info(), PacketHandle::Queue { queue: 17040, packet_id: 1 }, None, tx),
            rx,
        )
    }

    #[test]
    fn test_verdict_at_most_once() {
        let (p, mut rx) = packet();
        p.accept().unwrap();
        assert!(p.verdict_set());
        // second verdict: reported, never delivered
        assert!(matches!(
            p.permanent_block(),
            Err(Error::VerdictAlreadySet)
        ));

        let decision = rx.try_recv().unwrap();
        assert_eq!(decision.verdict, Verdict::Accept);
        assert!(!decision.permanent);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_permanent_variants() {
        let (p, mut rx) = packet();
        p.permanent_drop().unwrap();
        let decision = rx.try_recv().unwrap();
        assert_eq!(decision.verdict, Verdict::Drop);
        assert!(decision.permanent);
    }

    #[test]
    fn test_reroutes_are_permanent() {
        let (p, mut rx) = packet();
        p.reroute_to_nameserver().unwrap();
        let decision = rx.try_recv().unwrap();
        assert_eq!(decision.verdict, Verdict::RerouteToNameserver);
        assert!(decision.permanent);
    }

    #[test]
    fn test_info_only_rejects_verdicts() {
        let p = Packet::observation(info());
        assert!(matches!(p.accept(), Err(Error::InfoOnlyPacket)));
        assert!(matches!(p.drop_packet(), Err(Error::InfoOnlyPacket)));
        // the attempt did not consume the one-shot state
        assert!(!p.verdict_set());
    }

    #[test]
    fn test_info_only_payload_load_fails() {
        let p = Packet::observation(info());
        assert!(matches!(
            p.load_packet_data(),
            Err(Error::PayloadLoadFailed(_))
        ));
    }

    #[test]
    fn test_closed_channel_reports_error() {
        let (p, rx) = packet();
        drop(rx);
        assert!(matches!(p.block(), Err(Error::ChannelClosed)));
    }

    #[test]
    fn test_raw_data_and_payload_view() {
        let raw = Bytes::from(parse::encode(&info(), b"payload"));
        let (tx, _rx) = oneshot::channel();
        let p = Packet::new(
            info(),
            PacketHandle::Queue { queue: 17040, packet_id: 2 },
            Some(raw),
            tx,
        );
        assert_eq!(&p.l4_payload().unwrap()[..], b"payload");
    }
}
