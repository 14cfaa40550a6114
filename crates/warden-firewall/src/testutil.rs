//! Mock collaborators and packet builders shared by the crate's tests

use crate::fasttrack::FastTracker;
use crate::interop::*;
use crate::pipeline::{Collaborators, Firewall};
use crate::ports::OwnPortRegistry;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use warden_common::metrics::PacketCounters;
use warden_common::{CoreConfig, Error, Result, Timestamp};
use warden_conntrack::{
    BandwidthSample, ConnState, Connection, ConnectionTracker, TunnelContext,
};
use warden_inspect::portscan::PortscanDetector;
use warden_inspect::{InspectionFramework, Inspector, InspectorFactory, StreamOutcome};
use warden_kernel::OsIntegration;
use warden_packet::{
    parse, Decision, Direction, IpVersion, Packet, PacketHandle, PacketInfo, Protocol, Verdict,
};

/// PID the firewall process runs under in tests
pub const OWN_PID: u32 = 999;

/// Bytes the marker inspector consumes before giving up
pub const MARKER_BUDGET: usize = 64;

// ---------------------------------------------------------------------------
// mock collaborators
// ---------------------------------------------------------------------------

pub struct MockPolicy {
    verdict: Mutex<Verdict>,
    fail_next: AtomicBool,
    invocations: AtomicU64,
}

impl MockPolicy {
    fn new() -> Self {
        Self {
            verdict: Mutex::new(Verdict::Accept),
            fail_next: AtomicBool::new(false),
            invocations: AtomicU64::new(0),
        }
    }

    pub fn set_verdict(&self, verdict: Verdict) {
        *self.verdict.lock() = verdict;
    }

    pub fn fail_next(&self) {
        self.fail_next.store(true, Ordering::Relaxed);
    }

    pub fn invocations(&self) -> u64 {
        self.invocations.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl PolicyDecider for MockPolicy {
    async fn decide_on_connection(
        &self,
        _conn: &Connection,
        state: &mut ConnState,
        _packet: Option<&PacketInfo>,
    ) -> Result<()> {
        self.invocations.fetch_add(1, Ordering::Relaxed);
        if self.fail_next.swap(false, Ordering::Relaxed) {
            return Err(Error::PolicyError("mock policy failure".into()));
        }
        state.firewall_verdict = *self.verdict.lock();
        state.reason = Some("mock policy".into());
        Ok(())
    }
}

struct MockTunnelContext {
    stopped: Arc<AtomicBool>,
}

impl TunnelContext for MockTunnelContext {
    fn stop(&self) {
        self.stopped.store(true, Ordering::Relaxed);
    }
}

pub struct MockTunnel {
    reroute: AtomicBool,
    fail: AtomicBool,
    requests: AtomicU64,
    stopped: Arc<AtomicBool>,
}

impl MockTunnel {
    fn new() -> Self {
        Self {
            reroute: AtomicBool::new(false),
            fail: AtomicBool::new(false),
            requests: AtomicU64::new(0),
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn reroute_all(&self, on: bool) {
        self.reroute.store(on, Ordering::Relaxed);
    }

    pub fn fail_requests(&self, on: bool) {
        self.fail.store(on, Ordering::Relaxed);
    }

    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    pub fn stopped(&self) -> bool {
        self.stopped.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl TunnelManager for MockTunnel {
    fn check_tunneling(&self, _conn: &Connection, state: &mut ConnState) {
        if self.reroute.load(Ordering::Relaxed) && !state.internal {
            state.firewall_verdict = Verdict::RerouteToTunnel;
        }
    }

    async fn request_tunneling(
        &self,
        _conn: &Connection,
        _state: &ConnState,
    ) -> Result<Arc<dyn TunnelContext>> {
        self.requests.fetch_add(1, Ordering::Relaxed);
        if self.fail.load(Ordering::Relaxed) {
            return Err(Error::PolicyError("tunnel unavailable".into()));
        }
        Ok(Arc::new(MockTunnelContext { stopped: self.stopped.clone() }))
    }
}

pub struct MockResolver {
    address: Mutex<SocketAddr>,
}

impl MockResolver {
    fn new() -> Self {
        Self {
            address: Mutex::new("127.0.0.17:53".parse().unwrap()),
        }
    }

    pub fn set_address(&self, address: SocketAddr) {
        *self.address.lock() = address;
    }
}

impl ResolverInfo for MockResolver {
    fn is_resolver_address(&self, ip: IpAddr, port: u16) -> bool {
        let address = *self.address.lock();
        address.ip() == ip && address.port() == port
    }
}

pub struct MockNetEnv {
    own_ips: Mutex<HashSet<IpAddr>>,
    consume_icmp: AtomicBool,
}

impl MockNetEnv {
    fn new() -> Self {
        Self {
            own_ips: Mutex::new(HashSet::new()),
            consume_icmp: AtomicBool::new(false),
        }
    }

    pub fn add_own_ip(&self, ip: IpAddr) {
        self.own_ips.lock().insert(ip);
    }

    pub fn consume_icmp(&self, on: bool) {
        self.consume_icmp.store(on, Ordering::Relaxed);
    }
}

impl NetworkEnvironment for MockNetEnv {
    fn is_own_ip(&self, ip: IpAddr) -> bool {
        self.own_ips.lock().contains(&ip)
    }

    fn submit_icmp(&self, _info: &PacketInfo, _data: &[u8]) -> bool {
        self.consume_icmp.load(Ordering::Relaxed)
    }
}

pub struct MockSelfcheck {
    submissions: AtomicU64,
}

impl MockSelfcheck {
    fn new() -> Self {
        Self { submissions: AtomicU64::new(0) }
    }

    pub fn submissions(&self) -> u64 {
        self.submissions.load(Ordering::Relaxed)
    }
}

impl SelfcheckSink for MockSelfcheck {
    fn submit(&self, _info: &PacketInfo) {
        self.submissions.fetch_add(1, Ordering::Relaxed);
    }
}

struct AllowPersistence;

impl VerdictPersistencePolicy for AllowPersistence {
    fn should_persist(&self, _state: &ConnState) -> bool {
        true
    }
}

/// Integration stub counting cache invalidations
pub struct MockIntegration {
    cache_clears: AtomicU64,
}

impl MockIntegration {
    pub fn new() -> Self {
        Self { cache_clears: AtomicU64::new(0) }
    }

    pub fn cache_clears(&self) -> u64 {
        self.cache_clears.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl OsIntegration for MockIntegration {
    async fn start(&self) -> Result<()> {
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        Ok(())
    }

    fn take_packet_stream(&self) -> Option<mpsc::Receiver<Packet>> {
        None
    }

    fn take_bandwidth_stream(&self) -> Option<mpsc::Receiver<BandwidthSample>> {
        None
    }

    async fn clear_cache(&self) -> Result<()> {
        self.cache_clears.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn update_verdict(&self, _conn: &Connection, _verdict: Verdict) -> Result<()> {
        Ok(())
    }

    async fn delete_tracked_connection(&self, _conn: &Connection) -> Result<()> {
        Ok(())
    }

    fn version(&self) -> String {
        "mock/0.0.0".into()
    }

    async fn reset_all_tracked_connections(&self) -> Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// marker inspector
// ---------------------------------------------------------------------------

struct MarkerInspector {
    marker: Vec<u8>,
}

impl Inspector for MarkerInspector {
    fn name(&self) -> &'static str {
        "marker"
    }

    fn handle_stream(
        &mut self,
        _state: &mut ConnState,
        _direction: Direction,
        stream: &[u8],
    ) -> Result<StreamOutcome> {
        if stream
            .windows(self.marker.len())
            .any(|window| window == self.marker)
        {
            return Ok(StreamOutcome::block("marker found"));
        }
        if stream.len() >= MARKER_BUDGET {
            return Ok(StreamOutcome::give_up());
        }
        Ok(StreamOutcome::need_more())
    }
}

fn marker_factory(marker: &'static [u8]) -> InspectorFactory {
    Box::new(move |_conn: &Connection, _state: &mut ConnState, info: &PacketInfo| {
        (info.protocol == Protocol::Tcp).then(|| {
            Box::new(MarkerInspector { marker: marker.to_vec() }) as Box<dyn Inspector>
        })
    })
}

// ---------------------------------------------------------------------------
// environment
// ---------------------------------------------------------------------------

pub struct TestEnv {
    pub policy: Arc<MockPolicy>,
    pub tunnel: Arc<MockTunnel>,
    pub resolver: Arc<MockResolver>,
    pub netenv: Arc<MockNetEnv>,
    pub selfcheck: Arc<MockSelfcheck>,
    pub counters: Arc<PacketCounters>,
    marker: Option<&'static [u8]>,
}

impl TestEnv {
    pub fn new() -> Self {
        Self {
            policy: Arc::new(MockPolicy::new()),
            tunnel: Arc::new(MockTunnel::new()),
            resolver: Arc::new(MockResolver::new()),
            netenv: Arc::new(MockNetEnv::new()),
            selfcheck: Arc::new(MockSelfcheck::new()),
            counters: Arc::new(PacketCounters::default()),
            marker: None,
        }
    }

    pub fn with_marker_inspector(mut self, marker: &'static [u8]) -> Self {
        self.marker = Some(marker);
        self
    }

    pub fn firewall(&self) -> Firewall {
        self.firewall_with_config(CoreConfig::default())
    }

    pub fn firewall_with_config(&self, config: CoreConfig) -> Firewall {
        let factories: Vec<InspectorFactory> = match self.marker {
            Some(marker) => vec![marker_factory(marker)],
            None => Vec::new(),
        };
        let fasttrack = FastTracker::new(
            config.clone(),
            self.netenv.clone(),
            self.resolver.clone(),
            self.selfcheck.clone(),
        );
        Firewall::new(
            config.clone(),
            Arc::new(ConnectionTracker::new()),
            fasttrack,
            Arc::new(InspectionFramework::new(factories, config.limits.reassembly_cap)),
            Arc::new(PortscanDetector::new(config.portscan)),
            Collaborators {
                policy: self.policy.clone(),
                tunnel: self.tunnel.clone(),
                resolver: self.resolver.clone(),
                persistence: Arc::new(AllowPersistence),
            },
            self.counters.clone(),
            Arc::new(OwnPortRegistry::new()),
            OWN_PID,
        )
    }
}

// ---------------------------------------------------------------------------
// packet builders
// ---------------------------------------------------------------------------

pub fn raw_packet_info(
    direction: Direction,
    protocol: Protocol,
    src: &str,
    dst: &str,
) -> PacketInfo {
    let src: SocketAddr = src.parse().expect("src addr");
    let dst: SocketAddr = dst.parse().expect("dst addr");
    PacketInfo {
        direction,
        version: if src.is_ipv4() { IpVersion::V4 } else { IpVersion::V6 },
        protocol,
        src_ip: src.ip(),
        dst_ip: dst.ip(),
        src_port: src.port(),
        dst_port: dst.port(),
        process_id: Some(1234),
        seen_at: Timestamp::now(),
        in_tunnel: false,
        icmp: None,
    }
}

pub fn packet_from_info(info: PacketInfo) -> (Packet, oneshot::Receiver<Decision>) {
    let raw = bytes::Bytes::from(parse::encode(&info, b""));
    let (tx, rx) = oneshot::channel();
    (
        Packet::new(info, PacketHandle::Queue { queue: 17040, packet_id: 1 }, Some(raw), tx),
        rx,
    )
}

pub fn tcp_packet(src: &str, dst: &str) -> (Packet, oneshot::Receiver<Decision>) {
    packet_from_info(raw_packet_info(Direction::Outbound, Protocol::Tcp, src, dst))
}

pub fn tcp_packet_with_payload(
    src: &str,
    dst: &str,
    payload: &[u8],
) -> (Packet, oneshot::Receiver<Decision>) {
    let info = raw_packet_info(Direction::Outbound, Protocol::Tcp, src, dst);
    let raw = bytes::Bytes::from(parse::encode(&info, payload));
    let (tx, rx) = oneshot::channel();
    (
        Packet::new(info, PacketHandle::Queue { queue: 17040, packet_id: 1 }, Some(raw), tx),
        rx,
    )
}

pub fn udp_packet(src: &str, dst: &str) -> (Packet, oneshot::Receiver<Decision>) {
    packet_from_info(raw_packet_info(Direction::Outbound, Protocol::Udp, src, dst))
}

pub fn udp_packet_for_pid(
    src: &str,
    dst: &str,
    pid: u32,
) -> (Packet, oneshot::Receiver<Decision>) {
    let mut info = raw_packet_info(Direction::Outbound, Protocol::Udp, src, dst);
    info.process_id = Some(pid);
    packet_from_info(info)
}

pub fn inbound_tcp_packet(src: &str, dst: &str) -> (Packet, oneshot::Receiver<Decision>) {
    let mut info = raw_packet_info(Direction::Inbound, Protocol::Tcp, src, dst);
    info.process_id = None;
    packet_from_info(info)
}

pub fn icmp_packet(
    src: &str,
    dst: &str,
    msg_type: u8,
) -> (Packet, oneshot::Receiver<Decision>) {
    let mut info = raw_packet_info(Direction::Outbound, Protocol::Icmp, &format!("{src}:0"), &format!("{dst}:0"));
    info.src_port = 0;
    info.dst_port = 0;
    info.icmp = Some(warden_packet::info::IcmpInfo { msg_type, code: 0 });
    packet_from_info(info)
}
