//! Decision pipeline
//!
//! Entry point for every packet the fast-track filter lets through. The
//! connection's current handler routes the packet: the initial handler
//! runs once per connection and decides between internal traffic, DNS
//! rerouting and the policy path; the inspecting handler feeds enrolled
//! inspectors until they settle; after that packets only re-apply the
//! stored verdict.
//!
//! Pipeline errors never reach the dispatcher: a failure marks the
//! connection Failed and finalization maps that to drop or block.

use crate::fasttrack::{FastTrack, FastTracker};
use crate::interop::{
    PolicyDecider, ResolverInfo, TunnelManager, VerdictPersistencePolicy,
};
use crate::packet_metrics::PacketMetricsWriter;
use crate::ports::OwnPortRegistry;
use std::sync::Arc;
use warden_common::metrics::PacketCounters;
use warden_common::{CoreConfig, Result};
use warden_conntrack::{ConnState, Connection, ConnectionTracker, Handler};
use warden_inspect::portscan::PortscanDetector;
use warden_inspect::InspectionFramework;
use warden_packet::{Direction, Packet, Verdict};

/// External collaborators the pipeline consults
pub struct Collaborators {
    pub policy: Arc<dyn PolicyDecider>,
    pub tunnel: Arc<dyn TunnelManager>,
    pub resolver: Arc<dyn ResolverInfo>,
    pub persistence: Arc<dyn VerdictPersistencePolicy>,
}

/// The per-packet decision engine
pub struct Firewall {
    pub(crate) config: CoreConfig,
    pub(crate) tracker: Arc<ConnectionTracker>,
    pub(crate) fasttrack: FastTracker,
    pub(crate) inspection: Arc<InspectionFramework>,
    pub(crate) portscan: Arc<PortscanDetector>,
    pub(crate) policy: Arc<dyn PolicyDecider>,
    pub(crate) tunnel: Arc<dyn TunnelManager>,
    pub(crate) resolver: Arc<dyn ResolverInfo>,
    pub(crate) persistence: Arc<dyn VerdictPersistencePolicy>,
    pub(crate) counters: Arc<PacketCounters>,
    pub(crate) ports: Arc<OwnPortRegistry>,
    pub(crate) own_pid: u32,
    pub(crate) packet_metrics: Option<PacketMetricsWriter>,
}

impl Firewall {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: CoreConfig,
        tracker: Arc<ConnectionTracker>,
        fasttrack: FastTracker,
        inspection: Arc<InspectionFramework>,
        portscan: Arc<PortscanDetector>,
        collaborators: Collaborators,
        counters: Arc<PacketCounters>,
        ports: Arc<OwnPortRegistry>,
        own_pid: u32,
    ) -> Self {
        let packet_metrics = config
            .write_packet_metrics
            .as_deref()
            .and_then(|path| match PacketMetricsWriter::open(path) {
                Ok(writer) => Some(writer),
                Err(e) => {
                    tracing::warn!(error = %e, "packet metrics disabled");
                    None
                }
            });
        Self {
            config,
            tracker,
            fasttrack,
            inspection,
            portscan,
            policy: collaborators.policy,
            tunnel: collaborators.tunnel,
            resolver: collaborators.resolver,
            persistence: collaborators.persistence,
            counters,
            ports,
            own_pid,
            packet_metrics,
        }
    }

    pub fn tracker(&self) -> &Arc<ConnectionTracker> {
        &self.tracker
    }

    pub fn counters(&self) -> &Arc<PacketCounters> {
        &self.counters
    }

    /// Handle one packet end to end
    pub async fn handle_packet(&self, packet: Packet) {
        let started = packet.info().seen_at;

        if let FastTrack::Handled(reason) = self.fasttrack.apply(&packet) {
            self.counters.fast_tracked.inc();
            metrics::counter!("warden_packets_fasttracked").increment(1);
            if let Some(writer) = &self.packet_metrics {
                writer.record_fasttrack(packet.info(), reason, started);
            }
            return;
        }

        let (conn, track) = self.tracker.get_or_create(packet.info());
        if track.created {
            tracing::debug!(conn = %conn.fingerprint, "connection created");
        }

        // all handler work for this connection happens under its lock
        let mut state = conn.lock().await;
        let outcome = match state.handler {
            Handler::Initial => self.initial_handler(&conn, &mut state, &packet).await,
            Handler::Inspecting => {
                self.inspecting_handler(&conn, &mut state, &packet);
                Ok(())
            }
            Handler::None => {
                let verdict = state.active_verdict;
                self.issue_verdict(&conn, &mut state, &packet, verdict, true);
                Ok(())
            }
        };

        if let Err(e) = outcome {
            tracing::warn!(conn = %conn.fingerprint, error = %e, "pipeline failure");
            state.firewall_verdict = Verdict::Failed;
            state.reason = Some(e.to_string());
            finalize_verdict(&mut state, conn.direction);
            state.handler = Handler::None;
            let verdict = state.active_verdict;
            self.issue_verdict(&conn, &mut state, &packet, verdict, true);
        }

        if let Some(writer) = &self.packet_metrics {
            writer.record(&conn.fingerprint, state.active_verdict, started);
        }
    }

    async fn initial_handler(
        &self,
        conn: &Connection,
        state: &mut ConnState,
        packet: &Packet,
    ) -> Result<()> {
        let info = packet.info();

        if !self.config.filter_enabled {
            state.firewall_verdict = Verdict::Accept;
            state.active_verdict = Verdict::Accept;
            state.reason = Some("filter disabled".into());
            state.handler = Handler::None;
            self.issue_verdict(conn, state, packet, Verdict::Accept, true);
            return Ok(());
        }

        // connections the firewall process opened itself
        if info.direction.is_outbound() && self.ports.is_own(info.protocol, info.local_port()) {
            state.internal = true;
            state.firewall_verdict = Verdict::Accept;
            state.active_verdict = Verdict::Accept;
            state.reason = Some("internal".into());
            state.handler = Handler::None;
            self.issue_verdict(conn, state, packet, Verdict::Accept, true);
            return Ok(());
        }

        // rogue DNS goes to the internal resolver instead
        if self.wants_dns_reroute(info) {
            state.internal = true;
            state.firewall_verdict = Verdict::RerouteToNameserver;
            state.active_verdict = Verdict::RerouteToNameserver;
            state.reason = Some("rerouting DNS query to internal resolver".into());
            state.handler = Handler::None;
            self.issue_verdict(conn, state, packet, Verdict::RerouteToNameserver, true);
            return Ok(());
        }

        self.filter_connection(conn, state, Some(packet)).await?;

        if state.inspecting {
            state.handler = Handler::Inspecting;
            self.inspecting_handler(conn, state, packet);
        } else {
            state.handler = Handler::None;
            let verdict = state.active_verdict;
            self.issue_verdict(conn, state, packet, verdict, true);
        }
        Ok(())
    }

    fn wants_dns_reroute(&self, info: &warden_packet::PacketInfo) -> bool {
        info.direction.is_outbound()
            && self.config.dns_query_interception
            && info.dst_port == 53
            && !self.resolver.is_resolver_address(info.dst_ip, info.dst_port)
            && info.process_id != Some(self.own_pid)
    }

    /// Decide on a connection: policy, encryption marker, tunneling,
    /// finalization, worst-seen tracking. `packet` is `None` on the
    /// re-evaluation path.
    pub(crate) async fn filter_connection(
        &self,
        conn: &Connection,
        state: &mut ConnState,
        packet: Option<&Packet>,
    ) -> Result<()> {
        if self.config.filter_enabled {
            let scanning = packet
                .filter(|p| p.info().direction.is_inbound() && state.process_id.is_none())
                .map(|p| self.portscan.record(p.info()))
                .unwrap_or(false);
            if scanning {
                state.firewall_verdict = Verdict::Block;
                state.reason = Some("portscan".into());
            } else {
                self.policy
                    .decide_on_connection(conn, state, packet.map(|p| p.info()))
                    .await?;
            }
        }

        if matches!(state.entity.remote_port, 22 | 443 | 465 | 853 | 993 | 995) {
            state.encrypted = true;
        }

        self.tunnel.check_tunneling(conn, state);
        finalize_verdict(state, conn.direction);

        if state.active_verdict == Verdict::RerouteToTunnel && state.tunnel.is_none() {
            match self.tunnel.request_tunneling(conn, state).await {
                Ok(context) => state.tunnel = Some(context),
                Err(e) => {
                    state.firewall_verdict = Verdict::Failed;
                    state.reason = Some(e.to_string());
                    finalize_verdict(state, conn.direction);
                }
            }
        }

        state.update_worst();

        // inspectors enroll on the first packet only
        if let Some(p) = packet {
            if !state.inspecting
                && matches!(
                    state.firewall_verdict,
                    Verdict::Accept | Verdict::RerouteToTunnel
                )
            {
                state.inspecting = self.inspection.enroll(conn, state, p.info());
            }
        }
        Ok(())
    }

    pub(crate) fn inspecting_handler(
        &self,
        conn: &Connection,
        state: &mut ConnState,
        packet: &Packet,
    ) {
        let payload = packet.l4_payload().unwrap_or_default();
        let result =
            self.inspection
                .inspect(conn, state, packet.info().direction, &payload);

        if result.verdict > state.firewall_verdict {
            state.firewall_verdict = result.verdict;
        }
        if result.verdict > state.active_verdict {
            state.active_verdict = result.verdict;
        }
        state.update_worst();

        if !result.continues {
            state.inspecting = false;
            state.handler = Handler::None;
        }

        let verdict = state.active_verdict;
        self.issue_verdict(conn, state, packet, verdict, !result.continues);
    }

    /// Tear down per-connection resources after removal from the tracker
    pub fn teardown_connection(&self, conn: &Connection) {
        self.inspection.release(&conn.fingerprint);
        if let Some(mut state) = conn.try_lock() {
            // the tunnel collaborator owns the teardown; the reference
            // just goes away with the connection
            state.tunnel = None;
        }
    }
}

/// Derive the active verdict from the firewall verdict.
///
/// Undecided, undeterminable or failed decisions default to drop inbound
/// and block outbound. A decided connection may leave a denying initial
/// state; stream protocols that change their verdict afterwards are
/// actively killed instead of silently diverging.
pub(crate) fn finalize_verdict(state: &mut ConnState, direction: Direction) {
    let firewall = state.firewall_verdict;
    match firewall {
        Verdict::Undecided | Verdict::Undeterminable | Verdict::Failed => {
            state.active_verdict = if direction.is_inbound() {
                Verdict::Drop
            } else {
                Verdict::Block
            };
        }
        _ => {
            if state.active_verdict == Verdict::Undecided {
                state.active_verdict = firewall;
            } else if state.worst_is_denying() {
                state.active_verdict = firewall;
            } else if state.entity.protocol.is_packet_based() {
                state.active_verdict = firewall;
            } else if state.active_verdict != firewall {
                state.active_verdict = Verdict::Block;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::*;
    use warden_packet::{Decision, Protocol};

    fn decision(rx: &mut tokio::sync::oneshot::Receiver<Decision>) -> Decision {
        rx.try_recv().expect("verdict expected")
    }

    #[tokio::test]
    async fn test_outbound_dns_reroute() {
        let env = TestEnv::new();
        let fw = env.firewall();
        // scenario: outbound UDP to a public resolver from a foreign process
        let (packet, mut rx) = udp_packet("10.0.0.5:40000", "8.8.8.8:53");

        fw.handle_packet(packet).await;

        let d = decision(&mut rx);
        assert_eq!(d.verdict, Verdict::RerouteToNameserver);
        assert!(d.permanent);
        assert_eq!(env.policy.invocations(), 0, "no policy invocation");

        let conn = fw.tracker().get_all().pop().unwrap();
        let state = conn.lock().await;
        assert!(state.internal);
    }

    #[tokio::test]
    async fn test_dns_to_internal_resolver_not_rerouted() {
        let env = TestEnv::new();
        env.resolver.set_address("127.0.0.17:53".parse().unwrap());
        let fw = env.firewall();
        let (packet, mut rx) = udp_packet("10.0.0.99:40000", "127.0.0.17:53");

        fw.handle_packet(packet).await;

        // goes through policy instead of the reroute shortcut
        assert_eq!(env.policy.invocations(), 1);
        assert_eq!(decision(&mut rx).verdict, Verdict::Accept);
    }

    #[tokio::test]
    async fn test_own_pid_dns_not_rerouted() {
        let env = TestEnv::new();
        let fw = env.firewall();
        let (packet, mut rx) = udp_packet_for_pid("10.0.0.5:40000", "8.8.8.8:53", OWN_PID);

        fw.handle_packet(packet).await;

        assert_eq!(env.policy.invocations(), 1);
        assert_eq!(decision(&mut rx).verdict, Verdict::Accept);
    }

    #[tokio::test]
    async fn test_internal_connection_skips_policy() {
        let env = TestEnv::new();
        let fw = env.firewall();
        fw.ports.register(Protocol::Tcp, 40777);
        let (packet, mut rx) = tcp_packet("10.0.0.5:40777", "93.184.216.34:443");

        fw.handle_packet(packet).await;

        assert_eq!(decision(&mut rx).verdict, Verdict::Accept);
        assert_eq!(env.policy.invocations(), 0);
        let conn = fw.tracker().get_all().pop().unwrap();
        assert!(conn.lock().await.internal);
    }

    #[tokio::test]
    async fn test_filter_disabled_short_circuits() {
        let env = TestEnv::new();
        let mut config = CoreConfig::default();
        config.filter_enabled = false;
        let fw = env.firewall_with_config(config);
        let (packet, mut rx) = tcp_packet("10.0.0.5:40000", "93.184.216.34:443");

        fw.handle_packet(packet).await;

        assert_eq!(decision(&mut rx).verdict, Verdict::Accept);
        assert_eq!(env.policy.invocations(), 0);
    }

    #[tokio::test]
    async fn test_policy_block_is_applied() {
        let env = TestEnv::new();
        env.policy.set_verdict(Verdict::Block);
        let fw = env.firewall();
        let (packet, mut rx) = tcp_packet("10.0.0.5:40000", "203.0.113.9:80");

        fw.handle_packet(packet).await;

        let d = decision(&mut rx);
        assert_eq!(d.verdict, Verdict::Block);
        assert_eq!(env.counters.blocked.get(), 1);
    }

    #[tokio::test]
    async fn test_policy_error_fails_closed() {
        let env = TestEnv::new();
        env.policy.fail_next();
        let fw = env.firewall();

        // outbound failure maps to block
        let (packet, mut rx) = tcp_packet("10.0.0.5:40000", "203.0.113.9:80");
        fw.handle_packet(packet).await;
        assert_eq!(decision(&mut rx).verdict, Verdict::Block);

        let conn = fw.tracker().get_all().pop().unwrap();
        assert_eq!(conn.lock().await.firewall_verdict, Verdict::Failed);
    }

    #[tokio::test]
    async fn test_inbound_failure_drops() {
        let env = TestEnv::new();
        env.policy.fail_next();
        let fw = env.firewall();

        let (packet, mut rx) = inbound_tcp_packet("203.0.113.9:50000", "10.0.0.5:8080");
        fw.handle_packet(packet).await;
        assert_eq!(decision(&mut rx).verdict, Verdict::Drop);
    }

    #[tokio::test]
    async fn test_settled_connection_reapplies_verdict() {
        let env = TestEnv::new();
        env.policy.set_verdict(Verdict::Block);
        let fw = env.firewall();

        let (first, mut rx1) = tcp_packet("10.0.0.5:40000", "203.0.113.9:80");
        fw.handle_packet(first).await;
        assert_eq!(decision(&mut rx1).verdict, Verdict::Block);
        assert_eq!(env.policy.invocations(), 1);

        // second packet: handler is None, no new policy call
        let (second, mut rx2) = tcp_packet("10.0.0.5:40000", "203.0.113.9:80");
        fw.handle_packet(second).await;
        assert_eq!(decision(&mut rx2).verdict, Verdict::Block);
        assert_eq!(env.policy.invocations(), 1);
    }

    #[tokio::test]
    async fn test_verdicts_are_monotonic_across_packets() {
        let env = TestEnv::new();
        let fw = env.firewall();

        let (first, mut rx1) = tcp_packet("10.0.0.5:40000", "93.184.216.34:443");
        fw.handle_packet(first).await;
        assert_eq!(decision(&mut rx1).verdict, Verdict::Accept);

        // a later, lower-severity wish cannot downgrade the connection
        let conn = fw.tracker().get_all().pop().unwrap();
        {
            let mut state = conn.lock().await;
            state.active_verdict = Verdict::Block;
        }
        let (second, mut rx2) = tcp_packet("10.0.0.5:40000", "93.184.216.34:443");
        fw.handle_packet(second).await;
        assert_eq!(decision(&mut rx2).verdict, Verdict::Block);
    }

    #[tokio::test]
    async fn test_tunnel_reroute_requests_context() {
        let env = TestEnv::new();
        env.tunnel.reroute_all(true);
        let fw = env.firewall();
        let (packet, mut rx) = tcp_packet("10.0.0.5:40000", "93.184.216.34:443");

        fw.handle_packet(packet).await;

        assert_eq!(decision(&mut rx).verdict, Verdict::RerouteToTunnel);
        assert_eq!(env.tunnel.requests(), 1);
        let conn = fw.tracker().get_all().pop().unwrap();
        assert!(conn.lock().await.tunnel.is_some());
    }

    #[tokio::test]
    async fn test_tunnel_request_failure_fails_connection() {
        let env = TestEnv::new();
        env.tunnel.reroute_all(true);
        env.tunnel.fail_requests(true);
        let fw = env.firewall();
        let (packet, mut rx) = tcp_packet("10.0.0.5:40000", "93.184.216.34:443");

        fw.handle_packet(packet).await;

        // outbound failed connection blocks
        assert_eq!(decision(&mut rx).verdict, Verdict::Block);
        let conn = fw.tracker().get_all().pop().unwrap();
        let state = conn.lock().await;
        assert_eq!(state.firewall_verdict, Verdict::Failed);
        assert!(state.tunnel.is_none());
    }

    #[tokio::test]
    async fn test_encrypted_ports_flag_connection() {
        let env = TestEnv::new();
        let fw = env.firewall();
        let (packet, _rx) = tcp_packet("10.0.0.5:40000", "93.184.216.34:993");
        fw.handle_packet(packet).await;

        let conn = fw.tracker().get_all().pop().unwrap();
        assert!(conn.lock().await.encrypted);
    }

    #[tokio::test]
    async fn test_inspection_flow_blocks_on_marker() {
        let env = TestEnv::new().with_marker_inspector(b"EVIL");
        let fw = env.firewall();

        // first packet enrolls and stays undecided: non-permanent accept
        let (first, mut rx1) = tcp_packet_with_payload("10.0.0.5:40000", "93.184.216.34:443", b"EV");
        fw.handle_packet(first).await;
        let d1 = decision(&mut rx1);
        assert_eq!(d1.verdict, Verdict::Accept);
        assert!(!d1.permanent, "non-permanent while inspection continues");

        // marker completes: the pooled verdict kills the connection
        let (second, mut rx2) =
            tcp_packet_with_payload("10.0.0.5:40000", "93.184.216.34:443", b"IL");
        fw.handle_packet(second).await;
        assert_eq!(decision(&mut rx2).verdict, Verdict::Block);

        let conn = fw.tracker().get_all().pop().unwrap();
        {
            let state = conn.lock().await;
            assert_eq!(state.active_verdict, Verdict::Block);
            assert!(!state.inspecting);
        }

        // subsequent packets re-apply the block permanently
        let (third, mut rx3) = tcp_packet("10.0.0.5:40000", "93.184.216.34:443");
        fw.handle_packet(third).await;
        let d3 = decision(&mut rx3);
        assert_eq!(d3.verdict, Verdict::Block);
        assert!(d3.permanent);
    }

    #[tokio::test]
    async fn test_clean_inspection_settles_permanent() {
        let env = TestEnv::new().with_marker_inspector(b"EVIL");
        let fw = env.firewall();

        let (first, mut rx1) =
            tcp_packet_with_payload("10.0.0.5:40000", "93.184.216.34:443", b"GET /clean");
        fw.handle_packet(first).await;
        assert!(!decision(&mut rx1).permanent);

        // inspector gives up after its byte budget; verdict settles
        let (second, mut rx2) = tcp_packet_with_payload(
            "10.0.0.5:40000",
            "93.184.216.34:443",
            &[0u8; MARKER_BUDGET],
        );
        fw.handle_packet(second).await;
        let d2 = decision(&mut rx2);
        assert_eq!(d2.verdict, Verdict::Accept);
        assert!(d2.permanent);
    }

    #[tokio::test]
    async fn test_portscan_source_gets_blocked() {
        let env = TestEnv::new();
        let fw = env.firewall();

        // four unattributed probes against well-known ports
        for port in [21u16, 22, 23, 25] {
            let (packet, _rx) =
                inbound_tcp_packet("203.0.113.7:55555", &format!("10.0.0.5:{port}"));
            fw.handle_packet(packet).await;
        }

        let (packet, mut rx) = inbound_tcp_packet("203.0.113.7:55555", "10.0.0.5:80");
        fw.handle_packet(packet).await;
        let d = decision(&mut rx);
        assert_eq!(d.verdict, Verdict::Block);

        let conn = fw
            .tracker()
            .get_all()
            .into_iter()
            .find(|c| c.fingerprint.local_port == 80)
            .unwrap();
        assert_eq!(conn.lock().await.reason.as_deref(), Some("portscan"));
    }

    #[tokio::test]
    async fn test_undecided_policy_fails_closed_outbound() {
        let env = TestEnv::new();
        env.policy.set_verdict(Verdict::Undecided);
        let fw = env.firewall();
        let (packet, mut rx) = tcp_packet("10.0.0.5:40000", "203.0.113.9:80");
        fw.handle_packet(packet).await;
        assert_eq!(decision(&mut rx).verdict, Verdict::Block);
    }

    #[tokio::test]
    async fn test_finalize_verdict_table() {
        let env = TestEnv::new();
        let fw = env.firewall();
        let (packet, _rx) = tcp_packet("10.0.0.5:40000", "93.184.216.34:443");
        fw.handle_packet(packet).await;
        let conn = fw.tracker().get_all().pop().unwrap();
        let mut state = conn.lock().await;

        // undecided firewall: drop inbound / block outbound
        state.firewall_verdict = Verdict::Undecided;
        state.active_verdict = Verdict::Accept;
        finalize_verdict(&mut state, Direction::Inbound);
        assert_eq!(state.active_verdict, Verdict::Drop);
        finalize_verdict(&mut state, Direction::Outbound);
        assert_eq!(state.active_verdict, Verdict::Block);

        // fresh active adopts the firewall verdict
        state.firewall_verdict = Verdict::Accept;
        state.active_verdict = Verdict::Undecided;
        finalize_verdict(&mut state, Direction::Outbound);
        assert_eq!(state.active_verdict, Verdict::Accept);

        // stream protocol with a changed verdict is actively killed
        state.firewall_verdict = Verdict::Accept;
        state.active_verdict = Verdict::RerouteToTunnel;
        state.worst_verdict = Verdict::Accept;
        finalize_verdict(&mut state, Direction::Outbound);
        assert_eq!(state.active_verdict, Verdict::Block);

        // denying worst-seen allows the upgrade out
        state.firewall_verdict = Verdict::Accept;
        state.active_verdict = Verdict::Block;
        state.worst_verdict = Verdict::Block;
        finalize_verdict(&mut state, Direction::Outbound);
        assert_eq!(state.active_verdict, Verdict::Accept);

        // packet-based protocols follow the firewall verdict directly
        state.entity.protocol = Protocol::Udp;
        state.firewall_verdict = Verdict::Drop;
        state.active_verdict = Verdict::Accept;
        state.worst_verdict = Verdict::Accept;
        finalize_verdict(&mut state, Direction::Outbound);
        assert_eq!(state.active_verdict, Verdict::Drop);
    }
}
