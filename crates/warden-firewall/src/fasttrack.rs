//! Fast-track filter
//!
//! Stateless per-packet shortcuts for trusted traffic classes, applied
//! before the connection tracker. Every rule either issues a verdict and
//! reports the packet handled, or falls through to the pipeline.

use crate::interop::{NetworkEnvironment, ResolverInfo, SelfcheckSink};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use warden_common::CoreConfig;
use warden_packet::{Packet, Protocol};

// NetScope lives with the entity model but classifies plain addresses too
use warden_conntrack::NetScope as Scope;

/// Reserved "previously permanently blocked" sentinel addresses
pub const BLOCK_SENTINEL_V4: Ipv4Addr = Ipv4Addr::new(0, 0, 0, 17);
pub const BLOCK_SENTINEL_V6: Ipv6Addr = Ipv6Addr::new(0, 0, 0, 0, 0, 0, 0, 0x17);

const DHCP_PORTS: [u16; 4] = [67, 68, 546, 547];

fn is_block_sentinel(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4 == BLOCK_SENTINEL_V4,
        IpAddr::V6(v6) => v6 == BLOCK_SENTINEL_V6,
    }
}

/// Outcome of the fast-track filter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FastTrack {
    /// Verdict issued; reason for metrics and logs
    Handled(&'static str),
    NotHandled,
}

pub struct FastTracker {
    config: CoreConfig,
    netenv: Arc<dyn NetworkEnvironment>,
    resolver: Arc<dyn ResolverInfo>,
    selfcheck: Arc<dyn SelfcheckSink>,
}

impl FastTracker {
    pub fn new(
        config: CoreConfig,
        netenv: Arc<dyn NetworkEnvironment>,
        resolver: Arc<dyn ResolverInfo>,
        selfcheck: Arc<dyn SelfcheckSink>,
    ) -> Self {
        Self { config, netenv, resolver, selfcheck }
    }

    /// Apply the rules in order; issues the verdict itself when it handles
    /// the packet
    pub fn apply(&self, packet: &Packet) -> FastTrack {
        let info = packet.info();
        let endpoints = &self.config.endpoints;

        // 1. the integration already took a shortcut; observe only
        if packet.fast_tracked_by_integration() {
            tracing::trace!(dst = %info.dst_ip, "integration fast-track observed");
            return FastTrack::Handled("integration");
        }

        // 2. loop-back destination of a previously blocked connection;
        //    the self-check protocol owns this address (rule 8)
        if is_block_sentinel(info.dst_ip)
            && info.protocol.number() != endpoints.selfcheck_protocol
        {
            log_verdict(packet.permanent_block(), "sentinel");
            return FastTrack::Handled("blocked sentinel");
        }

        // 3. network self-check pattern
        if info.src_ip == info.dst_ip && info.src_port == info.dst_port {
            log_verdict(packet.permanent_accept(), "self-check");
            return FastTrack::Handled("self-check");
        }

        // 4. ICMP: offer to the trace listener, then echo goes through the
        //    full pipeline, everything else is accepted for good
        if info.protocol.is_icmp() {
            let data = packet.load_packet_data().unwrap_or_default();
            if self.netenv.submit_icmp(info, &data) {
                log_verdict(packet.accept(), "icmp trace");
                return FastTrack::Handled("icmp trace");
            }
            if info.is_icmp_echo() {
                return FastTrack::NotHandled;
            }
            log_verdict(packet.permanent_accept(), "icmp");
            return FastTrack::Handled("icmp");
        }

        // 5. DHCP and DHCPv6 against local scopes
        if info.protocol == Protocol::Udp
            && DHCP_PORTS.contains(&info.dst_port)
            && Scope::classify(info.dst_ip).is_local()
        {
            log_verdict(packet.permanent_accept(), "dhcp");
            return FastTrack::Handled("dhcp");
        }

        // 6. own connection to the local API endpoint
        if info.protocol == Protocol::Tcp
            && info.dst_ip == endpoints.api_ip
            && info.dst_port == endpoints.api_port
            && self.netenv.is_own_ip(info.src_ip)
        {
            log_verdict(packet.permanent_accept(), "api");
            return FastTrack::Handled("api");
        }

        // 7. own queries to the internal resolver
        if self.resolver.is_resolver_address(info.dst_ip, info.dst_port)
            && self.netenv.is_own_ip(info.src_ip)
        {
            log_verdict(packet.permanent_accept(), "resolver");
            return FastTrack::Handled("resolver");
        }

        // 8. system-integration self-check probe
        if info.protocol.number() == endpoints.selfcheck_protocol
            && is_block_sentinel(info.dst_ip)
        {
            self.selfcheck.submit(info);
            log_verdict(packet.drop_packet(), "integration self-check");
            return FastTrack::Handled("integration self-check");
        }

        FastTrack::NotHandled
    }
}

fn log_verdict(result: warden_common::Result<()>, rule: &'static str) {
    if let Err(e) = result {
        // the packet may already be past its decision horizon
        tracing::debug!(rule, error = %e, "fast-track verdict not delivered");
    }
}
