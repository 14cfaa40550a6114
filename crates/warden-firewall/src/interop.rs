//! Collaborator contracts
//!
//! The core never decides whether a destination is permitted, resolves
//! names, attributes processes or moves tunnel bytes; it consumes these
//! capabilities through the narrow traits below.

use async_trait::async_trait;
use std::net::IpAddr;
use std::sync::Arc;
use warden_common::Result;
use warden_conntrack::{ConnState, Connection, TunnelContext};
use warden_packet::PacketInfo;

pub use warden_inspect::http::HostPolicy;
pub use warden_inspect::tls::CertificateVerifier;
pub use warden_kernel::ProcessAttributor;

/// The policy engine: maps a connection to an allow/deny decision.
///
/// Sets the firewall verdict and reason, and may annotate the entity
/// (domain, scope, filter-list membership). Must be idempotent for
/// re-evaluation, where `packet` is `None`.
#[async_trait]
pub trait PolicyDecider: Send + Sync {
    async fn decide_on_connection(
        &self,
        conn: &Connection,
        state: &mut ConnState,
        packet: Option<&PacketInfo>,
    ) -> Result<()>;
}

/// The tunnel client
#[async_trait]
pub trait TunnelManager: Send + Sync {
    /// May set the connection verdict to `RerouteToTunnel`
    fn check_tunneling(&self, conn: &Connection, state: &mut ConnState);

    /// Set up tunneling for the connection; the returned context is a
    /// non-owning handle used to stop the tunnel on re-evaluation
    async fn request_tunneling(
        &self,
        conn: &Connection,
        state: &ConnState,
    ) -> Result<Arc<dyn TunnelContext>>;
}

/// The DNS resolver's address surface
pub trait ResolverInfo: Send + Sync {
    /// Whether `ip:port` is the internal resolver endpoint
    fn is_resolver_address(&self, ip: IpAddr, port: u16) -> bool;
}

/// Host network environment queries and the ICMP trace listener
pub trait NetworkEnvironment: Send + Sync {
    /// Whether `ip` is assigned to this host
    fn is_own_ip(&self, ip: IpAddr) -> bool;

    /// Offer an ICMP packet for trace correlation; returns whether a
    /// listener consumed it
    fn submit_icmp(&self, info: &PacketInfo, data: &[u8]) -> bool;
}

/// Sink for system-integration self-check packets
pub trait SelfcheckSink: Send + Sync {
    fn submit(&self, info: &PacketInfo);
}

/// Configuration query deciding whether a connection's verdict may be
/// installed permanently in the kernel
pub trait VerdictPersistencePolicy: Send + Sync {
    fn should_persist(&self, state: &ConnState) -> bool;
}
