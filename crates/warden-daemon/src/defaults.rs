//! Default collaborator implementations
//!
//! Permissive stand-ins used until the surrounding application wires in
//! its real policy engine, tunnel client and resolver. The defaults never
//! block traffic; they exist so the core can run and be observed.

use crate::Collaborators;
use async_trait::async_trait;
use std::net::IpAddr;
use std::sync::Arc;
use warden_common::{CoreConfig, Result};
use warden_conntrack::{ConnState, Connection, TunnelContext};
use warden_firewall::interop::{
    HostPolicy, NetworkEnvironment, PolicyDecider, ResolverInfo, SelfcheckSink, TunnelManager,
    VerdictPersistencePolicy,
};
use warden_kernel::NoAttribution;
use warden_packet::{PacketInfo, Verdict};

/// Accepts every connection
pub struct PermissivePolicy;

#[async_trait]
impl PolicyDecider for PermissivePolicy {
    async fn decide_on_connection(
        &self,
        _conn: &Connection,
        state: &mut ConnState,
        _packet: Option<&PacketInfo>,
    ) -> Result<()> {
        state.firewall_verdict = Verdict::Accept;
        state.reason = Some("default policy".into());
        Ok(())
    }
}

/// Never tunnels
pub struct NoTunnel;

#[async_trait]
impl TunnelManager for NoTunnel {
    fn check_tunneling(&self, _conn: &Connection, _state: &mut ConnState) {}

    async fn request_tunneling(
        &self,
        _conn: &Connection,
        _state: &ConnState,
    ) -> Result<Arc<dyn TunnelContext>> {
        Err(warden_common::Error::PolicyError("no tunnel client".into()))
    }
}

/// Resolver endpoints straight from the configuration
pub struct ConfigResolver {
    nameserver_v4: IpAddr,
    nameserver_v6: IpAddr,
    port: u16,
}

impl ConfigResolver {
    pub fn new(config: &CoreConfig) -> Self {
        Self {
            nameserver_v4: config.endpoints.nameserver_v4,
            nameserver_v6: config.endpoints.nameserver_v6,
            port: config.endpoints.nameserver_port,
        }
    }
}

impl ResolverInfo for ConfigResolver {
    fn is_resolver_address(&self, ip: IpAddr, port: u16) -> bool {
        port == self.port && (ip == self.nameserver_v4 || ip == self.nameserver_v6)
    }
}

/// Loopback-only view of the host's addresses
pub struct LoopbackNetEnv;

impl NetworkEnvironment for LoopbackNetEnv {
    fn is_own_ip(&self, ip: IpAddr) -> bool {
        ip.is_loopback()
    }

    fn submit_icmp(&self, _info: &PacketInfo, _data: &[u8]) -> bool {
        false
    }
}

/// Discards self-check probes
pub struct NoopSelfcheck;

impl SelfcheckSink for NoopSelfcheck {
    fn submit(&self, _info: &PacketInfo) {}
}

/// Persist every decided verdict
pub struct PersistDecided;

impl VerdictPersistencePolicy for PersistDecided {
    fn should_persist(&self, state: &ConnState) -> bool {
        state.firewall_verdict.is_decided()
    }
}

/// Permits every re-resolved host
pub struct PermissiveHostPolicy;

impl HostPolicy for PermissiveHostPolicy {
    fn host_permitted(&self, _state: &ConnState, _host: &str) -> bool {
        true
    }
}

/// The full default set for a configuration
pub fn collaborators(config: &CoreConfig) -> Collaborators {
    Collaborators {
        policy: Arc::new(PermissivePolicy),
        tunnel: Arc::new(NoTunnel),
        resolver: Arc::new(ConfigResolver::new(config)),
        netenv: Arc::new(LoopbackNetEnv),
        selfcheck: Arc::new(NoopSelfcheck),
        persistence: Arc::new(PersistDecided),
        attributor: Arc::new(NoAttribution),
        host_policy: Arc::new(PermissiveHostPolicy),
        cert_verifier: None,
    }
}
