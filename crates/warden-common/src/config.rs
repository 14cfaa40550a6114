//! Core configuration
//!
//! Options recognized by the interception core. Loaded from a JSON file;
//! every field has a default so a missing file yields a working core.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::PathBuf;

/// Configuration of the interception core
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct CoreConfig {
    /// Start without opening any kernel sockets; all packet paths become no-ops
    pub disable_interception: bool,
    /// Enable per-packet latency tracing to the given file
    pub write_packet_metrics: Option<PathBuf>,
    /// Deprecated, accepted and ignored
    #[serde(skip_serializing)]
    pub experimental_nfqueue: bool,
    /// When true, verdicts may be cached in the kernel
    pub permanent_verdicts: bool,
    /// Enable rerouting rogue DNS queries to the internal resolver
    pub dns_query_interception: bool,
    /// Master switch; when false the initial handler short-circuits to Accept
    pub filter_enabled: bool,

    /// Local endpoints the core reroutes to or fast-tracks for
    pub endpoints: Endpoints,
    /// Kernel queue numbers (Linux-class realization)
    pub queues: QueueNumbers,
    /// Timeouts and caps
    pub limits: Limits,
    /// Portscan detector tuning
    pub portscan: PortscanConfig,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            disable_interception: false,
            write_packet_metrics: None,
            experimental_nfqueue: false,
            permanent_verdicts: true,
            dns_query_interception: true,
            filter_enabled: true,
            endpoints: Endpoints::default(),
            queues: QueueNumbers::default(),
            limits: Limits::default(),
            portscan: PortscanConfig::default(),
        }
    }
}

impl CoreConfig {
    /// Load from file
    pub fn load(path: &str) -> Result<Self, std::io::Error> {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// Save to file
    pub fn save(&self, path: &str) -> Result<(), std::io::Error> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, content)
    }
}

/// Local reroute and fast-track endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Endpoints {
    /// Internal nameserver, IPv4 DNAT target
    pub nameserver_v4: IpAddr,
    /// Internal nameserver, IPv6 DNAT target
    pub nameserver_v6: IpAddr,
    /// Nameserver port
    pub nameserver_port: u16,
    /// Tunnel entry, IPv4 DNAT target
    pub tunnel_v4: IpAddr,
    /// Tunnel entry, IPv6 DNAT target
    pub tunnel_v6: IpAddr,
    /// Tunnel entry port
    pub tunnel_port: u16,
    /// Local API endpoint (fast-track rule 6)
    pub api_ip: IpAddr,
    /// Local API port
    pub api_port: u16,
    /// Self-check transport protocol number (fast-track rule 8)
    pub selfcheck_protocol: u8,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            nameserver_v4: IpAddr::V4(Ipv4Addr::new(127, 0, 0, 17)),
            nameserver_v6: IpAddr::V6(Ipv6Addr::LOCALHOST),
            nameserver_port: 53,
            tunnel_v4: IpAddr::V4(Ipv4Addr::new(127, 0, 0, 17)),
            tunnel_v6: IpAddr::V6(Ipv6Addr::LOCALHOST),
            tunnel_port: 717,
            api_ip: IpAddr::V4(Ipv4Addr::new(127, 0, 0, 17)),
            api_port: 817,
            selfcheck_protocol: 254,
        }
    }
}

/// Kernel queue numbers, one per (direction, family)
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct QueueNumbers {
    pub out_v4: u16,
    pub in_v4: u16,
    pub out_v6: u16,
    pub in_v6: u16,
}

impl Default for QueueNumbers {
    fn default() -> Self {
        Self {
            out_v4: 17040,
            in_v4: 17140,
            out_v6: 17060,
            in_v6: 17160,
        }
    }
}

impl QueueNumbers {
    /// All queue numbers in a fixed order
    pub fn all(&self) -> [u16; 4] {
        [self.out_v4, self.in_v4, self.out_v6, self.in_v6]
    }
}

/// Timeouts and caps of the core
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Limits {
    /// Bounded verdict deadline per packet, seconds
    pub verdict_deadline_secs: u64,
    /// Idle timeout after which a connection is pruned, seconds
    pub connection_idle_secs: u64,
    /// Per-direction reassembly buffer cap per connection, bytes
    pub reassembly_cap: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            verdict_deadline_secs: 20,
            connection_idle_secs: 600,
            reassembly_cap: 32 * 1024,
        }
    }
}

/// Portscan detector tuning
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct PortscanConfig {
    /// Score for a probe against a well-known port (< 1024)
    pub score_well_known: u32,
    /// Score for a probe against a registered port (1024..49152)
    pub score_registered: u32,
    /// Score for a probe against a dynamic port
    pub score_dynamic: u32,
    /// Score at which the source IP flips to blocked
    pub block_threshold: u32,
    /// Score ceiling
    pub max_score: u32,
    /// Idle expiry of per-IP state, seconds
    pub idle_expiry_secs: u64,
}

impl Default for PortscanConfig {
    fn default() -> Self {
        Self {
            score_well_known: 40,
            score_registered: 20,
            score_dynamic: 10,
            block_threshold: 160,
            max_score: 320,
            idle_expiry_secs: 24 * 3600,
        }
    }
}
