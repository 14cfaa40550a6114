//! Packet and connection verdicts
//!
//! The derived `Ord` gives the monotonic-upgrade order: a verdict may only
//! move towards `Failed` except on explicit re-evaluation. `rating` gives a
//! second, privacy-oriented order used for the worst-seen downgrade logic.

use serde::{Deserialize, Serialize};

/// Disposition of a packet or connection
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[repr(u8)]
pub enum Verdict {
    /// No decision yet
    #[default]
    Undecided = 0,
    /// The pipeline gave up deciding (e.g. inspection inconclusive)
    Undeterminable = 1,
    /// Pass the packet
    Accept = 2,
    /// DNAT to the internal nameserver
    RerouteToNameserver = 3,
    /// DNAT to the local tunnel entry
    RerouteToTunnel = 4,
    /// Actively reject
    Block = 5,
    /// Silently discard
    Drop = 6,
    /// The pipeline failed for this connection
    Failed = 7,
}

impl Verdict {
    /// Privacy rating: how much the verdict exposes the connection.
    ///
    /// Used to track the worst (lowest-rated) verdict a connection has ever
    /// held: `Accept > RerouteToTunnel > RerouteToNameserver > Block > Drop
    /// > Failed > Undeterminable > Undecided`.
    pub fn rating(self) -> u8 {
        match self {
            Verdict::Accept => 7,
            Verdict::RerouteToTunnel => 6,
            Verdict::RerouteToNameserver => 5,
            Verdict::Block => 4,
            Verdict::Drop => 3,
            Verdict::Failed => 2,
            Verdict::Undeterminable => 1,
            Verdict::Undecided => 0,
        }
    }

    /// True for verdicts that imply a kernel-side DNAT rather than a plain
    /// accept/deny
    pub fn is_reroute(self) -> bool {
        matches!(self, Verdict::RerouteToNameserver | Verdict::RerouteToTunnel)
    }

    /// True once a real decision exists
    pub fn is_decided(self) -> bool {
        !matches!(self, Verdict::Undecided | Verdict::Undeterminable)
    }

    /// Short name used in logs and metrics lines
    pub fn as_str(self) -> &'static str {
        match self {
            Verdict::Undecided => "undecided",
            Verdict::Undeterminable => "undeterminable",
            Verdict::Accept => "accept",
            Verdict::RerouteToNameserver => "reroute-dns",
            Verdict::RerouteToTunnel => "reroute-tunnel",
            Verdict::Block => "block",
            Verdict::Drop => "drop",
            Verdict::Failed => "failed",
        }
    }
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
