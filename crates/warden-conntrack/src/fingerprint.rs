//! Canonical connection fingerprints
//!
//! A fingerprint identifies a connection independent of packet direction:
//! the tuple is keyed by local/remote rather than src/dst, so the inbound
//! reply of an outbound connection lands on the same record. Port-less
//! protocols are keyed by addresses only.

use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use warden_packet::{PacketInfo, Protocol};

/// Canonical (protocol, local, remote) connection key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint {
    pub protocol: Protocol,
    pub local_ip: IpAddr,
    pub local_port: u16,
    pub remote_ip: IpAddr,
    pub remote_port: u16,
}

impl Fingerprint {
    /// Build the canonical key for a packet
    pub fn from_info(info: &PacketInfo) -> Self {
        let (local_port, remote_port) = if info.has_ports() {
            (info.local_port(), info.remote_port())
        } else {
            (0, 0)
        };
        Self {
            protocol: info.protocol,
            local_ip: info.local_ip(),
            local_port,
            remote_ip: info.remote_ip(),
            remote_port,
        }
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}:{}<->{}:{}",
            self.protocol.number(),
            self.local_ip,
            self.local_port,
            self.remote_ip,
            self.remote_port
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::net::Ipv4Addr;
    use warden_common::Timestamp;
    use warden_packet::{Direction, IpVersion};

    fn info(
        direction: Direction,
        protocol: Protocol,
        src: (IpAddr, u16),
        dst: (IpAddr, u16),
    ) -> PacketInfo {
        PacketInfo {
            direction,
            version: IpVersion::V4,
            protocol,
            src_ip: src.0,
            dst_ip: dst.0,
            src_port: src.1,
            dst_port: dst.1,
            process_id: None,
            seen_at: Timestamp::now(),
            in_tunnel: false,
            icmp: None,
        }
    }

    #[test]
    fn test_direction_symmetry() {
        let local = (IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5)), 40000u16);
        let remote = (IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)), 443u16);

        let out = info(Direction::Outbound, Protocol::Tcp, local, remote);
        let reply = info(Direction::Inbound, Protocol::Tcp, remote, local);

        assert_eq!(Fingerprint::from_info(&out), Fingerprint::from_info(&reply));
    }

    #[test]
    fn test_portless_protocols_use_addresses_only() {
        let local = (IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5)), 0u16);
        let remote = (IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)), 0u16);
        let i = info(Direction::Outbound, Protocol::Icmp, local, remote);
        let fp = Fingerprint::from_info(&i);
        assert_eq!(fp.local_port, 0);
        assert_eq!(fp.remote_port, 0);
    }

    proptest! {
        #[test]
        fn prop_symmetry_holds_for_any_tuple(
            a in any::<u32>(), b in any::<u32>(),
            pa in any::<u16>(), pb in any::<u16>(),
        ) {
            let ip_a = IpAddr::V4(Ipv4Addr::from(a));
            let ip_b = IpAddr::V4(Ipv4Addr::from(b));
            let out = info(Direction::Outbound, Protocol::Udp, (ip_a, pa), (ip_b, pb));
            let back = info(Direction::Inbound, Protocol::Udp, (ip_b, pb), (ip_a, pa));
            prop_assert_eq!(
                Fingerprint::from_info(&out),
                Fingerprint::from_info(&back)
            );
        }
    }
}
