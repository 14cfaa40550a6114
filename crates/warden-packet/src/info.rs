//! Parsed packet metadata
//!
//! `PacketInfo` is immutable after parse. The local/remote accessors fold
//! the direction so the rest of the core never branches on inbound/outbound
//! when it only cares about "our side" vs "their side".

use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use warden_common::Timestamp;

/// Direction of a packet relative to this host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    /// The opposite direction
    pub fn flip(self) -> Self {
        match self {
            Direction::Inbound => Direction::Outbound,
            Direction::Outbound => Direction::Inbound,
        }
    }

    pub fn is_inbound(self) -> bool {
        matches!(self, Direction::Inbound)
    }

    pub fn is_outbound(self) -> bool {
        matches!(self, Direction::Outbound)
    }
}

/// IP version of the outer header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IpVersion {
    V4,
    V6,
}

/// Transport protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Protocol {
    Tcp,
    Udp,
    UdpLite,
    Icmp,
    Icmp6,
    Igmp,
    Other(u8),
}

impl Protocol {
    /// From the IP protocol / next-header number
    pub fn from_number(number: u8) -> Self {
        match number {
            1 => Protocol::Icmp,
            2 => Protocol::Igmp,
            6 => Protocol::Tcp,
            17 => Protocol::Udp,
            58 => Protocol::Icmp6,
            136 => Protocol::UdpLite,
            other => Protocol::Other(other),
        }
    }

    /// The IP protocol / next-header number
    pub fn number(self) -> u8 {
        match self {
            Protocol::Icmp => 1,
            Protocol::Igmp => 2,
            Protocol::Tcp => 6,
            Protocol::Udp => 17,
            Protocol::Icmp6 => 58,
            Protocol::UdpLite => 136,
            Protocol::Other(other) => other,
        }
    }

    /// True for protocols that carry ports
    pub fn has_ports(self) -> bool {
        matches!(self, Protocol::Tcp | Protocol::Udp | Protocol::UdpLite)
    }

    /// True for datagram protocols without stream semantics.
    ///
    /// Finalization treats these differently: a changed verdict does not
    /// force a kill the way it does for streams.
    pub fn is_packet_based(self) -> bool {
        !matches!(self, Protocol::Tcp)
    }

    pub fn is_icmp(self) -> bool {
        matches!(self, Protocol::Icmp | Protocol::Icmp6)
    }
}

/// ICMP type and code, when the packet is ICMP/ICMPv6
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IcmpInfo {
    pub msg_type: u8,
    pub code: u8,
}

impl IcmpInfo {
    /// Echo request or reply, for either ICMP version
    pub fn is_echo(&self, protocol: Protocol) -> bool {
        match protocol {
            Protocol::Icmp => matches!(self.msg_type, 0 | 8),
            Protocol::Icmp6 => matches!(self.msg_type, 128 | 129),
            _ => false,
        }
    }
}

/// Immutable metadata of one intercepted packet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacketInfo {
    pub direction: Direction,
    pub version: IpVersion,
    pub protocol: Protocol,
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    /// 0 when the protocol carries no ports
    pub src_port: u16,
    /// 0 when the protocol carries no ports
    pub dst_port: u16,
    /// Attributed process id; `None` means undefined/unattributed
    pub process_id: Option<u32>,
    pub seen_at: Timestamp,
    /// Packet already travels inside the tunnel
    pub in_tunnel: bool,
    /// ICMP type/code when applicable
    pub icmp: Option<IcmpInfo>,
}

impl PacketInfo {
    /// Address on this host's side
    pub fn local_ip(&self) -> IpAddr {
        match self.direction {
            Direction::Inbound => self.dst_ip,
            Direction::Outbound => self.src_ip,
        }
    }

    /// Address on the peer's side
    pub fn remote_ip(&self) -> IpAddr {
        match self.direction {
            Direction::Inbound => self.src_ip,
            Direction::Outbound => self.dst_ip,
        }
    }

    /// Port on this host's side (0 if N/A)
    pub fn local_port(&self) -> u16 {
        match self.direction {
            Direction::Inbound => self.dst_port,
            Direction::Outbound => self.src_port,
        }
    }

    /// Port on the peer's side (0 if N/A)
    pub fn remote_port(&self) -> u16 {
        match self.direction {
            Direction::Inbound => self.src_port,
            Direction::Outbound => self.dst_port,
        }
    }

    /// Whether the transport protocol carries ports
    pub fn has_ports(&self) -> bool {
        self.protocol.has_ports()
    }

    /// ICMP echo request/reply
    pub fn is_icmp_echo(&self) -> bool {
        self.icmp
            .map(|i| i.is_echo(self.protocol))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn info(direction: Direction) -> PacketInfo {
        PacketInfo {
            direction,
            version: IpVersion::V4,
            protocol: Protocol::Tcp,
            src_ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5)),
            dst_ip: IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34)),
            src_port: 40000,
            dst_port: 443,
            process_id: Some(1000),
            seen_at: Timestamp::now(),
            in_tunnel: false,
            icmp: None,
        }
    }

    #[test]
    fn test_local_remote_outbound() {
        let i = info(Direction::Outbound);
        assert_eq!(i.local_ip(), i.src_ip);
        assert_eq!(i.remote_ip(), i.dst_ip);
        assert_eq!(i.local_port(), 40000);
        assert_eq!(i.remote_port(), 443);
    }

    #[test]
    fn test_local_remote_inbound() {
        let i = info(Direction::Inbound);
        assert_eq!(i.local_ip(), i.dst_ip);
        assert_eq!(i.remote_ip(), i.src_ip);
        assert_eq!(i.local_port(), 443);
        assert_eq!(i.remote_port(), 40000);
    }

    #[test]
    fn test_protocol_numbers() {
        for p in [
            Protocol::Tcp,
            Protocol::Udp,
            Protocol::UdpLite,
            Protocol::Icmp,
            Protocol::Icmp6,
            Protocol::Igmp,
            Protocol::Other(99),
        ] {
            assert_eq!(Protocol::from_number(p.number()), p);
        }
    }

    #[test]
    fn test_icmp_echo() {
        let echo = IcmpInfo { msg_type: 8, code: 0 };
        assert!(echo.is_echo(Protocol::Icmp));
        assert!(!echo.is_echo(Protocol::Icmp6));
        let ns = IcmpInfo { msg_type: 135, code: 0 };
        assert!(!ns.is_echo(Protocol::Icmp6));
        let echo6 = IcmpInfo { msg_type: 128, code: 0 };
        assert!(echo6.is_echo(Protocol::Icmp6));
    }
}
