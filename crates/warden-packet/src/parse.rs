//! L3/L4 header parsing
//!
//! Packets arrive from the kernel queue starting at the IP header (no link
//! layer). Parsing fills a `PacketInfo`; the payload view used by the
//! inspection framework is computed from the same offsets.

use crate::info::{Direction, IcmpInfo, IpVersion, PacketInfo, Protocol};
use thiserror::Error;
use warden_common::Timestamp;

/// Parse failure
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("packet truncated: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },
    #[error("unsupported IP version {0}")]
    BadVersion(u8),
}

/// Parse a raw L3 buffer into packet info.
///
/// The transport header may be absent or truncated; ports then stay 0 and
/// only the network-layer fields are populated.
pub fn parse_l3(data: &[u8], direction: Direction) -> Result<PacketInfo, ParseError> {
    if data.is_empty() {
        return Err(ParseError::Truncated { need: 1, have: 0 });
    }
    match data[0] >> 4 {
        4 => parse_v4(data, direction),
        6 => parse_v6(data, direction),
        v => Err(ParseError::BadVersion(v)),
    }
}

fn parse_v4(data: &[u8], direction: Direction) -> Result<PacketInfo, ParseError> {
    if data.len() < 20 {
        return Err(ParseError::Truncated { need: 20, have: data.len() });
    }
    let ihl = ((data[0] & 0x0f) as usize) * 4;
    if ihl < 20 || data.len() < ihl {
        return Err(ParseError::Truncated { need: ihl.max(20), have: data.len() });
    }

    let protocol = Protocol::from_number(data[9]);
    let src_ip = std::net::Ipv4Addr::new(data[12], data[13], data[14], data[15]).into();
    let dst_ip = std::net::Ipv4Addr::new(data[16], data[17], data[18], data[19]).into();

    let l4 = &data[ihl..];
    let (src_port, dst_port) = transport_ports(protocol, l4);
    let icmp = icmp_info(protocol, l4);

    Ok(PacketInfo {
        direction,
        version: IpVersion::V4,
        protocol,
        src_ip,
        dst_ip,
        src_port,
        dst_port,
        process_id: None,
        seen_at: Timestamp::now(),
        in_tunnel: false,
        icmp,
    })
}

fn parse_v6(data: &[u8], direction: Direction) -> Result<PacketInfo, ParseError> {
    if data.len() < 40 {
        return Err(ParseError::Truncated { need: 40, have: data.len() });
    }

    let src: [u8; 16] = data[8..24].try_into().unwrap();
    let dst: [u8; 16] = data[24..40].try_into().unwrap();

    let (next_header, l4_offset) = skip_v6_extensions(data[6], &data[40..]);
    let protocol = Protocol::from_number(next_header);
    let l4 = &data[40 + l4_offset..];
    let (src_port, dst_port) = transport_ports(protocol, l4);
    let icmp = icmp_info(protocol, l4);

    Ok(PacketInfo {
        direction,
        version: IpVersion::V6,
        protocol,
        src_ip: std::net::Ipv6Addr::from(src).into(),
        dst_ip: std::net::Ipv6Addr::from(dst).into(),
        src_port,
        dst_port,
        process_id: None,
        seen_at: Timestamp::now(),
        in_tunnel: false,
        icmp,
    })
}

/// Walk the IPv6 extension-header chain. Returns the final next-header
/// value and the offset of the transport header relative to `rest`.
fn skip_v6_extensions(mut next: u8, rest: &[u8]) -> (u8, usize) {
    let mut offset = 0usize;
    loop {
        match next {
            // hop-by-hop, routing, destination options: 8-byte units
            0 | 43 | 60 => {
                if rest.len() < offset + 2 {
                    return (next, offset);
                }
                let hdr_len = (rest[offset + 1] as usize + 1) * 8;
                next = rest[offset];
                offset += hdr_len;
            }
            // fragment: fixed 8 bytes
            44 => {
                if rest.len() < offset + 8 {
                    return (next, offset);
                }
                next = rest[offset];
                offset += 8;
            }
            _ => return (next, offset),
        }
    }
}

fn transport_ports(protocol: Protocol, l4: &[u8]) -> (u16, u16) {
    if !protocol.has_ports() || l4.len() < 4 {
        return (0, 0);
    }
    (
        u16::from_be_bytes([l4[0], l4[1]]),
        u16::from_be_bytes([l4[2], l4[3]]),
    )
}

fn icmp_info(protocol: Protocol, l4: &[u8]) -> Option<IcmpInfo> {
    if protocol.is_icmp() && l4.len() >= 2 {
        Some(IcmpInfo { msg_type: l4[0], code: l4[1] })
    } else {
        None
    }
}

/// Offset of the L4 payload within a raw L3 buffer, if the headers are
/// complete. Used to feed the stream reassembly buffers.
pub fn l4_payload_offset(data: &[u8]) -> Option<usize> {
    if data.is_empty() {
        return None;
    }
    let (l4_start, protocol) = match data[0] >> 4 {
        4 => {
            if data.len() < 20 {
                return None;
            }
            let ihl = ((data[0] & 0x0f) as usize) * 4;
            (ihl, Protocol::from_number(data[9]))
        }
        6 => {
            if data.len() < 40 {
                return None;
            }
            let (next, ext) = skip_v6_extensions(data[6], &data[40..]);
            (40 + ext, Protocol::from_number(next))
        }
        _ => return None,
    };
    let l4 = data.get(l4_start..)?;
    let header = match protocol {
        Protocol::Tcp => {
            if l4.len() < 13 {
                return None;
            }
            ((l4[12] >> 4) as usize) * 4
        }
        Protocol::Udp | Protocol::UdpLite => 8,
        _ => return None,
    };
    if l4.len() < header {
        return None;
    }
    Some(l4_start + header)
}

/// The L4 payload of a raw L3 buffer (empty slice for header-only packets)
pub fn l4_payload(data: &[u8]) -> Option<&[u8]> {
    l4_payload_offset(data).map(|off| &data[off..])
}

/// Re-encode packet info as a minimal L3 header plus payload.
///
/// Checksums are left zero; the result is semantically equal to the parsed
/// input (addresses, ports, protocol, version), which is what the test
/// harness and the probe realization need.
pub fn encode(info: &PacketInfo, payload: &[u8]) -> Vec<u8> {
    let l4 = encode_l4(info, payload);
    match info.version {
        IpVersion::V4 => {
            let mut buf = vec![0u8; 20];
            buf[0] = 0x45;
            let total = 20 + l4.len();
            buf[2..4].copy_from_slice(&(total as u16).to_be_bytes());
            buf[8] = 64; // ttl
            buf[9] = info.protocol.number();
            if let (std::net::IpAddr::V4(src), std::net::IpAddr::V4(dst)) =
                (info.src_ip, info.dst_ip)
            {
                buf[12..16].copy_from_slice(&src.octets());
                buf[16..20].copy_from_slice(&dst.octets());
            }
            buf.extend_from_slice(&l4);
            buf
        }
        IpVersion::V6 => {
            let mut buf = vec![0u8; 40];
            buf[0] = 0x60;
            buf[4..6].copy_from_slice(&(l4.len() as u16).to_be_bytes());
            buf[6] = info.protocol.number();
            buf[7] = 64; // hop limit
            if let (std::net::IpAddr::V6(src), std::net::IpAddr::V6(dst)) =
                (info.src_ip, info.dst_ip)
            {
                buf[8..24].copy_from_slice(&src.octets());
                buf[24..40].copy_from_slice(&dst.octets());
            }
            buf.extend_from_slice(&l4);
            buf
        }
    }
}

fn encode_l4(info: &PacketInfo, payload: &[u8]) -> Vec<u8> {
    match info.protocol {
        Protocol::Tcp => {
            let mut l4 = vec![0u8; 20];
            l4[0..2].copy_from_slice(&info.src_port.to_be_bytes());
            l4[2..4].copy_from_slice(&info.dst_port.to_be_bytes());
            l4[12] = 5 << 4; // data offset: 20 bytes
            l4.extend_from_slice(payload);
            l4
        }
        Protocol::Udp | Protocol::UdpLite => {
            let mut l4 = vec![0u8; 8];
            l4[0..2].copy_from_slice(&info.src_port.to_be_bytes());
            l4[2..4].copy_from_slice(&info.dst_port.to_be_bytes());
            l4[4..6].copy_from_slice(&((8 + payload.len()) as u16).to_be_bytes());
            l4.extend_from_slice(payload);
            l4
        }
        Protocol::Icmp | Protocol::Icmp6 => {
            let icmp = info.icmp.unwrap_or(IcmpInfo { msg_type: 8, code: 0 });
            let mut l4 = vec![icmp.msg_type, icmp.code, 0, 0];
            l4.extend_from_slice(payload);
            l4
        }
        _ => payload.to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

    fn tcp_info() -> PacketInfo {
        PacketInfo {
            direction: Direction::Outbound,
            version: IpVersion::V4,
            protocol: Protocol::Tcp,
            src_ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5)),
            dst_ip: IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34)),
            src_port: 40000,
            dst_port: 443,
            process_id: None,
            seen_at: Timestamp::from_nanos(0),
            in_tunnel: false,
            icmp: None,
        }
    }

    #[test]
    fn test_v4_roundtrip_semantic_equality() {
        let info = tcp_info();
        let raw = encode(&info, b"hello");
        let parsed = parse_l3(&raw, Direction::Outbound).unwrap();
        assert_eq!(parsed.src_ip, info.src_ip);
        assert_eq!(parsed.dst_ip, info.dst_ip);
        assert_eq!(parsed.src_port, info.src_port);
        assert_eq!(parsed.dst_port, info.dst_port);
        assert_eq!(parsed.protocol, info.protocol);
        assert_eq!(parsed.version, info.version);
        assert_eq!(l4_payload(&raw).unwrap(), b"hello");
    }

    #[test]
    fn test_v6_roundtrip_semantic_equality() {
        let info = PacketInfo {
            version: IpVersion::V6,
            protocol: Protocol::Udp,
            src_ip: IpAddr::V6(Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1)),
            dst_ip: IpAddr::V6(Ipv6Addr::LOCALHOST),
            src_port: 5353,
            dst_port: 53,
            ..tcp_info()
        };
        let raw = encode(&info, &[0xde, 0xad]);
        let parsed = parse_l3(&raw, Direction::Outbound).unwrap();
        assert_eq!(parsed.src_ip, info.src_ip);
        assert_eq!(parsed.dst_ip, info.dst_ip);
        assert_eq!(parsed.src_port, 5353);
        assert_eq!(parsed.dst_port, 53);
        assert_eq!(parsed.protocol, Protocol::Udp);
        assert_eq!(l4_payload(&raw).unwrap(), &[0xde, 0xad]);
    }

    #[test]
    fn test_empty_payload() {
        let raw = encode(&tcp_info(), b"");
        let parsed = parse_l3(&raw, Direction::Outbound).unwrap();
        assert_eq!(parsed.dst_port, 443);
        assert_eq!(l4_payload(&raw).unwrap(), b"");
    }

    #[test]
    fn test_unknown_protocol_has_no_ports() {
        let info = PacketInfo {
            protocol: Protocol::Other(99),
            ..tcp_info()
        };
        let raw = encode(&info, b"opaque");
        let parsed = parse_l3(&raw, Direction::Outbound).unwrap();
        assert_eq!(parsed.src_port, 0);
        assert_eq!(parsed.dst_port, 0);
        assert!(!parsed.has_ports());
        assert_eq!(l4_payload(&raw), None);
    }

    #[test]
    fn test_icmp_type_parse() {
        let info = PacketInfo {
            protocol: Protocol::Icmp,
            src_port: 0,
            dst_port: 0,
            icmp: Some(IcmpInfo { msg_type: 8, code: 0 }),
            ..tcp_info()
        };
        let raw = encode(&info, &[]);
        let parsed = parse_l3(&raw, Direction::Outbound).unwrap();
        assert!(parsed.is_icmp_echo());
        assert_eq!(parsed.src_port, 0);
    }

    #[test]
    fn test_truncated() {
        assert!(matches!(
            parse_l3(&[0x45, 0x00], Direction::Inbound),
            Err(ParseError::Truncated { .. })
        ));
        assert!(matches!(
            parse_l3(&[0x20], Direction::Inbound),
            Err(ParseError::BadVersion(2))
        ));
    }

    #[test]
    fn test_v6_extension_chain() {
        // IPv6 header with a hop-by-hop extension before UDP
        let info = PacketInfo {
            version: IpVersion::V6,
            protocol: Protocol::Udp,
            src_ip: IpAddr::V6(Ipv6Addr::LOCALHOST),
            dst_ip: IpAddr::V6(Ipv6Addr::LOCALHOST),
            src_port: 1000,
            dst_port: 2000,
            ..tcp_info()
        };
        let mut raw = encode(&info, b"x");
        // splice in a hop-by-hop header (next=17 moved into the extension)
        raw[6] = 0; // next header: hop-by-hop
        let ext = [17u8, 0, 0, 0, 0, 0, 0, 0];
        let tail = raw.split_off(40);
        raw.extend_from_slice(&ext);
        raw.extend_from_slice(&tail);

        let parsed = parse_l3(&raw, Direction::Inbound).unwrap();
        assert_eq!(parsed.protocol, Protocol::Udp);
        assert_eq!(parsed.src_port, 1000);
        assert_eq!(l4_payload(&raw).unwrap(), b"x");
    }
}
