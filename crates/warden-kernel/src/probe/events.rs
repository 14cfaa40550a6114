//! Kernel-probe event codec
//!
//! The probes emit one fixed-layout record per observed connection into a
//! ring buffer. Records are little-endian and padded to four bytes, the
//! layout is shared with the probe program.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use warden_common::Timestamp;
use warden_packet::{Direction, IpVersion, PacketInfo, Protocol};

/// Serialized record size
pub const EVENT_SIZE: usize = 44;

/// One connection-creation event from the kernel probes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionEvent {
    pub pid: u32,
    pub inbound: bool,
    pub protocol: u8,
    pub family: u8,
    pub src: IpAddr,
    pub dst: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
}

impl ConnectionEvent {
    /// Decode a raw ring-buffer record
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < EVENT_SIZE {
            return None;
        }
        let pid = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        let inbound = buf[4] != 0;
        let protocol = buf[5];
        let family = buf[6];
        // buf[7] is padding
        let (src, dst) = match family {
            4 => (
                IpAddr::V4(Ipv4Addr::new(buf[8], buf[9], buf[10], buf[11])),
                IpAddr::V4(Ipv4Addr::new(buf[24], buf[25], buf[26], buf[27])),
            ),
            6 => {
                let s: [u8; 16] = buf[8..24].try_into().unwrap();
                let d: [u8; 16] = buf[24..40].try_into().unwrap();
                (IpAddr::V6(Ipv6Addr::from(s)), IpAddr::V6(Ipv6Addr::from(d)))
            }
            _ => return None,
        };
        Some(Self {
            pid,
            inbound,
            protocol,
            family,
            src,
            dst,
            src_port: u16::from_le_bytes(buf[40..42].try_into().unwrap()),
            dst_port: u16::from_le_bytes(buf[42..44].try_into().unwrap()),
        })
    }

    /// Encode, for tests and the event-injection path
    pub fn encode(&self) -> [u8; EVENT_SIZE] {
        let mut buf = [0u8; EVENT_SIZE];
        buf[0..4].copy_from_slice(&self.pid.to_le_bytes());
        buf[4] = self.inbound as u8;
        buf[5] = self.protocol;
        buf[6] = self.family;
        match (self.src, self.dst) {
            (IpAddr::V4(s), IpAddr::V4(d)) => {
                buf[8..12].copy_from_slice(&s.octets());
                buf[24..28].copy_from_slice(&d.octets());
            }
            (IpAddr::V6(s), IpAddr::V6(d)) => {
                buf[8..24].copy_from_slice(&s.octets());
                buf[24..40].copy_from_slice(&d.octets());
            }
            _ => {}
        }
        buf[40..42].copy_from_slice(&self.src_port.to_le_bytes());
        buf[42..44].copy_from_slice(&self.dst_port.to_le_bytes());
        buf
    }

    /// Packet info for the observation packet this event becomes
    pub fn to_info(&self) -> PacketInfo {
        PacketInfo {
            direction: if self.inbound { Direction::Inbound } else { Direction::Outbound },
            version: if self.family == 6 { IpVersion::V6 } else { IpVersion::V4 },
            protocol: Protocol::from_number(self.protocol),
            src_ip: self.src,
            dst_ip: self.dst,
            src_port: self.src_port,
            dst_port: self.dst_port,
            process_id: (self.pid != 0).then_some(self.pid),
            seen_at: Timestamp::now(),
            in_tunnel: false,
            icmp: None,
        }
    }
}
