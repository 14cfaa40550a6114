//! ctnetlink delete/flush messages
//!
//! Permanent verdicts live in conntrack marks, so invalidating the kernel
//! cache means deleting conntrack entries: one tuple for a single
//! connection, a family-wide flush for `clear_cache` and
//! `reset_all_tracked_connections`.

use super::queue::MsgBuilder;
use std::net::IpAddr;
use warden_conntrack::{Connection, Fingerprint};
use warden_packet::Direction;

const NFNL_SUBSYS_CTNETLINK: u16 = 1;
const IPCTNL_MSG_CT_DELETE: u16 = 2;

const NLM_F_REQUEST: u16 = 0x01;
const NLM_F_ACK: u16 = 0x04;

const NLA_F_NESTED: u16 = 0x8000;

const CTA_TUPLE_ORIG: u16 = 1;
const CTA_TUPLE_IP: u16 = 1;
const CTA_TUPLE_PROTO: u16 = 2;

const CTA_IP_V4_SRC: u16 = 1;
const CTA_IP_V4_DST: u16 = 2;
const CTA_IP_V6_SRC: u16 = 3;
const CTA_IP_V6_DST: u16 = 4;

const CTA_PROTO_NUM: u16 = 1;
const CTA_PROTO_SRC_PORT: u16 = 2;
const CTA_PROTO_DST_PORT: u16 = 3;

fn nested(attr_type: u16, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + payload.len());
    out.extend_from_slice(&((4 + payload.len()) as u16).to_ne_bytes());
    out.extend_from_slice(&(attr_type | NLA_F_NESTED).to_ne_bytes());
    out.extend_from_slice(payload);
    out
}

fn plain(attr_type: u16, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8);
    out.extend_from_slice(&((4 + payload.len()) as u16).to_ne_bytes());
    out.extend_from_slice(&attr_type.to_ne_bytes());
    out.extend_from_slice(payload);
    out.resize(super::queue::align4(out.len()), 0);
    out
}

fn ip_attrs(src: IpAddr, dst: IpAddr) -> Vec<u8> {
    let mut buf = Vec::new();
    match (src, dst) {
        (IpAddr::V4(s), IpAddr::V4(d)) => {
            buf.extend_from_slice(&plain(CTA_IP_V4_SRC, &s.octets()));
            buf.extend_from_slice(&plain(CTA_IP_V4_DST, &d.octets()));
        }
        (IpAddr::V6(s), IpAddr::V6(d)) => {
            buf.extend_from_slice(&plain(CTA_IP_V6_SRC, &s.octets()));
            buf.extend_from_slice(&plain(CTA_IP_V6_DST, &d.octets()));
        }
        _ => {}
    }
    buf
}

/// Delete the conntrack entry matching a connection's original tuple
pub fn delete_message(conn: &Connection, seq: u32) -> Vec<u8> {
    let fp: &Fingerprint = &conn.fingerprint;
    // the original tuple follows the first packet's direction
    let (src_ip, dst_ip, src_port, dst_port) = match conn.direction {
        Direction::Outbound => (fp.local_ip, fp.remote_ip, fp.local_port, fp.remote_port),
        Direction::Inbound => (fp.remote_ip, fp.local_ip, fp.remote_port, fp.local_port),
    };

    let mut proto = Vec::new();
    proto.extend_from_slice(&plain(CTA_PROTO_NUM, &[fp.protocol.number()]));
    if fp.protocol.has_ports() {
        proto.extend_from_slice(&plain(CTA_PROTO_SRC_PORT, &src_port.to_be_bytes()));
        proto.extend_from_slice(&plain(CTA_PROTO_DST_PORT, &dst_port.to_be_bytes()));
    }

    let mut tuple = Vec::new();
    tuple.extend_from_slice(&nested(CTA_TUPLE_IP, &ip_attrs(src_ip, dst_ip)));
    tuple.extend_from_slice(&nested(CTA_TUPLE_PROTO, &proto));

    let family = if src_ip.is_ipv4() {
        libc::AF_INET as u8
    } else {
        libc::AF_INET6 as u8
    };

    MsgBuilder::new(
        NFNL_SUBSYS_CTNETLINK,
        IPCTNL_MSG_CT_DELETE,
        NLM_F_REQUEST | NLM_F_ACK,
        seq,
    )
    .nfgenmsg(family, 0)
    .attr(CTA_TUPLE_ORIG | NLA_F_NESTED, &tuple)
    .finish()
}

/// Flush all conntrack entries of one family
pub fn flush_message(family: u8, seq: u32) -> Vec<u8> {
    MsgBuilder::new(
        NFNL_SUBSYS_CTNETLINK,
        IPCTNL_MSG_CT_DELETE,
        NLM_F_REQUEST | NLM_F_ACK,
        seq,
    )
    .nfgenmsg(family, 0)
    .finish()
}
