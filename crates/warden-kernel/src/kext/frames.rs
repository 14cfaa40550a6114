//! Kernel info stream codec
//!
//! The newer kernel generation delivers a length-prefixed stream of info
//! frames: `[info-type:u8][size:u32le][payload:size bytes]`. The legacy
//! generation replies to each receive-verdict-request with a single bare
//! connection payload (no frame header). Both payload layouts are
//! identical and little-endian.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use warden_packet::{Decision, Verdict};

pub const INFO_CONNECTION_V4: u8 = 0;
pub const INFO_CONNECTION_V6: u8 = 1;
pub const INFO_CONNECTION_END_V4: u8 = 2;
pub const INFO_CONNECTION_END_V6: u8 = 3;
pub const INFO_LOG_LINE: u8 = 4;
pub const INFO_BANDWIDTH_V4: u8 = 5;
pub const INFO_BANDWIDTH_V6: u8 = 6;

/// Upper bound on a single frame; anything larger means stream corruption
const MAX_FRAME: usize = 1 << 20;

/// Verdict codes on the set-verdict control path; bit 7 marks persistence
pub fn verdict_code(decision: Decision) -> u8 {
    let base = match decision.verdict {
        Verdict::Undecided => 0,
        Verdict::Undeterminable => 1,
        Verdict::Accept => 2,
        Verdict::Block => 3,
        Verdict::Drop => 4,
        Verdict::RerouteToNameserver => 5,
        Verdict::RerouteToTunnel => 6,
        Verdict::Failed => 4,
    };
    if decision.permanent {
        base | 0x80
    } else {
        base
    }
}

/// A new connection awaiting a verdict
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionFrame {
    pub id: u64,
    pub process_id: u64,
    pub inbound: bool,
    pub protocol: u8,
    pub local_ip: IpAddr,
    pub remote_ip: IpAddr,
    pub local_port: u16,
    pub remote_port: u16,
    pub payload: Vec<u8>,
}

/// The kernel noticed a connection terminated
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionEndFrame {
    pub process_id: u64,
    pub inbound: bool,
    pub protocol: u8,
    pub local_ip: IpAddr,
    pub remote_ip: IpAddr,
    pub local_port: u16,
    pub remote_port: u16,
}

/// One per-connection bandwidth entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BandwidthEntry {
    pub local_ip: IpAddr,
    pub local_port: u16,
    pub remote_ip: IpAddr,
    pub remote_port: u16,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

/// Decoded info frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KextInfo {
    Connection(ConnectionFrame),
    ConnectionEnd(ConnectionEndFrame),
    LogLine { severity: u8, line: String },
    /// Additive byte counters
    Bandwidth { protocol: u8, entries: Vec<BandwidthEntry> },
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn u8(&mut self) -> Option<u8> {
        let v = *self.buf.get(self.pos)?;
        self.pos += 1;
        Some(v)
    }

    fn u16(&mut self) -> Option<u16> {
        let v = self.buf.get(self.pos..self.pos + 2)?;
        self.pos += 2;
        Some(u16::from_le_bytes(v.try_into().unwrap()))
    }

    fn u32(&mut self) -> Option<u32> {
        let v = self.buf.get(self.pos..self.pos + 4)?;
        self.pos += 4;
        Some(u32::from_le_bytes(v.try_into().unwrap()))
    }

    fn u64(&mut self) -> Option<u64> {
        let v = self.buf.get(self.pos..self.pos + 8)?;
        self.pos += 8;
        Some(u64::from_le_bytes(v.try_into().unwrap()))
    }

    fn ip(&mut self, v6: bool) -> Option<IpAddr> {
        if v6 {
            let octets: [u8; 16] = self.buf.get(self.pos..self.pos + 16)?.try_into().unwrap();
            self.pos += 16;
            Some(IpAddr::V6(Ipv6Addr::from(octets)))
        } else {
            let octets: [u8; 4] = self.buf.get(self.pos..self.pos + 4)?.try_into().unwrap();
            self.pos += 4;
            Some(IpAddr::V4(Ipv4Addr::from(octets)))
        }
    }

    fn rest(&mut self) -> &'a [u8] {
        let rest = &self.buf[self.pos..];
        self.pos = self.buf.len();
        rest
    }
}

/// Parse a bare connection payload (shared by both generations)
pub fn parse_connection(payload: &[u8], v6: bool) -> Option<ConnectionFrame> {
    let mut c = Cursor::new(payload);
    let id = c.u64()?;
    let process_id = c.u64()?;
    let inbound = c.u8()? != 0;
    let protocol = c.u8()?;
    let local_ip = c.ip(v6)?;
    let remote_ip = c.ip(v6)?;
    let local_port = c.u16()?;
    let remote_port = c.u16()?;
    let payload_len = c.u32()? as usize;
    let rest = c.rest();
    if rest.len() < payload_len {
        return None;
    }
    Some(ConnectionFrame {
        id,
        process_id,
        inbound,
        protocol,
        local_ip,
        remote_ip,
        local_port,
        remote_port,
        payload: rest[..payload_len].to_vec(),
    })
}

fn parse_connection_end(payload: &[u8], v6: bool) -> Option<ConnectionEndFrame> {
    let mut c = Cursor::new(payload);
    Some(ConnectionEndFrame {
        process_id: c.u64()?,
        inbound: c.u8()? != 0,
        protocol: c.u8()?,
        local_ip: c.ip(v6)?,
        remote_ip: c.ip(v6)?,
        local_port: c.u16()?,
        remote_port: c.u16()?,
    })
}

fn parse_bandwidth(payload: &[u8], v6: bool) -> Option<(u8, Vec<BandwidthEntry>)> {
    let mut c = Cursor::new(payload);
    let protocol = c.u8()?;
    let count = c.u32()? as usize;
    let mut entries = Vec::with_capacity(count);
    for _ in 0..count {
        entries.push(BandwidthEntry {
            local_ip: c.ip(v6)?,
            local_port: c.u16()?,
            remote_ip: c.ip(v6)?,
            remote_port: c.u16()?,
            rx_bytes: c.u64()?,
            tx_bytes: c.u64()?,
        });
    }
    Some((protocol, entries))
}

fn parse_frame(info_type: u8, payload: &[u8]) -> Option<KextInfo> {
    match info_type {
        INFO_CONNECTION_V4 => parse_connection(payload, false).map(KextInfo::Connection),
        INFO_CONNECTION_V6 => parse_connection(payload, true).map(KextInfo::Connection),
        INFO_CONNECTION_END_V4 => {
            parse_connection_end(payload, false).map(KextInfo::ConnectionEnd)
        }
        INFO_CONNECTION_END_V6 => {
            parse_connection_end(payload, true).map(KextInfo::ConnectionEnd)
        }
        INFO_LOG_LINE => {
            let severity = *payload.first()?;
            let line = String::from_utf8_lossy(&payload[1..]).into_owned();
            Some(KextInfo::LogLine { severity, line })
        }
        INFO_BANDWIDTH_V4 => {
            parse_bandwidth(payload, false).map(|(protocol, entries)| KextInfo::Bandwidth {
                protocol,
                entries,
            })
        }
        INFO_BANDWIDTH_V6 => {
            parse_bandwidth(payload, true).map(|(protocol, entries)| KextInfo::Bandwidth {
                protocol,
                entries,
            })
        }
        _ => None,
    }
}

/// Incremental reader over the length-prefixed info stream.
///
/// Device reads can split a frame anywhere; bytes are buffered until a
/// whole frame is available.
#[derive(Default)]
pub struct FrameReader {
    buf: Vec<u8>,
}

impl FrameReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw device bytes; returns every frame completed by them
    pub fn push(&mut self, bytes: &[u8]) -> Vec<KextInfo> {
        self.buf.extend_from_slice(bytes);
        let mut out = Vec::new();

        loop {
            if self.buf.len() < 5 {
                break;
            }
            let info_type = self.buf[0];
            let size = u32::from_le_bytes(self.buf[1..5].try_into().unwrap()) as usize;
            if size > MAX_FRAME {
                tracing::error!(size, "oversized info frame, resetting stream");
                self.buf.clear();
                break;
            }
            if self.buf.len() < 5 + size {
                break;
            }
            let payload: Vec<u8> = self.buf.drain(..5 + size).skip(5).collect();
            match parse_frame(info_type, &payload) {
                Some(info) => out.push(info),
                None => tracing::warn!(info_type, "undecodable info frame"),
            }
        }
        out
    }
}

/// Encode helpers, used by tests and the in-process stream simulator
pub mod encode {
    use super::*;

    fn put_ip(buf: &mut Vec<u8>, ip: IpAddr) {
        match ip {
            IpAddr::V4(v4) => buf.extend_from_slice(&v4.octets()),
            IpAddr::V6(v6) => buf.extend_from_slice(&v6.octets()),
        }
    }

    pub fn frame(info_type: u8, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(5 + payload.len());
        out.push(info_type);
        out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        out.extend_from_slice(payload);
        out
    }

    pub fn connection(frame_data: &ConnectionFrame) -> Vec<u8> {
        let mut p = Vec::new();
        p.extend_from_slice(&frame_data.id.to_le_bytes());
        p.extend_from_slice(&frame_data.process_id.to_le_bytes());
        p.push(frame_data.inbound as u8);
        p.push(frame_data.protocol);
        put_ip(&mut p, frame_data.local_ip);
        put_ip(&mut p, frame_data.remote_ip);
        p.extend_from_slice(&frame_data.local_port.to_le_bytes());
        p.extend_from_slice(&frame_data.remote_port.to_le_bytes());
        p.extend_from_slice(&(frame_data.payload.len() as u32).to_le_bytes());
        p.extend_from_slice(&frame_data.payload);
        let info_type = if frame_data.local_ip.is_ipv4() {
            INFO_CONNECTION_V4
        } else {
            INFO_CONNECTION_V6
        };
        frame(info_type, &p)
    }

    pub fn connection_end(end: &ConnectionEndFrame) -> Vec<u8> {
        let mut p = Vec::new();
        p.extend_from_slice(&end.process_id.to_le_bytes());
        p.push(end.inbound as u8);
        p.push(end.protocol);
        put_ip(&mut p, end.local_ip);
        put_ip(&mut p, end.remote_ip);
        p.extend_from_slice(&end.local_port.to_le_bytes());
        p.extend_from_slice(&end.remote_port.to_le_bytes());
        let info_type = if end.local_ip.is_ipv4() {
            INFO_CONNECTION_END_V4
        } else {
            INFO_CONNECTION_END_V6
        };
        frame(info_type, &p)
    }

    pub fn bandwidth(protocol: u8, entries: &[BandwidthEntry]) -> Vec<u8> {
        let v6 = entries.first().map(|e| e.local_ip.is_ipv6()).unwrap_or(false);
        let mut p = Vec::new();
        p.push(protocol);
        p.extend_from_slice(&(entries.len() as u32).to_le_bytes());
        for entry in entries {
            put_ip(&mut p, entry.local_ip);
            p.extend_from_slice(&entry.local_port.to_le_bytes());
            put_ip(&mut p, entry.remote_ip);
            p.extend_from_slice(&entry.remote_port.to_le_bytes());
            p.extend_from_slice(&entry.rx_bytes.to_le_bytes());
            p.extend_from_slice(&entry.tx_bytes.to_le_bytes());
        }
        frame(if v6 { INFO_BANDWIDTH_V6 } else { INFO_BANDWIDTH_V4 }, &p)
    }

    pub fn log_line(severity: u8, line: &str) -> Vec<u8> {
        let mut p = vec![severity];
        p.extend_from_slice(line.as_bytes());
        frame(INFO_LOG_LINE, &p)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_connection() -> ConnectionFrame {
        ConnectionFrame {
            id: 99,
            process_id: 1234,
            inbound: false,
            protocol: 6,
            local_ip: "10.0.0.5".parse().unwrap(),
            remote_ip: "93.184.216.34".parse().unwrap(),
            local_port: 40000,
            remote_port: 443,
            payload: b"\x45hello".to_vec(),
        }
    }

    #[test]
    fn test_connection_roundtrip() {
        let frame = sample_connection();
        let mut reader = FrameReader::new();
        let infos = reader.push(&encode::connection(&frame));
        assert_eq!(infos, vec![KextInfo::Connection(frame)]);
    }

    #[test]
    fn test_v6_connection_roundtrip() {
        let frame = ConnectionFrame {
            local_ip: "fe80::1".parse().unwrap(),
            remote_ip: "2001:db8::2".parse().unwrap(),
            ..sample_connection()
        };
        let mut reader = FrameReader::new();
        let infos = reader.push(&encode::connection(&frame));
        assert_eq!(infos, vec![KextInfo::Connection(frame)]);
    }

    #[test]
    fn test_split_frame_reassembles() {
        let bytes = encode::connection(&sample_connection());
        let mut reader = FrameReader::new();
        // feed one byte at a time; only the final byte completes the frame
        for b in &bytes[..bytes.len() - 1] {
            assert!(reader.push(std::slice::from_ref(b)).is_empty());
        }
        let infos = reader.push(&bytes[bytes.len() - 1..]);
        assert_eq!(infos.len(), 1);
    }

    #[test]
    fn test_multiple_frames_one_read() {
        let mut bytes = encode::log_line(2, "filter engine ready");
        bytes.extend_from_slice(&encode::connection(&sample_connection()));
        bytes.extend_from_slice(&encode::connection_end(&ConnectionEndFrame {
            process_id: 1234,
            inbound: false,
            protocol: 6,
            local_ip: "10.0.0.5".parse().unwrap(),
            remote_ip: "93.184.216.34".parse().unwrap(),
            local_port: 40000,
            remote_port: 443,
        }));

        let mut reader = FrameReader::new();
        let infos = reader.push(&bytes);
        assert_eq!(infos.len(), 3);
        assert!(matches!(infos[0], KextInfo::LogLine { severity: 2, .. }));
        assert!(matches!(infos[1], KextInfo::Connection(_)));
        assert!(matches!(infos[2], KextInfo::ConnectionEnd(_)));
    }

    #[test]
    fn test_bandwidth_frame() {
        let entries = vec![BandwidthEntry {
            local_ip: "10.0.0.5".parse().unwrap(),
            local_port: 40000,
            remote_ip: "1.1.1.1".parse().unwrap(),
            remote_port: 443,
            rx_bytes: 1500,
            tx_bytes: 700,
        }];
        let mut reader = FrameReader::new();
        let infos = reader.push(&encode::bandwidth(6, &entries));
        assert_eq!(
            infos,
            vec![KextInfo::Bandwidth { protocol: 6, entries }]
        );
    }

    #[test]
    fn test_verdict_codes() {
        assert_eq!(
            verdict_code(Decision { verdict: Verdict::Accept, permanent: false }),
            2
        );
        assert_eq!(
            verdict_code(Decision { verdict: Verdict::Accept, permanent: true }),
            0x82
        );
        assert_eq!(
            verdict_code(Decision { verdict: Verdict::Drop, permanent: false }),
            4
        );
        // failed maps to drop on the wire
        assert_eq!(
            verdict_code(Decision { verdict: Verdict::Failed, permanent: false }),
            4
        );
    }

    #[test]
    fn test_legacy_bare_connection() {
        let frame = sample_connection();
        let framed = encode::connection(&frame);
        // legacy replies carry the payload without the frame header
        let parsed = parse_connection(&framed[5..], false).unwrap();
        assert_eq!(parsed, frame);
    }
}
