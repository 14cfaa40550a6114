//! nfnetlink-queue wire codec and socket
//!
//! The kernel speaks netlink TLV over an `AF_NETLINK`/`NETLINK_NETFILTER`
//! socket: native-endian message headers, big-endian protocol fields
//! inside the netfilter attributes. The codec here is pure and tested; the
//! socket is a thin blocking wrapper used by the per-queue reader threads.

use std::io;

pub const NETLINK_NETFILTER: i32 = 12;

const NFNL_SUBSYS_QUEUE: u16 = 3;
pub const NFQNL_MSG_PACKET: u16 = 0;
pub const NFQNL_MSG_VERDICT: u16 = 1;
pub const NFQNL_MSG_CONFIG: u16 = 2;

const NLMSG_ERROR: u16 = 2;

const NLM_F_REQUEST: u16 = 0x01;
const NLM_F_ACK: u16 = 0x04;

const NFNETLINK_V0: u8 = 0;

// config commands
pub const NFQNL_CFG_CMD_BIND: u8 = 1;
pub const NFQNL_CFG_CMD_UNBIND: u8 = 2;

// config attributes
const NFQA_CFG_CMD: u16 = 1;
const NFQA_CFG_PARAMS: u16 = 2;
const NFQA_CFG_QUEUE_MAXLEN: u16 = 3;
const NFQA_CFG_FLAGS: u16 = 4;
const NFQA_CFG_MASK: u16 = 5;

const NFQNL_COPY_PACKET: u8 = 2;

/// Queue keeps passing packets when no userspace listener answers
pub const NFQA_CFG_F_FAIL_OPEN: u32 = 0x01;
const NFQA_CFG_F_GSO: u32 = 0x04;

// packet/verdict attributes
const NFQA_PACKET_HDR: u16 = 1;
const NFQA_VERDICT_HDR: u16 = 2;
const NFQA_MARK: u16 = 3;
const NFQA_PAYLOAD: u16 = 10;

const NLA_TYPE_MASK: u16 = 0x3fff;

/// The only netfilter verdict we emit; the actual disposition travels in
/// the mark and is applied by the FILTER chain
const NF_ACCEPT: u32 = 1;

const HEADER_LEN: usize = 16;

pub(super) fn align4(len: usize) -> usize {
    (len + 3) & !3
}

/// Incremental netlink message builder
pub(super) struct MsgBuilder {
    buf: Vec<u8>,
}

impl MsgBuilder {
    pub(super) fn new(subsys: u16, msg_type: u16, flags: u16, seq: u32) -> Self {
        let mut buf = Vec::with_capacity(64);
        buf.extend_from_slice(&0u32.to_ne_bytes()); // length, fixed later
        buf.extend_from_slice(&((subsys << 8) | msg_type).to_ne_bytes());
        buf.extend_from_slice(&flags.to_ne_bytes());
        buf.extend_from_slice(&seq.to_ne_bytes());
        buf.extend_from_slice(&0u32.to_ne_bytes()); // pid: kernel
        Self { buf }
    }

    pub(super) fn nfgenmsg(mut self, family: u8, res_id: u16) -> Self {
        self.buf.push(family);
        self.buf.push(NFNETLINK_V0);
        self.buf.extend_from_slice(&res_id.to_be_bytes());
        self
    }

    pub(super) fn attr(mut self, attr_type: u16, payload: &[u8]) -> Self {
        let len = 4 + payload.len();
        self.buf.extend_from_slice(&(len as u16).to_ne_bytes());
        self.buf.extend_from_slice(&attr_type.to_ne_bytes());
        self.buf.extend_from_slice(payload);
        self.buf.resize(align4(self.buf.len()), 0);
        self
    }

    pub(super) fn finish(mut self) -> Vec<u8> {
        let len = self.buf.len() as u32;
        self.buf[0..4].copy_from_slice(&len.to_ne_bytes());
        self.buf
    }
}

/// Bind to a queue and request full packet copies with fail-open
pub fn bind_messages(queue: u16, seq: u32) -> Vec<Vec<u8>> {
    let mut cmd = Vec::with_capacity(4);
    cmd.push(NFQNL_CFG_CMD_BIND);
    cmd.push(0);
    cmd.extend_from_slice(&0u16.to_be_bytes()); // pf unused since 3.8

    let bind = MsgBuilder::new(NFNL_SUBSYS_QUEUE, NFQNL_MSG_CONFIG, NLM_F_REQUEST | NLM_F_ACK, seq)
        .nfgenmsg(libc::AF_UNSPEC as u8, queue)
        .attr(NFQA_CFG_CMD, &cmd)
        .finish();

    let mut params = Vec::with_capacity(5);
    params.extend_from_slice(&0xffffu32.to_be_bytes()); // copy range
    params.push(NFQNL_COPY_PACKET);

    let tune = MsgBuilder::new(
        NFNL_SUBSYS_QUEUE,
        NFQNL_MSG_CONFIG,
        NLM_F_REQUEST | NLM_F_ACK,
        seq + 1,
    )
    .nfgenmsg(libc::AF_UNSPEC as u8, queue)
    .attr(NFQA_CFG_PARAMS, &params)
    .attr(NFQA_CFG_QUEUE_MAXLEN, &1024u32.to_be_bytes())
    .attr(NFQA_CFG_FLAGS, &(NFQA_CFG_F_FAIL_OPEN | NFQA_CFG_F_GSO).to_be_bytes())
    .attr(NFQA_CFG_MASK, &(NFQA_CFG_F_FAIL_OPEN | NFQA_CFG_F_GSO).to_be_bytes())
    .finish();

    vec![bind, tune]
}

/// Unbind from a queue
pub fn unbind_message(queue: u16, seq: u32) -> Vec<u8> {
    let mut cmd = Vec::with_capacity(4);
    cmd.push(NFQNL_CFG_CMD_UNBIND);
    cmd.push(0);
    cmd.extend_from_slice(&0u16.to_be_bytes());

    MsgBuilder::new(NFNL_SUBSYS_QUEUE, NFQNL_MSG_CONFIG, NLM_F_REQUEST, seq)
        .nfgenmsg(libc::AF_UNSPEC as u8, queue)
        .attr(NFQA_CFG_CMD, &cmd)
        .finish()
}

/// Verdict for one packet: always NF_ACCEPT plus the warden mark; the
/// FILTER chain turns the mark into the real disposition
pub fn verdict_message(queue: u16, packet_id: u32, mark: u32, seq: u32) -> Vec<u8> {
    let mut verdict_hdr = Vec::with_capacity(8);
    verdict_hdr.extend_from_slice(&NF_ACCEPT.to_be_bytes());
    verdict_hdr.extend_from_slice(&packet_id.to_be_bytes());

    MsgBuilder::new(NFNL_SUBSYS_QUEUE, NFQNL_MSG_VERDICT, NLM_F_REQUEST, seq)
        .nfgenmsg(libc::AF_UNSPEC as u8, queue)
        .attr(NFQA_VERDICT_HDR, &verdict_hdr)
        .attr(NFQA_MARK, &mark.to_be_bytes())
        .finish()
}

/// One packet delivered by a queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedPacket {
    pub queue: u16,
    pub packet_id: u32,
    pub mark: Option<u32>,
    pub payload: Vec<u8>,
}

/// Messages the reader loop cares about
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NfqMessage {
    Packet(QueuedPacket),
    /// Kernel ack or error; 0 means success
    Error(i32),
}

/// Parse a receive buffer that may hold several netlink messages
pub fn parse_messages(buf: &[u8]) -> Vec<NfqMessage> {
    let mut out = Vec::new();
    let mut pos = 0;

    while buf.len() >= pos + HEADER_LEN {
        let len = u32::from_ne_bytes(buf[pos..pos + 4].try_into().unwrap()) as usize;
        if len < HEADER_LEN || buf.len() < pos + len {
            break;
        }
        let msg_type = u16::from_ne_bytes(buf[pos + 4..pos + 6].try_into().unwrap());
        let body = &buf[pos + HEADER_LEN..pos + len];

        if msg_type == NLMSG_ERROR {
            if body.len() >= 4 {
                out.push(NfqMessage::Error(i32::from_ne_bytes(
                    body[0..4].try_into().unwrap(),
                )));
            }
        } else if msg_type >> 8 == NFNL_SUBSYS_QUEUE && msg_type & 0xff == NFQNL_MSG_PACKET {
            if let Some(packet) = parse_packet_body(body) {
                out.push(NfqMessage::Packet(packet));
            }
        }

        pos += align4(len);
    }
    out
}

fn parse_packet_body(body: &[u8]) -> Option<QueuedPacket> {
    if body.len() < 4 {
        return None;
    }
    // nfgenmsg: family, version, res_id (be)
    let queue = u16::from_be_bytes([body[2], body[3]]);

    let mut packet_id = None;
    let mut mark = None;
    let mut payload = Vec::new();

    let mut pos = 4;
    while body.len() >= pos + 4 {
        let attr_len = u16::from_ne_bytes([body[pos], body[pos + 1]]) as usize;
        let attr_type =
            u16::from_ne_bytes([body[pos + 2], body[pos + 3]]) & NLA_TYPE_MASK;
        if attr_len < 4 || body.len() < pos + attr_len {
            break;
        }
        let value = &body[pos + 4..pos + attr_len];

        match attr_type {
            NFQA_PACKET_HDR if value.len() >= 4 => {
                packet_id = Some(u32::from_be_bytes(value[0..4].try_into().unwrap()));
            }
            NFQA_MARK if value.len() >= 4 => {
                mark = Some(u32::from_be_bytes(value[0..4].try_into().unwrap()));
            }
            NFQA_PAYLOAD => {
                payload = value.to_vec();
            }
            _ => {}
        }
        pos += align4(attr_len);
    }

    Some(QueuedPacket {
        queue,
        packet_id: packet_id?,
        mark,
        payload,
    })
}

/// Blocking netlink socket bound to the netfilter family
#[cfg(target_os = "linux")]
pub struct NfqSocket {
    fd: std::os::fd::OwnedFd,
}

#[cfg(target_os = "linux")]
impl NfqSocket {
    pub fn open() -> io::Result<Self> {
        use std::os::fd::FromRawFd;

        // SAFETY: plain socket syscall; fd ownership moves into OwnedFd
        let fd = unsafe { libc::socket(libc::AF_NETLINK, libc::SOCK_RAW, NETLINK_NETFILTER) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let fd = unsafe { std::os::fd::OwnedFd::from_raw_fd(fd) };

        let mut addr: libc::sockaddr_nl = unsafe { std::mem::zeroed() };
        addr.nl_family = libc::AF_NETLINK as libc::sa_family_t;
        let rc = unsafe {
            libc::bind(
                std::os::fd::AsRawFd::as_raw_fd(&fd),
                &addr as *const libc::sockaddr_nl as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }

        // queues can burst; a small receive buffer drops packets silently
        let size: libc::c_int = 4 * 1024 * 1024;
        unsafe {
            libc::setsockopt(
                std::os::fd::AsRawFd::as_raw_fd(&fd),
                libc::SOL_SOCKET,
                libc::SO_RCVBUF,
                &size as *const libc::c_int as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            );
        }

        Ok(Self { fd })
    }

    pub fn send(&self, msg: &[u8]) -> io::Result<()> {
        let rc = unsafe {
            libc::send(
                std::os::fd::AsRawFd::as_raw_fd(&self.fd),
                msg.as_ptr() as *const libc::c_void,
                msg.len(),
                0,
            )
        };
        if rc < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    pub fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let rc = unsafe {
            libc::recv(
                std::os::fd::AsRawFd::as_raw_fd(&self.fd),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                0,
            )
        };
        if rc < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(rc as usize)
        }
    }

    /// Interrupt a blocked `recv` during shutdown
    pub fn shutdown(&self) {
        unsafe {
            libc::shutdown(std::os::fd::AsRawFd::as_raw_fd(&self.fd), libc::SHUT_RDWR);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_messages_shape() {
        let msgs = bind_messages(17040, 1);
        assert_eq!(msgs.len(), 2);
        for msg in &msgs {
            let len = u32::from_ne_bytes(msg[0..4].try_into().unwrap()) as usize;
            assert_eq!(len, msg.len());
            let msg_type = u16::from_ne_bytes(msg[4..6].try_into().unwrap());
            assert_eq!(msg_type >> 8, NFNL_SUBSYS_QUEUE);
            assert_eq!(msg_type & 0xff, NFQNL_MSG_CONFIG);
            // res_id carries the queue number, big-endian
            assert_eq!(u16::from_be_bytes(msg[18..20].try_into().unwrap()), 17040);
        }
    }

    #[test]
    fn test_verdict_message_carries_mark() {
        let msg = verdict_message(17140, 7, crate::marks::MARK_BLOCK, 9);
        let msg_type = u16::from_ne_bytes(msg[4..6].try_into().unwrap());
        assert_eq!(msg_type & 0xff, NFQNL_MSG_VERDICT);

        // verdict header attr sits right after nfgenmsg
        let attr_len = u16::from_ne_bytes(msg[20..22].try_into().unwrap()) as usize;
        let attr_type = u16::from_ne_bytes(msg[22..24].try_into().unwrap());
        assert_eq!(attr_type, NFQA_VERDICT_HDR);
        assert_eq!(attr_len, 12);
        assert_eq!(u32::from_be_bytes(msg[24..28].try_into().unwrap()), NF_ACCEPT);
        assert_eq!(u32::from_be_bytes(msg[28..32].try_into().unwrap()), 7);

        let mark_type = u16::from_ne_bytes(msg[34..36].try_into().unwrap());
        assert_eq!(mark_type, NFQA_MARK);
        assert_eq!(
            u32::from_be_bytes(msg[36..40].try_into().unwrap()),
            crate::marks::MARK_BLOCK
        );
    }

    /// Hand-build a kernel packet message and parse it back
    fn synthetic_packet_message(queue: u16, packet_id: u32, payload: &[u8]) -> Vec<u8> {
        let mut body = Vec::new();
        body.push(libc::AF_INET as u8);
        body.push(0);
        body.extend_from_slice(&queue.to_be_bytes());

        // NFQA_PACKET_HDR
        let mut hdr = Vec::new();
        hdr.extend_from_slice(&packet_id.to_be_bytes());
        hdr.extend_from_slice(&0x0800u16.to_be_bytes());
        hdr.push(1); // hook
        body.extend_from_slice(&((4 + hdr.len()) as u16).to_ne_bytes());
        body.extend_from_slice(&NFQA_PACKET_HDR.to_ne_bytes());
        body.extend_from_slice(&hdr);
        body.resize(align4(body.len()), 0);

        // NFQA_PAYLOAD
        body.extend_from_slice(&((4 + payload.len()) as u16).to_ne_bytes());
        body.extend_from_slice(&NFQA_PAYLOAD.to_ne_bytes());
        body.extend_from_slice(payload);
        body.resize(align4(body.len()), 0);

        let mut msg = Vec::new();
        msg.extend_from_slice(&((HEADER_LEN + body.len()) as u32).to_ne_bytes());
        msg.extend_from_slice(&((NFNL_SUBSYS_QUEUE << 8) | NFQNL_MSG_PACKET).to_ne_bytes());
        msg.extend_from_slice(&0u16.to_ne_bytes());
        msg.extend_from_slice(&0u32.to_ne_bytes());
        msg.extend_from_slice(&0u32.to_ne_bytes());
        msg.extend_from_slice(&body);
        msg
    }

    #[test]
    fn test_parse_packet_message() {
        let msg = synthetic_packet_message(17040, 42, b"\x45raw-ip");
        let parsed = parse_messages(&msg);
        assert_eq!(parsed.len(), 1);
        let NfqMessage::Packet(packet) = &parsed[0] else {
            panic!("expected packet");
        };
        assert_eq!(packet.queue, 17040);
        assert_eq!(packet.packet_id, 42);
        assert_eq!(packet.payload, b"\x45raw-ip");
        assert_eq!(packet.mark, None);
    }

    #[test]
    fn test_parse_multiple_messages_and_error() {
        let mut buf = synthetic_packet_message(17040, 1, b"a");
        buf.extend_from_slice(&synthetic_packet_message(17140, 2, b"bc"));

        // trailing NLMSG_ERROR with code 0 (ack)
        let mut err = Vec::new();
        err.extend_from_slice(&20u32.to_ne_bytes());
        err.extend_from_slice(&NLMSG_ERROR.to_ne_bytes());
        err.extend_from_slice(&0u16.to_ne_bytes());
        err.extend_from_slice(&0u32.to_ne_bytes());
        err.extend_from_slice(&0u32.to_ne_bytes());
        err.extend_from_slice(&0i32.to_ne_bytes());
        buf.extend_from_slice(&err);

        let parsed = parse_messages(&buf);
        assert_eq!(parsed.len(), 3);
        assert!(matches!(parsed[2], NfqMessage::Error(0)));
    }

    #[test]
    fn test_parse_truncated_buffer() {
        let msg = synthetic_packet_message(17040, 1, b"payload");
        let parsed = parse_messages(&msg[..msg.len() - 4]);
        assert!(parsed.is_empty());
    }
}
