//! Warden Packet - uniform representation of an intercepted packet
//!
//! Every OS integration produces the same `Packet`: parsed header info, a
//! handle identifying the packet to the kernel side, lazily loaded raw
//! bytes, and a one-shot decision channel back to the integration. The
//! decision channel is at-most-once; a repeat attempt reports
//! `VerdictAlreadySet` and delivers nothing, so races between an inspector
//! verdict and an independent timeout cannot double-verdict a packet.

#![warn(clippy::all)]

pub mod info;
pub mod packet;
pub mod parse;
pub mod verdict;

pub use info::{Direction, IpVersion, PacketInfo, Protocol};
pub use packet::{Decision, Packet, PacketHandle, PayloadSource};
pub use verdict::Verdict;
