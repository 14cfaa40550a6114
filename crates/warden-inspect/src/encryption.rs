//! Encryption detector
//!
//! Marks outbound connections to well-known encrypted service ports. The
//! detector decides at enrollment time; it never needs stream data, so the
//! factory annotates the connection and declines to enroll.

use crate::InspectorFactory;
use warden_conntrack::{ConnState, Connection};
use warden_packet::PacketInfo;

/// Outbound destination ports treated as encrypted services
const ENCRYPTED_PORTS: [u16; 4] = [443, 465, 993, 995];

/// Factory that flags the connection as encrypted and enrolls nothing
pub fn factory() -> InspectorFactory {
    Box::new(|_conn: &Connection, state: &mut ConnState, info: &PacketInfo| {
        if info.direction.is_outbound() && ENCRYPTED_PORTS.contains(&state.entity.remote_port) {
            state.encrypted = true;
        }
        None
    })
}
