//! Verdict marks
//!
//! The Linux-class realization communicates verdicts to the kernel as
//! packet marks; the FILTER chain interprets them and saves them to
//! conntrack, the REDIRECT chain DNATs the reroute marks. Marks encode
//! both the action and whether it persists for the connection.

use warden_packet::{Decision, Protocol, Verdict};

pub const MARK_ACCEPT: u32 = 1700;
pub const MARK_BLOCK: u32 = 1701;
pub const MARK_DROP: u32 = 1702;
pub const MARK_ACCEPT_PERM: u32 = 1710;
pub const MARK_BLOCK_PERM: u32 = 1711;
pub const MARK_DROP_PERM: u32 = 1712;
pub const MARK_TUNNEL: u32 = 1717;
pub const MARK_NAMESERVER: u32 = 1799;

/// Map a decision to its kernel mark.
///
/// ICMP rejection packets share the connection mark, so a block on ICMP
/// must fall through to drop or the rejections would loop forever.
pub fn decision_to_mark(decision: Decision, protocol: Protocol) -> u32 {
    let verdict = match decision.verdict {
        Verdict::Block if protocol.is_icmp() => Verdict::Drop,
        other => other,
    };
    match (verdict, decision.permanent) {
        (Verdict::Accept, false) => MARK_ACCEPT,
        (Verdict::Accept, true) => MARK_ACCEPT_PERM,
        (Verdict::Block, false) => MARK_BLOCK,
        (Verdict::Block, true) => MARK_BLOCK_PERM,
        (Verdict::Drop, false) => MARK_DROP,
        (Verdict::Drop, true) => MARK_DROP_PERM,
        (Verdict::RerouteToTunnel, _) => MARK_TUNNEL,
        (Verdict::RerouteToNameserver, _) => MARK_NAMESERVER,
        // anything undecided that reaches the kernel is dropped
        (_, false) => MARK_DROP,
        (_, true) => MARK_DROP_PERM,
    }
}

/// Inverse mapping, for cache bookkeeping and tests
pub fn mark_to_decision(mark: u32) -> Option<Decision> {
    let (verdict, permanent) = match mark {
        MARK_ACCEPT => (Verdict::Accept, false),
        MARK_BLOCK => (Verdict::Block, false),
        MARK_DROP => (Verdict::Drop, false),
        MARK_ACCEPT_PERM => (Verdict::Accept, true),
        MARK_BLOCK_PERM => (Verdict::Block, true),
        MARK_DROP_PERM => (Verdict::Drop, true),
        MARK_TUNNEL => (Verdict::RerouteToTunnel, true),
        MARK_NAMESERVER => (Verdict::RerouteToNameserver, true),
        _ => return None,
    };
    Some(Decision { verdict, permanent })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mark_table() {
        let cases = [
            (Verdict::Accept, false, 1700),
            (Verdict::Block, false, 1701),
            (Verdict::Drop, false, 1702),
            (Verdict::Accept, true, 1710),
            (Verdict::Block, true, 1711),
            (Verdict::Drop, true, 1712),
            (Verdict::RerouteToTunnel, true, 1717),
            (Verdict::RerouteToNameserver, true, 1799),
        ];
        for (verdict, permanent, mark) in cases {
            assert_eq!(
                decision_to_mark(Decision { verdict, permanent }, Protocol::Tcp),
                mark
            );
        }
    }

    #[test]
    fn test_icmp_block_maps_to_drop() {
        let block = Decision { verdict: Verdict::Block, permanent: false };
        assert_eq!(decision_to_mark(block, Protocol::Icmp), MARK_DROP);
        assert_eq!(decision_to_mark(block, Protocol::Icmp6), MARK_DROP);
        let perm = Decision { verdict: Verdict::Block, permanent: true };
        assert_eq!(decision_to_mark(perm, Protocol::Icmp), MARK_DROP_PERM);
        // non-ICMP blocks stay blocks
        assert_eq!(decision_to_mark(block, Protocol::Udp), MARK_BLOCK);
    }

    #[test]
    fn test_undecided_drops() {
        let undecided = Decision { verdict: Verdict::Undecided, permanent: false };
        assert_eq!(decision_to_mark(undecided, Protocol::Tcp), MARK_DROP);
    }

    #[test]
    fn test_roundtrip() {
        for mark in [1700, 1701, 1702, 1710, 1711, 1712, 1717, 1799] {
            let decision = mark_to_decision(mark).unwrap();
            assert_eq!(decision_to_mark(decision, Protocol::Tcp), mark);
        }
        assert!(mark_to_decision(0).is_none());
        assert!(mark_to_decision(1703).is_none());
    }
}
