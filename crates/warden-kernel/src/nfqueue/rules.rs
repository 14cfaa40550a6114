//! Firewall-table rule surface
//!
//! Three tables: `mangle` holds `INGEST-OUT`/`INGEST-IN` (restore the
//! conntrack mark, hand unmarked packets to the user queues), `filter`
//! holds `FILTER` (interpret marks, save them back to conntrack), `nat`
//! holds `REDIRECT` (DNAT the reroute marks to the local nameserver and
//! tunnel ports).
//!
//! The rule set is modeled as plain data first; the netlink translation is
//! a mechanical walk over that model. Install and remove both start with a
//! delete-if-exists, so a fresh `start()` converges to the same kernel
//! state no matter what a previous process left behind.

use crate::marks::*;
use std::net::IpAddr;
use warden_common::{Endpoints, QueueNumbers};

/// Address family a rule applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    V4,
    V6,
    Both,
}

/// What a rule does once its match hits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleAction {
    /// meta mark = ct mark
    RestoreMark,
    /// meta mark -> ct mark
    SaveMark,
    /// Hand the packet to a user queue (bypass-if-no-listener is set at
    /// socket configuration time)
    Queue(u16),
    Accept,
    Reject,
    Drop,
    /// DNAT to a local endpoint
    Dnat { ip: IpAddr, port: u16 },
}

/// One rule of the kernel surface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleSpec {
    pub table: &'static str,
    pub chain: &'static str,
    pub family: Family,
    /// Match on the packet mark; `Some(0)` means "no mark yet"
    pub match_mark: Option<u32>,
    pub action: RuleAction,
}

pub const TABLE_MANGLE: &str = "mangle";
pub const TABLE_FILTER: &str = "filter";
pub const TABLE_NAT: &str = "nat";

pub const CHAIN_INGEST_OUT: &str = "INGEST-OUT";
pub const CHAIN_INGEST_IN: &str = "INGEST-IN";
pub const CHAIN_FILTER: &str = "FILTER";
pub const CHAIN_REDIRECT: &str = "REDIRECT";

/// The complete rule surface for the configured queues and endpoints
pub fn ruleset(queues: &QueueNumbers, endpoints: &Endpoints) -> Vec<RuleSpec> {
    let mut rules = Vec::new();

    // mangle: restore, then queue unmarked traffic
    for (chain, q4, q6) in [
        (CHAIN_INGEST_OUT, queues.out_v4, queues.out_v6),
        (CHAIN_INGEST_IN, queues.in_v4, queues.in_v6),
    ] {
        rules.push(RuleSpec {
            table: TABLE_MANGLE,
            chain,
            family: Family::Both,
            match_mark: None,
            action: RuleAction::RestoreMark,
        });
        rules.push(RuleSpec {
            table: TABLE_MANGLE,
            chain,
            family: Family::V4,
            match_mark: Some(0),
            action: RuleAction::Queue(q4),
        });
        rules.push(RuleSpec {
            table: TABLE_MANGLE,
            chain,
            family: Family::V6,
            match_mark: Some(0),
            action: RuleAction::Queue(q6),
        });
    }

    // filter: interpret marks, then persist them
    for (mark, action) in [
        (MARK_ACCEPT, RuleAction::Accept),
        (MARK_ACCEPT_PERM, RuleAction::Accept),
        (MARK_BLOCK, RuleAction::Reject),
        (MARK_BLOCK_PERM, RuleAction::Reject),
        (MARK_DROP, RuleAction::Drop),
        (MARK_DROP_PERM, RuleAction::Drop),
        (MARK_TUNNEL, RuleAction::Accept),
        (MARK_NAMESERVER, RuleAction::Accept),
    ] {
        rules.push(RuleSpec {
            table: TABLE_FILTER,
            chain: CHAIN_FILTER,
            family: Family::Both,
            match_mark: Some(mark),
            action,
        });
    }
    rules.push(RuleSpec {
        table: TABLE_FILTER,
        chain: CHAIN_FILTER,
        family: Family::Both,
        match_mark: None,
        action: RuleAction::SaveMark,
    });

    // nat: reroute marks DNAT to the local endpoints
    for (mark, v4, v6, port) in [
        (
            MARK_NAMESERVER,
            endpoints.nameserver_v4,
            endpoints.nameserver_v6,
            endpoints.nameserver_port,
        ),
        (
            MARK_TUNNEL,
            endpoints.tunnel_v4,
            endpoints.tunnel_v6,
            endpoints.tunnel_port,
        ),
    ] {
        rules.push(RuleSpec {
            table: TABLE_NAT,
            chain: CHAIN_REDIRECT,
            family: Family::V4,
            match_mark: Some(mark),
            action: RuleAction::Dnat { ip: v4, port },
        });
        rules.push(RuleSpec {
            table: TABLE_NAT,
            chain: CHAIN_REDIRECT,
            family: Family::V6,
            match_mark: Some(mark),
            action: RuleAction::Dnat { ip: v6, port },
        });
    }

    rules
}

/// Netlink translation of the rule model
pub mod install {
    use super::*;
    use rustables::expr::{
        Cmp, CmpOp, Conntrack, ConntrackKey, Immediate, Meta, MetaType, Nat, NatType, Queue,
        Register, Reject, VerdictKind,
    };
    use rustables::{
        Batch, Chain, ChainPolicy, Hook, HookClass, MsgType, ProtocolFamily, Rule, Table,
    };
    use warden_common::{Error, Result};

    fn nl_err(e: impl std::fmt::Display) -> Error {
        Error::RuleInstallFailed(e.to_string())
    }

    fn hook_for(chain: &str) -> Hook {
        match chain {
            CHAIN_INGEST_OUT => Hook::new(HookClass::Out, 0),
            CHAIN_INGEST_IN => Hook::new(HookClass::In, 0),
            CHAIN_FILTER => Hook::new(HookClass::Forward, 0),
            _ => Hook::new(HookClass::Out, -100),
        }
    }

    fn match_family(rule: &mut Rule, family: Family) {
        let proto = match family {
            Family::V4 => libc::NFPROTO_IPV4 as u8,
            Family::V6 => libc::NFPROTO_IPV6 as u8,
            Family::Both => return,
        };
        rule.add_expr(Meta::new(MetaType::NfProto));
        rule.add_expr(Cmp::new(CmpOp::Eq, [proto]));
    }

    fn match_mark(rule: &mut Rule, mark: u32) {
        rule.add_expr(Meta::new(MetaType::Mark));
        rule.add_expr(Cmp::new(CmpOp::Eq, mark.to_ne_bytes()));
    }

    fn translate(rule: &mut Rule, spec: &RuleSpec) {
        match_family(rule, spec.family);
        if let Some(mark) = spec.match_mark {
            match_mark(rule, mark);
        }
        match spec.action {
            RuleAction::RestoreMark => {
                rule.add_expr(Conntrack::new(ConntrackKey::Mark));
                rule.add_expr(Meta::new(MetaType::Mark).with_dreg(Register::Reg1));
            }
            RuleAction::SaveMark => {
                rule.add_expr(Meta::new(MetaType::Mark));
                rule.add_expr(Conntrack::new(ConntrackKey::Mark).with_dreg(Register::Reg1));
            }
            RuleAction::Queue(num) => {
                rule.add_expr(Queue::new(num));
            }
            RuleAction::Accept => {
                rule.add_expr(Immediate::new_verdict(VerdictKind::Accept));
            }
            RuleAction::Drop => {
                rule.add_expr(Immediate::new_verdict(VerdictKind::Drop));
            }
            RuleAction::Reject => {
                rule.add_expr(Reject::default());
            }
            RuleAction::Dnat { ip, port } => {
                let (family, octets): (ProtocolFamily, Vec<u8>) = match ip {
                    IpAddr::V4(v4) => (ProtocolFamily::Ipv4, v4.octets().to_vec()),
                    IpAddr::V6(v6) => (ProtocolFamily::Ipv6, v6.octets().to_vec()),
                };
                rule.add_expr(Immediate::new_data(octets, Register::Reg1));
                rule.add_expr(Immediate::new_data(port.to_be_bytes().to_vec(), Register::Reg2));
                rule.add_expr(Nat {
                    nat_type: Some(NatType::DNat),
                    family: Some(family),
                    ip_register: Some(Register::Reg1),
                    port_register: Some(Register::Reg2),
                });
            }
        }
    }

    /// Remove-if-exists, then install the full surface in one batch
    pub fn install(specs: &[RuleSpec]) -> Result<()> {
        remove().ok();

        let mut batch = Batch::new();
        let mut tables: Vec<(String, Table)> = Vec::new();
        let mut chains: Vec<(String, Chain)> = Vec::new();

        for name in [TABLE_MANGLE, TABLE_FILTER, TABLE_NAT] {
            let table = Table::new(ProtocolFamily::Inet).with_name(name);
            batch.add(&table, MsgType::Add);
            tables.push((name.to_string(), table));
        }

        for spec in specs {
            let key = format!("{}/{}", spec.table, spec.chain);
            if !chains.iter().any(|(k, _)| *k == key) {
                let table = &tables.iter().find(|(n, _)| n == spec.table).unwrap().1;
                let mut chain = Chain::new(table).with_name(spec.chain);
                chain.set_hook(hook_for(spec.chain));
                chain.set_policy(ChainPolicy::Accept);
                batch.add(&chain, MsgType::Add);
                chains.push((key, chain));
            }
        }

        for spec in specs {
            let key = format!("{}/{}", spec.table, spec.chain);
            let chain = &chains.iter().find(|(k, _)| *k == key).unwrap().1;
            let mut rule = Rule::new(chain).map_err(nl_err)?;
            translate(&mut rule, spec);
            batch.add(&rule, MsgType::Add);
        }

        batch.send().map_err(nl_err)
    }

    /// Delete the warden tables; missing tables are not an error
    pub fn remove() -> Result<()> {
        let mut batch = Batch::new();
        for name in [TABLE_MANGLE, TABLE_FILTER, TABLE_NAT] {
            let table = Table::new(ProtocolFamily::Inet).with_name(name);
            batch.add(&table, MsgType::Del);
        }
        match batch.send() {
            Ok(()) => Ok(()),
            // ENOENT: previous process already cleaned up
            Err(e) if e.to_string().contains("No such file") => Ok(()),
            Err(e) => Err(nl_err(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn specs() -> Vec<RuleSpec> {
        ruleset(&QueueNumbers::default(), &Endpoints::default())
    }

    #[test]
    fn test_queue_rules_use_spec_numbers() {
        let rules = specs();
        let queues: Vec<u16> = rules
            .iter()
            .filter_map(|r| match r.action {
                RuleAction::Queue(n) => Some(n),
                _ => None,
            })
            .collect();
        assert_eq!(queues, vec![17040, 17060, 17140, 17160]);
        // unmarked traffic only
        assert!(rules
            .iter()
            .filter(|r| matches!(r.action, RuleAction::Queue(_)))
            .all(|r| r.match_mark == Some(0)));
    }

    #[test]
    fn test_filter_chain_covers_all_marks() {
        let rules = specs();
        let filter: Vec<&RuleSpec> = rules
            .iter()
            .filter(|r| r.chain == CHAIN_FILTER && r.match_mark.is_some())
            .collect();
        assert_eq!(filter.len(), 8);
        for (mark, action) in [
            (MARK_ACCEPT, RuleAction::Accept),
            (MARK_BLOCK, RuleAction::Reject),
            (MARK_DROP, RuleAction::Drop),
            (MARK_ACCEPT_PERM, RuleAction::Accept),
            (MARK_BLOCK_PERM, RuleAction::Reject),
            (MARK_DROP_PERM, RuleAction::Drop),
            (MARK_TUNNEL, RuleAction::Accept),
            (MARK_NAMESERVER, RuleAction::Accept),
        ] {
            assert!(
                filter
                    .iter()
                    .any(|r| r.match_mark == Some(mark) && r.action == action),
                "mark {mark}"
            );
        }
        // marks are saved back to conntrack
        assert!(rules
            .iter()
            .any(|r| r.chain == CHAIN_FILTER && r.action == RuleAction::SaveMark));
    }

    #[test]
    fn test_redirect_targets() {
        let rules = specs();
        let dnats: Vec<&RuleSpec> = rules
            .iter()
            .filter(|r| r.chain == CHAIN_REDIRECT)
            .collect();
        assert_eq!(dnats.len(), 4);

        let ns_v4 = dnats
            .iter()
            .find(|r| r.match_mark == Some(MARK_NAMESERVER) && r.family == Family::V4)
            .unwrap();
        assert_eq!(
            ns_v4.action,
            RuleAction::Dnat { ip: "127.0.0.17".parse().unwrap(), port: 53 }
        );

        let tunnel_v6 = dnats
            .iter()
            .find(|r| r.match_mark == Some(MARK_TUNNEL) && r.family == Family::V6)
            .unwrap();
        assert_eq!(
            tunnel_v6.action,
            RuleAction::Dnat { ip: "::1".parse().unwrap(), port: 717 }
        );
    }

    #[test]
    fn test_ingest_chains_restore_before_queueing() {
        let rules = specs();
        for chain in [CHAIN_INGEST_OUT, CHAIN_INGEST_IN] {
            let chain_rules: Vec<&RuleSpec> =
                rules.iter().filter(|r| r.chain == chain).collect();
            assert_eq!(chain_rules[0].action, RuleAction::RestoreMark);
            assert!(chain_rules[1..]
                .iter()
                .all(|r| matches!(r.action, RuleAction::Queue(_))));
        }
    }

    #[test]
    fn test_ruleset_is_deterministic() {
        // install(); remove(); install() converges because the model is
        // stable and install always starts from remove-if-exists
        assert_eq!(specs(), specs());
    }
}
