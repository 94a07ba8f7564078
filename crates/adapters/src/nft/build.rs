//! Constructors and decoders for the kernel objects the engine manages.
//!
//! Everything here is pure data assembly over the libnftables JSON
//! schema; the engine decides what to build and when to flush.

use std::net::Ipv4Addr;

use nftables::expr::{
    Expression, Meta, MetaKey, NamedExpression, NgMode, Numgen, Payload, PayloadField, Verdict,
};
use nftables::schema::{Chain, Counter, Map, Rule, SetType, SetTypeValue, Table};
use nftables::stmt::{
    Counter as CounterStmt, JumpTarget, Match, NAT, NATFamily, Operator, Statement, VerdictMap,
};
use nftables::types::{NfChainType, NfFamily, NfHook};

use super::naming::{POSTROUTING_CHAIN, PREROUTING_CHAIN};

/// Table family. `inet` covers IPv4 and IPv6.
pub const FAMILY: NfFamily = NfFamily::INet;

pub fn table(name: &str) -> Table<'static> {
    Table {
        family: FAMILY,
        name: name.to_owned().into(),
        handle: None,
    }
}

/// NAT postrouting chain carrying the masquerade rules.
pub fn postrouting_chain(table: &str, priority: i32) -> Chain<'static> {
    nat_chain(table, POSTROUTING_CHAIN, NfHook::Postrouting, priority)
}

/// NAT prerouting chain carrying the target redirection rules.
pub fn prerouting_chain(table: &str, priority: i32) -> Chain<'static> {
    nat_chain(table, PREROUTING_CHAIN, NfHook::Prerouting, priority)
}

fn nat_chain(table: &str, name: &str, hook: NfHook, priority: i32) -> Chain<'static> {
    Chain {
        family: FAMILY,
        table: table.to_owned().into(),
        name: name.to_owned().into(),
        newname: None,
        handle: None,
        _type: Some(NfChainType::NAT),
        hook: Some(hook),
        prio: Some(priority),
        dev: None,
        policy: None,
    }
}

/// Regular chain without hook or type, jumped into by other rules.
pub fn plain_chain(table: &str, name: &str) -> Chain<'static> {
    Chain {
        family: FAMILY,
        table: table.to_owned().into(),
        name: name.to_owned().into(),
        newname: None,
        handle: None,
        _type: None,
        hook: None,
        prio: None,
        dev: None,
        policy: None,
    }
}

fn rule(table: &str, chain: &str, expr: Vec<Statement<'static>>) -> Rule<'static> {
    Rule {
        family: FAMILY,
        table: table.to_owned().into(),
        chain: chain.to_owned().into(),
        expr: expr.into(),
        handle: None,
        index: None,
        comment: None,
    }
}

fn ip_daddr() -> Expression<'static> {
    Expression::Named(NamedExpression::Payload(Payload::PayloadField(
        PayloadField {
            protocol: "ip".into(),
            field: "daddr".into(),
        },
    )))
}

/// Masquerade outgoing traffic toward one upstream IPv4 address.
pub fn masquerade_rule(table: &str, ip: Ipv4Addr) -> Rule<'static> {
    rule(
        table,
        POSTROUTING_CHAIN,
        vec![
            Statement::Match(Match {
                left: ip_daddr(),
                right: Expression::String(ip.to_string().into()),
                op: Operator::EQ,
            }),
            Statement::Masquerade(None),
        ],
    )
}

/// The single DNAT rule of an upstream chain: rewrite the destination to
/// the upstream's current address and port.
pub fn dnat_rule(table: &str, upstream_chain: &str, addr: Ipv4Addr, port: u16) -> Rule<'static> {
    rule(
        table,
        upstream_chain,
        vec![Statement::DNAT(Some(NAT {
            addr: Some(Expression::String(addr.to_string().into())),
            family: Some(NATFamily::IP),
            port: Some(Expression::Number(u32::from(port))),
            flags: None,
        }))],
    )
}

/// Verdict map dispatching sequential indices to upstream chain jumps.
/// `elements` pairs each index with the chain it jumps to.
pub fn verdict_map(table: &str, name: &str, elements: &[(u16, String)]) -> Map<'static> {
    let elem: Vec<Expression<'static>> = elements
        .iter()
        .map(|(index, chain)| {
            Expression::List(vec![
                Expression::Number(u32::from(*index)),
                Expression::Verdict(Verdict::Jump(JumpTarget {
                    target: chain.clone().into(),
                })),
            ])
        })
        .collect();
    Map {
        family: FAMILY,
        table: table.to_owned().into(),
        name: name.to_owned().into(),
        handle: None,
        map: "verdict".into(),
        set_type: SetTypeValue::Single(SetType::InetService),
        policy: None,
        flags: None,
        elem: if elem.is_empty() { None } else { Some(elem.into()) },
        timeout: None,
        gc_interval: None,
        size: None,
        comment: None,
    }
}

/// The dispatch rule of a failover-mode chain: a round-robin counter
/// modulo the member count, looked up in the verdict map.
pub fn dispatch_rule(table: &str, chain: &str, map_name: &str, members: u32) -> Rule<'static> {
    rule(
        table,
        chain,
        vec![Statement::VerdictMap(VerdictMap {
            key: Expression::Named(NamedExpression::Numgen(Numgen {
                mode: NgMode::Inc,
                ng_mod: members,
                offset: Some(0),
            })),
            data: Expression::String(format!("@{map_name}").into()),
        })],
    )
}

/// The sole rule of a failover-mode chain with no available upstream.
pub fn reject_rule(table: &str, chain: &str) -> Rule<'static> {
    rule(table, chain, vec![Statement::Reject(None)])
}

/// Named per-group traffic counter.
pub fn counter_object(table: &str, name: &str) -> Counter<'static> {
    Counter {
        family: FAMILY,
        table: table.to_owned().into(),
        name: name.to_owned().into(),
        handle: None,
        packets: None,
        bytes: None,
    }
}

/// Prerouting redirection for a target: match the transport protocol and
/// destination port, count, and jump to the group's current failover
/// chain.
pub fn prerouting_rule(
    table: &str,
    port: u16,
    counter_name: &str,
    jump_chain: &str,
) -> Rule<'static> {
    rule(
        table,
        PREROUTING_CHAIN,
        vec![
            Statement::Match(Match {
                left: Expression::Named(NamedExpression::Meta(Meta {
                    key: MetaKey::L4proto,
                })),
                right: Expression::String("tcp".into()),
                op: Operator::EQ,
            }),
            Statement::Match(Match {
                left: Expression::Named(NamedExpression::Payload(Payload::PayloadField(
                    PayloadField {
                        protocol: "th".into(),
                        field: "dport".into(),
                    },
                ))),
                right: Expression::Number(u32::from(port)),
                op: Operator::EQ,
            }),
            Statement::Counter(CounterStmt::Named(counter_name.to_owned().into())),
            Statement::Jump(JumpTarget {
                target: jump_chain.to_owned().into(),
            }),
        ],
    )
}

// ── Decoders over listed rules ────────────────────────────────────

/// The destination address a masquerade rule matches, if the rule is one
/// of ours.
pub fn masquerade_rule_ip(rule: &Rule) -> Option<Ipv4Addr> {
    let mut daddr = None;
    let mut has_masquerade = false;
    for stmt in rule.expr.iter() {
        match stmt {
            Statement::Match(m) => {
                if is_ip_daddr(&m.left)
                    && let Expression::String(s) = &m.right
                {
                    daddr = s.parse().ok();
                }
            }
            Statement::Masquerade(_) => has_masquerade = true,
            _ => {}
        }
    }
    if has_masquerade { daddr } else { None }
}

fn is_ip_daddr(e: &Expression) -> bool {
    matches!(
        e,
        Expression::Named(NamedExpression::Payload(Payload::PayloadField(PayloadField {
            protocol,
            field,
        }))) if protocol == "ip" && field == "daddr"
    )
}

/// The chain a rule's jump verdict points at.
pub fn rule_jump_target<'a>(rule: &'a Rule) -> Option<&'a str> {
    rule.expr.iter().find_map(|stmt| match stmt {
        Statement::Jump(jump) => Some(jump.target.as_ref()),
        _ => None,
    })
}
