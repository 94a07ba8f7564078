use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr};
use std::process::Command;
use std::sync::Mutex;

use nftables::batch::Batch;
use nftables::helper;
use nftables::schema::{NfListObject, NfObject, Nftables, Rule};
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use domain::common::entity::{EngineKind, unique_ips};
use domain::loadbalancer::entity::{Target, Upstream};
use ports::secondary::engine_port::{
    DEFAULT_POSTROUTING_PRIORITY, DEFAULT_PREROUTING_PRIORITY, EngineError, EngineHandoff,
    EnginePort,
};

use crate::system::capabilities::{ProcessCapabilities, check_required_capabilities};
use crate::system::forwarding::check_ip_forwarding;

use super::build;
use super::naming::{
    POSTROUTING_CHAIN, PREROUTING_CHAIN, group_object_name, is_owned_table_name,
    stamped_table_name, toggled_priority,
};

const PERMISSION_HINT: &str = "when running as an unprivileged user, the process must carry the \
'e' (effective) and 'p' (permitted) flags on the NET_ADMIN and NET_RAW capabilities. On most \
systems: `setcap 'cap_net_admin,cap_net_raw+ep' /path/to/lobby`, then restart, or re-run as root";

/// nftables load balancer engine.
///
/// All kernel mutations go through [`NftEngine::apply`], which submits one
/// atomic transaction while the engine mutex is held. The mutex also guards
/// the engine bookkeeping: the current table name, chain priorities, and
/// which targets have their prerouting rule installed.
#[derive(Debug)]
pub struct NftEngine {
    inner: Mutex<NftState>,
}

#[derive(Debug)]
struct NftState {
    table_name: String,
    postrouting_priority: i32,
    prerouting_priority: i32,
    initialized_targets: HashSet<String>,
}

impl Default for NftEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl NftEngine {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(NftState {
                table_name: String::new(),
                postrouting_priority: DEFAULT_POSTROUTING_PRIORITY,
                prerouting_priority: DEFAULT_PREROUTING_PRIORITY,
                initialized_targets: HashSet::new(),
            }),
        }
    }

    /// Submit one atomic ruleset transaction.
    fn apply(&self, batch: Batch) -> Result<(), EngineError> {
        let ruleset = batch.to_nftables();
        helper::apply_ruleset(&ruleset).map_err(|e| EngineError::Netlink(e.to_string()))
    }

    fn current_ruleset(&self) -> Result<Nftables<'static>, EngineError> {
        helper::get_current_ruleset().map_err(|e| EngineError::Netlink(e.to_string()))
    }

    /// Delete leftover tables from a previous instance of the same family,
    /// recognized by the application table-name shape.
    fn reclaim_stale_tables(&self) -> Result<(), EngineError> {
        let ruleset = self.current_ruleset()?;
        let mut batch = Batch::new();
        let mut found = false;
        for object in list_objects(&ruleset) {
            if let NfListObject::Table(t) = object
                && t.family == build::FAMILY
                && is_owned_table_name(&t.name)
            {
                debug!(table = %t.name, "deleting stale table from a previous instance");
                batch.delete(NfListObject::Table(build::table(&t.name)));
                found = true;
            }
        }
        if found {
            self.apply(batch)?;
        }
        Ok(())
    }

    fn update_target_inner(&self, st: &mut NftState, target: &mut Target) -> Result<(), EngineError> {
        info!(
            target = %target.name,
            protocol = %target.protocol,
            port = target.port,
            "setting nftables for target"
        );

        let active = target.group.available_upstreams();
        let total = target.group.upstreams.len();
        if active == 0 {
            info!(target = %target.name, "no upstreams available");
        } else {
            info!(target = %target.name, "{active}/{total} upstreams available");
        }

        let next = target
            .group
            .advance_failover()
            .map_err(|e| EngineError::UpdateTarget(e.to_string()))?;
        let prev = target.group.previous_failover_mode;
        let next_name = group_object_name(&target.group.name, next);
        let prev_name = group_object_name(&target.group.name, prev);

        let ruleset = self.current_ruleset()?;
        let existing_chains = chain_names(&ruleset, &st.table_name);
        let existing_maps = map_names(&ruleset, &st.table_name);
        let existing_counters = counter_names(&ruleset, &st.table_name);

        let mut batch = Batch::new();

        // New failover chain for this recomputation.
        batch.add(NfListObject::Chain(build::plain_chain(
            &st.table_name,
            &next_name,
        )));

        // Upstream chains missing from the table, one DNAT rule each.
        for upstream in &target.group.upstreams {
            if existing_chains.contains(&upstream.name) {
                continue;
            }
            if let Some(IpAddr::V4(addr)) = upstream.address {
                debug!(upstream = %upstream.name, %addr, port = upstream.port, "installing upstream chain");
                batch.add(NfListObject::Chain(build::plain_chain(
                    &st.table_name,
                    &upstream.name,
                )));
                batch.add(NfListObject::Rule(build::dnat_rule(
                    &st.table_name,
                    &upstream.name,
                    addr,
                    upstream.port,
                )));
            }
        }

        // Verdict map over the available upstreams, then the chain's sole
        // rule: reject when nothing can serve, dispatch otherwise.
        let elements: Vec<(u16, String)> = target
            .group
            .upstreams
            .iter()
            .filter(|u| u.available)
            .enumerate()
            .map(|(i, u)| (u16::try_from(i).unwrap_or(u16::MAX), u.name.clone()))
            .collect();
        batch.add(NfListObject::Map(Box::new(build::verdict_map(
            &st.table_name,
            &next_name,
            &elements,
        ))));
        if elements.is_empty() {
            batch.add(NfListObject::Rule(build::reject_rule(
                &st.table_name,
                &next_name,
            )));
        } else {
            batch.add(NfListObject::Rule(build::dispatch_rule(
                &st.table_name,
                &next_name,
                &next_name,
                elements.len() as u32,
            )));
        }

        if !existing_counters.contains(&target.name) {
            batch.add(NfListObject::Counter(build::counter_object(
                &st.table_name,
                &target.name,
            )));
        }

        // Point the prerouting redirection at the new chain: installed
        // fresh the first time, otherwise the rule targeting the previous
        // mode's chain is swapped within the same transaction.
        let redirection =
            build::prerouting_rule(&st.table_name, target.port, &target.name, &next_name);
        if st.initialized_targets.contains(&target.name) {
            for rule in rules_in(&ruleset, &st.table_name, PREROUTING_CHAIN) {
                if build::rule_jump_target(rule) == Some(prev_name.as_str())
                    && let Some(handle) = rule.handle
                {
                    batch.delete(NfListObject::Rule(rule_handle_ref(rule, handle)));
                    batch.add(NfListObject::Rule(redirection.clone()));
                }
            }
        } else {
            debug!(target = %target.name, chain = %next_name, "installing prerouting redirection");
            batch.add(NfListObject::Rule(redirection));
            st.initialized_targets.insert(target.name.clone());
        }

        // Retire the previous mode's objects.
        if prev_name != next_name {
            if existing_chains.contains(&prev_name) {
                batch.delete(NfListObject::Chain(build::plain_chain(
                    &st.table_name,
                    &prev_name,
                )));
            }
            if existing_maps.contains(&prev_name) {
                batch.delete(NfListObject::Map(Box::new(build::verdict_map(
                    &st.table_name,
                    &prev_name,
                    &[],
                ))));
            }
        }

        self.apply(batch)
            .map_err(|e| EngineError::UpdateTarget(e.to_string()))
    }

    /// Add a masquerade rule for the address unless one already matches it.
    fn add_masquerade(&self, st: &NftState, addr: Ipv4Addr) -> Result<(), EngineError> {
        debug!(%addr, "masquerade requested");
        let ruleset = self.current_ruleset()?;
        let present = rules_in(&ruleset, &st.table_name, POSTROUTING_CHAIN)
            .iter()
            .filter_map(|r| build::masquerade_rule_ip(r))
            .any(|ip| ip == addr);
        if present {
            return Ok(());
        }
        let mut batch = Batch::new();
        batch.add(NfListObject::Rule(build::masquerade_rule(
            &st.table_name,
            addr,
        )));
        self.apply(batch)
    }

    /// Rewrite the upstream chain's DNAT rule to the current address,
    /// creating the chain when it does not exist yet.
    fn update_upstream_chain(
        &self,
        st: &NftState,
        upstream: &Upstream,
        addr: Ipv4Addr,
    ) -> Result<(), EngineError> {
        debug!(upstream = %upstream.name, "upstream chain update requested");
        let ruleset = self.current_ruleset()?;
        let chain_exists = chain_names(&ruleset, &st.table_name).contains(&upstream.name);
        let rules = rules_in(&ruleset, &st.table_name, &upstream.name);

        let mut batch = Batch::new();
        if !chain_exists {
            batch.add(NfListObject::Chain(build::plain_chain(
                &st.table_name,
                &upstream.name,
            )));
        }
        // Upstream chains hold a single rule; swap it when present.
        if let Some(rule) = rules.first()
            && let Some(handle) = rule.handle
        {
            batch.delete(NfListObject::Rule(rule_handle_ref(rule, handle)));
        }
        batch.add(NfListObject::Rule(build::dnat_rule(
            &st.table_name,
            &upstream.name,
            addr,
            upstream.port,
        )));
        self.apply(batch)
    }

    /// Delete masquerade rules for addresses no longer in the ledger, and
    /// thin duplicated rules down to one per address.
    fn clean_masquerade(&self, st: &NftState, keep: &[IpAddr]) -> Result<(), EngineError> {
        debug!("masquerade rule cleanup requested");
        let ruleset = self.current_ruleset()?;
        let mut batch = Batch::new();
        let mut seen: HashSet<Ipv4Addr> = HashSet::new();
        let mut found = false;
        for rule in rules_in(&ruleset, &st.table_name, POSTROUTING_CHAIN) {
            let Some(ip) = build::masquerade_rule_ip(rule) else {
                continue;
            };
            let Some(handle) = rule.handle else { continue };
            let keep_rule = keep.contains(&IpAddr::V4(ip)) && seen.insert(ip);
            if !keep_rule {
                debug!(%ip, "deleting masquerade rule");
                batch.delete(NfListObject::Rule(rule_handle_ref(rule, handle)));
                found = true;
            }
        }
        if found {
            self.apply(batch)?;
        }
        Ok(())
    }
}

impl EnginePort for NftEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Nftables
    }

    fn check_permissions(&self) -> Result<(), EngineError> {
        let caps = ProcessCapabilities::current()
            .map_err(|e| EngineError::Permissions(e.to_string()))?;
        check_required_capabilities(&caps)
            .map_err(|e| EngineError::Permissions(format!("{e}: {PERMISSION_HINT}")))?;
        debug!("permissions check succeeded");
        Ok(())
    }

    fn check_dependencies(&self) -> Result<(), EngineError> {
        Command::new("nft")
            .arg("--version")
            .output()
            .map_err(|e| EngineError::Dependencies(format!("nft binary not usable: {e}")))?;

        let forwarding =
            check_ip_forwarding().map_err(|e| EngineError::Dependencies(e.to_string()))?;
        if !forwarding.ipv4_enabled() {
            warn!(
                "IPv4 forwarding seems disabled at system level; forwarded IPv4 traffic will not \
                 be load balanced until it is enabled"
            );
        }
        if !forwarding.ipv6_enabled() {
            warn!(
                "IPv6 forwarding seems disabled at system level; forwarded IPv6 traffic will not \
                 be load balanced until it is enabled"
            );
        }
        debug!("dependencies check completed");
        Ok(())
    }

    fn start_or_reconfig(
        &self,
        targets: &mut [Target],
        upstream_ips: &[IpAddr],
        refresh: bool,
    ) -> Result<(), EngineError> {
        let mut st = self.inner.lock().expect("nft state lock");

        if refresh {
            debug!("nft reconfig requested");
            // The incoming table coexists with the outgoing one; shifting
            // both priorities keeps them from ever being equal across the
            // two tables.
            st.postrouting_priority =
                toggled_priority(st.postrouting_priority, DEFAULT_POSTROUTING_PRIORITY);
            st.prerouting_priority =
                toggled_priority(st.prerouting_priority, DEFAULT_PREROUTING_PRIORITY);
        } else {
            debug!("nft initialization requested");
            self.reclaim_stale_tables()
                .map_err(|e| EngineError::Start(e.to_string()))?;
            st.postrouting_priority = DEFAULT_POSTROUTING_PRIORITY;
            st.prerouting_priority = DEFAULT_PREROUTING_PRIORITY;
        }

        st.table_name = stamped_table_name(OffsetDateTime::now_utc());
        st.initialized_targets.clear();
        debug!(table = %st.table_name, "installing load balancer table");

        let mut batch = Batch::new();
        batch.add(NfListObject::Table(build::table(&st.table_name)));
        batch.add(NfListObject::Chain(build::postrouting_chain(
            &st.table_name,
            st.postrouting_priority,
        )));
        for ip in unique_ips(upstream_ips) {
            if let IpAddr::V4(addr) = ip {
                batch.add(NfListObject::Rule(build::masquerade_rule(
                    &st.table_name,
                    addr,
                )));
            }
        }
        batch.add(NfListObject::Chain(build::prerouting_chain(
            &st.table_name,
            st.prerouting_priority,
        )));
        self.apply(batch)
            .map_err(|e| EngineError::Start(e.to_string()))?;

        for target in targets.iter_mut() {
            self.update_target_inner(&mut st, target)
                .map_err(|e| EngineError::Start(e.to_string()))?;
        }

        Ok(())
    }

    fn stop(&self) -> Result<(), EngineError> {
        let st = self.inner.lock().expect("nft state lock");
        if st.table_name.is_empty() {
            return Ok(());
        }
        info!(table = %st.table_name, "deleting load balancer table");
        let mut batch = Batch::new();
        batch.delete(NfListObject::Table(build::table(&st.table_name)));
        self.apply(batch)
            .map_err(|e| EngineError::Stop(e.to_string()))
    }

    fn handoff(&self) -> EngineHandoff {
        let st = self.inner.lock().expect("nft state lock");
        EngineHandoff {
            postrouting_priority: st.postrouting_priority,
            prerouting_priority: st.prerouting_priority,
        }
    }

    fn adopt(&self, handoff: EngineHandoff) {
        let mut st = self.inner.lock().expect("nft state lock");
        st.postrouting_priority = handoff.postrouting_priority;
        st.prerouting_priority = handoff.prerouting_priority;
    }

    fn update_target(&self, target: &mut Target) -> Result<(), EngineError> {
        let mut st = self.inner.lock().expect("nft state lock");
        self.update_target_inner(&mut st, target)
    }

    fn update_upstream(
        &self,
        upstream: &Upstream,
        unique_ips: &[IpAddr],
    ) -> Result<(), EngineError> {
        debug!(upstream = %upstream.name, "upstream update requested");
        let st = self.inner.lock().expect("nft state lock");

        let Some(IpAddr::V4(addr)) = upstream.address else {
            return Err(EngineError::UpdateUpstream(format!(
                "upstream '{}' has no IPv4 address",
                upstream.name
            )));
        };

        // The masquerade for the new address must exist before the DNAT
        // rewrite, and stale masquerades may only go once the rewrite is
        // in place, so in-flight flows always have matching SNAT.
        self.add_masquerade(&st, addr)
            .map_err(|e| EngineError::UpdateUpstream(e.to_string()))?;
        self.update_upstream_chain(&st, upstream, addr)
            .map_err(|e| EngineError::UpdateUpstream(e.to_string()))?;
        self.clean_masquerade(&st, unique_ips)
            .map_err(|e| EngineError::UpdateUpstream(e.to_string()))?;
        Ok(())
    }
}

// ── Ruleset listing helpers ───────────────────────────────────────

fn list_objects<'a, 'b: 'a>(
    ruleset: &'a Nftables<'b>,
) -> impl Iterator<Item = &'a NfListObject<'b>> {
    ruleset.objects.iter().filter_map(|o| match o {
        NfObject::ListObject(l) => Some(l),
        NfObject::CmdObject(_) => None,
    })
}

fn chain_names<'b>(ruleset: &Nftables<'b>, table: &str) -> HashSet<String> {
    list_objects(ruleset)
        .filter_map(|o| match o {
            NfListObject::Chain(c) if c.table == table => Some(c.name.to_string()),
            _ => None,
        })
        .collect()
}

fn map_names<'b>(ruleset: &Nftables<'b>, table: &str) -> HashSet<String> {
    list_objects(ruleset)
        .filter_map(|o| match o {
            NfListObject::Map(m) if m.table == table => Some(m.name.to_string()),
            _ => None,
        })
        .collect()
}

fn counter_names<'b>(ruleset: &Nftables<'b>, table: &str) -> HashSet<String> {
    list_objects(ruleset)
        .filter_map(|o| match o {
            NfListObject::Counter(c) if c.table == table => Some(c.name.to_string()),
            _ => None,
        })
        .collect()
}

fn rules_in<'a, 'b: 'a>(ruleset: &'a Nftables<'b>, table: &str, chain: &str) -> Vec<&'a Rule<'b>> {
    list_objects(ruleset)
        .filter_map(|o| match o {
            NfListObject::Rule(r) if r.table == table && r.chain == chain => Some(r),
            _ => None,
        })
        .collect()
}

/// A rule reference carrying just enough identity for a delete command.
fn rule_handle_ref(rule: &Rule, handle: u32) -> Rule<'static> {
    Rule {
        family: build::FAMILY,
        table: rule.table.to_string().into(),
        chain: rule.chain.to_string().into(),
        expr: Vec::new().into(),
        handle: Some(handle),
        index: None,
        comment: None,
    }
}
