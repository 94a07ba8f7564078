use std::net::IpAddr;
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use domain::common::entity::{DistMode, EngineKind, HostKind, Protocol, unique_ips};
use domain::loadbalancer::entity::{
    HcProtocol, HealthCheck, Target, Upstream, UpstreamDns, UpstreamGroup,
};
use infrastructure::config::EngineConfig;
use infrastructure::constants::DEFAULT_DNS_TTL_SECS;
use ports::secondary::dns_resolver_port::DnsResolverPort;
use ports::secondary::engine_port::EnginePort;

use crate::dns_check;
use crate::error::OrchestratorError;
use crate::health_check;

/// Mutable state of one load balancer instance, guarded by the instance
/// mutex. The engine has its own lock; this one covers the in-process
/// data model only.
pub(crate) struct LbState {
    pub(crate) targets: Vec<Target>,
    /// All upstream IPs currently referenced, duplicates included: the
    /// multiplicity tracks how many upstreams share an address.
    pub(crate) upstream_ips: Vec<IpAddr>,
    pub(crate) terminate: bool,
}

struct CheckTasks {
    tracker: TaskTracker,
    hc_tokens: Vec<CancellationToken>,
    dns_tokens: Vec<CancellationToken>,
}

/// One load balancer instance: an engine plus the targets it serves and
/// the check tasks keeping their availability current.
pub struct Lb {
    kind: EngineKind,
    pub(crate) engine: Arc<dyn EnginePort>,
    pub(crate) resolver: Arc<dyn DnsResolverPort>,
    pub(crate) state: Mutex<LbState>,
    checks: StdMutex<CheckTasks>,
}

impl Lb {
    /// Materialize the target/group/upstream tree for one engine entry.
    /// Assumes the configuration has been validated; initial FQDN
    /// resolution failures leave the upstream unavailable with no
    /// address, to be retried by its DNS check.
    pub async fn from_entry(
        entry: &EngineConfig,
        engine: Arc<dyn EnginePort>,
        resolver: Arc<dyn DnsResolverPort>,
    ) -> Result<Arc<Self>, OrchestratorError> {
        let kind = EngineKind::from_name(&entry.engine);
        if kind == EngineKind::Unknown {
            return Err(OrchestratorError::Init(format!(
                "unknown engine '{}'",
                entry.engine
            )));
        }

        let mut targets = Vec::with_capacity(entry.targets.len());
        let mut upstream_ips = Vec::new();

        for target_cfg in &entry.targets {
            let protocol = Protocol::from_name(&target_cfg.protocol);
            let group_cfg = &target_cfg.upstream_group;
            let mut upstreams = Vec::with_capacity(group_cfg.upstreams.len());

            for upstream_cfg in &group_cfg.upstreams {
                let health_check = match upstream_cfg.active_health_check() {
                    Some(hc) => HealthCheck {
                        active: true,
                        protocol: HcProtocol::from_name(&hc.protocol),
                        port: hc.port,
                        check_interval: hc.probe.check_interval,
                        timeout: hc.probe.timeout,
                        required_count: hc.probe.success_count,
                        count: 0,
                    },
                    None => HealthCheck::inactive(),
                };
                let mut available = upstream_cfg
                    .active_health_check()
                    .map_or(true, |hc| hc.start_available);

                let servers: Vec<IpAddr> = upstream_cfg
                    .dns
                    .servers
                    .iter()
                    .filter_map(|s| s.parse().ok())
                    .collect();

                let mut host = upstream_cfg.host.clone();
                let mut address = None;
                let mut ttl = 0u32;
                match HostKind::classify(&host) {
                    HostKind::Fqdn => {
                        if !host.ends_with('.') {
                            host.push('.');
                        }
                        match resolver.resolve(&host, &servers).await {
                            Ok((ip, response_ttl)) => {
                                address = Some(ip);
                                ttl = response_ttl;
                                debug!(
                                    upstream = %upstream_cfg.name,
                                    address = %ip,
                                    ttl,
                                    "initial fqdn resolution"
                                );
                            }
                            Err(e) => {
                                warn!(
                                    upstream = %upstream_cfg.name,
                                    host = %host,
                                    error = %e,
                                    "failed to resolve upstream host"
                                );
                                ttl = if upstream_cfg.dns.ttl != 0 {
                                    upstream_cfg.dns.ttl
                                } else {
                                    DEFAULT_DNS_TTL_SECS
                                };
                                warn!(
                                    upstream = %upstream_cfg.name,
                                    retry_secs = ttl,
                                    "setting upstream unavailable until the next DNS query"
                                );
                                available = false;
                            }
                        }
                    }
                    HostKind::Ipv4 | HostKind::Ipv6 => {
                        address = host.parse().ok();
                    }
                    HostKind::Unknown => {
                        warn!(
                            upstream = %upstream_cfg.name,
                            host = %host,
                            "failed to process upstream host, setting upstream unavailable"
                        );
                        available = false;
                    }
                }

                if let Some(ip) = address {
                    upstream_ips.push(ip);
                }

                upstreams.push(Upstream {
                    name: upstream_cfg.name.clone(),
                    protocol,
                    host,
                    port: upstream_cfg.port,
                    dns: UpstreamDns {
                        servers,
                        configured_ttl: upstream_cfg.dns.ttl,
                        ttl,
                    },
                    address,
                    available,
                    health_check,
                });
            }

            targets.push(Target {
                name: target_cfg.name.clone(),
                protocol,
                ip: target_cfg.ip.clone(),
                port: target_cfg.port,
                group: UpstreamGroup::new(
                    group_cfg.name.clone(),
                    DistMode::from_name(&group_cfg.distribution),
                    upstreams,
                ),
            });
        }

        Ok(Arc::new(Self {
            kind,
            engine,
            resolver,
            state: Mutex::new(LbState {
                targets,
                upstream_ips,
                terminate: false,
            }),
            checks: StdMutex::new(CheckTasks {
                tracker: TaskTracker::new(),
                hc_tokens: Vec::new(),
                dns_tokens: Vec::new(),
            }),
        }))
    }

    pub fn kind(&self) -> EngineKind {
        self.kind
    }

    /// Check permissions and dependencies, install the initial engine
    /// state, then spawn the DNS and health checks. Failures here are
    /// not recoverable.
    pub async fn start(self: &Arc<Self>) -> Result<(), OrchestratorError> {
        info!(engine = %self.kind, "start load balancer requested");

        self.engine
            .check_permissions()
            .map_err(|e| OrchestratorError::Start(e.to_string()))?;
        self.engine
            .check_dependencies()
            .map_err(|e| OrchestratorError::Start(e.to_string()))?;

        {
            let mut st = self.state.lock().await;
            let LbState {
                targets,
                upstream_ips,
                ..
            } = &mut *st;
            self.engine
                .start(targets, upstream_ips)
                .map_err(|e| OrchestratorError::Start(e.to_string()))?;
        }

        self.start_checks().await;
        info!(engine = %self.kind, "load balancer successfully started");
        Ok(())
    }

    /// Spawn a DNS check per FQDN upstream and a health check per
    /// probe-enabled upstream. Tokens are recorded per task actually
    /// spawned, so teardown only cancels what exists.
    pub async fn start_checks(self: &Arc<Self>) {
        info!(engine = %self.kind, "starting checks");

        let plan: Vec<(usize, usize, bool, bool)> = {
            let st = self.state.lock().await;
            st.targets
                .iter()
                .enumerate()
                .flat_map(|(ti, t)| {
                    t.group.upstreams.iter().enumerate().map(move |(ui, u)| {
                        (
                            ti,
                            ui,
                            u.host_kind() == HostKind::Fqdn,
                            u.health_check.active,
                        )
                    })
                })
                .collect()
        };

        for (target_idx, upstream_idx, is_fqdn, hc_active) in plan {
            if is_fqdn {
                let token = dns_check::spawn(Arc::clone(self), target_idx, upstream_idx);
                self.checks.lock().expect("checks lock").dns_tokens.push(token);
            }
            if hc_active {
                let token = health_check::spawn(Arc::clone(self), target_idx, upstream_idx);
                self.checks.lock().expect("checks lock").hc_tokens.push(token);
            }
        }
    }

    /// Cancel every check task that was spawned and wait until all have
    /// drained.
    pub async fn stop_checks(&self) {
        info!(engine = %self.kind, "stopping health checks and dns checks");
        let tracker = {
            let checks = self.checks.lock().expect("checks lock");
            for token in &checks.hc_tokens {
                token.cancel();
            }
            for token in &checks.dns_tokens {
                token.cancel();
            }
            checks.tracker.clone()
        };
        tracker.close();
        tracker.wait().await;
        debug!(engine = %self.kind, "health checks and dns checks stopped");
    }

    pub(crate) fn tracker(&self) -> TaskTracker {
        self.checks.lock().expect("checks lock").tracker.clone()
    }

    /// Stop the checks, then tear down the engine.
    pub async fn stop(&self) -> Result<(), OrchestratorError> {
        info!(engine = %self.kind, "stop load balancer requested");
        self.stop_checks().await;
        self.engine
            .stop()
            .map_err(|e| OrchestratorError::Stop(e.to_string()))?;
        info!(engine = %self.kind, "load balancer successfully stopped");
        Ok(())
    }

    /// Hand this instance's kernel state over to its replacement. The
    /// new instance's checks run before this instance's are stopped, so
    /// the engine kind is never left unattended.
    pub async fn reconfig(self: &Arc<Self>, new: &Arc<Lb>) -> Result<(), OrchestratorError> {
        info!(engine = %self.kind, "load balancer engine reconfiguration");

        {
            let mut st = self.state.lock().await;

            {
                let mut new_st = new.state.lock().await;
                let LbState {
                    targets,
                    upstream_ips,
                    ..
                } = &mut *new_st;
                self.engine
                    .reconfig(new.engine.as_ref(), targets, upstream_ips)
                    .map_err(|e| OrchestratorError::Reconfig(e.to_string()))?;
            }

            new.start_checks().await;
            st.terminate = true;
        }

        self.stop_checks().await;
        Ok(())
    }

    /// Apply a new address to an upstream: swap it into the instance
    /// ledger, then refresh the engine with the deduplicated IP set.
    pub async fn update_upstream(
        &self,
        target_idx: usize,
        upstream_idx: usize,
        new_ip: IpAddr,
    ) -> Result<(), OrchestratorError> {
        let mut st = self.state.lock().await;
        let upstream = &mut st.targets[target_idx].group.upstreams[upstream_idx];
        info!(upstream = %upstream.name, "update upstream");

        let old = upstream.address;
        upstream.address = Some(new_ip);

        match old {
            Some(old_ip) => {
                debug!(from = %old_ip, to = %new_ip, "replacing upstream address in ledger");
                if let Some(slot) = st.upstream_ips.iter_mut().find(|ip| **ip == old_ip) {
                    *slot = new_ip;
                } else {
                    warn!(
                        ip = %old_ip,
                        "upstream IP to replace not found in ledger; this could be a bug with \
                         impact on the load balancer, please report it with verboseDebug logs"
                    );
                    st.upstream_ips.push(new_ip);
                }
            }
            None => st.upstream_ips.push(new_ip),
        }

        let deduplicated = unique_ips(&st.upstream_ips);
        let upstream = &st.targets[target_idx].group.upstreams[upstream_idx];
        self.engine
            .update_upstream(upstream, &deduplicated)
            .map_err(|e| OrchestratorError::UpstreamUpdate(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use adapters::test_engine::TestEngine;
    use infrastructure::config::ConfigRoot;
    use ports::test_utils::{ScriptedAnswer, ScriptedResolver};

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn basic_yaml(upstream_host: &str, health_check: bool) -> String {
        let hc = if health_check {
            "\n              health_check:\n                protocol: tcp\n                port: 8080\n                start_available: true\n                probe:\n                  check_interval: 1\n                  timeout: 2\n                  success_count: 3"
        } else {
            ""
        };
        format!(
            r#"
lb:
  - engine: testEngine
    targets:
      - name: t1
        protocol: tcp
        ip: ""
        port: 8080
        upstream_group:
          name: ug1
          distribution: round-robin
          upstreams:
            - name: u1
              host: {upstream_host}
              port: 8080{hc}
"#
        )
    }

    async fn make_lb(
        yaml: &str,
        resolver: Arc<dyn DnsResolverPort>,
    ) -> (Arc<Lb>, Arc<TestEngine>) {
        let root = ConfigRoot::from_yaml(yaml).unwrap();
        let engine = Arc::new(TestEngine::new());
        let lb = Lb::from_entry(&root.lb[0], engine.clone(), resolver)
            .await
            .unwrap();
        (lb, engine)
    }

    #[tokio::test]
    async fn init_with_ip_upstream_populates_ledger() {
        let resolver = Arc::new(ScriptedResolver::failing());
        let (lb, _) = make_lb(&basic_yaml("8.8.8.8", false), resolver).await;

        let st = lb.state.lock().await;
        assert_eq!(st.upstream_ips, vec![ip("8.8.8.8")]);
        let u = &st.targets[0].group.upstreams[0];
        assert!(u.available);
        assert_eq!(u.address, Some(ip("8.8.8.8")));
        assert!(!u.health_check.active);
    }

    #[tokio::test]
    async fn init_resolves_fqdn_and_canonicalizes() {
        let resolver = Arc::new(ScriptedResolver::answering(ip("1.1.1.1"), 30));
        let (lb, _) = make_lb(&basic_yaml("u.example.com", false), resolver).await;

        let st = lb.state.lock().await;
        let u = &st.targets[0].group.upstreams[0];
        assert_eq!(u.host, "u.example.com.");
        assert_eq!(u.address, Some(ip("1.1.1.1")));
        assert_eq!(u.dns.ttl, 30);
        assert_eq!(st.upstream_ips, vec![ip("1.1.1.1")]);
    }

    #[tokio::test]
    async fn init_failed_resolution_starts_unavailable() {
        let resolver = Arc::new(ScriptedResolver::failing());
        let (lb, _) = make_lb(&basic_yaml("u.example.com", false), resolver).await;

        let st = lb.state.lock().await;
        let u = &st.targets[0].group.upstreams[0];
        assert_eq!(u.address, None);
        assert!(!u.available);
        assert_eq!(u.dns.ttl, DEFAULT_DNS_TTL_SECS);
        assert!(st.upstream_ips.is_empty());
    }

    #[tokio::test]
    async fn start_runs_engine_and_checks() {
        let resolver = Arc::new(ScriptedResolver::failing());
        let (lb, _engine) = make_lb(&basic_yaml("8.8.8.8", false), resolver).await;
        lb.start().await.unwrap();
        lb.stop().await.unwrap();
    }

    #[tokio::test]
    async fn start_propagates_permission_failure() {
        let resolver = Arc::new(ScriptedResolver::failing());
        let (lb, engine) = make_lb(&basic_yaml("8.8.8.8", false), resolver).await;
        engine.set_results(false, true, false);
        assert!(matches!(
            lb.start().await.unwrap_err(),
            OrchestratorError::Start(_)
        ));
    }

    #[tokio::test]
    async fn start_propagates_dependency_failure() {
        let resolver = Arc::new(ScriptedResolver::failing());
        let (lb, engine) = make_lb(&basic_yaml("8.8.8.8", false), resolver).await;
        engine.set_results(true, false, false);
        assert!(lb.start().await.is_err());
    }

    #[tokio::test]
    async fn start_propagates_engine_start_failure() {
        let resolver = Arc::new(ScriptedResolver::failing());
        let (lb, engine) = make_lb(&basic_yaml("8.8.8.8", false), resolver).await;
        engine.set_results(false, false, true);
        assert!(lb.start().await.is_err());
    }

    #[tokio::test]
    async fn update_upstream_replaces_ledger_entry() {
        let resolver = Arc::new(ScriptedResolver::answering(ip("1.1.1.1"), 5));
        let (lb, engine) = make_lb(&basic_yaml("u.example.com", false), resolver).await;

        lb.update_upstream(0, 0, ip("2.2.2.2")).await.unwrap();

        let st = lb.state.lock().await;
        assert_eq!(st.upstream_ips, vec![ip("2.2.2.2")]);
        assert_eq!(
            st.targets[0].group.upstreams[0].address,
            Some(ip("2.2.2.2"))
        );
        assert_eq!(engine.last_unique_ips(), vec![ip("2.2.2.2")]);
    }

    #[tokio::test]
    async fn update_upstream_appends_when_no_previous_address() {
        let resolver = Arc::new(ScriptedResolver::failing());
        let (lb, engine) = make_lb(&basic_yaml("u.example.com", false), resolver).await;

        lb.update_upstream(0, 0, ip("3.3.3.3")).await.unwrap();

        let st = lb.state.lock().await;
        assert_eq!(st.upstream_ips, vec![ip("3.3.3.3")]);
        assert_eq!(engine.update_upstream_calls(), 1);
    }

    #[tokio::test]
    async fn update_upstream_dedups_ledger_for_engine() {
        let resolver = Arc::new(ScriptedResolver::answering(ip("1.1.1.1"), 5));
        let yaml = r#"
lb:
  - engine: testEngine
    targets:
      - name: t1
        protocol: tcp
        port: 8080
        upstream_group:
          name: ug1
          distribution: round-robin
          upstreams:
            - name: u1
              host: 8.8.8.8
              port: 8080
            - name: u2
              host: 8.8.8.8
              port: 8081
"#;
        let (lb, engine) = make_lb(yaml, resolver).await;
        {
            let st = lb.state.lock().await;
            assert_eq!(st.upstream_ips.len(), 2);
        }

        // u1 moves elsewhere; u2 still references 8.8.8.8
        lb.update_upstream(0, 0, ip("9.9.9.9")).await.unwrap();
        assert_eq!(
            engine.last_unique_ips(),
            vec![ip("9.9.9.9"), ip("8.8.8.8")]
        );
    }

    #[tokio::test]
    async fn reconfig_hands_over_and_terminates_old() {
        let resolver: Arc<dyn DnsResolverPort> = Arc::new(ScriptedResolver::failing());
        let (old_lb, _) = make_lb(&basic_yaml("8.8.8.8", false), resolver.clone()).await;
        let (new_lb, _) = make_lb(&basic_yaml("9.9.9.9", false), resolver).await;

        old_lb.reconfig(&new_lb).await.unwrap();

        assert!(old_lb.state.lock().await.terminate);
        assert!(!new_lb.state.lock().await.terminate);
        new_lb.stop_checks().await;
    }

    #[tokio::test]
    async fn stop_checks_with_no_tasks_returns() {
        let resolver = Arc::new(ScriptedResolver::failing());
        let (lb, _) = make_lb(&basic_yaml("8.8.8.8", false), resolver).await;
        lb.stop_checks().await;
    }

    #[tokio::test]
    async fn dns_check_address_change_flows_to_engine() {
        let resolver = Arc::new(ScriptedResolver::new(vec![
            ScriptedAnswer::A(ip("1.1.1.1"), 1),
            ScriptedAnswer::A(ip("2.2.2.2"), 1),
        ]));
        let (lb, engine) = make_lb(&basic_yaml("u.example.com", false), resolver.clone()).await;

        lb.start_checks().await;
        // Initial resolution took the first scripted answer; the check
        // task fires after the 1s TTL and sees the second.
        tokio::time::sleep(std::time::Duration::from_millis(1500)).await;
        lb.stop_checks().await;

        let st = lb.state.lock().await;
        assert_eq!(
            st.targets[0].group.upstreams[0].address,
            Some(ip("2.2.2.2"))
        );
        assert_eq!(st.upstream_ips, vec![ip("2.2.2.2")]);
        assert_eq!(engine.last_unique_ips(), vec![ip("2.2.2.2")]);
        assert_eq!(engine.update_upstream_calls(), 1);
    }
}
