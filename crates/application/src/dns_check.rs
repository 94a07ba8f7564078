use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use infrastructure::constants::DEFAULT_DNS_TTL_SECS;

use crate::lb::Lb;

/// Spawn the DNS check task for one FQDN upstream. Returns the token
/// that cancels it.
///
/// The tick period is the TTL in force: the configured override when
/// set, otherwise the last response TTL, otherwise the default. A failed
/// resolution keeps the last known address and retries.
pub(crate) fn spawn(lb: Arc<Lb>, target_idx: usize, upstream_idx: usize) -> CancellationToken {
    let token = CancellationToken::new();
    let task_token = token.clone();
    let tracker = lb.tracker();

    tracker.spawn(async move {
        let (name, host, servers, configured_ttl, initial_ttl, hc_active) = {
            let mut st = lb.state.lock().await;
            let u = &mut st.targets[target_idx].group.upstreams[upstream_idx];
            if u.dns.configured_ttl != 0 {
                trace!(upstream = %u.name, ttl = u.dns.configured_ttl, "using configured DNS ttl");
                u.dns.ttl = u.dns.configured_ttl;
            } else if u.dns.ttl == 0 {
                u.dns.ttl = DEFAULT_DNS_TTL_SECS;
            }
            (
                u.name.clone(),
                u.host.clone(),
                u.dns.servers.clone(),
                u.dns.configured_ttl,
                u.dns.ttl,
                u.health_check.active,
            )
        };
        trace!(upstream = %name, ttl = initial_ttl, "dns check timer initialized");
        let mut period = Duration::from_secs(u64::from(initial_ttl));

        loop {
            tokio::select! {
                () = task_token.cancelled() => {
                    info!(upstream = %name, "dns check stop requested");
                    return;
                }
                () = sleep(period) => {}
            }

            let (terminating, current_address) = {
                let st = lb.state.lock().await;
                let u = &st.targets[target_idx].group.upstreams[upstream_idx];
                (st.terminate, u.address)
            };
            if terminating {
                continue;
            }

            match lb.resolver.resolve(&host, &servers).await {
                Err(e) => {
                    warn!(upstream = %name, host = %host, error = %e, "failed to resolve");
                    warn!(
                        upstream = %name,
                        "upstream address will be kept on the last known A record"
                    );
                    let retry_secs = {
                        let mut st = lb.state.lock().await;
                        let u = &mut st.targets[target_idx].group.upstreams[upstream_idx];
                        if u.dns.ttl == 0 {
                            u.dns.ttl = DEFAULT_DNS_TTL_SECS;
                        }
                        u.dns.ttl
                    };
                    warn!(upstream = %name, retry_secs, "new DNS query scheduled");
                    period = Duration::from_secs(u64::from(retry_secs));
                }
                Ok((address, response_ttl)) => {
                    if current_address != Some(address) {
                        info!(
                            upstream = %name,
                            from = %current_address.map_or_else(|| "none".to_string(), |ip| ip.to_string()),
                            to = %address,
                            "upstream IP address changed based on DNS query"
                        );

                        // Upstreams without health checks are considered
                        // available as soon as they resolve.
                        if !hc_active {
                            let mut st = lb.state.lock().await;
                            st.targets[target_idx].group.upstreams[upstream_idx].available = true;
                        }

                        if let Err(e) =
                            lb.update_upstream(target_idx, upstream_idx, address).await
                        {
                            warn!(
                                upstream = %name,
                                "upstream update request failed; the load balancer might be \
                                 misconfigured as a result, manual troubleshooting is likely \
                                 required"
                            );
                            info!(upstream = %name, error = %e, "upstream update failure detail");
                        }
                    }

                    if configured_ttl == 0 {
                        let next_ttl = if response_ttl != 0 {
                            response_ttl
                        } else {
                            trace!(
                                upstream = %name,
                                default_secs = DEFAULT_DNS_TTL_SECS,
                                "resolved DNS TTL was 0, using the default this time"
                            );
                            DEFAULT_DNS_TTL_SECS
                        };
                        {
                            let mut st = lb.state.lock().await;
                            st.targets[target_idx].group.upstreams[upstream_idx].dns.ttl =
                                next_ttl;
                        }
                        period = Duration::from_secs(u64::from(next_ttl));
                        debug!(upstream = %name, next_secs = next_ttl, "next DNS check scheduled");
                    }
                }
            }
        }
    });

    token
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;

    use adapters::test_engine::TestEngine;
    use infrastructure::config::ConfigRoot;
    use ports::test_utils::{ScriptedAnswer, ScriptedResolver};

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    async fn fqdn_lb(resolver: Arc<ScriptedResolver>) -> (Arc<Lb>, Arc<TestEngine>) {
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
              host: u.example.com
              port: 8080
"#;
        let root = ConfigRoot::from_yaml(yaml).unwrap();
        let engine = Arc::new(TestEngine::new());
        let lb = Lb::from_entry(&root.lb[0], engine.clone(), resolver)
            .await
            .unwrap();
        (lb, engine)
    }

    #[tokio::test]
    async fn address_change_marks_available_and_updates_ledger() {
        let resolver = Arc::new(ScriptedResolver::new(vec![
            ScriptedAnswer::A(ip("1.1.1.1"), 1),
            ScriptedAnswer::A(ip("2.2.2.2"), 1),
        ]));
        let (lb, engine) = fqdn_lb(resolver).await;

        let token = spawn(Arc::clone(&lb), 0, 0);
        tokio::time::sleep(Duration::from_millis(1500)).await;
        token.cancel();
        lb.stop_checks().await;

        let st = lb.state.lock().await;
        let u = &st.targets[0].group.upstreams[0];
        assert_eq!(u.address, Some(ip("2.2.2.2")));
        assert!(u.available);
        assert_eq!(st.upstream_ips, vec![ip("2.2.2.2")]);
        assert_eq!(engine.last_unique_ips(), vec![ip("2.2.2.2")]);
    }

    #[tokio::test]
    async fn unchanged_address_causes_no_engine_update() {
        let resolver = Arc::new(ScriptedResolver::answering(ip("1.1.1.1"), 1));
        let (lb, engine) = fqdn_lb(resolver).await;

        let token = spawn(Arc::clone(&lb), 0, 0);
        tokio::time::sleep(Duration::from_millis(1500)).await;
        token.cancel();
        lb.stop_checks().await;

        assert_eq!(engine.update_upstream_calls(), 0);
    }

    #[tokio::test]
    async fn resolution_failure_keeps_last_address_and_reschedules() {
        let resolver = Arc::new(ScriptedResolver::new(vec![
            ScriptedAnswer::A(ip("1.1.1.1"), 1),
            ScriptedAnswer::Fail,
        ]));
        let (lb, engine) = fqdn_lb(resolver.clone()).await;

        let token = spawn(Arc::clone(&lb), 0, 0);
        tokio::time::sleep(Duration::from_millis(1500)).await;
        token.cancel();
        lb.stop_checks().await;

        let st = lb.state.lock().await;
        assert_eq!(st.targets[0].group.upstreams[0].address, Some(ip("1.1.1.1")));
        assert_eq!(engine.update_upstream_calls(), 0);
        // the failed query happened
        assert!(resolver.calls() >= 2);
    }

    #[tokio::test]
    async fn zero_response_ttl_falls_back_to_default() {
        let resolver = Arc::new(ScriptedResolver::new(vec![
            ScriptedAnswer::A(ip("1.1.1.1"), 1),
            ScriptedAnswer::A(ip("2.2.2.2"), 0),
        ]));
        let (lb, _engine) = fqdn_lb(resolver).await;

        let token = spawn(Arc::clone(&lb), 0, 0);
        tokio::time::sleep(Duration::from_millis(1500)).await;
        token.cancel();
        lb.stop_checks().await;

        let st = lb.state.lock().await;
        assert_eq!(
            st.targets[0].group.upstreams[0].dns.ttl,
            DEFAULT_DNS_TTL_SECS
        );
    }
}
