use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use infrastructure::constants::MAX_HC_TIMER_INIT_MS;

use crate::lb::Lb;

/// Spawn the health check task for one upstream. Returns the token that
/// cancels it.
///
/// The first probe fires after a random delay so that upstreams sharing
/// a check interval don't stampede; every following probe runs on the
/// configured interval. The instance mutex is held for bookkeeping only,
/// never across the dial.
pub(crate) fn spawn(lb: Arc<Lb>, target_idx: usize, upstream_idx: usize) -> CancellationToken {
    let token = CancellationToken::new();
    let task_token = token.clone();
    let tracker = lb.tracker();

    tracker.spawn(async move {
        let name = {
            let st = lb.state.lock().await;
            st.targets[target_idx].group.upstreams[upstream_idx]
                .name
                .clone()
        };

        let initial_ms = rand::thread_rng().gen_range(1..=MAX_HC_TIMER_INIT_MS);
        trace!(upstream = %name, delay_ms = initial_ms, "healthcheck timer initialized");
        let mut delay = Duration::from_millis(initial_ms);

        loop {
            tokio::select! {
                () = task_token.cancelled() => {
                    info!(upstream = %name, "healthcheck stop requested");
                    return;
                }
                () = sleep(delay) => {}
            }
            trace!(upstream = %name, "healthcheck timer trigger");

            let (terminating, address, port, timeout_secs, interval_secs) = {
                let st = lb.state.lock().await;
                let u = &st.targets[target_idx].group.upstreams[upstream_idx];
                (
                    st.terminate,
                    u.address,
                    u.health_check.port,
                    u.health_check.timeout,
                    u.health_check.check_interval,
                )
            };
            delay = Duration::from_secs(u64::from(interval_secs));
            if terminating {
                continue;
            }

            let Some(address) = address else {
                trace!(
                    upstream = %name,
                    "host address unresolved, health check paused until it is available"
                );
                continue;
            };

            trace!(
                upstream = %name,
                %address,
                port,
                timeout_secs,
                "healthchecking upstream"
            );
            let dialed = timeout(
                Duration::from_secs(u64::from(timeout_secs)),
                TcpStream::connect((address, port)),
            )
            .await;
            let success = matches!(dialed, Ok(Ok(_)));

            let mut st = lb.state.lock().await;
            if st.terminate {
                continue;
            }
            let target = &mut st.targets[target_idx];
            let upstream = &mut target.group.upstreams[upstream_idx];

            if success {
                if upstream.available {
                    trace!(upstream = %name, "upstream continues available");
                    continue;
                }
                let flipped = upstream.record_probe_success();
                info!(
                    upstream = %name,
                    count = upstream.health_check.count,
                    required = upstream.health_check.required_count,
                    "upstream is unavailable but healthcheck succeeded"
                );
                if flipped {
                    info!(upstream = %name, "upstream became available");
                    if let Err(e) = lb.engine.update_target(target) {
                        warn!(upstream = %name, error = %e, "engine target update failed");
                    }
                }
            } else {
                debug!(
                    upstream = %name,
                    retry_secs = interval_secs,
                    "healthcheck for upstream failed"
                );
                if upstream.record_probe_failure() {
                    info!(
                        upstream = %name,
                        "upstream became unavailable due to healthcheck failure"
                    );
                    if let Err(e) = lb.engine.update_target(target) {
                        warn!(upstream = %name, error = %e, "engine target update failed");
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
    use std::sync::Arc;

    use adapters::test_engine::TestEngine;
    use infrastructure::config::ConfigRoot;
    use ports::test_utils::ScriptedResolver;
    use tokio::net::TcpListener;

    async fn lb_probing(host: &str, hc_port: u16, start_available: bool) -> (Arc<Lb>, Arc<TestEngine>) {
        let yaml = format!(
            r#"
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
              host: {host}
              port: {hc_port}
              health_check:
                protocol: tcp
                port: {hc_port}
                start_available: {start_available}
                probe:
                  check_interval: 1
                  timeout: 1
                  success_count: 2
"#
        );
        let root = ConfigRoot::from_yaml(&yaml).unwrap();
        let engine = Arc::new(TestEngine::new());
        let lb = Lb::from_entry(
            &root.lb[0],
            engine.clone(),
            Arc::new(ScriptedResolver::failing()),
        )
        .await
        .unwrap();
        (lb, engine)
    }

    #[tokio::test]
    async fn failing_probe_flips_unavailable_once() {
        // 192.0.2.1 is TEST-NET: connects reliably fail or time out.
        let (lb, engine) = lb_probing("192.0.2.1", 9, true).await;
        let token = spawn(Arc::clone(&lb), 0, 0);

        tokio::time::sleep(Duration::from_millis(2800)).await;
        token.cancel();
        lb.stop_checks().await;

        let st = lb.state.lock().await;
        let u = &st.targets[0].group.upstreams[0];
        assert!(!u.available);
        assert_eq!(u.health_check.count, 0);
        assert_eq!(engine.update_target_calls(), 1);
    }

    #[tokio::test]
    async fn consecutive_successes_flip_available() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let _ = listener.accept().await;
            }
        });

        let (lb, engine) = lb_probing("127.0.0.1", port, false).await;
        let token = spawn(Arc::clone(&lb), 0, 0);

        // success_count is 2 with a 1s interval; three periods suffice.
        tokio::time::sleep(Duration::from_millis(3500)).await;
        token.cancel();
        lb.stop_checks().await;

        let st = lb.state.lock().await;
        assert!(st.targets[0].group.upstreams[0].available);
        assert_eq!(engine.update_target_calls(), 1);
    }

    #[tokio::test]
    async fn unresolved_address_skips_probe() {
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
              port: 9000
              health_check:
                protocol: tcp
                port: 9000
                start_available: false
                probe:
                  check_interval: 1
                  timeout: 1
                  success_count: 1
"#;
        let root = ConfigRoot::from_yaml(yaml).unwrap();
        let engine = Arc::new(TestEngine::new());
        let lb = Lb::from_entry(
            &root.lb[0],
            engine.clone(),
            Arc::new(ScriptedResolver::failing()),
        )
        .await
        .unwrap();

        let token = spawn(Arc::clone(&lb), 0, 0);
        tokio::time::sleep(Duration::from_millis(1800)).await;
        token.cancel();
        lb.stop_checks().await;

        assert_eq!(engine.update_target_calls(), 0);
        let st = lb.state.lock().await;
        assert_eq!(st.targets[0].group.upstreams[0].address, None::<IpAddr>);
    }

    #[tokio::test]
    async fn terminate_flag_pauses_ticks() {
        let (lb, engine) = lb_probing("192.0.2.1", 9, true).await;
        lb.state.lock().await.terminate = true;

        let token = spawn(Arc::clone(&lb), 0, 0);
        tokio::time::sleep(Duration::from_millis(1800)).await;
        token.cancel();
        lb.stop_checks().await;

        assert_eq!(engine.update_target_calls(), 0);
        assert!(lb.state.lock().await.targets[0].group.upstreams[0].available);
    }
}
