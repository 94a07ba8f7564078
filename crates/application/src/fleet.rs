use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info};

use domain::common::entity::EngineKind;
use infrastructure::config::ConfigRoot;
use infrastructure::constants::SYSTEM_CONFIG_PATH;
use ports::secondary::dns_resolver_port::DnsResolverPort;
use ports::secondary::engine_port::{EngineError, EnginePort};

use crate::error::OrchestratorError;
use crate::lb::Lb;

/// Constructor for the engine backing one instance; injected so that the
/// orchestrator stays kernel-agnostic.
pub trait EngineFactory: Fn(EngineKind) -> Result<Box<dyn EnginePort>, EngineError> {}
impl<F> EngineFactory for F where F: Fn(EngineKind) -> Result<Box<dyn EnginePort>, EngineError> {}

/// Build the full set of load balancer instances from configuration.
///
/// The config is read from `config_path`, falling back to the system
/// location, then validated as a whole before any instance is built; a
/// validation failure touches nothing.
pub async fn init(
    config_path: &Path,
    new_engine: &impl EngineFactory,
    resolver: &Arc<dyn DnsResolverPort>,
) -> Result<Vec<Arc<Lb>>, OrchestratorError> {
    info!(path = %config_path.display(), "loading load balancer configuration");

    let content = match std::fs::read_to_string(config_path) {
        Ok(content) => content,
        Err(_) => {
            info!(
                path = %config_path.display(),
                fallback = SYSTEM_CONFIG_PATH,
                "failed to open local config file, trying system location"
            );
            std::fs::read_to_string(SYSTEM_CONFIG_PATH).map_err(|_| {
                OrchestratorError::Init(format!(
                    "failed to open config file in '{}' and '{}'",
                    config_path.display(),
                    SYSTEM_CONFIG_PATH
                ))
            })?
        }
    };

    let root = ConfigRoot::from_yaml(&content).map_err(|e| OrchestratorError::Init(e.to_string()))?;

    let mut lbs = Vec::with_capacity(root.lb.len());
    for entry in &root.lb {
        let kind = EngineKind::from_name(&entry.engine);
        let engine = new_engine(kind).map_err(|e| OrchestratorError::Init(e.to_string()))?;
        let lb = Lb::from_entry(entry, Arc::from(engine), Arc::clone(resolver)).await?;
        lbs.push(lb);
    }

    Ok(lbs)
}

/// Pair old and new instances by engine kind: kept on both sides, added
/// only on the new, removed only on the old.
pub fn compare(
    old: &[Arc<Lb>],
    new: &[Arc<Lb>],
) -> (
    Vec<(Arc<Lb>, Arc<Lb>)>,
    Vec<Arc<Lb>>,
    Vec<Arc<Lb>>,
) {
    let mut kept = Vec::new();
    let mut removed = Vec::new();

    for o in old {
        match new.iter().find(|n| n.kind() == o.kind()) {
            Some(n) => {
                debug!(engine = %o.kind(), "load balancer kept across reconfiguration");
                kept.push((Arc::clone(o), Arc::clone(n)));
            }
            None => {
                debug!(engine = %o.kind(), "load balancer removed by reconfiguration");
                removed.push(Arc::clone(o));
            }
        }
    }

    let added = new
        .iter()
        .filter(|n| !old.iter().any(|o| o.kind() == n.kind()))
        .map(Arc::clone)
        .inspect(|n| debug!(engine = %n.kind(), "load balancer added by reconfiguration"))
        .collect();

    (kept, added, removed)
}

/// Reconfigure the fleet: build a candidate set from the current config,
/// refresh kept engines, start added ones, stop removed ones, and swap
/// the live list. A failed candidate build leaves everything untouched.
pub async fn reconfig(
    lbs: &mut Vec<Arc<Lb>>,
    config_path: &Path,
    new_engine: &impl EngineFactory,
    resolver: &Arc<dyn DnsResolverPort>,
) -> Result<(), OrchestratorError> {
    info!("reconfiguration of all load balancers requested");
    let new = init(config_path, new_engine, resolver)
        .await
        .map_err(|e| OrchestratorError::Reconfig(e.to_string()))?;

    let (kept, added, removed) = compare(lbs, &new);

    for (old, incoming) in kept {
        info!(engine = %old.kind(), "load balancer configuration will be refreshed");
        old.reconfig(&incoming)
            .await
            .map_err(|e| OrchestratorError::Reconfig(e.to_string()))?;
    }

    for lb in added {
        info!(engine = %lb.kind(), "newly configured load balancer will be started");
        lb.start()
            .await
            .map_err(|e| OrchestratorError::Reconfig(e.to_string()))?;
    }

    for lb in removed {
        info!(engine = %lb.kind(), "no longer configured load balancer will be stopped");
        lb.stop()
            .await
            .map_err(|e| OrchestratorError::Reconfig(e.to_string()))?;
    }

    *lbs = new;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    use adapters::test_engine::TestEngine;
    use ports::test_utils::ScriptedResolver;

    fn test_factory(kind: EngineKind) -> Result<Box<dyn EnginePort>, EngineError> {
        match kind {
            EngineKind::TestEngine | EngineKind::Nftables => Ok(Box::new(TestEngine::new())),
            EngineKind::Unknown => Err(EngineError::Start("unknown engine kind".to_string())),
        }
    }

    fn resolver() -> Arc<dyn DnsResolverPort> {
        Arc::new(ScriptedResolver::failing())
    }

    fn config_file(yaml: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(yaml.as_bytes()).unwrap();
        f
    }

    fn yaml(engine: &str, upstream: &str, host: &str) -> String {
        format!(
            r#"
lb:
  - engine: {engine}
    targets:
      - name: t1
        protocol: tcp
        port: 8080
        upstream_group:
          name: ug1
          distribution: round-robin
          upstreams:
            - name: {upstream}
              host: {host}
              port: 8080
"#
        )
    }

    #[tokio::test]
    async fn init_builds_one_lb_per_engine_entry() {
        let f = config_file(&yaml("testEngine", "u1", "8.8.8.8"));
        let lbs = init(f.path(), &test_factory, &resolver()).await.unwrap();
        assert_eq!(lbs.len(), 1);
        assert_eq!(lbs[0].kind(), EngineKind::TestEngine);
    }

    #[tokio::test]
    async fn init_empty_lb_list_succeeds() {
        let f = config_file("lb: []");
        let lbs = init(f.path(), &test_factory, &resolver()).await.unwrap();
        assert!(lbs.is_empty());
    }

    #[tokio::test]
    async fn init_missing_files_fails() {
        let err = init(Path::new("/nonexistent/lobby.conf"), &test_factory, &resolver())
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Init(_)));
    }

    #[tokio::test]
    async fn init_invalid_config_fails() {
        let f = config_file(&yaml("testEngine", "u1", "8.8.8.8.8"));
        assert!(init(f.path(), &test_factory, &resolver()).await.is_err());
    }

    #[tokio::test]
    async fn compare_classifies_kept_added_removed() {
        let f_test = config_file(&yaml("testEngine", "u1", "8.8.8.8"));
        let f_both = config_file(
            &format!(
                "{}{}",
                yaml("testEngine", "u1", "8.8.8.8"),
                yaml("nftables", "u2", "9.9.9.9").replacen("\nlb:", "", 1)
            ),
        );
        let old = init(f_both.path(), &test_factory, &resolver()).await.unwrap();
        let new = init(f_test.path(), &test_factory, &resolver()).await.unwrap();

        let (kept, added, removed) = compare(&old, &new);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].0.kind(), EngineKind::TestEngine);
        assert!(added.is_empty());
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].kind(), EngineKind::Nftables);
    }

    #[tokio::test]
    async fn reconfig_from_empty_adds_and_starts() {
        let mut lbs = Vec::new();
        let f = config_file(&yaml("testEngine", "u1", "8.8.8.8"));
        reconfig(&mut lbs, f.path(), &test_factory, &resolver())
            .await
            .unwrap();
        assert_eq!(lbs.len(), 1);
        for lb in &lbs {
            lb.stop().await.unwrap();
        }
    }

    #[tokio::test]
    async fn reconfig_swaps_kept_instance() {
        let f1 = config_file(&yaml("testEngine", "u1", "8.8.8.8"));
        let mut lbs = init(f1.path(), &test_factory, &resolver()).await.unwrap();
        for lb in &lbs {
            lb.start().await.unwrap();
        }
        let old_ptr = Arc::as_ptr(&lbs[0]);

        let f2 = config_file(&yaml("testEngine", "u2", "9.9.9.9"));
        reconfig(&mut lbs, f2.path(), &test_factory, &resolver())
            .await
            .unwrap();

        assert_eq!(lbs.len(), 1);
        assert_ne!(Arc::as_ptr(&lbs[0]), old_ptr);
        for lb in &lbs {
            lb.stop().await.unwrap();
        }
    }

    #[tokio::test]
    async fn reconfig_with_invalid_candidate_retains_live_list() {
        let f1 = config_file(&yaml("testEngine", "u1", "8.8.8.8"));
        let mut lbs = init(f1.path(), &test_factory, &resolver()).await.unwrap();
        let old_ptr = Arc::as_ptr(&lbs[0]);

        let bad = config_file(&yaml("testEngine", "u1", "8.8.8.8.8"));
        let err = reconfig(&mut lbs, bad.path(), &test_factory, &resolver())
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Reconfig(_)));
        assert_eq!(lbs.len(), 1);
        assert_eq!(Arc::as_ptr(&lbs[0]), old_ptr);
    }
}
