use std::net::IpAddr;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use domain::common::entity::EngineKind;
use domain::loadbalancer::entity::{Target, Upstream};
use ports::secondary::engine_port::{EngineError, EngineHandoff, EnginePort};

/// Engine contract implementation without kernel side effects.
///
/// Three flags force the dependency check, the permission check, or the
/// start to fail independently. Update calls are counted and the last
/// deduplicated ledger handed to `update_upstream` is retained so tests
/// can assert against it.
#[derive(Debug, Default)]
pub struct TestEngine {
    fail_dependencies_check: AtomicBool,
    fail_permissions_check: AtomicBool,
    fail_start: AtomicBool,
    update_target_calls: AtomicUsize,
    update_upstream_calls: AtomicUsize,
    last_unique_ips: Mutex<Vec<IpAddr>>,
}

impl TestEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_results(
        &self,
        fail_dependencies_check: bool,
        fail_permissions_check: bool,
        fail_start: bool,
    ) {
        self.fail_dependencies_check
            .store(fail_dependencies_check, Ordering::SeqCst);
        self.fail_permissions_check
            .store(fail_permissions_check, Ordering::SeqCst);
        self.fail_start.store(fail_start, Ordering::SeqCst);
    }

    pub fn update_target_calls(&self) -> usize {
        self.update_target_calls.load(Ordering::SeqCst)
    }

    pub fn update_upstream_calls(&self) -> usize {
        self.update_upstream_calls.load(Ordering::SeqCst)
    }

    pub fn last_unique_ips(&self) -> Vec<IpAddr> {
        self.last_unique_ips.lock().expect("ledger lock").clone()
    }
}

impl EnginePort for TestEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::TestEngine
    }

    fn check_permissions(&self) -> Result<(), EngineError> {
        if self.fail_permissions_check.load(Ordering::SeqCst) {
            return Err(EngineError::Permissions("forced by test flag".to_string()));
        }
        Ok(())
    }

    fn check_dependencies(&self) -> Result<(), EngineError> {
        if self.fail_dependencies_check.load(Ordering::SeqCst) {
            return Err(EngineError::Dependencies("forced by test flag".to_string()));
        }
        Ok(())
    }

    fn start_or_reconfig(
        &self,
        _targets: &mut [Target],
        _upstream_ips: &[IpAddr],
        _refresh: bool,
    ) -> Result<(), EngineError> {
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(EngineError::Start("forced by test flag".to_string()));
        }
        Ok(())
    }

    fn stop(&self) -> Result<(), EngineError> {
        Ok(())
    }

    fn handoff(&self) -> EngineHandoff {
        EngineHandoff::default()
    }

    fn adopt(&self, _handoff: EngineHandoff) {}

    fn reconfig(
        &self,
        _new: &dyn EnginePort,
        _targets: &mut [Target],
        _upstream_ips: &[IpAddr],
    ) -> Result<(), EngineError> {
        Ok(())
    }

    fn update_target(&self, _target: &mut Target) -> Result<(), EngineError> {
        self.update_target_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn update_upstream(
        &self,
        _upstream: &Upstream,
        unique_ips: &[IpAddr],
    ) -> Result<(), EngineError> {
        self.update_upstream_calls.fetch_add(1, Ordering::SeqCst);
        *self.last_unique_ips.lock().expect("ledger lock") = unique_ips.to_vec();
        Ok(())
    }
}
