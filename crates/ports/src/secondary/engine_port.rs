use std::net::IpAddr;

use thiserror::Error;

use domain::common::entity::{EngineCapabilities, EngineKind};
use domain::loadbalancer::entity::{Target, Upstream};

/// Default priority of the destination-NAT prerouting chain.
pub const DEFAULT_PREROUTING_PRIORITY: i32 = -100;
/// Default priority of the postrouting chain (filter priority).
pub const DEFAULT_POSTROUTING_PRIORITY: i32 = 0;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("permissions check failed: {0}")]
    Permissions(String),

    #[error("dependencies check failed: {0}")]
    Dependencies(String),

    #[error("netlink operation failed: {0}")]
    Netlink(String),

    #[error("engine start failed: {0}")]
    Start(String),

    #[error("engine stop failed: {0}")]
    Stop(String),

    #[error("engine reconfiguration failed: {0}")]
    Reconfig(String),

    #[error("target update failed: {0}")]
    UpdateTarget(String),

    #[error("upstream update failed: {0}")]
    UpdateUpstream(String),
}

/// Chain priorities carried from a live engine to its replacement during
/// reconfiguration, so the incoming table can shift away from the
/// outgoing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineHandoff {
    pub postrouting_priority: i32,
    pub prerouting_priority: i32,
}

impl Default for EngineHandoff {
    fn default() -> Self {
        Self {
            postrouting_priority: DEFAULT_POSTROUTING_PRIORITY,
            prerouting_priority: DEFAULT_PREROUTING_PRIORITY,
        }
    }
}

/// Secondary port for load balancer engines.
///
/// An engine owns the kernel-facing rule state for one load balancer
/// instance. The orchestrator drives it through this contract and never
/// touches the kernel directly. Implemented by the nftables engine and by
/// the side-effect-free test engine.
pub trait EnginePort: Send + Sync {
    fn kind(&self) -> EngineKind;

    /// Protocol → distribution modes this engine realizes.
    fn capabilities(&self) -> EngineCapabilities {
        self.kind().capabilities()
    }

    /// Whether the process privileges suffice for this engine.
    fn check_permissions(&self) -> Result<(), EngineError>;

    /// Whether the system dependencies are satisfied. Soft failures are
    /// logged, not returned.
    fn check_dependencies(&self) -> Result<(), EngineError>;

    /// Install the initial kernel state for the given targets and the
    /// deduplicated view of the upstream-IP ledger.
    fn start(&self, targets: &mut [Target], upstream_ips: &[IpAddr]) -> Result<(), EngineError> {
        self.start_or_reconfig(targets, upstream_ips, false)
    }

    /// Shared body of `start` and the reconfiguration cutover. With
    /// `refresh` the engine installs alongside a live predecessor: no
    /// stale-state reclaim, and both chain priorities toggle between
    /// their default and default+1 so the coexisting tables never share
    /// a priority.
    fn start_or_reconfig(
        &self,
        targets: &mut [Target],
        upstream_ips: &[IpAddr],
        refresh: bool,
    ) -> Result<(), EngineError>;

    /// Tear down everything this engine installed.
    fn stop(&self) -> Result<(), EngineError>;

    /// Export chain priorities for a successor engine.
    fn handoff(&self) -> EngineHandoff;

    /// Import chain priorities from a predecessor engine.
    fn adopt(&self, handoff: EngineHandoff);

    /// Hot-swap this engine's kernel state for the successor's: the new
    /// table is fully installed at shifted priorities while the old one
    /// still serves, then the old table is torn down.
    fn reconfig(
        &self,
        new: &dyn EnginePort,
        targets: &mut [Target],
        upstream_ips: &[IpAddr],
    ) -> Result<(), EngineError> {
        new.adopt(self.handoff());
        new.start_or_reconfig(targets, upstream_ips, true)
            .map_err(|e| EngineError::Reconfig(e.to_string()))?;
        self.stop()
            .map_err(|e| EngineError::Reconfig(e.to_string()))
    }

    /// Rebuild the target's dispatch state after an availability change.
    /// Advances the group's failover mode.
    fn update_target(&self, target: &mut Target) -> Result<(), EngineError>;

    /// Rewrite the upstream's address state after a DNS change.
    /// `unique_ips` is the deduplicated upstream-IP ledger.
    fn update_upstream(&self, upstream: &Upstream, unique_ips: &[IpAddr])
    -> Result<(), EngineError>;
}
