use tracing::debug;

use super::ProbeError;

const PROC_SELF_STATUS: &str = "/proc/self/status";

/// Linux capabilities the nftables engine depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    NetAdmin,
    NetRaw,
}

impl Capability {
    /// Bit position in the kernel capability bitmasks.
    fn bit(self) -> u32 {
        match self {
            Self::NetAdmin => 12,
            Self::NetRaw => 13,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::NetAdmin => "cap_net_admin",
            Self::NetRaw => "cap_net_raw",
        }
    }
}

/// Capability set flags checked on the running process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapFlag {
    Effective,
    Permitted,
}

impl CapFlag {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Effective => "effective",
            Self::Permitted => "permitted",
        }
    }
}

/// The process capability bitmasks, as published by the kernel in
/// `/proc/self/status` (`CapEff` and `CapPrm`, hex).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessCapabilities {
    effective: u64,
    permitted: u64,
}

impl ProcessCapabilities {
    /// Read the current process capability set.
    pub fn current() -> Result<Self, ProbeError> {
        let status = std::fs::read_to_string(PROC_SELF_STATUS)
            .map_err(|e| ProbeError::ReadCapabilities(e.to_string()))?;
        Self::parse_status(&status)
    }

    fn parse_status(status: &str) -> Result<Self, ProbeError> {
        let mut effective = None;
        let mut permitted = None;
        for line in status.lines() {
            if let Some(hex) = line.strip_prefix("CapEff:") {
                effective = u64::from_str_radix(hex.trim(), 16).ok();
            } else if let Some(hex) = line.strip_prefix("CapPrm:") {
                permitted = u64::from_str_radix(hex.trim(), 16).ok();
            }
        }
        match (effective, permitted) {
            (Some(effective), Some(permitted)) => Ok(Self {
                effective,
                permitted,
            }),
            _ => Err(ProbeError::ReadCapabilities(
                "CapEff/CapPrm not found in process status".to_string(),
            )),
        }
    }

    pub fn has(&self, capability: Capability, flag: CapFlag) -> bool {
        let mask = match flag {
            CapFlag::Effective => self.effective,
            CapFlag::Permitted => self.permitted,
        };
        mask & (1u64 << capability.bit()) != 0
    }

    /// Check a single capability flag, erroring with the offending pair.
    pub fn check(&self, capability: Capability, flag: CapFlag) -> Result<(), ProbeError> {
        if self.has(capability, flag) {
            debug!(capability = capability.as_str(), flag = flag.as_str(), "capability check succeeded");
            Ok(())
        } else {
            debug!(capability = capability.as_str(), flag = flag.as_str(), "capability check failed");
            Err(ProbeError::CapabilityNotSet {
                capability: capability.as_str(),
                flag: flag.as_str(),
            })
        }
    }
}

/// Verify the process holds `NET_ADMIN` and `NET_RAW` with both the
/// effective and permitted flags set.
pub fn check_required_capabilities(caps: &ProcessCapabilities) -> Result<(), ProbeError> {
    for capability in [Capability::NetAdmin, Capability::NetRaw] {
        for flag in [CapFlag::Effective, CapFlag::Permitted] {
            caps.check(capability, flag)?;
        }
    }
    Ok(())
}
