//! Configuration: structs, parsing, and validation.
//!
//! The YAML tree mirrors the external interface exactly; validation is a
//! single pass that rejects on the first violation and names both the
//! violated invariant and the offending identifier.

mod lb;

pub use lb::{
    DnsConfig, EngineConfig, HealthCheckConfig, ProbeConfig, TargetConfig, UpstreamConfig,
    UpstreamGroupConfig,
};

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use domain::common::entity::EngineKind;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to open config file, check if the file exists or read permissions: {0}")]
    Io(String),

    #[error("error when unmarshaling yaml config file: {0}")]
    Yaml(String),

    #[error("unknown engine '{0}'")]
    UnknownEngine(String),

    #[error(
        "repeated engine type '{0}': all config of a given engine type must be included in a single mapping"
    )]
    RepeatedEngine(String),

    #[error("repeated target name '{0}': every target name must be unique")]
    RepeatedTargetName(String),

    #[error("repeated upstream group name '{0}': every upstream group name must be unique")]
    RepeatedUpstreamGroupName(String),

    #[error("repeated upstream name '{0}': every upstream name must be unique")]
    RepeatedUpstreamName(String),

    #[error("repeated port/protocol {port}/{protocol}: each target must have a unique pair")]
    RepeatedPortProtocol { port: u16, protocol: String },

    #[error(
        "invalid host '{host}' for upstream '{upstream}': set a valid host in the FQDN, IPv4 or IPv6 format"
    )]
    InvalidHost { upstream: String, host: String },

    #[error("invalid DNS address '{address}' for upstream '{upstream}'")]
    InvalidDnsServer { upstream: String, address: String },

    #[error(
        "unsupported protocol '{protocol}' for target '{target}': choose one of the supported protocols: {supported}"
    )]
    UnsupportedProtocol {
        target: String,
        protocol: String,
        supported: String,
    },

    #[error(
        "unsupported distribution mode '{mode}' for upstream group '{group}': choose one of the supported modes: {supported}"
    )]
    UnsupportedDistMode {
        group: String,
        mode: String,
        supported: String,
    },

    #[error(
        "unsupported healthcheck protocol '{protocol}' for upstream '{upstream}': choose one of the supported protocols: {supported}"
    )]
    UnsupportedHcProtocol {
        upstream: String,
        protocol: String,
        supported: String,
    },

    #[error("health check probe 'port' for upstream '{0}' must be correctly defined")]
    ProbePort(String),

    #[error("health check probe 'check_interval' for upstream '{0}' must be defined")]
    ProbeCheckInterval(String),

    #[error("health check probe 'success_count' for upstream '{0}' must be defined")]
    ProbeSuccessCount(String),

    #[error("health check probe 'timeout' for upstream '{0}' must be defined")]
    ProbeTimeout(String),
}

/// Root of the configuration file: a sequence of engine entries.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigRoot {
    #[serde(default)]
    pub lb: Vec<EngineConfig>,
}

impl ConfigRoot {
    /// Load a config file, parse, and validate.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;
        Self::from_yaml(&content)
    }

    /// Parse and validate a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let root: Self = serde_yaml_ng::from_str(yaml).map_err(|e| ConfigError::Yaml(e.to_string()))?;
        root.validate()?;
        Ok(root)
    }

    /// Single-pass validation of every invariant; rejects on the first
    /// violation. After success, every enum-valued string in the tree is
    /// known.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut engine_tags: HashSet<EngineKind> = HashSet::new();
        for entry in &self.lb {
            let kind = EngineKind::from_name(&entry.engine);
            if kind == EngineKind::Unknown {
                return Err(ConfigError::UnknownEngine(entry.engine.clone()));
            }
            if !engine_tags.insert(kind) {
                return Err(ConfigError::RepeatedEngine(entry.engine.clone()));
            }
            entry.validate(kind)?;
        }
        Ok(())
    }
}
