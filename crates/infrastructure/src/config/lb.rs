use std::collections::HashSet;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use domain::common::entity::{DistMode, EngineKind, HostKind, Protocol};
use domain::loadbalancer::entity::HcProtocol;

use super::ConfigError;

/// Health check probe protocols currently realized.
pub const SUPPORTED_HC_PROTOCOLS: &[HcProtocol] = &[HcProtocol::Tcp];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub engine: String,

    #[serde(default)]
    pub targets: Vec<TargetConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    pub name: String,

    /// Transport: `tcp`, `udp`, `sctp`, or `http`.
    pub protocol: String,

    /// Bind address. Empty means wildcard.
    #[serde(default)]
    pub ip: String,

    pub port: u16,

    pub upstream_group: UpstreamGroupConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamGroupConfig {
    pub name: String,

    /// `round-robin` or `weighted`.
    pub distribution: String,

    #[serde(default)]
    pub upstreams: Vec<UpstreamConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    pub name: String,

    /// IP literal or FQDN.
    pub host: String,

    pub port: u16,

    #[serde(default)]
    pub dns: DnsConfig,

    /// Absent or empty disables probing; the upstream is then treated as
    /// permanently available.
    #[serde(default)]
    pub health_check: Option<HealthCheckConfig>,
}

impl UpstreamConfig {
    /// The health check block, unless it is absent or left empty.
    pub fn active_health_check(&self) -> Option<&HealthCheckConfig> {
        self.health_check
            .as_ref()
            .filter(|hc| **hc != HealthCheckConfig::default())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsConfig {
    #[serde(default)]
    pub servers: Vec<String>,

    /// TTL override in seconds. 0 uses the response TTL.
    #[serde(default)]
    pub ttl: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    #[serde(default)]
    pub protocol: String,

    #[serde(default)]
    pub port: u16,

    #[serde(default)]
    pub start_available: bool,

    #[serde(default)]
    pub probe: ProbeConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeConfig {
    /// Seconds between probes.
    #[serde(default)]
    pub check_interval: u16,

    /// Probe timeout in seconds.
    #[serde(default)]
    pub timeout: u8,

    /// Consecutive successes required to become available.
    #[serde(default)]
    pub success_count: u8,
}

fn supported_protocols(kind: EngineKind) -> String {
    let mut names: Vec<&str> = kind.capabilities().keys().map(|p| p.as_str()).collect();
    names.sort_unstable();
    names.join(", ")
}

fn supported_dist_modes(kind: EngineKind, protocol: Protocol) -> String {
    let caps = kind.capabilities();
    let mut names: Vec<&str> = caps
        .get(&protocol)
        .map(|modes| modes.iter().map(|m| m.as_str()).collect())
        .unwrap_or_default();
    names.sort_unstable();
    names.join(", ")
}

fn supported_hc_protocols() -> String {
    SUPPORTED_HC_PROTOCOLS
        .iter()
        .map(|p| p.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

impl EngineConfig {
    /// Validate every target, group, and upstream of this entry against
    /// the engine's capabilities.
    pub(super) fn validate(&self, kind: EngineKind) -> Result<(), ConfigError> {
        let caps = kind.capabilities();
        let mut target_names: HashSet<&str> = HashSet::new();
        let mut group_names: HashSet<&str> = HashSet::new();
        let mut upstream_names: HashSet<&str> = HashSet::new();
        let mut port_protocols: HashSet<(u16, Protocol)> = HashSet::new();

        for target in &self.targets {
            if !target_names.insert(&target.name) {
                return Err(ConfigError::RepeatedTargetName(target.name.clone()));
            }

            let protocol = Protocol::from_name(&target.protocol);
            if !caps.contains_key(&protocol) {
                return Err(ConfigError::UnsupportedProtocol {
                    target: target.name.clone(),
                    protocol: target.protocol.clone(),
                    supported: supported_protocols(kind),
                });
            }

            if !port_protocols.insert((target.port, protocol)) {
                return Err(ConfigError::RepeatedPortProtocol {
                    port: target.port,
                    protocol: target.protocol.clone(),
                });
            }

            let group = &target.upstream_group;
            if !group_names.insert(&group.name) {
                return Err(ConfigError::RepeatedUpstreamGroupName(group.name.clone()));
            }

            let mode = DistMode::from_name(&group.distribution);
            if !caps[&protocol].contains(&mode) {
                return Err(ConfigError::UnsupportedDistMode {
                    group: group.name.clone(),
                    mode: group.distribution.clone(),
                    supported: supported_dist_modes(kind, protocol),
                });
            }

            for upstream in &group.upstreams {
                if !upstream_names.insert(&upstream.name) {
                    return Err(ConfigError::RepeatedUpstreamName(upstream.name.clone()));
                }

                if HostKind::classify(&upstream.host).is_unknown() {
                    return Err(ConfigError::InvalidHost {
                        upstream: upstream.name.clone(),
                        host: upstream.host.clone(),
                    });
                }

                if let Some(hc) = upstream.active_health_check() {
                    let hc_protocol = HcProtocol::from_name(&hc.protocol);
                    if !SUPPORTED_HC_PROTOCOLS.contains(&hc_protocol) {
                        return Err(ConfigError::UnsupportedHcProtocol {
                            upstream: upstream.name.clone(),
                            protocol: hc.protocol.clone(),
                            supported: supported_hc_protocols(),
                        });
                    }
                    if hc.port == 0 {
                        return Err(ConfigError::ProbePort(upstream.name.clone()));
                    }
                    if hc.probe.check_interval == 0 {
                        return Err(ConfigError::ProbeCheckInterval(upstream.name.clone()));
                    }
                    if hc.probe.success_count == 0 {
                        return Err(ConfigError::ProbeSuccessCount(upstream.name.clone()));
                    }
                    if hc.probe.timeout == 0 {
                        return Err(ConfigError::ProbeTimeout(upstream.name.clone()));
                    }
                }

                for address in &upstream.dns.servers {
                    if address.parse::<IpAddr>().is_err() {
                        return Err(ConfigError::InvalidDnsServer {
                            upstream: upstream.name.clone(),
                            address: address.clone(),
                        });
                    }
                }
            }
        }

        Ok(())
    }
}
