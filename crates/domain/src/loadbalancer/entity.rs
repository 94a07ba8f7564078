use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::common::entity::{DistMode, HostKind, Protocol};

use super::error::LbError;
use super::failover::FailoverMode;

// ── Health check ──────────────────────────────────────────────────

/// Health check probe protocol. Only TCP is realized; the remaining
/// values parse so configuration errors can name what was asked for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HcProtocol {
    #[default]
    Unknown,
    Tcp,
    Udp,
    Sctp,
    Http,
    Grpc,
}

impl HcProtocol {
    /// Parse a config string. Unknown inputs collapse to `Unknown`.
    pub fn from_name(s: &str) -> Self {
        match s {
            "tcp" => Self::Tcp,
            "udp" => Self::Udp,
            "sctp" => Self::Sctp,
            "http" => Self::Http,
            "grpc" => Self::Grpc,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
            Self::Sctp => "sctp",
            Self::Http => "http",
            Self::Grpc => "grpc",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for HcProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-upstream health check state.
///
/// `count` tracks consecutive successful probes while the upstream is
/// unavailable; any failure resets it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HealthCheck {
    pub active: bool,
    pub protocol: HcProtocol,
    pub port: u16,
    /// Probe period in seconds.
    pub check_interval: u16,
    /// Probe timeout in seconds.
    pub timeout: u8,
    /// Consecutive successes required to become available.
    pub required_count: u8,
    /// Consecutive successes so far.
    pub count: u8,
}

impl HealthCheck {
    pub fn inactive() -> Self {
        Self::default()
    }
}

// ── Upstream ──────────────────────────────────────────────────────

/// Per-upstream DNS state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpstreamDns {
    /// DNS servers used to resolve the upstream host. Empty means the
    /// system stub resolver configuration.
    pub servers: Vec<IpAddr>,
    /// User-configured TTL override. 0 means use the response TTL.
    pub configured_ttl: u32,
    /// TTL currently in force for rescheduling.
    pub ttl: u32,
}

/// A host traffic can be distributed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upstream {
    pub name: String,
    pub protocol: Protocol,
    /// IP literal or domain name. FQDN hosts are stored canonical
    /// (trailing dot).
    pub host: String,
    pub port: u16,
    pub dns: UpstreamDns,
    /// Resolved address; absent while the host has never resolved.
    pub address: Option<IpAddr>,
    pub available: bool,
    pub health_check: HealthCheck,
}

impl Upstream {
    pub fn host_kind(&self) -> HostKind {
        HostKind::classify(&self.host)
    }

    /// Record a failed probe. Returns true when availability flipped.
    pub fn record_probe_failure(&mut self) -> bool {
        self.health_check.count = 0;
        if self.available {
            self.available = false;
            return true;
        }
        false
    }

    /// Record a successful probe. Returns true when the consecutive
    /// success count reached the configured threshold and availability
    /// flipped.
    pub fn record_probe_success(&mut self) -> bool {
        if self.available {
            return false;
        }
        self.health_check.count = self.health_check.count.saturating_add(1);
        if self.health_check.count >= self.health_check.required_count {
            self.available = true;
            return true;
        }
        false
    }
}

// ── Upstream group ────────────────────────────────────────────────

/// A named set of upstreams serving one target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamGroup {
    pub name: String,
    pub dist_mode: DistMode,
    pub upstreams: Vec<Upstream>,
    pub failover_mode: FailoverMode,
    /// Mode in force before the last recomputation; the engine retires
    /// this mode's kernel objects.
    pub previous_failover_mode: FailoverMode,
}

impl UpstreamGroup {
    pub fn new(name: String, dist_mode: DistMode, upstreams: Vec<Upstream>) -> Self {
        Self {
            name,
            dist_mode,
            upstreams,
            failover_mode: FailoverMode::Inactive,
            previous_failover_mode: FailoverMode::Inactive,
        }
    }

    /// Number of currently available upstreams.
    pub fn available_upstreams(&self) -> usize {
        self.upstreams.iter().filter(|u| u.available).count()
    }

    /// Advance the failover mode from the current availability picture.
    ///
    /// No upstream available moves to `Down`; full availability moves to
    /// `Inactive`; anything in between rotates `Active1` ⇄ `Active2`.
    /// The outgoing mode is kept in `previous_failover_mode`.
    pub fn advance_failover(&mut self) -> Result<FailoverMode, LbError> {
        let active = self.available_upstreams();
        let next = if active == 0 {
            FailoverMode::Down
        } else if active == self.upstreams.len() {
            FailoverMode::Inactive
        } else {
            self.failover_mode.next()?
        };
        self.previous_failover_mode = self.failover_mode;
        self.failover_mode = next;
        Ok(next)
    }
}

// ── Target ────────────────────────────────────────────────────────

/// A packet destination as it arrives at the load balancer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub name: String,
    pub protocol: Protocol,
    /// Bind address from config. Empty means wildcard.
    pub ip: String,
    pub port: u16,
    pub group: UpstreamGroup,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_upstream(name: &str, available: bool) -> Upstream {
        Upstream {
            name: name.to_string(),
            protocol: Protocol::Tcp,
            host: "10.0.0.1".to_string(),
            port: 8080,
            dns: UpstreamDns::default(),
            address: Some("10.0.0.1".parse().unwrap()),
            available,
            health_check: HealthCheck {
                active: true,
                protocol: HcProtocol::Tcp,
                port: 8080,
                check_interval: 1,
                timeout: 2,
                required_count: 3,
                count: 0,
            },
        }
    }

    fn test_group(avail: &[bool]) -> UpstreamGroup {
        let upstreams = avail
            .iter()
            .enumerate()
            .map(|(i, a)| test_upstream(&format!("u{i}"), *a))
            .collect();
        UpstreamGroup::new("ug".to_string(), DistMode::RoundRobin, upstreams)
    }

    // ── HcProtocol codec ──────────────────────────────────────

    #[test]
    fn hc_protocol_round_trip() {
        for p in [
            HcProtocol::Tcp,
            HcProtocol::Udp,
            HcProtocol::Sctp,
            HcProtocol::Http,
            HcProtocol::Grpc,
        ] {
            assert_eq!(HcProtocol::from_name(p.as_str()), p);
        }
        assert_eq!(HcProtocol::from_name("icmp"), HcProtocol::Unknown);
    }

    // ── Probe bookkeeping ─────────────────────────────────────

    #[test]
    fn probe_failure_flips_available_once() {
        let mut u = test_upstream("u1", true);
        assert!(u.record_probe_failure());
        assert!(!u.available);
        assert!(!u.record_probe_failure());
    }

    #[test]
    fn probe_failure_resets_count() {
        let mut u = test_upstream("u1", false);
        u.health_check.count = 2;
        u.record_probe_failure();
        assert_eq!(u.health_check.count, 0);
    }

    #[test]
    fn probe_success_flips_at_threshold() {
        let mut u = test_upstream("u1", false);
        assert!(!u.record_probe_success());
        assert!(!u.record_probe_success());
        assert!(u.record_probe_success());
        assert!(u.available);
    }

    #[test]
    fn probe_success_noop_when_available() {
        let mut u = test_upstream("u1", true);
        assert!(!u.record_probe_success());
        assert_eq!(u.health_check.count, 0);
    }

    // ── Failover advancement ──────────────────────────────────

    #[test]
    fn all_available_goes_inactive() {
        let mut g = test_group(&[true, true]);
        g.failover_mode = FailoverMode::Active1;
        assert_eq!(g.advance_failover().unwrap(), FailoverMode::Inactive);
        assert_eq!(g.previous_failover_mode, FailoverMode::Active1);
    }

    #[test]
    fn none_available_goes_down() {
        let mut g = test_group(&[false, false]);
        assert_eq!(g.advance_failover().unwrap(), FailoverMode::Down);
        assert_eq!(g.previous_failover_mode, FailoverMode::Inactive);
    }

    #[test]
    fn partial_availability_alternates_actives() {
        let mut g = test_group(&[true, false]);
        assert_eq!(g.advance_failover().unwrap(), FailoverMode::Active1);
        assert_eq!(g.advance_failover().unwrap(), FailoverMode::Active2);
        assert_eq!(g.advance_failover().unwrap(), FailoverMode::Active1);
        assert_eq!(g.previous_failover_mode, FailoverMode::Active2);
    }

    #[test]
    fn recovery_from_down_enters_active1() {
        let mut g = test_group(&[false, false]);
        g.advance_failover().unwrap();
        g.upstreams[0].available = true;
        assert_eq!(g.advance_failover().unwrap(), FailoverMode::Active1);
    }

    #[test]
    fn available_upstreams_counts() {
        let g = test_group(&[true, false, true]);
        assert_eq!(g.available_upstreams(), 2);
    }

    #[test]
    fn host_kind_of_upstream() {
        let mut u = test_upstream("u1", true);
        assert_eq!(u.host_kind(), HostKind::Ipv4);
        u.host = "example.com.".to_string();
        assert_eq!(u.host_kind(), HostKind::Fqdn);
    }
}
