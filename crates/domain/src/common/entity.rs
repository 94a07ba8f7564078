use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// RFC 1123 hostname restricted to names with a non-numeric TLD, so that
/// dotted-quad strings never classify as FQDN. A trailing dot is allowed.
static FQDN_RFC1123: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^([a-zA-Z0-9][a-zA-Z0-9-]{0,62})(\.[a-zA-Z0-9][a-zA-Z0-9-]{0,62})*?(\.[a-zA-Z][a-zA-Z0-9]{0,62})\.?$",
    )
    .expect("FQDN pattern is valid")
});

/// Classification of an upstream host string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HostKind {
    Unknown,
    Ipv4,
    Ipv6,
    Fqdn,
}

impl HostKind {
    /// Classify a host string. Total: every input maps to exactly one kind.
    pub fn classify(host: &str) -> Self {
        match host.parse::<IpAddr>() {
            Ok(IpAddr::V4(_)) => Self::Ipv4,
            Ok(IpAddr::V6(_)) => Self::Ipv6,
            Err(_) if is_fqdn(host) => Self::Fqdn,
            Err(_) => Self::Unknown,
        }
    }

    pub fn is_unknown(self) -> bool {
        self == Self::Unknown
    }
}

/// Whether a string is an RFC 1123 hostname with a non-numeric TLD.
pub fn is_fqdn(s: &str) -> bool {
    FQDN_RFC1123.is_match(s)
}

/// Whether a FQDN is canonical, i.e. carries the trailing dot.
pub fn is_canonical_fqdn(s: &str) -> bool {
    s.ends_with('.') && is_fqdn(s)
}

// ── Load balancer protocol ────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    Unknown,
    Tcp,
    Udp,
    Sctp,
    Http,
}

impl Protocol {
    /// Parse a config string. Unknown inputs collapse to `Unknown`.
    pub fn from_name(s: &str) -> Self {
        match s {
            "tcp" => Self::Tcp,
            "udp" => Self::Udp,
            "sctp" => Self::Sctp,
            "http" => Self::Http,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
            Self::Sctp => "sctp",
            Self::Http => "http",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Distribution mode ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DistMode {
    Unknown,
    RoundRobin,
    Weighted,
}

impl DistMode {
    /// Parse a config string. Unknown inputs collapse to `Unknown`.
    pub fn from_name(s: &str) -> Self {
        match s {
            "round-robin" => Self::RoundRobin,
            "weighted" => Self::Weighted,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::RoundRobin => "round-robin",
            Self::Weighted => "weighted",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for DistMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Engine kind ───────────────────────────────────────────────────

/// Supported protocol → distribution mode combinations of an engine.
pub type EngineCapabilities = HashMap<Protocol, HashSet<DistMode>>;

/// The closed set of load balancer engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EngineKind {
    Unknown,
    TestEngine,
    Nftables,
}

impl EngineKind {
    /// Parse a config string. Unknown inputs collapse to `Unknown`.
    pub fn from_name(s: &str) -> Self {
        match s {
            "testEngine" => Self::TestEngine,
            "nftables" => Self::Nftables,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::TestEngine => "testEngine",
            Self::Nftables => "nftables",
            Self::Unknown => "unknown",
        }
    }

    /// Static capability map for this engine kind.
    ///
    /// Both engines currently realize TCP round-robin only. The
    /// configuration validator consults this without instantiating an
    /// engine.
    pub fn capabilities(self) -> EngineCapabilities {
        match self {
            Self::TestEngine | Self::Nftables => {
                HashMap::from([(Protocol::Tcp, HashSet::from([DistMode::RoundRobin]))])
            }
            Self::Unknown => HashMap::new(),
        }
    }
}

impl std::fmt::Display for EngineKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Upstream IP ledger helpers ────────────────────────────────────

/// Deduplicate a ledger, keeping first-occurrence order.
pub fn unique_ips(ledger: &[IpAddr]) -> Vec<IpAddr> {
    let mut seen = HashSet::new();
    ledger.iter().copied().filter(|ip| seen.insert(*ip)).collect()
}

/// IPs appearing more than once in a ledger, reported once each, in the
/// order their second occurrence appears.
pub fn duplicate_ips(ledger: &[IpAddr]) -> Vec<IpAddr> {
    let mut count: HashMap<IpAddr, u32> = HashMap::new();
    let mut dups = Vec::new();
    for ip in ledger {
        let n = count.entry(*ip).or_insert(0);
        *n += 1;
        if *n == 2 {
            dups.push(*ip);
        }
    }
    dups
}
