use std::path::Path;

use tracing::debug;

use super::ProbeError;

/// Generic IPv4 ip_forward setting path.
pub const IPV4_FORWARDING_PATH: &str = "/proc/sys/net/ipv4/ip_forward";
/// IPv6 forwarding setting path covering all interfaces.
pub const IPV6_FORWARDING_PATH: &str = "/proc/sys/net/ipv6/conf/all/forwarding";

/// System IP forwarding state. Forwarding is only probed globally, never
/// per interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpForwarding {
    /// Neither IPv4 nor IPv6 forwarding is enabled.
    None,
    /// Forwarding is enabled for IPv4 and IPv6.
    All,
    V4Only,
    V6Only,
}

impl IpForwarding {
    pub fn ipv4_enabled(self) -> bool {
        matches!(self, Self::All | Self::V4Only)
    }

    pub fn ipv6_enabled(self) -> bool {
        matches!(self, Self::All | Self::V6Only)
    }
}

/// Probe the kernel's global IP forwarding switches.
pub fn check_ip_forwarding() -> Result<IpForwarding, ProbeError> {
    check_ip_forwarding_at(Path::new(IPV4_FORWARDING_PATH), Path::new(IPV6_FORWARDING_PATH))
}

fn check_ip_forwarding_at(ipv4_path: &Path, ipv6_path: &Path) -> Result<IpForwarding, ProbeError> {
    debug!(path = %ipv4_path.display(), "checking IPv4 forwarding setting");
    let v4 = std::fs::read(ipv4_path).map_err(|e| ProbeError::ReadIpv4Setting(e.to_string()))?;

    debug!(path = %ipv6_path.display(), "checking IPv6 forwarding setting");
    let v6 = std::fs::read(ipv6_path).map_err(|e| ProbeError::ReadIpv6Setting(e.to_string()))?;

    Ok(classify(&v4, &v6))
}

/// Control files hold `1` when enabled, `0` when disabled.
fn classify(ipv4: &[u8], ipv6: &[u8]) -> IpForwarding {
    let enabled = |content: &[u8]| content.first() == Some(&b'1');
    match (enabled(ipv4), enabled(ipv6)) {
        (true, true) => IpForwarding::All,
        (true, false) => IpForwarding::V4Only,
        (false, true) => IpForwarding::V6Only,
        (false, false) => IpForwarding::None,
    }
}
