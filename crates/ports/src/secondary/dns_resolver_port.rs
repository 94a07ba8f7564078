use std::net::IpAddr;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DnsError {
    #[error("host is not a valid canonical fqdn: '{0}'")]
    NotFqdn(String),

    #[error("couldn't resolve host record for '{0}', check your DNS")]
    ResolutionFailed(String),

    #[error("dns transport error: {0}")]
    Transport(String),
}

/// Secondary port for forward DNS resolution.
///
/// `fqdn` must be canonical (trailing dot). Servers are tried in order;
/// the first A record wins and is returned with its TTL in seconds. An
/// empty server list means the system stub resolver configuration.
#[async_trait]
pub trait DnsResolverPort: Send + Sync {
    async fn resolve(&self, fqdn: &str, servers: &[IpAddr]) -> Result<(IpAddr, u32), DnsError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dns_resolver_port_is_object_safe() {
        fn _check(_resolver: &dyn DnsResolverPort) {}
    }

    #[test]
    fn errors_name_the_host() {
        assert!(
            DnsError::NotFqdn("bad host".to_string())
                .to_string()
                .contains("bad host")
        );
        assert!(
            DnsError::ResolutionFailed("a.example.com.".to_string())
                .to_string()
                .contains("a.example.com.")
        );
    }
}
