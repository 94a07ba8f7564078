use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use hickory_proto::op::{Message, MessageType, OpCode, Query};
use hickory_proto::rr::{Name, RData, RecordType};
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::{debug, trace};

use ports::secondary::dns_resolver_port::{DnsError, DnsResolverPort};

/// Default DNS client configuration file, used when an upstream carries no
/// DNS servers of its own.
const RESOLV_CONF_PATH: &str = "/etc/resolv.conf";

/// UDP responses without EDNS0 cap at 512 bytes; leave headroom for EDNS0.
const RECV_BUFFER_SIZE: usize = 4096;

const DNS_PORT: u16 = 53;

/// Stateless UDP resolver: one socket per query, servers tried in order,
/// first A record wins.
#[derive(Debug)]
pub struct UdpResolver {
    /// Per-server exchange timeout.
    exchange_timeout: Duration,
}

impl Default for UdpResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl UdpResolver {
    pub fn new() -> Self {
        Self {
            exchange_timeout: Duration::from_secs(2),
        }
    }

    pub fn with_timeout(exchange_timeout: Duration) -> Self {
        Self { exchange_timeout }
    }

    /// Send one A query to one server and scan the answer section.
    async fn query_server(
        &self,
        fqdn: &str,
        server: SocketAddr,
    ) -> Result<Option<(IpAddr, u32)>, DnsError> {
        let name = Name::from_str(fqdn).map_err(|_| DnsError::NotFqdn(fqdn.to_string()))?;

        let mut query = Message::new();
        query
            .set_id(rand::random())
            .set_message_type(MessageType::Query)
            .set_op_code(OpCode::Query)
            .set_recursion_desired(true)
            .add_query(Query::query(name, RecordType::A));

        let wire = query
            .to_vec()
            .map_err(|e| DnsError::Transport(e.to_string()))?;

        let bind_addr = if server.is_ipv6() { "[::]:0" } else { "0.0.0.0:0" };
        let socket = UdpSocket::bind(bind_addr)
            .await
            .map_err(|e| DnsError::Transport(e.to_string()))?;
        socket
            .send_to(&wire, server)
            .await
            .map_err(|e| DnsError::Transport(e.to_string()))?;

        let mut buf = vec![0u8; RECV_BUFFER_SIZE];
        let (len, _) = timeout(self.exchange_timeout, socket.recv_from(&mut buf))
            .await
            .map_err(|_| DnsError::Transport(format!("query to '{server}' timed out")))?
            .map_err(|e| DnsError::Transport(e.to_string()))?;

        let response =
            Message::from_vec(&buf[..len]).map_err(|e| DnsError::Transport(e.to_string()))?;
        if response.id() != query.id() {
            return Err(DnsError::Transport("response id mismatch".to_string()));
        }

        for answer in response.answers() {
            if let Some(RData::A(a)) = answer.data() {
                return Ok(Some((IpAddr::V4(a.0), answer.ttl())));
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl DnsResolverPort for UdpResolver {
    async fn resolve(&self, fqdn: &str, servers: &[IpAddr]) -> Result<(IpAddr, u32), DnsError> {
        if !fqdn.ends_with('.') {
            trace!(host = fqdn, "host is not a canonical fqdn");
            return Err(DnsError::NotFqdn(fqdn.to_string()));
        }

        let servers = if servers.is_empty() {
            debug!(path = RESOLV_CONF_PATH, "no DNS servers configured, reading system resolver config");
            system_dns_servers(Path::new(RESOLV_CONF_PATH))
        } else {
            servers.to_vec()
        };

        for server in servers {
            let addr = SocketAddr::new(server, DNS_PORT);
            match self.query_server(fqdn, addr).await {
                Ok(Some((ip, ttl))) => {
                    trace!(host = fqdn, server = %server, address = %ip, ttl, "resolved");
                    return Ok((ip, ttl));
                }
                Ok(None) => {
                    trace!(host = fqdn, server = %server, "no A record in answer");
                }
                Err(e) => {
                    trace!(host = fqdn, server = %server, error = %e, "query failed");
                }
            }
        }

        Err(DnsError::ResolutionFailed(fqdn.to_string()))
    }
}

/// Nameserver entries from a resolv.conf-format file. Unparseable or
/// missing files yield an empty list, which resolves to a resolution
/// failure upstream.
fn system_dns_servers(path: &Path) -> Vec<IpAddr> {
    let Ok(content) = std::fs::read_to_string(path) else {
        return Vec::new();
    };
    content
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            line.strip_prefix("nameserver")
                .map(str::trim)
                .and_then(|addr| addr.parse().ok())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn non_canonical_fqdn_rejected_immediately() {
        let r = UdpResolver::new();
        let err = r.resolve("example.com", &[]).await.unwrap_err();
        assert!(matches!(err, DnsError::NotFqdn(_)));
    }

    #[tokio::test]
    async fn unreachable_server_yields_resolution_failure() {
        // RFC 5737 TEST-NET address with a short timeout: every server
        // fails, so the resolver reports resolution failure.
        let r = UdpResolver::with_timeout(Duration::from_millis(50));
        let err = r
            .resolve("example.com.", &["192.0.2.1".parse().unwrap()])
            .await
            .unwrap_err();
        assert!(matches!(err, DnsError::ResolutionFailed(_)));
    }

    #[tokio::test]
    async fn query_server_returns_first_a_record_with_ttl() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_ip = server.local_addr().unwrap().ip();
        let server_port = server.local_addr().unwrap().port();

        // resolve() dials port 53, which a test can't bind; exercise the
        // exchange directly against a mock server.
        let resolver = UdpResolver::with_timeout(Duration::from_secs(1));
        let task = tokio::spawn(async move {
            let mut buf = vec![0u8; 512];
            let (len, peer) = server.recv_from(&mut buf).await.unwrap();
            let query = Message::from_vec(&buf[..len]).unwrap();

            let mut response = Message::new();
            response
                .set_id(query.id())
                .set_message_type(MessageType::Response)
                .add_query(query.queries()[0].clone());
            let mut record = hickory_proto::rr::Record::new();
            record
                .set_name(query.queries()[0].name().clone())
                .set_record_type(RecordType::A)
                .set_ttl(5)
                .set_data(Some(RData::A(hickory_proto::rr::rdata::A(
                    "1.1.1.1".parse().unwrap(),
                ))));
            response.add_answer(record);
            server
                .send_to(&response.to_vec().unwrap(), peer)
                .await
                .unwrap();
        });

        let addr = SocketAddr::new(server_ip, server_port);
        let got = resolver
            .query_server("a.example.com.", addr)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.0, "1.1.1.1".parse::<IpAddr>().unwrap());
        assert_eq!(got.1, 5);
        task.await.unwrap();
    }

    #[test]
    fn resolv_conf_parsing() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "# comment").unwrap();
        writeln!(f, "search example.com").unwrap();
        writeln!(f, "nameserver 1.1.1.1").unwrap();
        writeln!(f, "nameserver 2001:db8::1").unwrap();
        writeln!(f, "nameserver not-an-ip").unwrap();

        let servers = system_dns_servers(f.path());
        assert_eq!(
            servers,
            vec![
                "1.1.1.1".parse::<IpAddr>().unwrap(),
                "2001:db8::1".parse::<IpAddr>().unwrap()
            ]
        );
    }

    #[test]
    fn missing_resolv_conf_is_empty() {
        assert!(system_dns_servers(Path::new("/nonexistent/resolv.conf")).is_empty());
    }
}
