use std::net::IpAddr;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use crate::secondary::dns_resolver_port::{DnsError, DnsResolverPort};

/// One scripted resolver outcome.
#[derive(Debug, Clone)]
pub enum ScriptedAnswer {
    A(IpAddr, u32),
    Fail,
}

/// Resolver double that replays a scripted sequence of answers.
///
/// Each call consumes the next answer; once the script is exhausted the
/// last answer repeats. `calls` counts invocations so tests can assert
/// scheduling behavior.
pub struct ScriptedResolver {
    script: Mutex<Vec<ScriptedAnswer>>,
    pos: AtomicUsize,
    calls: AtomicUsize,
}

impl ScriptedResolver {
    pub fn new(script: Vec<ScriptedAnswer>) -> Self {
        assert!(!script.is_empty(), "script must hold at least one answer");
        Self {
            script: Mutex::new(script),
            pos: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
        }
    }

    /// A resolver that always yields the same A record.
    pub fn answering(ip: IpAddr, ttl: u32) -> Self {
        Self::new(vec![ScriptedAnswer::A(ip, ttl)])
    }

    /// A resolver that always fails.
    pub fn failing() -> Self {
        Self::new(vec![ScriptedAnswer::Fail])
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DnsResolverPort for ScriptedResolver {
    async fn resolve(&self, fqdn: &str, _servers: &[IpAddr]) -> Result<(IpAddr, u32), DnsError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let script = self.script.lock().expect("script lock");
        let i = self.pos.fetch_add(1, Ordering::SeqCst).min(script.len() - 1);
        match script[i] {
            ScriptedAnswer::A(ip, ttl) => Ok((ip, ttl)),
            ScriptedAnswer::Fail => Err(DnsError::ResolutionFailed(fqdn.to_string())),
        }
    }
}
