//! Destination resolution collaborator interface
//!
//! Turning a name into address candidates is not this layer's job; the
//! connection layer only consumes the candidates, trying them in the order
//! returned until one connect succeeds or all fail.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::time::Duration;

use tokio::net::lookup_host;
use tokio::time::timeout;
use tracing::{debug, error};

use crate::connection::Transport;
use crate::error::ConnError;

pub type ResolveFuture<'a> =
    Pin<Box<dyn Future<Output = Result<Vec<SocketAddr>, ConnError>> + Send + 'a>>;

/// Resolves a destination host and default port into zero or more candidate
/// socket addresses.
pub trait Resolver: Send + Sync + 'static {
    fn resolve<'a>(&'a self, host: &'a str, port: u16, proto: Transport) -> ResolveFuture<'a>;
}

/// DNS-backed resolver using the runtime's host lookup, bounded by a
/// timeout so a slow resolver cannot stall a connect attempt indefinitely.
#[derive(Debug, Clone)]
pub struct DnsResolver {
    timeout: Duration,
}

impl DnsResolver {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Resolver for DnsResolver {
    fn resolve<'a>(&'a self, host: &'a str, port: u16, _proto: Transport) -> ResolveFuture<'a> {
        Box::pin(async move {
            let target = format!("{host}:{port}");
            match timeout(self.timeout, lookup_host(target.clone())).await {
                Ok(Ok(addrs)) => {
                    let candidates: Vec<SocketAddr> = addrs.collect();
                    if candidates.is_empty() {
                        return Err(ConnError::ResolutionFailed(format!(
                            "no addresses for {target}"
                        )));
                    }
                    debug!(host, count = candidates.len(), "destination resolved");
                    Ok(candidates)
                }
                Ok(Err(e)) => {
                    error!(host, error = %e, "destination resolution failed");
                    Err(ConnError::ResolutionFailed(format!("{target}: {e}")))
                }
                Err(_) => Err(ConnError::ResolutionFailed(format!(
                    "{target}: lookup timed out"
                ))),
            }
        })
    }
}

/// Fixed-table resolver for tests and static deployments.
#[derive(Debug, Default)]
pub struct StaticResolver {
    entries: HashMap<String, Vec<SocketAddr>>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entry(mut self, host: impl Into<String>, addrs: Vec<SocketAddr>) -> Self {
        self.entries.insert(host.into(), addrs);
        self
    }
}

impl Resolver for StaticResolver {
    fn resolve<'a>(&'a self, host: &'a str, port: u16, _proto: Transport) -> ResolveFuture<'a> {
        let result = match self.entries.get(host) {
            Some(addrs) => Ok(addrs
                .iter()
                .map(|a| SocketAddr::new(a.ip(), if a.port() == 0 { port } else { a.port() }))
                .collect()),
            None => Err(ConnError::ResolutionFailed(format!("unknown host {host}"))),
        };
        Box::pin(async move { result })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dns_resolver_handles_literal_addresses() {
        let resolver = DnsResolver::new(Duration::from_secs(2));
        let addrs = resolver
            .resolve("127.0.0.1", 5060, Transport::Tcp)
            .await
            .unwrap();
        assert_eq!(addrs, vec!["127.0.0.1:5060".parse().unwrap()]);
    }

    #[tokio::test]
    async fn static_resolver_fills_default_port() {
        let resolver = StaticResolver::new()
            .with_entry("sip.example.org", vec!["192.0.2.1:0".parse().unwrap()]);
        let addrs = resolver
            .resolve("sip.example.org", 5060, Transport::Tcp)
            .await
            .unwrap();
        assert_eq!(addrs, vec!["192.0.2.1:5060".parse().unwrap()]);
    }

    #[tokio::test]
    async fn unknown_host_is_a_resolution_failure() {
        let resolver = StaticResolver::new();
        let err = resolver
            .resolve("missing.example.org", 5060, Transport::Tcp)
            .await
            .unwrap_err();
        assert!(matches!(err, ConnError::ResolutionFailed(_)));
    }
}
