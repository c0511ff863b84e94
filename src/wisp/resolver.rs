//! DNS resolution utilities

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::net::IpAddr;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use hickory_resolver::config::{NameServerConfigGroup, ResolverConfig};
use hickory_resolver::name_server::TokioConnectionProvider;
use hickory_resolver::TokioResolver;
use parking_lot::Mutex;
use tracing::warn;

use super::config::WispConfig;

static RESOLVER: OnceLock<Resolver> = OnceLock::new();

/// An injected resolution function, used in place of real DNS.
pub type CustomResolveFn =
    dyn Fn(String) -> Pin<Box<dyn Future<Output = Result<IpAddr>> + Send>> + Send + Sync;

/// How hostnames are turned into addresses.
#[derive(Clone)]
pub enum DnsMethod {
    /// System-level name resolution.
    Lookup,
    /// Authoritative queries against the configured DNS servers.
    Resolve,
    /// Delegate to an injected function.
    Custom(Arc<CustomResolveFn>),
}

impl fmt::Debug for DnsMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DnsMethod::Lookup => write!(f, "Lookup"),
            DnsMethod::Resolve => write!(f, "Resolve"),
            DnsMethod::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

impl FromStr for DnsMethod {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "lookup" => Ok(DnsMethod::Lookup),
            "resolve" => Ok(DnsMethod::Resolve),
            other => anyhow::bail!("unknown dns method: {}", other),
        }
    }
}

/// Address-family preference applied to DNS answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DnsResultOrder {
    /// Take answers in the order the resolver produced them.
    Verbatim,
    Ipv4First,
    Ipv6First,
}

impl FromStr for DnsResultOrder {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "verbatim" => Ok(DnsResultOrder::Verbatim),
            "ipv4first" => Ok(DnsResultOrder::Ipv4First),
            "ipv6first" => Ok(DnsResultOrder::Ipv6First),
            other => anyhow::bail!("unknown dns result order: {}", other),
        }
    }
}

enum Backend {
    Hickory(Box<TokioResolver>),
    System,
    Custom(Arc<CustomResolveFn>),
}

struct CacheEntry {
    at: Instant,
    /// Failures are cached too and re-raised on hit.
    result: std::result::Result<IpAddr, String>,
}

pub struct Resolver {
    backend: Backend,
    order: DnsResultOrder,
    ttl: Duration,
    cache: Mutex<HashMap<String, CacheEntry>>,
}

impl Resolver {
    fn new(backend: Backend, order: DnsResultOrder, ttl: Duration) -> Self {
        Self {
            backend,
            order,
            ttl,
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn from_config(config: &WispConfig) -> Self {
        let backend = match &config.dns_method {
            DnsMethod::Lookup => Backend::System,
            DnsMethod::Resolve => build_hickory(&config.dns_servers),
            DnsMethod::Custom(resolve) => Backend::Custom(resolve.clone()),
        };
        Self::new(backend, config.dns_result_order, config.dns_ttl)
    }

    /// Resolve a hostname to one IP address.
    ///
    /// Literal addresses pass straight through. Everything else goes through
    /// the TTL cache; on a miss the configured backend runs and its outcome,
    /// success or failure, is cached.
    pub async fn lookup_ip(&self, host: &str) -> Result<IpAddr> {
        if let Ok(ip) = IpAddr::from_str(host) {
            return Ok(ip);
        }

        {
            let mut cache = self.cache.lock();
            let ttl = self.ttl;
            cache.retain(|_, entry| entry.at.elapsed() < ttl);
            if let Some(entry) = cache.get(host) {
                return entry
                    .result
                    .clone()
                    .map_err(|message| anyhow::anyhow!("{}", message));
            }
        }

        let result = match &self.backend {
            Backend::System => self.resolve_system(host).await,
            Backend::Hickory(resolver) => self.resolve_authoritative(resolver, host).await,
            Backend::Custom(resolve) => resolve(host.to_string()).await,
        };

        self.cache.lock().insert(
            host.to_string(),
            CacheEntry {
                at: Instant::now(),
                result: result
                    .as_ref()
                    .map(|ip| *ip)
                    .map_err(|e| format!("{:#}", e)),
            },
        );

        result
    }

    async fn resolve_system(&self, host: &str) -> Result<IpAddr> {
        let addrs: Vec<IpAddr> = tokio::net::lookup_host(format!("{}:0", host))
            .await
            .with_context(|| format!("Failed to resolve hostname: {}", host))?
            .map(|addr| addr.ip())
            .collect();

        let pick = match self.order {
            DnsResultOrder::Verbatim => addrs.first().copied(),
            DnsResultOrder::Ipv4First => addrs
                .iter()
                .find(|ip| ip.is_ipv4())
                .or_else(|| addrs.first())
                .copied(),
            DnsResultOrder::Ipv6First => addrs
                .iter()
                .find(|ip| ip.is_ipv6())
                .or_else(|| addrs.first())
                .copied(),
        };
        pick.ok_or_else(|| anyhow::anyhow!("no addresses for {}", host))
    }

    /// Query both record types in the configured preference order, taking the
    /// first answer.
    async fn resolve_authoritative(&self, resolver: &TokioResolver, host: &str) -> Result<IpAddr> {
        match self.order {
            DnsResultOrder::Ipv4First => match query_a(resolver, host).await {
                Ok(ip) => Ok(ip),
                Err(_) => query_aaaa(resolver, host).await,
            },
            DnsResultOrder::Verbatim | DnsResultOrder::Ipv6First => {
                match query_aaaa(resolver, host).await {
                    Ok(ip) => Ok(ip),
                    Err(_) => query_a(resolver, host).await,
                }
            }
        }
    }
}

async fn query_a(resolver: &TokioResolver, host: &str) -> Result<IpAddr> {
    let lookup = resolver
        .ipv4_lookup(host)
        .await
        .with_context(|| format!("Failed to resolve hostname: {}", host))?;
    lookup
        .iter()
        .next()
        .map(|a| IpAddr::V4(a.0))
        .ok_or_else(|| anyhow::anyhow!("no A records for {}", host))
}

async fn query_aaaa(resolver: &TokioResolver, host: &str) -> Result<IpAddr> {
    let lookup = resolver
        .ipv6_lookup(host)
        .await
        .with_context(|| format!("Failed to resolve hostname: {}", host))?;
    lookup
        .iter()
        .next()
        .map(|aaaa| IpAddr::V6(aaaa.0))
        .ok_or_else(|| anyhow::anyhow!("no AAAA records for {}", host))
}

fn build_hickory(dns_servers: &[String]) -> Backend {
    if dns_servers.is_empty() {
        // Try to use system DNS config for the authoritative queries
        match hickory_resolver::system_conf::read_system_conf() {
            Ok((config, opts)) => Backend::Hickory(Box::new(
                TokioResolver::builder_with_config(config, TokioConnectionProvider::default())
                    .with_options(opts)
                    .build(),
            )),
            Err(_) => {
                warn!("Unable to read system DNS config, using system resolver");
                Backend::System
            }
        }
    } else {
        let servers: Vec<IpAddr> = dns_servers.iter().filter_map(|s| s.parse().ok()).collect();

        if servers.is_empty() {
            warn!("No valid DNS servers configured, using system resolver");
            return Backend::System;
        }

        let config = ResolverConfig::from_parts(
            None,
            Vec::new(),
            NameServerConfigGroup::from_ips_clear(&servers, 53, true),
        );

        Backend::Hickory(Box::new(
            TokioResolver::builder_with_config(config, TokioConnectionProvider::default()).build(),
        ))
    }
}

/// Initialize the global DNS resolver
pub fn init_resolver(config: &WispConfig) {
    RESOLVER.get_or_init(|| Resolver::from_config(config));
}

/// Get the global resolver
pub fn get_resolver() -> &'static Resolver {
    RESOLVER.get_or_init(|| Resolver::from_config(&WispConfig::default()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_backend(
        calls: Arc<AtomicUsize>,
        result: std::result::Result<IpAddr, String>,
    ) -> Backend {
        Backend::Custom(Arc::new(
            move |_host: String| -> Pin<Box<dyn Future<Output = Result<IpAddr>> + Send>> {
                calls.fetch_add(1, Ordering::SeqCst);
                let result = result.clone();
                Box::pin(async move { result.map_err(|e| anyhow::anyhow!("{}", e)) })
            },
        ))
    }

    #[tokio::test]
    async fn test_literal_addresses_pass_through() {
        let calls = Arc::new(AtomicUsize::new(0));
        let resolver = Resolver::new(
            counting_backend(calls.clone(), Ok("9.9.9.9".parse().unwrap())),
            DnsResultOrder::Verbatim,
            Duration::from_secs(120),
        );

        let ip = resolver.lookup_ip("192.0.2.7").await.unwrap();
        assert_eq!(ip, "192.0.2.7".parse::<IpAddr>().unwrap());
        let ip = resolver.lookup_ip("::1").await.unwrap();
        assert_eq!(ip, "::1".parse::<IpAddr>().unwrap());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cache_hit_skips_backend() {
        let calls = Arc::new(AtomicUsize::new(0));
        let resolver = Resolver::new(
            counting_backend(calls.clone(), Ok("203.0.113.5".parse().unwrap())),
            DnsResultOrder::Verbatim,
            Duration::from_secs(120),
        );

        let first = resolver.lookup_ip("example.com").await.unwrap();
        let second = resolver.lookup_ip("example.com").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failures_are_cached_and_reraised() {
        let calls = Arc::new(AtomicUsize::new(0));
        let resolver = Resolver::new(
            counting_backend(calls.clone(), Err("NXDOMAIN".to_string())),
            DnsResultOrder::Verbatim,
            Duration::from_secs(120),
        );

        assert!(resolver.lookup_ip("missing.example").await.is_err());
        let err = resolver.lookup_ip("missing.example").await.unwrap_err();
        assert!(err.to_string().contains("NXDOMAIN"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_entries_expire_after_ttl() {
        let calls = Arc::new(AtomicUsize::new(0));
        let resolver = Resolver::new(
            counting_backend(calls.clone(), Ok("203.0.113.5".parse().unwrap())),
            DnsResultOrder::Verbatim,
            Duration::from_millis(20),
        );

        resolver.lookup_ip("example.com").await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        resolver.lookup_ip("example.com").await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
