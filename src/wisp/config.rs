//! Wisp server configuration

use std::ops::RangeInclusive;
use std::time::Duration;

use anyhow::Context;
use regex::Regex;

use super::resolver::{DnsMethod, DnsResultOrder};

/// Configuration for the Wisp proxy server
#[derive(Debug, Clone)]
pub struct WispConfig {
    /// Allow UDP streams
    pub allow_udp: bool,
    /// Allow TCP streams
    pub allow_tcp: bool,
    /// Allow connections to loopback addresses
    pub allow_loopback: bool,
    /// Allow connections to private/non-global IPs
    pub allow_private: bool,
    /// Allow CONNECT hostnames that are literal IP addresses
    pub allow_direct_ip: bool,
    /// Hostname patterns that are always allowed. When non-empty, a hostname
    /// must match one of these; the blacklist is not consulted.
    pub hostname_whitelist: Vec<Regex>,
    /// Hostname patterns that are denied when no whitelist is set
    pub hostname_blacklist: Vec<Regex>,
    /// Ports that are always allowed; same precedence as the hostname lists
    pub port_whitelist: Vec<RangeInclusive<u16>>,
    /// Ports that are denied when no whitelist is set
    pub port_blacklist: Vec<RangeInclusive<u16>>,
    /// Maximum live streams per connection (-1 disables)
    pub stream_limit_total: i64,
    /// Maximum live streams per destination hostname per connection (-1 disables)
    pub stream_limit_per_host: i64,
    /// Credit granted to each stream's client→target buffer, in chunks
    pub stream_buffer_size: u32,
    /// Buffer size for stream copying
    pub copy_buffer_size: usize,
    /// DNS servers to use for authoritative resolution (empty = system default)
    pub dns_servers: Vec<String>,
    /// How long resolved addresses stay cached
    pub dns_ttl: Duration,
    /// How hostnames are resolved
    pub dns_method: DnsMethod,
    /// Address-family preference for DNS answers
    pub dns_result_order: DnsResultOrder,
    /// Protocol version to speak (1 or 2)
    pub wisp_version: u8,
    /// Message of the day advertised during the v2 handshake
    pub wisp_motd: Option<String>,
}

impl Default for WispConfig {
    fn default() -> Self {
        Self {
            allow_udp: true,
            allow_tcp: true,
            allow_loopback: false,
            allow_private: false,
            allow_direct_ip: true,
            hostname_whitelist: Vec::new(),
            hostname_blacklist: Vec::new(),
            port_whitelist: Vec::new(),
            port_blacklist: vec![
                // Common blocked ports for security
                22..=22,   // SSH
                25..=25,   // SMTP
                587..=587, // SMTP submission
            ],
            stream_limit_total: -1,
            stream_limit_per_host: -1,
            stream_buffer_size: 128,
            copy_buffer_size: 16384,
            dns_servers: vec!["1.1.1.1".to_string(), "8.8.8.8".to_string()],
            dns_ttl: Duration::from_secs(120),
            dns_method: DnsMethod::Resolve,
            dns_result_order: DnsResultOrder::Verbatim,
            wisp_version: 2,
            wisp_motd: None,
        }
    }
}

impl WispConfig {
    /// Build a config from `WISP_*` environment variables on top of the
    /// defaults.
    pub fn from_env() -> anyhow::Result<Self> {
        let mut config = Self::default();

        config.allow_tcp = env_bool("WISP_ALLOW_TCP", config.allow_tcp);
        config.allow_udp = env_bool("WISP_ALLOW_UDP", config.allow_udp);
        config.allow_loopback = env_bool("WISP_ALLOW_LOOPBACK", config.allow_loopback);
        config.allow_private = env_bool("WISP_ALLOW_PRIVATE", config.allow_private);
        config.allow_direct_ip = env_bool("WISP_ALLOW_DIRECT_IP", config.allow_direct_ip);

        if let Ok(list) = std::env::var("WISP_HOSTNAME_WHITELIST") {
            config.hostname_whitelist = parse_regex_list(&list)?;
        }
        if let Ok(list) = std::env::var("WISP_HOSTNAME_BLACKLIST") {
            config.hostname_blacklist = parse_regex_list(&list)?;
        }
        if let Ok(list) = std::env::var("WISP_PORT_WHITELIST") {
            config.port_whitelist = parse_port_ranges(&list)?;
        }
        if let Ok(list) = std::env::var("WISP_PORT_BLACKLIST") {
            config.port_blacklist = parse_port_ranges(&list)?;
        }

        if let Ok(value) = std::env::var("WISP_STREAM_LIMIT_TOTAL") {
            config.stream_limit_total = value
                .parse()
                .context("invalid WISP_STREAM_LIMIT_TOTAL")?;
        }
        if let Ok(value) = std::env::var("WISP_STREAM_LIMIT_PER_HOST") {
            config.stream_limit_per_host = value
                .parse()
                .context("invalid WISP_STREAM_LIMIT_PER_HOST")?;
        }

        if let Ok(servers) = std::env::var("WISP_DNS_SERVERS") {
            config.dns_servers = servers.split(',').map(|s| s.trim().to_string()).collect();
        }
        if let Ok(ttl) = std::env::var("WISP_DNS_TTL") {
            config.dns_ttl =
                Duration::from_secs(ttl.parse().context("invalid WISP_DNS_TTL")?);
        }
        if let Ok(method) = std::env::var("WISP_DNS_METHOD") {
            config.dns_method = method.parse()?;
        }
        if let Ok(order) = std::env::var("WISP_DNS_RESULT_ORDER") {
            config.dns_result_order = order.parse()?;
        }

        if let Ok(version) = std::env::var("WISP_VERSION") {
            config.wisp_version = version.parse().context("invalid WISP_VERSION")?;
        }
        if let Ok(motd) = std::env::var("WISP_MOTD") {
            config.wisp_motd = Some(motd);
        }

        Ok(config)
    }

    /// Check a port against the whitelist-then-blacklist rules.
    pub fn port_allowed(&self, port: u16) -> bool {
        if !self.port_whitelist.is_empty() {
            return self.port_whitelist.iter().any(|range| range.contains(&port));
        }
        !self.port_blacklist.iter().any(|range| range.contains(&port))
    }

    /// Check a hostname against the whitelist-then-blacklist rules.
    pub fn hostname_allowed(&self, host: &str) -> bool {
        if !self.hostname_whitelist.is_empty() {
            return self.hostname_whitelist.iter().any(|re| re.is_match(host));
        }
        !self.hostname_blacklist.iter().any(|re| re.is_match(host))
    }
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .map(|value| matches!(value.as_str(), "1" | "true" | "yes"))
        .unwrap_or(default)
}

fn parse_regex_list(list: &str) -> anyhow::Result<Vec<Regex>> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|pattern| {
            Regex::new(pattern).with_context(|| format!("invalid hostname pattern: {pattern}"))
        })
        .collect()
}

/// Parse "80,443,6000-7000" into inclusive ranges.
fn parse_port_ranges(list: &str) -> anyhow::Result<Vec<RangeInclusive<u16>>> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|entry| match entry.split_once('-') {
            Some((lo, hi)) => {
                let lo: u16 = lo.trim().parse().context("invalid port range start")?;
                let hi: u16 = hi.trim().parse().context("invalid port range end")?;
                Ok(lo..=hi)
            }
            None => {
                let port: u16 = entry.parse().context("invalid port")?;
                Ok(port..=port)
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_port_ranges() {
        let ranges = parse_port_ranges("80, 443,6000-7000").unwrap();
        assert_eq!(ranges, vec![80..=80, 443..=443, 6000..=7000]);
        assert!(parse_port_ranges("80-").is_err());
        assert!(parse_port_ranges("http").is_err());
    }

    #[test]
    fn test_port_blacklist_applies_without_whitelist() {
        let config = WispConfig::default();
        assert!(!config.port_allowed(22));
        assert!(!config.port_allowed(25));
        assert!(config.port_allowed(80));
    }

    #[test]
    fn test_port_whitelist_overrides_blacklist() {
        let config = WispConfig {
            port_whitelist: vec![22..=22],
            ..Default::default()
        };
        assert!(config.port_allowed(22));
        assert!(!config.port_allowed(80));
    }

    #[test]
    fn test_hostname_lists() {
        let config = WispConfig {
            hostname_blacklist: parse_regex_list(r"^.*\.internal$").unwrap(),
            ..Default::default()
        };
        assert!(!config.hostname_allowed("db.internal"));
        assert!(config.hostname_allowed("example.com"));

        let config = WispConfig {
            hostname_whitelist: parse_regex_list(r"^example\.com$").unwrap(),
            hostname_blacklist: parse_regex_list(r"example").unwrap(),
            ..Default::default()
        };
        // Whitelist wins: the blacklist is not consulted.
        assert!(config.hostname_allowed("example.com"));
        assert!(!config.hostname_allowed("example.org"));
    }
}
