//! Destination policy: the allow/deny rules evaluated before a stream is
//! connected.
//!
//! Checks short-circuit on the first denial, in a fixed order: stream kind,
//! hostname lists, port lists, the direct-IP gate, the resolved-address
//! classification gate, and finally the per-connection quotas. A denial maps
//! to the close reason sent back on the stream.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use parking_lot::Mutex;
use wisp_mux::packet::{CloseReason, StreamType};

use super::config::WispConfig;
use super::resolver::get_resolver;

/// Live streams on one connection, keyed by stream id. Supplies the counts
/// behind the total and per-host quotas.
#[derive(Debug, Default)]
pub struct StreamTracker {
    active: Mutex<HashMap<u32, String>>,
}

impl StreamTracker {
    pub fn register(&self, stream_id: u32, host: &str) {
        self.active.lock().insert(stream_id, host.to_string());
    }

    pub fn unregister(&self, stream_id: u32) {
        self.active.lock().remove(&stream_id);
    }

    pub fn total(&self) -> usize {
        self.active.lock().len()
    }

    pub fn count_for_host(&self, host: &str) -> usize {
        self.active
            .lock()
            .values()
            .filter(|existing| existing.as_str() == host)
            .count()
    }
}

// IP classification helpers

fn ipv4_is_private(addr: Ipv4Addr) -> bool {
    let octets = addr.octets();
    addr.is_private()
        || addr.is_link_local()
        || addr.is_broadcast()
        || addr.is_multicast()
        || (octets[0] == 100 && (octets[1] & 0xc0) == 64) // Carrier-grade NAT
        || (octets[0] == 192 && octets[1] == 0 && octets[2] == 0) // IETF assignments
        || (octets[0] == 198 && (octets[1] & 0xfe) == 18) // Benchmarking
        || octets[0] >= 240 // Reserved
}

fn ipv6_is_private(addr: Ipv6Addr) -> bool {
    (addr.segments()[0] & 0xfe00) == 0xfc00 // Unique local
        || (addr.segments()[0] & 0xffc0) == 0xfe80 // Link local
        || addr.is_multicast()
}

fn is_loopback_or_unspecified(addr: IpAddr) -> bool {
    addr.is_loopback() || addr.is_unspecified()
}

fn is_private(addr: IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => ipv4_is_private(v4),
        IpAddr::V6(v6) => ipv6_is_private(v6),
    }
}

fn check_address_class(config: &WispConfig, addr: IpAddr) -> Result<(), CloseReason> {
    if is_loopback_or_unspecified(addr) {
        if !config.allow_loopback {
            return Err(CloseReason::ServerStreamBlockedAddress);
        }
        return Ok(());
    }
    if is_private(addr) && !config.allow_private {
        return Err(CloseReason::ServerStreamBlockedAddress);
    }
    Ok(())
}

/// Decide whether a CONNECT may proceed.
///
/// Returns the close reason to send when denied. Pass the connection's
/// tracker to enforce quotas; `None` skips them (e.g. for offline checks).
pub async fn is_stream_allowed(
    config: &WispConfig,
    tracker: Option<&StreamTracker>,
    stream_type: StreamType,
    host: &str,
    port: u16,
) -> Result<(), CloseReason> {
    match stream_type {
        StreamType::Tcp if !config.allow_tcp => {
            return Err(CloseReason::ServerStreamBlockedAddress)
        }
        StreamType::Udp if !config.allow_udp => {
            return Err(CloseReason::ServerStreamBlockedAddress)
        }
        StreamType::Other(_) => return Err(CloseReason::ServerStreamInvalidInfo),
        _ => {}
    }

    if !config.hostname_allowed(host) {
        return Err(CloseReason::ServerStreamBlockedAddress);
    }
    if !config.port_allowed(port) {
        return Err(CloseReason::ServerStreamBlockedAddress);
    }

    if let Ok(ip) = IpAddr::from_str(host) {
        if !config.allow_direct_ip {
            return Err(CloseReason::ServerStreamBlockedAddress);
        }
        check_address_class(config, ip)?;
    } else {
        // Classify what the hostname resolves to; when resolution fails the
        // connect attempt will surface the failure with its own reason.
        if let Ok(ip) = get_resolver().lookup_ip(host).await {
            check_address_class(config, ip)?;
        }
    }

    if let Some(tracker) = tracker {
        if config.stream_limit_total >= 0 && tracker.total() as i64 >= config.stream_limit_total {
            return Err(CloseReason::ServerStreamThrottled);
        }
        if config.stream_limit_per_host >= 0
            && tracker.count_for_host(host) as i64 >= config.stream_limit_per_host
        {
            return Err(CloseReason::ServerStreamThrottled);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use regex::Regex;

    fn permissive() -> WispConfig {
        WispConfig {
            allow_loopback: true,
            allow_private: true,
            port_blacklist: Vec::new(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_kind_gate() {
        let config = WispConfig {
            allow_tcp: false,
            ..permissive()
        };
        let denied = is_stream_allowed(&config, None, StreamType::Tcp, "192.0.2.1", 80).await;
        assert_eq!(denied, Err(CloseReason::ServerStreamBlockedAddress));
        assert!(
            is_stream_allowed(&config, None, StreamType::Udp, "192.0.2.1", 80)
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn test_unknown_kind_is_invalid() {
        let config = permissive();
        let denied =
            is_stream_allowed(&config, None, StreamType::Other(9), "192.0.2.1", 80).await;
        assert_eq!(denied, Err(CloseReason::ServerStreamInvalidInfo));
    }

    #[tokio::test]
    async fn test_hostname_lists_run_before_resolution() {
        let config = WispConfig {
            hostname_whitelist: vec![Regex::new(r"^192\.0\.2\.\d+$").unwrap()],
            ..permissive()
        };
        assert!(
            is_stream_allowed(&config, None, StreamType::Tcp, "192.0.2.9", 80)
                .await
                .is_ok()
        );
        // Denied by the whitelist without any DNS traffic.
        let denied =
            is_stream_allowed(&config, None, StreamType::Tcp, "blocked.example", 80).await;
        assert_eq!(denied, Err(CloseReason::ServerStreamBlockedAddress));
    }

    #[tokio::test]
    async fn test_port_gate() {
        let config = WispConfig {
            port_blacklist: vec![6000..=7000],
            ..permissive()
        };
        let denied = is_stream_allowed(&config, None, StreamType::Tcp, "192.0.2.1", 6500).await;
        assert_eq!(denied, Err(CloseReason::ServerStreamBlockedAddress));
        assert!(
            is_stream_allowed(&config, None, StreamType::Tcp, "192.0.2.1", 443)
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn test_direct_ip_gate() {
        let config = WispConfig {
            allow_direct_ip: false,
            ..permissive()
        };
        let denied = is_stream_allowed(&config, None, StreamType::Tcp, "192.0.2.1", 80).await;
        assert_eq!(denied, Err(CloseReason::ServerStreamBlockedAddress));
        let denied = is_stream_allowed(&config, None, StreamType::Tcp, "2001:db8::1", 80).await;
        assert_eq!(denied, Err(CloseReason::ServerStreamBlockedAddress));
    }

    #[tokio::test]
    async fn test_loopback_and_private_classes() {
        let config = WispConfig {
            port_blacklist: Vec::new(),
            ..Default::default()
        };
        for host in ["127.0.0.1", "0.0.0.0", "::1"] {
            let denied = is_stream_allowed(&config, None, StreamType::Tcp, host, 80).await;
            assert_eq!(denied, Err(CloseReason::ServerStreamBlockedAddress), "{host}");
        }
        for host in ["10.1.2.3", "192.168.1.1", "100.64.0.1", "169.254.0.5", "fc00::1", "fe80::1"]
        {
            let denied = is_stream_allowed(&config, None, StreamType::Tcp, host, 80).await;
            assert_eq!(denied, Err(CloseReason::ServerStreamBlockedAddress), "{host}");
        }
        assert!(
            is_stream_allowed(&config, None, StreamType::Tcp, "93.184.216.34", 80)
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn test_quotas() {
        let config = WispConfig {
            stream_limit_total: 2,
            stream_limit_per_host: 1,
            ..permissive()
        };
        let tracker = StreamTracker::default();

        assert!(
            is_stream_allowed(&config, Some(&tracker), StreamType::Tcp, "192.0.2.1", 80)
                .await
                .is_ok()
        );
        tracker.register(1, "192.0.2.1");

        // Per-host limit hit for the same destination.
        let denied =
            is_stream_allowed(&config, Some(&tracker), StreamType::Tcp, "192.0.2.1", 80).await;
        assert_eq!(denied, Err(CloseReason::ServerStreamThrottled));

        tracker.register(2, "192.0.2.2");
        // Total limit hit for any destination.
        let denied =
            is_stream_allowed(&config, Some(&tracker), StreamType::Tcp, "192.0.2.3", 80).await;
        assert_eq!(denied, Err(CloseReason::ServerStreamThrottled));

        tracker.unregister(2);
        assert!(
            is_stream_allowed(&config, Some(&tracker), StreamType::Tcp, "192.0.2.3", 80)
                .await
                .is_ok()
        );
    }
}
