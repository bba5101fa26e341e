//! Outbound request policy: keeps behaviors from reaching loopback,
//! private, link-local and metadata addresses unless local targets
//! are explicitly allowed.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use url::{Host, Url};

/// Hostnames rejected without resolving them.
const BLOCKED_HOSTNAMES: &[&str] = &["localhost", "metadata.google.internal", "metadata"];

/// Why a URL is refused before any connection is made.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyViolation {
    pub reason: String,
}

impl PolicyViolation {
    fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Checks on the URL itself: scheme, credentials, host presence and
/// blocked names / literal addresses.
///
/// Returns the host label to resolve when the host is a domain name.
pub fn check_url(url: &Url, allow_local: bool) -> Result<Option<String>, PolicyViolation> {
    match url.scheme() {
        "http" | "https" => {}
        other => {
            return Err(PolicyViolation::new(format!(
                "unsupported url scheme '{other}'"
            )))
        }
    }
    if !url.username().is_empty() || url.password().is_some() {
        return Err(PolicyViolation::new("url credentials are not allowed"));
    }

    let host = url
        .host()
        .ok_or_else(|| PolicyViolation::new("url has no hostname"))?;

    match host {
        Host::Ipv4(ip) => {
            check_ip(&host_label(url), IpAddr::V4(ip), allow_local)?;
            Ok(None)
        }
        Host::Ipv6(ip) => {
            check_ip(&host_label(url), IpAddr::V6(ip), allow_local)?;
            Ok(None)
        }
        Host::Domain(domain) => {
            let label = normalize_host_label(domain);
            if label.is_empty() {
                return Err(PolicyViolation::new("url has no hostname"));
            }
            if !allow_local && is_blocked_hostname(&label) {
                return Err(PolicyViolation::new(format!(
                    "host '{label}' is a local or metadata target"
                )));
            }
            Ok(Some(label))
        }
    }
}

/// Enforce the address policy for one resolved peer address.
pub fn check_ip(host_label: &str, ip: IpAddr, allow_local: bool) -> Result<(), PolicyViolation> {
    if allow_local {
        return Ok(());
    }
    if let Some(range) = blocked_range(&ip) {
        return Err(PolicyViolation::new(format!(
            "host '{host_label}' resolves to {range} address {ip}"
        )));
    }
    Ok(())
}

fn is_blocked_hostname(label: &str) -> bool {
    BLOCKED_HOSTNAMES.contains(&label) || label.ends_with(".localhost")
}

/// Name of the blocked range `ip` falls in, if any.
pub fn blocked_range(ip: &IpAddr) -> Option<&'static str> {
    match ip {
        IpAddr::V4(addr) => blocked_v4(addr),
        IpAddr::V6(addr) => {
            if let Some(mapped) = addr.to_ipv4_mapped() {
                return blocked_v4(&mapped);
            }
            blocked_v6(addr)
        }
    }
}

fn blocked_v4(addr: &Ipv4Addr) -> Option<&'static str> {
    let octets = addr.octets();
    if addr.is_loopback() {
        Some("loopback")
    } else if addr.is_private() {
        Some("private")
    } else if *addr == Ipv4Addr::new(169, 254, 169, 254) {
        Some("cloud metadata")
    } else if addr.is_link_local() {
        Some("link-local")
    } else if octets[0] == 100 && (octets[1] & 0xc0) == 64 {
        Some("shared (CGNAT)")
    } else if addr.is_unspecified() {
        Some("unspecified")
    } else if addr.is_broadcast() {
        Some("broadcast")
    } else if addr.is_multicast() {
        Some("multicast")
    } else {
        None
    }
}

fn blocked_v6(addr: &Ipv6Addr) -> Option<&'static str> {
    let first = addr.segments()[0];
    if addr.is_loopback() {
        Some("loopback")
    } else if addr.is_unspecified() {
        Some("unspecified")
    } else if (first & 0xfe00) == 0xfc00 {
        Some("unique-local")
    } else if (first & 0xffc0) == 0xfe80 {
        Some("link-local")
    } else if addr.is_multicast() {
        Some("multicast")
    } else {
        None
    }
}

fn host_label(url: &Url) -> String {
    url.host_str().map(normalize_host_label).unwrap_or_default()
}

/// Lowercase, strip a trailing dot and IPv6 brackets.
fn normalize_host_label(host: &str) -> String {
    let trimmed = host.trim_end_matches('.');
    let trimmed = trimmed
        .strip_prefix('[')
        .and_then(|inner| inner.strip_suffix(']'))
        .unwrap_or(trimmed);
    trimmed.to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn test_blocked_ipv4_ranges() {
        for ip in [
            "127.0.0.1",
            "127.10.0.3",
            "10.1.2.3",
            "172.16.0.1",
            "172.31.255.255",
            "192.168.1.1",
            "169.254.169.254",
            "169.254.10.10",
            "100.64.0.1",
            "0.0.0.0",
            "255.255.255.255",
            "224.0.0.1",
        ] {
            let ip: IpAddr = ip.parse().unwrap();
            assert!(blocked_range(&ip).is_some(), "{ip} should be blocked");
        }
    }

    #[test]
    fn test_public_addresses_allowed() {
        for ip in ["8.8.8.8", "172.32.0.1", "100.128.0.1", "2606:4700::1111"] {
            let ip: IpAddr = ip.parse().unwrap();
            assert_eq!(blocked_range(&ip), None, "{ip} should be allowed");
        }
    }

    #[test]
    fn test_blocked_ipv6_ranges() {
        for ip in [
            "::1",
            "::",
            "fd00::1",
            "fe80::1",
            "ff02::1",
            "::ffff:127.0.0.1",
            "::ffff:10.0.0.1",
        ] {
            let ip: IpAddr = ip.parse().unwrap();
            assert!(blocked_range(&ip).is_some(), "{ip} should be blocked");
        }
    }

    #[test]
    fn test_metadata_reason() {
        let ip: IpAddr = "169.254.169.254".parse().unwrap();
        assert_eq!(blocked_range(&ip), Some("cloud metadata"));
    }

    #[test]
    fn test_check_url_literal_loopback() {
        let err = check_url(&url("http://127.0.0.1:8080/x"), false).unwrap_err();
        assert!(err.reason.contains("loopback"), "{}", err.reason);
        assert_eq!(check_url(&url("http://127.0.0.1:8080/x"), true), Ok(None));
        assert!(check_url(&url("http://[::1]/"), false).is_err());
    }

    #[test]
    fn test_check_url_hostnames() {
        assert!(check_url(&url("http://localhost/"), false).is_err());
        assert!(check_url(&url("http://api.localhost/"), false).is_err());
        assert!(check_url(&url("http://LOCALHOST./"), false).is_err());
        assert!(check_url(&url("http://metadata.google.internal/"), false).is_err());
        assert_eq!(
            check_url(&url("https://api.example.com/"), false),
            Ok(Some("api.example.com".to_string()))
        );
        assert_eq!(
            check_url(&url("http://localhost/"), true),
            Ok(Some("localhost".to_string()))
        );
    }

    #[test]
    fn test_check_url_scheme_and_credentials() {
        assert!(check_url(&url("ftp://example.com/"), false).is_err());
        assert!(check_url(&url("file:///etc/passwd"), true).is_err());
        assert!(check_url(&url("https://user:pw@example.com/"), false).is_err());
    }
}
