//! Destination descriptors and the key digest that groups them.

use md5::{Digest, Md5};
use std::fmt;
use std::net::IpAddr;

use crate::domain::rule::{CongestionScheme, Rule};

/// The upstream a request is about to connect to.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Destination {
    /// Origin host name, when known.
    pub host: Option<String>,
    /// Resolved origin address, when known.
    pub ip: Option<IpAddr>,
    /// Origin port.
    pub port: u16,
    /// Request path, used for prefix rules.
    pub path: String,
}

impl Destination {
    /// A destination identified by host name.
    pub fn host(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: Some(host.into()),
            port,
            ..Self::default()
        }
    }

    /// A destination identified only by address.
    pub fn ip(ip: IpAddr, port: u16) -> Self {
        Self {
            ip: Some(ip),
            port,
            ..Self::default()
        }
    }

    /// Attach the resolved origin address.
    pub fn with_ip(mut self, ip: IpAddr) -> Self {
        self.ip = Some(ip);
        self
    }

    /// Attach the request path.
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    /// Whether there is a host name or an address to key an entry on.
    pub fn is_identified(&self) -> bool {
        self.ip.is_some() || self.host.as_deref().is_some_and(|h| !h.is_empty())
    }
}

/// 64-bit identity of a congestion entry.
///
/// Requests that must share congestion state always derive the same key: the
/// same bytes are hashed in the same order for a given rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DestinationKey(pub u64);

impl fmt::Display for DestinationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Derive the entry key for a destination governed by `rule`.
///
/// `PerHost` rules hash the host name when one is known; everything else hashes
/// the address octets, or the host name when no address was resolved. The
/// rule's port and prefix are appended when present.
pub fn derive_key(host: Option<&str>, ip: Option<IpAddr>, rule: &Rule) -> DestinationKey {
    let host = host.filter(|h| !h.is_empty());
    let by_host = match (rule.scheme, host, ip) {
        (CongestionScheme::PerHost, Some(h), _) => Some(h),
        (CongestionScheme::PerIp, Some(h), None) => Some(h),
        _ => None,
    };
    digest(by_host, ip, rule.port, rule.prefix.as_deref())
}

/// Derive the key used by the `host=` / `ip=` control commands.
///
/// Uses the host when given, the address otherwise, and never a port.
pub fn control_key(host: Option<&str>, ip: Option<IpAddr>, prefix: Option<&str>) -> DestinationKey {
    digest(host.filter(|h| !h.is_empty()), ip, None, prefix)
}

fn digest(
    host: Option<&str>,
    ip: Option<IpAddr>,
    port: Option<u16>,
    prefix: Option<&str>,
) -> DestinationKey {
    let mut hasher = Md5::new();
    match (host, ip) {
        (Some(h), _) => hasher.update(h.as_bytes()),
        (None, Some(IpAddr::V4(v4))) => hasher.update(v4.octets()),
        (None, Some(IpAddr::V6(v6))) => hasher.update(v6.octets()),
        (None, None) => {}
    }
    if let Some(port) = port {
        hasher.update(port.to_be_bytes());
    }
    if let Some(prefix) = prefix {
        hasher.update(prefix.as_bytes());
    }
    let out = hasher.finalize();

    // fold the 128-bit digest into 64 bits
    let mut lo = [0u8; 8];
    let mut hi = [0u8; 8];
    lo.copy_from_slice(&out[..8]);
    hi.copy_from_slice(&out[8..]);
    DestinationKey(u64::from_le_bytes(lo) ^ u64::from_le_bytes(hi))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::rule::{DestPattern, RuleDefaults};

    fn rule(scheme: CongestionScheme) -> Rule {
        let mut r = Rule::with_defaults(1, DestPattern::Domain("example.com".into()), &RuleDefaults::default());
        r.scheme = scheme;
        r
    }

    #[test]
    fn per_ip_ignores_host_name() {
        let r = rule(CongestionScheme::PerIp);
        let ip = "192.0.2.7".parse().ok();
        assert_eq!(
            derive_key(Some("a.example.com"), ip, &r),
            derive_key(Some("b.example.com"), ip, &r)
        );
    }

    #[test]
    fn per_ip_without_address_keys_on_host() {
        let r = rule(CongestionScheme::PerIp);
        assert_ne!(
            derive_key(Some("a.example.com"), None, &r),
            derive_key(Some("b.example.com"), None, &r)
        );
        assert_eq!(
            derive_key(Some("a.example.com"), None, &r),
            derive_key(Some("a.example.com"), None, &rule(CongestionScheme::PerHost))
        );
        assert!(!Destination::host("", 80).is_identified());
        assert!(Destination::host("a.example.com", 80).is_identified());
    }

    #[test]
    fn per_host_falls_back_to_ip() {
        let r = rule(CongestionScheme::PerHost);
        let ip = "192.0.2.7".parse().ok();
        assert_ne!(
            derive_key(Some("a.example.com"), ip, &r),
            derive_key(Some("b.example.com"), ip, &r)
        );
        assert_eq!(derive_key(None, ip, &r), derive_key(Some(""), ip, &r));
    }

    #[test]
    fn port_and_prefix_change_the_key() {
        let mut r = rule(CongestionScheme::PerHost);
        let base = derive_key(Some("a.example.com"), None, &r);
        r.port = Some(8080);
        let with_port = derive_key(Some("a.example.com"), None, &r);
        r.prefix = Some("/api".into());
        let with_both = derive_key(Some("a.example.com"), None, &r);
        assert_ne!(base, with_port);
        assert_ne!(with_port, with_both);
    }

    #[test]
    fn control_key_matches_portless_entries() {
        let mut r = rule(CongestionScheme::PerHost);
        r.prefix = Some("/api".into());
        assert_eq!(
            derive_key(Some("a.example.com"), None, &r),
            control_key(Some("a.example.com"), None, Some("/api"))
        );
    }
}
