//! Congestion control rules.
//!
//! A [`Rule`] is one record of the rule file after validation. Rules are
//! immutable and shared behind an `Arc`: every destination entry that resolved
//! to a rule keeps its own reference, so a reload never frees a rule that is
//! still governing live traffic.

use regex::Regex;
use std::fmt;
use std::net::IpAddr;

/// How destinations governed by a rule are grouped into entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CongestionScheme {
    /// One entry per origin IP address.
    PerIp,
    /// One entry per origin host name (falls back to the IP when no name is known).
    PerHost,
}

impl CongestionScheme {
    /// Parse a `congestion_scheme` value. Unknown values fall back to `PerIp`.
    pub fn from_label(value: &str) -> Self {
        if value.eq_ignore_ascii_case("per_host") {
            CongestionScheme::PerHost
        } else {
            CongestionScheme::PerIp
        }
    }

    /// The label used in the rule file and in listings.
    pub fn as_label(&self) -> &'static str {
        match self {
            CongestionScheme::PerIp => "per_ip",
            CongestionScheme::PerHost => "per_host",
        }
    }
}

/// The destination half of a rule: which origins it applies to.
#[derive(Debug, Clone)]
pub enum DestPattern {
    /// `dest_host`: exact, case-insensitive host name.
    Host(String),
    /// `dest_domain`: the domain itself or any sub-domain of it.
    Domain(String),
    /// `dest_ip`: a single address (`lo == hi`) or an inclusive range.
    IpRange {
        /// Lowest matching address.
        lo: IpAddr,
        /// Highest matching address.
        hi: IpAddr,
    },
    /// `host_regex`: host names matching a regular expression.
    HostRegex(Regex),
}

impl DestPattern {
    /// Whether a destination with the given host name and address is covered.
    pub fn matches(&self, host: Option<&str>, ip: Option<IpAddr>) -> bool {
        match self {
            DestPattern::Host(name) => host.is_some_and(|h| h.eq_ignore_ascii_case(name)),
            DestPattern::Domain(domain) => host.is_some_and(|h| domain_matches(h, domain)),
            DestPattern::IpRange { lo, hi } => ip.is_some_and(|addr| ip_in_range(addr, *lo, *hi)),
            DestPattern::HostRegex(re) => host.is_some_and(|h| re.is_match(h)),
        }
    }

    /// The rule file label for this pattern kind.
    pub fn label(&self) -> &'static str {
        match self {
            DestPattern::Host(_) => "dest_host",
            DestPattern::Domain(_) => "dest_domain",
            DestPattern::IpRange { .. } => "dest_ip",
            DestPattern::HostRegex(_) => "host_regex",
        }
    }

    /// The rule file value for this pattern.
    pub fn value(&self) -> String {
        match self {
            DestPattern::Host(name) => name.clone(),
            DestPattern::Domain(domain) => domain.clone(),
            DestPattern::IpRange { lo, hi } if lo == hi => lo.to_string(),
            DestPattern::IpRange { lo, hi } => format!("{}-{}", lo, hi),
            DestPattern::HostRegex(re) => re.as_str().to_string(),
        }
    }
}

impl PartialEq for DestPattern {
    fn eq(&self, other: &Self) -> bool {
        self.label() == other.label() && self.value() == other.value()
    }
}

fn domain_matches(host: &str, domain: &str) -> bool {
    let domain = domain.trim_start_matches('.');
    if host.len() < domain.len() {
        return false;
    }
    let split = host.len() - domain.len();
    if !host.is_char_boundary(split) || !host[split..].eq_ignore_ascii_case(domain) {
        return false;
    }
    split == 0 || host.as_bytes()[split - 1] == b'.'
}

fn ip_in_range(addr: IpAddr, lo: IpAddr, hi: IpAddr) -> bool {
    match (addr, lo, hi) {
        (IpAddr::V4(a), IpAddr::V4(l), IpAddr::V4(h)) => l <= a && a <= h,
        (IpAddr::V6(a), IpAddr::V6(l), IpAddr::V6(h)) => l <= a && a <= h,
        _ => false,
    }
}

/// Values applied to every field a rule record leaves unset.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleDefaults {
    /// Default grouping scheme.
    pub scheme: CongestionScheme,
    /// Failures within the window that mark a destination congested (`None` disables).
    pub max_connection_failures: Option<u32>,
    /// Failure counting window, seconds.
    pub fail_window: u32,
    /// Seconds before the proxy itself retries a congested origin.
    pub proxy_retry_interval: u32,
    /// Seconds a client is told to wait before retrying a congested origin.
    pub client_wait_interval: u32,
    /// Upper bound of the random jitter added to the client wait, seconds.
    pub wait_interval_alpha: u32,
    /// Origin connect timeout while live, seconds.
    pub live_os_conn_timeout: u32,
    /// Origin connect retries while live.
    pub live_os_conn_retries: u32,
    /// Origin connect timeout while congested, seconds.
    pub dead_os_conn_timeout: u32,
    /// Origin connect retries while congested.
    pub dead_os_conn_retries: u32,
    /// Concurrent connection cap (`None` is unlimited).
    pub max_connection: Option<u32>,
    /// Error page returned with denials.
    pub error_page: Option<String>,
}

impl Default for RuleDefaults {
    fn default() -> Self {
        Self {
            scheme: CongestionScheme::PerIp,
            max_connection_failures: Some(5),
            fail_window: 120,
            proxy_retry_interval: 10,
            client_wait_interval: 300,
            wait_interval_alpha: 30,
            live_os_conn_timeout: 60,
            live_os_conn_retries: 2,
            dead_os_conn_timeout: 15,
            dead_os_conn_retries: 1,
            max_connection: None,
            error_page: None,
        }
    }
}

/// A validated congestion control rule.
#[derive(Debug, Clone, PartialEq)]
pub struct Rule {
    /// Declaration line in the rule file; lower lines win rank ties.
    pub line: usize,
    /// Which origins the rule governs.
    pub pattern: DestPattern,
    /// Port restriction.
    pub port: Option<u16>,
    /// Request path prefix restriction.
    pub prefix: Option<String>,
    /// Entry grouping scheme.
    pub scheme: CongestionScheme,
    /// Failure threshold; `None` disables failure based congestion.
    pub max_connection_failures: Option<u32>,
    /// Failure counting window, seconds.
    pub fail_window: u32,
    /// Seconds before the proxy itself retries a congested origin.
    pub proxy_retry_interval: u32,
    /// Seconds a client is told to wait before retrying.
    pub client_wait_interval: u32,
    /// Upper bound of the jitter added to the client wait, seconds.
    pub wait_interval_alpha: u32,
    /// Origin connect timeout while live, seconds.
    pub live_os_conn_timeout: u32,
    /// Origin connect retries while live.
    pub live_os_conn_retries: u32,
    /// Origin connect timeout while congested, seconds.
    pub dead_os_conn_timeout: u32,
    /// Origin connect retries while congested.
    pub dead_os_conn_retries: u32,
    /// Concurrent connection cap; `None` is unlimited, `Some(0)` blocks everything.
    pub max_connection: Option<u32>,
    /// Error page handed back with denials.
    pub error_page: Option<String>,
}

impl Rule {
    /// Build a rule for `pattern` with every tunable taken from `defaults`.
    pub fn with_defaults(line: usize, pattern: DestPattern, defaults: &RuleDefaults) -> Self {
        Self {
            line,
            pattern,
            port: None,
            prefix: None,
            scheme: defaults.scheme,
            max_connection_failures: defaults.max_connection_failures,
            fail_window: defaults.fail_window,
            proxy_retry_interval: defaults.proxy_retry_interval,
            client_wait_interval: defaults.client_wait_interval,
            wait_interval_alpha: defaults.wait_interval_alpha,
            live_os_conn_timeout: defaults.live_os_conn_timeout,
            live_os_conn_retries: defaults.live_os_conn_retries,
            dead_os_conn_timeout: defaults.dead_os_conn_timeout,
            dead_os_conn_retries: defaults.dead_os_conn_retries,
            max_connection: defaults.max_connection,
            error_page: defaults.error_page.clone(),
        }
    }

    /// Specificity of the rule: +1 for a prefix, +2 for a port.
    pub fn rank(&self) -> u8 {
        let mut rank = 0;
        if self.prefix.is_some() {
            rank += 1;
        }
        if self.port.is_some() {
            rank += 2;
        }
        rank
    }

    /// Whether a request path falls under this rule's prefix.
    ///
    /// Leading slashes are ignored on both sides.
    pub fn prefix_matches_path(&self, path: &str) -> bool {
        match &self.prefix {
            None => true,
            Some(prefix) => path
                .trim_start_matches('/')
                .starts_with(prefix.trim_start_matches('/')),
        }
    }
}

/// Write a value, double-quoting it when it contains whitespace.
fn write_value(f: &mut fmt::Formatter<'_>, label: &str, value: &str) -> fmt::Result {
    if value.chars().any(char::is_whitespace) {
        write!(f, " {}=\"{}\"", label, value)
    } else {
        write!(f, " {}={}", label, value)
    }
}

fn signed(value: Option<u32>) -> i64 {
    value.map_or(-1, i64::from)
}

/// Canonical rule file form; parsing it yields an equivalent rule.
impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}=", self.pattern.label())?;
        let value = self.pattern.value();
        if value.chars().any(char::is_whitespace) {
            write!(f, "\"{}\"", value)?;
        } else {
            f.write_str(&value)?;
        }
        if let Some(port) = self.port {
            write!(f, " port={}", port)?;
        }
        if let Some(prefix) = &self.prefix {
            write_value(f, "prefix", prefix)?;
        }
        write!(f, " congestion_scheme={}", self.scheme.as_label())?;
        write!(f, " max_connection_failures={}", signed(self.max_connection_failures))?;
        write!(f, " fail_window={}", self.fail_window)?;
        write!(f, " proxy_retry_interval={}", self.proxy_retry_interval)?;
        write!(f, " client_wait_interval={}", self.client_wait_interval)?;
        write!(f, " wait_interval_alpha={}", self.wait_interval_alpha)?;
        write!(f, " live_os_conn_timeout={}", self.live_os_conn_timeout)?;
        write!(f, " live_os_conn_retries={}", self.live_os_conn_retries)?;
        write!(f, " dead_os_conn_timeout={}", self.dead_os_conn_timeout)?;
        write!(f, " dead_os_conn_retries={}", self.dead_os_conn_retries)?;
        write!(f, " max_connection={}", signed(self.max_connection))?;
        if let Some(page) = &self.error_page {
            write_value(f, "error_page", page)?;
        }
        Ok(())
    }
}
