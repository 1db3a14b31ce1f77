//! Rule file parsing and per-record validation.
//!
//! One record per line: whitespace separated `label=value` pairs, values
//! optionally double quoted. `#` starts a comment outside quotes. A record that
//! fails to parse is reported with its line number and skipped; the remaining
//! lines still load.

use regex::Regex;
use std::net::IpAddr;

use crate::domain::rule::{CongestionScheme, DestPattern, Rule, RuleDefaults};
use crate::error::RuleError;
use crate::history::BinCount;

/// Outcome of parsing a whole rule file.
#[derive(Debug, Default)]
pub struct ParsedRules {
    /// Valid rules in declaration order.
    pub rules: Vec<Rule>,
    /// One diagnostic per rejected record.
    pub errors: Vec<RuleError>,
}

/// Exclusive upper bound for `max_connection_failures`, the history counter range.
const FAILURE_LIMIT: i64 = 1 << (8 * std::mem::size_of::<BinCount>());

/// Parse every record in `text`.
pub fn parse_rules(text: &str, defaults: &RuleDefaults) -> ParsedRules {
    let mut parsed = ParsedRules::default();
    for (idx, line) in text.lines().enumerate() {
        let line_no = idx + 1;
        match parse_record(line_no, line, defaults) {
            Ok(Some(rule)) => parsed.rules.push(rule),
            Ok(None) => {}
            Err(err) => parsed.errors.push(err),
        }
    }
    parsed
}

/// Parse a single record; `Ok(None)` for blank and comment lines.
pub fn parse_record(line: usize, text: &str, defaults: &RuleDefaults) -> Result<Option<Rule>, RuleError> {
    let pairs = tokenize(text).map_err(|msg| RuleError::new(line, msg))?;
    if pairs.is_empty() {
        return Ok(None);
    }

    let mut pattern = None;
    let mut settings = Vec::with_capacity(pairs.len());
    for (label, value) in pairs {
        let label = label.to_ascii_lowercase();
        match label.as_str() {
            "dest_host" | "dest_domain" | "dest_ip" | "host_regex" => {
                if pattern.is_some() {
                    return Err(RuleError::new(line, "more than one destination specifier"));
                }
                pattern = Some(parse_pattern(&label, &value).map_err(|msg| RuleError::new(line, msg))?);
            }
            _ => settings.push((label, value)),
        }
    }
    let Some(pattern) = pattern else {
        return Err(RuleError::new(line, "missing destination specifier"));
    };

    let mut rule = Rule::with_defaults(line, pattern, defaults);
    for (label, value) in settings {
        apply_setting(&mut rule, &label, &value).map_err(|msg| RuleError::new(line, msg))?;
    }
    Ok(Some(rule))
}

fn parse_pattern(label: &str, value: &str) -> Result<DestPattern, String> {
    match label {
        "dest_host" => Ok(DestPattern::Host(value.to_string())),
        "dest_domain" => Ok(DestPattern::Domain(value.to_string())),
        "host_regex" => Regex::new(value)
            .map(DestPattern::HostRegex)
            .map_err(|e| format!("invalid host_regex '{}': {}", value, e)),
        _ => parse_ip_range(value),
    }
}

fn parse_ip_range(value: &str) -> Result<DestPattern, String> {
    let bad = || format!("invalid dest_ip '{}'", value);
    let (lo, hi) = match value.split_once('-') {
        Some((lo, hi)) => (lo.trim(), hi.trim()),
        None => (value, value),
    };
    let lo: IpAddr = lo.parse().map_err(|_| bad())?;
    let hi: IpAddr = hi.parse().map_err(|_| bad())?;
    if lo.is_ipv4() != hi.is_ipv4() || lo > hi {
        return Err(bad());
    }
    Ok(DestPattern::IpRange { lo, hi })
}

fn apply_setting(rule: &mut Rule, label: &str, value: &str) -> Result<(), String> {
    match label {
        "port" => {
            let port: u16 = value
                .parse()
                .map_err(|_| format!("invalid port = {}", value))?;
            rule.port = Some(port);
        }
        "prefix" => rule.prefix = Some(value.to_string()),
        "congestion_scheme" => rule.scheme = CongestionScheme::from_label(value),
        "error_page" => rule.error_page = Some(value.to_string()),
        "max_connection_failures" => {
            let n = parse_int(label, value)?;
            rule.max_connection_failures = if n == -1 {
                None
            } else if (1..FAILURE_LIMIT).contains(&n) {
                Some(n as u32)
            } else {
                return Err(format!(
                    "invalid {} = {} not in [1, {}) range",
                    label, value, FAILURE_LIMIT
                ));
            };
        }
        "max_connection" => {
            let n = parse_int(label, value)?;
            rule.max_connection = match n {
                -1 => None,
                0..=0xFFFF_FFFF => Some(n as u32),
                _ => return Err(format!("invalid {} = {}", label, value)),
            };
        }
        "fail_window" => rule.fail_window = parse_positive(label, value)?,
        "proxy_retry_interval" => rule.proxy_retry_interval = parse_positive(label, value)?,
        "client_wait_interval" => rule.client_wait_interval = parse_positive(label, value)?,
        "wait_interval_alpha" => rule.wait_interval_alpha = parse_positive(label, value)?,
        "live_os_conn_timeout" => rule.live_os_conn_timeout = parse_positive(label, value)?,
        "live_os_conn_retries" => rule.live_os_conn_retries = parse_positive(label, value)?,
        "dead_os_conn_timeout" => rule.dead_os_conn_timeout = parse_positive(label, value)?,
        "dead_os_conn_retries" => rule.dead_os_conn_retries = parse_positive(label, value)?,
        other => return Err(format!("unknown label '{}'", other)),
    }
    Ok(())
}

fn parse_int(label: &str, value: &str) -> Result<i64, String> {
    value
        .parse::<i64>()
        .map_err(|_| format!("invalid {} = {}", label, value))
}

fn parse_positive(label: &str, value: &str) -> Result<u32, String> {
    match parse_int(label, value)? {
        n @ 1..=0xFFFF_FFFF => Ok(n as u32),
        _ => Err(format!("invalid {} = {} must be greater than zero", label, value)),
    }
}

/// Split a record into `(label, value)` pairs.
fn tokenize(line: &str) -> Result<Vec<(String, String)>, String> {
    let mut pairs = Vec::new();
    let mut chars = line.chars().peekable();
    loop {
        while chars.peek().is_some_and(|c| c.is_whitespace()) {
            chars.next();
        }
        match chars.peek() {
            None | Some('#') => break,
            Some(_) => {}
        }

        let mut label = String::new();
        while let Some(&c) = chars.peek() {
            if c == '=' || c.is_whitespace() {
                break;
            }
            label.push(c);
            chars.next();
        }
        if chars.next() != Some('=') {
            return Err(format!("expected '=' after '{}'", label));
        }

        let mut value = String::new();
        if chars.peek() == Some(&'"') {
            chars.next();
            let mut closed = false;
            for c in chars.by_ref() {
                if c == '"' {
                    closed = true;
                    break;
                }
                value.push(c);
            }
            if !closed {
                return Err(format!("unterminated quote in value of '{}'", label));
            }
        } else {
            while let Some(&c) = chars.peek() {
                if c.is_whitespace() {
                    break;
                }
                value.push(c);
                chars.next();
            }
        }
        if value.is_empty() {
            return Err(format!("empty value for '{}'", label));
        }
        pairs.push((label, value));
    }
    Ok(pairs)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defaults() -> RuleDefaults {
        RuleDefaults::default()
    }

    #[test]
    fn comments_and_blank_lines_are_skipped() {
        let parsed = parse_rules("# header\n\n   \ndest_host=a.example # trailing\n", &defaults());
        assert!(parsed.errors.is_empty());
        assert_eq!(parsed.rules.len(), 1);
        assert_eq!(parsed.rules[0].line, 4);
    }

    #[test]
    fn out_of_range_failures_rejects_only_that_record() {
        let text = "dest_host=a max_connection_failures=70000\ndest_host=b max_connection_failures=3\n";
        let parsed = parse_rules(text, &defaults());
        assert_eq!(parsed.rules.len(), 1);
        assert_eq!(parsed.rules[0].max_connection_failures, Some(3));
        assert_eq!(parsed.errors.len(), 1);
        assert_eq!(parsed.errors[0].line, 1);
        assert_eq!(
            parsed.errors[0].message,
            "invalid max_connection_failures = 70000 not in [1, 65536) range"
        );
        assert_eq!(
            parsed.errors[0].to_string(),
            "line 1: invalid max_connection_failures = 70000 not in [1, 65536) range"
        );
    }

    #[test]
    fn minus_one_disables_limits() {
        let rule = parse_record(1, "dest_domain=example.com max_connection_failures=-1 max_connection=-1", &defaults())
            .ok()
            .flatten()
            .expect("rule");
        assert_eq!(rule.max_connection_failures, None);
        assert_eq!(rule.max_connection, None);
    }

    #[test]
    fn zero_connection_cap_is_kept() {
        let rule = parse_record(1, "dest_host=a max_connection=0", &defaults())
            .ok()
            .flatten()
            .expect("rule");
        assert_eq!(rule.max_connection, Some(0));
    }

    #[test]
    fn labels_are_case_insensitive_and_values_may_be_quoted() {
        let rule = parse_record(2, "DEST_HOST=a Error_Page=\"congested origin\" Port=8080", &defaults())
            .ok()
            .flatten()
            .expect("rule");
        assert_eq!(rule.error_page.as_deref(), Some("congested origin"));
        assert_eq!(rule.port, Some(8080));
    }

    #[test]
    fn record_needs_exactly_one_destination() {
        assert!(parse_record(1, "port=80", &defaults()).is_err());
        assert!(parse_record(1, "dest_host=a dest_domain=b", &defaults()).is_err());
    }

    #[test]
    fn unknown_labels_and_bad_values_fail() {
        assert!(parse_record(1, "dest_host=a frobnicate=1", &defaults()).is_err());
        assert!(parse_record(1, "dest_host=a fail_window=0", &defaults()).is_err());
        assert!(parse_record(1, "dest_host=a port=99999", &defaults()).is_err());
        assert!(parse_record(1, "dest_host=a error_page=\"open", &defaults()).is_err());
        assert!(parse_record(1, "host_regex=[", &defaults()).is_err());
    }

    #[test]
    fn ip_ranges_parse() {
        let rule = parse_record(1, "dest_ip=10.0.0.1-10.0.0.20", &defaults())
            .ok()
            .flatten()
            .expect("rule");
        assert!(rule.pattern.matches(None, "10.0.0.7".parse().ok()));
        assert!(parse_record(1, "dest_ip=10.0.0.9-10.0.0.1", &defaults()).is_err());
        assert!(parse_record(1, "dest_ip=10.0.0.1-::1", &defaults()).is_err());
    }
}
