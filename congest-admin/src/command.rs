//! Operator commands and their one-line confirmations.

use congest_core::{CongestError, CongestionService, DestinationKey, Result, Ticket};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use crate::listing::MAX_VERBOSITY;

/// Which entries a removal targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// Every entry.
    All,
    /// The entry with this key.
    Key(DestinationKey),
    /// The per-host entry for a host name, optionally narrowed by prefix.
    Host {
        /// Host name.
        host: String,
        /// Path prefix, with its leading `/`.
        prefix: Option<String>,
    },
    /// The per-ip entry for an address, optionally narrowed by prefix.
    Ip {
        /// Origin address.
        ip: IpAddr,
        /// Path prefix, with its leading `/`.
        prefix: Option<String>,
    },
}

impl FromStr for Target {
    type Err = CongestError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("all") {
            return Ok(Target::All);
        }
        let invalid = || CongestError::InvalidCommand(s.to_string());
        let (label, value) = s.split_once('=').ok_or_else(invalid)?;
        if value.is_empty() {
            return Err(invalid());
        }
        match label.to_ascii_lowercase().as_str() {
            "key" => value
                .parse::<u64>()
                .map(|k| Target::Key(DestinationKey(k)))
                .map_err(|_| invalid()),
            "host" => {
                let (host, prefix) = split_prefix(value);
                Ok(Target::Host {
                    host: host.to_string(),
                    prefix,
                })
            }
            "ip" => {
                let (addr, prefix) = split_prefix(value);
                let ip = addr.parse().map_err(|_| invalid())?;
                Ok(Target::Ip { ip, prefix })
            }
            _ => Err(invalid()),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::All => f.write_str("all"),
            Target::Key(key) => write!(f, "key={}", key),
            Target::Host { host, prefix } => write!(f, "host={}{}", host, prefix.as_deref().unwrap_or("")),
            Target::Ip { ip, prefix } => write!(f, "ip={}{}", ip, prefix.as_deref().unwrap_or("")),
        }
    }
}

/// One line of the control protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    /// `list [all] [<verbosity>]`: congested entries, or every entry.
    List {
        /// Include live entries.
        all: bool,
        /// Listing verbosity, 0 through 4.
        verbosity: u8,
    },
    /// `clear <target>`: drop entries.
    Clear(Target),
    /// `alive <target>`: clear the congested state.
    Alive(Target),
}

impl FromStr for ControlCommand {
    type Err = CongestError;

    fn from_str(s: &str) -> Result<Self> {
        let mut words = s.split_whitespace();
        let invalid = || CongestError::InvalidCommand(s.trim().to_string());
        let verb = words.next().ok_or_else(invalid)?.to_ascii_lowercase();
        let command = match verb.as_str() {
            "list" => {
                let mut all = false;
                let mut verbosity = 0;
                for word in words.by_ref() {
                    if word.eq_ignore_ascii_case("all") {
                        all = true;
                    } else {
                        verbosity = word
                            .parse::<u8>()
                            .ok()
                            .filter(|v| *v <= MAX_VERBOSITY)
                            .ok_or_else(invalid)?;
                    }
                }
                ControlCommand::List { all, verbosity }
            }
            "clear" => ControlCommand::Clear(words.next().ok_or_else(invalid)?.parse()?),
            "alive" => ControlCommand::Alive(words.next().ok_or_else(invalid)?.parse()?),
            _ => return Err(invalid()),
        };
        if words.next().is_some() {
            return Err(invalid());
        }
        Ok(command)
    }
}

/// `name/prefix` into the name and `/prefix`.
fn split_prefix(value: &str) -> (&str, Option<String>) {
    match value.find('/') {
        Some(at) if at + 1 < value.len() => (&value[..at], Some(value[at..].to_string())),
        Some(at) => (&value[..at], None),
        None => (value, None),
    }
}

/// Clear the entries selected by `target` and describe the outcome.
pub fn remove(service: &CongestionService, target: &Target) -> String {
    match target {
        Target::All => {
            let summary = service.remove_all();
            if summary.deferred_partitions == 0 {
                format!("all: {} entries removed", summary.removed_now)
            } else {
                format!(
                    "all: {} entries removed, {} partitions queued",
                    summary.removed_now, summary.deferred_partitions
                )
            }
        }
        Target::Key(key) => confirm(target, service.remove_key(*key), "removed"),
        Target::Host { host, prefix } => {
            confirm(target, service.remove_host(host, prefix.as_deref()), "removed")
        }
        Target::Ip { ip, prefix } => {
            confirm(target, service.remove_ip(*ip, prefix.as_deref()), "removed")
        }
    }
}

/// Mark the entry selected by `target` live again.
pub fn alive(service: &CongestionService, target: &Target) -> Result<String> {
    let key = match target {
        Target::All => return Err(CongestError::InvalidCommand(target.to_string())),
        Target::Key(key) => *key,
        Target::Host { host, prefix } => congest_core::control_key(Some(host), None, prefix.as_deref()),
        Target::Ip { ip, prefix } => congest_core::control_key(None, Some(*ip), prefix.as_deref()),
    };
    Ok(confirm(target, service.go_alive_key(key), "marked alive"))
}

fn confirm(target: &Target, mut ticket: Ticket<bool>, done: &str) -> String {
    if ticket.is_deferred() {
        return format!("{}: queued", target);
    }
    match ticket.try_take() {
        Some(true) => format!("{}: {}", target, done),
        _ => format!("{}: no such entry", target),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use congest_core::{Destination, Rule, RuleDefaults, RuleSet};
    use congest_core::{CongestionScheme, DestPattern};

    #[test]
    fn targets_parse() {
        assert_eq!("all".parse::<Target>().unwrap(), Target::All);
        assert_eq!("key=42".parse::<Target>().unwrap(), Target::Key(DestinationKey(42)));
        assert_eq!(
            "host=origin.example/api/v1".parse::<Target>().unwrap(),
            Target::Host {
                host: "origin.example".into(),
                prefix: Some("/api/v1".into())
            }
        );
        assert_eq!(
            "ip=10.0.0.1".parse::<Target>().unwrap(),
            Target::Ip {
                ip: "10.0.0.1".parse().unwrap(),
                prefix: None
            }
        );
        assert!("key=abc".parse::<Target>().is_err());
        assert!("ip=not-an-ip".parse::<Target>().is_err());
        assert!("bogus".parse::<Target>().is_err());
        assert!("host=".parse::<Target>().is_err());
    }

    #[test]
    fn commands_parse() {
        assert_eq!(
            "list".parse::<ControlCommand>().unwrap(),
            ControlCommand::List { all: false, verbosity: 0 }
        );
        assert_eq!(
            "LIST all 3".parse::<ControlCommand>().unwrap(),
            ControlCommand::List { all: true, verbosity: 3 }
        );
        assert_eq!(
            "clear key=7".parse::<ControlCommand>().unwrap(),
            ControlCommand::Clear(Target::Key(DestinationKey(7)))
        );
        assert!("list 9".parse::<ControlCommand>().is_err());
        assert!("clear".parse::<ControlCommand>().is_err());
        assert!("alive host=a extra".parse::<ControlCommand>().is_err());
        assert!("".parse::<ControlCommand>().is_err());
    }

    #[test]
    fn removal_confirms_in_one_line() {
        let mut rule = Rule::with_defaults(1, DestPattern::Host("origin".into()), &RuleDefaults::default());
        rule.scheme = CongestionScheme::PerHost;
        let service = CongestionService::new(RuleSet::new(vec![rule]), 4);
        service.report_connection_opened(&Destination::host("origin", 80));

        let target: Target = "host=origin".parse().unwrap();
        assert_eq!(remove(&service, &target), "host=origin: removed");
        assert_eq!(remove(&service, &target), "host=origin: no such entry");
        assert_eq!(remove(&service, &Target::All), "all: 0 entries removed");
        assert!(alive(&service, &Target::All).is_err());
    }
}
