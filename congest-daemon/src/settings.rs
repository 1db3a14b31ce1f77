//! Daemon settings read from the environment.

use congest_core::{CongestionScheme, RuleDefaults};
use std::path::PathBuf;
use std::time::Duration;

/// Everything the daemon needs besides the rule file contents.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    /// Rule file to load and watch.
    pub config_path: PathBuf,
    /// Table partitions.
    pub partitions: usize,
    /// Period of the revalidation and collection sweep.
    pub sweep_interval: Duration,
    /// Unix socket for operator commands.
    pub admin_socket: PathBuf,
    /// Defaults for fields a rule leaves unset.
    pub defaults: RuleDefaults,
    /// Listing times in local time instead of UTC.
    pub local_time: bool,
}

impl Settings {
    /// Read settings from `CONGEST_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Read settings through `lookup`, falling back to defaults for missing or
    /// unparsable values.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let base = Self::default();
        let mut defaults = RuleDefaults::default();
        if let Some(scheme) = lookup("CONGEST_DEFAULT_SCHEME") {
            defaults.scheme = CongestionScheme::from_label(&scheme);
        }
        Self {
            config_path: lookup("CONGEST_CONFIG")
                .map(PathBuf::from)
                .unwrap_or(base.config_path),

            partitions: lookup("CONGEST_PARTITIONS")
                .and_then(|v| v.parse().ok())
                .filter(|n: &usize| *n > 0)
                .unwrap_or(base.partitions),

            sweep_interval: lookup("CONGEST_SWEEP_INTERVAL_MS")
                .and_then(|v| v.parse().ok())
                .filter(|ms: &u64| *ms > 0)
                .map(Duration::from_millis)
                .unwrap_or(base.sweep_interval),

            admin_socket: lookup("CONGEST_ADMIN_SOCKET")
                .map(PathBuf::from)
                .unwrap_or(base.admin_socket),

            defaults,

            local_time: lookup("CONGEST_LOCALTIME")
                .map(|v| v.to_lowercase() == "true" || v == "1")
                .unwrap_or(base.local_time),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            config_path: PathBuf::from("config/congestion.config"),
            partitions: congest_core::table::DEFAULT_PARTITIONS,
            sweep_interval: Duration::from_millis(1000),
            admin_socket: PathBuf::from("/tmp/congest-admin.sock"),
            defaults: RuleDefaults::default(),
            local_time: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn missing_variables_use_defaults() {
        assert_eq!(Settings::from_lookup(|_| None), Settings::default());
    }

    #[test]
    fn variables_override_and_bad_values_fall_back() {
        let vars: HashMap<&str, &str> = [
            ("CONGEST_CONFIG", "/etc/congest/rules.config"),
            ("CONGEST_PARTITIONS", "0"),
            ("CONGEST_SWEEP_INTERVAL_MS", "250"),
            ("CONGEST_DEFAULT_SCHEME", "per_host"),
            ("CONGEST_LOCALTIME", "TRUE"),
        ]
        .into_iter()
        .collect();
        let settings = Settings::from_lookup(|name| vars.get(name).map(|v| v.to_string()));
        assert_eq!(settings.config_path, PathBuf::from("/etc/congest/rules.config"));
        assert_eq!(settings.partitions, congest_core::table::DEFAULT_PARTITIONS);
        assert_eq!(settings.sweep_interval, Duration::from_millis(250));
        assert_eq!(settings.defaults.scheme, CongestionScheme::PerHost);
        assert!(settings.local_time);
    }
}
