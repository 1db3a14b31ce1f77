//! Notify-based rule file hot-reload watcher.
//!
//! - Watches the directory holding the rule file, so editors that replace the
//!   file by rename are still seen.
//! - On create/modify events for the rule file, reloads it and installs the
//!   new rule set; a file that cannot be read leaves the old rules in place.

use congest_core::{load_rules_from_file, CongestError, RuleDefaults, RuleSet, SharedCongestionService};
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Watch the rule file for changes and reload the service on each one.
pub async fn watch_rule_file(
    path: PathBuf,
    defaults: RuleDefaults,
    service: SharedCongestionService,
) -> Result<(), notify::Error> {
    // bridges the watcher's callback thread to this task
    let (tx, mut rx) = mpsc::channel(16);

    let mut watcher = RecommendedWatcher::new(
        move |res: Result<Event, notify::Error>| {
            if let Err(e) = tx.blocking_send(res) {
                debug!("Failed to send rule file event: {}", e);
            }
        },
        notify::Config::default(),
    )?;

    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    watcher.watch(&dir, RecursiveMode::NonRecursive)?;
    info!("Watching rule file for changes: {}", path.display());

    while let Some(res) = rx.recv().await {
        match res {
            Ok(event) => {
                if should_reload(&event, &path) {
                    info!("Rule file change detected ({:?}), reloading", event.kind);
                    reload_rules(&path, &defaults, &service);
                } else {
                    debug!("Ignoring filesystem event: {:?}", event.kind);
                }
            }
            Err(e) => error!("Error watching rule file: {}", e),
        }
    }

    warn!("Rule file watcher is shutting down.");
    Ok(())
}

fn should_reload(event: &Event, path: &Path) -> bool {
    let relevant = matches!(
        event.kind,
        notify::EventKind::Modify(_) | notify::EventKind::Create(_)
    );
    relevant && event.paths.iter().any(|p| p.file_name() == path.file_name())
}

/// Load the rule file and install it. Returns the new generation, or `None`
/// if the file could not be read and the previous rules stay active.
pub fn reload_rules(path: &Path, defaults: &RuleDefaults, service: &SharedCongestionService) -> Option<u64> {
    match load_rules_from_file(path, defaults) {
        Ok(parsed) => {
            if !parsed.errors.is_empty() {
                warn!(
                    "{} rule record(s) in '{}' rejected",
                    parsed.errors.len(),
                    path.display()
                );
            }
            Some(service.reload(RuleSet::new(parsed.rules)))
        }
        Err(CongestError::Io { path, source }) => {
            error!("Failed to read rule file '{}': {}. Keeping old rules.", path, source);
            None
        }
        Err(e) => {
            error!("Unexpected error while reloading rules: {}. Keeping old rules.", e);
            None
        }
    }
}
