//! Event-driven detection over OS file notifications

use std::path::Path;

use notify::event::ModifyKind;
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use regex::Regex;
use tracing::{debug, warn};

use super::{ArmGate, ChangeCallback, ChangeKind, ChangeNotice};
use crate::error::DetectorError;

/// Map a notification to a change kind, or `None` when it is irrelevant
/// (access, metadata-only, or outside the watch pattern).
pub fn qualifies(kind: &EventKind, path: &Path, pattern: &Regex) -> Option<ChangeKind> {
    let change = match kind {
        EventKind::Create(_) => ChangeKind::Created,
        EventKind::Modify(ModifyKind::Name(_)) => ChangeKind::Renamed,
        EventKind::Modify(ModifyKind::Metadata(_)) => return None,
        EventKind::Modify(_) | EventKind::Any => ChangeKind::Modified,
        EventKind::Remove(_) => ChangeKind::Removed,
        EventKind::Access(_) | EventKind::Other => return None,
    };

    if pattern.is_match(&path.to_string_lossy()) {
        Some(change)
    } else {
        None
    }
}

/// Non-recursive notify watcher on the plugin directory
pub(super) struct EventWatcher {
    // Dropping the watcher unsubscribes.
    _watcher: RecommendedWatcher,
}

impl EventWatcher {
    pub(super) fn start(
        dir: &Path,
        pattern: Regex,
        gate: ArmGate,
        callback: ChangeCallback,
    ) -> Result<Self, DetectorError> {
        let mut watcher = RecommendedWatcher::new(
            move |result: Result<Event, notify::Error>| {
                let event = match result {
                    Ok(event) => event,
                    Err(e) => {
                        warn!("File watch error: {}", e);
                        return;
                    }
                };

                for path in &event.paths {
                    let Some(kind) = qualifies(&event.kind, path, &pattern) else {
                        continue;
                    };
                    if gate.try_fire() {
                        callback(ChangeNotice::new(kind, path.clone()));
                    } else {
                        debug!("Ignoring {:?} on {:?} while disarmed", kind, path);
                    }
                    return;
                }
            },
            Config::default(),
        )?;

        watcher.watch(dir, RecursiveMode::NonRecursive)?;
        Ok(Self { _watcher: watcher })
    }
}
