//! Change detection for the plugin directory
//!
//! Two mutually exclusive strategies raise a "changed" signal:
//! OS file notifications ([`watcher`]) or periodic fingerprinting
//! ([`poller`]). Both share an [`ArmGate`]: the first qualifying change
//! closes the gate, and nothing else is reported until the supervisor
//! re-arms it after the resulting restart attempt.

mod fingerprint;
mod poller;
mod watcher;

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use regex::Regex;
use tracing::debug;

use crate::error::DetectorError;

pub use fingerprint::{WatchState, fingerprint};
pub use watcher::qualifies;

use poller::Poller;
use watcher::EventWatcher;

/// Which strategy the detector runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectorMode {
    Events,
    Polling(Duration),
}

impl DetectorMode {
    /// A zero interval selects event notifications.
    pub fn from_interval(interval: Duration) -> Self {
        if interval.is_zero() {
            DetectorMode::Events
        } else {
            DetectorMode::Polling(interval)
        }
    }
}

/// Polling knobs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollSettings {
    /// Skip rebuilding the fingerprint while the directory's access time is
    /// unchanged. Off by default: relatime/noatime mounts make it unreliable.
    pub trust_access_time: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Created,
    Modified,
    Removed,
    Renamed,
    /// Fingerprint mismatch found by the poller
    Polled,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChangeKind::Created => "Created",
            ChangeKind::Modified => "Modified",
            ChangeKind::Removed => "Removed",
            ChangeKind::Renamed => "Renamed",
            ChangeKind::Polled => "Polled",
        };
        f.write_str(name)
    }
}

/// What triggered a restart
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeNotice {
    pub kind: ChangeKind,
    /// Changed file, or the watched directory for polled changes
    pub path: PathBuf,
}

impl ChangeNotice {
    pub fn new(kind: ChangeKind, path: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            path: path.into(),
        }
    }

    /// Status line announcing the change
    pub fn describe(&self) -> String {
        match self.kind {
            ChangeKind::Polled => format!("Changes detected in {}", self.path.display()),
            kind => {
                let name = self
                    .path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                format!("{} detected to {} ({})", kind, name, self.path.display())
            }
        }
    }
}

/// Receives change notices. Runs on notify's or tokio's threads and must
/// only hand the notice off.
pub type ChangeCallback = Arc<dyn Fn(ChangeNotice) + Send + Sync>;

/// One-shot gate shared by the detector callbacks.
#[derive(Debug, Clone, Default)]
pub struct ArmGate(Arc<AtomicBool>);

impl ArmGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Close the gate if it is open. Only the caller that closed it may
    /// report a change.
    pub fn try_fire(&self) -> bool {
        self.0
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn rearm(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn disarm(&self) {
        self.0.store(false, Ordering::Release);
    }

    pub fn is_armed(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

enum Active {
    /// Held only to keep the OS watch alive
    Events { _watcher: EventWatcher },
    Polling(Poller),
}

/// Watches one directory in one mode.
#[derive(Default)]
pub struct ChangeDetector {
    gate: ArmGate,
    active: Option<Active>,
}

impl ChangeDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start watching `dir` and open the gate. Calling this on an already
    /// running detector only re-arms it.
    pub fn arm(
        &mut self,
        dir: &Path,
        pattern: Regex,
        mode: DetectorMode,
        settings: PollSettings,
        callback: ChangeCallback,
    ) -> Result<(), DetectorError> {
        if self.active.is_some() {
            self.rearm();
            return Ok(());
        }
        if !dir.is_dir() {
            return Err(DetectorError::DirectoryMissing(dir.to_path_buf()));
        }

        let active = match mode {
            DetectorMode::Events => Active::Events {
                _watcher: EventWatcher::start(dir, pattern, self.gate.clone(), callback)?,
            },
            DetectorMode::Polling(interval) => Active::Polling(Poller::start(
                dir,
                pattern,
                interval,
                settings,
                self.gate.clone(),
                callback,
            )),
        };
        self.active = Some(active);
        self.gate.rearm();
        debug!("Change detector armed on {:?} ({:?})", dir, mode);
        Ok(())
    }

    /// Open the gate again after a restart attempt.
    pub fn rearm(&self) {
        self.gate.rearm();
    }

    /// Close the gate and release the watcher or poll task.
    pub fn disarm(&mut self) {
        self.gate.disarm();
        if self.active.take().is_some() {
            debug!("Change detector disarmed");
        }
    }

    pub fn is_armed(&self) -> bool {
        self.gate.is_armed()
    }

    pub fn is_running(&self) -> bool {
        self.active.is_some()
    }

    /// Snapshot of the poller's state; `None` in event mode.
    pub fn watch_state(&self) -> Option<WatchState> {
        match &self.active {
            Some(Active::Polling(poller)) => Some(poller.state()),
            _ => None,
        }
    }
}
