//! Polling detection on a fixed interval

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use regex::Regex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use super::{ArmGate, ChangeCallback, ChangeKind, ChangeNotice, PollSettings, WatchState};

/// One blocking comparison of the directory against the last look.
trait DirectoryCheck: Send + Sync + 'static {
    fn changed(&self) -> bool;
}

struct FingerprintCheck {
    dir: PathBuf,
    pattern: Regex,
    settings: PollSettings,
    state: Mutex<WatchState>,
}

impl DirectoryCheck for FingerprintCheck {
    fn changed(&self) -> bool {
        self.state
            .lock()
            .observe(&self.dir, &self.pattern, self.settings)
    }
}

struct Shared<C> {
    dir: PathBuf,
    check: C,
    in_flight: AtomicBool,
}

impl<C> Shared<C> {
    fn new(dir: PathBuf, check: C) -> Self {
        Self {
            dir,
            check,
            in_flight: AtomicBool::new(false),
        }
    }
}

/// Background task comparing fingerprints every tick.
pub(super) struct Poller {
    shared: Arc<Shared<FingerprintCheck>>,
    task: JoinHandle<()>,
}

impl Poller {
    pub(super) fn start(
        dir: &Path,
        pattern: Regex,
        interval: Duration,
        settings: PollSettings,
        gate: ArmGate,
        callback: ChangeCallback,
    ) -> Self {
        let check = FingerprintCheck {
            dir: dir.to_path_buf(),
            pattern,
            settings,
            state: Mutex::new(WatchState::new()),
        };
        let shared = Arc::new(Shared::new(dir.to_path_buf(), check));

        let task = tokio::spawn(poll_loop(shared.clone(), interval, gate, callback));
        Self { shared, task }
    }

    pub(super) fn state(&self) -> WatchState {
        self.shared.check.state.lock().clone()
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn poll_loop<C: DirectoryCheck>(
    shared: Arc<Shared<C>>,
    period: Duration,
    gate: ArmGate,
    callback: ChangeCallback,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        ticker.tick().await;
        tick(&shared, &gate, &callback);
    }
}

/// Handle one timer tick. Returns the spawned check, or `None` when the tick
/// is dropped because the gate is closed or a check is still running.
fn tick<C: DirectoryCheck>(
    shared: &Arc<Shared<C>>,
    gate: &ArmGate,
    callback: &ChangeCallback,
) -> Option<JoinHandle<()>> {
    if !gate.is_armed() {
        return None;
    }
    if shared.in_flight.swap(true, Ordering::AcqRel) {
        debug!("Previous directory check still running, skipping tick");
        return None;
    }

    // Runs detached so an overlapping tick observes the in-flight flag
    // instead of waiting behind it.
    let shared = shared.clone();
    let gate = gate.clone();
    let callback = callback.clone();
    Some(tokio::spawn(async move {
        let check = shared.clone();
        let changed = tokio::task::spawn_blocking(move || check.check.changed()).await;
        shared.in_flight.store(false, Ordering::Release);

        match changed {
            Ok(true) if gate.try_fire() => {
                callback(ChangeNotice::new(ChangeKind::Polled, shared.dir.clone()));
            }
            Ok(_) => {}
            Err(e) => warn!("Directory check failed: {}", e),
        }
    }))
}
