//! Supervisor state machine
//!
//! ```text
//! Stopped -> Starting -> Running -> Restarting -> Starting -> ...
//!               ^  |                                   |
//!               +--+ (failed, operator retries)        v
//!                                                   Stopped
//! ```
//!
//! [`Supervisor::run`] is the single control loop. It owns the boundary, the
//! detector and the state; detector callbacks and [`SupervisorHandle`]s only
//! post commands into it.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, info, warn};

use crate::boundary::{Boundary, BoundaryFactory, BoundaryId};
use crate::config::RunConfiguration;
use crate::detector::{ChangeCallback, ChangeDetector, ChangeNotice, DetectorMode};
use crate::error::SupervisorError;
use crate::prompt::RetryPrompt;
use crate::status::{ConsoleStatus, StatusSink};

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SupervisorState {
    Stopped,
    Starting,
    Running,
    Restarting,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorEvent {
    StateChanged {
        from: SupervisorState,
        to: SupervisorState,
    },
    /// A host is running in a new boundary
    BoundaryStarted { id: BoundaryId },
    ChangeDetected(ChangeNotice),
    StartFailed { message: String },
}

/// Why [`Supervisor::run`] returned normally
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// `stop()` was requested
    Stopped,
    /// The retry prompt's input closed while waiting for the operator
    PromptClosed,
}

#[derive(Debug)]
enum Command {
    Changed(ChangeNotice),
    Stop,
}

enum StartOutcome {
    Running(BoundaryId),
    Failed(String),
}

enum RetryOutcome {
    Retry,
    Stop,
    Closed,
}

/// Cloneable remote control for a running [`Supervisor`]
#[derive(Debug, Clone)]
pub struct SupervisorHandle {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<SupervisorState>,
    events: broadcast::Sender<SupervisorEvent>,
}

impl SupervisorHandle {
    /// Request a stop. Returns false once the supervisor is gone.
    pub fn stop(&self) -> bool {
        self.commands.send(Command::Stop).is_ok()
    }

    /// Post a change notice as if the detector had raised it.
    pub fn notify_changed(&self, notice: ChangeNotice) -> bool {
        self.commands.send(Command::Changed(notice)).is_ok()
    }

    pub fn state(&self) -> SupervisorState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.events.subscribe()
    }

    /// Wait until the supervisor reports `target`. Returns false if the
    /// supervisor went away first.
    pub async fn wait_for(&self, target: SupervisorState) -> bool {
        let mut state = self.state.clone();
        state.wait_for(|s| *s == target).await.is_ok()
    }
}

pub struct Supervisor {
    config: RunConfiguration,
    factory: Arc<dyn BoundaryFactory>,
    status: Arc<dyn StatusSink>,
    prompt: Option<Arc<dyn RetryPrompt>>,
    commands_tx: mpsc::UnboundedSender<Command>,
    commands_rx: mpsc::UnboundedReceiver<Command>,
    state_tx: watch::Sender<SupervisorState>,
    state_rx: watch::Receiver<SupervisorState>,
    events: broadcast::Sender<SupervisorEvent>,
    detector: ChangeDetector,
    boundary: Option<Box<dyn Boundary>>,
}

impl Supervisor {
    /// Non-interactive supervisor printing to the console.
    pub fn new(config: RunConfiguration, factory: Arc<dyn BoundaryFactory>) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(SupervisorState::Stopped);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Self {
            config,
            factory,
            status: Arc::new(ConsoleStatus),
            prompt: None,
            commands_tx,
            commands_rx,
            state_tx,
            state_rx,
            events,
            detector: ChangeDetector::new(),
            boundary: None,
        }
    }

    pub fn with_status(mut self, status: Arc<dyn StatusSink>) -> Self {
        self.status = status;
        self
    }

    /// Make start failures retryable through `prompt`.
    pub fn with_prompt(mut self, prompt: Arc<dyn RetryPrompt>) -> Self {
        self.prompt = Some(prompt);
        self
    }

    pub fn handle(&self) -> SupervisorHandle {
        SupervisorHandle {
            commands: self.commands_tx.clone(),
            state: self.state_rx.clone(),
            events: self.events.clone(),
        }
    }

    /// Drive the state machine until stopped.
    ///
    /// Without a retry prompt a failed start is terminal and returned as
    /// [`SupervisorError::StartFailed`].
    pub async fn run(mut self) -> Result<StopReason, SupervisorError> {
        loop {
            self.set_state(SupervisorState::Starting);

            let id = match self.start_host().await {
                StartOutcome::Running(id) => id,
                StartOutcome::Failed(message) => {
                    self.status.warning("A fatal error occurred!");
                    self.status.warning(&message);
                    self.emit(SupervisorEvent::StartFailed {
                        message: message.clone(),
                    });

                    let Some(prompt) = self.prompt.clone() else {
                        self.shutdown().await;
                        return Err(SupervisorError::StartFailed(message));
                    };

                    self.status
                        .warning("Please fix the error and press enter to continue ...");
                    match wait_for_retry(prompt, &mut self.commands_rx).await {
                        RetryOutcome::Retry => continue,
                        RetryOutcome::Stop => {
                            self.shutdown().await;
                            return Ok(StopReason::Stopped);
                        }
                        RetryOutcome::Closed => {
                            self.shutdown().await;
                            return Ok(StopReason::PromptClosed);
                        }
                    }
                }
            };

            self.set_state(SupervisorState::Running);
            self.emit(SupervisorEvent::BoundaryStarted { id });

            match self.commands_rx.recv().await {
                Some(Command::Changed(notice)) => {
                    self.status.detail(&notice.describe());
                    self.emit(SupervisorEvent::ChangeDetected(notice));
                    self.set_state(SupervisorState::Restarting);

                    if let Some(boundary) = self.boundary.take() {
                        debug!("Tearing down boundary {}", boundary.id());
                        boundary.teardown().await;
                    }

                    if self.pause(self.config.restart_delay()).await {
                        self.shutdown().await;
                        return Ok(StopReason::Stopped);
                    }
                }
                Some(Command::Stop) | None => {
                    self.shutdown().await;
                    return Ok(StopReason::Stopped);
                }
            }
        }
    }

    async fn start_host(&mut self) -> StartOutcome {
        let config = &self.config;

        let mut boundary = match self.factory.create(config.plugin_dir()).await {
            Ok(boundary) => boundary,
            Err(e) => return StartOutcome::Failed(format!("BoundaryError: {e}")),
        };
        let id = boundary.id();

        if let Some(error) = boundary
            .start(config.plugin_path(), config.type_name(), config.port())
            .await
        {
            boundary.teardown().await;
            return StartOutcome::Failed(error);
        }
        self.boundary = Some(boundary);
        info!("Server host started in boundary {}", id);

        if config.port() > 0 {
            self.status.info(&format!(
                "Server listening at http://localhost:{}",
                config.port()
            ));
        }

        drain_stale_changes(&mut self.commands_rx, &self.commands_tx);

        let commands = self.commands_tx.clone();
        let callback: ChangeCallback = Arc::new(move |notice| {
            let _ = commands.send(Command::Changed(notice));
        });
        let mode = DetectorMode::from_interval(config.poll_interval());
        if let Err(e) = self.detector.arm(
            config.plugin_dir(),
            config.watch_pattern().clone(),
            mode,
            config.poll_settings(),
            callback,
        ) {
            if let Some(boundary) = self.boundary.take() {
                boundary.teardown().await;
            }
            return StartOutcome::Failed(format!("DetectorError: {e}"));
        }

        let suffix = match mode {
            DetectorMode::Polling(interval) => {
                format!(" (polling every {} ms)", interval.as_millis())
            }
            DetectorMode::Events => String::new(),
        };
        self.status.detail(&format!(
            "Watching directory: {}{}",
            config.plugin_dir().display(),
            suffix
        ));

        StartOutcome::Running(id)
    }

    /// Sleep for the grace delay. Returns true if a stop arrived meanwhile.
    async fn pause(&mut self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = &mut sleep => return false,
                command = self.commands_rx.recv() => match command {
                    Some(Command::Changed(_)) => continue,
                    Some(Command::Stop) | None => return true,
                },
            }
        }
    }

    async fn shutdown(&mut self) {
        self.detector.disarm();
        if let Some(mut boundary) = self.boundary.take() {
            boundary.stop().await;
            boundary.teardown().await;
        }
        self.set_state(SupervisorState::Stopped);
    }

    fn set_state(&self, to: SupervisorState) {
        let from = *self.state_tx.borrow();
        if from == to {
            return;
        }
        debug!("Supervisor {:?} -> {:?}", from, to);
        self.state_tx.send_replace(to);
        self.emit(SupervisorEvent::StateChanged { from, to });
    }

    fn emit(&self, event: SupervisorEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

/// Drop change notices left over from the previous cycle; keep a pending
/// stop.
fn drain_stale_changes(
    commands_rx: &mut mpsc::UnboundedReceiver<Command>,
    commands_tx: &mpsc::UnboundedSender<Command>,
) {
    let mut stop_pending = false;
    while let Ok(command) = commands_rx.try_recv() {
        match command {
            Command::Changed(notice) => debug!("Dropping stale change: {:?}", notice),
            Command::Stop => stop_pending = true,
        }
    }
    if stop_pending {
        let _ = commands_tx.send(Command::Stop);
    }
}

async fn wait_for_retry(
    prompt: Arc<dyn RetryPrompt>,
    commands: &mut mpsc::UnboundedReceiver<Command>,
) -> RetryOutcome {
    let answer = prompt.wait_for_retry();
    tokio::pin!(answer);

    loop {
        tokio::select! {
            retry = &mut answer => {
                return if retry {
                    RetryOutcome::Retry
                } else {
                    warn!("Retry prompt closed");
                    RetryOutcome::Closed
                };
            }
            command = commands.recv() => match command {
                Some(Command::Changed(_)) => continue,
                Some(Command::Stop) | None => return RetryOutcome::Stop,
            },
        }
    }
}
