//! Service wrapper
//!
//! Adapts the supervisor to the lifecycle a host service manager drives
//! (`on_start` / `on_stop` / `on_shutdown`) and runs it either attached to
//! a console or as a background service waiting for termination signals.

use std::io::BufRead;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::boundary::BoundaryFactory;
use crate::config::{RunConfiguration, RunOptions};
use crate::error::SupervisorError;
use crate::prompt::{ConsolePrompt, RetryPrompt};
use crate::status::{ConsoleStatus, StatusSink};
use crate::supervisor::{StopReason, Supervisor, SupervisorHandle};

/// Lifecycle hooks called by a service manager
#[async_trait]
pub trait ServiceLifecycle: Send {
    async fn on_start(&mut self, args: &[String]) -> Result<(), SupervisorError>;

    async fn on_stop(&mut self) -> Result<(), SupervisorError>;

    /// The host system is going down.
    async fn on_shutdown(&mut self) -> Result<(), SupervisorError> {
        self.on_stop().await
    }

    /// Resolves if the service ends without being asked to.
    async fn finished(&mut self) -> Result<(), SupervisorError> {
        std::future::pending().await
    }
}

/// [`ServiceLifecycle`] running a [`Supervisor`] on a tokio task
pub struct SupervisorService {
    options: RunOptions,
    factory: Arc<dyn BoundaryFactory>,
    status: Arc<dyn StatusSink>,
    prompt: Option<Arc<dyn RetryPrompt>>,
    handle: Option<SupervisorHandle>,
    task: Option<JoinHandle<Result<StopReason, SupervisorError>>>,
}

impl SupervisorService {
    pub fn new(options: RunOptions, factory: Arc<dyn BoundaryFactory>) -> Self {
        Self {
            options,
            factory,
            status: Arc::new(ConsoleStatus),
            prompt: None,
            handle: None,
            task: None,
        }
    }

    pub fn with_status(mut self, status: Arc<dyn StatusSink>) -> Self {
        self.status = status;
        self
    }

    pub fn with_prompt(mut self, prompt: Arc<dyn RetryPrompt>) -> Self {
        self.prompt = Some(prompt);
        self
    }

    /// Handle to the running supervisor, once started
    pub fn handle(&self) -> Option<&SupervisorHandle> {
        self.handle.as_ref()
    }

    async fn join(&mut self) -> Result<(), SupervisorError> {
        let Some(task) = self.task.take() else {
            return Ok(());
        };
        self.handle = None;
        match task.await {
            Ok(Ok(reason)) => {
                debug!("Supervisor finished: {:?}", reason);
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(e) => Err(SupervisorError::Internal(e.to_string())),
        }
    }
}

#[async_trait]
impl ServiceLifecycle for SupervisorService {
    /// A first argument, if given, names the plugin.
    async fn on_start(&mut self, args: &[String]) -> Result<(), SupervisorError> {
        if self.task.is_some() {
            return Err(SupervisorError::AlreadyRunning);
        }

        let mut options = self.options.clone();
        if let Some(plugin) = args.first() {
            options.plugin = Some(plugin.clone());
        }

        let config = match RunConfiguration::resolve(&options) {
            Ok(config) => config,
            Err(e) => {
                self.status.error(&e.to_string());
                return Err(e.into());
            }
        };

        let mut supervisor = Supervisor::new(config, self.factory.clone())
            .with_status(self.status.clone());
        if let Some(prompt) = &self.prompt {
            supervisor = supervisor.with_prompt(prompt.clone());
        }

        self.handle = Some(supervisor.handle());
        self.task = Some(tokio::spawn(supervisor.run()));
        Ok(())
    }

    async fn on_stop(&mut self) -> Result<(), SupervisorError> {
        if let Some(handle) = &self.handle {
            handle.stop();
        }
        self.join().await
    }

    async fn finished(&mut self) -> Result<(), SupervisorError> {
        match self.task.as_mut() {
            Some(task) => {
                let outcome = task.await;
                self.task = None;
                self.handle = None;
                match outcome {
                    Ok(Ok(_)) => Ok(()),
                    Ok(Err(e)) => Err(e),
                    Err(e) => Err(SupervisorError::Internal(e.to_string())),
                }
            }
            None => std::future::pending().await,
        }
    }
}

/// How [`ServiceRunner`] waits for the end of the service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Attached to a console: `q` + enter or Ctrl-C stops, other lines
    /// answer the retry prompt.
    Interactive,
    /// Under a service manager: SIGTERM / SIGINT shut down.
    Background,
}

pub struct ServiceRunner {
    mode: RunMode,
    prompt: Option<Arc<ConsolePrompt>>,
    status: Arc<dyn StatusSink>,
}

enum Outcome {
    Stop,
    Finished(Result<(), SupervisorError>),
}

impl ServiceRunner {
    /// Console runner feeding `prompt` from stdin.
    pub fn interactive(prompt: Arc<ConsolePrompt>) -> Self {
        Self {
            mode: RunMode::Interactive,
            prompt: Some(prompt),
            status: Arc::new(ConsoleStatus),
        }
    }

    pub fn background() -> Self {
        Self {
            mode: RunMode::Background,
            prompt: None,
            status: Arc::new(ConsoleStatus),
        }
    }

    pub fn with_status(mut self, status: Arc<dyn StatusSink>) -> Self {
        self.status = status;
        self
    }

    pub fn mode(&self) -> RunMode {
        self.mode
    }

    /// Start the service and block until it is stopped or ends by itself.
    pub async fn run<S>(&self, service: &mut S, args: &[String]) -> Result<(), SupervisorError>
    where
        S: ServiceLifecycle + ?Sized,
    {
        service.on_start(args).await?;

        match self.mode {
            RunMode::Interactive => {
                self.status
                    .info("System running; type q and press enter (or Ctrl-C) to stop");
                let mut quit = spawn_console_reader(self.prompt.clone());
                let mut input_open = true;

                let outcome = loop {
                    tokio::select! {
                        result = service.finished() => break Outcome::Finished(result),
                        _ = tokio::signal::ctrl_c() => break Outcome::Stop,
                        line = quit.recv(), if input_open => match line {
                            Some(()) => break Outcome::Stop,
                            None => input_open = false,
                        },
                    }
                };

                match outcome {
                    Outcome::Stop => {
                        info!("Stopping");
                        service.on_stop().await
                    }
                    Outcome::Finished(result) => result,
                }
            }
            RunMode::Background => {
                let outcome = tokio::select! {
                    result = service.finished() => Outcome::Finished(result),
                    _ = shutdown_signal() => Outcome::Stop,
                };

                match outcome {
                    Outcome::Stop => service.on_shutdown().await,
                    Outcome::Finished(result) => result,
                }
            }
        }
    }
}

/// Read stdin on a plain thread. `q` / `quit` is sent as a stop request,
/// any other line answers the retry prompt. End of input closes the prompt.
fn spawn_console_reader(prompt: Option<Arc<ConsolePrompt>>) -> mpsc::UnboundedReceiver<()> {
    let (tx, rx) = mpsc::unbounded_channel();

    let spawned = std::thread::Builder::new()
        .name("hostwatch-console".to_string())
        .spawn(move || {
            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                let Ok(line) = line else { break };
                match line.trim() {
                    "q" | "quit" => {
                        if tx.send(()).is_err() {
                            return;
                        }
                    }
                    _ => {
                        if let Some(prompt) = &prompt {
                            prompt.release();
                        }
                    }
                }
            }
            if let Some(prompt) = &prompt {
                prompt.close();
            }
        });

    if let Err(e) = spawned {
        warn!("Could not read console input: {}", e);
    }
    rx
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::RecordingStatus;

    #[derive(Default)]
    struct EndsByItself {
        started: Vec<String>,
        stopped: bool,
    }

    #[async_trait]
    impl ServiceLifecycle for EndsByItself {
        async fn on_start(&mut self, args: &[String]) -> Result<(), SupervisorError> {
            self.started = args.to_vec();
            Ok(())
        }

        async fn on_stop(&mut self) -> Result<(), SupervisorError> {
            self.stopped = true;
            Ok(())
        }

        async fn finished(&mut self) -> Result<(), SupervisorError> {
            Err(SupervisorError::StartFailed("NoHostFound: none".to_string()))
        }
    }

    #[tokio::test]
    async fn test_background_runner_returns_service_outcome() {
        let mut service = EndsByItself::default();
        let runner = ServiceRunner::background();
        assert_eq!(runner.mode(), RunMode::Background);

        let err = runner
            .run(&mut service, &["app".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, SupervisorError::StartFailed(_)));
        assert_eq!(service.started, vec!["app".to_string()]);
        assert!(!service.stopped);
    }

    #[tokio::test]
    async fn test_supervisor_service_reports_config_errors() {
        struct NoBoundaries;

        #[async_trait]
        impl BoundaryFactory for NoBoundaries {
            async fn create(
                &self,
                _root: &std::path::Path,
            ) -> Result<Box<dyn crate::boundary::Boundary>, crate::error::BoundaryError> {
                Err(crate::error::BoundaryError::Handshake("unused".to_string()))
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let status = RecordingStatus::new();
        let mut service = SupervisorService::new(
            RunOptions::new().with_bin_dir(dir.path()),
            Arc::new(NoBoundaries),
        )
        .with_status(Arc::new(status.clone()));

        let err = service.on_start(&["missing".to_string()]).await.unwrap_err();
        assert!(matches!(err, SupervisorError::Config(_)));
        assert!(status.contains("Could not find plugin file"));
        assert!(service.handle().is_none());
        assert!(service.on_stop().await.is_ok());
    }
}
