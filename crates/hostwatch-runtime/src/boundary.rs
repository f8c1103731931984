//! Isolation boundary
//!
//! A [`Boundary`] hosts exactly one server host attempt. Tearing it down
//! must release every resource the plugin acquired (file handles on the
//! plugin directory, sockets, threads), so the production implementation,
//! [`ProcessBoundary`], runs the loader in a child worker process.

use std::fmt;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use hostwatch_kernel::protocol::{read_frame_async, write_frame_async};
use hostwatch_kernel::{PROTOCOL_VERSION, ProtocolError, Request, Response};
use tokio::net::{TcpListener, TcpStream};
use tokio::process::{Child, Command};
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::BoundaryError;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Identity of one boundary. Every restart gets a fresh one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BoundaryId(Uuid);

impl BoundaryId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for BoundaryId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for BoundaryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// One disposable hosting context.
#[async_trait]
pub trait Boundary: Send {
    fn id(&self) -> BoundaryId;

    /// Load and start the host. Returns `None` on success, otherwise a
    /// one-line "Kind: message" description of the failure.
    async fn start(
        &mut self,
        plugin_path: &Path,
        type_name: Option<&str>,
        port: u16,
    ) -> Option<String>;

    /// Ask the host to stop. Failures are swallowed.
    async fn stop(&mut self);

    /// Discard the boundary and everything loaded into it.
    async fn teardown(self: Box<Self>);
}

/// Creates a fresh [`Boundary`] rooted at the plugin directory.
#[async_trait]
pub trait BoundaryFactory: Send + Sync {
    async fn create(&self, root: &Path) -> Result<Box<dyn Boundary>, BoundaryError>;
}

/// How to launch and talk to the worker process
#[derive(Debug, Clone)]
pub struct BoundaryConfig {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub connect_timeout: Duration,
    pub stop_timeout: Duration,
}

impl BoundaryConfig {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
        }
    }

    /// Re-execute the running binary as `<exe> worker`.
    pub fn current_exe() -> std::io::Result<Self> {
        Ok(Self::new(std::env::current_exe()?).with_args(["worker"]))
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    pub fn with_stop_timeout(mut self, stop_timeout: Duration) -> Self {
        self.stop_timeout = stop_timeout;
        self
    }
}

/// A boundary backed by a worker child process.
pub struct ProcessBoundary {
    id: BoundaryId,
    child: Child,
    stream: TcpStream,
    pid: u32,
    stop_timeout: Duration,
}

impl ProcessBoundary {
    /// Spawn the worker with `root` as its working directory and complete the
    /// handshake.
    pub async fn create(config: &BoundaryConfig, root: &Path) -> Result<Self, BoundaryError> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        let addr = listener.local_addr()?;

        let mut command = Command::new(&config.program);
        command
            .args(&config.args)
            .arg("--connect")
            .arg(addr.to_string())
            .current_dir(root)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        // Own process group: terminal Ctrl-C only reaches the supervisor.
        #[cfg(unix)]
        command.process_group(0);
        let mut child = command.spawn().map_err(BoundaryError::Spawn)?;

        let accepted = tokio::select! {
            accepted = timeout(config.connect_timeout, listener.accept()) => Ok(accepted),
            status = child.wait() => Err(status),
        };

        let mut stream = match accepted {
            Ok(Ok(Ok((stream, _)))) => stream,
            Ok(Ok(Err(e))) => {
                let _ = child.kill().await;
                return Err(e.into());
            }
            Ok(Err(_)) => {
                let _ = child.kill().await;
                return Err(BoundaryError::ConnectTimeout(config.connect_timeout));
            }
            Err(status) => {
                let status = match status {
                    Ok(status) => status.to_string(),
                    Err(e) => e.to_string(),
                };
                return Err(BoundaryError::WorkerExited(status));
            }
        };
        stream.set_nodelay(true)?;

        let pid = match timeout(config.connect_timeout, handshake(&mut stream)).await {
            Ok(Ok(pid)) => pid,
            Ok(Err(e)) => {
                let _ = child.kill().await;
                return Err(e);
            }
            Err(_) => {
                let _ = child.kill().await;
                return Err(BoundaryError::ConnectTimeout(config.connect_timeout));
            }
        };

        let id = BoundaryId::new();
        debug!("Boundary {} ready (worker pid {})", id, pid);

        Ok(Self {
            id,
            child,
            stream,
            pid,
            stop_timeout: config.stop_timeout,
        })
    }

    /// Worker process id
    pub fn pid(&self) -> u32 {
        self.pid
    }

    async fn call(&mut self, request: &Request) -> Result<Response, ProtocolError> {
        write_frame_async(&mut self.stream, request).await?;
        read_frame_async(&mut self.stream).await
    }
}

async fn handshake(stream: &mut TcpStream) -> Result<u32, BoundaryError> {
    write_frame_async(
        stream,
        &Request::Hello {
            version: PROTOCOL_VERSION,
        },
    )
    .await?;

    match read_frame_async(stream).await? {
        Response::HelloOk { version, pid } if version == PROTOCOL_VERSION => Ok(pid),
        Response::HelloOk { version, .. } => Err(ProtocolError::VersionMismatch {
            expected: PROTOCOL_VERSION,
            actual: version,
        }
        .into()),
        Response::Err { message } => Err(BoundaryError::Handshake(message)),
        other => Err(ProtocolError::UnexpectedResponse(other).into()),
    }
}

#[async_trait]
impl Boundary for ProcessBoundary {
    fn id(&self) -> BoundaryId {
        self.id
    }

    async fn start(
        &mut self,
        plugin_path: &Path,
        type_name: Option<&str>,
        port: u16,
    ) -> Option<String> {
        let request = Request::Start {
            plugin_path: plugin_path.to_string_lossy().into_owned(),
            type_name: type_name.map(str::to_string),
            port,
        };

        match self.call(&request).await {
            Ok(Response::Started { error }) => error,
            Ok(Response::Err { message }) => Some(format!("BoundaryError: {message}")),
            Ok(other) => Some(format!(
                "BoundaryError: {}",
                ProtocolError::UnexpectedResponse(other)
            )),
            Err(e) if e.is_eof() => Some(format!(
                "BoundaryError: worker {} exited while starting the server host",
                self.pid
            )),
            Err(e) => Some(format!("BoundaryError: {e}")),
        }
    }

    async fn stop(&mut self) {
        match timeout(self.stop_timeout, self.call(&Request::Stop)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => debug!("Stop request to worker {} failed: {}", self.pid, e),
            Err(_) => warn!("Worker {} did not stop within {:?}", self.pid, self.stop_timeout),
        }
    }

    async fn teardown(mut self: Box<Self>) {
        let stop_timeout = self.stop_timeout;
        if let Err(e) = timeout(stop_timeout, self.call(&Request::Shutdown)).await {
            debug!("Shutdown request to worker {} timed out: {}", self.pid, e);
        }

        match timeout(stop_timeout, self.child.wait()).await {
            Ok(Ok(status)) => debug!("Worker {} exited with {}", self.pid, status),
            _ => {
                info!("Killing unresponsive worker {}", self.pid);
                if let Err(e) = self.child.kill().await {
                    warn!("Failed to kill worker {}: {}", self.pid, e);
                }
            }
        }
    }
}

/// [`BoundaryFactory`] spawning [`ProcessBoundary`] workers
#[derive(Debug, Clone)]
pub struct ProcessBoundaryFactory {
    config: BoundaryConfig,
}

impl ProcessBoundaryFactory {
    pub fn new(config: BoundaryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &BoundaryConfig {
        &self.config
    }
}

#[async_trait]
impl BoundaryFactory for ProcessBoundaryFactory {
    async fn create(&self, root: &Path) -> Result<Box<dyn Boundary>, BoundaryError> {
        let boundary = ProcessBoundary::create(&self.config, root).await?;
        Ok(Box::new(boundary))
    }
}
