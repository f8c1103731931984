//! hostwatch runtime
//!
//! Runs a server host plugin and recycles it whenever its backing files
//! change:
//! - [`loader`] resolves and drives a host type inside a plugin library
//! - [`boundary`] hosts the loader in a worker process that can be torn down
//!   to release every handle the plugin holds
//! - [`detector`] watches the plugin directory (events or polling)
//! - [`supervisor`] owns the start / watch / restart / stop state machine
//! - [`service`] runs the supervisor interactively or as a background service

pub mod boundary;
pub mod config;
pub mod detector;
pub mod error;
pub mod loader;
pub mod prompt;
pub mod service;
pub mod status;
pub mod supervisor;
pub mod worker;

pub use boundary::{
    Boundary, BoundaryConfig, BoundaryFactory, BoundaryId, ProcessBoundary, ProcessBoundaryFactory,
};
pub use config::{RunConfiguration, RunOptions};
pub use detector::{ChangeDetector, ChangeKind, ChangeNotice, DetectorMode, PollSettings, WatchState};
pub use error::{
    BoundaryError, ConfigError, DetectorError, HostLoadError, HostResolutionError, LoadError,
    PluginRuntimeError, SupervisorError,
};
pub use loader::{HostInstance, HostLoader, PluginLibrary, listener_uri, resolve_host};
pub use prompt::{ConsolePrompt, RetryPrompt};
pub use service::{RunMode, ServiceLifecycle, ServiceRunner, SupervisorService};
pub use status::{ConsoleStatus, RecordingStatus, StatusLevel, StatusSink};
pub use supervisor::{
    StopReason, Supervisor, SupervisorEvent, SupervisorHandle, SupervisorState,
};
