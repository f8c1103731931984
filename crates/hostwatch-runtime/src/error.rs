//! Error types for the hostwatch runtime

use std::path::PathBuf;
use std::time::Duration;

use hostwatch_kernel::ProtocolError;
use thiserror::Error;

/// Invalid or missing run configuration. Fatal, reported before the
/// supervisor starts.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("No plugin file given")]
    MissingPlugin,

    #[error("Could not find bin directory: {}", .0.display())]
    BinDirNotFound(PathBuf),

    #[error("Could not find plugin file: {}", .0.display())]
    PluginNotFound(PathBuf),

    #[error("Invalid watch pattern '{pattern}': {message}")]
    InvalidWatchPattern { pattern: String, message: String },

    #[error("Config loading error: {0}")]
    Load(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Load(e.to_string())
    }
}

/// The plugin library could not be opened or does not export the host
/// manifest.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("Failed to load library: {0}")]
    Library(String),

    #[error("Symbol not found: {0}")]
    SymbolNotFound(String),

    #[error("API version mismatch: expected {expected}, got {actual}")]
    VersionMismatch { expected: u32, actual: u32 },

    #[error("Plugin returned a null host registry")]
    NullRegistry,
}

/// No single host type could be resolved and activated.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HostResolutionError {
    #[error("Unable to locate type {type_name} in plugin {plugin}")]
    TypeNotFound { type_name: String, plugin: String },

    #[error(
        "Type {type_name} is not a valid server host implementation. Make sure it has a parameterless constructor."
    )]
    ConstructorMissing { type_name: String },

    #[error("An error occurred when trying to activate the server host '{type_name}': {message}")]
    ActivationFailed { type_name: String, message: String },

    #[error("Unable to locate a valid server host implementation inside {plugin}")]
    NoHostFound { plugin: String },

    #[error(
        "Found multiple server host types:\n\t- {}\n\nUse the --type argument to specify the type to use",
        .candidates.join("\n\t- ")
    )]
    AmbiguousHost { candidates: Vec<String> },
}

impl HostResolutionError {
    pub fn kind(&self) -> &'static str {
        match self {
            HostResolutionError::TypeNotFound { .. } => "TypeNotFound",
            HostResolutionError::ConstructorMissing { .. } => "ConstructorMissing",
            HostResolutionError::ActivationFailed { .. } => "ActivationFailed",
            HostResolutionError::NoHostFound { .. } => "NoHostFound",
            HostResolutionError::AmbiguousHost { .. } => "AmbiguousHost",
        }
    }
}

/// A failure raised by the plugin's own `init` or `start` hook.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{hook} failed: {message}")]
pub struct PluginRuntimeError {
    pub hook: &'static str,
    pub message: String,
}

/// Anything that keeps a host from reaching the started state.
#[derive(Debug, Error)]
pub enum HostLoadError {
    #[error(transparent)]
    Load(#[from] LoadError),

    #[error(transparent)]
    Resolution(#[from] HostResolutionError),

    #[error(transparent)]
    Runtime(#[from] PluginRuntimeError),

    #[error("A server host is already started in this boundary")]
    AlreadyStarted,
}

impl HostLoadError {
    pub fn kind(&self) -> &'static str {
        match self {
            HostLoadError::Load(_) => "LoadError",
            HostLoadError::Resolution(e) => e.kind(),
            HostLoadError::Runtime(_) => "PluginRuntimeError",
            HostLoadError::AlreadyStarted => "InvalidState",
        }
    }

    /// One-line description handed across the isolation boundary.
    pub fn describe(&self) -> String {
        format!("{}: {}", self.kind(), self)
    }
}

/// The isolation boundary could not be created or talked to.
#[derive(Debug, Error)]
pub enum BoundaryError {
    #[error("Failed to spawn worker process: {0}")]
    Spawn(std::io::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Worker did not connect within {0:?}")]
    ConnectTimeout(Duration),

    #[error("Worker exited before connecting ({0})")]
    WorkerExited(String),

    #[error("Handshake rejected: {0}")]
    Handshake(String),
}

#[derive(Debug, Error)]
pub enum DetectorError {
    #[error("Watch error: {0}")]
    Watch(#[from] notify::Error),

    #[error("Watch directory does not exist: {}", .0.display())]
    DirectoryMissing(PathBuf),
}

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Server host failed to start: {0}")]
    StartFailed(String),

    #[error("Supervisor is already running")]
    AlreadyRunning,

    #[error("Supervisor task failed: {0}")]
    Internal(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ambiguous_host_lists_every_candidate() {
        let err = HostResolutionError::AmbiguousHost {
            candidates: vec!["a::One, app".to_string(), "a::Two, app".to_string()],
        };
        let text = err.to_string();
        assert!(text.contains("\t- a::One, app"));
        assert!(text.contains("\t- a::Two, app"));
        assert!(text.contains("--type"));
    }

    #[test]
    fn test_describe_prefixes_kind() {
        let err: HostLoadError = HostResolutionError::NoHostFound {
            plugin: "app".to_string(),
        }
        .into();
        assert_eq!(
            err.describe(),
            "NoHostFound: Unable to locate a valid server host implementation inside app"
        );

        let err: HostLoadError = PluginRuntimeError {
            hook: "Init",
            message: "boom".to_string(),
        }
        .into();
        assert_eq!(err.describe(), "PluginRuntimeError: Init failed: boom");
    }
}
