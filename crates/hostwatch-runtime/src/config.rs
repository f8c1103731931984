//! Run configuration
//!
//! [`RunOptions`] is the raw, user supplied configuration: defaults, an
//! optional config file (YAML, TOML or JSON), `HOSTWATCH_*` environment
//! variables and finally command line flags. [`RunConfiguration::resolve`]
//! validates it into the immutable configuration the supervisor runs with.

use std::env::consts::DLL_EXTENSION;
use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, Environment, File};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::detector::PollSettings;
use crate::error::ConfigError;

pub const DEFAULT_PORT: u16 = 2020;
pub const DEFAULT_WATCH_PATTERN: &str = r"\.*";
pub const DEFAULT_RESTART_DELAY_MS: u64 = 2000;
pub const DEFAULT_STOP_TIMEOUT_MS: u64 = 5000;

/// Prefix of the environment variables read by [`RunOptions::load`]
pub const ENV_PREFIX: &str = "HOSTWATCH";

/// Unvalidated run options
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunOptions {
    /// Plugin library, absolute or relative to `bin_dir`
    pub plugin: Option<String>,
    /// Directory holding the plugin and its dependencies
    pub bin_dir: Option<PathBuf>,
    /// Host type to use when the plugin offers more than one
    pub type_name: Option<String>,
    pub port: u16,
    /// Regex over absolute paths selecting the files that trigger a restart
    pub watch: String,
    /// Polling interval; 0 selects OS file notifications
    pub poll_ms: u64,
    /// Pause between teardown and restart
    pub restart_delay_ms: u64,
    /// Bound on each graceful stop / shutdown exchange with the worker
    pub stop_timeout_ms: u64,
    /// Skip polling checks while the directory's access time is unchanged
    pub trust_access_time: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            plugin: None,
            bin_dir: None,
            type_name: None,
            port: DEFAULT_PORT,
            watch: DEFAULT_WATCH_PATTERN.to_string(),
            poll_ms: 0,
            restart_delay_ms: DEFAULT_RESTART_DELAY_MS,
            stop_timeout_ms: DEFAULT_STOP_TIMEOUT_MS,
            trust_access_time: false,
        }
    }
}

impl RunOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load options from an optional config file, then `HOSTWATCH_*`
    /// environment variables.
    pub fn load(file: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();
        if let Some(path) = file {
            if !path.is_file() {
                return Err(ConfigError::Load(format!(
                    "config file not found: {}",
                    path.display()
                )));
            }
            debug!("Loading run options from {:?}", path);
            builder = builder.add_source(File::from(path));
        }
        builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).try_parsing(true));

        Ok(builder.build()?.try_deserialize()?)
    }

    pub fn with_plugin(mut self, plugin: impl Into<String>) -> Self {
        self.plugin = Some(plugin.into());
        self
    }

    pub fn with_bin_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.bin_dir = Some(dir.into());
        self
    }

    pub fn with_type_name(mut self, type_name: impl Into<String>) -> Self {
        self.type_name = Some(type_name.into());
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_watch(mut self, pattern: impl Into<String>) -> Self {
        self.watch = pattern.into();
        self
    }

    pub fn with_poll_ms(mut self, poll_ms: u64) -> Self {
        self.poll_ms = poll_ms;
        self
    }

    pub fn with_restart_delay_ms(mut self, delay_ms: u64) -> Self {
        self.restart_delay_ms = delay_ms;
        self
    }

    pub fn with_stop_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.stop_timeout_ms = timeout_ms;
        self
    }

    pub fn with_trust_access_time(mut self, trust: bool) -> Self {
        self.trust_access_time = trust;
        self
    }

    /// Grace period for each stop / shutdown exchange with a worker
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

/// Validated, immutable configuration owned by the supervisor.
#[derive(Debug, Clone)]
pub struct RunConfiguration {
    plugin_path: PathBuf,
    plugin_dir: PathBuf,
    type_name: Option<String>,
    port: u16,
    watch: Regex,
    poll_interval: Duration,
    restart_delay: Duration,
    poll_settings: PollSettings,
}

impl RunConfiguration {
    /// Validate and normalize options.
    ///
    /// The plugin path is resolved against `bin_dir` (or the working
    /// directory), the platform library extension is appended when missing,
    /// and `lib<name>` is tried when the plain name does not exist.
    pub fn resolve(options: &RunOptions) -> Result<Self, ConfigError> {
        let plugin = options
            .plugin
            .as_deref()
            .and_then(trim_arg)
            .ok_or(ConfigError::MissingPlugin)?;

        let bin_dir = match options.bin_dir.as_deref() {
            Some(dir) => {
                let dir = absolute(dir)?;
                if !dir.is_dir() {
                    return Err(ConfigError::BinDirNotFound(dir));
                }
                Some(dir)
            }
            None => None,
        };

        let plugin_path = locate_plugin(bin_dir.as_deref(), &plugin)?;
        let plugin_dir = plugin_path
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| ConfigError::PluginNotFound(plugin_path.clone()))?;

        let pattern = trim_arg(&options.watch).unwrap_or_else(|| DEFAULT_WATCH_PATTERN.to_string());
        let watch = Regex::new(&pattern).map_err(|e| ConfigError::InvalidWatchPattern {
            pattern: pattern.clone(),
            message: e.to_string(),
        })?;

        Ok(Self {
            plugin_path,
            plugin_dir,
            type_name: options.type_name.as_deref().and_then(trim_arg),
            port: options.port,
            watch,
            poll_interval: Duration::from_millis(options.poll_ms),
            restart_delay: Duration::from_millis(options.restart_delay_ms),
            poll_settings: PollSettings {
                trust_access_time: options.trust_access_time,
            },
        })
    }

    /// Absolute path of the plugin library
    pub fn plugin_path(&self) -> &Path {
        &self.plugin_path
    }

    /// Directory containing the plugin; the watched directory
    pub fn plugin_dir(&self) -> &Path {
        &self.plugin_dir
    }

    pub fn type_name(&self) -> Option<&str> {
        self.type_name.as_deref()
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn watch_pattern(&self) -> &Regex {
        &self.watch
    }

    /// Zero selects event-driven change detection
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub fn restart_delay(&self) -> Duration {
        self.restart_delay
    }

    pub fn poll_settings(&self) -> PollSettings {
        self.poll_settings
    }
}

/// Strip surrounding whitespace and quotes; `None` when nothing is left.
fn trim_arg(value: &str) -> Option<String> {
    let trimmed = value.trim_matches(|c: char| c.is_whitespace() || c == '"' || c == '\'');
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn absolute(path: &Path) -> Result<PathBuf, ConfigError> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

fn has_library_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| {
            let e = e.to_ascii_lowercase();
            e == "so" || e == "dylib" || e == "dll"
        })
        .unwrap_or(false)
}

fn locate_plugin(bin_dir: Option<&Path>, plugin: &str) -> Result<PathBuf, ConfigError> {
    let mut file = PathBuf::from(plugin);
    if !has_library_extension(&file) {
        file = PathBuf::from(format!("{plugin}.{DLL_EXTENSION}"));
    }

    let candidate = match bin_dir {
        Some(dir) => dir.join(&file),
        None => absolute(&file)?,
    };
    if candidate.is_file() {
        return Ok(std::fs::canonicalize(&candidate)?);
    }

    // Rust cdylibs are named lib<crate>.so / lib<crate>.dylib
    if let (Some(parent), Some(name)) = (candidate.parent(), candidate.file_name()) {
        let prefixed = parent.join(format!("lib{}", name.to_string_lossy()));
        if prefixed.is_file() {
            return Ok(std::fs::canonicalize(&prefixed)?);
        }
    }

    Err(ConfigError::PluginNotFound(candidate))
}
