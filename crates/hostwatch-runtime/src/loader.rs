//! Plugin loader
//!
//! Opens a plugin library, reads its exported [`HostRegistry`], resolves
//! exactly one host type and drives the lifecycle hooks it declares. This
//! runs inside the worker process, never in the supervisor.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::{Path, PathBuf};
use std::ptr::NonNull;

use hostwatch_kernel::plugin::{API_VERSION_SYMBOL, REGISTRY_SYMBOL};
use hostwatch_kernel::{
    API_VERSION, HostDescriptor, HostError, HostRegistry, LifecycleCapability, ServerHost,
    StartArity,
};
use libloading::{Library, Symbol};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::error::{HostLoadError, HostResolutionError, LoadError, PluginRuntimeError};

/// Listener URI handed to one-argument start hooks.
pub fn listener_uri(port: u16) -> String {
    format!("http://*:{port}/")
}

/// A plugin library opened in this process
pub struct PluginLibrary {
    path: PathBuf,
    hash: String,
    registry: NonNull<HostRegistry>,
    // Keeps `registry` valid; must outlive every host built from it.
    _library: Library,
}

impl PluginLibrary {
    /// Open a library and validate its exported symbols.
    pub fn open(path: &Path) -> Result<Self, LoadError> {
        info!("Loading plugin library: {:?}", path);

        let hash = match std::fs::read(path) {
            Ok(bytes) => format!("{:x}", Sha256::digest(&bytes)),
            Err(e) => return Err(LoadError::Library(format!("{}: {}", path.display(), e))),
        };

        let library = unsafe { Library::new(path).map_err(|e| LoadError::Library(e.to_string()))? };

        let api_version = unsafe {
            let version_fn: Symbol<unsafe extern "C" fn() -> u32> =
                library.get(API_VERSION_SYMBOL).map_err(|e| {
                    LoadError::SymbolNotFound(format!(
                        "{}: {}",
                        String::from_utf8_lossy(API_VERSION_SYMBOL),
                        e
                    ))
                })?;
            version_fn()
        };
        if api_version != API_VERSION {
            return Err(LoadError::VersionMismatch {
                expected: API_VERSION,
                actual: api_version,
            });
        }

        let raw = unsafe {
            let registry_fn: Symbol<unsafe extern "C" fn() -> *const HostRegistry> =
                library.get(REGISTRY_SYMBOL).map_err(|e| {
                    LoadError::SymbolNotFound(format!(
                        "{}: {}",
                        String::from_utf8_lossy(REGISTRY_SYMBOL),
                        e
                    ))
                })?;
            registry_fn()
        };
        let registry = NonNull::new(raw.cast_mut()).ok_or(LoadError::NullRegistry)?;

        Ok(Self {
            path: path.to_path_buf(),
            hash,
            registry,
            _library: library,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// SHA-256 of the library file at load time
    pub fn hash(&self) -> &str {
        &self.hash
    }

    pub fn registry(&self) -> &HostRegistry {
        // Points into the library's static storage, alive as long as `self`.
        unsafe { self.registry.as_ref() }
    }
}

impl Drop for PluginLibrary {
    fn drop(&mut self) {
        debug!("Unloading plugin library: {:?}", self.path);
    }
}

/// Pick the host type to run.
///
/// A non-blank `type_name` is looked up directly. Otherwise the registry is
/// scanned for self-hosted constructible types and exactly one must exist.
pub fn resolve_host<'a>(
    registry: &'a HostRegistry,
    type_name: Option<&str>,
) -> Result<&'a HostDescriptor, HostResolutionError> {
    if let Some(name) = type_name.map(str::trim).filter(|n| !n.is_empty()) {
        let descriptor = registry
            .find(name)
            .ok_or_else(|| HostResolutionError::TypeNotFound {
                type_name: name.to_string(),
                plugin: registry.plugin().to_string(),
            })?;
        if descriptor.constructor().is_none() {
            return Err(HostResolutionError::ConstructorMissing {
                type_name: descriptor.type_name().to_string(),
            });
        }
        return Ok(descriptor);
    }

    let candidates = registry.scan_candidates();
    match candidates.as_slice() {
        [] => Err(HostResolutionError::NoHostFound {
            plugin: registry.plugin().to_string(),
        }),
        [only] => Ok(only),
        many => Err(HostResolutionError::AmbiguousHost {
            candidates: many.iter().map(|d| registry.qualified_name(d)).collect(),
        }),
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic".to_string()
    }
}

fn guarded<F>(hook: &'static str, f: F) -> Result<(), PluginRuntimeError>
where
    F: FnOnce() -> Result<(), HostError>,
{
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(PluginRuntimeError {
            hook,
            message: e.to_string(),
        }),
        Err(payload) => Err(PluginRuntimeError {
            hook,
            message: panic_message(payload),
        }),
    }
}

/// An activated host and the hooks it declared
pub struct HostInstance {
    type_name: String,
    capabilities: LifecycleCapability,
    host: Box<dyn ServerHost>,
}

impl HostInstance {
    /// Construct the host through its parameterless constructor.
    pub fn activate(descriptor: &HostDescriptor) -> Result<Self, HostResolutionError> {
        let type_name = descriptor.type_name().to_string();
        let constructor =
            descriptor
                .constructor()
                .ok_or_else(|| HostResolutionError::ConstructorMissing {
                    type_name: type_name.clone(),
                })?;

        let host = match catch_unwind(constructor) {
            Ok(Ok(host)) => host,
            Ok(Err(e)) => {
                return Err(HostResolutionError::ActivationFailed {
                    type_name,
                    message: e.to_string(),
                });
            }
            Err(payload) => {
                return Err(HostResolutionError::ActivationFailed {
                    type_name,
                    message: panic_message(payload),
                });
            }
        };

        Ok(Self {
            type_name,
            capabilities: descriptor.capabilities(),
            host,
        })
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// Run `init` (if declared) then the declared start hook.
    pub fn start(&mut self, port: u16) -> Result<(), PluginRuntimeError> {
        if self.capabilities.init {
            let host = &mut self.host;
            guarded("Init", || host.init())?;
        }

        let host = &mut self.host;
        match self.capabilities.start {
            Some(StartArity::NoArgs) => guarded("Start", || host.start()),
            Some(StartArity::ListenerUri) => {
                let uri = listener_uri(port);
                guarded("Start", || host.start_at(&uri))
            }
            None => Ok(()),
        }
    }

    /// Run `stop` if declared. Failures are logged and dropped.
    pub fn stop(&mut self) {
        if !self.capabilities.stop {
            return;
        }
        let host = &mut self.host;
        if let Err(e) = guarded("Stop", || host.stop()) {
            warn!("Ignoring failure while stopping {}: {}", self.type_name, e);
        }
    }
}

/// A started host together with the library it came from.
struct LoadedHost {
    // Field order matters: the instance must drop before its library.
    instance: HostInstance,
    _library: PluginLibrary,
}

/// Loads at most one host at a time.
#[derive(Default)]
pub struct HostLoader {
    loaded: Option<LoadedHost>,
}

impl HostLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_started(&self) -> bool {
        self.loaded.is_some()
    }

    /// Open the plugin, resolve a host, activate and start it.
    pub fn start(
        &mut self,
        plugin_path: &Path,
        type_name: Option<&str>,
        port: u16,
    ) -> Result<(), HostLoadError> {
        if self.loaded.is_some() {
            return Err(HostLoadError::AlreadyStarted);
        }

        let library = PluginLibrary::open(plugin_path)?;
        let descriptor = resolve_host(library.registry(), type_name)?;
        let mut instance = HostInstance::activate(descriptor)?;
        instance.start(port)?;

        info!(
            "Started {} from {:?} (sha256 {})",
            instance.type_name(),
            library.path(),
            &library.hash()[..16]
        );
        self.loaded = Some(LoadedHost {
            instance,
            _library: library,
        });
        Ok(())
    }

    /// Stop and drop the current host, if any.
    pub fn stop(&mut self) {
        if let Some(mut loaded) = self.loaded.take() {
            loaded.instance.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hostwatch_kernel::HostResult;
    use std::cell::RefCell;

    thread_local! {
        static CALLS: RefCell<Vec<String>> = const { RefCell::new(Vec::new()) };
    }

    fn record(call: impl Into<String>) {
        CALLS.with(|c| c.borrow_mut().push(call.into()));
    }

    fn take_calls() -> Vec<String> {
        CALLS.with(|c| std::mem::take(&mut *c.borrow_mut()))
    }

    #[derive(Default)]
    struct RecordingHost;

    impl ServerHost for RecordingHost {
        fn init(&mut self) -> HostResult<()> {
            record("init");
            Ok(())
        }

        fn start(&mut self) -> HostResult<()> {
            record("start");
            Ok(())
        }

        fn start_at(&mut self, listener_uri: &str) -> HostResult<()> {
            record(format!("start_at {listener_uri}"));
            Ok(())
        }

        fn stop(&mut self) -> HostResult<()> {
            record("stop");
            Err("already closed".into())
        }
    }

    #[derive(Default)]
    struct FailingInit;

    impl ServerHost for FailingInit {
        fn init(&mut self) -> HostResult<()> {
            Err("missing settings".into())
        }

        fn start_at(&mut self, _listener_uri: &str) -> HostResult<()> {
            record("start_at");
            Ok(())
        }
    }

    #[derive(Default)]
    struct PanickingStart;

    impl ServerHost for PanickingStart {
        fn start(&mut self) -> HostResult<()> {
            panic!("port in use");
        }
    }

    fn refusing_constructor() -> HostResult<Box<dyn ServerHost>> {
        Err("no database".into())
    }

    #[test]
    fn test_listener_uri() {
        assert_eq!(listener_uri(2020), "http://*:2020/");
    }

    #[test]
    fn test_init_runs_before_start() {
        take_calls();
        let descriptor =
            HostDescriptor::of::<RecordingHost>("app::Host", LifecycleCapability::full_with_uri());
        let mut instance = HostInstance::activate(&descriptor).unwrap();
        instance.start(8080).unwrap();
        instance.stop();

        assert_eq!(
            take_calls(),
            vec!["init", "start_at http://*:8080/", "stop"]
        );
    }

    #[test]
    fn test_only_declared_hooks_run() {
        take_calls();
        let descriptor =
            HostDescriptor::of::<RecordingHost>("app::Host", LifecycleCapability::start_only());
        let mut instance = HostInstance::activate(&descriptor).unwrap();
        instance.start(2020).unwrap();
        instance.stop();

        assert_eq!(take_calls(), vec!["start"]);
    }

    #[test]
    fn test_init_failure_skips_start() {
        take_calls();
        let descriptor =
            HostDescriptor::of::<FailingInit>("app::Host", LifecycleCapability::full_with_uri());
        let mut instance = HostInstance::activate(&descriptor).unwrap();
        let err = instance.start(2020).unwrap_err();

        assert_eq!(err.hook, "Init");
        assert_eq!(err.message, "missing settings");
        assert!(take_calls().is_empty());
    }

    #[test]
    fn test_start_panic_becomes_runtime_error() {
        let descriptor =
            HostDescriptor::of::<PanickingStart>("app::Host", LifecycleCapability::start_only());
        let mut instance = HostInstance::activate(&descriptor).unwrap();
        let err = instance.start(2020).unwrap_err();
        assert_eq!(err.to_string(), "Start failed: port in use");
    }

    #[test]
    fn test_activation_failure() {
        let descriptor = HostDescriptor::with_constructor(
            "app::Host",
            LifecycleCapability::start_only(),
            refusing_constructor,
        );
        let err = HostInstance::activate(&descriptor).err().unwrap();
        assert_eq!(
            err,
            HostResolutionError::ActivationFailed {
                type_name: "app::Host".to_string(),
                message: "no database".to_string()
            }
        );
    }

    #[test]
    fn test_resolve_by_name() {
        let registry = HostRegistry::new("app")
            .with_host(HostDescriptor::of::<RecordingHost>(
                "app::Plain",
                LifecycleCapability::start_only(),
            ))
            .with_host(HostDescriptor::without_constructor(
                "app::NeedsArgs",
                LifecycleCapability::start_only(),
            ));

        let host = resolve_host(&registry, Some("app::Plain, app")).unwrap();
        assert_eq!(host.type_name(), "app::Plain");

        let err = resolve_host(&registry, Some("app::Missing")).unwrap_err();
        assert_eq!(err.kind(), "TypeNotFound");

        let err = resolve_host(&registry, Some("app::NeedsArgs")).unwrap_err();
        assert_eq!(err.kind(), "ConstructorMissing");
    }

    #[test]
    fn test_scan_requires_exactly_one_candidate() {
        let empty = HostRegistry::new("app").with_host(HostDescriptor::of::<RecordingHost>(
            "app::Plain",
            LifecycleCapability::start_only(),
        ));
        let err = resolve_host(&empty, Some("   ")).unwrap_err();
        assert_eq!(err.kind(), "NoHostFound");

        let single = empty.clone().with_host(
            HostDescriptor::of::<RecordingHost>("app::One", LifecycleCapability::start_only())
                .self_hosted(),
        );
        assert_eq!(resolve_host(&single, None).unwrap().type_name(), "app::One");

        let double = single.with_host(
            HostDescriptor::of::<RecordingHost>("app::Two", LifecycleCapability::start_only())
                .self_hosted(),
        );
        let err = resolve_host(&double, None).unwrap_err();
        assert_eq!(
            err,
            HostResolutionError::AmbiguousHost {
                candidates: vec!["app::One, app".to_string(), "app::Two, app".to_string()]
            }
        );
    }

    #[test]
    fn test_garbage_library_is_load_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("libbroken.so");
        std::fs::write(&path, b"definitely not an ELF file").unwrap();

        let mut loader = HostLoader::new();
        let err = loader.start(&path, None, 2020).unwrap_err();
        assert_eq!(err.kind(), "LoadError");
        assert!(!loader.is_started());
    }
}
