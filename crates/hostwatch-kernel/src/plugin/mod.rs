//! Server host plugin contract
//!
//! A plugin is a dynamic library exporting a [`HostRegistry`]: the static list
//! of host types it offers, each described by a [`HostDescriptor`]. The
//! supervisor resolves exactly one descriptor, constructs it and drives the
//! declared subset of the `init` / `start` / `stop` lifecycle.

use std::fmt;


/// Version of the exported symbol layout. Bumped whenever [`HostRegistry`] or
/// [`ServerHost`] change shape.
pub const API_VERSION: u32 = 1;

/// Symbol returning the plugin's [`API_VERSION`].
pub const API_VERSION_SYMBOL: &[u8] = b"_hostwatch_api_version";

/// Symbol returning a pointer to the plugin's [`HostRegistry`].
pub const REGISTRY_SYMBOL: &[u8] = b"_hostwatch_registry";

/// Error type returned by plugin code.
pub type HostError = Box<dyn std::error::Error + Send + Sync>;

/// Result type returned by plugin code.
pub type HostResult<T> = Result<T, HostError>;

/// Lifecycle contract implemented by a server host.
///
/// Every hook has a no-op default; the supervisor only calls the hooks listed
/// in the host's [`LifecycleCapability`].
pub trait ServerHost {
    /// Called once before any start hook. A failure aborts loading.
    fn init(&mut self) -> HostResult<()> {
        Ok(())
    }

    /// Zero-argument start. Must return once the server is listening;
    /// long-running listeners belong on background threads.
    fn start(&mut self) -> HostResult<()> {
        Ok(())
    }

    /// One-argument start receiving a listener URI such as `http://*:2020/`.
    /// `*` means "bind all interfaces".
    fn start_at(&mut self, listener_uri: &str) -> HostResult<()> {
        let _ = listener_uri;
        Ok(())
    }

    /// Called at teardown. Failures are ignored.
    fn stop(&mut self) -> HostResult<()> {
        Ok(())
    }
}

/// Which start hook a host exposes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartArity {
    /// `start()`
    NoArgs,
    /// `start_at(listener_uri)`
    ListenerUri,
}

/// The subset of lifecycle hooks a host type exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LifecycleCapability {
    pub init: bool,
    pub start: Option<StartArity>,
    pub stop: bool,
}

impl LifecycleCapability {
    /// No hooks at all
    pub fn none() -> Self {
        Self::default()
    }

    /// Only a zero-argument start
    pub fn start_only() -> Self {
        Self {
            start: Some(StartArity::NoArgs),
            ..Self::default()
        }
    }

    /// `init`, `start_at(listener_uri)` and `stop`
    pub fn full_with_uri() -> Self {
        Self {
            init: true,
            start: Some(StartArity::ListenerUri),
            stop: true,
        }
    }

    pub fn with_init(mut self) -> Self {
        self.init = true;
        self
    }

    pub fn with_start(mut self, arity: StartArity) -> Self {
        self.start = Some(arity);
        self
    }

    pub fn with_stop(mut self) -> Self {
        self.stop = true;
        self
    }
}

/// Whether a host type derives from the self-hosting application marker.
///
/// Only [`HostKind::SelfHosted`] types are candidates when no type name is
/// given; [`HostKind::Plain`] types must be selected explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostKind {
    SelfHosted,
    Plain,
}

/// Parameterless constructor of a host type
pub type HostConstructor = fn() -> HostResult<Box<dyn ServerHost>>;

fn construct_default<T: ServerHost + Default + 'static>() -> HostResult<Box<dyn ServerHost>> {
    Ok(Box::new(T::default()))
}

/// Static description of one host type offered by a plugin.
#[derive(Clone)]
pub struct HostDescriptor {
    type_name: String,
    kind: HostKind,
    capabilities: LifecycleCapability,
    constructor: Option<HostConstructor>,
}

impl HostDescriptor {
    /// Describe a host type constructed through [`Default`].
    pub fn of<T: ServerHost + Default + 'static>(
        type_name: impl Into<String>,
        capabilities: LifecycleCapability,
    ) -> Self {
        Self::with_constructor(type_name, capabilities, construct_default::<T>)
    }

    /// Describe a host type with a fallible parameterless constructor.
    pub fn with_constructor(
        type_name: impl Into<String>,
        capabilities: LifecycleCapability,
        constructor: HostConstructor,
    ) -> Self {
        Self {
            type_name: type_name.into(),
            kind: HostKind::Plain,
            capabilities,
            constructor: Some(constructor),
        }
    }

    /// Describe a host type that cannot be constructed without arguments.
    pub fn without_constructor(
        type_name: impl Into<String>,
        capabilities: LifecycleCapability,
    ) -> Self {
        Self {
            type_name: type_name.into(),
            kind: HostKind::Plain,
            capabilities,
            constructor: None,
        }
    }

    /// Mark the type as deriving from the self-hosting application marker.
    pub fn self_hosted(mut self) -> Self {
        self.kind = HostKind::SelfHosted;
        self
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn kind(&self) -> HostKind {
        self.kind
    }

    pub fn capabilities(&self) -> LifecycleCapability {
        self.capabilities
    }

    pub fn constructor(&self) -> Option<HostConstructor> {
        self.constructor
    }

    /// Candidate for the automatic scan: self-hosted and constructible.
    pub fn is_scan_candidate(&self) -> bool {
        self.kind == HostKind::SelfHosted && self.constructor.is_some()
    }
}

impl fmt::Debug for HostDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostDescriptor")
            .field("type_name", &self.type_name)
            .field("kind", &self.kind)
            .field("capabilities", &self.capabilities)
            .field("constructible", &self.constructor.is_some())
            .finish()
    }
}

/// The manifest of host types a plugin exports.
#[derive(Debug, Clone)]
pub struct HostRegistry {
    plugin: String,
    hosts: Vec<HostDescriptor>,
}

impl HostRegistry {
    pub fn new(plugin: impl Into<String>) -> Self {
        Self {
            plugin: plugin.into(),
            hosts: Vec::new(),
        }
    }

    /// Add a host type
    pub fn register(&mut self, descriptor: HostDescriptor) -> &mut Self {
        self.hosts.push(descriptor);
        self
    }

    /// Builder-style [`register`](Self::register)
    pub fn with_host(mut self, descriptor: HostDescriptor) -> Self {
        self.hosts.push(descriptor);
        self
    }

    /// Name of the plugin, usually its crate name
    pub fn plugin(&self) -> &str {
        &self.plugin
    }

    pub fn hosts(&self) -> &[HostDescriptor] {
        &self.hosts
    }

    /// Look up a host by type name. Accepts both `Type` and the qualified
    /// `Type, plugin` form.
    pub fn find(&self, type_name: &str) -> Option<&HostDescriptor> {
        let wanted = type_name.split(',').next().unwrap_or(type_name).trim();
        self.hosts.iter().find(|h| h.type_name == wanted)
    }

    /// All self-hosted, constructible host types
    pub fn scan_candidates(&self) -> Vec<&HostDescriptor> {
        self.hosts.iter().filter(|h| h.is_scan_candidate()).collect()
    }

    /// Fully qualified identifier of a host: `Type, plugin`
    pub fn qualified_name(&self, descriptor: &HostDescriptor) -> String {
        format!("{}, {}", descriptor.type_name, self.plugin)
    }
}

/// Export the symbols the supervisor looks for in a plugin library.
///
/// ```rust,ignore
/// use hostwatch_kernel::{HostDescriptor, LifecycleCapability};
///
/// hostwatch_kernel::declare_hosts!(
///     HostDescriptor::of::<AppHost>("demo::AppHost", LifecycleCapability::start_only()).self_hosted(),
/// );
/// ```
#[macro_export]
macro_rules! declare_hosts {
    ($($descriptor:expr),+ $(,)?) => {
        #[unsafe(no_mangle)]
        pub extern "C" fn _hostwatch_api_version() -> u32 {
            $crate::plugin::API_VERSION
        }

        #[unsafe(no_mangle)]
        #[allow(improper_ctypes_definitions)]
        pub extern "C" fn _hostwatch_registry() -> *const $crate::plugin::HostRegistry {
            static REGISTRY: ::std::sync::OnceLock<$crate::plugin::HostRegistry> =
                ::std::sync::OnceLock::new();
            REGISTRY.get_or_init(|| {
                let mut registry = $crate::plugin::HostRegistry::new(env!("CARGO_PKG_NAME"));
                $(registry.register($descriptor);)+
                registry
            })
        }
    };
}
