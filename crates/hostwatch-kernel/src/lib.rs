//! hostwatch kernel
//!
//! Shared definitions between the supervisor and the server host plugins it
//! loads:
//! - the server host lifecycle contract ([`plugin::ServerHost`])
//! - the static host manifest a plugin exports ([`plugin::HostRegistry`])
//! - the request/response protocol spoken across the isolation boundary
//!   ([`protocol`])

pub mod plugin;
pub mod protocol;

pub use plugin::{
    API_VERSION, HostConstructor, HostDescriptor, HostError, HostKind, HostRegistry, HostResult,
    LifecycleCapability, ServerHost, StartArity,
};
pub use protocol::{PROTOCOL_VERSION, ProtocolError, Request, Response};
