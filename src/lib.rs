//! Kiln - dynamic extension loading for an API host
//!
//! This library provides the pieces a host needs to extend its request API
//! with shared libraries discovered at startup.
//!
//! # Modules
//!
//! - [`registry`]: Route name to request handler mapping, plus a minimal dispatcher
//! - [`extension`]: Directory scanning, library loading and the host ABI for extensions
//! - [`config`]: Configuration management and serialization
//! - [`host`]: Built-in routes and request parsing used by the `kiln` binary

pub mod config;
pub mod extension;
pub mod host;
pub mod registry;

pub use extension::{ExtensionLoader, LoadError};
pub use registry::{ApiArgs, ApiHandler, DuplicatePolicy, ExtensionRegistry, RegistryError};
