//! API route registry
//!
//! Maps route names (for example `/index/api/getApiList`) to request handlers.
//! The host owns the registry; extensions add routes to it while they are
//! being initialized, and the dispatcher reads from it for every request.

use kiln_abi::panic_message;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, warn};

/// Request arguments, as received by a handler
pub type ApiArgs = HashMap<String, String>;

/// A request handler.
///
/// The handler reads its arguments and writes result fields into `val`,
/// which starts out as an empty JSON object. Failures are reported in-band,
/// conventionally through a non-zero `code` field and a `msg` field.
pub trait ApiHandler: Send + Sync {
    fn handle(&self, args: &ApiArgs, val: &mut Value);
}

impl<F> ApiHandler for F
where
    F: Fn(&ApiArgs, &mut Value) + Send + Sync,
{
    fn handle(&self, args: &ApiArgs, val: &mut Value) {
        self(args, val);
    }
}

/// What happens when a route name is registered twice
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DuplicatePolicy {
    /// Keep the first handler and report a conflict
    #[default]
    Reject,
    /// Replace the previous handler
    Overwrite,
}

/// Who installed a route
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOrigin {
    Host,
    Extension(PathBuf),
}

impl fmt::Display for RouteOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Host => f.write_str("host"),
            Self::Extension(path) => write!(f, "{}", path.display()),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("route name must not be empty")]
    EmptyName,

    #[error("route '{name}' is already registered by {existing}")]
    Conflict { name: String, existing: RouteOrigin },

    #[error("no handler registered for route '{0}'")]
    NotFound(String),

    #[error("handler for route '{name}' panicked: {message}")]
    HandlerPanicked { name: String, message: String },
}

struct RouteEntry {
    handler: Arc<dyn ApiHandler>,
    origin: RouteOrigin,
}

/// Registry of named request handlers
pub struct ExtensionRegistry {
    routes: RwLock<HashMap<String, RouteEntry>>,
    policy: DuplicatePolicy,
}

impl ExtensionRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new(policy: DuplicatePolicy) -> Self {
        Self {
            routes: RwLock::new(HashMap::new()),
            policy,
        }
    }

    #[must_use]
    pub fn policy(&self) -> DuplicatePolicy {
        self.policy
    }

    /// Register a host-provided handler
    ///
    /// # Errors
    /// Returns an error if the name is empty, or if it is already taken and
    /// the registry rejects duplicates
    pub fn register<H>(&self, name: impl Into<String>, handler: H) -> Result<(), RegistryError>
    where
        H: ApiHandler + 'static,
    {
        self.register_from(name, Arc::new(handler), RouteOrigin::Host)
    }

    /// Register a handler on behalf of `origin`
    ///
    /// # Errors
    /// Returns an error if the name is empty, or if it is already taken and
    /// the registry rejects duplicates
    pub fn register_from(
        &self,
        name: impl Into<String>,
        handler: Arc<dyn ApiHandler>,
        origin: RouteOrigin,
    ) -> Result<(), RegistryError> {
        let name = name.into();
        if name.is_empty() {
            return Err(RegistryError::EmptyName);
        }

        let mut routes = self.routes.write().unwrap_or_else(PoisonError::into_inner);

        if let Some(existing) = routes.get(&name) {
            match self.policy {
                DuplicatePolicy::Reject => {
                    return Err(RegistryError::Conflict {
                        name,
                        existing: existing.origin.clone(),
                    });
                }
                DuplicatePolicy::Overwrite => {
                    warn!(
                        route = %name,
                        previous = %existing.origin,
                        replacement = %origin,
                        "Replacing registered route"
                    );
                }
            }
        }

        debug!(route = %name, origin = %origin, "Registered route");
        routes.insert(name, RouteEntry { handler, origin });
        Ok(())
    }

    /// Look up the handler for an exact route name
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn ApiHandler>> {
        self.read()
            .get(name)
            .map(|entry| Arc::clone(&entry.handler))
    }

    #[must_use]
    pub fn origin(&self, name: &str) -> Option<RouteOrigin> {
        self.read().get(name).map(|entry| entry.origin.clone())
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.read().contains_key(name)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// All registered routes with their origin, sorted by name
    #[must_use]
    pub fn routes(&self) -> Vec<(String, RouteOrigin)> {
        let mut routes: Vec<_> = self
            .read()
            .iter()
            .map(|(name, entry)| (name.clone(), entry.origin.clone()))
            .collect();
        routes.sort_by(|a, b| a.0.cmp(&b.0));
        routes
    }

    /// Invoke the handler registered under `name`
    ///
    /// The handler runs without the registry lock held, so it may itself
    /// register routes or dispatch other requests.
    ///
    /// A panic from a handler compiled into the host is caught and reported.
    /// Handlers from separately built extensions cannot unwind into the host
    /// (they catch their own panics, see `kiln_abi::guard_handler`).
    ///
    /// # Errors
    /// Returns an error if no handler is registered under `name`, or if the
    /// handler panicked
    pub fn dispatch(&self, name: &str, args: &ApiArgs) -> Result<Value, RegistryError> {
        let handler = self
            .get(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;

        let mut val = json!({});
        panic::catch_unwind(AssertUnwindSafe(|| handler.handle(args, &mut val))).map_err(
            |payload| RegistryError::HandlerPanicked {
                name: name.to_string(),
                message: panic_message(payload.as_ref()),
            },
        )?;

        Ok(val)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, RouteEntry>> {
        self.routes.read().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for ExtensionRegistry {
    fn default() -> Self {
        Self::new(DuplicatePolicy::default())
    }
}
