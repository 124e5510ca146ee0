//! Host side of the extension ABI.
//!
//! The entry point of an extension takes no arguments, so the registry it
//! should populate is handed over out of band: while the loader runs an entry
//! point it binds a [`RegistrationScope`] to the current thread, and the
//! exported `zlm_api_*` functions act on whatever scope is bound.
//!
//! Extensions resolve these functions at runtime from the process handle.
//! The host binary is linked with `--export-dynamic` so they are visible to
//! the dynamic linker.

use kiln_abi::{
    RawHandlerFn, RawResult, KILN_ERR_CONFLICT, KILN_ERR_INVALID, KILN_ERR_NO_SCOPE, KILN_OK,
};
use serde_json::{json, Value};
use std::cell::RefCell;
use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_int};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::registry::{ApiArgs, ApiHandler, ExtensionRegistry, RegistryError, RouteOrigin};

/// Result code written by handlers whose library is gone
pub const CODE_EXTENSION_UNLOADED: i64 = -1;

/// Liveness of one loaded library image.
///
/// Handlers registered by an extension hold a clone; the loader revokes it
/// right before the image is released.
#[derive(Debug, Clone)]
pub struct ImageToken(Arc<AtomicBool>);

impl ImageToken {
    #[must_use]
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }

    #[must_use]
    pub fn is_live(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub fn revoke(&self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Default for ImageToken {
    fn default() -> Self {
        Self::new()
    }
}

/// State shared between the loader and the exported functions for the
/// duration of one entry point call
pub struct RegistrationScope {
    registry: Arc<ExtensionRegistry>,
    origin: PathBuf,
    token: ImageToken,
    routes: Vec<String>,
    failure: Option<String>,
}

impl RegistrationScope {
    #[must_use]
    pub fn new(registry: Arc<ExtensionRegistry>, origin: &Path, token: ImageToken) -> Self {
        Self {
            registry,
            origin: origin.to_path_buf(),
            token,
            routes: Vec::new(),
            failure: None,
        }
    }

    /// Routes registered so far
    #[must_use]
    pub fn routes(&self) -> &[String] {
        &self.routes
    }

    /// Failure reported through `zlm_plugin_fail`, if any
    #[must_use]
    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    /// Install a foreign handler
    ///
    /// # Errors
    /// Propagates the registry's rejection of the name
    pub fn register(&mut self, name: &str, handler: RawHandlerFn) -> Result<(), RegistryError> {
        let foreign = ForeignHandler {
            raw: handler,
            token: self.token.clone(),
            origin: self.origin.clone(),
        };

        self.registry.register_from(
            name,
            Arc::new(foreign),
            RouteOrigin::Extension(self.origin.clone()),
        )?;
        self.routes.push(name.to_string());
        Ok(())
    }

    /// Record an initialization failure. The first reason wins.
    pub fn fail(&mut self, reason: String) {
        if self.failure.is_none() {
            self.failure = Some(reason);
        }
    }
}

thread_local! {
    static ACTIVE_SCOPE: RefCell<Option<RegistrationScope>> = const { RefCell::new(None) };
}

/// Run `f` with `scope` bound to the current thread, then hand the scope back
///
/// Whatever was bound before is restored afterwards, even if `f` unwinds.
pub fn with_scope<R>(scope: RegistrationScope, f: impl FnOnce() -> R) -> (R, RegistrationScope) {
    struct Restore(Option<Option<RegistrationScope>>);

    impl Drop for Restore {
        fn drop(&mut self) {
            if let Some(previous) = self.0.take() {
                ACTIVE_SCOPE.with(|active| *active.borrow_mut() = previous);
            }
        }
    }

    let previous = ACTIVE_SCOPE.with(|active| active.borrow_mut().replace(scope));
    let restore = Restore(Some(previous));

    let result = f();

    let scope = ACTIVE_SCOPE.with(|active| active.borrow_mut().take());
    drop(restore);

    match scope {
        Some(scope) => (result, scope),
        None => unreachable!("registration scope taken while bound"),
    }
}

fn with_active<R>(f: impl FnOnce(&mut RegistrationScope) -> R) -> Option<R> {
    ACTIVE_SCOPE.with(|active| active.borrow_mut().as_mut().map(f))
}

/// Read a NUL-terminated UTF-8 string handed over by an extension
unsafe fn borrowed_str<'a>(ptr: *const c_char) -> Option<&'a str> {
    if ptr.is_null() {
        return None;
    }
    CStr::from_ptr(ptr).to_str().ok()
}

/// Register `handler` under `name` in the registry being populated.
///
/// # Safety
/// `name` must be null or point to a NUL-terminated string, and `handler`
/// must stay callable for as long as the calling library is loaded.
#[no_mangle]
pub unsafe extern "C" fn zlm_api_register(name: *const c_char, handler: RawHandlerFn) -> c_int {
    let Some(name) = borrowed_str(name).filter(|n| !n.is_empty()) else {
        return KILN_ERR_INVALID;
    };

    let outcome = with_active(|scope| {
        let result = scope.register(name, handler);
        (result, scope.origin.clone())
    });

    match outcome {
        None => {
            warn!(route = name, "Route registered outside of extension initialization");
            KILN_ERR_NO_SCOPE
        }
        Some((Ok(()), origin)) => {
            debug!(route = name, path = %origin.display(), "Extension registered route");
            KILN_OK
        }
        Some((Err(RegistryError::Conflict { existing, .. }), origin)) => {
            warn!(
                route = name,
                path = %origin.display(),
                existing = %existing,
                "Extension route conflicts with an existing registration, dropped"
            );
            KILN_ERR_CONFLICT
        }
        Some((Err(e), origin)) => {
            warn!(path = %origin.display(), "Extension registration rejected: {}", e);
            KILN_ERR_INVALID
        }
    }
}

/// Report that the current extension failed to initialize.
///
/// # Safety
/// `reason` must be null or point to a NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn zlm_plugin_fail(reason: *const c_char) {
    let reason = if reason.is_null() {
        "no reason given".to_string()
    } else {
        CStr::from_ptr(reason).to_string_lossy().into_owned()
    };

    if with_active(|scope| scope.fail(reason.clone())).is_none() {
        warn!("Initialization failure reported outside of extension initialization: {}", reason);
    }
}

/// Set `key` in the result document of the request being dispatched.
///
/// # Safety
/// `out` must be the pointer passed to the running handler; `key` and
/// `value_json` must be null or point to NUL-terminated strings.
#[no_mangle]
pub unsafe extern "C" fn zlm_api_result_set(
    out: *mut RawResult,
    key: *const c_char,
    value_json: *const c_char,
) -> c_int {
    if out.is_null() {
        return KILN_ERR_INVALID;
    }
    let Some(key) = borrowed_str(key) else {
        return KILN_ERR_INVALID;
    };
    let Some(raw) = borrowed_str(value_json) else {
        return KILN_ERR_INVALID;
    };

    let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));

    let sink = &mut *out.cast::<ResultSink<'_>>();
    if !sink.val.is_object() {
        *sink.val = json!({});
    }
    sink.val[key] = value;
    KILN_OK
}

/// Addresses of the exported functions.
///
/// Referencing them from the binary keeps the linker from discarding them.
#[must_use]
pub fn host_exports() -> [usize; 3] {
    [
        zlm_api_register as *const () as usize,
        zlm_api_result_set as *const () as usize,
        zlm_plugin_fail as *const () as usize,
    ]
}

struct ResultSink<'a> {
    val: &'a mut Value,
}

/// Adapter from an extension's C handler to [`ApiHandler`]
struct ForeignHandler {
    raw: RawHandlerFn,
    token: ImageToken,
    origin: PathBuf,
}

impl ApiHandler for ForeignHandler {
    fn handle(&self, args: &ApiArgs, val: &mut Value) {
        if !self.token.is_live() {
            val["code"] = json!(CODE_EXTENSION_UNLOADED);
            val["msg"] = json!(format!(
                "extension {} is no longer loaded",
                self.origin.display()
            ));
            return;
        }

        // JSON escapes NUL, so the encoded arguments never contain one
        let args_json = serde_json::to_string(args)
            .ok()
            .and_then(|s| CString::new(s).ok())
            .unwrap_or_default();

        let mut sink = ResultSink { val };
        let out: *mut RawResult = std::ptr::addr_of_mut!(sink).cast();

        // Safety: the token is live, so the library providing `raw` is still
        // mapped. `out` points at `sink`, which outlives the call.
        unsafe { (self.raw)(args_json.as_ptr(), out) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    unsafe extern "C-unwind" fn greet(_args: *const c_char, out: *mut RawResult) {
        zlm_api_result_set(out, c"code".as_ptr(), c"0".as_ptr());
        zlm_api_result_set(out, c"msg".as_ptr(), c"hi there".as_ptr());
    }

    fn scope(registry: &Arc<ExtensionRegistry>, token: &ImageToken) -> RegistrationScope {
        RegistrationScope::new(Arc::clone(registry), Path::new("plugin/libtest.so"), token.clone())
    }

    #[test]
    fn test_host_exports_are_distinct_addresses() {
        let exports = host_exports();
        assert!(exports.iter().all(|&addr| addr != 0));
        assert_ne!(exports[0], exports[1]);
        assert_ne!(exports[1], exports[2]);
        assert_ne!(exports[0], exports[2]);
    }

    #[test]
    fn test_register_outside_scope() {
        let status = unsafe { zlm_api_register(c"/nowhere".as_ptr(), greet) };
        assert_eq!(status, KILN_ERR_NO_SCOPE);
    }

    #[test]
    fn test_register_rejects_invalid_names() {
        let registry = Arc::new(ExtensionRegistry::default());
        let token = ImageToken::new();

        let (statuses, scope) = with_scope(scope(&registry, &token), || unsafe {
            [
                zlm_api_register(std::ptr::null(), greet),
                zlm_api_register(c"".as_ptr(), greet),
            ]
        });

        assert_eq!(statuses, [KILN_ERR_INVALID, KILN_ERR_INVALID]);
        assert!(scope.routes().is_empty());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_scoped_registration_and_dispatch() {
        let registry = Arc::new(ExtensionRegistry::default());
        let token = ImageToken::new();

        let (status, scope) = with_scope(scope(&registry, &token), || unsafe {
            zlm_api_register(c"/x/greet".as_ptr(), greet)
        });
        assert_eq!(status, KILN_OK);
        assert_eq!(scope.routes(), ["/x/greet".to_string()]);
        assert_eq!(
            registry.origin("/x/greet"),
            Some(RouteOrigin::Extension(PathBuf::from("plugin/libtest.so")))
        );

        let val = registry.dispatch("/x/greet", &ApiArgs::new()).unwrap();
        assert_eq!(val["code"], 0);
        assert_eq!(val["msg"], "hi there");

        // Scope is unbound again
        let status = unsafe { zlm_api_register(c"/x/late".as_ptr(), greet) };
        assert_eq!(status, KILN_ERR_NO_SCOPE);
    }

    #[test]
    fn test_conflict_status() {
        let registry = Arc::new(ExtensionRegistry::default());
        registry
            .register("/taken", |_: &ApiArgs, _: &mut Value| {})
            .unwrap();
        let token = ImageToken::new();

        let (status, scope) = with_scope(scope(&registry, &token), || unsafe {
            zlm_api_register(c"/taken".as_ptr(), greet)
        });
        assert_eq!(status, KILN_ERR_CONFLICT);
        assert!(scope.routes().is_empty());
        assert_eq!(registry.origin("/taken"), Some(RouteOrigin::Host));
    }

    #[test]
    fn test_fail_keeps_first_reason() {
        let registry = Arc::new(ExtensionRegistry::default());
        let token = ImageToken::new();

        let ((), scope) = with_scope(scope(&registry, &token), || unsafe {
            zlm_plugin_fail(c"missing config".as_ptr());
            zlm_plugin_fail(c"second".as_ptr());
        });
        assert_eq!(scope.failure(), Some("missing config"));
    }

    #[test]
    fn test_revoked_handler_is_inert() {
        let registry = Arc::new(ExtensionRegistry::default());
        let token = ImageToken::new();

        let (status, _scope) = with_scope(scope(&registry, &token), || unsafe {
            zlm_api_register(c"/x/greet".as_ptr(), greet)
        });
        assert_eq!(status, KILN_OK);

        token.revoke();
        let val = registry.dispatch("/x/greet", &ApiArgs::new()).unwrap();
        assert_eq!(val["code"], CODE_EXTENSION_UNLOADED);
        assert!(val["msg"].as_str().unwrap().contains("libtest.so"));
    }

    #[test]
    fn test_scope_unbound_after_unwind() {
        let registry = Arc::new(ExtensionRegistry::default());
        let token = ImageToken::new();

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            with_scope(scope(&registry, &token), || panic!("init blew up"))
        }));
        assert!(result.is_err());

        let status = unsafe { zlm_api_register(c"/x/after".as_ptr(), greet) };
        assert_eq!(status, KILN_ERR_NO_SCOPE);
    }
}
