//! Example extension for the kiln host.
//!
//! Build with `cargo build --release` in `demos/extensions` and copy
//! `libkiln_extension_hello.so` into the host's `plugin/` directory.
//! It registers two routes:
//!
//! - `/plugin/example/hello` answers with a greeting
//! - `/plugin/example/echo` echoes the request arguments back
//!
//! Every function the host calls runs inside a `kiln_abi` guard: a panic
//! escaping this library would abort the host.

use kiln_abi::{
    guard_handler, guard_init, symbol_bytes, FailFn, RawHandlerFn, RawResult, RegisterFn,
    ResultSetFn, FAIL_SYMBOL, KILN_OK, REGISTER_SYMBOL, RESULT_SET_SYMBOL,
};
use serde_json::{json, Value};
use std::ffi::{CStr, CString};
use std::os::raw::c_char;
use std::sync::OnceLock;

/// Host functions, resolved once from the process handle
struct HostApi {
    register: RegisterFn,
    result_set: ResultSetFn,
    fail: FailFn,
}

static HOST: OnceLock<HostApi> = OnceLock::new();

const ROUTES: &[(&CStr, RawHandlerFn)] = &[
    (c"/plugin/example/hello", hello),
    (c"/plugin/example/echo", echo),
];

fn resolve_host() -> Result<HostApi, libloading::Error> {
    #[cfg(unix)]
    let this: libloading::Library = libloading::os::unix::Library::this().into();
    #[cfg(windows)]
    let this: libloading::Library = libloading::os::windows::Library::this()?.into();

    // Safety: the host exports these symbols with the kiln_abi signatures
    unsafe {
        let register = *this.get::<RegisterFn>(&symbol_bytes(REGISTER_SYMBOL))?;
        let result_set = *this.get::<ResultSetFn>(&symbol_bytes(RESULT_SET_SYMBOL))?;
        let fail = *this.get::<FailFn>(&symbol_bytes(FAIL_SYMBOL))?;
        Ok(HostApi {
            register,
            result_set,
            fail,
        })
    }
}

/// Write `val[key] = value` into the response
unsafe fn set(out: *mut RawResult, key: &CStr, value: &Value) {
    let Some(host) = HOST.get() else {
        return;
    };
    let Ok(text) = CString::new(value.to_string()) else {
        return;
    };
    (host.result_set)(out, key.as_ptr(), text.as_ptr());
}

/// Run a handler body with panics turned into an error result
unsafe fn handle(out: *mut RawResult, body: impl FnOnce()) {
    if let Some(host) = HOST.get() {
        guard_handler(host.result_set, out, body);
    }
}

unsafe extern "C-unwind" fn hello(_args: *const c_char, out: *mut RawResult) {
    handle(out, || {
        set(out, c"code", &json!(0));
        set(out, c"msg", &json!("Hello from example plugin!"));
        set(out, c"plugin", &json!("example_plugin"));
    });
}

unsafe extern "C-unwind" fn echo(args: *const c_char, out: *mut RawResult) {
    handle(out, || {
        let received = if args.is_null() {
            json!({})
        } else {
            CStr::from_ptr(args)
                .to_str()
                .ok()
                .and_then(|s| serde_json::from_str(s).ok())
                .unwrap_or_else(|| json!({}))
        };

        set(out, c"code", &json!(0));
        set(out, c"received_params", &received);
    });
}

fn register_routes(host: &HostApi) -> Result<(), String> {
    for (route, handler) in ROUTES {
        // Safety: `route` is NUL-terminated and `handler` lives as long as
        // this library stays loaded
        let status = unsafe { (host.register)(route.as_ptr(), *handler) };
        if status == KILN_OK {
            eprintln!("[example plugin]   registered {}", route.to_string_lossy());
        } else {
            eprintln!(
                "[example plugin]   could not register {} (status {status})",
                route.to_string_lossy()
            );
        }
    }
    Ok(())
}

/// Entry point called once by the host after loading this library
#[no_mangle]
pub extern "C-unwind" fn zlm_plugin_init() {
    eprintln!("[example plugin] initializing...");

    let host = match resolve_host() {
        Ok(api) => HOST.get_or_init(|| api),
        Err(e) => {
            // Without the host API there is no way to report the failure
            eprintln!("[example plugin] kiln host API not available: {e}");
            return;
        }
    };

    // Safety: `host.fail` is the host's zlm_plugin_fail and the host is
    // running this entry point
    unsafe { guard_init(host.fail, || register_routes(host)) };
}
