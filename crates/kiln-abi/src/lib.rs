//! Binary interface between the kiln host and its extensions.
//!
//! An extension is a dynamic library exporting a single entry symbol,
//! [`ENTRY_SYMBOL`], with C linkage and the [`EntryFn`] signature. While that
//! function runs, the extension may resolve the host functions named below
//! (for example through `dlsym` on the process handle) to install request
//! handlers.
//!
//! Only plain C types cross this boundary. Request arguments travel as a JSON
//! object of string values, results are written back field by field as JSON
//! text.
//!
//! An extension built as its own `cdylib` carries its own Rust runtime. A
//! panic unwinding out of it into the host is a foreign exception there and
//! aborts the whole process, so no panic may leave an extension function.
//! Wrap the entry point body in [`guard_init`] and every handler body in
//! [`guard_handler`]: both catch the panic on the extension side and report
//! it through the host ABI instead.

use std::any::Any;
use std::ffi::CString;
use std::fmt::Write as _;
use std::os::raw::{c_char, c_int};
use std::panic::{self, AssertUnwindSafe};

/// Entry point every extension must export.
pub const ENTRY_SYMBOL: &str = "zlm_plugin_init";

/// Host function installing a request handler, see [`RegisterFn`].
pub const REGISTER_SYMBOL: &str = "zlm_api_register";

/// Host function writing one result field, see [`ResultSetFn`].
pub const RESULT_SET_SYMBOL: &str = "zlm_api_result_set";

/// Host function reporting an initialization failure, see [`FailFn`].
pub const FAIL_SYMBOL: &str = "zlm_plugin_fail";

/// Call succeeded.
pub const KILN_OK: c_int = 0;
/// No registration scope is active on the calling thread.
pub const KILN_ERR_NO_SCOPE: c_int = -1;
/// A pointer argument was null, empty or not valid UTF-8.
pub const KILN_ERR_INVALID: c_int = -2;
/// The route name is already taken and the host rejects duplicates.
pub const KILN_ERR_CONFLICT: c_int = -3;

/// Result `code` of a request whose handler panicked.
pub const HANDLER_PANIC_CODE: i64 = -400;

/// Opaque result document handed to a handler during dispatch.
#[repr(C)]
pub struct RawResult {
    _private: [u8; 0],
}

/// Extension entry point.
///
/// It must not unwind into the host, see [`guard_init`]. The host still
/// catches unwinding from entry points linked into its own binary.
pub type EntryFn = unsafe extern "C-unwind" fn();

/// Request handler exported by an extension.
///
/// `args_json` is a NUL-terminated JSON object mapping argument names to
/// string values; it is only valid for the duration of the call. Results are
/// written into `out` through [`ResultSetFn`]. Like the entry point it must
/// not unwind, see [`guard_handler`].
pub type RawHandlerFn = unsafe extern "C-unwind" fn(args_json: *const c_char, out: *mut RawResult);

/// `zlm_api_register(name, handler) -> status`
pub type RegisterFn = unsafe extern "C" fn(name: *const c_char, handler: RawHandlerFn) -> c_int;

/// `zlm_api_result_set(out, key, value_json) -> status`
///
/// `value_json` is parsed as JSON; text that is not valid JSON is stored as a
/// string value.
pub type ResultSetFn =
    unsafe extern "C" fn(out: *mut RawResult, key: *const c_char, value_json: *const c_char) -> c_int;

/// `zlm_plugin_fail(reason)`
pub type FailFn = unsafe extern "C" fn(reason: *const c_char);

/// NUL-terminated form of a symbol name, as expected by `dlsym`-style lookups.
#[must_use]
pub fn symbol_bytes(name: &str) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(name.len() + 1);
    bytes.extend_from_slice(name.as_bytes());
    bytes.push(0);
    bytes
}

/// Best-effort text of a panic payload
#[must_use]
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Run `body`, stopping a panic here and returning its message
///
/// # Errors
/// Returns the panic message if `body` panicked
pub fn catch_panic<R>(body: impl FnOnce() -> R) -> Result<R, String> {
    panic::catch_unwind(AssertUnwindSafe(body)).map_err(|payload| panic_message(payload.as_ref()))
}

/// Run the body of an extension's entry point.
///
/// An `Err` returned by `body`, or a panic inside it, is handed to `fail`
/// and the host skips the extension. Nothing unwinds out of this function.
///
/// ```ignore
/// #[no_mangle]
/// pub extern "C-unwind" fn zlm_plugin_init() {
///     unsafe { kiln_abi::guard_init(zlm_plugin_fail, || register_routes()) }
/// }
/// ```
///
/// # Safety
/// `fail` must be the host's `zlm_plugin_fail`, and the call must happen
/// while the host runs this extension's entry point.
pub unsafe fn guard_init(fail: FailFn, body: impl FnOnce() -> Result<(), String>) {
    let reason = match catch_panic(body) {
        Ok(Ok(())) => return,
        Ok(Err(reason)) => reason,
        Err(message) => format!("panicked: {message}"),
    };

    let reason = to_c_string(&reason);
    fail(reason.as_ptr());
}

/// Run the body of a request handler.
///
/// If `body` panics, the result's `code` is set to [`HANDLER_PANIC_CODE`]
/// and `msg` to the panic message. Nothing unwinds out of this function.
///
/// # Safety
/// `result_set` must be the host's `zlm_api_result_set` and `out` the
/// pointer the host passed to the running handler.
pub unsafe fn guard_handler(result_set: ResultSetFn, out: *mut RawResult, body: impl FnOnce()) {
    let Err(message) = catch_panic(body) else {
        return;
    };

    let code = to_c_string(&HANDLER_PANIC_CODE.to_string());
    let msg = to_c_string(&json_string(&format!("handler panicked: {message}")));
    result_set(out, c"code".as_ptr(), code.as_ptr());
    result_set(out, c"msg".as_ptr(), msg.as_ptr());
}

fn to_c_string(text: &str) -> CString {
    CString::new(text.replace('\0', " ")).unwrap_or_default()
}

/// Quote `text` as a JSON string literal
#[must_use]
pub fn json_string(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 2);
    out.push('"');
    for c in text.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if u32::from(c) < 0x20 => {
                let _ = write!(out, "\\u{:04x}", u32::from(c));
            }
            c => out.push(c),
        }
    }
    out.push('"');
    out
}
