//! Extension used by the native loading tests.
//!
//! The host functions are left as undefined symbols and bound by the dynamic
//! linker against the test executable when the library is opened.

use kiln_abi::{guard_handler, guard_init, RawResult, KILN_OK};
use std::ffi::CStr;
use std::os::raw::{c_char, c_int};

extern "C" {
    fn zlm_api_register(name: *const c_char, handler: kiln_abi::RawHandlerFn) -> c_int;
    fn zlm_api_result_set(out: *mut RawResult, key: *const c_char, value_json: *const c_char)
        -> c_int;
    fn zlm_plugin_fail(reason: *const c_char);
}

unsafe extern "C-unwind" fn hello(_args: *const c_char, out: *mut RawResult) {
    guard_handler(zlm_api_result_set, out, || {
        zlm_api_result_set(out, c"code".as_ptr(), c"0".as_ptr());
        zlm_api_result_set(out, c"msg".as_ptr(), c"\"hello from fixture\"".as_ptr());
    });
}

unsafe extern "C-unwind" fn boom(_args: *const c_char, out: *mut RawResult) {
    guard_handler(zlm_api_result_set, out, || panic!("handler lost its stream"));
}

unsafe fn register(name: &CStr, handler: kiln_abi::RawHandlerFn) -> Result<(), String> {
    match zlm_api_register(name.as_ptr(), handler) {
        KILN_OK => Ok(()),
        status => Err(format!(
            "could not register {} (status {status})",
            name.to_string_lossy()
        )),
    }
}

#[no_mangle]
pub extern "C-unwind" fn zlm_plugin_init() {
    unsafe {
        guard_init(zlm_plugin_fail, || {
            register(c"/fixture/hello", hello)?;
            if cfg!(feature = "fail-init") {
                panic!("fixture refuses to start");
            }
            register(c"/fixture/boom", boom)
        });
    }
}
