//! Export the host ABI from the `kiln` binary.
//!
//! Extensions resolve `zlm_api_register` and friends from the process handle
//! at runtime, which only works if the executable's symbols are in the
//! dynamic symbol table. Test binaries get the same treatment so the native
//! loading tests can open real extension libraries.

use std::env;

fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    match env::var("CARGO_CFG_TARGET_OS").as_deref() {
        Ok("linux" | "android" | "freebsd" | "netbsd" | "openbsd" | "dragonfly") => {
            println!("cargo:rustc-link-arg-bins=-Wl,--export-dynamic");
            println!("cargo:rustc-link-arg-tests=-Wl,--export-dynamic");
        }
        Ok("macos" | "ios") => {
            println!("cargo:rustc-link-arg-bins=-Wl,-export_dynamic");
            println!("cargo:rustc-link-arg-tests=-Wl,-export_dynamic");
        }
        _ => {}
    }
}
