//! Running an extension's entry point.
//!
//! Failures of an entry point are turned into a [`LoadError`] here. An
//! extension reports failure through `zlm_plugin_fail`, which is also how
//! `kiln_abi::guard_init` reports a panic it caught inside the extension.
//!
//! A panic that unwinds out of a separately built library cannot be caught:
//! it is a foreign exception to the host's runtime and aborts the process.
//! Only entry points sharing the host's runtime (linked into the same
//! binary) end up as [`LoadError::InitPanicked`].

use kiln_abi::{panic_message, EntryFn};
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use super::abi::{self, ImageToken, RegistrationScope};
use super::LoadError;
use crate::registry::ExtensionRegistry;

/// Successful initialization
#[derive(Debug, Clone)]
pub struct InitReport {
    /// Routes the extension registered
    pub routes: Vec<String>,
    pub elapsed: Duration,
}

/// Call `entry` once with a registration scope for `path` bound.
///
/// `warn_after` arms a watchdog that logs if the call is still running after
/// that long; `Duration::ZERO` disables it. The call itself cannot be
/// interrupted.
///
/// # Errors
/// Returns [`LoadError::InitPanicked`] if an entry point sharing the host's
/// runtime unwound, or
/// [`LoadError::InitFailed`] if it reported failure through
/// `zlm_plugin_fail`. Routes registered before the failure stay installed.
///
/// # Safety
/// `entry` must point into a library that stays loaded for the duration of
/// the call.
pub unsafe fn invoke_entry(
    entry: EntryFn,
    path: &Path,
    registry: &Arc<ExtensionRegistry>,
    token: &ImageToken,
    warn_after: Duration,
) -> Result<InitReport, LoadError> {
    let scope = RegistrationScope::new(Arc::clone(registry), path, token.clone());
    let watchdog = Watchdog::arm(path, warn_after);
    let started = Instant::now();

    let (outcome, scope) = abi::with_scope(scope, || {
        panic::catch_unwind(AssertUnwindSafe(|| {
            // Safety: upheld by the caller
            unsafe { entry() }
        }))
    });

    let elapsed = started.elapsed();
    drop(watchdog);
    debug!(path = %path.display(), ?elapsed, "Entry point returned");

    if let Err(payload) = outcome {
        return Err(LoadError::InitPanicked {
            message: panic_message(payload.as_ref()),
        });
    }

    if let Some(reason) = scope.failure() {
        return Err(LoadError::InitFailed {
            reason: reason.to_string(),
        });
    }

    Ok(InitReport {
        routes: scope.routes().to_vec(),
        elapsed,
    })
}

/// Logs a warning when an entry point runs for too long
struct Watchdog {
    done: Option<mpsc::Sender<()>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl Watchdog {
    fn arm(path: &Path, warn_after: Duration) -> Self {
        if warn_after.is_zero() {
            return Self {
                done: None,
                handle: None,
            };
        }

        let (done, finished) = mpsc::channel::<()>();
        let path = path.display().to_string();

        let handle = thread::Builder::new()
            .name("kiln-init-watchdog".to_string())
            .spawn(move || {
                if let Err(RecvTimeoutError::Timeout) = finished.recv_timeout(warn_after) {
                    warn!(
                        path = %path,
                        "Extension still initializing after {:?}; the scan is blocked until it returns",
                        warn_after
                    );
                }
            });

        match handle {
            Ok(handle) => Self {
                done: Some(done),
                handle: Some(handle),
            },
            Err(e) => {
                debug!("Could not start init watchdog: {}", e);
                Self {
                    done: None,
                    handle: None,
                }
            }
        }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        // Dropping the sender wakes the watchdog if it is still waiting
        drop(self.done.take());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_abi::KILN_OK;
    use std::os::raw::c_char;

    unsafe extern "C-unwind" fn noop_handler(_args: *const c_char, _out: *mut kiln_abi::RawResult) {}

    unsafe extern "C-unwind" fn registers_two() {
        assert_eq!(abi::zlm_api_register(c"/t/one".as_ptr(), noop_handler), KILN_OK);
        assert_eq!(abi::zlm_api_register(c"/t/two".as_ptr(), noop_handler), KILN_OK);
    }

    unsafe extern "C-unwind" fn panics_after_register() {
        abi::zlm_api_register(c"/t/partial".as_ptr(), noop_handler);
        panic!("init exploded");
    }

    unsafe extern "C-unwind" fn reports_failure() {
        abi::zlm_plugin_fail(c"database unreachable".as_ptr());
    }

    unsafe extern "C-unwind" fn sleeps() {
        thread::sleep(Duration::from_millis(50));
    }

    fn run(entry: EntryFn, registry: &Arc<ExtensionRegistry>) -> Result<InitReport, LoadError> {
        let token = ImageToken::new();
        unsafe {
            invoke_entry(
                entry,
                Path::new("plugin/libt.so"),
                registry,
                &token,
                Duration::ZERO,
            )
        }
    }

    #[test]
    fn test_successful_entry_reports_routes() {
        let registry = Arc::new(ExtensionRegistry::default());
        let report = run(registers_two, &registry).unwrap();

        assert_eq!(report.routes, vec!["/t/one".to_string(), "/t/two".to_string()]);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_panic_is_contained() {
        let registry = Arc::new(ExtensionRegistry::default());
        let err = run(panics_after_register, &registry).unwrap_err();

        match err {
            LoadError::InitPanicked { message } => assert!(message.contains("init exploded")),
            other => panic!("unexpected error: {other}"),
        }
        // No rollback of what was registered before the panic
        assert!(registry.contains("/t/partial"));
    }

    #[test]
    fn test_reported_failure() {
        let registry = Arc::new(ExtensionRegistry::default());
        let err = run(reports_failure, &registry).unwrap_err();

        assert!(
            matches!(err, LoadError::InitFailed { ref reason } if reason == "database unreachable")
        );
    }

    #[test]
    fn test_watchdog_does_not_interrupt() {
        let registry = Arc::new(ExtensionRegistry::default());
        let token = ImageToken::new();

        let report = unsafe {
            invoke_entry(
                sleeps,
                Path::new("plugin/libslow.so"),
                &registry,
                &token,
                Duration::from_millis(5),
            )
        }
        .unwrap();
        assert!(report.elapsed >= Duration::from_millis(50));
    }
}
