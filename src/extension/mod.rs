//! Dynamic extension loading
//!
//! Extensions are shared libraries dropped into the extension directory.
//! Each one exports `zlm_plugin_init`; the loader opens the library, calls
//! that function once and keeps the library mapped until shutdown. During the
//! call the extension installs request handlers through the host ABI in
//! [`abi`].
//!
//! A broken extension never takes the host down: open failures, a missing
//! entry point or a reported failure during initialization all end with the
//! library released and a log entry, and the scan moves on. Extensions
//! report their own panics as failures through the guards in `kiln_abi`;
//! unwinding across the library boundary aborts the process.

pub mod abi;
pub mod invoke;
pub mod library;
pub mod loader;

pub use kiln_abi::ENTRY_SYMBOL;
pub use library::{is_candidate, ExtensionImage, LibraryBackend, NativeBackend, LIBRARY_SUFFIX};
pub use loader::{CandidateOutcome, ExtensionLoader, LoadedExtension, ScanReport};

/// Why a candidate library did not make it into the live set
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LoadError {
    #[error("failed to open library: {reason}")]
    Open { reason: String },

    #[error("library does not export {symbol}: {reason}")]
    MissingEntry { symbol: String, reason: String },

    #[error("initialization panicked: {message}")]
    InitPanicked { message: String },

    #[error("initialization failed: {reason}")]
    InitFailed { reason: String },
}
