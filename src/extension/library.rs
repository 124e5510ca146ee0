//! Opening extension libraries and resolving their entry point.

use kiln_abi::EntryFn;
use libloading::{Library, Symbol};
use std::path::Path;

use super::LoadError;

/// File suffix of loadable extensions on this platform
#[cfg(windows)]
pub const LIBRARY_SUFFIX: &str = "dll";

/// File suffix of loadable extensions on this platform
#[cfg(not(windows))]
pub const LIBRARY_SUFFIX: &str = "so";

/// Whether `path` names a file the loader should try to open
#[must_use]
pub fn is_candidate(path: &Path) -> bool {
    let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
        return false;
    };

    if cfg!(windows) {
        ext.eq_ignore_ascii_case(LIBRARY_SUFFIX)
    } else {
        ext == LIBRARY_SUFFIX
    }
}

/// Opens extension libraries.
///
/// The loader only talks to libraries through this trait, so the load
/// sequence can be driven without real shared objects.
pub trait LibraryBackend {
    /// Map the library at `path` into the process
    ///
    /// # Errors
    /// Returns [`LoadError::Open`] if the platform loader rejects the file
    fn open(&self, path: &Path) -> Result<Box<dyn ExtensionImage>, LoadError>;
}

/// A library mapped into the process. Dropping it releases the library.
pub trait ExtensionImage: Send {
    /// Resolve the entry point exported under `symbol`
    ///
    /// The returned pointer is only valid while `self` is alive.
    ///
    /// # Errors
    /// Returns [`LoadError::MissingEntry`] if the symbol is not exported
    fn entry_point(&self, symbol: &str) -> Result<EntryFn, LoadError>;
}

/// Backend over the platform dynamic loader
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeBackend;

impl LibraryBackend for NativeBackend {
    fn open(&self, path: &Path) -> Result<Box<dyn ExtensionImage>, LoadError> {
        // Safety: running library constructors is inherent to loading an
        // extension; the host trusts the files in its extension directory.
        let library = unsafe { open_library(path) }.map_err(|e| LoadError::Open {
            reason: e.to_string(),
        })?;

        Ok(Box::new(NativeImage { library }))
    }
}

/// Resolve all symbols now and keep them private to this library
#[cfg(unix)]
unsafe fn open_library(path: &Path) -> Result<Library, libloading::Error> {
    use libloading::os::unix::{Library as UnixLibrary, RTLD_LOCAL, RTLD_NOW};

    UnixLibrary::open(Some(path), RTLD_NOW | RTLD_LOCAL).map(Library::from)
}

#[cfg(windows)]
unsafe fn open_library(path: &Path) -> Result<Library, libloading::Error> {
    Library::new(path)
}

struct NativeImage {
    library: Library,
}

impl ExtensionImage for NativeImage {
    fn entry_point(&self, symbol: &str) -> Result<EntryFn, LoadError> {
        let name = kiln_abi::symbol_bytes(symbol);

        // Safety: the exported symbol is trusted to have the `EntryFn`
        // signature. The pointer is copied out of the `Symbol`; callers keep
        // the image alive for as long as they use it.
        let entry: Symbol<EntryFn> =
            unsafe { self.library.get(&name) }.map_err(|e| LoadError::MissingEntry {
                symbol: symbol.to_string(),
                reason: e.to_string(),
            })?;

        Ok(*entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tempfile::tempdir;

    #[test]
    fn test_candidate_suffix() {
        let native = PathBuf::from(format!("plugin/libhello.{LIBRARY_SUFFIX}"));
        assert!(is_candidate(&native));

        assert!(!is_candidate(Path::new("plugin/README.md")));
        assert!(!is_candidate(Path::new("plugin/libhello")));
        assert!(!is_candidate(Path::new("plugin/libhello.so.bak")));
        assert!(!is_candidate(Path::new("plugin/libhello.dylib")));
    }

    #[cfg(not(windows))]
    #[test]
    fn test_dll_is_not_a_candidate_on_unix() {
        assert!(!is_candidate(Path::new("plugin/hello.dll")));
    }

    #[test]
    fn test_open_rejects_garbage() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(format!("libgarbage.{LIBRARY_SUFFIX}"));
        std::fs::write(&path, b"definitely not a shared object").unwrap();

        let err = NativeBackend.open(&path).err().unwrap();
        assert!(matches!(err, LoadError::Open { .. }));
    }

    #[test]
    fn test_open_missing_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(format!("libabsent.{LIBRARY_SUFFIX}"));

        assert!(NativeBackend.open(&path).is_err());
    }
}
