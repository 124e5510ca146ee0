use chrono::{DateTime, Utc};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::abi::ImageToken;
use super::invoke::invoke_entry;
use super::library::{is_candidate, ExtensionImage, LibraryBackend, NativeBackend};
use super::{LoadError, ENTRY_SYMBOL};
use crate::registry::ExtensionRegistry;

/// Default time an entry point may run before the watchdog complains
pub const DEFAULT_INIT_WARN_AFTER: Duration = Duration::from_secs(5);

/// Loads extensions from a directory and keeps them mapped until shutdown
pub struct ExtensionLoader<B: LibraryBackend = NativeBackend> {
    backend: B,
    registry: Arc<ExtensionRegistry>,
    live: Vec<LoadedExtension>,
    init_warn_after: Duration,
}

/// An initialized extension
pub struct LoadedExtension {
    /// Path the library was loaded from
    pub path: PathBuf,
    pub loaded_at: DateTime<Utc>,
    /// Routes registered during initialization
    pub routes: Vec<String>,
    canonical: PathBuf,
    token: ImageToken,
    // Dropped last: releases the library
    #[allow(dead_code)]
    image: Box<dyn ExtensionImage>,
}

impl Drop for LoadedExtension {
    fn drop(&mut self) {
        // Handlers from this library must stop calling into it before the
        // image field is dropped
        self.token.revoke();
        debug!(path = %self.path.display(), "Releasing extension library");
    }
}

impl std::fmt::Debug for LoadedExtension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedExtension")
            .field("path", &self.path)
            .field("loaded_at", &self.loaded_at)
            .field("routes", &self.routes)
            .finish_non_exhaustive()
    }
}

/// What happened to one candidate file during a scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CandidateOutcome {
    Loaded { routes: Vec<String> },
    /// The same file is already in the live set
    AlreadyLoaded,
    Failed(LoadError),
}

#[derive(Debug, Clone)]
pub struct CandidateReport {
    pub path: PathBuf,
    pub outcome: CandidateOutcome,
}

/// Per-candidate result of a scan
#[derive(Debug, Clone, Default)]
pub struct ScanReport {
    pub dir: PathBuf,
    pub candidates: Vec<CandidateReport>,
}

impl ScanReport {
    /// Number of extensions that entered the live set
    #[must_use]
    pub fn loaded(&self) -> usize {
        self.candidates
            .iter()
            .filter(|c| matches!(c.outcome, CandidateOutcome::Loaded { .. }))
            .count()
    }

    pub fn failures(&self) -> impl Iterator<Item = (&Path, &LoadError)> {
        self.candidates.iter().filter_map(|c| match &c.outcome {
            CandidateOutcome::Failed(e) => Some((c.path.as_path(), e)),
            _ => None,
        })
    }
}

impl ExtensionLoader<NativeBackend> {
    /// Create a loader that opens libraries with the platform loader
    #[must_use]
    pub fn new(registry: Arc<ExtensionRegistry>) -> Self {
        Self::with_backend(NativeBackend, registry)
    }
}

impl<B: LibraryBackend> ExtensionLoader<B> {
    #[must_use]
    pub fn with_backend(backend: B, registry: Arc<ExtensionRegistry>) -> Self {
        Self {
            backend,
            registry,
            live: Vec::new(),
            init_warn_after: DEFAULT_INIT_WARN_AFTER,
        }
    }

    /// Set how long an entry point may run before a warning is logged.
    /// `Duration::ZERO` disables the warning.
    #[must_use]
    pub fn with_init_warning(mut self, after: Duration) -> Self {
        self.init_warn_after = after;
        self
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<ExtensionRegistry> {
        &self.registry
    }

    /// Load every extension in `dir`, returning how many were initialized
    pub fn scan<P: AsRef<Path>>(&mut self, dir: P) -> usize {
        self.scan_detailed(dir).loaded()
    }

    /// Load every extension in `dir`, reporting the outcome per candidate
    ///
    /// A missing directory is not an error: the report is simply empty.
    pub fn scan_detailed<P: AsRef<Path>>(&mut self, dir: P) -> ScanReport {
        let dir = dir.as_ref();
        let mut report = ScanReport {
            dir: dir.to_path_buf(),
            candidates: Vec::new(),
        };

        if !dir.is_dir() {
            info!(
                "Extension directory not found: {}, skipping extension loading",
                dir.display()
            );
            return report;
        }

        info!("Scanning extension directory: {}", dir.display());

        let files = match list_files(dir) {
            Ok(files) => files,
            Err(e) => {
                warn!("Failed to read extension directory {}: {}", dir.display(), e);
                return report;
            }
        };

        for path in files.into_iter().filter(|p| is_candidate(p)) {
            let outcome = self.load_candidate(&path);
            report.candidates.push(CandidateReport { path, outcome });
        }

        info!(
            "Extension loading complete. Loaded {} of {} candidate(s), {} live",
            report.loaded(),
            report.candidates.len(),
            self.live.len()
        );
        report
    }

    fn load_candidate(&mut self, path: &Path) -> CandidateOutcome {
        let canonical = fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        if self.live.iter().any(|ext| ext.canonical == canonical) {
            debug!(path = %path.display(), "Extension already loaded, skipping");
            return CandidateOutcome::AlreadyLoaded;
        }

        info!("Loading extension: {}", path.display());

        match self.load(path, canonical) {
            Ok(extension) => {
                info!(
                    path = %path.display(),
                    routes = extension.routes.len(),
                    "Successfully loaded and initialized extension"
                );
                let routes = extension.routes.clone();
                self.live.push(extension);
                CandidateOutcome::Loaded { routes }
            }
            Err(e) => {
                match &e {
                    LoadError::Open { .. } | LoadError::MissingEntry { .. } => {
                        warn!("Skipping extension {}: {}", path.display(), e);
                    }
                    LoadError::InitPanicked { .. } | LoadError::InitFailed { .. } => {
                        error!("Extension {} {}", path.display(), e);
                    }
                }
                CandidateOutcome::Failed(e)
            }
        }
    }

    fn load(&self, path: &Path, canonical: PathBuf) -> Result<LoadedExtension, LoadError> {
        let image = self.backend.open(path)?;

        // On error the image is dropped here, releasing the library
        let entry = image.entry_point(ENTRY_SYMBOL)?;

        let token = ImageToken::new();

        // Safety: `image` is alive for the whole call
        let result = unsafe {
            invoke_entry(
                entry,
                path,
                &self.registry,
                &token,
                self.init_warn_after,
            )
        };

        match result {
            Ok(report) => Ok(LoadedExtension {
                path: path.to_path_buf(),
                loaded_at: Utc::now(),
                routes: report.routes,
                canonical,
                token,
                image,
            }),
            Err(e) => {
                // Routes registered before the failure stay in the registry
                // but must never call into the released library
                token.revoke();
                drop(image);
                Err(e)
            }
        }
    }

    /// Release every loaded extension, most recently loaded first
    ///
    /// Routes the extensions registered stay in the registry; dispatching
    /// them afterwards yields an "extension unloaded" result.
    pub fn unload_all(&mut self) {
        if self.live.is_empty() {
            return;
        }

        info!("Unloading {} extension(s)", self.live.len());
        while let Some(extension) = self.live.pop() {
            drop(extension);
        }
    }

    /// Extensions currently loaded, in load order
    #[must_use]
    pub fn live(&self) -> &[LoadedExtension] {
        &self.live
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.live.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    /// Check if the library at `path` is loaded
    #[must_use]
    pub fn is_loaded<P: AsRef<Path>>(&self, path: P) -> bool {
        let path = path.as_ref();
        let canonical = fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        self.live.iter().any(|ext| ext.canonical == canonical)
    }
}

impl<B: LibraryBackend> Drop for ExtensionLoader<B> {
    fn drop(&mut self) {
        self.unload_all();
    }
}

/// Regular files directly inside `dir`, sorted by path
fn list_files(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();

    for entry in fs::read_dir(dir)? {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Failed to read directory entry in {}: {}", dir.display(), e);
                continue;
            }
        };

        let path = entry.path();
        if path.is_file() {
            files.push(path);
        }
    }

    files.sort();
    Ok(files)
}
