//! On-disk cache artifact management: staged writes, integrity-checked
//! loads, atomic commits, and a bounded rollback history.
//!
//! Layout under the store directory:
//! `<name>.v<schema>.cache` (active), `<name>.v<schema>.cache.staging`
//! (in-flight), `.cache_history/` (up to two prior versions).

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use cache_model::{CacheBundle, CacheError, CACHE_SCHEMA_VERSION};
use thiserror::Error;
use tracing::debug;

const HISTORY_DIR: &str = ".cache_history";
/// Prior versions retained after a commit; older entries are evicted.
const HISTORY_KEEP: usize = 2;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("cache store I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("cache artifact rejected: {0}")]
    Cache(#[from] CacheError),
    #[error("no active cache artifact at {0}")]
    NoActive(PathBuf),
}

/// A staged artifact that passed the self-consistency check and is ready to
/// be committed.
#[derive(Debug)]
pub struct StagedCache {
    path: PathBuf,
    bundle: CacheBundle,
}

impl StagedCache {
    pub fn bundle(&self) -> &CacheBundle {
        &self.bundle
    }
}

#[derive(Debug)]
pub struct CacheStore {
    dir: PathBuf,
    name: String,
}

impl CacheStore {
    pub fn new(dir: impl Into<PathBuf>, name: impl Into<String>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            name: name.into(),
        })
    }

    pub fn active_path(&self) -> PathBuf {
        self.dir
            .join(format!("{}.v{CACHE_SCHEMA_VERSION}.cache", self.name))
    }

    fn staging_path(&self) -> PathBuf {
        self.dir
            .join(format!("{}.v{CACHE_SCHEMA_VERSION}.cache.staging", self.name))
    }

    fn history_dir(&self) -> PathBuf {
        self.dir.join(HISTORY_DIR)
    }

    /// Write the bundle to the staging location and verify what landed on
    /// disk decodes with a matching content hash.
    pub fn stage(&self, bundle: &CacheBundle) -> Result<StagedCache, StoreError> {
        let path = self.staging_path();
        let bytes = bundle.encode()?;
        fs::write(&path, &bytes)?;
        let written = fs::read(&path)?;
        let verified = CacheBundle::decode(&written)?;
        debug!(
            target: "padforge::store",
            path = %path.display(),
            source_hash = verified.header.source_hash,
            "staged cache artifact"
        );
        Ok(StagedCache {
            path,
            bundle: verified,
        })
    }

    /// Atomically replace the active artifact with the staged one. The
    /// previous active artifact is pushed onto the history ring first.
    pub fn commit(&self, staged: StagedCache) -> Result<PathBuf, StoreError> {
        let active = self.active_path();
        if active.exists() {
            let history = self.history_dir();
            fs::create_dir_all(&history)?;
            let nanos = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_nanos();
            // Zero-padded so lexical file-name order is chronological.
            let slot = history.join(format!(
                "{}.v{CACHE_SCHEMA_VERSION}.{nanos:032}.cache",
                self.name
            ));
            fs::rename(&active, &slot)?;
        }
        fs::rename(&staged.path, &active)?;
        self.prune_history()?;
        debug!(target: "padforge::store", path = %active.display(), "committed cache artifact");
        Ok(active)
    }

    /// History entry paths, newest first.
    pub fn history_paths(&self) -> Result<Vec<PathBuf>, StoreError> {
        let history = self.history_dir();
        if !history.exists() {
            return Ok(Vec::new());
        }
        let mut paths: Vec<PathBuf> = fs::read_dir(&history)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("cache"))
            .collect();
        paths.sort();
        paths.reverse();
        Ok(paths)
    }

    pub fn load_active(&self) -> Result<CacheBundle, StoreError> {
        let path = self.active_path();
        if !path.exists() {
            return Err(StoreError::NoActive(path));
        }
        load_bundle(&path)
    }

    /// Decode history entries newest-first, skipping any that fail the
    /// integrity check.
    pub fn load_history(&self) -> Result<Vec<CacheBundle>, StoreError> {
        let mut bundles = Vec::new();
        for path in self.history_paths()? {
            match load_bundle(&path) {
                Ok(bundle) => bundles.push(bundle),
                Err(err) => {
                    debug!(
                        target: "padforge::store",
                        path = %path.display(),
                        %err,
                        "skipping unreadable history entry"
                    );
                }
            }
        }
        Ok(bundles)
    }

    fn prune_history(&self) -> Result<(), StoreError> {
        let paths = self.history_paths()?;
        for stale in paths.iter().skip(HISTORY_KEEP) {
            fs::remove_file(stale)?;
        }
        Ok(())
    }
}

fn load_bundle(path: &Path) -> Result<CacheBundle, StoreError> {
    let bytes = fs::read(path)?;
    Ok(CacheBundle::decode(&bytes)?)
}
