use std::collections::BTreeMap;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::StoreError;

/// Application name used for the default cache directory
pub const APP_NAME: &str = "stscache";

/// Cache entry file extension
const ENTRY_EXTENSION: &str = "json";

/// Prefix for in-flight temporary files. Leading dot keeps them out of `scan`.
const TEMP_PREFIX: &str = ".stscache-";

/// Persistence for serialized credential records, keyed by identity.
///
/// `write` must replace an entry atomically: a concurrent `read` returns
/// either the previous record or the new one in full.
pub trait CacheStore {
    /// Raw record for `identity`, or `None` if there is no entry.
    fn read(&self, identity: &str) -> Result<Option<Vec<u8>>, StoreError>;

    fn write(&self, identity: &str, contents: &[u8]) -> Result<(), StoreError>;

    /// Remove the entry for `identity`. Removing a missing entry is not an error.
    fn remove(&self, identity: &str) -> Result<(), StoreError>;

    /// `(entry key, raw record)` for every entry currently stored.
    fn scan(&self) -> Result<Vec<(String, Vec<u8>)>, StoreError>;

    /// Key under which the entry for `identity` is stored.
    fn entry_key(&self, identity: &str) -> String {
        identity.to_string()
    }
}

/// Filesystem-safe key for an identity.
///
/// Identities are usually ARNs or `account/role` pairs, so they are hashed
/// rather than used as file names directly.
pub fn cache_key(identity: &str) -> String {
    format!("{:x}", Sha256::digest(identity.as_bytes()))
}

// ============================================================================
// File store
// ============================================================================

/// One JSON file per identity in a private directory.
///
/// Writes go to a uniquely named temporary file in the same directory, are
/// flushed to disk and then renamed over the entry, so independent processes
/// can share the directory without locking. Last rename wins.
#[derive(Debug, Clone)]
pub struct FileCacheStore {
    dir: PathBuf,
}

impl FileCacheStore {
    /// Store rooted at `dir`. The directory is created owner-only (`0700`)
    /// on the first write; reads against a missing directory find nothing.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// `<user cache dir>/stscache`
    pub fn default_dir() -> Option<PathBuf> {
        dirs::cache_dir().map(|dir| dir.join(APP_NAME))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn entry_path(&self, identity: &str) -> PathBuf {
        self.dir
            .join(format!("{}.{}", cache_key(identity), ENTRY_EXTENSION))
    }

    fn ensure_dir(&self) -> Result<(), StoreError> {
        if !self.dir.exists() {
            create_private_dir(&self.dir)?;
            debug!(dir = %self.dir.display(), "Created cache directory");
        }
        Ok(())
    }
}

#[cfg(unix)]
fn create_private_dir(dir: &Path) -> Result<(), StoreError> {
    use std::os::unix::fs::DirBuilderExt;

    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(dir)
        .map_err(|e| StoreError::io(dir, e))
}

#[cfg(not(unix))]
fn create_private_dir(dir: &Path) -> Result<(), StoreError> {
    std::fs::create_dir_all(dir).map_err(|e| StoreError::io(dir, e))
}

impl CacheStore for FileCacheStore {
    fn read(&self, identity: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let path = self.entry_path(identity);
        match std::fs::read(&path) {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::io(path, e)),
        }
    }

    fn write(&self, identity: &str, contents: &[u8]) -> Result<(), StoreError> {
        let path = self.entry_path(identity);
        self.ensure_dir()?;

        // tempfile creates the file 0600 on unix
        let mut tmp = tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .suffix(".tmp")
            .tempfile_in(&self.dir)
            .map_err(|e| StoreError::io(&self.dir, e))?;

        tmp.write_all(contents)
            .map_err(|e| StoreError::io(tmp.path(), e))?;
        tmp.as_file()
            .sync_all()
            .map_err(|e| StoreError::io(tmp.path(), e))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(tmp.path(), std::fs::Permissions::from_mode(0o600))
                .map_err(|e| StoreError::io(tmp.path(), e))?;
        }

        // Atomic rename; the temp file is removed on failure
        tmp.persist(&path)
            .map_err(|e| StoreError::io(&path, e.error))?;

        debug!(path = %path.display(), bytes = contents.len(), "Wrote cache entry");
        Ok(())
    }

    fn remove(&self, identity: &str) -> Result<(), StoreError> {
        let path = self.entry_path(identity);
        match std::fs::remove_file(&path) {
            Ok(()) => {
                debug!(path = %path.display(), "Removed cache entry");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::io(path, e)),
        }
    }

    fn scan(&self) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io(&self.dir, e)),
        };

        let mut records = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| StoreError::io(&self.dir, e))?;
            let path = entry.path();

            let is_entry = path.extension().is_some_and(|ext| ext == ENTRY_EXTENSION)
                && !entry.file_name().to_string_lossy().starts_with('.');
            if !is_entry {
                continue;
            }

            let key = path
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
                .unwrap_or_default();

            match std::fs::read(&path) {
                Ok(contents) => records.push((key, contents)),
                // Invalidated by another process mid-scan
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(StoreError::io(path, e)),
            }
        }
        Ok(records)
    }

    fn entry_key(&self, identity: &str) -> String {
        cache_key(identity)
    }
}

// ============================================================================
// Memory store
// ============================================================================

/// In-process store. Useful for tests and for embedding the cache in a
/// long-running program that doesn't need persistence.
#[derive(Debug, Default)]
pub struct MemoryCacheStore {
    entries: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Vec<u8>>> {
        // Entries are replaced whole, so a poisoned map is still consistent
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl CacheStore for MemoryCacheStore {
    fn read(&self, identity: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.lock().get(identity).cloned())
    }

    fn write(&self, identity: &str, contents: &[u8]) -> Result<(), StoreError> {
        self.lock().insert(identity.to_string(), contents.to_vec());
        Ok(())
    }

    fn remove(&self, identity: &str) -> Result<(), StoreError> {
        self.lock().remove(identity);
        Ok(())
    }

    fn scan(&self) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        Ok(self
            .lock()
            .iter()
            .map(|(key, contents)| (key.clone(), contents.clone()))
            .collect())
    }
}

// ============================================================================
// Tests
// ============================================================================
