//! TTL-bounded cache of entitlement states that trusts nothing it stores.
//!
//! Entries are kept as serialized JSON. Every [`StateStore::get`] rebuilds
//! the state through [`StateResolver::reconstruct`], which re-verifies the
//! embedded signature; any failure evicts the entry before the error is
//! returned, so a bad entry fails exactly once.

use crate::clock::Clock;
use crate::error::{LicenseError, LicenseResult};
use crate::resolver::StateResolver;
use crate::state::{EntitlementState, StateRecord};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt::Debug;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};

/// One persisted cache entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedEntry {
    /// Cache key.
    pub key: String,
    /// Epoch seconds after which the entry is dropped.
    pub expires_at: i64,
    /// The serialized state.
    #[serde(flatten)]
    pub record: StateRecord,
}

/// Enough of an entry to find and expire it without rebuilding the state.
#[derive(Debug, Deserialize)]
struct EntryHeader {
    key: String,
    expires_at: i64,
}

/// Counts reported by [`StateStore::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// All entries, expired or not.
    pub total: usize,
    /// Entries still within their TTL.
    pub active: usize,
    /// Entries past their TTL, or unreadable, that have not been swept yet.
    pub expired: usize,
}

// ── Backends ─────────────────────────────────────────────────────

/// Raw storage for serialized entries.
pub trait CacheBackend: Send + Debug {
    /// Returns the serialized entry for `key`.
    fn load(&self, key: &str) -> LicenseResult<Option<String>>;

    /// Writes the serialized entry for `key`.
    fn store(&mut self, key: &str, entry: String) -> LicenseResult<()>;

    /// Deletes `key`, returning true if it existed.
    fn remove(&mut self, key: &str) -> LicenseResult<bool>;

    /// Lists all keys.
    fn keys(&self) -> LicenseResult<Vec<String>>;

    /// Counts stored entries that [`CacheBackend::keys`] cannot name.
    fn count_unreadable(&self) -> LicenseResult<usize> {
        Ok(0)
    }

    /// Deletes stored entries that [`CacheBackend::keys`] cannot name.
    fn remove_unreadable(&mut self) -> LicenseResult<usize> {
        Ok(0)
    }
}

/// In-process map.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    entries: HashMap<String, String>,
}

impl MemoryBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl CacheBackend for MemoryBackend {
    fn load(&self, key: &str) -> LicenseResult<Option<String>> {
        Ok(self.entries.get(key).cloned())
    }

    fn store(&mut self, key: &str, entry: String) -> LicenseResult<()> {
        self.entries.insert(key.to_string(), entry);
        Ok(())
    }

    fn remove(&mut self, key: &str) -> LicenseResult<bool> {
        Ok(self.entries.remove(key).is_some())
    }

    fn keys(&self) -> LicenseResult<Vec<String>> {
        Ok(self.entries.keys().cloned().collect())
    }
}

/// One JSON file per entry, named by the SHA-256 of its key.
#[derive(Debug)]
pub struct FileBackend {
    dir: PathBuf,
}

impl FileBackend {
    /// Opens (or creates) a cache directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn open(dir: impl AsRef<Path>) -> LicenseResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)
            .map_err(|e| LicenseError::Storage(format!("failed to create cache dir: {e}")))?;
        Ok(Self { dir })
    }

    /// Returns the file that holds `key`.
    #[must_use]
    pub fn path_for(&self, key: &str) -> PathBuf {
        let name = hex::encode(Sha256::digest(key.as_bytes()));
        self.dir.join(format!("{name}.json"))
    }
}

impl CacheBackend for FileBackend {
    fn load(&self, key: &str) -> LicenseResult<Option<String>> {
        let path = self.path_for(key);
        if !path.exists() {
            return Ok(None);
        }
        fs::read_to_string(&path)
            .map(Some)
            .map_err(|e| LicenseError::Storage(format!("failed to read cache entry: {e}")))
    }

    fn store(&mut self, key: &str, entry: String) -> LicenseResult<()> {
        let path = self.path_for(key);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, entry)
            .map_err(|e| LicenseError::Storage(format!("failed to write cache entry: {e}")))?;
        fs::rename(&tmp, &path)
            .map_err(|e| LicenseError::Storage(format!("failed to commit cache entry: {e}")))
    }

    fn remove(&mut self, key: &str) -> LicenseResult<bool> {
        let path = self.path_for(key);
        if !path.exists() {
            return Ok(false);
        }
        fs::remove_file(&path)
            .map(|()| true)
            .map_err(|e| LicenseError::Storage(format!("failed to delete cache entry: {e}")))
    }

    fn keys(&self) -> LicenseResult<Vec<String>> {
        let mut keys = Vec::new();
        for path in self.entry_files()? {
            match read_header(&path) {
                Some(header) => keys.push(header.key),
                None => debug!(path = %path.display(), "cache file has no readable key"),
            }
        }
        Ok(keys)
    }

    fn count_unreadable(&self) -> LicenseResult<usize> {
        Ok(self.unreadable_files()?.len())
    }

    fn remove_unreadable(&mut self) -> LicenseResult<usize> {
        let mut removed = 0;
        for path in self.unreadable_files()? {
            fs::remove_file(&path).map_err(|e| {
                LicenseError::Storage(format!("failed to delete cache file {}: {e}", path.display()))
            })?;
            warn!(path = %path.display(), "removed unreadable cache file");
            removed += 1;
        }
        Ok(removed)
    }
}

impl FileBackend {
    fn entry_files(&self) -> LicenseResult<Vec<PathBuf>> {
        let dir = fs::read_dir(&self.dir)
            .map_err(|e| LicenseError::Storage(format!("failed to list cache dir: {e}")))?;
        Ok(dir
            .flatten()
            .map(|file| file.path())
            .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
            .collect())
    }

    fn unreadable_files(&self) -> LicenseResult<Vec<PathBuf>> {
        Ok(self
            .entry_files()?
            .into_iter()
            .filter(|path| read_header(path).is_none())
            .collect())
    }
}

fn read_header(path: &Path) -> Option<EntryHeader> {
    fs::read_to_string(path)
        .ok()
        .and_then(|raw| serde_json::from_str(&raw).ok())
}

// ── Store ────────────────────────────────────────────────────────

/// Verified, TTL-bounded state cache.
#[derive(Debug)]
pub struct StateStore {
    backend: Mutex<Box<dyn CacheBackend>>,
    resolver: Arc<StateResolver>,
    clock: Arc<dyn Clock>,
    default_ttl_secs: i64,
}

impl StateStore {
    /// Creates an in-memory store.
    #[must_use]
    pub fn in_memory(resolver: Arc<StateResolver>, clock: Arc<dyn Clock>, default_ttl_secs: i64) -> Self {
        Self::with_backend(Box::new(MemoryBackend::new()), resolver, clock, default_ttl_secs)
    }

    /// Creates a store over any backend.
    #[must_use]
    pub fn with_backend(
        backend: Box<dyn CacheBackend>,
        resolver: Arc<StateResolver>,
        clock: Arc<dyn Clock>,
        default_ttl_secs: i64,
    ) -> Self {
        Self {
            backend: Mutex::new(backend),
            resolver,
            clock,
            default_ttl_secs,
        }
    }

    fn backend(&self) -> LicenseResult<MutexGuard<'_, Box<dyn CacheBackend>>> {
        self.backend
            .lock()
            .map_err(|_| LicenseError::Storage("cache lock poisoned".to_string()))
    }

    /// Persists `state` under `key` for `ttl_secs` (or the default TTL).
    ///
    /// Returns `Ok(false)` without writing for states that cannot be
    /// re-verified later: synthetic states, states without an attestation,
    /// and unsigned states while a verifier is configured.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the backend write fails.
    pub fn set(&self, key: &str, state: &EntitlementState, ttl_secs: Option<i64>) -> LicenseResult<bool> {
        if state.is_synthetic() {
            debug!(key, "not caching synthetic state");
            return Ok(false);
        }
        if state.attestation().is_none() {
            warn!(key, "not caching state without a response attestation");
            return Ok(false);
        }
        if self.resolver.verifies_signatures() && state.signature().is_none() {
            warn!(key, "not caching unsigned state while signatures are enforced");
            return Ok(false);
        }

        let ttl = ttl_secs.unwrap_or(self.default_ttl_secs);
        let entry = CachedEntry {
            key: key.to_string(),
            expires_at: self.clock.now_secs() + ttl,
            record: state.to_record(),
        };
        let raw = serde_json::to_string(&entry)?;

        self.backend()?.store(key, raw)?;
        debug!(key, ttl, "cached entitlement state");
        Ok(true)
    }

    /// Reads and re-verifies the state under `key`.
    ///
    /// Returns `Ok(None)` on a miss or an expired entry.
    ///
    /// # Errors
    ///
    /// Returns [`LicenseError::Signature`] if the entry no longer verifies,
    /// or [`LicenseError::Storage`] if it is unreadable. The entry is removed
    /// in both cases, so the next call is a clean miss.
    pub fn get(&self, key: &str) -> LicenseResult<Option<EntitlementState>> {
        let mut backend = self.backend()?;
        let Some(raw) = backend.load(key)? else {
            return Ok(None);
        };

        let entry: CachedEntry = match serde_json::from_str(&raw) {
            Ok(entry) => entry,
            Err(e) => {
                backend.remove(key)?;
                warn!(key, "evicted corrupt cache entry");
                return Err(LicenseError::Storage(format!("corrupt cache entry: {e}")));
            }
        };

        if self.clock.now_secs() >= entry.expires_at {
            backend.remove(key)?;
            debug!(key, "cache entry expired");
            return Ok(None);
        }

        match self.resolver.reconstruct(&entry.record) {
            Ok(state) => Ok(Some(state)),
            Err(e) => {
                backend.remove(key)?;
                warn!(key, error = %e, "evicted cache entry that failed verification");
                Err(e)
            }
        }
    }

    /// Removes `key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails.
    pub fn delete(&self, key: &str) -> LicenseResult<bool> {
        self.backend()?.remove(key)
    }

    /// Removes every entry whose key starts with `prefix`.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails.
    pub fn clear_license(&self, prefix: &str) -> LicenseResult<usize> {
        let mut backend = self.backend()?;
        let mut removed = 0;
        for key in backend.keys()? {
            if key.starts_with(prefix) && backend.remove(&key)? {
                removed += 1;
            }
        }
        debug!(prefix, removed, "cleared cached license");
        Ok(removed)
    }

    /// Removes every entry, readable or not.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails.
    pub fn clear(&self) -> LicenseResult<usize> {
        let unreadable = self.backend()?.remove_unreadable()?;
        Ok(unreadable + self.clear_license("")?)
    }

    /// Sweeps expired and unreadable entries.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails.
    pub fn gc(&self) -> LicenseResult<usize> {
        let now = self.clock.now_secs();
        let mut backend = self.backend()?;
        let mut removed = backend.remove_unreadable()?;
        for key in backend.keys()? {
            let expired = match backend.load(&key)? {
                Some(raw) => serde_json::from_str::<EntryHeader>(&raw)
                    .map_or(true, |header| now >= header.expires_at),
                None => false,
            };
            if expired && backend.remove(&key)? {
                removed += 1;
            }
        }
        if removed > 0 {
            debug!(removed, "swept expired cache entries");
        }
        Ok(removed)
    }

    /// Counts entries.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails.
    pub fn stats(&self) -> LicenseResult<CacheStats> {
        let now = self.clock.now_secs();
        let backend = self.backend()?;
        let unreadable = backend.count_unreadable()?;
        let mut stats = CacheStats {
            total: unreadable,
            active: 0,
            expired: unreadable,
        };
        for key in backend.keys()? {
            let Some(raw) = backend.load(&key)? else {
                continue;
            };
            stats.total += 1;
            match serde_json::from_str::<EntryHeader>(&raw) {
                Ok(header) if now < header.expires_at => stats.active += 1,
                _ => stats.expired += 1,
            }
        }
        Ok(stats)
    }
}
