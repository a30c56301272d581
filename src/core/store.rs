use crate::core::config::{ConfigError, fingerprint_bits, validate_hash_size};
use crate::core::fingerprint::{Fingerprint, FingerprintError};
use crate::core::matcher::Candidate;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize cache: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Fingerprint for {} rejected: {source}", .path.display())]
    Fingerprint {
        path: PathBuf,
        #[source]
        source: FingerprintError,
    },
}

/// What `load` found on disk. Anything but `Loaded` yields an empty store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadOutcome {
    Missing,
    Loaded { entries: usize },
    Corrupt { reason: String },
    HashSizeMismatch { found: u32, expected: u32 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub path: PathBuf,
    pub fingerprint: Fingerprint,
    /// Seconds since the Unix epoch.
    pub modified_at: f64,
    pub byte_size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    Added,
    Updated,
}

pub type EntryMap = BTreeMap<PathBuf, CacheEntry>;

/// True when the path has never been hashed or its stat no longer matches.
pub fn needs_rehash(entry: Option<&CacheEntry>, modified_at: f64, byte_size: u64) -> bool {
    match entry {
        None => true,
        Some(entry) => entry.modified_at != modified_at || entry.byte_size != byte_size,
    }
}

/// Path → fingerprint cache for one `hash_size`.
///
/// Entries sit behind an `Arc`; [`FingerprintStore::snapshot`] hands out
/// the current map and later edits copy-on-write, so a held snapshot never
/// changes underneath its reader.
#[derive(Debug, Clone)]
pub struct FingerprintStore {
    hash_size: u32,
    search_paths: Vec<PathBuf>,
    last_synced_at: Option<DateTime<Utc>>,
    entries: Arc<EntryMap>,
}

#[derive(Debug, Serialize, Deserialize)]
struct CacheRecord {
    hash_size: u32,
    search_paths: Vec<String>,
    #[serde(default)]
    last_synced_at: Option<DateTime<Utc>>,
    entries: BTreeMap<String, EntryRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
struct EntryRecord {
    fingerprint: String,
    modified_at: f64,
    byte_size: u64,
}

impl FingerprintStore {
    pub fn new(hash_size: u32) -> Result<Self, ConfigError> {
        validate_hash_size(hash_size)?;
        Ok(Self::empty(hash_size))
    }

    fn empty(hash_size: u32) -> Self {
        Self {
            hash_size,
            search_paths: Vec::new(),
            last_synced_at: None,
            entries: Arc::new(EntryMap::new()),
        }
    }

    /// Read the cache at `path`. Missing, unreadable, corrupt or
    /// differently-sized records all come back as an empty store.
    pub fn load(path: &Path, hash_size: u32) -> Result<Self, ConfigError> {
        Self::load_detailed(path, hash_size).map(|(store, _)| store)
    }

    pub fn load_detailed(path: &Path, hash_size: u32) -> Result<(Self, LoadOutcome), ConfigError> {
        validate_hash_size(hash_size)?;

        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::info!("No cache at {}, starting empty", path.display());
                return Ok((Self::empty(hash_size), LoadOutcome::Missing));
            }
            Err(e) => return Ok(Self::corrupt(path, hash_size, format!("unreadable: {}", e))),
        };

        let record: CacheRecord = match serde_json::from_str(&content) {
            Ok(record) => record,
            Err(e) => return Ok(Self::corrupt(path, hash_size, format!("malformed: {}", e))),
        };

        let mut store = Self::empty(hash_size);
        store.search_paths = record.search_paths.iter().map(PathBuf::from).collect();

        if record.hash_size != hash_size {
            log::warn!(
                "Cache {} was built with hash size {} but {} is configured; rebuilding",
                path.display(),
                record.hash_size,
                hash_size
            );
            let outcome = LoadOutcome::HashSizeMismatch {
                found: record.hash_size,
                expected: hash_size,
            };
            return Ok((store, outcome));
        }

        let bits = fingerprint_bits(hash_size);
        let mut entries = EntryMap::new();
        for (key, entry) in record.entries {
            let fingerprint = match Fingerprint::from_hex(&entry.fingerprint, bits) {
                Ok(fingerprint) => fingerprint,
                Err(e) => {
                    return Ok(Self::corrupt(path, hash_size, format!("entry {}: {}", key, e)));
                }
            };
            let entry_path = PathBuf::from(key);
            entries.insert(
                entry_path.clone(),
                CacheEntry {
                    path: entry_path,
                    fingerprint,
                    modified_at: entry.modified_at,
                    byte_size: entry.byte_size,
                },
            );
        }

        store.last_synced_at = record.last_synced_at;
        store.entries = Arc::new(entries);
        let outcome = LoadOutcome::Loaded {
            entries: store.len(),
        };
        log::info!("Loaded {} cached fingerprints from {}", store.len(), path.display());
        Ok((store, outcome))
    }

    fn corrupt(path: &Path, hash_size: u32, reason: String) -> (Self, LoadOutcome) {
        log::warn!("Ignoring corrupt cache {}: {}", path.display(), reason);
        (Self::empty(hash_size), LoadOutcome::Corrupt { reason })
    }

    /// Write the whole store to `path` via a sibling temp file and rename,
    /// so the previous record survives a crash mid-write.
    pub fn save(&self, path: &Path) -> Result<(), StoreError> {
        let json = serde_json::to_string_pretty(&self.to_record())?;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| io_error(parent, e))?;
        }

        let tmp = temp_path(path);
        let written = File::create(&tmp).and_then(|mut file| {
            file.write_all(json.as_bytes())?;
            file.sync_all()
        });
        if let Err(source) = written {
            let _ = fs::remove_file(&tmp);
            return Err(io_error(&tmp, source));
        }

        if let Err(source) = fs::rename(&tmp, path) {
            let _ = fs::remove_file(&tmp);
            return Err(io_error(path, source));
        }

        log::debug!("Saved {} fingerprints to {}", self.len(), path.display());
        Ok(())
    }

    fn to_record(&self) -> CacheRecord {
        CacheRecord {
            hash_size: self.hash_size,
            search_paths: self
                .search_paths
                .iter()
                .map(|p| p.to_string_lossy().into_owned())
                .collect(),
            last_synced_at: self.last_synced_at,
            entries: self
                .entries
                .values()
                .map(|entry| {
                    (
                        entry.path.to_string_lossy().into_owned(),
                        EntryRecord {
                            fingerprint: entry.fingerprint.to_hex(),
                            modified_at: entry.modified_at,
                            byte_size: entry.byte_size,
                        },
                    )
                })
                .collect(),
        }
    }

    pub fn hash_size(&self) -> u32 {
        self.hash_size
    }

    pub fn fingerprint_bits(&self) -> usize {
        fingerprint_bits(self.hash_size)
    }

    pub fn search_paths(&self) -> &[PathBuf] {
        &self.search_paths
    }

    pub fn set_search_paths(&mut self, search_paths: Vec<PathBuf>) {
        self.search_paths = search_paths;
    }

    pub fn last_synced_at(&self) -> Option<DateTime<Utc>> {
        self.last_synced_at
    }

    pub fn mark_synced(&mut self, at: DateTime<Utc>) {
        self.last_synced_at = Some(at);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, path: &Path) -> Option<&CacheEntry> {
        self.entries.get(path)
    }

    /// Last-known entries, including any that are stale on disk.
    pub fn snapshot(&self) -> Arc<EntryMap> {
        Arc::clone(&self.entries)
    }

    pub fn candidates(&self) -> impl Iterator<Item = Candidate<'_>> {
        self.entries.values().map(|entry| Candidate {
            path: &entry.path,
            fingerprint: &entry.fingerprint,
            byte_size: entry.byte_size,
        })
    }

    pub fn needs_rehash(&self, path: &Path, modified_at: f64, byte_size: u64) -> bool {
        needs_rehash(self.get(path), modified_at, byte_size)
    }

    pub fn upsert(
        &mut self,
        path: PathBuf,
        fingerprint: Fingerprint,
        modified_at: f64,
        byte_size: u64,
    ) -> Result<Upsert, StoreError> {
        let expected = self.fingerprint_bits();
        if fingerprint.len() != expected {
            return Err(StoreError::Fingerprint {
                path,
                source: FingerprintError::LengthMismatch {
                    left: fingerprint.len(),
                    right: expected,
                },
            });
        }

        let entry = CacheEntry {
            path: path.clone(),
            fingerprint,
            modified_at,
            byte_size,
        };
        match Arc::make_mut(&mut self.entries).insert(path, entry) {
            Some(_) => Ok(Upsert::Updated),
            None => Ok(Upsert::Added),
        }
    }

    /// Drop every entry whose path is not in `existing_paths`. Returns the
    /// number of entries removed.
    pub fn prune(&mut self, existing_paths: &HashSet<PathBuf>) -> usize {
        let before = self.entries.len();
        if self.entries.keys().all(|path| existing_paths.contains(path)) {
            return 0;
        }
        Arc::make_mut(&mut self.entries).retain(|path, _| existing_paths.contains(path));
        before - self.entries.len()
    }
}

fn io_error(path: &Path, source: std::io::Error) -> StoreError {
    StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "cache".into());
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fp(seed: u8) -> Fingerprint {
        Fingerprint::from_bits((0..192).map(|i| (i as u8).wrapping_mul(seed) % 3 == 0))
    }

    fn populated() -> FingerprintStore {
        let mut store = FingerprintStore::new(8).unwrap();
        store.set_search_paths(vec![PathBuf::from("/photos"), PathBuf::from("/more")]);
        store
            .upsert(PathBuf::from("/photos/a.jpg"), fp(3), 1_700_000_000.25, 1024)
            .unwrap();
        store
            .upsert(PathBuf::from("/photos/b.png"), fp(7), 1_700_000_123.5, 2048)
            .unwrap();
        store.mark_synced(Utc::now());
        store
    }

    #[test]
    fn test_needs_rehash() {
        let entry = CacheEntry {
            path: PathBuf::from("/x.jpg"),
            fingerprint: fp(1),
            modified_at: 10.0,
            byte_size: 5,
        };
        assert!(needs_rehash(None, 10.0, 5));
        assert!(!needs_rehash(Some(&entry), 10.0, 5));
        assert!(needs_rehash(Some(&entry), 11.0, 5));
        assert!(needs_rehash(Some(&entry), 10.0, 6));
    }

    #[test]
    fn test_upsert_add_then_update() {
        let mut store = FingerprintStore::new(8).unwrap();
        let path = PathBuf::from("/p/one.jpg");

        assert!(store.needs_rehash(&path, 1.0, 1));
        assert_eq!(store.upsert(path.clone(), fp(1), 1.0, 1).unwrap(), Upsert::Added);
        assert!(!store.needs_rehash(&path, 1.0, 1));
        assert!(store.needs_rehash(&path, 2.0, 1));

        assert_eq!(store.upsert(path.clone(), fp(2), 2.0, 3).unwrap(), Upsert::Updated);
        let entry = store.get(&path).unwrap();
        assert_eq!(entry.fingerprint, fp(2));
        assert_eq!(entry.byte_size, 3);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_upsert_rejects_wrong_length() {
        let mut store = FingerprintStore::new(8).unwrap();
        let err = store
            .upsert(PathBuf::from("/p/x.jpg"), Fingerprint::zeroed(48), 1.0, 1)
            .unwrap_err();
        assert!(matches!(err, StoreError::Fingerprint { .. }));
        assert!(store.is_empty());
    }

    #[test]
    fn test_prune_removes_missing_paths() {
        let mut store = populated();
        let existing: HashSet<PathBuf> = [PathBuf::from("/photos/b.png")].into_iter().collect();

        assert_eq!(store.prune(&existing), 1);
        assert!(store.get(Path::new("/photos/a.jpg")).is_none());
        assert!(store.get(Path::new("/photos/b.png")).is_some());
        assert_eq!(store.prune(&existing), 0);
    }

    #[test]
    fn test_snapshot_is_isolated_from_later_edits() {
        let mut store = populated();
        let snapshot = store.snapshot();

        store.prune(&HashSet::new());
        store
            .upsert(PathBuf::from("/photos/c.gif"), fp(5), 3.0, 3)
            .unwrap();

        assert_eq!(snapshot.len(), 2);
        assert!(snapshot.contains_key(Path::new("/photos/a.jpg")));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_save_load_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("cache.json");
        let store = populated();

        store.save(&path).unwrap();
        let (loaded, outcome) = FingerprintStore::load_detailed(&path, 8).unwrap();

        assert_eq!(outcome, LoadOutcome::Loaded { entries: 2 });
        assert_eq!(*loaded.snapshot(), *store.snapshot());
        assert_eq!(loaded.search_paths(), store.search_paths());
        assert_eq!(loaded.last_synced_at(), store.last_synced_at());
        assert!(!temp_path(&path).exists());

        // Saving again without changes produces the same record.
        let first = fs::read_to_string(&path).unwrap();
        loaded.save(&path).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), first);
    }

    #[test]
    fn test_nanosecond_mtimes_survive_reload() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("cache.json");
        let mut store = FingerprintStore::new(8).unwrap();

        let mtimes: Vec<(PathBuf, f64)> = (0..2000u64)
            .map(|i| {
                let secs = 1_600_000_000 + i * 7919;
                let nanos = (i * 2_654_435_761 % 1_000_000_000) as u32;
                let modified_at = std::time::Duration::new(secs, nanos).as_secs_f64();
                (PathBuf::from(format!("/photos/{:04}.jpg", i)), modified_at)
            })
            .collect();
        for (entry_path, modified_at) in &mtimes {
            store
                .upsert(entry_path.clone(), fp(3), *modified_at, 4096)
                .unwrap();
        }

        store.save(&path).unwrap();
        let loaded = FingerprintStore::load(&path, 8).unwrap();

        let stale: Vec<_> = mtimes
            .iter()
            .filter(|(entry_path, modified_at)| loaded.needs_rehash(entry_path, *modified_at, 4096))
            .collect();
        assert!(stale.is_empty(), "{} entries looked modified after reload", stale.len());
    }

    #[test]
    fn test_record_layout() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("cache.json");
        populated().save(&path).unwrap();

        let value: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["hash_size"], 8);
        assert_eq!(value["search_paths"][0], "/photos");
        let entry = &value["entries"]["/photos/a.jpg"];
        assert_eq!(entry["byte_size"], 1024);
        assert_eq!(entry["modified_at"], 1_700_000_000.25);
        assert_eq!(entry["fingerprint"].as_str().unwrap().len(), 48);
    }

    #[test]
    fn test_missing_and_corrupt_records_load_empty() {
        let temp_dir = TempDir::new().unwrap();
        let missing = temp_dir.path().join("nope.json");
        let (store, outcome) = FingerprintStore::load_detailed(&missing, 8).unwrap();
        assert!(store.is_empty());
        assert_eq!(outcome, LoadOutcome::Missing);

        let garbage = temp_dir.path().join("garbage.json");
        fs::write(&garbage, b"{\"hash_size\": 8, \"entries\": [").unwrap();
        let (store, outcome) = FingerprintStore::load_detailed(&garbage, 8).unwrap();
        assert!(store.is_empty());
        assert!(matches!(outcome, LoadOutcome::Corrupt { .. }));
    }

    #[test]
    fn test_bad_entry_invalidates_whole_record() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("cache.json");
        populated().save(&path).unwrap();

        let mut value: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        value["entries"]["/photos/b.png"]["fingerprint"] = "xyz".into();
        fs::write(&path, value.to_string()).unwrap();

        let (store, outcome) = FingerprintStore::load_detailed(&path, 8).unwrap();
        assert!(store.is_empty());
        assert!(store.search_paths().is_empty());
        assert!(matches!(outcome, LoadOutcome::Corrupt { .. }));
    }

    #[test]
    fn test_hash_size_mismatch_discards_entries() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("cache.json");
        populated().save(&path).unwrap();

        let (store, outcome) = FingerprintStore::load_detailed(&path, 16).unwrap();
        assert_eq!(outcome, LoadOutcome::HashSizeMismatch { found: 8, expected: 16 });
        assert!(store.is_empty());
        assert_eq!(store.hash_size(), 16);
        assert_eq!(store.search_paths().len(), 2);
    }

    #[test]
    fn test_failed_save_keeps_previous_record() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("cache.json");
        let original = populated();
        original.save(&path).unwrap();

        // A directory squatting on the temp name makes the write fail.
        fs::create_dir(temp_path(&path)).unwrap();
        let mut changed = original.clone();
        changed.prune(&HashSet::new());
        assert!(matches!(changed.save(&path), Err(StoreError::Io { .. })));

        let reloaded = FingerprintStore::load(&path, 8).unwrap();
        assert_eq!(reloaded.len(), 2);
    }
}
