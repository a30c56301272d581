use crate::core::config::{ConfigError, FinderConfig};
use crate::core::decode::{DecodeError, Decoder, FileDecoder};
use crate::core::fingerprint::Fingerprint;
use crate::core::hash::PerceptualHasher;
use crate::core::matcher::{self, MatchError, SearchResult};
use crate::core::store::{FingerprintStore, LoadOutcome, StoreError};
use crate::core::sync::{SyncError, SyncOrchestrator, SyncProgress, SyncReport};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FinderError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("Matching failed: {0}")]
    Match(#[from] MatchError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error("Cache error: {0}")]
    Store(#[from] StoreError),

    #[error("Cache state lock poisoned")]
    LockPoisoned,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheStatus {
    pub entry_count: usize,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub hash_size: u32,
    pub search_paths: Vec<PathBuf>,
}

/// Entry point for the presentation layer: owns the hasher, the decoder
/// and the current store, and exposes pull-based `query` / `sync` /
/// `cache_status`.
///
/// Queries read an immutable snapshot; a sync works on a private copy and
/// publishes it with a single swap, so a query never sees a half-synced
/// store.
pub struct ImageFinder {
    config: FinderConfig,
    hasher: PerceptualHasher,
    decoder: Arc<dyn Decoder>,
    store: RwLock<FingerprintStore>,
    sync_lock: Mutex<()>,
    cancellation_token: Arc<AtomicBool>,
    load_outcome: LoadOutcome,
}

impl ImageFinder {
    pub fn open(config: FinderConfig) -> Result<Self, FinderError> {
        let hasher = PerceptualHasher::new(config.hash_size)?;
        let (mut store, load_outcome) =
            FingerprintStore::load_detailed(&config.cache_path, config.hash_size)?;
        if store.search_paths().is_empty() {
            store.set_search_paths(config.search_paths.clone());
        }

        Ok(Self {
            config,
            hasher,
            decoder: Arc::new(FileDecoder),
            store: RwLock::new(store),
            sync_lock: Mutex::new(()),
            cancellation_token: Arc::new(AtomicBool::new(false)),
            load_outcome,
        })
    }

    pub fn with_decoder(mut self, decoder: Arc<dyn Decoder>) -> Self {
        self.decoder = decoder;
        self
    }

    pub fn config(&self) -> &FinderConfig {
        &self.config
    }

    /// How the persisted cache looked when this finder was opened.
    pub fn load_outcome(&self) -> &LoadOutcome {
        &self.load_outcome
    }

    fn read_store(&self) -> Result<RwLockReadGuard<'_, FingerprintStore>, FinderError> {
        self.store.read().map_err(|_| FinderError::LockPoisoned)
    }

    fn snapshot(&self) -> Result<FingerprintStore, FinderError> {
        Ok(self.read_store()?.clone())
    }

    fn publish(&self, store: FingerprintStore) -> Result<(), FinderError> {
        *self.store.write().map_err(|_| FinderError::LockPoisoned)? = store;
        Ok(())
    }

    pub fn fingerprint(&self, image_path: &Path) -> Result<Fingerprint, FinderError> {
        let pixels = self.decoder.decode(image_path)?;
        Ok(self.hasher.hash(&pixels))
    }

    /// Rank cached images against `image_path`. With a `limit`, only the
    /// best `limit` results are returned.
    pub fn query(
        &self,
        image_path: &Path,
        threshold_percent: f64,
        limit: Option<usize>,
    ) -> Result<Vec<SearchResult>, FinderError> {
        let query = self.fingerprint(image_path)?;
        let store = self.snapshot()?;
        if store.is_empty() {
            log::warn!("Query against an empty cache; run a sync first");
        }

        let results = match limit {
            Some(limit) => matcher::top_matches(&query, store.candidates(), threshold_percent, limit)?,
            None => matcher::rank(&query, store.candidates(), threshold_percent)?,
        };
        Ok(results)
    }

    pub fn sync(&self, roots: &[PathBuf]) -> Result<SyncReport, FinderError> {
        self.sync_with_progress(roots, None)
    }

    pub fn sync_with_progress(
        &self,
        roots: &[PathBuf],
        progress: Option<Sender<SyncProgress>>,
    ) -> Result<SyncReport, FinderError> {
        let _guard = self.sync_lock.lock().map_err(|_| FinderError::LockPoisoned)?;
        self.cancellation_token.store(false, Ordering::Relaxed);

        let mut orchestrator = SyncOrchestrator::new(&self.config)
            .with_decoder(self.decoder.clone())
            .with_cancellation_token(self.cancellation_token.clone());
        if let Some(sender) = progress {
            orchestrator = orchestrator.with_progress_sender(sender);
        }

        let mut working = self.snapshot()?;
        let result = orchestrator.sync(roots, &mut working, &self.hasher);
        match &result {
            Ok(_) | Err(SyncError::Persistence { .. }) => self.publish(working)?,
            Err(_) => {}
        }
        result.map_err(FinderError::from)
    }

    /// Sync the roots recorded in the cache.
    pub fn sync_configured(&self) -> Result<SyncReport, FinderError> {
        let roots = self.search_paths()?;
        self.sync(&roots)
    }

    /// Ask a running sync to stop before its next file.
    pub fn cancel_sync(&self) {
        self.cancellation_token.store(true, Ordering::Relaxed);
    }

    pub fn cache_status(&self) -> Result<CacheStatus, FinderError> {
        let store = self.read_store()?;
        Ok(CacheStatus {
            entry_count: store.len(),
            last_synced_at: store.last_synced_at(),
            hash_size: store.hash_size(),
            search_paths: store.search_paths().to_vec(),
        })
    }

    pub fn search_paths(&self) -> Result<Vec<PathBuf>, FinderError> {
        Ok(self.read_store()?.search_paths().to_vec())
    }

    /// Append a root. Returns `false` if it was already present.
    pub fn add_search_path(&self, path: PathBuf) -> Result<bool, FinderError> {
        self.update_search_paths(|paths| {
            if paths.contains(&path) {
                return false;
            }
            paths.push(path);
            true
        })
    }

    /// Remove a root. Its entries stay until the next sync prunes them.
    pub fn remove_search_path(&self, path: &Path) -> Result<bool, FinderError> {
        self.update_search_paths(|paths| {
            let before = paths.len();
            paths.retain(|p| p != path);
            paths.len() != before
        })
    }

    fn update_search_paths<F>(&self, edit: F) -> Result<bool, FinderError>
    where
        F: FnOnce(&mut Vec<PathBuf>) -> bool,
    {
        let _guard = self.sync_lock.lock().map_err(|_| FinderError::LockPoisoned)?;
        let mut store = self.snapshot()?;
        let mut paths = store.search_paths().to_vec();
        if !edit(&mut paths) {
            return Ok(false);
        }

        store.set_search_paths(paths);
        let saved = store.save(&self.config.cache_path);
        self.publish(store)?;
        saved?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Rgb, RgbImage};
    use std::fs;
    use tempfile::TempDir;

    fn create_test_image(path: &Path, seed: u32) {
        let img: RgbImage = ImageBuffer::from_fn(64, 64, |x, y| {
            let band = (x / (8 + seed) + y / (4 + seed)) % 3;
            match band {
                0 => Rgb([200, (seed * 40 % 256) as u8, 40]),
                1 => Rgb([30, 160, (seed * 70 % 256) as u8]),
                _ => Rgb([(seed * 90 % 256) as u8, 60, 220]),
            }
        });
        img.save(path).unwrap();
    }

    fn setup() -> (TempDir, PathBuf, FinderConfig) {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().join("library");
        fs::create_dir_all(&root).unwrap();
        for seed in 1..=3 {
            create_test_image(&root.join(format!("img_{}.png", seed)), seed);
        }
        let root = root.canonicalize().unwrap();
        let config = FinderConfig::new(vec![root.clone()], 8)
            .unwrap()
            .with_workers(2)
            .unwrap()
            .with_cache_path(temp_dir.path().join("cache.json"));
        (temp_dir, root, config)
    }

    #[test]
    fn test_query_finds_exact_copy_first() {
        let (temp_dir, root, config) = setup();
        let finder = ImageFinder::open(config).unwrap();
        let report = finder.sync_configured().unwrap();
        assert_eq!(report.added, 3);

        let query_path = temp_dir.path().join("query.png");
        fs::copy(root.join("img_2.png"), &query_path).unwrap();

        let results = finder.query(&query_path, 0.0, None).unwrap();
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].path, root.join("img_2.png"));
        assert_eq!(results[0].distance, 0);
        assert_eq!(results[0].similarity, 100.0);
        assert!(results.windows(2).all(|w| w[0].distance <= w[1].distance));

        let exact = finder.query(&query_path, 100.0, None).unwrap();
        assert!(exact.iter().all(|r| r.distance == 0));

        let top = finder.query(&query_path, 0.0, Some(1)).unwrap();
        assert_eq!(top.as_slice(), &results[..1]);
    }

    #[test]
    fn test_cache_status_and_reopen() {
        let (_temp_dir, root, config) = setup();
        let finder = ImageFinder::open(config.clone()).unwrap();
        assert_eq!(finder.load_outcome(), &LoadOutcome::Missing);
        assert_eq!(finder.cache_status().unwrap().entry_count, 0);

        finder.sync(&[root.clone()]).unwrap();
        let status = finder.cache_status().unwrap();
        assert_eq!(status.entry_count, 3);
        assert_eq!(status.hash_size, 8);
        assert_eq!(status.search_paths, vec![root]);
        assert!(status.last_synced_at.is_some());

        let reopened = ImageFinder::open(config.clone()).unwrap();
        assert_eq!(reopened.load_outcome(), &LoadOutcome::Loaded { entries: 3 });
        assert_eq!(reopened.cache_status().unwrap(), status);

        let resized = FinderConfig { hash_size: 16, ..config };
        let rebuilt = ImageFinder::open(resized).unwrap();
        assert_eq!(rebuilt.cache_status().unwrap().entry_count, 0);
        assert!(matches!(
            rebuilt.load_outcome(),
            LoadOutcome::HashSizeMismatch { found: 8, expected: 16 }
        ));
    }

    #[test]
    fn test_query_rejects_undecodable_image() {
        let (temp_dir, _root, config) = setup();
        let finder = ImageFinder::open(config).unwrap();
        let bogus = temp_dir.path().join("bogus.png");
        fs::write(&bogus, b"nope").unwrap();

        assert!(matches!(
            finder.query(&bogus, 90.0, None),
            Err(FinderError::Decode(_))
        ));
    }

    #[test]
    fn test_search_path_management_is_persisted() {
        let (temp_dir, root, config) = setup();
        let finder = ImageFinder::open(config.clone()).unwrap();
        let extra = temp_dir.path().join("extra");

        assert!(finder.add_search_path(extra.clone()).unwrap());
        assert!(!finder.add_search_path(extra.clone()).unwrap());
        assert_eq!(finder.search_paths().unwrap(), vec![root.clone(), extra.clone()]);

        let reopened = ImageFinder::open(config).unwrap();
        assert_eq!(reopened.search_paths().unwrap(), vec![root.clone(), extra.clone()]);

        assert!(reopened.remove_search_path(&extra).unwrap());
        assert!(!reopened.remove_search_path(&extra).unwrap());
        assert_eq!(reopened.search_paths().unwrap(), vec![root]);
    }

    #[test]
    fn test_removed_root_is_pruned_on_next_sync() {
        let (_temp_dir, root, config) = setup();
        let finder = ImageFinder::open(config).unwrap();
        finder.sync_configured().unwrap();

        finder.remove_search_path(&root).unwrap();
        // Entries survive until a sync reconciles them.
        assert_eq!(finder.cache_status().unwrap().entry_count, 3);

        let report = finder.sync_configured().unwrap();
        assert_eq!(report.removed, 3);
        assert_eq!(finder.cache_status().unwrap().entry_count, 0);
    }
}
