use crate::core::config::{FinderConfig, has_supported_extension};
use crate::core::decode::{Decoder, FileDecoder};
use crate::core::fingerprint::Fingerprint;
use crate::core::hash::PerceptualHasher;
use crate::core::store::{FingerprintStore, StoreError, Upsert};
use chrono::Utc;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::time::{Instant, UNIX_EPOCH};
use thiserror::Error;
use walkdir::WalkDir;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Operation cancelled")]
    Cancelled,

    #[error("Hash size mismatch: store uses {store}, hasher uses {hasher}")]
    HashSizeMismatch { store: u32, hasher: u32 },

    #[error("Failed to build worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    #[error("Cache update failed: {0}")]
    Store(#[from] StoreError),

    /// The in-memory store was updated but could not be written to disk.
    #[error("Sync finished but the cache could not be saved: {source}")]
    Persistence {
        report: SyncReport,
        #[source]
        source: StoreError,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncReport {
    pub added: usize,
    pub updated: usize,
    pub removed: usize,
    pub unchanged: usize,
    pub failed: Vec<FailedFile>,
    pub skipped_roots: Vec<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedFile {
    pub path: PathBuf,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncProgress {
    pub files_processed: usize,
    pub total_files: usize,
    pub current_file: String,
    pub phase: SyncPhase,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum SyncPhase {
    Discovery,
    Hashing,
    Pruning,
    Saving,
    Complete,
}

/// A discovered file with the cheap stat taken before any decoding.
#[derive(Debug, Clone)]
struct StatFile {
    path: PathBuf,
    modified_at: f64,
    byte_size: u64,
}

/// Result of one worker's decode + hash.
#[derive(Debug)]
struct HashedFile {
    path: PathBuf,
    fingerprint: Fingerprint,
    modified_at: f64,
    byte_size: u64,
}

#[derive(Debug, Default)]
struct Discovery {
    files: Vec<StatFile>,
    present: HashSet<PathBuf>,
    failed: Vec<FailedFile>,
    skipped_roots: Vec<PathBuf>,
    /// Directories or files the walk could not read. Cached entries under
    /// them are kept as last-known instead of being pruned.
    unreadable: Vec<PathBuf>,
}

/// Reconciles a [`FingerprintStore`] with the files under a set of roots.
///
/// Workers only decode and hash; every store mutation happens on the
/// calling thread against a private copy that replaces the caller's store
/// in one assignment at the end.
pub struct SyncOrchestrator {
    progress_sender: Option<Sender<SyncProgress>>,
    cancellation_token: Arc<AtomicBool>,
    supported_extensions: BTreeSet<String>,
    workers: usize,
    cache_path: Option<PathBuf>,
    decoder: Arc<dyn Decoder>,
}

impl SyncOrchestrator {
    pub fn new(config: &FinderConfig) -> Self {
        Self {
            progress_sender: None,
            cancellation_token: Arc::new(AtomicBool::new(false)),
            supported_extensions: config.supported_extensions.clone(),
            workers: config.workers.max(1),
            cache_path: Some(config.cache_path.clone()),
            decoder: Arc::new(FileDecoder),
        }
    }

    pub fn with_progress_sender(mut self, sender: Sender<SyncProgress>) -> Self {
        self.progress_sender = Some(sender);
        self
    }

    pub fn with_decoder(mut self, decoder: Arc<dyn Decoder>) -> Self {
        self.decoder = decoder;
        self
    }

    /// `None` keeps the sync in memory only.
    pub fn with_cache_path(mut self, cache_path: Option<PathBuf>) -> Self {
        self.cache_path = cache_path;
        self
    }

    pub fn with_cancellation_token(mut self, token: Arc<AtomicBool>) -> Self {
        self.cancellation_token = token;
        self
    }

    pub fn cancellation_token(&self) -> Arc<AtomicBool> {
        self.cancellation_token.clone()
    }

    pub fn cancel(&self) {
        self.cancellation_token.store(true, Ordering::Relaxed);
    }

    fn is_cancelled(&self) -> bool {
        self.cancellation_token.load(Ordering::Relaxed)
    }

    pub fn sync(
        &self,
        roots: &[PathBuf],
        store: &mut FingerprintStore,
        hasher: &PerceptualHasher,
    ) -> Result<SyncReport, SyncError> {
        if store.hash_size() != hasher.hash_size() {
            return Err(SyncError::HashSizeMismatch {
                store: store.hash_size(),
                hasher: hasher.hash_size(),
            });
        }
        if self.is_cancelled() {
            return Err(SyncError::Cancelled);
        }

        let started = Instant::now();
        log::info!("Sync started over {} root(s)", roots.len());

        // Phase 1: Discovery - walk roots and stat every candidate
        self.send_progress(SyncProgress {
            files_processed: 0,
            total_files: 0,
            current_file: "Discovering files...".to_string(),
            phase: SyncPhase::Discovery,
        });

        let discovery = self.discover_files(roots)?;
        let mut report = SyncReport {
            failed: discovery.failed,
            skipped_roots: discovery.skipped_roots,
            ..SyncReport::default()
        };

        let discovered = discovery.files.len();
        let pending: Vec<StatFile> = discovery
            .files
            .into_iter()
            .filter(|file| store.needs_rehash(&file.path, file.modified_at, file.byte_size))
            .collect();
        report.unchanged = discovered - pending.len();

        // Phase 2: Hashing - decode and hash only new or changed files
        let outcomes = self.hash_files(&pending, hasher)?;
        if self.is_cancelled() {
            return Err(SyncError::Cancelled);
        }

        let mut staged = store.clone();
        for outcome in outcomes {
            match outcome {
                Ok(hashed) => {
                    let kind = staged.upsert(
                        hashed.path,
                        hashed.fingerprint,
                        hashed.modified_at,
                        hashed.byte_size,
                    )?;
                    match kind {
                        Upsert::Added => report.added += 1,
                        Upsert::Updated => report.updated += 1,
                    }
                }
                Err(failed) => {
                    log::warn!("Skipping {}: {}", failed.path.display(), failed.reason);
                    report.failed.push(failed);
                }
            }
        }

        // Phase 3: Pruning - drop deleted files and files outside the roots
        self.send_progress(SyncProgress {
            files_processed: pending.len(),
            total_files: pending.len(),
            current_file: "Pruning removed files...".to_string(),
            phase: SyncPhase::Pruning,
        });
        let mut present = discovery.present;
        present.extend(entries_under(&staged, &discovery.unreadable));
        report.removed = staged.prune(&present);
        staged.set_search_paths(roots.to_vec());
        staged.mark_synced(Utc::now());

        // Phase 4: Saving - one atomic write for the whole pass
        if let Some(cache_path) = &self.cache_path {
            self.send_progress(SyncProgress {
                files_processed: pending.len(),
                total_files: pending.len(),
                current_file: cache_path.to_string_lossy().to_string(),
                phase: SyncPhase::Saving,
            });
            if let Err(source) = staged.save(cache_path) {
                log::warn!("Failed to save cache {}: {}", cache_path.display(), source);
                *store = staged;
                return Err(SyncError::Persistence { report, source });
            }
        }
        *store = staged;

        self.send_progress(SyncProgress {
            files_processed: pending.len(),
            total_files: pending.len(),
            current_file: "Sync complete".to_string(),
            phase: SyncPhase::Complete,
        });

        log::info!(
            "Sync finished in {:.2?}: {} added, {} updated, {} removed, {} unchanged, {} failed",
            started.elapsed(),
            report.added,
            report.updated,
            report.removed,
            report.unchanged,
            report.failed.len()
        );
        Ok(report)
    }

    fn discover_files(&self, roots: &[PathBuf]) -> Result<Discovery, SyncError> {
        let mut discovery = Discovery::default();
        let mut seen = BTreeSet::new();

        for root in roots {
            if self.is_cancelled() {
                return Err(SyncError::Cancelled);
            }

            let root_path = match fs::canonicalize(root) {
                Ok(path) if path.is_dir() => path,
                Ok(_) | Err(_) => {
                    log::warn!("Skipping search path {}: not a directory", root.display());
                    discovery.skipped_roots.push(root.clone());
                    continue;
                }
            };

            for entry in WalkDir::new(&root_path).follow_links(false) {
                if self.is_cancelled() {
                    return Err(SyncError::Cancelled);
                }

                let entry = match entry {
                    Ok(entry) => entry,
                    Err(e) => {
                        let path = e.path().unwrap_or(root_path.as_path()).to_path_buf();
                        log::warn!("Cannot read {}: {}", path.display(), e);
                        discovery.failed.push(FailedFile {
                            path: path.clone(),
                            reason: e.to_string(),
                        });
                        discovery.unreadable.push(path);
                        continue;
                    }
                };

                let path = entry.path();
                if !entry.file_type().is_file()
                    || !has_supported_extension(&self.supported_extensions, path)
                {
                    continue;
                }
                // Cache keys are UTF-8 strings; such a path would not survive a reload.
                if path.to_str().is_none() {
                    log::warn!("Skipping {}: path is not valid UTF-8", path.display());
                    discovery.failed.push(FailedFile {
                        path: path.to_path_buf(),
                        reason: "path is not valid UTF-8".to_string(),
                    });
                    continue;
                }
                if !seen.insert(path.to_path_buf()) {
                    continue;
                }

                match stat_file(path) {
                    Ok(file) => {
                        discovery.present.insert(file.path.clone());
                        discovery.files.push(file);
                    }
                    Err(e) => {
                        // Vanished between the walk and the stat: let prune handle it.
                        if e.kind() == std::io::ErrorKind::NotFound {
                            continue;
                        }
                        discovery.present.insert(path.to_path_buf());
                        discovery.failed.push(FailedFile {
                            path: path.to_path_buf(),
                            reason: e.to_string(),
                        });
                    }
                }
            }
        }

        Ok(discovery)
    }

    fn hash_files(
        &self,
        files: &[StatFile],
        hasher: &PerceptualHasher,
    ) -> Result<Vec<Result<HashedFile, FailedFile>>, SyncError> {
        let total_files = files.len();
        let processed_count = AtomicUsize::new(0);

        self.send_progress(SyncProgress {
            files_processed: 0,
            total_files,
            current_file: "Hashing files...".to_string(),
            phase: SyncPhase::Hashing,
        });

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.workers)
            .build()?;

        let outcomes: Vec<Result<HashedFile, FailedFile>> = pool.install(|| {
            files
                .par_iter()
                .filter_map(|file| {
                    if self.is_cancelled() {
                        return None;
                    }

                    let outcome = self.hash_file(file, hasher);

                    let current_count = processed_count.fetch_add(1, Ordering::Relaxed) + 1;
                    self.send_progress(SyncProgress {
                        files_processed: current_count,
                        total_files,
                        current_file: file.path.to_string_lossy().to_string(),
                        phase: SyncPhase::Hashing,
                    });

                    Some(outcome)
                })
                .collect()
        });

        Ok(outcomes)
    }

    fn hash_file(
        &self,
        file: &StatFile,
        hasher: &PerceptualHasher,
    ) -> Result<HashedFile, FailedFile> {
        let pixels = self.decoder.decode(&file.path).map_err(|e| FailedFile {
            path: file.path.clone(),
            reason: e.to_string(),
        })?;

        Ok(HashedFile {
            path: file.path.clone(),
            fingerprint: hasher.hash(&pixels),
            modified_at: file.modified_at,
            byte_size: file.byte_size,
        })
    }

    fn send_progress(&self, progress: SyncProgress) {
        if let Some(sender) = &self.progress_sender {
            let _ = sender.send(progress);
        }
    }
}

/// Cached paths lying under any of `dirs`.
fn entries_under(store: &FingerprintStore, dirs: &[PathBuf]) -> Vec<PathBuf> {
    if dirs.is_empty() {
        return Vec::new();
    }
    store
        .snapshot()
        .keys()
        .filter(|path| dirs.iter().any(|dir| path.starts_with(dir)))
        .cloned()
        .collect()
}

fn stat_file(path: &Path) -> std::io::Result<StatFile> {
    let metadata = fs::metadata(path)?;
    let modified = metadata.modified()?;
    let modified_at = match modified.duration_since(UNIX_EPOCH) {
        Ok(since) => since.as_secs_f64(),
        Err(before) => -before.duration().as_secs_f64(),
    };

    Ok(StatFile {
        path: path.to_path_buf(),
        modified_at,
        byte_size: metadata.len(),
    })
}
