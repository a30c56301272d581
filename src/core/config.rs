use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Largest accepted `hash_size`. Beyond this the resample grid (4N x 4N)
/// stops being a perceptual summary and becomes a thumbnail.
pub const MAX_HASH_SIZE: u32 = 64;

pub const DEFAULT_HASH_SIZE: u32 = 8;

pub const DEFAULT_EXTENSIONS: [&str; 8] =
    ["jpg", "jpeg", "png", "bmp", "gif", "webp", "tiff", "tif"];

const CACHE_FILE_NAME: &str = ".image_finder_cache.json";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid hash size {value}: must be between 1 and 64")]
    InvalidHashSize { value: u32 },

    #[error("Invalid worker count {value}: must be at least 1")]
    InvalidWorkerCount { value: usize },

    #[error("Invalid extension {extension:?}")]
    InvalidExtension { extension: String },

    #[error("At least one supported extension is required")]
    NoExtensions,
}

/// Settings shared by the hasher, the cache and the sync pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinderConfig {
    pub search_paths: Vec<PathBuf>,
    pub hash_size: u32,
    pub supported_extensions: BTreeSet<String>,
    pub workers: usize,
    pub cache_path: PathBuf,
}

impl FinderConfig {
    pub fn new(search_paths: Vec<PathBuf>, hash_size: u32) -> Result<Self, ConfigError> {
        validate_hash_size(hash_size)?;
        Ok(Self {
            search_paths,
            hash_size,
            ..Self::default()
        })
    }

    pub fn with_extensions<I, S>(mut self, extensions: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut normalized = BTreeSet::new();
        for ext in extensions {
            let ext = ext.as_ref().trim().trim_start_matches('.').to_lowercase();
            if ext.is_empty() || ext.contains(['/', '\\', '.']) {
                return Err(ConfigError::InvalidExtension { extension: ext });
            }
            normalized.insert(ext);
        }
        if normalized.is_empty() {
            return Err(ConfigError::NoExtensions);
        }

        self.supported_extensions = normalized;
        Ok(self)
    }

    /// Hashing threads, capped at the number of CPUs.
    pub fn with_workers(mut self, workers: usize) -> Result<Self, ConfigError> {
        if workers == 0 {
            return Err(ConfigError::InvalidWorkerCount { value: workers });
        }
        let cpus = num_cpus::get().max(1);
        if workers > cpus {
            log::debug!("Capping {} workers to {} CPUs", workers, cpus);
        }
        self.workers = workers.min(cpus);
        Ok(self)
    }

    pub fn with_cache_path(mut self, cache_path: impl Into<PathBuf>) -> Self {
        self.cache_path = cache_path.into();
        self
    }

    pub fn is_supported(&self, path: &Path) -> bool {
        has_supported_extension(&self.supported_extensions, path)
    }

    /// Number of bits in every fingerprint produced under this config.
    pub fn fingerprint_bits(&self) -> usize {
        fingerprint_bits(self.hash_size)
    }
}

impl Default for FinderConfig {
    fn default() -> Self {
        let home = home_dir();
        Self {
            search_paths: vec![home.join("Pictures")],
            hash_size: DEFAULT_HASH_SIZE,
            supported_extensions: DEFAULT_EXTENSIONS.iter().map(|e| e.to_string()).collect(),
            workers: num_cpus::get().max(1),
            cache_path: home.join(CACHE_FILE_NAME),
        }
    }
}

fn home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
}

pub fn validate_hash_size(hash_size: u32) -> Result<(), ConfigError> {
    if hash_size == 0 || hash_size > MAX_HASH_SIZE {
        return Err(ConfigError::InvalidHashSize { value: hash_size });
    }
    Ok(())
}

/// Case-insensitive match of `path`'s extension against a normalized set.
pub fn has_supported_extension(extensions: &BTreeSet<String>, path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .is_some_and(|ext| extensions.contains(&ext))
}

/// Three channels, `hash_size²` bits each.
pub fn fingerprint_bits(hash_size: u32) -> usize {
    3 * (hash_size as usize) * (hash_size as usize)
}
