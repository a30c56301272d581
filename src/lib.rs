//! Perceptual-hash image similarity search over a cached file library.

pub mod core;

pub use crate::core::config::FinderConfig;
pub use crate::core::decode::{DecodeError, Decoder, FileDecoder};
pub use crate::core::finder::{CacheStatus, FinderError, ImageFinder};
pub use crate::core::fingerprint::Fingerprint;
pub use crate::core::hash::PerceptualHasher;
pub use crate::core::matcher::SearchResult;
pub use crate::core::store::{CacheEntry, FingerprintStore, LoadOutcome};
pub use crate::core::sync::{SyncError, SyncOrchestrator, SyncPhase, SyncProgress, SyncReport};
