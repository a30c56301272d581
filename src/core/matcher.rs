use crate::core::fingerprint::{Fingerprint, FingerprintError};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum MatchError {
    #[error(transparent)]
    Fingerprint(#[from] FingerprintError),

    #[error("Cannot score zero-length fingerprints")]
    EmptyFingerprint,

    #[error("Invalid similarity threshold: {value}")]
    InvalidThreshold { value: f64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub path: PathBuf,
    pub distance: u32,
    /// Percentage in `[0, 100]`.
    pub similarity: f64,
    pub byte_size: u64,
}

/// A cached fingerprint offered for ranking.
#[derive(Debug, Clone, Copy)]
pub struct Candidate<'a> {
    pub path: &'a Path,
    pub fingerprint: &'a Fingerprint,
    pub byte_size: u64,
}

pub fn hamming_distance(a: &Fingerprint, b: &Fingerprint) -> Result<u32, MatchError> {
    Ok(a.hamming(b)?)
}

/// `100 * (1 - distance / total_bits)`
pub fn similarity(distance: u32, total_bits: usize) -> Result<f64, MatchError> {
    if total_bits == 0 {
        return Err(MatchError::EmptyFingerprint);
    }
    Ok(100.0 * (1.0 - distance as f64 / total_bits as f64))
}

/// Score every candidate against `query`, keep those at or above
/// `threshold_percent`, and order them by ascending distance then path.
///
/// A single candidate of the wrong length fails the whole ranking.
pub fn rank<'a, I>(
    query: &Fingerprint,
    candidates: I,
    threshold_percent: f64,
) -> Result<Vec<SearchResult>, MatchError>
where
    I: IntoIterator<Item = Candidate<'a>>,
{
    let mut results = score(query, candidates, threshold_percent)?;
    results.sort_by(compare_results);
    Ok(results)
}

/// Like [`rank`] but only the best `limit` results are ordered; the
/// remainder is partitioned away instead of sorted.
pub fn top_matches<'a, I>(
    query: &Fingerprint,
    candidates: I,
    threshold_percent: f64,
    limit: usize,
) -> Result<Vec<SearchResult>, MatchError>
where
    I: IntoIterator<Item = Candidate<'a>>,
{
    let mut results = score(query, candidates, threshold_percent)?;
    if limit == 0 {
        return Ok(Vec::new());
    }
    if results.len() > limit {
        results.select_nth_unstable_by(limit - 1, compare_results);
        results.truncate(limit);
    }
    results.sort_by(compare_results);
    Ok(results)
}

fn score<'a, I>(
    query: &Fingerprint,
    candidates: I,
    threshold_percent: f64,
) -> Result<Vec<SearchResult>, MatchError>
where
    I: IntoIterator<Item = Candidate<'a>>,
{
    if threshold_percent.is_nan() {
        return Err(MatchError::InvalidThreshold {
            value: threshold_percent,
        });
    }
    let total_bits = query.len();
    if total_bits == 0 {
        return Err(MatchError::EmptyFingerprint);
    }

    let mut results = Vec::new();
    for candidate in candidates {
        let distance = hamming_distance(query, candidate.fingerprint)?;
        let similarity = similarity(distance, total_bits)?;
        if similarity >= threshold_percent {
            results.push(SearchResult {
                path: candidate.path.to_path_buf(),
                distance,
                similarity,
                byte_size: candidate.byte_size,
            });
        }
    }
    Ok(results)
}

fn compare_results(a: &SearchResult, b: &SearchResult) -> Ordering {
    a.distance
        .cmp(&b.distance)
        .then_with(|| a.path.cmp(&b.path))
}
