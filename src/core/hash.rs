//! Color-aware DCT perceptual hash.
//!
//! For `hash_size = N` every channel is resampled to a `4N x 4N` grid,
//! transformed with a 2D DCT-II, and the first `N²` AC coefficients in
//! zig-zag order are binarized against their per-channel median. The three
//! channel blocks are concatenated R, G, B into a `3N²`-bit fingerprint.

use crate::core::config::{ConfigError, validate_hash_size};
use crate::core::fingerprint::Fingerprint;
use image::imageops::{self, FilterType};
use image::{DynamicImage, RgbImage};
use std::f64::consts::PI;

/// Resample grid side relative to `hash_size`.
pub const OVERSAMPLE: u32 = 4;

/// Coefficients smaller than this are treated as exactly zero. Keeps
/// uniform images from hashing to floating-point noise.
const COEFFICIENT_EPSILON: f64 = 1e-6;

const CHANNELS: usize = 3;

#[derive(Debug, Clone)]
pub struct PerceptualHasher {
    hash_size: u32,
    /// `cosines[k * m + n] = cos(pi * k * (2n + 1) / 2m)`
    cosines: Vec<f64>,
    /// Row-major indices into the `m x m` coefficient matrix.
    low_band: Vec<usize>,
}

impl PerceptualHasher {
    pub fn new(hash_size: u32) -> Result<Self, ConfigError> {
        validate_hash_size(hash_size)?;

        let m = (hash_size * OVERSAMPLE) as usize;
        let mut cosines = Vec::with_capacity(m * m);
        for k in 0..m {
            for n in 0..m {
                cosines.push((PI * k as f64 * (2 * n + 1) as f64 / (2 * m) as f64).cos());
            }
        }

        let per_channel = (hash_size as usize).pow(2);
        let low_band = zigzag(m)
            .skip(1) // DC
            .take(per_channel)
            .map(|(row, col)| row * m + col)
            .collect();

        Ok(Self {
            hash_size,
            cosines,
            low_band,
        })
    }

    pub fn hash_size(&self) -> u32 {
        self.hash_size
    }

    pub fn bits(&self) -> usize {
        CHANNELS * self.low_band.len()
    }

    fn grid_size(&self) -> u32 {
        self.hash_size * OVERSAMPLE
    }

    pub fn hash_dynamic(&self, image: &DynamicImage) -> Fingerprint {
        self.hash(&image.to_rgb8())
    }

    pub fn hash(&self, pixels: &RgbImage) -> Fingerprint {
        let m = self.grid_size();
        let resized = if pixels.width() == 0 || pixels.height() == 0 {
            RgbImage::new(m, m)
        } else {
            imageops::resize(pixels, m, m, FilterType::Lanczos3)
        };

        let mut bits = Vec::with_capacity(self.bits());
        for channel in 0..CHANNELS {
            let grid: Vec<f64> = resized.pixels().map(|p| p.0[channel] as f64).collect();
            let coefficients = self.dct_2d(&grid);

            let selected: Vec<f64> = self
                .low_band
                .iter()
                .map(|&i| snap_to_zero(coefficients[i]))
                .collect();
            let threshold = median(&selected);

            bits.extend(selected.iter().map(|&c| c > threshold));
        }

        Fingerprint::from_bits(bits)
    }

    /// Unnormalized DCT-II along rows, then columns. Scale does not matter
    /// because every coefficient is only compared to the channel median.
    fn dct_2d(&self, grid: &[f64]) -> Vec<f64> {
        let m = self.grid_size() as usize;
        let c = &self.cosines;

        let mut rows = vec![0.0; m * m];
        for y in 0..m {
            let line = &grid[y * m..(y + 1) * m];
            for l in 0..m {
                let basis = &c[l * m..(l + 1) * m];
                rows[y * m + l] = line.iter().zip(basis).map(|(p, b)| p * b).sum();
            }
        }

        let mut out = vec![0.0; m * m];
        for k in 0..m {
            let basis = &c[k * m..(k + 1) * m];
            for l in 0..m {
                out[k * m + l] = (0..m).map(|y| basis[y] * rows[y * m + l]).sum();
            }
        }
        out
    }
}

/// JPEG zig-zag traversal of an `m x m` matrix, starting at DC.
fn zigzag(m: usize) -> impl Iterator<Item = (usize, usize)> {
    (0..(2 * m).saturating_sub(1)).flat_map(move |diagonal| {
        let lo = diagonal.saturating_sub(m - 1);
        let hi = diagonal.min(m - 1);
        let rows: Box<dyn Iterator<Item = usize>> = if diagonal % 2 == 0 {
            Box::new((lo..=hi).rev())
        } else {
            Box::new(lo..=hi)
        };
        rows.map(move |row| (row, diagonal - row))
    })
}

fn snap_to_zero(value: f64) -> f64 {
    if value.abs() < COEFFICIENT_EPSILON {
        0.0
    } else {
        value
    }
}

fn median(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}
