use std::fmt;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FingerprintError {
    #[error("Fingerprint length mismatch: {left} bits vs {right} bits")]
    LengthMismatch { left: usize, right: usize },

    #[error("Invalid fingerprint encoding: {message}")]
    InvalidEncoding { message: String },
}

/// Fixed-length bit vector, packed MSB-first into bytes.
///
/// Trailing bits in the final byte are always zero, so byte-wise XOR
/// never counts padding as a difference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    bits: usize,
    bytes: Vec<u8>,
}

impl Fingerprint {
    pub fn from_bits<I>(bits: I) -> Self
    where
        I: IntoIterator<Item = bool>,
    {
        let mut bytes = Vec::new();
        let mut len = 0usize;
        for bit in bits {
            if len % 8 == 0 {
                bytes.push(0);
            }
            if bit {
                let last = bytes.len() - 1;
                bytes[last] |= 0x80 >> (len % 8);
            }
            len += 1;
        }
        Self { bits: len, bytes }
    }

    pub fn zeroed(bits: usize) -> Self {
        Self {
            bits,
            bytes: vec![0; bits.div_ceil(8)],
        }
    }

    pub fn len(&self) -> usize {
        self.bits
    }

    pub fn is_empty(&self) -> bool {
        self.bits == 0
    }

    pub fn bit(&self, index: usize) -> bool {
        index < self.bits && self.bytes[index / 8] & (0x80 >> (index % 8)) != 0
    }

    pub fn count_ones(&self) -> u32 {
        self.bytes.iter().map(|b| b.count_ones()).sum()
    }

    /// Number of differing bit positions. Both sides must have the same length.
    pub fn hamming(&self, other: &Fingerprint) -> Result<u32, FingerprintError> {
        if self.bits != other.bits {
            return Err(FingerprintError::LengthMismatch {
                left: self.bits,
                right: other.bits,
            });
        }

        let mut left = self.bytes.chunks_exact(8);
        let mut right = other.bytes.chunks_exact(8);
        let mut distance: u32 = left
            .by_ref()
            .zip(right.by_ref())
            .map(|(a, b)| {
                let a = u64::from_be_bytes(a.try_into().unwrap_or([0; 8]));
                let b = u64::from_be_bytes(b.try_into().unwrap_or([0; 8]));
                (a ^ b).count_ones()
            })
            .sum();
        distance += left
            .remainder()
            .iter()
            .zip(right.remainder())
            .map(|(a, b)| (a ^ b).count_ones())
            .sum::<u32>();

        Ok(distance)
    }

    pub fn to_hex(&self) -> String {
        self.bytes.iter().map(|b| format!("{:02x}", b)).collect()
    }

    /// Parse a hex string produced by [`Fingerprint::to_hex`] for a fingerprint of `bits` bits.
    pub fn from_hex(hex: &str, bits: usize) -> Result<Self, FingerprintError> {
        let expected_chars = bits.div_ceil(8) * 2;
        if hex.len() != expected_chars {
            return Err(FingerprintError::InvalidEncoding {
                message: format!(
                    "expected {} hex characters for {} bits, found {}",
                    expected_chars,
                    bits,
                    hex.len()
                ),
            });
        }

        let bytes = hex
            .as_bytes()
            .chunks(2)
            .map(|pair| {
                std::str::from_utf8(pair)
                    .ok()
                    .and_then(|s| u8::from_str_radix(s, 16).ok())
                    .ok_or_else(|| FingerprintError::InvalidEncoding {
                        message: format!("invalid hex digits {:?}", String::from_utf8_lossy(pair)),
                    })
            })
            .collect::<Result<Vec<u8>, _>>()?;

        let padding = bytes.len() * 8 - bits;
        if padding > 0 {
            let mask = (1u8 << padding) - 1;
            if bytes.last().is_some_and(|last| last & mask != 0) {
                return Err(FingerprintError::InvalidEncoding {
                    message: "non-zero padding bits".to_string(),
                });
            }
        }

        Ok(Self { bits, bytes })
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}
