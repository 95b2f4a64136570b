//! DNA nucleotide and k-mer encoding
//!
//! Nucleotides are mapped to indices in the order used by every
//! probability distribution in this crate:
//!
//! - A (65/97)  -> 0
//! - C (67/99)  -> 1
//! - G (71/103) -> 2
//! - T (84/116) -> 3
//!
//! K-mers are enumerated lexicographically over this order, so k-mer index
//! `i` reads as the base-4 number whose most significant digit is the first
//! nucleotide.

use crate::constants::NUCLEOTIDES;
use thiserror::Error;

/// Error type for encoding operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EncodingError {
    /// The input byte is not a valid DNA base (A/C/G/T)
    #[error("Invalid DNA base {base:?} at position {position}")]
    InvalidBase {
        /// Offending byte, as a character
        base: char,
        /// Position within the input
        position: usize,
    },
}

/// Encode a single DNA nucleotide to its distribution index
#[inline]
pub const fn encode_base(base: u8) -> Option<u8> {
    match base {
        b'A' | b'a' => Some(0),
        b'C' | b'c' => Some(1),
        b'G' | b'g' => Some(2),
        b'T' | b't' => Some(3),
        _ => None,
    }
}

/// Decode a nucleotide index to its (uppercase) base
#[inline]
pub const fn decode_base(index: u8) -> u8 {
    NUCLEOTIDES[(index & 0b11) as usize]
}

/// Validate a sequence and return it upper-cased
///
/// # Errors
/// Returns [`EncodingError::InvalidBase`] for the first non-ACGT byte
pub fn normalize_sequence(seq: &[u8]) -> Result<String, EncodingError> {
    let mut out = String::with_capacity(seq.len());
    for (position, &base) in seq.iter().enumerate() {
        let index = encode_base(base).ok_or(EncodingError::InvalidBase {
            base: base as char,
            position,
        })?;
        out.push(decode_base(index) as char);
    }
    Ok(out)
}

/// Returns true if `token` is a k-mer of length `k` over uppercase ACGT
pub fn is_kmer(token: &str, k: usize) -> bool {
    token.len() == k && token.bytes().all(|b| NUCLEOTIDES.contains(&b))
}

/// Decode a lexicographic k-mer index back to its string
pub fn index_to_kmer(index: usize, k: usize) -> String {
    let mut bytes = vec![b'A'; k];
    let mut rest = index;
    for slot in bytes.iter_mut().rev() {
        *slot = decode_base((rest & 0b11) as u8);
        rest >>= 2;
    }
    bytes.into_iter().map(char::from).collect()
}

/// All overlapping k-mers of `seq` with stride 1
///
/// Returns an empty vector when `seq` is shorter than `k`.
pub fn kmers_stride1(seq: &str, k: usize) -> Vec<&str> {
    if seq.len() < k {
        return Vec::new();
    }
    (0..=seq.len() - k).map(|i| &seq[i..i + k]).collect()
}
