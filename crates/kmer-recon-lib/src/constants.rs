//! Constants and configuration defaults for kmer-recon
//!
//! This module defines the fixed parameters of the stride-1 k-mer protocol
//! (k-mer size, alphabet, special-token layout) and the derived thresholds
//! that decide which inference path a sequence takes.

/// The k-mer size the masking protocol is defined for
pub const KMER_SIZE: usize = 6;

/// Nucleotide alphabet, in the index order used by every distribution
pub const NUCLEOTIDES: [u8; 4] = *b"ACGT";

/// Number of nucleotide symbols
pub const NUM_NUCLEOTIDES: usize = 4;

/// Number of leading special tokens in the standard vocabulary
/// (`[PAD] [UNK] [CLS] [SEP] [MASK]`)
pub const DEFAULT_NUM_SPECIAL_TOKENS: usize = 5;

/// Default number of masked windows per model call
pub const DEFAULT_PRED_BATCH_SIZE: usize = 128;

/// Default proxy species tag
pub const DEFAULT_PROXY_SPECIES: &str = "candida_glabrata";

/// Sequence length expected by the 3' UTR model variant
pub const THREE_PRIME_SEQUENCE_LEN: usize = 300;

/// Sequence length expected by the 5' UTR model variant
pub const FIVE_PRIME_SEQUENCE_LEN: usize = 1003;

/// Distribution returned for positions that cannot be reconstructed
pub const UNIFORM_DISTRIBUTION: [f32; NUM_NUCLEOTIDES] = [0.25; NUM_NUCLEOTIDES];

/// Version number
pub const VERSION: (u8, u8, u8) = (0, 1, 0);

/// Number of distinct k-mers of length `k` over the nucleotide alphabet
#[inline]
pub const fn num_kmers(k: usize) -> usize {
    1 << (2 * k)
}

/// Number of masked token positions before the window centre
///
/// Together with [`mask_span_after`] this reproduces a "same"-mode
/// convolution with an all-ones kernel of length `k`.
#[inline]
pub const fn mask_span_before(k: usize) -> usize {
    k / 2 - 1
}

/// Number of masked token positions after the window centre
#[inline]
pub const fn mask_span_after(k: usize) -> usize {
    k - mask_span_before(k) - 1
}

/// Shortest sequence for which at least one fully masked window exists
///
/// A window hides `k` consecutive k-mer tokens; that needs `k` tokens,
/// i.e. `2k - 1` nucleotides. Shorter sequences take the uniform fallback.
#[inline]
pub const fn min_masking_len(k: usize) -> usize {
    2 * k - 1
}

/// Shortest sequence that yields at least one k-mer token
#[inline]
pub const fn min_embedding_len(k: usize) -> usize {
    k
}
