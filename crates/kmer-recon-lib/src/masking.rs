//! Mask window planning
//!
//! Row `i` of the mask matrix hides a band of `k` consecutive token
//! positions around `i` (for k = 6: `i-2 ..= i+3`). Only the rows whose band
//! lies entirely on k-mer tokens are kept; kept row `w` hides k-mer tokens
//! `w .. w+k`, which are exactly the tokens covering nucleotide `w + k - 1`.

use crate::constants::{mask_span_after, mask_span_before, min_masking_len};
use crate::error::{InferenceError, Result};
use ndarray::{Array2, Axis};

/// Build the banded mask matrix for a token row of `tokenized_len` tokens
///
/// The result is `tokenized_len x tokenized_len`; row `i` is `true` on the
/// positions masked when window `i` is active, clipped at both ends.
pub fn plan_masks(tokenized_len: usize, kmer_size: usize) -> Array2<bool> {
    let before = mask_span_before(kmer_size);
    let after = mask_span_after(kmer_size);
    let mut masks = Array2::from_elem((tokenized_len, tokenized_len), false);
    for (i, mut row) in masks.axis_iter_mut(Axis(0)).enumerate() {
        let start = i.saturating_sub(before);
        let end = (i + after + 1).min(tokenized_len);
        row.slice_mut(ndarray::s![start..end]).fill(true);
    }
    masks
}

/// Masked copies of one token row, one per reconstructible window
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaskedBatch {
    /// `num_windows x tokenized_len` token ids
    pub input_ids: Array2<u32>,
}

impl MaskedBatch {
    /// Number of windows (rows)
    pub fn num_windows(&self) -> usize {
        self.input_ids.nrows()
    }

    /// Length of each row
    pub fn row_len(&self) -> usize {
        self.input_ids.ncols()
    }
}

/// Range of mask-matrix rows whose band lies on k-mer tokens
///
/// `[before + left, sequence_len - (k - 1) - after + left)`; empty when the
/// sequence is shorter than `2k - 1`.
pub fn window_rows(left_offset: usize, sequence_len: usize, kmer_size: usize) -> std::ops::Range<usize> {
    let start = mask_span_before(kmer_size) + left_offset;
    let end = (sequence_len + left_offset)
        .saturating_sub(kmer_size - 1)
        .saturating_sub(mask_span_after(kmer_size));
    start..end.max(start)
}

/// Apply the kept mask rows to `token_row`
///
/// # Errors
/// - [`InferenceError::TooShortForMasking`] if the sequence has no window;
///   callers are expected to take the uniform fallback instead.
/// - [`InferenceError::Tokenizer`] if the mask matrix does not match the row.
pub fn apply_masks(
    token_row: &[u32],
    masks: &Array2<bool>,
    mask_token_id: u32,
    left_offset: usize,
    sequence_len: usize,
    kmer_size: usize,
) -> Result<MaskedBatch> {
    let min_len = min_masking_len(kmer_size);
    if sequence_len < min_len {
        return Err(InferenceError::TooShortForMasking { sequence_len, min_len });
    }
    if masks.dim() != (token_row.len(), token_row.len()) {
        return Err(InferenceError::Tokenizer(format!(
            "mask matrix {:?} does not match token row of length {}",
            masks.dim(),
            token_row.len()
        )));
    }
    let rows = window_rows(left_offset, sequence_len, kmer_size);
    if rows.end > token_row.len() {
        return Err(InferenceError::Tokenizer(format!(
            "window rows {:?} exceed token row of length {}",
            rows,
            token_row.len()
        )));
    }

    let mut input_ids = Array2::<u32>::zeros((rows.len(), token_row.len()));
    for (mut out, mask) in input_ids
        .axis_iter_mut(Axis(0))
        .zip(masks.slice(ndarray::s![rows, ..]).axis_iter(Axis(0)))
    {
        for ((slot, &token), &masked) in out.iter_mut().zip(token_row).zip(mask.iter()) {
            *slot = if masked { mask_token_id } else { token };
        }
    }
    Ok(MaskedBatch { input_ids })
}
