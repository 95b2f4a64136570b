//! Per-nucleotide reconstruction from masked k-mer predictions
//!
//! For every window `w` the model sees k-mer tokens `w .. w+k` masked and
//! predicts a k-mer distribution at each token position. The nucleotide at
//! sequence position `pos` is covered by the k-mer tokens `pos-k+1 ..= pos`;
//! reading the window's predictions at those tokens through the
//! decomposition filter and summing gives the nucleotide distribution.
//!
//! Window `w` fully hides nucleotide `w + k - 1`, so position `pos` is read
//! from window `clamp(pos - (k-1), 0, num_windows - 1)`; the first and last
//! `k - 1` positions fall back to the nearest window and see zero padding
//! where their covering tokens would lie outside the sequence.

use crate::codec::{DecompositionFilter, KmerCodec};
use crate::constants::{min_masking_len, NUM_NUCLEOTIDES, UNIFORM_DISTRIBUTION};
use crate::error::{InferenceError, Result};
use crate::masking::{apply_masks, plan_masks};
use crate::model::{validate_output, SequenceModel};
use crate::tokenizer::{SpecialTokenOffset, TokenizedSequence};
use ndarray::{s, Array1, Array2, ArrayView2, ArrayView3, Axis};
use tracing::debug;

/// Which path produced a sequence's result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PredictionPath {
    /// Model inference over masked windows (or one unmasked pass)
    Model,
    /// The sequence was too short; fixed fallback values were returned
    ShortSequenceFallback,
}

/// Nucleotide distributions for one sequence
#[derive(Debug, Clone, PartialEq)]
pub struct SequencePrediction {
    /// `(sequence_len, 4)` probabilities over A, C, G, T
    pub probs: Array2<f32>,
    /// How the distributions were obtained
    pub path: PredictionPath,
    /// Number of masked windows sent to the model
    pub num_windows: usize,
}

/// Reconstruct one nucleotide distribution from a window's predictions
///
/// `kmer_window_prediction` is the window's `(padded_len, 4^k)` k-mer
/// probability matrix, padded with `k - 1` zero rows on each side so that
/// padded rows `label_pos .. label_pos + k` are the tokens covering
/// `label_pos`. Row offset `r` is read through `filter[r]`; the evidence
/// is summed over the vocabulary and over the `k` offsets, then
/// renormalised. An all-zero band yields the uniform distribution.
///
/// The aggregator passes the band from [`kmer_band_probabilities`] with
/// `label_pos = 0` rather than a whole padded window.
pub fn extract_distribution(
    kmer_window_prediction: ArrayView2<'_, f32>,
    label_pos: usize,
    filter: &DecompositionFilter,
) -> Array1<f32> {
    let k = filter.kmer_size();
    let band = kmer_window_prediction.slice(s![label_pos..label_pos + k, ..]);
    let mut dist = Array1::<f32>::zeros(NUM_NUCLEOTIDES);
    for (offset, row) in band.axis_iter(Axis(0)).enumerate() {
        dist += &row.dot(&filter.offset_view(offset));
    }
    let total = dist.sum();
    if total > 0.0 {
        dist / total
    } else {
        Array1::from(UNIFORM_DISTRIBUTION.to_vec())
    }
}

/// Softmax the k-mer logits of the tokens covering `label_pos`
///
/// `window_logits` is one masked window's `(tokenized_len, vocab)` logits.
/// Returns the `(k, 4^k)` band that [`extract_distribution`] reads at
/// `label_pos = 0`: row `r` holds k-mer token `label_pos + r - (k-1)`,
/// softmaxed over the k-mer columns, or zeros where that token lies outside
/// the sequence. Only these `k` rows are ever materialised.
pub fn kmer_band_probabilities(
    window_logits: ArrayView2<'_, f32>,
    label_pos: usize,
    offsets: SpecialTokenOffset,
    codec: &KmerCodec,
) -> Array2<f32> {
    let k = codec.kmer_size();
    let n_tokens = window_logits.nrows().saturating_sub(offsets.total());
    let columns = codec.kmer_logit_range();

    let mut band = Array2::<f32>::zeros((k, codec.num_kmers()));
    for (r, mut out) in band.rows_mut().into_iter().enumerate() {
        let Some(token) = (label_pos + r).checked_sub(k - 1).filter(|&t| t < n_tokens) else {
            continue;
        };
        let logit_row = window_logits.slice(s![offsets.left + token, columns.clone()]);
        let max = logit_row.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
        out.zip_mut_with(&logit_row, |o, &v| *o = (v - max).exp());
        let total = out.sum();
        out /= total;
    }
    band
}

/// Index of the window a position is read from
///
/// Returns `None` when there is no window at all.
#[inline]
pub fn window_for_position(pos: usize, kmer_size: usize, num_windows: usize) -> Option<usize> {
    let last = num_windows.checked_sub(1)?;
    Some(pos.saturating_sub(kmer_size - 1).min(last))
}

/// Masked-window reconstruction for single sequences
#[derive(Debug, Clone, Copy)]
pub struct ReconstructionAggregator<'a> {
    codec: &'a KmerCodec,
    batch_size: usize,
}

impl<'a> ReconstructionAggregator<'a> {
    /// Create an aggregator sending `batch_size` windows per model call
    ///
    /// # Errors
    /// Fails with [`InferenceError::Config`] if `batch_size` is zero.
    pub fn new(codec: &'a KmerCodec, batch_size: usize) -> Result<Self> {
        if batch_size == 0 {
            return Err(InferenceError::Config("pred_batch_size must be positive".to_string()));
        }
        Ok(Self { codec, batch_size })
    }

    /// Reconstruct a distribution for every position of one sequence
    ///
    /// Sequences shorter than `2k - 1` get the uniform distribution at every
    /// position. Otherwise sub-batches are sent to the model strictly in
    /// window order.
    ///
    /// # Errors
    /// - [`InferenceError::ModelCall`] if the model fails or misbehaves
    /// - [`InferenceError::AlignmentInvariant`] if the distribution count
    ///   does not equal `sequence_len`
    pub fn run<M: SequenceModel + ?Sized>(
        &self,
        tokenized: &TokenizedSequence,
        sequence_len: usize,
        mask_token_id: u32,
        model: &M,
    ) -> Result<SequencePrediction> {
        let k = self.codec.kmer_size();
        if sequence_len < min_masking_len(k) {
            debug!(
                "Sequence of length {} below masking threshold {}, using uniform fallback",
                sequence_len,
                min_masking_len(k)
            );
            return Ok(SequencePrediction {
                probs: uniform_distributions(sequence_len),
                path: PredictionPath::ShortSequenceFallback,
                num_windows: 0,
            });
        }

        if tokenized.num_kmer_tokens() != sequence_len - k + 1 {
            return Err(InferenceError::Tokenizer(format!(
                "{} k-mer tokens for a sequence of length {}",
                tokenized.num_kmer_tokens(),
                sequence_len
            )));
        }
        if model.vocab_size() < self.codec.kmer_logit_range().end {
            return Err(InferenceError::ModelCall(format!(
                "model vocabulary of {} does not cover k-mer columns {:?}",
                model.vocab_size(),
                self.codec.kmer_logit_range()
            )));
        }

        let masks = plan_masks(tokenized.len(), k);
        let batch = apply_masks(
            &tokenized.ids,
            &masks,
            mask_token_id,
            tokenized.offsets.left,
            sequence_len,
            k,
        )?;
        let num_windows = batch.num_windows();

        let mut probs = Array2::<f32>::zeros((sequence_len, NUM_NUCLEOTIDES));
        let mut pos = 0usize;
        for (chunk_idx, chunk) in batch.input_ids.axis_chunks_iter(Axis(0), self.batch_size).enumerate() {
            let batch_start = chunk_idx * self.batch_size;
            let batch_end = batch_start + chunk.nrows();

            let output = model.forward(chunk, false)?;
            validate_output(model, &output, chunk.nrows(), batch.row_len(), false)?;
            pos = self.fill_positions(
                output.logits.view(),
                tokenized.offsets,
                &mut probs,
                pos,
                batch_start..batch_end,
                num_windows,
            );
        }

        if pos != sequence_len {
            return Err(InferenceError::AlignmentInvariant {
                expected: sequence_len,
                actual: pos,
            });
        }
        debug!("Reconstructed {} positions from {} windows", sequence_len, num_windows);
        Ok(SequencePrediction {
            probs,
            path: PredictionPath::Model,
            num_windows,
        })
    }

    /// Fill every position whose window lies in `windows`, starting at `pos`
    ///
    /// Returns the next unfilled position.
    fn fill_positions(
        &self,
        logits: ArrayView3<'_, f32>,
        offsets: SpecialTokenOffset,
        probs: &mut Array2<f32>,
        mut pos: usize,
        windows: std::ops::Range<usize>,
        num_windows: usize,
    ) -> usize {
        let k = self.codec.kmer_size();
        while pos < probs.nrows() {
            let Some(theoretical_idx) = window_for_position(pos, k, num_windows) else {
                break;
            };
            if theoretical_idx >= windows.end {
                break;
            }
            let actual_idx = theoretical_idx - windows.start;
            let band = kmer_band_probabilities(logits.index_axis(Axis(0), actual_idx), pos, offsets, self.codec);
            let dist = extract_distribution(band.view(), 0, self.codec.filter());
            probs.row_mut(pos).assign(&dist);
            pos += 1;
        }
        pos
    }
}

/// `(len, 4)` matrix of uniform distributions
pub fn uniform_distributions(len: usize) -> Array2<f32> {
    let mut probs = Array2::<f32>::zeros((len, NUM_NUCLEOTIDES));
    for mut row in probs.rows_mut() {
        row.assign(&ndarray::aview1(&UNIFORM_DISTRIBUTION));
    }
    probs
}
