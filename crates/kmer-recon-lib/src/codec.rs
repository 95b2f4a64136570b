//! K-mer codec: vocabulary mapping and the decomposition filter
//!
//! The model predicts a distribution over k-mer tokens at every token
//! position. The decomposition filter turns such a distribution into
//! evidence for a single nucleotide: `filter[offset, kmer, nuc] = 1` iff the
//! k-mer, when its token sits `offset` positions before the last token that
//! covers the target nucleotide, carries `nuc` at the target.
//!
//! Concretely, a k-mer token at padded row `label_pos + offset` covers the
//! target with its nucleotide at in-k-mer index `k - 1 - offset`.

use crate::constants::{num_kmers, NUM_NUCLEOTIDES};
use crate::encoding::{encode_base, index_to_kmer, is_kmer};
use crate::error::{InferenceError, Result};
use ahash::AHashMap;
use ndarray::{Array3, ArrayView2};
use tracing::{debug, info};

/// Map every k-mer token in `vocabulary` to its id
///
/// Non-k-mer tokens (special tokens, species tags) are skipped.
pub fn build_vocab_mapping(vocabulary: &[String], kmer_size: usize) -> AHashMap<String, u32> {
    vocabulary
        .iter()
        .enumerate()
        .filter(|(_, token)| is_kmer(token, kmer_size))
        .map(|(id, token)| (token.clone(), id as u32))
        .collect()
}

/// Fixed `(k, 4^k, 4)` tensor of 0/1 entries, indexed by k-mer slice position
#[derive(Debug, Clone, PartialEq)]
pub struct DecompositionFilter {
    weights: Array3<f32>,
}

impl DecompositionFilter {
    /// K-mer size the filter was built for
    pub fn kmer_size(&self) -> usize {
        self.weights.dim().0
    }

    /// Number of k-mer tokens (`4^k`)
    pub fn num_kmers(&self) -> usize {
        self.weights.dim().1
    }

    /// Filter entry at `[offset, kmer_index, nucleotide]`
    #[inline]
    pub fn get(&self, offset: usize, kmer_index: usize, nucleotide: usize) -> f32 {
        self.weights[[offset, kmer_index, nucleotide]]
    }

    /// `(4^k, 4)` slice for one phase offset
    pub fn offset_view(&self, offset: usize) -> ArrayView2<'_, f32> {
        self.weights.index_axis(ndarray::Axis(0), offset)
    }

    /// The underlying tensor
    pub fn weights(&self) -> &Array3<f32> {
        &self.weights
    }
}

/// Build the decomposition filter for a vocabulary
///
/// K-mer token ids must occupy `[num_special_tokens, num_special_tokens + 4^k)`,
/// the slice of logit columns the aggregator softmaxes over.
///
/// # Errors
/// Fails with [`InferenceError::VocabularyMismatch`] if the vocabulary does
/// not hold exactly the `4^k` k-mers inside that slice.
pub fn build_decomposition_filter(
    vocabulary: &[String],
    kmer_size: usize,
    num_special_tokens: usize,
) -> Result<DecompositionFilter> {
    let mapping = build_vocab_mapping(vocabulary, kmer_size);
    build_filter_from_mapping(&mapping, kmer_size, num_special_tokens)
}

fn build_filter_from_mapping(
    mapping: &AHashMap<String, u32>,
    kmer_size: usize,
    num_special_tokens: usize,
) -> Result<DecompositionFilter> {
    let n_kmers = num_kmers(kmer_size);
    if mapping.len() != n_kmers {
        return Err(InferenceError::VocabularyMismatch(format!(
            "expected {} distinct {}-mer tokens, found {}",
            n_kmers,
            kmer_size,
            mapping.len()
        )));
    }

    let kmer_range = num_special_tokens..num_special_tokens + n_kmers;
    let mut weights = Array3::<f32>::zeros((kmer_size, n_kmers, NUM_NUCLEOTIDES));

    for kmer_idx in 0..n_kmers {
        let kmer = index_to_kmer(kmer_idx, kmer_size);
        let token_id = *mapping.get(&kmer).ok_or_else(|| {
            InferenceError::VocabularyMismatch(format!("k-mer {kmer} missing from vocabulary"))
        })? as usize;
        if !kmer_range.contains(&token_id) {
            return Err(InferenceError::VocabularyMismatch(format!(
                "token id {} of {} outside k-mer range [{}, {})",
                token_id, kmer, kmer_range.start, kmer_range.end
            )));
        }
        let column = token_id - num_special_tokens;
        for (idx, base) in kmer.bytes().enumerate() {
            // index_to_kmer only emits ACGT
            let nuc = encode_base(base).unwrap_or_default() as usize;
            weights[[kmer_size - 1 - idx, column, nuc]] = 1.0;
        }
    }

    Ok(DecompositionFilter { weights })
}

/// Process-wide k-mer tables, built once and shared by reference
#[derive(Debug, Clone)]
pub struct KmerCodec {
    kmer_size: usize,
    num_special_tokens: usize,
    kmer_to_id: AHashMap<String, u32>,
    filter: DecompositionFilter,
}

impl KmerCodec {
    /// Build the vocabulary mapping and decomposition filter
    ///
    /// # Errors
    /// Fails fast on any vocabulary inconsistency; see
    /// [`build_decomposition_filter`].
    pub fn new(vocabulary: &[String], kmer_size: usize, num_special_tokens: usize) -> Result<Self> {
        if kmer_size == 0 {
            return Err(InferenceError::Config("kmer_size must be positive".to_string()));
        }
        let kmer_to_id = build_vocab_mapping(vocabulary, kmer_size);
        let filter = build_filter_from_mapping(&kmer_to_id, kmer_size, num_special_tokens)?;
        info!(
            "Built k-mer codec: k={}, {} k-mer tokens, {} other tokens",
            kmer_size,
            kmer_to_id.len(),
            vocabulary.len() - kmer_to_id.len()
        );
        debug!("  k-mer logit slice = [{}, {})", num_special_tokens, num_special_tokens + kmer_to_id.len());
        Ok(Self {
            kmer_size,
            num_special_tokens,
            kmer_to_id,
            filter,
        })
    }

    /// K-mer size
    pub fn kmer_size(&self) -> usize {
        self.kmer_size
    }

    /// Number of vocabulary entries before the first k-mer token
    pub fn num_special_tokens(&self) -> usize {
        self.num_special_tokens
    }

    /// Number of k-mer tokens (`4^k`)
    pub fn num_kmers(&self) -> usize {
        self.filter.num_kmers()
    }

    /// Logit columns holding k-mer tokens
    pub fn kmer_logit_range(&self) -> std::ops::Range<usize> {
        self.num_special_tokens..self.num_special_tokens + self.num_kmers()
    }

    /// Token id of a k-mer string
    pub fn token_id(&self, kmer: &str) -> Option<u32> {
        self.kmer_to_id.get(kmer).copied()
    }

    /// The decomposition filter
    pub fn filter(&self) -> &DecompositionFilter {
        &self.filter
    }
}
