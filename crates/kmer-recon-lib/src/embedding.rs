//! Hidden-state embedding extraction
//!
//! One unmasked forward pass per sequence. The selected hidden-state layers
//! are averaged into per-token states; the k-mer tokens are then averaged
//! into one vector for the whole sequence, and, per nucleotide, over the
//! k-mer tokens covering that nucleotide.

use crate::config::TargetLayer;
use crate::constants::min_embedding_len;
use crate::error::{InferenceError, Result};
use crate::model::{validate_output, SequenceModel};
use crate::reconstruction::PredictionPath;
use crate::tokenizer::TokenizedSequence;
use ndarray::{s, Array1, Array2, Array3, ArrayView2, Axis};
use tracing::debug;

/// Embeddings for one sequence
#[derive(Debug, Clone, PartialEq)]
pub struct SequenceEmbedding {
    /// `(tokenized_len, hidden)` layer-averaged states, special tokens included
    pub per_token: Array2<f32>,
    /// `(sequence_len, hidden)` mean over the k-mer tokens covering each nucleotide
    pub per_position: Array2<f32>,
    /// `(hidden,)` mean over all k-mer tokens
    pub sequence: Array1<f32>,
    /// How the embedding was obtained
    pub path: PredictionPath,
}

/// Mean of `layers[range]`, taken from batch row 0
fn average_layers(layers: &[Array3<f32>], range: std::ops::Range<usize>) -> Array2<f32> {
    let count = range.len() as f32;
    let mut sum = layers[range.start].index_axis(Axis(0), 0).to_owned();
    for layer in &layers[range.start + 1..range.end] {
        sum += &layer.index_axis(Axis(0), 0);
    }
    sum / count
}

/// Per-nucleotide mean over the k-mer tokens covering each position
///
/// Nucleotide `pos` is covered by tokens `max(0, pos-k+1) ..= min(pos, n-1)`.
pub fn sliding_window_average(kmer_states: ArrayView2<'_, f32>, sequence_len: usize, kmer_size: usize) -> Array2<f32> {
    let n_tokens = kmer_states.nrows();
    let mut out = Array2::<f32>::zeros((sequence_len, kmer_states.ncols()));
    if n_tokens == 0 {
        return out;
    }
    for (pos, mut row) in out.axis_iter_mut(Axis(0)).enumerate() {
        let first = pos.saturating_sub(kmer_size - 1);
        let last = pos.min(n_tokens - 1);
        if let Some(mean) = kmer_states.slice(s![first..=last, ..]).mean_axis(Axis(0)) {
            row.assign(&mean);
        }
    }
    out
}

/// Extracts embeddings from a model's hidden states
#[derive(Debug, Clone, Copy)]
pub struct EmbeddingExtractor {
    kmer_size: usize,
    target_layer: TargetLayer,
}

impl EmbeddingExtractor {
    /// Create an extractor for the given layer selection
    pub fn new(kmer_size: usize, target_layer: TargetLayer) -> Result<Self> {
        target_layer.validate()?;
        Ok(Self { kmer_size, target_layer })
    }

    /// The configured layer selection
    pub fn target_layer(&self) -> TargetLayer {
        self.target_layer
    }

    /// Embed one sequence
    ///
    /// Sequences shorter than `k` have no k-mer token and get zero vectors
    /// of the model's hidden width, an approximation rather than a failure.
    ///
    /// # Errors
    /// - [`InferenceError::Config`] if the layer selection does not fit the model
    /// - [`InferenceError::ModelCall`] if the model fails or omits hidden states
    pub fn embed<M: SequenceModel + ?Sized>(
        &self,
        tokenized: &TokenizedSequence,
        sequence_len: usize,
        model: &M,
    ) -> Result<SequenceEmbedding> {
        let layers = self.target_layer.resolve(model.num_hidden_states())?;
        let hidden = model.hidden_size();

        if sequence_len < min_embedding_len(self.kmer_size) {
            debug!(
                "Sequence of length {} below embedding threshold {}, using zero embedding",
                sequence_len,
                min_embedding_len(self.kmer_size)
            );
            return Ok(SequenceEmbedding {
                per_token: Array2::zeros((tokenized.len(), hidden)),
                per_position: Array2::zeros((sequence_len, hidden)),
                sequence: Array1::zeros(hidden),
                path: PredictionPath::ShortSequenceFallback,
            });
        }

        let expected_tokens = sequence_len - self.kmer_size + 1;
        if tokenized.num_kmer_tokens() != expected_tokens {
            return Err(InferenceError::Tokenizer(format!(
                "{} k-mer tokens for a sequence of length {}",
                tokenized.num_kmer_tokens(),
                sequence_len
            )));
        }

        let input = ArrayView2::from_shape((1, tokenized.len()), tokenized.ids.as_slice())
            .map_err(|e| InferenceError::Tokenizer(e.to_string()))?;
        let output = model.forward(input, true)?;
        validate_output(model, &output, 1, tokenized.len(), true)?;
        let hidden_states = output
            .hidden_states
            .ok_or_else(|| InferenceError::ModelCall("model returned no hidden states".to_string()))?;

        let per_token = average_layers(&hidden_states, layers);
        let offsets = tokenized.offsets;
        let kmer_states = per_token.slice(s![offsets.left..tokenized.len() - offsets.right, ..]);
        let sequence = kmer_states
            .mean_axis(Axis(0))
            .unwrap_or_else(|| Array1::zeros(hidden));
        let per_position = sliding_window_average(kmer_states, sequence_len, self.kmer_size);

        Ok(SequenceEmbedding {
            per_token,
            per_position,
            sequence,
            path: PredictionPath::Model,
        })
    }
}
