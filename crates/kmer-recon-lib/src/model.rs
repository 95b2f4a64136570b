//! Sequence model interface and the built-in frequency baseline
//!
//! The pretrained model is an external collaborator: it maps a batch of
//! token rows to logits over the full vocabulary, and optionally to the
//! hidden states of every layer (layer 0 being the input embeddings).

use crate::codec::KmerCodec;
use crate::constants::NUM_NUCLEOTIDES;
use crate::encoding::{encode_base, kmers_stride1};
use crate::error::{InferenceError, Result};
use crate::tokenizer::Vocabulary;
use ndarray::{Array1, Array2, Array3, ArrayView2, Axis};
use tracing::info;

/// Output of one forward pass
#[derive(Debug, Clone)]
pub struct ModelOutput {
    /// Logits over the vocabulary.
    /// Shape: `(batch_size, sequence_length, vocab_size)`.
    pub logits: Array3<f32>,
    /// Hidden states of every layer, input embeddings first, when requested.
    /// Each has shape `(batch_size, sequence_length, hidden_size)`.
    pub hidden_states: Option<Vec<Array3<f32>>>,
}

/// Model collaborator
///
/// Calls are blocking. Implementations must be safe to share across the
/// sequence-level worker pool.
pub trait SequenceModel: Send + Sync {
    /// Number of logit columns
    fn vocab_size(&self) -> usize;

    /// Width of each hidden state
    fn hidden_size(&self) -> usize;

    /// Number of hidden-state tensors returned, including the embedding layer
    fn num_hidden_states(&self) -> usize;

    /// Run the model on a `(batch, seq_len)` block of token ids
    fn forward(&self, input_ids: ArrayView2<'_, u32>, output_hidden_states: bool) -> Result<ModelOutput>;
}

/// Check a forward pass against the shape the caller asked for
///
/// # Errors
/// Returns [`InferenceError::ModelCall`] on any shape mismatch, missing
/// hidden states, or non-finite logits.
pub fn validate_output<M: SequenceModel + ?Sized>(
    model: &M,
    output: &ModelOutput,
    batch_size: usize,
    seq_len: usize,
    expect_hidden_states: bool,
) -> Result<()> {
    let expected = (batch_size, seq_len, model.vocab_size());
    if output.logits.dim() != expected {
        return Err(InferenceError::ModelCall(format!(
            "logits have shape {:?}, expected {:?}",
            output.logits.dim(),
            expected
        )));
    }
    if output.logits.iter().any(|v| !v.is_finite()) {
        return Err(InferenceError::ModelCall("logits contain non-finite values".to_string()));
    }
    if !expect_hidden_states {
        return Ok(());
    }
    let layers = output
        .hidden_states
        .as_ref()
        .ok_or_else(|| InferenceError::ModelCall("model returned no hidden states".to_string()))?;
    if layers.len() != model.num_hidden_states() {
        return Err(InferenceError::ModelCall(format!(
            "model returned {} hidden-state layers, declared {}",
            layers.len(),
            model.num_hidden_states()
        )));
    }
    let expected = (batch_size, seq_len, model.hidden_size());
    if let Some((idx, layer)) = layers.iter().enumerate().find(|(_, l)| l.dim() != expected) {
        return Err(InferenceError::ModelCall(format!(
            "hidden-state layer {} has shape {:?}, expected {:?}",
            idx,
            layer.dim(),
            expected
        )));
    }
    Ok(())
}

/// Logit assigned to every non-k-mer column by the baseline
const BASELINE_SPECIAL_LOGIT: f32 = -30.0;

/// Position-independent k-mer frequency model
///
/// Logits are the log relative frequencies of each k-mer in a fitting set
/// (with a pseudocount), identical at every position and for every input.
/// Its single hidden-state layer holds each token's nucleotide composition
/// (zero for special tokens), giving a 4-wide embedding.
///
/// Useful as a null model: its reconstructions reflect base composition
/// and nothing else.
#[derive(Debug, Clone)]
pub struct KmerFrequencyBaseline {
    log_freqs: Array1<f32>,
    composition: Array2<f32>,
}

impl KmerFrequencyBaseline {
    /// Fit k-mer frequencies on `sequences`
    ///
    /// # Errors
    /// Fails if `pseudocount` is not positive or a sequence holds a base
    /// outside ACGT.
    pub fn fit<S: AsRef<str>>(
        sequences: &[S],
        vocabulary: &Vocabulary,
        codec: &KmerCodec,
        pseudocount: f64,
    ) -> Result<Self> {
        if !(pseudocount > 0.0) {
            return Err(InferenceError::Config(format!(
                "pseudocount must be positive, got {pseudocount}"
            )));
        }
        let k = codec.kmer_size();
        let mut counts = vec![0u64; vocabulary.len()];
        let mut total = 0u64;
        for seq in sequences {
            for kmer in kmers_stride1(seq.as_ref(), k) {
                let id = codec.token_id(kmer).ok_or_else(|| {
                    InferenceError::Config(format!("k-mer {kmer} not in vocabulary"))
                })?;
                counts[id as usize] += 1;
                total += 1;
            }
        }

        let kmer_columns = codec.kmer_logit_range();
        let denom = total as f64 + pseudocount * kmer_columns.len() as f64;
        let mut log_freqs = Array1::from_elem(vocabulary.len(), BASELINE_SPECIAL_LOGIT);
        for col in kmer_columns {
            log_freqs[col] = ((counts[col] as f64 + pseudocount) / denom).ln() as f32;
        }

        let mut composition = Array2::<f32>::zeros((vocabulary.len(), NUM_NUCLEOTIDES));
        for (id, token) in vocabulary.tokens().iter().enumerate() {
            if codec.token_id(token).is_none() {
                continue;
            }
            for base in token.bytes() {
                if let Some(nuc) = encode_base(base) {
                    composition[[id, nuc as usize]] += 1.0 / k as f32;
                }
            }
        }

        info!(
            "Fitted k-mer frequency baseline on {} sequences ({} k-mers, pseudocount {})",
            sequences.len(),
            total,
            pseudocount
        );
        Ok(Self { log_freqs, composition })
    }
}

impl SequenceModel for KmerFrequencyBaseline {
    fn vocab_size(&self) -> usize {
        self.log_freqs.len()
    }

    fn hidden_size(&self) -> usize {
        NUM_NUCLEOTIDES
    }

    fn num_hidden_states(&self) -> usize {
        1
    }

    fn forward(&self, input_ids: ArrayView2<'_, u32>, output_hidden_states: bool) -> Result<ModelOutput> {
        let (batch, seq_len) = input_ids.dim();
        let vocab = self.vocab_size();
        if let Some(&bad) = input_ids.iter().find(|&&id| id as usize >= vocab) {
            return Err(InferenceError::ModelCall(format!(
                "token id {bad} outside vocabulary of {vocab}"
            )));
        }

        let logits = self
            .log_freqs
            .broadcast((batch, seq_len, vocab))
            .ok_or_else(|| InferenceError::ModelCall("cannot broadcast logits".to_string()))?
            .to_owned();

        let hidden_states = output_hidden_states.then(|| {
            let mut layer = Array3::<f32>::zeros((batch, seq_len, NUM_NUCLEOTIDES));
            for ((b, t), &id) in input_ids.indexed_iter() {
                layer
                    .index_axis_mut(Axis(0), b)
                    .row_mut(t)
                    .assign(&self.composition.row(id as usize));
            }
            vec![layer]
        });

        Ok(ModelOutput { logits, hidden_states })
    }
}
