//! Dataset-level orchestration
//!
//! Drives the per-sequence loop:
//! 1. Tokenize `species + k-mer sentence` and compute special-token offsets
//! 2. Pick the short-sequence fallback or the model path
//! 3. Reconstruct distributions (masked windows) or extract embeddings
//! 4. Stack per-sequence results into dataset arrays
//!
//! Sequences may be processed on a rayon pool; each sequence's sub-batches
//! stay strictly ordered and results are collected in input order. Every
//! worker keeps one sub-batch of logits alive, so memory scales with
//! `num_threads × pred_batch_size`.

use crate::codec::KmerCodec;
use crate::config::InferenceConfig;
use crate::embedding::{EmbeddingExtractor, SequenceEmbedding};
use crate::encoding::normalize_sequence;
use crate::error::{InferenceError, Result};
use crate::model::SequenceModel;
use crate::reconstruction::{PredictionPath, ReconstructionAggregator, SequencePrediction};
use crate::tokenizer::{tokenize_sequence, KmerTokenizer, TokenizedSequence};
use ndarray::{Array2, Array3, Axis};
use rayon::prelude::*;
use tracing::{debug, info};

/// Counters for one dataset run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunStats {
    /// Sequences processed
    pub num_sequences: usize,
    /// Sequences reconstructed through masked windows
    pub num_masked: usize,
    /// Sequences embedded through one unmasked model pass
    pub num_embedded: usize,
    /// Sequences that took the short-sequence fallback
    pub num_short_fallback: usize,
    /// Masked windows sent to the model
    pub num_windows: usize,
}

impl RunStats {
    fn record_prediction(&mut self, path: PredictionPath, num_windows: usize) {
        self.num_sequences += 1;
        self.num_windows += num_windows;
        match path {
            PredictionPath::Model => self.num_masked += 1,
            PredictionPath::ShortSequenceFallback => self.num_short_fallback += 1,
        }
    }

    fn record_embedding(&mut self, path: PredictionPath) {
        self.num_sequences += 1;
        match path {
            PredictionPath::Model => self.num_embedded += 1,
            PredictionPath::ShortSequenceFallback => self.num_short_fallback += 1,
        }
    }

    /// Log the counters via tracing
    pub fn print_summary(&self) {
        info!("Run statistics:");
        info!("  sequences = {}", self.num_sequences);
        info!("  masked reconstruction = {}", self.num_masked);
        info!("  unmasked embedding = {}", self.num_embedded);
        info!("  short-sequence fallback = {}", self.num_short_fallback);
        info!("  masked windows = {}", self.num_windows);
    }
}

/// Reconstructed distributions for a dataset
#[derive(Debug, Clone, PartialEq)]
pub struct DatasetPredictions {
    /// `(num_sequences, sequence_len, 4)` probabilities
    pub probs: Array3<f32>,
    /// Run counters
    pub stats: RunStats,
}

/// Embeddings for a dataset
#[derive(Debug, Clone, PartialEq)]
pub struct DatasetEmbeddings {
    /// `(num_sequences, hidden)` whole-sequence embeddings
    pub sequence: Array2<f32>,
    /// `(num_sequences, sequence_len, hidden)` per-position embeddings,
    /// when requested
    pub per_position: Option<Array3<f32>>,
    /// Run counters
    pub stats: RunStats,
}

/// Per-sequence loop over a dataset
pub struct SequenceBatchRunner<'a, T: KmerTokenizer + ?Sized, M: SequenceModel + ?Sized> {
    config: &'a InferenceConfig,
    tokenizer: &'a T,
    model: &'a M,
    aggregator: ReconstructionAggregator<'a>,
    extractor: EmbeddingExtractor,
}

impl<'a, T: KmerTokenizer + ?Sized, M: SequenceModel + ?Sized> SequenceBatchRunner<'a, T, M> {
    /// Create a runner, validating the configuration against its collaborators
    ///
    /// # Errors
    /// Fails with [`InferenceError::Config`] on invalid configuration or a
    /// codec built for another k-mer size or vocabulary offset, and with
    /// [`InferenceError::ModelCall`] if the model's vocabulary does not cover
    /// the k-mer columns. The target layer is checked against the model by
    /// [`Self::embed_dataset`], since reconstruction never reads hidden states.
    pub fn new(config: &'a InferenceConfig, codec: &'a KmerCodec, tokenizer: &'a T, model: &'a M) -> Result<Self> {
        config.validate()?;
        if codec.kmer_size() != config.kmer_size || codec.num_special_tokens() != config.num_special_tokens {
            return Err(InferenceError::Config(format!(
                "codec (k={}, offset={}) does not match configuration (k={}, offset={})",
                codec.kmer_size(),
                codec.num_special_tokens(),
                config.kmer_size,
                config.num_special_tokens
            )));
        }
        if model.vocab_size() < codec.kmer_logit_range().end {
            return Err(InferenceError::ModelCall(format!(
                "model vocabulary of {} does not cover k-mer columns {:?}",
                model.vocab_size(),
                codec.kmer_logit_range()
            )));
        }
        Ok(Self {
            config,
            tokenizer,
            model,
            aggregator: ReconstructionAggregator::new(codec, config.pred_batch_size)?,
            extractor: EmbeddingExtractor::new(config.kmer_size, config.target_layer)?,
        })
    }

    /// Validate and tokenize one sequence
    pub fn tokenize(&self, sequence: &str) -> Result<TokenizedSequence> {
        let sequence = normalize_sequence(sequence.as_bytes())?;
        tokenize_sequence(self.tokenizer, &self.config.proxy_species, &sequence, self.config.kmer_size)
    }

    /// Reconstruct per-position distributions for one sequence
    pub fn predict_sequence(&self, sequence: &str) -> Result<SequencePrediction> {
        let tokenized = self.tokenize(sequence)?;
        self.aggregator
            .run(&tokenized, sequence.len(), self.tokenizer.mask_token_id(), self.model)
    }

    /// Extract embeddings for one sequence
    pub fn embed_sequence(&self, sequence: &str) -> Result<SequenceEmbedding> {
        let tokenized = self.tokenize(sequence)?;
        self.extractor.embed(&tokenized, sequence.len(), self.model)
    }

    /// Reconstruct distributions for every sequence of a fixed-length dataset
    ///
    /// # Errors
    /// The first failing sequence aborts the run, reported with its index.
    pub fn predict_dataset<S: AsRef<str> + Sync>(&self, sequences: &[S]) -> Result<DatasetPredictions> {
        let seq_len = common_length(sequences)?;
        info!("Predicting {} sequences of length {}", sequences.len(), seq_len);

        let results = self.run_parallel(sequences, |s| self.predict_sequence(s))?;

        let mut stats = RunStats::default();
        let mut probs = Array3::<f32>::zeros((sequences.len(), seq_len, crate::constants::NUM_NUCLEOTIDES));
        for (mut out, prediction) in probs.axis_iter_mut(Axis(0)).zip(&results) {
            stats.record_prediction(prediction.path, prediction.num_windows);
            out.assign(&prediction.probs);
        }
        stats.print_summary();
        Ok(DatasetPredictions { probs, stats })
    }

    /// Extract embeddings for every sequence of a fixed-length dataset
    ///
    /// Per-position embeddings are only kept when `per_position` is set.
    ///
    /// # Errors
    /// Fails with [`InferenceError::Config`] before any model call if the
    /// target layer does not exist in the model.
    pub fn embed_dataset<S: AsRef<str> + Sync>(&self, sequences: &[S], per_position: bool) -> Result<DatasetEmbeddings> {
        self.extractor.target_layer().resolve(self.model.num_hidden_states())?;
        let seq_len = common_length(sequences)?;
        let hidden = self.model.hidden_size();
        info!(
            "Embedding {} sequences of length {} (layers {})",
            sequences.len(),
            seq_len,
            self.extractor.target_layer()
        );

        let results = self.run_parallel(sequences, |s| self.embed_sequence(s))?;

        let mut stats = RunStats::default();
        let mut sequence = Array2::<f32>::zeros((sequences.len(), hidden));
        let mut positions = per_position.then(|| Array3::<f32>::zeros((sequences.len(), seq_len, hidden)));
        for (idx, embedding) in results.iter().enumerate() {
            stats.record_embedding(embedding.path);
            sequence.row_mut(idx).assign(&embedding.sequence);
            if let Some(positions) = positions.as_mut() {
                positions.index_axis_mut(Axis(0), idx).assign(&embedding.per_position);
            }
        }
        stats.print_summary();
        Ok(DatasetEmbeddings {
            sequence,
            per_position: positions,
            stats,
        })
    }

    /// Map `f` over the sequences on a pool of `config.num_threads` threads
    fn run_parallel<S, R, F>(&self, sequences: &[S], f: F) -> Result<Vec<R>>
    where
        S: AsRef<str> + Sync,
        R: Send,
        F: Fn(&str) -> Result<R> + Sync,
    {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.num_threads)
            .build()
            .map_err(|e| InferenceError::Config(format!("Failed to create thread pool: {e}")))?;

        pool.install(|| {
            sequences
                .par_iter()
                .enumerate()
                .map(|(idx, seq)| {
                    debug!("Processing sequence {}", idx);
                    f(seq.as_ref()).map_err(|e| e.in_sequence(idx))
                })
                .collect()
        })
    }
}

/// Length shared by every sequence of a dataset
fn common_length<S: AsRef<str>>(sequences: &[S]) -> Result<usize> {
    let Some(first) = sequences.first() else {
        return Ok(0);
    };
    let len = first.as_ref().len();
    if let Some((idx, seq)) = sequences.iter().enumerate().find(|(_, s)| s.as_ref().len() != len) {
        return Err(InferenceError::Config(format!(
            "dataset sequences must share one length: sequence 0 has {}, sequence {} has {}",
            len,
            idx,
            seq.as_ref().len()
        )));
    }
    Ok(len)
}
