// kmer-recon: masked nucleotide reconstruction from k-mer language models
//
// Per-position nucleotide distributions and hidden-state embeddings for
// DNA sequences tokenized into overlapping 6-mers.

#![doc = include_str!("../README.md")]
#![warn(missing_docs)]

pub mod constants;
pub mod encoding;
pub mod error;
pub mod tokenizer;
pub mod codec;
pub mod masking;
pub mod model;
pub mod reconstruction;
pub mod embedding;
pub mod config;
pub mod runner;
pub mod parse;
pub mod output;

// Re-export common types at crate root
pub use codec::{DecompositionFilter, KmerCodec};
pub use config::{InferenceConfig, TargetLayer};
pub use embedding::{EmbeddingExtractor, SequenceEmbedding};
pub use error::{InferenceError, Result};
pub use model::{KmerFrequencyBaseline, ModelOutput, SequenceModel};
pub use reconstruction::{PredictionPath, ReconstructionAggregator, SequencePrediction};
pub use runner::{DatasetEmbeddings, DatasetPredictions, RunStats, SequenceBatchRunner};
pub use tokenizer::{KmerTokenizer, SpecialTokenOffset, TokenizedSequence, VocabTokenizer, Vocabulary};

/// Version information
pub fn version() -> (u8, u8, u8) {
    constants::VERSION
}
