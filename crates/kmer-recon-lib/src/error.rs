//! Error types for reconstruction and embedding inference

use crate::encoding::EncodingError;
use thiserror::Error;

/// Result alias used throughout the inference core
pub type Result<T> = std::result::Result<T, InferenceError>;

/// Errors raised by the inference pipeline
///
/// Short sequences are not errors: they take the documented fallback path
/// (uniform distributions or zero embeddings) and are only counted.
#[derive(Error, Debug)]
pub enum InferenceError {
    /// Invalid configuration, detected before any data is processed
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// The vocabulary does not contain exactly the expected k-mer tokens
    #[error("Vocabulary mismatch: {0}")]
    VocabularyMismatch(String),

    /// A sequence contains something other than A/C/G/T
    #[error("Invalid sequence: {0}")]
    InvalidSequence(#[from] EncodingError),

    /// The tokenizer produced an unusable token row
    #[error("Tokenizer error: {0}")]
    Tokenizer(String),

    /// The masking planner was asked for windows on a sequence that has none
    #[error("Sequence of length {sequence_len} is too short for masking (minimum {min_len})")]
    TooShortForMasking {
        /// Length of the offending sequence
        sequence_len: usize,
        /// Minimum length that yields a window
        min_len: usize,
    },

    /// The external model failed or returned malformed output
    #[error("Model call failed: {0}")]
    ModelCall(String),

    /// The number of reconstructed distributions does not match the sequence
    #[error("Alignment invariant violated: expected {expected} distributions, got {actual}")]
    AlignmentInvariant {
        /// Sequence length
        expected: usize,
        /// Distributions produced
        actual: usize,
    },

    /// Failure while processing one sequence of a dataset
    #[error("Sequence {index}: {source}")]
    Sequence {
        /// Index of the sequence within the dataset
        index: usize,
        /// Underlying error
        #[source]
        source: Box<InferenceError>,
    },

    /// I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization failure
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl InferenceError {
    /// Wrap an error with the index of the sequence it occurred in
    pub fn in_sequence(self, index: usize) -> Self {
        InferenceError::Sequence {
            index,
            source: Box::new(self),
        }
    }
}
