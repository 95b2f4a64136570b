//! Inference configuration
//!
//! Collects the enumerated configuration surface (k-mer size, proxy species,
//! prediction batch size, hidden-layer selection) plus the vocabulary offset,
//! expected input length and thread count. Validated once, before any
//! sequence is processed.

use crate::constants::{
    DEFAULT_NUM_SPECIAL_TOKENS, DEFAULT_PRED_BATCH_SIZE, DEFAULT_PROXY_SPECIES,
    FIVE_PRIME_SEQUENCE_LEN, KMER_SIZE, THREE_PRIME_SEQUENCE_LEN,
};
use crate::error::{InferenceError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::ops::Range;
use std::path::Path;
use std::str::FromStr;

/// Which hidden-state layers feed an embedding
///
/// Layer 0 is the input embedding layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetLayer {
    /// Exactly one layer
    SingleLayer(usize),
    /// This layer and every later one, averaged
    FromLayerToEnd(usize),
    /// Layers `start .. end` (half-open), averaged
    LayerRange {
        /// First layer
        start: usize,
        /// One past the last layer
        end: usize,
    },
}

impl TargetLayer {
    /// Check the selection independently of any model
    pub fn validate(&self) -> Result<()> {
        if let TargetLayer::LayerRange { start, end } = *self {
            if start >= end {
                return Err(InferenceError::Config(format!(
                    "target_layer range {start}:{end} is empty"
                )));
            }
        }
        Ok(())
    }

    /// Resolve to a half-open range of layer indices for a model with
    /// `num_layers` hidden-state tensors
    ///
    /// # Errors
    /// Fails if the selection is empty or reaches past the last layer.
    pub fn resolve(&self, num_layers: usize) -> Result<Range<usize>> {
        self.validate()?;
        let range = match *self {
            TargetLayer::SingleLayer(idx) => idx..idx + 1,
            TargetLayer::FromLayerToEnd(idx) => idx..num_layers,
            TargetLayer::LayerRange { start, end } => start..end,
        };
        if range.is_empty() || range.end > num_layers {
            return Err(InferenceError::Config(format!(
                "target_layer {self} does not fit a model with {num_layers} hidden-state layers"
            )));
        }
        Ok(range)
    }
}

impl Default for TargetLayer {
    fn default() -> Self {
        TargetLayer::FromLayerToEnd(0)
    }
}

impl fmt::Display for TargetLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetLayer::SingleLayer(idx) => write!(f, "{idx}"),
            TargetLayer::FromLayerToEnd(idx) => write!(f, "{idx}:"),
            TargetLayer::LayerRange { start, end } => write!(f, "{start}:{end}"),
        }
    }
}

impl FromStr for TargetLayer {
    type Err = InferenceError;

    /// Parses `"i"`, `"i:"` or `"i:j"`
    fn from_str(s: &str) -> Result<Self> {
        let parse = |part: &str| {
            part.trim().parse::<usize>().map_err(|_| {
                InferenceError::Config(format!("invalid target_layer {s:?}: expected i, i: or i:j"))
            })
        };
        let layer = match s.split_once(':') {
            None => TargetLayer::SingleLayer(parse(s)?),
            Some((start, end)) if end.trim().is_empty() => TargetLayer::FromLayerToEnd(parse(start)?),
            Some((start, end)) => TargetLayer::LayerRange {
                start: parse(start)?,
                end: parse(end)?,
            },
        };
        layer.validate()?;
        Ok(layer)
    }
}

/// Configuration for reconstruction and embedding runs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    /// K-mer length (fixed at 6)
    pub kmer_size: usize,

    /// Species tag prepended to every sequence
    pub proxy_species: String,

    /// Masked windows per model call
    pub pred_batch_size: usize,

    /// Hidden-state layers averaged into embeddings
    pub target_layer: TargetLayer,

    /// Vocabulary entries before the first k-mer token
    pub num_special_tokens: usize,

    /// Truncate longer inputs to this length and drop shorter ones
    pub expected_sequence_len: Option<usize>,

    /// Number of sequence-level worker threads (0 = all available cores)
    ///
    /// Each worker holds one sub-batch of model logits at a time, about
    /// `pred_batch_size × tokenized_len × vocab_size × 4` bytes, so peak
    /// memory grows linearly with this value.
    pub num_threads: usize,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            kmer_size: KMER_SIZE,
            proxy_species: DEFAULT_PROXY_SPECIES.to_string(),
            pred_batch_size: DEFAULT_PRED_BATCH_SIZE,
            target_layer: TargetLayer::default(),
            num_special_tokens: DEFAULT_NUM_SPECIAL_TOKENS,
            expected_sequence_len: None,
            num_threads: 0,
        }
    }
}

impl InferenceConfig {
    /// Configuration for the 3' model variant (300 nt inputs)
    pub fn three_prime() -> Self {
        Self {
            expected_sequence_len: Some(THREE_PRIME_SEQUENCE_LEN),
            ..Self::default()
        }
    }

    /// Configuration for the 5' model variant (1003 nt inputs)
    pub fn five_prime() -> Self {
        Self {
            expected_sequence_len: Some(FIVE_PRIME_SEQUENCE_LEN),
            ..Self::default()
        }
    }

    /// Load a JSON configuration; missing fields take their defaults
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        let config: Self = serde_json::from_reader(reader)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration parameters
    pub fn validate(&self) -> Result<()> {
        if self.kmer_size != KMER_SIZE {
            return Err(InferenceError::Config(format!(
                "kmer_size must be {}, got {}",
                KMER_SIZE, self.kmer_size
            )));
        }
        if self.pred_batch_size == 0 {
            return Err(InferenceError::Config("pred_batch_size must be positive".to_string()));
        }
        if self.proxy_species.trim().is_empty() {
            return Err(InferenceError::Config("proxy_species must not be empty".to_string()));
        }
        if self.proxy_species.split_whitespace().count() != 1 {
            return Err(InferenceError::Config(format!(
                "proxy_species must be a single tag, got {:?}",
                self.proxy_species
            )));
        }
        if self.expected_sequence_len == Some(0) {
            return Err(InferenceError::Config("expected_sequence_len must be positive".to_string()));
        }
        self.target_layer.validate()
    }

    /// Log configuration parameters via tracing
    pub fn print(&self) {
        tracing::info!("Inference Configuration:");
        tracing::info!("  kmer_size = {}", self.kmer_size);
        tracing::info!("  proxy_species = {}", self.proxy_species);
        tracing::info!("  pred_batch_size = {}", self.pred_batch_size);
        tracing::info!("  target_layer = {}", self.target_layer);
        tracing::debug!("  num_special_tokens = {}", self.num_special_tokens);
        match self.expected_sequence_len {
            Some(len) => tracing::info!("  expected_sequence_len = {}", len),
            None => tracing::debug!("  expected_sequence_len = any"),
        }
        if self.num_threads == 0 {
            tracing::info!("  num_threads = all available cores");
        } else {
            tracing::info!("  num_threads = {}", self.num_threads);
        }
    }
}
