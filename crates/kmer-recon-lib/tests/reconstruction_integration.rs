//! Integration tests for masked reconstruction and embedding extraction
//!
//! These tests drive the full path from tokenization through model calls
//! to per-position results, using small deterministic models.

use kmer_recon::constants::DEFAULT_NUM_SPECIAL_TOKENS;
use kmer_recon::tokenizer::tokenize_sequence;
use kmer_recon::{
    EmbeddingExtractor, InferenceConfig, InferenceError, KmerCodec, KmerFrequencyBaseline, KmerTokenizer,
    ModelOutput, PredictionPath, ReconstructionAggregator, SequenceBatchRunner, SequenceModel, TargetLayer,
    TokenizedSequence, VocabTokenizer, Vocabulary,
};
use ndarray::{Array3, ArrayView2};
use std::sync::Mutex;

const SPECIES: &str = "candida_glabrata";
const PEAK_LOGIT: f32 = 50.0;

struct Fixture {
    vocab: Vocabulary,
    tokenizer: VocabTokenizer,
    codec: KmerCodec,
}

fn fixture() -> Fixture {
    let vocab = Vocabulary::standard(6, &[SPECIES]);
    let tokenizer = VocabTokenizer::new(&vocab, 6).unwrap();
    let codec = KmerCodec::new(vocab.tokens(), 6, DEFAULT_NUM_SPECIAL_TOKENS).unwrap();
    Fixture { vocab, tokenizer, codec }
}

impl Fixture {
    fn tokenize(&self, sequence: &str) -> TokenizedSequence {
        tokenize_sequence(&self.tokenizer, SPECIES, sequence, 6).unwrap()
    }
}

/// Puts all mass on the true token of every position, whatever the input
struct OracleModel {
    vocab_size: usize,
    truth: Vec<u32>,
}

impl SequenceModel for OracleModel {
    fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    fn hidden_size(&self) -> usize {
        1
    }

    fn num_hidden_states(&self) -> usize {
        1
    }

    fn forward(&self, input_ids: ArrayView2<'_, u32>, _output_hidden_states: bool) -> kmer_recon::Result<ModelOutput> {
        let (batch, seq_len) = input_ids.dim();
        let mut logits = Array3::<f32>::zeros((batch, seq_len, self.vocab_size));
        for b in 0..batch {
            for (t, &id) in self.truth.iter().enumerate() {
                logits[[b, t, id as usize]] = PEAK_LOGIT;
            }
        }
        Ok(ModelOutput { logits, hidden_states: None })
    }
}

/// Puts all mass on one column everywhere and records its batch sizes
struct ConstantModel {
    vocab_size: usize,
    peak: usize,
    num_layers: usize,
    hidden: usize,
    calls: Mutex<Vec<usize>>,
}

impl ConstantModel {
    fn new(vocab_size: usize, peak: usize) -> Self {
        Self {
            vocab_size,
            peak,
            num_layers: 10,
            hidden: 3,
            calls: Mutex::new(Vec::new()),
        }
    }
}

impl SequenceModel for ConstantModel {
    fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    fn hidden_size(&self) -> usize {
        self.hidden
    }

    fn num_hidden_states(&self) -> usize {
        self.num_layers
    }

    fn forward(&self, input_ids: ArrayView2<'_, u32>, output_hidden_states: bool) -> kmer_recon::Result<ModelOutput> {
        let (batch, seq_len) = input_ids.dim();
        self.calls.lock().unwrap().push(batch);
        let mut logits = Array3::<f32>::zeros((batch, seq_len, self.vocab_size));
        logits.slice_mut(ndarray::s![.., .., self.peak]).fill(PEAK_LOGIT);
        // layer l is filled with l
        let hidden_states = output_hidden_states.then(|| {
            (0..self.num_layers)
                .map(|l| Array3::from_elem((batch, seq_len, self.hidden), l as f32))
                .collect()
        });
        Ok(ModelOutput { logits, hidden_states })
    }
}

/// Returns logits with one column missing
struct NarrowModel {
    vocab_size: usize,
}

impl SequenceModel for NarrowModel {
    fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    fn hidden_size(&self) -> usize {
        1
    }

    fn num_hidden_states(&self) -> usize {
        1
    }

    fn forward(&self, input_ids: ArrayView2<'_, u32>, _output_hidden_states: bool) -> kmer_recon::Result<ModelOutput> {
        let (batch, seq_len) = input_ids.dim();
        Ok(ModelOutput {
            logits: Array3::zeros((batch, seq_len, self.vocab_size - 1)),
            hidden_states: None,
        })
    }
}

/// Returns NaN logits
struct NanModel {
    vocab_size: usize,
}

impl SequenceModel for NanModel {
    fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    fn hidden_size(&self) -> usize {
        1
    }

    fn num_hidden_states(&self) -> usize {
        1
    }

    fn forward(&self, input_ids: ArrayView2<'_, u32>, _output_hidden_states: bool) -> kmer_recon::Result<ModelOutput> {
        let (batch, seq_len) = input_ids.dim();
        Ok(ModelOutput {
            logits: Array3::from_elem((batch, seq_len, self.vocab_size), f32::NAN),
            hidden_states: None,
        })
    }
}

/// Declares ten hidden-state layers but returns one fewer
struct MissingLayerModel {
    vocab_size: usize,
}

impl SequenceModel for MissingLayerModel {
    fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    fn hidden_size(&self) -> usize {
        2
    }

    fn num_hidden_states(&self) -> usize {
        10
    }

    fn forward(&self, input_ids: ArrayView2<'_, u32>, output_hidden_states: bool) -> kmer_recon::Result<ModelOutput> {
        let (batch, seq_len) = input_ids.dim();
        let hidden_states = output_hidden_states
            .then(|| (0..9).map(|_| Array3::zeros((batch, seq_len, 2))).collect());
        Ok(ModelOutput {
            logits: Array3::zeros((batch, seq_len, self.vocab_size)),
            hidden_states,
        })
    }
}

fn argmax(row: ndarray::ArrayView1<'_, f32>) -> usize {
    row.iter()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |best, (i, &v)| if v > best.1 { (i, v) } else { best })
        .0
}

fn assert_distributions(probs: &ndarray::Array2<f32>) {
    for row in probs.rows() {
        assert!(row.iter().all(|&p| p >= 0.0));
        assert!((row.sum() - 1.0).abs() <= 1e-6, "row sums to {}", row.sum());
    }
}

#[test]
fn test_oracle_model_recovers_sequence() {
    let fx = fixture();
    let sequence = "ACGTTGCAAGGCTTACCGATGCATCGGA";
    let tokenized = fx.tokenize(sequence);
    let model = OracleModel {
        vocab_size: fx.vocab.len(),
        truth: tokenized.ids.clone(),
    };
    let aggregator = ReconstructionAggregator::new(&fx.codec, 4).unwrap();

    let prediction = aggregator
        .run(&tokenized, sequence.len(), fx.tokenizer.mask_token_id(), &model)
        .unwrap();

    assert_eq!(prediction.path, PredictionPath::Model);
    assert_eq!(prediction.num_windows, sequence.len() - 10);
    assert_eq!(prediction.probs.dim(), (sequence.len(), 4));
    assert_distributions(&prediction.probs);
    for (pos, base) in sequence.bytes().enumerate() {
        let expected = b"ACGT".iter().position(|&b| b == base).unwrap();
        assert_eq!(argmax(prediction.probs.row(pos)), expected, "position {pos}");
        assert!(prediction.probs[[pos, expected]] > 0.99);
    }
}

#[test]
fn test_constant_model_reads_kmer_letters() {
    let fx = fixture();
    let sequence = "ACGTACGTACGTACG";
    let tokenized = fx.tokenize(sequence);
    let acgtac = fx.codec.token_id("ACGTAC").unwrap() as usize;
    let model = ConstantModel::new(fx.vocab.len(), acgtac);
    let aggregator = ReconstructionAggregator::new(&fx.codec, 128).unwrap();

    let prediction = aggregator
        .run(&tokenized, sequence.len(), fx.tokenizer.mask_token_id(), &model)
        .unwrap();

    // Position 5 is covered by six tokens reading ACGTAC at indices 5..=0
    let row = prediction.probs.row(5);
    let max = row.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    assert!((row[1] - max).abs() < 1e-6);
    assert!((row[1] - 1.0 / 3.0).abs() < 1e-4);
    assert!((row[2] - 1.0 / 6.0).abs() < 1e-4);

    // Position 0 is covered by token 0 only, which reads index 0
    assert!(prediction.probs[[0, 0]] > 0.99);
}

#[test]
fn test_short_sequences_fall_back_to_uniform() {
    let fx = fixture();
    let model = ConstantModel::new(fx.vocab.len(), DEFAULT_NUM_SPECIAL_TOKENS);
    let aggregator = ReconstructionAggregator::new(&fx.codec, 8).unwrap();

    for sequence in ["", "ACG", "ACGTAC", "ACGTACGTAC"] {
        let tokenized = fx.tokenize(sequence);
        let prediction = aggregator
            .run(&tokenized, sequence.len(), fx.tokenizer.mask_token_id(), &model)
            .unwrap();
        assert_eq!(prediction.path, PredictionPath::ShortSequenceFallback);
        assert_eq!(prediction.probs.nrows(), sequence.len());
        assert!(prediction.probs.iter().all(|&p| p == 0.25));
    }
    assert!(model.calls.lock().unwrap().is_empty());
}

#[test]
fn test_minimum_masking_length_uses_model() {
    let fx = fixture();
    let sequence = "ACGTACGTACG";
    let tokenized = fx.tokenize(sequence);
    let model = ConstantModel::new(fx.vocab.len(), DEFAULT_NUM_SPECIAL_TOKENS + 7);
    let aggregator = ReconstructionAggregator::new(&fx.codec, 8).unwrap();

    let prediction = aggregator
        .run(&tokenized, sequence.len(), fx.tokenizer.mask_token_id(), &model)
        .unwrap();
    assert_eq!(prediction.path, PredictionPath::Model);
    assert_eq!(prediction.num_windows, 1);
    assert_eq!(prediction.probs.nrows(), 11);
    assert_distributions(&prediction.probs);
}

#[test]
fn test_sub_batch_size_does_not_change_results() {
    let fx = fixture();
    let sequence = "TTGACCATGCAGTCAGGATCCAT";
    let tokenized = fx.tokenize(sequence);
    let model = OracleModel {
        vocab_size: fx.vocab.len(),
        truth: tokenized.ids.clone(),
    };

    let results: Vec<_> = [1, 2, 5, 1000]
        .into_iter()
        .map(|batch_size| {
            ReconstructionAggregator::new(&fx.codec, batch_size)
                .unwrap()
                .run(&tokenized, sequence.len(), fx.tokenizer.mask_token_id(), &model)
                .unwrap()
        })
        .collect();
    for other in &results[1..] {
        assert_eq!(other.probs, results[0].probs);
    }
}

#[test]
fn test_sub_batches_are_sent_in_order() {
    let fx = fixture();
    let sequence = "ACGTACGTACGTACG"; // 5 windows
    let tokenized = fx.tokenize(sequence);
    let model = ConstantModel::new(fx.vocab.len(), DEFAULT_NUM_SPECIAL_TOKENS);
    let aggregator = ReconstructionAggregator::new(&fx.codec, 2).unwrap();

    aggregator
        .run(&tokenized, sequence.len(), fx.tokenizer.mask_token_id(), &model)
        .unwrap();
    assert_eq!(*model.calls.lock().unwrap(), vec![2, 2, 1]);
}

#[test]
fn test_repeated_runs_are_identical() {
    let fx = fixture();
    let config = InferenceConfig::default();
    let sequences = vec!["ACGTTGCAAGGCTTACCGAT".to_string(), "GGGGCCCCAAAATTTTACGT".to_string()];
    let model = KmerFrequencyBaseline::fit(&sequences, &fx.vocab, &fx.codec, 1.0).unwrap();
    let runner = SequenceBatchRunner::new(&config, &fx.codec, &fx.tokenizer, &model).unwrap();

    let first = runner.predict_dataset(&sequences).unwrap();
    let second = runner.predict_dataset(&sequences).unwrap();
    assert_eq!(first.probs, second.probs);
}

#[test]
fn test_model_shape_error_is_reported() {
    let fx = fixture();
    let sequence = "ACGTACGTACGTACG";
    let tokenized = fx.tokenize(sequence);
    let model = NarrowModel {
        vocab_size: fx.vocab.len(),
    };
    let aggregator = ReconstructionAggregator::new(&fx.codec, 4).unwrap();

    let err = aggregator
        .run(&tokenized, sequence.len(), fx.tokenizer.mask_token_id(), &model)
        .unwrap_err();
    assert!(matches!(err, InferenceError::ModelCall(_)));
}

#[test]
fn test_non_finite_logits_are_reported() {
    let fx = fixture();
    let sequence = "ACGTACGTACGTACG";
    let tokenized = fx.tokenize(sequence);
    let model = NanModel {
        vocab_size: fx.vocab.len(),
    };
    let aggregator = ReconstructionAggregator::new(&fx.codec, 4).unwrap();

    let err = aggregator
        .run(&tokenized, sequence.len(), fx.tokenizer.mask_token_id(), &model)
        .unwrap_err();
    assert!(matches!(err, InferenceError::ModelCall(_)));
}

#[test]
fn test_miscounted_hidden_states_are_reported() {
    let fx = fixture();
    let sequence = "ACGTTGCAAGGCTTAC";
    let tokenized = fx.tokenize(sequence);
    let model = MissingLayerModel {
        vocab_size: fx.vocab.len(),
    };
    let extractor = EmbeddingExtractor::new(6, TargetLayer::FromLayerToEnd(3)).unwrap();

    let err = extractor.embed(&tokenized, sequence.len(), &model).unwrap_err();
    assert!(matches!(err, InferenceError::ModelCall(_)));
}

#[test]
fn test_embedding_averages_selected_layers() {
    let fx = fixture();
    let sequence = "ACGTTGCAAGGCTTAC";
    let tokenized = fx.tokenize(sequence);
    let model = ConstantModel::new(fx.vocab.len(), DEFAULT_NUM_SPECIAL_TOKENS);

    let extractor = EmbeddingExtractor::new(6, TargetLayer::FromLayerToEnd(3)).unwrap();
    let embedding = extractor.embed(&tokenized, sequence.len(), &model).unwrap();
    assert_eq!(embedding.path, PredictionPath::Model);
    assert_eq!(embedding.sequence.len(), 3);
    assert!(embedding.sequence.iter().all(|&v| (v - 6.0).abs() < 1e-5));
    assert_eq!(embedding.per_position.dim(), (sequence.len(), 3));
    assert!(embedding.per_position.iter().all(|&v| (v - 6.0).abs() < 1e-5));

    let extractor = EmbeddingExtractor::new(6, TargetLayer::SingleLayer(2)).unwrap();
    let embedding = extractor.embed(&tokenized, sequence.len(), &model).unwrap();
    assert!(embedding.sequence.iter().all(|&v| v == 2.0));

    let extractor = EmbeddingExtractor::new(6, TargetLayer::SingleLayer(10)).unwrap();
    assert!(matches!(
        extractor.embed(&tokenized, sequence.len(), &model),
        Err(InferenceError::Config(_))
    ));
}

#[test]
fn test_embedding_short_sequence_is_zero() {
    let fx = fixture();
    let tokenized = fx.tokenize("ACGT");
    let model = ConstantModel::new(fx.vocab.len(), DEFAULT_NUM_SPECIAL_TOKENS);
    let extractor = EmbeddingExtractor::new(6, TargetLayer::default()).unwrap();

    let embedding = extractor.embed(&tokenized, 4, &model).unwrap();
    assert_eq!(embedding.path, PredictionPath::ShortSequenceFallback);
    assert_eq!(embedding.sequence.len(), 3);
    assert!(embedding.sequence.iter().all(|&v| v == 0.0));
    assert!(model.calls.lock().unwrap().is_empty());
}

#[test]
fn test_runner_dataset_shapes() {
    let fx = fixture();
    let config = InferenceConfig {
        pred_batch_size: 3,
        num_threads: 2,
        target_layer: TargetLayer::SingleLayer(0),
        ..InferenceConfig::default()
    };
    let sequences = vec![
        "ACGTTGCAAGGCTTACCGAT".to_string(),
        "acgtacgtacgtacgtacgt".to_string(),
        "TTTTTTTTTTTTTTTTTTTT".to_string(),
    ];
    let model = KmerFrequencyBaseline::fit(&sequences[..1], &fx.vocab, &fx.codec, 1.0).unwrap();
    let runner = SequenceBatchRunner::new(&config, &fx.codec, &fx.tokenizer, &model).unwrap();

    let predictions = runner.predict_dataset(&sequences).unwrap();
    assert_eq!(predictions.probs.dim(), (3, 20, 4));
    assert_eq!(predictions.stats.num_sequences, 3);
    assert_eq!(predictions.stats.num_masked, 3);
    assert_eq!(predictions.stats.num_embedded, 0);
    assert_eq!(predictions.stats.num_windows, 30);
    for block in predictions.probs.outer_iter() {
        assert_distributions(&block.to_owned());
    }

    let embeddings = runner.embed_dataset(&sequences, true).unwrap();
    assert_eq!(embeddings.sequence.dim(), (3, 4));
    assert_eq!(embeddings.per_position.as_ref().unwrap().dim(), (3, 20, 4));
    assert_eq!(embeddings.stats.num_embedded, 3);
    assert_eq!(embeddings.stats.num_masked, 0);
    assert_eq!(embeddings.stats.num_windows, 0);
    // All-T sequence has pure T composition
    assert!((embeddings.sequence[[2, 3]] - 1.0).abs() < 1e-6);

    let embeddings = runner.embed_dataset(&sequences, false).unwrap();
    assert!(embeddings.per_position.is_none());
}

#[test]
fn test_runner_reports_failing_sequence_index() {
    let fx = fixture();
    let config = InferenceConfig::default();
    let sequences = vec!["ACGTACGTACGTACG".to_string(), "ACGTACGNACGTACG".to_string()];
    let model = KmerFrequencyBaseline::fit(&sequences[..1], &fx.vocab, &fx.codec, 1.0).unwrap();
    let runner = SequenceBatchRunner::new(&config, &fx.codec, &fx.tokenizer, &model).unwrap();

    match runner.predict_dataset(&sequences) {
        Err(InferenceError::Sequence { index, .. }) => assert_eq!(index, 1),
        other => panic!("expected a sequence error, got {other:?}"),
    }
}

#[test]
fn test_runner_rejects_mismatched_lengths() {
    let fx = fixture();
    let config = InferenceConfig::default();
    let sequences = vec!["ACGTACGTACGTACG".to_string(), "ACGTACGTACGT".to_string()];
    let model = KmerFrequencyBaseline::fit(&sequences, &fx.vocab, &fx.codec, 1.0).unwrap();
    let runner = SequenceBatchRunner::new(&config, &fx.codec, &fx.tokenizer, &model).unwrap();
    assert!(matches!(runner.predict_dataset(&sequences), Err(InferenceError::Config(_))));
}

#[test]
fn test_layer_outside_model_only_blocks_embedding() {
    let fx = fixture();
    let config = InferenceConfig {
        target_layer: TargetLayer::LayerRange { start: 2, end: 5 },
        ..InferenceConfig::default()
    };
    let sequences = vec!["ACGTACGTACGTACG".to_string()];
    let model = KmerFrequencyBaseline::fit(&sequences, &fx.vocab, &fx.codec, 1.0).unwrap();
    let runner = SequenceBatchRunner::new(&config, &fx.codec, &fx.tokenizer, &model).unwrap();

    let predictions = runner.predict_dataset(&sequences).unwrap();
    assert_eq!(predictions.probs.dim(), (1, 15, 4));
    assert!(matches!(
        runner.embed_dataset(&sequences, false),
        Err(InferenceError::Config(_))
    ));
}
