use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand, ValueEnum};
use kmer_recon::masking::{apply_masks, plan_masks};
use kmer_recon::output::{create_output, write_position_embeddings, write_probabilities, write_sequence_embeddings};
use kmer_recon::parse::{load_sequences, prepare_sequences, SequenceRecord};
use kmer_recon::{
    InferenceConfig, KmerCodec, KmerFrequencyBaseline, KmerTokenizer, SequenceBatchRunner, TargetLayer,
    VocabTokenizer, Vocabulary,
};
use std::path::PathBuf;
use tracing::{debug, info};

#[derive(Parser)]
#[command(name = "kmer-recon")]
#[command(version = "0.1.0")]
#[command(about = "Masked nucleotide reconstruction and embeddings from k-mer language models", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Options shared by every subcommand
#[derive(Args, Debug)]
struct CommonArgs {
    /// JSON configuration file (command-line options override it)
    #[arg(short, long, conflicts_with = "preset")]
    config: Option<PathBuf>,

    /// Start from the defaults for 3' or 5' UTR sequences
    #[arg(long, value_enum)]
    preset: Option<Preset>,

    /// Vocabulary file, one token per line (default: standard 6-mer layout)
    #[arg(long)]
    vocab: Option<PathBuf>,

    /// Species tag prepended to every sequence
    #[arg(short, long)]
    species: Option<String>,

    /// Vocabulary entries before the first k-mer token
    #[arg(long)]
    num_special_tokens: Option<usize>,
}

/// Options for runs over an input file
#[derive(Args, Debug)]
struct RunArgs {
    /// Input FASTA/FASTQ (optionally gzipped) or CSV/TSV table
    #[arg(short, long)]
    input: PathBuf,

    /// Output TSV file
    #[arg(short, long)]
    output: PathBuf,

    /// Sequence column of tabular input
    #[arg(long, default_value = "sequence")]
    column: String,

    /// Truncate longer sequences to this length and drop shorter ones
    #[arg(long)]
    expected_len: Option<usize>,

    /// Sequences used to fit the frequency baseline (default: the input)
    #[arg(long)]
    background: Option<PathBuf>,

    /// Pseudocount for the frequency baseline
    #[arg(long, default_value = "1.0")]
    pseudocount: f64,

    /// Number of threads (0 = all available cores)
    #[arg(short = 't', long)]
    threads: Option<usize>,
}

/// Named configuration presets
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Preset {
    /// 3' UTR sequences
    #[value(name = "3p")]
    ThreePrime,
    /// 5' UTR sequences
    #[value(name = "5p")]
    FivePrime,
}

#[derive(Subcommand)]
enum Commands {
    /// Check a vocabulary and report its layout
    Inspect {
        #[command(flatten)]
        common: CommonArgs,
    },

    /// Show how one sequence is tokenized and masked
    Plan {
        #[command(flatten)]
        common: CommonArgs,

        /// DNA sequence
        sequence: String,
    },

    /// Reconstruct per-position nucleotide distributions
    Predict {
        #[command(flatten)]
        common: CommonArgs,

        #[command(flatten)]
        run: RunArgs,

        /// Masked windows per model call
        #[arg(short, long)]
        batch_size: Option<usize>,
    },

    /// Extract hidden-state embeddings
    Embed {
        #[command(flatten)]
        common: CommonArgs,

        #[command(flatten)]
        run: RunArgs,

        /// Hidden-state layers to average: "i", "i:" or "i:j"
        #[arg(long)]
        target_layer: Option<TargetLayer>,

        /// Also write per-position embeddings to this TSV file
        #[arg(long)]
        positions: Option<PathBuf>,
    },
}

fn main() -> anyhow::Result<()> {
    // Initialize tracing: use RUST_LOG if set, otherwise default to info
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Inspect { common } => {
            inspect_command(common)?;
        }
        Commands::Plan { common, sequence } => {
            plan_command(common, sequence)?;
        }
        Commands::Predict { common, run, batch_size } => {
            predict_command(common, run, batch_size)?;
        }
        Commands::Embed { common, run, target_layer, positions } => {
            embed_command(common, run, target_layer, positions)?;
        }
    }

    Ok(())
}

/// Configuration from the optional file with command-line overrides
fn load_config(common: &CommonArgs) -> anyhow::Result<InferenceConfig> {
    let mut config = match (&common.config, common.preset) {
        (Some(path), _) => InferenceConfig::from_json_file(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        (None, Some(Preset::ThreePrime)) => InferenceConfig::three_prime(),
        (None, Some(Preset::FivePrime)) => InferenceConfig::five_prime(),
        (None, None) => InferenceConfig::default(),
    };
    if let Some(species) = &common.species {
        config.proxy_species = species.clone();
    }
    if let Some(num_special_tokens) = common.num_special_tokens {
        config.num_special_tokens = num_special_tokens;
    }
    Ok(config)
}

fn load_vocabulary(common: &CommonArgs, config: &InferenceConfig) -> anyhow::Result<Vocabulary> {
    match &common.vocab {
        Some(path) => Vocabulary::load(path).with_context(|| format!("Failed to load vocabulary from {}", path.display())),
        None => Ok(Vocabulary::standard(config.kmer_size, &[config.proxy_species.as_str()])),
    }
}

/// Vocabulary, codec and tokenizer for a validated configuration
fn load_components(common: &CommonArgs, config: &InferenceConfig) -> anyhow::Result<(Vocabulary, KmerCodec, VocabTokenizer)> {
    config.validate()?;
    let vocab = load_vocabulary(common, config)?;
    let codec = KmerCodec::new(vocab.tokens(), config.kmer_size, config.num_special_tokens)?;
    let tokenizer = VocabTokenizer::new(&vocab, config.kmer_size)?;
    Ok((vocab, codec, tokenizer))
}

/// Input records and the baseline fitted on the background (or the input)
fn load_run_inputs(
    run: &RunArgs,
    config: &mut InferenceConfig,
    vocab: &Vocabulary,
    codec: &KmerCodec,
) -> anyhow::Result<(Vec<SequenceRecord>, KmerFrequencyBaseline)> {
    if let Some(threads) = run.threads {
        config.num_threads = threads;
    }
    if run.expected_len.is_some() {
        config.expected_sequence_len = run.expected_len;
    }

    let records = prepare_sequences(load_sequences(&run.input, &run.column)?, config.expected_sequence_len);
    if records.is_empty() {
        bail!("No sequences left in {}", run.input.display());
    }

    let model = match &run.background {
        Some(path) => {
            let background = load_sequences(path, &run.column)?;
            let sequences: Vec<&str> = background.iter().map(|r| r.sequence.as_str()).collect();
            KmerFrequencyBaseline::fit(&sequences, vocab, codec, run.pseudocount)?
        }
        None => {
            let sequences: Vec<&str> = records.iter().map(|r| r.sequence.as_str()).collect();
            KmerFrequencyBaseline::fit(&sequences, vocab, codec, run.pseudocount)?
        }
    };
    Ok((records, model))
}

/// Report vocabulary layout
fn inspect_command(common: CommonArgs) -> anyhow::Result<()> {
    let config = load_config(&common)?;
    let (vocab, codec, tokenizer) = load_components(&common, &config)?;

    println!("Vocabulary:");
    println!("  tokens = {}", vocab.len());
    println!("  k-mer tokens = {}", codec.num_kmers());
    println!("  special tokens = {}", tokenizer.all_special_ids().len());
    println!("  k-mer logit columns = {:?}", codec.kmer_logit_range());
    println!("  decomposition filter = {:?}", codec.filter().weights().dim());
    println!("  mask token id = {}", tokenizer.mask_token_id());
    match tokenizer.token_id(&config.proxy_species) {
        Some(id) => println!("  species {:?} = id {}", config.proxy_species, id),
        None => println!("  species {:?} is not in the vocabulary (maps to [UNK])", config.proxy_species),
    }
    Ok(())
}

/// Show tokenization and mask layout for one sequence
fn plan_command(common: CommonArgs, sequence: String) -> anyhow::Result<()> {
    let config = load_config(&common)?;
    let (_vocab, codec, tokenizer) = load_components(&common, &config)?;
    let k = config.kmer_size;
    debug!("Planning with k-mer columns {:?}", codec.kmer_logit_range());

    let tokenized = kmer_recon::tokenizer::tokenize_sequence(
        &tokenizer,
        &config.proxy_species,
        &kmer_recon::encoding::normalize_sequence(sequence.as_bytes())?,
        k,
    )?;

    println!("Sequence length = {}", sequence.len());
    println!("Tokenized length = {}", tokenized.len());
    println!("K-mer tokens = {}", tokenized.num_kmer_tokens());
    println!(
        "Special-token offsets = left {}, right {}",
        tokenized.offsets.left, tokenized.offsets.right
    );

    if sequence.len() < kmer_recon::constants::min_masking_len(k) {
        println!(
            "Below masking threshold {}: uniform fallback, no model calls",
            kmer_recon::constants::min_masking_len(k)
        );
        return Ok(());
    }

    let masks = plan_masks(tokenized.len(), k);
    let batch = apply_masks(
        &tokenized.ids,
        &masks,
        tokenizer.mask_token_id(),
        tokenized.offsets.left,
        sequence.len(),
        k,
    )?;
    let num_calls = batch.num_windows().div_ceil(config.pred_batch_size);
    println!("Masked windows = {}", batch.num_windows());
    println!("Masked batch shape = {:?}", batch.input_ids.dim());
    println!("Model calls at batch size {} = {}", config.pred_batch_size, num_calls);
    Ok(())
}

/// Reconstruct distributions for every input sequence
fn predict_command(common: CommonArgs, run: RunArgs, batch_size: Option<usize>) -> anyhow::Result<()> {
    let mut config = load_config(&common)?;
    if let Some(batch_size) = batch_size {
        config.pred_batch_size = batch_size;
    }
    let (vocab, codec, tokenizer) = load_components(&common, &config)?;
    let (records, model) = load_run_inputs(&run, &mut config, &vocab, &codec)?;
    config.print();

    let sequences: Vec<&str> = records.iter().map(|r| r.sequence.as_str()).collect();
    let runner = SequenceBatchRunner::new(&config, &codec, &tokenizer, &model)?;
    let predictions = runner.predict_dataset(&sequences)?;

    info!("Writing probabilities to {}...", run.output.display());
    write_probabilities(create_output(&run.output)?, &records, predictions.probs.view())?;
    info!("Done");
    Ok(())
}

/// Extract embeddings for every input sequence
fn embed_command(
    common: CommonArgs,
    run: RunArgs,
    target_layer: Option<TargetLayer>,
    positions: Option<PathBuf>,
) -> anyhow::Result<()> {
    let mut config = load_config(&common)?;
    if let Some(target_layer) = target_layer {
        config.target_layer = target_layer;
    }
    let (vocab, codec, tokenizer) = load_components(&common, &config)?;
    let (records, model) = load_run_inputs(&run, &mut config, &vocab, &codec)?;
    config.print();

    let sequences: Vec<&str> = records.iter().map(|r| r.sequence.as_str()).collect();
    let ids: Vec<String> = records.iter().map(|r| r.id.clone()).collect();
    let runner = SequenceBatchRunner::new(&config, &codec, &tokenizer, &model)?;
    let embeddings = runner.embed_dataset(&sequences, positions.is_some())?;

    info!("Writing sequence embeddings to {}...", run.output.display());
    write_sequence_embeddings(create_output(&run.output)?, &ids, embeddings.sequence.view())?;
    if let (Some(path), Some(per_position)) = (&positions, &embeddings.per_position) {
        info!("Writing per-position embeddings to {}...", path.display());
        write_position_embeddings(create_output(path)?, &ids, per_position.view())?;
    }
    info!("Done");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use kmer_recon::constants::{FIVE_PRIME_SEQUENCE_LEN, THREE_PRIME_SEQUENCE_LEN};

    fn parse_common(args: &[&str]) -> CommonArgs {
        let cli = Cli::try_parse_from(["kmer-recon", "inspect"].iter().chain(args).copied()).unwrap();
        match cli.command {
            Commands::Inspect { common } => common,
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_preset_sets_expected_length() {
        let config = load_config(&parse_common(&["--preset", "3p"])).unwrap();
        assert_eq!(config.expected_sequence_len, Some(THREE_PRIME_SEQUENCE_LEN));

        let config = load_config(&parse_common(&["--preset", "5p", "-s", "homo_sapiens"])).unwrap();
        assert_eq!(config.expected_sequence_len, Some(FIVE_PRIME_SEQUENCE_LEN));
        assert_eq!(config.proxy_species, "homo_sapiens");
    }

    #[test]
    fn test_no_preset_keeps_defaults() {
        let config = load_config(&parse_common(&[])).unwrap();
        assert_eq!(config, InferenceConfig::default());
    }

    #[test]
    fn test_preset_rejects_unknown_names_and_config_file() {
        assert!(Cli::try_parse_from(["kmer-recon", "inspect", "--preset", "utr"]).is_err());
        assert!(Cli::try_parse_from(["kmer-recon", "inspect", "--preset", "3p", "-c", "cfg.json"]).is_err());
    }
}
