//! Sequence input parsing
//!
//! Reads DNA sequences from FASTA/FASTQ files (transparently gzipped) or
//! from CSV/TSV tables with a named sequence column. Sequences are validated
//! against the ACGT alphabet and upper-cased.

use crate::encoding::normalize_sequence;
use anyhow::{anyhow, Context, Result};
use needletail::parse_fastx_file;
use std::path::Path;
use tracing::{info, warn};

/// Column holding record identifiers in tabular input, when present
pub const ID_COLUMN: &str = "id";

/// One named input sequence
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceRecord {
    /// Record identifier
    pub id: String,
    /// Upper-case ACGT sequence
    pub sequence: String,
}

/// Input file layout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputFormat {
    /// FASTA or FASTQ, optionally gzipped
    Fastx,
    /// Comma-separated table
    Csv,
    /// Tab-separated table
    Tsv,
}

impl InputFormat {
    /// Guess the format from the file extension, ignoring a trailing `.gz`
    pub fn from_path<P: AsRef<Path>>(path: P) -> Self {
        let name = path.as_ref().to_string_lossy().to_ascii_lowercase();
        let name = name.strip_suffix(".gz").unwrap_or(&name);
        if name.ends_with(".csv") {
            InputFormat::Csv
        } else if name.ends_with(".tsv") || name.ends_with(".txt") {
            InputFormat::Tsv
        } else {
            InputFormat::Fastx
        }
    }
}

/// Read every record of a FASTA/FASTQ file
///
/// The identifier is the first whitespace-separated word of the header.
///
/// # Errors
/// Returns error if the file cannot be opened or parsed, or a sequence
/// holds a base outside ACGT.
pub fn read_fastx<P: AsRef<Path>>(path: P) -> Result<Vec<SequenceRecord>> {
    let path = path.as_ref();
    // needletail handles gzip decompression
    let mut reader = parse_fastx_file(path)
        .with_context(|| format!("Failed to open sequence file: {}", path.display()))?;

    let mut records = Vec::new();
    while let Some(record) = reader.next() {
        let record = record
            .with_context(|| format!("Failed to parse sequence record in {}", path.display()))?;
        let header = String::from_utf8_lossy(record.id());
        let id = header.split_whitespace().next().unwrap_or_default().to_string();
        let sequence = normalize_sequence(&record.seq())
            .with_context(|| format!("Invalid DNA sequence {:?} in {}", id, path.display()))?;
        records.push(SequenceRecord { id, sequence });
    }
    Ok(records)
}

/// Read the `column` of a delimited table with a header row
///
/// Identifiers come from an `id` column when the table has one, and from
/// the zero-based row number otherwise.
pub fn read_table<P: AsRef<Path>>(path: P, column: &str, delimiter: u8) -> Result<Vec<SequenceRecord>> {
    let path = path.as_ref();
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .delimiter(delimiter)
        .from_path(path)
        .with_context(|| format!("Failed to open table: {}", path.display()))?;

    let headers = reader
        .headers()
        .with_context(|| format!("Failed to read header row of {}", path.display()))?;
    let seq_idx = headers
        .iter()
        .position(|h| h == column)
        .ok_or_else(|| anyhow!("Column {:?} not found in {}", column, path.display()))?;
    let id_idx = headers.iter().position(|h| h == ID_COLUMN);

    let mut records = Vec::new();
    for (row, record) in reader.records().enumerate() {
        let record = record.with_context(|| format!("Failed to parse row {} of {}", row, path.display()))?;
        let raw = record
            .get(seq_idx)
            .ok_or_else(|| anyhow!("Row {} of {} has no {:?} field", row, path.display(), column))?;
        let id = id_idx
            .and_then(|idx| record.get(idx))
            .map_or_else(|| row.to_string(), str::to_string);
        let sequence = normalize_sequence(raw.trim().as_bytes())
            .with_context(|| format!("Invalid DNA sequence in row {} of {}", row, path.display()))?;
        records.push(SequenceRecord { id, sequence });
    }
    Ok(records)
}

/// Read sequences, choosing the parser from the file extension
pub fn load_sequences<P: AsRef<Path>>(path: P, column: &str) -> Result<Vec<SequenceRecord>> {
    let path = path.as_ref();
    let records = match InputFormat::from_path(path) {
        InputFormat::Fastx => read_fastx(path)?,
        InputFormat::Csv => read_table(path, column, b',')?,
        InputFormat::Tsv => read_table(path, column, b'\t')?,
    };
    info!("Loaded {} sequences from {}", records.len(), path.display());
    Ok(records)
}

/// Bring records to the expected length
///
/// Longer sequences are truncated to `expected_len`; shorter ones are
/// dropped with a warning. Without an expected length records pass through.
pub fn prepare_sequences(records: Vec<SequenceRecord>, expected_len: Option<usize>) -> Vec<SequenceRecord> {
    let Some(expected_len) = expected_len else {
        return records;
    };
    let total = records.len();
    let kept: Vec<SequenceRecord> = records
        .into_iter()
        .filter_map(|mut record| {
            if record.sequence.len() < expected_len {
                warn!(
                    "Dropping {}: length {} is below the expected {}",
                    record.id,
                    record.sequence.len(),
                    expected_len
                );
                return None;
            }
            record.sequence.truncate(expected_len);
            Some(record)
        })
        .collect();
    if kept.len() < total {
        warn!("Dropped {} of {} sequences shorter than {}", total - kept.len(), total, expected_len);
    }
    kept
}
