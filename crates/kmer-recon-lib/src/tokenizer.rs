//! Vocabulary, tokenizer interface and special-token bookkeeping
//!
//! The model consumes one token per overlapping k-mer, preceded by a species
//! tag and wrapped in sequence-boundary tokens. The tokenizer itself is a
//! collaborator behind [`KmerTokenizer`]; [`VocabTokenizer`] is the built-in
//! whitespace implementation over a `vocab.txt`-style [`Vocabulary`].

use crate::constants::num_kmers;
use crate::encoding::{index_to_kmer, is_kmer, kmers_stride1};
use crate::error::{InferenceError, Result};
use ahash::{AHashMap, AHashSet};
use std::fs;
use std::path::Path;

/// Padding token
pub const PAD_TOKEN: &str = "[PAD]";
/// Unknown-word token
pub const UNK_TOKEN: &str = "[UNK]";
/// Sequence-start token
pub const CLS_TOKEN: &str = "[CLS]";
/// Sequence-end token
pub const SEP_TOKEN: &str = "[SEP]";
/// Mask token
pub const MASK_TOKEN: &str = "[MASK]";

/// Ordered token list; a token's id is its index
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Vocabulary {
    tokens: Vec<String>,
}

impl Vocabulary {
    /// Wrap an ordered token list
    pub fn from_tokens(tokens: Vec<String>) -> Self {
        Self { tokens }
    }

    /// Load a vocabulary file with one token per line
    ///
    /// # Errors
    /// Fails if the file cannot be read or contains an empty line
    /// (which would silently shift every following id).
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = fs::read_to_string(path.as_ref())?;
        let mut tokens = Vec::new();
        for (line_no, line) in text.lines().enumerate() {
            let token = line.trim();
            if token.is_empty() {
                return Err(InferenceError::VocabularyMismatch(format!(
                    "empty token at line {} of {}",
                    line_no + 1,
                    path.as_ref().display()
                )));
            }
            tokens.push(token.to_string());
        }
        Ok(Self { tokens })
    }

    /// The standard layout: five bracketed special tokens, all `4^k`
    /// k-mers in lexicographic order, then one token per species tag
    pub fn standard(kmer_size: usize, species: &[&str]) -> Self {
        let mut tokens: Vec<String> = [PAD_TOKEN, UNK_TOKEN, CLS_TOKEN, SEP_TOKEN, MASK_TOKEN]
            .iter()
            .map(|t| t.to_string())
            .collect();
        tokens.extend((0..num_kmers(kmer_size)).map(|i| index_to_kmer(i, kmer_size)));
        tokens.extend(species.iter().map(|s| s.to_string()));
        Self { tokens }
    }

    /// All tokens, in id order
    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }

    /// Number of tokens
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    /// Whether the vocabulary is empty
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Token string for an id
    pub fn get(&self, id: u32) -> Option<&str> {
        self.tokens.get(id as usize).map(String::as_str)
    }
}

/// Tokenizer collaborator
pub trait KmerTokenizer: Send + Sync {
    /// Convert model input text into token ids, including any boundary tokens
    fn tokenize(&self, text: &str) -> Result<Vec<u32>>;

    /// Ids that never encode a k-mer (species tags, boundaries, padding, mask)
    fn all_special_ids(&self) -> &AHashSet<u32>;

    /// Id written into masked positions
    fn mask_token_id(&self) -> u32;

    /// Whether `id` is one of [`KmerTokenizer::all_special_ids`]
    fn is_special(&self, id: u32) -> bool {
        self.all_special_ids().contains(&id)
    }
}

/// Whitespace tokenizer over a [`Vocabulary`]
///
/// Input words map to their vocabulary id (unknown words to `[UNK]`) and
/// the result is wrapped as `[CLS] ... [SEP]`. Every token that is not a
/// k-mer is special, which includes species tags.
#[derive(Debug, Clone)]
pub struct VocabTokenizer {
    token_to_id: AHashMap<String, u32>,
    special_ids: AHashSet<u32>,
    unk_id: u32,
    cls_id: u32,
    sep_id: u32,
    mask_id: u32,
}

impl VocabTokenizer {
    /// Build a tokenizer for `kmer_size`-mers
    ///
    /// # Errors
    /// Fails with [`InferenceError::VocabularyMismatch`] on duplicate tokens
    /// or when one of `[UNK]`, `[CLS]`, `[SEP]`, `[MASK]` is missing.
    pub fn new(vocabulary: &Vocabulary, kmer_size: usize) -> Result<Self> {
        let mut token_to_id = AHashMap::with_capacity(vocabulary.len());
        let mut special_ids = AHashSet::new();
        for (id, token) in vocabulary.tokens().iter().enumerate() {
            let id = id as u32;
            if token_to_id.insert(token.clone(), id).is_some() {
                return Err(InferenceError::VocabularyMismatch(format!(
                    "duplicate token {token:?}"
                )));
            }
            if !is_kmer(token, kmer_size) {
                special_ids.insert(id);
            }
        }

        let lookup = |name: &str| {
            token_to_id.get(name).copied().ok_or_else(|| {
                InferenceError::VocabularyMismatch(format!("missing required token {name}"))
            })
        };
        let unk_id = lookup(UNK_TOKEN)?;
        let cls_id = lookup(CLS_TOKEN)?;
        let sep_id = lookup(SEP_TOKEN)?;
        let mask_id = lookup(MASK_TOKEN)?;

        Ok(Self {
            token_to_id,
            special_ids,
            unk_id,
            cls_id,
            sep_id,
            mask_id,
        })
    }

    /// Id of a token, if present
    pub fn token_id(&self, token: &str) -> Option<u32> {
        self.token_to_id.get(token).copied()
    }
}

impl KmerTokenizer for VocabTokenizer {
    fn tokenize(&self, text: &str) -> Result<Vec<u32>> {
        let mut ids = Vec::with_capacity(text.len() / 2 + 2);
        ids.push(self.cls_id);
        ids.extend(
            text.split_whitespace()
                .map(|word| self.token_to_id.get(word).copied().unwrap_or(self.unk_id)),
        );
        ids.push(self.sep_id);
        Ok(ids)
    }

    fn all_special_ids(&self) -> &AHashSet<u32> {
        &self.special_ids
    }

    fn mask_token_id(&self) -> u32 {
        self.mask_id
    }
}

/// Count of contiguous special tokens at either end of a token row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SpecialTokenOffset {
    /// Special tokens before the first k-mer token
    pub left: usize,
    /// Special tokens after the last k-mer token
    pub right: usize,
}

impl SpecialTokenOffset {
    /// Scan inward from both ends until a non-special token is found
    ///
    /// A row made only of special tokens reports all of them on the left.
    pub fn compute<T: KmerTokenizer + ?Sized>(ids: &[u32], tokenizer: &T) -> Self {
        let left = ids.iter().take_while(|&&id| tokenizer.is_special(id)).count();
        let right = ids[left..]
            .iter()
            .rev()
            .take_while(|&&id| tokenizer.is_special(id))
            .count();
        Self { left, right }
    }

    /// Total number of special tokens at the ends
    pub fn total(&self) -> usize {
        self.left + self.right
    }
}

/// A token row together with its special-token offsets
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenizedSequence {
    /// Token ids, including special tokens
    pub ids: Vec<u32>,
    /// Special-token counts at both ends
    pub offsets: SpecialTokenOffset,
}

impl TokenizedSequence {
    /// Wrap a token row, computing its offsets
    pub fn new<T: KmerTokenizer + ?Sized>(ids: Vec<u32>, tokenizer: &T) -> Self {
        let offsets = SpecialTokenOffset::compute(&ids, tokenizer);
        Self { ids, offsets }
    }

    /// Length of the full token row
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Whether the token row is empty
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Number of k-mer tokens between the special-token ends
    pub fn num_kmer_tokens(&self) -> usize {
        self.ids.len() - self.offsets.total()
    }

    /// The k-mer tokens between the special-token ends
    pub fn kmer_ids(&self) -> &[u32] {
        &self.ids[self.offsets.left..self.ids.len() - self.offsets.right]
    }
}

/// Model input text: the species tag followed by the stride-1 k-mers
pub fn kmer_sentence(species: &str, sequence: &str, kmer_size: usize) -> String {
    let kmers = kmers_stride1(sequence, kmer_size);
    let mut text = String::with_capacity(species.len() + kmers.len() * (kmer_size + 1));
    text.push_str(species);
    for kmer in kmers {
        text.push(' ');
        text.push_str(kmer);
    }
    text
}

/// Tokenize a sequence and check the k-mer token count
///
/// # Errors
/// Fails with [`InferenceError::Tokenizer`] when the row does not hold
/// exactly `len - k + 1` k-mer tokens (zero for sequences shorter than `k`).
pub fn tokenize_sequence<T: KmerTokenizer + ?Sized>(
    tokenizer: &T,
    species: &str,
    sequence: &str,
    kmer_size: usize,
) -> Result<TokenizedSequence> {
    let text = kmer_sentence(species, sequence, kmer_size);
    let tokenized = TokenizedSequence::new(tokenizer.tokenize(&text)?, tokenizer);

    let expected = (sequence.len() + 1).saturating_sub(kmer_size);
    if tokenized.num_kmer_tokens() != expected {
        return Err(InferenceError::Tokenizer(format!(
            "expected {} k-mer tokens for a sequence of length {}, got {} (offsets {:?})",
            expected,
            sequence.len(),
            tokenized.num_kmer_tokens(),
            tokenized.offsets
        )));
    }
    Ok(tokenized)
}
