//! Growth-vocabulary word tokenizer for text classification datasets

use std::collections::HashMap;
use std::path::Path;

use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::error::Result;

/// Reserved id for the padding sentinel
pub const PAD_ID: u32 = 0;
/// Reserved id for the unknown-token sentinel
pub const UNK_ID: u32 = 1;
/// Padding sentinel token
pub const PAD_TOKEN: &str = "<pad>";
/// Unknown-token sentinel
pub const UNK_TOKEN: &str = "<unk>";

/// Ordered, append-only token table. A token's position in the list is its
/// permanent id; ids never change once assigned and the table never shrinks.
#[derive(Debug, Clone)]
pub struct Vocabulary {
    tokens: Vec<String>,
    ids: HashMap<String, u32>,
}

impl Vocabulary {
    /// Create a minimal vocabulary holding only the reserved sentinels
    pub fn seeded() -> Self {
        let mut vocab = Self {
            tokens: Vec::new(),
            ids: HashMap::new(),
        };
        vocab.ensure(PAD_TOKEN);
        vocab.ensure(UNK_TOKEN);
        vocab
    }

    /// Rebuild a vocabulary from an ordered token list.
    ///
    /// Positions are ids, so the list must start with the two sentinels and
    /// contain no duplicates; anything else came from a corrupt artifact.
    pub fn from_tokens(tokens: Vec<String>) -> Result<Self> {
        if tokens.len() < 2 || tokens[0] != PAD_TOKEN || tokens[1] != UNK_TOKEN {
            return Err(crate::error::Error::invalid_input(
                "vocabulary artifact missing reserved sentinel tokens",
            ));
        }
        let mut ids = HashMap::with_capacity(tokens.len());
        for (id, token) in tokens.iter().enumerate() {
            if ids.insert(token.clone(), id as u32).is_some() {
                return Err(crate::error::Error::invalid_input(format!(
                    "vocabulary artifact contains duplicate token '{token}'"
                )));
            }
        }
        Ok(Self { tokens, ids })
    }

    /// Return the token's id, allocating the next one if unseen. Idempotent.
    pub fn ensure(&mut self, token: &str) -> u32 {
        if let Some(&id) = self.ids.get(token) {
            return id;
        }
        let id = self.tokens.len() as u32;
        self.tokens.push(token.to_string());
        self.ids.insert(token.to_string(), id);
        id
    }

    /// Look up a token without growing the table
    pub fn get(&self, token: &str) -> Option<u32> {
        self.ids.get(token).copied()
    }

    /// Token string for an id, if assigned
    pub fn token(&self, id: u32) -> Option<&str> {
        self.tokens.get(id as usize).map(String::as_str)
    }

    /// Number of assigned ids (never decreases)
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    /// True only before seeding, which `seeded`/`from_tokens` rule out
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Ordered token list backing this vocabulary
    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }

    /// Write the ordered token list as a JSON artifact.
    ///
    /// On failure the in-memory table is untouched; the caller decides
    /// whether a stale artifact is tolerable.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&self.tokens)?;
        std::fs::write(path, json)?;
        debug!(path = %path.display(), tokens = self.tokens.len(), "vocabulary saved");
        Ok(())
    }

    /// Load an ordered token list artifact
    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let tokens: Vec<String> = serde_json::from_str(&json)?;
        Self::from_tokens(tokens)
    }

    /// Load an existing artifact, or fall back to a freshly seeded table.
    ///
    /// A missing or corrupt artifact must not fail startup; previously
    /// assigned ids are only preserved when the artifact is intact.
    pub fn load_or_seed(path: &Path) -> Self {
        match Self::load(path) {
            Ok(vocab) => {
                info!(
                    path = %path.display(),
                    tokens = vocab.len(),
                    "loaded existing vocabulary"
                );
                vocab
            }
            Err(e) => {
                if path.exists() {
                    warn!(path = %path.display(), error = %e, "vocabulary artifact unreadable, reseeding");
                } else {
                    info!(path = %path.display(), "no vocabulary artifact, seeding a new one");
                }
                Self::seeded()
            }
        }
    }
}

impl Default for Vocabulary {
    fn default() -> Self {
        Self::seeded()
    }
}

/// Word-level text encoder producing fixed-length id sequences.
///
/// `encode` grows the vocabulary on demand; `encode_frozen` substitutes the
/// unknown sentinel instead. Both always return exactly `max_len` ids.
#[derive(Debug, Clone)]
pub struct Tokenizer {
    vocab: Vocabulary,
    max_len: usize,
}

impl Tokenizer {
    /// Create a tokenizer with a freshly seeded vocabulary
    pub fn new(max_len: usize) -> Self {
        Self {
            vocab: Vocabulary::seeded(),
            max_len,
        }
    }

    /// Create a tokenizer over an existing vocabulary
    pub fn with_vocabulary(vocab: Vocabulary, max_len: usize) -> Self {
        Self { vocab, max_len }
    }

    /// Normalize raw text to a canonical, whitespace-separated form.
    ///
    /// Unifies Arabic-script letter variants (ي/ی, ك/ک, ة/ه, alef forms),
    /// drops harakat and tatweel, lowercases, and collapses every
    /// non-alphanumeric run to a single separator.
    pub fn normalize(text: &str) -> String {
        let mut out = String::with_capacity(text.len());
        for ch in text.chars() {
            let ch = match ch {
                'ي' => 'ی',
                'ك' => 'ک',
                'ة' => 'ه',
                'أ' | 'إ' | 'آ' | 'ٱ' => 'ا',
                _ => ch,
            };
            match ch {
                // harakat, hamza marks, superscript alef, tatweel
                '\u{064B}'..='\u{0655}' | '\u{0670}' | '\u{0640}' => {}
                c if c.is_alphanumeric() => out.extend(c.to_lowercase()),
                _ => out.push(' '),
            }
        }
        out
    }

    /// Return the token's id, allocating the next one if unseen
    pub fn ensure_token(&mut self, token: &str) -> u32 {
        self.vocab.ensure(token)
    }

    /// Encode text into exactly `max_len` ids, growing the vocabulary for
    /// unseen tokens. Empty or whitespace-only input yields all padding.
    pub fn encode(&mut self, text: &str) -> Vec<u32> {
        let norm = Self::normalize(text);
        let mut ids: Vec<u32> = norm
            .split_whitespace()
            .map(|piece| self.vocab.ensure(piece))
            .collect();
        ids.truncate(self.max_len);
        ids.resize(self.max_len, PAD_ID);
        ids
    }

    /// Encode without growing the vocabulary; unseen tokens map to `<unk>`
    pub fn encode_frozen(&self, text: &str) -> Vec<u32> {
        let norm = Self::normalize(text);
        let mut ids: Vec<u32> = norm
            .split_whitespace()
            .map(|piece| self.vocab.get(piece).unwrap_or(UNK_ID))
            .collect();
        ids.truncate(self.max_len);
        ids.resize(self.max_len, PAD_ID);
        ids
    }

    /// Encode a whole corpus: one sequential pass grows the vocabulary, then
    /// the sequences are produced in parallel against the frozen table.
    pub fn encode_corpus(&mut self, texts: &[String]) -> Vec<Vec<u32>> {
        for text in texts {
            let norm = Self::normalize(text);
            for piece in norm.split_whitespace() {
                self.vocab.ensure(piece);
            }
        }
        texts.par_iter().map(|t| self.encode_frozen(t)).collect()
    }

    /// Number of assigned ids
    pub fn vocab_size(&self) -> usize {
        self.vocab.len()
    }

    /// Fixed output length of every encoded sequence
    pub fn max_len(&self) -> usize {
        self.max_len
    }

    /// Borrow the underlying vocabulary
    pub fn vocabulary(&self) -> &Vocabulary {
        &self.vocab
    }

    /// Clone the vocabulary for an isolated worker
    pub fn snapshot(&self) -> Vocabulary {
        self.vocab.clone()
    }

    /// Persist the vocabulary artifact
    pub fn save(&self, path: &Path) -> Result<()> {
        self.vocab.save(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(""; "empty input")]
    #[test_case("   "; "whitespace only")]
    #[test_case("one two three"; "short input")]
    #[test_case("a b c d e f g h i j k l m n o p"; "input longer than max_len")]
    fn encode_length_is_always_max_len(text: &str) {
        let mut tok = Tokenizer::new(8);
        assert_eq!(tok.encode(text).len(), 8);
        assert_eq!(tok.encode_frozen(text).len(), 8);
    }

    #[test]
    fn empty_input_is_all_padding() {
        let mut tok = Tokenizer::new(4);
        assert_eq!(tok.encode(""), vec![PAD_ID; 4]);
        assert_eq!(tok.encode("  \t\n "), vec![PAD_ID; 4]);
    }

    #[test]
    fn sentinels_hold_reserved_ids() {
        let vocab = Vocabulary::seeded();
        assert_eq!(vocab.get(PAD_TOKEN), Some(PAD_ID));
        assert_eq!(vocab.get(UNK_TOKEN), Some(UNK_ID));
        assert_eq!(vocab.len(), 2);
    }

    #[test]
    fn ensure_token_is_idempotent() {
        let mut tok = Tokenizer::new(4);
        let first = tok.ensure_token("hello");
        let second = tok.ensure_token("hello");
        assert_eq!(first, second);
        assert_eq!(tok.vocab_size(), 3);
    }

    #[test]
    fn vocab_size_never_decreases_and_ids_stay_in_range() {
        let mut tok = Tokenizer::new(6);
        let mut last_size = tok.vocab_size();
        for text in ["alpha beta", "beta gamma delta", "", "alpha", "epsilon zeta eta"] {
            let ids = tok.encode(text);
            let size = tok.vocab_size();
            assert!(size >= last_size);
            for id in ids {
                assert!((id as usize) < size);
            }
            last_size = size;
        }
    }

    #[test]
    fn persian_sample_grows_by_unseen_count() {
        let mut tok = Tokenizer::new(5);
        let before = tok.vocab_size();
        let ids = tok.encode("سلام دنیا");
        assert_eq!(ids.len(), 5);
        assert!(ids[0] != PAD_ID && ids[0] != UNK_ID);
        assert!(ids[1] != PAD_ID && ids[1] != UNK_ID);
        assert_ne!(ids[0], ids[1]);
        assert_eq!(&ids[2..], &[PAD_ID, PAD_ID, PAD_ID]);
        assert_eq!(tok.vocab_size(), before + 2);
    }

    #[test]
    fn arabic_variants_normalize_to_one_token() {
        let mut tok = Tokenizer::new(3);
        let arabic = tok.encode("يك")[0];
        let farsi = tok.encode("یک")[0];
        assert_eq!(arabic, farsi);
        // harakat carry no identity
        let plain = tok.encode("سلام")[0];
        let marked = tok.encode("سَلَام")[0];
        assert_eq!(plain, marked);
    }

    #[test]
    fn punctuation_collapses_to_separators() {
        let mut tok = Tokenizer::new(4);
        let a = tok.encode("Hello, world!");
        let b = tok.encode("hello   world");
        assert_eq!(a, b);
    }

    #[test]
    fn frozen_encode_maps_unseen_to_unk() {
        let mut tok = Tokenizer::new(3);
        tok.encode("known words");
        let before = tok.vocab_size();
        let ids = tok.encode_frozen("known stranger");
        assert_eq!(ids[1], UNK_ID);
        assert_eq!(tok.vocab_size(), before);
    }

    #[test]
    fn corpus_pass_matches_single_encodes() {
        let texts = vec![
            "the quick brown fox".to_string(),
            "jumps over the lazy dog".to_string(),
            String::new(),
        ];
        let mut corpus_tok = Tokenizer::new(6);
        let sequences = corpus_tok.encode_corpus(&texts);
        assert_eq!(sequences.len(), 3);
        for seq in &sequences {
            assert_eq!(seq.len(), 6);
            for &id in seq {
                assert!((id as usize) < corpus_tok.vocab_size());
            }
        }
        assert_eq!(sequences[2], vec![PAD_ID; 6]);
    }

    #[test]
    fn save_load_round_trip_preserves_ids() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vocab.json");

        let mut tok = Tokenizer::new(4);
        let id = tok.ensure_token("stable");
        tok.save(&path).unwrap();

        let loaded = Vocabulary::load(&path).unwrap();
        assert_eq!(loaded.get("stable"), Some(id));
        assert_eq!(loaded.len(), tok.vocab_size());

        // a reloaded vocabulary must not reallocate known ids
        let mut reloaded = Tokenizer::with_vocabulary(loaded, 4);
        assert_eq!(reloaded.ensure_token("stable"), id);
    }

    #[test]
    fn load_failure_falls_back_to_seeded() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.json");
        let vocab = Vocabulary::load_or_seed(&missing);
        assert_eq!(vocab.len(), 2);

        let corrupt = dir.path().join("corrupt.json");
        std::fs::write(&corrupt, "not json at all").unwrap();
        let vocab = Vocabulary::load_or_seed(&corrupt);
        assert_eq!(vocab.len(), 2);
        assert_eq!(vocab.get(PAD_TOKEN), Some(PAD_ID));
    }

    #[test]
    fn artifact_without_sentinels_is_rejected() {
        let err = Vocabulary::from_tokens(vec!["just".into(), "words".into()]);
        assert!(err.is_err());
    }
}
