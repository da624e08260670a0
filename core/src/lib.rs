//! libngram-core
//!
//! Statistical n-gram language models: vocabulary, counting, discounting,
//! backoff estimation and storage, mixtures, and the trellis-based models
//! built on top of them (hidden events, HMMs of n-grams, disambiguation).
//!
//! ARPA text and a bincode binary format (with an embedded fst vocabulary)
//! are supported for model files.
//!
//! Public API:
//! - `Vocab` - Shared word/index table with special tokens
//! - `NgramCounts` - N-gram count store
//! - `Discount` - Discounting strategies (Good-Turing, Witten-Bell, Kneser-Ney, ...)
//! - `Ngram` - Backoff n-gram model with estimation, pruning and mixing
//! - `LanguageModel` - The query contract every model implements
//! - `Trellis` - Time-sliced forward/backward/Viterbi dynamic programming
//! - `Config` - Estimation and query configuration
use serde::{Deserialize, Serialize};

pub mod error;
pub use error::{LmError, Result};

pub mod file;
pub use file::LineReader;

pub mod prob;
pub use prob::{LogP, Prob, LOGP_ONE, LOGP_ZERO};

pub mod vocab;
pub use vocab::{Vocab, VocabIndex, VOCAB_NONE};

pub mod trie;
pub use trie::{NodeId, Trie};

pub mod counts;
pub use counts::{Count, NgramCounts};

pub mod discount;
pub use discount::{estimate_discounts, Discount, DiscountConfig};

pub mod lm;
pub use lm::{ContextId, LanguageModel, LmHandle, NullLm, SentenceOptions, TextStats};

pub mod ngram;
pub use ngram::{Ngram, NgramEntry};

pub mod ngram_io;

// Composite and wrapper models
pub mod mix;
pub use mix::{BayesMix, LoglinearMix};

pub mod wrappers;
pub use wrappers::{DynamicLm, ModelLoader, MultiwordLm};

pub mod remote;
pub use remote::RemoteLm;

// Dynamic-programming models
pub mod trellis;
pub use trellis::Trellis;

pub mod hidden_ngram;
pub use hidden_ngram::HiddenNgram;

pub mod hmm_ngram;
pub use hmm_ngram::HmmOfNgrams;

pub mod disambig;
pub use disambig::{Disambiguator, VocabMap};

/// Estimation and query settings shared by the command-line tools.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Maximum n-gram order
    pub order: usize,
    /// Discounting per order, lowest first. Orders without an entry use
    /// `DiscountConfig::default_for_order`.
    pub discounts: Vec<DiscountConfig>,
    /// Interpolate higher-order estimates with lower orders
    pub interpolate: bool,

    // Vocabulary
    /// Treat `<unk>` as a regular word
    pub unk_is_word: bool,
    /// Lower-case words on insertion and lookup
    pub to_lower: bool,
    /// NFC-normalize words on insertion and lookup
    pub normalize_unicode: bool,

    // Pruning
    /// Relative entropy threshold; 0 disables pruning
    pub prune_threshold: f64,
    /// Lowest order subject to pruning
    pub min_prune_order: usize,

    // Mixtures
    /// Weight of the first model in static and Bayesian mixtures
    pub mix_lambda: f64,
    /// Context length for posterior mixture weights (0 = static)
    pub bayes_length: usize,
    /// Exponent on context likelihoods in Bayesian mixtures
    pub bayes_scale: f64,

    // Network client
    /// Context words kept in client cache keys
    pub cache_order: usize,
    /// Client cache size in entries
    pub cache_capacity: usize,

    /// Log filter directive for the tools (`warn`, `info`, `debug`, ...)
    pub debug: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            order: 3,
            discounts: Vec::new(),
            interpolate: false,
            unk_is_word: false,
            to_lower: false,
            normalize_unicode: false,
            prune_threshold: 0.0,
            min_prune_order: 2,
            mix_lambda: 0.5,
            bayes_length: 0,
            bayes_scale: 1.0,
            cache_order: 3,
            cache_capacity: 100_000,
            debug: "warn".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load_toml<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Save configuration to a TOML file.
    pub fn save_toml<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Load configuration from TOML string.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Serialize configuration to TOML string.
    pub fn to_toml_string(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Discounting configuration for order `n` (1-based).
    pub fn discount_for(&self, n: usize) -> DiscountConfig {
        self.discounts
            .get(n.wrapping_sub(1))
            .cloned()
            .unwrap_or_else(|| DiscountConfig::default_for_order(n))
    }

    /// Boxed discounting strategies for orders `1..=order`.
    pub fn build_discounts(&self) -> Vec<Option<Box<dyn Discount>>> {
        (1..=self.order)
            .map(|n| self.discount_for(n).build(self.interpolate))
            .collect()
    }

    /// A fresh vocabulary with the configured word handling.
    pub fn make_vocab(&self) -> Vocab {
        let vocab = Vocab::new();
        vocab.set_unk_is_word(self.unk_is_word);
        vocab.set_to_lower(self.to_lower);
        vocab.set_normalize(self.normalize_unicode);
        vocab
    }
}

/// Utility helpers.
pub mod utils {
    /// Normalize input strings (NFC) and trim whitespace.
    pub fn normalize(s: &str) -> String {
        use unicode_normalization::UnicodeNormalization;
        s.nfc().collect::<String>().trim().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_survive_partial_toml() {
        let config = Config::from_toml_str("order = 4\ninterpolate = true\n").unwrap();
        assert_eq!(config.order, 4);
        assert!(config.interpolate);
        assert_eq!(config.cache_capacity, Config::default().cache_capacity);
        assert_eq!(config.discount_for(1), DiscountConfig::default_for_order(1));
        assert_eq!(config.build_discounts().len(), 4);
    }

    #[test]
    fn config_discounts_parse_per_order() {
        let text = r#"
order = 2

[[discounts]]
method = "witten-bell"
min_count = 1

[[discounts]]
method = "kneser-ney"
min_count = 1
modified = true
"#;
        let config = Config::from_toml_str(text).unwrap();
        assert_eq!(config.discount_for(1), DiscountConfig::WittenBell { min_count: 1 });
        assert_eq!(
            config.discount_for(2),
            DiscountConfig::KneserNey {
                min_count: 1,
                modified: true
            }
        );
        let back = Config::from_toml_str(&config.to_toml_string().unwrap()).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn config_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lm.toml");
        let config = Config {
            order: 5,
            prune_threshold: 1e-7,
            ..Config::default()
        };
        config.save_toml(&path).unwrap();
        assert_eq!(Config::load_toml(&path).unwrap(), config);
    }

    #[test]
    fn normalize_composes_and_trims() {
        assert_eq!(utils::normalize("  e\u{301} "), "\u{e9}");
    }
}
