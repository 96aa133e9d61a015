//! Field analysis: tokenization with optional stemming and stopword removal
//!
//! The analyzer turns raw field text into per-term position lists. Positions
//! are token ordinals after filtering, so phrase adjacency survives analysis.

use std::collections::{BTreeMap, HashSet};

use rust_stemmers::{Algorithm, Stemmer};
use stop_words::{get, LANGUAGE};
use unicode_segmentation::UnicodeSegmentation;

use crate::config::AnalyzerConfig;
use crate::document::Document;

/// One analyzed field: sorted term -> positions, plus the field length used
/// as the norm for every posting in this (doc, field) pair
#[derive(Clone, Debug)]
pub struct AnalyzedField {
    pub name: String,
    /// Term -> positions of that term within the field
    pub terms: BTreeMap<String, Vec<u32>>,
    /// Number of tokens that survived filtering
    pub length: u32,
    /// Original field text, kept for stored-field retrieval
    pub stored: String,
}

/// A document after analysis, ready to enter an in-memory segment
#[derive(Clone, Debug)]
pub struct AnalyzedDocument {
    pub id: String,
    pub fields: Vec<AnalyzedField>,
}

/// Text analyzer with stemming and stopword removal
pub struct Analyzer {
    config: AnalyzerConfig,
    stemmer: Option<Stemmer>,
    stopwords: HashSet<String>,
}

impl Analyzer {
    /// Create a new analyzer from configuration
    pub fn new(config: &AnalyzerConfig) -> Self {
        let stemmer = if config.stem {
            Some(Stemmer::create(Algorithm::English))
        } else {
            None
        };

        let stopwords = if config.remove_stopwords {
            get(LANGUAGE::English)
                .into_iter()
                .map(|s| s.to_lowercase())
                .collect()
        } else {
            HashSet::new()
        };

        Self {
            config: config.clone(),
            stemmer,
            stopwords,
        }
    }

    /// Tokenize text into a vector of terms
    pub fn tokenize(&self, text: &str) -> Vec<String> {
        let tokens: Vec<String> = text
            .unicode_words()
            .map(|word| {
                if self.config.lowercase {
                    word.to_lowercase()
                } else {
                    word.to_string()
                }
            })
            .filter(|token| {
                token.len() >= self.config.min_token_length
                    && token.len() <= self.config.max_token_length
                    && !self.stopwords.contains(token)
            })
            .collect();

        if let Some(stemmer) = &self.stemmer {
            tokens
                .into_iter()
                .map(|token| stemmer.stem(&token).to_string())
                .collect()
        } else {
            tokens
        }
    }

    /// Analyze one field into term -> positions
    pub fn analyze_field(&self, name: &str, text: &str) -> AnalyzedField {
        let tokens = self.tokenize(text);
        let length = tokens.len() as u32;

        let mut terms: BTreeMap<String, Vec<u32>> = BTreeMap::new();
        for (position, token) in tokens.into_iter().enumerate() {
            terms.entry(token).or_default().push(position as u32);
        }

        AnalyzedField {
            name: name.to_string(),
            terms,
            length,
            stored: text.to_string(),
        }
    }

    /// Analyze a whole document
    pub fn analyze(&self, doc: &Document) -> AnalyzedDocument {
        let fields = doc
            .fields()
            .map(|(name, text)| self.analyze_field(name, text))
            .collect();

        AnalyzedDocument {
            id: doc.id().to_string(),
            fields,
        }
    }
}
