use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Analyzer configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AnalyzerConfig {
    pub lowercase: bool,
    pub remove_stopwords: bool,
    pub stem: bool,
    pub min_token_length: usize,
    pub max_token_length: usize,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            lowercase: true,
            remove_stopwords: false,
            stem: false,
            min_token_length: 1,
            max_token_length: 64,
        }
    }
}

/// Configuration for the tiered merge policy
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MergePolicyConfig {
    /// Segments smaller than this (in live documents) are treated as this size
    /// when assigning tiers
    pub floor_segment_docs: u64,
    /// Segments at or above this many live documents are never merge inputs
    pub max_segment_docs: u64,
    /// Target number of segments per size tier
    pub segments_per_tier: usize,
    /// Maximum number of segments combined by one merge task
    pub max_segments_per_merge: usize,
}

impl Default for MergePolicyConfig {
    fn default() -> Self {
        Self {
            floor_segment_docs: 1_000,
            max_segment_docs: 5_000_000,
            segments_per_tier: 10,
            max_segments_per_merge: 10,
        }
    }
}

/// Top-level index configuration
#[derive(Clone, Debug)]
pub struct IndexConfig {
    /// Directory holding segment files and the manifest
    pub path: PathBuf,
    /// Field analysis options
    pub analyzer: AnalyzerConfig,
    /// Merge policy tuning
    pub merge: MergePolicyConfig,
    /// Upper bound on concurrent merge workers
    pub merge_workers: usize,
    /// Capacity of the introduction channel
    pub introducer_channel_capacity: usize,
    /// Capacity of the persister wake-up channel
    pub persister_channel_capacity: usize,
    /// Stored-field rows per compressed chunk in segment files
    pub chunk_factor: u32,
}

impl IndexConfig {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            path: path.into(),
            analyzer: AnalyzerConfig::default(),
            merge: MergePolicyConfig::default(),
            merge_workers: num_cpus::get(),
            introducer_channel_capacity: 16,
            persister_channel_capacity: 16,
            chunk_factor: 1024,
        }
    }

    pub fn with_analyzer(mut self, analyzer: AnalyzerConfig) -> Self {
        self.analyzer = analyzer;
        self
    }

    pub fn with_merge_policy(mut self, merge: MergePolicyConfig) -> Self {
        self.merge = merge;
        self
    }

    pub fn with_merge_workers(mut self, workers: usize) -> Self {
        self.merge_workers = workers.max(1);
        self
    }

    pub fn with_chunk_factor(mut self, chunk_factor: u32) -> Self {
        self.chunk_factor = chunk_factor.max(1);
        self
    }
}
