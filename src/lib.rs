//! trawl: a log-structured full-text search engine library
//!
//! The heart of the crate is a segmented, snapshot-isolated index: batches
//! of document mutations become immutable in-memory segments, a single
//! introducer publishes each change as a new refcounted root snapshot, a
//! persister moves segments to disk, and a merger keeps the segment layout
//! roughly geometric. Readers acquire a snapshot and keep an unchanging
//! view for as long as they hold it.

pub mod analysis;
pub mod config;
pub mod document;
pub mod error;
pub mod events;
pub mod index;
pub mod segment;

pub use config::{AnalyzerConfig, IndexConfig, MergePolicyConfig};
pub use document::{Batch, Document};
pub use error::{Result, TrawlError};
pub use events::{AsyncErrorKind, Event, EventSink, NullSink};
pub use index::{
    GlobalPosting, Index, IndexReader, IndexSnapshot, MergePlan, MergePolicy, MergeTask,
    PlanSegment, TieredMergePolicy,
};
pub use segment::{DictEntry, DocNo, Posting, SegmentId};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
