//! Core types for the segmented index

use serde::{Deserialize, Serialize};
use std::fmt;

/// Segment identifier (monotonically assigned, never reused)
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SegmentId(pub u64);

impl SegmentId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "segment_{}", self.0)
    }
}

/// Dense local document number within a segment (0..doc_count)
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DocNo(pub u32);

impl DocNo {
    pub fn new(n: u32) -> Self {
        Self(n)
    }

    pub fn as_u32(self) -> u32 {
        self.0
    }

    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

/// Sentinel in merge translation vectors: the old local docnum was deleted
/// at merge time and has no counterpart in the merged segment
pub const DROPPED_DOC: u32 = u32::MAX;

/// A single posting entry within a posting list
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Posting {
    /// Local document number within the segment
    pub docno: DocNo,
    /// Term frequency in this (document, field)
    pub term_frequency: u32,
    /// Field length of this (document, field), used as the scoring norm
    pub norm: u32,
    /// Token positions of the term within the field
    pub positions: Vec<u32>,
}

impl Posting {
    pub fn new(docno: DocNo, term_frequency: u32, norm: u32, positions: Vec<u32>) -> Self {
        Self {
            docno,
            term_frequency,
            norm,
            positions,
        }
    }
}

/// Posting list location and statistics, stored in the term dictionary
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostingListMeta {
    /// Offset into the segment's postings region
    pub offset: u64,
    /// Length in bytes
    pub length: u64,
    /// Number of documents containing this term
    pub doc_frequency: u32,
    /// Total term frequency across all documents
    pub total_term_frequency: u64,
}

/// One entry yielded by dictionary iteration
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DictEntry {
    pub term: String,
    pub doc_frequency: u32,
}
