//! Immutable segments and their on-disk form
//!
//! A segment is an immutable, internally sorted chunk of the index produced
//! by a batch or a merge. It is either held purely in memory or backed by a
//! single file; the content representation is identical either way.

pub mod cleanup;
mod data;
pub mod file;
mod merge;
mod postings;
mod term_dict;
mod types;

pub use cleanup::FileCleanup;
pub use data::SegmentData;
pub use file::{segment_file_name, SEGMENT_EXTENSION};
pub use postings::{PostingIterator, PostingsWriter};
pub use term_dict::{TermDictionary, TermDictionaryBuilder, TermStream};
pub use types::{DictEntry, DocNo, Posting, PostingListMeta, SegmentId, DROPPED_DOC};

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

enum Location {
    Memory,
    File {
        path: PathBuf,
        cleanup: Arc<FileCleanup>,
        obsolete: AtomicBool,
    },
}

/// An immutable segment with a stable identity and provenance
pub struct Segment {
    id: SegmentId,
    data: SegmentData,
    location: Location,
}

impl Segment {
    /// A segment living purely in memory (batch product awaiting persistence)
    pub(crate) fn new_memory(id: SegmentId, data: SegmentData) -> Self {
        Self {
            id,
            data,
            location: Location::Memory,
        }
    }

    /// A segment backed by a file in the index directory
    pub(crate) fn new_file(
        id: SegmentId,
        data: SegmentData,
        path: PathBuf,
        cleanup: Arc<FileCleanup>,
    ) -> Self {
        Self {
            id,
            data,
            location: Location::File {
                path,
                cleanup,
                obsolete: AtomicBool::new(false),
            },
        }
    }

    pub fn id(&self) -> SegmentId {
        self.id
    }

    pub fn data(&self) -> &SegmentData {
        &self.data
    }

    pub fn is_persisted(&self) -> bool {
        matches!(self.location, Location::File { .. })
    }

    pub fn file_path(&self) -> Option<&Path> {
        match &self.location {
            Location::File { path, .. } => Some(path),
            Location::Memory => None,
        }
    }

    /// Mark this segment's file as removable once the last reference drops.
    /// Called by the introducer when the segment leaves the root for good.
    pub(crate) fn mark_obsolete(&self) {
        if let Location::File { obsolete, .. } = &self.location {
            obsolete.store(true, Ordering::Release);
        }
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        if let Location::File {
            path,
            cleanup,
            obsolete,
        } = &self.location
        {
            if obsolete.load(Ordering::Acquire) {
                cleanup.request_removal(path);
            }
        }
    }
}
