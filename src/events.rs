//! Lifecycle events surfaced to telemetry
//!
//! Background loops report progress and asynchronous failures through an
//! [`EventSink`]. Sinks must be cheap and non-blocking; they run on the
//! introducer, persister, and merger threads.

use std::fmt;

/// Kind tag for asynchronous errors
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AsyncErrorKind {
    Persist,
    Merge,
    Manifest,
}

impl fmt::Display for AsyncErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AsyncErrorKind::Persist => write!(f, "persist"),
            AsyncErrorKind::Merge => write!(f, "merge"),
            AsyncErrorKind::Manifest => write!(f, "manifest"),
        }
    }
}

/// Lifecycle events emitted by the index core
#[derive(Clone, Debug)]
pub enum Event {
    /// A batch became visible in a new root snapshot
    BatchIntroduced { epoch: u64, doc_count: u32 },
    /// The persister finished a cycle that moved segments to disk
    PersisterProgress { epoch: u64, persisted: usize },
    /// The merger planned and executed at a snapshot
    MergerProgress { epoch: u64, tasks: usize },
    /// A background failure that the producing loop will retry
    AsyncError { kind: AsyncErrorKind, detail: String },
}

/// Receiver for lifecycle events
pub trait EventSink: Send + Sync {
    fn on_event(&self, event: &Event);
}

/// Sink that drops every event
#[derive(Clone, Copy, Debug, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn on_event(&self, _event: &Event) {}
}
