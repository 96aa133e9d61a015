use thiserror::Error;

use crate::segment::SegmentId;

/// Main error type for trawl operations
#[derive(Error, Debug)]
pub enum TrawlError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Corrupt data in {path}: {detail}")]
    Corrupt { path: String, detail: String },

    #[error("Segment not found: {0}")]
    SegmentNotFound(SegmentId),

    #[error("Unknown field: {0}")]
    UnknownField(String),

    #[error("Document id must not be empty")]
    EmptyDocumentId,

    #[error("Merge planning error: {0}")]
    Planning(String),

    #[error("Index is closed")]
    Closed,

    #[error("Index is poisoned by a prior invariant violation")]
    Poisoned,
}

/// Result type alias for trawl operations
pub type Result<T> = std::result::Result<T, TrawlError>;

impl TrawlError {
    /// Check if this error indicates a transient failure that the producing
    /// background loop retries on its next cycle
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TrawlError::Io(_) | TrawlError::Serialization(_) | TrawlError::Planning(_)
        )
    }

    /// Check if this error permanently fails the index
    pub fn is_fatal(&self) -> bool {
        matches!(self, TrawlError::Poisoned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TrawlError::SegmentNotFound(SegmentId::new(42));
        assert_eq!(err.to_string(), "Segment not found: segment_42");
    }

    #[test]
    fn test_transient_errors() {
        let io = TrawlError::Io(std::io::Error::new(std::io::ErrorKind::Other, "disk"));
        assert!(io.is_transient());
        assert!(TrawlError::Planning("bad tier".to_string()).is_transient());
        assert!(!TrawlError::Closed.is_transient());
        assert!(TrawlError::Poisoned.is_fatal());
    }
}
