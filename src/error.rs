use thiserror::Error;

/// Main error type for index operations
#[derive(Error, Debug)]
pub enum IndexError {
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Already closed: {0}")]
    AlreadyClosed(String),

    #[error("Commit generation {0} is not snapshotted")]
    InvalidSnapshot(u64),

    #[error("Corrupt index: {0}")]
    CorruptIndex(String),

    #[error("Merge aborted: {0}")]
    MergeAborted(String),

    #[error("Lock obtain failed: {0}")]
    LockObtainFailed(String),

    #[error("No index found: {0}")]
    IndexNotFound(String),

    #[error("Illegal state: {0}")]
    IllegalState(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),
}

/// Result type alias for index operations
pub type Result<T> = std::result::Result<T, IndexError>;

impl IndexError {
    pub(crate) fn already_closed(what: &str) -> Self {
        IndexError::AlreadyClosed(format!("this {} is closed", what))
    }

    pub(crate) fn corrupt(resource: &str, detail: impl std::fmt::Display) -> Self {
        IndexError::CorruptIndex(format!("{} (resource={})", detail, resource))
    }

    /// Check if this error indicates a transient failure that could be retried
    pub fn is_retriable(&self) -> bool {
        matches!(self, IndexError::Io(_) | IndexError::MergeAborted(_))
    }

    /// Check if this error means on-disk data failed validation
    pub fn is_corruption(&self) -> bool {
        matches!(self, IndexError::CorruptIndex(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = IndexError::InvalidSnapshot(7);
        assert_eq!(err.to_string(), "Commit generation 7 is not snapshotted");

        let err = IndexError::already_closed("IndexWriter");
        assert_eq!(err.to_string(), "Already closed: this IndexWriter is closed");
    }

    #[test]
    fn test_retriable_errors() {
        assert!(IndexError::MergeAborted("closing".to_string()).is_retriable());
        assert!(IndexError::Io(std::io::Error::new(std::io::ErrorKind::Other, "disk")).is_retriable());
        assert!(!IndexError::InvalidConfiguration("x".to_string()).is_retriable());
        assert!(IndexError::corrupt("_0.fdt", "checksum mismatch").is_corruption());
    }
}
