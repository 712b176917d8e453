//! Error types for the exam engine

use thiserror::Error;

/// Everything an engine operation can fail with. All variants are
/// recoverable: the transport layer renders them, nothing panics.
#[derive(Debug, Error)]
pub enum ExamError {
    /// Grade or subject absent from the catalog
    #[error("no exam found for grade '{grade_id}', subject '{subject_id}'")]
    NotFound { grade_id: String, subject_id: String },

    /// The user already has an exam in progress
    #[error("an exam is already in progress")]
    AlreadyActive,

    /// Operation requires an active session
    #[error("no active exam session")]
    NoActiveSession,

    /// Answer option index outside the current question's options
    #[error("answer option {given} is out of range (question has {options} options)")]
    OutOfRange { given: usize, options: usize },

    /// Content vanished mid-session or mid-review
    #[error("exam content for grade '{grade_id}', subject '{subject_id}' is no longer available")]
    ContentMissing { grade_id: String, subject_id: String },

    /// Review index outside the user's result history
    #[error("result index {given} is out of range (history has {len} entries)")]
    IndexOutOfRange { given: usize, len: usize },

    /// Persistence write failed
    #[error("storage error: {0}")]
    Io(#[from] std::io::Error),

    /// Persistence (de)serialization failed
    #[error("storage error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl ExamError {
    /// True for the two storage-failure variants. Used by the transport
    /// layer to pick a generic "system error" message.
    pub fn is_storage(&self) -> bool {
        matches!(self, ExamError::Io(_) | ExamError::Serde(_))
    }
}

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, ExamError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ExamError::NotFound {
            grade_id: "3".to_string(),
            subject_id: "math".to_string(),
        };
        assert_eq!(err.to_string(), "no exam found for grade '3', subject 'math'");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: ExamError = io_err.into();
        assert!(err.is_storage());
    }
}
