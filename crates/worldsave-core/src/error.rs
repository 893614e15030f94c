//! Error types shared by the worldsave crates.

use thiserror::Error;

/// Result type alias for core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Record validation errors
#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid record id: {0:?}. Must be a single non-empty path component")]
    InvalidRecordId(String),

    #[error("Unknown record kind: {0:?}")]
    UnknownKind(String),
}

impl Error {
    /// Stable machine-readable error type name.
    #[must_use]
    pub const fn error_type(&self) -> &'static str {
        match self {
            Self::InvalidRecordId(_) => "INVALID_RECORD_ID",
            Self::UnknownKind(_) => "UNKNOWN_KIND",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_type_names_are_stable() {
        assert_eq!(
            Error::InvalidRecordId("../x".into()).error_type(),
            "INVALID_RECORD_ID"
        );
        assert_eq!(Error::UnknownKind("ships".into()).error_type(), "UNKNOWN_KIND");
    }

    #[test]
    fn invalid_record_id_message_quotes_value() {
        let msg = Error::InvalidRecordId("a/b".into()).to_string();
        assert!(msg.contains("\"a/b\""), "{msg}");
    }
}
