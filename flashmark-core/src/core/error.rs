//! Error types for the Flashmark core library.

use thiserror::Error;

/// All errors that can occur within the Flashmark core library.
///
/// Errors fall into two classes. Per-note errors (see [`FlashmarkError::is_fatal`])
/// are captured as a failed reconciliation result and the run continues with
/// the next block. Fatal errors abort the run and roll back its transaction.
#[derive(Debug, Error)]
pub enum FlashmarkError {
    /// The document's block or field structure is malformed.
    #[error("Parse error at line {line}: {message}")]
    Parse { line: usize, message: String },

    /// A field's content cannot be converted, e.g. an unterminated LaTeX block.
    #[error("Format error: {0}")]
    Format(String),

    /// A block names a model that does not exist in the collection.
    #[error("Unknown model: {0}")]
    UnknownModel(String),

    /// A block carries a note ID that does not exist in the collection.
    #[error("Unknown note identifier: {0}")]
    UnknownIdentifier(i64),

    /// A block carries a card ID that does not exist in the collection.
    #[error("Unknown card identifier: {0}")]
    UnknownCard(i64),

    /// The existing note uses a different model than the block declares.
    #[error("Note {note_id} uses model '{actual}' but the block declares '{expected}'")]
    ModelMismatch {
        note_id: i64,
        expected: String,
        actual: String,
    },

    /// The block's field names are not a correctly ordered subset of the model's fields.
    #[error("Fields do not match model '{model}': {message}")]
    FieldMismatch { model: String, message: String },

    /// The deck does not exist and the deck policy forbids creating it.
    #[error("Unknown deck: {0}")]
    UnknownDeck(String),

    /// The external LaTeX toolchain failed.
    #[error("LaTeX rendering failed for '{source_text}': {message}")]
    Render { source_text: String, message: String },

    /// The collection file could not be opened or is not a collection.
    #[error("Collection unavailable: {0}")]
    StoreUnavailable(String),

    /// A fatal error forced the run's transaction to roll back.
    #[error("Transaction aborted{}, nothing was saved: {source}", describe_line(.line))]
    TransactionAborted {
        line: Option<usize>,
        #[source]
        source: Box<FlashmarkError>,
    },

    /// A SQLite operation failed.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// An I/O operation on the filesystem failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Stored note data could not be (de)serialised.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Convenience alias that pins the error type to [`FlashmarkError`].
pub type Result<T> = std::result::Result<T, FlashmarkError>;

fn describe_line(line: &Option<usize>) -> String {
    match line {
        Some(line) => format!(" at block on line {line}"),
        None => String::new(),
    }
}

impl FlashmarkError {
    /// Builds a [`FlashmarkError::Parse`] for the given 1-based line.
    pub fn parse(line: usize, message: impl Into<String>) -> Self {
        Self::Parse {
            line,
            message: message.into(),
        }
    }

    /// Wraps `self` as the cause of an aborted transaction.
    ///
    /// An error that already is [`FlashmarkError::TransactionAborted`] is returned unchanged.
    pub fn abort_at(self, line: Option<usize>) -> Self {
        match self {
            aborted @ Self::TransactionAborted { .. } => aborted,
            other => Self::TransactionAborted {
                line,
                source: Box::new(other),
            },
        }
    }

    /// Returns `true` when the error must abort the whole synchronization run.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::StoreUnavailable(_)
                | Self::TransactionAborted { .. }
                | Self::Database(_)
                | Self::Io(_)
                | Self::Json(_)
        )
    }

    /// Returns a short, human-readable message suitable for display to the end user.
    #[must_use]
    pub fn user_message(&self) -> String {
        match self {
            Self::Parse { line, message } => format!("Line {line}: {message}"),
            Self::Format(msg) => msg.clone(),
            Self::UnknownModel(name) => format!("No model named '{name}'"),
            Self::UnknownIdentifier(id) => format!("Note {id} does not exist"),
            Self::UnknownCard(id) => format!("Card {id} does not exist"),
            Self::ModelMismatch { .. } | Self::FieldMismatch { .. } => self.to_string(),
            Self::UnknownDeck(name) => format!("No deck named '{name}'"),
            Self::Render { message, .. } => format!("LaTeX error: {message}"),
            Self::StoreUnavailable(msg) => format!("Could not open collection: {msg}"),
            Self::TransactionAborted { line, source } => format!(
                "Nothing was saved{}: {}",
                describe_line(line),
                source.user_message()
            ),
            Self::Database(e) => format!("Failed to save: {e}"),
            Self::Io(e) => format!("File error: {e}"),
            Self::Json(e) => format!("Data format error: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_per_note_errors_are_not_fatal() {
        assert!(!FlashmarkError::UnknownIdentifier(9999).is_fatal());
        assert!(!FlashmarkError::Format("x".into()).is_fatal());
        assert!(!FlashmarkError::ModelMismatch {
            note_id: 1,
            expected: "Basic".into(),
            actual: "Cloze".into(),
        }
        .is_fatal());
        assert!(FlashmarkError::StoreUnavailable("gone".into()).is_fatal());
    }

    #[test]
    fn test_store_and_data_errors_are_fatal() {
        let json = serde_json::from_str::<Vec<String>>("not json").unwrap_err();
        assert!(FlashmarkError::Json(json).is_fatal());
        assert!(FlashmarkError::Io(std::io::Error::other("disk")).is_fatal());
        assert!(!FlashmarkError::Render {
            source_text: "x".into(),
            message: "boom".into(),
        }
        .is_fatal());
    }

    #[test]
    fn test_abort_at_wraps_once() {
        let err = FlashmarkError::StoreUnavailable("gone".into())
            .abort_at(Some(12))
            .abort_at(Some(40));
        match &err {
            FlashmarkError::TransactionAborted { line, source } => {
                assert_eq!(*line, Some(12));
                assert!(matches!(**source, FlashmarkError::StoreUnavailable(_)));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(err.to_string().contains("line 12"));
        assert!(err.to_string().contains("nothing was saved"));
    }

    #[test]
    fn test_abort_message_names_the_block_line() {
        let err = FlashmarkError::StoreUnavailable("gone".into()).abort_at(Some(12));
        assert_eq!(
            err.user_message(),
            "Nothing was saved at block on line 12: Could not open collection: gone"
        );

        let err = FlashmarkError::StoreUnavailable("gone".into()).abort_at(None);
        assert_eq!(err.user_message(), "Nothing was saved: Could not open collection: gone");
    }

    #[test]
    fn test_parse_error_names_line() {
        let err = FlashmarkError::parse(7, "block has no model");
        assert_eq!(err.to_string(), "Parse error at line 7: block has no model");
        assert_eq!(err.user_message(), "Line 7: block has no model");
    }
}
