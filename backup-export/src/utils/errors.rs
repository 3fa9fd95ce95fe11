//! Error types for the export pipeline.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExportError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid job: {0}")]
    InvalidJob(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Section source error ({section}): {message}")]
    Source { section: String, message: String },

    #[error("Object store error: {0}")]
    Storage(String),

    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Document error: {0}")]
    Document(String),

    #[error("Archive error: {0}")]
    Archive(String),

    #[error("Notification error: {0}")]
    Notification(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("Task error: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl ExportError {
    pub fn source_failure(section: &str, message: impl ToString) -> Self {
        ExportError::Source {
            section: section.to_string(),
            message: message.to_string(),
        }
    }

    /// True when the error only reports that the reader of a stream went
    /// away, which makes it a symptom of a failure on the reading side.
    pub fn is_broken_pipe(&self) -> bool {
        match self {
            ExportError::Io(e) | ExportError::Zip(zip::result::ZipError::Io(e)) => {
                e.kind() == std::io::ErrorKind::BrokenPipe
            }
            _ => false,
        }
    }

    /// HTTP-style classification used when the error crosses an API boundary.
    pub fn status_code(&self) -> u16 {
        match self {
            ExportError::NotFound(_) => 404,
            ExportError::InvalidJob(_) => 400,
            ExportError::Source { .. }
            | ExportError::Storage(_)
            | ExportError::Notification(_)
            | ExportError::Http(_)
            | ExportError::Database(_) => 502,
            _ => 500,
        }
    }
}

pub type Result<T> = std::result::Result<T, ExportError>;
