//! Error taxonomy for the ingestion pipeline.
//!
//! Parsers return [`ParseError`]; the orchestrator wraps every per-file
//! failure in an [`IngestError`] and maps it onto an
//! [`IngestionStatus`] plus a human-readable reason.

use thiserror::Error;

use transcript_harness_core::models::IngestionStatus;

/// Errors raised by parser plugins.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A record that must be well-formed (such as a resume anchor) is not.
    #[error("malformed record at line {line}: {message}")]
    Malformed { line: u64, message: String },

    /// The file contains no conversational messages.
    #[error("no messages found")]
    Empty,

    #[error("{parser} cannot resume at an offset")]
    NotIncremental { parser: String },
}

impl ParseError {
    pub fn malformed(line: u64, message: impl Into<String>) -> Self {
        Self::Malformed {
            line,
            message: message.into(),
        }
    }
}

/// Per-file pipeline failures.
#[derive(Error, Debug)]
pub enum IngestError {
    /// The pre-filter found none of the marker fields.
    #[error("metadata-only: none of the first {lines} lines carry conversation markers")]
    MetadataOnly { lines: usize },

    /// Passed the pre-filter but no plugin claimed the file.
    #[error("unsupported format: no parser claims this file")]
    UnsupportedFormat,

    #[error("parse failed ({parser}): {source}")]
    Parse {
        parser: String,
        #[source]
        source: ParseError,
    },

    #[error("persist failed: {0:#}")]
    Persist(anyhow::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl IngestError {
    /// Ledger status for this failure.
    pub fn status(&self) -> IngestionStatus {
        match self {
            IngestError::MetadataOnly { .. } | IngestError::UnsupportedFormat => {
                IngestionStatus::Skipped
            }
            IngestError::Parse {
                source: ParseError::Empty,
                ..
            } => IngestionStatus::Skipped,
            IngestError::Parse { .. } | IngestError::Persist(_) | IngestError::Io(_) => {
                IngestionStatus::Failed
            }
        }
    }
}
