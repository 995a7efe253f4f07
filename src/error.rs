//! Error taxonomy for the extraction pipeline
//!
//! | Category | Variants | Recovery |
//! |----------|----------|----------|
//! | Configuration | `Configuration` | Fix registry, dataset or flags |
//! | Accumulation | `InconsistentStatistics` | Programming error in the encoder |
//! | Input | `MalformedInput` | Fix the document, or run with the skip policy |
//! | Persistence | `Io`, `Json`, `Safetensors` | Inspect the output directory |
//! | Inference | `Encoder`, `Tensor` | Check weights, device and tokenizer |
//!
//! Nothing in this crate retries. Errors propagate to the pipeline driver,
//! which stops the run and reports the last chunk that reached disk.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::dataset::DocumentId;

/// Convenience alias used across the library.
pub type Result<T> = std::result::Result<T, ExtractError>;

#[derive(Debug, Error)]
pub enum ExtractError {
    /// Unknown encoder or layer, missing/duplicate metadata, unsafe ids,
    /// unpaired chunk files.
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// A statistic set (or vector dimension) differing from the one that
    /// opened the current accumulation window.
    #[error("inconsistent statistics: expected {expected}, found {found}")]
    InconsistentStatistics { expected: String, found: String },

    /// Empty or degenerate token sequence.
    #[error("malformed input{}: {reason}", document_suffix(.document))]
    MalformedInput {
        document: Option<DocumentId>,
        reason: String,
    },

    #[error("I/O error at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid JSON in {} line {line}: {source}", .path.display())]
    Json {
        path: PathBuf,
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("safetensors error: {0}")]
    Safetensors(#[from] safetensors::SafeTensorError),

    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    /// Tokenizer, model loading or inference failure inside an encoder.
    #[error("encoder failure: {0:#}")]
    Encoder(#[source] anyhow::Error),
}

fn document_suffix(document: &Option<DocumentId>) -> String {
    match document {
        Some(id) => format!(" in document {id}"),
        None => String::new(),
    }
}

impl ExtractError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedInput {
            document: None,
            reason: reason.into(),
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Attach the offending document to a `MalformedInput` error that was
    /// raised without one. Other variants pass through unchanged.
    pub fn for_document(self, id: &DocumentId) -> Self {
        match self {
            Self::MalformedInput {
                document: None,
                reason,
            } => Self::MalformedInput {
                document: Some(id.clone()),
                reason,
            },
            other => other,
        }
    }

    pub fn is_malformed_input(&self) -> bool {
        matches!(self, Self::MalformedInput { .. })
    }

    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration { .. })
    }
}

/// Id range of a chunk that reached disk, used to report progress on failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkRange {
    pub layer: Option<usize>,
    pub first: DocumentId,
    pub last: DocumentId,
}

impl fmt::Display for ChunkRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.layer {
            Some(layer) => write!(f, "layer {layer} [{}..{}]", self.first, self.last),
            None => write!(f, "[{}..{}]", self.first, self.last),
        }
    }
}

/// Failure of a whole pipeline run.
///
/// `last_flushed` is the most recent chunk written before the failure; every
/// document after it (in dataset order, within that layer) must be
/// re-extracted by the caller.
#[derive(Debug, Error)]
#[error("extraction halted, last flushed chunk: {}", describe_last(.last_flushed))]
pub struct RunError {
    pub last_flushed: Option<ChunkRange>,
    #[source]
    pub source: ExtractError,
}

fn describe_last(last: &Option<ChunkRange>) -> String {
    match last {
        Some(range) => range.to_string(),
        None => "none".to_string(),
    }
}
