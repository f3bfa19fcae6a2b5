//! Error types at the crate's seams.
//!
//! Persistence problems travel as `anyhow::Error` (with context) the same way the
//! database layer reports them; the enums below cover the failures callers are
//! expected to branch on.

use thiserror::Error;

use crate::models::StreamKind;

/// Remote endpoint unreachable or refusing a batch. Always retried by the sender.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("{endpoint} is unavailable")]
    Unavailable { endpoint: String },

    #[error("{endpoint} rejected batch with status {status}")]
    Rejected { endpoint: String, status: u16 },

    #[error("request to {endpoint} failed: {source}")]
    Http {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("no delivery channel accepted the batch ({attempts} attempted)")]
    Exhausted { attempts: usize },
}

/// Vector store failures.
#[derive(Debug, Error)]
pub enum IndexError {
    #[error("vector index unavailable: {0}")]
    Unavailable(String),

    #[error("point {0} not found")]
    NotFound(String),

    #[error("vector dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("collection {0} has not been created")]
    MissingCollection(String),

    #[error("invalid payload field '{0}'")]
    InvalidField(String),

    #[error("unexpected response from vector index: {0}")]
    Protocol(String),

    #[error("vector index storage error: {0:#}")]
    Storage(#[from] anyhow::Error),
}

impl From<reqwest::Error> for IndexError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_connect() || err.is_timeout() {
            IndexError::Unavailable(err.to_string())
        } else {
            IndexError::Protocol(err.to_string())
        }
    }
}

impl From<serde_json::Error> for IndexError {
    fn from(err: serde_json::Error) -> Self {
        IndexError::Protocol(err.to_string())
    }
}

/// An incoming reading that cannot be used as-is.
#[derive(Debug, Error)]
pub enum MalformedRecord {
    #[error("{stream:?} record is not a JSON object")]
    NotAnObject { stream: StreamKind },

    #[error("{stream:?} record has a bad shape: {reason}")]
    Shape { stream: StreamKind, reason: String },

    #[error("unparseable timestamp '{0}'")]
    Timestamp(String),
}
