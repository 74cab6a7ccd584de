//! Error taxonomy shared by every ingestion crate.

use crate::ids::BuildId;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The inbound payload could not be decoded or lacks a required field.
    #[error("malformed input: {0}")]
    Malformed(String),

    /// A second writer disagrees with the stored control entry.
    #[error("inconsistent control entry for build {build}: {reason}")]
    Inconsistent { build: BuildId, reason: String },

    /// The task can never succeed, e.g. its partition time is out of range.
    #[error("fatal: {0}")]
    Fatal(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("unsupported test variant status: {0}")]
    UnsupportedStatus(String),

    /// A collaborator (RPC, queue) is temporarily unavailable.
    #[error("transient: {0}")]
    Transient(String),

    #[error("storage error: {message}")]
    Storage {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl Error {
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            source: None,
        }
    }

    pub fn storage_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Storage {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Whether redelivering the same input may succeed.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Error::Transient(_) | Error::Storage { .. })
    }
}
