//! Error types for ipwatch.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Service not found: {0}")]
    ServiceNotFound(String),

    #[error("Service {name} is not a {expected}")]
    ServiceTypeMismatch { name: String, expected: &'static str },

    #[error("Service already instantiated: {0}")]
    ServiceAlreadyInstantiated(String),

    #[error("Service dependency cycle: {0}")]
    ServiceCycle(String),

    #[error("Unknown source: {0}")]
    UnknownSource(String),

    #[error("Collection disabled for source {0}")]
    CollectionDisabled(String),

    #[error("Collection already running for source {source_name} (run {run_id})")]
    CollectionInProgress { source_name: String, run_id: String },

    #[error("Source {source_name} is backing off until {retry_at}")]
    CollectionBackoff {
        source_name: String,
        retry_at: chrono::DateTime<chrono::Utc>,
    },

    #[error("Scheduled collection halted for source {0} until a manual run succeeds")]
    CollectionHalted(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Ingest error: {0}")]
    Ingest(String),

    #[error("Cache unavailable: {0}")]
    CacheUnavailable(String),

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Coarse classification recorded on failed runs and in source state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Authentication,
    Transport,
    Parse,
    Ingest,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Authentication => "authentication",
            Self::Transport => "transport",
            Self::Parse => "parse",
            Self::Ingest => "ingest",
            Self::Internal => "internal",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "authentication" => Some(Self::Authentication),
            "transport" => Some(Self::Transport),
            "parse" => Some(Self::Parse),
            "ingest" => Some(Self::Ingest),
            "internal" => Some(Self::Internal),
            _ => None,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Error {
    /// Classify a collection failure.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Authentication(_) => ErrorKind::Authentication,
            Self::Transport(_) | Self::Io(_) => ErrorKind::Transport,
            Self::Parse(_) | Self::Json(_) => ErrorKind::Parse,
            Self::Ingest(_) | Self::Database(_) | Self::StoreUnavailable(_) => ErrorKind::Ingest,
            _ => ErrorKind::Internal,
        }
    }

    /// Whether the scheduler may retry the failed collection on its own.
    pub fn is_retryable(&self) -> bool {
        !matches!(self.kind(), ErrorKind::Parse)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
