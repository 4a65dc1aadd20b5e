// src/error.rs
// Error kinds shared across the defense pipeline. Components never let these
// cross a service boundary raw; handlers map them to plain 403/500 or
// structured JSON.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Missing or invalid required configuration. Fatal at startup.
    #[error("configuration error: {0}")]
    Config(String),

    /// Transient state-store failure. Classification reads fail open;
    /// enforcement writes propagate so the caller can retry or alert.
    #[error("state store error: {0}")]
    StateStore(String),

    /// Markov store failure (open, schema, or query).
    #[error("markov store error: {0}")]
    Markov(String),

    /// Classifier artifact missing or invalid when one is configured.
    #[error("model artifact error: {0}")]
    Artifact(String),

    /// External HTTP failure (reputation, LLM, community list, alert
    /// channel). The affected step is skipped and the pipeline continues.
    #[error("upstream error: {0}")]
    Upstream(String),

    /// Internal inconsistency in a decision payload. The request is treated
    /// as suspicious with no enforcement.
    #[error("decision error: {0}")]
    Decision(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<redis::RedisError> for Error {
    fn from(err: redis::RedisError) -> Self {
        Error::StateStore(err.to_string())
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::Markov(err.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::Upstream(err.to_string())
    }
}

impl Error {
    /// Process exit code for startup failures.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Config(_) => 1,
            Error::StateStore(_) => 2,
            Error::Markov(_) | Error::Artifact(_) => 3,
            _ => 1,
        }
    }
}
