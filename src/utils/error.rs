use thiserror::Error;

/// Unified error type for every pipeline component.
///
/// Transient backend failures keep their source error so callers can decide
/// between retry-with-backoff and giving up; configuration and startup
/// problems are fatal by contract (the process exits 1).
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("startup error: {0}")]
    Startup(String),

    #[error("source database error: {0}")]
    SourceDb(#[from] mysql_async::Error),

    #[error("anomaly store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("stream error: {0}")]
    Stream(#[from] redis::RedisError),

    #[error("archive error: {0}")]
    Archive(#[from] polars::prelude::PolarsError),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("model error: {0}")]
    Model(String),

    #[error("timed out: {0}")]
    Timeout(String),
}

pub type PipelineResult<T> = Result<T, PipelineError>;

impl PipelineError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn startup(msg: impl Into<String>) -> Self {
        Self::Startup(msg.into())
    }

    pub fn model(msg: impl Into<String>) -> Self {
        Self::Model(msg.into())
    }

    /// Whether the error is worth retrying with backoff (backend hiccup)
    /// as opposed to a permanent local failure.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::SourceDb(_) | Self::Store(_) | Self::Stream(_) | Self::Io(_) | Self::Timeout(_)
        )
    }
}
