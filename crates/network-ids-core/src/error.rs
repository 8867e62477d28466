//! Crate-wide error type

use thiserror::Error;

/// Errors produced by the detection pipeline.
///
/// Rule and enrichment failures are deliberately isolated kinds rather than
/// opaque strings: the detector counts and logs `Rule` errors instead of
/// propagating them, and the enricher downgrades an `Enrichment` error to "no
/// enrichment for this alert" rather than dropping the alert.
#[derive(Debug, Error)]
pub enum IdsError {
    #[error("capture error: {0}")]
    Capture(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("rule '{rule}' failed: {source}")]
    Rule {
        rule: &'static str,
        source: anyhow::Error,
    },

    #[error("alert sink '{sink}' failed: {source}")]
    Sink {
        sink: &'static str,
        source: anyhow::Error,
    },

    #[error("enrichment provider '{provider}' failed: {source}")]
    Enrichment {
        provider: &'static str,
        source: anyhow::Error,
    },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, IdsError>;
