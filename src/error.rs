//! Error types shared across the pipeline.
//!
//! Every stage operation reports failure through [`Error`]; the driver logs a
//! structured record (severity, origin stage, message) and applies the
//! propagation policy: request-time failures skip to the next work index,
//! report-time failures abort the whole pipeline update.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Missing or contradictory stage properties, malformed regexes,
    /// unknown property names.
    #[error("configuration error: {0}")]
    Config(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Binary stream underrun or a malformed serialized payload.
    #[error("stream error: {0}")]
    Stream(String),

    /// Inconsistent calendars, absent variables, out-of-domain bounds,
    /// dimension mismatches.
    #[error("semantic error: {0}")]
    Semantic(String),

    /// A task-pool worker or a collective operation failed to produce
    /// its result.
    #[error("resource error: {0}")]
    Resource(String),
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    pub fn stream(msg: impl Into<String>) -> Self {
        Error::Stream(msg.into())
    }

    pub fn semantic(msg: impl Into<String>) -> Self {
        Error::Semantic(msg.into())
    }

    pub fn resource(msg: impl Into<String>) -> Self {
        Error::Resource(msg.into())
    }
}
