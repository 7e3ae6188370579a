//! Typed error conditions callers need to tell apart.
//!
//! Everything else travels as a plain `anyhow::Error`; these variants are
//! wrapped inside it and recovered with `err.downcast_ref::<SaeError>()`.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SaeError {
    /// The activation source produced vectors of the wrong width.
    /// Always a configuration bug, never retried.
    #[error("activation width mismatch: config expects {expected}, source produced {actual}")]
    WidthMismatch { expected: usize, actual: usize },

    /// The token corpus ran out before a refresh could be completed.
    #[error(
        "token corpus exhausted: cursor at sequence {cursor}, needed {needed} more, {available} available"
    )]
    CorpusExhausted {
        cursor: usize,
        needed: usize,
        available: usize,
    },

    /// Configuration values are inconsistent or out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A saved version is missing one of its two files.
    #[error("artifact version {version} incomplete: {path} not found")]
    MissingArtifact { version: u32, path: String },

    /// Parameter file and sidecar config disagree.
    #[error("artifact mismatch: {0}")]
    ArtifactMismatch(String),
}

/// Shorthand for bailing out with [`SaeError::InvalidConfig`].
pub(crate) fn invalid_config(msg: impl Into<String>) -> anyhow::Error {
    SaeError::InvalidConfig(msg.into()).into()
}
