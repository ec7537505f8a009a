//! Error types for the extraction pipeline.

/// Fatal errors surfaced by the pipeline.
///
/// Per-file materialization failures are deliberately absent: the scheduler
/// swallows them, logs a warning and continues with the remaining entries.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Wrong magic, truncated structure, a missing TOC entry or an
    /// impossible length field.
    #[error("malformed archive: {0}")]
    MalformedArchive(&'static str),

    /// A decompressor returned failure or the wrong output size.
    #[error("{codec} decode failed: {reason}")]
    Decode {
        codec: &'static str,
        reason: String,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The consumer went away while work was still being submitted.
    #[error("extraction cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, Error>;
