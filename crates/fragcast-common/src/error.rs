//! Error types for fragcast-common.

use thiserror::Error;

/// Result type for fragcast-common operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for the fallible public surfaces of the pipeline.
///
/// Framing problems inside the demultiplexers are never surfaced as
/// errors; they resynchronize locally with a diagnostic. This enum only
/// covers the hard boundaries: wire tag decoding and container format
/// detection.
#[derive(Debug, Error)]
pub enum Error {
    /// Packed tag shorter than its declared layout.
    #[error("truncated tag: need {need} bytes, have {have}")]
    TruncatedTag { need: usize, have: usize },

    /// Codec id not representable in the canonical model.
    #[error("unsupported codec id {0}")]
    UnsupportedCodec(u8),

    /// Input bytes match none of the known container formats.
    #[error("unrecognized container format")]
    UnknownFormat,
}
