//! Error types for compression and decompression.

use thiserror::Error;

/// Result type alias for codec operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Codec error types.
///
/// None of these are recoverable inside the codec: any of them aborts the
/// whole compress or decompress operation.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid input to a numeric function (empty tensor, non-positive maximum).
    #[error("domain error: {0}")]
    Domain(String),

    /// Archive and model disagree structurally.
    #[error("layer mismatch for '{layer}': {reason}")]
    LayerMismatch { layer: String, reason: String },

    /// Archive header carries a format version this build cannot decode.
    #[error("unsupported archive format version {found} (expected {expected})")]
    UnsupportedVersion { found: i64, expected: i64 },

    /// Archive header carries a bit width other than the fixed one.
    #[error("unsupported bit width {found} (expected {expected})")]
    UnsupportedBitWidth { found: i64, expected: i64 },

    /// A required archive entry is absent.
    #[error("missing archive entry '{0}'")]
    MissingKey(String),

    /// The same key was written twice into one archive.
    #[error("duplicate archive entry '{0}'")]
    DuplicateKey(String),

    /// An entry exists but holds the wrong kind of value.
    #[error("invalid archive entry '{key}': expected {expected}")]
    InvalidEntry { key: String, expected: &'static str },

    /// Archive bytes could not be parsed.
    #[error("corrupted archive: {0}")]
    CorruptedArchive(String),

    /// Model file could not be parsed or failed validation.
    #[error("model error: {0}")]
    Model(String),

    /// Encoding or decoding of a structured value failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// I/O error from the underlying file or stream.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a domain error.
    pub fn domain(message: impl Into<String>) -> Self {
        Error::Domain(message.into())
    }

    /// Create a layer mismatch error.
    pub fn layer_mismatch(layer: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::LayerMismatch {
            layer: layer.into(),
            reason: reason.into(),
        }
    }

    /// Create a missing key error.
    pub fn missing_key(key: impl Into<String>) -> Self {
        Error::MissingKey(key.into())
    }

    /// Create a corrupted archive error.
    pub fn corrupted(message: impl Into<String>) -> Self {
        Error::CorruptedArchive(message.into())
    }

    /// Create a model error.
    pub fn model(message: impl Into<String>) -> Self {
        Error::Model(message.into())
    }

    /// Get error category for log fields.
    pub fn category(&self) -> &'static str {
        match self {
            Error::Domain(_) => "domain",
            Error::LayerMismatch { .. } => "layer_mismatch",
            Error::UnsupportedVersion { .. } => "unsupported_version",
            Error::UnsupportedBitWidth { .. } => "unsupported_bit_width",
            Error::MissingKey(_) => "missing_key",
            Error::DuplicateKey(_) => "duplicate_key",
            Error::InvalidEntry { .. } => "invalid_entry",
            Error::CorruptedArchive(_) => "corrupted_archive",
            Error::Model(_) => "model",
            Error::Serialization(_) => "serialization",
            Error::Io(_) => "io_error",
        }
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}
