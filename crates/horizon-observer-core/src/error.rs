//! Error types for Horizon Observer core.

use std::io;

/// Errors that can occur during object registry operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ObjectError {
    /// The object ID is invalid or has been destroyed.
    #[error("Invalid or destroyed object ID")]
    InvalidObjectId,
    /// The property was not found.
    #[error("Property '{0}' not found")]
    PropertyNotFound(String),
    /// The stored property has a different kind than requested.
    #[error("Property '{name}' kind mismatch: expected {expected}, found {found}")]
    PropertyKindMismatch {
        /// The property name.
        name: String,
        /// The expected kind.
        expected: &'static str,
        /// The kind actually stored.
        found: &'static str,
    },
    /// The property is not valid (for example, it has an empty name).
    #[error("Property is invalid")]
    InvalidProperty,
}

/// Result type for object operations.
pub type ObjectResult<T> = std::result::Result<T, ObjectError>;

/// Errors raised while exporting or importing property envelopes.
///
/// Any `CodecError` returned from an import corresponds to a *failed*
/// import: nothing was written to the target object.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The object to export from or import into does not exist.
    #[error("Invalid or destroyed object ID")]
    InvalidObject,
    /// The envelope marker is missing or corrupt.
    #[error("Envelope marker mismatch: expected {expected:#010x}, found {found:#010x}")]
    MissingMarker {
        /// The marker the envelope must carry.
        expected: u32,
        /// The value found in its place.
        found: u32,
    },
    /// The encoded export version is outside the supported range.
    #[error("Unsupported export version {version} (supported: {min}..={max})")]
    UnsupportedVersion {
        /// The version found in the stream.
        version: u32,
        /// Oldest supported version.
        min: u32,
        /// Newest supported version.
        max: u32,
    },
    /// Reading or writing the underlying stream failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// A string in the stream is not valid UTF-8.
    #[error("Invalid UTF-8 in property stream")]
    InvalidUtf8,
    /// A variant tag in the stream is unknown.
    #[error("Unknown variant tag {0}")]
    UnknownVariantTag(u8),
    /// The XML parser or writer failed.
    #[error("XML error: {0}")]
    Xml(String),
    /// The document structure does not match the envelope format.
    #[error("Malformed property document: {0}")]
    MalformedDocument(String),
}

impl CodecError {
    /// Create a malformed document error.
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedDocument(message.into())
    }

    /// Create an XML error from any displayable parser/writer error.
    pub fn xml(err: impl std::fmt::Display) -> Self {
        Self::Xml(err.to_string())
    }
}

/// Result type for export/import operations.
pub type CodecResult<T> = std::result::Result<T, CodecError>;
