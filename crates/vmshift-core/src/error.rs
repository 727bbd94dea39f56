//! Error types for the vmshift core library.

use std::path::PathBuf;

/// The main error type for vmshift operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error with optional path context.
    #[error("I/O error{}: {source}", path.as_ref().map(|p| format!(" at '{}'", p.display())).unwrap_or_default())]
    Io {
        source: std::io::Error,
        path: Option<PathBuf>,
    },

    /// The disk prober found no recognized magic or structure.
    #[error("unknown disk image format: {message}")]
    UnknownFormat { message: String },

    /// No configuration codec accepted the input.
    #[error("unrecognized configuration format")]
    UnrecognizedFormat,

    /// A required structural element is missing or broken.
    #[error("malformed structure: {message}")]
    MalformedStructure { message: String },

    /// The document parsed but does not conform to its versioned schema.
    #[error("schema validation failed for version {version}: {message}")]
    SchemaValidation { version: String, message: String },

    /// The document declares a schema version with no entry in the schema table.
    #[error("unsupported schema version: {version}")]
    UnsupportedSchemaVersion { version: String },

    /// XML tokenizer or writer failure.
    #[error("XML error: {message}")]
    Xml { message: String },

    /// A caller passed an argument outside the accepted domain.
    #[error("invalid argument: {message}")]
    InvalidArgument { message: String },

    /// An operating system catalog could not be loaded.
    #[error("catalog error: {message}")]
    Catalog { message: String },
}

/// A specialized Result type for vmshift operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create an I/O error with path context.
    pub fn io(source: std::io::Error, path: impl Into<PathBuf>) -> Self {
        Self::Io {
            source,
            path: Some(path.into()),
        }
    }

    /// Create an I/O error without path context.
    pub fn io_simple(source: std::io::Error) -> Self {
        Self::Io { source, path: None }
    }

    /// Create an unknown disk format error.
    pub fn unknown_format(message: impl Into<String>) -> Self {
        Self::UnknownFormat {
            message: message.into(),
        }
    }

    /// Create a malformed structure error.
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedStructure {
            message: message.into(),
        }
    }

    /// Create a schema validation error.
    pub fn schema(version: impl Into<String>, message: impl Into<String>) -> Self {
        Self::SchemaValidation {
            version: version.into(),
            message: message.into(),
        }
    }

    /// Create an unsupported schema version error.
    pub fn unsupported_version(version: impl Into<String>) -> Self {
        Self::UnsupportedSchemaVersion {
            version: version.into(),
        }
    }

    /// Create an XML error.
    pub fn xml(message: impl Into<String>) -> Self {
        Self::Xml {
            message: message.into(),
        }
    }

    /// Create an invalid argument error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Create a catalog error.
    pub fn catalog(message: impl Into<String>) -> Self {
        Self::Catalog {
            message: message.into(),
        }
    }

    /// Whether this error is an I/O failure rather than a format rejection.
    pub fn is_io(&self) -> bool {
        matches!(self, Self::Io { .. })
    }
}

impl From<std::io::Error> for Error {
    fn from(source: std::io::Error) -> Self {
        Self::io_simple(source)
    }
}
