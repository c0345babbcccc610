use thiserror::Error;

use crate::image::Format;

/// I/O errors raised by range readers over local or remote storage
#[derive(Debug, Clone, Error)]
pub enum IoError {
    /// Error from S3 or S3-compatible storage
    #[error("S3 error: {0}")]
    S3(String),

    /// Requested range exceeds resource bounds
    #[error("Range out of bounds: requested {requested} bytes at offset {offset}, size is {size}")]
    RangeOutOfBounds {
        offset: u64,
        requested: u64,
        size: u64,
    },

    /// Network or connection error
    #[error("Connection error: {0}")]
    Connection(String),

    /// Local filesystem error
    #[error("File error: {0}")]
    File(String),

    /// Object not found
    #[error("Object not found: {0}")]
    NotFound(String),
}

/// Errors raised while locating or reading a source image
#[derive(Debug, Clone, Error)]
pub enum SourceError {
    /// The backing object does not exist
    #[error("Source not found: {0}")]
    NotFound(String),

    /// The backing object exists but cannot be read
    #[error("Access denied: {0}")]
    AccessDenied(String),

    /// Any other failure while talking to the backend
    #[error("Source I/O error: {0}")]
    Io(String),

    /// The lookup strategy could not produce a location
    #[error("Lookup failed: {0}")]
    Lookup(String),
}

impl From<std::io::Error> for SourceError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => SourceError::NotFound(err.to_string()),
            std::io::ErrorKind::PermissionDenied => SourceError::AccessDenied(err.to_string()),
            _ => SourceError::Io(err.to_string()),
        }
    }
}

impl From<IoError> for SourceError {
    fn from(err: IoError) -> Self {
        match err {
            IoError::NotFound(path) => SourceError::NotFound(path),
            other => SourceError::Io(other.to_string()),
        }
    }
}

/// Errors raised by derivative and source caches
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    #[error("Cache I/O error: {0}")]
    Io(String),

    /// A stored record could not be encoded or decoded
    #[error("Cache serialization error: {0}")]
    Serialization(String),

    #[error("{0} cache is disabled")]
    Disabled(&'static str),
}

impl From<std::io::Error> for CacheError {
    fn from(err: std::io::Error) -> Self {
        CacheError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        CacheError::Serialization(err.to_string())
    }
}

/// Operations that are not valid against the actual image
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("Crop region ({x}, {y}) lies outside the {width}x{height} image")]
    CropOutOfBounds {
        x: u32,
        y: u32,
        width: u32,
        height: u32,
    },

    #[error("Region has zero width or height")]
    EmptyRegion,

    #[error("Operation list has no encode operation")]
    MissingEncode,

    #[error("Invalid scale: {0}")]
    InvalidScale(String),

    #[error("Unsupported rotation: {0} degrees")]
    UnsupportedRotation(f64),

    #[error("Page {page} is out of range (image has {count} pages)")]
    PageOutOfRange { page: usize, count: usize },
}

/// Errors raised when mutating an operation list
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OperationError {
    #[error("Operation list is frozen")]
    Frozen,
}

/// Errors raised by processors
#[derive(Debug, Clone, Error)]
pub enum ProcessorError {
    /// The content does not match the format the processor was created for.
    ///
    /// This is recoverable: the caller should try its next format candidate.
    #[error("Source format mismatch: expected {expected}, content looks like {detected}")]
    SourceFormatMismatch { expected: Format, detected: Format },

    #[error("Unsupported source format: {0}")]
    UnsupportedSourceFormat(Format),

    #[error("Unsupported output format: {0}")]
    UnsupportedOutputFormat(Format),

    /// Processor was used before `set_input`
    #[error("Processor has no input")]
    NoInput,

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Encode error: {0}")]
    Encode(String),

    #[error("Processor I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for ProcessorError {
    fn from(err: std::io::Error) -> Self {
        ProcessorError::Io(err.to_string())
    }
}

impl From<SourceError> for ProcessorError {
    fn from(err: SourceError) -> Self {
        ProcessorError::Io(err.to_string())
    }
}

impl From<IoError> for ProcessorError {
    fn from(err: IoError) -> Self {
        ProcessorError::Io(err.to_string())
    }
}

/// Request-level error taxonomy surfaced by the request handlers.
///
/// Every variant keeps the kind of the failure that caused it so a front
/// controller can map it to a response code.
#[derive(Debug, Clone, Error)]
pub enum RequestError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Access denied: {0}")]
    AccessDenied(String),

    /// No inferred format could be read by any processor
    #[error("No readable source format: {0}")]
    SourceFormat(String),

    #[error("Invalid request: {0}")]
    Validation(#[from] ValidationError),

    #[error("Illegal argument: {0}")]
    IllegalArgument(String),

    #[error("Processing error: {0}")]
    Processing(String),

    #[error("I/O error: {0}")]
    Io(String),

    /// No data path exists between the source and the processor
    #[error("Incompatible source and processor: {0}")]
    Incompatible(String),

    #[error("The source cache is required by {0} but is not enabled")]
    SourceCacheDisabled(String),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Forbidden: {0}")]
    Forbidden(String),
}

impl From<SourceError> for RequestError {
    fn from(err: SourceError) -> Self {
        match err {
            SourceError::NotFound(msg) => RequestError::NotFound(msg),
            SourceError::AccessDenied(msg) => RequestError::AccessDenied(msg),
            SourceError::Io(msg) => RequestError::Io(msg),
            SourceError::Lookup(msg) => RequestError::Io(format!("lookup failed: {}", msg)),
        }
    }
}

impl From<ProcessorError> for RequestError {
    fn from(err: ProcessorError) -> Self {
        match err {
            ProcessorError::UnsupportedSourceFormat(_) => RequestError::SourceFormat(err.to_string()),
            ProcessorError::UnsupportedOutputFormat(_) => {
                RequestError::IllegalArgument(err.to_string())
            }
            ProcessorError::Io(msg) => RequestError::Io(msg),
            other => RequestError::Processing(other.to_string()),
        }
    }
}

impl From<OperationError> for RequestError {
    fn from(err: OperationError) -> Self {
        RequestError::Processing(err.to_string())
    }
}

impl From<std::io::Error> for RequestError {
    fn from(err: std::io::Error) -> Self {
        RequestError::Io(err.to_string())
    }
}
