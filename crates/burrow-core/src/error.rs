use crate::shortcode::ShortCode;
use thiserror::Error;

/// Result type for repository operations.
pub type Result<T> = std::result::Result<T, StorageError>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CoreError {
    #[error("invalid short code: {0}")]
    InvalidShortCode(String),
}

/// Errors returned by short code generators.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GeneratorError {
    #[error("random source failed: {0}")]
    Entropy(String),
    #[error("clock reports a time before the unix epoch: {0}us")]
    ClockBeforeEpoch(i64),
    #[error("generator exhausted: {0}")]
    Exhausted(String),
}

/// Coarse classification of a [`StorageError`].
///
/// Request-layer collaborators branch on this rather than on the concrete
/// variant: a duplicate still carries a usable code, everything
/// `Unclassified` is a hard failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    DuplicateUrl,
    BackendUnavailable,
    Unclassified,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("short url not found: {0}")]
    NotFound(String),
    #[error("short url already exists: {0}")]
    AlreadyExists(String),
    #[error("long url {url} is already shortened as {existing}")]
    Duplicate { url: String, existing: ShortCode },
    #[error("storage backend unavailable: {0}")]
    Unavailable(String),
    #[error("storage operation timed out: {0}")]
    Timeout(String),
    #[error("storage query failed: {0}")]
    Query(String),
    #[error("stored data is invalid: {0}")]
    InvalidData(String),
    #[error("journal i/o failed: {0}")]
    Io(String),
    #[error("short url generation failed: {0}")]
    Generator(#[from] GeneratorError),
}

impl StorageError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StorageError::NotFound(_) => ErrorKind::NotFound,
            StorageError::AlreadyExists(_) => ErrorKind::AlreadyExists,
            StorageError::Duplicate { .. } => ErrorKind::DuplicateUrl,
            StorageError::Unavailable(_) => ErrorKind::BackendUnavailable,
            StorageError::Timeout(_)
            | StorageError::Query(_)
            | StorageError::InvalidData(_)
            | StorageError::Io(_)
            | StorageError::Generator(_) => ErrorKind::Unclassified,
        }
    }

    /// Returns `true` if the long URL already had a live short code.
    pub fn is_duplicate(&self) -> bool {
        matches!(self, StorageError::Duplicate { .. })
    }

    /// The pre-existing short code carried by a duplicate classification.
    pub fn existing_code(&self) -> Option<&ShortCode> {
        match self {
            StorageError::Duplicate { existing, .. } => Some(existing),
            _ => None,
        }
    }
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::Io(err.to_string())
    }
}
