use thiserror::Error;

/// The error surface the cache exposes to its callers. Loader implementations map their
/// own failures onto this, so resource specific error types never cross the cache boundary.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AssetError {
    #[error("out of memory")]
    OutOfMemory,
    #[error("access denied")]
    AccessDenied,
    #[error("resource not found")]
    NotFound,
    /// Catch-all for loader failures the cache does not understand.
    #[error("unexpected loader failure: {0}")]
    Unexpected(String),
}

impl From<std::io::Error> for AssetError {
    fn from(value: std::io::Error) -> Self {
        match value.kind() {
            std::io::ErrorKind::NotFound => AssetError::NotFound,
            std::io::ErrorKind::PermissionDenied => AssetError::AccessDenied,
            std::io::ErrorKind::OutOfMemory => AssetError::OutOfMemory,
            _ => AssetError::Unexpected(value.to_string()),
        }
    }
}
