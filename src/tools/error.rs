use thiserror::Error;

/// Failures that prevent a backend from producing an operation outcome at all.
///
/// Operation outcomes (file not found, ambiguous edit, invalid regex, ...) are
/// never reported through this type; they are values inside the result records.
/// A `BackendError` means the command channel itself broke: a pipe failed, the
/// remote agent went away, stored data could not be decoded.
#[derive(Error, Debug)]
pub enum BackendError {
    // ============ Execution channel ============
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // ============ Data ============
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // ============ Configuration ============
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    #[error("Backend error: {0}")]
    Other(String),
}

impl From<String> for BackendError {
    fn from(s: String) -> Self {
        BackendError::Other(s)
    }
}
