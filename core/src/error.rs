use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("server answered {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("storage error: {0}")]
    Storage(String),
    #[error("io error: {0}")]
    Io(String),
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("operation cancelled")]
    Cancelled,
}

impl CoreError {
    /// Transient failures go back into a chunk's retry budget; everything else
    /// ends the chunk immediately.
    pub fn is_retryable(&self) -> bool {
        match self {
            CoreError::Network(_) | CoreError::Timeout(_) => true,
            CoreError::HttpStatus { status, .. } => {
                *status >= 500 || matches!(*status, 408 | 416 | 429)
            }
            _ => false,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, CoreError::Cancelled)
    }
}

impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> Self {
        CoreError::Io(err.to_string())
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
