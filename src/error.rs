use thiserror::Error;

/// Errors raised by the interaction head and its operators.
#[derive(Debug, Error)]
pub enum HoiError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("memory budget exhausted: {0}")]
    ResourceExhausted(String),

    #[error("training requires ground-truth targets: {0}")]
    MissingTargets(String),

    #[error("internal consistency fault: {0}")]
    InternalConsistency(String),

    #[error("failed to read file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse json: {0}")]
    Parse(#[from] serde_json::Error),
}

impl HoiError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        HoiError::InvalidArgument(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, HoiError>;
