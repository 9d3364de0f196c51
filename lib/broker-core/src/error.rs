use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoreError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Unavailable: {0}")]
    Unavailable(String),

    #[error("Malformed frame: {0}")]
    Malformed(String),
}

impl CoreError {
    /// Negative result code carried in control replies
    pub fn code(&self) -> i32 {
        match self {
            CoreError::InvalidArgument(_) => -1,
            CoreError::NotFound(_) => -2,
            CoreError::AlreadyExists(_) => -3,
            CoreError::Internal(_) => -4,
            CoreError::Unavailable(_) => -5,
            CoreError::Malformed(_) => -6,
        }
    }

    /// Short label used for metrics and logs
    pub fn kind(&self) -> &'static str {
        match self {
            CoreError::InvalidArgument(_) => "invalid_argument",
            CoreError::NotFound(_) => "not_found",
            CoreError::AlreadyExists(_) => "already_exists",
            CoreError::Internal(_) => "internal",
            CoreError::Unavailable(_) => "unavailable",
            CoreError::Malformed(_) => "malformed",
        }
    }
}
