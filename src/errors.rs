use thiserror::Error;

/// Coarse classification used by the pipeline executor and in operation logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Conflict,
    PolicyViolation,
    TransportFailure,
    IntegrityWarning,
    FatalLocalFailure,
}

#[derive(Error, Debug)]
pub enum VaultError {
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Policy violation: {0}")]
    PolicyViolation(String),

    #[error("Remote transfer failed: {0}")]
    Transport(String),

    #[error("Integrity check failed: {0}")]
    Integrity(String),

    #[error("Local failure: {0}")]
    FatalLocal(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("URL parsing error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("HTTP request error: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("Serde JSON error: {0}")]
    SerdeJson(#[from] serde_json::Error),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl VaultError {
    pub fn class(&self) -> ErrorClass {
        match self {
            VaultError::Conflict(_) => ErrorClass::Conflict,
            VaultError::PolicyViolation(_) => ErrorClass::PolicyViolation,
            VaultError::Transport(_) | VaultError::Reqwest(_) => ErrorClass::TransportFailure,
            VaultError::Integrity(_) => ErrorClass::IntegrityWarning,
            VaultError::Sqlx(_) => ErrorClass::IntegrityWarning,
            _ => ErrorClass::FatalLocalFailure,
        }
    }
}

/// Wraps an S3 SDK error (or any other remote client error) as a transport failure.
pub fn transport<E: std::fmt::Display>(context: &str, err: E) -> VaultError {
    VaultError::Transport(format!("{}: {}", context, err))
}

pub type Result<T> = std::result::Result<T, VaultError>;
