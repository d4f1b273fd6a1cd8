use thiserror::Error;

use crate::models::AnalysisResult;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not authorized: {0}")]
    Unauthorized(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error(
        "Code rejected due to security concerns (score {}/100)",
        .0.security_score
    )]
    SecurityRejected(Box<AnalysisResult>),

    #[error("Build error: {message}")]
    Build { message: String, output: String },

    #[error("Runtime error: {message}")]
    Runtime { message: String, output: String },

    #[error("Integrity check failed: ciphertext was tampered with or the key does not match")]
    Tamper,

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Risk assessor error: {0}")]
    Assessor(String),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("JSON serialization error: {0}")]
    JsonSerialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    pub fn build(message: impl Into<String>) -> Self {
        Error::Build {
            message: message.into(),
            output: String::new(),
        }
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Error::Runtime {
            message: message.into(),
            output: String::new(),
        }
    }

    /// Attach output captured before a build or runtime failure.
    pub fn with_output(self, captured: impl Into<String>) -> Self {
        match self {
            Error::Build { message, .. } => Error::Build {
                message,
                output: captured.into(),
            },
            Error::Runtime { message, .. } => Error::Runtime {
                message,
                output: captured.into(),
            },
            other => other,
        }
    }

    /// Output captured before the failure, if any.
    pub fn captured_output(&self) -> Option<&str> {
        match self {
            Error::Build { output, .. } | Error::Runtime { output, .. } if !output.is_empty() => {
                Some(output)
            }
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
