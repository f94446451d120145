//! Error types for the Stitch server outside the upload pipeline

use thiserror::Error;

/// Application-wide result type
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("S3 error: {0}")]
    S3(#[from] S3Error),
}

/// S3-specific errors
#[derive(Error, Debug)]
pub enum S3Error {
    #[error("Object not found: {0}")]
    ObjectNotFound(String),

    #[error("Presigning failed: {0}")]
    PresignFailed(String),

    #[error("S3 SDK error: {0}")]
    SdkError(String),
}
