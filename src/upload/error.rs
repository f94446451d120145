//! Error taxonomy for the upload pipeline
//!
//! Every category maps to an HTTP status and a stable machine code. Errors
//! raised while merging are wrapped in [`PipelineFailure`] so the caller also
//! learns which stage produced them.

use std::fmt;
use std::path::PathBuf;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Serialize;

// ============================================================================
// Categories
// ============================================================================

/// Missing or invalid caller input
#[derive(Debug, thiserror::Error)]
pub enum ParameterError {
    #[error("Missing key or fileName")]
    MissingParameters,

    #[error("Invalid {name}: {reason}")]
    InvalidParameter { name: &'static str, reason: String },

    #[error("File not found in request")]
    MissingChunkData,

    #[error("Chunk index missing: {0} has no numeric suffix and no index was given")]
    MissingChunkIndex(String),

    #[error("Chunk hash mismatch: expected {expected}, got {actual}")]
    ChunkHashMismatch { expected: String, actual: String },
}

/// Chunk write, list and delete failures
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Failed to create namespace {path}: {source}")]
    NamespaceCreationFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write chunk {path}: {source}")]
    StorageWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to list chunks in {path}: {source}")]
    ListFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to delete {path}: {source}")]
    DeleteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Malformed or incomplete chunk index set
#[derive(Debug, thiserror::Error)]
pub enum OrderingError {
    #[error("No chunks found")]
    NoChunksFound,

    #[error("Malformed chunk index in {identifier}")]
    MalformedChunkIndex { identifier: String },

    #[error("Incomplete chunk set: expected {expected} chunks, missing {missing:?}, duplicated {duplicates:?}")]
    IncompleteChunkSet {
        expected: u64,
        missing: Vec<u64>,
        duplicates: Vec<u64>,
    },
}

/// I/O failure while concatenating chunks
#[derive(Debug, thiserror::Error)]
pub enum MergeError {
    #[error("Failed to create output file {path}: {source}")]
    DestinationCreateFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to open chunk {index}: {source}")]
    ChunkOpenFailed {
        index: u64,
        partial: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to merge chunk {index} at byte offset {bytes_written}: {source}")]
    ChunkCopyFailed {
        index: u64,
        bytes_written: u64,
        partial: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Chunk {index} changed size during merge: expected {expected} bytes, copied {copied}")]
    ChunkSizeChanged {
        index: u64,
        expected: u64,
        copied: u64,
        partial: PathBuf,
    },

    #[error("Failed to finalize output file {path}: {source}")]
    FinalizeFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl MergeError {
    /// Partially written output left behind by this failure, if any
    pub fn partial_path(&self) -> Option<&PathBuf> {
        match self {
            Self::ChunkOpenFailed { partial, .. }
            | Self::ChunkCopyFailed { partial, .. }
            | Self::ChunkSizeChanged { partial, .. } => Some(partial),
            Self::FinalizeFailed { path, .. } => Some(path),
            Self::DestinationCreateFailed { .. } => None,
        }
    }
}

/// Remote rejection or transport failure
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("Failed to obtain transfer descriptor: {0}")]
    DescriptorUnavailable(String),

    #[error("Transfer descriptor expired at {0}")]
    DescriptorExpired(DateTime<Utc>),

    #[error("Remote store rejected upload with status {status}")]
    RemoteRejected { status: u16, body: String },

    #[error("Transfer failed: {cause}")]
    TransferFailed { cause: String },

    #[error("Remote object size mismatch: expected {expected} bytes, found {actual:?}")]
    VerificationFailed { expected: u64, actual: Option<u64> },
}

// ============================================================================
// Upload Error
// ============================================================================

/// Any error produced by the upload core
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error(transparent)]
    Parameter(#[from] ParameterError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Ordering(#[from] OrderingError),

    #[error(transparent)]
    Merge(#[from] MergeError),

    #[error(transparent)]
    Publish(#[from] PublishError),

    #[error("Merge already in progress for key: {0}")]
    MergeInProgress(String),
}

impl UploadError {
    /// Get HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Parameter(_) => StatusCode::BAD_REQUEST,
            Self::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Ordering(OrderingError::NoChunksFound) => StatusCode::NOT_FOUND,
            Self::Ordering(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Merge(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Publish(PublishError::DescriptorUnavailable(_)) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Publish(_) => StatusCode::BAD_GATEWAY,
            Self::MergeInProgress(_) => StatusCode::CONFLICT,
        }
    }

    /// Stable machine readable code
    pub fn code(&self) -> &'static str {
        match self {
            Self::Parameter(e) => match e {
                ParameterError::MissingParameters => "MISSING_PARAMETERS",
                ParameterError::InvalidParameter { .. } => "INVALID_PARAMETER",
                ParameterError::MissingChunkData => "MISSING_CHUNK_DATA",
                ParameterError::MissingChunkIndex(_) => "MISSING_CHUNK_INDEX",
                ParameterError::ChunkHashMismatch { .. } => "CHUNK_HASH_MISMATCH",
            },
            Self::Storage(e) => match e {
                StorageError::NamespaceCreationFailed { .. } => "NAMESPACE_CREATION_FAILED",
                StorageError::StorageWriteFailed { .. } => "STORAGE_WRITE_FAILED",
                StorageError::ListFailed { .. } => "STORAGE_LIST_FAILED",
                StorageError::DeleteFailed { .. } => "STORAGE_DELETE_FAILED",
            },
            Self::Ordering(e) => match e {
                OrderingError::NoChunksFound => "NO_CHUNKS_FOUND",
                OrderingError::MalformedChunkIndex { .. } => "MALFORMED_CHUNK_INDEX",
                OrderingError::IncompleteChunkSet { .. } => "INCOMPLETE_CHUNK_SET",
            },
            Self::Merge(e) => match e {
                MergeError::DestinationCreateFailed { .. } => "DESTINATION_CREATE_FAILED",
                MergeError::ChunkOpenFailed { .. } => "CHUNK_OPEN_FAILED",
                MergeError::ChunkCopyFailed { .. } => "CHUNK_COPY_FAILED",
                MergeError::ChunkSizeChanged { .. } => "CHUNK_SIZE_CHANGED",
                MergeError::FinalizeFailed { .. } => "FINALIZE_FAILED",
            },
            Self::Publish(e) => match e {
                PublishError::DescriptorUnavailable(_) => "DESCRIPTOR_UNAVAILABLE",
                PublishError::DescriptorExpired(_) | PublishError::TransferFailed { .. } => {
                    "TRANSFER_FAILED"
                }
                PublishError::RemoteRejected { .. } => "REMOTE_REJECTED",
                PublishError::VerificationFailed { .. } => "VERIFICATION_FAILED",
            },
            Self::MergeInProgress(_) => "MERGE_IN_PROGRESS",
        }
    }
}

// ============================================================================
// Pipeline Failure
// ============================================================================

/// Stage of a merge request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineStage {
    Validate,
    List,
    Order,
    Merge,
    Publish,
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Validate => "validate",
            Self::List => "list",
            Self::Order => "order",
            Self::Merge => "merge",
            Self::Publish => "publish",
        };
        f.write_str(name)
    }
}

/// A merge request that ended in `Failed`
#[derive(Debug, thiserror::Error)]
#[error("{stage} stage failed: {error}")]
pub struct PipelineFailure {
    pub stage: PipelineStage,
    #[source]
    pub error: UploadError,
}

impl PipelineFailure {
    pub fn new(stage: PipelineStage, error: impl Into<UploadError>) -> Self {
        Self {
            stage,
            error: error.into(),
        }
    }
}

// ============================================================================
// Error Response
// ============================================================================

#[derive(Serialize)]
struct ErrorResponse {
    success: bool,
    error: String,
    code: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    stage: Option<PipelineStage>,
}

fn error_response(error: &UploadError, stage: Option<PipelineStage>) -> Response {
    let status = error.status_code();
    if status.is_server_error() {
        tracing::error!(code = error.code(), stage = ?stage, "Upload error: {}", error);
    }

    let body = Json(ErrorResponse {
        success: false,
        error: error.to_string(),
        code: error.code(),
        stage,
    });

    (status, body).into_response()
}

impl IntoResponse for UploadError {
    fn into_response(self) -> Response {
        error_response(&self, None)
    }
}

impl IntoResponse for PipelineFailure {
    fn into_response(self) -> Response {
        error_response(&self.error, Some(self.stage))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        let err: UploadError = OrderingError::NoChunksFound.into();
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(err.code(), "NO_CHUNKS_FOUND");

        let err: UploadError = PublishError::RemoteRejected {
            status: 403,
            body: String::new(),
        }
        .into();
        assert_eq!(err.status_code(), StatusCode::BAD_GATEWAY);
        assert_eq!(err.code(), "REMOTE_REJECTED");

        let err: UploadError = ParameterError::MissingParameters.into();
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_pipeline_failure_names_stage() {
        let failure = PipelineFailure::new(
            PipelineStage::Merge,
            MergeError::ChunkOpenFailed {
                index: 3,
                partial: PathBuf::from("/tmp/x.partial"),
                source: std::io::Error::from(std::io::ErrorKind::NotFound),
            },
        );
        let message = failure.to_string();
        assert!(message.starts_with("merge stage failed"));
        assert!(message.contains("chunk 3"));
    }
}
