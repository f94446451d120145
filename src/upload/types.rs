//! Upload types for chunk assembly and publishing

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error::ParameterError;

// ============================================================================
// Constants
// ============================================================================

/// Separator between the file name and the chunk index in chunk identifiers
pub const CHUNK_INDEX_DELIMITER: char = '-';

/// Longest accepted key, in bytes
pub const MAX_NAME_LEN: usize = 255;

/// Longest accepted file name, in bytes, so `{fileName}-{u64::MAX}` still fits
/// in one path component
pub const MAX_FILE_NAME_LEN: usize = MAX_NAME_LEN - 21;

/// Content type used when none can be guessed from the file name
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

// ============================================================================
// Policies
// ============================================================================

/// How the orderer treats chunk sets that are not exactly `0..N-1`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OrderingPolicy {
    /// Reject gaps and duplicates with `IncompleteChunkSet`
    #[default]
    Strict,
    /// Merge whatever indices exist in ascending order; duplicates still fail
    BestEffort,
}

/// What happens to chunks and the local artifact after a successful publish
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RetentionPolicy {
    #[default]
    Keep,
    PurgeAfterPublish,
}

// ============================================================================
// Identifiers
// ============================================================================

/// Validate a caller supplied key or file name as a single path component.
pub fn validate_component(name: &'static str, value: &str) -> Result<(), ParameterError> {
    let reason = if value.len() > MAX_NAME_LEN {
        Some(format!("longer than {} bytes", MAX_NAME_LEN))
    } else if value.contains(['/', '\\', '\0']) {
        Some("must not contain path separators".to_string())
    } else if value.starts_with('.') {
        Some("must not start with '.'".to_string())
    } else {
        None
    };

    match reason {
        Some(reason) => Err(ParameterError::InvalidParameter { name, reason }),
        None => Ok(()),
    }
}

/// Validate a file name: a path component short enough to carry any chunk index.
pub fn validate_file_name(value: &str) -> Result<(), ParameterError> {
    if value.len() > MAX_FILE_NAME_LEN {
        return Err(ParameterError::InvalidParameter {
            name: "fileName",
            reason: format!("longer than {} bytes", MAX_FILE_NAME_LEN),
        });
    }
    validate_component("fileName", value)
}

/// Name of one stored chunk: `{file_name}-{index}`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkName {
    pub file_name: String,
    pub index: u64,
}

impl ChunkName {
    pub fn new(file_name: impl Into<String>, index: u64) -> Self {
        Self {
            file_name: file_name.into(),
            index,
        }
    }

    /// Split an identifier at its last `-` into file name and numeric index.
    ///
    /// Returns `None` when there is no delimiter, the file name part is empty,
    /// or the suffix is not made of ASCII digits only.
    pub fn parse(identifier: &str) -> Option<Self> {
        let (file_name, suffix) = identifier.rsplit_once(CHUNK_INDEX_DELIMITER)?;
        if file_name.is_empty() {
            return None;
        }
        let index = parse_index(suffix)?;
        Some(Self::new(file_name, index))
    }

    /// The storage identifier for this chunk
    pub fn identifier(&self) -> String {
        format!("{}{}{}", self.file_name, CHUNK_INDEX_DELIMITER, self.index)
    }
}

impl fmt::Display for ChunkName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.file_name, CHUNK_INDEX_DELIMITER, self.index)
    }
}

/// Parse a chunk index suffix. Signs, whitespace and empty strings are rejected.
pub fn parse_index(suffix: &str) -> Option<u64> {
    if suffix.is_empty() || !suffix.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    suffix.parse().ok()
}

// ============================================================================
// Requests
// ============================================================================

/// One chunk as delivered by the transport layer
#[derive(Debug, Clone)]
pub struct ChunkSubmission {
    pub key: String,
    /// Either the bare file name (with `index` set) or `{fileName}-{index}`
    pub file_name: String,
    pub index: Option<u64>,
    pub data: Vec<u8>,
    /// Optional hex SHA-256 of `data`
    pub hash: Option<String>,
}

/// Request to merge and publish one upload
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeRequest {
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub file_name: String,
}

// ============================================================================
// Results
// ============================================================================

/// Metadata for a stored chunk
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkMetadata {
    pub key: String,
    pub identifier: String,
    pub index: u64,
    pub size: usize,
    pub storage_path: String,
    pub stored_at: DateTime<Utc>,
}

/// A chunk with its position in the merge
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderedChunk {
    pub index: u64,
    pub identifier: String,
}

/// A chunk resolved to its on-disk location
#[derive(Debug, Clone)]
pub struct ChunkSource {
    pub index: u64,
    pub path: PathBuf,
}

/// Confirmation of a completed remote transfer
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishReceipt {
    pub bucket: String,
    pub object_key: String,
    /// Object URL without the signing query string
    pub location: String,
    pub etag: Option<String>,
    pub size: u64,
}

/// Final result of a merge request
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeOutcome {
    pub path: String,
    pub size: u64,
    pub chunks: usize,
    pub sha256: String,
    pub location: String,
    pub object_key: String,
}

/// Response after uploading a chunk
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkUploadResponse {
    pub success: bool,
    pub identifier: String,
    pub size: usize,
}

/// Response after a merge request succeeds
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeResponse {
    pub success: bool,
    #[serde(flatten)]
    pub outcome: MergeOutcome,
}

// ============================================================================
// Tests
// ============================================================================
