//! Chunk Store
//!
//! Local filesystem storage for uploaded chunks before assembly.
//! Every upload key owns one directory; chunks inside it are named
//! `{fileName}-{index}`. No ordering or validation happens here.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use chrono::Utc;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use super::error::StorageError;
use super::types::{ChunkMetadata, ChunkName, CHUNK_INDEX_DELIMITER};

// ============================================================================
// Chunk Store
// ============================================================================

/// Filesystem chunk store, cheap to clone
#[derive(Clone)]
pub struct ChunkStore {
    inner: Arc<ChunkStoreInner>,
}

struct ChunkStoreInner {
    /// Root holding one namespace directory per key
    base_path: PathBuf,
}

impl ChunkStore {
    /// Create a store rooted at `base_path`
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            inner: Arc::new(ChunkStoreInner {
                base_path: base_path.into(),
            }),
        }
    }

    /// Root directory of the store
    pub fn base_path(&self) -> &Path {
        &self.inner.base_path
    }

    /// Directory holding every chunk submitted under `key`
    pub fn namespace_path(&self, key: &str) -> PathBuf {
        self.inner.base_path.join(key)
    }

    /// On-disk location of a chunk identifier within a key's namespace
    pub fn chunk_path(&self, key: &str, identifier: &str) -> PathBuf {
        self.namespace_path(key).join(identifier)
    }

    /// Persist a chunk, creating the key's namespace if needed.
    ///
    /// The chunk is written to a hidden temp file, synced and renamed into
    /// place, so a listed chunk is always complete. Re-submitting the same
    /// chunk replaces it.
    pub async fn put(
        &self,
        key: &str,
        chunk: &ChunkName,
        data: &[u8],
    ) -> Result<ChunkMetadata, StorageError> {
        let namespace = self.namespace_path(key);
        tokio::fs::create_dir_all(&namespace)
            .await
            .map_err(|source| StorageError::NamespaceCreationFailed {
                path: namespace.clone(),
                source,
            })?;

        let identifier = chunk.identifier();
        let path = namespace.join(&identifier);
        let temp_path = namespace.join(format!(".{}.tmp", Uuid::new_v4()));

        if let Err(source) = write_synced(&temp_path, data).await {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(StorageError::StorageWriteFailed { path, source });
        }

        if let Err(source) = tokio::fs::rename(&temp_path, &path).await {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(StorageError::StorageWriteFailed { path, source });
        }

        tracing::debug!(
            key = %key,
            chunk = %identifier,
            size = data.len(),
            "Stored chunk"
        );

        Ok(ChunkMetadata {
            key: key.to_string(),
            identifier,
            index: chunk.index,
            size: data.len(),
            storage_path: path.to_string_lossy().to_string(),
            stored_at: Utc::now(),
        })
    }

    /// Check whether a chunk has been stored
    pub async fn exists(&self, key: &str, chunk: &ChunkName) -> bool {
        tokio::fs::try_exists(self.chunk_path(key, &chunk.identifier()))
            .await
            .unwrap_or(false)
    }

    /// List identifiers named `{file_name}-{suffix}` in the key's namespace.
    ///
    /// The suffix is not validated; a suffix containing another `-` belongs
    /// to a different file name and is skipped. A missing namespace yields
    /// an empty listing.
    pub async fn list(&self, key: &str, file_name: &str) -> Result<Vec<String>, StorageError> {
        let namespace = self.namespace_path(key);
        let prefix = format!("{}{}", file_name, CHUNK_INDEX_DELIMITER);

        let mut entries = match tokio::fs::read_dir(&namespace).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(StorageError::ListFailed { path: namespace, source }),
        };

        let mut identifiers = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|source| StorageError::ListFailed {
                path: namespace.clone(),
                source,
            })?
        {
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if name.starts_with('.') {
                continue;
            }
            let Some(suffix) = name.strip_prefix(&prefix) else {
                continue;
            };
            if suffix.is_empty() || suffix.contains(CHUNK_INDEX_DELIMITER) {
                continue;
            }
            let is_file = entry.file_type().await.map(|t| t.is_file()).unwrap_or(false);
            if is_file {
                identifiers.push(name);
            }
        }

        Ok(identifiers)
    }

    /// Delete the given chunks, then the namespace if it is left empty
    pub async fn delete_chunks(&self, key: &str, identifiers: &[String]) -> Result<usize, StorageError> {
        let mut count = 0;
        for identifier in identifiers {
            let path = self.chunk_path(key, identifier);
            match tokio::fs::remove_file(&path).await {
                Ok(()) => count += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(source) => return Err(StorageError::DeleteFailed { path, source }),
            }
        }

        // Only succeeds when no other file's chunks remain
        let _ = tokio::fs::remove_dir(self.namespace_path(key)).await;

        Ok(count)
    }

    /// Keys whose namespace has not been modified within `max_age`
    pub async fn stale_keys(&self, max_age: Duration) -> Result<Vec<String>, StorageError> {
        let base = &self.inner.base_path;
        let mut entries = match tokio::fs::read_dir(base).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(StorageError::ListFailed {
                    path: base.clone(),
                    source,
                })
            }
        };

        let now = SystemTime::now();
        let mut keys = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|source| StorageError::ListFailed {
                path: base.clone(),
                source,
            })?
        {
            let Ok(metadata) = entry.metadata().await else {
                continue;
            };
            if !metadata.is_dir() {
                continue;
            }
            let age = metadata
                .modified()
                .ok()
                .and_then(|modified| now.duration_since(modified).ok())
                .unwrap_or_default();
            if age < max_age {
                continue;
            }
            if let Ok(key) = entry.file_name().into_string() {
                keys.push(key);
            }
        }

        Ok(keys)
    }

    /// Remove a key's namespace and every chunk in it
    pub async fn remove_namespace(&self, key: &str) -> Result<(), StorageError> {
        let path = self.namespace_path(key);
        match tokio::fs::remove_dir_all(&path).await {
            Ok(()) => {
                tracing::debug!(namespace = %path.display(), "Removed chunk namespace");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StorageError::DeleteFailed { path, source }),
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

async fn write_synced(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let mut file = tokio::fs::File::create(path).await?;
    file.write_all(data).await?;
    file.sync_all().await
}

/// Compute SHA-256 hash of data
pub fn compute_hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Verify hash matches data (case-insensitive hex)
pub fn verify_hash(data: &[u8], expected_hash: &str) -> bool {
    compute_hash(data).eq_ignore_ascii_case(expected_hash.trim())
}

// ============================================================================
// Tests
// ============================================================================
