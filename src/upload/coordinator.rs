//! Upload Coordinator
//!
//! Runs one merge request through the pipeline:
//!
//! ```text
//! Validated -> Ordered -> Merged -> Published -> Done
//!      \__________\__________\__________\______> Failed{stage}
//! ```
//!
//! Each request is handled sequentially by the calling task. Distinct keys
//! share nothing mutable except the set of keys currently being merged.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use super::chunk_store::{compute_hash, verify_hash, ChunkStore};
use super::error::{ParameterError, PipelineFailure, PipelineStage, StorageError, UploadError};
use super::merge::{remove_if_unchanged, FileIdentity, MergeEngine};
use super::ordering::ChunkOrderer;
use super::publish::{PublishEngine, RemoteStore};
use super::types::{
    validate_component, validate_file_name, ChunkMetadata, ChunkName, ChunkSource, ChunkSubmission,
    MergeOutcome, MergeRequest, OrderingPolicy, RetentionPolicy, DEFAULT_CONTENT_TYPE,
};
use crate::config::{StorageConfig, UploadConfig};

// ============================================================================
// Settings
// ============================================================================

#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub bucket: String,
    pub object_prefix: String,
    pub descriptor_ttl: Duration,
    pub ordering: OrderingPolicy,
    pub retention: RetentionPolicy,
}

impl CoordinatorSettings {
    pub fn from_config(storage: &StorageConfig, upload: &UploadConfig) -> Self {
        Self {
            bucket: storage.bucket.clone(),
            object_prefix: upload.object_prefix.clone(),
            descriptor_ttl: Duration::from_secs(upload.descriptor_ttl_secs),
            ordering: upload.ordering,
            retention: upload.retention,
        }
    }
}

// ============================================================================
// Merge State
// ============================================================================

/// Progress of one merge request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeState {
    Validated,
    Ordered,
    Merged,
    Published,
    Done,
    Failed(PipelineStage),
}

impl fmt::Display for MergeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Validated => f.write_str("validated"),
            Self::Ordered => f.write_str("ordered"),
            Self::Merged => f.write_str("merged"),
            Self::Published => f.write_str("published"),
            Self::Done => f.write_str("done"),
            Self::Failed(stage) => write!(f, "failed({})", stage),
        }
    }
}

// ============================================================================
// Coordinator
// ============================================================================

/// Orchestrates chunk submission and merge requests
#[derive(Clone)]
pub struct UploadCoordinator {
    inner: Arc<CoordinatorInner>,
}

struct CoordinatorInner {
    chunk_store: ChunkStore,
    orderer: ChunkOrderer,
    merge_engine: MergeEngine,
    publish_engine: PublishEngine,
    remote: Arc<dyn RemoteStore>,
    settings: CoordinatorSettings,

    /// Keys with a merge currently running
    merging: Mutex<HashSet<String>>,
}

impl UploadCoordinator {
    pub fn new(
        chunk_store: ChunkStore,
        merge_engine: MergeEngine,
        publish_engine: PublishEngine,
        remote: Arc<dyn RemoteStore>,
        settings: CoordinatorSettings,
    ) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                chunk_store,
                orderer: ChunkOrderer::new(settings.ordering),
                merge_engine,
                publish_engine,
                remote,
                settings,
                merging: Mutex::new(HashSet::new()),
            }),
        }
    }

    pub fn chunk_store(&self) -> &ChunkStore {
        &self.inner.chunk_store
    }

    pub fn settings(&self) -> &CoordinatorSettings {
        &self.inner.settings
    }

    // ========================================================================
    // Chunk Submission
    // ========================================================================

    /// Validate and store one chunk
    pub async fn submit_chunk(&self, submission: ChunkSubmission) -> Result<ChunkMetadata, UploadError> {
        let ChunkSubmission {
            key,
            file_name,
            index,
            data,
            hash,
        } = submission;

        require_parameters(&key, &file_name)?;
        validate_component("key", &key)?;

        let chunk = match index {
            Some(index) => ChunkName::new(file_name, index),
            None => ChunkName::parse(&file_name).ok_or(ParameterError::MissingChunkIndex(file_name))?,
        };
        validate_file_name(&chunk.file_name)?;

        if let Some(expected) = hash.as_deref().filter(|h| !h.is_empty()) {
            if !verify_hash(&data, expected) {
                return Err(ParameterError::ChunkHashMismatch {
                    expected: expected.to_string(),
                    actual: compute_hash(&data),
                }
                .into());
            }
        }

        let metadata = self.inner.chunk_store.put(&key, &chunk, &data).await?;
        Ok(metadata)
    }

    // ========================================================================
    // Merge
    // ========================================================================

    /// Order, merge and publish every chunk of one upload
    pub async fn merge(&self, request: MergeRequest) -> Result<MergeOutcome, PipelineFailure> {
        let MergeRequest { key, file_name } = request;

        // Validated
        self.validate_merge(&key, &file_name)
            .map_err(|e| self.fail(&key, PipelineStage::Validate, e))?;
        let _guard = self
            .begin_merge(&key)
            .map_err(|e| self.fail(&key, PipelineStage::Validate, e))?;
        self.transition(&key, MergeState::Validated);

        // Ordered
        let identifiers = self
            .inner
            .chunk_store
            .list(&key, &file_name)
            .await
            .map_err(|e| self.fail(&key, PipelineStage::List, e))?;
        tracing::debug!(key = %key, file_name = %file_name, found = identifiers.len(), "Found chunks");

        let ordered = self
            .inner
            .orderer
            .order(identifiers.as_slice())
            .map_err(|e| self.fail(&key, PipelineStage::Order, e))?;
        self.transition(&key, MergeState::Ordered);

        // Merged
        let sources: Vec<ChunkSource> = ordered
            .iter()
            .map(|chunk| ChunkSource {
                index: chunk.index,
                path: self.inner.chunk_store.chunk_path(&key, &chunk.identifier),
            })
            .collect();

        let artifact = self
            .inner
            .merge_engine
            .merge(&file_name, &sources)
            .await
            .map_err(|e| {
                if let Some(partial) = e.partial_path() {
                    tracing::warn!(key = %key, partial = %partial.display(), "Merge left a partial file");
                }
                self.fail(&key, PipelineStage::Merge, e)
            })?;
        self.transition(&key, MergeState::Merged);

        // Published
        let content_type = content_type_for(&file_name);
        let object_key = self.object_key(&key, &file_name);
        let descriptor = self
            .inner
            .remote
            .issue_write_descriptor(
                &self.inner.settings.bucket,
                &object_key,
                content_type,
                self.inner.settings.descriptor_ttl,
            )
            .await
            .map_err(|e| self.fail(&key, PipelineStage::Publish, e))?;

        let path = artifact.path.clone();
        let size = artifact.total_bytes;
        let chunks = artifact.chunk_count;
        let sha256 = artifact.sha256.clone();
        let identity = artifact.identity;

        let receipt = self
            .inner
            .publish_engine
            .publish(artifact, content_type, descriptor)
            .await
            .map_err(|e| self.fail(&key, PipelineStage::Publish, e))?;
        self.transition(&key, MergeState::Published);

        if self.inner.settings.retention == RetentionPolicy::PurgeAfterPublish {
            let identifiers: Vec<String> = ordered.into_iter().map(|c| c.identifier).collect();
            self.purge(&key, &identifiers, &path, identity).await;
        }

        self.transition(&key, MergeState::Done);

        Ok(MergeOutcome {
            path: path.to_string_lossy().to_string(),
            size,
            chunks,
            sha256,
            location: receipt.location,
            object_key: receipt.object_key,
        })
    }

    fn validate_merge(&self, key: &str, file_name: &str) -> Result<(), UploadError> {
        require_parameters(key, file_name)?;
        validate_component("key", key)?;
        validate_file_name(file_name)?;
        Ok(())
    }

    /// Claim `key` for the duration of one merge
    fn begin_merge(&self, key: &str) -> Result<MergeGuard<'_>, UploadError> {
        let mut merging = self.inner.merging.lock();
        if !merging.insert(key.to_string()) {
            return Err(UploadError::MergeInProgress(key.to_string()));
        }
        Ok(MergeGuard {
            merging: &self.inner.merging,
            key: key.to_string(),
        })
    }

    /// Remote object key for an upload
    pub fn object_key(&self, key: &str, file_name: &str) -> String {
        format!("{}{}/{}", self.inner.settings.object_prefix, key, file_name)
    }

    /// Delete source chunks and the local artifact after a publish
    ///
    /// The artifact is only removed while it is still the file this merge
    /// produced.
    async fn purge(
        &self,
        key: &str,
        identifiers: &[String],
        artifact: &std::path::Path,
        identity: Option<FileIdentity>,
    ) {
        match self.inner.chunk_store.delete_chunks(key, identifiers).await {
            Ok(count) => tracing::debug!(key = %key, count = count, "Purged chunks"),
            Err(e) => tracing::warn!(key = %key, error = %e, "Failed to purge chunks"),
        }
        match remove_if_unchanged(artifact, identity).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!(key = %key, path = %artifact.display(), "Merged file was replaced, keeping it")
            }
            Err(e) => {
                tracing::warn!(key = %key, path = %artifact.display(), error = %e, "Failed to remove merged file")
            }
        }
    }

    // ========================================================================
    // Sweep
    // ========================================================================

    /// Remove namespaces untouched for `max_age`, skipping keys being merged.
    ///
    /// Each key is claimed like a merge while its namespace is removed, so a
    /// merge of that key cannot start halfway through. Returns the number of
    /// namespaces removed.
    pub async fn sweep_stale(&self, max_age: Duration) -> Result<usize, StorageError> {
        let mut count = 0;
        for key in self.inner.chunk_store.stale_keys(max_age).await? {
            let Ok(_guard) = self.begin_merge(&key) else {
                tracing::debug!(key = %key, "Skipping sweep of key being merged");
                continue;
            };
            self.inner.chunk_store.remove_namespace(&key).await?;
            count += 1;
        }

        if count > 0 {
            tracing::info!(count = count, "Swept stale chunk namespaces");
        }

        Ok(count)
    }

    /// Start background sweep of stale namespaces
    pub fn start_sweep_task(self, max_age: Duration, every: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);

            loop {
                interval.tick().await;
                if let Err(e) = self.sweep_stale(max_age).await {
                    tracing::warn!(error = %e, "Chunk sweep failed");
                }
            }
        })
    }

    fn transition(&self, key: &str, state: MergeState) {
        tracing::debug!(key = %key, state = %state, "Merge state");
    }

    fn fail(&self, key: &str, stage: PipelineStage, error: impl Into<UploadError>) -> PipelineFailure {
        let failure = PipelineFailure::new(stage, error);
        tracing::warn!(
            key = %key,
            state = %MergeState::Failed(stage),
            code = failure.error.code(),
            "Merge failed: {}",
            failure.error
        );
        failure
    }
}

/// Releases a key claimed by `begin_merge`
struct MergeGuard<'a> {
    merging: &'a Mutex<HashSet<String>>,
    key: String,
}

impl Drop for MergeGuard<'_> {
    fn drop(&mut self) {
        self.merging.lock().remove(&self.key);
    }
}

fn require_parameters(key: &str, file_name: &str) -> Result<(), ParameterError> {
    if key.is_empty() || file_name.is_empty() {
        return Err(ParameterError::MissingParameters);
    }
    Ok(())
}

/// Content type for the published object, guessed from the file name
pub fn content_type_for(file_name: &str) -> &'static str {
    mime_guess::from_path(file_name)
        .first_raw()
        .unwrap_or(DEFAULT_CONTENT_TYPE)
}

// ============================================================================
// Tests
// ============================================================================
