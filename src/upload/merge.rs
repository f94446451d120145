//! Merge Engine
//!
//! Concatenates ordered chunks into one artifact under the merged directory.
//!
//! Output goes to an exclusively created `.{uuid}.partial` file
//! that is renamed over `{merged_dir}/{fileName}` only once every chunk has
//! been copied and synced. On failure the partial file is left where it is
//! and reported in the error.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use uuid::Uuid;

use super::error::MergeError;
use super::types::ChunkSource;

/// Copy buffer size
const COPY_BUFFER_SIZE: usize = 256 * 1024;

// ============================================================================
// Merged Artifact
// ============================================================================

/// A fully merged artifact with an open handle positioned at its start
#[derive(Debug)]
pub struct MergedArtifact {
    pub path: PathBuf,
    pub total_bytes: u64,
    pub chunk_count: usize,
    /// Hex SHA-256 of the artifact contents
    pub sha256: String,
    /// Identity of the file this merge produced
    pub identity: Option<FileIdentity>,
    file: File,
}

impl MergedArtifact {
    /// Take the open handle, e.g. to stream it elsewhere
    pub fn into_file(self) -> File {
        self.file
    }
}

/// Device and inode of a file, on platforms that expose them
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileIdentity {
    dev: u64,
    ino: u64,
}

impl FileIdentity {
    #[cfg(unix)]
    pub fn of(metadata: &std::fs::Metadata) -> Option<Self> {
        use std::os::unix::fs::MetadataExt;
        Some(Self {
            dev: metadata.dev(),
            ino: metadata.ino(),
        })
    }

    #[cfg(not(unix))]
    pub fn of(_metadata: &std::fs::Metadata) -> Option<Self> {
        None
    }
}

/// Remove `path` only if it is still the file identified by `identity`.
///
/// Another merge of the same file name may have renamed its own artifact
/// over `path` in the meantime; that file is left alone. Returns whether
/// the file was removed.
pub async fn remove_if_unchanged(path: &Path, identity: Option<FileIdentity>) -> std::io::Result<bool> {
    let Some(identity) = identity else {
        return Ok(false);
    };
    let current = match tokio::fs::metadata(path).await {
        Ok(metadata) => FileIdentity::of(&metadata),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    };
    if current != Some(identity) {
        return Ok(false);
    }
    tokio::fs::remove_file(path).await?;
    Ok(true)
}

// ============================================================================
// Merge Engine
// ============================================================================

#[derive(Debug, Clone)]
pub struct MergeEngine {
    merged_dir: PathBuf,
}

impl MergeEngine {
    pub fn new(merged_dir: impl Into<PathBuf>) -> Self {
        Self {
            merged_dir: merged_dir.into(),
        }
    }

    /// Final location of the artifact for `file_name`
    pub fn destination_path(&self, file_name: &str) -> PathBuf {
        self.merged_dir.join(file_name)
    }

    /// Stream `chunks` in the given order into `{merged_dir}/{file_name}`.
    ///
    /// Aborts on the first chunk that cannot be opened or copied.
    pub async fn merge(&self, file_name: &str, chunks: &[ChunkSource]) -> Result<MergedArtifact, MergeError> {
        let destination = self.destination_path(file_name);

        tokio::fs::create_dir_all(&self.merged_dir)
            .await
            .map_err(|source| MergeError::DestinationCreateFailed {
                path: destination.clone(),
                source,
            })?;

        let partial = self
            .merged_dir
            .join(format!(".{}.partial", Uuid::new_v4()));
        let mut output = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&partial)
            .await
            .map_err(|source| MergeError::DestinationCreateFailed {
                path: partial.clone(),
                source,
            })?;

        let mut hasher = Sha256::new();
        let mut buffer = vec![0u8; COPY_BUFFER_SIZE];
        let mut total_bytes: u64 = 0;

        for (position, chunk) in chunks.iter().enumerate() {
            let mut input = File::open(&chunk.path)
                .await
                .map_err(|source| MergeError::ChunkOpenFailed {
                    index: chunk.index,
                    partial: partial.clone(),
                    source,
                })?;

            let expected = input
                .metadata()
                .await
                .map_err(|source| MergeError::ChunkOpenFailed {
                    index: chunk.index,
                    partial: partial.clone(),
                    source,
                })?
                .len();

            let copied = copy_chunk(&mut input, &mut output, &mut buffer, &mut hasher, &mut total_bytes)
                .await
                .map_err(|source| MergeError::ChunkCopyFailed {
                    index: chunk.index,
                    bytes_written: total_bytes,
                    partial: partial.clone(),
                    source,
                })?;

            if copied != expected {
                return Err(MergeError::ChunkSizeChanged {
                    index: chunk.index,
                    expected,
                    copied,
                    partial,
                });
            }

            tracing::trace!(
                chunk_index = chunk.index,
                chunk = position + 1,
                of = chunks.len(),
                bytes = copied,
                "Merged chunk"
            );
        }

        finalize(&mut output, &partial, &destination).await?;
        let identity = output
            .metadata()
            .await
            .ok()
            .and_then(|metadata| FileIdentity::of(&metadata));

        tracing::info!(
            file_name = %file_name,
            chunks = chunks.len(),
            total_bytes = total_bytes,
            path = %destination.display(),
            "Successfully merged file"
        );

        Ok(MergedArtifact {
            path: destination,
            total_bytes,
            chunk_count: chunks.len(),
            sha256: hex::encode(hasher.finalize()),
            identity,
            file: output,
        })
    }
}

/// Copy one chunk, counting only bytes the destination accepted.
///
/// `total_bytes` is advanced as writes land so a failure reports the exact
/// offset reached in the output.
async fn copy_chunk(
    input: &mut File,
    output: &mut File,
    buffer: &mut [u8],
    hasher: &mut Sha256,
    total_bytes: &mut u64,
) -> std::io::Result<u64> {
    let mut copied: u64 = 0;

    loop {
        let read = input.read(buffer).await?;
        if read == 0 {
            return Ok(copied);
        }

        let mut pending = &buffer[..read];
        while !pending.is_empty() {
            let written = output.write(pending).await?;
            if written == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::WriteZero,
                    "merged artifact accepted no bytes",
                ));
            }
            hasher.update(&pending[..written]);
            pending = &pending[written..];
            copied += written as u64;
            *total_bytes += written as u64;
        }
    }
}

/// Sync the partial output, move it into place and rewind it for reading
async fn finalize(output: &mut File, partial: &Path, destination: &Path) -> Result<(), MergeError> {
    let failed = |path: &Path| {
        let path = path.to_path_buf();
        move |source: std::io::Error| MergeError::FinalizeFailed { path, source }
    };

    output.flush().await.map_err(failed(partial))?;
    output.sync_all().await.map_err(failed(partial))?;
    tokio::fs::rename(partial, destination)
        .await
        .map_err(failed(partial))?;
    output
        .seek(SeekFrom::Start(0))
        .await
        .map_err(failed(destination))?;

    Ok(())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upload::chunk_store::compute_hash;
    use tempfile::TempDir;

    fn write_chunks(dir: &Path, chunks: &[Vec<u8>]) -> Vec<ChunkSource> {
        chunks
            .iter()
            .enumerate()
            .map(|(i, data)| {
                let path = dir.join(format!("file.bin-{}", i));
                std::fs::write(&path, data).unwrap();
                ChunkSource {
                    index: i as u64,
                    path,
                }
            })
            .collect()
    }

    fn partial_files(dir: &Path) -> Vec<PathBuf> {
        std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().path())
            .filter(|p| p.extension().map(|e| e == "partial").unwrap_or(false))
            .collect()
    }

    #[tokio::test]
    async fn test_merge_concatenates_in_order() {
        let temp_dir = TempDir::new().unwrap();
        let large = vec![7u8; COPY_BUFFER_SIZE + 13];
        let parts = vec![b"Hello, ".to_vec(), large, b"World!".to_vec()];
        let sources = write_chunks(temp_dir.path(), &parts);

        let engine = MergeEngine::new(temp_dir.path().join("merged"));
        let artifact = engine.merge("file.bin", &sources).await.unwrap();

        let expected: Vec<u8> = parts.concat();
        assert_eq!(artifact.total_bytes, expected.len() as u64);
        assert_eq!(artifact.chunk_count, 3);
        assert_eq!(artifact.sha256, compute_hash(&expected));
        assert_eq!(artifact.path, temp_dir.path().join("merged").join("file.bin"));
        assert_eq!(std::fs::read(&artifact.path).unwrap(), expected);

        // The handle is rewound and reads the same bytes
        let mut file = artifact.into_file();
        let mut read_back = Vec::new();
        file.read_to_end(&mut read_back).await.unwrap();
        assert_eq!(read_back, expected);
    }

    #[tokio::test]
    async fn test_empty_chunk_contributes_nothing() {
        let temp_dir = TempDir::new().unwrap();
        let sources = write_chunks(temp_dir.path(), &[b"ab".to_vec(), Vec::new(), b"cd".to_vec()]);

        let engine = MergeEngine::new(temp_dir.path().join("merged"));
        let artifact = engine.merge("file.bin", &sources).await.unwrap();

        assert_eq!(artifact.total_bytes, 4);
        assert_eq!(std::fs::read(&artifact.path).unwrap(), b"abcd");
    }

    #[tokio::test]
    async fn test_missing_chunk_fails_and_leaves_partial() {
        let temp_dir = TempDir::new().unwrap();
        let mut sources = write_chunks(temp_dir.path(), &[b"first".to_vec(), b"second".to_vec()]);
        sources.push(ChunkSource {
            index: 2,
            path: temp_dir.path().join("file.bin-2"),
        });

        let merged_dir = temp_dir.path().join("merged");
        let engine = MergeEngine::new(&merged_dir);
        let result = engine.merge("file.bin", &sources).await;

        let partial = match result {
            Err(MergeError::ChunkOpenFailed { index, partial, .. }) => {
                assert_eq!(index, 2);
                partial
            }
            other => panic!("unexpected: {:?}", other),
        };

        assert_eq!(std::fs::read(&partial).unwrap(), b"firstsecond");
        assert!(!merged_dir.join("file.bin").exists());
    }

    #[tokio::test]
    async fn test_unreadable_chunk_reports_offset() {
        let temp_dir = TempDir::new().unwrap();
        let mut sources = write_chunks(temp_dir.path(), &[b"12345".to_vec()]);

        // Opening a directory succeeds on unix but reading it fails
        let dir_chunk = temp_dir.path().join("file.bin-1");
        std::fs::create_dir(&dir_chunk).unwrap();
        sources.push(ChunkSource {
            index: 1,
            path: dir_chunk,
        });

        let engine = MergeEngine::new(temp_dir.path().join("merged"));
        let result = engine.merge("file.bin", &sources).await;

        match result {
            Err(MergeError::ChunkCopyFailed {
                index, bytes_written, ..
            }) => {
                assert_eq!(index, 1);
                assert_eq!(bytes_written, 5);
            }
            Err(MergeError::ChunkOpenFailed { index, .. }) => assert_eq!(index, 1),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_destination_create_failure() {
        let temp_dir = TempDir::new().unwrap();
        let sources = write_chunks(temp_dir.path(), &[b"x".to_vec()]);

        let blocker = temp_dir.path().join("merged");
        std::fs::write(&blocker, b"not a directory").unwrap();

        let engine = MergeEngine::new(&blocker);
        let result = engine.merge("file.bin", &sources).await;
        assert!(matches!(result, Err(MergeError::DestinationCreateFailed { .. })));
    }

    #[tokio::test]
    async fn test_remerge_replaces_artifact_identically() {
        let temp_dir = TempDir::new().unwrap();
        let sources = write_chunks(temp_dir.path(), &[b"one".to_vec(), b"two".to_vec(), b"three".to_vec()]);
        let merged_dir = temp_dir.path().join("merged");
        let engine = MergeEngine::new(&merged_dir);

        let first = engine.merge("file.bin", &sources).await.unwrap();
        let first_bytes = std::fs::read(&first.path).unwrap();
        let second = engine.merge("file.bin", &sources).await.unwrap();
        let second_bytes = std::fs::read(&second.path).unwrap();

        assert_eq!(first_bytes, second_bytes);
        assert_eq!(first.sha256, second.sha256);
        assert!(partial_files(&merged_dir).is_empty());
    }

    #[tokio::test]
    async fn test_long_file_name_merges() {
        let temp_dir = TempDir::new().unwrap();
        let sources = write_chunks(temp_dir.path(), &[b"x".to_vec()]);
        let file_name = "n".repeat(crate::upload::types::MAX_FILE_NAME_LEN);

        let engine = MergeEngine::new(temp_dir.path().join("merged"));
        let artifact = engine.merge(&file_name, &sources).await.unwrap();
        assert_eq!(std::fs::read(&artifact.path).unwrap(), b"x");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_remove_if_unchanged_spares_replaced_artifact() {
        let temp_dir = TempDir::new().unwrap();
        let sources = write_chunks(temp_dir.path(), &[b"mine".to_vec()]);
        let engine = MergeEngine::new(temp_dir.path().join("merged"));

        let mine = engine.merge("file.bin", &sources).await.unwrap();
        let path = mine.path.clone();
        let identity = mine.identity;
        assert!(identity.is_some());

        // Another upload with the same file name finishes in between
        let other_dir = temp_dir.path().join("other");
        std::fs::create_dir(&other_dir).unwrap();
        let other_sources = write_chunks(&other_dir, &[b"theirs".to_vec()]);
        let theirs = engine.merge("file.bin", &other_sources).await.unwrap();

        assert!(!remove_if_unchanged(&path, identity).await.unwrap());
        assert_eq!(std::fs::read(&path).unwrap(), b"theirs");

        assert!(remove_if_unchanged(&path, theirs.identity).await.unwrap());
        assert!(!path.exists());
        drop(mine);
    }
}
