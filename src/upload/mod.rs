//! Chunked Upload Assembly
//!
//! Clients split a file into indexed chunks and submit them in any order.
//! A merge request then:
//! 1. Lists the chunks stored under the upload key
//! 2. Orders them by numeric index (`f-10` after `f-9`)
//! 3. Concatenates them into one artifact on local disk
//! 4. Streams the artifact to S3 through a presigned single-use URL

pub mod chunk_store;
pub mod coordinator;
pub mod error;
pub mod merge;
pub mod ordering;
pub mod publish;
pub mod types;

#[cfg(test)]
pub(crate) mod test_support;

pub use chunk_store::{compute_hash, verify_hash, ChunkStore};
pub use coordinator::{content_type_for, CoordinatorSettings, MergeState, UploadCoordinator};
pub use error::{
    MergeError, OrderingError, ParameterError, PipelineFailure, PipelineStage, PublishError,
    StorageError, UploadError,
};
pub use merge::{MergeEngine, MergedArtifact};
pub use ordering::ChunkOrderer;
pub use publish::{PublishEngine, RemoteStore, TransferDescriptor};
pub use types::*;
