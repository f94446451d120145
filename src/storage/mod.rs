//! Storage module for S3-compatible backends
//!
//! Supports MinIO, Cloudflare R2, Backblaze B2, and AWS S3. Only the
//! presigning and metadata calls live here; artifact bytes travel over
//! plain HTTP to the presigned URL.

mod s3_client;
mod types;

pub use s3_client::S3Client;
pub use types::*;
