//! Stitch Server Library
//!
//! Assembles chunked uploads into a single artifact and publishes it to
//! S3-compatible storage through a presigned URL.
//!
//! # Modules
//!
//! - `upload`: Chunk storage, ordering, merging and publishing
//! - `storage`: S3 client that issues presigned transfers
//! - `routes`: HTTP surface (`/upload`, `/merge`, `/health`)

pub mod config;
pub mod error;
pub mod routes;
pub mod state;
pub mod storage;
pub mod upload;
