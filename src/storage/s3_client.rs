//! S3-compatible storage client
//!
//! Wraps the AWS SDK to issue presigned PUT URLs and inspect published objects.

use std::time::Duration;

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::{
    config::{Credentials, Region},
    error::DisplayErrorContext,
    presigning::PresigningConfig,
    Client,
};
use chrono::{DateTime, Utc};

use crate::config::StorageConfig;
use crate::error::{AppError, Result, S3Error};
use crate::upload::{PublishError, RemoteStore, TransferDescriptor};

use super::types::ObjectMetadata;

/// S3-compatible storage client
#[derive(Clone)]
pub struct S3Client {
    client: Client,
    bucket: String,
}

impl S3Client {
    /// Create a new S3 client from configuration and check the bucket
    pub async fn new(config: &StorageConfig) -> Result<Self> {
        let s3 = Self::build(config)?;

        // Test connection by checking if bucket exists
        match s3.client.head_bucket().bucket(&s3.bucket).send().await {
            Ok(_) => {
                tracing::info!("Connected to S3 bucket: {}", s3.bucket);
            }
            Err(e) => {
                tracing::warn!(
                    "Could not verify bucket {}: {}. Will attempt operations anyway.",
                    s3.bucket,
                    DisplayErrorContext(&e)
                );
            }
        }

        Ok(s3)
    }

    /// Create a client without touching the network
    pub fn build(config: &StorageConfig) -> Result<Self> {
        if config.endpoint.is_empty() {
            return Err(AppError::Config("S3 endpoint is empty".to_string()));
        }

        let credentials = Credentials::new(
            &config.access_key,
            &config.secret_key,
            None,
            None,
            "stitch-server",
        );

        let region = config
            .region
            .clone()
            .unwrap_or_else(|| "us-east-1".to_string());

        let s3_config = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .endpoint_url(&config.endpoint)
            .region(Region::new(region))
            .credentials_provider(credentials)
            .force_path_style(true) // Required for MinIO and other S3-compatible services
            .build();

        Ok(Self {
            client: Client::from_conf(s3_config),
            bucket: config.bucket.clone(),
        })
    }

    /// Get the default bucket name
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Get object metadata (HEAD request)
    pub async fn head_object(&self, bucket: &str, key: &str) -> Result<ObjectMetadata> {
        let response = self
            .client
            .head_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                let not_found = e
                    .as_service_error()
                    .map(|se| se.is_not_found())
                    .unwrap_or(false);
                if not_found {
                    S3Error::ObjectNotFound(key.to_string())
                } else {
                    S3Error::SdkError(format!(
                        "Failed to head object {}: {}",
                        key,
                        DisplayErrorContext(&e)
                    ))
                }
            })?;

        Ok(ObjectMetadata {
            key: key.to_string(),
            size: response.content_length().unwrap_or(0).max(0) as u64,
            last_modified: response
                .last_modified()
                .and_then(|dt| DateTime::from_timestamp(dt.secs(), dt.subsec_nanos())),
            content_type: response.content_type().map(|s| s.to_string()),
            etag: response.e_tag().map(|s| s.to_string()),
        })
    }

    /// Presign a single PUT of `bucket/key`.
    ///
    /// `content_type` is part of the signature, so the transfer must send
    /// exactly this value.
    pub async fn presign_put(
        &self,
        bucket: &str,
        key: &str,
        content_type: &str,
        lifetime: Duration,
    ) -> Result<TransferDescriptor> {
        let presigning = PresigningConfig::expires_in(lifetime)
            .map_err(|e| S3Error::PresignFailed(format!("Invalid lifetime {:?}: {}", lifetime, e)))?;

        let expires_at = Utc::now()
            + chrono::Duration::from_std(lifetime)
                .map_err(|e| S3Error::PresignFailed(format!("Invalid lifetime {:?}: {}", lifetime, e)))?;

        let presigned = self
            .client
            .put_object()
            .bucket(bucket)
            .key(key)
            .content_type(content_type)
            .presigned(presigning)
            .await
            .map_err(|e| {
                S3Error::PresignFailed(format!("Failed to presign {}: {}", key, DisplayErrorContext(&e)))
            })?;

        let mut descriptor = TransferDescriptor::new(bucket, key, presigned.uri(), expires_at)
            .with_method(presigned.method());
        for (name, value) in presigned.headers() {
            descriptor = descriptor.with_header(name, value);
        }

        tracing::debug!(bucket = %bucket, key = %key, expires_at = %expires_at, "Presigned PUT");

        Ok(descriptor)
    }
}

#[async_trait]
impl RemoteStore for S3Client {
    async fn issue_write_descriptor(
        &self,
        bucket: &str,
        object_key: &str,
        content_type: &str,
        lifetime: Duration,
    ) -> std::result::Result<TransferDescriptor, PublishError> {
        self.presign_put(bucket, object_key, content_type, lifetime)
            .await
            .map_err(|e| PublishError::DescriptorUnavailable(e.to_string()))
    }

    async fn object_size(
        &self,
        bucket: &str,
        object_key: &str,
    ) -> std::result::Result<Option<u64>, PublishError> {
        match self.head_object(bucket, object_key).await {
            Ok(metadata) => Ok(Some(metadata.size)),
            Err(AppError::S3(S3Error::ObjectNotFound(_))) => Ok(None),
            Err(e) => Err(PublishError::TransferFailed { cause: e.to_string() }),
        }
    }
}
