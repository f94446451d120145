//! Publish Engine
//!
//! Streams a merged artifact to the object store through a presigned,
//! single-use transfer descriptor.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_LENGTH, CONTENT_TYPE, ETAG};
use tokio_util::io::ReaderStream;

use super::error::PublishError;
use super::merge::MergedArtifact;
use super::types::PublishReceipt;

/// Longest remote error body kept in `RemoteRejected`
const MAX_ERROR_BODY: usize = 512;

// ============================================================================
// Transfer Descriptor
// ============================================================================

/// Authorization for exactly one write of one remote object.
///
/// Not `Clone`: publishing consumes it, and a retry has to obtain a new one.
pub struct TransferDescriptor {
    bucket: String,
    object_key: String,
    method: String,
    url: String,
    headers: Vec<(String, String)>,
    expires_at: DateTime<Utc>,
}

impl TransferDescriptor {
    /// A `PUT` descriptor for `url`
    pub fn new(
        bucket: impl Into<String>,
        object_key: impl Into<String>,
        url: impl Into<String>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            bucket: bucket.into(),
            object_key: object_key.into(),
            method: "PUT".to_string(),
            url: url.into(),
            headers: Vec::new(),
            expires_at,
        }
    }

    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = method.into();
        self
    }

    /// Add a header the signature requires on the transfer
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn object_key(&self) -> &str {
        &self.object_key
    }

    /// Full presigned URL, signature included
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }

    /// The object URL without its signing query string
    pub fn location(&self) -> &str {
        self.url.split('?').next().unwrap_or(&self.url)
    }
}

impl fmt::Debug for TransferDescriptor {
    // The query string carries the signature
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferDescriptor")
            .field("bucket", &self.bucket)
            .field("object_key", &self.object_key)
            .field("method", &self.method)
            .field("location", &self.location())
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

// ============================================================================
// Remote Store
// ============================================================================

/// Storage-credential collaborator
#[async_trait::async_trait]
pub trait RemoteStore: Send + Sync {
    /// Issue a descriptor authorizing one write of `bucket/object_key`
    async fn issue_write_descriptor(
        &self,
        bucket: &str,
        object_key: &str,
        content_type: &str,
        lifetime: Duration,
    ) -> Result<TransferDescriptor, PublishError>;

    /// Size of a stored object, `None` if it does not exist
    async fn object_size(&self, bucket: &str, object_key: &str) -> Result<Option<u64>, PublishError>;
}

// ============================================================================
// Publish Engine
// ============================================================================

#[derive(Clone)]
pub struct PublishEngine {
    http: reqwest::Client,
    verifier: Option<Arc<dyn RemoteStore>>,
}

impl PublishEngine {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http, verifier: None }
    }

    /// Check the stored object's size after each successful transfer
    pub fn with_verification(mut self, store: Arc<dyn RemoteStore>) -> Self {
        self.verifier = Some(store);
        self
    }

    /// Transfer `artifact` with a single request. No retries.
    pub async fn publish(
        &self,
        artifact: MergedArtifact,
        content_type: &str,
        descriptor: TransferDescriptor,
    ) -> Result<PublishReceipt, PublishError> {
        if descriptor.is_expired() {
            return Err(PublishError::DescriptorExpired(descriptor.expires_at));
        }

        let total_bytes = artifact.total_bytes;
        let method = reqwest::Method::from_bytes(descriptor.method.as_bytes())
            .map_err(|e| transfer_failed(format!("invalid method {}: {}", descriptor.method, e)))?;

        let mut headers = HeaderMap::new();
        let content_type = HeaderValue::from_str(content_type)
            .map_err(|e| transfer_failed(format!("invalid content type: {}", e)))?;
        headers.insert(CONTENT_TYPE, content_type);
        for (name, value) in &descriptor.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| transfer_failed(format!("invalid signed header {}: {}", name, e)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| transfer_failed(format!("invalid signed header value: {}", e)))?;
            headers.insert(name, value);
        }
        headers.insert(CONTENT_LENGTH, HeaderValue::from(total_bytes));

        tracing::debug!(
            bucket = %descriptor.bucket,
            object_key = %descriptor.object_key,
            size = total_bytes,
            "Uploading merged file"
        );

        let body = reqwest::Body::wrap_stream(ReaderStream::new(artifact.into_file()));
        let response = self
            .http
            .request(method, &descriptor.url)
            .headers(headers)
            .body(body)
            .send()
            .await
            .map_err(|e| transfer_failed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(
                status = status.as_u16(),
                object_key = %descriptor.object_key,
                "Remote store rejected upload"
            );
            return Err(PublishError::RemoteRejected {
                status: status.as_u16(),
                body: body.chars().take(MAX_ERROR_BODY).collect(),
            });
        }

        let etag = response
            .headers()
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim_matches('"').to_string());

        if let Some(store) = &self.verifier {
            let actual = store
                .object_size(&descriptor.bucket, &descriptor.object_key)
                .await?;
            if actual != Some(total_bytes) {
                return Err(PublishError::VerificationFailed {
                    expected: total_bytes,
                    actual,
                });
            }
        }

        tracing::info!(
            bucket = %descriptor.bucket,
            object_key = %descriptor.object_key,
            size = total_bytes,
            "Published merged file"
        );

        Ok(PublishReceipt {
            location: descriptor.location().to_string(),
            bucket: descriptor.bucket,
            object_key: descriptor.object_key,
            etag,
            size: total_bytes,
        })
    }
}

fn transfer_failed(cause: String) -> PublishError {
    PublishError::TransferFailed { cause }
}

// ============================================================================
// Tests
// ============================================================================
