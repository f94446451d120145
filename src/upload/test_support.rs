//! In-process object store used by the pipeline and route tests.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    routing::put,
    Router,
};
use chrono::Utc;
use parking_lot::Mutex;

use super::error::PublishError;
use super::publish::{RemoteStore, TransferDescriptor};

/// One PUT received by the fake store
#[derive(Debug, Clone)]
pub struct RecordedPut {
    pub path: String,
    pub content_length: Option<u64>,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

#[derive(Clone)]
pub struct FakeObjectStore {
    addr: SocketAddr,
    shared: Arc<Shared>,
}

struct Shared {
    status: StatusCode,
    truncate: AtomicBool,
    puts: Mutex<Vec<RecordedPut>>,
    objects: Mutex<HashMap<String, u64>>,
}

impl FakeObjectStore {
    /// Serve on an ephemeral port, answering every PUT with `status`
    pub async fn start(status: StatusCode) -> Self {
        let shared = Arc::new(Shared {
            status,
            truncate: AtomicBool::new(false),
            puts: Mutex::new(Vec::new()),
            objects: Mutex::new(HashMap::new()),
        });

        let app = Router::new()
            .route("/*path", put(handle_put))
            .with_state(shared.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { addr, shared }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn puts(&self) -> Vec<RecordedPut> {
        self.shared.puts.lock().clone()
    }

    /// Store later objects with zero length, as a misbehaving backend would
    pub fn truncate_stored_objects(&self) {
        self.shared.truncate.store(true, Ordering::SeqCst);
    }
}

async fn handle_put(
    State(shared): State<Arc<Shared>>,
    Path(path): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let content_length = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok());
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let path = format!("/{}", path);
    shared.puts.lock().push(RecordedPut {
        path: path.clone(),
        content_length,
        content_type,
        body: body.to_vec(),
    });

    if shared.status.is_success() {
        let stored = if shared.truncate.load(Ordering::SeqCst) {
            0
        } else {
            body.len() as u64
        };
        shared.objects.lock().insert(path, stored);
    }

    (shared.status, [(header::ETAG, "\"fake-etag\"")], "")
}

#[async_trait::async_trait]
impl RemoteStore for FakeObjectStore {
    async fn issue_write_descriptor(
        &self,
        bucket: &str,
        object_key: &str,
        content_type: &str,
        lifetime: Duration,
    ) -> Result<TransferDescriptor, PublishError> {
        let expires_at = Utc::now() + chrono::Duration::from_std(lifetime).unwrap();
        let url = format!(
            "{}/{}/{}?X-Amz-Signature=fake",
            self.base_url(),
            bucket,
            object_key
        );
        Ok(TransferDescriptor::new(bucket, object_key, url, expires_at)
            .with_header("content-type", content_type))
    }

    async fn object_size(&self, bucket: &str, object_key: &str) -> Result<Option<u64>, PublishError> {
        let path = format!("/{}/{}", bucket, object_key);
        Ok(self.shared.objects.lock().get(&path).copied())
    }
}
