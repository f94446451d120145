//! Upload Routes
//!
//! Endpoints:
//! - POST /upload - Store one chunk (multipart: file, key, fileName, index?, hash?)
//! - POST /merge - Merge all chunks of an upload and publish the result

use axum::{
    extract::{FromRequest, Multipart, Request, State},
    http::header,
    routing::post,
    Form, Json, Router,
};

use crate::state::AppState;
use crate::upload::{
    ChunkSubmission, ChunkUploadResponse, MergeRequest, MergeResponse, ParameterError,
    PipelineFailure, PipelineStage, UploadError,
};

// ============================================================================
// Router
// ============================================================================

/// Create the upload router
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/upload", post(upload_chunk))
        .route("/merge", post(merge))
}

// ============================================================================
// Handlers
// ============================================================================

/// POST /upload
///
/// `fileName` is either the bare file name with a separate `index` field,
/// or `{fileName}-{index}`.
async fn upload_chunk(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<ChunkUploadResponse>, UploadError> {
    let submission = read_chunk_submission(multipart).await?;
    let metadata = state.coordinator().submit_chunk(submission).await?;

    Ok(Json(ChunkUploadResponse {
        success: true,
        identifier: metadata.identifier,
        size: metadata.size,
    }))
}

/// POST /merge
///
/// Accepts `key` and `fileName` as multipart fields, a urlencoded form,
/// or a JSON object.
async fn merge(
    State(state): State<AppState>,
    request: Request,
) -> Result<Json<MergeResponse>, PipelineFailure> {
    let merge_request = read_merge_request(request, &state)
        .await
        .map_err(|e| PipelineFailure::new(PipelineStage::Validate, e))?;

    tracing::info!(
        key = %merge_request.key,
        file_name = %merge_request.file_name,
        "Merge requested"
    );

    let outcome = state.coordinator().merge(merge_request).await?;

    Ok(Json(MergeResponse {
        success: true,
        outcome,
    }))
}

// ============================================================================
// Request Parsing
// ============================================================================

async fn read_chunk_submission(mut multipart: Multipart) -> Result<ChunkSubmission, ParameterError> {
    let mut key = String::new();
    let mut file_name = String::new();
    let mut index = None;
    let mut hash = None;
    let mut data = None;

    while let Some(field) = multipart.next_field().await.map_err(invalid_body)? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" => data = Some(field.bytes().await.map_err(invalid_body)?.to_vec()),
            "key" => key = field.text().await.map_err(invalid_body)?,
            "fileName" => file_name = field.text().await.map_err(invalid_body)?,
            "index" => {
                let value = field.text().await.map_err(invalid_body)?;
                let parsed = value
                    .trim()
                    .parse::<u64>()
                    .map_err(|_| ParameterError::InvalidParameter {
                        name: "index",
                        reason: format!("not a chunk index: {}", value),
                    })?;
                index = Some(parsed);
            }
            "hash" => hash = Some(field.text().await.map_err(invalid_body)?),
            other => tracing::debug!(field = %other, "Ignoring unknown upload field"),
        }
    }

    if key.is_empty() || file_name.is_empty() {
        return Err(ParameterError::MissingParameters);
    }

    Ok(ChunkSubmission {
        key,
        file_name,
        index,
        data: data.ok_or(ParameterError::MissingChunkData)?,
        hash,
    })
}

async fn read_merge_request(request: Request, state: &AppState) -> Result<MergeRequest, ParameterError> {
    let content_type = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_ascii_lowercase();

    if content_type.starts_with("multipart/form-data") {
        let mut multipart = Multipart::from_request(request, state)
            .await
            .map_err(|e| invalid_body(e.body_text()))?;
        let mut merge_request = MergeRequest::default();
        while let Some(field) = multipart.next_field().await.map_err(invalid_body)? {
            let name = field.name().unwrap_or_default().to_string();
            match name.as_str() {
                "key" => merge_request.key = field.text().await.map_err(invalid_body)?,
                "fileName" => merge_request.file_name = field.text().await.map_err(invalid_body)?,
                _ => {}
            }
        }
        Ok(merge_request)
    } else if content_type.starts_with("application/json") {
        let Json(merge_request) = Json::<MergeRequest>::from_request(request, state)
            .await
            .map_err(|e| invalid_body(e.body_text()))?;
        Ok(merge_request)
    } else {
        // Anything that is not a urlencoded form carries no parameters
        let Form(merge_request) = Form::<MergeRequest>::from_request(request, state)
            .await
            .map_err(|_| ParameterError::MissingParameters)?;
        Ok(merge_request)
    }
}

fn invalid_body(e: impl std::fmt::Display) -> ParameterError {
    ParameterError::InvalidParameter {
        name: "body",
        reason: e.to_string(),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::{Request as HttpRequest, StatusCode};
    use serde_json::Value;
    use tempfile::TempDir;
    use tower::ServiceExt;

    use crate::config::Config;
    use crate::routes::app;
    use crate::state::AppState;
    use crate::upload::test_support::FakeObjectStore;
    use crate::upload::{
        ChunkStore, CoordinatorSettings, MergeEngine, OrderingPolicy, PublishEngine, RetentionPolicy,
        UploadCoordinator,
    };

    const BOUNDARY: &str = "stitch-test-boundary";

    struct TestApp {
        _temp_dir: TempDir,
        store: FakeObjectStore,
        router: axum::Router,
    }

    async fn test_app(status: StatusCode) -> TestApp {
        let temp_dir = TempDir::new().unwrap();
        let store = FakeObjectStore::start(status).await;

        let mut config = Config::default();
        config.upload.chunk_dir = temp_dir.path().join("chunks");
        config.upload.merged_dir = temp_dir.path().join("merged");

        let coordinator = UploadCoordinator::new(
            ChunkStore::new(&config.upload.chunk_dir),
            MergeEngine::new(&config.upload.merged_dir),
            PublishEngine::new(reqwest::Client::new()),
            Arc::new(store.clone()),
            CoordinatorSettings {
                bucket: "my-bucket".to_string(),
                object_prefix: "uploads/".to_string(),
                descriptor_ttl: Duration::from_secs(3600),
                ordering: OrderingPolicy::Strict,
                retention: RetentionPolicy::Keep,
            },
        );

        TestApp {
            _temp_dir: temp_dir,
            store,
            router: app(AppState::new(config, coordinator)),
        }
    }

    /// Build a multipart body from text fields and an optional file part
    fn multipart_body(fields: &[(&str, &str)], file: Option<&[u8]>) -> Vec<u8> {
        let mut body = Vec::new();
        for (name, value) in fields {
            body.extend_from_slice(
                format!(
                    "--{}\r\nContent-Disposition: form-data; name=\"{}\"\r\n\r\n{}\r\n",
                    BOUNDARY, name, value
                )
                .as_bytes(),
            );
        }
        if let Some(data) = file {
            body.extend_from_slice(
                format!(
                    "--{}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"blob\"\r\n\
                     Content-Type: application/octet-stream\r\n\r\n",
                    BOUNDARY
                )
                .as_bytes(),
            );
            body.extend_from_slice(data);
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{}--\r\n", BOUNDARY).as_bytes());
        body
    }

    fn multipart_request(uri: &str, body: Vec<u8>) -> HttpRequest<Body> {
        HttpRequest::builder()
            .method("POST")
            .uri(uri)
            .header(
                "content-type",
                format!("multipart/form-data; boundary={}", BOUNDARY),
            )
            .body(Body::from(body))
            .unwrap()
    }

    async fn send(router: &axum::Router, request: HttpRequest<Body>) -> (StatusCode, Value) {
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, json)
    }

    async fn upload(router: &axum::Router, key: &str, file_name: &str, data: &[u8]) -> (StatusCode, Value) {
        let body = multipart_body(&[("key", key), ("fileName", file_name)], Some(data));
        send(router, multipart_request("/upload", body)).await
    }

    #[tokio::test]
    async fn test_upload_and_merge_over_http() {
        let test = test_app(StatusCode::OK).await;

        // Submitted out of order, index 10 included
        let mut expected = Vec::new();
        for i in 0..11u8 {
            expected.extend(vec![i; 3]);
        }
        for i in [10u8, 3, 0, 7, 1, 9, 2, 8, 4, 6, 5] {
            let (status, json) = upload(&test.router, "k1", &format!("report.pdf-{}", i), &[i; 3]).await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(json["success"], true);
            assert_eq!(json["identifier"], format!("report.pdf-{}", i));
        }

        let body = multipart_body(&[("key", "k1"), ("fileName", "report.pdf")], None);
        let (status, json) = send(&test.router, multipart_request("/merge", body)).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["success"], true);
        assert_eq!(json["size"], expected.len() as u64);
        assert_eq!(json["chunks"], 11);
        assert_eq!(json["objectKey"], "uploads/k1/report.pdf");

        let puts = test.store.puts();
        assert_eq!(puts.len(), 1);
        assert_eq!(puts[0].path, "/my-bucket/uploads/k1/report.pdf");
        assert_eq!(puts[0].body, expected);
        assert_eq!(puts[0].content_length, Some(expected.len() as u64));
        assert_eq!(puts[0].content_type.as_deref(), Some("application/pdf"));
    }

    #[tokio::test]
    async fn test_merge_accepts_json_and_form() {
        let test = test_app(StatusCode::OK).await;
        upload(&test.router, "k", "a.bin-0", b"abc").await;

        let request = HttpRequest::builder()
            .method("POST")
            .uri("/merge")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"key":"k","fileName":"a.bin"}"#))
            .unwrap();
        let (status, _) = send(&test.router, request).await;
        assert_eq!(status, StatusCode::OK);

        let request = HttpRequest::builder()
            .method("POST")
            .uri("/merge")
            .header("content-type", "application/x-www-form-urlencoded")
            .body(Body::from("key=k&fileName=a.bin"))
            .unwrap();
        let (status, _) = send(&test.router, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(test.store.puts().len(), 2);
    }

    #[tokio::test]
    async fn test_upload_missing_parameters() {
        let test = test_app(StatusCode::OK).await;

        let body = multipart_body(&[("fileName", "a.bin-0")], Some(b"x"));
        let (status, json) = send(&test.router, multipart_request("/upload", body)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["success"], false);
        assert_eq!(json["code"], "MISSING_PARAMETERS");
        assert_eq!(json["error"], "Missing key or fileName");

        let body = multipart_body(&[("key", "k"), ("fileName", "a.bin-0")], None);
        let (status, json) = send(&test.router, multipart_request("/upload", body)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["code"], "MISSING_CHUNK_DATA");
    }

    #[tokio::test]
    async fn test_upload_with_index_field() {
        let test = test_app(StatusCode::OK).await;

        let body = multipart_body(&[("key", "k"), ("fileName", "a.bin"), ("index", "4")], Some(b"x"));
        let (status, json) = send(&test.router, multipart_request("/upload", body)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["identifier"], "a.bin-4");

        let body = multipart_body(&[("key", "k"), ("fileName", "a.bin"), ("index", "-1")], Some(b"x"));
        let (status, json) = send(&test.router, multipart_request("/upload", body)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["code"], "INVALID_PARAMETER");
    }

    #[tokio::test]
    async fn test_merge_missing_parameters() {
        let test = test_app(StatusCode::OK).await;

        let body = multipart_body(&[("key", "k")], None);
        let (status, json) = send(&test.router, multipart_request("/merge", body)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["code"], "MISSING_PARAMETERS");
        assert_eq!(json["stage"], "validate");

        let request = HttpRequest::builder()
            .method("POST")
            .uri("/merge")
            .body(Body::empty())
            .unwrap();
        let (status, json) = send(&test.router, request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["code"], "MISSING_PARAMETERS");
    }

    #[tokio::test]
    async fn test_merge_without_chunks_is_not_found() {
        let test = test_app(StatusCode::OK).await;

        let body = multipart_body(&[("key", "nobody"), ("fileName", "a.bin")], None);
        let (status, json) = send(&test.router, multipart_request("/merge", body)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json["code"], "NO_CHUNKS_FOUND");
        assert_eq!(json["stage"], "order");
    }

    #[tokio::test]
    async fn test_merge_with_gap_is_unprocessable() {
        let test = test_app(StatusCode::OK).await;
        upload(&test.router, "k", "a.bin-0", b"a").await;
        upload(&test.router, "k", "a.bin-2", b"c").await;

        let body = multipart_body(&[("key", "k"), ("fileName", "a.bin")], None);
        let (status, json) = send(&test.router, multipart_request("/merge", body)).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(json["code"], "INCOMPLETE_CHUNK_SET");
        assert!(test.store.puts().is_empty());
    }

    #[tokio::test]
    async fn test_remote_rejection_is_bad_gateway() {
        let test = test_app(StatusCode::FORBIDDEN).await;
        upload(&test.router, "k", "a.bin-0", b"a").await;

        let body = multipart_body(&[("key", "k"), ("fileName", "a.bin")], None);
        let (status, json) = send(&test.router, multipart_request("/merge", body)).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(json["code"], "REMOTE_REJECTED");
        assert_eq!(json["stage"], "publish");
    }

    #[tokio::test]
    async fn test_health() {
        let test = test_app(StatusCode::OK).await;
        let server = axum_test::TestServer::new(test.router).unwrap();

        for path in ["/", "/health"] {
            let response = server.get(path).await;
            response.assert_status_ok();
            let json: Value = response.json();
            assert_eq!(json["status"], "healthy");
            assert_eq!(json["service"], "stitch-server");
        }
    }
}
