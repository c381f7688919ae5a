use crate::config::Config;
use axum::{
    Json, Router,
    body::Body,
    extract::{
        DefaultBodyLimit, Multipart, Path, State,
        multipart::{MultipartError, MultipartRejection},
    },
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::Utc;
use docstash_core::{
    BlobStore, ErrorKind, Ledger, ListFilesOperation, ReadFileOperation, ReadFileOperationOutcome,
    ReadFileOperationRequest, Result, RetrievalMode, StashError, UploadFileOperation,
    UploadFileOperationRequest,
};
use futures_util::TryStreamExt;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tower_http::trace::TraceLayer;

/// Room for multipart boundaries and part headers on top of the file itself.
const MULTIPART_OVERHEAD_BYTES: u64 = 1024 * 1024;

const USER_ID_HEADER: &str = "x-user-id";

/// Multipart field names that carry the uploaded file. `file.pdf` is what
/// older clients send.
const FILE_FIELDS: &[&str] = &["file", "file.pdf"];

pub struct ServerState {
    pub upload: UploadFileOperation,
    pub read: ReadFileOperation,
    pub list: ListFilesOperation,
    pub config: Config,
    pub started_at: Instant,
}

impl ServerState {
    pub fn new(config: Config) -> Result<Self> {
        let blob_store = Arc::new(BlobStore::new(config.storage.root.clone())?);
        let ledger = Arc::new(Ledger::new(config.storage.ledger_path()));
        let policy = Arc::new(config.upload.policy());

        Ok(Self {
            upload: UploadFileOperation::new(blob_store.clone(), ledger.clone(), policy),
            read: ReadFileOperation::new(blob_store.clone(), ledger.clone()),
            list: ListFilesOperation::new(blob_store, ledger, config.storage.public_prefix.clone()),
            config,
            started_at: Instant::now(),
        })
    }
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    success: bool,
    kind: &'static str,
    message: String,
}

#[derive(Debug, Serialize)]
struct UploadResponse {
    success: bool,
    message: String,
    filename: String,
    originalname: String,
    size: u64,
    mimetype: String,
    sha256: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    uploadedby: Option<String>,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    timestamp: String,
    uptime_secs: u64,
}

/// Error returned from handlers; rendered as `{success: false, kind, message}`.
#[derive(Debug)]
pub struct ApiError(StashError);

impl From<StashError> for ApiError {
    fn from(error: StashError) -> Self {
        Self(error)
    }
}

pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::InvalidType | ErrorKind::InvalidRequest | ErrorKind::InvalidStorageName => {
            StatusCode::BAD_REQUEST
        }
        ErrorKind::TooLarge => StatusCode::PAYLOAD_TOO_LARGE,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let kind = self.0.kind();
        let status = status_for(kind);

        if status.is_server_error() {
            tracing::error!("Request failed: {}", self.0);
        } else {
            tracing::debug!("Request rejected: {}", self.0);
        }

        let body = ErrorResponse {
            success: false,
            kind: kind.as_str(),
            message: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

pub fn build_router(state: Arc<ServerState>) -> Router {
    let body_limit = state
        .config
        .upload
        .max_bytes
        .saturating_add(MULTIPART_OVERHEAD_BYTES);
    let body_limit = usize::try_from(body_limit).unwrap_or(usize::MAX);

    Router::new()
        .route("/api/health", get(health_handler))
        .route("/api/files", get(list_files))
        .route("/api/files/upload", post(upload_file))
        .route("/api/files/view/:filename", get(view_file))
        .route("/api/files/download/:filename", get(download_file))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

pub async fn run_server(config: Config) -> Result<()> {
    let bind_addr = config.server.bind_addr.clone();
    let state = Arc::new(ServerState::new(config)?);
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!("Server listening on {}", bind_addr);

    axum::serve(listener, app).await?;

    Ok(())
}

async fn health_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    let response = HealthResponse {
        status: "ok",
        timestamp: Utc::now().to_rfc3339(),
        uptime_secs: state.started_at.elapsed().as_secs(),
    };

    (StatusCode::OK, Json(response))
}

async fn list_files(State(state): State<Arc<ServerState>>) -> std::result::Result<Response, ApiError> {
    let entries = state.list.run().await?;
    Ok((StatusCode::OK, Json(entries)).into_response())
}

async fn upload_file(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    multipart: std::result::Result<Multipart, MultipartRejection>,
) -> std::result::Result<Response, ApiError> {
    let mut multipart =
        multipart.map_err(|e| StashError::InvalidRequest(format!("expected multipart form: {}", e)))?;

    let identity = headers
        .get(USER_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string);

    let limit = state.upload.policy().max_upload_bytes;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| multipart_error(e, limit))?
    {
        let is_file_field = field
            .name()
            .map(|name| FILE_FIELDS.contains(&name))
            .unwrap_or(false);
        if !is_file_field {
            continue;
        }

        let original_name = field.file_name().unwrap_or_default().to_string();
        let mime_type = field
            .content_type()
            .unwrap_or("application/octet-stream")
            .to_string();

        let body = field.map_err(move |e| multipart_error(e, limit));
        let stored = state
            .upload
            .run(UploadFileOperationRequest {
                body,
                mime_type,
                original_name,
                declared_size: None,
                identity,
            })
            .await?;

        let response = UploadResponse {
            success: true,
            message: "File uploaded successfully".to_string(),
            filename: stored.storage_name,
            originalname: stored.original_name,
            size: stored.size_bytes,
            mimetype: stored.mime_type,
            sha256: stored.sha256,
            uploadedby: stored.uploaded_by,
        };
        return Ok((StatusCode::CREATED, Json(response)).into_response());
    }

    Err(StashError::InvalidRequest("No file uploaded".to_string()).into())
}

fn multipart_error(error: MultipartError, limit: u64) -> StashError {
    if error.status() == StatusCode::PAYLOAD_TOO_LARGE {
        StashError::TooLarge { limit }
    } else {
        StashError::StreamInterrupted(error.body_text())
    }
}

async fn view_file(
    State(state): State<Arc<ServerState>>,
    Path(filename): Path<String>,
) -> std::result::Result<Response, ApiError> {
    serve_file(&state, filename, RetrievalMode::Inline).await
}

async fn download_file(
    State(state): State<Arc<ServerState>>,
    Path(filename): Path<String>,
) -> std::result::Result<Response, ApiError> {
    serve_file(&state, filename, RetrievalMode::Attachment).await
}

async fn serve_file(
    state: &ServerState,
    filename: String,
    mode: RetrievalMode,
) -> std::result::Result<Response, ApiError> {
    let outcome = state
        .read
        .run(ReadFileOperationRequest {
            storage_name: filename.clone(),
            mode,
        })
        .await?;

    let result = match outcome {
        ReadFileOperationOutcome::Found(result) => result,
        ReadFileOperationOutcome::NotFound => {
            return Err(StashError::NotFound(filename).into());
        }
    };

    let headers = [
        (header::CONTENT_TYPE, result.mime_type),
        (header::CONTENT_DISPOSITION, result.content_disposition),
        (header::CONTENT_LENGTH, result.size_bytes.to_string()),
        (header::X_CONTENT_TYPE_OPTIONS, "nosniff".to_string()),
    ];

    // Headers are committed once the body starts; a read failure after that
    // only cuts the stream short.
    let body = Body::from_stream(result.reader.into_stream());
    Ok((StatusCode::OK, headers, body).into_response())
}
