//! Defines routes for the chunked upload workflow.
//!
//! ## Structure
//! - **Upload endpoints** (bearer token required)
//!   - `POST /upload/init`        — create a session
//!   - `POST /upload/chunk`       — upload one chunk (multipart)
//!   - `POST /upload/complete`    — stitch chunks and publish the object
//!   - `GET  /upload/{upload_id}` — session progress
//!
//! - **Public endpoints**
//!   - `GET /files/{*key}` — download a completed object
//!   - `GET /healthz`, `GET /readyz`

use crate::{
    handlers::{
        health_handlers::{healthz, readyz},
        upload_handlers::{complete_upload, download_file, get_upload, init_upload, upload_chunk},
    },
    services::upload_service::UploadService,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post},
};

/// Room left for multipart boundaries and the text fields around a chunk.
const MULTIPART_OVERHEAD: usize = 64 * 1024;

/// Build and return the router for all upload routes.
///
/// The chunk route's body limit follows the configured maximum chunk size.
pub fn routes(max_chunk_bytes: usize) -> Router<UploadService> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/upload/init", post(init_upload))
        .route(
            "/upload/chunk",
            post(upload_chunk).layer(DefaultBodyLimit::max(
                max_chunk_bytes.saturating_add(MULTIPART_OVERHEAD),
            )),
        )
        .route("/upload/complete", post(complete_upload))
        .route("/upload/{upload_id}", get(get_upload))
        .route("/files/{*key}", get(download_file))
}
