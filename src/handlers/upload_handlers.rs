//! HTTP handlers for the chunked upload workflow.
//!
//! Handlers only parse requests and shape responses; every rule about sessions
//! lives in `UploadService`.

use crate::{
    auth::AuthenticatedUser,
    errors::AppError,
    models::upload_session::{UploadSession, UploadStatus},
    services::upload_service::{IncomingChunk, NewUpload, UploadError, UploadService},
};
use axum::{
    Json,
    body::Body,
    extract::{Multipart, Path, State, rejection::JsonRejection},
    http::{HeaderValue, StatusCode, header},
    response::Response,
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use tokio_util::io::ReaderStream;
use uuid::Uuid;

/// Body of `POST /upload/init`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitUploadReq {
    pub file_name: Option<String>,
    pub file_size: Option<u64>,
    pub file_type: Option<String>,
    pub total_chunks: Option<u32>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitUploadResp {
    pub upload_id: Uuid,
    pub storage_path: String,
    pub status: UploadStatus,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkResp {
    pub chunk_index: u32,
    pub total_chunks: u32,
    pub received: i64,
    pub status: UploadStatus,
}

/// Body of `POST /upload/complete`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteUploadReq {
    pub upload_id: Option<String>,
    pub file_name: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteUploadResp {
    pub file_url: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadStatusResp {
    pub upload_id: Uuid,
    pub status: UploadStatus,
    pub file_name: String,
    pub storage_path: String,
    pub file_size: i64,
    pub mime_type: Option<String>,
    pub total_chunks: i64,
    pub chunks_received: i64,
    pub received_chunks: Vec<i64>,
    pub missing_chunks: Vec<i64>,
    pub file_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// `POST /upload/init`: create a session.
pub async fn init_upload(
    State(service): State<UploadService>,
    user: AuthenticatedUser,
    payload: Result<Json<InitUploadReq>, JsonRejection>,
) -> Result<Json<InitUploadResp>, AppError> {
    let Json(req) = payload?;
    let new_upload = NewUpload {
        file_name: req
            .file_name
            .ok_or_else(|| AppError::bad_request("fileName is required"))?,
        file_size: req
            .file_size
            .ok_or_else(|| AppError::bad_request("fileSize is required"))?,
        mime_type: req.file_type,
        total_chunks: req
            .total_chunks
            .ok_or_else(|| AppError::bad_request("totalChunks is required"))?,
    };

    let session = service.initiate(&user.owner_id, new_upload).await?;
    Ok(Json(InitUploadResp {
        upload_id: session.upload_id,
        storage_path: session.storage_path,
        status: session.status,
    }))
}

/// `POST /upload/chunk`: multipart form with `file`, `uploadId`, `chunkIndex`,
/// `totalChunks` and an optional base64 MD5 `checksum`.
pub async fn upload_chunk(
    State(service): State<UploadService>,
    user: AuthenticatedUser,
    mut multipart: Multipart,
) -> Result<Json<ChunkResp>, AppError> {
    let mut data: Option<Bytes> = None;
    let mut upload_id: Option<String> = None;
    let mut chunk_index: Option<String> = None;
    let mut total_chunks: Option<String> = None;
    let mut checksum: Option<String> = None;

    while let Some(field) = multipart.next_field().await? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" => data = Some(field.bytes().await?),
            "uploadId" => upload_id = Some(field.text().await?),
            "chunkIndex" => chunk_index = Some(field.text().await?),
            "totalChunks" => total_chunks = Some(field.text().await?),
            "checksum" => checksum = Some(field.text().await?),
            _ => {}
        }
    }

    let upload_id = parse_upload_id(upload_id.as_deref())?;
    let chunk = IncomingChunk {
        chunk_index: parse_field(chunk_index.as_deref(), "chunkIndex")?,
        total_chunks: parse_field(total_chunks.as_deref(), "totalChunks")?,
        data: data.ok_or_else(|| AppError::bad_request("file is required"))?,
        checksum: checksum.filter(|c| !c.trim().is_empty()),
    };

    let receipt = service
        .receive_chunk(&user.owner_id, upload_id, chunk)
        .await?;
    Ok(Json(ChunkResp {
        chunk_index: receipt.chunk_index,
        total_chunks: receipt.total_chunks,
        received: receipt.chunks_received,
        status: receipt.status,
    }))
}

/// `POST /upload/complete`: stitch the chunks and return the object URL.
pub async fn complete_upload(
    State(service): State<UploadService>,
    user: AuthenticatedUser,
    payload: Result<Json<CompleteUploadReq>, JsonRejection>,
) -> Result<Json<CompleteUploadResp>, AppError> {
    let Json(req) = payload?;
    let upload_id = parse_upload_id(req.upload_id.as_deref())?;

    let session = service
        .finalize(&user.owner_id, upload_id, req.file_name.as_deref())
        .await?;
    let file_url = session
        .final_object_url
        .ok_or_else(|| AppError::internal("completed upload has no URL"))?;
    Ok(Json(CompleteUploadResp { file_url }))
}

/// `GET /upload/{upload_id}`: progress of a session, for resuming clients.
pub async fn get_upload(
    State(service): State<UploadService>,
    user: AuthenticatedUser,
    Path(upload_id): Path<String>,
) -> Result<Json<UploadStatusResp>, AppError> {
    let upload_id = parse_upload_id(Some(&upload_id))?;
    let (session, chunks) = service.status(&user.owner_id, upload_id).await?;

    let received_chunks: Vec<i64> = chunks.iter().map(|c| c.chunk_index).collect();
    let missing_chunks = missing_indices(&received_chunks, session.total_chunks);
    Ok(Json(status_response(session, received_chunks, missing_chunks)))
}

/// `GET /files/{*key}`: stream a completed upload.
pub async fn download_file(
    State(service): State<UploadService>,
    Path(key): Path<String>,
) -> Result<Response, AppError> {
    let (session, file) = service.open_completed(&key).await?;
    let size_bytes = file
        .metadata()
        .await
        .map_err(UploadError::Storage)?
        .len();
    let body = Body::from_stream(ReaderStream::new(file));

    let mut response = Response::new(body);
    *response.status_mut() = StatusCode::OK;
    let headers = response.headers_mut();
    let content_type = session
        .declared_mime_type
        .as_deref()
        .and_then(|v| HeaderValue::from_str(v).ok())
        .unwrap_or_else(|| HeaderValue::from_static("application/octet-stream"));
    headers.insert(header::CONTENT_TYPE, content_type);
    headers.insert(
        header::CONTENT_LENGTH,
        HeaderValue::from(size_bytes),
    );
    if let Some(etag) = session.etag.as_ref() {
        if let Ok(value) = HeaderValue::from_str(&format!("\"{}\"", etag)) {
            headers.insert(header::ETAG, value);
        }
    }
    if let Ok(value) = HeaderValue::from_str(&session.updated_at.to_rfc2822()) {
        headers.insert(header::LAST_MODIFIED, value);
    }

    Ok(response)
}

fn status_response(
    session: UploadSession,
    received_chunks: Vec<i64>,
    missing_chunks: Vec<i64>,
) -> UploadStatusResp {
    UploadStatusResp {
        upload_id: session.upload_id,
        status: session.status,
        file_name: session.original_file_name,
        storage_path: session.storage_path,
        file_size: session.declared_file_size,
        mime_type: session.declared_mime_type,
        total_chunks: session.total_chunks,
        chunks_received: session.chunks_received,
        received_chunks,
        missing_chunks,
        file_url: session.final_object_url,
        created_at: session.created_at,
        updated_at: session.updated_at,
    }
}

/// Indices in `0..total` absent from the sorted `received` list.
fn missing_indices(received: &[i64], total: i64) -> Vec<i64> {
    (0..total)
        .filter(|i| received.binary_search(i).is_err())
        .collect()
}

/// Malformed ids cannot name a session, so they are reported as 404 like unknown ones.
fn parse_upload_id(raw: Option<&str>) -> Result<Uuid, AppError> {
    let raw = raw
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| AppError::bad_request("uploadId is required"))?;
    Uuid::parse_str(raw).map_err(|_| AppError::not_found(format!("upload `{}` not found", raw)))
}

fn parse_field<T: FromStr>(raw: Option<&str>, name: &str) -> Result<T, AppError> {
    let raw = raw.ok_or_else(|| AppError::bad_request(format!("{} is required", name)))?;
    raw.trim()
        .parse::<T>()
        .map_err(|_| AppError::bad_request(format!("{} must be a non-negative integer", name)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_indices_lists_gaps() {
        assert_eq!(missing_indices(&[0, 2, 5], 6), vec![1, 3, 4]);
        assert!(missing_indices(&[0, 1], 2).is_empty());
        assert_eq!(missing_indices(&[], 2), vec![0, 1]);
    }

    #[test]
    fn upload_id_parsing() {
        assert_eq!(
            parse_upload_id(None).unwrap_err().status,
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            parse_upload_id(Some("not-a-uuid")).unwrap_err().status,
            StatusCode::NOT_FOUND
        );
        let id = Uuid::new_v4();
        assert_eq!(parse_upload_id(Some(&id.to_string())).unwrap(), id);
    }

    #[test]
    fn numeric_fields_reject_negatives() {
        assert!(parse_field::<u32>(Some("-1"), "chunkIndex").is_err());
        assert_eq!(parse_field::<u32>(Some(" 3 "), "chunkIndex").unwrap(), 3);
    }
}
