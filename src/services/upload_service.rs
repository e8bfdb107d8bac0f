//! src/services/upload_service.rs
//!
//! UploadService: the three-step chunked upload workflow (initiate, receive
//! chunk, finalize) plus the expiry sweep. Session metadata and the set of
//! received chunk indices live in SQLite; payloads live in the `BlobStore`
//! beneath each session's `storage_path`.
//!
//! Every mutation of a session row is a conditional update keyed on the status
//! the caller observed, so concurrent requests cannot move a session backwards
//! or complete it twice.

use crate::{
    config::UploadLimits,
    models::upload_session::{ReceivedChunk, UploadSession, UploadStatus},
    services::blob_store::{BlobStore, StoredBlob},
};
use base64::{Engine as _, engine::general_purpose};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use std::{io, sync::Arc};
use thiserror::Error;
use tokio::fs::File;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const MAX_FILE_NAME_LEN: usize = 255;
const CHUNK_DIR: &str = ".chunks";

macro_rules! session_columns {
    () => {
        "upload_id, owner_id, original_file_name, safe_file_name, storage_path, \
         declared_file_size, declared_mime_type, total_chunks, chunks_received, status, \
         final_object_key, final_object_url, etag, failure_reason, created_at, updated_at"
    };
}

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("{0}")]
    Validation(String),
    #[error("upload `{0}` not found")]
    NotFound(Uuid),
    #[error("object `{0}` not found")]
    ObjectNotFound(String),
    #[error("upload `{upload_id}` does not belong to the caller")]
    Forbidden { upload_id: Uuid },
    #[error("{0}")]
    Conflict(String),
    #[error("received {received} of {total} chunks")]
    Incomplete { received: i64, total: i64 },
    #[error("reassembly failed: {0}")]
    Reassembly(String),
    #[error(transparent)]
    Storage(#[from] io::Error),
    #[error(transparent)]
    Persistence(#[from] sqlx::Error),
}

impl UploadError {
    /// Failures caused by this service or its backends rather than by the request.
    pub fn is_server_error(&self) -> bool {
        matches!(
            self,
            Self::Storage(_) | Self::Persistence(_) | Self::Reassembly(_)
        )
    }
}

pub type UploadResult<T> = Result<T, UploadError>;

/// Parameters accepted by [`UploadService::initiate`].
#[derive(Debug, Clone)]
pub struct NewUpload {
    pub file_name: String,
    pub file_size: u64,
    pub mime_type: Option<String>,
    pub total_chunks: u32,
}

/// One chunk as delivered by a client.
#[derive(Debug, Clone)]
pub struct IncomingChunk {
    pub chunk_index: u32,
    pub total_chunks: u32,
    pub data: Bytes,
    /// Base64 MD5 of `data` (Content-MD5 convention).
    pub checksum: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkReceipt {
    pub chunk_index: u32,
    pub total_chunks: u32,
    pub chunks_received: i64,
    pub status: UploadStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired: usize,
    pub reclaim_failures: usize,
}

/// UploadService drives the chunked upload state machine:
/// - `initiate` creates the session row and reserves its blob directory
/// - `receive_chunk` stores a chunk and records its index
/// - `finalize` stitches the chunks into one object and publishes its URL
/// - `sweep_expired` fails and reclaims sessions abandoned by their clients
#[derive(Clone)]
pub struct UploadService {
    /// Shared SQLite connection pool used for session metadata.
    pub db: Arc<SqlitePool>,

    /// Payload storage for chunks and final objects.
    pub blobs: BlobStore,

    pub limits: UploadLimits,
}

impl UploadService {
    pub fn new(db: Arc<SqlitePool>, blobs: BlobStore, limits: UploadLimits) -> Self {
        Self { db, blobs, limits }
    }

    /// Create a session in `initialized` state and reserve its storage directory.
    pub async fn initiate(&self, owner_id: &str, req: NewUpload) -> UploadResult<UploadSession> {
        self.initiate_inner(owner_id, req)
            .await
            .inspect_err(|err| log_failure("initiate", None, owner_id, err))
    }

    async fn initiate_inner(&self, owner_id: &str, req: NewUpload) -> UploadResult<UploadSession> {
        let original_file_name = req.file_name.trim().to_string();
        if original_file_name.is_empty() {
            return Err(UploadError::Validation("fileName must not be empty".into()));
        }
        if req.file_size == 0 {
            return Err(UploadError::Validation(
                "fileSize must be greater than zero".into(),
            ));
        }
        let declared_file_size = i64::try_from(req.file_size)
            .map_err(|_| UploadError::Validation("fileSize is too large".into()))?;
        if req.total_chunks == 0 {
            return Err(UploadError::Validation(
                "totalChunks must be at least 1".into(),
            ));
        }
        if req.total_chunks > self.limits.max_total_chunks {
            return Err(UploadError::Validation(format!(
                "totalChunks must not exceed {}",
                self.limits.max_total_chunks
            )));
        }
        if u64::from(req.total_chunks) > req.file_size {
            return Err(UploadError::Validation(
                "totalChunks must not exceed fileSize".into(),
            ));
        }

        let upload_id = Uuid::new_v4();
        let now = Utc::now();
        let safe_file_name = sanitize_file_name(&original_file_name);
        let storage_path = format!(
            "{}/{}-{}",
            sanitize_file_name(owner_id),
            now.timestamp_millis(),
            upload_id.simple()
        );
        let mime_type = req
            .mime_type
            .map(|m| m.trim().to_string())
            .filter(|m| !m.is_empty());

        self.blobs.reserve(&storage_path).await?;

        let inserted = sqlx::query_as::<_, UploadSession>(concat!(
            "INSERT INTO upload_sessions (
                upload_id, owner_id, original_file_name, safe_file_name, storage_path,
                declared_file_size, declared_mime_type, total_chunks, chunks_received,
                status, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, 0, ?, ?, ?)
            RETURNING ",
            session_columns!()
        ))
        .bind(upload_id)
        .bind(owner_id)
        .bind(&original_file_name)
        .bind(&safe_file_name)
        .bind(&storage_path)
        .bind(declared_file_size)
        .bind(mime_type)
        .bind(i64::from(req.total_chunks))
        .bind(UploadStatus::Initialized)
        .bind(now)
        .bind(now)
        .fetch_one(&*self.db)
        .await;

        match inserted {
            Ok(session) => {
                info!(
                    upload_id = %session.upload_id,
                    owner_id = %owner_id,
                    total_chunks = session.total_chunks,
                    storage_path = %session.storage_path,
                    "upload initiated"
                );
                Ok(session)
            }
            Err(err) => {
                if let Err(cleanup) = self.blobs.delete_prefix(&storage_path).await {
                    debug!("failed to release {} after insert error: {}", storage_path, cleanup);
                }
                Err(UploadError::Persistence(err))
            }
        }
    }

    /// Store one chunk and record its index in the session's received set.
    ///
    /// Re-sending an index overwrites its payload but never counts twice.
    pub async fn receive_chunk(
        &self,
        owner_id: &str,
        upload_id: Uuid,
        chunk: IncomingChunk,
    ) -> UploadResult<ChunkReceipt> {
        let chunk_index = chunk.chunk_index;
        self.receive_chunk_inner(owner_id, upload_id, chunk)
            .await
            .inspect_err(|err| {
                log_failure(
                    &format!("receive_chunk[{}]", chunk_index),
                    Some(upload_id),
                    owner_id,
                    err,
                )
            })
    }

    async fn receive_chunk_inner(
        &self,
        owner_id: &str,
        upload_id: Uuid,
        chunk: IncomingChunk,
    ) -> UploadResult<ChunkReceipt> {
        let session = self.fetch_owned(upload_id, owner_id).await?;

        if i64::from(chunk.total_chunks) != session.total_chunks {
            return Err(UploadError::Validation(format!(
                "totalChunks {} does not match the {} declared at init",
                chunk.total_chunks, session.total_chunks
            )));
        }
        if chunk.chunk_index >= chunk.total_chunks {
            return Err(UploadError::Validation(format!(
                "chunkIndex {} is out of range 0..{}",
                chunk.chunk_index, chunk.total_chunks
            )));
        }
        if chunk.data.is_empty() {
            return Err(UploadError::Validation("chunk is empty".into()));
        }
        if chunk.data.len() > self.limits.max_chunk_bytes {
            return Err(UploadError::Validation(format!(
                "chunk exceeds {} bytes",
                self.limits.max_chunk_bytes
            )));
        }
        if let Some(expected) = chunk.checksum.as_deref() {
            verify_checksum(expected, &chunk.data)?;
        }
        if !session.status.accepts_chunks() {
            return Err(UploadError::Conflict(format!(
                "upload is {} and no longer accepts chunks",
                session.status
            )));
        }

        let key = chunk_key(&session.storage_path, chunk.chunk_index, Uuid::new_v4());
        let size_bytes = chunk.data.len() as i64;
        self.blobs.put_bytes(&key, chunk.data).await?;

        // The index is recorded only once the payload is durable.
        let updated = self
            .record_chunk(
                &session,
                chunk.chunk_index,
                &key,
                size_bytes,
                chunk.checksum.as_deref(),
            )
            .await?;

        debug!(
            upload_id = %upload_id,
            chunk_index = chunk.chunk_index,
            received = updated.chunks_received,
            total = updated.total_chunks,
            "chunk stored"
        );
        if updated.status == UploadStatus::Uploaded && session.status != UploadStatus::Uploaded {
            info!(upload_id = %upload_id, owner_id = %owner_id, "all chunks received");
        }

        Ok(ChunkReceipt {
            chunk_index: chunk.chunk_index,
            total_chunks: chunk.total_chunks,
            chunks_received: updated.chunks_received,
            status: updated.status,
        })
    }

    /// Point `chunk_index` at `blob_key` and recompute the session's progress.
    ///
    /// If the receipt cannot be recorded, for instance because the session
    /// stopped accepting chunks since it was read, `blob_key` is removed so
    /// nothing outlives the session. A replaced receipt's blob is removed after
    /// commit.
    async fn record_chunk(
        &self,
        session: &UploadSession,
        chunk_index: u32,
        blob_key: &str,
        size_bytes: i64,
        checksum: Option<&str>,
    ) -> UploadResult<UploadSession> {
        let upload_id = session.upload_id;
        match self
            .record_chunk_tx(upload_id, chunk_index, blob_key, size_bytes, checksum)
            .await
        {
            Ok((updated, replaced)) => {
                if let Some(old_key) = replaced.filter(|old| old != blob_key) {
                    if let Err(err) = self.blobs.delete(&old_key).await {
                        warn!(upload_id = %upload_id, "failed to remove replaced chunk {}: {}", old_key, err);
                    }
                }
                Ok(updated)
            }
            Err(err) => {
                if let Err(cleanup) = self
                    .blobs
                    .delete_and_prune(blob_key, &session.storage_path)
                    .await
                {
                    warn!(upload_id = %upload_id, "failed to remove unrecorded chunk {}: {}", blob_key, cleanup);
                }
                Err(err)
            }
        }
    }

    /// Returns the updated session and the blob key the receipt replaced, if any.
    async fn record_chunk_tx(
        &self,
        upload_id: Uuid,
        chunk_index: u32,
        blob_key: &str,
        size_bytes: i64,
        checksum: Option<&str>,
    ) -> UploadResult<(UploadSession, Option<String>)> {
        let now = Utc::now();
        let mut tx = self.db.begin().await?;

        let replaced = sqlx::query_scalar::<_, String>(
            "SELECT blob_key FROM upload_chunks WHERE upload_id = ? AND chunk_index = ?",
        )
        .bind(upload_id)
        .bind(i64::from(chunk_index))
        .fetch_optional(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO upload_chunks (upload_id, chunk_index, blob_key, size_bytes, checksum, received_at)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(upload_id, chunk_index) DO UPDATE SET
                blob_key = excluded.blob_key,
                size_bytes = excluded.size_bytes,
                checksum = excluded.checksum,
                received_at = excluded.received_at",
        )
        .bind(upload_id)
        .bind(i64::from(chunk_index))
        .bind(blob_key)
        .bind(size_bytes)
        .bind(checksum)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let updated = sqlx::query_as::<_, UploadSession>(concat!(
            "UPDATE upload_sessions SET
                chunks_received = (SELECT COUNT(*) FROM upload_chunks WHERE upload_id = ?),
                status = CASE
                    WHEN (SELECT COUNT(*) FROM upload_chunks WHERE upload_id = ?) >= total_chunks
                    THEN 'uploaded' ELSE 'in_progress' END,
                updated_at = ?
             WHERE upload_id = ? AND status IN ('initialized', 'in_progress', 'uploaded')
             RETURNING ",
            session_columns!()
        ))
        .bind(upload_id)
        .bind(upload_id)
        .bind(now)
        .bind(upload_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(updated) = updated else {
            // Finalize or the sweeper moved the session on between our read and write.
            tx.rollback().await?;
            return Err(UploadError::Conflict(
                "upload no longer accepts chunks".into(),
            ));
        };
        tx.commit().await?;
        Ok((updated, replaced))
    }

    /// Stitch all chunks into the final object and publish its URL.
    ///
    /// Calling this again after completion returns the stored session untouched.
    /// `file_name`, when given and non-blank, overrides the name chosen at init.
    pub async fn finalize(
        &self,
        owner_id: &str,
        upload_id: Uuid,
        file_name: Option<&str>,
    ) -> UploadResult<UploadSession> {
        self.finalize_inner(owner_id, upload_id, file_name)
            .await
            .inspect_err(|err| log_failure("finalize", Some(upload_id), owner_id, err))
    }

    async fn finalize_inner(
        &self,
        owner_id: &str,
        upload_id: Uuid,
        file_name: Option<&str>,
    ) -> UploadResult<UploadSession> {
        let session = self.fetch_owned(upload_id, owner_id).await?;
        match session.status {
            UploadStatus::Completed => return Ok(session),
            UploadStatus::Failed => {
                return Err(UploadError::Conflict(
                    "upload failed; start a new upload".into(),
                ));
            }
            UploadStatus::Processing => {
                return Err(UploadError::Conflict(
                    "upload is already being finalized".into(),
                ));
            }
            _ => {}
        }

        let received = self.count_chunks(upload_id).await?;
        if received < session.total_chunks {
            return Err(UploadError::Incomplete {
                received,
                total: session.total_chunks,
            });
        }

        let safe_file_name = file_name
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(sanitize_file_name)
            .unwrap_or_else(|| session.safe_file_name.clone());

        let Some(session) = self
            .transition(upload_id, UploadStatus::Uploaded, UploadStatus::Processing)
            .await?
        else {
            // Lost the race to another finalize (or the sweeper).
            let current = self.fetch_owned(upload_id, owner_id).await?;
            return match current.status {
                UploadStatus::Completed => Ok(current),
                status => Err(UploadError::Conflict(format!(
                    "upload is {} and cannot be finalized",
                    status
                ))),
            };
        };
        info!(upload_id = %upload_id, owner_id = %owner_id, "finalizing upload");

        let final_key = format!("{}/{}", session.storage_path, safe_file_name);
        let stored = match self.reassemble(&session, &final_key).await {
            Ok(stored) => stored,
            Err(reason) => {
                if let Err(err) = self.blobs.delete(&final_key).await {
                    debug!("failed to remove partial object {}: {}", final_key, err);
                }
                if let Err(err) = self
                    .mark_failed(upload_id, UploadStatus::Processing, &reason)
                    .await
                {
                    error!(upload_id = %upload_id, "failed to mark upload failed: {}", err);
                }
                return Err(UploadError::Reassembly(reason));
            }
        };

        self.reclaim_chunks(&session).await;

        let completed = self.publish(upload_id, &final_key, &stored).await?;
        info!(
            upload_id = %upload_id,
            owner_id = %owner_id,
            size_bytes = stored.size_bytes,
            url = completed.final_object_url.as_deref().unwrap_or_default(),
            "upload completed"
        );
        Ok(completed)
    }

    /// Delete the recorded chunk blobs one by one and prune the emptied chunk
    /// directory. Blobs written by rejected late chunks are removed by their
    /// own request. Failures are logged only.
    async fn reclaim_chunks(&self, session: &UploadSession) {
        let chunks = match self.list_chunks(session.upload_id).await {
            Ok(chunks) => chunks,
            Err(err) => {
                warn!(upload_id = %session.upload_id, "failed to list chunks for reclaim: {}", err);
                return;
            }
        };
        for chunk in chunks {
            if let Err(err) = self
                .blobs
                .delete_and_prune(&chunk.blob_key, &session.storage_path)
                .await
            {
                warn!(upload_id = %session.upload_id, "failed to reclaim chunk {}: {}", chunk.blob_key, err);
            }
        }
    }

    /// Move a `processing` session to `completed` with its final object.
    ///
    /// If the session was expired meanwhile, the final object is removed and
    /// the caller gets a conflict.
    async fn publish(
        &self,
        upload_id: Uuid,
        final_key: &str,
        stored: &StoredBlob,
    ) -> UploadResult<UploadSession> {
        let url = self.blobs.public_url(final_key);
        let completed = sqlx::query_as::<_, UploadSession>(concat!(
            "UPDATE upload_sessions SET
                status = 'completed',
                final_object_key = ?,
                final_object_url = ?,
                etag = ?,
                updated_at = ?
             WHERE upload_id = ? AND status = 'processing'
             RETURNING ",
            session_columns!()
        ))
        .bind(final_key)
        .bind(&url)
        .bind(&stored.etag)
        .bind(Utc::now())
        .bind(upload_id)
        .fetch_optional(&*self.db)
        .await?;

        match completed {
            Some(session) => Ok(session),
            None => {
                if let Err(err) = self.blobs.delete(final_key).await {
                    warn!(upload_id = %upload_id, "failed to remove orphaned object {}: {}", final_key, err);
                }
                Err(UploadError::Conflict(
                    "upload was expired while it was being finalized".into(),
                ))
            }
        }
    }

    /// Concatenate the recorded chunk blobs in index order into `final_key` and
    /// verify its length.
    ///
    /// Errors are returned as a reason string destined for `failure_reason`.
    async fn reassemble(
        &self,
        session: &UploadSession,
        final_key: &str,
    ) -> Result<StoredBlob, String> {
        let chunks = self
            .list_chunks(session.upload_id)
            .await
            .map_err(|err| format!("listing chunks: {}", err))?;
        let covers_all = chunks.len() as i64 == session.total_chunks
            && chunks
                .iter()
                .enumerate()
                .all(|(i, chunk)| chunk.chunk_index == i as i64);
        if !covers_all {
            return Err(format!(
                "recorded chunks do not cover 0..{}",
                session.total_chunks
            ));
        }

        let sources: Vec<String> = chunks.into_iter().map(|chunk| chunk.blob_key).collect();
        let stored = self
            .blobs
            .concat(&sources, final_key)
            .await
            .map_err(|err| format!("concatenating chunks: {}", err))?;

        if stored.size_bytes != session.declared_file_size as u64 {
            return Err(format!(
                "assembled {} bytes but {} were declared",
                stored.size_bytes, session.declared_file_size
            ));
        }
        Ok(stored)
    }

    /// Session metadata plus the recorded chunks, for clients resuming an upload.
    pub async fn status(
        &self,
        owner_id: &str,
        upload_id: Uuid,
    ) -> UploadResult<(UploadSession, Vec<ReceivedChunk>)> {
        let session = self.fetch_owned(upload_id, owner_id).await?;
        let chunks = self.list_chunks(upload_id).await?;
        Ok((session, chunks))
    }

    /// Open a completed upload's final object by its blob key.
    pub async fn open_completed(&self, key: &str) -> UploadResult<(UploadSession, File)> {
        let session = sqlx::query_as::<_, UploadSession>(concat!(
            "SELECT ",
            session_columns!(),
            " FROM upload_sessions WHERE final_object_key = ? AND status = 'completed'"
        ))
        .bind(key)
        .fetch_optional(&*self.db)
        .await?
        .ok_or_else(|| UploadError::ObjectNotFound(key.to_string()))?;

        let file = self.blobs.open(key).await.map_err(|err| {
            if err.kind() == io::ErrorKind::NotFound {
                UploadError::ObjectNotFound(key.to_string())
            } else {
                UploadError::Storage(err)
            }
        })?;
        Ok((session, file))
    }

    /// Fail every non-terminal session untouched since `cutoff` and reclaim its chunks.
    pub async fn sweep_expired(&self, cutoff: DateTime<Utc>) -> UploadResult<SweepReport> {
        let stale = sqlx::query_as::<_, UploadSession>(concat!(
            "SELECT ",
            session_columns!(),
            " FROM upload_sessions
             WHERE status IN ('initialized', 'in_progress', 'uploaded', 'processing')
               AND updated_at < ?
             ORDER BY updated_at ASC"
        ))
        .bind(cutoff)
        .fetch_all(&*self.db)
        .await?;

        let mut report = SweepReport::default();
        for session in stale {
            let result = sqlx::query(
                "UPDATE upload_sessions
                 SET status = 'failed', failure_reason = 'expired', updated_at = ?
                 WHERE upload_id = ? AND status = ? AND updated_at = ?",
            )
            .bind(Utc::now())
            .bind(session.upload_id)
            .bind(session.status)
            .bind(session.updated_at)
            .execute(&*self.db)
            .await?;
            if result.rows_affected() == 0 {
                continue;
            }

            report.expired += 1;
            info!(
                upload_id = %session.upload_id,
                owner_id = %session.owner_id,
                previous_status = %session.status,
                "expired abandoned upload"
            );
            if let Err(err) = self
                .blobs
                .delete_prefix(&chunk_prefix(&session.storage_path))
                .await
            {
                report.reclaim_failures += 1;
                warn!(upload_id = %session.upload_id, "failed to reclaim chunks: {}", err);
            }
        }
        Ok(report)
    }

    async fn fetch_session(&self, upload_id: Uuid) -> UploadResult<UploadSession> {
        sqlx::query_as::<_, UploadSession>(concat!(
            "SELECT ",
            session_columns!(),
            " FROM upload_sessions WHERE upload_id = ?"
        ))
        .bind(upload_id)
        .fetch_one(&*self.db)
        .await
        .map_err(|err| match err {
            sqlx::Error::RowNotFound => UploadError::NotFound(upload_id),
            other => UploadError::Persistence(other),
        })
    }

    /// Fetch a session and ensure `owner_id` initiated it.
    async fn fetch_owned(&self, upload_id: Uuid, owner_id: &str) -> UploadResult<UploadSession> {
        let session = self.fetch_session(upload_id).await?;
        if !session.is_owned_by(owner_id) {
            return Err(UploadError::Forbidden { upload_id });
        }
        Ok(session)
    }

    async fn count_chunks(&self, upload_id: Uuid) -> UploadResult<i64> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM upload_chunks WHERE upload_id = ?",
        )
        .bind(upload_id)
        .fetch_one(&*self.db)
        .await?;
        Ok(count)
    }

    async fn list_chunks(&self, upload_id: Uuid) -> UploadResult<Vec<ReceivedChunk>> {
        let chunks = sqlx::query_as::<_, ReceivedChunk>(
            "SELECT upload_id, chunk_index, blob_key, size_bytes, checksum, received_at
             FROM upload_chunks WHERE upload_id = ? ORDER BY chunk_index ASC",
        )
        .bind(upload_id)
        .fetch_all(&*self.db)
        .await?;
        Ok(chunks)
    }

    /// Compare-and-set the session status. Returns `None` if `from` no longer holds.
    async fn transition(
        &self,
        upload_id: Uuid,
        from: UploadStatus,
        to: UploadStatus,
    ) -> UploadResult<Option<UploadSession>> {
        debug_assert!(from.can_transition_to(to));
        let session = sqlx::query_as::<_, UploadSession>(concat!(
            "UPDATE upload_sessions SET status = ?, updated_at = ?
             WHERE upload_id = ? AND status = ?
             RETURNING ",
            session_columns!()
        ))
        .bind(to)
        .bind(Utc::now())
        .bind(upload_id)
        .bind(from)
        .fetch_optional(&*self.db)
        .await?;
        Ok(session)
    }

    async fn mark_failed(
        &self,
        upload_id: Uuid,
        from: UploadStatus,
        reason: &str,
    ) -> UploadResult<bool> {
        let result = sqlx::query(
            "UPDATE upload_sessions SET status = 'failed', failure_reason = ?, updated_at = ?
             WHERE upload_id = ? AND status = ?",
        )
        .bind(reason)
        .bind(Utc::now())
        .bind(upload_id)
        .bind(from)
        .execute(&*self.db)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

/// Restrict a client-supplied name to `[A-Za-z0-9._-]`.
///
/// Leading dots are dropped so the result can never name the placeholder, the
/// chunk directory, or a parent directory.
pub fn sanitize_file_name(name: &str) -> String {
    let replaced: String = name
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let mut safe = replaced.trim_start_matches('.').to_string();
    safe.truncate(MAX_FILE_NAME_LEN);
    if safe.is_empty() {
        "file".to_string()
    } else {
        safe
    }
}

fn chunk_prefix(storage_path: &str) -> String {
    format!("{}/{}", storage_path, CHUNK_DIR)
}

fn chunk_key(storage_path: &str, chunk_index: u32, receipt: Uuid) -> String {
    format!(
        "{}/{:08}.{}.part",
        chunk_prefix(storage_path),
        chunk_index,
        receipt.simple()
    )
}

fn verify_checksum(expected: &str, data: &[u8]) -> UploadResult<()> {
    let decoded = general_purpose::STANDARD
        .decode(expected.trim())
        .map_err(|_| UploadError::Validation("checksum must be a base64 MD5 digest".into()))?;
    if decoded.as_slice() != md5::compute(data).0.as_slice() {
        return Err(UploadError::Validation("chunk checksum mismatch".into()));
    }
    Ok(())
}

fn log_failure(step: &str, upload_id: Option<Uuid>, owner_id: &str, err: &UploadError) {
    let upload_id = upload_id.map(|id| id.to_string()).unwrap_or_default();
    if err.is_server_error() {
        error!(step, upload_id = %upload_id, owner_id = %owner_id, "upload step failed: {}", err);
    } else {
        debug!(step, upload_id = %upload_id, owner_id = %owner_id, "upload step rejected: {}", err);
    }
}
