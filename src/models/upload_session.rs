//! Represents a chunked upload session and the chunks received for it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use uuid::Uuid;

/// Lifecycle of an upload session.
///
/// Transitions only move forward:
/// `initialized → in_progress → uploaded → processing → completed`,
/// with `failed` reachable from every non-terminal state.
#[derive(Serialize, Deserialize, sqlx::Type, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "TEXT", rename_all = "snake_case")]
pub enum UploadStatus {
    Initialized,
    InProgress,
    Uploaded,
    Processing,
    Completed,
    Failed,
}

impl UploadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initialized => "initialized",
            Self::InProgress => "in_progress",
            Self::Uploaded => "uploaded",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Whether a chunk write may still be recorded in this state.
    pub fn accepts_chunks(&self) -> bool {
        matches!(self, Self::Initialized | Self::InProgress | Self::Uploaded)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Whether moving from `self` to `next` respects the forward-only state machine.
    ///
    /// `initialized → uploaded` is allowed for single-chunk uploads, where the
    /// first accepted chunk is also the last one.
    pub fn can_transition_to(&self, next: UploadStatus) -> bool {
        use UploadStatus::*;
        match (self, next) {
            (from, Failed) => !from.is_terminal(),
            (Initialized, InProgress | Uploaded) => true,
            (InProgress, InProgress | Uploaded) => true,
            (Uploaded, Uploaded | Processing) => true,
            (Processing, Completed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One in-flight or finished upload.
///
/// The row stores only metadata; chunk and final payloads live in the blob store
/// beneath `storage_path`.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct UploadSession {
    /// Opaque identifier handed to the client.
    pub upload_id: Uuid,

    /// Identity of the caller that initiated the upload.
    pub owner_id: String,

    /// File name as sent by the client.
    pub original_file_name: String,

    /// File name restricted to `[A-Za-z0-9._-]`.
    pub safe_file_name: String,

    /// Blob-store directory reserved for this upload. Never changes.
    pub storage_path: String,

    pub declared_file_size: i64,

    pub declared_mime_type: Option<String>,

    /// Chunk count fixed at initiation.
    pub total_chunks: i64,

    /// Number of distinct chunk indices recorded so far.
    pub chunks_received: i64,

    pub status: UploadStatus,

    /// Blob key of the reassembled object, set on completion.
    pub final_object_key: Option<String>,

    /// Public URL of the reassembled object. Present iff `status == completed`.
    pub final_object_url: Option<String>,

    /// MD5 of the reassembled object.
    pub etag: Option<String>,

    pub failure_reason: Option<String>,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

impl UploadSession {
    pub fn is_owned_by(&self, owner_id: &str) -> bool {
        self.owner_id == owner_id
    }
}

/// A recorded chunk receipt. One row per distinct `(upload_id, chunk_index)`.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct ReceivedChunk {
    pub upload_id: Uuid,

    pub chunk_index: i64,

    /// Blob written by this receipt. Every receipt gets a fresh key, so a
    /// recorded key is never overwritten.
    pub blob_key: String,

    pub size_bytes: i64,

    /// Base64 MD5 supplied by the client, if any.
    pub checksum: Option<String>,

    pub received_at: DateTime<Utc>,
}
