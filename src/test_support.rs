//! Shared fixtures for unit and router tests.

use crate::{
    config::UploadLimits,
    db,
    services::{blob_store::BlobStore, upload_service::UploadService},
};
use std::{path::Path, sync::Arc};
use tempfile::TempDir;

pub const PUBLIC_BASE_URL: &str = "http://files.test";

/// An upload service over an in-memory database and a throwaway blob root.
pub struct TestEnv {
    pub service: UploadService,
    dir: TempDir,
}

impl TestEnv {
    pub async fn new() -> Self {
        Self::with_limits(UploadLimits::default()).await
    }

    pub async fn with_limits(limits: UploadLimits) -> Self {
        // A single connection keeps every query on the same in-memory database.
        let pool = db::connect("sqlite::memory:", 1).await.unwrap();
        db::run_migrations(&pool).await.unwrap();
        let dir = TempDir::new().unwrap();
        let blobs = BlobStore::new(dir.path(), PUBLIC_BASE_URL);
        Self {
            service: UploadService::new(Arc::new(pool), blobs, limits),
            dir,
        }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }
}

/// Split `data` into `parts` pieces of (nearly) equal size.
pub fn chunks_of(data: &[u8], parts: usize) -> Vec<Vec<u8>> {
    let size = data.len().div_ceil(parts);
    data.chunks(size).map(<[u8]>::to_vec).collect()
}
