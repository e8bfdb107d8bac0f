//! Periodic expiry of abandoned uploads.

use crate::services::upload_service::UploadService;
use chrono::Utc;
use std::time::Duration;
use tokio::{task::JoinHandle, time::MissedTickBehavior};

/// Spawn a task that expires sessions idle for longer than `ttl`, every `every`.
///
/// Failures are logged and the loop keeps going.
pub fn spawn(service: UploadService, ttl: Duration, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let ttl = match chrono::Duration::from_std(ttl) {
            Ok(ttl) => ttl,
            Err(err) => {
                tracing::error!("session ttl out of range, sweeper disabled: {}", err);
                return;
            }
        };
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            match service.sweep_expired(Utc::now() - ttl).await {
                Ok(report) if report.expired > 0 => tracing::info!(
                    expired = report.expired,
                    reclaim_failures = report.reclaim_failures,
                    "expired abandoned uploads"
                ),
                Ok(_) => tracing::debug!("sweep found no abandoned uploads"),
                Err(err) => tracing::warn!("upload sweep failed: {}", err),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        models::upload_session::UploadStatus,
        services::upload_service::NewUpload,
        test_support::TestEnv,
    };

    #[tokio::test]
    async fn spawned_sweeper_expires_idle_sessions() {
        let env = TestEnv::new().await;
        let session = env
            .service
            .initiate(
                "carol",
                NewUpload {
                    file_name: "idle.bin".into(),
                    file_size: 2,
                    mime_type: None,
                    total_chunks: 1,
                },
            )
            .await
            .unwrap();

        let handle = spawn(
            env.service.clone(),
            Duration::ZERO,
            Duration::from_millis(10),
        );
        let mut status = UploadStatus::Initialized;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            status = env
                .service
                .status("carol", session.upload_id)
                .await
                .unwrap()
                .0
                .status;
            if status == UploadStatus::Failed {
                break;
            }
        }
        handle.abort();
        assert_eq!(status, UploadStatus::Failed);
    }
}
