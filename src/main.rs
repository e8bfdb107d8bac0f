use anyhow::Result;
use axum::Router;
use std::{fs, io::ErrorKind, path::Path, sync::Arc};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

mod auth;
mod config;
mod db;
mod errors;
mod handlers;
mod models;
mod routes;
mod services;
#[cfg(test)]
mod test_support;

use config::{AppConfig, Command};
use services::{blob_store::BlobStore, sweeper, upload_service::UploadService};

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + command ---
    let (cfg, command) = AppConfig::from_env_and_args()?;

    tracing::info!("Starting chunked-upload with config: {:?}", cfg);

    // --- Ensure storage directory exists ---
    if !Path::new(&cfg.storage_dir).exists() {
        fs::create_dir_all(&cfg.storage_dir)?;
        tracing::info!("Created storage directory at {}", cfg.storage_dir);
    }

    // --- Initialize SQLite connection ---
    let db = Arc::new(db::connect(&cfg.database_url, 5).await?);

    // --- Schema is idempotent, so it is applied before every command ---
    db::run_migrations(&db).await?;

    match command {
        Command::Migrate => {
            tracing::info!("Database migration complete.");
            return Ok(()); // exit after migration
        }
        Command::IssueToken { owner_id } => {
            let token = auth::issue_token(&db, &owner_id, Some("issued from CLI")).await?;
            tracing::info!("Issued token for owner {}", owner_id);
            println!("{}", token);
            return Ok(());
        }
        Command::RevokeToken { token } => {
            if auth::revoke_token(&db, &token).await? {
                tracing::info!("Token revoked.");
            } else {
                anyhow::bail!("token unknown or already revoked");
            }
            return Ok(());
        }
        Command::Serve => {}
    }

    // --- Initialize core service ---
    let blobs = BlobStore::new(&cfg.storage_dir, cfg.public_base_url.clone());
    let uploads = UploadService::new(db.clone(), blobs, cfg.limits);

    // --- Background expiry of abandoned uploads ---
    let _sweeper = sweeper::spawn(uploads.clone(), cfg.session_ttl, cfg.sweep_interval);

    // --- Build router ---
    let app: Router = routes::routes::routes(cfg.limits.max_chunk_bytes).with_state(uploads);

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!("failed to listen for shutdown signal: {}", err);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
