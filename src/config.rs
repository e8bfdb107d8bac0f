use anyhow::{Context, Result};
use clap::Parser;
use std::{env, str::FromStr, time::Duration};

const DEFAULT_MAX_CHUNK_BYTES: usize = 16 * 1024 * 1024;
const DEFAULT_MAX_TOTAL_CHUNKS: u32 = 10_000;
const DEFAULT_SESSION_TTL_SECS: u64 = 24 * 60 * 60;
const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 300;

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    pub database_url: String,
    pub public_base_url: String,
    pub limits: UploadLimits,
    pub session_ttl: Duration,
    pub sweep_interval: Duration,
}

/// Per-request bounds enforced by the upload workflow.
#[derive(Debug, Clone, Copy)]
pub struct UploadLimits {
    pub max_chunk_bytes: usize,
    pub max_total_chunks: u32,
}

impl Default for UploadLimits {
    fn default() -> Self {
        Self {
            max_chunk_bytes: DEFAULT_MAX_CHUNK_BYTES,
            max_total_chunks: DEFAULT_MAX_TOTAL_CHUNKS,
        }
    }
}

/// What the binary was asked to do besides serving.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Serve,
    Migrate,
    IssueToken { owner_id: String },
    RevokeToken { token: String },
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Resumable chunked upload service")]
pub struct Args {
    /// Host to bind to (overrides UPLOAD_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides UPLOAD_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory where chunks and final objects are stored (overrides UPLOAD_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Database URL (overrides UPLOAD_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Base URL prepended to final object keys (overrides UPLOAD_PUBLIC_BASE_URL)
    #[arg(long)]
    pub public_base_url: Option<String>,

    /// Largest accepted chunk in bytes (overrides UPLOAD_MAX_CHUNK_BYTES)
    #[arg(long)]
    pub max_chunk_bytes: Option<usize>,

    /// Largest accepted chunk count per upload (overrides UPLOAD_MAX_TOTAL_CHUNKS)
    #[arg(long)]
    pub max_total_chunks: Option<u32>,

    /// Seconds of inactivity before an unfinished upload is expired (overrides UPLOAD_SESSION_TTL_SECS)
    #[arg(long)]
    pub session_ttl_secs: Option<u64>,

    /// Seconds between expiry sweeps (overrides UPLOAD_SWEEP_INTERVAL_SECS)
    #[arg(long)]
    pub sweep_interval_secs: Option<u64>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,

    /// Mint a bearer token for OWNER_ID, print it and exit
    #[arg(long, value_name = "OWNER_ID")]
    pub issue_token: Option<String>,

    /// Revoke a previously issued bearer TOKEN and exit
    #[arg(long, value_name = "TOKEN")]
    pub revoke_token: Option<String>,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and the command to run.
    pub fn from_env_and_args() -> Result<(Self, Command)> {
        let args = Args::parse();
        Self::resolve(args, |key| env::var(key).ok())
    }

    /// Merge parsed args over values found through `lookup`.
    ///
    /// CLI flags win over environment variables, which win over defaults.
    pub fn resolve(
        args: Args,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(Self, Command)> {
        let host = args
            .host
            .or_else(|| lookup("UPLOAD_HOST"))
            .unwrap_or_else(|| "0.0.0.0".into());
        let port = match args.port {
            Some(port) => port,
            None => parse_env(&lookup, "UPLOAD_PORT")?.unwrap_or(3000),
        };
        let storage_dir = args
            .storage_dir
            .or_else(|| lookup("UPLOAD_STORAGE_DIR"))
            .unwrap_or_else(|| "./data/objects".into());
        let database_url = args
            .database_url
            .or_else(|| lookup("UPLOAD_DATABASE_URL"))
            .unwrap_or_else(|| "sqlite://./data/meta/uploads.db".into());
        let public_base_url = args
            .public_base_url
            .or_else(|| lookup("UPLOAD_PUBLIC_BASE_URL"))
            .unwrap_or_else(|| format!("http://{}:{}/files", host, port));

        let max_chunk_bytes = match args.max_chunk_bytes {
            Some(v) => v,
            None => parse_env(&lookup, "UPLOAD_MAX_CHUNK_BYTES")?
                .unwrap_or(DEFAULT_MAX_CHUNK_BYTES),
        };
        let max_total_chunks = match args.max_total_chunks {
            Some(v) => v,
            None => parse_env(&lookup, "UPLOAD_MAX_TOTAL_CHUNKS")?
                .unwrap_or(DEFAULT_MAX_TOTAL_CHUNKS),
        };
        let session_ttl_secs = match args.session_ttl_secs {
            Some(v) => v,
            None => parse_env(&lookup, "UPLOAD_SESSION_TTL_SECS")?
                .unwrap_or(DEFAULT_SESSION_TTL_SECS),
        };
        let sweep_interval_secs = match args.sweep_interval_secs {
            Some(v) => v,
            None => parse_env(&lookup, "UPLOAD_SWEEP_INTERVAL_SECS")?
                .unwrap_or(DEFAULT_SWEEP_INTERVAL_SECS),
        };

        if max_chunk_bytes == 0 {
            anyhow::bail!("max chunk size must be greater than zero");
        }
        if max_total_chunks == 0 {
            anyhow::bail!("max total chunks must be greater than zero");
        }

        let cfg = Self {
            host,
            port,
            storage_dir,
            database_url,
            public_base_url: public_base_url.trim_end_matches('/').to_string(),
            limits: UploadLimits {
                max_chunk_bytes,
                max_total_chunks,
            },
            session_ttl: Duration::from_secs(session_ttl_secs),
            sweep_interval: Duration::from_secs(sweep_interval_secs.max(1)),
        };

        let command = if let Some(owner_id) = args.issue_token {
            Command::IssueToken { owner_id }
        } else if let Some(token) = args.revoke_token {
            Command::RevokeToken { token }
        } else if args.migrate {
            Command::Migrate
        } else {
            Command::Serve
        };

        Ok((cfg, command))
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse_env<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(value) => value
            .parse::<T>()
            .map(Some)
            .with_context(|| format!("parsing {} value `{}`", key, value)),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_without_env_or_flags() {
        let (cfg, command) = AppConfig::resolve(Args::default(), env_of(&[])).unwrap();
        assert_eq!(cfg.addr(), "0.0.0.0:3000");
        assert_eq!(cfg.public_base_url, "http://0.0.0.0:3000/files");
        assert_eq!(cfg.limits.max_chunk_bytes, DEFAULT_MAX_CHUNK_BYTES);
        assert_eq!(cfg.session_ttl, Duration::from_secs(DEFAULT_SESSION_TTL_SECS));
        assert_eq!(command, Command::Serve);
    }

    #[test]
    fn flags_override_environment() {
        let args = Args {
            port: Some(8080),
            max_total_chunks: Some(12),
            ..Args::default()
        };
        let env = env_of(&[
            ("UPLOAD_PORT", "9000"),
            ("UPLOAD_HOST", "127.0.0.1"),
            ("UPLOAD_MAX_TOTAL_CHUNKS", "50"),
            ("UPLOAD_PUBLIC_BASE_URL", "https://cdn.example.com/u/"),
        ]);
        let (cfg, _) = AppConfig::resolve(args, env).unwrap();
        assert_eq!(cfg.addr(), "127.0.0.1:8080");
        assert_eq!(cfg.limits.max_total_chunks, 12);
        assert_eq!(cfg.public_base_url, "https://cdn.example.com/u");
    }

    #[test]
    fn malformed_numeric_env_is_an_error() {
        let err = AppConfig::resolve(Args::default(), env_of(&[("UPLOAD_PORT", "http")]))
            .unwrap_err();
        assert!(err.to_string().contains("UPLOAD_PORT"));
    }

    #[test]
    fn issue_token_takes_precedence_over_migrate() {
        let args = Args {
            migrate: true,
            issue_token: Some("alice".into()),
            ..Args::default()
        };
        let (_, command) = AppConfig::resolve(args, env_of(&[])).unwrap();
        assert_eq!(
            command,
            Command::IssueToken {
                owner_id: "alice".into()
            }
        );
    }
}
