//! Core data models for the chunked upload service.
//!
//! These entities map cleanly to database tables via `sqlx::FromRow` and
//! serialize naturally as JSON via `serde`.

pub mod api_token;
pub mod upload_session;
