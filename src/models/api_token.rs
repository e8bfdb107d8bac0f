//! Bearer tokens that identify upload owners.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A stored bearer token. Only the SHA-256 of the raw token is persisted.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct ApiToken {
    /// Lowercase hex SHA-256 of the raw token.
    pub token_hash: String,

    /// Identity every request carrying this token acts as.
    pub owner_id: String,

    pub description: Option<String>,

    pub created_at: DateTime<Utc>,

    /// Revoked tokens no longer authenticate.
    pub revoked_at: Option<DateTime<Utc>>,
}

impl ApiToken {
    pub fn is_active(&self) -> bool {
        self.revoked_at.is_none()
    }
}
