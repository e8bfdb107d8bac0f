//! Bearer-token authentication.
//!
//! Tokens are random strings handed out once by `--issue-token`; only their
//! SHA-256 is stored. Handlers take an [`AuthenticatedUser`] argument to require
//! a valid token and learn the caller's owner id.

use crate::{
    errors::AppError, models::api_token::ApiToken, services::upload_service::UploadService,
};
use axum::{
    extract::FromRequestParts,
    http::{header::AUTHORIZATION, request::Parts},
};
use chrono::Utc;
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use uuid::Uuid;

const TOKEN_PREFIX: &str = "upl_";

/// The caller identity resolved from a bearer token.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthenticatedUser {
    pub owner_id: String,
}

impl FromRequestParts<UploadService> for AuthenticatedUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        service: &UploadService,
    ) -> Result<Self, Self::Rejection> {
        let raw = extract_bearer_token(parts)
            .ok_or_else(|| AppError::unauthorized("authentication required"))?;

        let token = lookup_token(&service.db, raw).await.map_err(|err| {
            tracing::error!("token lookup failed: {}", err);
            AppError::internal("internal server error")
        })?;

        match token {
            Some(token) if token.is_active() => Ok(Self {
                owner_id: token.owner_id,
            }),
            Some(_) => Err(AppError::unauthorized("token revoked")),
            None => Err(AppError::unauthorized("invalid token")),
        }
    }
}

/// Extract the bearer token from the Authorization header.
/// The scheme is matched case-insensitively.
fn extract_bearer_token(parts: &Parts) -> Option<&str> {
    parts
        .headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| {
            if v.len() > 7 && v[..7].eq_ignore_ascii_case("bearer ") {
                Some(v[7..].trim())
            } else {
                None
            }
        })
        .filter(|token| !token.is_empty())
}

/// Hash a raw token for storage lookup.
pub fn hash_token(token: &str) -> String {
    format!("{:x}", Sha256::digest(token.as_bytes()))
}

/// Mint and store a new token for `owner_id`, returning the raw token.
pub async fn issue_token(
    db: &SqlitePool,
    owner_id: &str,
    description: Option<&str>,
) -> Result<String, sqlx::Error> {
    let raw = format!(
        "{}{}{}",
        TOKEN_PREFIX,
        Uuid::new_v4().simple(),
        Uuid::new_v4().simple()
    );
    sqlx::query(
        "INSERT INTO api_tokens (token_hash, owner_id, description, created_at, revoked_at)
         VALUES (?, ?, ?, ?, NULL)",
    )
    .bind(hash_token(&raw))
    .bind(owner_id)
    .bind(description)
    .bind(Utc::now())
    .execute(db)
    .await?;
    Ok(raw)
}

/// Mark a token as revoked. Returns `false` if it was unknown or already revoked.
pub async fn revoke_token(db: &SqlitePool, raw: &str) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE api_tokens SET revoked_at = ? WHERE token_hash = ? AND revoked_at IS NULL",
    )
    .bind(Utc::now())
    .bind(hash_token(raw))
    .execute(db)
    .await?;
    Ok(result.rows_affected() > 0)
}

async fn lookup_token(db: &SqlitePool, raw: &str) -> Result<Option<ApiToken>, sqlx::Error> {
    sqlx::query_as::<_, ApiToken>(
        "SELECT token_hash, owner_id, description, created_at, revoked_at
         FROM api_tokens WHERE token_hash = ?",
    )
    .bind(hash_token(raw))
    .fetch_optional(db)
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestEnv;
    use axum::http::{Request, StatusCode};

    async fn authenticate(env: &TestEnv, header: Option<&str>) -> Result<AuthenticatedUser, AppError> {
        let mut builder = Request::builder().uri("/upload/init");
        if let Some(value) = header {
            builder = builder.header(AUTHORIZATION, value);
        }
        let (mut parts, _) = builder.body(()).unwrap().into_parts();
        AuthenticatedUser::from_request_parts(&mut parts, &env.service).await
    }

    #[tokio::test]
    async fn issued_token_resolves_owner() {
        let env = TestEnv::new().await;
        let token = issue_token(&env.service.db, "alice", Some("laptop")).await.unwrap();
        assert!(token.starts_with(TOKEN_PREFIX));

        let user = authenticate(&env, Some(&format!("bearer {}", token))).await.unwrap();
        assert_eq!(user.owner_id, "alice");
    }

    #[tokio::test]
    async fn missing_unknown_and_revoked_tokens_are_unauthorized() {
        let env = TestEnv::new().await;
        let token = issue_token(&env.service.db, "bob", None).await.unwrap();
        assert!(revoke_token(&env.service.db, &token).await.unwrap());
        assert!(!revoke_token(&env.service.db, &token).await.unwrap());
        let revoked = format!("Bearer {}", token);

        for header in [
            None,
            Some("Basic Ym9iOmh1bnRlcjI="),
            Some("Bearer "),
            Some("Bearer upl_nope"),
            Some(revoked.as_str()),
        ] {
            let err = authenticate(&env, header).await.unwrap_err();
            assert_eq!(err.status, StatusCode::UNAUTHORIZED, "{header:?}");
        }
    }

    #[test]
    fn token_hash_is_hex_sha256() {
        let hash = hash_token("abc");
        assert_eq!(
            hash,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
