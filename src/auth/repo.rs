use std::{future::Future, time::Duration};

use async_trait::async_trait;
use sqlx::PgPool;
use thiserror::Error;
use time::OffsetDateTime;
use tracing::warn;
use uuid::Uuid;

use crate::auth::repo_types::{FailedLogin, NewRefreshToken, NewUser, RefreshToken, Role, User};
use crate::error::{AuthError, AuthResult};

#[derive(Debug, Error)]
pub enum RepoError {
    /// A unique constraint rejected the write.
    #[error("unique constraint violated")]
    Conflict,

    #[error("database error: {0}")]
    Database(sqlx::Error),
}

impl From<sqlx::Error> for RepoError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db) if db.is_unique_violation() => RepoError::Conflict,
            _ => RepoError::Database(err),
        }
    }
}

pub type RepoResult<T> = Result<T, RepoError>;

/// User persistence. Every mutation that depends on current row state is a
/// single conditional statement so concurrent requests cannot lose updates.
#[async_trait]
pub trait UserRepository: Send + Sync {
    async fn find_by_email(&self, email: &str) -> RepoResult<Option<User>>;
    async fn find_by_id(&self, id: Uuid) -> RepoResult<Option<User>>;
    async fn create(&self, user: NewUser) -> RepoResult<User>;

    /// Insert an account that skips email verification, used to seed
    /// privileged accounts at startup.
    async fn create_verified(
        &self,
        email: &str,
        password_hash: &str,
        role: Role,
    ) -> RepoResult<User>;

    /// Flip `is_verified` and clear the code, only if `code` matches and the
    /// user is still unverified. Returns whether a row changed.
    async fn mark_verified(&self, id: Uuid, code: &str) -> RepoResult<bool>;

    /// Replace any outstanding reset token hash.
    async fn set_reset_token_hash(&self, id: Uuid, token_hash: &str) -> RepoResult<()>;

    /// Set a new password for the user owning `token_hash`, clearing the
    /// reset hash and any lockout. Returns the user id on success.
    async fn consume_reset_token(
        &self,
        token_hash: &str,
        password_hash: &str,
    ) -> RepoResult<Option<Uuid>>;

    /// Increment the failed-login counter unless the account is locked at
    /// `now`. Reaching `max_attempts` sets the lock to `lock_at` in the same
    /// write. `None` means the account was locked and nothing changed.
    async fn record_failed_login(
        &self,
        id: Uuid,
        now: OffsetDateTime,
        max_attempts: i32,
        lock_at: OffsetDateTime,
    ) -> RepoResult<Option<FailedLogin>>;

    /// Reset the counter and lock unless the account is locked at `now`.
    /// Returns false while locked.
    async fn clear_failed_logins(&self, id: Uuid, now: OffsetDateTime) -> RepoResult<bool>;
}

#[async_trait]
pub trait RefreshTokenRepository: Send + Sync {
    async fn create(&self, token: NewRefreshToken) -> RepoResult<RefreshToken>;
    async fn find(&self, token: &str) -> RepoResult<Option<RefreshToken>>;
    /// Mark matching tokens revoked; returns rows affected.
    async fn revoke(&self, token: &str) -> RepoResult<u64>;
}

/// Bound a storage call; an elapsed deadline surfaces as a retryable error.
pub async fn with_deadline<T, F>(limit: Duration, op: &'static str, fut: F) -> AuthResult<T>
where
    F: Future<Output = RepoResult<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(res) => res.map_err(AuthError::from),
        Err(_) => {
            warn!(op, timeout_ms = limit.as_millis() as u64, "storage call timed out");
            Err(AuthError::Transient)
        }
    }
}

const USER_COLUMNS: &str = "id, email, password_hash, role, is_verified, verification_code, \
     reset_token_hash, failed_login_attempts, lock_until, created_at";

#[derive(Clone)]
pub struct PgUserRepository {
    db: PgPool,
}

impl PgUserRepository {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl UserRepository for PgUserRepository {
    async fn find_by_email(&self, email: &str) -> RepoResult<Option<User>> {
        let user = sqlx::query_as::<_, User>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE email = $1"
        ))
        .bind(email)
        .fetch_optional(&self.db)
        .await?;
        Ok(user)
    }

    async fn find_by_id(&self, id: Uuid) -> RepoResult<Option<User>> {
        let user = sqlx::query_as::<_, User>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.db)
        .await?;
        Ok(user)
    }

    async fn create(&self, user: NewUser) -> RepoResult<User> {
        let user = sqlx::query_as::<_, User>(&format!(
            r#"
            INSERT INTO users (email, password_hash, role, verification_code)
            VALUES ($1, $2, $3, $4)
            RETURNING {USER_COLUMNS}
            "#
        ))
        .bind(&user.email)
        .bind(&user.password_hash)
        .bind(user.role)
        .bind(&user.verification_code)
        .fetch_one(&self.db)
        .await?;
        Ok(user)
    }

    async fn create_verified(
        &self,
        email: &str,
        password_hash: &str,
        role: Role,
    ) -> RepoResult<User> {
        let user = sqlx::query_as::<_, User>(&format!(
            r#"
            INSERT INTO users (email, password_hash, role, is_verified)
            VALUES ($1, $2, $3, TRUE)
            RETURNING {USER_COLUMNS}
            "#
        ))
        .bind(email)
        .bind(password_hash)
        .bind(role)
        .fetch_one(&self.db)
        .await?;
        Ok(user)
    }

    async fn mark_verified(&self, id: Uuid, code: &str) -> RepoResult<bool> {
        let res = sqlx::query(
            r#"
            UPDATE users
               SET is_verified = TRUE, verification_code = NULL
             WHERE id = $1 AND is_verified = FALSE AND verification_code = $2
            "#,
        )
        .bind(id)
        .bind(code)
        .execute(&self.db)
        .await?;
        Ok(res.rows_affected() == 1)
    }

    async fn set_reset_token_hash(&self, id: Uuid, token_hash: &str) -> RepoResult<()> {
        sqlx::query("UPDATE users SET reset_token_hash = $2 WHERE id = $1")
            .bind(id)
            .bind(token_hash)
            .execute(&self.db)
            .await?;
        Ok(())
    }

    async fn consume_reset_token(
        &self,
        token_hash: &str,
        password_hash: &str,
    ) -> RepoResult<Option<Uuid>> {
        let row = sqlx::query_as::<_, (Uuid,)>(
            r#"
            UPDATE users
               SET password_hash = $2,
                   reset_token_hash = NULL,
                   failed_login_attempts = 0,
                   lock_until = NULL
             WHERE reset_token_hash = $1
            RETURNING id
            "#,
        )
        .bind(token_hash)
        .bind(password_hash)
        .fetch_optional(&self.db)
        .await?;
        Ok(row.map(|(id,)| id))
    }

    async fn record_failed_login(
        &self,
        id: Uuid,
        now: OffsetDateTime,
        max_attempts: i32,
        lock_at: OffsetDateTime,
    ) -> RepoResult<Option<FailedLogin>> {
        let row = sqlx::query_as::<_, FailedLogin>(
            r#"
            UPDATE users
               SET failed_login_attempts = failed_login_attempts + 1,
                   lock_until = CASE
                       WHEN failed_login_attempts + 1 >= $3 THEN $4
                       ELSE lock_until
                   END
             WHERE id = $1 AND (lock_until IS NULL OR lock_until <= $2)
            RETURNING failed_login_attempts, lock_until
            "#,
        )
        .bind(id)
        .bind(now)
        .bind(max_attempts)
        .bind(lock_at)
        .fetch_optional(&self.db)
        .await?;
        Ok(row)
    }

    async fn clear_failed_logins(&self, id: Uuid, now: OffsetDateTime) -> RepoResult<bool> {
        let res = sqlx::query(
            r#"
            UPDATE users
               SET failed_login_attempts = 0, lock_until = NULL
             WHERE id = $1 AND (lock_until IS NULL OR lock_until <= $2)
            "#,
        )
        .bind(id)
        .bind(now)
        .execute(&self.db)
        .await?;
        Ok(res.rows_affected() == 1)
    }
}

#[derive(Clone)]
pub struct PgRefreshTokenRepository {
    db: PgPool,
}

impl PgRefreshTokenRepository {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl RefreshTokenRepository for PgRefreshTokenRepository {
    async fn create(&self, token: NewRefreshToken) -> RepoResult<RefreshToken> {
        let row = sqlx::query_as::<_, RefreshToken>(
            r#"
            INSERT INTO refresh_tokens (token, user_id, expires_at)
            VALUES ($1, $2, $3)
            RETURNING token, user_id, expires_at, revoked, created_at
            "#,
        )
        .bind(&token.token)
        .bind(token.user_id)
        .bind(token.expires_at)
        .fetch_one(&self.db)
        .await?;
        Ok(row)
    }

    async fn find(&self, token: &str) -> RepoResult<Option<RefreshToken>> {
        let row = sqlx::query_as::<_, RefreshToken>(
            r#"
            SELECT token, user_id, expires_at, revoked, created_at
              FROM refresh_tokens
             WHERE token = $1
            "#,
        )
        .bind(token)
        .fetch_optional(&self.db)
        .await?;
        Ok(row)
    }

    async fn revoke(&self, token: &str) -> RepoResult<u64> {
        let res = sqlx::query("UPDATE refresh_tokens SET revoked = TRUE WHERE token = $1")
            .bind(token)
            .execute(&self.db)
            .await?;
        Ok(res.rows_affected())
    }
}
