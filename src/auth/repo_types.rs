use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

/// Authorization level carried in the access token's `role` claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "UPPERCASE")]
#[sqlx(type_name = "user_role", rename_all = "UPPERCASE")]
pub enum Role {
    Admin,
    Moderator,
    #[default]
    User,
}

/// User record in the database.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    #[serde(skip_serializing)]
    pub password_hash: String,          // Argon2 PHC string
    pub role: Role,
    pub is_verified: bool,
    #[serde(skip_serializing)]
    pub verification_code: Option<String>,
    #[serde(skip_serializing)]
    pub reset_token_hash: Option<String>, // sha256 hex of the outstanding reset token
    pub failed_login_attempts: i32,
    pub lock_until: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
}

/// Fields supplied when inserting a user; the rest take column defaults.
#[derive(Debug, Clone)]
pub struct NewUser {
    pub email: String,
    pub password_hash: String,
    pub role: Role,
    pub verification_code: String,
}

/// Counter state written by a recorded login failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRow)]
pub struct FailedLogin {
    pub failed_login_attempts: i32,
    pub lock_until: Option<OffsetDateTime>,
}

/// Server-side record of an issued refresh token.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct RefreshToken {
    pub token: String,
    pub user_id: Uuid,
    pub expires_at: OffsetDateTime,
    pub revoked: bool,
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone)]
pub struct NewRefreshToken {
    pub token: String,
    pub user_id: Uuid,
    pub expires_at: OffsetDateTime,
}
