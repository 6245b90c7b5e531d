use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::auth::repo::RepoError;

pub type AuthResult<T> = Result<T, AuthError>;

/// Every business failure the auth flows can report to the transport layer.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("{0}")]
    Validation(String),

    #[error("Email already in use")]
    Conflict,

    #[error("User not found")]
    NotFound,

    /// Unknown email or wrong password. `attempts_left` is only known for
    /// an existing account.
    #[error("Invalid credentials")]
    InvalidCredentials { attempts_left: Option<i32> },

    #[error("Account locked. Try again in {retry_after_secs} seconds.")]
    Locked { retry_after_secs: i64 },

    #[error("Email not verified")]
    Unverified,

    #[error("User already verified")]
    AlreadyVerified,

    #[error("Invalid verification code")]
    InvalidCode,

    /// Reset token that matches no account.
    #[error("Invalid or expired token")]
    InvalidToken,

    /// Refresh token absent from the store.
    #[error("Invalid refresh token")]
    InvalidRefreshToken,

    #[error("Token revoked")]
    Revoked,

    #[error("Token expired")]
    Expired,

    #[error("Invalid token signature")]
    InvalidSignature,

    #[error("Token is required")]
    MissingToken,

    #[error("{0}")]
    Unauthorized(&'static str),

    #[error("Service temporarily unavailable, retry later")]
    Transient,

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody {
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    attempts_left: Option<i32>,
}

impl AuthError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            AuthError::Validation(_)
            | AuthError::Conflict
            | AuthError::AlreadyVerified
            | AuthError::InvalidCode
            | AuthError::InvalidToken
            | AuthError::MissingToken => StatusCode::BAD_REQUEST,
            AuthError::NotFound => StatusCode::NOT_FOUND,
            AuthError::InvalidCredentials { .. }
            | AuthError::InvalidRefreshToken
            | AuthError::Revoked
            | AuthError::Expired
            | AuthError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AuthError::Locked { .. } => StatusCode::TOO_MANY_REQUESTS,
            AuthError::Unverified | AuthError::InvalidSignature => StatusCode::FORBIDDEN,
            AuthError::Transient => StatusCode::SERVICE_UNAVAILABLE,
            AuthError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<RepoError> for AuthError {
    fn from(err: RepoError) -> Self {
        match err {
            RepoError::Conflict => AuthError::Conflict,
            RepoError::Database(e) => AuthError::Internal(anyhow::Error::new(e)),
        }
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = match &self {
            AuthError::Internal(e) => {
                tracing::error!(error = %e, "internal error");
                "Internal server error".to_string()
            }
            other => other.to_string(),
        };
        let attempts_left = match &self {
            AuthError::InvalidCredentials { attempts_left } => *attempts_left,
            _ => None,
        };

        let mut res = (status, Json(ErrorBody { message, attempts_left })).into_response();
        if let AuthError::Locked { retry_after_secs } = self {
            if let Ok(v) = HeaderValue::from_str(&retry_after_secs.to_string()) {
                res.headers_mut().insert(header::RETRY_AFTER, v);
            }
        }
        res
    }
}
