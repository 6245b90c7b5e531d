use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use tracing::{info, instrument};

use crate::{
    auth::{
        dto::{
            ForgotPasswordRequest, LoginRequest, LoginResponse, MessageResponse, PublicUser,
            RefreshResponse, RegisterRequest, RegisterResponse, ResetPasswordRequest,
            TokenRequest, VerifyEmailRequest,
        },
        extractors::AuthUser,
    },
    error::{AuthError, AuthResult},
    state::AppState,
};

pub fn auth_routes() -> Router<AppState> {
    Router::new()
        .route("/auth/register", post(register))
        .route("/auth/login", post(login))
        .route("/auth/verify-email", post(verify_email))
        .route("/auth/forgot-password", post(forgot_password))
        .route("/auth/reset-password", post(reset_password))
        .route("/auth/refresh-token", post(refresh_token))
        .route("/auth/logout", post(logout))
        .route("/auth/me", get(get_me))
}

/// Malformed or incomplete JSON is a validation failure, not a 422.
fn body<T>(payload: Result<Json<T>, JsonRejection>) -> AuthResult<T> {
    payload
        .map(|Json(v)| v)
        .map_err(|e| AuthError::Validation(e.body_text()))
}

#[instrument(skip_all)]
pub async fn register(
    State(state): State<AppState>,
    payload: Result<Json<RegisterRequest>, JsonRejection>,
) -> AuthResult<(StatusCode, Json<RegisterResponse>)> {
    let req = body(payload)?;
    let reg = state.accounts.register(&req.email, &req.password).await?;
    let debug_token = state
        .config
        .expose_debug_tokens
        .then_some(reg.verification_code);
    Ok((
        StatusCode::CREATED,
        Json(RegisterResponse {
            message: "User registered. Please check your email for verification code.",
            user_id: reg.user_id,
            debug_token,
        }),
    ))
}

#[instrument(skip_all)]
pub async fn login(
    State(state): State<AppState>,
    payload: Result<Json<LoginRequest>, JsonRejection>,
) -> AuthResult<Json<LoginResponse>> {
    let req = body(payload)?;
    let out = state.sessions.login(&req.email, &req.password).await?;
    Ok(Json(LoginResponse {
        message: "Login successful",
        access_token: out.access_token,
        refresh_token: out.refresh_token,
        user_id: out.user_id,
        role: out.role,
    }))
}

#[instrument(skip_all)]
pub async fn verify_email(
    State(state): State<AppState>,
    payload: Result<Json<VerifyEmailRequest>, JsonRejection>,
) -> AuthResult<Json<MessageResponse>> {
    let req = body(payload)?;
    state.accounts.verify_email(&req.email, &req.code).await?;
    Ok(Json(MessageResponse {
        message: "Email verified successfully. You can now login.",
    }))
}

#[instrument(skip_all)]
pub async fn forgot_password(
    State(state): State<AppState>,
    payload: Result<Json<ForgotPasswordRequest>, JsonRejection>,
) -> AuthResult<Json<MessageResponse>> {
    let req = body(payload)?;
    state.accounts.forgot_password(&req.email).await?;
    Ok(Json(MessageResponse {
        message: "Password reset email sent.",
    }))
}

#[instrument(skip_all)]
pub async fn reset_password(
    State(state): State<AppState>,
    payload: Result<Json<ResetPasswordRequest>, JsonRejection>,
) -> AuthResult<Json<MessageResponse>> {
    let req = body(payload)?;
    state
        .accounts
        .reset_password(&req.token, &req.new_password)
        .await?;
    Ok(Json(MessageResponse {
        message: "Password reset successful. You can now login with new password.",
    }))
}

#[instrument(skip_all)]
pub async fn refresh_token(
    State(state): State<AppState>,
    payload: Result<Json<TokenRequest>, JsonRejection>,
) -> AuthResult<Json<RefreshResponse>> {
    let req = body(payload)?;
    let out = state.sessions.refresh(&req.token).await?;
    Ok(Json(RefreshResponse {
        access_token: out.access_token,
        refresh_token: out.refresh_token,
    }))
}

#[instrument(skip_all)]
pub async fn logout(
    State(state): State<AppState>,
    payload: Result<Json<TokenRequest>, JsonRejection>,
) -> AuthResult<Json<MessageResponse>> {
    let req = body(payload)?;
    state.sessions.logout(&req.token).await?;
    Ok(Json(MessageResponse {
        message: "Logged out successfully",
    }))
}

#[instrument(skip(state, auth), fields(user_id = %auth.id))]
pub async fn get_me(
    State(state): State<AppState>,
    auth: AuthUser,
) -> AuthResult<Json<PublicUser>> {
    let user = state.sessions.current_user(auth.id).await?;
    info!(role = ?auth.role, "profile read");
    Ok(Json(user.into()))
}
