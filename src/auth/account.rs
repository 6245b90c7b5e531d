use std::sync::Arc;

use lazy_static::lazy_static;
use rand::{rngs::OsRng, Rng, RngCore};
use regex::Regex;
use serde_json::json;
use sha2::{Digest, Sha256};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::auth::password::CredentialHasher;
use crate::auth::repo::{with_deadline, UserRepository};
use crate::auth::repo_types::{NewUser, Role};
use crate::auth::Timeouts;
use crate::error::{AuthError, AuthResult};
use crate::notify::{deliver, Notifier};

pub const MIN_PASSWORD_LEN: usize = 6;

pub(crate) fn is_valid_email(email: &str) -> bool {
    lazy_static! {
        static ref EMAIL_RE: Regex = Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap();
    }
    EMAIL_RE.is_match(email)
}

fn validate_password(password: &str) -> AuthResult<()> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(AuthError::Validation(format!(
            "Password must be at least {MIN_PASSWORD_LEN} characters long"
        )));
    }
    Ok(())
}

/// Six digits, uniform over 100000..=999999.
fn generate_verification_code() -> String {
    OsRng.gen_range(100_000..=999_999_u32).to_string()
}

/// 256 random bits, hex encoded.
fn generate_reset_token() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

pub(crate) fn hash_reset_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

/// Result of a successful registration.
#[derive(Debug, Clone)]
pub struct Registration {
    pub user_id: Uuid,
    pub verification_code: String,
}

/// Registration, email verification and password reset.
pub struct AccountService {
    users: Arc<dyn UserRepository>,
    notifier: Arc<dyn Notifier>,
    hasher: CredentialHasher,
    timeouts: Timeouts,
}

impl AccountService {
    pub fn new(
        users: Arc<dyn UserRepository>,
        notifier: Arc<dyn Notifier>,
        hasher: CredentialHasher,
        timeouts: Timeouts,
    ) -> Self {
        Self {
            users,
            notifier,
            hasher,
            timeouts,
        }
    }

    #[instrument(skip(self, password))]
    pub async fn register(&self, email: &str, password: &str) -> AuthResult<Registration> {
        let email = email.trim();
        if !is_valid_email(email) {
            warn!(email, "invalid email");
            return Err(AuthError::Validation("Invalid email".into()));
        }
        validate_password(password)?;

        let existing = with_deadline(
            self.timeouts.store,
            "find_by_email",
            self.users.find_by_email(email),
        )
        .await?;
        if existing.is_some() {
            warn!(email, "email already registered");
            return Err(AuthError::Conflict);
        }

        let password_hash = self.hasher.hash(password).await?;
        let verification_code = generate_verification_code();

        // a concurrent registration for the same email surfaces as Conflict here
        let user = with_deadline(
            self.timeouts.store,
            "create_user",
            self.users.create(NewUser {
                email: email.to_string(),
                password_hash,
                role: Role::User,
                verification_code: verification_code.clone(),
            }),
        )
        .await?;

        deliver(
            self.notifier.as_ref(),
            self.timeouts.notify,
            &user.email,
            "Verify Your Email",
            "verification",
            json!({ "code": verification_code }),
        )
        .await;

        info!(user_id = %user.id, email = %user.email, "user registered");
        Ok(Registration {
            user_id: user.id,
            verification_code,
        })
    }

    #[instrument(skip(self, code))]
    pub async fn verify_email(&self, email: &str, code: &str) -> AuthResult<()> {
        let email = email.trim();
        let user = with_deadline(
            self.timeouts.store,
            "find_by_email",
            self.users.find_by_email(email),
        )
        .await?
        .ok_or(AuthError::NotFound)?;

        if user.is_verified {
            return Err(AuthError::AlreadyVerified);
        }

        let verified = with_deadline(
            self.timeouts.store,
            "mark_verified",
            self.users.mark_verified(user.id, code),
        )
        .await?;
        if !verified {
            // the update also misses when another request verified first
            let current = with_deadline(
                self.timeouts.store,
                "find_by_id",
                self.users.find_by_id(user.id),
            )
            .await?;
            if current.is_some_and(|u| u.is_verified) {
                return Err(AuthError::AlreadyVerified);
            }
            warn!(user_id = %user.id, "verification code mismatch");
            return Err(AuthError::InvalidCode);
        }

        info!(user_id = %user.id, "email verified");
        Ok(())
    }

    /// Creates a pre-verified account with `role` unless the email is taken.
    /// Returns the new id, or `None` when an account already exists.
    #[instrument(skip(self, password))]
    pub async fn seed_account(
        &self,
        email: &str,
        password: &str,
        role: Role,
    ) -> AuthResult<Option<Uuid>> {
        let email = email.trim();
        if !is_valid_email(email) {
            return Err(AuthError::Validation("Invalid email".into()));
        }
        validate_password(password)?;

        let existing = with_deadline(
            self.timeouts.store,
            "find_by_email",
            self.users.find_by_email(email),
        )
        .await?;
        if existing.is_some() {
            info!(email, "seed account already present");
            return Ok(None);
        }

        let password_hash = self.hasher.hash(password).await?;
        let created = with_deadline(
            self.timeouts.store,
            "create_verified",
            self.users.create_verified(email, &password_hash, role),
        )
        .await;
        match created {
            Ok(user) => {
                info!(user_id = %user.id, email, role = ?role, "seed account created");
                Ok(Some(user.id))
            }
            // another instance seeded it between the lookup and the insert
            Err(AuthError::Conflict) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Issues a new reset token, replacing any outstanding one. Only its hash
    /// is stored; the plaintext goes out by email.
    #[instrument(skip(self))]
    pub async fn forgot_password(&self, email: &str) -> AuthResult<()> {
        let email = email.trim();
        let user = with_deadline(
            self.timeouts.store,
            "find_by_email",
            self.users.find_by_email(email),
        )
        .await?
        .ok_or(AuthError::NotFound)?;

        let token = generate_reset_token();
        with_deadline(
            self.timeouts.store,
            "set_reset_token_hash",
            self.users.set_reset_token_hash(user.id, &hash_reset_token(&token)),
        )
        .await?;

        deliver(
            self.notifier.as_ref(),
            self.timeouts.notify,
            &user.email,
            "Password Reset Request",
            "reset_password",
            json!({ "token": token }),
        )
        .await;

        info!(user_id = %user.id, "password reset requested");
        Ok(())
    }

    #[instrument(skip_all)]
    pub async fn reset_password(&self, token: &str, new_password: &str) -> AuthResult<()> {
        validate_password(new_password)?;
        if token.is_empty() {
            return Err(AuthError::InvalidToken);
        }

        let password_hash = self.hasher.hash(new_password).await?;
        let user_id = with_deadline(
            self.timeouts.store,
            "consume_reset_token",
            self.users
                .consume_reset_token(&hash_reset_token(token), &password_hash),
        )
        .await?
        .ok_or(AuthError::InvalidToken)?;

        info!(user_id = %user_id, "password reset");
        Ok(())
    }
}
