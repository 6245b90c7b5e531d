use std::sync::Arc;

use time::OffsetDateTime;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::auth::jwt::TokenIssuer;
use crate::auth::lockout::LockoutPolicy;
use crate::auth::password::CredentialHasher;
use crate::auth::repo::{with_deadline, RefreshTokenRepository, UserRepository};
use crate::auth::repo_types::{NewRefreshToken, Role, User};
use crate::auth::Timeouts;
use crate::error::{AuthError, AuthResult};

#[derive(Debug, Clone)]
pub struct LoginOutcome {
    pub access_token: String,
    pub refresh_token: String,
    pub user_id: Uuid,
    pub role: Role,
}

#[derive(Debug, Clone)]
pub struct RefreshOutcome {
    pub access_token: String,
    pub refresh_token: String,
}

/// Login with lockout, access-token refresh and logout.
pub struct SessionService {
    users: Arc<dyn UserRepository>,
    refresh_tokens: Arc<dyn RefreshTokenRepository>,
    hasher: CredentialHasher,
    policy: LockoutPolicy,
    issuer: Arc<TokenIssuer>,
    timeouts: Timeouts,
}

impl SessionService {
    pub fn new(
        users: Arc<dyn UserRepository>,
        refresh_tokens: Arc<dyn RefreshTokenRepository>,
        hasher: CredentialHasher,
        policy: LockoutPolicy,
        issuer: Arc<TokenIssuer>,
        timeouts: Timeouts,
    ) -> Self {
        Self {
            users,
            refresh_tokens,
            hasher,
            policy,
            issuer,
            timeouts,
        }
    }

    /// A lock is honoured only while it lies in the future; failed attempts
    /// during a lock leave the counter alone.
    #[instrument(skip(self, password))]
    pub async fn login(&self, email: &str, password: &str) -> AuthResult<LoginOutcome> {
        let email = email.trim();
        let user = match with_deadline(
            self.timeouts.store,
            "find_by_email",
            self.users.find_by_email(email),
        )
        .await?
        {
            Some(u) => u,
            None => {
                warn!(email, "login unknown email");
                return Err(AuthError::InvalidCredentials { attempts_left: None });
            }
        };

        let now = OffsetDateTime::now_utc();
        if let Some(retry_after_secs) = self.policy.remaining(user.lock_until, now) {
            warn!(user_id = %user.id, retry_after_secs, "login on locked account");
            return Err(AuthError::Locked { retry_after_secs });
        }

        if !self.hasher.verify(password, &user.password_hash).await? {
            return Err(self.record_failure(&user).await?);
        }

        if !user.is_verified {
            warn!(user_id = %user.id, "login before email verification");
            return Err(AuthError::Unverified);
        }

        // A concurrent failure may have locked the account while the password
        // was being checked; the clear only applies to an unlocked row.
        let cleared = with_deadline(
            self.timeouts.store,
            "clear_failed_logins",
            self.users
                .clear_failed_logins(user.id, OffsetDateTime::now_utc()),
        )
        .await?;
        if !cleared {
            return Err(self.locked_after_read(user.id).await?);
        }

        let access = self.issuer.issue_access(user.id, user.role)?;
        let refresh = self.issuer.issue_refresh(user.id)?;
        with_deadline(
            self.timeouts.store,
            "create_refresh_token",
            self.refresh_tokens.create(NewRefreshToken {
                token: refresh.token.clone(),
                user_id: user.id,
                expires_at: refresh.expires_at,
            }),
        )
        .await?;

        info!(user_id = %user.id, role = ?user.role, "user logged in");
        Ok(LoginOutcome {
            access_token: access.token,
            refresh_token: refresh.token,
            user_id: user.id,
            role: user.role,
        })
    }

    async fn record_failure(&self, user: &User) -> AuthResult<AuthError> {
        let now = OffsetDateTime::now_utc();
        let recorded = with_deadline(
            self.timeouts.store,
            "record_failed_login",
            self.users.record_failed_login(
                user.id,
                now,
                self.policy.max_attempts(),
                self.policy.lock_at(now),
            ),
        )
        .await?;
        let Some(recorded) = recorded else {
            return self.locked_after_read(user.id).await;
        };

        let attempts = recorded.failed_login_attempts;
        if recorded.lock_until.is_some_and(|until| until > now) {
            warn!(user_id = %user.id, attempts, "account locked");
        } else {
            warn!(user_id = %user.id, attempts, "login invalid password");
        }

        Ok(AuthError::InvalidCredentials {
            attempts_left: Some(self.policy.decide(attempts, now).attempts_left),
        })
    }

    /// The row was unlocked when read but is locked now.
    async fn locked_after_read(&self, id: Uuid) -> AuthResult<AuthError> {
        let user = with_deadline(self.timeouts.store, "find_by_id", self.users.find_by_id(id))
            .await?;
        let retry_after_secs = user
            .and_then(|u| self.policy.remaining(u.lock_until, OffsetDateTime::now_utc()))
            .unwrap_or(1);
        warn!(user_id = %id, retry_after_secs, "account locked by a concurrent attempt");
        Ok(AuthError::Locked { retry_after_secs })
    }

    /// Exchanges a stored refresh token for a new access token. The refresh
    /// token itself is returned unchanged.
    #[instrument(skip_all)]
    pub async fn refresh(&self, token: &str) -> AuthResult<RefreshOutcome> {
        if token.is_empty() {
            return Err(AuthError::MissingToken);
        }

        let stored = with_deadline(
            self.timeouts.store,
            "find_refresh_token",
            self.refresh_tokens.find(token),
        )
        .await?
        .ok_or(AuthError::InvalidRefreshToken)?;

        if stored.revoked {
            warn!(user_id = %stored.user_id, "refresh with revoked token");
            return Err(AuthError::Revoked);
        }
        if stored.expires_at <= OffsetDateTime::now_utc() {
            return Err(AuthError::Expired);
        }

        let claims = self.issuer.verify_refresh(token).map_err(|e| {
            warn!(error = %e, user_id = %stored.user_id, "refresh token failed verification");
            AuthError::InvalidSignature
        })?;
        if claims.sub != stored.user_id {
            warn!(user_id = %stored.user_id, "refresh token subject mismatch");
            return Err(AuthError::InvalidSignature);
        }

        let user = with_deadline(
            self.timeouts.store,
            "find_by_id",
            self.users.find_by_id(stored.user_id),
        )
        .await?
        .ok_or(AuthError::InvalidRefreshToken)?;

        let access = self.issuer.issue_access(user.id, user.role)?;
        info!(user_id = %user.id, "access token refreshed");
        Ok(RefreshOutcome {
            access_token: access.token,
            refresh_token: token.to_string(),
        })
    }

    /// Revokes the token if it is stored; unknown tokens are not an error.
    #[instrument(skip_all)]
    pub async fn logout(&self, token: &str) -> AuthResult<()> {
        if token.is_empty() {
            return Err(AuthError::MissingToken);
        }
        let revoked = with_deadline(
            self.timeouts.store,
            "revoke_refresh_token",
            self.refresh_tokens.revoke(token),
        )
        .await?;
        info!(revoked, "logout");
        Ok(())
    }

    /// Profile of the access token's subject.
    #[instrument(skip(self))]
    pub async fn current_user(&self, user_id: Uuid) -> AuthResult<User> {
        with_deadline(
            self.timeouts.store,
            "find_by_id",
            self.users.find_by_id(user_id),
        )
        .await?
        .ok_or(AuthError::Unauthorized("User not found"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::jwt::test_config;
    use crate::auth::memory::{MemoryStore, StaleEmailLookup};
    use crate::auth::repo_types::NewUser;
    use crate::config::JwtConfig;
    use time::Duration;

    const PASSWORD: &str = "Secret1";

    fn service_with(store: Arc<MemoryStore>, cfg: &JwtConfig) -> SessionService {
        SessionService::new(
            store.clone(),
            store,
            CredentialHasher::new(1),
            LockoutPolicy::default(),
            Arc::new(TokenIssuer::from_config(cfg)),
            Timeouts::default(),
        )
    }

    async fn setup(verified: bool) -> (SessionService, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::default());
        let user = UserRepository::create(
            &*store,
            NewUser {
                email: "a@x.com".into(),
                password_hash: CredentialHasher::new(1).hash(PASSWORD).await.unwrap(),
                role: Role::User,
                verification_code: "123456".into(),
            },
        )
        .await
        .unwrap();
        if verified {
            assert!(store.mark_verified(user.id, "123456").await.unwrap());
        }
        (service_with(store.clone(), &test_config()), store)
    }

    fn attempts_left(res: AuthResult<LoginOutcome>) -> Option<i32> {
        match res {
            Err(AuthError::InvalidCredentials { attempts_left }) => attempts_left,
            other => panic!("expected invalid credentials, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn login_issues_and_persists_tokens() {
        let (svc, store) = setup(true).await;
        let out = svc.login("a@x.com", PASSWORD).await.unwrap();
        assert_eq!(out.role, Role::User);

        let stored = store.refresh_token(&out.refresh_token).unwrap();
        assert_eq!(stored.user_id, out.user_id);
        assert!(!stored.revoked);
        let days = (stored.expires_at - OffsetDateTime::now_utc()).whole_days();
        assert!((6..=7).contains(&days));

        let issuer = TokenIssuer::from_config(&test_config());
        let claims = issuer.verify_access(&out.access_token).unwrap();
        assert_eq!(claims.sub, out.user_id);
        assert_eq!(claims.role, Role::User);
    }

    #[tokio::test]
    async fn unknown_email_is_generic_invalid_credentials() {
        let (svc, _) = setup(true).await;
        assert_eq!(attempts_left(svc.login("who@x.com", PASSWORD).await), None);
    }

    #[tokio::test]
    async fn failed_attempts_count_down_then_lock() {
        let (svc, store) = setup(true).await;
        assert_eq!(attempts_left(svc.login("a@x.com", "wrong").await), Some(2));
        assert_eq!(attempts_left(svc.login("a@x.com", "wrong").await), Some(1));
        assert!(store.user_by_email("a@x.com").unwrap().lock_until.is_none());

        assert_eq!(attempts_left(svc.login("a@x.com", "wrong").await), Some(0));
        let user = store.user_by_email("a@x.com").unwrap();
        assert_eq!(user.failed_login_attempts, 3);
        let lock = user.lock_until.expect("locked");
        let secs = (lock - OffsetDateTime::now_utc()).whole_seconds();
        assert!((55..=60).contains(&secs), "lock ~60s out, got {secs}");
    }

    #[tokio::test]
    async fn locked_account_rejects_even_correct_password() {
        let (svc, store) = setup(true).await;
        store.update_user("a@x.com", |u| u.failed_login_attempts = 2);
        assert_eq!(attempts_left(svc.login("a@x.com", "wrong").await), Some(0));

        match svc.login("a@x.com", PASSWORD).await {
            Err(AuthError::Locked { retry_after_secs }) => {
                assert!((1..=60).contains(&retry_after_secs))
            }
            other => panic!("expected locked, got {other:?}"),
        }
        // attempts during a lock are not counted
        assert_eq!(store.user_by_email("a@x.com").unwrap().failed_login_attempts, 3);
    }

    #[tokio::test]
    async fn scenario_two_wrong_then_locked() {
        let (svc, store) = setup(true).await;
        store.update_user("a@x.com", |u| u.failed_login_attempts = 1);
        assert_eq!(attempts_left(svc.login("a@x.com", "wrong").await), Some(1));
        assert_eq!(attempts_left(svc.login("a@x.com", "wrong").await), Some(0));
        assert!(matches!(
            svc.login("a@x.com", "wrong").await,
            Err(AuthError::Locked { .. })
        ));
    }

    #[tokio::test]
    async fn expired_lock_is_cleared_on_success() {
        let (svc, store) = setup(true).await;
        store.update_user("a@x.com", |u| {
            u.failed_login_attempts = 3;
            u.lock_until = Some(OffsetDateTime::now_utc() - Duration::seconds(1));
        });
        svc.login("a@x.com", PASSWORD).await.unwrap();
        let user = store.user_by_email("a@x.com").unwrap();
        assert_eq!(user.failed_login_attempts, 0);
        assert!(user.lock_until.is_none());
    }

    #[tokio::test]
    async fn wrong_password_after_expired_lock_locks_again() {
        let (svc, store) = setup(true).await;
        store.update_user("a@x.com", |u| {
            u.failed_login_attempts = 3;
            u.lock_until = Some(OffsetDateTime::now_utc() - Duration::seconds(1));
        });
        assert_eq!(attempts_left(svc.login("a@x.com", "wrong").await), Some(0));
        let lock = store.user_by_email("a@x.com").unwrap().lock_until.unwrap();
        assert!(lock > OffsetDateTime::now_utc());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn parallel_failures_stop_at_the_lock() {
        let (svc, store) = setup(true).await;
        let svc = Arc::new(svc);

        let attempts: Vec<_> = (0..10)
            .map(|_| {
                let svc = svc.clone();
                tokio::spawn(async move { svc.login("a@x.com", "wrong").await })
            })
            .collect();

        let (mut invalid, mut locked) = (0, 0);
        for attempt in attempts {
            match attempt.await.unwrap() {
                Err(AuthError::InvalidCredentials { .. }) => invalid += 1,
                Err(AuthError::Locked { .. }) => locked += 1,
                other => panic!("unexpected outcome {other:?}"),
            }
        }
        assert_eq!(invalid, 3);
        assert_eq!(locked, 7);
        assert_eq!(store.user_by_email("a@x.com").unwrap().failed_login_attempts, 3);
    }

    // The row was read unlocked, then another request locked the account
    // before this one finished checking the password.
    fn service_reading_before_lock(store: Arc<MemoryStore>) -> SessionService {
        let snapshot = store.user_by_email("a@x.com").unwrap();
        store.update_user("a@x.com", |u| {
            u.failed_login_attempts = 3;
            u.lock_until = Some(OffsetDateTime::now_utc() + Duration::seconds(60));
        });
        SessionService::new(
            Arc::new(StaleEmailLookup::new(store.clone(), snapshot)),
            store,
            CredentialHasher::new(1),
            LockoutPolicy::default(),
            Arc::new(TokenIssuer::from_config(&test_config())),
            Timeouts::default(),
        )
    }

    #[tokio::test]
    async fn correct_password_does_not_undo_a_concurrent_lock() {
        let (_, store) = setup(true).await;
        let svc = service_reading_before_lock(store.clone());

        match svc.login("a@x.com", PASSWORD).await {
            Err(AuthError::Locked { retry_after_secs }) => {
                assert!((1..=60).contains(&retry_after_secs))
            }
            other => panic!("expected locked, got {other:?}"),
        }
        let user = store.user_by_email("a@x.com").unwrap();
        assert_eq!(user.failed_login_attempts, 3);
        assert!(user.lock_until.is_some());
    }

    #[tokio::test]
    async fn wrong_password_after_a_concurrent_lock_is_not_counted() {
        let (_, store) = setup(true).await;
        let svc = service_reading_before_lock(store.clone());

        assert!(matches!(
            svc.login("a@x.com", "wrong").await,
            Err(AuthError::Locked { .. })
        ));
        assert_eq!(store.user_by_email("a@x.com").unwrap().failed_login_attempts, 3);
    }

    #[tokio::test]
    async fn unverified_account_cannot_login() {
        let (svc, store) = setup(false).await;
        assert!(matches!(
            svc.login("a@x.com", PASSWORD).await,
            Err(AuthError::Unverified)
        ));
        assert_eq!(store.user_by_email("a@x.com").unwrap().failed_login_attempts, 0);
    }

    #[tokio::test]
    async fn refresh_returns_new_access_and_same_refresh() {
        let (svc, _) = setup(true).await;
        let out = svc.login("a@x.com", PASSWORD).await.unwrap();
        let refreshed = svc.refresh(&out.refresh_token).await.unwrap();
        assert_eq!(refreshed.refresh_token, out.refresh_token);
        let claims = TokenIssuer::from_config(&test_config())
            .verify_access(&refreshed.access_token)
            .unwrap();
        assert_eq!(claims.sub, out.user_id);
    }

    #[tokio::test]
    async fn refresh_failure_modes() {
        let (svc, store) = setup(true).await;
        assert!(matches!(svc.refresh("").await, Err(AuthError::MissingToken)));
        assert!(matches!(
            svc.refresh("never-issued").await,
            Err(AuthError::InvalidRefreshToken)
        ));

        let out = svc.login("a@x.com", PASSWORD).await.unwrap();
        store.update_refresh_token(&out.refresh_token, |t| {
            t.expires_at = OffsetDateTime::now_utc() - Duration::seconds(1)
        });
        assert!(matches!(svc.refresh(&out.refresh_token).await, Err(AuthError::Expired)));
    }

    #[tokio::test]
    async fn refresh_checks_signature_of_stored_token() {
        let (_, store) = setup(true).await;
        let user = store.user_by_email("a@x.com").unwrap();
        let forged = TokenIssuer::from_config(&JwtConfig {
            refresh_secret: "other-secret".into(),
            ..test_config()
        })
        .issue_refresh(user.id)
        .unwrap();
        RefreshTokenRepository::create(
            &*store,
            NewRefreshToken {
                token: forged.token.clone(),
                user_id: user.id,
                expires_at: forged.expires_at,
            },
        )
        .await
        .unwrap();

        let svc = service_with(store, &test_config());
        assert!(matches!(
            svc.refresh(&forged.token).await,
            Err(AuthError::InvalidSignature)
        ));
    }

    #[tokio::test]
    async fn logout_is_idempotent_and_revokes() {
        let (svc, store) = setup(true).await;
        let out = svc.login("a@x.com", PASSWORD).await.unwrap();

        svc.logout(&out.refresh_token).await.unwrap();
        assert!(store.refresh_token(&out.refresh_token).unwrap().revoked);
        svc.logout(&out.refresh_token).await.unwrap();
        assert!(store.refresh_token(&out.refresh_token).unwrap().revoked);

        svc.logout("unknown-token").await.unwrap();
        assert!(matches!(svc.logout("").await, Err(AuthError::MissingToken)));

        assert!(matches!(svc.refresh(&out.refresh_token).await, Err(AuthError::Revoked)));
    }

    #[tokio::test]
    async fn current_user_loads_profile() {
        let (svc, _) = setup(true).await;
        let out = svc.login("a@x.com", PASSWORD).await.unwrap();
        let user = svc.current_user(out.user_id).await.unwrap();
        assert_eq!(user.email, "a@x.com");
        assert!(matches!(
            svc.current_user(Uuid::new_v4()).await,
            Err(AuthError::Unauthorized(_))
        ));
    }
}
