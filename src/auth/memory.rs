//! In-process repositories used by the service and HTTP tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::auth::repo::{RefreshTokenRepository, RepoError, RepoResult, UserRepository};
use crate::auth::repo_types::{FailedLogin, NewRefreshToken, NewUser, RefreshToken, Role, User};

#[derive(Default)]
pub struct MemoryStore {
    users: Mutex<HashMap<Uuid, User>>,
    tokens: Mutex<HashMap<String, RefreshToken>>,
}

impl MemoryStore {
    pub fn user_by_email(&self, email: &str) -> Option<User> {
        let users = self.users.lock().unwrap();
        users.values().find(|u| u.email == email).cloned()
    }

    /// Mutate a stored user in place, e.g. to backdate a lock.
    pub fn update_user(&self, email: &str, f: impl FnOnce(&mut User)) {
        let mut users = self.users.lock().unwrap();
        let user = users
            .values_mut()
            .find(|u| u.email == email)
            .expect("user exists");
        f(user);
    }

    pub fn refresh_token(&self, token: &str) -> Option<RefreshToken> {
        self.tokens.lock().unwrap().get(token).cloned()
    }

    pub fn update_refresh_token(&self, token: &str, f: impl FnOnce(&mut RefreshToken)) {
        let mut tokens = self.tokens.lock().unwrap();
        f(tokens.get_mut(token).expect("token exists"));
    }
}

#[async_trait]
impl UserRepository for MemoryStore {
    async fn find_by_email(&self, email: &str) -> RepoResult<Option<User>> {
        Ok(self.user_by_email(email))
    }

    async fn find_by_id(&self, id: Uuid) -> RepoResult<Option<User>> {
        Ok(self.users.lock().unwrap().get(&id).cloned())
    }

    async fn create(&self, new: NewUser) -> RepoResult<User> {
        let mut users = self.users.lock().unwrap();
        if users.values().any(|u| u.email == new.email) {
            return Err(RepoError::Conflict);
        }
        let user = User {
            id: Uuid::new_v4(),
            email: new.email,
            password_hash: new.password_hash,
            role: new.role,
            is_verified: false,
            verification_code: Some(new.verification_code),
            reset_token_hash: None,
            failed_login_attempts: 0,
            lock_until: None,
            created_at: OffsetDateTime::now_utc(),
        };
        users.insert(user.id, user.clone());
        Ok(user)
    }

    async fn create_verified(
        &self,
        email: &str,
        password_hash: &str,
        role: Role,
    ) -> RepoResult<User> {
        let mut users = self.users.lock().unwrap();
        if users.values().any(|u| u.email == email) {
            return Err(RepoError::Conflict);
        }
        let user = User {
            id: Uuid::new_v4(),
            email: email.to_string(),
            password_hash: password_hash.to_string(),
            role,
            is_verified: true,
            verification_code: None,
            reset_token_hash: None,
            failed_login_attempts: 0,
            lock_until: None,
            created_at: OffsetDateTime::now_utc(),
        };
        users.insert(user.id, user.clone());
        Ok(user)
    }

    async fn mark_verified(&self, id: Uuid, code: &str) -> RepoResult<bool> {
        let mut users = self.users.lock().unwrap();
        match users.get_mut(&id) {
            Some(u) if !u.is_verified && u.verification_code.as_deref() == Some(code) => {
                u.is_verified = true;
                u.verification_code = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn set_reset_token_hash(&self, id: Uuid, token_hash: &str) -> RepoResult<()> {
        if let Some(u) = self.users.lock().unwrap().get_mut(&id) {
            u.reset_token_hash = Some(token_hash.to_string());
        }
        Ok(())
    }

    async fn consume_reset_token(
        &self,
        token_hash: &str,
        password_hash: &str,
    ) -> RepoResult<Option<Uuid>> {
        let mut users = self.users.lock().unwrap();
        let Some(u) = users
            .values_mut()
            .find(|u| u.reset_token_hash.as_deref() == Some(token_hash))
        else {
            return Ok(None);
        };
        u.password_hash = password_hash.to_string();
        u.reset_token_hash = None;
        u.failed_login_attempts = 0;
        u.lock_until = None;
        Ok(Some(u.id))
    }

    async fn record_failed_login(
        &self,
        id: Uuid,
        now: OffsetDateTime,
        max_attempts: i32,
        lock_at: OffsetDateTime,
    ) -> RepoResult<Option<FailedLogin>> {
        let mut users = self.users.lock().unwrap();
        let u = users
            .get_mut(&id)
            .ok_or(RepoError::Database(sqlx::Error::RowNotFound))?;
        if u.lock_until.is_some_and(|until| until > now) {
            return Ok(None);
        }
        u.failed_login_attempts += 1;
        if u.failed_login_attempts >= max_attempts {
            u.lock_until = Some(lock_at);
        }
        Ok(Some(FailedLogin {
            failed_login_attempts: u.failed_login_attempts,
            lock_until: u.lock_until,
        }))
    }

    async fn clear_failed_logins(&self, id: Uuid, now: OffsetDateTime) -> RepoResult<bool> {
        let mut users = self.users.lock().unwrap();
        match users.get_mut(&id) {
            Some(u) if u.lock_until.map_or(true, |until| until <= now) => {
                u.failed_login_attempts = 0;
                u.lock_until = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl RefreshTokenRepository for MemoryStore {
    async fn create(&self, new: NewRefreshToken) -> RepoResult<RefreshToken> {
        let mut tokens = self.tokens.lock().unwrap();
        if tokens.contains_key(&new.token) {
            return Err(RepoError::Conflict);
        }
        let record = RefreshToken {
            token: new.token,
            user_id: new.user_id,
            expires_at: new.expires_at,
            revoked: false,
            created_at: OffsetDateTime::now_utc(),
        };
        tokens.insert(record.token.clone(), record.clone());
        Ok(record)
    }

    async fn find(&self, token: &str) -> RepoResult<Option<RefreshToken>> {
        Ok(self.refresh_token(token))
    }

    async fn revoke(&self, token: &str) -> RepoResult<u64> {
        match self.tokens.lock().unwrap().get_mut(token) {
            Some(t) => {
                t.revoked = true;
                Ok(1)
            }
            None => Ok(0),
        }
    }
}

/// Serves `find_by_email` from a snapshot taken before some later write, so
/// tests can reproduce a request that read the row just before a concurrent
/// request changed it. Everything else goes to the live store.
pub struct StaleEmailLookup {
    live: Arc<MemoryStore>,
    snapshot: User,
}

impl StaleEmailLookup {
    pub fn new(live: Arc<MemoryStore>, snapshot: User) -> Self {
        Self { live, snapshot }
    }
}

#[async_trait]
impl UserRepository for StaleEmailLookup {
    async fn find_by_email(&self, email: &str) -> RepoResult<Option<User>> {
        Ok((self.snapshot.email == email).then(|| self.snapshot.clone()))
    }

    async fn find_by_id(&self, id: Uuid) -> RepoResult<Option<User>> {
        self.live.find_by_id(id).await
    }

    async fn create(&self, user: NewUser) -> RepoResult<User> {
        UserRepository::create(&*self.live, user).await
    }

    async fn create_verified(
        &self,
        email: &str,
        password_hash: &str,
        role: Role,
    ) -> RepoResult<User> {
        self.live.create_verified(email, password_hash, role).await
    }

    async fn mark_verified(&self, id: Uuid, code: &str) -> RepoResult<bool> {
        self.live.mark_verified(id, code).await
    }

    async fn set_reset_token_hash(&self, id: Uuid, token_hash: &str) -> RepoResult<()> {
        self.live.set_reset_token_hash(id, token_hash).await
    }

    async fn consume_reset_token(
        &self,
        token_hash: &str,
        password_hash: &str,
    ) -> RepoResult<Option<Uuid>> {
        self.live.consume_reset_token(token_hash, password_hash).await
    }

    async fn record_failed_login(
        &self,
        id: Uuid,
        now: OffsetDateTime,
        max_attempts: i32,
        lock_at: OffsetDateTime,
    ) -> RepoResult<Option<FailedLogin>> {
        self.live
            .record_failed_login(id, now, max_attempts, lock_at)
            .await
    }

    async fn clear_failed_logins(&self, id: Uuid, now: OffsetDateTime) -> RepoResult<bool> {
        self.live.clear_failed_logins(id, now).await
    }
}
