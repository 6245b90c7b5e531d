use argon2::{
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Algorithm, Argon2, Params, Version,
};
use anyhow::Context;
use rand::rngs::OsRng;
use tracing::error;

/// Argon2 memory cost in KiB.
const MEMORY_COST_KIB: u32 = 19 * 1024;

/// Salted Argon2id hashing with a configurable time cost. Both operations
/// run on the blocking pool so a slow hash never stalls an async worker.
#[derive(Debug, Clone, Copy)]
pub struct CredentialHasher {
    time_cost: u32,
}

impl CredentialHasher {
    pub fn new(time_cost: u32) -> Self {
        Self {
            time_cost: time_cost.max(1),
        }
    }

    fn argon2(&self) -> anyhow::Result<Argon2<'static>> {
        let params = Params::new(MEMORY_COST_KIB, self.time_cost, 1, None)
            .map_err(|e| anyhow::anyhow!("argon2 params: {e}"))?;
        Ok(Argon2::new(Algorithm::Argon2id, Version::V0x13, params))
    }

    pub async fn hash(&self, plain: &str) -> anyhow::Result<String> {
        let hasher = *self;
        let plain = plain.to_owned();
        tokio::task::spawn_blocking(move || hasher.hash_blocking(&plain))
            .await
            .context("password hashing task failed")?
    }

    /// Parameters are read back from the PHC string, so hashes made under an
    /// older cost still verify.
    pub async fn verify(&self, plain: &str, hash: &str) -> anyhow::Result<bool> {
        let hasher = *self;
        let plain = plain.to_owned();
        let hash = hash.to_owned();
        tokio::task::spawn_blocking(move || hasher.verify_blocking(&plain, &hash))
            .await
            .context("password verification task failed")?
    }

    fn hash_blocking(&self, plain: &str) -> anyhow::Result<String> {
        let salt = SaltString::generate(&mut OsRng);
        let hash = self
            .argon2()?
            .hash_password(plain.as_bytes(), &salt)
            .map_err(|e| {
                error!(error = %e, "argon2 hash_password error");
                anyhow::anyhow!(e.to_string())
            })?
            .to_string();
        Ok(hash)
    }

    fn verify_blocking(&self, plain: &str, hash: &str) -> anyhow::Result<bool> {
        let parsed = PasswordHash::new(hash).map_err(|e| {
            error!(error = %e, "argon2 parse hash error");
            anyhow::anyhow!(e.to_string())
        })?;
        Ok(Argon2::default()
            .verify_password(plain.as_bytes(), &parsed)
            .is_ok())
    }
}
