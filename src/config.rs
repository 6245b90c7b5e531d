use anyhow::Context;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct JwtConfig {
    pub access_secret: String,
    pub refresh_secret: String,
    pub issuer: String,
    pub audience: String,
    pub access_ttl_minutes: i64,
    pub refresh_ttl_days: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LockoutConfig {
    pub max_attempts: i32,
    pub duration_secs: i64,
}

/// Privileged account created at startup when absent.
#[derive(Clone, Deserialize)]
pub struct AdminSeed {
    pub email: String,
    pub password: String,
}

impl std::fmt::Debug for AdminSeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdminSeed")
            .field("email", &self.email)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub database_url: String,
    pub db_max_connections: u32,
    pub jwt: JwtConfig,
    pub lockout: LockoutConfig,
    /// Argon2 time cost (iterations).
    pub password_hash_cost: u32,
    pub store_timeout_ms: u64,
    pub notify_timeout_ms: u64,
    /// Echo the verification code back in the register response.
    pub expose_debug_tokens: bool,
    /// Include message payloads (codes, reset tokens) in the email log.
    pub log_email_payload: bool,
    pub api_prefix: String,
    pub admin: Option<AdminSeed>,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;
        let jwt = JwtConfig {
            access_secret: required_secret("JWT_ACCESS_SECRET")?,
            refresh_secret: required_secret("JWT_REFRESH_SECRET")?,
            issuer: std::env::var("JWT_ISSUER").unwrap_or_else(|_| "gatekeeper".into()),
            audience: std::env::var("JWT_AUDIENCE").unwrap_or_else(|_| "gatekeeper-users".into()),
            access_ttl_minutes: parsed_or("JWT_ACCESS_TTL_MINUTES", 15),
            refresh_ttl_days: parsed_or("JWT_REFRESH_TTL_DAYS", 7),
        };
        let lockout = LockoutConfig {
            max_attempts: parsed_or("LOCKOUT_MAX_ATTEMPTS", 3),
            duration_secs: parsed_or("LOCKOUT_DURATION_SECS", 60),
        };
        Ok(Self {
            database_url,
            db_max_connections: parsed_or("DB_MAX_CONNECTIONS", 10),
            jwt,
            lockout,
            password_hash_cost: parsed_or("PASSWORD_HASH_COST", 10),
            store_timeout_ms: parsed_or("STORE_TIMEOUT_MS", 5_000),
            notify_timeout_ms: parsed_or("NOTIFY_TIMEOUT_MS", 5_000),
            expose_debug_tokens: parsed_or("EXPOSE_DEBUG_TOKENS", true),
            log_email_payload: parsed_or("LOG_EMAIL_PAYLOAD", false),
            api_prefix: std::env::var("API_PREFIX").unwrap_or_else(|_| "/api".into()),
            admin: admin_seed()?,
        })
    }
}

// Signing secrets have no fallback: a missing or blank value aborts startup.
fn required_secret(key: &str) -> anyhow::Result<String> {
    let value = std::env::var(key).with_context(|| format!("{key} must be set"))?;
    if value.trim().is_empty() {
        anyhow::bail!("{key} must not be empty");
    }
    Ok(value)
}

// ADMIN_EMAIL switches seeding on; a password is then mandatory.
fn admin_seed() -> anyhow::Result<Option<AdminSeed>> {
    match std::env::var("ADMIN_EMAIL") {
        Ok(email) if !email.trim().is_empty() => Ok(Some(AdminSeed {
            email: email.trim().to_string(),
            password: required_secret("ADMIN_PASSWORD")?,
        })),
        _ => Ok(None),
    }
}

fn parsed_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}
