use std::sync::Arc;

mod app;
mod auth;
mod config;
mod error;
mod notify;
mod state;

use crate::auth::repo_types::Role;
use crate::config::AppConfig;
use crate::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let env_filter = std::env::var("RUST_LOG")
        .unwrap_or_else(|_| "gatekeeper=debug,axum=info,tower_http=info".to_string());
    let json_logs = std::env::var("LOG_FORMAT")
        .map(|v| v == "json")
        .unwrap_or(false);

    if json_logs {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    // Missing signing secrets or DATABASE_URL stop startup here.
    let config = Arc::new(AppConfig::from_env()?);
    let db = state::connect(&config).await?;

    sqlx::migrate!("./migrations").run(&db).await?;

    let app_state = AppState::postgres(config.clone(), db);
    if let Some(admin) = &config.admin {
        app_state
            .accounts
            .seed_account(&admin.email, &admin.password, Role::Admin)
            .await
            .map_err(|e| anyhow::anyhow!("seed admin account: {e}"))?;
    }
    app::serve(app::build_app(app_state)).await
}
