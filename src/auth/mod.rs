use std::time::Duration;

use crate::state::AppState;
use axum::Router;

pub mod account;
pub mod claims;
pub mod dto;
pub(crate) mod extractors;
pub mod handlers;
pub mod jwt;
pub mod lockout;
#[cfg(test)]
pub(crate) mod memory;
pub mod password;
pub mod repo;
pub mod repo_types;
pub mod session;

/// Deadlines applied to every storage and mail call.
#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    pub store: Duration,
    pub notify: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            store: Duration::from_secs(5),
            notify: Duration::from_secs(5),
        }
    }
}

pub fn router() -> Router<AppState> {
    handlers::auth_routes()
}
