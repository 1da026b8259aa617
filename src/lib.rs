//! usersys — user accounts with server-side bearer tokens.
//!
//! The binary in `main.rs` wires these modules to Postgres; integration tests
//! in `tests/` drive the same router against `store::memory::MemoryStore`.

use std::sync::Arc;

pub mod api;
pub mod auth;
pub mod cli;
pub mod config;
pub mod errors;
pub mod jobs;
pub mod metrics;
pub mod models;
pub mod store;

use auth::TokenIssuer;
use metrics::Metrics;
use store::{TokenStore, UserStore};

/// Shared application state passed to handlers and middleware.
pub struct AppState {
    pub users: Arc<dyn UserStore>,
    pub issuer: TokenIssuer,
    pub metrics: Metrics,
    pub config: config::Config,
}

impl AppState {
    pub fn new(tokens: Arc<dyn TokenStore>, users: Arc<dyn UserStore>, config: config::Config) -> Self {
        Self {
            users,
            issuer: TokenIssuer::new(tokens, config.token_ttl),
            metrics: Metrics::new(),
            config,
        }
    }
}
