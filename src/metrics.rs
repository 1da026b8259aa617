//! Prometheus counters for logins, gate decisions and the expiry sweeper
//! (rows removed and failed passes).
//!
//! Each recorder owns its own `Registry` so several app instances (tests) can
//! coexist in one process.

use prometheus::{opts, Encoder, IntCounter, IntCounterVec, Registry, TextEncoder};

pub struct Metrics {
    registry: Registry,
    logins_total: IntCounterVec,
    auth_decisions_total: IntCounterVec,
    tokens_swept_total: IntCounter,
    token_sweeps_failed_total: IntCounter,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let logins_total = IntCounterVec::new(
            opts!("usersys_logins_total", "Login attempts by outcome"),
            &["outcome"],
        )
        .expect("valid usersys_logins_total definition");
        registry
            .register(Box::new(logins_total.clone()))
            .expect("failed to register usersys_logins_total");

        let auth_decisions_total = IntCounterVec::new(
            opts!(
                "usersys_auth_decisions_total",
                "Auth gate decisions on protected routes"
            ),
            &["outcome"],
        )
        .expect("valid usersys_auth_decisions_total definition");
        registry
            .register(Box::new(auth_decisions_total.clone()))
            .expect("failed to register usersys_auth_decisions_total");

        let tokens_swept_total = IntCounter::with_opts(opts!(
            "usersys_tokens_swept_total",
            "Expired tokens removed by the background sweeper"
        ))
        .expect("valid usersys_tokens_swept_total definition");
        registry
            .register(Box::new(tokens_swept_total.clone()))
            .expect("failed to register usersys_tokens_swept_total");

        let token_sweeps_failed_total = IntCounter::with_opts(opts!(
            "usersys_token_sweeps_failed_total",
            "Expiry sweeps that failed against the store"
        ))
        .expect("valid usersys_token_sweeps_failed_total definition");
        registry
            .register(Box::new(token_sweeps_failed_total.clone()))
            .expect("failed to register usersys_token_sweeps_failed_total");

        Self {
            registry,
            logins_total,
            auth_decisions_total,
            tokens_swept_total,
            token_sweeps_failed_total,
        }
    }

    /// `outcome` is one of: success, unknown_user, deleted, bad_password, error.
    pub fn record_login(&self, outcome: &str) {
        self.logins_total.with_label_values(&[outcome]).inc();
    }

    pub fn record_auth(&self, outcome: &str) {
        self.auth_decisions_total.with_label_values(&[outcome]).inc();
    }

    pub fn record_sweep(&self, removed: u64) {
        self.tokens_swept_total.inc_by(removed);
    }

    pub fn record_sweep_failure(&self) {
        self.token_sweeps_failed_total.inc();
    }

    /// Prometheus text exposition for `/metrics`.
    pub fn encode(&self) -> String {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buffer) {
            tracing::warn!("failed to encode metrics: {}", e);
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
