//! Background job: delete expired bearer tokens.
//!
//! Best-effort. A failed sweep is logged and retried on the next tick; it
//! never affects request handling, since validation rejects expired rows on
//! its own.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};

use crate::AppState;

/// Spawn the sweeper. Returns `None` when `every` is zero (disabled).
pub fn spawn(state: Arc<AppState>, every: Duration) -> Option<JoinHandle<()>> {
    if every.is_zero() {
        tracing::info!("expired-token sweeper disabled");
        return None;
    }

    Some(tokio::spawn(async move {
        let mut interval = time::interval(every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            if let Err(e) = sweep_once(&state).await {
                tracing::error!("token sweep failed: {}", e);
            }
        }
    }))
}

/// One sweep pass. Returns the number of rows removed; a failure is counted
/// before it is returned.
pub async fn sweep_once(state: &AppState) -> anyhow::Result<u64> {
    let removed = match state.issuer.sweep_expired().await {
        Ok(removed) => removed,
        Err(e) => {
            state.metrics.record_sweep_failure();
            return Err(e.into());
        }
    };
    state.metrics.record_sweep(removed);
    if removed > 0 {
        tracing::info!(rows = removed, "swept expired tokens");
    }
    Ok(removed)
}
