// bcrypt hashing. Both directions are CPU-bound and run on the blocking pool.

use anyhow::Context;

pub use bcrypt::DEFAULT_COST;

/// Clamp a configured cost into the range bcrypt accepts.
pub fn clamp_cost(cost: u32) -> u32 {
    cost.clamp(4, 31)
}

pub async fn hash_password(password: &str, cost: u32) -> anyhow::Result<String> {
    let password = password.to_owned();
    let cost = clamp_cost(cost);
    tokio::task::spawn_blocking(move || bcrypt::hash(password, cost))
        .await
        .context("password hashing task panicked")?
        .context("failed to hash password")
}

/// `Ok(false)` on mismatch. A stored value that is not a bcrypt hash is an error.
pub async fn verify_password(password: &str, hash: &str) -> anyhow::Result<bool> {
    let password = password.to_owned();
    let hash = hash.to_owned();
    tokio::task::spawn_blocking(move || bcrypt::verify(password, &hash))
        .await
        .context("password verification task panicked")?
        .context("failed to verify password")
}
