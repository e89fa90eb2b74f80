//! Database query functions for the `dispatcher_leases` table.
//!
//! A lease is a single row per singleton loop name. Acquisition is a
//! conditional upsert: it succeeds when the row is absent, expired, or
//! already owned by the caller (renewal).

use anyhow::{Context, Result};
use sqlx::PgPool;

/// Try to acquire (or renew) the named lease for `ttl_secs`.
///
/// Returns `true` when the caller holds the lease after the call.
pub async fn acquire(pool: &PgPool, name: &str, owner: &str, ttl_secs: i64) -> Result<bool> {
    let result = sqlx::query(
        "INSERT INTO dispatcher_leases (name, owner, expires_at) \
         VALUES ($1, $2, NOW() + make_interval(secs => $3::double precision)) \
         ON CONFLICT (name) DO UPDATE \
         SET owner = EXCLUDED.owner, expires_at = EXCLUDED.expires_at \
         WHERE dispatcher_leases.expires_at < NOW() \
            OR dispatcher_leases.owner = EXCLUDED.owner",
    )
    .bind(name)
    .bind(owner)
    .bind(ttl_secs as f64)
    .execute(pool)
    .await
    .context("failed to acquire lease")?;

    Ok(result.rows_affected() == 1)
}

/// Release the named lease if the caller still owns it.
pub async fn release(pool: &PgPool, name: &str, owner: &str) -> Result<()> {
    sqlx::query("DELETE FROM dispatcher_leases WHERE name = $1 AND owner = $2")
        .bind(name)
        .bind(owner)
        .execute(pool)
        .await
        .context("failed to release lease")?;

    Ok(())
}
