// Postgres-backed counter store: quotas, concurrency slots, token buckets
//
// Every operation is one atomic statement; this is the store the whole
// fleet shares, so correctness under horizontal scale depends on the
// database doing the arithmetic, not the workers.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::PgPool;

use shu_core::counters::{BucketDecision, CounterStore};
use shu_core::error::{CoreError, Result};

#[derive(Clone)]
pub struct PgCounterStore {
    pool: PgPool,
}

fn db_err(e: sqlx::Error) -> CoreError {
    CoreError::store(e.to_string())
}

impl PgCounterStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CounterStore for PgCounterStore {
    async fn get_counter(&self, key: &str) -> Result<Option<i64>> {
        sqlx::query_scalar(
            r#"
            SELECT value FROM plugin_counters
            WHERE key = $1 AND (expires_at IS NULL OR expires_at > NOW())
            "#,
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)
    }

    async fn set_counter(&self, key: &str, value: i64, ttl: Duration) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO plugin_counters (key, value, expires_at)
            VALUES ($1, $2, NOW() + $3 * INTERVAL '1 second')
            ON CONFLICT (key) DO UPDATE
            SET value = EXCLUDED.value, expires_at = EXCLUDED.expires_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(ttl.as_secs_f64())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn incr(&self, key: &str, ttl: Duration) -> Result<i64> {
        // An expired counter restarts at 1
        sqlx::query_scalar(
            r#"
            INSERT INTO plugin_counters (key, value, expires_at)
            VALUES ($1, 1, NOW() + $2 * INTERVAL '1 second')
            ON CONFLICT (key) DO UPDATE
            SET value = CASE
                    WHEN plugin_counters.expires_at IS NOT NULL AND plugin_counters.expires_at <= NOW() THEN 1
                    ELSE plugin_counters.value + 1
                END,
                expires_at = NOW() + $2 * INTERVAL '1 second'
            RETURNING value
            "#,
        )
        .bind(key)
        .bind(ttl.as_secs_f64())
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)
    }

    async fn decr(&self, key: &str) -> Result<i64> {
        sqlx::query_scalar(
            r#"
            INSERT INTO plugin_counters (key, value) VALUES ($1, -1)
            ON CONFLICT (key) DO UPDATE SET value = plugin_counters.value - 1
            RETURNING value
            "#,
        )
        .bind(key)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)
    }

    async fn take_tokens(
        &self,
        key: &str,
        capacity: u64,
        refill_per_second: u64,
        cost: u64,
    ) -> Result<BucketDecision> {
        // Refill-and-take in one statement; the DO UPDATE WHERE clause makes
        // the take conditional, so a denied request changes nothing but the
        // refill timestamp is also left untouched
        let taken: Option<f64> = sqlx::query_scalar(
            r#"
            INSERT INTO plugin_rate_buckets (key, tokens, last_refill)
            VALUES ($1, $2::float8 - $4::float8, NOW())
            ON CONFLICT (key) DO UPDATE
            SET tokens = LEAST(
                    $2::float8,
                    plugin_rate_buckets.tokens
                        + EXTRACT(EPOCH FROM (NOW() - plugin_rate_buckets.last_refill)) * $3::float8
                ) - $4::float8,
                last_refill = NOW()
            WHERE LEAST(
                    $2::float8,
                    plugin_rate_buckets.tokens
                        + EXTRACT(EPOCH FROM (NOW() - plugin_rate_buckets.last_refill)) * $3::float8
                ) >= $4::float8
            RETURNING tokens
            "#,
        )
        .bind(key)
        .bind(capacity as f64)
        .bind(refill_per_second as f64)
        .bind(cost as f64)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        match taken {
            Some(remaining) => Ok(BucketDecision {
                allowed: true,
                remaining: remaining.max(0.0) as u64,
                retry_after_seconds: 0,
            }),
            None => {
                // Denied: estimate the wait from the current (unmodified) state
                let tokens: Option<f64> = sqlx::query_scalar(
                    r#"
                    SELECT LEAST(
                        $2::float8,
                        tokens + EXTRACT(EPOCH FROM (NOW() - last_refill)) * $3::float8
                    )
                    FROM plugin_rate_buckets
                    WHERE key = $1
                    "#,
                )
                .bind(key)
                .bind(capacity as f64)
                .bind(refill_per_second as f64)
                .fetch_optional(&self.pool)
                .await
                .map_err(db_err)?;

                let tokens = tokens.unwrap_or(0.0);
                let deficit = (cost as f64 - tokens).max(0.0);
                let retry = (deficit / refill_per_second.max(1) as f64).ceil() as u64;
                Ok(BucketDecision {
                    allowed: false,
                    remaining: 0,
                    retry_after_seconds: retry.max(1),
                })
            }
        }
    }
}
