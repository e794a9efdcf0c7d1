use std::future::Future;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::cache::pool::ConnectionPool;
use crate::clock::Clock;
use crate::error::Result;

/// Per-method sliding minute buckets plus a flood-wait ledger, per spec §4.3.
///
/// Grounded on the teacher's `RateLimiter` (`telegram/rate_limiter.rs`), minus its
/// pluggable `RateLimitBackend` trait: a single SQLite-backed implementation suffices
/// here since the limiter's shared-visibility requirement across concurrent workers is
/// already met by the cache store's connection pool.
pub struct RateLimiter {
    pool: Arc<ConnectionPool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitStatus {
    pub total_calls_last_minute: i64,
    pub per_method: Vec<MethodBreakdown>,
    pub blocked_methods: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MethodBreakdown {
    pub method: String,
    pub call_count: i64,
}

impl RateLimiter {
    pub fn new(pool: Arc<ConnectionPool>) -> Self {
        Self { pool }
    }

    fn window_start(now_ms: i64) -> i64 {
        (now_ms / 60_000) * 60
    }

    /// `recordCall`: increments `(method, window_start)`, `window_start = floor(now/60)*60`.
    pub async fn record_call(&self, method: &str, now_ms: i64) -> Result<()> {
        let method = method.to_string();
        let window_start = Self::window_start(now_ms);
        let conn = self.pool.acquire().await?;
        conn.execute(move |c| {
            c.execute(
                "INSERT INTO rate_windows (method, window_start, call_count)
                 VALUES (?1, ?2, 1)
                 ON CONFLICT(method, window_start) DO UPDATE SET call_count = call_count + 1",
                rusqlite::params![method, window_start],
            )?;
            Ok(())
        })
    }

    /// `getCallCount`: sums buckets where `window_start >= now - 60*minutes`.
    pub async fn get_call_count(&self, method: Option<&str>, minutes: i64, now_ms: i64) -> Result<i64> {
        let method = method.map(|s| s.to_string());
        let cutoff = Self::window_start(now_ms) - 60 * minutes;
        let conn = self.pool.acquire().await?;
        conn.execute(move |c| match &method {
            Some(method) => c.query_row(
                "SELECT COALESCE(SUM(call_count), 0) FROM rate_windows
                 WHERE method = ?1 AND window_start >= ?2",
                rusqlite::params![method, cutoff],
                |row| row.get(0),
            ),
            None => c.query_row(
                "SELECT COALESCE(SUM(call_count), 0) FROM rate_windows WHERE window_start >= ?1",
                [cutoff],
                |row| row.get(0),
            ),
        })
    }

    /// `setFloodWait`: writes `flood_wait_until = now + seconds` for the current window.
    pub async fn set_flood_wait(&self, method: &str, seconds: u32, now_ms: i64) -> Result<()> {
        let method = method.to_string();
        let window_start = Self::window_start(now_ms);
        let flood_wait_until = now_ms + (seconds as i64) * 1000;
        let conn = self.pool.acquire().await?;
        conn.execute(move |c| {
            c.execute(
                "INSERT INTO rate_windows (method, window_start, call_count, flood_wait_until)
                 VALUES (?1, ?2, 0, ?3)
                 ON CONFLICT(method, window_start) DO UPDATE SET flood_wait_until = ?3",
                rusqlite::params![method, window_start, flood_wait_until],
            )?;
            Ok(())
        })
    }

    /// `getFloodWait`: latest unexpired entry, or `None`.
    pub async fn get_flood_wait(&self, method: &str, now_ms: i64) -> Result<Option<i64>> {
        let method = method.to_string();
        let conn = self.pool.acquire().await?;
        conn.execute(move |c| {
            c.query_row(
                "SELECT flood_wait_until FROM rate_windows
                 WHERE method = ?1 AND flood_wait_until IS NOT NULL AND flood_wait_until > ?2
                 ORDER BY flood_wait_until DESC LIMIT 1",
                rusqlite::params![method, now_ms],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })
        })
    }

    pub async fn is_blocked(&self, method: &str, now_ms: i64) -> Result<bool> {
        Ok(self.get_flood_wait(method, now_ms).await?.is_some())
    }

    pub async fn get_wait_time(&self, method: &str, now_ms: i64) -> Result<Option<i64>> {
        Ok(self
            .get_flood_wait(method, now_ms)
            .await?
            .map(|until| (until - now_ms).max(0)))
    }

    /// Returns the count of pruned rows.
    pub async fn clear_expired_flood_waits(&self, now_ms: i64) -> Result<usize> {
        let conn = self.pool.acquire().await?;
        conn.execute(move |c| {
            c.execute(
                "UPDATE rate_windows SET flood_wait_until = NULL
                 WHERE flood_wait_until IS NOT NULL AND flood_wait_until <= ?1",
                [now_ms],
            )
        })
    }

    pub async fn prune_old_windows(&self, now_ms: i64, age_ms: i64) -> Result<usize> {
        let cutoff = Self::window_start(now_ms - age_ms);
        let conn = self.pool.acquire().await?;
        conn.execute(move |c| {
            c.execute("DELETE FROM rate_windows WHERE window_start < ?1", [cutoff])
        })
    }

    pub async fn prune_old_activity(&self, now_ms: i64, age_days: i64) -> Result<usize> {
        let cutoff = now_ms - age_days * 24 * 60 * 60 * 1000;
        let conn = self.pool.acquire().await?;
        conn.execute(move |c| {
            c.execute("DELETE FROM api_activity WHERE timestamp < ?1", [cutoff])
        })
    }

    /// Appends to the append-only `api_activity` log, per spec §3.
    pub async fn record_activity(
        &self,
        method: &str,
        success: bool,
        error_code: Option<&str>,
        response_ms: Option<i64>,
        context: Option<&str>,
        now_ms: i64,
    ) -> Result<()> {
        let method = method.to_string();
        let error_code = error_code.map(|s| s.to_string());
        let context = context.map(|s| s.to_string());
        let conn = self.pool.acquire().await?;
        conn.execute(move |c| {
            c.execute(
                "INSERT INTO api_activity (timestamp, method, success, error_code, response_ms, context)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![now_ms, method, success as i64, error_code, response_ms, context],
            )?;
            Ok(())
        })
    }

    pub async fn get_status(&self, now_ms: i64) -> Result<RateLimitStatus> {
        let total = self.get_call_count(None, 1, now_ms).await?;

        let conn = self.pool.acquire().await?;
        let cutoff = Self::window_start(now_ms) - 60;
        let per_method: Vec<MethodBreakdown> = conn
            .execute(move |c| {
                let mut stmt = c.prepare(
                    "SELECT method, SUM(call_count) FROM rate_windows
                     WHERE window_start >= ?1 GROUP BY method",
                )?;
                let rows = stmt.query_map([cutoff], |row| {
                    Ok(MethodBreakdown {
                        method: row.get(0)?,
                        call_count: row.get(1)?,
                    })
                })?;
                rows.collect()
            })?;

        let blocked_methods: Vec<String> = conn
            .execute(move |c| {
                let mut stmt = c.prepare(
                    "SELECT DISTINCT method FROM rate_windows
                     WHERE flood_wait_until IS NOT NULL AND flood_wait_until > ?1",
                )?;
                let rows = stmt.query_map([now_ms], |row| row.get(0))?;
                rows.collect()
            })?;

        Ok(RateLimitStatus {
            total_calls_last_minute: total,
            per_method,
            blocked_methods,
        })
    }

    /// Extracts `N` from a `FLOOD_WAIT_<N>` error message, per spec §4.3.
    pub fn parse_flood_wait_seconds(error_message: &str) -> Option<u32> {
        error_message
            .split("FLOOD_WAIT_")
            .nth(1)
            .and_then(|rest| rest.chars().take_while(|c| c.is_ascii_digit()).collect::<String>().parse().ok())
    }
}

/// Runs an adapter call, timing it against `clock` and appending the outcome to the
/// `api_activity` log: record-before (capture the start time), observe-latency (time
/// the call), on-error classify-and-record (log the engine error code), per spec §4.4.
/// Audit logging failures are swallowed so a write hiccup on `api_activity` never fails
/// the underlying call.
pub async fn record_adapter_call<T>(
    rate_limiter: &RateLimiter,
    clock: &dyn Clock,
    method: &str,
    context: Option<&str>,
    call: impl Future<Output = Result<T>>,
) -> Result<T> {
    let started_ms = clock.now_ms();
    let result = call.await;
    let response_ms = clock.now_ms() - started_ms;

    let (success, error_code) = match &result {
        Ok(_) => (true, None),
        Err(e) => (false, Some(e.code())),
    };
    let _ = rate_limiter
        .record_activity(method, success, error_code, Some(response_ms), context, started_ms)
        .await;

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::schema::init_cache_schema;

    async fn test_limiter() -> RateLimiter {
        let dir = tempfile::tempdir().unwrap();
        let pool = Arc::new(ConnectionPool::open(dir.path().join("cache.db"), 4).unwrap());
        let conn = pool.acquire().await.unwrap();
        conn.execute(init_cache_schema).unwrap();
        drop(conn);
        std::mem::forget(dir);
        RateLimiter::new(pool)
    }

    #[tokio::test]
    async fn records_and_counts_calls() {
        let limiter = test_limiter().await;
        limiter.record_call("messages.getHistory", 60_000).await.unwrap();
        limiter.record_call("messages.getHistory", 60_500).await.unwrap();

        let count = limiter
            .get_call_count(Some("messages.getHistory"), 1, 60_900)
            .await
            .unwrap();
        assert_eq!(count, 2);
    }

    #[tokio::test]
    async fn flood_wait_blocks_until_expiry() {
        let limiter = test_limiter().await;
        limiter.set_flood_wait("messages.sendMessage", 30, 0).await.unwrap();

        assert!(limiter.is_blocked("messages.sendMessage", 1_000).await.unwrap());
        assert!(!limiter.is_blocked("messages.sendMessage", 31_000).await.unwrap());
    }

    #[tokio::test]
    async fn clear_expired_flood_waits_removes_past_entries() {
        let limiter = test_limiter().await;
        limiter.set_flood_wait("messages.sendMessage", 5, 0).await.unwrap();
        let cleared = limiter.clear_expired_flood_waits(10_000).await.unwrap();
        assert_eq!(cleared, 1);
        assert!(!limiter.is_blocked("messages.sendMessage", 10_000).await.unwrap());
    }

    #[test]
    fn parses_flood_wait_seconds_from_message() {
        assert_eq!(
            RateLimiter::parse_flood_wait_seconds("A wait of FLOOD_WAIT_42 is required"),
            Some(42)
        );
        assert_eq!(RateLimiter::parse_flood_wait_seconds("no match here"), None);
    }
}
