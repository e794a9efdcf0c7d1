use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::cache::pool::ConnectionPool;
use crate::error::Result;

/// Daemon status key/value heartbeat, per spec §3. Not an HTTP surface — `daemon
/// status` reads this row directly from the CLI process alongside the PID file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct DaemonStatus {
    pub state: String,
    pub started_at: i64,
    pub connected_accounts: i64,
    pub messages_synced: i64,
    pub pending_jobs: i64,
    pub running_jobs: i64,
    pub last_update: i64,
}

const FIELDS: &[&str] = &[
    "state",
    "started_at",
    "connected_accounts",
    "messages_synced",
    "pending_jobs",
    "running_jobs",
    "last_update",
];

/// Reads/writes `daemon_status`, one row per field, grounded on the teacher's
/// preference for a thin service wrapping `Arc<ConnectionPool>` rather than a
/// standalone HTTP health server (the `warp`-based `HealthServer` is dropped; see
/// DESIGN.md).
pub struct StatusService {
    pool: Arc<ConnectionPool>,
}

impl StatusService {
    pub fn new(pool: Arc<ConnectionPool>) -> Self {
        Self { pool }
    }

    pub async fn write(&self, status: &DaemonStatus) -> Result<()> {
        let rows = vec![
            ("state".to_string(), status.state.clone()),
            ("started_at".to_string(), status.started_at.to_string()),
            (
                "connected_accounts".to_string(),
                status.connected_accounts.to_string(),
            ),
            (
                "messages_synced".to_string(),
                status.messages_synced.to_string(),
            ),
            ("pending_jobs".to_string(), status.pending_jobs.to_string()),
            ("running_jobs".to_string(), status.running_jobs.to_string()),
            ("last_update".to_string(), status.last_update.to_string()),
        ];
        let conn = self.pool.acquire().await?;
        conn.transaction(move |tx| {
            for (key, value) in &rows {
                tx.execute(
                    "INSERT INTO daemon_status (key, value) VALUES (?1, ?2)
                     ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                    rusqlite::params![key, value],
                )?;
            }
            Ok(())
        })
    }

    /// Patches a subset of fields without clobbering the rest, for the main loop's
    /// per-iteration update (spec §4.9 step 5).
    pub async fn update_counters(
        &self,
        connected_accounts: i64,
        messages_synced: i64,
        pending_jobs: i64,
        running_jobs: i64,
        now_ms: i64,
    ) -> Result<()> {
        let rows = vec![
            ("connected_accounts".to_string(), connected_accounts.to_string()),
            ("messages_synced".to_string(), messages_synced.to_string()),
            ("pending_jobs".to_string(), pending_jobs.to_string()),
            ("running_jobs".to_string(), running_jobs.to_string()),
            ("last_update".to_string(), now_ms.to_string()),
        ];
        let conn = self.pool.acquire().await?;
        conn.transaction(move |tx| {
            for (key, value) in &rows {
                tx.execute(
                    "INSERT INTO daemon_status (key, value) VALUES (?1, ?2)
                     ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                    rusqlite::params![key, value],
                )?;
            }
            Ok(())
        })
    }

    pub async fn set_state(&self, state: &str) -> Result<()> {
        let state = state.to_string();
        let conn = self.pool.acquire().await?;
        conn.execute(move |c| {
            c.execute(
                "INSERT INTO daemon_status (key, value) VALUES ('state', ?1)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                rusqlite::params![state],
            )?;
            Ok(())
        })
    }

    pub async fn read(&self) -> Result<Option<DaemonStatus>> {
        let conn = self.pool.acquire().await?;
        let rows: Vec<(String, String)> = conn.execute(|c| {
            let mut stmt = c.prepare("SELECT key, value FROM daemon_status WHERE key IN (?1,?2,?3,?4,?5,?6,?7)")?;
            let params: Vec<&str> = FIELDS.to_vec();
            let result = stmt
                .query_map(rusqlite::params_from_iter(params), |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(result)
        })?;

        if rows.is_empty() {
            return Ok(None);
        }

        let get = |key: &str| rows.iter().find(|(k, _)| k == key).map(|(_, v)| v.clone());
        let parse_i64 = |key: &str| get(key).and_then(|v| v.parse::<i64>().ok()).unwrap_or(0);

        Ok(Some(DaemonStatus {
            state: get("state").unwrap_or_else(|| "unknown".to_string()),
            started_at: parse_i64("started_at"),
            connected_accounts: parse_i64("connected_accounts"),
            messages_synced: parse_i64("messages_synced"),
            pending_jobs: parse_i64("pending_jobs"),
            running_jobs: parse_i64("running_jobs"),
            last_update: parse_i64("last_update"),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_service() -> (StatusService, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let pool = Arc::new(ConnectionPool::open(dir.path().join("cache.db"), 2).unwrap());
        {
            let conn = pool.acquire().await.unwrap();
            conn.execute(crate::cache::schema::init_cache_schema).unwrap();
        }
        (StatusService::new(pool), dir)
    }

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let (svc, _dir) = test_service().await;
        let status = DaemonStatus {
            state: "running".to_string(),
            started_at: 1_000,
            connected_accounts: 2,
            messages_synced: 42,
            pending_jobs: 3,
            running_jobs: 1,
            last_update: 2_000,
        };
        svc.write(&status).await.unwrap();
        let read = svc.read().await.unwrap().unwrap();
        assert_eq!(read, status);
    }

    #[tokio::test]
    async fn read_returns_none_when_unwritten() {
        let (svc, _dir) = test_service().await;
        assert!(svc.read().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn update_counters_preserves_state() {
        let (svc, _dir) = test_service().await;
        svc.set_state("running").await.unwrap();
        svc.update_counters(1, 10, 2, 1, 5_000).await.unwrap();
        let read = svc.read().await.unwrap().unwrap();
        assert_eq!(read.state, "running");
        assert_eq!(read.messages_synced, 10);
        assert_eq!(read.last_update, 5_000);
    }
}
