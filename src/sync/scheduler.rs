use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::cache::pool::ConnectionPool;
use crate::cache::sync_state::SyncStateStore;
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    ForwardCatchup,
    InitialLoad,
    BackwardHistory,
    FullSync,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::ForwardCatchup => "forward_catchup",
            JobType::InitialLoad => "initial_load",
            JobType::BackwardHistory => "backward_history",
            JobType::FullSync => "full_sync",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "initial_load" => JobType::InitialLoad,
            "backward_history" => JobType::BackwardHistory,
            "full_sync" => JobType::FullSync,
            _ => JobType::ForwardCatchup,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncJob {
    pub id: i64,
    pub chat_id: String,
    pub job_type: JobType,
    pub priority: i64,
    pub status: JobStatus,
    pub cursor_start: Option<i64>,
    pub cursor_end: Option<i64>,
    pub messages_fetched: i64,
    pub error_message: Option<String>,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
}

fn row_to_job(row: &rusqlite::Row) -> rusqlite::Result<SyncJob> {
    let job_type: String = row.get("job_type")?;
    let status: String = row.get("status")?;
    Ok(SyncJob {
        id: row.get("id")?,
        chat_id: row.get("chat_id")?,
        job_type: JobType::from_str(&job_type),
        priority: row.get("priority")?,
        status: match status.as_str() {
            "running" => JobStatus::Running,
            "completed" => JobStatus::Completed,
            "failed" => JobStatus::Failed,
            _ => JobStatus::Pending,
        },
        cursor_start: row.get("cursor_start")?,
        cursor_end: row.get("cursor_end")?,
        messages_fetched: row.get("messages_fetched")?,
        error_message: row.get("error_message")?,
        created_at: row.get("created_at")?,
        started_at: row.get("started_at")?,
        completed_at: row.get("completed_at")?,
    })
}

#[derive(Debug, Clone, Copy)]
pub struct SchedulerStatus {
    pub pending_jobs: i64,
    pub running_jobs: i64,
}

/// Priority queue backed by the `sync_jobs` table, per spec §4.7.
pub struct Scheduler {
    pool: Arc<ConnectionPool>,
}

impl Scheduler {
    pub fn new(pool: Arc<ConnectionPool>) -> Self {
        Self { pool }
    }

    /// Refuses to enqueue if a pending job of the same `(chat_id, job_type)` already
    /// exists, per spec §4.7's duplicate guard.
    pub async fn enqueue(
        &self,
        chat_id: &str,
        job_type: JobType,
        priority: i64,
        cursor_start: Option<i64>,
        cursor_end: Option<i64>,
        now_ms: i64,
    ) -> Result<Option<i64>> {
        let chat_id = chat_id.to_string();
        let conn = self.pool.acquire().await?;
        conn.transaction(move |tx| {
            let exists: i64 = tx.query_row(
                "SELECT COUNT(*) FROM sync_jobs
                 WHERE chat_id = ?1 AND job_type = ?2 AND status = 'pending'",
                rusqlite::params![chat_id, job_type.as_str()],
                |row| row.get(0),
            )?;
            if exists > 0 {
                return Ok(None);
            }

            tx.execute(
                "INSERT INTO sync_jobs
                    (chat_id, job_type, priority, status, cursor_start, cursor_end, created_at)
                 VALUES (?1, ?2, ?3, 'pending', ?4, ?5, ?6)",
                rusqlite::params![chat_id, job_type.as_str(), priority, cursor_start, cursor_end, now_ms],
            )?;
            Ok(Some(tx.last_insert_rowid()))
        })
    }

    /// `queueForwardCatchup`/`queueBackwardHistory`/`queueInitialLoad`: thin
    /// specializations reading the chat's current cursors, per spec §4.7.
    pub async fn queue_forward_catchup(
        &self,
        chat_id: &str,
        sync_state: &SyncStateStore,
        priority: i64,
        now_ms: i64,
    ) -> Result<Option<i64>> {
        let cursor = sync_state
            .get(chat_id)
            .await?
            .and_then(|s| s.forward_cursor);
        self.enqueue(chat_id, JobType::ForwardCatchup, priority, cursor, None, now_ms)
            .await
    }

    pub async fn queue_backward_history(
        &self,
        chat_id: &str,
        sync_state: &SyncStateStore,
        priority: i64,
        now_ms: i64,
    ) -> Result<Option<i64>> {
        let cursor = sync_state
            .get(chat_id)
            .await?
            .and_then(|s| s.backward_cursor);
        self.enqueue(chat_id, JobType::BackwardHistory, priority, cursor, None, now_ms)
            .await
    }

    pub async fn queue_initial_load(
        &self,
        chat_id: &str,
        priority: i64,
        now_ms: i64,
    ) -> Result<Option<i64>> {
        self.enqueue(chat_id, JobType::InitialLoad, priority, None, None, now_ms)
            .await
    }

    /// Returns the single pending job with lowest `(priority, created_at)`, atomically
    /// flipping it to `running` inside the same transaction to avoid a race between
    /// two dispatch loops picking the same job, per spec §4.7 and the concurrency
    /// requirements of §5.
    pub async fn get_next_job(&self, now_ms: i64) -> Result<Option<SyncJob>> {
        let conn = self.pool.acquire().await?;
        conn.transaction(move |tx| {
            let job = tx
                .query_row(
                    "SELECT * FROM sync_jobs WHERE status = 'pending'
                     ORDER BY priority ASC, created_at ASC LIMIT 1",
                    [],
                    row_to_job,
                )
                .map(Some)
                .or_else(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => Ok(None),
                    other => Err(other),
                })?;

            if let Some(job) = &job {
                tx.execute(
                    "UPDATE sync_jobs SET status = 'running', started_at = ?2 WHERE id = ?1",
                    rusqlite::params![job.id, now_ms],
                )?;
            }

            Ok(job)
        })
    }

    /// Runs once per daemon boot, per spec §4.7.
    pub async fn initialize_for_startup(
        &self,
        sync_state: &SyncStateStore,
        backward_backfill_enabled: bool,
        now_ms: i64,
    ) -> Result<()> {
        let chats = sync_state.list_enabled().await?;
        for chat in chats {
            if chat.forward_cursor.is_none() {
                self.queue_initial_load(&chat.chat_id, chat.sync_priority, now_ms)
                    .await?;
            } else {
                self.queue_forward_catchup(&chat.chat_id, sync_state, chat.sync_priority, now_ms)
                    .await?;
            }

            if !chat.history_complete && backward_backfill_enabled {
                self.queue_backward_history(
                    &chat.chat_id,
                    sync_state,
                    chat.sync_priority + 1,
                    now_ms,
                )
                .await?;
            }
        }
        Ok(())
    }

    pub async fn get_status(&self) -> Result<SchedulerStatus> {
        let conn = self.pool.acquire().await?;
        conn.execute(|c| {
            let pending = c.query_row(
                "SELECT COUNT(*) FROM sync_jobs WHERE status = 'pending'",
                [],
                |row| row.get(0),
            )?;
            let running = c.query_row(
                "SELECT COUNT(*) FROM sync_jobs WHERE status = 'running'",
                [],
                |row| row.get(0),
            )?;
            Ok(SchedulerStatus {
                pending_jobs: pending,
                running_jobs: running,
            })
        })
    }

    /// Deletes completed/failed jobs older than `max_age_ms` (default 24h), returns
    /// the count, per spec §4.7.
    pub async fn cleanup(&self, now_ms: i64, max_age_ms: i64) -> Result<usize> {
        let cutoff = now_ms - max_age_ms;
        let conn = self.pool.acquire().await?;
        conn.execute(move |c| {
            c.execute(
                "DELETE FROM sync_jobs
                 WHERE status IN ('completed', 'failed') AND completed_at < ?1",
                [cutoff],
            )
        })
    }

    pub async fn mark_completed(
        &self,
        job_id: i64,
        messages_fetched: i64,
        now_ms: i64,
    ) -> Result<()> {
        let conn = self.pool.acquire().await?;
        conn.execute(move |c| {
            c.execute(
                "UPDATE sync_jobs SET status = 'completed', completed_at = ?2, messages_fetched = ?3
                 WHERE id = ?1",
                rusqlite::params![job_id, now_ms, messages_fetched],
            )?;
            Ok(())
        })
    }

    pub async fn mark_failed(&self, job_id: i64, error_message: &str, now_ms: i64) -> Result<()> {
        let error_message = error_message.to_string();
        let conn = self.pool.acquire().await?;
        conn.execute(move |c| {
            c.execute(
                "UPDATE sync_jobs SET status = 'failed', completed_at = ?2, error_message = ?3
                 WHERE id = ?1",
                rusqlite::params![job_id, now_ms, error_message],
            )?;
            Ok(())
        })
    }

    /// Returns a running job to `pending` without marking it failed, for the
    /// rate-limited resume path of spec §4.6 step 4.
    pub async fn requeue_pending(&self, job_id: i64) -> Result<()> {
        let conn = self.pool.acquire().await?;
        conn.execute(move |c| {
            c.execute(
                "UPDATE sync_jobs SET status = 'pending', started_at = NULL WHERE id = ?1",
                [job_id],
            )?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::schema::init_cache_schema;

    async fn test_scheduler() -> (Arc<ConnectionPool>, Scheduler) {
        let dir = tempfile::tempdir().unwrap();
        let pool = Arc::new(ConnectionPool::open(dir.path().join("cache.db"), 4).unwrap());
        let conn = pool.acquire().await.unwrap();
        conn.execute(init_cache_schema).unwrap();
        drop(conn);
        std::mem::forget(dir);
        let scheduler = Scheduler::new(pool.clone());
        (pool, scheduler)
    }

    #[tokio::test]
    async fn enqueue_refuses_duplicate_pending_job() {
        let (_pool, scheduler) = test_scheduler().await;
        let first = scheduler
            .enqueue("100", JobType::ForwardCatchup, 2, None, None, 1_000)
            .await
            .unwrap();
        assert!(first.is_some());

        let second = scheduler
            .enqueue("100", JobType::ForwardCatchup, 2, None, None, 2_000)
            .await
            .unwrap();
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn get_next_job_claims_lowest_priority_first() {
        let (_pool, scheduler) = test_scheduler().await;
        scheduler
            .enqueue("100", JobType::ForwardCatchup, 3, None, None, 1_000)
            .await
            .unwrap();
        scheduler
            .enqueue("200", JobType::InitialLoad, 0, None, None, 2_000)
            .await
            .unwrap();

        let job = scheduler.get_next_job(5_000).await.unwrap().unwrap();
        assert_eq!(job.chat_id, "200");
        assert_eq!(job.status, JobStatus::Running);

        let next = scheduler.get_next_job(5_000).await.unwrap().unwrap();
        assert_eq!(next.chat_id, "100");
    }

    #[tokio::test]
    async fn cleanup_removes_only_old_terminal_jobs() {
        let (_pool, scheduler) = test_scheduler().await;
        let id = scheduler
            .enqueue("100", JobType::ForwardCatchup, 2, None, None, 1_000)
            .await
            .unwrap()
            .unwrap();
        scheduler.mark_completed(id, 5, 2_000).await.unwrap();

        let removed = scheduler.cleanup(100_000_000, 24 * 60 * 60 * 1000).await.unwrap();
        assert_eq!(removed, 1);
    }
}
