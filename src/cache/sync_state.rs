use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::pool::ConnectionPool;
use crate::error::Result;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatSyncState {
    pub chat_id: String,
    pub chat_type: Option<String>,
    pub member_count: Option<i64>,
    pub forward_cursor: Option<i64>,
    pub backward_cursor: Option<i64>,
    pub sync_priority: i64,
    pub sync_enabled: bool,
    pub history_complete: bool,
    pub total_messages: i64,
    pub synced_messages: i64,
    pub last_forward_sync: Option<i64>,
    pub last_backward_sync: Option<i64>,
}

fn row_to_state(row: &rusqlite::Row) -> rusqlite::Result<ChatSyncState> {
    Ok(ChatSyncState {
        chat_id: row.get("chat_id")?,
        chat_type: row.get("chat_type")?,
        member_count: row.get("member_count")?,
        forward_cursor: row.get("forward_cursor")?,
        backward_cursor: row.get("backward_cursor")?,
        sync_priority: row.get("sync_priority")?,
        sync_enabled: row.get::<_, i64>("sync_enabled")? != 0,
        history_complete: row.get::<_, i64>("history_complete")? != 0,
        total_messages: row.get("total_messages")?,
        synced_messages: row.get("synced_messages")?,
        last_forward_sync: row.get("last_forward_sync")?,
        last_backward_sync: row.get("last_backward_sync")?,
    })
}

/// Per-chat and per-entity sync-state cursors, per spec §3 and §4.2.
pub struct SyncStateStore {
    pool: Arc<ConnectionPool>,
}

impl SyncStateStore {
    pub fn new(pool: Arc<ConnectionPool>) -> Self {
        Self { pool }
    }

    pub async fn get(&self, chat_id: &str) -> Result<Option<ChatSyncState>> {
        let chat_id = chat_id.to_string();
        let conn = self.pool.acquire().await?;
        conn.execute(move |c| {
            c.query_row(
                "SELECT * FROM chat_sync_state WHERE chat_id = ?1",
                [&chat_id],
                row_to_state,
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })
        })
    }

    pub async fn ensure_exists(&self, chat_id: &str, chat_type: &str, priority: i64) -> Result<()> {
        let chat_id = chat_id.to_string();
        let chat_type = chat_type.to_string();
        let conn = self.pool.acquire().await?;
        conn.execute(move |c| {
            c.execute(
                "INSERT INTO chat_sync_state (chat_id, chat_type, sync_priority)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(chat_id) DO NOTHING",
                rusqlite::params![chat_id, chat_type, priority],
            )?;
            Ok(())
        })
    }

    pub async fn list_enabled(&self) -> Result<Vec<ChatSyncState>> {
        let conn = self.pool.acquire().await?;
        conn.execute(|c| {
            let mut stmt =
                c.prepare("SELECT * FROM chat_sync_state WHERE sync_enabled = 1")?;
            let rows = stmt.query_map([], row_to_state)?;
            rows.collect()
        })
    }

    /// Advances cursors and counters for one completed page, inside the caller's
    /// transaction context — used by the sync worker so cursor advances and message
    /// upserts commit atomically, per spec §5.
    pub fn apply_page_progress(
        conn: &rusqlite::Connection,
        chat_id: &str,
        is_backward: bool,
        page_min_id: Option<i64>,
        page_max_id: Option<i64>,
        page_size: i64,
        history_complete: bool,
        now_ms: i64,
    ) -> rusqlite::Result<()> {
        if is_backward {
            conn.execute(
                "UPDATE chat_sync_state SET
                    backward_cursor = CASE
                        WHEN backward_cursor IS NULL THEN ?2
                        WHEN ?2 IS NULL THEN backward_cursor
                        ELSE MIN(backward_cursor, ?2)
                    END,
                    synced_messages = synced_messages + ?3,
                    history_complete = CASE WHEN ?4 THEN 1 ELSE history_complete END,
                    last_backward_sync = ?5
                 WHERE chat_id = ?1",
                rusqlite::params![chat_id, page_min_id, page_size, history_complete as i64, now_ms],
            )?;
        } else {
            conn.execute(
                "UPDATE chat_sync_state SET
                    forward_cursor = CASE
                        WHEN forward_cursor IS NULL THEN ?2
                        WHEN ?2 IS NULL THEN forward_cursor
                        ELSE MAX(forward_cursor, ?2)
                    END,
                    synced_messages = synced_messages + ?3,
                    last_forward_sync = ?4
                 WHERE chat_id = ?1",
                rusqlite::params![chat_id, page_max_id, page_size, now_ms],
            )?;
        }
        Ok(())
    }

    pub async fn set_enabled(&self, chat_id: &str, enabled: bool) -> Result<()> {
        let chat_id = chat_id.to_string();
        let conn = self.pool.acquire().await?;
        conn.execute(move |c| {
            c.execute(
                "UPDATE chat_sync_state SET sync_enabled = ?2 WHERE chat_id = ?1",
                rusqlite::params![chat_id, enabled as i64],
            )?;
            Ok(())
        })
    }

    /// `contacts`/`dialogs` entity-level cursors, opaque string payloads.
    pub async fn get_entity_cursor(&self, entity: &str) -> Result<Option<String>> {
        let entity = entity.to_string();
        let conn = self.pool.acquire().await?;
        conn.execute(move |c| {
            c.query_row(
                "SELECT cursor FROM entity_sync_state WHERE entity = ?1",
                [&entity],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })
        })
    }

    pub async fn set_entity_cursor(&self, entity: &str, cursor: &str, now_ms: i64) -> Result<()> {
        let entity = entity.to_string();
        let cursor = cursor.to_string();
        let conn = self.pool.acquire().await?;
        conn.execute(move |c| {
            c.execute(
                "INSERT INTO entity_sync_state (entity, cursor, updated_at)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(entity) DO UPDATE SET cursor = excluded.cursor, updated_at = excluded.updated_at",
                rusqlite::params![entity, cursor, now_ms],
            )?;
            Ok(())
        })
    }
}
