use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::pool::ConnectionPool;
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatType {
    Private,
    Group,
    Supergroup,
    Channel,
}

impl ChatType {
    fn as_str(&self) -> &'static str {
        match self {
            ChatType::Private => "private",
            ChatType::Group => "group",
            ChatType::Supergroup => "supergroup",
            ChatType::Channel => "channel",
        }
    }

    fn from_str(s: &str) -> Option<Self> {
        match s {
            "private" => Some(ChatType::Private),
            "group" => Some(ChatType::Group),
            "supergroup" => Some(ChatType::Supergroup),
            "channel" => Some(ChatType::Channel),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CachedChat {
    pub chat_id: String,
    pub chat_type: ChatType,
    pub title: Option<String>,
    pub username: Option<String>,
    pub member_count: Option<i64>,
    pub access_hash: Option<String>,
    pub is_creator: bool,
    pub is_admin: bool,
    pub last_message_id: Option<i64>,
    pub last_message_at: Option<i64>,
    pub fetched_at: Option<i64>,
}

fn row_to_chat(row: &rusqlite::Row) -> rusqlite::Result<CachedChat> {
    let type_str: String = row.get("type")?;
    Ok(CachedChat {
        chat_id: row.get("chat_id")?,
        chat_type: ChatType::from_str(&type_str).unwrap_or(ChatType::Private),
        title: row.get("title")?,
        username: row.get("username")?,
        member_count: row.get("member_count")?,
        access_hash: row.get("access_hash")?,
        is_creator: row.get::<_, i64>("is_creator")? != 0,
        is_admin: row.get::<_, i64>("is_admin")? != 0,
        last_message_id: row.get("last_message_id")?,
        last_message_at: row.get("last_message_at")?,
        fetched_at: row.get("fetched_at")?,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderBy {
    LastMessageAt,
    Title,
}

#[derive(Debug, Default, Clone)]
pub struct ListFilter {
    pub chat_type: Option<ChatType>,
    pub limit: u32,
    pub offset: u32,
    pub order_by: Option<OrderBy>,
}

/// Chats cache service, per spec §4.2.
pub struct ChatsStore {
    pool: Arc<ConnectionPool>,
}

impl ChatsStore {
    pub fn new(pool: Arc<ConnectionPool>) -> Self {
        Self { pool }
    }

    pub async fn upsert(&self, chat: &CachedChat) -> Result<()> {
        let chat = chat.clone();
        let conn = self.pool.acquire().await?;
        conn.execute(move |c| {
            c.execute(
                "INSERT INTO chats_cache
                    (chat_id, type, title, username, member_count, access_hash,
                     is_creator, is_admin, last_message_id, last_message_at, fetched_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                 ON CONFLICT(chat_id) DO UPDATE SET
                    type = excluded.type,
                    title = excluded.title,
                    username = excluded.username,
                    member_count = excluded.member_count,
                    access_hash = excluded.access_hash,
                    is_creator = excluded.is_creator,
                    is_admin = excluded.is_admin,
                    last_message_id = excluded.last_message_id,
                    last_message_at = excluded.last_message_at,
                    fetched_at = excluded.fetched_at
                 WHERE excluded.fetched_at IS NULL
                    OR chats_cache.fetched_at IS NULL
                    OR excluded.fetched_at >= chats_cache.fetched_at",
                rusqlite::params![
                    chat.chat_id,
                    chat.chat_type.as_str(),
                    chat.title,
                    chat.username,
                    chat.member_count,
                    chat.access_hash,
                    chat.is_creator as i64,
                    chat.is_admin as i64,
                    chat.last_message_id,
                    chat.last_message_at,
                    chat.fetched_at,
                ],
            )?;
            Ok(())
        })
    }

    /// Updates only `last_message_id`/`last_message_at`, used by the realtime handler
    /// on every new message without re-fetching the full chat object.
    pub async fn touch_last_message(&self, chat_id: &str, message_id: i64, at_ms: i64) -> Result<()> {
        let chat_id = chat_id.to_string();
        let conn = self.pool.acquire().await?;
        conn.execute(move |c| {
            c.execute(
                "UPDATE chats_cache SET last_message_id = ?2, last_message_at = ?3
                 WHERE chat_id = ?1",
                rusqlite::params![chat_id, message_id, at_ms],
            )?;
            Ok(())
        })
    }

    pub async fn get_by_id(&self, chat_id: &str) -> Result<Option<CachedChat>> {
        let chat_id = chat_id.to_string();
        let conn = self.pool.acquire().await?;
        conn.execute(move |c| {
            c.query_row(
                "SELECT * FROM chats_cache WHERE chat_id = ?1",
                [&chat_id],
                row_to_chat,
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })
        })
    }

    pub async fn get_by_username(&self, username: &str) -> Result<Option<CachedChat>> {
        let username = super::normalize_username(username);
        let conn = self.pool.acquire().await?;
        conn.execute(move |c| {
            c.query_row(
                "SELECT * FROM chats_cache WHERE username = ?1 COLLATE NOCASE",
                [&username],
                row_to_chat,
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })
        })
    }

    pub async fn get_stale(&self, now_ms: i64, ttl_ms: i64) -> Result<Vec<CachedChat>> {
        let conn = self.pool.acquire().await?;
        conn.execute(move |c| {
            let mut stmt = c.prepare(
                "SELECT * FROM chats_cache WHERE fetched_at IS NULL OR (?1 - fetched_at) > ?2",
            )?;
            let rows = stmt.query_map(rusqlite::params![now_ms, ttl_ms], row_to_chat)?;
            rows.collect()
        })
    }

    pub async fn delete(&self, chat_id: &str) -> Result<()> {
        let chat_id = chat_id.to_string();
        let conn = self.pool.acquire().await?;
        conn.execute(move |c| {
            c.execute("DELETE FROM chats_cache WHERE chat_id = ?1", [&chat_id])?;
            Ok(())
        })
    }

    pub async fn prune(&self, now_ms: i64, age_ms: i64) -> Result<usize> {
        let conn = self.pool.acquire().await?;
        conn.execute(move |c| {
            c.execute(
                "DELETE FROM chats_cache WHERE fetched_at IS NOT NULL AND (?1 - fetched_at) > ?2",
                rusqlite::params![now_ms, age_ms],
            )
        })
    }

    pub async fn count(&self) -> Result<i64> {
        let conn = self.pool.acquire().await?;
        conn.execute(|c| c.query_row("SELECT COUNT(*) FROM chats_cache", [], |row| row.get(0)))
    }

    /// `list`, default order `last_message_at DESC`, per spec §4.2.
    pub async fn list(&self, filter: ListFilter) -> Result<Vec<CachedChat>> {
        let conn = self.pool.acquire().await?;
        conn.execute(move |c| {
            let order_clause = match filter.order_by.unwrap_or(OrderBy::LastMessageAt) {
                OrderBy::LastMessageAt => "last_message_at DESC",
                OrderBy::Title => "title ASC",
            };
            let (where_clause, type_str) = match filter.chat_type {
                Some(t) => ("WHERE type = ?1", Some(t.as_str().to_string())),
                None => ("", None),
            };
            let sql = format!(
                "SELECT * FROM chats_cache {where_clause} ORDER BY {order_clause} LIMIT ?{} OFFSET ?{}",
                if type_str.is_some() { 2 } else { 1 },
                if type_str.is_some() { 3 } else { 2 },
            );
            let mut stmt = c.prepare(&sql)?;
            let rows = if let Some(t) = type_str {
                stmt.query_map(
                    rusqlite::params![t, filter.limit, filter.offset],
                    row_to_chat,
                )?
                .collect::<rusqlite::Result<Vec<_>>>()
            } else {
                stmt.query_map(rusqlite::params![filter.limit, filter.offset], row_to_chat)?
                    .collect::<rusqlite::Result<Vec<_>>>()
            };
            rows
        })
    }

    /// Case-insensitive substring search over `title`/`username`, exact matches ranked
    /// first, per spec §4.2. Default limit 20.
    pub async fn search(&self, q: &str, limit: Option<u32>) -> Result<Vec<CachedChat>> {
        let q = q.to_string();
        let limit = limit.unwrap_or(20);
        let conn = self.pool.acquire().await?;
        conn.execute(move |c| {
            let pattern = format!("%{q}%");
            let mut stmt = c.prepare(
                "SELECT *,
                    CASE
                        WHEN username = ?1 COLLATE NOCASE THEN 0
                        WHEN title = ?1 COLLATE NOCASE THEN 1
                        ELSE 2
                    END AS rank
                 FROM chats_cache
                 WHERE title LIKE ?2 COLLATE NOCASE OR username LIKE ?2 COLLATE NOCASE
                 ORDER BY rank ASC, title ASC
                 LIMIT ?3",
            )?;
            let rows = stmt.query_map(rusqlite::params![q, pattern, limit], row_to_chat)?;
            rows.collect()
        })
    }
}
