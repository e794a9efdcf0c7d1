use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::pool::ConnectionPool;
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Text,
    Photo,
    Video,
    Document,
    Sticker,
    Voice,
    Audio,
    VideoNote,
    Animation,
    Poll,
    Contact,
    Location,
    Venue,
    Game,
    Invoice,
    Webpage,
    Dice,
    Service,
    Unknown,
    Media,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Text => "text",
            MessageType::Photo => "photo",
            MessageType::Video => "video",
            MessageType::Document => "document",
            MessageType::Sticker => "sticker",
            MessageType::Voice => "voice",
            MessageType::Audio => "audio",
            MessageType::VideoNote => "video_note",
            MessageType::Animation => "animation",
            MessageType::Poll => "poll",
            MessageType::Contact => "contact",
            MessageType::Location => "location",
            MessageType::Venue => "venue",
            MessageType::Game => "game",
            MessageType::Invoice => "invoice",
            MessageType::Webpage => "webpage",
            MessageType::Dice => "dice",
            MessageType::Service => "service",
            MessageType::Unknown => "unknown",
            MessageType::Media => "media",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "text" => MessageType::Text,
            "photo" => MessageType::Photo,
            "video" => MessageType::Video,
            "document" => MessageType::Document,
            "sticker" => MessageType::Sticker,
            "voice" => MessageType::Voice,
            "audio" => MessageType::Audio,
            "video_note" => MessageType::VideoNote,
            "animation" => MessageType::Animation,
            "poll" => MessageType::Poll,
            "contact" => MessageType::Contact,
            "location" => MessageType::Location,
            "venue" => MessageType::Venue,
            "game" => MessageType::Game,
            "invoice" => MessageType::Invoice,
            "webpage" => MessageType::Webpage,
            "dice" => MessageType::Dice,
            "service" => MessageType::Service,
            "media" => MessageType::Media,
            _ => MessageType::Unknown,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CachedMessage {
    pub chat_id: String,
    pub message_id: i64,
    pub from_id: Option<String>,
    pub reply_to_id: Option<i64>,
    pub forward_from_id: Option<String>,
    pub text: Option<String>,
    pub message_type: MessageType,
    pub has_media: bool,
    pub is_outgoing: bool,
    pub is_edited: bool,
    pub is_pinned: bool,
    pub is_deleted: bool,
    pub edit_date: Option<i64>,
    pub date: i64,
    pub fetched_at: i64,
    pub raw_json: String,
}

fn row_to_message(row: &rusqlite::Row) -> rusqlite::Result<CachedMessage> {
    let type_str: String = row.get("message_type")?;
    Ok(CachedMessage {
        chat_id: row.get("chat_id")?,
        message_id: row.get("message_id")?,
        from_id: row.get("from_id")?,
        reply_to_id: row.get("reply_to_id")?,
        forward_from_id: row.get("forward_from_id")?,
        text: row.get("text")?,
        message_type: MessageType::from_str(&type_str),
        has_media: row.get::<_, i64>("has_media")? != 0,
        is_outgoing: row.get::<_, i64>("is_outgoing")? != 0,
        is_edited: row.get::<_, i64>("is_edited")? != 0,
        is_pinned: row.get::<_, i64>("is_pinned")? != 0,
        is_deleted: row.get::<_, i64>("is_deleted")? != 0,
        edit_date: row.get("edit_date")?,
        date: row.get("date")?,
        fetched_at: row.get("fetched_at")?,
        raw_json: row.get("raw_json")?,
    })
}

#[derive(Debug, Default, Clone)]
pub struct SearchFilter {
    pub chat_id: Option<String>,
    pub chat_username: Option<String>,
    pub from_id: Option<String>,
    pub sender_username: Option<String>,
    pub include_deleted: bool,
    pub limit: u32,
}

/// Messages cache service, per spec §4.2 and §5's monotonic-merge ordering rule:
/// never un-delete, only accept edits whose `edit_date` is `>=` the stored one.
pub struct MessagesStore {
    pool: Arc<ConnectionPool>,
}

impl MessagesStore {
    pub fn new(pool: Arc<ConnectionPool>) -> Self {
        Self { pool }
    }

    pub async fn upsert(&self, message: &CachedMessage) -> Result<()> {
        let message = message.clone();
        let conn = self.pool.acquire().await?;
        conn.execute(move |c| Self::upsert_one(c, &message))
    }

    pub async fn upsert_many(&self, messages: &[CachedMessage]) -> Result<()> {
        let messages = messages.to_vec();
        let conn = self.pool.acquire().await?;
        conn.transaction(move |tx| {
            for message in &messages {
                Self::upsert_one(tx, message)?;
            }
            Ok(())
        })
    }

    /// Exposed at `pub(crate)` so the sync worker can fold message upserts and cursor
    /// advancement into one shared transaction (spec §5).
    pub(crate) fn upsert_one(conn: &rusqlite::Connection, message: &CachedMessage) -> rusqlite::Result<()> {
        conn.execute(
            "INSERT INTO messages_cache
                (chat_id, message_id, from_id, reply_to_id, forward_from_id, text,
                 message_type, has_media, is_outgoing, is_edited, is_pinned, is_deleted,
                 edit_date, date, fetched_at, raw_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
             ON CONFLICT(chat_id, message_id) DO UPDATE SET
                from_id = excluded.from_id,
                reply_to_id = excluded.reply_to_id,
                forward_from_id = excluded.forward_from_id,
                text = excluded.text,
                message_type = excluded.message_type,
                has_media = excluded.has_media,
                is_outgoing = excluded.is_outgoing,
                is_edited = excluded.is_edited OR messages_cache.is_edited,
                is_pinned = excluded.is_pinned,
                is_deleted = excluded.is_deleted OR messages_cache.is_deleted,
                edit_date = CASE
                    WHEN excluded.edit_date IS NULL THEN messages_cache.edit_date
                    WHEN messages_cache.edit_date IS NULL THEN excluded.edit_date
                    WHEN excluded.edit_date >= messages_cache.edit_date THEN excluded.edit_date
                    ELSE messages_cache.edit_date
                END,
                date = excluded.date,
                fetched_at = excluded.fetched_at,
                raw_json = excluded.raw_json",
            rusqlite::params![
                message.chat_id,
                message.message_id,
                message.from_id,
                message.reply_to_id,
                message.forward_from_id,
                message.text,
                message.message_type.as_str(),
                message.has_media as i64,
                message.is_outgoing as i64,
                message.is_edited as i64,
                message.is_pinned as i64,
                message.is_deleted as i64,
                message.edit_date,
                message.date,
                message.fetched_at,
                message.raw_json,
            ],
        )?;
        Ok(())
    }

    /// Soft-delete: `is_deleted` is monotonic and never cleared back to 0.
    pub async fn mark_deleted(&self, chat_id: &str, message_ids: &[i64]) -> Result<usize> {
        let chat_id = chat_id.to_string();
        let message_ids = message_ids.to_vec();
        let conn = self.pool.acquire().await?;
        conn.transaction(move |tx| {
            let mut affected = 0;
            for id in &message_ids {
                affected += tx.execute(
                    "UPDATE messages_cache SET is_deleted = 1
                     WHERE chat_id = ?1 AND message_id = ?2",
                    rusqlite::params![chat_id, id],
                )?;
            }
            Ok(affected)
        })
    }

    /// Applies an edit only if `new_edit_date >= current edit_date` (or there is none
    /// yet), per spec §5's monotonic-merge rule.
    pub async fn mark_edited(
        &self,
        chat_id: &str,
        message_id: i64,
        new_text: Option<&str>,
        edit_date: i64,
    ) -> Result<bool> {
        let chat_id = chat_id.to_string();
        let new_text = new_text.map(|s| s.to_string());
        let conn = self.pool.acquire().await?;
        conn.execute(move |c| {
            let affected = c.execute(
                "UPDATE messages_cache SET text = ?3, edit_date = ?4, is_edited = 1
                 WHERE chat_id = ?1 AND message_id = ?2
                   AND (edit_date IS NULL OR ?4 >= edit_date)",
                rusqlite::params![chat_id, message_id, new_text, edit_date],
            )?;
            Ok(affected > 0)
        })
    }

    /// Full-text search via `message_search MATCH`, joined with chats/users for display
    /// fields, ordered `date DESC`, per spec §4.2.
    pub async fn search(&self, query: &str, filter: SearchFilter) -> Result<Vec<CachedMessage>> {
        let query = query.to_string();
        let conn = self.pool.acquire().await?;
        conn.execute(move |c| {
            let mut clauses = vec!["message_search MATCH ?1".to_string()];
            let mut idx = 2;
            let mut params: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(query.clone())];

            if !filter.include_deleted {
                clauses.push("m.is_deleted = 0".to_string());
            }
            if let Some(chat_id) = &filter.chat_id {
                clauses.push(format!("m.chat_id = ?{idx}"));
                params.push(Box::new(chat_id.clone()));
                idx += 1;
            }
            if let Some(chat_username) = &filter.chat_username {
                clauses.push(format!("ch.username = ?{idx} COLLATE NOCASE"));
                params.push(Box::new(chat_username.clone()));
                idx += 1;
            }
            if let Some(from_id) = &filter.from_id {
                clauses.push(format!("m.from_id = ?{idx}"));
                params.push(Box::new(from_id.clone()));
                idx += 1;
            }
            if let Some(sender_username) = &filter.sender_username {
                clauses.push(format!("u.username = ?{idx} COLLATE NOCASE"));
                params.push(Box::new(sender_username.clone()));
                idx += 1;
            }

            let limit = if filter.limit == 0 { 50 } else { filter.limit };
            params.push(Box::new(limit));
            let limit_idx = idx;

            let sql = format!(
                "SELECT m.* FROM message_search
                 JOIN messages_cache m ON m.rowid = message_search.rowid
                 LEFT JOIN chats_cache ch ON ch.chat_id = m.chat_id
                 LEFT JOIN users_cache u ON u.user_id = m.from_id
                 WHERE {}
                 ORDER BY m.date DESC
                 LIMIT ?{limit_idx}",
                clauses.join(" AND ")
            );

            let mut stmt = c.prepare(&sql)?;
            let param_refs: Vec<&dyn rusqlite::ToSql> =
                params.iter().map(|p| p.as_ref()).collect();
            let rows = stmt.query_map(param_refs.as_slice(), row_to_message)?;
            rows.collect()
        })
    }

    pub async fn get(&self, chat_id: &str, message_id: i64) -> Result<Option<CachedMessage>> {
        let chat_id = chat_id.to_string();
        let conn = self.pool.acquire().await?;
        conn.execute(move |c| {
            c.query_row(
                "SELECT * FROM messages_cache WHERE chat_id = ?1 AND message_id = ?2",
                rusqlite::params![chat_id, message_id],
                row_to_message,
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })
        })
    }

    pub async fn count(&self) -> Result<i64> {
        let conn = self.pool.acquire().await?;
        conn.execute(|c| c.query_row("SELECT COUNT(*) FROM messages_cache", [], |row| row.get(0)))
    }
}
