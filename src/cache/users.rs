use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::pool::ConnectionPool;
use super::{normalize_phone, normalize_username};
use crate::error::Result;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CachedUser {
    pub user_id: String,
    pub username: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub phone: Option<String>,
    pub access_hash: Option<String>,
    pub is_contact: bool,
    pub is_bot: bool,
    pub is_premium: bool,
    pub fetched_at: Option<i64>,
    pub raw_json: String,
}

fn row_to_user(row: &rusqlite::Row) -> rusqlite::Result<CachedUser> {
    Ok(CachedUser {
        user_id: row.get("user_id")?,
        username: row.get("username")?,
        first_name: row.get("first_name")?,
        last_name: row.get("last_name")?,
        phone: row.get("phone")?,
        access_hash: row.get("access_hash")?,
        is_contact: row.get::<_, i64>("is_contact")? != 0,
        is_bot: row.get::<_, i64>("is_bot")? != 0,
        is_premium: row.get::<_, i64>("is_premium")? != 0,
        fetched_at: row.get("fetched_at")?,
        raw_json: row.get("raw_json")?,
    })
}

/// Users cache service, per spec §4.2.
pub struct UsersStore {
    pool: Arc<ConnectionPool>,
}

impl UsersStore {
    pub fn new(pool: Arc<ConnectionPool>) -> Self {
        Self { pool }
    }

    pub async fn upsert(&self, user: &CachedUser) -> Result<()> {
        let user = user.clone();
        let conn = self.pool.acquire().await?;
        conn.execute(move |c| {
            c.execute(
                "INSERT INTO users_cache
                    (user_id, username, first_name, last_name, phone, access_hash,
                     is_contact, is_bot, is_premium, fetched_at, raw_json)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                 ON CONFLICT(user_id) DO UPDATE SET
                    username = excluded.username,
                    first_name = excluded.first_name,
                    last_name = excluded.last_name,
                    phone = excluded.phone,
                    access_hash = excluded.access_hash,
                    is_contact = excluded.is_contact,
                    is_bot = excluded.is_bot,
                    is_premium = excluded.is_premium,
                    fetched_at = excluded.fetched_at,
                    raw_json = excluded.raw_json
                 WHERE excluded.fetched_at IS NULL
                    OR users_cache.fetched_at IS NULL
                    OR excluded.fetched_at >= users_cache.fetched_at",
                rusqlite::params![
                    user.user_id,
                    user.username,
                    user.first_name,
                    user.last_name,
                    user.phone,
                    user.access_hash,
                    user.is_contact as i64,
                    user.is_bot as i64,
                    user.is_premium as i64,
                    user.fetched_at,
                    user.raw_json,
                ],
            )?;
            Ok(())
        })
    }

    pub async fn upsert_many(&self, users: &[CachedUser]) -> Result<()> {
        let users = users.to_vec();
        let conn = self.pool.acquire().await?;
        conn.transaction(move |tx| {
            for user in &users {
                tx.execute(
                    "INSERT INTO users_cache
                        (user_id, username, first_name, last_name, phone, access_hash,
                         is_contact, is_bot, is_premium, fetched_at, raw_json)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                     ON CONFLICT(user_id) DO UPDATE SET
                        username = excluded.username,
                        first_name = excluded.first_name,
                        last_name = excluded.last_name,
                        phone = excluded.phone,
                        access_hash = excluded.access_hash,
                        is_contact = excluded.is_contact,
                        is_bot = excluded.is_bot,
                        is_premium = excluded.is_premium,
                        fetched_at = excluded.fetched_at,
                        raw_json = excluded.raw_json
                     WHERE excluded.fetched_at IS NULL
                        OR users_cache.fetched_at IS NULL
                        OR excluded.fetched_at >= users_cache.fetched_at",
                    rusqlite::params![
                        user.user_id,
                        user.username,
                        user.first_name,
                        user.last_name,
                        user.phone,
                        user.access_hash,
                        user.is_contact as i64,
                        user.is_bot as i64,
                        user.is_premium as i64,
                        user.fetched_at,
                        user.raw_json,
                    ],
                )?;
            }
            Ok(())
        })
    }

    pub async fn get_by_id(&self, user_id: &str) -> Result<Option<CachedUser>> {
        let user_id = user_id.to_string();
        let conn = self.pool.acquire().await?;
        conn.execute(move |c| {
            c.query_row(
                "SELECT * FROM users_cache WHERE user_id = ?1",
                [&user_id],
                row_to_user,
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })
        })
    }

    pub async fn get_by_username(&self, username: &str) -> Result<Option<CachedUser>> {
        let username = normalize_username(username);
        let conn = self.pool.acquire().await?;
        conn.execute(move |c| {
            c.query_row(
                "SELECT * FROM users_cache WHERE username = ?1 COLLATE NOCASE",
                [&username],
                row_to_user,
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })
        })
    }

    pub async fn get_by_phone(&self, phone: &str) -> Result<Option<CachedUser>> {
        let phone = normalize_phone(phone);
        let conn = self.pool.acquire().await?;
        conn.execute(move |c| {
            c.query_row(
                "SELECT * FROM users_cache WHERE phone = ?1",
                [&phone],
                row_to_user,
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })
        })
    }

    pub async fn get_stale(&self, now_ms: i64, ttl_ms: i64) -> Result<Vec<CachedUser>> {
        let conn = self.pool.acquire().await?;
        conn.execute(move |c| {
            let mut stmt = c.prepare(
                "SELECT * FROM users_cache WHERE fetched_at IS NULL OR (?1 - fetched_at) > ?2",
            )?;
            let rows = stmt.query_map(rusqlite::params![now_ms, ttl_ms], row_to_user)?;
            rows.collect()
        })
    }

    pub async fn delete(&self, user_id: &str) -> Result<()> {
        let user_id = user_id.to_string();
        let conn = self.pool.acquire().await?;
        conn.execute(move |c| {
            c.execute("DELETE FROM users_cache WHERE user_id = ?1", [&user_id])?;
            Ok(())
        })
    }

    pub async fn prune(&self, now_ms: i64, age_ms: i64) -> Result<usize> {
        let conn = self.pool.acquire().await?;
        conn.execute(move |c| {
            c.execute(
                "DELETE FROM users_cache WHERE fetched_at IS NOT NULL AND (?1 - fetched_at) > ?2",
                rusqlite::params![now_ms, age_ms],
            )
        })
    }

    pub async fn count(&self) -> Result<i64> {
        let conn = self.pool.acquire().await?;
        conn.execute(|c| c.query_row("SELECT COUNT(*) FROM users_cache", [], |row| row.get(0)))
    }
}
