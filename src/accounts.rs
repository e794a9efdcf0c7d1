use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::cache::pool::ConnectionPool;
use crate::cache::schema::init_accounts_schema;
use crate::error::Result;

/// Identity `(id, phone, user_id, username, label)` plus the active flag, per spec §3.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Account {
    pub id: i64,
    pub phone: String,
    pub user_id: Option<String>,
    pub username: Option<String>,
    pub label: Option<String>,
    pub is_active: bool,
    pub created_at: i64,
}

fn row_to_account(row: &rusqlite::Row) -> rusqlite::Result<Account> {
    Ok(Account {
        id: row.get("id")?,
        phone: row.get("phone")?,
        user_id: row.get("user_id")?,
        username: row.get("username")?,
        label: row.get("label")?,
        is_active: row.get::<_, i64>("is_active")? != 0,
        created_at: row.get("created_at")?,
    })
}

/// `data.db`'s `accounts` table, per spec §6.1.
pub struct AccountStore {
    pool: Arc<ConnectionPool>,
}

impl AccountStore {
    pub async fn open(db_path: impl AsRef<std::path::Path>) -> Result<Self> {
        let pool = Arc::new(ConnectionPool::open(db_path, 2)?);
        {
            let conn = pool.acquire().await?;
            conn.execute(init_accounts_schema)?;
        }
        Ok(Self { pool })
    }

    pub async fn create(&self, phone: &str, label: Option<&str>, now_ms: i64) -> Result<Account> {
        let phone = phone.to_string();
        let label = label.map(|s| s.to_string());
        let conn = self.pool.acquire().await?;
        let id = conn.execute(move |c| {
            c.execute(
                "INSERT INTO accounts (phone, label, created_at) VALUES (?1, ?2, ?3)",
                rusqlite::params![phone, label, now_ms],
            )?;
            Ok(c.last_insert_rowid())
        })?;
        self.get(id).await.map(|a| a.expect("just inserted"))
    }

    pub async fn get(&self, id: i64) -> Result<Option<Account>> {
        let conn = self.pool.acquire().await?;
        conn.execute(move |c| {
            c.query_row("SELECT * FROM accounts WHERE id = ?1", [id], row_to_account)
                .map(Some)
                .or_else(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => Ok(None),
                    other => Err(other),
                })
        })
    }

    pub async fn list(&self) -> Result<Vec<Account>> {
        let conn = self.pool.acquire().await?;
        conn.execute(|c| {
            let mut stmt = c.prepare("SELECT * FROM accounts ORDER BY id ASC")?;
            let rows = stmt.query_map([], row_to_account)?;
            rows.collect()
        })
    }

    pub async fn get_active(&self) -> Result<Option<Account>> {
        let conn = self.pool.acquire().await?;
        conn.execute(|c| {
            c.query_row(
                "SELECT * FROM accounts WHERE is_active = 1 LIMIT 1",
                [],
                row_to_account,
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })
        })
    }

    pub async fn set_active(&self, id: i64) -> Result<()> {
        let conn = self.pool.acquire().await?;
        conn.transaction(move |tx| {
            tx.execute("UPDATE accounts SET is_active = 0", [])?;
            tx.execute("UPDATE accounts SET is_active = 1 WHERE id = ?1", [id])?;
            Ok(())
        })
    }

    pub async fn remove(&self, id: i64) -> Result<()> {
        let conn = self.pool.acquire().await?;
        conn.execute(move |c| {
            c.execute("DELETE FROM accounts WHERE id = ?1", [id])?;
            Ok(())
        })
    }

    /// Records `user_id` once learned on first successful connect, per spec §3.
    pub async fn set_user_id(&self, id: i64, user_id: &str, username: Option<&str>) -> Result<()> {
        let user_id = user_id.to_string();
        let username = username.map(|s| s.to_string());
        let conn = self.pool.acquire().await?;
        conn.execute(move |c| {
            c.execute(
                "UPDATE accounts SET user_id = ?2, username = ?3 WHERE id = ?1",
                rusqlite::params![id, user_id, username],
            )?;
            Ok(())
        })
    }

    /// Merges duplicate accounts sharing a resolved `user_id`: keeps the one with a
    /// real phone over a synthetic `user:<id>` placeholder, else the earlier-created
    /// one, per spec §3.
    pub async fn merge_duplicates(&self, user_id: &str) -> Result<Option<Account>> {
        let accounts = self.list_by_user_id(user_id).await?;
        if accounts.len() < 2 {
            return Ok(accounts.into_iter().next());
        }

        let synthetic_prefix = "user:";
        let survivor = accounts
            .iter()
            .min_by_key(|a| {
                let is_synthetic = a.phone.starts_with(synthetic_prefix);
                (is_synthetic, a.created_at, a.id)
            })
            .cloned()
            .expect("non-empty");

        for account in &accounts {
            if account.id != survivor.id {
                self.remove(account.id).await?;
            }
        }

        Ok(Some(survivor))
    }

    async fn list_by_user_id(&self, user_id: &str) -> Result<Vec<Account>> {
        let user_id = user_id.to_string();
        let conn = self.pool.acquire().await?;
        conn.execute(move |c| {
            let mut stmt = c.prepare("SELECT * FROM accounts WHERE user_id = ?1 ORDER BY created_at ASC")?;
            let rows = stmt.query_map([&user_id], row_to_account)?;
            rows.collect()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_and_activate_account() {
        let dir = tempfile::tempdir().unwrap();
        let store = AccountStore::open(dir.path().join("data.db")).await.unwrap();

        let a1 = store.create("+15551234567", Some("primary"), 1_000).await.unwrap();
        assert!(!a1.is_active);

        store.set_active(a1.id).await.unwrap();
        let active = store.get_active().await.unwrap().unwrap();
        assert_eq!(active.id, a1.id);
    }

    #[tokio::test]
    async fn merge_prefers_real_phone_over_synthetic() {
        let dir = tempfile::tempdir().unwrap();
        let store = AccountStore::open(dir.path().join("data.db")).await.unwrap();

        let synthetic = store.create("user:999", None, 1_000).await.unwrap();
        store.set_user_id(synthetic.id, "999", None).await.unwrap();

        let real = store.create("+15551234567", None, 2_000).await.unwrap();
        store.set_user_id(real.id, "999", None).await.unwrap();

        let survivor = store.merge_duplicates("999").await.unwrap().unwrap();
        assert_eq!(survivor.id, real.id);
        assert!(store.get(synthetic.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn merge_prefers_earlier_when_both_real() {
        let dir = tempfile::tempdir().unwrap();
        let store = AccountStore::open(dir.path().join("data.db")).await.unwrap();

        let earlier = store.create("+15551111111", None, 1_000).await.unwrap();
        store.set_user_id(earlier.id, "42", None).await.unwrap();

        let later = store.create("+15552222222", None, 2_000).await.unwrap();
        store.set_user_id(later.id, "42", None).await.unwrap();

        let survivor = store.merge_duplicates("42").await.unwrap().unwrap();
        assert_eq!(survivor.id, earlier.id);
    }
}
