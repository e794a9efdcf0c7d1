pub mod chats;
pub mod messages;
pub mod pool;
pub mod schema;
pub mod sync_state;
pub mod users;

use std::path::Path;
use std::sync::Arc;

use tracing::info;

use crate::error::Result;
use pool::ConnectionPool;

const DEFAULT_POOL_SIZE: usize = 8;

/// Composition root over `cache.db`: the four services of spec §4.2 plus the ambient
/// rate-limiter/activity/status tables, all sharing one `ConnectionPool`. Grounded on
/// the teacher's `MessagePersistenceSystem`, which wires a single pool into several
/// higher-level stores and runs schema init up front.
pub struct CacheStore {
    pub pool: Arc<ConnectionPool>,
    pub users: users::UsersStore,
    pub chats: chats::ChatsStore,
    pub messages: messages::MessagesStore,
    pub sync_state: sync_state::SyncStateStore,
}

impl CacheStore {
    pub async fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let pool = Arc::new(ConnectionPool::open(db_path, DEFAULT_POOL_SIZE)?);

        {
            let conn = pool.acquire().await?;
            conn.execute(schema::init_cache_schema)?;
        }
        info!("cache store schema ready");

        Ok(Self {
            users: users::UsersStore::new(pool.clone()),
            chats: chats::ChatsStore::new(pool.clone()),
            messages: messages::MessagesStore::new(pool.clone()),
            sync_state: sync_state::SyncStateStore::new(pool.clone()),
            pool,
        })
    }

    /// `pruneOldWindows`/`pruneOldActivity`-adjacent housekeeping invoked by the
    /// daemon's 300th-iteration cleanup tick (spec §4.9), beyond what the rate limiter
    /// itself owns: peer TTL pruning and stale-job pruning live here so the daemon has
    /// one call per cleanup tick per subsystem.
    pub async fn prune_stale_peers(&self, now_ms: i64, ttl_ms: i64) -> Result<(usize, usize)> {
        let users_pruned = self.users.prune(now_ms, ttl_ms).await?;
        let chats_pruned = self.chats.prune(now_ms, ttl_ms).await?;
        Ok((users_pruned, chats_pruned))
    }
}

/// Strips `@` and lowercases, per spec §4.2's `getByUsername` tolerance.
pub fn normalize_username(username: &str) -> String {
    username.trim_start_matches('@').to_lowercase()
}

/// Keeps only digits, per spec §3's phone normalization (`[\s+\-()]` stripped).
pub fn normalize_phone(phone: &str) -> String {
    phone.chars().filter(|c| c.is_ascii_digit()).collect()
}

/// `fetched_at == null || now - fetched_at > ttl`, per spec §4.2.
pub fn is_stale(fetched_at: Option<i64>, now_ms: i64, ttl_ms: i64) -> bool {
    match fetched_at {
        None => true,
        Some(fetched_at) => now_ms - fetched_at > ttl_ms,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Cache,
    Api,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_username() {
        assert_eq!(normalize_username("@Alice"), "alice");
        assert_eq!(normalize_username("bob"), "bob");
    }

    #[test]
    fn normalizes_phone() {
        assert_eq!(normalize_phone("+1 (555) 123-4567"), "15551234567");
    }

    #[test]
    fn staleness_predicate() {
        assert!(is_stale(None, 1_000, 500));
        assert!(!is_stale(Some(900), 1_000, 500));
        assert!(is_stale(Some(100), 1_000, 500));
    }

    #[tokio::test]
    async fn opens_and_initializes_schema() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::open(dir.path().join("cache.db")).await.unwrap();
        assert_eq!(store.users.count().await.unwrap(), 0);
        assert_eq!(store.chats.count().await.unwrap(), 0);
        assert_eq!(store.messages.count().await.unwrap(), 0);
    }
}
