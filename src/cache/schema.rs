use rusqlite::Connection;

use crate::error::Result;

/// Current schema version, tracked via `PRAGMA user_version` the way the teacher's
/// `initialize_database` checks and migrates it.
pub const SCHEMA_VERSION: i64 = 1;

/// Table names exposed to the read-only SQL introspection surface (spec §9), kept as a
/// flat registry so `sql::guard` can validate `FROM`/`JOIN` targets without re-parsing
/// the schema.
pub const TABLE_NAMES: &[&str] = &[
    "users_cache",
    "chats_cache",
    "messages_cache",
    "message_search",
    "chat_sync_state",
    "entity_sync_state",
    "sync_jobs",
    "rate_windows",
    "api_activity",
    "daemon_status",
];

/// Initializes `cache.db`'s full schema: cache tables, sync-state tables, job queue,
/// rate limiter tables, activity log, daemon status, and the FTS5 search index with its
/// maintenance triggers. Idempotent via `CREATE TABLE IF NOT EXISTS`.
pub fn init_cache_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS users_cache (
            user_id       TEXT PRIMARY KEY,
            username      TEXT,
            first_name    TEXT,
            last_name     TEXT,
            phone         TEXT,
            access_hash   TEXT,
            is_contact    INTEGER NOT NULL DEFAULT 0,
            is_bot        INTEGER NOT NULL DEFAULT 0,
            is_premium    INTEGER NOT NULL DEFAULT 0,
            fetched_at    INTEGER,
            raw_json      TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_users_username ON users_cache (username COLLATE NOCASE);
        CREATE INDEX IF NOT EXISTS idx_users_phone ON users_cache (phone);
        CREATE INDEX IF NOT EXISTS idx_users_fetched_at ON users_cache (fetched_at);

        CREATE TABLE IF NOT EXISTS chats_cache (
            chat_id         TEXT PRIMARY KEY,
            type            TEXT NOT NULL,
            title           TEXT,
            username        TEXT,
            member_count    INTEGER,
            access_hash     TEXT,
            is_creator      INTEGER NOT NULL DEFAULT 0,
            is_admin        INTEGER NOT NULL DEFAULT 0,
            last_message_id INTEGER,
            last_message_at INTEGER,
            fetched_at      INTEGER
        );
        CREATE INDEX IF NOT EXISTS idx_chats_username ON chats_cache (username COLLATE NOCASE);
        CREATE INDEX IF NOT EXISTS idx_chats_title ON chats_cache (title COLLATE NOCASE);
        CREATE INDEX IF NOT EXISTS idx_chats_last_message_at ON chats_cache (last_message_at);
        CREATE INDEX IF NOT EXISTS idx_chats_fetched_at ON chats_cache (fetched_at);

        CREATE TABLE IF NOT EXISTS messages_cache (
            chat_id         TEXT NOT NULL,
            message_id      INTEGER NOT NULL,
            from_id         TEXT,
            reply_to_id     INTEGER,
            forward_from_id TEXT,
            text            TEXT,
            message_type    TEXT NOT NULL,
            has_media       INTEGER NOT NULL DEFAULT 0,
            is_outgoing     INTEGER NOT NULL DEFAULT 0,
            is_edited       INTEGER NOT NULL DEFAULT 0,
            is_pinned       INTEGER NOT NULL DEFAULT 0,
            is_deleted      INTEGER NOT NULL DEFAULT 0,
            edit_date       INTEGER,
            date            INTEGER NOT NULL,
            fetched_at      INTEGER NOT NULL,
            raw_json        TEXT NOT NULL,
            PRIMARY KEY (chat_id, message_id)
        );
        CREATE INDEX IF NOT EXISTS idx_messages_date ON messages_cache (chat_id, date DESC);
        CREATE INDEX IF NOT EXISTS idx_messages_from_id ON messages_cache (from_id);
        CREATE INDEX IF NOT EXISTS idx_messages_deleted ON messages_cache (is_deleted);

        CREATE VIRTUAL TABLE IF NOT EXISTS message_search USING fts5(
            text,
            chat_id UNINDEXED,
            message_id UNINDEXED,
            content='messages_cache',
            content_rowid='rowid'
        );

        CREATE TRIGGER IF NOT EXISTS trigger_messages_ai AFTER INSERT ON messages_cache BEGIN
            INSERT INTO message_search (rowid, text, chat_id, message_id)
            VALUES (new.rowid, new.text, new.chat_id, new.message_id);
        END;

        CREATE TRIGGER IF NOT EXISTS trigger_messages_au AFTER UPDATE OF text ON messages_cache BEGIN
            INSERT INTO message_search (message_search, rowid, text, chat_id, message_id)
            VALUES ('delete', old.rowid, old.text, old.chat_id, old.message_id);
            INSERT INTO message_search (rowid, text, chat_id, message_id)
            VALUES (new.rowid, new.text, new.chat_id, new.message_id);
        END;

        CREATE TRIGGER IF NOT EXISTS trigger_messages_ad AFTER DELETE ON messages_cache BEGIN
            INSERT INTO message_search (message_search, rowid, text, chat_id, message_id)
            VALUES ('delete', old.rowid, old.text, old.chat_id, old.message_id);
        END;

        CREATE TABLE IF NOT EXISTS chat_sync_state (
            chat_id           TEXT PRIMARY KEY,
            chat_type         TEXT,
            member_count      INTEGER,
            forward_cursor    INTEGER,
            backward_cursor   INTEGER,
            sync_priority     INTEGER NOT NULL DEFAULT 2,
            sync_enabled      INTEGER NOT NULL DEFAULT 1,
            history_complete  INTEGER NOT NULL DEFAULT 0,
            total_messages    INTEGER NOT NULL DEFAULT 0,
            synced_messages   INTEGER NOT NULL DEFAULT 0,
            last_forward_sync INTEGER,
            last_backward_sync INTEGER
        );

        CREATE TABLE IF NOT EXISTS entity_sync_state (
            entity TEXT PRIMARY KEY,
            cursor TEXT,
            updated_at INTEGER
        );

        CREATE TABLE IF NOT EXISTS sync_jobs (
            id               INTEGER PRIMARY KEY AUTOINCREMENT,
            chat_id          TEXT NOT NULL,
            job_type         TEXT NOT NULL,
            priority         INTEGER NOT NULL DEFAULT 2,
            status           TEXT NOT NULL DEFAULT 'pending',
            cursor_start     INTEGER,
            cursor_end       INTEGER,
            messages_fetched INTEGER NOT NULL DEFAULT 0,
            error_message    TEXT,
            created_at       INTEGER NOT NULL,
            started_at       INTEGER,
            completed_at     INTEGER
        );
        CREATE INDEX IF NOT EXISTS idx_sync_jobs_dispatch
            ON sync_jobs (status, priority ASC, created_at ASC);
        CREATE INDEX IF NOT EXISTS idx_sync_jobs_chat_type
            ON sync_jobs (chat_id, job_type, status);

        CREATE TABLE IF NOT EXISTS rate_windows (
            method           TEXT NOT NULL,
            window_start     INTEGER NOT NULL,
            call_count       INTEGER NOT NULL DEFAULT 0,
            flood_wait_until INTEGER,
            PRIMARY KEY (method, window_start)
        );

        CREATE TABLE IF NOT EXISTS api_activity (
            id           INTEGER PRIMARY KEY AUTOINCREMENT,
            timestamp    INTEGER NOT NULL,
            method       TEXT NOT NULL,
            success      INTEGER NOT NULL,
            error_code   TEXT,
            response_ms  INTEGER,
            context      TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_api_activity_timestamp ON api_activity (timestamp);

        CREATE TABLE IF NOT EXISTS daemon_status (
            key   TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );
        "#,
    )?;

    let user_version: i64 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    if user_version < SCHEMA_VERSION {
        conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
    }

    Ok(())
}

/// Initializes `data.db`'s schema: the `accounts` table only, per spec §6.1.
pub fn init_accounts_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS accounts (
            id         INTEGER PRIMARY KEY AUTOINCREMENT,
            phone      TEXT NOT NULL,
            user_id    TEXT,
            username   TEXT,
            label      TEXT,
            is_active  INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL
        );
        CREATE UNIQUE INDEX IF NOT EXISTS idx_accounts_user_id
            ON accounts (user_id) WHERE user_id IS NOT NULL;
        "#,
    )?;
    Ok(())
}
