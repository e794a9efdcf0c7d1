use regex::Regex;

use crate::cache::schema::TABLE_NAMES;
use crate::error::{EngineError, Result};

/// Statements beginning with one of these (case-insensitive, first token) are
/// candidates for the read-only `sql` surface, per spec §9.
const ALLOWED_LEADING_KEYWORDS: &[&str] = &["SELECT", "WITH", "PRAGMA"];

/// Any of these appearing as a whole word anywhere in the statement disqualifies it,
/// even inside a `WITH`/`SELECT` (e.g. a CTE wrapping an `INSERT ... RETURNING`).
const DENIED_KEYWORDS: &[&str] = &[
    "INSERT", "UPDATE", "DELETE", "REPLACE", "DROP", "ALTER", "CREATE", "TRUNCATE",
    "ATTACH", "DETACH", "VACUUM", "REINDEX",
];

/// Rejects any query whose normalized text does not start with
/// `SELECT | WITH | PRAGMA`, or that contains a write/DDL keyword as a whole word
/// anywhere in the statement, per spec §9. Pure and unit-tested without a database.
pub fn assert_read_only(query: &str) -> Result<()> {
    let normalized = query.trim();
    if normalized.is_empty() {
        return Err(EngineError::SqlSyntaxError("empty query".to_string()));
    }

    let first_token = normalized
        .split_whitespace()
        .next()
        .unwrap_or("")
        .to_uppercase();
    if !ALLOWED_LEADING_KEYWORDS.contains(&first_token.as_str()) {
        return Err(EngineError::SqlWriteNotAllowed(format!(
            "query must start with SELECT, WITH, or PRAGMA, found {first_token}"
        )));
    }

    for keyword in DENIED_KEYWORDS {
        let pattern =
            Regex::new(&format!(r"(?i)\b{keyword}\b")).expect("static keyword regex is valid");
        if pattern.is_match(normalized) {
            return Err(EngineError::SqlWriteNotAllowed(format!(
                "query contains disallowed keyword: {keyword}"
            )));
        }
    }

    Ok(())
}

/// Validates that every `FROM`/`JOIN` target named in `query` is a table this crate
/// actually exposes, so a typo surfaces as `SQL_TABLE_NOT_FOUND` rather than a raw
/// sqlite error. Best-effort: scans for `FROM <name>` / `JOIN <name>` tokens rather
/// than parsing full SQL grammar.
pub fn assert_known_tables(query: &str) -> Result<()> {
    let table_ref = Regex::new(r"(?i)\b(?:FROM|JOIN)\s+([A-Za-z_][A-Za-z0-9_]*)").unwrap();

    for capture in table_ref.captures_iter(query) {
        let name = &capture[1];
        if !TABLE_NAMES.contains(&name) {
            return Err(EngineError::SqlTableNotFound(name.to_string()));
        }
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct ColumnDescriptor {
    pub name: &'static str,
    pub description: &'static str,
    pub semantic_type: &'static str,
    pub enum_values: &'static [&'static str],
}

#[derive(Debug, Clone)]
pub struct TableDescriptor {
    pub name: &'static str,
    pub description: &'static str,
    pub primary_key: &'static [&'static str],
    pub columns: &'static [ColumnDescriptor],
    pub indexes: &'static [&'static str],
    pub ttl: Option<&'static str>,
}

macro_rules! col {
    ($name:expr, $desc:expr, $ty:expr) => {
        ColumnDescriptor {
            name: $name,
            description: $desc,
            semantic_type: $ty,
            enum_values: &[],
        }
    };
    ($name:expr, $desc:expr, $ty:expr, $enum_values:expr) => {
        ColumnDescriptor {
            name: $name,
            description: $desc,
            semantic_type: $ty,
            enum_values: $enum_values,
        }
    };
}

/// Schema introspection registry for the external `sql` command, per spec §9: table
/// name, description, primary key, per-column description/semantic type/enum values,
/// index descriptions, and TTL.
pub static SCHEMA_REGISTRY: &[TableDescriptor] = &[
    TableDescriptor {
        name: "users_cache",
        description: "Cached Telegram users, refreshed on any newer sighting.",
        primary_key: &["user_id"],
        columns: &[
            col!("user_id", "Telegram user id", "bigint_as_text"),
            col!("username", "Case-insensitive unique handle", "text"),
            col!("first_name", "Given name", "text"),
            col!("last_name", "Family name", "text"),
            col!("phone", "Digits-only normalized phone", "text"),
            col!("access_hash", "MTProto peer access hash", "bigint_as_text"),
            col!("is_contact", "In the account's contact list", "bool"),
            col!("is_bot", "Bot account flag", "bool"),
            col!("is_premium", "Telegram Premium flag", "bool"),
            col!("fetched_at", "Last refresh time, epoch ms", "timestamp_ms"),
            col!("raw_json", "Opaque raw object snapshot", "json"),
        ],
        indexes: &["idx_users_username", "idx_users_phone", "idx_users_fetched_at"],
        ttl: Some("7d"),
    },
    TableDescriptor {
        name: "chats_cache",
        description: "Cached chats/groups/channels, refreshed on any newer sighting.",
        primary_key: &["chat_id"],
        columns: &[
            col!("chat_id", "Telegram chat id", "bigint_as_text"),
            col!(
                "type",
                "Chat kind",
                "enum",
                &["private", "group", "supergroup", "channel"]
            ),
            col!("title", "Display title", "text"),
            col!("username", "Case-insensitive unique handle", "text"),
            col!("member_count", "Member count snapshot", "integer"),
            col!("access_hash", "MTProto peer access hash", "bigint_as_text"),
            col!("is_creator", "Account is the chat creator", "bool"),
            col!("is_admin", "Account is an admin", "bool"),
            col!("last_message_id", "Most recent message id seen", "integer"),
            col!("last_message_at", "Most recent message time, epoch ms", "timestamp_ms"),
            col!("fetched_at", "Last refresh time, epoch ms", "timestamp_ms"),
        ],
        indexes: &[
            "idx_chats_username",
            "idx_chats_title",
            "idx_chats_last_message_at",
            "idx_chats_fetched_at",
        ],
        ttl: Some("7d"),
    },
    TableDescriptor {
        name: "messages_cache",
        description: "Eternal message cache; deletions are soft (is_deleted=1), never pruned.",
        primary_key: &["chat_id", "message_id"],
        columns: &[
            col!("chat_id", "Owning chat id", "bigint_as_text"),
            col!("message_id", "Message id, unique within chat_id", "integer"),
            col!("from_id", "Sender user id", "bigint_as_text"),
            col!("reply_to_id", "Message id this replies to", "integer"),
            col!("forward_from_id", "Original sender if forwarded", "bigint_as_text"),
            col!("text", "Message body", "text"),
            col!(
                "message_type",
                "Classified content kind",
                "enum",
                &[
                    "text", "photo", "video", "document", "sticker", "voice", "audio",
                    "video_note", "animation", "poll", "contact", "location", "venue",
                    "game", "invoice", "webpage", "dice", "service", "unknown", "media",
                ]
            ),
            col!("has_media", "Any non-text payload present", "bool"),
            col!("is_outgoing", "Sent by this account", "bool"),
            col!("is_edited", "Has ever been edited (monotonic)", "bool"),
            col!("is_pinned", "Currently pinned", "bool"),
            col!("is_deleted", "Soft-deleted (monotonic, never un-set)", "bool"),
            col!("edit_date", "Most recent edit time, epoch s", "timestamp_s"),
            col!("date", "Send time, epoch s", "timestamp_s"),
            col!("fetched_at", "Last write time, epoch ms", "timestamp_ms"),
            col!("raw_json", "Opaque raw object snapshot", "json"),
        ],
        indexes: &["idx_messages_date", "idx_messages_from_id", "idx_messages_deleted"],
        ttl: None,
    },
    TableDescriptor {
        name: "message_search",
        description: "FTS5 full-text index over messages_cache.text, kept in lockstep by triggers.",
        primary_key: &["rowid"],
        columns: &[
            col!("text", "Indexed message body", "text"),
            col!("chat_id", "Unindexed passthrough column", "bigint_as_text"),
            col!("message_id", "Unindexed passthrough column", "integer"),
        ],
        indexes: &[],
        ttl: None,
    },
    TableDescriptor {
        name: "chat_sync_state",
        description: "Per-chat backfill cursors and counters.",
        primary_key: &["chat_id"],
        columns: &[
            col!("chat_id", "Chat this state tracks", "bigint_as_text"),
            col!("chat_type", "Chat kind snapshot", "text"),
            col!("member_count", "Member count snapshot", "integer"),
            col!("forward_cursor", "Newest message id seen", "integer"),
            col!("backward_cursor", "Oldest message id seen", "integer"),
            col!("sync_priority", "0 (highest) .. 4 (lowest)", "integer"),
            col!("sync_enabled", "Whether this chat is scheduled", "bool"),
            col!("history_complete", "Backward backfill reached the start", "bool"),
            col!("total_messages", "Server-reported total, if known", "integer"),
            col!("synced_messages", "Messages persisted so far", "integer"),
            col!("last_forward_sync", "Last forward_catchup completion, epoch ms", "timestamp_ms"),
            col!("last_backward_sync", "Last backward_history completion, epoch ms", "timestamp_ms"),
        ],
        indexes: &[],
        ttl: None,
    },
    TableDescriptor {
        name: "entity_sync_state",
        description: "Opaque per-entity cursors for contacts/dialogs sync.",
        primary_key: &["entity"],
        columns: &[
            col!("entity", "Entity name, e.g. contacts or dialogs", "text"),
            col!("cursor", "Opaque cursor payload", "text"),
            col!("updated_at", "Last update time, epoch ms", "timestamp_ms"),
        ],
        indexes: &[],
        ttl: None,
    },
    TableDescriptor {
        name: "sync_jobs",
        description: "Priority job queue driving history backfill.",
        primary_key: &["id"],
        columns: &[
            col!("id", "Job id", "integer"),
            col!("chat_id", "Target chat id", "bigint_as_text"),
            col!(
                "job_type",
                "Kind of sync operation",
                "enum",
                &["forward_catchup", "initial_load", "backward_history", "full_sync"]
            ),
            col!("priority", "0 (highest) .. 4 (lowest)", "integer"),
            col!(
                "status",
                "Lifecycle state",
                "enum",
                &["pending", "running", "completed", "failed"]
            ),
            col!("cursor_start", "Pagination start cursor", "integer"),
            col!("cursor_end", "Pagination end cursor", "integer"),
            col!("messages_fetched", "Messages persisted by this job", "integer"),
            col!("error_message", "Failure detail, if failed", "text"),
            col!("created_at", "Enqueue time, epoch ms", "timestamp_ms"),
            col!("started_at", "Dispatch time, epoch ms", "timestamp_ms"),
            col!("completed_at", "Terminal time, epoch ms", "timestamp_ms"),
        ],
        indexes: &["idx_sync_jobs_dispatch", "idx_sync_jobs_chat_type"],
        ttl: Some("24h (completed/failed only)"),
    },
    TableDescriptor {
        name: "rate_windows",
        description: "Per-method 60s call-count buckets plus flood-wait ledger.",
        primary_key: &["method", "window_start"],
        columns: &[
            col!("method", "MTProto method name", "text"),
            col!("window_start", "Bucket start, epoch s, floor to 60", "timestamp_s"),
            col!("call_count", "Calls recorded in this window", "integer"),
            col!("flood_wait_until", "Blocked until this epoch s, if set", "timestamp_s"),
        ],
        indexes: &[],
        ttl: Some("1h"),
    },
    TableDescriptor {
        name: "api_activity",
        description: "Append-only audit log of every wrapped API call.",
        primary_key: &["id"],
        columns: &[
            col!("id", "Row id", "integer"),
            col!("timestamp", "Call time, epoch ms", "timestamp_ms"),
            col!("method", "MTProto method name", "text"),
            col!("success", "Whether the call succeeded", "bool"),
            col!("error_code", "Classified error kind, if failed", "text"),
            col!("response_ms", "Observed latency", "integer"),
            col!("context", "Free-form caller context", "text"),
        ],
        indexes: &["idx_api_activity_timestamp"],
        ttl: Some("7d"),
    },
    TableDescriptor {
        name: "daemon_status",
        description: "Key/value heartbeat surface for `daemon status`.",
        primary_key: &["key"],
        columns: &[
            col!(
                "key",
                "One of state, started_at, connected_accounts, messages_synced, pending_jobs, running_jobs, last_update",
                "text"
            ),
            col!("value", "Stringified value", "text"),
        ],
        indexes: &[],
        ttl: None,
    },
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_select_with_pragma() {
        assert!(assert_read_only("select * from messages_cache").is_ok());
        assert!(assert_read_only("  WITH x AS (SELECT 1) SELECT * FROM x").is_ok());
        assert!(assert_read_only("PRAGMA table_info(messages_cache)").is_ok());
    }

    #[test]
    fn rejects_non_select_leading_keyword() {
        let err = assert_read_only("update messages_cache set text = 'x'").unwrap_err();
        assert_eq!(err.code(), "SQL_WRITE_NOT_ALLOWED");
    }

    #[test]
    fn rejects_embedded_write_keyword_as_whole_word() {
        let err = assert_read_only("SELECT * FROM x; DROP TABLE messages_cache").unwrap_err();
        assert_eq!(err.code(), "SQL_WRITE_NOT_ALLOWED");
    }

    #[test]
    fn does_not_false_positive_on_keyword_substrings() {
        // "created_at" contains "create" only as a substring, not a whole word.
        assert!(assert_read_only("SELECT created_at FROM sync_jobs").is_ok());
    }

    #[test]
    fn rejects_empty_query() {
        assert!(assert_read_only("   ").is_err());
    }

    #[test]
    fn detects_unknown_table_reference() {
        let err = assert_known_tables("SELECT * FROM not_a_real_table").unwrap_err();
        assert_eq!(err.code(), "SQL_TABLE_NOT_FOUND");
    }

    #[test]
    fn accepts_known_table_reference() {
        assert!(assert_known_tables("SELECT m.* FROM messages_cache m JOIN chats_cache c ON c.chat_id = m.chat_id").is_ok());
    }

    #[test]
    fn registry_covers_every_table_name() {
        for name in TABLE_NAMES {
            assert!(SCHEMA_REGISTRY.iter().any(|t| t.name == *name), "missing {name}");
        }
    }
}
