use std::sync::Arc;

use tracing::{error, info};

use crate::cache::messages::CachedMessage;
use crate::cache::sync_state::SyncStateStore;
use crate::cache::CacheStore;
use crate::clock::Clock;
use crate::error::{EngineError, Result};
use crate::rate_limiter::{record_adapter_call, RateLimiter};
use crate::telegram::adapter::{pack_chat, HistoryRequest, TelegramAdapter};
use crate::telegram::message_type::{
    classify_message, forward_from_id, has_media, raw_message_json, view_from_grammers,
};
use grammers_session::{PackedChat, PackedType};

use super::scheduler::{JobType, Scheduler, SyncJob};

const HISTORY_PAGE_LIMIT: i32 = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed { messages_fetched: i64, has_more: bool },
    RateLimited { wait_seconds: u32 },
    Failed { error_message: String },
}

/// Executes exactly one job against one client, per spec §4.6's eight-step contract.
/// Grounded on the teacher's `RetryHandler::execute_with_retry` control-flow shape
/// (loop over attempts, classify error, decide retry vs. terminal) adapted to the
/// spec's job state machine rather than generic retry — a sync job is retried only by
/// the scheduler re-picking it up, never looped internally here.
pub struct SyncWorker {
    cache: Arc<CacheStore>,
    scheduler: Arc<Scheduler>,
    rate_limiter: Arc<RateLimiter>,
    adapter: Arc<dyn TelegramAdapter>,
    clock: Arc<dyn Clock>,
}

impl SyncWorker {
    pub fn new(
        cache: Arc<CacheStore>,
        scheduler: Arc<Scheduler>,
        rate_limiter: Arc<RateLimiter>,
        adapter: Arc<dyn TelegramAdapter>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            cache,
            scheduler,
            rate_limiter,
            adapter,
            clock,
        }
    }

    /// Runs `job` to completion (or to a rate-limit/failure outcome). Step numbers in
    /// comments match spec §4.6 verbatim.
    pub async fn run_job(&self, job: SyncJob) -> Result<JobOutcome> {
        let now_ms = self.clock.now_ms();

        // Step 2: resolve chat_id to an input peer via the chat cache.
        let chat = match self.resolve_chat(&job.chat_id).await {
            Ok(chat) => chat,
            Err(e) => {
                self.scheduler
                    .mark_failed(job.id, &e.to_string(), now_ms)
                    .await?;
                return Ok(JobOutcome::Failed {
                    error_message: e.to_string(),
                });
            }
        };

        // Step 3: determine pagination window from job_type and chat sync state.
        let sync_state = self.cache.sync_state.get(&job.chat_id).await?;
        let request = self.build_history_request(&job, sync_state.as_ref());

        // Step 4: call messages.getHistory.
        if let Some(method) = Some("messages.getHistory") {
            self.rate_limiter.record_call(method, now_ms).await?;
        }

        let page = match record_adapter_call(
            &self.rate_limiter,
            self.clock.as_ref(),
            "messages.getHistory",
            Some(&job.chat_id),
            self.adapter.get_history(&chat, request),
        )
        .await
        {
            Ok(page) => page,
            Err(EngineError::RateLimited { wait_seconds, .. }) => {
                // The job remains running; the caller re-schedules.
                self.rate_limiter
                    .set_flood_wait("messages.getHistory", wait_seconds, now_ms)
                    .await?;
                return Ok(JobOutcome::RateLimited { wait_seconds });
            }
            Err(e) => {
                self.scheduler
                    .mark_failed(job.id, &e.to_string(), now_ms)
                    .await?;
                error!(job_id = job.id, error = %e, "sync job failed fetching history");
                return Ok(JobOutcome::Failed {
                    error_message: e.to_string(),
                });
            }
        };

        let page_size = page.messages.len() as i64;
        let is_backward = matches!(
            job.job_type,
            JobType::BackwardHistory | JobType::FullSync
        );

        // Step 5 + 6: parse messages, advance cursors, upsert — one transaction.
        let cached_messages: Vec<CachedMessage> = page
            .messages
            .iter()
            .map(|m| to_cached_message(&job.chat_id, m, now_ms))
            .collect();

        let history_complete = is_backward && page_size < HISTORY_PAGE_LIMIT as i64;

        self.upsert_and_advance(
            &job.chat_id,
            &cached_messages,
            is_backward,
            page.min_id,
            page.max_id,
            page_size,
            history_complete,
            now_ms,
        )
        .await?;

        // Step 7: transition running -> completed.
        self.scheduler
            .mark_completed(job.id, page_size, now_ms)
            .await?;

        // Step 8.
        let has_more = page_size == HISTORY_PAGE_LIMIT as i64;
        info!(job_id = job.id, chat_id = %job.chat_id, page_size, has_more, "sync job completed");
        Ok(JobOutcome::Completed {
            messages_fetched: page_size,
            has_more,
        })
    }

    /// Resolves `chat_id` to a live `Chat` via the chat cache, per spec §4.6 step 2.
    /// `chat_id >= 0` with no cached row falls back to a bare user peer with zero
    /// access hash; negative ids without a cached row fail `PEER_UNRESOLVED`.
    async fn resolve_chat(&self, chat_id: &str) -> Result<grammers_client::types::Chat> {
        let cached = self.cache.chats.get_by_id(chat_id).await?;
        let parsed: i64 = chat_id
            .parse()
            .map_err(|_| EngineError::General(format!("malformed chat id: {chat_id}")))?;

        let packed = match &cached {
            Some(chat) => pack_chat(chat.chat_type, chat_id, chat.access_hash.as_deref())
                .ok_or_else(|| EngineError::General(format!("unpackable chat id: {chat_id}")))?,
            None if parsed >= 0 => PackedChat {
                ty: PackedType::User,
                id: parsed,
                access_hash: None,
            },
            None => {
                return Err(EngineError::General(format!(
                    "PEER_UNRESOLVED: no cached chat for {chat_id}"
                )))
            }
        };

        record_adapter_call(
            &self.rate_limiter,
            self.clock.as_ref(),
            "unpack_chat",
            Some(chat_id),
            self.adapter.unpack_chat(packed),
        )
        .await
    }

    fn build_history_request(
        &self,
        job: &SyncJob,
        sync_state: Option<&crate::cache::sync_state::ChatSyncState>,
    ) -> HistoryRequest {
        match job.job_type {
            JobType::ForwardCatchup => HistoryRequest {
                offset_id: 0,
                add_offset: 0,
                limit: HISTORY_PAGE_LIMIT,
                max_id: 0,
                min_id: sync_state.and_then(|s| s.forward_cursor).unwrap_or(0) as i32,
            },
            JobType::BackwardHistory | JobType::FullSync => HistoryRequest {
                offset_id: sync_state.and_then(|s| s.backward_cursor).unwrap_or(0) as i32,
                add_offset: 0,
                limit: HISTORY_PAGE_LIMIT,
                max_id: 0,
                min_id: 0,
            },
            JobType::InitialLoad => HistoryRequest {
                offset_id: 0,
                add_offset: 0,
                limit: HISTORY_PAGE_LIMIT,
                max_id: 0,
                min_id: 0,
            },
        }
    }

    /// Upserts the page's messages and advances the chat's sync-state cursor inside one
    /// transaction, so a crash between the two never leaves a cursor pointing past
    /// messages that were never actually persisted (spec §5).
    #[allow(clippy::too_many_arguments)]
    async fn upsert_and_advance(
        &self,
        chat_id: &str,
        messages: &[CachedMessage],
        is_backward: bool,
        min_id: Option<i64>,
        max_id: Option<i64>,
        page_size: i64,
        history_complete: bool,
        now_ms: i64,
    ) -> Result<()> {
        let chat_id = chat_id.to_string();
        let messages = messages.to_vec();
        let conn = self.cache.pool.acquire().await?;
        conn.transaction(move |tx| {
            for message in &messages {
                crate::cache::messages::MessagesStore::upsert_one(tx, message)?;
            }
            SyncStateStore::apply_page_progress(
                tx,
                &chat_id,
                is_backward,
                min_id,
                max_id,
                page_size,
                history_complete,
                now_ms,
            )
        })
    }
}

fn to_cached_message(
    chat_id: &str,
    message: &grammers_client::types::Message,
    now_ms: i64,
) -> CachedMessage {
    let view = view_from_grammers(message);
    let message_type = classify_message(&view);
    CachedMessage {
        chat_id: chat_id.to_string(),
        message_id: message.id() as i64,
        from_id: message.sender().map(|s| s.id().to_string()),
        reply_to_id: message.reply_to_message_id().map(|id| id as i64),
        forward_from_id: forward_from_id(message),
        text: Some(message.text().to_string()),
        message_type,
        has_media: has_media(message_type),
        is_outgoing: message.outgoing(),
        is_edited: false,
        is_pinned: false,
        is_deleted: false,
        edit_date: message.edit_date().map(|d| d.timestamp()),
        date: message.date().timestamp(),
        fetched_at: now_ms,
        raw_json: raw_message_json(message),
    }
}
