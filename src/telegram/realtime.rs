use std::sync::Arc;

use grammers_client::types::Update;
use tracing::{debug, warn};

use crate::cache::chats::{CachedChat, ChatType};
use crate::cache::messages::CachedMessage;
use crate::cache::CacheStore;
use crate::clock::Clock;
use crate::telegram::message_type::{
    classify_message, forward_from_id, has_media, raw_message_json, view_from_grammers,
};

/// Translates `Update::{NewMessage, MessageEdited, MessageDeleted}` into cache
/// mutations, per spec §4.5. Grounded on the teacher's `CallbackHandler::handle_callback`
/// swallow-and-log-response style: every handler call here is `.await`ed by the daemon's
/// update loop inside a wrapper that logs and discards errors, so one bad update never
/// kills the loop (spec §4.5/§7).
pub struct RealtimeHandler {
    cache: Arc<CacheStore>,
    clock: Arc<dyn Clock>,
}

impl RealtimeHandler {
    pub fn new(cache: Arc<CacheStore>, clock: Arc<dyn Clock>) -> Self {
        Self { cache, clock }
    }

    /// Top-level dispatch; never returns an error to the caller by design — every
    /// branch logs and swallows its own failures, matching spec §4.5's "errors are
    /// logged and swallowed so that one bad update never kills the updates loop".
    pub async fn handle(&self, update: Update) {
        match update {
            Update::NewMessage(message) => self.on_new_message(&message).await,
            Update::MessageEdited(message) => self.on_edit_message(&message).await,
            Update::MessageDeleted(deletion) => self.on_delete_message(&deletion).await,
            _ => {}
        }
    }

    async fn on_new_message(&self, message: &grammers_client::types::Message) {
        let chat = message.chat();
        let chat_id = chat.id().to_string();
        let message_id = message.id() as i64;
        let now_ms = self.clock.now_ms();

        let view = view_from_grammers(message);
        let message_type = classify_message(&view);

        let cached = CachedMessage {
            chat_id: chat_id.clone(),
            message_id,
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
        };

        if let Err(e) = self.cache.messages.upsert(&cached).await {
            warn!(error = %e, chat_id, message_id, "failed to upsert realtime message");
            return;
        }

        if let Err(e) = self.cache.chats.upsert(&cached_chat_stub(&chat, now_ms)).await {
            debug!(error = %e, chat_id, "failed to upsert chat on first sighting");
        }

        if let Err(e) = self
            .cache
            .chats
            .touch_last_message(&chat_id, message_id, now_ms)
            .await
        {
            debug!(error = %e, chat_id, "failed to touch chat last-message fields");
        }
    }

    async fn on_edit_message(&self, message: &grammers_client::types::Message) {
        let chat_id = message.chat().id().to_string();
        let message_id = message.id() as i64;
        let edit_date = message
            .edit_date()
            .map(|d| d.timestamp())
            .unwrap_or_else(|| self.clock.now_ms() / 1000);

        let result = self
            .cache
            .messages
            .mark_edited(&chat_id, message_id, Some(message.text()), edit_date)
            .await;

        if let Err(e) = result {
            warn!(error = %e, chat_id, message_id, "failed to apply realtime edit");
        }
    }

    async fn on_delete_message(&self, deletion: &grammers_client::types::MessageDeletion) {
        let Some(chat_id) = deletion.chat_id() else {
            debug!("dropping delete update with no chat id");
            return;
        };
        let chat_id = chat_id.to_string();
        let ids: Vec<i64> = deletion.messages().iter().map(|id| *id as i64).collect();

        if let Err(e) = self.cache.messages.mark_deleted(&chat_id, &ids).await {
            warn!(error = %e, chat_id, "failed to apply realtime delete");
        }
    }
}

/// Builds the chat-cache row shape for a freshly-seen chat, shared by the realtime
/// handler's first-sighting path and the sync worker's peer resolution.
pub fn chat_type_from_grammers(chat: &grammers_client::types::Chat) -> ChatType {
    use grammers_client::types::Chat;
    match chat {
        Chat::User(_) => ChatType::Private,
        Chat::Group(_) => ChatType::Group,
        Chat::Channel(c) if c.is_megagroup() => ChatType::Supergroup,
        Chat::Channel(_) => ChatType::Channel,
    }
}

pub fn cached_chat_stub(chat: &grammers_client::types::Chat, now_ms: i64) -> CachedChat {
    CachedChat {
        chat_id: chat.id().to_string(),
        chat_type: chat_type_from_grammers(chat),
        title: Some(chat.name().unwrap_or_default().to_string()),
        username: chat.username().map(|s| s.to_string()),
        member_count: None,
        access_hash: None,
        is_creator: false,
        is_admin: false,
        last_message_id: None,
        last_message_at: None,
        fetched_at: Some(now_ms),
    }
}
