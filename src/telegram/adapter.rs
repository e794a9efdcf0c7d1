use async_trait::async_trait;
use grammers_client::types::media::Document;
use grammers_client::types::{Chat as GrammersChat, Media, Message as GrammersMessage, Update};
use grammers_client::{Client, Config as ClientConfig, InitParams, SignInError};
use grammers_session::{PackedChat, PackedType, Session};
use grammers_tl_types as tl;

use crate::telegram::message_type::classify_document;

use crate::cache::chats::ChatType;
use crate::error::{EngineError, Result};

/// A chat reference compact enough to persist in `chats_cache` and reconstruct a live
/// `grammers_client::types::Chat` from without re-resolving it over the wire, using
/// grammers' own `PackedChat` packing.
pub fn pack_chat(chat_type: ChatType, chat_id: &str, access_hash: Option<&str>) -> Option<PackedChat> {
    let id: i64 = chat_id.parse().ok()?;
    let access_hash = match access_hash {
        Some(h) => Some(h.parse().ok()?),
        None => None,
    };
    let ty = match chat_type {
        ChatType::Private => PackedType::User,
        ChatType::Group => PackedType::Chat,
        ChatType::Supergroup => PackedType::Megagroup,
        ChatType::Channel => PackedType::Broadcast,
    };
    Some(PackedChat {
        ty,
        id,
        access_hash,
    })
}

/// A page returned by `messages.getHistory`, per spec §6.3.
#[derive(Debug, Clone)]
pub struct HistoryPage {
    pub messages: Vec<GrammersMessage>,
    pub min_id: Option<i64>,
    pub max_id: Option<i64>,
}

#[derive(Debug, Clone, Default)]
pub struct HistoryRequest {
    pub offset_id: i32,
    pub add_offset: i32,
    pub limit: i32,
    pub max_id: i32,
    pub min_id: i32,
}

/// Resolved account identity returned by `getMe()`.
#[derive(Debug, Clone)]
pub struct SelfUser {
    pub user_id: i64,
    pub username: Option<String>,
}

/// Narrow façade over the MTProto client, per spec §4.4. Object-safe via
/// `async_trait`, following the teacher's `RateLimitBackend`-style trait-object
/// conventions, so the supervisor and sync worker depend on this trait, not on
/// `grammers_client` directly — keeping tests runnable against a fake.
#[async_trait]
pub trait TelegramAdapter: Send + Sync {
    async fn start(&self, noninteractive: bool) -> Result<()>;
    async fn get_me(&self) -> Result<SelfUser>;
    async fn close(&self) -> Result<()>;

    async fn next_update(&self) -> Result<Option<Update>>;

    /// Reconstructs a live `Chat` handle from a packed reference, per spec §4.6 step 2.
    async fn unpack_chat(&self, packed: PackedChat) -> Result<GrammersChat>;

    async fn get_history(&self, chat: &GrammersChat, req: HistoryRequest) -> Result<HistoryPage>;

    async fn resolve_username(&self, username: &str) -> Result<Option<GrammersChat>>;
    async fn resolve_phone(&self, phone: &str) -> Result<Option<GrammersChat>>;

    /// `users.getUsers`, per spec §4.4/§6.3.
    async fn get_users(&self, ids: &[i64]) -> Result<Vec<GrammersChat>>;

    async fn send_message(
        &self,
        chat: &GrammersChat,
        text: &str,
        reply_to: Option<i32>,
    ) -> Result<()>;
}

/// Real adapter backed by `grammers_client::Client`, constructed the way
/// `create_telegram_client` builds one in the ports/adapters reference example: a
/// session loaded from an opaque per-account file, then `Client::connect`.
pub struct GrammersAdapter {
    client: Client,
}

impl GrammersAdapter {
    pub async fn connect(session_path: &std::path::Path, api_id: i32, api_hash: &str) -> Result<Self> {
        let session = Session::load_file_or_create(session_path)
            .map_err(|e| EngineError::Telegram(format!("failed to load session: {e}")))?;

        let client = Client::connect(ClientConfig {
            session,
            api_id,
            api_hash: api_hash.to_string(),
            params: InitParams::default(),
        })
        .await
        .map_err(|e| EngineError::Network(e.to_string()))?;

        Ok(Self { client })
    }

    pub fn save_session(&self, session_path: &std::path::Path) -> Result<()> {
        self.client
            .session()
            .save_to_file(session_path)
            .map_err(|e| EngineError::Telegram(format!("failed to persist session: {e}")))
    }
}

#[async_trait]
impl TelegramAdapter for GrammersAdapter {
    async fn start(&self, _noninteractive: bool) -> Result<()> {
        if !self.client.is_authorized().await.map_err(to_network_err)? {
            return Err(EngineError::AuthRequired(
                "session is not authorized; run the auth flow first".to_string(),
            ));
        }
        Ok(())
    }

    async fn get_me(&self) -> Result<SelfUser> {
        let me = self.client.get_me().await.map_err(to_network_err)?;
        Ok(SelfUser {
            user_id: me.id(),
            username: me.username().map(|s| s.to_string()),
        })
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }

    async fn next_update(&self) -> Result<Option<Update>> {
        match self.client.next_update().await {
            Ok(update) => Ok(Some(update)),
            Err(e) => Err(to_network_err(e)),
        }
    }

    async fn unpack_chat(&self, packed: PackedChat) -> Result<GrammersChat> {
        self.client
            .unpack_chat(packed)
            .await
            .map_err(to_network_err)
    }

    async fn get_history(&self, chat: &GrammersChat, req: HistoryRequest) -> Result<HistoryPage> {
        use futures::stream::StreamExt;

        let mut iter = self
            .client
            .iter_messages(chat)
            .offset_id(req.offset_id)
            .max_id(req.max_id)
            .min_id(req.min_id)
            .limit(req.limit as usize);

        let mut messages = Vec::new();
        let mut min_id: Option<i64> = None;
        let mut max_id: Option<i64> = None;

        while let Some(item) = iter.next().await {
            let message = item.map_err(classify_history_error)?;
            let id = message.id() as i64;
            min_id = Some(min_id.map_or(id, |m| m.min(id)));
            max_id = Some(max_id.map_or(id, |m| m.max(id)));
            messages.push(message);
        }

        let _ = req.add_offset;
        Ok(HistoryPage {
            messages,
            min_id,
            max_id,
        })
    }

    async fn resolve_username(&self, username: &str) -> Result<Option<GrammersChat>> {
        self.client
            .resolve_username(username)
            .await
            .map_err(classify_resolve_error)
    }

    async fn resolve_phone(&self, phone: &str) -> Result<Option<GrammersChat>> {
        let resolved = self
            .client
            .invoke(&tl::functions::contacts::ResolvePhone {
                phone: phone.to_string(),
            })
            .await
            .map_err(classify_resolve_error)?;

        let tl::enums::contacts::ResolvedPeer::Peer(tl::types::contacts::ResolvedPeer {
            peer,
            users,
            chats,
        }) = resolved;

        let packed = match peer {
            tl::enums::Peer::User(tl::types::PeerUser { user_id }) => {
                let access_hash = users
                    .into_iter()
                    .find_map(|u| match u {
                        tl::enums::User::User(u) if u.id == user_id => u.access_hash,
                        _ => None,
                    })
                    .unwrap_or(0);
                PackedChat {
                    ty: PackedType::User,
                    id: user_id,
                    access_hash: Some(access_hash),
                }
            }
            tl::enums::Peer::Chat(tl::types::PeerChat { chat_id }) => PackedChat {
                ty: PackedType::Chat,
                id: chat_id,
                access_hash: None,
            },
            tl::enums::Peer::Channel(tl::types::PeerChannel { channel_id }) => {
                let access_hash = chats
                    .into_iter()
                    .find_map(|c| match c {
                        tl::enums::Chat::Channel(c) if c.id == channel_id => c.access_hash,
                        _ => None,
                    })
                    .unwrap_or(0);
                PackedChat {
                    ty: PackedType::Broadcast,
                    id: channel_id,
                    access_hash: Some(access_hash),
                }
            }
        };

        self.client
            .unpack_chat(packed)
            .await
            .map(Some)
            .map_err(to_network_err)
    }

    async fn get_users(&self, ids: &[i64]) -> Result<Vec<GrammersChat>> {
        let input: Vec<tl::enums::InputUser> = ids
            .iter()
            .map(|id| {
                let access_hash = self
                    .client
                    .packed_by_id(*id)
                    .and_then(|p| p.access_hash)
                    .unwrap_or(0);
                tl::enums::InputUser::User(tl::types::InputUser {
                    user_id: *id,
                    access_hash,
                })
            })
            .collect();

        let users = self
            .client
            .invoke(&tl::functions::users::GetUsers { id: input })
            .await
            .map_err(|e| classify_rpc_error("users.getUsers", &e.to_string()))?;

        let mut chats = Vec::with_capacity(users.len());
        for user in users {
            let (id, access_hash) = match &user {
                tl::enums::User::User(u) => (u.id, u.access_hash.unwrap_or(0)),
                tl::enums::User::Empty(u) => (u.id, 0),
            };
            let packed = PackedChat {
                ty: PackedType::User,
                id,
                access_hash: Some(access_hash),
            };
            chats.push(
                self.client
                    .unpack_chat(packed)
                    .await
                    .map_err(to_network_err)?,
            );
        }
        Ok(chats)
    }

    async fn send_message(
        &self,
        chat: &GrammersChat,
        text: &str,
        reply_to: Option<i32>,
    ) -> Result<()> {
        let mut message = grammers_client::InputMessage::text(text);
        if let Some(reply) = reply_to {
            message = message.reply_to(Some(reply));
        }
        self.client
            .send_message(chat, message)
            .await
            .map_err(classify_send_error)?;
        Ok(())
    }
}

fn to_network_err(e: impl std::fmt::Display) -> EngineError {
    EngineError::Network(e.to_string())
}

fn classify_history_error(e: impl std::fmt::Display) -> EngineError {
    classify_rpc_error("messages.getHistory", &e.to_string())
}

/// Like `classify_telegram_error`, but recognizes `FLOOD_WAIT_<N>` and returns the
/// typed rate-limit error spec §4.3 requires, since this is the path the sync worker
/// inspects for a flood-wait outcome.
fn classify_rpc_error(method: &str, message: &str) -> EngineError {
    if let Some(seconds) = crate::rate_limiter::RateLimiter::parse_flood_wait_seconds(message) {
        return EngineError::RateLimited {
            method: method.to_string(),
            wait_seconds: seconds,
        };
    }
    classify_telegram_error(message)
}

fn classify_resolve_error(e: impl std::fmt::Display) -> EngineError {
    classify_telegram_error(&e.to_string())
}

fn classify_send_error(e: impl std::fmt::Display) -> EngineError {
    classify_telegram_error(&e.to_string())
}

/// Classifies an RPC error string into the engine's taxonomy, per spec §4.3/§6.3.
/// `FLOOD_WAIT_<N>` is handled by the caller (sync worker / adapter wrapper) before
/// this is reached, since it needs the parsed wait, not just the error kind.
pub fn classify_telegram_error(message: &str) -> EngineError {
    if message.contains("AUTH_KEY_UNREGISTERED") {
        return EngineError::AuthRequired(message.to_string());
    }
    if message.contains("PEER_ID_INVALID")
        || message.contains("USERNAME_NOT_OCCUPIED")
        || message.contains("PHONE_NOT_OCCUPIED")
    {
        return EngineError::Telegram(message.to_string());
    }
    EngineError::Telegram(message.to_string())
}

/// Surfaces `SignInError` from the auth flow distinctly, since it always means
/// `AUTH_REQUIRED`, not a generic Telegram error.
pub fn classify_sign_in_error(e: SignInError) -> EngineError {
    EngineError::AuthRequired(e.to_string())
}

/// `messageMediaPhoto|Document|Video|...` classification helper shared with
/// `message_type::classify_message`; kept here since it operates on grammers' own
/// `Media` enum.
pub fn media_kind_name(media: &Media) -> &'static str {
    match media {
        Media::Photo(_) => "photo",
        Media::Document(doc) => document_kind_name(doc),
        Media::Sticker(_) => "sticker",
        Media::Contact(_) => "contact",
        _ => "media",
    }
}

fn document_kind_name(document: &Document) -> &'static str {
    use crate::telegram::message_type::MediaKind;
    match classify_document(document) {
        MediaKind::Video => "video",
        MediaKind::Audio => "audio",
        MediaKind::Voice => "voice",
        MediaKind::VideoNote => "video_note",
        MediaKind::Animation => "animation",
        _ => "document",
    }
}
