use grammers_client::types::media::Document;
use grammers_client::types::{Media, Message};
use grammers_tl_types as tl;

use crate::cache::messages::MessageType;

/// A narrow view over a raw message sufficient to classify its type without pulling in
/// the full `grammers_client::types::Message`, so the classification table is
/// unit-testable without a network connection, per spec §4.5.
pub struct RawMessageView {
    pub is_service: bool,
    pub media: Option<MediaKind>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Photo,
    Document,
    Video,
    Audio,
    Sticker,
    Voice,
    Poll,
    Contact,
    Geo,
    GeoLive,
    Venue,
    Game,
    Invoice,
    WebPage,
    Dice,
    VideoNote,
    Animation,
    Other,
}

/// Fixed classification table from spec §4.5: `messageService -> service`; otherwise
/// absent media -> `text`; otherwise map known media kinds; unknown media -> `media`.
pub fn classify_message(view: &RawMessageView) -> MessageType {
    if view.is_service {
        return MessageType::Service;
    }
    match view.media {
        None => MessageType::Text,
        Some(kind) => match kind {
            MediaKind::Photo => MessageType::Photo,
            MediaKind::Document => MessageType::Document,
            MediaKind::Video => MessageType::Video,
            MediaKind::Audio => MessageType::Audio,
            MediaKind::Sticker => MessageType::Sticker,
            MediaKind::Voice => MessageType::Voice,
            MediaKind::Poll => MessageType::Poll,
            MediaKind::Contact => MessageType::Contact,
            MediaKind::Geo => MessageType::Location,
            MediaKind::GeoLive => MessageType::Location,
            MediaKind::Venue => MessageType::Venue,
            MediaKind::Game => MessageType::Game,
            MediaKind::Invoice => MessageType::Invoice,
            MediaKind::WebPage => MessageType::Webpage,
            MediaKind::Dice => MessageType::Dice,
            MediaKind::VideoNote => MessageType::VideoNote,
            MediaKind::Animation => MessageType::Animation,
            MediaKind::Other => MessageType::Media,
        },
    }
}

/// Builds a `RawMessageView` from a real `grammers_client` message, isolating the
/// `grammers_client::types::Media` match from the pure classification table above.
pub fn view_from_grammers(message: &Message) -> RawMessageView {
    RawMessageView {
        is_service: message.action().is_some(),
        media: message.media().map(media_kind),
    }
}

fn media_kind(media: Media) -> MediaKind {
    match media {
        Media::Photo(_) => MediaKind::Photo,
        Media::Document(doc) => classify_document(&doc),
        Media::Sticker(_) => MediaKind::Sticker,
        Media::Contact(_) => MediaKind::Contact,
        _ => MediaKind::Other,
    }
}

/// `Document` carries no public accessor for the raw `round_message`/`voice`/`animated`
/// TL attribute flags, so video/audio/voice/video_note/animation are told apart from a
/// generic document by MIME type and file name instead, per spec §4.5.
pub(crate) fn classify_document(document: &Document) -> MediaKind {
    let mime = document.mime_type().unwrap_or("");
    let name = document.name().to_ascii_lowercase();

    if mime == "image/gif" || name.ends_with(".gif") {
        MediaKind::Animation
    } else if mime == "video/mp4" && document.name().is_empty() {
        // Telegram sends round video messages as unnamed video/mp4 documents.
        MediaKind::VideoNote
    } else if mime.starts_with("video/") {
        MediaKind::Video
    } else if mime == "audio/ogg" && document.name().is_empty() {
        MediaKind::Voice
    } else if mime.starts_with("audio/") {
        MediaKind::Audio
    } else {
        MediaKind::Document
    }
}

/// Extracts the forwarding-origin peer id, if any, from a message's forward header.
/// `MessageFwdHeader::from_id` is absent for forwards where Telegram only discloses a
/// display name (`from_name`), in which case there is no id to record.
pub fn forward_from_id(message: &Message) -> Option<String> {
    let tl::enums::MessageFwdHeader::Header(header) = message.forward_header()?;
    header.from_id.map(|peer| peer_id(&peer).to_string())
}

fn peer_id(peer: &tl::enums::Peer) -> i64 {
    use tl::enums::Peer;
    match peer {
        Peer::User(u) => u.user_id,
        Peer::Chat(c) => c.chat_id,
        Peer::Channel(c) => c.channel_id,
    }
}

/// `has_media` is true whenever media is present, even for unmapped kinds, per
/// spec §4.5.
pub fn has_media(message_type: MessageType) -> bool {
    !matches!(message_type, MessageType::Text | MessageType::Service | MessageType::Unknown)
}

/// Snapshots the fields of a raw message into `raw_json`, per spec §4.6 step 5:
/// `bigint` identifiers (chat, sender, forward origin, media-group) are coerced to
/// decimal strings so downstream JSON consumers don't lose precision on 64-bit ids.
pub fn raw_message_json(message: &Message) -> String {
    let value = serde_json::json!({
        "id": message.id(),
        "chat_id": message.chat().id().to_string(),
        "from_id": message.sender().map(|s| s.id().to_string()),
        "date": message.date().timestamp(),
        "edit_date": message.edit_date().map(|d| d.timestamp()),
        "text": message.text(),
        "outgoing": message.outgoing(),
        "reply_to_id": message.reply_to_message_id(),
        "forward_from_id": forward_from_id(message),
        "grouped_id": message.grouped_id().map(|id| id.to_string()),
        "via_bot_id": message.via_bot_id().map(|id| id.to_string()),
    });
    value.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_messages_classify_as_service_even_with_media() {
        let view = RawMessageView {
            is_service: true,
            media: Some(MediaKind::Photo),
        };
        assert_eq!(classify_message(&view), MessageType::Service);
    }

    #[test]
    fn absent_media_classifies_as_text() {
        let view = RawMessageView {
            is_service: false,
            media: None,
        };
        assert_eq!(classify_message(&view), MessageType::Text);
    }

    #[test]
    fn known_media_kinds_map_directly() {
        let view = RawMessageView {
            is_service: false,
            media: Some(MediaKind::Venue),
        };
        assert_eq!(classify_message(&view), MessageType::Venue);
    }

    #[test]
    fn unknown_media_maps_to_media_with_has_media_true() {
        let view = RawMessageView {
            is_service: false,
            media: Some(MediaKind::Other),
        };
        let classified = classify_message(&view);
        assert_eq!(classified, MessageType::Media);
        assert!(has_media(classified));
    }

    #[test]
    fn text_has_no_media() {
        assert!(!has_media(MessageType::Text));
    }
}
