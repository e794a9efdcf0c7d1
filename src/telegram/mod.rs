pub mod adapter;
pub mod message_type;
pub mod realtime;

pub use adapter::{GrammersAdapter, TelegramAdapter};
pub use realtime::RealtimeHandler;
