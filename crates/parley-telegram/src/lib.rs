pub mod client;
pub mod commands;
pub mod error;
pub mod ingest;
pub mod offset;
pub mod platform;
pub mod send;

pub use client::TelegramClient;
pub use commands::{CommandDispatcher, CommandHandler, CommandRegistry, StaticReply};
pub use error::TelegramError;
pub use ingest::IngestionLoop;
pub use offset::OffsetTracker;
pub use platform::{BotCommandInfo, ChatPlatform, PollParams, Update};
