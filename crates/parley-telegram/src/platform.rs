//! Chat platform boundary.
//!
//! The ingestion loop, the command menu sync and the outbound delivery only
//! see this trait. [`crate::client::TelegramClient`] implements it on top of
//! teloxide; tests use in-memory fakes.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use parley_core::config::AllowedUpdate;
use parley_core::types::ChatId;

use crate::error::TelegramError;

/// One inbound event from the long-poll feed.
///
/// `chat_id` and `text` are optional because the feed carries updates the
/// bridge cannot route (stickers, service messages); those still advance the
/// offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Update {
    pub update_id: i64,
    /// Message `date`, or `edit_date` for an edited message.
    pub timestamp: Option<DateTime<Utc>>,
    pub chat_id: Option<ChatId>,
    pub text: Option<String>,
}

impl Update {
    pub fn text_message(
        update_id: i64,
        chat_id: ChatId,
        text: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            update_id,
            timestamp: Some(timestamp),
            chat_id: Some(chat_id),
            text: Some(text.into()),
        }
    }
}

/// Parameters of one `getUpdates` call except the offset.
#[derive(Debug, Clone)]
pub struct PollParams {
    pub limit: u8,
    pub timeout: Duration,
    pub allowed_updates: Vec<AllowedUpdate>,
}

/// A command as shown in the Telegram client menu.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BotCommandInfo {
    pub name: String,
    pub description: String,
}

#[async_trait]
pub trait ChatPlatform: Send + Sync {
    /// Long-poll for updates with `update_id >= offset`.
    async fn fetch_updates(
        &self,
        offset: i64,
        params: &PollParams,
    ) -> Result<Vec<Update>, TelegramError>;

    async fn send_message(&self, chat_id: ChatId, text: &str) -> Result<(), TelegramError>;

    /// The bot's own username, used to tell apart `/cmd@bot` addressed to
    /// other bots in group chats.
    async fn bot_username(&self) -> Result<Option<String>, TelegramError> {
        Ok(None)
    }

    async fn get_registered_commands(&self) -> Result<Vec<BotCommandInfo>, TelegramError>;

    async fn set_registered_commands(
        &self,
        commands: Vec<BotCommandInfo>,
    ) -> Result<(), TelegramError>;
}
