//! Bot API client: [`ChatPlatform`] over a teloxide `Bot`.

use std::time::Duration;

use async_trait::async_trait;
use teloxide::payloads::GetUpdatesSetters;
use teloxide::prelude::*;
use teloxide::types::{AllowedUpdate as TgAllowedUpdate, BotCommand, UpdateKind};
use tracing::{debug, warn};

use parley_core::config::AllowedUpdate;
use parley_core::types::ChatId as ParleyChatId;

use crate::error::TelegramError;
use crate::platform::{BotCommandInfo, ChatPlatform, PollParams, Update};

/// Extra time the HTTP client waits beyond the server-side long-poll wait.
const POLL_TIMEOUT_SLACK: Duration = Duration::from_secs(10);

pub struct TelegramClient {
    bot: Bot,
}

impl TelegramClient {
    /// Build a client whose request timeout outlives a `poll_timeout` long
    /// poll, optionally routed through `proxy`.
    pub fn new(
        token: &str,
        poll_timeout: Duration,
        proxy: Option<&str>,
    ) -> Result<Self, TelegramError> {
        if token.trim().is_empty() {
            return Err(TelegramError::NoToken);
        }

        let mut builder = teloxide::net::default_reqwest_settings()
            .timeout(poll_timeout + POLL_TIMEOUT_SLACK);
        if let Some(proxy) = proxy {
            builder = builder.proxy(reqwest::Proxy::all(proxy)?);
        }

        Ok(Self {
            bot: Bot::with_client(token, builder.build()?),
        })
    }
}

#[async_trait]
impl ChatPlatform for TelegramClient {
    async fn fetch_updates(
        &self,
        offset: i64,
        params: &PollParams,
    ) -> Result<Vec<Update>, TelegramError> {
        debug!(offset, limit = params.limit, "waiting for updates");
        let updates = self
            .bot
            .get_updates()
            .offset(wire_offset(offset))
            .limit(params.limit)
            .timeout(u32::try_from(params.timeout.as_secs()).unwrap_or(u32::MAX))
            .allowed_updates(params.allowed_updates.iter().map(|kind| to_teloxide(*kind)))
            .await?;
        Ok(updates.into_iter().map(convert_update).collect())
    }

    async fn send_message(&self, chat_id: ParleyChatId, text: &str) -> Result<(), TelegramError> {
        self.bot.send_message(ChatId(chat_id), text).await?;
        Ok(())
    }

    async fn bot_username(&self) -> Result<Option<String>, TelegramError> {
        let me = self.bot.get_me().await?;
        Ok(me.user.username)
    }

    async fn get_registered_commands(&self) -> Result<Vec<BotCommandInfo>, TelegramError> {
        let commands = self.bot.get_my_commands().await?;
        Ok(commands
            .into_iter()
            .map(|c| BotCommandInfo {
                name: c.command,
                description: c.description,
            })
            .collect())
    }

    async fn set_registered_commands(
        &self,
        commands: Vec<BotCommandInfo>,
    ) -> Result<(), TelegramError> {
        self.bot
            .set_my_commands(
                commands
                    .into_iter()
                    .map(|c| BotCommand::new(c.name, c.description)),
            )
            .await?;
        Ok(())
    }
}

/// The Bot API carries offsets as i32.
fn wire_offset(offset: i64) -> i32 {
    i32::try_from(offset).unwrap_or_else(|_| {
        let clamped = if offset < 0 { i32::MIN } else { i32::MAX };
        warn!(offset, clamped, "update offset out of range, clamped");
        clamped
    })
}

fn to_teloxide(kind: AllowedUpdate) -> TgAllowedUpdate {
    match kind {
        AllowedUpdate::Message => TgAllowedUpdate::Message,
        AllowedUpdate::EditedMessage => TgAllowedUpdate::EditedMessage,
    }
}

/// Flatten a teloxide update into the fields the bridge routes on.
fn convert_update(update: teloxide::types::Update) -> Update {
    let update_id = i64::from(update.id.0);
    let (message, timestamp) = match &update.kind {
        UpdateKind::Message(msg) => (Some(msg), Some(msg.date)),
        UpdateKind::EditedMessage(msg) => {
            let edited_at = msg.edit_date().copied().unwrap_or(msg.date);
            (Some(msg), Some(edited_at))
        }
        _ => (None, None),
    };

    Update {
        update_id,
        timestamp,
        chat_id: message.map(|msg| msg.chat.id.0),
        text: message.and_then(|msg| msg.text()).map(str::to_string),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: &str) -> teloxide::types::Update {
        serde_json::from_str(json).unwrap()
    }

    const CHAT: &str = r#""chat":{"id":42,"first_name":"Ada","type":"private"},
        "from":{"id":42,"is_bot":false,"first_name":"Ada"}"#;

    #[test]
    fn new_message_uses_its_send_date() {
        let update = convert_update(parse(&format!(
            r#"{{"update_id":7,"message":{{"message_id":1,{CHAT},
                "date":1700000000,"text":"hello"}}}}"#
        )));
        assert_eq!(update.update_id, 7);
        assert_eq!(update.chat_id, Some(42));
        assert_eq!(update.text.as_deref(), Some("hello"));
        assert_eq!(update.timestamp.map(|t| t.timestamp()), Some(1_700_000_000));
    }

    #[test]
    fn edited_message_uses_its_edit_date() {
        let update = convert_update(parse(&format!(
            r#"{{"update_id":8,"edited_message":{{"message_id":1,{CHAT},
                "date":1700000000,"edit_date":1700000500,"text":"hello again"}}}}"#
        )));
        assert_eq!(update.chat_id, Some(42));
        assert_eq!(update.text.as_deref(), Some("hello again"));
        assert_eq!(update.timestamp.map(|t| t.timestamp()), Some(1_700_000_500));
    }

    #[test]
    fn other_kinds_carry_only_the_id() {
        let update = convert_update(parse(
            r#"{"update_id":9,"new_update_kind":{"some_field":1}}"#,
        ));
        assert_eq!(update.update_id, 9);
        assert_eq!(update.chat_id, None);
        assert_eq!(update.text, None);
        assert_eq!(update.timestamp, None);
    }

    #[test]
    fn offsets_beyond_i32_are_clamped() {
        assert_eq!(wire_offset(12), 12);
        assert_eq!(wire_offset(i64::from(i32::MAX) + 1), i32::MAX);
        assert_eq!(wire_offset(i64::MIN), i32::MIN);
    }
}
