//! Chat commands: the registry consulted by ingestion, and the dispatcher
//! that runs invocations as tracked tasks.
//!
//! Every command is a [`Command`] value holding a shared [`CommandHandler`].
//! Handlers that finish instantly and handlers that do long work look the
//! same to the dispatcher: each invocation becomes one tracked task.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use parley_core::types::{ChatId, CommandInvocation, CommandRx, Reply, ReplyTx};
use parley_core::{ParleyError, TaskLifecycle};

use crate::error::TelegramError;
use crate::platform::{BotCommandInfo, ChatPlatform};

/// Telegram shows at most this many characters of a description in the
/// compact menu; longer ones get cut.
pub const DESCRIPTION_MAX_CHARS: usize = 25;
/// Telegram limit for a command name.
pub const NAME_MAX_CHARS: usize = 32;

#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn invoke(&self, chat_id: ChatId, params: &str) -> Result<(), TelegramError>;
}

/// Replies with fixed text through the response queue.
pub struct StaticReply {
    text: String,
    replies: ReplyTx,
}

impl StaticReply {
    pub fn new(text: impl Into<String>, replies: ReplyTx) -> Self {
        Self {
            text: text.into(),
            replies,
        }
    }
}

#[async_trait]
impl CommandHandler for StaticReply {
    async fn invoke(&self, chat_id: ChatId, _params: &str) -> Result<(), TelegramError> {
        self.replies
            .send(Reply::new(chat_id, self.text.clone()))
            .map_err(|_| TelegramError::QueueClosed)
    }
}

#[derive(Clone)]
pub struct Command {
    name: String,
    description: String,
    handler: Arc<dyn CommandHandler>,
}

impl Command {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn info(&self) -> BotCommandInfo {
        BotCommandInfo {
            name: self.name.clone(),
            description: self.description.clone(),
        }
    }
}

/// The process-wide command set. Filled at startup, read-only afterwards.
#[derive(Clone, Default)]
pub struct CommandRegistry {
    commands: BTreeMap<String, Command>,
    /// Registration order, which is also the menu order.
    order: Vec<String>,
    /// This bot's username, once known. Commands addressed to another bot
    /// with `/name@other_bot` are ignored.
    bot_username: Option<String>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a command. Names must be 1-32 characters of `a-z`, `0-9` or `_`
    /// and unique.
    pub fn register(
        &mut self,
        name: &str,
        description: Option<&str>,
        handler: Arc<dyn CommandHandler>,
    ) -> Result<(), ParleyError> {
        validate_name(name)?;
        if self.commands.contains_key(name) {
            return Err(ParleyError::InvalidCommand {
                name: name.to_string(),
                reason: "registered twice".to_string(),
            });
        }

        let description = normalize_description(description, name);
        info!(command = %name, %description, "registered command");
        self.order.push(name.to_string());
        self.commands.insert(
            name.to_string(),
            Command {
                name: name.to_string(),
                description,
                handler,
            },
        );
        Ok(())
    }

    pub fn set_bot_username(&mut self, username: Option<String>) {
        self.bot_username = username;
    }

    /// Whether a command carrying `addressee` after its `@` is meant for
    /// this bot. Unaddressed commands always are; an addressed one is
    /// accepted while the bot's own username is unknown.
    pub fn is_addressed_to_us(&self, addressee: Option<&str>) -> bool {
        match (addressee, self.bot_username.as_deref()) {
            (Some(addressee), Some(ours)) => addressee.eq_ignore_ascii_case(ours),
            _ => true,
        }
    }

    pub fn get(&self, name: &str) -> Option<&Command> {
        self.commands.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.commands.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Commands in registration order, as the menu shows them.
    pub fn menu(&self) -> Vec<BotCommandInfo> {
        self.order
            .iter()
            .filter_map(|name| self.commands.get(name))
            .map(Command::info)
            .collect()
    }
}

fn validate_name(name: &str) -> Result<(), ParleyError> {
    let reason = if name.is_empty() {
        Some("name is empty")
    } else if name.chars().count() > NAME_MAX_CHARS {
        Some("name is longer than 32 characters")
    } else if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
    {
        Some("name may only contain a-z, 0-9 and _")
    } else {
        None
    };
    match reason {
        Some(reason) => Err(ParleyError::InvalidCommand {
            name: name.to_string(),
            reason: reason.to_string(),
        }),
        None => Ok(()),
    }
}

/// First letter upper-cased, the rest lower-cased, cut to
/// [`DESCRIPTION_MAX_CHARS`]. A missing or blank description falls back to
/// the capitalized command name.
pub fn normalize_description(description: Option<&str>, name: &str) -> String {
    let source = description
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .unwrap_or(name);
    let mut chars = source.chars();
    let mut out = String::with_capacity(source.len());
    if let Some(first) = chars.next() {
        out.extend(first.to_uppercase());
    }
    out.extend(chars.flat_map(char::to_lowercase));
    out.chars().take(DESCRIPTION_MAX_CHARS).collect()
}

/// A `/name@bot rest of text` message taken apart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedCommand {
    /// Lower-cased; whether it is registered is for the caller to check.
    pub name: String,
    /// The bot named after `@`, if any.
    pub addressee: Option<String>,
    pub params: String,
}

/// Returns `None` when the text does not start with a command marker.
pub fn parse_command(text: &str) -> Option<ParsedCommand> {
    let body = text.strip_prefix('/')?;
    let (token, rest) = match body.find(char::is_whitespace) {
        Some(idx) => (&body[..idx], &body[idx..]),
        None => (body, ""),
    };
    let (name, addressee) = match token.split_once('@') {
        Some((name, bot)) => (name, Some(bot).filter(|bot| !bot.is_empty())),
        None => (token, None),
    };
    if name.is_empty() {
        return None;
    }
    Some(ParsedCommand {
        name: name.to_lowercase(),
        addressee: addressee.map(str::to_string),
        params: rest.trim().to_string(),
    })
}

/// Push the local menu to the platform when the registered one differs.
///
/// Returns whether an update was sent.
pub async fn sync_commands<P: ChatPlatform + ?Sized>(
    platform: &P,
    registry: &CommandRegistry,
) -> Result<bool, TelegramError> {
    let local = registry.menu();
    let remote = platform.get_registered_commands().await?;
    if remote == local {
        debug!(count = local.len(), "command menu already up to date");
        return Ok(false);
    }
    info!(count = local.len(), "setting command menu");
    platform.set_registered_commands(local).await?;
    Ok(true)
}

/// Consumes the command queue and runs each invocation as a tracked task.
pub struct CommandDispatcher {
    registry: Arc<CommandRegistry>,
    commands: CommandRx,
    lifecycle: TaskLifecycle,
}

impl CommandDispatcher {
    pub fn new(registry: Arc<CommandRegistry>, commands: CommandRx, lifecycle: TaskLifecycle) -> Self {
        Self {
            registry,
            commands,
            lifecycle,
        }
    }

    /// Drain the queue until stop is requested or every sender is gone.
    pub async fn run(mut self) {
        info!("command dispatcher started");
        loop {
            tokio::select! {
                _ = self.lifecycle.stopped() => break,
                next = self.commands.recv() => match next {
                    Some(invocation) => self.dispatch(invocation),
                    None => break,
                },
            }
        }
        info!("command dispatcher stopped");
    }

    /// Spawn the handler for one invocation. Unknown names spawn nothing.
    pub fn dispatch(&self, invocation: CommandInvocation) {
        let Some(command) = self.registry.get(&invocation.name) else {
            debug!(command = %invocation.name, chat_id = invocation.chat_id, "unknown command dropped");
            return;
        };

        let handler = Arc::clone(&command.handler);
        let CommandInvocation {
            chat_id,
            name,
            params,
        } = invocation;
        debug!(command = %name, chat_id, "handling command");
        self.lifecycle.track(format!("command:/{name}"), async move {
            match handler.invoke(chat_id, &params).await {
                Ok(()) => info!(command = %name, chat_id, "called command"),
                Err(e) => warn!(command = %name, chat_id, error = %e, "command failed"),
            }
        });
    }
}
