//! Entries flowing through the command, query and response queues.

use tokio::sync::mpsc;

/// Telegram chat identifier (negative for groups).
pub type ChatId = i64;

/// A plain-text message to forward to the assistant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    pub chat_id: ChatId,
    pub text: String,
}

/// A recognised `/command` with everything after the command token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandInvocation {
    pub chat_id: ChatId,
    pub name: String,
    pub params: String,
}

/// Text to deliver back to a chat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub chat_id: ChatId,
    pub text: String,
}

impl Query {
    pub fn new(chat_id: ChatId, text: impl Into<String>) -> Self {
        Self {
            chat_id,
            text: text.into(),
        }
    }
}

impl CommandInvocation {
    pub fn new(chat_id: ChatId, name: impl Into<String>, params: impl Into<String>) -> Self {
        Self {
            chat_id,
            name: name.into(),
            params: params.into(),
        }
    }
}

impl Reply {
    pub fn new(chat_id: ChatId, text: impl Into<String>) -> Self {
        Self {
            chat_id,
            text: text.into(),
        }
    }
}

pub type QueryTx = mpsc::UnboundedSender<Query>;
pub type QueryRx = mpsc::UnboundedReceiver<Query>;
pub type CommandTx = mpsc::UnboundedSender<CommandInvocation>;
pub type CommandRx = mpsc::UnboundedReceiver<CommandInvocation>;
pub type ReplyTx = mpsc::UnboundedSender<Reply>;
pub type ReplyRx = mpsc::UnboundedReceiver<Reply>;
