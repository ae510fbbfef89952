use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use parley_core::types::ChatId;

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// Lifecycle state of an assistant run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    InProgress,
    RequiresAction,
    Cancelling,
    Cancelled,
    Failed,
    Completed,
    Incomplete,
    Expired,
    #[serde(other)]
    Unknown,
}

impl RunStatus {
    /// Whether polling can stop. `requires_action` counts as terminal since
    /// no tool outputs are ever submitted.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed
                | Self::Failed
                | Self::Cancelled
                | Self::Expired
                | Self::Incomplete
                | Self::RequiresAction
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Run {
    pub id: String,
    pub status: RunStatus,
}

/// Placeholder inside a text part that points at a cited file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Annotation {
    /// Literal token in the text, e.g. `【4:0†source】`.
    pub text: String,
    pub file_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageContent {
    Text {
        value: String,
        annotations: Vec<Annotation>,
    },
    /// Images and other non-text parts. Skipped when rendering replies.
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadMessage {
    pub id: String,
    pub content: Vec<MessageContent>,
}

impl ThreadMessage {
    pub fn text(id: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            content: vec![MessageContent::Text {
                value: value.into(),
                annotations: Vec::new(),
            }],
        }
    }
}

/// Conversation backend used by the query dispatcher.
#[async_trait]
pub trait AssistantBackend: Send + Sync {
    /// Open a new conversation thread for `chat_id`. Returns its id.
    async fn create_thread(&self, chat_id: ChatId) -> Result<String>;

    async fn append_message(&self, thread_id: &str, text: &str, role: Role) -> Result<()>;

    /// Start a run and poll it until [`RunStatus::is_terminal`].
    async fn create_and_await_run(&self, thread_id: &str, assistant_id: &str) -> Result<Run>;

    /// Messages produced by `run_id`, oldest first, strictly after the
    /// message id `after` when given.
    async fn list_messages_after(
        &self,
        thread_id: &str,
        run_id: &str,
        after: Option<&str>,
    ) -> Result<Vec<ThreadMessage>>;

    /// Text that replaces `annotation` in a reply. May be empty.
    async fn resolve_annotation(&self, annotation: &Annotation) -> Result<String>;
}
