/// Errors produced by the Telegram side of the bridge.
#[derive(Debug, thiserror::Error)]
pub enum TelegramError {
    #[error("teloxide error: {0}")]
    Teloxide(#[from] teloxide::RequestError),

    #[error("http client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("no bot token configured")]
    NoToken,

    #[error("command /{name} failed: {reason}")]
    Command { name: String, reason: String },

    #[error("outbound queue closed")]
    QueueClosed,
}
