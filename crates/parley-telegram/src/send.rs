//! Outbound delivery: drains the response queue into Telegram.
//!
//! Telegram's message limit is 4096 characters. We use 4090 for safety.
//! Long replies are split on line boundaries, keeping fenced code blocks
//! balanced in every chunk.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use parley_core::types::{Reply, ReplyRx};
use parley_core::TaskLifecycle;

use crate::error::TelegramError;
use crate::platform::ChatPlatform;

/// Maximum characters per Telegram message (limit is 4096; we use 4090 for safety).
const CHUNK_MAX: usize = 4090;
/// Room kept free in every chunk for a closing code fence.
const FENCE_RESERVE: usize = 4;
/// Gap between consecutive chunks of one reply.
const CHUNK_GAP: Duration = Duration::from_millis(100);

/// Code-fence-aware message splitter.
///
/// When a split falls inside a fenced code block, the fence is closed before
/// the chunk boundary and re-opened at the start of the next chunk. A single
/// line too long for one chunk is cut into pieces: prose at the last space,
/// code exactly, so indentation inside a block survives.
pub fn split_chunks_smart(text: &str) -> Vec<String> {
    if text.chars().count() <= CHUNK_MAX {
        return vec![text.to_string()];
    }

    let mut chunks: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut current_len = 0usize;
    let mut fence_lang: Option<String> = None;

    for line in text.split('\n') {
        let budget = match fence_lang {
            // reopened fence header and the newline after it
            Some(ref lang) => CHUNK_MAX
                .saturating_sub(FENCE_RESERVE + 4 + lang.chars().count())
                .max(1),
            None => CHUNK_MAX,
        };

        for piece in line_pieces(line, budget, fence_lang.is_some()) {
            let piece_len = piece.chars().count();
            let cost = if current.is_empty() { piece_len } else { 1 + piece_len };

            if !current.is_empty() && current_len + cost + FENCE_RESERVE > CHUNK_MAX {
                if fence_lang.is_some() {
                    current.push_str("\n```");
                }
                chunks.push(std::mem::take(&mut current));
                current_len = 0;
                if let Some(ref lang) = fence_lang {
                    current.push_str("```");
                    current.push_str(lang);
                    current_len = 3 + lang.chars().count();
                }
            }

            if !current.is_empty() {
                current.push('\n');
                current_len += 1;
            }
            current.push_str(piece);
            current_len += piece_len;
        }

        if let Some(after_fence) = line.trim_start().strip_prefix("```") {
            fence_lang = match fence_lang {
                Some(_) => None,
                None => Some(after_fence.trim().to_string()),
            };
        }
    }

    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// Cut `line` into pieces of at most `budget` characters.
fn line_pieces(line: &str, budget: usize, in_code: bool) -> Vec<&str> {
    let mut pieces = Vec::new();
    let mut rest = line;
    while rest.chars().count() > budget {
        let limit = byte_index_of_char(rest, budget);
        let head = &rest[..limit];
        match head.rfind(' ').filter(|&idx| idx > 0 && !in_code) {
            Some(idx) => {
                pieces.push(&rest[..idx]);
                rest = &rest[idx + 1..];
            }
            None => {
                pieces.push(head);
                rest = &rest[limit..];
            }
        }
    }
    pieces.push(rest);
    pieces
}

fn byte_index_of_char(s: &str, n: usize) -> usize {
    s.char_indices().nth(n).map(|(idx, _)| idx).unwrap_or(s.len())
}

/// Send one reply, chunked, in order.
pub async fn send_reply<P: ChatPlatform + ?Sized>(
    platform: &P,
    reply: &Reply,
) -> Result<(), TelegramError> {
    let chunks = split_chunks_smart(&reply.text);
    for (i, chunk) in chunks.iter().enumerate() {
        platform.send_message(reply.chat_id, chunk).await?;
        if i + 1 < chunks.len() {
            tokio::time::sleep(CHUNK_GAP).await;
        }
    }
    Ok(())
}

/// Drain the response queue, sending every reply as its own tracked task.
///
/// Runs until every producer has dropped its sender, not until stop: replies
/// produced while the bridge winds down are still delivered.
pub async fn run_reply_delivery<P: ChatPlatform + 'static>(
    platform: Arc<P>,
    mut replies: ReplyRx,
    lifecycle: TaskLifecycle,
) {
    info!("reply delivery started");
    while let Some(reply) = replies.recv().await {
        if reply.text.trim().is_empty() {
            debug!(chat_id = reply.chat_id, "empty reply skipped");
            continue;
        }
        let platform = Arc::clone(&platform);
        debug!(chat_id = reply.chat_id, "sending reply");
        lifecycle.track(format!("send:{}", reply.chat_id), async move {
            if let Err(e) = send_reply(platform.as_ref(), &reply).await {
                warn!(chat_id = reply.chat_id, error = %e, "failed to send reply");
            }
        });
    }
    info!("reply delivery ended (queue closed)");
}
