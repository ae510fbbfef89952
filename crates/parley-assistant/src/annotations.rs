//! Turning assistant messages into reply text.
//!
//! File-search answers carry placeholder tokens like `【4:0†source】`. Each
//! annotated token is swapped for whatever the backend resolves it to, and
//! any token the backend did not annotate is removed, so no raw marker ever
//! reaches the chat.

use tracing::warn;

use crate::backend::{Annotation, AssistantBackend, MessageContent, ThreadMessage};

const MARKER_OPEN: char = '【';
const MARKER_CLOSE: char = '】';

/// Remove every complete `【…】` span. An unmatched opener is left alone.
pub fn strip_citation_markers(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find(MARKER_OPEN) {
        let after_open = &rest[start + MARKER_OPEN.len_utf8()..];
        match after_open.find(MARKER_CLOSE) {
            Some(end) => {
                out.push_str(&rest[..start]);
                rest = &after_open[end + MARKER_CLOSE.len_utf8()..];
            }
            None => break,
        }
    }
    out.push_str(rest);
    out
}

/// Resolve one text part. A failed lookup drops the marker.
pub async fn resolve_text<B: AssistantBackend + ?Sized>(
    backend: &B,
    value: &str,
    annotations: &[Annotation],
) -> String {
    let mut text = value.to_string();
    for annotation in annotations {
        if annotation.text.is_empty() {
            continue;
        }
        let display = match backend.resolve_annotation(annotation).await {
            Ok(display) => display,
            Err(e) => {
                warn!(marker = %annotation.text, error = %e, "annotation lookup failed");
                String::new()
            }
        };
        text = text.replace(&annotation.text, &display);
    }
    strip_citation_markers(&text)
}

/// Text parts of `messages` in order, joined by blank lines. Non-text parts
/// are skipped.
pub async fn render_messages<B: AssistantBackend + ?Sized>(
    backend: &B,
    messages: &[ThreadMessage],
) -> String {
    let mut parts = Vec::new();
    for message in messages {
        for content in &message.content {
            if let MessageContent::Text { value, annotations } = content {
                let text = resolve_text(backend, value, annotations).await;
                let text = text.trim();
                if !text.is_empty() {
                    parts.push(text.to_string());
                }
            }
        }
    }
    parts.join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    use crate::backend::{Role, Run};
    use crate::error::{AssistantError, Result};
    use parley_core::types::ChatId;

    /// Resolves `file-ok` to its name and fails for anything else.
    struct Lookup;

    #[async_trait]
    impl AssistantBackend for Lookup {
        async fn create_thread(&self, _chat_id: ChatId) -> Result<String> {
            unreachable!()
        }
        async fn append_message(&self, _thread_id: &str, _text: &str, _role: Role) -> Result<()> {
            unreachable!()
        }
        async fn create_and_await_run(&self, _thread_id: &str, _assistant_id: &str) -> Result<Run> {
            unreachable!()
        }
        async fn list_messages_after(
            &self,
            _thread_id: &str,
            _run_id: &str,
            _after: Option<&str>,
        ) -> Result<Vec<ThreadMessage>> {
            unreachable!()
        }
        async fn resolve_annotation(&self, annotation: &Annotation) -> Result<String> {
            match annotation.file_id.as_deref() {
                Some("file-ok") => Ok(" [guide.pdf]".to_string()),
                _ => Err(AssistantError::Parse("unknown file".to_string())),
            }
        }
    }

    fn annotation(text: &str, file_id: &str) -> Annotation {
        Annotation {
            text: text.to_string(),
            file_id: Some(file_id.to_string()),
        }
    }

    #[test]
    fn strips_complete_markers_only() {
        assert_eq!(strip_citation_markers("a【1:0†x】b【2:1†y】c"), "abc");
        assert_eq!(strip_citation_markers("no markers"), "no markers");
        assert_eq!(strip_citation_markers("open【 only"), "open【 only");
    }

    #[tokio::test]
    async fn annotations_are_replaced_and_leftovers_stripped() {
        let text = resolve_text(
            &Lookup,
            "See the guide【1:0†guide.pdf】 and the memo【2:0†memo】.",
            &[
                annotation("【1:0†guide.pdf】", "file-ok"),
                annotation("【2:0†memo】", "file-missing"),
            ],
        )
        .await;
        assert_eq!(text, "See the guide [guide.pdf] and the memo.");
    }

    #[tokio::test]
    async fn unannotated_marker_never_leaks() {
        let text = resolve_text(&Lookup, "Fact【9:9†stray】.", &[]).await;
        assert_eq!(text, "Fact.");
    }

    #[tokio::test]
    async fn render_joins_text_parts_and_skips_others() {
        let messages = vec![
            ThreadMessage {
                id: "msg_1".to_string(),
                content: vec![
                    MessageContent::Text {
                        value: "First.".to_string(),
                        annotations: Vec::new(),
                    },
                    MessageContent::Other,
                ],
            },
            ThreadMessage::text("msg_2", "Second."),
        ];
        assert_eq!(render_messages(&Lookup, &messages).await, "First.\n\nSecond.");
    }
}
