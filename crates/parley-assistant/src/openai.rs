//! OpenAI Assistants v2 over plain reqwest.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use reqwest::{Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, warn};

use parley_core::config::{AssistantConfig, CitationStyle};
use parley_core::types::ChatId;

use crate::backend::{
    Annotation, AssistantBackend, MessageContent, Role, Run, ThreadMessage,
};
use crate::error::{AssistantError, Result};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);
/// Largest page the messages endpoint serves.
const PAGE_LIMIT: &str = "100";

pub struct OpenAiAssistants {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    poll_interval: Duration,
    run_timeout: Duration,
    citations: CitationStyle,
    /// file id -> filename, filled by `resolve_annotation`.
    filenames: DashMap<String, String>,
}

impl OpenAiAssistants {
    pub fn new(config: &AssistantConfig, proxy: Option<&str>) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT);
        if let Some(proxy) = proxy {
            builder = builder.proxy(reqwest::Proxy::all(proxy)?);
        }

        Ok(Self {
            client: builder.build()?,
            api_key: config.api_key.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            poll_interval: config.run_poll_interval(),
            run_timeout: config.run_timeout(),
            citations: config.citations,
            filenames: DashMap::new(),
        })
    }

    /// Authenticated request against `path` (starting with `/v1/`).
    pub(crate) fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client
            .request(method, format!("{}{}", self.base_url, path))
            .bearer_auth(&self.api_key)
            .header("OpenAI-Beta", "assistants=v2")
    }

    pub(crate) async fn send_json<T: DeserializeOwned>(&self, req: RequestBuilder) -> Result<T> {
        let resp = check_status(req.send().await?).await?;
        resp.json::<T>()
            .await
            .map_err(|e| AssistantError::Parse(e.to_string()))
    }

    pub(crate) async fn post_json<T: DeserializeOwned>(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<T> {
        self.send_json(self.request(Method::POST, path).json(body))
            .await
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        self.send_json(self.request(Method::GET, path)).await
    }

    async fn cancel_run(&self, thread_id: &str, run_id: &str) -> Result<()> {
        let path = format!("/v1/threads/{thread_id}/runs/{run_id}/cancel");
        let _: Run = self.post_json(&path, &serde_json::json!({})).await?;
        Ok(())
    }

    async fn filename(&self, file_id: &str) -> Result<String> {
        if let Some(name) = self.filenames.get(file_id) {
            return Ok(name.clone());
        }
        let file: FileObject = self.get_json(&format!("/v1/files/{file_id}")).await?;
        self.filenames
            .insert(file_id.to_string(), file.filename.clone());
        Ok(file.filename)
    }
}

async fn check_status(resp: Response) -> Result<Response> {
    let status = resp.status().as_u16();
    if status == 429 {
        let retry = resp
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .map(|s| s * 1000)
            .unwrap_or(5000);
        return Err(AssistantError::RateLimited {
            retry_after_ms: retry,
        });
    }

    if !resp.status().is_success() {
        let text = resp.text().await.unwrap_or_default();
        warn!(status, body = %text, "OpenAI API error");
        return Err(AssistantError::Api {
            status,
            message: text,
        });
    }
    Ok(resp)
}

#[async_trait]
impl AssistantBackend for OpenAiAssistants {
    async fn create_thread(&self, chat_id: ChatId) -> Result<String> {
        let body = serde_json::json!({
            "metadata": { "chat_id": chat_id.to_string() },
        });
        let thread: IdOnly = self.post_json("/v1/threads", &body).await?;
        debug!(chat_id, thread_id = %thread.id, "thread created");
        Ok(thread.id)
    }

    async fn append_message(&self, thread_id: &str, text: &str, role: Role) -> Result<()> {
        let body = serde_json::json!({ "role": role, "content": text });
        let _: IdOnly = self
            .post_json(&format!("/v1/threads/{thread_id}/messages"), &body)
            .await?;
        Ok(())
    }

    async fn create_and_await_run(&self, thread_id: &str, assistant_id: &str) -> Result<Run> {
        let body = serde_json::json!({ "assistant_id": assistant_id });
        let mut run: Run = self
            .post_json(&format!("/v1/threads/{thread_id}/runs"), &body)
            .await?;
        debug!(thread_id, run_id = %run.id, status = ?run.status, "run created");

        let started = Instant::now();
        while !run.status.is_terminal() {
            if started.elapsed() >= self.run_timeout {
                if let Err(e) = self.cancel_run(thread_id, &run.id).await {
                    debug!(run_id = %run.id, error = %e, "cancelling timed out run failed");
                }
                return Err(AssistantError::RunTimeout {
                    run_id: run.id,
                    waited_secs: started.elapsed().as_secs(),
                });
            }
            tokio::time::sleep(self.poll_interval).await;
            run = self
                .get_json(&format!("/v1/threads/{thread_id}/runs/{}", run.id))
                .await?;
        }
        debug!(thread_id, run_id = %run.id, status = ?run.status, "run finished");
        Ok(run)
    }

    async fn list_messages_after(
        &self,
        thread_id: &str,
        run_id: &str,
        after: Option<&str>,
    ) -> Result<Vec<ThreadMessage>> {
        let path = format!("/v1/threads/{thread_id}/messages");
        let mut cursor = after.map(str::to_string);
        let mut messages = Vec::new();
        loop {
            let mut query = vec![("run_id", run_id), ("order", "asc"), ("limit", PAGE_LIMIT)];
            if let Some(ref after) = cursor {
                query.push(("after", after.as_str()));
            }
            let page: MessageList = self
                .send_json(self.request(Method::GET, &path).query(&query))
                .await?;
            let next = page.next_cursor();
            messages.extend(page.data.into_iter().map(ThreadMessage::from));
            match next {
                Some(id) => cursor = Some(id),
                None => break,
            }
        }
        Ok(messages)
    }

    async fn resolve_annotation(&self, annotation: &Annotation) -> Result<String> {
        match (self.citations, annotation.file_id.as_deref()) {
            (CitationStyle::Filename, Some(file_id)) => {
                Ok(format!(" [{}]", self.filename(file_id).await?))
            }
            _ => Ok(String::new()),
        }
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct IdOnly {
    pub id: String,
}

#[derive(Debug, Deserialize)]
struct FileObject {
    filename: String,
}

#[derive(Debug, Deserialize)]
struct MessageList {
    data: Vec<WireMessage>,
    #[serde(default)]
    has_more: bool,
    #[serde(default)]
    last_id: Option<String>,
}

impl MessageList {
    fn next_cursor(&self) -> Option<String> {
        if !self.has_more || self.data.is_empty() {
            return None;
        }
        self.last_id
            .clone()
            .or_else(|| self.data.last().map(|m| m.id.clone()))
    }
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    id: String,
    #[serde(default)]
    content: Vec<WireContent>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireContent {
    Text { text: WireText },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct WireText {
    value: String,
    #[serde(default)]
    annotations: Vec<WireAnnotation>,
}

#[derive(Debug, Deserialize)]
struct WireAnnotation {
    #[serde(default)]
    text: String,
    file_citation: Option<FileRef>,
    file_path: Option<FileRef>,
}

#[derive(Debug, Deserialize)]
struct FileRef {
    file_id: String,
}

impl From<WireMessage> for ThreadMessage {
    fn from(msg: WireMessage) -> Self {
        let content = msg
            .content
            .into_iter()
            .map(|part| match part {
                WireContent::Text { text } => MessageContent::Text {
                    value: text.value,
                    annotations: text
                        .annotations
                        .into_iter()
                        .map(|a| Annotation {
                            text: a.text,
                            file_id: a.file_citation.or(a.file_path).map(|f| f.file_id),
                        })
                        .collect(),
                },
                WireContent::Other => MessageContent::Other,
            })
            .collect();
        ThreadMessage {
            id: msg.id,
            content,
        }
    }
}
