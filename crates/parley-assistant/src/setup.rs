//! One-shot startup work: reference-document ingestion and assistant creation.

use std::path::{Path, PathBuf};

use futures_util::future::try_join_all;
use reqwest::multipart::{Form, Part};
use reqwest::Method;
use serde::Deserialize;
use tracing::{debug, info};

use parley_core::config::AssistantConfig;

use crate::error::{AssistantError, Result};
use crate::openai::{IdOnly, OpenAiAssistants};

/// Instructions for an assistant with file search and none configured.
pub const FILE_SEARCH_INSTRUCTIONS: &str = "1. You're an HR assistant with access to files about \
(1) the Latokent company, (2) its culture and (3) the hackathon test job candidates must pass \
to get on board. 2. Your views are strongly aligned with the company culture: strive for \
productivity and do not tolerate incompetence. 3. Answer in the manner of Ben Horowitz, a \
founder of a16z (the files have some material on him). 4. When the files do not hold the \
information, don't mention that, just answer the question. 5. When asked about a hackathon, \
answer from the AI Bot Hackathon Task, including its timelines. 6. You may ask questions from \
the test for candidates, the file containing 'Проверьте, готовы ли вы к результативному \
хакатону и интервью с помощью этого короткого теста'.";

/// Result of attaching the uploaded files to a vector store.
#[derive(Debug, Clone, Deserialize)]
pub struct FileBatch {
    pub id: String,
    pub vector_store_id: String,
    #[serde(default)]
    pub status: String,
}

/// Regular files directly inside `dir`, sorted by name.
pub async fn reference_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_file() {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files)
}

async fn upload_file(client: &OpenAiAssistants, path: &Path) -> Result<String> {
    let bytes = tokio::fs::read(path).await?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "document".to_string());
    let form = Form::new()
        .text("purpose", "assistants")
        .part("file", Part::bytes(bytes).file_name(name.clone()));

    let file: IdOnly = client
        .send_json(client.request(Method::POST, "/v1/files").multipart(form))
        .await?;
    debug!(file = %name, file_id = %file.id, "file uploaded");
    Ok(file.id)
}

/// Upload every file in `dir` concurrently and attach them to a new vector
/// store named `store_name` as one batch.
pub async fn store_files(
    client: &OpenAiAssistants,
    dir: &Path,
    store_name: &str,
) -> Result<FileBatch> {
    let paths = reference_files(dir).await?;
    if paths.is_empty() {
        return Err(AssistantError::NoFiles {
            dir: dir.display().to_string(),
        });
    }

    let file_ids = try_join_all(paths.iter().map(|p| upload_file(client, p))).await?;
    let store: IdOnly = client
        .post_json(
            "/v1/vector_stores",
            &serde_json::json!({ "name": store_name }),
        )
        .await?;
    let batch: FileBatch = client
        .post_json(
            &format!("/v1/vector_stores/{}/file_batches", store.id),
            &serde_json::json!({ "file_ids": file_ids }),
        )
        .await?;
    info!(
        files = file_ids.len(),
        vector_store_id = %batch.vector_store_id,
        status = %batch.status,
        "reference files stored"
    );
    Ok(batch)
}

/// Request body for `POST /v1/assistants`.
pub fn assistant_body(config: &AssistantConfig, vector_store_id: Option<&str>) -> serde_json::Value {
    let mut body = serde_json::json!({
        "model": config.model,
        "name": config.name,
        "temperature": config.temperature,
    });
    let instructions = config
        .instructions
        .as_deref()
        .or(vector_store_id.map(|_| FILE_SEARCH_INSTRUCTIONS));
    if let Some(instructions) = instructions {
        body["instructions"] = serde_json::json!(instructions);
    }
    if let Some(store) = vector_store_id {
        body["tools"] = serde_json::json!([{ "type": "file_search" }]);
        body["tool_resources"] = serde_json::json!({
            "file_search": { "vector_store_ids": [store] },
        });
    }
    body
}

pub async fn create_assistant(
    client: &OpenAiAssistants,
    config: &AssistantConfig,
    vector_store_id: Option<&str>,
) -> Result<String> {
    let assistant: IdOnly = client
        .post_json("/v1/assistants", &assistant_body(config, vector_store_id))
        .await?;
    info!(assistant_id = %assistant.id, model = %config.model, "assistant created");
    Ok(assistant.id)
}

/// Ingest reference files when asked to, then create the assistant.
/// Returns the assistant id.
pub async fn prepare_assistant(
    client: &OpenAiAssistants,
    config: &AssistantConfig,
    ingest_files: bool,
) -> Result<String> {
    let store = if ingest_files {
        let batch = store_files(client, Path::new(&config.files_dir), &config.vector_store_name).await?;
        Some(batch.vector_store_id)
    } else {
        None
    };
    create_assistant(client, config, store.as_deref()).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_assistant_has_no_tools() {
        let body = assistant_body(&AssistantConfig::default(), None);
        assert_eq!(body["model"], "gpt-4o");
        assert_eq!(body["name"], "Startup HR Assistant");
        assert!(body.get("tools").is_none());
        assert!(body.get("instructions").is_none());
    }

    #[test]
    fn file_search_bound_to_store() {
        let config = AssistantConfig {
            instructions: Some("Answer from the files.".to_string()),
            ..AssistantConfig::default()
        };
        let body = assistant_body(&config, Some("vs_1"));
        assert_eq!(body["tools"][0]["type"], "file_search");
        assert_eq!(body["tool_resources"]["file_search"]["vector_store_ids"][0], "vs_1");
        assert_eq!(body["instructions"], "Answer from the files.");
    }

    #[test]
    fn file_search_without_instructions_gets_the_default() {
        let body = assistant_body(&AssistantConfig::default(), Some("vs_1"));
        assert_eq!(body["instructions"], FILE_SEARCH_INSTRUCTIONS);
    }

    #[tokio::test]
    async fn only_regular_files_are_listed() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.md"), "beta").unwrap();
        std::fs::write(dir.path().join("a.txt"), "alpha").unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();

        let files = reference_files(dir.path()).await.unwrap();
        let names: Vec<_> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.txt", "b.md"]);
    }

    #[tokio::test]
    async fn empty_directory_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let client = OpenAiAssistants::new(&AssistantConfig::default(), None).unwrap();
        let err = store_files(&client, dir.path(), "Info").await.unwrap_err();
        assert!(matches!(err, AssistantError::NoFiles { .. }));
    }
}
