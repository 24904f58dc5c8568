//! OpenAI reasoning backend.
//!
//! Speaks three parts of the OpenAI REST API:
//! - chat completions, always with `response_format: json_object`
//! - files and vector store files (the attached-context registry)
//! - assistants, threads, messages and runs (sessions)
//!
//! Runs are polled until they reach a terminal status. Overall run time is
//! bounded by the caller.

use std::sync::RwLock;
use std::time::Duration;

use askdb_config::ReasonerConfig;
use askdb_core::{ChatMessage, FragmentId, ReasonerError, ReasoningBackend, RemoteFile, Role, SessionId};
use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

const ASSISTANTS_BETA: &str = "assistants=v2";
const RUN_POLL_INTERVAL: Duration = Duration::from_millis(500);
const PAGE_LIMIT: u32 = 100;
const DEFAULT_RETRY_AFTER_SECS: u64 = 5;

const ASSISTANT_NAME: &str = "askdb";
const VECTOR_STORE_NAME: &str = "askdb data";

type BackendResult<T> = std::result::Result<T, ReasonerError>;

/// The OpenAI-backed [`ReasoningBackend`].
pub struct OpenAiBackend {
    base_url: String,
    api_key: String,
    model: String,
    client: reqwest::Client,
    assistant_id: RwLock<Option<String>>,
    vector_store_id: RwLock<Option<String>>,
}

impl OpenAiBackend {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> BackendResult<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| ReasonerError::NotConfigured(format!("HTTP client: {e}")))?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            model: model.into(),
            client,
            assistant_id: RwLock::new(None),
            vector_store_id: RwLock::new(None),
        })
    }

    /// Build from configuration. A missing API key is a configuration error.
    pub fn from_config(config: &ReasonerConfig) -> BackendResult<Self> {
        let api_key = config
            .api_key
            .clone()
            .ok_or_else(|| ReasonerError::NotConfigured("OPENAI_API_KEY is not set".into()))?;
        let backend = Self::new(&config.base_url, api_key, &config.model)?
            .with_assistant(config.assistant_id.clone())
            .with_vector_store(config.vector_store_id.clone());
        Ok(backend)
    }

    pub fn with_assistant(self, id: Option<String>) -> Self {
        Self {
            assistant_id: RwLock::new(id.filter(|s| !s.is_empty())),
            ..self
        }
    }

    pub fn with_vector_store(self, id: Option<String>) -> Self {
        Self {
            vector_store_id: RwLock::new(id.filter(|s| !s.is_empty())),
            ..self
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client
            .request(method, self.url(path))
            .bearer_auth(&self.api_key)
            .header("OpenAI-Beta", ASSISTANTS_BETA)
    }

    fn vector_store(&self) -> BackendResult<String> {
        self.vector_store_id
            .read()
            .map_err(|_| ReasonerError::NotConfigured("vector store lock poisoned".into()))?
            .clone()
            .ok_or_else(|| ReasonerError::NotConfigured("vector store not prepared".into()))
    }

    fn assistant(&self) -> BackendResult<String> {
        self.assistant_id
            .read()
            .map_err(|_| ReasonerError::NotConfigured("assistant lock poisoned".into()))?
            .clone()
            .ok_or_else(|| ReasonerError::NotConfigured("assistant not prepared".into()))
    }

    fn set_id(slot: &RwLock<Option<String>>, id: String) {
        if let Ok(mut guard) = slot.write() {
            *guard = Some(id);
        }
    }

    /// Send a request and decode the JSON body, mapping failures to
    /// [`ReasonerError`].
    async fn send(&self, request: RequestBuilder) -> BackendResult<Value> {
        let response = request.send().await.map_err(map_transport_error)?;
        let status = response.status();

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after_secs = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(DEFAULT_RETRY_AFTER_SECS);
            return Err(ReasonerError::RateLimited { retry_after_secs });
        }

        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(ReasonerError::AuthenticationFailed(
                "Invalid API key or insufficient permissions".into(),
            ));
        }

        if status == StatusCode::REQUEST_TIMEOUT {
            return Err(ReasonerError::Timeout("upstream returned 408".into()));
        }

        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), body = %error_body, "Reasoning engine returned error");
            return Err(ReasonerError::ApiError {
                status_code: status.as_u16(),
                message: error_body,
            });
        }

        response
            .json()
            .await
            .map_err(|e| ReasonerError::MalformedResponse(format!("Failed to parse response: {e}")))
    }

    /// Like [`send`](Self::send), but a 404 becomes `Ok(None)`.
    async fn send_optional(&self, request: RequestBuilder) -> BackendResult<Option<Value>> {
        match self.send(request).await {
            Ok(body) => Ok(Some(body)),
            Err(ReasonerError::ApiError { status_code: 404, .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn ensure_vector_store(&self) -> BackendResult<String> {
        let configured = self.vector_store().ok();
        if let Some(id) = configured {
            let found = self
                .send_optional(self.request(Method::GET, &format!("vector_stores/{id}")))
                .await?;
            if found.is_some() {
                return Ok(id);
            }
            warn!(vector_store_id = %id, "Configured vector store not found, creating a new one");
        }

        let body = self
            .send(
                self.request(Method::POST, "vector_stores")
                    .json(&json!({ "name": VECTOR_STORE_NAME })),
            )
            .await?;
        let id = string_field(&body, "id")?;
        info!(vector_store_id = %id, "Created vector store");
        Self::set_id(&self.vector_store_id, id.clone());
        Ok(id)
    }

    async fn ensure_assistant(&self, vector_store_id: &str) -> BackendResult<String> {
        let tool_resources = json!({ "file_search": { "vector_store_ids": [vector_store_id] } });

        if let Ok(id) = self.assistant() {
            let found = self
                .send_optional(self.request(Method::GET, &format!("assistants/{id}")))
                .await?;
            if found.is_some() {
                self.send(
                    self.request(Method::POST, &format!("assistants/{id}"))
                        .json(&json!({ "tool_resources": tool_resources })),
                )
                .await?;
                return Ok(id);
            }
            warn!(assistant_id = %id, "Configured assistant not found, creating a new one");
        }

        let body = self
            .send(self.request(Method::POST, "assistants").json(&json!({
                "name": ASSISTANT_NAME,
                "model": self.model,
                "tools": [{ "type": "file_search" }],
                "response_format": { "type": "json_object" },
                "tool_resources": tool_resources,
            })))
            .await?;
        let id = string_field(&body, "id")?;
        info!(assistant_id = %id, "Created assistant");
        Self::set_id(&self.assistant_id, id.clone());
        Ok(id)
    }

    async fn wait_for_run(&self, session: &SessionId, run_id: &str) -> BackendResult<()> {
        loop {
            let run: RunObject = serde_json::from_value(
                self.send(self.request(Method::GET, &format!("threads/{session}/runs/{run_id}")))
                    .await?,
            )
            .map_err(|e| ReasonerError::MalformedResponse(format!("run object: {e}")))?;

            match run.status.as_str() {
                "completed" => return Ok(()),
                "queued" | "in_progress" | "cancelling" => {
                    tokio::time::sleep(RUN_POLL_INTERVAL).await;
                }
                other => {
                    warn!(session = %session, run_id, status = other, "Run ended without completing");
                    return Err(ReasonerError::RunFailed {
                        status: other.to_string(),
                    });
                }
            }
        }
    }
}

fn map_transport_error(e: reqwest::Error) -> ReasonerError {
    if e.is_timeout() {
        ReasonerError::Timeout(e.to_string())
    } else {
        ReasonerError::Network(e.to_string())
    }
}

fn string_field(body: &Value, key: &str) -> BackendResult<String> {
    body.get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| ReasonerError::MalformedResponse(format!("missing '{key}' in response")))
}

fn to_api_messages(messages: &[ChatMessage]) -> Vec<Value> {
    messages
        .iter()
        .map(|m| json!({ "role": m.role.as_str(), "content": m.content }))
        .collect()
}

// --- API response types ---

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ListPage<T> {
    data: Vec<T>,
    #[serde(default)]
    has_more: bool,
    #[serde(default)]
    last_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FileObject {
    id: String,
    #[serde(default)]
    filename: String,
}

#[derive(Debug, Deserialize)]
struct IdObject {
    id: String,
}

#[derive(Debug, Deserialize)]
struct RunObject {
    #[serde(default)]
    id: String,
    status: String,
}

/// Runs in these states still hold the thread.
fn is_active_run(status: &str) -> bool {
    matches!(status, "queued" | "in_progress" | "requires_action")
}

#[derive(Debug, Deserialize)]
struct ThreadMessage {
    #[serde(default)]
    content: Vec<MessageContent>,
}

#[derive(Debug, Deserialize)]
struct MessageContent {
    #[serde(default)]
    text: Option<MessageText>,
}

#[derive(Debug, Deserialize)]
struct MessageText {
    value: String,
}

/// Text of the first text part of the newest message.
fn first_message_text(page: ListPage<ThreadMessage>) -> Option<String> {
    page.data
        .into_iter()
        .next()?
        .content
        .into_iter()
        .find_map(|c| c.text.map(|t| t.value))
}

#[async_trait]
impl ReasoningBackend for OpenAiBackend {
    fn name(&self) -> &str {
        "openai"
    }

    async fn prepare(&self) -> BackendResult<()> {
        let vector_store_id = self.ensure_vector_store().await?;
        let assistant_id = self.ensure_assistant(&vector_store_id).await?;
        info!(%assistant_id, %vector_store_id, "Reasoning backend prepared");
        Ok(())
    }

    async fn complete(&self, messages: &[ChatMessage]) -> BackendResult<String> {
        let body = json!({
            "model": self.model,
            "messages": to_api_messages(messages),
            "response_format": { "type": "json_object" },
        });

        debug!(model = %self.model, messages = messages.len(), "Sending completion request");

        let response: ChatResponse = serde_json::from_value(
            self.send(self.request(Method::POST, "chat/completions").json(&body))
                .await?,
        )
        .map_err(|e| ReasonerError::MalformedResponse(format!("completion: {e}")))?;

        let choice = response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ReasonerError::MalformedResponse("No choices in response".into()))?;

        Ok(choice.message.content.unwrap_or_default())
    }

    async fn create_session(&self) -> BackendResult<SessionId> {
        let body = self
            .send(self.request(Method::POST, "threads").json(&json!({})))
            .await?;
        let id = string_field(&body, "id")?;
        debug!(session = %id, "Created thread");
        Ok(SessionId::new(id))
    }

    async fn append_message(&self, session: &SessionId, role: Role, content: &str) -> BackendResult<()> {
        // Threads only take user and assistant messages.
        let role = match role {
            Role::Assistant => "assistant",
            Role::User | Role::System => "user",
        };
        self.send(
            self.request(Method::POST, &format!("threads/{session}/messages"))
                .json(&json!({ "role": role, "content": content })),
        )
        .await?;
        Ok(())
    }

    async fn run_session(&self, session: &SessionId, instructions: &str) -> BackendResult<String> {
        let assistant_id = self.assistant()?;
        let mut body = json!({ "assistant_id": assistant_id });
        if !instructions.is_empty() {
            body["instructions"] = json!(instructions);
        }

        let run: IdObject = serde_json::from_value(
            self.send(
                self.request(Method::POST, &format!("threads/{session}/runs"))
                    .json(&body),
            )
            .await?,
        )
        .map_err(|e| ReasonerError::MalformedResponse(format!("run object: {e}")))?;

        debug!(session = %session, run_id = %run.id, "Run started");
        self.wait_for_run(session, &run.id).await?;

        let page: ListPage<ThreadMessage> = serde_json::from_value(
            self.send(
                self.request(Method::GET, &format!("threads/{session}/messages"))
                    .query(&[("run_id", run.id.as_str()), ("order", "desc")]),
            )
            .await?,
        )
        .map_err(|e| ReasonerError::MalformedResponse(format!("message list: {e}")))?;

        first_message_text(page)
            .ok_or_else(|| ReasonerError::MalformedResponse("run produced no text message".into()))
    }

    async fn cancel_run(&self, session: &SessionId) -> BackendResult<()> {
        let page: ListPage<RunObject> = serde_json::from_value(
            self.send(
                self.request(Method::GET, &format!("threads/{session}/runs"))
                    .query(&[("limit", "1"), ("order", "desc")]),
            )
            .await?,
        )
        .map_err(|e| ReasonerError::MalformedResponse(format!("run list: {e}")))?;

        let Some(run) = page.data.into_iter().find(|r| is_active_run(&r.status)) else {
            return Ok(());
        };
        self.send(self.request(
            Method::POST,
            &format!("threads/{session}/runs/{}/cancel", run.id),
        ))
        .await?;
        info!(session = %session, run_id = %run.id, "Cancelled run");
        Ok(())
    }

    async fn delete_session(&self, session: &SessionId) -> BackendResult<()> {
        self.send_optional(self.request(Method::DELETE, &format!("threads/{session}")))
            .await?;
        Ok(())
    }

    async fn list_files(&self) -> BackendResult<Vec<RemoteFile>> {
        let page: ListPage<FileObject> = serde_json::from_value(
            self.send(self.request(Method::GET, "files").query(&[("purpose", "assistants")]))
                .await?,
        )
        .map_err(|e| ReasonerError::MalformedResponse(format!("file list: {e}")))?;

        Ok(page
            .data
            .into_iter()
            .map(|f| RemoteFile {
                id: FragmentId::new(f.id),
                name: f.filename,
            })
            .collect())
    }

    async fn upload_file(&self, name: &str, content: &str) -> BackendResult<FragmentId> {
        let part = reqwest::multipart::Part::bytes(content.as_bytes().to_vec()).file_name(name.to_string());
        let form = reqwest::multipart::Form::new()
            .text("purpose", "assistants")
            .part("file", part);

        let body = self
            .send(self.request(Method::POST, "files").multipart(form))
            .await?;
        let id = string_field(&body, "id")?;
        info!(file_id = %id, name, bytes = content.len(), "Uploaded file");
        Ok(FragmentId::new(id))
    }

    async fn delete_file(&self, id: &FragmentId) -> BackendResult<()> {
        self.send_optional(self.request(Method::DELETE, &format!("files/{id}")))
            .await?;
        Ok(())
    }

    async fn list_attached(&self) -> BackendResult<Vec<FragmentId>> {
        let vs = self.vector_store()?;
        let mut ids = Vec::new();
        let mut after: Option<String> = None;

        loop {
            let mut request = self
                .request(Method::GET, &format!("vector_stores/{vs}/files"))
                .query(&[("limit", PAGE_LIMIT)]);
            if let Some(cursor) = &after {
                request = request.query(&[("after", cursor.as_str())]);
            }

            let page: ListPage<IdObject> = serde_json::from_value(self.send(request).await?)
                .map_err(|e| ReasonerError::MalformedResponse(format!("vector store files: {e}")))?;

            ids.extend(page.data.into_iter().map(|f| FragmentId::new(f.id)));
            match page.last_id {
                Some(last) if page.has_more => after = Some(last),
                _ => break,
            }
        }

        Ok(ids)
    }

    async fn attach(&self, id: &FragmentId) -> BackendResult<()> {
        let vs = self.vector_store()?;
        self.send(
            self.request(Method::POST, &format!("vector_stores/{vs}/files"))
                .json(&json!({ "file_id": id.as_str() })),
        )
        .await?;
        Ok(())
    }

    async fn detach(&self, id: &FragmentId) -> BackendResult<()> {
        let vs = self.vector_store()?;
        self.send_optional(self.request(Method::DELETE, &format!("vector_stores/{vs}/files/{id}")))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constructor_trims_base_url() {
        let backend = OpenAiBackend::new("https://api.openai.com/v1/", "sk-test", "gpt-4.1-mini").unwrap();
        assert_eq!(backend.name(), "openai");
        assert_eq!(backend.url("/chat/completions"), "https://api.openai.com/v1/chat/completions");
    }

    #[test]
    fn from_config_requires_api_key() {
        let config = ReasonerConfig::default();
        assert!(matches!(
            OpenAiBackend::from_config(&config),
            Err(ReasonerError::NotConfigured(_))
        ));

        let config = ReasonerConfig {
            api_key: Some("sk-test".into()),
            assistant_id: Some("asst_1".into()),
            vector_store_id: Some(String::new()),
            ..ReasonerConfig::default()
        };
        let backend = OpenAiBackend::from_config(&config).unwrap();
        assert_eq!(backend.assistant().unwrap(), "asst_1");
        assert!(backend.vector_store().is_err());
    }

    #[test]
    fn message_conversion() {
        let messages = vec![ChatMessage::system("rules"), ChatMessage::user("hello")];
        let api = to_api_messages(&messages);
        assert_eq!(api.len(), 2);
        assert_eq!(api[0]["role"], "system");
        assert_eq!(api[1]["content"], "hello");
    }

    #[test]
    fn parse_completion_response() {
        let data = r#"{"id":"c1","choices":[{"index":0,"message":{"role":"assistant","content":"{\"response\":\"hi\"}"}}]}"#;
        let parsed: ChatResponse = serde_json::from_str(data).unwrap();
        assert_eq!(parsed.choices[0].message.content.as_deref(), Some(r#"{"response":"hi"}"#));
    }

    #[test]
    fn parse_thread_messages_takes_first_text() {
        let data = r#"{
            "data": [
                {"id": "m2", "content": [{"type": "text", "text": {"value": "{\"sql_query\":\"SELECT 1\"}", "annotations": []}}]},
                {"id": "m1", "content": [{"type": "text", "text": {"value": "older"}}]}
            ],
            "has_more": false
        }"#;
        let page: ListPage<ThreadMessage> = serde_json::from_str(data).unwrap();
        assert_eq!(first_message_text(page).as_deref(), Some(r#"{"sql_query":"SELECT 1"}"#));
    }

    #[test]
    fn parse_empty_thread_messages() {
        let page: ListPage<ThreadMessage> = serde_json::from_str(r#"{"data": []}"#).unwrap();
        assert!(first_message_text(page).is_none());
    }

    #[test]
    fn only_live_runs_are_cancelled() {
        let data = r#"{"data":[{"id":"run_1","status":"in_progress"}],"has_more":false}"#;
        let page: ListPage<RunObject> = serde_json::from_str(data).unwrap();
        assert_eq!(page.data[0].id, "run_1");
        assert!(is_active_run(&page.data[0].status));
        assert!(is_active_run("queued"));
        assert!(!is_active_run("completed"));
        assert!(!is_active_run("cancelling"));
        assert!(!is_active_run("failed"));
    }

    #[test]
    fn parse_vector_store_page_cursor() {
        let data = r#"{"data":[{"id":"file-1"},{"id":"file-2"}],"has_more":true,"last_id":"file-2"}"#;
        let page: ListPage<IdObject> = serde_json::from_str(data).unwrap();
        assert_eq!(page.data.len(), 2);
        assert!(page.has_more);
        assert_eq!(page.last_id.as_deref(), Some("file-2"));
    }
}
