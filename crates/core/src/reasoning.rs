//! ReasoningBackend trait: the raw upstream reasoning engine.
//!
//! A backend exposes three groups of primitives:
//! - stateless chat completion (always asked for a JSON object)
//! - stateful sessions ("threads") that run against attached files
//! - the file registry and the attached-context registry behind those runs
//!
//! Retries, concurrency limits and timeouts are not the backend's concern;
//! they are layered on top by the reasoner.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::context::FragmentId;
use crate::error::ReasonerError;
use crate::message::{ChatMessage, Role};

/// Identifier of an upstream session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A file as listed by the engine's file registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFile {
    pub id: FragmentId,
    pub name: String,
}

type BackendResult<T> = std::result::Result<T, ReasonerError>;

#[async_trait]
pub trait ReasoningBackend: Send + Sync {
    /// Backend name for logs (e.g., "openai", "scripted").
    fn name(&self) -> &str;

    /// Make sure the session assistant and the attached-context registry exist.
    async fn prepare(&self) -> BackendResult<()>;

    /// One stateless completion. Returns the raw text of the first choice.
    async fn complete(&self, messages: &[ChatMessage]) -> BackendResult<String>;

    // --- Sessions ---

    async fn create_session(&self) -> BackendResult<SessionId>;

    async fn append_message(&self, session: &SessionId, role: Role, content: &str) -> BackendResult<()>;

    /// Run the session against the attached context and return the text of
    /// the newest message the run produced.
    async fn run_session(&self, session: &SessionId, instructions: &str) -> BackendResult<String>;

    /// Cancel the session's latest run if it is still active. A session with
    /// no active run is left alone.
    async fn cancel_run(&self, session: &SessionId) -> BackendResult<()>;

    async fn delete_session(&self, session: &SessionId) -> BackendResult<()>;

    // --- File registry ---

    async fn list_files(&self) -> BackendResult<Vec<RemoteFile>>;

    async fn upload_file(&self, name: &str, content: &str) -> BackendResult<FragmentId>;

    async fn delete_file(&self, id: &FragmentId) -> BackendResult<()>;

    // --- Attached-context registry ---

    async fn list_attached(&self) -> BackendResult<Vec<FragmentId>>;

    async fn attach(&self, id: &FragmentId) -> BackendResult<()>;

    async fn detach(&self, id: &FragmentId) -> BackendResult<()>;
}
