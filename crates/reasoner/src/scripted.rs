//! Scripted in-memory reasoning backend.
//!
//! Replies are consumed in order by both completion and session runs, and
//! every call is recorded. File and attachment registries are kept in memory.
//! Useful for testing and for running the pipeline without network access.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use askdb_core::{ChatMessage, FragmentId, ReasonerError, ReasoningBackend, RemoteFile, Role, SessionId};
use async_trait::async_trait;

/// Reply used once the script runs dry: an empty verdict.
const EXHAUSTED_REPLY: &str = "{}";

/// One recorded backend call.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendCall {
    Prepare,
    Complete(Vec<ChatMessage>),
    CreateSession(SessionId),
    Append {
        session: SessionId,
        role: Role,
        content: String,
    },
    Run {
        session: SessionId,
        instructions: String,
    },
    CancelRun(SessionId),
    DeleteSession(SessionId),
    Upload {
        name: String,
        content: String,
    },
    DeleteFile(FragmentId),
    Attach(FragmentId),
    Detach(FragmentId),
}

impl BackendCall {
    pub fn is_generation(&self) -> bool {
        matches!(self, BackendCall::Complete(_) | BackendCall::Run { .. })
    }
}

#[derive(Default)]
pub struct ScriptedBackend {
    replies: Mutex<VecDeque<Result<String, ReasonerError>>>,
    calls: Mutex<Vec<BackendCall>>,
    files: Mutex<Vec<RemoteFile>>,
    attached: Mutex<Vec<FragmentId>>,
    next_id: AtomicUsize,
    latency: Option<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    fail_uploads: AtomicBool,
    fail_deletes: AtomicBool,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// A backend that answers with `replies`, in order.
    pub fn with_replies<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let backend = Self::new();
        for reply in replies {
            backend.push_reply(reply);
        }
        backend
    }

    /// Every generation call sleeps this long while holding its slot.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Seed a file that already exists upstream.
    pub fn with_file(self, name: &str, id: &str) -> Self {
        lock(&self.files).push(RemoteFile {
            id: FragmentId::new(id),
            name: name.to_string(),
        });
        self
    }

    /// Seed an attachment that already exists upstream.
    pub fn with_attached(self, id: &str) -> Self {
        lock(&self.attached).push(FragmentId::new(id));
        self
    }

    pub fn push_reply(&self, reply: impl Into<String>) {
        lock(&self.replies).push_back(Ok(reply.into()));
    }

    pub fn push_error(&self, error: ReasonerError) {
        lock(&self.replies).push_back(Err(error));
    }

    pub fn fail_uploads(&self, fail: bool) {
        self.fail_uploads.store(fail, Ordering::SeqCst);
    }

    pub fn fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<BackendCall> {
        lock(&self.calls).clone()
    }

    /// Number of completion and run calls made.
    pub fn generation_count(&self) -> usize {
        lock(&self.calls).iter().filter(|c| c.is_generation()).count()
    }

    /// Messages of every direct completion, in call order.
    pub fn completions(&self) -> Vec<Vec<ChatMessage>> {
        lock(&self.calls)
            .iter()
            .filter_map(|c| match c {
                BackendCall::Complete(messages) => Some(messages.clone()),
                _ => None,
            })
            .collect()
    }

    /// Instructions of every session run, in call order.
    pub fn runs(&self) -> Vec<String> {
        lock(&self.calls)
            .iter()
            .filter_map(|c| match c {
                BackendCall::Run { instructions, .. } => Some(instructions.clone()),
                _ => None,
            })
            .collect()
    }

    /// Names of every uploaded file, in call order.
    pub fn uploads(&self) -> Vec<String> {
        lock(&self.calls)
            .iter()
            .filter_map(|c| match c {
                BackendCall::Upload { name, .. } => Some(name.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn sessions_created(&self) -> usize {
        lock(&self.calls)
            .iter()
            .filter(|c| matches!(c, BackendCall::CreateSession(_)))
            .count()
    }

    pub fn runs_cancelled(&self) -> usize {
        lock(&self.calls)
            .iter()
            .filter(|c| matches!(c, BackendCall::CancelRun(_)))
            .count()
    }

    pub fn sessions_deleted(&self) -> usize {
        lock(&self.calls)
            .iter()
            .filter(|c| matches!(c, BackendCall::DeleteSession(_)))
            .count()
    }

    /// Files currently present upstream.
    pub fn files(&self) -> Vec<RemoteFile> {
        lock(&self.files).clone()
    }

    /// Ids currently attached upstream.
    pub fn attached_ids(&self) -> Vec<FragmentId> {
        lock(&self.attached).clone()
    }

    /// Highest number of generation calls observed in flight at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn record(&self, call: BackendCall) {
        lock(&self.calls).push(call);
    }

    fn next_id(&self, prefix: &str) -> String {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        format!("{prefix}-{n}")
    }

    async fn generate(&self) -> Result<String, ReasonerError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let reply = lock(&self.replies)
            .pop_front()
            .unwrap_or_else(|| Ok(EXHAUSTED_REPLY.to_string()));

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        reply
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl ReasoningBackend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn prepare(&self) -> Result<(), ReasonerError> {
        self.record(BackendCall::Prepare);
        Ok(())
    }

    async fn complete(&self, messages: &[ChatMessage]) -> Result<String, ReasonerError> {
        self.record(BackendCall::Complete(messages.to_vec()));
        self.generate().await
    }

    async fn create_session(&self) -> Result<SessionId, ReasonerError> {
        let id = SessionId::new(self.next_id("thread"));
        self.record(BackendCall::CreateSession(id.clone()));
        Ok(id)
    }

    async fn append_message(&self, session: &SessionId, role: Role, content: &str) -> Result<(), ReasonerError> {
        self.record(BackendCall::Append {
            session: session.clone(),
            role,
            content: content.to_string(),
        });
        Ok(())
    }

    async fn run_session(&self, session: &SessionId, instructions: &str) -> Result<String, ReasonerError> {
        self.record(BackendCall::Run {
            session: session.clone(),
            instructions: instructions.to_string(),
        });
        self.generate().await
    }

    async fn cancel_run(&self, session: &SessionId) -> Result<(), ReasonerError> {
        self.record(BackendCall::CancelRun(session.clone()));
        Ok(())
    }

    async fn delete_session(&self, session: &SessionId) -> Result<(), ReasonerError> {
        self.record(BackendCall::DeleteSession(session.clone()));
        Ok(())
    }

    async fn list_files(&self) -> Result<Vec<RemoteFile>, ReasonerError> {
        Ok(self.files())
    }

    async fn upload_file(&self, name: &str, content: &str) -> Result<FragmentId, ReasonerError> {
        self.record(BackendCall::Upload {
            name: name.to_string(),
            content: content.to_string(),
        });
        if self.fail_uploads.load(Ordering::SeqCst) {
            return Err(ReasonerError::ApiError {
                status_code: 500,
                message: "upload rejected".into(),
            });
        }
        let id = FragmentId::new(self.next_id("file"));
        lock(&self.files).push(RemoteFile {
            id: id.clone(),
            name: name.to_string(),
        });
        Ok(id)
    }

    async fn delete_file(&self, id: &FragmentId) -> Result<(), ReasonerError> {
        self.record(BackendCall::DeleteFile(id.clone()));
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(ReasonerError::Network("delete failed".into()));
        }
        lock(&self.files).retain(|f| &f.id != id);
        lock(&self.attached).retain(|a| a != id);
        Ok(())
    }

    async fn list_attached(&self) -> Result<Vec<FragmentId>, ReasonerError> {
        Ok(self.attached_ids())
    }

    async fn attach(&self, id: &FragmentId) -> Result<(), ReasonerError> {
        self.record(BackendCall::Attach(id.clone()));
        let mut attached = lock(&self.attached);
        if !attached.contains(id) {
            attached.push(id.clone());
        }
        Ok(())
    }

    async fn detach(&self, id: &FragmentId) -> Result<(), ReasonerError> {
        self.record(BackendCall::Detach(id.clone()));
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(ReasonerError::Network("detach failed".into()));
        }
        lock(&self.attached).retain(|a| a != id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn replies_are_consumed_in_order() {
        let backend = ScriptedBackend::with_replies(["first", "second"]);
        assert_eq!(backend.complete(&[]).await.unwrap(), "first");
        let session = backend.create_session().await.unwrap();
        assert_eq!(backend.run_session(&session, "rules").await.unwrap(), "second");
        assert_eq!(backend.complete(&[]).await.unwrap(), EXHAUSTED_REPLY);
        assert_eq!(backend.generation_count(), 3);
        assert_eq!(backend.runs(), vec!["rules".to_string()]);
    }

    #[tokio::test]
    async fn scripted_errors_surface() {
        let backend = ScriptedBackend::new();
        backend.push_error(ReasonerError::RateLimited { retry_after_secs: 1 });
        assert!(matches!(
            backend.complete(&[]).await,
            Err(ReasonerError::RateLimited { .. })
        ));
    }

    #[tokio::test]
    async fn file_registry_round_trip() {
        let backend = ScriptedBackend::new();
        let id = backend.upload_file("db_schema.txt", "Table: t").await.unwrap();
        backend.attach(&id).await.unwrap();
        assert_eq!(backend.attached_ids(), vec![id.clone()]);

        backend.delete_file(&id).await.unwrap();
        assert!(backend.files().is_empty());
        assert!(backend.attached_ids().is_empty());
    }
}
