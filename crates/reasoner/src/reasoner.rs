//! The Reasoner: retries, concurrency limits and mode selection on top of a
//! raw [`ReasoningBackend`].
//!
//! Every generation call (direct completion or session run) holds a permit
//! from a process-wide pool for its duration, is bounded by a timeout, and is
//! retried with backoff when it fails transiently. Session bookkeeping calls
//! are retried and bounded but take no permit.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use askdb_config::{BudgetConfig, ReasonerConfig};
use askdb_core::{
    ChatMessage, Error, ExternalContextStore, FragmentError, FragmentId, History, ReasonerError,
    ReasoningBackend, Role,
};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::partition::{Fragment, FragmentScope, Partition, PayloadPartitioner};
use crate::retry::{RetryPolicy, with_retry};
use crate::session::Session;

/// Tunables for a [`Reasoner`].
#[derive(Debug, Clone)]
pub struct ReasonerSettings {
    pub concurrency_limit: usize,
    pub retry: RetryPolicy,
    pub call_timeout: Duration,
    pub run_timeout: Duration,
    pub data_budget: usize,
}

impl Default for ReasonerSettings {
    fn default() -> Self {
        Self::from_config(&ReasonerConfig::default(), &BudgetConfig::default())
    }
}

impl ReasonerSettings {
    pub fn from_config(reasoner: &ReasonerConfig, budget: &BudgetConfig) -> Self {
        Self {
            concurrency_limit: reasoner.concurrency_limit.max(1),
            retry: RetryPolicy::new(
                reasoner.max_attempts,
                Duration::from_millis(reasoner.backoff_base_ms),
            ),
            call_timeout: Duration::from_secs(reasoner.timeout_secs),
            run_timeout: Duration::from_secs(reasoner.run_timeout_secs),
            data_budget: budget.data_budget(),
        }
    }
}

/// One reasoning step: the data fragments it needs plus the user turn.
pub struct ReasoningStep<'a> {
    pub name: &'static str,
    pub fragments: Vec<Fragment>,
    pub message: &'a str,
    pub history: &'a History,
}

pub struct Reasoner {
    backend: Arc<dyn ReasoningBackend>,
    context: Arc<dyn ExternalContextStore>,
    partitioner: PayloadPartitioner,
    retry: RetryPolicy,
    permits: Arc<Semaphore>,
    call_timeout: Duration,
    run_timeout: Duration,
}

impl Reasoner {
    pub fn new(
        backend: Arc<dyn ReasoningBackend>,
        context: Arc<dyn ExternalContextStore>,
        settings: ReasonerSettings,
    ) -> Self {
        Self {
            backend,
            context,
            partitioner: PayloadPartitioner::new(settings.data_budget),
            retry: settings.retry,
            permits: Arc::new(Semaphore::new(settings.concurrency_limit.max(1))),
            call_timeout: settings.call_timeout,
            run_timeout: settings.run_timeout,
        }
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    pub fn partitioner(&self) -> &PayloadPartitioner {
        &self.partitioner
    }

    /// Prepare the backend and start from an empty attached context.
    pub async fn init(&self) -> Result<(), Error> {
        with_retry(&self.retry, ReasonerError::is_transient, || {
            self.bounded(self.call_timeout, self.backend.prepare())
        })
        .await?;
        self.context.sync().await?;
        info!(backend = self.backend.name(), "Reasoner initialized");
        Ok(())
    }

    /// Stateless completion: history, then instructions, then the user turn.
    pub async fn complete_direct(
        &self,
        prompt: &str,
        message: &str,
        history: &History,
    ) -> Result<String, ReasonerError> {
        let mut messages = history.to_messages();
        messages.push(ChatMessage::system(prompt));
        messages.push(ChatMessage::user(message));

        debug!(messages = messages.len(), prompt_chars = prompt.len(), "Direct completion");

        with_retry(&self.retry, ReasonerError::is_transient, || {
            self.generate(self.call_timeout, self.backend.complete(&messages))
        })
        .await
    }

    /// Session completion against the attached context.
    ///
    /// Opens the session when needed, replays `history` once per session,
    /// appends the user turn, then runs with `instructions`.
    pub async fn complete_with_session(
        &self,
        session: &mut Session,
        instructions: &str,
        message: &str,
        history: &History,
        fragment_ids: &[FragmentId],
    ) -> Result<String, ReasonerError> {
        let id = match session.id.clone() {
            Some(id) => id,
            None => {
                let id = with_retry(&self.retry, ReasonerError::is_transient, || {
                    self.bounded(self.call_timeout, self.backend.create_session())
                })
                .await?;
                info!(session = %id, "Opened reasoning session");
                session.id = Some(id.clone());
                session.history_replayed = false;
                id
            }
        };

        if !session.history_replayed {
            let replay = history.to_messages();
            debug!(session = %id, messages = replay.len(), "Replaying history");
            for msg in &replay {
                self.append(&id, msg.role, &msg.content).await?;
            }
            session.history_replayed = true;
        }

        self.append(&id, Role::User, message).await?;

        let attached = self.context.attached().await;
        for fragment_id in fragment_ids {
            if !attached.iter().any(|f| &f.id == fragment_id) {
                warn!(session = %id, file_id = %fragment_id, "Fragment is not attached to the run context");
            }
        }

        with_retry(&self.retry, ReasonerError::is_transient, || self.run_once(&id, instructions)).await
    }

    /// One run attempt. A failed attempt may leave its run active upstream,
    /// and a thread accepts one active run at a time, so it is cancelled
    /// before the error is returned.
    async fn run_once(&self, session: &askdb_core::SessionId, instructions: &str) -> Result<String, ReasonerError> {
        let outcome = self
            .generate(self.run_timeout, self.backend.run_session(session, instructions))
            .await;
        if let Err(e) = &outcome {
            debug!(session = %session, error = %e, "Run attempt failed, cancelling it");
            if let Err(cancel) = self
                .bounded(self.call_timeout, self.backend.cancel_run(session))
                .await
            {
                warn!(session = %session, error = %cancel, "Failed to cancel run");
            }
        }
        outcome
    }

    pub async fn create_or_reuse_fragment(&self, name: &str, content: &str) -> Result<FragmentId, FragmentError> {
        self.context.create_or_reuse(name, content).await
    }

    pub async fn delete_fragment(&self, id: &FragmentId) -> Result<(), FragmentError> {
        self.context.delete(id).await
    }

    /// Delete the fragment stored under `name`, if there is one.
    pub async fn discard_fragment(&self, name: &str) -> Result<Option<FragmentId>, FragmentError> {
        self.context.delete_by_name(name).await
    }

    /// Close the session if it was opened. The session is reset either way.
    pub async fn close_session(&self, session: &mut Session) -> Result<(), ReasonerError> {
        if let Some(id) = session.reset() {
            self.bounded(self.call_timeout, self.backend.delete_session(&id))
                .await?;
            info!(session = %id, "Closed reasoning session");
        }
        Ok(())
    }

    /// Run one reasoning step.
    ///
    /// Partitions the fragments, renders the prompt from the partition,
    /// picks direct or session mode, and deletes the step-scoped fragments
    /// before and after the call. Cleanup failures are only logged.
    pub async fn invoke<F>(&self, step: ReasoningStep<'_>, session: &mut Session, render: F) -> Result<String, Error>
    where
        F: FnOnce(&Partition) -> String,
    {
        self.discard_step_fragments(&step).await;

        let outcome = match self
            .partitioner
            .partition(&step.fragments, self.context.as_ref())
            .await
        {
            Err(e) => {
                warn!(step = step.name, error = %e, "Could not build reasoning step");
                Err(Error::Fragment(e))
            }
            Ok(partition) => {
                let prompt = render(&partition);
                if partition.any_external() {
                    info!(step = step.name, external = partition.external_ids().len(), "Invoking in session mode");
                    self.complete_with_session(
                        session,
                        &prompt,
                        step.message,
                        step.history,
                        &partition.external_ids(),
                    )
                    .await
                    .map_err(Error::from)
                } else {
                    info!(step = step.name, "Invoking in direct mode");
                    self.complete_direct(&prompt, step.message, step.history)
                        .await
                        .map_err(Error::from)
                }
            }
        };

        self.discard_step_fragments(&step).await;
        outcome
    }

    async fn discard_step_fragments(&self, step: &ReasoningStep<'_>) {
        for fragment in step.fragments.iter().filter(|f| f.scope == FragmentScope::Step) {
            if let Err(e) = self.context.delete_by_name(&fragment.stored_name).await {
                warn!(step = step.name, fragment = %fragment.stored_name, error = %e, "Failed to delete step fragment");
            }
        }
    }

    async fn append(&self, session: &askdb_core::SessionId, role: Role, content: &str) -> Result<(), ReasonerError> {
        with_retry(&self.retry, ReasonerError::is_transient, || {
            self.bounded(self.call_timeout, self.backend.append_message(session, role, content))
        })
        .await
    }

    /// A generation call: permit first, then the timeout.
    async fn generate<T, Fut>(&self, limit: Duration, call: Fut) -> Result<T, ReasonerError>
    where
        Fut: Future<Output = Result<T, ReasonerError>>,
    {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| ReasonerError::NotConfigured("concurrency pool closed".into()))?;
        self.bounded(limit, call).await
    }

    async fn bounded<T, Fut>(&self, limit: Duration, call: Fut) -> Result<T, ReasonerError>
    where
        Fut: Future<Output = Result<T, ReasonerError>>,
    {
        match tokio::time::timeout(limit, call).await {
            Ok(result) => result,
            Err(_) => Err(ReasonerError::Timeout(format!(
                "no response within {}s",
                limit.as_secs()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fragments::RemoteContextStore;
    use crate::scripted::{BackendCall, ScriptedBackend};
    use askdb_core::Turn;

    fn reasoner(backend: &Arc<ScriptedBackend>, settings: ReasonerSettings) -> Reasoner {
        let raw: Arc<dyn ReasoningBackend> = backend.clone();
        let context = Arc::new(RemoteContextStore::new(raw.clone()));
        Reasoner::new(raw, context, settings)
    }

    fn small_budget(budget: usize) -> ReasonerSettings {
        ReasonerSettings {
            data_budget: budget,
            ..ReasonerSettings::default()
        }
    }

    fn history() -> History {
        History::new(vec![Turn::new("earlier question", "earlier answer")])
    }

    #[tokio::test]
    async fn direct_mode_orders_history_system_user() {
        let backend = Arc::new(ScriptedBackend::with_replies([r#"{"response":"ok"}"#]));
        let r = reasoner(&backend, ReasonerSettings::default());

        let out = r.complete_direct("RULES", "question", &history()).await.unwrap();
        assert_eq!(out, r#"{"response":"ok"}"#);

        let sent = &backend.completions()[0];
        let roles: Vec<Role> = sent.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::User, Role::Assistant, Role::System, Role::User]);
        assert_eq!(sent[2].content, "RULES");
        assert_eq!(sent[3].content, "question");
    }

    #[tokio::test]
    async fn invoke_inlines_small_fragments() {
        let backend = Arc::new(ScriptedBackend::with_replies(["{}"]));
        let r = reasoner(&backend, ReasonerSettings::default());
        let mut session = Session::new();
        let h = History::empty();

        let step = ReasoningStep {
            name: "verdict",
            fragments: vec![Fragment::text("db_schema.txt", "Table: machines")],
            message: "how many?",
            history: &h,
        };
        r.invoke(step, &mut session, |p| format!("schema: {}", p.render_or("db_schema.txt", "")))
            .await
            .unwrap();

        assert!(!session.is_open());
        assert_eq!(backend.completions()[0][0].content, "schema: Table: machines");
        assert!(backend.uploads().is_empty());
    }

    #[tokio::test]
    async fn invoke_uses_session_when_fragment_externalized() {
        let backend = Arc::new(ScriptedBackend::with_replies(["{}", "{}"]));
        let r = reasoner(&backend, small_budget(10));
        let mut session = Session::new();
        let h = history();

        for _ in 0..2 {
            let step = ReasoningStep {
                name: "verdict",
                fragments: vec![Fragment::text("db_schema.txt", "a schema far longer than ten")],
                message: "how many?",
                history: &h,
            };
            r.invoke(step, &mut session, |p| p.render_or("db_schema.txt", "")).await.unwrap();
        }

        assert!(session.is_open());
        assert!(session.history_replayed());
        assert_eq!(backend.sessions_created(), 1);
        assert_eq!(backend.uploads().len(), 1);

        let runs = backend.runs();
        assert_eq!(runs.len(), 2);
        assert!(runs[0].starts_with("In the file with id: file-"));

        // history once (2 messages) plus the user turn per run
        let appends = backend
            .calls()
            .into_iter()
            .filter(|c| matches!(c, BackendCall::Append { .. }))
            .count();
        assert_eq!(appends, 4);

        assert_eq!(backend.runs_cancelled(), 0);

        r.close_session(&mut session).await.unwrap();
        assert!(!session.is_open());
        assert_eq!(backend.sessions_deleted(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_run_is_cancelled_before_retry() {
        let backend = Arc::new(ScriptedBackend::new());
        backend.push_error(ReasonerError::Timeout("poll timed out".into()));
        backend.push_reply(r#"{"response":"ok"}"#);
        let r = reasoner(&backend, ReasonerSettings::default());
        let mut session = Session::new();

        let out = r
            .complete_with_session(&mut session, "rules", "q", &History::empty(), &[])
            .await
            .unwrap();
        assert_eq!(out, r#"{"response":"ok"}"#);

        let calls = backend.calls();
        let order: Vec<&str> = calls
            .iter()
            .filter_map(|c| match c {
                BackendCall::Run { .. } => Some("run"),
                BackendCall::CancelRun(_) => Some("cancel"),
                _ => None,
            })
            .collect();
        assert_eq!(order, vec!["run", "cancel", "run"]);
    }

    #[tokio::test]
    async fn non_transient_run_failure_is_cancelled_once() {
        let backend = Arc::new(ScriptedBackend::new());
        backend.push_error(ReasonerError::RunFailed { status: "failed".into() });
        let r = reasoner(&backend, ReasonerSettings::default());
        let mut session = Session::new();

        let err = r
            .complete_with_session(&mut session, "rules", "q", &History::empty(), &[])
            .await
            .unwrap_err();
        assert!(matches!(err, ReasonerError::RunFailed { .. }));
        assert_eq!(backend.runs().len(), 1);
        assert_eq!(backend.runs_cancelled(), 1);
    }

    #[tokio::test]
    async fn step_scoped_fragments_are_deleted_after_the_call() {
        let backend = Arc::new(ScriptedBackend::with_replies(["{}"]));
        let r = reasoner(&backend, small_budget(5));
        let mut session = Session::new();
        let h = History::empty();

        let step = ReasoningStep {
            name: "compose",
            fragments: vec![Fragment::text("result.json", "[1,2,3,4,5,6]").scoped_to_step("r1")],
            message: "q",
            history: &h,
        };
        r.invoke(step, &mut session, |p| p.render_or("result.json", "")).await.unwrap();

        assert_eq!(backend.uploads(), vec!["result.step-r1.json".to_string()]);
        assert!(backend.files().is_empty());
        assert!(backend.attached_ids().is_empty());
    }

    #[tokio::test]
    async fn fragment_failure_aborts_step_before_generation() {
        let backend = Arc::new(ScriptedBackend::new());
        backend.fail_uploads(true);
        let r = reasoner(&backend, small_budget(1));
        let mut session = Session::new();
        let h = History::empty();

        let step = ReasoningStep {
            name: "verdict",
            fragments: vec![Fragment::text("db_schema.txt", "too long")],
            message: "q",
            history: &h,
        };
        let err = r.invoke(step, &mut session, |_| String::new()).await.unwrap_err();
        assert!(matches!(err, Error::Fragment(_)));
        assert_eq!(backend.generation_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_exhaust_after_three_attempts() {
        let backend = Arc::new(ScriptedBackend::new());
        for _ in 0..3 {
            backend.push_error(ReasonerError::RateLimited { retry_after_secs: 0 });
        }
        let r = reasoner(&backend, ReasonerSettings::default());

        let err = r.complete_direct("p", "m", &History::empty()).await.unwrap_err();
        assert!(matches!(err, ReasonerError::Exhausted { attempts: 3, .. }));
        assert_eq!(backend.generation_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_calls_time_out_and_are_retried() {
        let backend = Arc::new(ScriptedBackend::new().with_latency(Duration::from_secs(60)));
        let r = reasoner(&backend, ReasonerSettings::default());

        let err = r.complete_direct("p", "m", &History::empty()).await.unwrap_err();
        match err {
            ReasonerError::Exhausted { attempts, last } => {
                assert_eq!(attempts, 3);
                assert!(matches!(*last, ReasonerError::Timeout(_)));
            }
            other => panic!("expected Exhausted, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn generation_calls_share_a_bounded_pool() {
        let backend = Arc::new(ScriptedBackend::new().with_latency(Duration::from_millis(100)));
        let r = Arc::new(reasoner(&backend, ReasonerSettings::default()));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let r = r.clone();
                tokio::spawn(async move { r.complete_direct("p", "m", &History::empty()).await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(backend.generation_count(), 8);
        assert_eq!(backend.max_in_flight(), 3);
    }

    #[tokio::test]
    async fn init_prepares_and_detaches() {
        let backend = Arc::new(ScriptedBackend::new().with_file("db_schema.txt", "file-x").with_attached("file-x"));
        let r = reasoner(&backend, ReasonerSettings::default());

        r.init().await.unwrap();
        assert_eq!(backend.calls()[0], BackendCall::Prepare);
        assert!(backend.attached_ids().is_empty());
    }

    #[tokio::test]
    async fn close_without_session_is_noop() {
        let backend = Arc::new(ScriptedBackend::new());
        let r = reasoner(&backend, ReasonerSettings::default());
        let mut session = Session::new();
        r.close_session(&mut session).await.unwrap();
        assert_eq!(backend.sessions_deleted(), 0);
    }
}
