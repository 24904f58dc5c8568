//! The resolution pipeline: one user message in, one textual answer out.
//!
//! A resolution is a small state machine:
//!
//! ```text
//! Start ─► SchemaCheck ─► FirstVerdict ─┬─► Query ─┬─► Compose ─────► Done
//!   │           │                       │          └─► NoResult ────► Done
//!   │           │                       ├─► Disambiguate ─┬─► NoResult
//!   │           │                       │                 └─► SecondVerdict ─► Query | Done | Fallback
//!   │           │                       ├─► Done (direct answer)
//!   │           │                       └─► Fallback ───────────────► Done
//!   └───────────┴─► Unavailable ────────────────────────────────────► Done
//! ```
//!
//! Every edge moves forward and `Query` is entered at most twice, so every
//! resolution terminates. The session and the resolution-scoped fragments are
//! released on every exit path, including a resolution future dropped before
//! it finished.

use std::sync::Arc;

use askdb_config::{BudgetConfig, ReasonerConfig};
use askdb_core::{
    Decision, History, Inquiry, ParsedVerdict, QueryExecutor, Result, RowSet, SchemaProvider,
    StaticTables,
};
use askdb_reasoner::partition::step_scoped_name;
use askdb_reasoner::{Fragment, Partition, Reasoner, ReasoningStep, Session};
use tracing::{Instrument, debug, info, info_span, warn};
use uuid::Uuid;

use crate::prompts::{PromptKind, Prompts};

/// Schema placeholder when the store cannot describe itself.
pub const SCHEMA_UNAVAILABLE: &str = "unavailable";

pub const SCHEMA_FRAGMENT: &str = "db_schema.txt";
pub const RESULT_FRAGMENT: &str = "result.json";
pub const PREVIOUS_RESULT_FRAGMENT: &str = "previous_result.json";

const NO_QUERY: &str = "none";
const TABLE_SEPARATOR: &str = "\n---\n";

#[derive(Debug)]
enum State {
    Start,
    SchemaCheck,
    FirstVerdict,
    Query(String),
    Disambiguate(String),
    SecondVerdict { sql: String, rows: RowSet },
    Compose { sql: String, rows: RowSet },
    NoResult(String),
    Fallback,
    Unavailable,
    Done(String),
}

impl State {
    fn label(&self) -> &'static str {
        match self {
            State::Start => "start",
            State::SchemaCheck => "schema_check",
            State::FirstVerdict => "first_verdict",
            State::Query(_) => "query",
            State::Disambiguate(_) => "disambiguate",
            State::SecondVerdict { .. } => "second_verdict",
            State::Compose { .. } => "compose",
            State::NoResult(_) => "no_result",
            State::Fallback => "fallback",
            State::Unavailable => "unavailable",
            State::Done(_) => "done",
        }
    }
}

/// Everything one resolution owns.
struct Resolution<'a> {
    inquiry: &'a Inquiry,
    lease: Lease,
    schema: Option<String>,
    static_tables: StaticTables,
}

/// Upstream state held by one resolution: its session and the fragments
/// stored under its tag.
///
/// [`Lease::release`] frees it in line. A lease dropped unreleased (the
/// resolution future was cancelled) spawns the release onto the runtime.
struct Lease {
    reasoner: Arc<Reasoner>,
    tag: String,
    session: Session,
    released: bool,
}

impl Lease {
    fn new(reasoner: Arc<Reasoner>, tag: String) -> Self {
        Self {
            reasoner,
            tag,
            session: Session::new(),
            released: false,
        }
    }

    async fn release(&mut self) {
        release(&self.reasoner, &mut self.session, &self.tag).await;
        self.released = true;
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(id = %self.tag, "Resolution dropped outside a runtime, leaving its fragments to the next sync");
            return;
        };

        warn!(id = %self.tag, "Resolution dropped before finishing, releasing in the background");
        let reasoner = self.reasoner.clone();
        let tag = std::mem::take(&mut self.tag);
        let mut session = std::mem::take(&mut self.session);
        let span = info_span!("resolution", id = %tag);
        runtime.spawn(
            async move {
                release(&reasoner, &mut session, &tag).await;
            }
            .instrument(span),
        );
    }
}

/// Close the session and delete the fragments stored under `tag`.
/// Failures are logged.
async fn release(reasoner: &Reasoner, session: &mut Session, tag: &str) {
    if let Err(e) = reasoner.close_session(session).await {
        warn!(error = %e, "Failed to close reasoning session");
    }
    for base in [RESULT_FRAGMENT, PREVIOUS_RESULT_FRAGMENT] {
        let name = step_scoped_name(base, tag);
        if let Err(e) = reasoner.discard_fragment(&name).await {
            warn!(fragment = %name, error = %e, "Failed to delete resolution fragment");
        }
    }
}

/// Drives one message through schema lookup, verdicts, queries and answer
/// composition.
pub struct ResolutionPipeline {
    reasoner: Arc<Reasoner>,
    schema: Arc<dyn SchemaProvider>,
    executor: Arc<dyn QueryExecutor>,
    prompts: Prompts,
}

impl ResolutionPipeline {
    pub fn new(
        reasoner: Arc<Reasoner>,
        schema: Arc<dyn SchemaProvider>,
        executor: Arc<dyn QueryExecutor>,
        prompts: Prompts,
    ) -> Self {
        Self {
            reasoner,
            schema,
            executor,
            prompts,
        }
    }

    /// Prompts configured from the reasoner and budget sections.
    pub fn prompts_from_config(reasoner: &ReasonerConfig, budget: &BudgetConfig) -> Prompts {
        Prompts::new(reasoner.language.clone(), budget.answer_limit())
    }

    pub fn reasoner(&self) -> &Arc<Reasoner> {
        &self.reasoner
    }

    /// Resolve `message` in the context of `history`.
    pub async fn resolve(&self, message: &str, history: History) -> Result<String> {
        let inquiry = Inquiry::new(message, history)?;
        self.resolve_inquiry(&inquiry).await
    }

    pub async fn resolve_inquiry(&self, inquiry: &Inquiry) -> Result<String> {
        let tag = Uuid::new_v4().simple().to_string();
        let span = info_span!("resolution", id = %tag);

        async {
            info!(history = inquiry.history.len(), "Resolving message");
            let mut res = Resolution {
                inquiry,
                lease: Lease::new(self.reasoner.clone(), tag),
                schema: None,
                static_tables: StaticTables::new(),
            };

            let outcome = self.drive(&mut res).await;
            res.lease.release().await;

            match &outcome {
                Ok(answer) => info!(chars = answer.chars().count(), "Resolution finished"),
                Err(e) => warn!(error = %e, "Resolution failed"),
            }
            outcome
        }
        .instrument(span)
        .await
    }

    async fn drive(&self, res: &mut Resolution<'_>) -> Result<String> {
        let mut state = State::Start;
        loop {
            debug!(state = state.label(), "Entering state");
            state = match state {
                State::Start => {
                    if self.schema.test_connection().await {
                        State::SchemaCheck
                    } else {
                        warn!("Store unreachable, answering without data");
                        State::Unavailable
                    }
                }

                State::SchemaCheck => {
                    let described = self.schema.schema_description().await;
                    res.static_tables = self.schema.static_tables().await;
                    match described {
                        Ok(Some(schema)) => {
                            debug!(
                                schema_chars = schema.chars().count(),
                                static_tables = res.static_tables.len(),
                                "Store described"
                            );
                            res.schema = Some(schema);
                            State::FirstVerdict
                        }
                        Ok(None) => {
                            warn!("Store exposes no tables, answering without data");
                            State::Unavailable
                        }
                        Err(e) => {
                            warn!(error = %e, "Schema lookup failed, answering without data");
                            State::Unavailable
                        }
                    }
                }

                State::FirstVerdict => {
                    let raw = self.step(res, PromptKind::Decide, Vec::new(), &[]).await?;
                    match ParsedVerdict::parse(&raw).decision() {
                        Decision::RunQuery(sql) => State::Query(sql),
                        Decision::Disambiguate(sql) => State::Disambiguate(sql),
                        Decision::Answer(text) => State::Done(text),
                        Decision::Empty => {
                            warn!("First verdict carried nothing usable");
                            State::Fallback
                        }
                    }
                }

                State::Query(sql) => {
                    let rows = self.run_query(&sql).await;
                    if rows.is_empty() {
                        State::NoResult(sql)
                    } else {
                        State::Compose { sql, rows }
                    }
                }

                State::Disambiguate(sql) => {
                    let rows = self.run_query(&sql).await;
                    if rows.is_empty() {
                        State::NoResult(sql)
                    } else {
                        State::SecondVerdict { sql, rows }
                    }
                }

                State::SecondVerdict { sql, rows } => {
                    let fragment =
                        Fragment::rows(PREVIOUS_RESULT_FRAGMENT, rows).scoped_to_step(&res.lease.tag);
                    let raw = self
                        .step(res, PromptKind::FollowUp, vec![fragment], &[("previous_sql", sql.as_str())])
                        .await?;
                    match ParsedVerdict::parse(&raw).follow_up() {
                        Decision::RunQuery(next) => State::Query(next),
                        Decision::Answer(text) => State::Done(text),
                        Decision::Disambiguate(_) | Decision::Empty => {
                            warn!("Follow-up verdict carried nothing usable");
                            State::Fallback
                        }
                    }
                }

                State::Compose { sql, rows } => {
                    let fragment = Fragment::rows(RESULT_FRAGMENT, rows).scoped_to_step(&res.lease.tag);
                    let raw = self
                        .step(res, PromptKind::ComposeWithData, vec![fragment], &[("sql_query", sql.as_str())])
                        .await?;
                    State::Done(ParsedVerdict::parse(&raw).answer_text())
                }

                State::NoResult(sql) => {
                    let raw = self
                        .step(res, PromptKind::ComposeWithoutData, Vec::new(), &[("sql_query", sql.as_str())])
                        .await?;
                    State::Done(ParsedVerdict::parse(&raw).answer_text())
                }

                State::Fallback | State::Unavailable => {
                    let raw = self
                        .step(res, PromptKind::ComposeWithoutData, Vec::new(), &[("sql_query", NO_QUERY)])
                        .await?;
                    State::Done(ParsedVerdict::parse(&raw).answer_text())
                }

                State::Done(answer) => return Ok(answer),
            };
        }
    }

    /// One reasoning call over the resolution's shared data plus `extra`
    /// fragments. `values` fill the step's own placeholders.
    async fn step(
        &self,
        res: &mut Resolution<'_>,
        kind: PromptKind,
        extra: Vec<Fragment>,
        values: &[(&str, &str)],
    ) -> Result<String> {
        let table_names: Vec<String> = res
            .static_tables
            .iter()
            .map(|t| table_fragment_name(&t.name))
            .collect();

        // Overflow externalizes in this order: schema, step data, static tables.
        let mut fragments = Vec::with_capacity(table_names.len() + extra.len() + 1);
        if let Some(schema) = &res.schema {
            fragments.push(Fragment::text(SCHEMA_FRAGMENT, schema.clone()));
        }
        fragments.extend(extra);
        for table in res.static_tables.iter() {
            fragments.push(Fragment::rows(table_fragment_name(&table.name), table.rows.clone()));
        }

        let inquiry = res.inquiry;
        let step = ReasoningStep {
            name: kind.step_name(),
            fragments,
            message: &inquiry.text,
            history: &inquiry.history,
        };

        let prompts = &self.prompts;
        self.reasoner
            .invoke(step, &mut res.lease.session, |partition| {
                let db_schema = partition.render_or(SCHEMA_FRAGMENT, SCHEMA_UNAVAILABLE);
                let static_tables = render_static_tables(partition, &table_names);
                let names = if table_names.is_empty() {
                    NO_QUERY.to_string()
                } else {
                    table_names.join(", ")
                };
                let result = partition.render_or(RESULT_FRAGMENT, "");
                let previous_result = partition.render_or(PREVIOUS_RESULT_FRAGMENT, "");

                let mut all: Vec<(&str, &str)> = vec![
                    ("db_schema", db_schema.as_str()),
                    ("static_tables", static_tables.as_str()),
                    ("static_table_names", names.as_str()),
                    ("result", result.as_str()),
                    ("previous_result", previous_result.as_str()),
                ];
                all.extend_from_slice(values);
                prompts.render(kind, &all)
            })
            .await
    }

    /// Failed queries count as zero rows.
    async fn run_query(&self, sql: &str) -> RowSet {
        match self.executor.execute(sql).await {
            Ok(rows) => {
                info!(rows = rows.len(), "Query returned");
                rows
            }
            Err(e) => {
                warn!(error = %e, "Query failed, treating as no rows");
                RowSet::empty()
            }
        }
    }
}

fn table_fragment_name(table: &str) -> String {
    format!("{table}.json")
}

fn render_static_tables(partition: &Partition, names: &[String]) -> String {
    if names.is_empty() {
        return NO_QUERY.to_string();
    }
    names
        .iter()
        .map(|name| format!("{name}\n{}", partition.render_or(name, "[]")))
        .collect::<Vec<_>>()
        .join(TABLE_SEPARATOR)
}
