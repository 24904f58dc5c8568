//! Payload partitioning: which prompt fragments are inlined and which are
//! moved to the external context store.
//!
//! For a budget `B` (in Unicode scalar values):
//! 1. every fragment longer than `B` on its own is externalized;
//! 2. if the inlined rest still exceeds `B`, fragments are externalized in
//!    input order until it fits.
//!
//! An externalized fragment is never re-inlined within the same call. Text is
//! measured as-is, row sets as compact JSON.

use askdb_core::{ExternalContextStore, FragmentError, FragmentId, RowSet};
use tracing::debug;

/// Tag embedded in the stored name of a step-scoped fragment.
pub const STEP_SCOPE_TAG: &str = ".step-";

/// Reference left in the prompt where an externalized fragment would be.
pub fn reference_marker(id: &FragmentId) -> String {
    format!("In the file with id: {id}")
}

/// Stored name of a step-scoped fragment, unique per resolution:
/// `result.json` becomes `result.step-<tag>.json`.
pub fn step_scoped_name(base: &str, tag: &str) -> String {
    match base.rsplit_once('.') {
        Some((stem, ext)) => format!("{stem}{STEP_SCOPE_TAG}{tag}.{ext}"),
        None => format!("{base}{STEP_SCOPE_TAG}{tag}"),
    }
}

pub fn is_step_scoped_name(name: &str) -> bool {
    name.contains(STEP_SCOPE_TAG)
}

#[derive(Debug, Clone, PartialEq)]
pub enum FragmentBody {
    Text(String),
    Rows(RowSet),
}

/// How long a fragment lives in the external store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FragmentScope {
    /// Reusable across resolutions (schema, static tables)
    Stable,
    /// Deleted before and after the step that uses it
    Step,
}

/// A named piece of prompt data.
#[derive(Debug, Clone, PartialEq)]
pub struct Fragment {
    /// Label used in the prompt and, for stable fragments, the stored name
    pub name: String,
    /// Name under which the fragment is stored externally
    pub stored_name: String,
    pub body: FragmentBody,
    pub scope: FragmentScope,
}

impl Fragment {
    pub fn text(name: impl Into<String>, text: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            stored_name: name.clone(),
            name,
            body: FragmentBody::Text(text.into()),
            scope: FragmentScope::Stable,
        }
    }

    pub fn rows(name: impl Into<String>, rows: RowSet) -> Self {
        let name = name.into();
        Self {
            stored_name: name.clone(),
            name,
            body: FragmentBody::Rows(rows),
            scope: FragmentScope::Stable,
        }
    }

    /// Mark this fragment as step-scoped for the resolution tagged `tag`.
    pub fn scoped_to_step(mut self, tag: &str) -> Self {
        self.stored_name = step_scoped_name(&self.name, tag);
        self.scope = FragmentScope::Step;
        self
    }

    /// The text inlined into a prompt.
    pub fn inline_text(&self) -> String {
        match &self.body {
            FragmentBody::Text(text) => text.clone(),
            FragmentBody::Rows(rows) => rows.to_compact_json(),
        }
    }

    /// The content uploaded when externalized.
    pub fn upload_text(&self) -> String {
        match &self.body {
            FragmentBody::Text(text) => text.clone(),
            FragmentBody::Rows(rows) => rows.to_pretty_json(),
        }
    }

    pub fn char_count(&self) -> usize {
        self.inline_text().chars().count()
    }
}

/// Where one fragment ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Placement {
    Inline(String),
    External(FragmentId),
}

impl Placement {
    /// The text to put in the prompt.
    pub fn render(&self) -> String {
        match self {
            Placement::Inline(text) => text.clone(),
            Placement::External(id) => reference_marker(id),
        }
    }

    pub fn is_external(&self) -> bool {
        matches!(self, Placement::External(_))
    }
}

/// The outcome of partitioning one step's fragments, in input order.
#[derive(Debug, Clone, Default)]
pub struct Partition {
    entries: Vec<(String, Placement)>,
}

impl Partition {
    pub fn get(&self, name: &str) -> Option<&Placement> {
        self.entries.iter().find(|(n, _)| n == name).map(|(_, p)| p)
    }

    /// Rendered text for `name`, or `fallback` when the fragment is absent.
    pub fn render_or(&self, name: &str, fallback: &str) -> String {
        self.get(name).map(Placement::render).unwrap_or_else(|| fallback.to_string())
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, &Placement)> {
        self.entries.iter().map(|(n, p)| (n.as_str(), p))
    }

    pub fn any_external(&self) -> bool {
        self.entries.iter().any(|(_, p)| p.is_external())
    }

    pub fn external_ids(&self) -> Vec<FragmentId> {
        self.entries
            .iter()
            .filter_map(|(_, p)| match p {
                Placement::External(id) => Some(id.clone()),
                Placement::Inline(_) => None,
            })
            .collect()
    }

    /// Total characters inlined.
    pub fn inline_chars(&self) -> usize {
        self.entries
            .iter()
            .filter_map(|(_, p)| match p {
                Placement::Inline(text) => Some(text.chars().count()),
                Placement::External(_) => None,
            })
            .sum()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PayloadPartitioner {
    budget: usize,
}

impl PayloadPartitioner {
    pub fn new(budget: usize) -> Self {
        Self { budget }
    }

    pub fn budget(&self) -> usize {
        self.budget
    }

    /// Decide placement from sizes alone: `true` means externalize.
    pub fn plan(&self, sizes: &[usize]) -> Vec<bool> {
        let mut external: Vec<bool> = sizes.iter().map(|&size| size > self.budget).collect();

        let mut inline_total: usize = sizes
            .iter()
            .zip(&external)
            .filter(|(_, ext)| !**ext)
            .map(|(size, _)| size)
            .sum();

        for (i, &size) in sizes.iter().enumerate() {
            if inline_total <= self.budget {
                break;
            }
            if !external[i] {
                external[i] = true;
                inline_total -= size;
            }
        }

        external
    }

    /// Place every fragment, externalizing through `store` as planned.
    ///
    /// A failed externalization fails the whole partition.
    pub async fn partition(
        &self,
        fragments: &[Fragment],
        store: &dyn ExternalContextStore,
    ) -> Result<Partition, FragmentError> {
        let sizes: Vec<usize> = fragments.iter().map(Fragment::char_count).collect();
        let plan = self.plan(&sizes);

        let mut entries = Vec::with_capacity(fragments.len());
        for ((fragment, externalize), size) in fragments.iter().zip(plan).zip(&sizes) {
            let placement = if externalize {
                let id = store
                    .create_or_reuse(&fragment.stored_name, &fragment.upload_text())
                    .await?;
                debug!(fragment = %fragment.name, chars = size, file_id = %id, "Fragment externalized");
                Placement::External(id)
            } else {
                Placement::Inline(fragment.inline_text())
            };
            entries.push((fragment.name.clone(), placement));
        }

        let partition = Partition { entries };
        debug!(
            budget = self.budget,
            inline_chars = partition.inline_chars(),
            external = partition.external_ids().len(),
            "Payload partitioned"
        );
        Ok(partition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fragments::RemoteContextStore;
    use crate::scripted::ScriptedBackend;
    use askdb_core::{ReasoningBackend, Row};
    use serde_json::json;
    use std::sync::Arc;

    #[test]
    fn everything_fits_inline() {
        let p = PayloadPartitioner::new(100);
        assert_eq!(p.plan(&[10, 20, 30]), vec![false, false, false]);
        assert_eq!(p.plan(&[100]), vec![false]);
        assert_eq!(p.plan(&[]), Vec::<bool>::new());
    }

    #[test]
    fn oversized_fragment_always_externalized() {
        let p = PayloadPartitioner::new(100);
        assert_eq!(p.plan(&[5, 101, 5]), vec![false, true, false]);
        assert_eq!(p.plan(&[101, 1000]), vec![true, true]);
    }

    #[test]
    fn overflow_externalizes_in_input_order() {
        let p = PayloadPartitioner::new(100);
        // 60 + 50 > 100: the first one goes
        assert_eq!(p.plan(&[60, 50]), vec![true, false]);
        // reordering changes which one goes
        assert_eq!(p.plan(&[50, 60]), vec![true, false]);
        // stops as soon as the rest fits
        assert_eq!(p.plan(&[30, 80, 10]), vec![true, false, false]);
        assert_eq!(p.plan(&[10, 80, 30]), vec![true, true, false]);
        assert_eq!(p.plan(&[40, 40, 40, 40]), vec![true, true, false, false]);
    }

    #[test]
    fn oversized_then_overflow() {
        let p = PayloadPartitioner::new(100);
        assert_eq!(p.plan(&[150, 70, 40]), vec![true, true, false]);
    }

    #[test]
    fn inline_total_never_exceeds_budget() {
        let budget = 97;
        let p = PayloadPartitioner::new(budget);
        let cases: Vec<Vec<usize>> = vec![
            vec![1, 2, 3],
            vec![96, 2],
            vec![50, 50, 50],
            vec![200, 10, 95],
            vec![33; 10],
            vec![0, 98, 0],
        ];
        for sizes in cases {
            let plan = p.plan(&sizes);
            let inline: usize = sizes.iter().zip(&plan).filter(|(_, e)| !**e).map(|(s, _)| s).sum();
            assert!(inline <= budget, "{sizes:?} -> {plan:?}");
            for (size, ext) in sizes.iter().zip(&plan) {
                if *size > budget {
                    assert!(*ext);
                }
            }
        }
    }

    #[test]
    fn sizes_count_unicode_scalars_and_compact_json() {
        assert_eq!(Fragment::text("a", "añb€").char_count(), 4);

        let row: Row = json!({"k": 1}).as_object().cloned().unwrap();
        let rows = RowSet::new(vec![row]);
        assert_eq!(Fragment::rows("r.json", rows).char_count(), r#"[{"k":1}]"#.len());
    }

    #[test]
    fn step_scoped_names() {
        assert_eq!(step_scoped_name("result.json", "abc"), "result.step-abc.json");
        assert_eq!(step_scoped_name("notes", "abc"), "notes.step-abc");
        assert!(is_step_scoped_name("previous_result.step-1.json"));
        assert!(!is_step_scoped_name("db_schema.txt"));

        let f = Fragment::text("result.json", "[]").scoped_to_step("r1");
        assert_eq!(f.name, "result.json");
        assert_eq!(f.stored_name, "result.step-r1.json");
        assert_eq!(f.scope, FragmentScope::Step);
    }

    #[tokio::test]
    async fn partition_renders_markers_for_external_fragments() {
        let backend = Arc::new(ScriptedBackend::new());
        let store = RemoteContextStore::new(backend.clone() as Arc<dyn ReasoningBackend>);
        let p = PayloadPartitioner::new(10);

        let fragments = vec![
            Fragment::text("db_schema.txt", "x".repeat(11)),
            Fragment::text("roles.json", "[]"),
        ];
        let partition = p.partition(&fragments, &store).await.unwrap();

        assert!(partition.any_external());
        let id = partition.external_ids().remove(0);
        assert_eq!(partition.render_or("db_schema.txt", ""), format!("In the file with id: {id}"));
        assert_eq!(partition.render_or("roles.json", ""), "[]");
        assert_eq!(partition.render_or("missing", "NO DATA"), "NO DATA");
        assert_eq!(backend.uploads(), vec!["db_schema.txt".to_string()]);
    }

    #[tokio::test]
    async fn partition_reuses_fragment_by_name() {
        let backend = Arc::new(ScriptedBackend::new());
        let store = RemoteContextStore::new(backend.clone() as Arc<dyn ReasoningBackend>);
        let p = PayloadPartitioner::new(5);
        let fragments = vec![Fragment::text("db_schema.txt", "long schema")];

        let a = p.partition(&fragments, &store).await.unwrap();
        let b = p.partition(&fragments, &store).await.unwrap();
        assert_eq!(a.external_ids(), b.external_ids());
        assert_eq!(backend.uploads().len(), 1);
    }

    #[tokio::test]
    async fn partition_fails_when_upload_fails() {
        let backend = Arc::new(ScriptedBackend::new());
        backend.fail_uploads(true);
        let store = RemoteContextStore::new(backend.clone() as Arc<dyn ReasoningBackend>);
        let p = PayloadPartitioner::new(1);

        let result = p.partition(&[Fragment::text("db_schema.txt", "big")], &store).await;
        assert!(result.is_err());
    }
}
