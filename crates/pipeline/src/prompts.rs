//! Instruction templates for each reasoning step.
//!
//! Every template is a shared preamble, a step body and a shared data block.
//! Placeholders are `{name}` and are filled in a single pass, so substituted
//! data is never scanned for further placeholders.

use chrono::Local;

const PREAMBLE: &str = r#"
You are the data assistant of a company. You answer questions about the company by reading its database.

- Current date and time: {current_date}
- Always answer in {lang}.
- Use SI units and state units and currencies explicitly.
- Reply with a single valid JSON object and nothing else: no markdown fences, no text around it.
- Every textual answer goes in the `response` field as a flat string, never nested objects or arrays.
- Inside `response`, plain Markdown (`-` bullets, line breaks) is allowed when it helps readability. No HTML.
- Keep answers under {limit} characters unless accuracy needs more.
- Prefer names and descriptions over internal ids.
- Treat the previous conversation as relevant unless the user says otherwise.
- Never mix ISO week-date patterns (IYYY, IW, ID) with Gregorian ones (YYYY, MM, DD) in one SQL format string.
- In SQL use a dot as decimal separator.
- Static reference tables available: {static_table_names}
"#;

const DATA_BLOCK: &str = r#"
Read the following data carefully, including any of it that is provided as a file.
<schema>
Database schema:

{db_schema}
</schema>
<static_tables>
Reference tables. Use them for lookups and metadata, never as a source of live figures:

{static_tables}
</static_tables>
"#;

const DECIDE: &str = r#"
Decide whether the question needs the database.

1. If the reference tables or the conversation already answer it, put the answer in `response` and leave the queries empty.
2. If it needs live data, write one PostgreSQL query in `sql_query`, qualified with the schema name.
3. Check each column's type in the schema before writing a condition. Compare text case-insensitively (`ILIKE` or `LOWER(...)`).
4. If the user names something that may match several records or may be misspelled, do not guess. Put a lookup query in `extra_sql_query` that lists candidates, ranked by `similarity(...)` when fuzzy.
5. Exclude NULLs from rankings, sums, averages and comparisons.
6. Never nest aggregate functions; aggregate in a subquery first.

Output:
{"sql_query": "", "extra_sql_query": "", "response": ""}
Fill exactly one field.
"#;

const FOLLOW_UP: &str = r#"
The question mentioned something ambiguous, so a lookup query was run to find candidates.

Using the question, the lookup query and its result:
- If one candidate clearly matches, write the final query in `sql_query`.
- If several candidates are plausible, ask the user to choose in `response`, listing them.
- If the lookup result already answers the question, answer in `response`.
- If nothing sensible can be produced, leave both fields empty.

Output:
{"sql_query": "", "response": ""}

<previous_sql_query>
Lookup query that was run:

{previous_sql}
</previous_sql_query>
<previous_sql_result>
Its result:

{previous_result}
</previous_sql_result>
"#;

const COMPOSE_WITH_DATA: &str = r#"
A query was run for the user's question. Answer the question from its result.

- Interpret the relevant columns and explain the result naturally. Do not just restate rows.
- If the result does not actually answer the question, say so.

Output:
{"response": ""}

<sql_query>
Query that was run:

{sql_query}
</sql_query>
<sql_response>
Its result:

{result}
</sql_response>
"#;

const COMPOSE_WITHOUT_DATA: &str = r#"
Answer the user's question directly. No query data is available for it.

- Never invent figures. If data would be needed, say clearly that it could not be retrieved.
- If a query was attempted and returned nothing, use it and the schema only to explain why (a typo, a missing record).

Output:
{"response": ""}

<sql_query>
Query attempted without results, if any:

{sql_query}
</sql_query>
"#;

/// The four reasoning steps of a resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptKind {
    /// First verdict: answer, query, or disambiguate
    Decide,
    /// Second verdict, after a disambiguation lookup
    FollowUp,
    /// Final answer from query rows
    ComposeWithData,
    /// Final answer with no rows
    ComposeWithoutData,
}

impl PromptKind {
    pub fn step_name(&self) -> &'static str {
        match self {
            PromptKind::Decide => "decide",
            PromptKind::FollowUp => "follow_up",
            PromptKind::ComposeWithData => "compose_with_data",
            PromptKind::ComposeWithoutData => "compose_without_data",
        }
    }

    fn body(&self) -> &'static str {
        match self {
            PromptKind::Decide => DECIDE,
            PromptKind::FollowUp => FOLLOW_UP,
            PromptKind::ComposeWithData => COMPOSE_WITH_DATA,
            PromptKind::ComposeWithoutData => COMPOSE_WITHOUT_DATA,
        }
    }
}

/// Renders templates with the process-wide values filled in.
#[derive(Debug, Clone)]
pub struct Prompts {
    language: String,
    answer_limit: usize,
}

impl Prompts {
    pub fn new(language: impl Into<String>, answer_limit: usize) -> Self {
        Self {
            language: language.into(),
            answer_limit,
        }
    }

    pub fn language(&self) -> &str {
        &self.language
    }

    pub fn answer_limit(&self) -> usize {
        self.answer_limit
    }

    /// Render `kind` with the step's values. Unknown placeholders stay as-is.
    pub fn render(&self, kind: PromptKind, values: &[(&str, &str)]) -> String {
        let template = format!("{PREAMBLE}{}{DATA_BLOCK}", kind.body());
        let current_date = Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
        let limit = self.answer_limit.to_string();

        let mut all: Vec<(&str, &str)> = vec![
            ("current_date", current_date.as_str()),
            ("lang", self.language.as_str()),
            ("limit", limit.as_str()),
        ];
        all.extend_from_slice(values);
        fill(&template, &all)
    }
}

/// Replace `{key}` occurrences with their values in one left-to-right pass.
pub fn fill(template: &str, values: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let key_len = after
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
            .unwrap_or(after.len());
        let key = &after[..key_len];

        let value = if !key.is_empty() && after[key_len..].starts_with('}') {
            values.iter().find(|(k, _)| *k == key).map(|(_, v)| *v)
        } else {
            None
        };

        match value {
            Some(v) => {
                out.push_str(v);
                rest = &after[key_len + 1..];
            }
            None => {
                out.push('{');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fill_replaces_known_keys_only() {
        let out = fill("a {x} b {y} c {\"k\": 1}", &[("x", "1")]);
        assert_eq!(out, "a 1 b {y} c {\"k\": 1}");
    }

    #[test]
    fn fill_does_not_rescan_values() {
        let out = fill("{a}{b}", &[("a", "{b}"), ("b", "2")]);
        assert_eq!(out, "{b}2");
    }

    #[test]
    fn fill_handles_unterminated_brace() {
        assert_eq!(fill("tail {abc", &[("abc", "x")]), "tail {abc");
    }

    #[test]
    fn render_fills_common_values() {
        let prompts = Prompts::new("English", 18_000);
        let out = prompts.render(
            PromptKind::ComposeWithData,
            &[
                ("db_schema", "Table: machines"),
                ("static_tables", "roles.json\n[]"),
                ("static_table_names", "roles.json"),
                ("sql_query", "SELECT 1"),
                ("result", "[{\"n\":1}]"),
            ],
        );
        assert!(out.contains("Always answer in English."));
        assert!(out.contains("under 18000 characters"));
        assert!(out.contains("Table: machines"));
        assert!(out.contains("SELECT 1"));
        assert!(out.contains("[{\"n\":1}]"));
        assert!(!out.contains("{current_date}"));
        assert!(out.contains("{\"response\": \"\"}"));
    }

    #[test]
    fn each_kind_carries_its_own_slots() {
        let prompts = Prompts::new("Spanish", 100);
        let follow = prompts.render(PromptKind::FollowUp, &[]);
        assert!(follow.contains("{previous_sql}"));
        assert!(follow.contains("{previous_result}"));

        let decide = prompts.render(PromptKind::Decide, &[]);
        assert!(decide.contains("extra_sql_query"));
        assert!(!decide.contains("{sql_query}"));
    }
}
