//! Structured output of one reasoning call.
//!
//! The engine is asked for a JSON object carrying at most one of
//! `sql_query`, `extra_sql_query` or `response`. Output that does not parse
//! is kept verbatim as [`ParsedVerdict::Unparsed`] so callers can degrade
//! instead of failing.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The three fields a verdict may carry. Blank strings count as absent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sql_query: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra_sql_query: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
}

/// What the pipeline should do next, in priority order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    RunQuery(String),
    Disambiguate(String),
    Answer(String),
    Empty,
}

impl Verdict {
    pub fn query(sql: impl Into<String>) -> Self {
        Self {
            sql_query: Some(sql.into()),
            ..Self::default()
        }
    }

    pub fn extra_query(sql: impl Into<String>) -> Self {
        Self {
            extra_sql_query: Some(sql.into()),
            ..Self::default()
        }
    }

    pub fn answer(text: impl Into<String>) -> Self {
        Self {
            response: Some(text.into()),
            ..Self::default()
        }
    }

    fn from_object(obj: &serde_json::Map<String, Value>) -> Self {
        let field = |key: &str| match obj.get(key) {
            Some(Value::String(s)) => non_blank(s),
            Some(Value::Null) | None => None,
            Some(other) => Some(other.to_string()),
        };
        Self {
            sql_query: field("sql_query"),
            extra_sql_query: field("extra_sql_query"),
            response: field("response"),
        }
    }

    /// `sql_query` beats `extra_sql_query`, which beats `response`.
    pub fn decision(&self) -> Decision {
        if let Some(sql) = self.sql_query.as_deref().and_then(non_blank) {
            Decision::RunQuery(sql)
        } else if let Some(sql) = self.extra_sql_query.as_deref().and_then(non_blank) {
            Decision::Disambiguate(sql)
        } else if let Some(text) = self.response.as_deref().and_then(non_blank) {
            Decision::Answer(text)
        } else {
            Decision::Empty
        }
    }

    /// Decision for a follow-up step, where a second disambiguation is
    /// not allowed: `sql_query`, then `response`.
    pub fn follow_up(&self) -> Decision {
        match self.decision() {
            Decision::Disambiguate(_) => self
                .response
                .as_deref()
                .and_then(non_blank)
                .map_or(Decision::Empty, Decision::Answer),
            other => other,
        }
    }
}

fn non_blank(s: &str) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s.to_string())
    }
}

/// Result of interpreting raw engine output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedVerdict {
    Parsed(Verdict),
    Unparsed(String),
}

impl ParsedVerdict {
    /// Interpret raw engine text. Markdown code fences are tolerated.
    pub fn parse(raw: &str) -> Self {
        let body = strip_fences(raw.trim());
        match serde_json::from_str::<Value>(body) {
            Ok(Value::Object(obj)) => ParsedVerdict::Parsed(Verdict::from_object(&obj)),
            _ => ParsedVerdict::Unparsed(raw.to_string()),
        }
    }

    /// The routing decision. Unparsed output routes like an empty verdict.
    pub fn decision(&self) -> Decision {
        match self {
            ParsedVerdict::Parsed(verdict) => verdict.decision(),
            ParsedVerdict::Unparsed(_) => Decision::Empty,
        }
    }

    /// Like [`decision`](Self::decision), for a follow-up step.
    pub fn follow_up(&self) -> Decision {
        match self {
            ParsedVerdict::Parsed(verdict) => verdict.follow_up(),
            ParsedVerdict::Unparsed(_) => Decision::Empty,
        }
    }

    /// The answer text of a composition step.
    ///
    /// Parsed output yields its `response` field (empty when missing);
    /// unparsed output is returned as-is.
    pub fn answer_text(&self) -> String {
        match self {
            ParsedVerdict::Parsed(verdict) => verdict.response.clone().unwrap_or_default(),
            ParsedVerdict::Unparsed(raw) => raw.clone(),
        }
    }

    pub fn is_parsed(&self) -> bool {
        matches!(self, ParsedVerdict::Parsed(_))
    }
}

fn strip_fences(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}
