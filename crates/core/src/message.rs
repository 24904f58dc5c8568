//! Inquiry and conversation history types.
//!
//! These are the value objects that enter the system at the gateway:
//! a question plus the turns that preceded it. They are immutable for the
//! duration of one resolution.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// The role of a message sender in a reasoning call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The end user
    User,
    /// The reasoning engine
    Assistant,
    /// Instructions for this step
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

/// A single flattened message sent to the reasoning engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }
}

/// One exchange of the prior conversation. Either side may be missing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,

    /// The bot side, also accepted as `assistant`.
    #[serde(default, alias = "assistant", skip_serializing_if = "Option::is_none")]
    pub bot: Option<String>,
}

impl Turn {
    pub fn new(user: impl Into<String>, bot: impl Into<String>) -> Self {
        Self {
            user: Some(user.into()),
            bot: Some(bot.into()),
        }
    }

    /// Read a turn from a loosely-shaped JSON object.
    ///
    /// `bot` wins over `assistant` when both are present; non-string values
    /// are ignored.
    fn from_object(obj: &serde_json::Map<String, Value>) -> Self {
        let text = |key: &str| obj.get(key).and_then(Value::as_str).map(str::to_string);
        Self {
            user: text("user"),
            bot: text("bot").or_else(|| text("assistant")),
        }
    }
}

/// Ordered prior turns, oldest first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct History(pub Vec<Turn>);

impl History {
    pub fn new(turns: Vec<Turn>) -> Self {
        Self(turns)
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn turns(&self) -> &[Turn] {
        &self.0
    }

    /// Build a history from whatever the caller sent.
    ///
    /// A list yields one turn per object element, a single object yields one
    /// turn, anything else yields an empty history.
    pub fn from_value(value: &Value) -> Self {
        match value {
            Value::Array(items) => Self(
                items
                    .iter()
                    .filter_map(Value::as_object)
                    .map(Turn::from_object)
                    .collect(),
            ),
            Value::Object(obj) if !obj.is_empty() => Self(vec![Turn::from_object(obj)]),
            _ => Self::default(),
        }
    }

    /// Flatten into alternating user/assistant messages, skipping empty sides.
    pub fn to_messages(&self) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(self.0.len() * 2);
        for turn in &self.0 {
            if let Some(user) = turn.user.as_deref().filter(|s| !s.is_empty()) {
                messages.push(ChatMessage::user(user));
            }
            if let Some(bot) = turn.bot.as_deref().filter(|s| !s.is_empty()) {
                messages.push(ChatMessage::assistant(bot));
            }
        }
        messages
    }
}

/// A user question together with the conversation that led to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inquiry {
    pub text: String,
    #[serde(default)]
    pub history: History,
}

impl Inquiry {
    /// Create an inquiry. Blank text is rejected.
    pub fn new(text: impl Into<String>, history: History) -> Result<Self> {
        let text = text.into();
        if text.trim().is_empty() {
            return Err(Error::InvalidInput("message must not be empty".into()));
        }
        Ok(Self { text, history })
    }
}
