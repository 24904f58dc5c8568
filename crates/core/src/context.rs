//! Out-of-band storage for prompt fragments too large to inline.
//!
//! A fragment is addressed by its logical name (`db_schema.txt`,
//! `result.json`, ...). Creation is idempotent per name: while a fragment of
//! that name is live, asking for it again returns the same id and makes sure
//! it is attached to the context usable by session runs.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::FragmentError;

/// Identifier assigned by the external store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FragmentId(pub String);

impl FragmentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for FragmentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A stored fragment known to the local registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalFragment {
    pub logical_name: String,
    pub id: FragmentId,
}

#[async_trait]
pub trait ExternalContextStore: Send + Sync {
    /// Rebuild the local registry from the remote side and detach every
    /// attached fragment, so a fresh process starts with an empty context.
    async fn sync(&self) -> Result<(), FragmentError>;

    /// Store `content` under `name`, or reuse the live fragment of that name.
    ///
    /// Either way the returned fragment is attached when this returns.
    async fn create_or_reuse(&self, name: &str, content: &str) -> Result<FragmentId, FragmentError>;

    /// Remove a fragment from the store, the attached set and the local registry.
    async fn delete(&self, id: &FragmentId) -> Result<(), FragmentError>;

    /// Delete the fragment registered under `name`, if any.
    async fn delete_by_name(&self, name: &str) -> Result<Option<FragmentId>, FragmentError>;

    /// The live fragment registered under `name`.
    async fn lookup(&self, name: &str) -> Option<FragmentId>;

    /// Fragments currently attached to the session context.
    async fn attached(&self) -> Vec<ExternalFragment>;
}
