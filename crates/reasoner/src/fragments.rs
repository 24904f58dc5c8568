//! [`ExternalContextStore`] backed by the reasoning engine's file registries.
//!
//! Two local registries mirror the remote side: every uploaded file by name,
//! and the subset attached to the session context. All lifecycle operations
//! run under one async lock, so create-or-reuse stays idempotent per name
//! across concurrent resolutions.

use std::sync::Arc;

use askdb_core::{ExternalContextStore, ExternalFragment, FragmentError, FragmentId, ReasoningBackend};
use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::partition::is_step_scoped_name;
use crate::registry::FileRegistry;

#[derive(Default)]
struct Registries {
    files: FileRegistry,
    attached: FileRegistry,
}

pub struct RemoteContextStore {
    backend: Arc<dyn ReasoningBackend>,
    state: Mutex<Registries>,
}

impl RemoteContextStore {
    pub fn new(backend: Arc<dyn ReasoningBackend>) -> Self {
        Self {
            backend,
            state: Mutex::new(Registries::default()),
        }
    }

    /// Number of files in the local registry.
    pub async fn file_count(&self) -> usize {
        self.state.lock().await.files.len()
    }
}

#[async_trait]
impl ExternalContextStore for RemoteContextStore {
    async fn sync(&self) -> Result<(), FragmentError> {
        let mut state = self.state.lock().await;

        let remote = self
            .backend
            .list_files()
            .await
            .map_err(|e| FragmentError::Registry(e.to_string()))?;

        state.files.clear();
        let mut stale = Vec::new();
        for file in remote {
            if is_step_scoped_name(&file.name) {
                stale.push(file.id);
                continue;
            }
            state.files.push(ExternalFragment {
                logical_name: file.name,
                id: file.id,
            });
        }

        let attached = self
            .backend
            .list_attached()
            .await
            .map_err(|e| FragmentError::Registry(e.to_string()))?;

        let detached = futures::future::join_all(attached.iter().map(|id| self.backend.detach(id))).await;
        for (id, result) in attached.iter().zip(detached) {
            if let Err(e) = result {
                return Err(FragmentError::Registry(format!("detach {id}: {e}")));
            }
        }
        state.attached.clear();

        // Leftovers of interrupted resolutions
        for id in &stale {
            if let Err(e) = self.backend.delete_file(id).await {
                warn!(file_id = %id, error = %e, "Failed to delete stale step file");
            }
        }

        info!(
            files = state.files.len(),
            detached = attached.len(),
            stale = stale.len(),
            "External context registry synced"
        );
        Ok(())
    }

    async fn create_or_reuse(&self, name: &str, content: &str) -> Result<FragmentId, FragmentError> {
        let mut state = self.state.lock().await;

        if let Some(existing) = state.files.by_name(name).cloned() {
            if !state.attached.contains_id(&existing.id) {
                self.backend
                    .attach(&existing.id)
                    .await
                    .map_err(|e| FragmentError::Attach {
                        id: existing.id.to_string(),
                        reason: e.to_string(),
                    })?;
                state.attached.push(existing.clone());
            }
            debug!(name, file_id = %existing.id, "Reusing external fragment");
            return Ok(existing.id);
        }

        let id = self
            .backend
            .upload_file(name, content)
            .await
            .map_err(|e| FragmentError::Upload {
                name: name.to_string(),
                reason: e.to_string(),
            })?;

        let fragment = ExternalFragment {
            logical_name: name.to_string(),
            id: id.clone(),
        };
        state.files.push(fragment.clone());

        self.backend.attach(&id).await.map_err(|e| FragmentError::Attach {
            id: id.to_string(),
            reason: e.to_string(),
        })?;
        state.attached.push(fragment);

        info!(name, file_id = %id, chars = content.chars().count(), "Externalized fragment");
        Ok(id)
    }

    async fn delete(&self, id: &FragmentId) -> Result<(), FragmentError> {
        let mut state = self.state.lock().await;

        let detached = if state.attached.contains_id(id) {
            self.backend.detach(id).await
        } else {
            Ok(())
        };
        if detached.is_ok() {
            state.attached.remove_by_id(id);
        }

        let deleted = self.backend.delete_file(id).await;
        if deleted.is_ok() {
            state.files.remove_by_id(id);
            state.attached.remove_by_id(id);
            debug!(file_id = %id, "Deleted external fragment");
        }

        detached.and(deleted).map_err(|e| FragmentError::Delete {
            id: id.to_string(),
            reason: e.to_string(),
        })
    }

    async fn delete_by_name(&self, name: &str) -> Result<Option<FragmentId>, FragmentError> {
        let Some(id) = self.lookup(name).await else {
            return Ok(None);
        };
        self.delete(&id).await?;
        Ok(Some(id))
    }

    async fn lookup(&self, name: &str) -> Option<FragmentId> {
        self.state.lock().await.files.by_name(name).map(|f| f.id.clone())
    }

    async fn attached(&self) -> Vec<ExternalFragment> {
        self.state.lock().await.attached.all().to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scripted::{BackendCall, ScriptedBackend};

    fn store_with(backend: &Arc<ScriptedBackend>) -> RemoteContextStore {
        RemoteContextStore::new(backend.clone() as Arc<dyn ReasoningBackend>)
    }

    #[tokio::test]
    async fn create_or_reuse_is_idempotent_by_name() {
        let backend = Arc::new(ScriptedBackend::new());
        let store = store_with(&backend);

        let first = store.create_or_reuse("db_schema.txt", "Table: a").await.unwrap();
        let second = store.create_or_reuse("db_schema.txt", "Table: a").await.unwrap();

        assert_eq!(first, second);
        assert_eq!(backend.uploads(), vec!["db_schema.txt".to_string()]);
        assert_eq!(store.attached().await.len(), 1);
    }

    #[tokio::test]
    async fn concurrent_creates_upload_once() {
        let backend = Arc::new(ScriptedBackend::new());
        let store = Arc::new(store_with(&backend));

        let handles: Vec<_> = (0..5)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.create_or_reuse("roles.json", "[]").await.unwrap() })
            })
            .collect();

        let mut ids = Vec::new();
        for handle in handles {
            ids.push(handle.await.unwrap());
        }
        ids.dedup();
        assert_eq!(ids.len(), 1);
        assert_eq!(backend.uploads().len(), 1);
    }

    #[tokio::test]
    async fn sync_adopts_remote_files_and_detaches_everything() {
        let backend = Arc::new(
            ScriptedBackend::new()
                .with_file("db_schema.txt", "file-a")
                .with_file("result.step-abc.json", "file-b")
                .with_attached("file-a")
                .with_attached("file-b"),
        );
        let store = store_with(&backend);

        store.sync().await.unwrap();

        assert!(backend.attached_ids().is_empty());
        assert!(store.attached().await.is_empty());
        assert_eq!(store.lookup("db_schema.txt").await, Some(FragmentId::new("file-a")));
        // step leftovers are removed remotely and never adopted
        assert!(store.lookup("result.step-abc.json").await.is_none());
        assert!(backend.calls().contains(&BackendCall::DeleteFile(FragmentId::new("file-b"))));
    }

    #[tokio::test]
    async fn reuse_after_sync_reattaches_without_upload() {
        let backend = Arc::new(
            ScriptedBackend::new()
                .with_file("db_schema.txt", "file-a")
                .with_attached("file-a"),
        );
        let store = store_with(&backend);
        store.sync().await.unwrap();

        let id = store.create_or_reuse("db_schema.txt", "ignored").await.unwrap();
        assert_eq!(id, FragmentId::new("file-a"));
        assert!(backend.uploads().is_empty());
        assert_eq!(backend.attached_ids(), vec![FragmentId::new("file-a")]);
    }

    #[tokio::test]
    async fn delete_clears_both_registries() {
        let backend = Arc::new(ScriptedBackend::new());
        let store = store_with(&backend);

        let id = store.create_or_reuse("result.json", "[]").await.unwrap();
        store.delete(&id).await.unwrap();

        assert!(store.lookup("result.json").await.is_none());
        assert!(store.attached().await.is_empty());
        assert!(backend.files().is_empty());

        // a fresh create uploads again
        let again = store.create_or_reuse("result.json", "[]").await.unwrap();
        assert_ne!(again, id);
    }

    #[tokio::test]
    async fn delete_by_name_of_unknown_is_noop() {
        let backend = Arc::new(ScriptedBackend::new());
        let store = store_with(&backend);
        assert_eq!(store.delete_by_name("previous_result.json").await.unwrap(), None);
    }

    #[tokio::test]
    async fn upload_failure_is_reported() {
        let backend = Arc::new(ScriptedBackend::new());
        backend.fail_uploads(true);
        let store = store_with(&backend);

        let err = store.create_or_reuse("db_schema.txt", "x").await.unwrap_err();
        assert!(matches!(err, FragmentError::Upload { .. }));
        assert!(store.lookup("db_schema.txt").await.is_none());
    }

    #[tokio::test]
    async fn delete_failure_keeps_registry_entry() {
        let backend = Arc::new(ScriptedBackend::new());
        let store = store_with(&backend);
        let id = store.create_or_reuse("result.json", "[]").await.unwrap();

        backend.fail_deletes(true);
        assert!(store.delete(&id).await.is_err());
        assert_eq!(store.lookup("result.json").await, Some(id));
    }
}
