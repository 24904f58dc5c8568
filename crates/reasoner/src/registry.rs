//! Local mirror of a remote file registry.

use askdb_core::{ExternalFragment, FragmentId};

/// Files known by name and id. Names are unique within a registry.
#[derive(Debug, Clone, Default)]
pub struct FileRegistry {
    files: Vec<ExternalFragment>,
}

impl FileRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the entry for `fragment.logical_name`.
    pub fn push(&mut self, fragment: ExternalFragment) {
        self.files.retain(|f| f.logical_name != fragment.logical_name && f.id != fragment.id);
        self.files.push(fragment);
    }

    pub fn by_name(&self, name: &str) -> Option<&ExternalFragment> {
        self.files.iter().find(|f| f.logical_name == name)
    }

    pub fn by_id(&self, id: &FragmentId) -> Option<&ExternalFragment> {
        self.files.iter().find(|f| &f.id == id)
    }

    pub fn contains_id(&self, id: &FragmentId) -> bool {
        self.by_id(id).is_some()
    }

    pub fn remove_by_id(&mut self, id: &FragmentId) -> Option<ExternalFragment> {
        let index = self.files.iter().position(|f| &f.id == id)?;
        Some(self.files.remove(index))
    }

    pub fn ids(&self) -> Vec<FragmentId> {
        self.files.iter().map(|f| f.id.clone()).collect()
    }

    pub fn all(&self) -> &[ExternalFragment] {
        &self.files
    }

    pub fn clear(&mut self) {
        self.files.clear();
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}
