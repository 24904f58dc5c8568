//! Per-resolution session state.

use askdb_core::SessionId;

/// The upstream session of one resolution, opened lazily.
///
/// History is replayed into a session once per lifetime; `history_replayed`
/// guards that.
#[derive(Debug, Default)]
pub struct Session {
    pub(crate) id: Option<SessionId>,
    pub(crate) history_replayed: bool,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn id(&self) -> Option<&SessionId> {
        self.id.as_ref()
    }

    pub fn is_open(&self) -> bool {
        self.id.is_some()
    }

    pub fn history_replayed(&self) -> bool {
        self.history_replayed
    }

    pub(crate) fn reset(&mut self) -> Option<SessionId> {
        self.history_replayed = false;
        self.id.take()
    }
}
