//! Append-only record of what a session created.

use crate::provision::{ResourceHandle, ResourceKind};

/// One recorded resource.
#[derive(Debug, Clone, PartialEq)]
pub struct RegistryEntry {
    pub handle: ResourceHandle,
    /// Set once teardown has removed (or given up on owning) the resource.
    pub released: bool,
}

/// Resources in creation order.
///
/// Entries are never reordered or dropped; teardown only flips `released`.
#[derive(Debug, Default)]
pub struct Registry {
    entries: Vec<RegistryEntry>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a freshly created resource.
    pub fn record(&mut self, handle: ResourceHandle) {
        tracing::debug!(kind = %handle.kind, id = %handle.id, "recorded {}", handle.name);
        self.entries.push(RegistryEntry {
            handle,
            released: false,
        });
    }

    pub fn entries(&self) -> &[RegistryEntry] {
        &self.entries
    }

    /// Positions of unreleased entries, newest first.
    pub fn live_positions_newest_first(&self) -> Vec<usize> {
        self.entries
            .iter()
            .enumerate()
            .rev()
            .filter(|(_, e)| !e.released)
            .map(|(i, _)| i)
            .collect()
    }

    pub fn handle(&self, position: usize) -> Option<&ResourceHandle> {
        self.entries.get(position).map(|e| &e.handle)
    }

    pub fn release(&mut self, position: usize) {
        if let Some(entry) = self.entries.get_mut(position) {
            entry.released = true;
        }
    }

    /// Unreleased handles in creation order.
    pub fn live(&self) -> impl Iterator<Item = &ResourceHandle> {
        self.entries
            .iter()
            .filter(|e| !e.released)
            .map(|e| &e.handle)
    }

    /// Newest unreleased handle of `kind`.
    pub fn live_of_kind(&self, kind: ResourceKind) -> Option<&ResourceHandle> {
        self.entries
            .iter()
            .rev()
            .find(|e| !e.released && e.handle.kind == kind)
            .map(|e| &e.handle)
    }

    /// Number of unreleased resources the session owns.
    pub fn owned_live_count(&self) -> usize {
        self.live().filter(|h| h.is_owned()).count()
    }

    /// Replace the stored snapshot of a live handle.
    pub fn update(&mut self, handle: &ResourceHandle) {
        if let Some(entry) = self
            .entries
            .iter_mut()
            .find(|e| !e.released && e.handle.kind == handle.kind && e.handle.id == handle.id)
        {
            entry.handle = handle.clone();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
