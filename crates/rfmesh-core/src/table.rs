//! Master-side binding table
//!
//! Maps node identifiers to assigned logical addresses. The table is
//! insertion-ordered and small (at most [`crate::config::MAX_ADDRESSES`]
//! entries), so lookups are linear scans. Releasing a binding clears the
//! address but keeps the id in place, which makes re-assignment land in the
//! same slot.

use crate::address::{Addr, NodeId};
use crate::config::MAX_ADDRESSES;
use serde::{Deserialize, Serialize};

/// A node identifier bound to a logical address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Binding {
    pub id: NodeId,
    pub addr: Addr,
}

/// Insertion-ordered id ↔ address table
#[derive(Debug, Clone, Default)]
pub struct BindingTable {
    entries: Vec<Binding>,
}

impl BindingTable {
    /// Create an empty table with the full capacity reserved up front, so
    /// assignment never allocates mid-protocol.
    pub fn new() -> Self {
        Self {
            entries: Vec::with_capacity(MAX_ADDRESSES),
        }
    }

    /// Address currently bound to `id`; cleared entries are not lookup
    /// targets.
    pub fn address_of(&self, id: NodeId) -> Option<Addr> {
        self.entries
            .iter()
            .find(|binding| binding.id == id)
            .map(|binding| binding.addr)
            .filter(|addr| !addr.is_empty())
    }

    /// Id currently bound to `addr`
    pub fn id_at(&self, addr: Addr) -> Option<NodeId> {
        if addr.is_empty() {
            return None;
        }
        self.entries
            .iter()
            .find(|binding| binding.addr == addr)
            .map(|binding| binding.id)
    }

    /// Whether `addr` is held by a node other than `id`
    pub fn taken_by_other(&self, addr: Addr, id: NodeId) -> bool {
        self.entries
            .iter()
            .any(|binding| binding.addr == addr && binding.id != id)
    }

    /// Bind `id` to `addr`, replacing in place when the id is already
    /// present. Returns false when the table is full and the id is new.
    pub fn assign(&mut self, id: NodeId, addr: Addr) -> bool {
        if let Some(binding) = self.entries.iter_mut().find(|binding| binding.id == id) {
            binding.addr = addr;
            return true;
        }
        if self.entries.len() >= MAX_ADDRESSES {
            return false;
        }
        self.entries.push(Binding { id, addr });
        true
    }

    /// Clear every binding holding `addr`; the ids stay in place.
    pub fn release(&mut self, addr: Addr) -> usize {
        if addr.is_empty() {
            return 0;
        }
        let mut cleared = 0;
        for binding in &mut self.entries {
            if binding.addr == addr {
                binding.addr = Addr::EMPTY;
                cleared += 1;
            }
        }
        cleared
    }

    /// All entries in insertion order, cleared ones included
    pub fn entries(&self) -> &[Binding] {
        &self.entries
    }

    /// Number of entries (cleared ones included)
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the table has no entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
