//! Communication between fields whose changes affect each other (move sources and
//! destinations).
//!
//! Family operations run in passes. A pass records every value it reads; if a field later
//! in the same pass writes a different value for a key that was already read, the pass is
//! inconsistent and the operation runs again, starting from the values written last time.

use std::collections::BTreeMap;

use crate::ids::{ChangeAtomId, NodeId};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum CrossFieldTarget {
    Source,
    Destination,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct CrossFieldKey {
    pub target: CrossFieldTarget,
    pub id: ChangeAtomId,
}

impl CrossFieldKey {
    pub fn source(id: ChangeAtomId) -> Self {
        Self {
            target: CrossFieldTarget::Source,
            id,
        }
    }

    pub fn destination(id: ChangeAtomId) -> Self {
        Self {
            target: CrossFieldTarget::Destination,
            id,
        }
    }
}

/// How a node leaves its field.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DetachEffect {
    Remove(ChangeAtomId),
    MoveOut(ChangeAtomId),
}

/// Information one end of a move passes to the other. Node ids always refer to the input
/// changesets' node tables, never to the output being built.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum MoveEffect {
    /// Compose: what the second change did to the node a move of the first change delivered.
    SourceUpdate {
        detach: Option<DetachEffect>,
        changes: Option<NodeId>,
    },
    /// Compose: the moved content was inserted by the first change, so the destination
    /// becomes an insert of that content.
    BecomesInsert {
        id: ChangeAtomId,
        changes1: Option<NodeId>,
        changes2: Option<NodeId>,
    },
    /// Rebase: the base moved a node this change touches; the effect follows the node.
    Follow {
        changes: Option<NodeId>,
        base_changes: Option<NodeId>,
        detach: Option<DetachEffect>,
    },
    /// Rebase: the source of this move was detached by the base.
    Muted,
    /// Invert: nested changes travelling from the move source to its destination.
    Changes(Option<NodeId>),
}

#[derive(Debug, Default)]
pub struct CrossFieldTable {
    current: BTreeMap<CrossFieldKey, MoveEffect>,
    previous: BTreeMap<CrossFieldKey, MoveEffect>,
    reads: BTreeMap<CrossFieldKey, Option<MoveEffect>>,
}

impl CrossFieldTable {
    pub fn get(&mut self, key: CrossFieldKey) -> Option<MoveEffect> {
        let value = self
            .current
            .get(&key)
            .or_else(|| self.previous.get(&key))
            .cloned();
        self.reads.entry(key).or_insert_with(|| value.clone());
        value
    }

    pub fn set(&mut self, key: CrossFieldKey, value: MoveEffect) {
        self.current.insert(key, value);
    }

    pub(crate) fn begin_pass(&mut self) {
        self.previous = std::mem::take(&mut self.current);
        self.reads.clear();
    }

    /// Every read this pass saw the value the pass ended up writing.
    pub(crate) fn is_consistent(&self) -> bool {
        self.reads
            .iter()
            .all(|(key, seen)| self.current.get(key) == seen.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn late_write_invalidates_pass() {
        let key = CrossFieldKey::source(ChangeAtomId::new(None, 1));
        let mut table = CrossFieldTable::default();
        table.begin_pass();
        assert_eq!(table.get(key), None);
        table.set(key, MoveEffect::Muted);
        assert!(!table.is_consistent());

        table.begin_pass();
        assert_eq!(table.get(key), Some(MoveEffect::Muted));
        table.set(key, MoveEffect::Muted);
        assert!(table.is_consistent());
    }

    #[test]
    fn stale_value_invalidates_pass() {
        let key = CrossFieldKey::destination(ChangeAtomId::new(None, 2));
        let mut table = CrossFieldTable::default();
        table.begin_pass();
        table.set(key, MoveEffect::Muted);
        table.begin_pass();
        assert!(table.get(key).is_some());
        assert!(!table.is_consistent());
    }
}
