//! Field kinds: the capability table the change family dispatches through.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::change::cross_field::{CrossFieldKey, CrossFieldTable};
use crate::change::optional::OptionalFieldHandler;
use crate::change::sequence::SequenceFieldHandler;
use crate::change::FieldChangeset;
use crate::delta::{FieldChanges, FieldMap};
use crate::error::{Error, Result};
use crate::ids::{ChangeAtomId, FieldKindIdentifier, NodeId, RevisionTag};

/// How many children a field may hold.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum Multiplicity {
    /// Exactly one.
    Single,
    /// Zero or one.
    Optional,
    /// Any number.
    Sequence,
    /// Always empty.
    Forbidden,
}

impl Multiplicity {
    pub fn allows(self, len: usize) -> bool {
        match self {
            Multiplicity::Single => len == 1,
            Multiplicity::Optional => len <= 1,
            Multiplicity::Sequence => true,
            Multiplicity::Forbidden => len == 0,
        }
    }
}

/// Whether the node a nested change applies to is in the document after the base change.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum NodeAttachState {
    Attached,
    Detached,
}

/// A nested node change and where the node sits in the field before and after the change.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct NestedChange {
    pub node: NodeId,
    pub input_index: Option<usize>,
    pub output_index: Option<usize>,
}

pub trait ComposeNodeManager {
    /// Composes the nested changes of one node: `change1` from the first changeset's node
    /// table, `change2` from the second's.
    fn compose_child(
        &mut self,
        change1: Option<NodeId>,
        change2: Option<NodeId>,
    ) -> Result<Option<NodeId>>;
    fn gen_id(&mut self) -> ChangeAtomId;
    fn cross_field(&mut self) -> &mut CrossFieldTable;
}

pub trait RebaseNodeManager {
    fn rebase_child(
        &mut self,
        change: Option<NodeId>,
        base: Option<NodeId>,
        state: NodeAttachState,
    ) -> Result<Option<NodeId>>;
    fn gen_id(&mut self) -> ChangeAtomId;
    fn cross_field(&mut self) -> &mut CrossFieldTable;
    /// Whether content the base attaches at a gap goes before content the change attaches
    /// at the same gap.
    fn base_attaches_first(&self) -> bool;
}

pub trait InvertNodeManager {
    fn invert_child(&mut self, change: Option<NodeId>) -> Result<Option<NodeId>>;
    fn gen_id(&mut self) -> ChangeAtomId;
    fn cross_field(&mut self) -> &mut CrossFieldTable;
}

/// Editing surface a kind offers to the edit builder.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FieldEditor {
    Sequence,
    Optional,
    Unsupported,
}

pub trait FieldChangeHandler: Sync {
    fn create_empty(&self) -> FieldChangeset;
    fn is_empty(&self, change: &FieldChangeset) -> bool;
    fn compose(
        &self,
        change1: &FieldChangeset,
        change2: &FieldChangeset,
        context: &mut dyn ComposeNodeManager,
    ) -> Result<FieldChangeset>;
    fn invert(
        &self,
        change: &FieldChangeset,
        is_rollback: bool,
        context: &mut dyn InvertNodeManager,
    ) -> Result<FieldChangeset>;
    fn rebase(
        &self,
        change: &FieldChangeset,
        over: &FieldChangeset,
        context: &mut dyn RebaseNodeManager,
    ) -> Result<FieldChangeset>;
    fn prune(
        &self,
        change: &FieldChangeset,
        prune_child: &mut dyn FnMut(NodeId) -> Result<Option<NodeId>>,
    ) -> Result<FieldChangeset>;
    fn into_delta(
        &self,
        change: &FieldChangeset,
        delta_from_child: &mut dyn FnMut(NodeId) -> Result<FieldMap>,
    ) -> Result<FieldChanges>;
    fn get_nested_changes(&self, change: &FieldChangeset) -> Vec<NestedChange>;
    fn get_cross_field_keys(&self, change: &FieldChangeset) -> Vec<CrossFieldKey>;
    /// Fills in `revision` on every atom id that has none.
    fn tag(&self, change: &FieldChangeset, revision: RevisionTag) -> FieldChangeset;
    fn encode_json(&self, change: &FieldChangeset) -> Result<serde_json::Value>;
    fn decode_json(&self, encoded: &serde_json::Value) -> Result<FieldChangeset>;
    fn editor(&self) -> FieldEditor;
}

pub struct FieldKind {
    pub identifier: &'static str,
    pub multiplicity: Multiplicity,
    pub handler: &'static dyn FieldChangeHandler,
}

impl FieldKind {
    pub fn id(&self) -> FieldKindIdentifier {
        FieldKindIdentifier::new(self.identifier)
    }
}

impl fmt::Debug for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldKind")
            .field("identifier", &self.identifier)
            .field("multiplicity", &self.multiplicity)
            .finish_non_exhaustive()
    }
}

/// Fields that never change: nothing can be inserted, and identifiers are immutable.
pub struct NoChangeHandler;

impl FieldChangeHandler for NoChangeHandler {
    fn create_empty(&self) -> FieldChangeset {
        FieldChangeset::None
    }

    fn is_empty(&self, _change: &FieldChangeset) -> bool {
        true
    }

    fn compose(
        &self,
        _change1: &FieldChangeset,
        _change2: &FieldChangeset,
        _context: &mut dyn ComposeNodeManager,
    ) -> Result<FieldChangeset> {
        Ok(FieldChangeset::None)
    }

    fn invert(
        &self,
        _change: &FieldChangeset,
        _is_rollback: bool,
        _context: &mut dyn InvertNodeManager,
    ) -> Result<FieldChangeset> {
        Ok(FieldChangeset::None)
    }

    fn rebase(
        &self,
        _change: &FieldChangeset,
        _over: &FieldChangeset,
        _context: &mut dyn RebaseNodeManager,
    ) -> Result<FieldChangeset> {
        Ok(FieldChangeset::None)
    }

    fn prune(
        &self,
        _change: &FieldChangeset,
        _prune_child: &mut dyn FnMut(NodeId) -> Result<Option<NodeId>>,
    ) -> Result<FieldChangeset> {
        Ok(FieldChangeset::None)
    }

    fn into_delta(
        &self,
        _change: &FieldChangeset,
        _delta_from_child: &mut dyn FnMut(NodeId) -> Result<FieldMap>,
    ) -> Result<FieldChanges> {
        Ok(FieldChanges::default())
    }

    fn get_nested_changes(&self, _change: &FieldChangeset) -> Vec<NestedChange> {
        Vec::new()
    }

    fn get_cross_field_keys(&self, _change: &FieldChangeset) -> Vec<CrossFieldKey> {
        Vec::new()
    }

    fn tag(&self, _change: &FieldChangeset, _revision: RevisionTag) -> FieldChangeset {
        FieldChangeset::None
    }

    fn encode_json(&self, _change: &FieldChangeset) -> Result<serde_json::Value> {
        Ok(serde_json::Value::Null)
    }

    fn decode_json(&self, encoded: &serde_json::Value) -> Result<FieldChangeset> {
        if !encoded.is_null() {
            return Err(Error::malformed("changes to a field that cannot change"));
        }
        Ok(FieldChangeset::None)
    }

    fn editor(&self) -> FieldEditor {
        FieldEditor::Unsupported
    }
}

pub static FORBIDDEN: FieldKind = FieldKind {
    identifier: "Forbidden",
    multiplicity: Multiplicity::Forbidden,
    handler: &NoChangeHandler,
};

pub static VALUE: FieldKind = FieldKind {
    identifier: "Value",
    multiplicity: Multiplicity::Single,
    handler: &OptionalFieldHandler,
};

pub static OPTIONAL: FieldKind = FieldKind {
    identifier: "Optional",
    multiplicity: Multiplicity::Optional,
    handler: &OptionalFieldHandler,
};

pub static SEQUENCE: FieldKind = FieldKind {
    identifier: "Sequence",
    multiplicity: Multiplicity::Sequence,
    handler: &SequenceFieldHandler,
};

pub static IDENTIFIER: FieldKind = FieldKind {
    identifier: "Identifier",
    multiplicity: Multiplicity::Single,
    handler: &NoChangeHandler,
};

#[derive(Clone, Debug)]
pub struct FieldKindRegistry {
    kinds: BTreeMap<FieldKindIdentifier, &'static FieldKind>,
}

impl Default for FieldKindRegistry {
    fn default() -> Self {
        let mut registry = Self {
            kinds: BTreeMap::new(),
        };
        for kind in [&FORBIDDEN, &VALUE, &OPTIONAL, &SEQUENCE, &IDENTIFIER] {
            registry.register(kind);
        }
        registry
    }
}

impl FieldKindRegistry {
    pub fn register(&mut self, kind: &'static FieldKind) {
        self.kinds.insert(kind.id(), kind);
    }

    pub fn get(&self, id: &FieldKindIdentifier) -> Option<&'static FieldKind> {
        self.kinds.get(id).copied()
    }

    pub fn lookup(&self, id: &FieldKindIdentifier) -> Result<&'static FieldKind> {
        self.get(id)
            .ok_or_else(|| Error::malformed(format!("unknown field kind {id}")))
    }

    pub fn iter(&self) -> impl Iterator<Item = &'static FieldKind> + '_ {
        self.kinds.values().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_kinds_are_registered() {
        let registry = FieldKindRegistry::default();
        for name in ["Forbidden", "Value", "Optional", "Sequence", "Identifier"] {
            let kind = registry.lookup(&name.into()).unwrap();
            assert_eq!(kind.identifier, name);
        }
        assert!(matches!(
            registry.lookup(&"Bogus".into()),
            Err(Error::MalformedChange(_))
        ));
    }

    #[test]
    fn multiplicity_bounds() {
        assert!(Multiplicity::Single.allows(1));
        assert!(!Multiplicity::Single.allows(0));
        assert!(Multiplicity::Optional.allows(0));
        assert!(!Multiplicity::Optional.allows(2));
        assert!(Multiplicity::Sequence.allows(7));
        assert!(!Multiplicity::Forbidden.allows(1));
    }
}
