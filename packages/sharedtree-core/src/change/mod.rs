//! Changesets and the change family: compose, invert, rebase, prune and conversion to
//! deltas, dispatched per field through the field kind capability table.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::forest::TreeChunk;
use crate::ids::{ChangeAtomId, FieldKey, FieldKindIdentifier, NodeId, RevisionTag};

pub mod builder;
pub mod codec;
pub mod cross_field;
pub mod family;
pub mod field_kind;
pub mod id_allocator;
pub mod optional;
pub mod sequence;

pub use builder::{KindResolver, ModularEditBuilder, SequenceKinds};
pub use cross_field::{CrossFieldKey, CrossFieldTable, CrossFieldTarget, MoveEffect};
pub use family::ChangeFamily;
pub use field_kind::{
    FieldChangeHandler, FieldKind, FieldKindRegistry, Multiplicity, NodeAttachState,
};
pub use id_allocator::IdAllocator;
pub use optional::{OptionalChangeset, RegisterId, Replace};
pub use sequence::{MarkEffect, SequenceChangeset};

pub type FieldChangeMap = BTreeMap<FieldKey, FieldChange>;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ModularChangeset {
    pub field_changes: FieldChangeMap,
    /// Nested changes, addressed by the node ids the field changesets hold.
    pub node_changes: BTreeMap<NodeId, NodeChangeset>,
    /// Content created by this change, keyed by the id of its first node.
    pub builds: BTreeMap<ChangeAtomId, TreeChunk>,
    /// Highest untagged local id in use.
    pub max_id: Option<u32>,
}

impl ModularChangeset {
    pub fn empty() -> Self {
        Self::default()
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct NodeChangeset {
    pub field_changes: FieldChangeMap,
}

#[derive(Clone, Debug, PartialEq)]
pub struct FieldChange {
    pub kind: FieldKindIdentifier,
    pub change: FieldChangeset,
}

#[derive(Clone, Debug, PartialEq)]
pub enum FieldChangeset {
    None,
    Optional(OptionalChangeset),
    Sequence(SequenceChangeset),
}

/// A changeset together with the revision it was (or will be) committed under.
#[derive(Clone, Debug, PartialEq)]
pub struct TaggedChange {
    pub revision: Option<RevisionTag>,
    pub change: ModularChangeset,
}

impl TaggedChange {
    pub fn new(revision: Option<RevisionTag>, change: ModularChangeset) -> Self {
        Self { revision, change }
    }

    pub fn untagged(change: ModularChangeset) -> Self {
        Self::new(None, change)
    }
}

/// The total order revisions were sequenced in.
#[derive(Clone, Debug, Default)]
pub struct RevisionMetadata {
    order: BTreeMap<RevisionTag, u64>,
}

impl RevisionMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, revision: RevisionTag, seq: u64) -> Self {
        self.insert(revision, seq);
        self
    }

    pub fn insert(&mut self, revision: RevisionTag, seq: u64) {
        self.order.insert(revision, seq);
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn sequence_of(&self, revision: RevisionTag) -> Option<u64> {
        self.order.get(&revision).copied()
    }

    /// Sequenced revisions order by sequence number and precede unsequenced ones. Ties
    /// fall back to the authoring session. Untagged changes compare equal to everything
    /// they are not sequenced against.
    pub fn compare(&self, a: Option<RevisionTag>, b: Option<RevisionTag>) -> Ordering {
        let seq = |revision: Option<RevisionTag>| revision.and_then(|r| self.sequence_of(r));
        let by_session = || match (a, b) {
            (Some(a), Some(b)) => a.session.cmp(&b.session),
            _ => Ordering::Equal,
        };
        match (seq(a), seq(b)) {
            (Some(x), Some(y)) => x.cmp(&y).then_with(by_session),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => by_session(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::SessionId;

    #[test]
    fn metadata_orders_sequenced_first() {
        let session = SessionId::from_u128(1);
        let a = RevisionTag::new(session, 1);
        let b = RevisionTag::new(session, 2);
        let metadata = RevisionMetadata::new().with(a, 10).with(b, 4);
        assert_eq!(metadata.compare(Some(a), Some(b)), Ordering::Greater);
        assert_eq!(metadata.compare(Some(b), None), Ordering::Less);
        assert_eq!(metadata.compare(None, None), Ordering::Equal);
    }

    #[test]
    fn metadata_breaks_ties_by_session() {
        let a = RevisionTag::new(SessionId::from_u128(1), 7);
        let b = RevisionTag::new(SessionId::from_u128(2), 3);
        let unsequenced = RevisionMetadata::new();
        assert_eq!(unsequenced.compare(Some(a), Some(b)), Ordering::Less);
        assert_eq!(unsequenced.compare(Some(b), Some(a)), Ordering::Greater);

        let same_seq = RevisionMetadata::new().with(a, 5).with(b, 5);
        assert_eq!(same_seq.compare(Some(a), Some(b)), Ordering::Less);
        assert_eq!(same_seq.compare(Some(b), Some(a)), Ordering::Greater);

        let own = RevisionTag::new(SessionId::from_u128(1), 8);
        assert_eq!(unsequenced.compare(Some(a), Some(own)), Ordering::Equal);
    }
}
