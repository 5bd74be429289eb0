//! Changesets for fields holding at most one node.
//!
//! A change may replace the field's content and may carry nested changes keyed by register:
//! `Local` is whatever the field held before the change, `Detached(id)` is detached content.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::change::cross_field::CrossFieldKey;
use crate::change::field_kind::{
    ComposeNodeManager, FieldChangeHandler, FieldEditor, InvertNodeManager, NestedChange,
    NodeAttachState, RebaseNodeManager,
};
use crate::change::FieldChangeset;
use crate::delta::{self, DetachedNodeChanges, DetachedNodeRename, FieldChanges, FieldMap};
use crate::error::{Error, Result};
use crate::ids::{ChangeAtomId, DetachedNodeId, NodeId, RevisionTag};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub enum RegisterId {
    Local,
    Detached(DetachedNodeId),
}

/// Detaches the current content (unless the field `is_empty`) to `dst` and attaches `src`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Replace {
    pub is_empty: bool,
    pub dst: DetachedNodeId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src: Option<DetachedNodeId>,
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct OptionalChangeset {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_replace: Option<Replace>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub child_changes: Vec<(RegisterId, NodeId)>,
    /// Content attached and then detached again by this change: `(old, new)`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub renames: Vec<(DetachedNodeId, DetachedNodeId)>,
}

static EMPTY: OptionalChangeset = OptionalChangeset {
    value_replace: None,
    child_changes: Vec::new(),
    renames: Vec::new(),
};

impl OptionalChangeset {
    pub fn is_empty(&self) -> bool {
        self.value_replace.is_none() && self.child_changes.is_empty() && self.renames.is_empty()
    }
}

/// Replaces the content with the detached content `src`.
pub fn set(src: DetachedNodeId, was_empty: bool, dst: ChangeAtomId) -> OptionalChangeset {
    OptionalChangeset {
        value_replace: Some(Replace {
            is_empty: was_empty,
            dst,
            src: Some(src),
        }),
        ..OptionalChangeset::default()
    }
}

pub fn clear(was_empty: bool, dst: ChangeAtomId) -> OptionalChangeset {
    if was_empty {
        return OptionalChangeset::default();
    }
    OptionalChangeset {
        value_replace: Some(Replace {
            is_empty: false,
            dst,
            src: None,
        }),
        ..OptionalChangeset::default()
    }
}

pub fn child_change(node: NodeId) -> OptionalChangeset {
    OptionalChangeset {
        child_changes: vec![(RegisterId::Local, node)],
        ..OptionalChangeset::default()
    }
}

fn without_noop(replace: Option<Replace>) -> Option<Replace> {
    replace.filter(|replace| !(replace.is_empty && replace.src.is_none()))
}

pub fn compose(
    change1: &OptionalChangeset,
    change2: &OptionalChangeset,
    context: &mut dyn ComposeNodeManager,
) -> Result<OptionalChangeset> {
    let mut renames: Vec<_> = change1.renames.clone();
    renames.extend(change2.renames.iter().copied());
    let value_replace = match (change1.value_replace, change2.value_replace) {
        (None, replace) | (replace, None) => replace,
        (Some(first), Some(second)) => {
            if let Some(src) = first.src.filter(|src| *src != second.dst) {
                renames.push((src, second.dst));
            }
            Some(Replace {
                is_empty: first.is_empty,
                dst: first.dst,
                src: second.src,
            })
        }
    };

    let mut children: BTreeMap<RegisterId, (Option<NodeId>, Option<NodeId>)> = BTreeMap::new();
    for (register, node) in &change1.child_changes {
        children.entry(*register).or_default().0 = Some(*node);
    }
    for (register, node) in &change2.child_changes {
        let register = match (*register, change1.value_replace) {
            (RegisterId::Local, Some(first)) => match first.src {
                Some(src) => RegisterId::Detached(src),
                None => return Err(Error::malformed("changes to a field the change emptied")),
            },
            (RegisterId::Local, None) => RegisterId::Local,
            (RegisterId::Detached(id), Some(first)) if !first.is_empty && first.dst == id => {
                RegisterId::Local
            }
            (RegisterId::Detached(id), _) => RegisterId::Detached(
                change1
                    .renames
                    .iter()
                    .find(|(_, new)| *new == id)
                    .map_or(id, |(old, _)| *old),
            ),
        };
        children.entry(register).or_default().1 = Some(*node);
    }
    let mut child_changes = Vec::new();
    for (register, (first, second)) in children {
        if let Some(node) = context.compose_child(first, second)? {
            child_changes.push((register, node));
        }
    }

    Ok(OptionalChangeset {
        value_replace: without_noop(value_replace),
        child_changes,
        renames,
    })
}

pub fn rebase(
    change: &OptionalChangeset,
    over: &OptionalChangeset,
    context: &mut dyn RebaseNodeManager,
) -> Result<OptionalChangeset> {
    let base_replace = over.value_replace;
    let value_replace = change.value_replace.map(|replace| match base_replace {
        Some(base) => Replace {
            is_empty: base.src.is_none(),
            ..replace
        },
        None => replace,
    });

    let mut children: BTreeMap<RegisterId, (Option<NodeId>, Option<NodeId>)> = BTreeMap::new();
    for (register, node) in &change.child_changes {
        children.entry(*register).or_default().0 = Some(*node);
    }
    for (register, node) in &over.child_changes {
        children.entry(*register).or_default().1 = Some(*node);
    }
    let mut rebased = BTreeMap::new();
    for (register, (own, base)) in children {
        let (target, state) = match (register, base_replace) {
            (RegisterId::Local, Some(base)) if !base.is_empty => {
                (RegisterId::Detached(base.dst), NodeAttachState::Detached)
            }
            (RegisterId::Local, _) => (RegisterId::Local, NodeAttachState::Attached),
            (RegisterId::Detached(id), Some(base)) if base.src == Some(id) => {
                (RegisterId::Local, NodeAttachState::Attached)
            }
            (RegisterId::Detached(id), _) => {
                let id = over
                    .renames
                    .iter()
                    .find(|(old, _)| *old == id)
                    .map_or(id, |(_, new)| *new);
                (RegisterId::Detached(id), NodeAttachState::Detached)
            }
        };
        if let Some(node) = context.rebase_child(own, base, state)? {
            rebased.entry(target).or_insert(node);
        }
    }

    Ok(OptionalChangeset {
        value_replace: without_noop(value_replace),
        child_changes: rebased.into_iter().collect(),
        renames: change.renames.clone(),
    })
}

pub fn invert(
    change: &OptionalChangeset,
    is_rollback: bool,
    context: &mut dyn InvertNodeManager,
) -> Result<OptionalChangeset> {
    let replace = change.value_replace;
    let value_replace = match replace {
        Some(replace) => {
            let dst = match (is_rollback, replace.src) {
                (true, Some(src)) => src,
                _ => context.gen_id(),
            };
            Some(Replace {
                is_empty: replace.src.is_none(),
                dst,
                src: (!replace.is_empty).then_some(replace.dst),
            })
        }
        None => None,
    };
    let mut child_changes = Vec::with_capacity(change.child_changes.len());
    for (register, node) in &change.child_changes {
        let register = match (*register, replace) {
            (RegisterId::Local, Some(replace)) if !replace.is_empty => {
                RegisterId::Detached(replace.dst)
            }
            (RegisterId::Detached(id), Some(replace)) if replace.src == Some(id) => {
                RegisterId::Local
            }
            (register, _) => register,
        };
        if let Some(node) = context.invert_child(Some(*node))? {
            child_changes.push((register, node));
        }
    }
    child_changes.sort();
    Ok(OptionalChangeset {
        value_replace: without_noop(value_replace),
        child_changes,
        renames: change.renames.iter().map(|(old, new)| (*new, *old)).collect(),
    })
}

pub fn prune(
    change: &OptionalChangeset,
    prune_child: &mut dyn FnMut(NodeId) -> Result<Option<NodeId>>,
) -> Result<OptionalChangeset> {
    let mut child_changes = Vec::with_capacity(change.child_changes.len());
    for (register, node) in &change.child_changes {
        if let Some(node) = prune_child(*node)? {
            child_changes.push((*register, node));
        }
    }
    Ok(OptionalChangeset {
        value_replace: change.value_replace,
        child_changes,
        renames: change.renames.clone(),
    })
}

pub fn into_delta(
    change: &OptionalChangeset,
    delta_from_child: &mut dyn FnMut(NodeId) -> Result<FieldMap>,
) -> Result<FieldChanges> {
    let mut result = FieldChanges::default();
    let mut local = None;
    for (register, node) in &change.child_changes {
        let fields = delta_from_child(*node)?;
        if fields.is_empty() {
            continue;
        }
        match register {
            RegisterId::Local => local = Some(fields),
            RegisterId::Detached(id) => result.global.push(DetachedNodeChanges { id: *id, fields }),
        }
    }
    match change.value_replace {
        Some(replace) => {
            let detach = (!replace.is_empty).then_some(replace.dst);
            if detach.is_some() || replace.src.is_some() {
                result.local.push(delta::Mark {
                    count: 1,
                    attach: replace.src,
                    detach,
                    fields: detach.and(local),
                });
            }
        }
        None => {
            if let Some(fields) = local {
                result.local.push(delta::Mark::modify(fields));
            }
        }
    }
    result.rename = change
        .renames
        .iter()
        .map(|(old, new)| DetachedNodeRename {
            count: 1,
            old_id: *old,
            new_id: *new,
        })
        .collect();
    Ok(result)
}

fn nested_changes(change: &OptionalChangeset) -> Vec<NestedChange> {
    let replace = change.value_replace;
    change
        .child_changes
        .iter()
        .map(|(register, node)| {
            let (input_index, output_index) = match (register, replace) {
                (RegisterId::Local, None) => (Some(0), Some(0)),
                (RegisterId::Local, Some(_)) => (Some(0), None),
                (RegisterId::Detached(id), Some(replace)) if replace.src == Some(*id) => {
                    (None, Some(0))
                }
                (RegisterId::Detached(_), _) => (None, None),
            };
            NestedChange {
                node: *node,
                input_index,
                output_index,
            }
        })
        .collect()
}

fn tag(change: &OptionalChangeset, revision: RevisionTag) -> OptionalChangeset {
    let stamp = |id: ChangeAtomId| id.tagged(Some(revision));
    OptionalChangeset {
        value_replace: change.value_replace.map(|replace| Replace {
            is_empty: replace.is_empty,
            dst: stamp(replace.dst),
            src: replace.src.map(stamp),
        }),
        child_changes: change
            .child_changes
            .iter()
            .map(|(register, node)| match register {
                RegisterId::Local => (RegisterId::Local, *node),
                RegisterId::Detached(id) => (RegisterId::Detached(stamp(*id)), *node),
            })
            .collect(),
        renames: change
            .renames
            .iter()
            .map(|(old, new)| (stamp(*old), stamp(*new)))
            .collect(),
    }
}

fn expect_optional(change: &FieldChangeset) -> Result<&OptionalChangeset> {
    match change {
        FieldChangeset::Optional(change) => Ok(change),
        FieldChangeset::None => Ok(&EMPTY),
        FieldChangeset::Sequence(_) => Err(Error::malformed(
            "sequence field changeset given to an optional kind",
        )),
    }
}

pub struct OptionalFieldHandler;

impl FieldChangeHandler for OptionalFieldHandler {
    fn create_empty(&self) -> FieldChangeset {
        FieldChangeset::Optional(OptionalChangeset::default())
    }

    fn is_empty(&self, change: &FieldChangeset) -> bool {
        expect_optional(change).map_or(false, OptionalChangeset::is_empty)
    }

    fn compose(
        &self,
        change1: &FieldChangeset,
        change2: &FieldChangeset,
        context: &mut dyn ComposeNodeManager,
    ) -> Result<FieldChangeset> {
        compose(expect_optional(change1)?, expect_optional(change2)?, context)
            .map(FieldChangeset::Optional)
    }

    fn invert(
        &self,
        change: &FieldChangeset,
        is_rollback: bool,
        context: &mut dyn InvertNodeManager,
    ) -> Result<FieldChangeset> {
        invert(expect_optional(change)?, is_rollback, context).map(FieldChangeset::Optional)
    }

    fn rebase(
        &self,
        change: &FieldChangeset,
        over: &FieldChangeset,
        context: &mut dyn RebaseNodeManager,
    ) -> Result<FieldChangeset> {
        rebase(expect_optional(change)?, expect_optional(over)?, context)
            .map(FieldChangeset::Optional)
    }

    fn prune(
        &self,
        change: &FieldChangeset,
        prune_child: &mut dyn FnMut(NodeId) -> Result<Option<NodeId>>,
    ) -> Result<FieldChangeset> {
        prune(expect_optional(change)?, prune_child).map(FieldChangeset::Optional)
    }

    fn into_delta(
        &self,
        change: &FieldChangeset,
        delta_from_child: &mut dyn FnMut(NodeId) -> Result<FieldMap>,
    ) -> Result<FieldChanges> {
        into_delta(expect_optional(change)?, delta_from_child)
    }

    fn get_nested_changes(&self, change: &FieldChangeset) -> Vec<NestedChange> {
        expect_optional(change).map_or_else(|_| Vec::new(), nested_changes)
    }

    fn get_cross_field_keys(&self, _change: &FieldChangeset) -> Vec<CrossFieldKey> {
        Vec::new()
    }

    fn tag(&self, change: &FieldChangeset, revision: RevisionTag) -> FieldChangeset {
        match change {
            FieldChangeset::Optional(change) => FieldChangeset::Optional(tag(change, revision)),
            other => other.clone(),
        }
    }

    fn encode_json(&self, change: &FieldChangeset) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(expect_optional(change)?)?)
    }

    fn decode_json(&self, encoded: &serde_json::Value) -> Result<FieldChangeset> {
        Ok(FieldChangeset::Optional(OptionalChangeset::deserialize(
            encoded,
        )?))
    }

    fn editor(&self) -> FieldEditor {
        FieldEditor::Optional
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::cross_field::CrossFieldTable;

    fn id(local: u32) -> ChangeAtomId {
        ChangeAtomId::new(None, local)
    }

    #[derive(Default)]
    struct Passthrough {
        table: CrossFieldTable,
        next: u32,
        states: Vec<NodeAttachState>,
    }

    impl ComposeNodeManager for Passthrough {
        fn compose_child(&mut self, a: Option<NodeId>, b: Option<NodeId>) -> Result<Option<NodeId>> {
            Ok(b.or(a))
        }
        fn gen_id(&mut self) -> ChangeAtomId {
            self.next += 1;
            id(100 + self.next)
        }
        fn cross_field(&mut self) -> &mut CrossFieldTable {
            &mut self.table
        }
    }

    impl RebaseNodeManager for Passthrough {
        fn rebase_child(
            &mut self,
            a: Option<NodeId>,
            _b: Option<NodeId>,
            state: NodeAttachState,
        ) -> Result<Option<NodeId>> {
            if a.is_some() {
                self.states.push(state);
            }
            Ok(a)
        }
        fn gen_id(&mut self) -> ChangeAtomId {
            self.next += 1;
            id(100 + self.next)
        }
        fn cross_field(&mut self) -> &mut CrossFieldTable {
            &mut self.table
        }
        fn base_attaches_first(&self) -> bool {
            true
        }
    }

    impl InvertNodeManager for Passthrough {
        fn invert_child(&mut self, a: Option<NodeId>) -> Result<Option<NodeId>> {
            Ok(a)
        }
        fn gen_id(&mut self) -> ChangeAtomId {
            self.next += 1;
            id(100 + self.next)
        }
        fn cross_field(&mut self) -> &mut CrossFieldTable {
            &mut self.table
        }
    }

    #[test]
    fn set_then_set_renames_intermediate_content() {
        let mut ctx = Passthrough::default();
        let composed = compose(&set(id(1), false, id(2)), &set(id(3), false, id(4)), &mut ctx).unwrap();
        assert_eq!(
            composed.value_replace,
            Some(Replace {
                is_empty: false,
                dst: id(2),
                src: Some(id(3))
            })
        );
        assert_eq!(composed.renames, vec![(id(1), id(4))]);
    }

    #[test]
    fn set_then_clear_of_empty_field_is_empty() {
        let mut ctx = Passthrough::default();
        let composed = compose(&set(id(1), true, id(2)), &clear(false, id(1)), &mut ctx).unwrap();
        assert_eq!(composed.value_replace, None);
        assert!(composed.is_empty());
    }

    #[test]
    fn edit_under_concurrent_replace_moves_to_detached_register() {
        let mut ctx = Passthrough::default();
        let edit = child_change(id(50));
        let rebased = rebase(&edit, &set(id(1), false, id(2)), &mut ctx).unwrap();
        assert_eq!(
            rebased.child_changes,
            vec![(RegisterId::Detached(id(2)), id(50))]
        );
        assert_eq!(ctx.states, vec![NodeAttachState::Detached]);
    }

    #[test]
    fn concurrent_set_detaches_base_content() {
        let mut ctx = Passthrough::default();
        let rebased = rebase(&set(id(5), true, id(6)), &set(id(1), true, id(2)), &mut ctx).unwrap();
        assert_eq!(
            rebased.value_replace,
            Some(Replace {
                is_empty: false,
                dst: id(6),
                src: Some(id(5))
            })
        );
    }

    #[test]
    fn rollback_restores_previous_content() {
        let mut ctx = Passthrough::default();
        let mut change = set(id(1), false, id(2));
        change.child_changes.push((RegisterId::Local, id(40)));
        let inverse = invert(&change, true, &mut ctx).unwrap();
        assert_eq!(
            inverse.value_replace,
            Some(Replace {
                is_empty: false,
                dst: id(1),
                src: Some(id(2))
            })
        );
        assert_eq!(
            inverse.child_changes,
            vec![(RegisterId::Detached(id(2)), id(40))]
        );
    }

    #[test]
    fn replace_becomes_one_mark() {
        let change = set(id(1), false, id(2));
        let changes = into_delta(&change, &mut |_| Ok(FieldMap::new())).unwrap();
        assert_eq!(
            changes.local,
            vec![delta::Mark {
                count: 1,
                attach: Some(id(1)),
                detach: Some(id(2)),
                fields: None
            }]
        );
    }
}
