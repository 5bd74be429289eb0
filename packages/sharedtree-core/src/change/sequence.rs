//! Sequence field changesets: a list of marks walking the field's content in order.
//!
//! Marks that detach refer to the content before the change, marks that attach to the
//! content after it, and skips to content present in both. Nested changes to a moved node
//! travel with its `MoveOut`; the matching `MoveIn` never carries any.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::change::cross_field::{CrossFieldKey, DetachEffect, MoveEffect};
use crate::change::field_kind::{
    ComposeNodeManager, FieldChangeHandler, FieldEditor, InvertNodeManager, NestedChange,
    NodeAttachState, RebaseNodeManager,
};
use crate::change::FieldChangeset;
use crate::delta::{
    self, push_mark, trim_skips, DetachedNodeChanges, DetachedNodeRename, FieldChanges, FieldMap,
};
use crate::error::{Error, Result};
use crate::ids::{ChangeAtomId, DetachedNodeId, NodeId, RevisionTag};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum MarkEffect {
    Skip,
    /// Attaches detached content: built by this change, or revived.
    Insert { id: ChangeAtomId },
    MoveIn { id: ChangeAtomId },
    Remove { id: ChangeAtomId },
    MoveOut { id: ChangeAtomId },
}

impl MarkEffect {
    pub fn id(self) -> Option<ChangeAtomId> {
        match self {
            MarkEffect::Skip => None,
            MarkEffect::Insert { id }
            | MarkEffect::MoveIn { id }
            | MarkEffect::Remove { id }
            | MarkEffect::MoveOut { id } => Some(id),
        }
    }

    pub fn is_attach(self) -> bool {
        matches!(self, MarkEffect::Insert { .. } | MarkEffect::MoveIn { .. })
    }

    pub fn is_detach(self) -> bool {
        matches!(self, MarkEffect::Remove { .. } | MarkEffect::MoveOut { .. })
    }

    /// The effect on the node `by` positions into a mark.
    pub fn offset(self, by: u32) -> Self {
        self.map_id(|id| id.offset(by))
    }

    fn tagged(self, revision: RevisionTag) -> Self {
        self.map_id(|id| id.tagged(Some(revision)))
    }

    fn map_id(self, f: impl FnOnce(ChangeAtomId) -> ChangeAtomId) -> Self {
        match self {
            MarkEffect::Skip => MarkEffect::Skip,
            MarkEffect::Insert { id } => MarkEffect::Insert { id: f(id) },
            MarkEffect::MoveIn { id } => MarkEffect::MoveIn { id: f(id) },
            MarkEffect::Remove { id } => MarkEffect::Remove { id: f(id) },
            MarkEffect::MoveOut { id } => MarkEffect::MoveOut { id: f(id) },
        }
    }

    fn as_detach(self) -> Option<DetachEffect> {
        match self {
            MarkEffect::Remove { id } => Some(DetachEffect::Remove(id)),
            MarkEffect::MoveOut { id } => Some(DetachEffect::MoveOut(id)),
            _ => None,
        }
    }
}

impl From<DetachEffect> for MarkEffect {
    fn from(effect: DetachEffect) -> Self {
        match effect {
            DetachEffect::Remove(id) => MarkEffect::Remove { id },
            DetachEffect::MoveOut(id) => MarkEffect::MoveOut { id },
        }
    }
}

/// `count` adjacent nodes handled alike. Only single-node marks carry nested changes.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Mark {
    pub count: u32,
    pub effect: MarkEffect,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub changes: Option<NodeId>,
}

impl Mark {
    pub fn new(count: u32, effect: MarkEffect) -> Self {
        Self {
            count,
            effect,
            changes: None,
        }
    }

    pub fn with_changes(mut self, changes: NodeId) -> Self {
        self.changes = Some(changes);
        self
    }
}

/// Content attached and then detached again by the same change.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Rename {
    pub old: DetachedNodeId,
    pub new: DetachedNodeId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub changes: Option<NodeId>,
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct SequenceChangeset {
    pub marks: Vec<Mark>,
    /// Changes to content that stays detached, keyed by its detached id.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub detached_changes: Vec<(DetachedNodeId, NodeId)>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub renames: Vec<Rename>,
}

static EMPTY: SequenceChangeset = SequenceChangeset {
    marks: Vec::new(),
    detached_changes: Vec::new(),
    renames: Vec::new(),
};

impl SequenceChangeset {
    pub fn from_marks(marks: Vec<Mark>) -> Self {
        Self {
            marks,
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.marks
            .iter()
            .all(|mark| mark.effect == MarkEffect::Skip && mark.changes.is_none())
            && self.detached_changes.is_empty()
            && self.renames.is_empty()
    }
}

pub fn insert(index: usize, count: u32, id: ChangeAtomId) -> SequenceChangeset {
    at(index, vec![Mark::new(count, MarkEffect::Insert { id })])
}

pub fn remove(index: usize, count: u32, id: ChangeAtomId) -> SequenceChangeset {
    at(index, vec![Mark::new(count, MarkEffect::Remove { id })])
}

pub fn modify(index: usize, node: NodeId) -> SequenceChangeset {
    at(index, vec![Mark::new(1, MarkEffect::Skip).with_changes(node)])
}

pub fn move_out(index: usize, count: u32, id: ChangeAtomId) -> SequenceChangeset {
    at(index, vec![Mark::new(count, MarkEffect::MoveOut { id })])
}

pub fn move_in(index: usize, count: u32, id: ChangeAtomId) -> SequenceChangeset {
    at(index, vec![Mark::new(count, MarkEffect::MoveIn { id })])
}

/// Moves `count` nodes starting at `source` to the gap before input position `destination`.
pub fn move_within(
    source: usize,
    count: u32,
    destination: usize,
    id: ChangeAtomId,
) -> SequenceChangeset {
    let out = Mark::new(count, MarkEffect::MoveOut { id });
    let into = Mark::new(count, MarkEffect::MoveIn { id });
    let end = source + count as usize;
    if destination < source {
        let mut marks = skip_marks(destination);
        marks.push(into);
        marks.extend(skip_marks(source - destination));
        marks.push(out);
        SequenceChangeset::from_marks(marks)
    } else {
        let mut marks = skip_marks(source);
        marks.push(out);
        marks.extend(skip_marks(destination.saturating_sub(end)));
        marks.push(into);
        SequenceChangeset::from_marks(marks)
    }
}

fn at(index: usize, marks: Vec<Mark>) -> SequenceChangeset {
    let mut all = skip_marks(index);
    all.extend(marks);
    SequenceChangeset::from_marks(all)
}

fn skip_marks(count: usize) -> Vec<Mark> {
    if count == 0 {
        Vec::new()
    } else {
        vec![Mark::new(count as u32, MarkEffect::Skip)]
    }
}

/// One node's worth of a mark.
#[derive(Clone, Copy, Debug, PartialEq)]
struct Cell {
    effect: MarkEffect,
    changes: Option<NodeId>,
}

impl Cell {
    const SKIP: Cell = Cell {
        effect: MarkEffect::Skip,
        changes: None,
    };

    fn new(effect: MarkEffect, changes: Option<NodeId>) -> Self {
        Self { effect, changes }
    }
}

fn explode(marks: &[Mark]) -> Result<Vec<Cell>> {
    let mut cells = Vec::new();
    for mark in marks {
        if mark.changes.is_some() && mark.count != 1 {
            return Err(Error::malformed(
                "sequence mark with nested changes spans several nodes",
            ));
        }
        cells.extend((0..mark.count).map(|offset| Cell::new(mark.effect.offset(offset), mark.changes)));
    }
    Ok(cells)
}

fn normalize(cells: Vec<Cell>) -> Vec<Mark> {
    let mut marks: Vec<Mark> = Vec::new();
    for cell in cells {
        if let Some(last) = marks.last_mut() {
            if last.changes.is_none()
                && cell.changes.is_none()
                && last.effect.offset(last.count) == cell.effect
            {
                last.count += 1;
                continue;
            }
        }
        marks.push(Mark {
            count: 1,
            effect: cell.effect,
            changes: cell.changes,
        });
    }
    while marks
        .last()
        .is_some_and(|mark| mark.effect == MarkEffect::Skip && mark.changes.is_none())
    {
        marks.pop();
    }
    marks
}

fn sorted(map: BTreeMap<DetachedNodeId, NodeId>) -> Vec<(DetachedNodeId, NodeId)> {
    map.into_iter().collect()
}

pub fn compose(
    change1: &SequenceChangeset,
    change2: &SequenceChangeset,
    context: &mut dyn ComposeNodeManager,
) -> Result<SequenceChangeset> {
    let cells1 = explode(&change1.marks)?;
    let cells2 = explode(&change2.marks)?;
    let mut detached1: BTreeMap<_, _> = change1.detached_changes.iter().copied().collect();
    let mut detached2: BTreeMap<_, _> = change2.detached_changes.iter().copied().collect();
    let mut detached = BTreeMap::new();
    let mut renames = Vec::new();
    let mut out = Vec::new();
    let (mut i, mut j) = (0, 0);
    loop {
        // Content the first change detaches is not part of the second change's input.
        if let Some(cell) = cells1.get(i).filter(|cell| cell.effect.is_detach()).copied() {
            i += 1;
            let update = match cell.effect {
                MarkEffect::MoveOut { id } => context.cross_field().get(CrossFieldKey::source(id)),
                _ => None,
            };
            match (cell.effect, update) {
                (_, Some(MoveEffect::SourceUpdate { detach, changes })) => {
                    let effect = detach.map_or(cell.effect, MarkEffect::from);
                    let changes = context.compose_child(cell.changes, changes)?;
                    out.push(Cell::new(effect, changes));
                }
                (MarkEffect::Remove { id }, _) => {
                    let later = detached2.remove(&id);
                    out.push(Cell::new(cell.effect, context.compose_child(cell.changes, later)?));
                }
                _ => out.push(Cell::new(cell.effect, context.compose_child(cell.changes, None)?)),
            }
            continue;
        }
        // Content the second change attaches is not part of its input.
        if let Some(cell) = cells2.get(j).filter(|cell| cell.effect.is_attach()).copied() {
            j += 1;
            match cell.effect {
                MarkEffect::Insert { id } => {
                    let earlier = detached1.remove(&id);
                    out.push(Cell::new(cell.effect, context.compose_child(earlier, cell.changes)?));
                }
                MarkEffect::MoveIn { id } => {
                    match context.cross_field().get(CrossFieldKey::destination(id)) {
                        Some(MoveEffect::BecomesInsert {
                            id,
                            changes1,
                            changes2,
                        }) => {
                            let changes = context.compose_child(changes1, changes2)?;
                            out.push(Cell::new(MarkEffect::Insert { id }, changes));
                        }
                        _ => out.push(Cell::new(
                            cell.effect,
                            context.compose_child(None, cell.changes)?,
                        )),
                    }
                }
                _ => {}
            }
            continue;
        }
        let (first, second) = (cells1.get(i).copied(), cells2.get(j).copied());
        if first.is_none() && second.is_none() {
            break;
        }
        i += usize::from(first.is_some());
        j += usize::from(second.is_some());
        let first = first.unwrap_or(Cell::SKIP);
        let second = second.unwrap_or(Cell::SKIP);
        match (first.effect, second.effect) {
            (MarkEffect::Skip, _) => {
                let changes = context.compose_child(first.changes, second.changes)?;
                out.push(Cell::new(second.effect, changes));
            }
            (MarkEffect::Insert { .. }, MarkEffect::Skip) => {
                let changes = context.compose_child(first.changes, second.changes)?;
                out.push(Cell::new(first.effect, changes));
            }
            (MarkEffect::Insert { id }, MarkEffect::Remove { id: new }) => {
                let changes = context.compose_child(first.changes, second.changes)?;
                if id == new {
                    if let Some(changes) = changes {
                        detached.insert(id, changes);
                    }
                } else {
                    renames.push(Rename {
                        old: id,
                        new,
                        changes,
                    });
                }
            }
            (MarkEffect::Insert { id }, MarkEffect::MoveOut { id: moved }) => {
                context.cross_field().set(
                    CrossFieldKey::destination(moved),
                    MoveEffect::BecomesInsert {
                        id,
                        changes1: first.changes,
                        changes2: second.changes,
                    },
                );
            }
            (MarkEffect::MoveIn { id }, MarkEffect::Skip) => {
                out.push(Cell::new(first.effect, None));
                if second.changes.is_some() {
                    context.cross_field().set(
                        CrossFieldKey::source(id),
                        MoveEffect::SourceUpdate {
                            detach: None,
                            changes: second.changes,
                        },
                    );
                }
            }
            (MarkEffect::MoveIn { id }, effect) => {
                context.cross_field().set(
                    CrossFieldKey::source(id),
                    MoveEffect::SourceUpdate {
                        detach: effect.as_detach(),
                        changes: second.changes,
                    },
                );
            }
            _ => return Err(Error::malformed("sequence marks out of step during compose")),
        }
    }

    let mut renames2: BTreeMap<_, _> = change2.renames.iter().map(|r| (r.old, *r)).collect();
    for rename in &change1.renames {
        let later = detached2.remove(&rename.new);
        let (new, later) = match renames2.remove(&rename.new) {
            Some(second) => (second.new, second.changes.or(later)),
            None => (rename.new, later),
        };
        let changes = context.compose_child(rename.changes, later)?;
        if rename.old == new {
            if let Some(changes) = changes {
                detached.insert(new, changes);
            }
        } else {
            renames.push(Rename {
                old: rename.old,
                new,
                changes,
            });
        }
    }
    for rename in renames2.into_values() {
        let earlier = detached1.remove(&rename.old);
        renames.push(Rename {
            changes: context.compose_child(earlier, rename.changes)?,
            ..rename
        });
    }
    for (id, changes) in detached1 {
        let later = detached2.remove(&id);
        if let Some(changes) = context.compose_child(Some(changes), later)? {
            detached.insert(id, changes);
        }
    }
    for (id, changes) in detached2 {
        if let Some(changes) = context.compose_child(None, Some(changes))? {
            detached.insert(id, changes);
        }
    }

    Ok(SequenceChangeset {
        marks: normalize(out),
        detached_changes: sorted(detached),
        renames,
    })
}

pub fn rebase(
    change: &SequenceChangeset,
    over: &SequenceChangeset,
    context: &mut dyn RebaseNodeManager,
) -> Result<SequenceChangeset> {
    use NodeAttachState::{Attached, Detached};

    let cells = explode(&change.marks)?;
    let base = explode(&over.marks)?;
    let base_inserts: BTreeSet<_> = base
        .iter()
        .filter_map(|cell| match cell.effect {
            MarkEffect::Insert { id } => Some(id),
            _ => None,
        })
        .collect();
    // Inserts of content the base already inserted.
    let muted: BTreeSet<_> = cells
        .iter()
        .filter_map(|cell| match cell.effect {
            MarkEffect::Insert { id } if base_inserts.contains(&id) => Some(id),
            _ => None,
        })
        .collect();
    let mut muted_changes: BTreeMap<_, _> = cells
        .iter()
        .filter_map(|cell| match cell.effect {
            MarkEffect::Insert { id } if muted.contains(&id) => Some((id, cell.changes)),
            _ => None,
        })
        .collect();
    let mut own_detached: BTreeMap<_, _> = change.detached_changes.iter().copied().collect();
    let base_detached: BTreeMap<_, _> = over.detached_changes.iter().copied().collect();
    let mut detached = BTreeMap::new();
    let base_first = context.base_attaches_first();

    let mut out = Vec::new();
    let (mut i, mut j) = (0, 0);
    loop {
        let own_attach = cells.get(i).filter(|cell| cell.effect.is_attach()).copied();
        let base_attach = base.get(j).filter(|cell| cell.effect.is_attach()).copied();
        let take_own = match (own_attach, base_attach) {
            (Some(_), Some(_)) => !base_first,
            (Some(_), None) => true,
            (None, _) => false,
        };
        if let (true, Some(cell)) = (take_own, own_attach) {
            i += 1;
            let dropped = match cell.effect {
                MarkEffect::Insert { id } => muted.contains(&id),
                MarkEffect::MoveIn { id } => matches!(
                    context.cross_field().get(CrossFieldKey::source(id)),
                    Some(MoveEffect::Muted)
                ),
                _ => false,
            };
            if dropped {
                trace!(effect = ?cell.effect, "attach muted by base");
            } else {
                out.push(Cell::new(cell.effect, context.rebase_child(cell.changes, None, Attached)?));
            }
            continue;
        }
        if let Some(cell) = base_attach {
            j += 1;
            let (MarkEffect::Insert { id } | MarkEffect::MoveIn { id }) = cell.effect else {
                return Err(Error::malformed("base attach without an id"));
            };
            let claimed = match cell.effect {
                MarkEffect::Insert { .. } => match muted_changes.remove(&id) {
                    Some(changes) => Some(changes),
                    None => own_detached.remove(&id).map(Some),
                },
                _ => None,
            };
            let (effect, changes) = match claimed {
                Some(own) => (MarkEffect::Skip, context.rebase_child(own, cell.changes, Attached)?),
                None => match context.cross_field().get(CrossFieldKey::destination(id)) {
                    Some(MoveEffect::Follow {
                        changes,
                        base_changes,
                        detach,
                    }) => (
                        detach.map_or(MarkEffect::Skip, MarkEffect::from),
                        context.rebase_child(changes, base_changes.or(cell.changes), Attached)?,
                    ),
                    _ => (
                        MarkEffect::Skip,
                        context.rebase_child(None, cell.changes, Attached)?,
                    ),
                },
            };
            out.push(Cell::new(effect, changes));
            continue;
        }

        let (own, base_cell) = (cells.get(i).copied(), base.get(j).copied());
        if own.is_none() && base_cell.is_none() {
            break;
        }
        i += usize::from(own.is_some());
        j += usize::from(base_cell.is_some());
        let own = own.unwrap_or(Cell::SKIP);
        let base_cell = base_cell.unwrap_or(Cell::SKIP);
        let follow = MoveEffect::Follow {
            changes: own.changes,
            base_changes: base_cell.changes,
            detach: own.effect.as_detach(),
        };
        let trivial = own == Cell::SKIP && base_cell.changes.is_none();
        match base_cell.effect {
            MarkEffect::Skip => {
                let changes = context.rebase_child(own.changes, base_cell.changes, Attached)?;
                out.push(Cell::new(own.effect, changes));
            }
            MarkEffect::Remove { id } if base_inserts.contains(&id) => {
                if !trivial {
                    context.cross_field().set(CrossFieldKey::destination(id), follow);
                }
            }
            MarkEffect::Remove { id } => {
                if let MarkEffect::MoveOut { id: moved } = own.effect {
                    context
                        .cross_field()
                        .set(CrossFieldKey::source(moved), MoveEffect::Muted);
                }
                if let Some(changes) = context.rebase_child(own.changes, base_cell.changes, Detached)? {
                    detached.insert(id, changes);
                }
            }
            MarkEffect::MoveOut { id } => {
                if !trivial {
                    context.cross_field().set(CrossFieldKey::destination(id), follow);
                }
            }
            _ => return Err(Error::malformed("sequence marks out of step during rebase")),
        }
    }

    let mut renames = Vec::with_capacity(change.renames.len());
    for rename in &change.renames {
        renames.push(Rename {
            changes: context.rebase_child(rename.changes, None, Detached)?,
            ..*rename
        });
    }
    for (id, changes) in own_detached {
        let target = over
            .renames
            .iter()
            .find(|rename| rename.old == id)
            .map_or(id, |rename| rename.new);
        let base_changes = base_detached.get(&id).copied();
        if let Some(changes) = context.rebase_child(Some(changes), base_changes, Detached)? {
            detached.entry(target).or_insert(changes);
        }
    }
    for (id, base_changes) in base_detached {
        if change.detached_changes.iter().any(|(own, _)| *own == id) {
            continue;
        }
        if let Some(changes) = context.rebase_child(None, Some(base_changes), Detached)? {
            detached.entry(id).or_insert(changes);
        }
    }

    Ok(SequenceChangeset {
        marks: normalize(out),
        detached_changes: sorted(detached),
        renames,
    })
}

pub fn invert(
    change: &SequenceChangeset,
    is_rollback: bool,
    context: &mut dyn InvertNodeManager,
) -> Result<SequenceChangeset> {
    let mut out = Vec::new();
    for cell in explode(&change.marks)? {
        let inverted = match cell.effect {
            MarkEffect::Skip => Cell::new(MarkEffect::Skip, context.invert_child(cell.changes)?),
            MarkEffect::Insert { id } => {
                let id = if is_rollback { id } else { context.gen_id() };
                Cell::new(MarkEffect::Remove { id }, context.invert_child(cell.changes)?)
            }
            MarkEffect::Remove { id } => {
                Cell::new(MarkEffect::Insert { id }, context.invert_child(cell.changes)?)
            }
            MarkEffect::MoveOut { id } => {
                context.cross_field().set(
                    CrossFieldKey::destination(id),
                    MoveEffect::Changes(cell.changes),
                );
                Cell::new(MarkEffect::MoveIn { id }, None)
            }
            MarkEffect::MoveIn { id } => {
                let changes = match context.cross_field().get(CrossFieldKey::destination(id)) {
                    Some(MoveEffect::Changes(changes)) => changes,
                    _ => None,
                };
                Cell::new(MarkEffect::MoveOut { id }, context.invert_child(changes)?)
            }
        };
        out.push(inverted);
    }
    let mut detached = BTreeMap::new();
    for (id, changes) in &change.detached_changes {
        if let Some(changes) = context.invert_child(Some(*changes))? {
            detached.insert(*id, changes);
        }
    }
    let mut renames = Vec::with_capacity(change.renames.len());
    for rename in &change.renames {
        renames.push(Rename {
            old: rename.new,
            new: rename.old,
            changes: context.invert_child(rename.changes)?,
        });
    }
    Ok(SequenceChangeset {
        marks: normalize(out),
        detached_changes: sorted(detached),
        renames,
    })
}

pub fn prune(
    change: &SequenceChangeset,
    prune_child: &mut dyn FnMut(NodeId) -> Result<Option<NodeId>>,
) -> Result<SequenceChangeset> {
    let mut cells = explode(&change.marks)?;
    for cell in &mut cells {
        if let Some(node) = cell.changes {
            cell.changes = prune_child(node)?;
        }
    }
    let mut detached = Vec::new();
    for (id, node) in &change.detached_changes {
        if let Some(node) = prune_child(*node)? {
            detached.push((*id, node));
        }
    }
    let mut renames = Vec::with_capacity(change.renames.len());
    for rename in &change.renames {
        let changes = match rename.changes {
            Some(node) => prune_child(node)?,
            None => None,
        };
        renames.push(Rename { changes, ..*rename });
    }
    Ok(SequenceChangeset {
        marks: normalize(cells),
        detached_changes: detached,
        renames,
    })
}

pub fn into_delta(
    change: &SequenceChangeset,
    delta_from_child: &mut dyn FnMut(NodeId) -> Result<FieldMap>,
) -> Result<FieldChanges> {
    let mut result = FieldChanges::default();
    let mut child = |node: Option<NodeId>| -> Result<Option<FieldMap>> {
        Ok(match node {
            Some(node) => Some(delta_from_child(node)?).filter(|fields| !fields.is_empty()),
            None => None,
        })
    };
    for cell in explode(&change.marks)? {
        match cell.effect {
            MarkEffect::Skip => match child(cell.changes)? {
                Some(fields) => push_mark(&mut result.local, delta::Mark::modify(fields)),
                None => push_mark(&mut result.local, delta::Mark::skip(1)),
            },
            MarkEffect::Insert { id } | MarkEffect::MoveIn { id } => {
                push_mark(&mut result.local, delta::Mark::attach(id, 1));
                if let Some(fields) = child(cell.changes)? {
                    result.global.push(DetachedNodeChanges { id, fields });
                }
            }
            MarkEffect::Remove { id } | MarkEffect::MoveOut { id } => {
                let mut mark = delta::Mark::detach(id, 1);
                mark.fields = child(cell.changes)?;
                push_mark(&mut result.local, mark);
            }
        }
    }
    trim_skips(&mut result.local);
    for (id, node) in &change.detached_changes {
        if let Some(fields) = child(Some(*node))? {
            result.global.push(DetachedNodeChanges { id: *id, fields });
        }
    }
    for rename in &change.renames {
        if let Some(fields) = child(rename.changes)? {
            result.global.push(DetachedNodeChanges {
                id: rename.old,
                fields,
            });
        }
        result.rename.push(DetachedNodeRename {
            count: 1,
            old_id: rename.old,
            new_id: rename.new,
        });
    }
    Ok(result)
}

fn nested_changes(change: &SequenceChangeset) -> Vec<NestedChange> {
    let mut nested = Vec::new();
    let (mut input, mut output) = (0usize, 0usize);
    for mark in &change.marks {
        let count = mark.count as usize;
        if let Some(node) = mark.changes {
            let (input_index, output_index) = match mark.effect {
                MarkEffect::Skip => (Some(input), Some(output)),
                MarkEffect::Insert { .. } | MarkEffect::MoveIn { .. } => (None, Some(output)),
                MarkEffect::Remove { .. } | MarkEffect::MoveOut { .. } => (Some(input), None),
            };
            nested.push(NestedChange {
                node,
                input_index,
                output_index,
            });
        }
        if !mark.effect.is_attach() {
            input += count;
        }
        if !mark.effect.is_detach() {
            output += count;
        }
    }
    nested.extend(change.detached_changes.iter().map(|(_, node)| NestedChange {
        node: *node,
        input_index: None,
        output_index: None,
    }));
    nested.extend(change.renames.iter().filter_map(|rename| {
        rename.changes.map(|node| NestedChange {
            node,
            input_index: None,
            output_index: None,
        })
    }));
    nested
}

fn tag(change: &SequenceChangeset, revision: RevisionTag) -> SequenceChangeset {
    let stamp = |id: ChangeAtomId| id.tagged(Some(revision));
    SequenceChangeset {
        marks: change
            .marks
            .iter()
            .map(|mark| Mark {
                effect: mark.effect.tagged(revision),
                ..*mark
            })
            .collect(),
        detached_changes: change
            .detached_changes
            .iter()
            .map(|(id, node)| (stamp(*id), *node))
            .collect(),
        renames: change
            .renames
            .iter()
            .map(|rename| Rename {
                old: stamp(rename.old),
                new: stamp(rename.new),
                changes: rename.changes,
            })
            .collect(),
    }
}

pub(crate) fn expect_sequence(change: &FieldChangeset) -> Result<&SequenceChangeset> {
    match change {
        FieldChangeset::Sequence(change) => Ok(change),
        FieldChangeset::None => Ok(&EMPTY),
        FieldChangeset::Optional(_) => Err(Error::malformed(
            "optional field changeset given to the sequence kind",
        )),
    }
}

pub struct SequenceFieldHandler;

impl FieldChangeHandler for SequenceFieldHandler {
    fn create_empty(&self) -> FieldChangeset {
        FieldChangeset::Sequence(SequenceChangeset::default())
    }

    fn is_empty(&self, change: &FieldChangeset) -> bool {
        expect_sequence(change).map_or(false, SequenceChangeset::is_empty)
    }

    fn compose(
        &self,
        change1: &FieldChangeset,
        change2: &FieldChangeset,
        context: &mut dyn ComposeNodeManager,
    ) -> Result<FieldChangeset> {
        compose(expect_sequence(change1)?, expect_sequence(change2)?, context)
            .map(FieldChangeset::Sequence)
    }

    fn invert(
        &self,
        change: &FieldChangeset,
        is_rollback: bool,
        context: &mut dyn InvertNodeManager,
    ) -> Result<FieldChangeset> {
        invert(expect_sequence(change)?, is_rollback, context).map(FieldChangeset::Sequence)
    }

    fn rebase(
        &self,
        change: &FieldChangeset,
        over: &FieldChangeset,
        context: &mut dyn RebaseNodeManager,
    ) -> Result<FieldChangeset> {
        rebase(expect_sequence(change)?, expect_sequence(over)?, context)
            .map(FieldChangeset::Sequence)
    }

    fn prune(
        &self,
        change: &FieldChangeset,
        prune_child: &mut dyn FnMut(NodeId) -> Result<Option<NodeId>>,
    ) -> Result<FieldChangeset> {
        prune(expect_sequence(change)?, prune_child).map(FieldChangeset::Sequence)
    }

    fn into_delta(
        &self,
        change: &FieldChangeset,
        delta_from_child: &mut dyn FnMut(NodeId) -> Result<FieldMap>,
    ) -> Result<FieldChanges> {
        into_delta(expect_sequence(change)?, delta_from_child)
    }

    fn get_nested_changes(&self, change: &FieldChangeset) -> Vec<NestedChange> {
        expect_sequence(change).map_or_else(|_| Vec::new(), nested_changes)
    }

    fn get_cross_field_keys(&self, change: &FieldChangeset) -> Vec<CrossFieldKey> {
        let Ok(change) = expect_sequence(change) else {
            return Vec::new();
        };
        change
            .marks
            .iter()
            .flat_map(|mark| {
                (0..mark.count).filter_map(move |offset| match mark.effect.offset(offset) {
                    MarkEffect::MoveOut { id } => Some(CrossFieldKey::source(id)),
                    MarkEffect::MoveIn { id } => Some(CrossFieldKey::destination(id)),
                    _ => None,
                })
            })
            .collect()
    }

    fn tag(&self, change: &FieldChangeset, revision: RevisionTag) -> FieldChangeset {
        match change {
            FieldChangeset::Sequence(change) => FieldChangeset::Sequence(tag(change, revision)),
            other => other.clone(),
        }
    }

    fn encode_json(&self, change: &FieldChangeset) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(expect_sequence(change)?)?)
    }

    fn decode_json(&self, encoded: &serde_json::Value) -> Result<FieldChangeset> {
        let change = SequenceChangeset::deserialize(encoded)?;
        explode(&change.marks)?;
        Ok(FieldChangeset::Sequence(change))
    }

    fn editor(&self) -> FieldEditor {
        FieldEditor::Sequence
    }
}
