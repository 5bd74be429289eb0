use std::borrow::Cow;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, trace};

use crate::change::cross_field::{CrossFieldKey, CrossFieldTable, CrossFieldTarget};
use crate::change::field_kind::{
    ComposeNodeManager, FieldKind, FieldKindRegistry, InvertNodeManager, NodeAttachState,
    RebaseNodeManager,
};
use crate::change::id_allocator::IdAllocator;
use crate::change::{
    FieldChange, FieldChangeMap, FieldChangeset, ModularChangeset, NodeChangeset,
    RevisionMetadata, TaggedChange,
};
use crate::delta::{DetachedNodeBuild, FieldMap, Root};
use crate::error::{Error, Result};
use crate::ids::{ChangeAtomId, FieldKey, NodeId, RevisionTag};

pub const DEFAULT_MAX_CROSS_FIELD_PASSES: usize = 4;

static NO_FIELDS: FieldChangeMap = BTreeMap::new();

/// Compose, invert, rebase and delta conversion for whole changesets. Field changesets are
/// handled by their kind; nested node changes are followed through the node table.
#[derive(Clone, Debug)]
pub struct ChangeFamily {
    registry: FieldKindRegistry,
    max_cross_field_passes: usize,
}

impl Default for ChangeFamily {
    fn default() -> Self {
        Self::new(FieldKindRegistry::default(), DEFAULT_MAX_CROSS_FIELD_PASSES)
    }
}

impl ChangeFamily {
    pub fn new(registry: FieldKindRegistry, max_cross_field_passes: usize) -> Self {
        Self {
            registry,
            max_cross_field_passes: max_cross_field_passes.max(1),
        }
    }

    pub fn registry(&self) -> &FieldKindRegistry {
        &self.registry
    }

    /// Folds `changes` into one changeset with the same cumulative effect.
    pub fn compose(
        &self,
        changes: &[TaggedChange],
        metadata: &RevisionMetadata,
    ) -> Result<ModularChangeset> {
        debug!(
            changes = changes.len(),
            sequenced = metadata.len(),
            "composing changes"
        );
        let mut composed = ModularChangeset::empty();
        for change in changes {
            let next = self.tag(change)?;
            composed = self.compose_pair(&composed, &next)?;
        }
        Ok(composed)
    }

    fn compose_pair(
        &self,
        change1: &ModularChangeset,
        change2: &ModularChangeset,
    ) -> Result<ModularChangeset> {
        let seed = change1.max_id.max(change2.max_id);
        let (field_changes, table) = self.run_passes("compose", |cross| {
            let mut context = ComposeContext {
                family: self,
                change1,
                change2,
                table: NodeTable::above(seed),
                cross,
            };
            let fields =
                context.compose_fields(&change1.field_changes, &change2.field_changes)?;
            Ok((fields, context.table))
        })?;
        let mut builds = change1.builds.clone();
        builds.extend(change2.builds.iter().map(|(id, chunk)| (*id, chunk.clone())));
        self.prune(ModularChangeset {
            field_changes,
            node_changes: table.nodes,
            builds,
            max_id: table.ids.max(),
        })
    }

    /// The changeset undoing `change`. Ids the inverse mints are tagged with `revision`.
    pub fn invert(
        &self,
        change: &TaggedChange,
        is_rollback: bool,
        revision: Option<RevisionTag>,
    ) -> Result<ModularChangeset> {
        let tagged = self.tag(change)?;
        let (field_changes, table) = self.run_passes("invert", |cross| {
            let mut context = InvertContext {
                family: self,
                change: &tagged,
                is_rollback,
                table: NodeTable::above(tagged.max_id),
                cross,
            };
            let fields = context.invert_fields(&tagged.field_changes)?;
            Ok((fields, context.table))
        })?;
        let inverse = self.prune(ModularChangeset {
            field_changes,
            node_changes: table.nodes,
            builds: BTreeMap::new(),
            max_id: table.ids.max(),
        })?;
        self.tag(&TaggedChange::new(revision, inverse))
    }

    /// `change` as if it had been authored after `over`.
    pub fn rebase(
        &self,
        change: &TaggedChange,
        over: &TaggedChange,
        metadata: &RevisionMetadata,
    ) -> Result<ModularChangeset> {
        let own = self.tag(change)?;
        let base = self.tag(over)?;
        let base_first = metadata.compare(over.revision, change.revision) != Ordering::Greater;
        let seed = own.max_id.max(base.max_id);
        let (field_changes, table) = self.run_passes("rebase", |cross| {
            let mut context = RebaseContext {
                family: self,
                change: &own,
                base: &base,
                base_first,
                table: NodeTable::above(seed),
                cross,
            };
            let fields = context.rebase_fields(&own.field_changes, &base.field_changes)?;
            Ok((fields, context.table))
        })?;
        self.prune(ModularChangeset {
            field_changes,
            node_changes: table.nodes,
            builds: own.builds.clone(),
            max_id: table.ids.max(),
        })
    }

    /// Drops nested changes that have no effect, and node table entries nothing refers to.
    pub fn prune(&self, change: ModularChangeset) -> Result<ModularChangeset> {
        let mut pruner = Pruner {
            family: self,
            source: &change.node_changes,
            nodes: BTreeMap::new(),
        };
        let field_changes = pruner.prune_fields(&change.field_changes)?;
        let node_changes = pruner.nodes;
        Ok(ModularChangeset {
            field_changes,
            node_changes,
            builds: change.builds,
            max_id: change.max_id,
        })
    }

    pub fn into_delta(&self, change: &ModularChangeset) -> Result<Root> {
        self.validate(change)?;
        let fields = self.field_map_delta(change, &change.field_changes)?;
        let build = change
            .builds
            .iter()
            .map(|(id, trees)| DetachedNodeBuild {
                id: *id,
                trees: trees.clone(),
            })
            .collect();
        Ok(Root {
            fields,
            build,
            ..Root::default()
        })
    }

    fn field_map_delta(&self, change: &ModularChangeset, fields: &FieldChangeMap) -> Result<FieldMap> {
        let mut delta = FieldMap::new();
        for (key, field) in fields {
            let kind = self.registry.lookup(&field.kind)?;
            let changes = kind.handler.into_delta(&field.change, &mut |node| {
                let nested = change.node_changes.get(&node).ok_or_else(|| dangling(node))?;
                self.field_map_delta(change, &nested.field_changes)
            })?;
            if !changes.is_empty() {
                delta.insert(key.clone(), changes);
            }
        }
        Ok(delta)
    }

    /// Shallow emptiness: nested changes are pruned whenever a changeset is produced.
    pub fn is_empty(&self, change: &ModularChangeset) -> bool {
        change.builds.is_empty()
            && change.field_changes.values().all(|field| {
                self.registry
                    .get(&field.kind)
                    .is_some_and(|kind| kind.handler.is_empty(&field.change))
            })
    }

    /// Stamps the change's revision onto every atom id that has none.
    pub fn tag(&self, change: &TaggedChange) -> Result<ModularChangeset> {
        let Some(revision) = change.revision else {
            return Ok(change.change.clone());
        };
        let source = &change.change;
        let mut node_changes = BTreeMap::new();
        for (id, node) in &source.node_changes {
            node_changes.insert(
                *id,
                NodeChangeset {
                    field_changes: self.tag_fields(&node.field_changes, revision)?,
                },
            );
        }
        Ok(ModularChangeset {
            field_changes: self.tag_fields(&source.field_changes, revision)?,
            node_changes,
            builds: source
                .builds
                .iter()
                .map(|(id, chunk)| (id.tagged(Some(revision)), chunk.clone()))
                .collect(),
            max_id: source.max_id,
        })
    }

    fn tag_fields(&self, fields: &FieldChangeMap, revision: RevisionTag) -> Result<FieldChangeMap> {
        let mut tagged = FieldChangeMap::new();
        for (key, field) in fields {
            let kind = self.registry.lookup(&field.kind)?;
            tagged.insert(
                key.clone(),
                FieldChange {
                    kind: field.kind.clone(),
                    change: kind.handler.tag(&field.change, revision),
                },
            );
        }
        Ok(tagged)
    }

    /// Checks that every nested change exists and is referenced once, and that every move
    /// has both ends.
    pub fn validate(&self, change: &ModularChangeset) -> Result<()> {
        let mut keys = BTreeSet::new();
        let mut seen = BTreeSet::new();
        self.collect_references(change, &change.field_changes, &mut keys, &mut seen)?;
        for key in &keys {
            let partner = match key.target {
                CrossFieldTarget::Source => CrossFieldKey::destination(key.id),
                CrossFieldTarget::Destination => CrossFieldKey::source(key.id),
            };
            if !keys.contains(&partner) {
                return Err(Error::malformed(format!(
                    "move {:?} has no {:?} end",
                    key.id, partner.target
                )));
            }
        }
        Ok(())
    }

    fn collect_references(
        &self,
        change: &ModularChangeset,
        fields: &FieldChangeMap,
        keys: &mut BTreeSet<CrossFieldKey>,
        seen: &mut BTreeSet<NodeId>,
    ) -> Result<()> {
        for field in fields.values() {
            let kind = self.registry.lookup(&field.kind)?;
            keys.extend(kind.handler.get_cross_field_keys(&field.change));
            for nested in kind.handler.get_nested_changes(&field.change) {
                if !seen.insert(nested.node) {
                    return Err(Error::malformed(format!(
                        "node change {:?} referenced twice",
                        nested.node
                    )));
                }
                let node = change
                    .node_changes
                    .get(&nested.node)
                    .ok_or_else(|| dangling(nested.node))?;
                self.collect_references(change, &node.field_changes, keys, seen)?;
            }
        }
        Ok(())
    }

    fn run_passes<T>(
        &self,
        operation: &'static str,
        mut body: impl FnMut(&mut CrossFieldTable) -> Result<T>,
    ) -> Result<T> {
        let mut table = CrossFieldTable::default();
        for pass in 0..self.max_cross_field_passes {
            table.begin_pass();
            let out = body(&mut table)?;
            if table.is_consistent() {
                return Ok(out);
            }
            trace!(operation, pass, "cross-field inputs changed, running again");
        }
        Err(Error::InconsistentState(format!(
            "{operation} did not settle within {} passes",
            self.max_cross_field_passes
        )))
    }

    fn field_pair<'m>(
        &self,
        first: Option<&'m FieldChange>,
        second: Option<&'m FieldChange>,
    ) -> Result<(&'static FieldKind, Cow<'m, FieldChangeset>, Cow<'m, FieldChangeset>)> {
        let kind = match (first, second) {
            (Some(a), Some(b)) if a.kind != b.kind => {
                return Err(Error::malformed(format!(
                    "field changed as both {} and {}",
                    a.kind, b.kind
                )))
            }
            (Some(change), _) | (None, Some(change)) => self.registry.lookup(&change.kind)?,
            (None, None) => return Err(Error::malformed("empty field pair")),
        };
        let side = |change: Option<&'m FieldChange>| match change {
            Some(change) => Cow::Borrowed(&change.change),
            None => Cow::Owned(kind.handler.create_empty()),
        };
        Ok((kind, side(first), side(second)))
    }
}

fn dangling(node: NodeId) -> Error {
    Error::malformed(format!("reference to missing node change {node:?}"))
}

fn node_fields(change: &ModularChangeset, node: Option<NodeId>) -> Result<&FieldChangeMap> {
    match node {
        Some(node) => change
            .node_changes
            .get(&node)
            .map(|node| &node.field_changes)
            .ok_or_else(|| dangling(node)),
        None => Ok(&NO_FIELDS),
    }
}

fn field_keys<'m>(a: &'m FieldChangeMap, b: &'m FieldChangeMap) -> BTreeSet<&'m FieldKey> {
    a.keys().chain(b.keys()).collect()
}

/// Output node table of one pass.
struct NodeTable {
    nodes: BTreeMap<NodeId, NodeChangeset>,
    ids: IdAllocator,
}

impl NodeTable {
    fn above(max: Option<u32>) -> Self {
        Self {
            nodes: BTreeMap::new(),
            ids: IdAllocator::above(max),
        }
    }

    fn add(&mut self, field_changes: FieldChangeMap) -> Option<NodeId> {
        if field_changes.is_empty() {
            return None;
        }
        let id = self.ids.gen_id();
        self.nodes.insert(id, NodeChangeset { field_changes });
        Some(id)
    }
}

fn keep(kind: &FieldKind, key: &FieldKey, change: FieldChangeset, out: &mut FieldChangeMap) {
    if !kind.handler.is_empty(&change) {
        out.insert(
            key.clone(),
            FieldChange {
                kind: kind.id(),
                change,
            },
        );
    }
}

struct ComposeContext<'a> {
    family: &'a ChangeFamily,
    change1: &'a ModularChangeset,
    change2: &'a ModularChangeset,
    table: NodeTable,
    cross: &'a mut CrossFieldTable,
}

impl ComposeContext<'_> {
    fn compose_fields(
        &mut self,
        fields1: &FieldChangeMap,
        fields2: &FieldChangeMap,
    ) -> Result<FieldChangeMap> {
        let mut out = FieldChangeMap::new();
        for key in field_keys(fields1, fields2) {
            let (kind, change1, change2) =
                self.family.field_pair(fields1.get(key), fields2.get(key))?;
            let composed = kind.handler.compose(&change1, &change2, self)?;
            keep(kind, key, composed, &mut out);
        }
        Ok(out)
    }
}

impl ComposeNodeManager for ComposeContext<'_> {
    fn compose_child(
        &mut self,
        change1: Option<NodeId>,
        change2: Option<NodeId>,
    ) -> Result<Option<NodeId>> {
        if change1.is_none() && change2.is_none() {
            return Ok(None);
        }
        let (source1, source2) = (self.change1, self.change2);
        let fields = self.compose_fields(node_fields(source1, change1)?, node_fields(source2, change2)?)?;
        Ok(self.table.add(fields))
    }

    fn gen_id(&mut self) -> ChangeAtomId {
        self.table.ids.gen_id()
    }

    fn cross_field(&mut self) -> &mut CrossFieldTable {
        &mut *self.cross
    }
}

struct RebaseContext<'a> {
    family: &'a ChangeFamily,
    change: &'a ModularChangeset,
    base: &'a ModularChangeset,
    base_first: bool,
    table: NodeTable,
    cross: &'a mut CrossFieldTable,
}

impl RebaseContext<'_> {
    fn rebase_fields(
        &mut self,
        fields: &FieldChangeMap,
        base_fields: &FieldChangeMap,
    ) -> Result<FieldChangeMap> {
        let mut out = FieldChangeMap::new();
        for key in field_keys(fields, base_fields) {
            let (kind, change, over) = self.family.field_pair(fields.get(key), base_fields.get(key))?;
            let rebased = kind.handler.rebase(&change, &over, self)?;
            keep(kind, key, rebased, &mut out);
        }
        Ok(out)
    }
}

impl RebaseNodeManager for RebaseContext<'_> {
    fn rebase_child(
        &mut self,
        change: Option<NodeId>,
        base: Option<NodeId>,
        state: NodeAttachState,
    ) -> Result<Option<NodeId>> {
        if change.is_none() && base.is_none() {
            return Ok(None);
        }
        trace!(?change, ?base, ?state, "rebasing nested change");
        let (own, over) = (self.change, self.base);
        let fields = self.rebase_fields(node_fields(own, change)?, node_fields(over, base)?)?;
        Ok(self.table.add(fields))
    }

    fn gen_id(&mut self) -> ChangeAtomId {
        self.table.ids.gen_id()
    }

    fn cross_field(&mut self) -> &mut CrossFieldTable {
        &mut *self.cross
    }

    fn base_attaches_first(&self) -> bool {
        self.base_first
    }
}

struct InvertContext<'a> {
    family: &'a ChangeFamily,
    change: &'a ModularChangeset,
    is_rollback: bool,
    table: NodeTable,
    cross: &'a mut CrossFieldTable,
}

impl InvertContext<'_> {
    fn invert_fields(&mut self, fields: &FieldChangeMap) -> Result<FieldChangeMap> {
        let mut out = FieldChangeMap::new();
        for (key, field) in fields {
            let kind = self.family.registry.lookup(&field.kind)?;
            let inverted = kind.handler.invert(&field.change, self.is_rollback, self)?;
            keep(kind, key, inverted, &mut out);
        }
        Ok(out)
    }
}

impl InvertNodeManager for InvertContext<'_> {
    fn invert_child(&mut self, change: Option<NodeId>) -> Result<Option<NodeId>> {
        let Some(node) = change else {
            return Ok(None);
        };
        let source = self.change;
        let fields = self.invert_fields(node_fields(source, Some(node))?)?;
        Ok(self.table.add(fields))
    }

    fn gen_id(&mut self) -> ChangeAtomId {
        self.table.ids.gen_id()
    }

    fn cross_field(&mut self) -> &mut CrossFieldTable {
        &mut *self.cross
    }
}

struct Pruner<'a> {
    family: &'a ChangeFamily,
    source: &'a BTreeMap<NodeId, NodeChangeset>,
    nodes: BTreeMap<NodeId, NodeChangeset>,
}

impl Pruner<'_> {
    fn prune_fields(&mut self, fields: &FieldChangeMap) -> Result<FieldChangeMap> {
        let mut out = FieldChangeMap::new();
        for (key, field) in fields {
            let kind = self.family.registry.lookup(&field.kind)?;
            let pruned = kind
                .handler
                .prune(&field.change, &mut |node| self.prune_node(node))?;
            keep(kind, key, pruned, &mut out);
        }
        Ok(out)
    }

    fn prune_node(&mut self, id: NodeId) -> Result<Option<NodeId>> {
        let source = self.source;
        let node = source.get(&id).ok_or_else(|| dangling(id))?;
        let field_changes = self.prune_fields(&node.field_changes)?;
        if field_changes.is_empty() {
            return Ok(None);
        }
        self.nodes.insert(id, NodeChangeset { field_changes });
        Ok(Some(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::field_kind::SEQUENCE;
    use crate::change::sequence::{self, MarkEffect};
    use crate::change::SequenceChangeset;
    use crate::forest::TreeChunk;
    use crate::ids::SessionId;
    use crate::tree::MapTree;

    fn id(local: u32) -> ChangeAtomId {
        ChangeAtomId::new(None, local)
    }

    fn seq(change: SequenceChangeset) -> FieldChange {
        FieldChange {
            kind: SEQUENCE.id(),
            change: FieldChangeset::Sequence(change),
        }
    }

    fn root(change: SequenceChangeset) -> ModularChangeset {
        ModularChangeset {
            field_changes: [(FieldKey::root(), seq(change))].into_iter().collect(),
            max_id: Some(20),
            ..ModularChangeset::default()
        }
    }

    /// Change to `field` of the root node at `index`.
    fn nested(index: usize, field: &str, change: SequenceChangeset) -> ModularChangeset {
        let node = id(30);
        let mut outer = root(sequence::modify(index, node));
        outer.node_changes.insert(
            node,
            NodeChangeset {
                field_changes: [(FieldKey::new(field), seq(change))].into_iter().collect(),
            },
        );
        outer.max_id = Some(30);
        outer
    }

    fn root_marks(change: &ModularChangeset) -> Vec<(u32, MarkEffect)> {
        match &change.field_changes[&FieldKey::root()].change {
            FieldChangeset::Sequence(change) => {
                change.marks.iter().map(|m| (m.count, m.effect)).collect()
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn prune_drops_empty_nested_changes() {
        let mut change = nested(1, "items", SequenceChangeset::default());
        change.node_changes.insert(id(99), NodeChangeset::default());
        let pruned = ChangeFamily::default().prune(change).unwrap();
        assert!(pruned.field_changes.is_empty());
        assert!(pruned.node_changes.is_empty());
    }

    #[test]
    fn compose_insert_then_edit_inside_it() {
        let family = ChangeFamily::default();
        let mut insert = root(sequence::insert(0, 1, id(1)));
        insert.builds.insert(
            id(1),
            TreeChunk::from_map_trees(&[MapTree::new("item")]),
        );
        let edit = nested(0, "items", sequence::insert(0, 1, id(5)));
        let composed = family
            .compose(
                &[TaggedChange::untagged(insert), TaggedChange::untagged(edit)],
                &RevisionMetadata::new(),
            )
            .unwrap();
        assert_eq!(root_marks(&composed), vec![(1, MarkEffect::Insert { id: id(1) })]);
        assert_eq!(composed.node_changes.len(), 1);

        let delta = family.into_delta(&composed).unwrap();
        let field = &delta.fields[&FieldKey::root()];
        assert_eq!(field.global.len(), 1);
        assert_eq!(field.global[0].id, id(1));
        assert_eq!(delta.build.len(), 1);
    }

    #[test]
    fn nested_edit_survives_removal_of_its_parent() {
        let family = ChangeFamily::default();
        let edit = nested(1, "items", sequence::remove(0, 1, id(5)));
        let removal = root(sequence::remove(0, 3, id(10)));
        let rebased = family
            .rebase(
                &TaggedChange::untagged(edit),
                &TaggedChange::untagged(removal),
                &RevisionMetadata::new(),
            )
            .unwrap();
        match &rebased.field_changes[&FieldKey::root()].change {
            FieldChangeset::Sequence(change) => {
                assert!(change.marks.is_empty());
                assert_eq!(change.detached_changes.len(), 1);
                assert_eq!(change.detached_changes[0].0, id(11));
            }
            other => panic!("unexpected {other:?}"),
        }
        family.validate(&rebased).unwrap();
    }

    #[test]
    fn tagging_stamps_atoms() {
        let family = ChangeFamily::default();
        let revision = RevisionTag::new(SessionId::from_u128(3), 1);
        let tagged = family
            .tag(&TaggedChange::new(
                Some(revision),
                root(sequence::remove(0, 1, id(2))),
            ))
            .unwrap();
        assert_eq!(
            root_marks(&tagged),
            vec![(
                1,
                MarkEffect::Remove {
                    id: ChangeAtomId::new(Some(revision), 2)
                }
            )]
        );
    }

    #[test]
    fn unpaired_move_is_rejected() {
        let family = ChangeFamily::default();
        let change = root(sequence::move_out(0, 1, id(4)));
        assert!(matches!(
            family.into_delta(&change),
            Err(Error::MalformedChange(_))
        ));
    }

    #[test]
    fn unsettled_cross_field_state_is_fatal() {
        // Relabelling the move source needs a second pass.
        let family = ChangeFamily::new(FieldKindRegistry::default(), 1);
        let moved = root(sequence::move_within(0, 1, 3, id(5)));
        let removed = root(sequence::remove(2, 1, id(7)));
        let result = family.compose(
            &[TaggedChange::untagged(moved.clone()), TaggedChange::untagged(removed.clone())],
            &RevisionMetadata::new(),
        );
        assert!(matches!(result, Err(Error::InconsistentState(_))));

        let composed = ChangeFamily::default()
            .compose(
                &[TaggedChange::untagged(moved), TaggedChange::untagged(removed)],
                &RevisionMetadata::new(),
            )
            .unwrap();
        assert_eq!(root_marks(&composed), vec![(1, MarkEffect::Remove { id: id(7) })]);
    }

    #[test]
    fn rollback_of_insert_removes_it_again() {
        let family = ChangeFamily::default();
        let change = root(sequence::insert(2, 2, id(1)));
        let inverse = family
            .invert(&TaggedChange::untagged(change), true, None)
            .unwrap();
        assert_eq!(
            root_marks(&inverse),
            vec![(2, MarkEffect::Skip), (2, MarkEffect::Remove { id: id(1) })]
        );
    }
}
