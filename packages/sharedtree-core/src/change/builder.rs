//! Builds changesets from path-addressed edits.

use std::collections::BTreeMap;

use tracing::debug;

use crate::change::field_kind::{FieldEditor, FieldKind, SEQUENCE};
use crate::change::id_allocator::IdAllocator;
use crate::change::{
    optional, sequence, ChangeFamily, FieldChange, FieldChangeMap, FieldChangeset,
    ModularChangeset, NodeChangeset, RevisionMetadata, TaggedChange,
};
use crate::error::{Error, Result};
use crate::forest::TreeChunk;
use crate::ids::{ChangeAtomId, FieldKey, FieldKindIdentifier};
use crate::tree::{FieldUpPath, UpPath};

/// Tells the builder which kind a field has.
pub trait KindResolver {
    /// Kind of `field` under the node at `parent` (`None` for root fields).
    fn field_kind(&self, parent: Option<&UpPath>, field: &FieldKey) -> Result<FieldKindIdentifier>;
}

/// Treats every field as a sequence.
pub struct SequenceKinds;

impl KindResolver for SequenceKinds {
    fn field_kind(&self, _parent: Option<&UpPath>, _field: &FieldKey) -> Result<FieldKindIdentifier> {
        Ok(SEQUENCE.id())
    }
}

/// Accumulates edits; each edit sees the document as left by the previous ones.
pub struct ModularEditBuilder<'a> {
    family: &'a ChangeFamily,
    kinds: &'a dyn KindResolver,
    ids: IdAllocator,
    edits: Vec<ModularChangeset>,
}

impl<'a> ModularEditBuilder<'a> {
    pub fn new(family: &'a ChangeFamily, kinds: &'a dyn KindResolver) -> Self {
        Self {
            family,
            kinds,
            ids: IdAllocator::default(),
            edits: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.edits.is_empty()
    }

    /// Editing surface of the kind `field` resolves to.
    pub fn editor_for(&self, field: &FieldUpPath) -> Result<FieldEditor> {
        Ok(self.resolve(field.parent.as_ref(), &field.field)?.handler.editor())
    }

    pub fn sequence_field(&mut self, field: FieldUpPath) -> SequenceFieldEditor<'_, 'a> {
        SequenceFieldEditor {
            builder: self,
            field,
        }
    }

    pub fn optional_field(&mut self, field: FieldUpPath) -> OptionalFieldEditor<'_, 'a> {
        OptionalFieldEditor {
            builder: self,
            field,
        }
    }

    /// Required fields edit like optional ones; the schema rejects leaving them empty.
    pub fn value_field(&mut self, field: FieldUpPath) -> OptionalFieldEditor<'_, 'a> {
        self.optional_field(field)
    }

    /// Moves `count` nodes from `source` to the gap `destination_index` of `destination`.
    /// The destination index counts the destination field's content after the nodes left.
    pub fn move_between(
        &mut self,
        source: FieldUpPath,
        source_index: usize,
        count: u32,
        destination: FieldUpPath,
        destination_index: usize,
    ) -> Result<()> {
        if source == destination {
            let destination_index = if destination_index > source_index {
                destination_index + count as usize
            } else {
                destination_index
            };
            return self
                .sequence_field(source)
                .move_within(source_index, count, destination_index);
        }
        let kind = self.kind_for(&source, FieldEditor::Sequence)?;
        let destination_kind = self.kind_for(&destination, FieldEditor::Sequence)?;
        let id = self.ids.allocate(count);
        let detach = sequence::move_out(source_index, count, id);
        let attach = sequence::move_in(destination_index, count, id);
        let detach = self.wrap(&source, kind, FieldChangeset::Sequence(detach), Vec::new())?;
        let attach = self.wrap(
            &destination,
            destination_kind,
            FieldChangeset::Sequence(attach),
            Vec::new(),
        )?;
        let paired = self.family.compose(
            &[TaggedChange::untagged(detach), TaggedChange::untagged(attach)],
            &RevisionMetadata::new(),
        )?;
        self.edits.push(paired);
        Ok(())
    }

    /// The accumulated edits as one changeset.
    pub fn finish(self) -> Result<ModularChangeset> {
        debug!(edits = self.edits.len(), "finishing edit");
        let mut edits = self.edits;
        if edits.len() <= 1 {
            return Ok(edits.pop().unwrap_or_default());
        }
        let tagged: Vec<_> = edits.into_iter().map(TaggedChange::untagged).collect();
        self.family.compose(&tagged, &RevisionMetadata::new())
    }

    fn kind_for(&self, field: &FieldUpPath, editor: FieldEditor) -> Result<&'static FieldKind> {
        let kind = self.resolve(field.parent.as_ref(), &field.field)?;
        if kind.handler.editor() != editor {
            return Err(Error::malformed(format!(
                "field {} of kind {} cannot be edited as {editor:?}",
                field.field, kind.identifier
            )));
        }
        Ok(kind)
    }

    fn resolve(&self, parent: Option<&UpPath>, field: &FieldKey) -> Result<&'static FieldKind> {
        let parent = parent.filter(|path| path.depth() > 0);
        let id = self.kinds.field_kind(parent, field)?;
        self.family.registry().lookup(&id)
    }

    fn submit(
        &mut self,
        field: &FieldUpPath,
        kind: &'static FieldKind,
        change: FieldChangeset,
        builds: Vec<(ChangeAtomId, TreeChunk)>,
    ) -> Result<()> {
        let edit = self.wrap(field, kind, change, builds)?;
        self.edits.push(edit);
        Ok(())
    }

    /// Nests `change` under the node changes leading from the root to `field`.
    fn wrap(
        &mut self,
        field: &FieldUpPath,
        kind: &'static FieldKind,
        change: FieldChangeset,
        builds: Vec<(ChangeAtomId, TreeChunk)>,
    ) -> Result<ModularChangeset> {
        let mut fields: FieldChangeMap = BTreeMap::new();
        fields.insert(
            field.field.clone(),
            FieldChange {
                kind: kind.id(),
                change,
            },
        );
        let mut node_changes = BTreeMap::new();
        let mut parent = field.parent.clone();
        while let Some(path) = parent {
            let Some(step) = path.last().cloned() else {
                break;
            };
            let grandparent = path.parent();
            let node = self.ids.gen_id();
            node_changes.insert(node, NodeChangeset { field_changes: fields });
            let parent_kind = self.resolve(grandparent.as_ref(), &step.parent_field)?;
            let wrapped = match parent_kind.handler.editor() {
                FieldEditor::Sequence => {
                    FieldChangeset::Sequence(sequence::modify(step.parent_index, node))
                }
                FieldEditor::Optional => FieldChangeset::Optional(optional::child_change(node)),
                FieldEditor::Unsupported => {
                    return Err(Error::malformed(format!(
                        "field {} of kind {} has no editable children",
                        step.parent_field, parent_kind.identifier
                    )))
                }
            };
            fields = BTreeMap::new();
            fields.insert(
                step.parent_field,
                FieldChange {
                    kind: parent_kind.id(),
                    change: wrapped,
                },
            );
            parent = grandparent;
        }
        Ok(ModularChangeset {
            field_changes: fields,
            node_changes,
            builds: builds.into_iter().collect(),
            max_id: self.ids.max(),
        })
    }
}

pub struct SequenceFieldEditor<'b, 'a> {
    builder: &'b mut ModularEditBuilder<'a>,
    field: FieldUpPath,
}

impl SequenceFieldEditor<'_, '_> {
    pub fn insert(&mut self, index: usize, content: TreeChunk) -> Result<()> {
        let count = content.top_level_length() as u32;
        if count == 0 {
            return Ok(());
        }
        let kind = self.builder.kind_for(&self.field, FieldEditor::Sequence)?;
        let id = self.builder.ids.allocate(count);
        let change = FieldChangeset::Sequence(sequence::insert(index, count, id));
        self.builder.submit(&self.field, kind, change, vec![(id, content)])
    }

    pub fn remove(&mut self, index: usize, count: u32) -> Result<()> {
        if count == 0 {
            return Ok(());
        }
        let kind = self.builder.kind_for(&self.field, FieldEditor::Sequence)?;
        let id = self.builder.ids.allocate(count);
        let change = FieldChangeset::Sequence(sequence::remove(index, count, id));
        self.builder.submit(&self.field, kind, change, Vec::new())
    }

    /// Moves `count` nodes at `source` to the gap before input position `destination`.
    pub fn move_within(&mut self, source: usize, count: u32, destination: usize) -> Result<()> {
        if count == 0 {
            return Ok(());
        }
        let kind = self.builder.kind_for(&self.field, FieldEditor::Sequence)?;
        let id = self.builder.ids.allocate(count);
        let change = FieldChangeset::Sequence(sequence::move_within(source, count, destination, id));
        self.builder.submit(&self.field, kind, change, Vec::new())
    }
}

pub struct OptionalFieldEditor<'b, 'a> {
    builder: &'b mut ModularEditBuilder<'a>,
    field: FieldUpPath,
}

impl OptionalFieldEditor<'_, '_> {
    pub fn set(&mut self, content: TreeChunk, was_empty: bool) -> Result<()> {
        if content.top_level_length() != 1 {
            return Err(Error::malformed(format!(
                "an optional field holds one node, got {}",
                content.top_level_length()
            )));
        }
        let kind = self.builder.kind_for(&self.field, FieldEditor::Optional)?;
        let src = self.builder.ids.gen_id();
        let dst = self.builder.ids.gen_id();
        let change = FieldChangeset::Optional(optional::set(src, was_empty, dst));
        self.builder.submit(&self.field, kind, change, vec![(src, content)])
    }

    pub fn clear(&mut self, was_empty: bool) -> Result<()> {
        if was_empty {
            return Ok(());
        }
        let kind = self.builder.kind_for(&self.field, FieldEditor::Optional)?;
        let dst = self.builder.ids.gen_id();
        let change = FieldChangeset::Optional(optional::clear(false, dst));
        self.builder.submit(&self.field, kind, change, Vec::new())
    }
}
