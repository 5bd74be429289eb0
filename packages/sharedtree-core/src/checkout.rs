//! A replica's view of one document: forest, stored schema and edit history together.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::anchor::Anchor;
use crate::change::field_kind::{FieldEditor, SEQUENCE};
use crate::change::{ChangeFamily, KindResolver, ModularChangeset, ModularEditBuilder};
use crate::codec::{
    decode_chunks, encode_chunks, EncodedFieldBatch, FieldBatchEncodingContext,
    MemoryIdCompressor,
};
use crate::config::CoreConfig;
use crate::delta::{DetachedNodeBuild, DetachedNodeDestruction, FieldChanges, FieldMap, Mark, Root};
use crate::error::{Error, Result};
use crate::forest::{Forest, ForestCursor, NavigationResult, TreeChunk};
use crate::ids::{ChangeAtomId, FieldKey, FieldKindIdentifier, SessionId};
use crate::rebaser::{Commit, EditManager};
use crate::schema::{
    decode_schema, encode_schema, is_node_in_schema, AllowIncompatible, NodeSchema,
    SchemaAndPolicy, StoredSchema, StoredSchemaRepository,
};
use crate::tree::{FieldUpPath, MapTree, TreeCursor, UpPath};

/// Field kinds as the stored schema declares them, read against current forest content.
struct SchemaKinds<'a> {
    forest: &'a Forest,
    schema: &'a StoredSchema,
}

impl KindResolver for SchemaKinds<'_> {
    fn field_kind(&self, parent: Option<&UpPath>, field: &FieldKey) -> Result<FieldKindIdentifier> {
        let Some(parent) = parent else {
            return Ok(if *field == FieldKey::root() {
                self.schema.root.kind.clone()
            } else {
                SEQUENCE.id()
            });
        };
        let mut cursor = self.forest.allocate_cursor();
        if self.forest.move_cursor_to_path(parent, &mut cursor) == NavigationResult::NotFound {
            return Err(Error::malformed(format!("no node at {parent}")));
        }
        let node_type = cursor.node_type().clone();
        match self.schema.node(&node_type) {
            Some(NodeSchema::Object { fields }) => fields
                .get(field)
                .map(|f| f.kind.clone())
                .ok_or_else(|| Error::malformed(format!("{node_type} has no field {field}"))),
            Some(NodeSchema::Map { field: schema }) => Ok(schema.kind.clone()),
            Some(NodeSchema::Leaf { .. }) => {
                Err(Error::malformed(format!("leaf {node_type} has no fields")))
            }
            None => Err(Error::malformed(format!("no schema for {node_type}"))),
        }
    }
}

/// Persisted document: schema and root field content.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EncodedContent {
    pub schema: serde_json::Value,
    pub trees: EncodedFieldBatch,
}

#[derive(Debug)]
pub struct Checkout {
    config: CoreConfig,
    forest: Forest,
    schema: StoredSchemaRepository,
    edits: EditManager,
    ids: MemoryIdCompressor,
}

impl Checkout {
    pub fn new(session: SessionId, config: CoreConfig) -> Self {
        let schema = StoredSchemaRepository::default();
        let family = ChangeFamily::new(
            schema.policy().field_kinds.clone(),
            config.max_cross_field_passes,
        );
        Self {
            config,
            forest: Forest::new(),
            schema,
            edits: EditManager::new(family, session),
            ids: MemoryIdCompressor::new(),
        }
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn forest(&self) -> &Forest {
        &self.forest
    }

    pub fn forest_mut(&mut self) -> &mut Forest {
        &mut self.forest
    }

    pub fn schema(&self) -> &StoredSchema {
        self.schema.schema()
    }

    pub fn schema_repository_mut(&mut self) -> &mut StoredSchemaRepository {
        &mut self.schema
    }

    pub fn edit_manager(&self) -> &EditManager {
        &self.edits
    }

    pub fn id_compressor_mut(&mut self) -> &mut MemoryIdCompressor {
        &mut self.ids
    }

    /// Content of the document root field.
    pub fn content(&self) -> Vec<MapTree> {
        self.forest.content()
    }

    /// No content and no schema: nothing has initialized this document yet.
    pub fn is_empty(&self) -> bool {
        self.forest.is_empty() && self.schema.schema().is_empty()
    }

    /// Installs `schema` and inserts `content` as a local commit.
    pub fn initialize(&mut self, content: &[MapTree], schema: StoredSchema) -> Result<Commit> {
        if !self.is_empty() {
            return Err(Error::InconsistentState(
                "initialize on a document that already has content or schema".into(),
            ));
        }
        // Nothing stored yet, so no content can fall out of schema.
        self.schema.update(schema, AllowIncompatible::Yes)?;
        let chunk = TreeChunk::from_map_trees(content);
        self.edit(|builder| {
            if chunk.is_empty() {
                return Ok(());
            }
            match builder.editor_for(&FieldUpPath::root())? {
                FieldEditor::Sequence => builder.sequence_field(FieldUpPath::root()).insert(0, chunk),
                FieldEditor::Optional => builder.optional_field(FieldUpPath::root()).set(chunk, true),
                FieldEditor::Unsupported => Err(Error::IncompatibleSchema(
                    "root field kind cannot hold content".into(),
                )),
            }
        })
    }

    /// Runs `edit` against a builder, then commits and applies the result locally.
    pub fn edit<F>(&mut self, edit: F) -> Result<Commit>
    where
        F: FnOnce(&mut ModularEditBuilder<'_>) -> Result<()>,
    {
        let change = {
            let kinds = SchemaKinds {
                forest: &self.forest,
                schema: self.schema.schema(),
            };
            let mut builder = ModularEditBuilder::new(self.edits.family(), &kinds);
            edit(&mut builder)?;
            builder.finish()?
        };
        self.validate_builds(&change)?;
        let commit = self.edits.add_local_change(change)?;
        let delta = self.edits.family().into_delta(&commit.change)?;
        self.forest.apply_delta(&delta)?;
        Ok(commit)
    }

    /// Applies a commit the service sequenced at `seq`, authored against `ref_seq`.
    pub fn receive_sequenced(&mut self, commit: Commit, seq: u64, ref_seq: u64) -> Result<()> {
        if commit.session() != self.edits.session() {
            self.validate_builds(&commit.change)?;
        }
        for delta in self.edits.add_sequenced_change(commit, seq, ref_seq)? {
            self.forest.apply_delta(&delta)?;
        }
        Ok(())
    }

    pub fn advance_minimum_sequence_number(&mut self, min_seq: u64) -> Result<()> {
        self.edits.advance_minimum_sequence_number(min_seq)
    }

    pub fn update_schema(&mut self, schema: StoredSchema, allow: AllowIncompatible) -> Result<()> {
        self.schema.update(schema, allow)
    }

    fn validate_builds(&self, change: &ModularChangeset) -> Result<()> {
        if !self.config.validates_schema() {
            return Ok(());
        }
        let schema = SchemaAndPolicy::new(self.schema.schema(), self.schema.policy());
        for chunk in change.builds.values() {
            for node in &chunk.roots {
                is_node_in_schema(&**node, &schema)?;
            }
        }
        Ok(())
    }

    pub fn track(&mut self, path: &UpPath) -> Anchor {
        self.forest.anchors_mut().track(path)
    }

    pub fn forget(&mut self, anchor: Anchor) -> Result<()> {
        self.forest.anchors_mut().forget(anchor)
    }

    pub fn locate(&self, anchor: Anchor) -> Result<Option<UpPath>> {
        self.forest.anchors().locate_path(anchor)
    }

    pub fn try_move_cursor_to_node<'a>(
        &'a self,
        anchor: Anchor,
        cursor: &mut ForestCursor<'a>,
    ) -> Result<NavigationResult> {
        self.forest.try_move_cursor_to_node(anchor, cursor)
    }

    /// Destroys detached content kept for undo and rebasing. Returns how many detached roots
    /// were destroyed; nothing is purged while local commits are pending.
    pub fn purge_repair_data(&mut self) -> Result<usize> {
        if !self.edits.local_commits().is_empty() {
            debug!(
                pending = self.edits.local_commits().len(),
                "repair data kept for pending local commits"
            );
            return Ok(0);
        }
        let destroy: Vec<_> = self
            .forest
            .detached_field_index()
            .ids()
            .map(|id| DetachedNodeDestruction { id, count: 1 })
            .collect();
        let purged = destroy.len();
        self.forest.apply_delta(&Root {
            destroy,
            ..Root::default()
        })?;
        Ok(purged)
    }

    pub fn encode_content(&self) -> Result<EncodedContent> {
        let schema = SchemaAndPolicy::new(self.schema.schema(), self.schema.policy());
        let context = FieldBatchEncodingContext {
            strategy: self.config.tree_encoding,
            schema: Some(schema),
            compressor: Some(&self.ids),
        };
        Ok(EncodedContent {
            schema: encode_schema(self.schema.schema(), self.config.schema_format)?,
            trees: encode_chunks(&[self.forest.root_chunk()], &context)?,
        })
    }

    /// Loads persisted content into an empty checkout. No commit is created.
    pub fn load_content(&mut self, encoded: &EncodedContent) -> Result<()> {
        if !self.is_empty() {
            return Err(Error::InconsistentState(
                "load into a document that already has content or schema".into(),
            ));
        }
        let schema = decode_schema(&encoded.schema)?;
        let mut fields = decode_chunks(&encoded.trees, Some(&self.ids))?;
        let trees = match (fields.pop(), fields.is_empty()) {
            (Some(trees), true) => trees,
            (None, _) => TreeChunk::default(),
            _ => return Err(Error::malformed("persisted content holds more than one field")),
        };
        if self.config.validates_schema() {
            let policy = self.schema.policy();
            for node in &trees.roots {
                is_node_in_schema(&**node, &SchemaAndPolicy::new(&schema, policy))?;
            }
        }
        self.schema.update(schema, AllowIncompatible::Yes)?;
        if trees.is_empty() {
            return Ok(());
        }
        let id = ChangeAtomId::new(None, 0);
        let count = trees.top_level_length() as u32;
        let mut fields = FieldMap::new();
        fields.insert(
            FieldKey::root(),
            FieldChanges {
                local: vec![Mark::attach(id, count)],
                ..FieldChanges::default()
            },
        );
        self.forest.apply_delta(&Root {
            fields,
            build: vec![DetachedNodeBuild { id, trees }],
            ..Root::default()
        })?;
        debug!(nodes = count, "content loaded");
        Ok(())
    }
}
