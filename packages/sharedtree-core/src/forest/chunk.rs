use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::ids::{FieldKey, TreeNodeSchemaIdentifier};
use crate::tree::{
    CursorLocationType, MapTree, StackCursor, TreeCursor, TreeNodeLike, Value,
};

/// Stored node. Children are shared between forest versions and copied on write.
#[derive(Clone, Debug, PartialEq)]
pub struct ChunkNode {
    pub node_type: TreeNodeSchemaIdentifier,
    pub value: Option<Value>,
    pub fields: BTreeMap<FieldKey, Vec<Arc<ChunkNode>>>,
}

impl ChunkNode {
    pub(crate) fn placeholder() -> Self {
        Self {
            node_type: TreeNodeSchemaIdentifier::above_root(),
            value: None,
            fields: BTreeMap::new(),
        }
    }

    pub fn from_map_tree(tree: &MapTree) -> Arc<Self> {
        Arc::new(Self {
            node_type: tree.node_type.clone(),
            value: tree.value.clone(),
            fields: tree
                .fields
                .iter()
                .filter(|(_, children)| !children.is_empty())
                .map(|(key, children)| {
                    (key.clone(), children.iter().map(Self::from_map_tree).collect())
                })
                .collect(),
        })
    }

    pub fn to_map_tree(&self) -> MapTree {
        MapTree {
            node_type: self.node_type.clone(),
            value: self.value.clone(),
            fields: self
                .fields
                .iter()
                .filter(|(_, children)| !children.is_empty())
                .map(|(key, children)| {
                    (key.clone(), children.iter().map(|c| c.to_map_tree()).collect())
                })
                .collect(),
        }
    }

    fn from_cursor<C: TreeCursor + ?Sized>(cursor: &mut C) -> Arc<Self> {
        let node_type = cursor.node_type().clone();
        let value = cursor.value().cloned();
        let mut fields = BTreeMap::new();
        if cursor.first_field() {
            loop {
                let key = cursor.get_field_key().clone();
                let children = field_from_cursor(cursor);
                if !children.is_empty() {
                    fields.insert(key, children);
                }
                if !cursor.next_field() {
                    break;
                }
            }
        }
        Arc::new(Self {
            node_type,
            value,
            fields,
        })
    }
}

fn field_from_cursor<C: TreeCursor + ?Sized>(cursor: &mut C) -> Vec<Arc<ChunkNode>> {
    let mut out = Vec::with_capacity(cursor.get_field_length());
    if cursor.first_node() {
        loop {
            out.push(ChunkNode::from_cursor(cursor));
            if !cursor.next_node() {
                break;
            }
        }
    }
    out
}

impl TreeNodeLike for ChunkNode {
    type Child = Arc<ChunkNode>;

    fn node_type(&self) -> &TreeNodeSchemaIdentifier {
        &self.node_type
    }

    fn value(&self) -> Option<&Value> {
        self.value.as_ref()
    }

    fn field(&self, key: &FieldKey) -> &[Arc<ChunkNode>] {
        self.fields.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    fn field_keys(&self) -> Vec<&FieldKey> {
        self.fields
            .iter()
            .filter(|(_, children)| !children.is_empty())
            .map(|(key, _)| key)
            .collect()
    }
}

/// A run of top-level nodes. Cloning shares the nodes.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TreeChunk {
    pub roots: Vec<Arc<ChunkNode>>,
}

impl TreeChunk {
    pub fn from_roots(roots: Vec<Arc<ChunkNode>>) -> Self {
        Self { roots }
    }

    pub fn from_map_trees(trees: &[MapTree]) -> Self {
        Self {
            roots: trees.iter().map(ChunkNode::from_map_tree).collect(),
        }
    }

    /// Copies the field under a fields-mode cursor.
    ///
    /// Fails with [`Error::CursorPending`] when the cursor's content is not yet available.
    pub fn from_cursor<C: TreeCursor + ?Sized>(cursor: &mut C) -> Result<Self> {
        if cursor.pending() {
            return Err(Error::CursorPending);
        }
        if cursor.mode() != CursorLocationType::Fields {
            return Err(Error::InconsistentState(
                "chunking a field requires a cursor in fields mode".into(),
            ));
        }
        Ok(Self {
            roots: field_from_cursor(cursor),
        })
    }

    pub fn top_level_length(&self) -> usize {
        self.roots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    /// Cursor in fields mode over the top-level nodes.
    pub fn cursor(&self) -> StackCursor<'_, ChunkNode> {
        StackCursor::at_detached_field(FieldKey::new(""), &self.roots)
    }

    pub fn to_map_trees(&self) -> Vec<MapTree> {
        self.roots.iter().map(|node| node.to_map_tree()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::cursor_for_map_tree_field;

    #[test]
    fn chunk_from_cursor_matches_source() {
        let trees = vec![
            MapTree::new("pair")
                .with_field("a", vec![MapTree::leaf("number", 1.0)])
                .with_field("b", vec![MapTree::leaf("string", "x")]),
            MapTree::leaf("boolean", true),
        ];
        let mut cursor = cursor_for_map_tree_field(&trees);
        let chunk = TreeChunk::from_cursor(&mut cursor).unwrap();
        assert_eq!(chunk.top_level_length(), 2);
        assert_eq!(chunk.to_map_trees(), trees);
    }

    #[test]
    fn chunk_requires_fields_mode() {
        let tree = MapTree::leaf("number", 1.0);
        let mut cursor = crate::tree::cursor_for_map_tree(&tree);
        assert!(TreeChunk::from_cursor(&mut cursor).is_err());
    }
}
