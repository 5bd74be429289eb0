use std::collections::BTreeMap;

use crate::ids::{FieldKey, TreeNodeSchemaIdentifier};
use crate::tree::cursor::{CursorLocationType, StackCursor, TreeCursor, TreeNodeLike};
use crate::tree::value::Value;

/// Neutral, owned tree node. Empty fields are never stored.
#[derive(Clone, Debug, PartialEq)]
pub struct MapTree {
    pub node_type: TreeNodeSchemaIdentifier,
    pub value: Option<Value>,
    pub fields: BTreeMap<FieldKey, Vec<MapTree>>,
}

impl MapTree {
    pub fn new(node_type: impl Into<TreeNodeSchemaIdentifier>) -> Self {
        Self {
            node_type: node_type.into(),
            value: None,
            fields: BTreeMap::new(),
        }
    }

    pub fn leaf(node_type: impl Into<TreeNodeSchemaIdentifier>, value: impl Into<Value>) -> Self {
        Self {
            node_type: node_type.into(),
            value: Some(value.into()),
            fields: BTreeMap::new(),
        }
    }

    /// Builder-style field setter; an empty `children` list removes the field.
    pub fn with_field(mut self, key: impl Into<FieldKey>, children: Vec<MapTree>) -> Self {
        let key = key.into();
        if children.is_empty() {
            self.fields.remove(&key);
        } else {
            self.fields.insert(key, children);
        }
        self
    }

    pub fn field(&self, key: &FieldKey) -> &[MapTree] {
        self.fields.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Number of nodes in this subtree, including this one.
    pub fn size(&self) -> usize {
        1 + self
            .fields
            .values()
            .flat_map(|children| children.iter())
            .map(MapTree::size)
            .sum::<usize>()
    }
}

impl AsRef<MapTree> for MapTree {
    fn as_ref(&self) -> &MapTree {
        self
    }
}

impl TreeNodeLike for MapTree {
    type Child = MapTree;

    fn node_type(&self) -> &TreeNodeSchemaIdentifier {
        &self.node_type
    }

    fn value(&self) -> Option<&Value> {
        self.value.as_ref()
    }

    fn field(&self, key: &FieldKey) -> &[MapTree] {
        MapTree::field(self, key)
    }

    fn field_keys(&self) -> Vec<&FieldKey> {
        self.fields
            .iter()
            .filter(|(_, children)| !children.is_empty())
            .map(|(key, _)| key)
            .collect()
    }
}

/// Cursor in nodes mode on `tree`.
pub fn cursor_for_map_tree(tree: &MapTree) -> StackCursor<'_, MapTree> {
    StackCursor::at_node(tree)
}

/// Cursor in fields mode over a free-standing field holding `trees`.
pub fn cursor_for_map_tree_field(trees: &[MapTree]) -> StackCursor<'_, MapTree> {
    StackCursor::at_detached_field(FieldKey::new(""), trees)
}

/// Copies the node under a nodes-mode cursor. The cursor is left where it started.
pub fn map_tree_from_cursor<C: TreeCursor + ?Sized>(cursor: &mut C) -> MapTree {
    assert_eq!(
        cursor.mode(),
        CursorLocationType::Nodes,
        "map_tree_from_cursor requires a cursor in nodes mode"
    );
    let node_type = cursor.node_type().clone();
    let value = cursor.value().cloned();
    let mut fields = BTreeMap::new();
    if cursor.first_field() {
        loop {
            let key = cursor.get_field_key().clone();
            let children = map_tree_field_from_cursor(cursor);
            if !children.is_empty() {
                fields.insert(key, children);
            }
            if !cursor.next_field() {
                break;
            }
        }
    }
    MapTree {
        node_type,
        value,
        fields,
    }
}

/// Copies the field under a fields-mode cursor. The cursor is left where it started.
pub fn map_tree_field_from_cursor<C: TreeCursor + ?Sized>(cursor: &mut C) -> Vec<MapTree> {
    assert_eq!(
        cursor.mode(),
        CursorLocationType::Fields,
        "map_tree_field_from_cursor requires a cursor in fields mode"
    );
    let mut out = Vec::with_capacity(cursor.get_field_length());
    if cursor.first_node() {
        loop {
            out.push(map_tree_from_cursor(cursor));
            if !cursor.next_node() {
                break;
            }
        }
    }
    out
}
