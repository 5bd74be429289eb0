//! Stored schema: which node types exist and what their fields may hold.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::change::field_kind::{FieldKind, FieldKindRegistry, Multiplicity, FORBIDDEN};
use crate::ids::{FieldKey, FieldKindIdentifier, TreeNodeSchemaIdentifier};
use crate::tree::ValueSchema;

pub mod comparison;
pub mod compliance;
pub mod format;
pub mod repository;

pub use comparison::{allows_field_superset, allows_multiplicity_superset, allows_tree_superset};
pub use compliance::{
    complies_with_multiplicity, is_field_in_schema, is_node_in_schema, SchemaValidationError,
};
pub use format::{decode_schema, encode_schema, SchemaFormatVersion};
pub use repository::{AllowIncompatible, StoredSchemaRepository};

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct FieldSchema {
    pub kind: FieldKindIdentifier,
    /// Allowed child types; `None` allows any type.
    pub types: Option<BTreeSet<TreeNodeSchemaIdentifier>>,
}

impl FieldSchema {
    pub fn new<I, T>(kind: &FieldKind, types: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<TreeNodeSchemaIdentifier>,
    {
        Self {
            kind: kind.id(),
            types: Some(types.into_iter().map(Into::into).collect()),
        }
    }

    pub fn any(kind: &FieldKind) -> Self {
        Self {
            kind: kind.id(),
            types: None,
        }
    }

    /// A field that must stay empty.
    pub fn forbidden() -> Self {
        Self {
            kind: FORBIDDEN.id(),
            types: Some(BTreeSet::new()),
        }
    }

    pub fn allows_type(&self, node_type: &TreeNodeSchemaIdentifier) -> bool {
        self.types
            .as_ref()
            .map_or(true, |types| types.contains(node_type))
    }

    /// The single allowed type, if the field is monomorphic.
    pub fn monomorphic_type(&self) -> Option<&TreeNodeSchemaIdentifier> {
        match &self.types {
            Some(types) if types.len() == 1 => types.iter().next(),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum NodeSchema {
    Leaf { value: ValueSchema },
    Map { field: FieldSchema },
    Object { fields: BTreeMap<FieldKey, FieldSchema> },
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StoredSchema {
    pub root: FieldSchema,
    pub nodes: BTreeMap<TreeNodeSchemaIdentifier, NodeSchema>,
}

impl Default for StoredSchema {
    fn default() -> Self {
        Self {
            root: FieldSchema::forbidden(),
            nodes: BTreeMap::new(),
        }
    }
}

impl StoredSchema {
    pub fn new(root: FieldSchema) -> Self {
        Self {
            root,
            nodes: BTreeMap::new(),
        }
    }

    pub fn with_node(mut self, name: impl Into<TreeNodeSchemaIdentifier>, node: NodeSchema) -> Self {
        self.nodes.insert(name.into(), node);
        self
    }

    pub fn node(&self, name: &TreeNodeSchemaIdentifier) -> Option<&NodeSchema> {
        self.nodes.get(name)
    }

    /// Admits no content at all; the state of a document nobody has initialized.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.root.kind == FORBIDDEN.id()
    }
}

/// Interpretation of the field kinds a schema names.
#[derive(Clone, Debug, Default)]
pub struct SchemaPolicy {
    pub field_kinds: FieldKindRegistry,
}

impl SchemaPolicy {
    pub fn multiplicity(&self, kind: &FieldKindIdentifier) -> Option<Multiplicity> {
        self.field_kinds.get(kind).map(|kind| kind.multiplicity)
    }
}

#[derive(Clone, Copy, Debug)]
pub struct SchemaAndPolicy<'a> {
    pub schema: &'a StoredSchema,
    pub policy: &'a SchemaPolicy,
}

impl<'a> SchemaAndPolicy<'a> {
    pub fn new(schema: &'a StoredSchema, policy: &'a SchemaPolicy) -> Self {
        Self { schema, policy }
    }
}
