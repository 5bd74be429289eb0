use std::collections::BTreeMap;

use crate::change::field_kind::{Multiplicity, IDENTIFIER};
use crate::codec::CodecError;
use crate::ids::{FieldKey, TreeNodeSchemaIdentifier};
use crate::schema::{FieldSchema, NodeSchema, SchemaAndPolicy};
use crate::tree::{TreeNodeLike, Value, ValueSchema};

/// Index into a [`ShapeTable`].
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ShapeId(pub u32);

#[derive(Clone, Debug, PartialEq)]
pub enum ValueShape {
    /// The node has no value.
    None,
    Required,
    /// Preceded by a presence flag.
    Optional,
    /// Implied by the shape; nothing is written.
    Constant(Value),
    /// A string identifier, written in compressed form when the compressor knows it.
    Identifier,
}

impl ValueShape {
    pub fn accepts(&self, value: Option<&Value>) -> bool {
        match (self, value) {
            (ValueShape::None, None) | (ValueShape::Optional, _) => true,
            (ValueShape::Required, Some(_)) => true,
            (ValueShape::Constant(expected), Some(value)) => expected == value,
            (ValueShape::Identifier, Some(Value::String(_))) => true,
            _ => false,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct NodeShape {
    /// Fixed type, or `None` when the type is written per node.
    pub node_type: Option<TreeNodeSchemaIdentifier>,
    pub value: ValueShape,
    /// Specialized fields, written in this order whether present or not.
    pub fields: Vec<(FieldKey, ShapeId)>,
    /// Shape for any field not listed in `fields`.
    pub extra_fields: Option<ShapeId>,
}

impl NodeShape {
    /// Checks the node itself against the shape, not its descendants.
    pub fn fits<N: TreeNodeLike>(&self, node: &N) -> bool {
        self.node_type
            .as_ref()
            .map_or(true, |t| t == node.node_type())
            && self.value.accepts(node.value())
            && (self.extra_fields.is_some()
                || node
                    .field_keys()
                    .into_iter()
                    .all(|key| self.fields.iter().any(|(k, _)| k == key)))
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Shape {
    Node(NodeShape),
    /// A field written as one nested array of its nodes.
    NestedArray(ShapeId),
    /// A field of exactly `length` nodes written inline.
    InlineArray { length: u32, item: ShapeId },
    /// The concrete shape index is written in the data.
    Any,
}

impl Shape {
    pub(crate) fn references(&self) -> Vec<ShapeId> {
        match self {
            Shape::Node(node) => node
                .fields
                .iter()
                .map(|(_, id)| *id)
                .chain(node.extra_fields)
                .collect(),
            Shape::NestedArray(item) | Shape::InlineArray { item, .. } => vec![*item],
            Shape::Any => Vec::new(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ShapeTable {
    shapes: Vec<Shape>,
}

impl ShapeTable {
    pub fn from_shapes(shapes: Vec<Shape>) -> Self {
        Self { shapes }
    }

    pub fn len(&self) -> usize {
        self.shapes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shapes.is_empty()
    }

    pub fn get(&self, id: ShapeId) -> Result<&Shape, CodecError> {
        self.shapes
            .get(id.0 as usize)
            .ok_or(CodecError::ShapeIndexOutOfRange(u64::from(id.0)))
    }

    pub fn iter(&self) -> impl Iterator<Item = (ShapeId, &Shape)> {
        self.shapes
            .iter()
            .enumerate()
            .map(|(i, shape)| (ShapeId(i as u32), shape))
    }

    /// Adds `shape`, reusing an identical entry.
    pub fn intern(&mut self, shape: Shape) -> ShapeId {
        match self.shapes.iter().position(|s| *s == shape) {
            Some(i) => ShapeId(i as u32),
            None => self.push(shape),
        }
    }

    fn push(&mut self, shape: Shape) -> ShapeId {
        self.shapes.push(shape);
        ShapeId(self.shapes.len() as u32 - 1)
    }

    /// Slot for a shape that refers to itself; filled by `set`.
    fn reserve(&mut self) -> ShapeId {
        self.push(Shape::Any)
    }

    fn set(&mut self, id: ShapeId, shape: Shape) {
        self.shapes[id.0 as usize] = shape;
    }
}

/// Shape policy: the table plus how to choose shapes for polymorphic positions.
#[derive(Clone, Debug)]
pub struct Shapes {
    pub table: ShapeTable,
    /// Shape of each top-level field of a batch.
    pub field: ShapeId,
    by_type: BTreeMap<TreeNodeSchemaIdentifier, ShapeId>,
    fallback_node: ShapeId,
    fallback_field: ShapeId,
}

impl Shapes {
    /// One self-describing node shape used everywhere.
    pub fn uniform() -> Self {
        let mut table = ShapeTable::default();
        let (node, field) = uniform_shapes(&mut table);
        Self {
            table,
            field,
            by_type: BTreeMap::new(),
            fallback_node: node,
            fallback_field: field,
        }
    }

    /// Node shapes specialized per schema type. Top-level fields are polymorphic.
    pub fn from_schema(schema: SchemaAndPolicy<'_>) -> Self {
        let mut table = ShapeTable::default();
        let (fallback_node, fallback_field) = uniform_shapes(&mut table);
        let any = table.intern(Shape::Any);
        let mut builder = SchemaShapeBuilder {
            schema,
            table: &mut table,
            nodes: BTreeMap::new(),
            any,
            fallback_field,
        };
        let by_type = schema
            .schema
            .nodes
            .keys()
            .map(|name| (name.clone(), builder.node(name, false)))
            .collect();
        let field = table.intern(Shape::NestedArray(any));
        Self {
            table,
            field,
            by_type,
            fallback_node,
            fallback_field,
        }
    }

    /// Shape for `node` at a polymorphic position.
    pub(crate) fn choose_node<N: TreeNodeLike>(&self, node: &N) -> ShapeId {
        self.by_type
            .get(node.node_type())
            .copied()
            .filter(|id| matches!(self.table.get(*id), Ok(Shape::Node(shape)) if shape.fits(node)))
            .unwrap_or(self.fallback_node)
    }

    pub(crate) fn fallback_field(&self) -> ShapeId {
        self.fallback_field
    }
}

fn uniform_shapes(table: &mut ShapeTable) -> (ShapeId, ShapeId) {
    let field = table.reserve();
    let node = table.intern(Shape::Node(NodeShape {
        node_type: None,
        value: ValueShape::Optional,
        fields: Vec::new(),
        extra_fields: Some(field),
    }));
    table.set(field, Shape::NestedArray(node));
    (node, field)
}

/// Whether data for `id` is always empty. Shapes still being built are `Any` and so
/// count as writing something.
fn reads_nothing(table: &ShapeTable, id: ShapeId, steps: usize) -> bool {
    if steps > table.len() {
        return false;
    }
    match table.get(id) {
        Ok(Shape::Node(node)) => {
            node.extra_fields.is_none()
                && matches!(node.value, ValueShape::None | ValueShape::Constant(_))
                && node
                    .fields
                    .iter()
                    .all(|(_, field)| reads_nothing(table, *field, steps + 1))
        }
        Ok(Shape::InlineArray { length, item }) => {
            *length == 0 || reads_nothing(table, *item, steps + 1)
        }
        _ => false,
    }
}

struct SchemaShapeBuilder<'a, 's> {
    schema: SchemaAndPolicy<'s>,
    table: &'a mut ShapeTable,
    nodes: BTreeMap<(TreeNodeSchemaIdentifier, bool), ShapeId>,
    any: ShapeId,
    fallback_field: ShapeId,
}

impl SchemaShapeBuilder<'_, '_> {
    fn field(&mut self, field: &FieldSchema) -> ShapeId {
        let Some(multiplicity) = self.schema.policy.multiplicity(&field.kind) else {
            return self.fallback_field;
        };
        let identifier = field.kind == IDENTIFIER.id();
        let item = match field.monomorphic_type() {
            Some(t) if self.schema.schema.node(t).is_some() => self.node(t, identifier),
            _ => self.any,
        };
        let shape = match multiplicity {
            Multiplicity::Single => Shape::InlineArray { length: 1, item },
            Multiplicity::Forbidden => Shape::InlineArray { length: 0, item },
            // Items that write nothing would leave the array's length unrecorded.
            Multiplicity::Optional | Multiplicity::Sequence
                if reads_nothing(&*self.table, item, 0) =>
            {
                Shape::NestedArray(self.any)
            }
            Multiplicity::Optional | Multiplicity::Sequence => Shape::NestedArray(item),
        };
        self.table.intern(shape)
    }

    fn node(&mut self, name: &TreeNodeSchemaIdentifier, identifier: bool) -> ShapeId {
        if let Some(id) = self.nodes.get(&(name.clone(), identifier)) {
            return *id;
        }
        let id = self.table.reserve();
        self.nodes.insert((name.clone(), identifier), id);
        let shape = match self.schema.schema.node(name) {
            Some(NodeSchema::Leaf { value }) => NodeShape {
                node_type: Some(name.clone()),
                value: match value {
                    ValueSchema::String if identifier => ValueShape::Identifier,
                    ValueSchema::Null => ValueShape::Constant(Value::Null),
                    _ => ValueShape::Required,
                },
                fields: Vec::new(),
                extra_fields: None,
            },
            Some(NodeSchema::Map { field }) => NodeShape {
                node_type: Some(name.clone()),
                value: ValueShape::None,
                fields: Vec::new(),
                extra_fields: Some(self.field(field)),
            },
            Some(NodeSchema::Object { fields }) => NodeShape {
                node_type: Some(name.clone()),
                value: ValueShape::None,
                fields: fields
                    .iter()
                    .map(|(key, field)| (key.clone(), self.field(field)))
                    .collect(),
                extra_fields: None,
            },
            None => NodeShape {
                node_type: Some(name.clone()),
                value: ValueShape::Optional,
                fields: Vec::new(),
                extra_fields: Some(self.fallback_field),
            },
        };
        self.table.set(id, Shape::Node(shape));
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::field_kind::{SEQUENCE, VALUE};
    use crate::schema::{SchemaPolicy, StoredSchema};
    use crate::tree::MapTree;

    #[test]
    fn recursive_schema_terminates() {
        let schema = StoredSchema::new(FieldSchema::new(&SEQUENCE, ["folder"])).with_node(
            "folder",
            NodeSchema::Object {
                fields: [("children".into(), FieldSchema::new(&SEQUENCE, ["folder"]))]
                    .into_iter()
                    .collect(),
            },
        );
        let policy = SchemaPolicy::default();
        let shapes = Shapes::from_schema(SchemaAndPolicy::new(&schema, &policy));
        let folder = shapes.choose_node(&MapTree::new("folder"));
        let Ok(Shape::Node(node)) = shapes.table.get(folder) else {
            panic!("folder shape is not a node shape");
        };
        let children = node.fields[0].1;
        assert_eq!(shapes.table.get(children), Ok(&Shape::NestedArray(folder)));
    }

    #[test]
    fn sequences_of_empty_nodes_write_each_shape() {
        let schema = StoredSchema::new(FieldSchema::new(&SEQUENCE, ["marker"]))
            .with_node("marker", NodeSchema::Object { fields: BTreeMap::new() })
            .with_node(
                "list",
                NodeSchema::Object {
                    fields: [("items".into(), FieldSchema::new(&SEQUENCE, ["marker"]))]
                        .into_iter()
                        .collect(),
                },
            );
        let policy = SchemaPolicy::default();
        let shapes = Shapes::from_schema(SchemaAndPolicy::new(&schema, &policy));
        let list = shapes.choose_node(&MapTree::new("list"));
        let Ok(Shape::Node(node)) = shapes.table.get(list) else {
            panic!("list shape is not a node shape");
        };
        let Ok(Shape::NestedArray(item)) = shapes.table.get(node.fields[0].1) else {
            panic!("items shape is not a nested array");
        };
        assert_eq!(shapes.table.get(*item), Ok(&Shape::Any));
    }

    #[test]
    fn ill_fitting_node_gets_fallback() {
        let schema = StoredSchema::new(FieldSchema::new(&VALUE, ["n"]))
            .with_node("n", NodeSchema::Leaf { value: ValueSchema::Number });
        let policy = SchemaPolicy::default();
        let shapes = Shapes::from_schema(SchemaAndPolicy::new(&schema, &policy));
        let fitting = shapes.choose_node(&MapTree::leaf("n", 1.0));
        let valueless = shapes.choose_node(&MapTree::new("n"));
        assert_ne!(fitting, valueless);
        assert_eq!(valueless, Shapes::uniform().fallback_node);
    }
}
