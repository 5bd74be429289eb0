use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value as Json;

use crate::codec::format::{EncodedFieldBatch, EncodedShape, EncodedValueShape, IdentifierToken};
use crate::codec::shape::{NodeShape, Shape, ShapeId, ShapeTable, ValueShape};
use crate::codec::{CodecError, IdCompressor, FIELD_BATCH_FORMAT_VERSION};
use crate::forest::ChunkNode;
use crate::ids::{FieldKey, TreeNodeSchemaIdentifier};
use crate::tree::Value;

/// Resolves the batch's shape table, checking every index it holds.
pub fn decode_shapes(batch: &EncodedFieldBatch) -> Result<ShapeTable, CodecError> {
    let shape_count = batch.shapes.len();
    let index = |i: u32| {
        if (i as usize) < shape_count {
            Ok(ShapeId(i))
        } else {
            Err(CodecError::ShapeIndexOutOfRange(u64::from(i)))
        }
    };
    let identifier = |token: &IdentifierToken| resolve_identifier(&batch.identifiers, token);
    let shapes = batch
        .shapes
        .iter()
        .map(|shape| {
            Ok(match shape {
                EncodedShape::Node(node) => Shape::Node(NodeShape {
                    node_type: node
                        .node_type
                        .as_ref()
                        .map(|t| identifier(t).map(TreeNodeSchemaIdentifier::new))
                        .transpose()?,
                    value: match &node.value {
                        None => ValueShape::None,
                        Some(EncodedValueShape::Required) => ValueShape::Required,
                        Some(EncodedValueShape::Optional) => ValueShape::Optional,
                        Some(EncodedValueShape::Constant(v)) => ValueShape::Constant(v.clone()),
                        Some(EncodedValueShape::Identifier) => ValueShape::Identifier,
                    },
                    fields: node
                        .fields
                        .iter()
                        .map(|(key, id)| Ok((FieldKey::new(identifier(key)?), index(*id)?)))
                        .collect::<Result<_, CodecError>>()?,
                    extra_fields: node.extra_fields.map(index).transpose()?,
                }),
                EncodedShape::NestedArray(item) => Shape::NestedArray(index(*item)?),
                EncodedShape::InlineArray { length, shape } => Shape::InlineArray {
                    length: *length,
                    item: index(*shape)?,
                },
                EncodedShape::Any => Shape::Any,
            })
        })
        .collect::<Result<Vec<_>, CodecError>>()?;
    Ok(ShapeTable::from_shapes(shapes))
}

/// Decodes every field of the batch, in order.
pub fn decode_field_batch(
    batch: &EncodedFieldBatch,
    compressor: Option<&dyn IdCompressor>,
) -> Result<Vec<Vec<Arc<ChunkNode>>>, CodecError> {
    if batch.version != FIELD_BATCH_FORMAT_VERSION {
        return Err(CodecError::UnsupportedVersion(batch.version));
    }
    let decoder = Decoder {
        table: decode_shapes(batch)?,
        identifiers: &batch.identifiers,
        compressor,
    };
    batch
        .data
        .iter()
        .map(|field| {
            let mut reader = Reader::new(field);
            let shape = reader.shape(&decoder.table)?;
            let nodes = decoder.field(shape, &mut reader, 0)?;
            reader.finish()?;
            Ok(nodes)
        })
        .collect()
}

fn resolve_identifier(identifiers: &[String], token: &IdentifierToken) -> Result<String, CodecError> {
    match token {
        IdentifierToken::Index(i) => identifiers
            .get(*i as usize)
            .cloned()
            .ok_or(CodecError::IdentifierIndexOutOfRange(u64::from(*i))),
        IdentifierToken::Inline(s) => Ok(s.clone()),
    }
}

struct Reader<'a> {
    tokens: &'a [Json],
    position: usize,
}

impl<'a> Reader<'a> {
    fn new(tokens: &'a [Json]) -> Self {
        Self {
            tokens,
            position: 0,
        }
    }

    fn position(&self) -> usize {
        self.position
    }

    fn is_done(&self) -> bool {
        self.position >= self.tokens.len()
    }

    fn next(&mut self) -> Result<&'a Json, CodecError> {
        let token = self.tokens.get(self.position).ok_or(CodecError::Truncated)?;
        self.position += 1;
        Ok(token)
    }

    fn finish(&self) -> Result<(), CodecError> {
        if self.is_done() {
            Ok(())
        } else {
            Err(CodecError::UnexpectedToken(format!(
                "{} trailing tokens",
                self.tokens.len() - self.position
            )))
        }
    }

    fn nested(&mut self) -> Result<Reader<'a>, CodecError> {
        match self.next()? {
            Json::Array(tokens) => Ok(Reader::new(tokens)),
            other => Err(unexpected("array", other)),
        }
    }

    fn bool(&mut self) -> Result<bool, CodecError> {
        let token = self.next()?;
        token.as_bool().ok_or_else(|| unexpected("boolean", token))
    }

    fn shape(&mut self, table: &ShapeTable) -> Result<ShapeId, CodecError> {
        let token = self.next()?;
        let index = token.as_u64().ok_or_else(|| unexpected("shape index", token))?;
        if index < table.len() as u64 {
            Ok(ShapeId(index as u32))
        } else {
            Err(CodecError::ShapeIndexOutOfRange(index))
        }
    }

    fn identifier(&mut self, identifiers: &[String]) -> Result<String, CodecError> {
        match self.next()? {
            Json::String(s) => Ok(s.clone()),
            token => {
                let index = token.as_u64().ok_or_else(|| unexpected("identifier", token))?;
                u32::try_from(index)
                    .ok()
                    .and_then(|i| identifiers.get(i as usize))
                    .cloned()
                    .ok_or(CodecError::IdentifierIndexOutOfRange(index))
            }
        }
    }

    fn value(&mut self) -> Result<Value, CodecError> {
        match self.next()? {
            Json::Null => Ok(Value::Null),
            Json::Bool(b) => Ok(Value::Boolean(*b)),
            Json::String(s) => Ok(Value::String(s.clone())),
            Json::Number(n) => n
                .as_f64()
                .map(Value::Number)
                .ok_or_else(|| CodecError::UnexpectedToken(n.to_string())),
            other => Err(unexpected("value", other)),
        }
    }
}

fn unexpected(expected: &str, found: &Json) -> CodecError {
    CodecError::UnexpectedToken(format!("expected {expected}, found {found}"))
}

struct Decoder<'a> {
    table: ShapeTable,
    identifiers: &'a [String],
    compressor: Option<&'a dyn IdCompressor>,
}

impl Decoder<'_> {
    /// `stalled` counts the steps taken since a token was last read. Past twice the
    /// table size some shape has been revisited without reading, which only a cycle does.
    fn check_progress(&self, stalled: usize) -> Result<(), CodecError> {
        if stalled > 2 * self.table.len() {
            return Err(CodecError::UnexpectedToken(
                "shape cycle reads no tokens".into(),
            ));
        }
        Ok(())
    }

    fn field(
        &self,
        id: ShapeId,
        reader: &mut Reader<'_>,
        stalled: usize,
    ) -> Result<Vec<Arc<ChunkNode>>, CodecError> {
        self.check_progress(stalled)?;
        match self.table.get(id)? {
            Shape::NestedArray(item) => {
                let mut nested = reader.nested()?;
                let mut nodes = Vec::new();
                while !nested.is_done() {
                    let start = nested.position();
                    nodes.push(self.node(*item, &mut nested, 0)?);
                    if nested.position() == start {
                        return Err(CodecError::UnexpectedToken(
                            "array item reads no tokens".into(),
                        ));
                    }
                }
                Ok(nodes)
            }
            Shape::InlineArray { length, item } => {
                let start = reader.position();
                (0..*length)
                    .map(|_| {
                        let stalled = if reader.position() == start { stalled + 1 } else { 0 };
                        self.node(*item, reader, stalled)
                    })
                    .collect()
            }
            Shape::Any => {
                let shape = reader.shape(&self.table)?;
                self.field(shape, reader, 0)
            }
            Shape::Node(_) => Ok(vec![self.node(id, reader, stalled + 1)?]),
        }
    }

    fn node(
        &self,
        id: ShapeId,
        reader: &mut Reader<'_>,
        stalled: usize,
    ) -> Result<Arc<ChunkNode>, CodecError> {
        self.check_progress(stalled)?;
        let start = reader.position();
        let shape = match self.table.get(id)? {
            Shape::Node(shape) => shape,
            Shape::Any => {
                let shape = reader.shape(&self.table)?;
                return self.node(shape, reader, 0);
            }
            _ => {
                return Err(CodecError::ShapeMismatch(
                    "field shape used for a node".into(),
                ))
            }
        };

        let node_type = match &shape.node_type {
            Some(t) => t.clone(),
            None => TreeNodeSchemaIdentifier::new(reader.identifier(self.identifiers)?),
        };
        let value = match &shape.value {
            ValueShape::None => None,
            ValueShape::Required => Some(reader.value()?),
            ValueShape::Optional => match reader.bool()? {
                true => Some(reader.value()?),
                false => None,
            },
            ValueShape::Constant(value) => Some(value.clone()),
            ValueShape::Identifier => Some(self.identifier_value(reader)?),
        };

        let mut fields = BTreeMap::new();
        for (key, field) in &shape.fields {
            let stalled = if reader.position() == start { stalled + 1 } else { 0 };
            let children = self.field(*field, reader, stalled)?;
            if !children.is_empty() {
                fields.insert(key.clone(), children);
            }
        }
        if let Some(field) = shape.extra_fields {
            let mut nested = reader.nested()?;
            while !nested.is_done() {
                let key = FieldKey::new(nested.identifier(self.identifiers)?);
                if fields.contains_key(&key) || shape.fields.iter().any(|(k, _)| *k == key) {
                    return Err(CodecError::UnexpectedToken(format!("field {key} repeated")));
                }
                let children = self.field(field, &mut nested, 0)?;
                if !children.is_empty() {
                    fields.insert(key, children);
                }
            }
        }

        Ok(Arc::new(ChunkNode {
            node_type,
            value,
            fields,
        }))
    }

    fn identifier_value(&self, reader: &mut Reader<'_>) -> Result<Value, CodecError> {
        match reader.next()? {
            Json::String(s) => Ok(Value::String(s.clone())),
            token => {
                let compressed = token
                    .as_i64()
                    .ok_or_else(|| unexpected("identifier value", token))?;
                self.compressor
                    .and_then(|ids| ids.decompress(compressed))
                    .map(|stable| Value::String(stable.to_owned()))
                    .ok_or(CodecError::UnknownCompressedId(compressed))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::codec::format::EncodedNodeShape;
    use crate::codec::{encode_field_batch, MemoryIdCompressor, Shapes};
    use crate::change::field_kind::{IDENTIFIER, OPTIONAL, SEQUENCE};
    use crate::schema::{FieldSchema, NodeSchema, SchemaAndPolicy, SchemaPolicy, StoredSchema};
    use crate::tree::{MapTree, ValueSchema};

    fn schema() -> StoredSchema {
        StoredSchema::new(FieldSchema::new(&SEQUENCE, ["item"]))
            .with_node("id", NodeSchema::Leaf { value: ValueSchema::String })
            .with_node("text", NodeSchema::Leaf { value: ValueSchema::String })
            .with_node(
                "item",
                NodeSchema::Object {
                    fields: [
                        ("id".into(), FieldSchema::new(&IDENTIFIER, ["id"])),
                        ("label".into(), FieldSchema::new(&OPTIONAL, ["text"])),
                    ]
                    .into_iter()
                    .collect(),
                },
            )
    }

    fn item(id: &str, label: Option<&str>) -> MapTree {
        MapTree::new("item")
            .with_field("id", vec![MapTree::leaf("id", id)])
            .with_field(
                "label",
                label.map(|l| MapTree::leaf("text", l)).into_iter().collect(),
            )
    }

    fn roundtrip(trees: &[MapTree], shapes: &Shapes, ids: Option<&dyn IdCompressor>) -> Vec<MapTree> {
        let batch = encode_field_batch::<MapTree>(&[trees], shapes, ids).unwrap();
        let wire = serde_json::to_string(&batch).unwrap();
        let batch: EncodedFieldBatch = serde_json::from_str(&wire).unwrap();
        let mut fields = decode_field_batch(&batch, ids).unwrap();
        assert_eq!(fields.len(), 1);
        fields.remove(0).iter().map(|node| node.to_map_tree()).collect()
    }

    #[test]
    fn schema_shapes_roundtrip_with_compressed_ids() {
        let schema = schema();
        let policy = SchemaPolicy::default();
        let shapes = Shapes::from_schema(SchemaAndPolicy::new(&schema, &policy));
        let mut ids = MemoryIdCompressor::new();
        let known = ids.generate();
        let trees = vec![item(&known, Some("first")), item("not-compressed", None)];
        assert_eq!(roundtrip(&trees, &shapes, Some(&ids)), trees);

        let batch = encode_field_batch::<MapTree>(&[trees.as_slice()], &shapes, Some(&ids)).unwrap();
        let flat = serde_json::to_string(&batch.data).unwrap();
        assert!(!flat.contains(&known));
        assert!(flat.contains("not-compressed"));
    }

    #[test]
    fn uniform_shapes_roundtrip() {
        let trees = vec![
            MapTree::new("a")
                .with_field("x", vec![MapTree::leaf("n", 1.5), MapTree::leaf("n", true)])
                .with_field("y", vec![MapTree::new("b")]),
            MapTree::leaf("n", "text"),
        ];
        assert_eq!(roundtrip(&trees, &Shapes::uniform(), None), trees);
    }

    #[test]
    fn repeated_identifiers_go_to_the_table() {
        let trees = vec![MapTree::leaf("n", 1.0), MapTree::leaf("n", 2.0), MapTree::leaf("once", 3.0)];
        let batch = encode_field_batch::<MapTree>(&[trees.as_slice()], &Shapes::uniform(), None).unwrap();
        assert_eq!(batch.identifiers, vec!["n".to_owned()]);
        assert_eq!(batch.data[0][1], json!([0, true, 1.0, [], 0, true, 2.0, [], "once", true, 3.0, []]));
    }

    #[test]
    fn rejects_out_of_range_indices() {
        let trees = vec![MapTree::leaf("n", 1.0), MapTree::leaf("n", 2.0)];
        let mut batch = encode_field_batch::<MapTree>(&[trees.as_slice()], &Shapes::uniform(), None).unwrap();
        let mut bad_identifier = batch.clone();
        bad_identifier.data[0][1] = json!([7, true, 1.0, []]);
        assert_eq!(
            decode_field_batch(&bad_identifier, None),
            Err(CodecError::IdentifierIndexOutOfRange(7))
        );
        batch.data[0][0] = json!(99);
        assert_eq!(decode_field_batch(&batch, None), Err(CodecError::ShapeIndexOutOfRange(99)));
    }

    #[test]
    fn rejects_truncated_and_versioned_streams() {
        let trees = vec![MapTree::leaf("n", 1.0)];
        let mut batch = encode_field_batch::<MapTree>(&[trees.as_slice()], &Shapes::uniform(), None).unwrap();
        let mut truncated = batch.clone();
        truncated.data[0][1] = json!(["n", true]);
        assert_eq!(decode_field_batch(&truncated, None), Err(CodecError::Truncated));
        batch.version = 2;
        assert_eq!(decode_field_batch(&batch, None), Err(CodecError::UnsupportedVersion(2)));
    }

    #[test]
    fn deep_trees_roundtrip() {
        let tree = (0..600).fold(MapTree::leaf("n", 0.0), |child, _| {
            MapTree::new("o").with_field("c", vec![child])
        });
        let trees = vec![tree];
        let batch = encode_field_batch::<MapTree>(&[trees.as_slice()], &Shapes::uniform(), None).unwrap();
        let fields = decode_field_batch(&batch, None).unwrap();
        assert_eq!(fields[0][0].to_map_tree(), trees[0]);
    }

    #[test]
    fn sequences_of_empty_nodes_keep_their_length() {
        let schema = StoredSchema::new(FieldSchema::new(&SEQUENCE, ["marker"]))
            .with_node("marker", NodeSchema::Object { fields: BTreeMap::new() });
        let policy = SchemaPolicy::default();
        let shapes = Shapes::from_schema(SchemaAndPolicy::new(&schema, &policy));
        let trees = vec![MapTree::new("marker"); 3];
        assert_eq!(roundtrip(&trees, &shapes, None), trees);
    }

    #[test]
    fn rejects_shape_cycles_that_read_nothing() {
        let batch = EncodedFieldBatch {
            version: FIELD_BATCH_FORMAT_VERSION,
            identifiers: Vec::new(),
            shapes: vec![EncodedShape::Node(EncodedNodeShape {
                node_type: Some(IdentifierToken::Inline("o".into())),
                value: None,
                fields: vec![(IdentifierToken::Inline("c".into()), 0)],
                extra_fields: None,
            })],
            data: vec![vec![json!(0)]],
        };
        assert_eq!(
            decode_field_batch(&batch, None),
            Err(CodecError::UnexpectedToken("shape cycle reads no tokens".into()))
        );
    }

    #[test]
    fn unknown_compressed_id_is_fatal() {
        let schema = schema();
        let policy = SchemaPolicy::default();
        let shapes = Shapes::from_schema(SchemaAndPolicy::new(&schema, &policy));
        let mut ids = MemoryIdCompressor::new();
        let known = ids.generate();
        let trees = vec![item(&known, None)];
        let batch = encode_field_batch::<MapTree>(&[trees.as_slice()], &shapes, Some(&ids)).unwrap();
        assert_eq!(
            decode_field_batch(&batch, Some(&MemoryIdCompressor::new())),
            Err(CodecError::UnknownCompressedId(0))
        );
    }
}
