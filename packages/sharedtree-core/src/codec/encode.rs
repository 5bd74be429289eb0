use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value as Json;
use tracing::debug;

use crate::codec::format::{
    EncodedFieldBatch, EncodedNodeShape, EncodedShape, EncodedValueShape, IdentifierToken,
};
use crate::codec::shape::{NodeShape, Shape, ShapeId, Shapes, ValueShape};
use crate::codec::{CodecError, IdCompressor, FIELD_BATCH_FORMAT_VERSION};
use crate::tree::{TreeNodeLike, Value};

/// Output of the discovery pass, before shape and identifier indices are assigned.
enum Token {
    Json(Json),
    Shape(ShapeId),
    Identifier(String),
    Array(Vec<Token>),
}

/// How often each shape and identifier is referenced by an encoded batch.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ReferenceCounts {
    pub shapes: BTreeMap<ShapeId, u64>,
    pub identifiers: BTreeMap<String, u64>,
}

/// Discovery pass on its own: what the batch would reference and how often.
pub fn count_referenced_shapes_and_identifiers<N: TreeNodeLike>(
    fields: &[&[N::Child]],
    shapes: &Shapes,
    compressor: Option<&dyn IdCompressor>,
) -> Result<ReferenceCounts, CodecError> {
    let data = discover::<N>(fields, shapes, compressor)?;
    count(shapes, &data)
}

pub fn encode_field_batch<N: TreeNodeLike>(
    fields: &[&[N::Child]],
    shapes: &Shapes,
    compressor: Option<&dyn IdCompressor>,
) -> Result<EncodedFieldBatch, CodecError> {
    let data = discover::<N>(fields, shapes, compressor)?;
    let counts = count(shapes, &data)?;

    let mut order: Vec<(ShapeId, u64)> = counts.shapes.iter().map(|(id, n)| (*id, *n)).collect();
    order.sort_by(|(a, a_count), (b, b_count)| b_count.cmp(a_count).then(a.cmp(b)));
    let shape_index: BTreeMap<ShapeId, u32> = order
        .iter()
        .enumerate()
        .map(|(index, (id, _))| (*id, index as u32))
        .collect();

    let mut identifiers: Vec<(&String, u64)> = counts
        .identifiers
        .iter()
        .filter(|(_, n)| **n > 1)
        .map(|(s, n)| (s, *n))
        .collect();
    identifiers.sort_by(|(a, a_count), (b, b_count)| b_count.cmp(a_count).then(a.cmp(b)));
    let identifiers: Vec<String> = identifiers.into_iter().map(|(s, _)| s.clone()).collect();

    let emitter = Emitter {
        shape_index: &shape_index,
        identifier_index: identifiers
            .iter()
            .enumerate()
            .map(|(i, s)| (s.as_str(), i as u32))
            .collect(),
    };
    let encoded_shapes = order
        .iter()
        .map(|(id, _)| emitter.shape(shapes.table.get(*id)?))
        .collect::<Result<Vec<_>, _>>()?;
    let data = data
        .into_iter()
        .map(|field| emitter.tokens(field))
        .collect::<Result<Vec<_>, _>>()?;

    debug!(
        fields = data.len(),
        shapes = encoded_shapes.len(),
        identifiers = identifiers.len(),
        "encoded field batch"
    );
    Ok(EncodedFieldBatch {
        version: FIELD_BATCH_FORMAT_VERSION,
        identifiers,
        shapes: encoded_shapes,
        data,
    })
}

fn discover<N: TreeNodeLike>(
    fields: &[&[N::Child]],
    shapes: &Shapes,
    compressor: Option<&dyn IdCompressor>,
) -> Result<Vec<Vec<Token>>, CodecError> {
    let discovery = Discovery { shapes, compressor };
    fields
        .iter()
        .map(|children| {
            let mut out = vec![Token::Shape(shapes.field)];
            discovery.field::<N>(shapes.field, children, &mut out)?;
            Ok(out)
        })
        .collect()
}

fn count(shapes: &Shapes, data: &[Vec<Token>]) -> Result<ReferenceCounts, CodecError> {
    let mut counts = ReferenceCounts::default();
    fn walk(tokens: &[Token], counts: &mut ReferenceCounts) {
        for token in tokens {
            match token {
                Token::Shape(id) => *counts.shapes.entry(*id).or_default() += 1,
                Token::Identifier(s) => *counts.identifiers.entry(s.clone()).or_default() += 1,
                Token::Array(nested) => walk(nested, counts),
                Token::Json(_) => {}
            }
        }
    }
    for field in data {
        walk(field, &mut counts);
    }

    let mut reachable: BTreeSet<ShapeId> = counts.shapes.keys().copied().collect();
    let mut pending: Vec<ShapeId> = reachable.iter().copied().collect();
    while let Some(id) = pending.pop() {
        let shape = shapes.table.get(id)?;
        for referenced in shape.references() {
            *counts.shapes.entry(referenced).or_default() += 1;
            if reachable.insert(referenced) {
                pending.push(referenced);
            }
        }
        if let Shape::Node(node) = shape {
            let names = node
                .node_type
                .iter()
                .map(|t| t.as_str())
                .chain(node.fields.iter().map(|(key, _)| key.as_str()));
            for name in names {
                *counts.identifiers.entry(name.to_owned()).or_default() += 1;
            }
        }
    }
    Ok(counts)
}

struct Discovery<'a> {
    shapes: &'a Shapes,
    compressor: Option<&'a dyn IdCompressor>,
}

impl Discovery<'_> {
    fn field<N: TreeNodeLike>(
        &self,
        id: ShapeId,
        children: &[N::Child],
        out: &mut Vec<Token>,
    ) -> Result<(), CodecError> {
        match self.shapes.table.get(id)? {
            Shape::NestedArray(item) => {
                let mut nested = Vec::with_capacity(children.len());
                for child in children {
                    self.node::<N>(*item, child.as_ref(), &mut nested)?;
                }
                out.push(Token::Array(nested));
            }
            Shape::InlineArray { length, item } => {
                if children.len() != *length as usize {
                    return Err(CodecError::ShapeMismatch(format!(
                        "field shape expects {length} nodes, found {}",
                        children.len()
                    )));
                }
                for child in children {
                    self.node::<N>(*item, child.as_ref(), out)?;
                }
            }
            Shape::Any => {
                let field = self.shapes.fallback_field();
                out.push(Token::Shape(field));
                self.field::<N>(field, children, out)?;
            }
            Shape::Node(_) => match children {
                [child] => self.node::<N>(id, child.as_ref(), out)?,
                _ => {
                    return Err(CodecError::ShapeMismatch(format!(
                        "node shape used for a field of {} nodes",
                        children.len()
                    )))
                }
            },
        }
        Ok(())
    }

    fn node<N: TreeNodeLike>(
        &self,
        id: ShapeId,
        node: &N,
        out: &mut Vec<Token>,
    ) -> Result<(), CodecError> {
        match self.shapes.table.get(id)? {
            Shape::Any => {
                let chosen = self.shapes.choose_node(node);
                out.push(Token::Shape(chosen));
                self.node(chosen, node, out)
            }
            Shape::Node(shape) => self.node_with(shape, node, out),
            _ => Err(CodecError::ShapeMismatch(
                "field shape used for a node".into(),
            )),
        }
    }

    fn node_with<N: TreeNodeLike>(
        &self,
        shape: &NodeShape,
        node: &N,
        out: &mut Vec<Token>,
    ) -> Result<(), CodecError> {
        match &shape.node_type {
            Some(t) if t != node.node_type() => {
                return Err(CodecError::ShapeMismatch(format!(
                    "shape is for {t}, node is {}",
                    node.node_type()
                )))
            }
            Some(_) => {}
            None => out.push(Token::Identifier(node.node_type().as_str().to_owned())),
        }

        match (&shape.value, node.value()) {
            (ValueShape::None, None) => {}
            (ValueShape::Required, Some(value)) => out.push(Token::Json(value_token(value)?)),
            (ValueShape::Optional, None) => out.push(Token::Json(Json::Bool(false))),
            (ValueShape::Optional, Some(value)) => {
                out.push(Token::Json(Json::Bool(true)));
                out.push(Token::Json(value_token(value)?));
            }
            (ValueShape::Constant(expected), Some(value)) if expected == value => {}
            (ValueShape::Identifier, Some(Value::String(stable))) => {
                let token = self
                    .compressor
                    .and_then(|ids| ids.try_recompress(stable))
                    .map_or_else(|| Json::String(stable.clone()), Json::from);
                out.push(Token::Json(token));
            }
            (expected, found) => {
                return Err(CodecError::ShapeMismatch(format!(
                    "value {found:?} does not fit {expected:?}"
                )))
            }
        }

        for (key, field) in &shape.fields {
            self.field::<N>(*field, node.field(key), out)?;
        }

        let extra: Vec<_> = node
            .field_keys()
            .into_iter()
            .filter(|key| !shape.fields.iter().any(|(k, _)| k == *key))
            .collect();
        match shape.extra_fields {
            Some(field) => {
                let mut nested = Vec::new();
                for key in extra {
                    nested.push(Token::Identifier(key.as_str().to_owned()));
                    self.field::<N>(field, node.field(key), &mut nested)?;
                }
                out.push(Token::Array(nested));
            }
            None if extra.is_empty() => {}
            None => {
                return Err(CodecError::ShapeMismatch(format!(
                    "field {} is not part of the shape",
                    extra[0]
                )))
            }
        }
        Ok(())
    }
}

fn value_token(value: &Value) -> Result<Json, CodecError> {
    Ok(match value {
        Value::Number(n) => serde_json::Number::from_f64(*n)
            .map(Json::Number)
            .ok_or_else(|| CodecError::ShapeMismatch(format!("non-finite number {n}")))?,
        Value::String(s) => Json::String(s.clone()),
        Value::Boolean(b) => Json::Bool(*b),
        Value::Null => Json::Null,
    })
}

struct Emitter<'a> {
    shape_index: &'a BTreeMap<ShapeId, u32>,
    identifier_index: BTreeMap<&'a str, u32>,
}

impl Emitter<'_> {
    fn identifier(&self, name: &str) -> IdentifierToken {
        match self.identifier_index.get(name) {
            Some(i) => IdentifierToken::Index(*i),
            None => IdentifierToken::Inline(name.to_owned()),
        }
    }

    fn index(&self, id: ShapeId) -> Result<u32, CodecError> {
        self.shape_index
            .get(&id)
            .copied()
            .ok_or(CodecError::ShapeIndexOutOfRange(u64::from(id.0)))
    }

    fn shape(&self, shape: &Shape) -> Result<EncodedShape, CodecError> {
        Ok(match shape {
            Shape::Node(node) => EncodedShape::Node(EncodedNodeShape {
                node_type: node.node_type.as_ref().map(|t| self.identifier(t.as_str())),
                value: match &node.value {
                    ValueShape::None => None,
                    ValueShape::Required => Some(EncodedValueShape::Required),
                    ValueShape::Optional => Some(EncodedValueShape::Optional),
                    ValueShape::Constant(value) => Some(EncodedValueShape::Constant(value.clone())),
                    ValueShape::Identifier => Some(EncodedValueShape::Identifier),
                },
                fields: node
                    .fields
                    .iter()
                    .map(|(key, id)| Ok((self.identifier(key.as_str()), self.index(*id)?)))
                    .collect::<Result<_, CodecError>>()?,
                extra_fields: node.extra_fields.map(|id| self.index(id)).transpose()?,
            }),
            Shape::NestedArray(item) => EncodedShape::NestedArray(self.index(*item)?),
            Shape::InlineArray { length, item } => EncodedShape::InlineArray {
                length: *length,
                shape: self.index(*item)?,
            },
            Shape::Any => EncodedShape::Any,
        })
    }

    fn tokens(&self, tokens: Vec<Token>) -> Result<Vec<Json>, CodecError> {
        tokens
            .into_iter()
            .map(|token| {
                Ok(match token {
                    Token::Json(json) => json,
                    Token::Shape(id) => Json::from(self.index(id)?),
                    Token::Identifier(name) => self.identifier(&name).into(),
                    Token::Array(nested) => Json::Array(self.tokens(nested)?),
                })
            })
            .collect()
    }
}
