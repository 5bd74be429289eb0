use thiserror::Error;

use crate::change::field_kind::Multiplicity;
use crate::ids::{FieldKey, FieldKindIdentifier, TreeNodeSchemaIdentifier};
use crate::schema::{FieldSchema, NodeSchema, SchemaAndPolicy};
use crate::tree::{value::allows_value, TreeNodeLike};

/// Why content is out of schema. Reported to the caller, never raised as a fatal error.
#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum SchemaValidationError {
    #[error("no schema for node type {0}")]
    NodeMissingSchema(TreeNodeSchemaIdentifier),
    #[error("leaf node value is missing or has the wrong kind")]
    LeafNodeInvalidValue,
    #[error("leaf node has fields")]
    LeafNodeFieldsNotAllowed,
    #[error("non-leaf node carries a value")]
    NonLeafNodeValueNotAllowed,
    #[error("object node has undeclared field {0}")]
    ObjectNodeFieldNotInSchema(FieldKey),
    #[error("field kind {0} is not known to the schema policy")]
    FieldKindNotInSchemaPolicy(FieldKindIdentifier),
    #[error("node type {0} is not allowed in this field")]
    FieldNodeTypeNotAllowed(TreeNodeSchemaIdentifier),
    #[error("child in a forbidden field")]
    FieldChildInForbiddenField,
    #[error("required field is empty")]
    FieldMissingRequiredChild,
    #[error("field holds more than one child")]
    FieldMultipleChildrenNotAllowed,
}

pub fn complies_with_multiplicity(
    count: usize,
    multiplicity: Multiplicity,
) -> Result<(), SchemaValidationError> {
    match (multiplicity, count) {
        (Multiplicity::Forbidden, 0) => Ok(()),
        (Multiplicity::Forbidden, _) => Err(SchemaValidationError::FieldChildInForbiddenField),
        (Multiplicity::Single, 0) => Err(SchemaValidationError::FieldMissingRequiredChild),
        (Multiplicity::Single, 1) => Ok(()),
        (Multiplicity::Single, _) => Err(SchemaValidationError::FieldMultipleChildrenNotAllowed),
        (Multiplicity::Optional, 0 | 1) => Ok(()),
        (Multiplicity::Optional, _) => Err(SchemaValidationError::FieldMultipleChildrenNotAllowed),
        (Multiplicity::Sequence, _) => Ok(()),
    }
}

pub fn is_node_in_schema<N: TreeNodeLike>(
    node: &N,
    schema: &SchemaAndPolicy<'_>,
) -> Result<(), SchemaValidationError> {
    let node_schema = schema
        .schema
        .node(node.node_type())
        .ok_or_else(|| SchemaValidationError::NodeMissingSchema(node.node_type().clone()))?;
    match node_schema {
        NodeSchema::Leaf { value } => {
            if node.value().is_none() {
                return Err(SchemaValidationError::LeafNodeInvalidValue);
            }
            if !node.field_keys().is_empty() {
                return Err(SchemaValidationError::LeafNodeFieldsNotAllowed);
            }
            if !allows_value(*value, node.value()) {
                return Err(SchemaValidationError::LeafNodeInvalidValue);
            }
            Ok(())
        }
        NodeSchema::Map { field } => {
            if node.value().is_some() {
                return Err(SchemaValidationError::NonLeafNodeValueNotAllowed);
            }
            for key in node.field_keys() {
                is_field_in_schema::<N>(node.field(key), field, schema)?;
            }
            Ok(())
        }
        NodeSchema::Object { fields } => {
            if node.value().is_some() {
                return Err(SchemaValidationError::NonLeafNodeValueNotAllowed);
            }
            if let Some(key) = node.field_keys().into_iter().find(|key| !fields.contains_key(*key)) {
                return Err(SchemaValidationError::ObjectNodeFieldNotInSchema(key.clone()));
            }
            for (key, field) in fields {
                is_field_in_schema::<N>(node.field(key), field, schema)?;
            }
            Ok(())
        }
    }
}

pub fn is_field_in_schema<N: TreeNodeLike>(
    children: &[N::Child],
    field: &FieldSchema,
    schema: &SchemaAndPolicy<'_>,
) -> Result<(), SchemaValidationError> {
    let multiplicity = schema
        .policy
        .multiplicity(&field.kind)
        .ok_or_else(|| SchemaValidationError::FieldKindNotInSchemaPolicy(field.kind.clone()))?;
    if let Some(child) = children
        .iter()
        .map(|child| -> &N { child.as_ref() })
        .find(|child| !field.allows_type(child.node_type()))
    {
        return Err(SchemaValidationError::FieldNodeTypeNotAllowed(
            child.node_type().clone(),
        ));
    }
    complies_with_multiplicity(children.len(), multiplicity)?;
    children
        .iter()
        .try_for_each(|child| is_node_in_schema(child.as_ref(), schema))
}
