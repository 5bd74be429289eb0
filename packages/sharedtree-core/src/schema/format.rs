//! Persisted schema formats. V1 lists node schemas; V2 keys them by name.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::error::{Error, Result};
use crate::ids::{FieldKey, TreeNodeSchemaIdentifier};
use crate::schema::{FieldSchema, NodeSchema, StoredSchema};
use crate::tree::ValueSchema;

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub enum SchemaFormatVersion {
    V1,
    #[default]
    V2,
}

impl From<SchemaFormatVersion> for u32 {
    fn from(version: SchemaFormatVersion) -> Self {
        match version {
            SchemaFormatVersion::V1 => 1,
            SchemaFormatVersion::V2 => 2,
        }
    }
}

impl TryFrom<u32> for SchemaFormatVersion {
    type Error = Error;

    fn try_from(version: u32) -> Result<Self> {
        match version {
            1 => Ok(Self::V1),
            2 => Ok(Self::V2),
            version => Err(Error::UnsupportedVersion {
                format: "schema",
                version,
            }),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct SchemaV1 {
    version: u32,
    root: FieldSchema,
    nodes: Vec<NamedNodeV1>,
}

#[derive(Debug, Serialize, Deserialize)]
struct NamedNodeV1 {
    name: TreeNodeSchemaIdentifier,
    #[serde(flatten)]
    node: NodeV1,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
enum NodeV1 {
    Leaf(ValueSchema),
    Map(FieldSchema),
    Object(Vec<NamedFieldV1>),
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct NamedFieldV1 {
    key: FieldKey,
    field: FieldSchema,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct SchemaV2 {
    version: u32,
    root: FieldSchema,
    nodes: BTreeMap<TreeNodeSchemaIdentifier, NodeV2>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase", deny_unknown_fields)]
enum NodeV2 {
    Leaf {
        #[serde(rename = "leafValue")]
        value: ValueSchema,
    },
    Map {
        field: FieldSchema,
    },
    Object {
        fields: BTreeMap<FieldKey, FieldSchema>,
    },
}

pub fn encode_schema(schema: &StoredSchema, version: SchemaFormatVersion) -> Result<Json> {
    let encoded = match version {
        SchemaFormatVersion::V1 => serde_json::to_value(SchemaV1 {
            version: version.into(),
            root: schema.root.clone(),
            nodes: schema
                .nodes
                .iter()
                .map(|(name, node)| NamedNodeV1 {
                    name: name.clone(),
                    node: match node {
                        NodeSchema::Leaf { value } => NodeV1::Leaf(*value),
                        NodeSchema::Map { field } => NodeV1::Map(field.clone()),
                        NodeSchema::Object { fields } => NodeV1::Object(
                            fields
                                .iter()
                                .map(|(key, field)| NamedFieldV1 {
                                    key: key.clone(),
                                    field: field.clone(),
                                })
                                .collect(),
                        ),
                    },
                })
                .collect(),
        })?,
        SchemaFormatVersion::V2 => serde_json::to_value(SchemaV2 {
            version: version.into(),
            root: schema.root.clone(),
            nodes: schema
                .nodes
                .iter()
                .map(|(name, node)| {
                    let node = match node {
                        NodeSchema::Leaf { value } => NodeV2::Leaf { value: *value },
                        NodeSchema::Map { field } => NodeV2::Map {
                            field: field.clone(),
                        },
                        NodeSchema::Object { fields } => NodeV2::Object {
                            fields: fields.clone(),
                        },
                    };
                    (name.clone(), node)
                })
                .collect(),
        })?,
    };
    Ok(encoded)
}

/// Decodes either format, dispatching on the `version` tag.
pub fn decode_schema(encoded: &Json) -> Result<StoredSchema> {
    let version = encoded
        .get("version")
        .and_then(Json::as_u64)
        .ok_or_else(|| Error::malformed("schema is missing its version tag"))?;
    match SchemaFormatVersion::try_from(u32::try_from(version).unwrap_or(u32::MAX))? {
        SchemaFormatVersion::V1 => {
            let schema: SchemaV1 = serde_json::from_value(encoded.clone())?;
            let mut nodes = BTreeMap::new();
            for NamedNodeV1 { name, node } in schema.nodes {
                let node = match node {
                    NodeV1::Leaf(value) => NodeSchema::Leaf { value },
                    NodeV1::Map(field) => NodeSchema::Map { field },
                    NodeV1::Object(fields) => NodeSchema::Object {
                        fields: fields.into_iter().map(|f| (f.key, f.field)).collect(),
                    },
                };
                if nodes.insert(name.clone(), node).is_some() {
                    return Err(Error::malformed(format!("node schema {name} listed twice")));
                }
            }
            Ok(StoredSchema {
                root: schema.root,
                nodes,
            })
        }
        SchemaFormatVersion::V2 => {
            let schema: SchemaV2 = serde_json::from_value(encoded.clone())?;
            Ok(StoredSchema {
                root: schema.root,
                nodes: schema
                    .nodes
                    .into_iter()
                    .map(|(name, node)| {
                        let node = match node {
                            NodeV2::Leaf { value } => NodeSchema::Leaf { value },
                            NodeV2::Map { field } => NodeSchema::Map { field },
                            NodeV2::Object { fields } => NodeSchema::Object { fields },
                        };
                        (name, node)
                    })
                    .collect(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::field_kind::{OPTIONAL, SEQUENCE};
    use serde_json::json;

    fn schema() -> StoredSchema {
        StoredSchema::new(FieldSchema::new(&OPTIONAL, ["folder"]))
            .with_node("name", NodeSchema::Leaf { value: ValueSchema::String })
            .with_node(
                "folder",
                NodeSchema::Object {
                    fields: [
                        ("name".into(), FieldSchema::new(&OPTIONAL, ["name"])),
                        ("children".into(), FieldSchema::new(&SEQUENCE, ["folder"])),
                    ]
                    .into_iter()
                    .collect(),
                },
            )
    }

    #[test]
    fn v2_keys_nodes_by_name() {
        let encoded = encode_schema(&schema(), SchemaFormatVersion::V2).unwrap();
        assert_eq!(encoded["version"], json!(2));
        assert_eq!(encoded["nodes"]["name"], json!({"kind": "leaf", "leafValue": "String"}));
    }

    #[test]
    fn v1_lists_nodes() {
        let encoded = encode_schema(&schema(), SchemaFormatVersion::V1).unwrap();
        assert_eq!(encoded["version"], json!(1));
        assert_eq!(encoded["nodes"][1], json!({"name": "name", "leaf": "String"}));
    }

    #[test]
    fn unknown_version_is_rejected() {
        let err = decode_schema(&json!({"version": 9, "root": {}, "nodes": []})).unwrap_err();
        assert!(matches!(err, Error::UnsupportedVersion { format: "schema", version: 9 }));
    }
}
