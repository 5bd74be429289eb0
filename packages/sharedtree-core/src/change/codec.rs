//! JSON wire form of modular changesets.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::change::{
    FieldChange, FieldChangeMap, FieldKindRegistry, ModularChangeset, NodeChangeset,
};
use crate::codec::{
    decode_chunks, encode_chunks, EncodedFieldBatch, FieldBatchEncodingContext, IdCompressor,
};
use crate::error::{Error, Result};
use crate::ids::{ChangeAtomId, FieldKey, FieldKindIdentifier, NodeId};

pub const CHANGESET_FORMAT_VERSION: u32 = 1;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct EncodedModularChangeset {
    pub version: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<EncodedFieldChange>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nodes: Vec<EncodedNodeChange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub builds: Option<EncodedBuilds>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_id: Option<u32>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EncodedFieldChange {
    pub field: FieldKey,
    pub kind: FieldKindIdentifier,
    pub change: Json,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EncodedNodeChange {
    pub id: NodeId,
    pub fields: Vec<EncodedFieldChange>,
}

/// Built content: one batch field per entry of `ids`, in the same order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EncodedBuilds {
    pub ids: Vec<ChangeAtomId>,
    pub trees: EncodedFieldBatch,
}

pub fn encode_changeset(
    change: &ModularChangeset,
    registry: &FieldKindRegistry,
    trees: &FieldBatchEncodingContext<'_>,
) -> Result<EncodedModularChangeset> {
    let builds = if change.builds.is_empty() {
        None
    } else {
        let chunks: Vec<_> = change.builds.values().cloned().collect();
        Some(EncodedBuilds {
            ids: change.builds.keys().copied().collect(),
            trees: encode_chunks(&chunks, trees)?,
        })
    };
    Ok(EncodedModularChangeset {
        version: CHANGESET_FORMAT_VERSION,
        fields: encode_fields(&change.field_changes, registry)?,
        nodes: change
            .node_changes
            .iter()
            .map(|(id, node)| {
                Ok(EncodedNodeChange {
                    id: *id,
                    fields: encode_fields(&node.field_changes, registry)?,
                })
            })
            .collect::<Result<_>>()?,
        builds,
        max_id: change.max_id,
    })
}

/// Unknown versions and field kinds are fatal: guessing would risk divergence.
pub fn decode_changeset(
    encoded: &EncodedModularChangeset,
    registry: &FieldKindRegistry,
    compressor: Option<&dyn IdCompressor>,
) -> Result<ModularChangeset> {
    if encoded.version != CHANGESET_FORMAT_VERSION {
        return Err(Error::UnsupportedVersion {
            format: "changeset",
            version: encoded.version,
        });
    }
    let mut node_changes = BTreeMap::new();
    for node in &encoded.nodes {
        let fields = decode_fields(&node.fields, registry)?;
        if node_changes
            .insert(node.id, NodeChangeset { field_changes: fields })
            .is_some()
        {
            return Err(Error::malformed(format!("node change {:?} encoded twice", node.id)));
        }
    }
    let mut builds = BTreeMap::new();
    if let Some(encoded) = &encoded.builds {
        let chunks = decode_chunks(&encoded.trees, compressor)?;
        if chunks.len() != encoded.ids.len() {
            return Err(Error::malformed(format!(
                "{} build ids for {} built fields",
                encoded.ids.len(),
                chunks.len()
            )));
        }
        builds.extend(encoded.ids.iter().copied().zip(chunks));
    }
    Ok(ModularChangeset {
        field_changes: decode_fields(&encoded.fields, registry)?,
        node_changes,
        builds,
        max_id: encoded.max_id,
    })
}

fn encode_fields(
    fields: &FieldChangeMap,
    registry: &FieldKindRegistry,
) -> Result<Vec<EncodedFieldChange>> {
    fields
        .iter()
        .map(|(key, field)| {
            let kind = registry.lookup(&field.kind)?;
            Ok(EncodedFieldChange {
                field: key.clone(),
                kind: field.kind.clone(),
                change: kind.handler.encode_json(&field.change)?,
            })
        })
        .collect()
}

fn decode_fields(
    encoded: &[EncodedFieldChange],
    registry: &FieldKindRegistry,
) -> Result<FieldChangeMap> {
    let mut fields = FieldChangeMap::new();
    for field in encoded {
        let kind = registry.lookup(&field.kind)?;
        let change = FieldChange {
            kind: field.kind.clone(),
            change: kind.handler.decode_json(&field.change)?,
        };
        if fields.insert(field.field.clone(), change).is_some() {
            return Err(Error::malformed(format!("field {} encoded twice", field.field)));
        }
    }
    Ok(fields)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::change::{ChangeFamily, ModularEditBuilder, SequenceKinds};
    use crate::forest::TreeChunk;
    use crate::tree::{FieldUpPath, MapTree, UpPath};

    fn sample() -> ModularChangeset {
        let family = ChangeFamily::default();
        let mut builder = ModularEditBuilder::new(&family, &SequenceKinds);
        builder
            .sequence_field(FieldUpPath::root())
            .insert(0, TreeChunk::from_map_trees(&[MapTree::leaf("n", 1.0)]))
            .unwrap();
        let nested = FieldUpPath::new(Some(UpPath::root(FieldKey::root(), 3)), FieldKey::new("xs"));
        builder.sequence_field(nested).remove(0, 2).unwrap();
        builder.finish().unwrap()
    }

    #[test]
    fn roundtrips_through_json_text() {
        let registry = FieldKindRegistry::default();
        let change = sample();
        let encoded = encode_changeset(&change, &registry, &FieldBatchEncodingContext::default())
            .unwrap();
        let text = serde_json::to_string(&encoded).unwrap();
        let decoded: EncodedModularChangeset = serde_json::from_str(&text).unwrap();
        assert_eq!(decode_changeset(&decoded, &registry, None).unwrap(), change);
    }

    #[test]
    fn unknown_kind_is_fatal() {
        let registry = FieldKindRegistry::default();
        let encoded: EncodedModularChangeset = serde_json::from_value(json!({
            "version": 1,
            "fields": [{"field": "rootFieldKey", "kind": "Counter", "change": 3}],
        }))
        .unwrap();
        let err = decode_changeset(&encoded, &registry, None).unwrap_err();
        assert_eq!(err.code(), "ST0001");
    }

    #[test]
    fn unknown_version_is_fatal() {
        let registry = FieldKindRegistry::default();
        let encoded: EncodedModularChangeset =
            serde_json::from_value(json!({"version": 4})).unwrap();
        assert!(matches!(
            decode_changeset(&encoded, &registry, None),
            Err(Error::UnsupportedVersion { format: "changeset", version: 4 })
        ));
    }
}
