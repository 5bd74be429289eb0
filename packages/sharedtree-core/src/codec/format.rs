use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::tree::Value;

/// An identifier written either as an index into the batch's identifier table or inline.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IdentifierToken {
    Index(u32),
    Inline(String),
}

impl From<IdentifierToken> for Json {
    fn from(token: IdentifierToken) -> Self {
        match token {
            IdentifierToken::Index(i) => Json::from(i),
            IdentifierToken::Inline(s) => Json::String(s),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EncodedValueShape {
    Required,
    Optional,
    Constant(Value),
    Identifier,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct EncodedNodeShape {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub node_type: Option<IdentifierToken>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<EncodedValueShape>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<(IdentifierToken, u32)>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra_fields: Option<u32>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EncodedShape {
    Node(EncodedNodeShape),
    NestedArray(u32),
    InlineArray { length: u32, shape: u32 },
    Any,
}

/// Wire form of a batch of fields.
///
/// Each entry of `data` encodes one field: the index of its shape followed by that
/// shape's tokens.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EncodedFieldBatch {
    pub version: u32,
    pub identifiers: Vec<String>,
    pub shapes: Vec<EncodedShape>,
    pub data: Vec<Vec<Json>>,
}
