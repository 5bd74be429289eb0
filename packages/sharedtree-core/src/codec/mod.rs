//! Chunked tree codec: shape-directed encoding of fields with deduplicated shape and
//! identifier tables.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::forest::{ChunkNode, TreeChunk};
use crate::schema::SchemaAndPolicy;

mod compressor;
mod decode;
mod encode;
mod format;
mod shape;

pub use compressor::{IdCompressor, MemoryIdCompressor};
pub use decode::{decode_field_batch, decode_shapes};
pub use encode::{count_referenced_shapes_and_identifiers, encode_field_batch, ReferenceCounts};
pub use format::{
    EncodedFieldBatch, EncodedNodeShape, EncodedShape, EncodedValueShape, IdentifierToken,
};
pub use shape::{NodeShape, Shape, ShapeId, ShapeTable, Shapes, ValueShape};

pub const FIELD_BATCH_FORMAT_VERSION: u32 = 1;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CodecError {
    #[error("unsupported field batch version {0}")]
    UnsupportedVersion(u32),
    #[error("shape index {0} is outside the shape table")]
    ShapeIndexOutOfRange(u64),
    #[error("identifier index {0} is outside the identifier table")]
    IdentifierIndexOutOfRange(u64),
    #[error("encoded data ended early")]
    Truncated,
    #[error("unexpected token: {0}")]
    UnexpectedToken(String),
    #[error("content does not fit its shape: {0}")]
    ShapeMismatch(String),
    #[error("compressed id {0} is unknown to the id compressor")]
    UnknownCompressedId(i64),
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TreeCompressionStrategy {
    /// Shapes derived from the stored schema.
    #[default]
    Compressed,
    /// One polymorphic shape for every node.
    Uncompressed,
}

/// Everything the encoder needs besides the content.
#[derive(Clone, Copy, Default)]
pub struct FieldBatchEncodingContext<'a> {
    pub strategy: TreeCompressionStrategy,
    pub schema: Option<SchemaAndPolicy<'a>>,
    pub compressor: Option<&'a dyn IdCompressor>,
}

/// Encodes forest chunks, one batch field per chunk.
///
/// Compressed encoding falls back to uniform shapes when the content does not fit the
/// shapes its schema implies.
pub fn encode_chunks(
    chunks: &[TreeChunk],
    context: &FieldBatchEncodingContext<'_>,
) -> Result<EncodedFieldBatch, CodecError> {
    let fields: Vec<&[_]> = chunks.iter().map(|chunk| chunk.roots.as_slice()).collect();
    let uniform = || encode_field_batch::<ChunkNode>(&fields, &Shapes::uniform(), context.compressor);
    match (context.strategy, context.schema) {
        (TreeCompressionStrategy::Compressed, Some(schema)) => {
            match encode_field_batch::<ChunkNode>(&fields, &Shapes::from_schema(schema), context.compressor) {
                Err(CodecError::ShapeMismatch(reason)) => {
                    debug!(%reason, "content is out of schema, encoding uncompressed");
                    uniform()
                }
                encoded => encoded,
            }
        }
        _ => uniform(),
    }
}

pub fn decode_chunks(
    batch: &EncodedFieldBatch,
    compressor: Option<&dyn IdCompressor>,
) -> Result<Vec<TreeChunk>, CodecError> {
    Ok(decode_field_batch(batch, compressor)?
        .into_iter()
        .map(TreeChunk::from_roots)
        .collect())
}
