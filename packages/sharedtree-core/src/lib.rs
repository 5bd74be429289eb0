#![forbid(unsafe_code)]
//! Merge and storage core for a collaboratively edited tree.
//!
//! Content lives in a [`forest::Forest`] and changes only through [`delta::Root`] deltas.
//! Edits are [`change::ModularChangeset`]s that the [`change::ChangeFamily`] composes,
//! inverts and rebases field by field. The [`rebaser::EditManager`] keeps local edits on
//! top of the sequenced trunk so that every replica converges. Content is persisted with
//! the shape-directed codec in [`codec`] and checked against the stored [`schema`].

pub mod anchor;
pub mod change;
pub mod checkout;
pub mod codec;
pub mod config;
pub mod delta;
pub mod error;
pub mod forest;
pub mod ids;
pub mod rebaser;
pub mod schema;
pub mod tree;

pub use anchor::{Anchor, AnchorSet};
pub use change::{
    ChangeFamily, FieldKind, FieldKindRegistry, ModularChangeset, ModularEditBuilder,
    Multiplicity, RevisionMetadata, TaggedChange,
};
pub use checkout::{Checkout, EncodedContent};
pub use codec::{
    CodecError, EncodedFieldBatch, IdCompressor, MemoryIdCompressor, TreeCompressionStrategy,
};
pub use config::{CoreConfig, SchemaValidationMode};
pub use delta::{visit_delta, DeltaVisitor, Root};
pub use error::{Error, Result};
pub use forest::{Forest, NavigationResult, TreeChunk};
pub use ids::{
    ChangeAtomId, DetachedNodeId, FieldKey, FieldKindIdentifier, NodeId, RevisionTag, SessionId,
    TreeNodeSchemaIdentifier,
};
pub use rebaser::{Commit, EditManager};
pub use schema::{
    AllowIncompatible, FieldSchema, NodeSchema, SchemaPolicy, SchemaValidationError,
    StoredSchema, StoredSchemaRepository,
};
pub use tree::{FieldUpPath, MapTree, TreeCursor, TreeNodeLike, UpPath, Value, ValueSchema};
