use std::ops::Range;

use crate::error::Result;
use crate::forest::TreeChunk;
use crate::ids::FieldKey;

/// Callback surface driven by [`visit_delta`](super::visit_delta).
///
/// Calls are strictly nested: `enter_field`/`exit_field` and `enter_node`/`exit_node` pairs
/// bracket everything inside them. Detached fields are root fields, so `create`, `destroy`
/// and the sources/destinations of `attach`/`detach` name root-level field keys.
pub trait DeltaVisitor {
    /// New content placed in a fresh detached field.
    fn create(&mut self, content: &TreeChunk, destination: &FieldKey) -> Result<()>;
    fn destroy(&mut self, detached_field: &FieldKey, count: usize) -> Result<()>;
    /// Moves `count` nodes from detached field `source` into the current field at `destination`.
    fn attach(&mut self, source: &FieldKey, count: usize, destination: usize) -> Result<()>;
    /// Moves the nodes in `source` of the current field into detached field `destination`.
    fn detach(&mut self, source: Range<usize>, destination: &FieldKey) -> Result<()>;
    fn enter_node(&mut self, index: usize) -> Result<()>;
    fn exit_node(&mut self, index: usize) -> Result<()>;
    fn enter_field(&mut self, key: &FieldKey) -> Result<()>;
    fn exit_field(&mut self, key: &FieldKey) -> Result<()>;
}

/// Forwards every call to each visitor in turn, in the order they were given.
pub struct CombinedVisitor<'a> {
    visitors: Vec<&'a mut dyn DeltaVisitor>,
}

impl<'a> CombinedVisitor<'a> {
    pub fn new(visitors: Vec<&'a mut dyn DeltaVisitor>) -> Self {
        Self { visitors }
    }
}

impl DeltaVisitor for CombinedVisitor<'_> {
    fn create(&mut self, content: &TreeChunk, destination: &FieldKey) -> Result<()> {
        self.visitors
            .iter_mut()
            .try_for_each(|v| v.create(content, destination))
    }

    fn destroy(&mut self, detached_field: &FieldKey, count: usize) -> Result<()> {
        self.visitors
            .iter_mut()
            .try_for_each(|v| v.destroy(detached_field, count))
    }

    fn attach(&mut self, source: &FieldKey, count: usize, destination: usize) -> Result<()> {
        self.visitors
            .iter_mut()
            .try_for_each(|v| v.attach(source, count, destination))
    }

    fn detach(&mut self, source: Range<usize>, destination: &FieldKey) -> Result<()> {
        self.visitors
            .iter_mut()
            .try_for_each(|v| v.detach(source.clone(), destination))
    }

    fn enter_node(&mut self, index: usize) -> Result<()> {
        self.visitors.iter_mut().try_for_each(|v| v.enter_node(index))
    }

    fn exit_node(&mut self, index: usize) -> Result<()> {
        self.visitors.iter_mut().try_for_each(|v| v.exit_node(index))
    }

    fn enter_field(&mut self, key: &FieldKey) -> Result<()> {
        self.visitors.iter_mut().try_for_each(|v| v.enter_field(key))
    }

    fn exit_field(&mut self, key: &FieldKey) -> Result<()> {
        self.visitors.iter_mut().try_for_each(|v| v.exit_field(key))
    }
}
