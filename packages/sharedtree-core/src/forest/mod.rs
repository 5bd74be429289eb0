//! In-memory tree store: the document root field plus detached fields, held as shared
//! chunks and mutated only through deltas.

use std::fmt;
use std::ops::Range;
use std::sync::Arc;

use tracing::debug;

use crate::anchor::{Anchor, AnchorSet};
use crate::delta::{visit_delta, CombinedVisitor, DeltaVisitor, Root};
use crate::error::{Error, Result};
use crate::ids::FieldKey;
use crate::tree::{MapTree, StackCursor, TreeCursor, TreeNodeLike, UpPath};

mod chunk;
mod detached;

pub use chunk::{ChunkNode, TreeChunk};
pub use detached::DetachedFieldIndex;

/// Cursor over forest content.
pub type ForestCursor<'a> = StackCursor<'a, ChunkNode>;

/// Outcome of moving a cursor to an anchored node.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum NavigationResult {
    Ok,
    NotFound,
}

type RootFieldListener = Box<dyn FnMut(&FieldKey)>;
type ChangeListener = Box<dyn FnMut()>;

#[derive(Default)]
struct ForestEvents {
    after_root_field_created: Vec<RootFieldListener>,
    before_change: Vec<ChangeListener>,
    after_change: Vec<ChangeListener>,
}

pub struct Forest {
    root: Arc<ChunkNode>,
    anchors: AnchorSet,
    detached: DetachedFieldIndex,
    events: ForestEvents,
}

impl Default for Forest {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Forest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Forest")
            .field("root", &self.root)
            .field("detached", &self.detached)
            .finish_non_exhaustive()
    }
}

impl Forest {
    pub fn new() -> Self {
        Self {
            root: Arc::new(ChunkNode::placeholder()),
            anchors: AnchorSet::new(),
            detached: DetachedFieldIndex::new(),
            events: ForestEvents::default(),
        }
    }

    /// Cursor in nodes mode on the placeholder node above all root fields.
    pub fn allocate_cursor(&self) -> ForestCursor<'_> {
        StackCursor::at_node(&self.root)
    }

    /// Cursor in fields mode on the document root field.
    pub fn cursor_at_root(&self) -> ForestCursor<'_> {
        StackCursor::at_field(&self.root, FieldKey::root())
    }

    /// Copies the field under `cursor` into an owned chunk.
    pub fn chunk_field<C: TreeCursor + ?Sized>(&self, cursor: &mut C) -> Result<TreeChunk> {
        TreeChunk::from_cursor(cursor)
    }

    /// Moves `cursor` to the node `anchor` refers to.
    ///
    /// Returns [`NavigationResult::NotFound`] (with the cursor back on the placeholder) when
    /// that node has been destroyed. Fails only for anchors this forest never issued.
    pub fn try_move_cursor_to_node<'a>(
        &'a self,
        anchor: Anchor,
        cursor: &mut ForestCursor<'a>,
    ) -> Result<NavigationResult> {
        match self.anchors.locate_path(anchor)? {
            Some(path) => Ok(self.move_cursor_to_path(&path, cursor)),
            None => {
                *cursor = self.allocate_cursor();
                Ok(NavigationResult::NotFound)
            }
        }
    }

    pub fn move_cursor_to_path<'a>(
        &'a self,
        path: &UpPath,
        cursor: &mut ForestCursor<'a>,
    ) -> NavigationResult {
        *cursor = self.allocate_cursor();
        if cursor.descend(&path.steps) {
            NavigationResult::Ok
        } else {
            *cursor = self.allocate_cursor();
            NavigationResult::NotFound
        }
    }

    /// True when the document root field holds no content.
    pub fn is_empty(&self) -> bool {
        self.root.field(&FieldKey::root()).is_empty()
    }

    pub fn root_field(&self, key: &FieldKey) -> Vec<MapTree> {
        self.root
            .field(key)
            .iter()
            .map(|node| node.to_map_tree())
            .collect()
    }

    /// Content of the document root field.
    pub fn content(&self) -> Vec<MapTree> {
        self.root_field(&FieldKey::root())
    }

    pub fn root_chunk(&self) -> TreeChunk {
        TreeChunk::from_roots(self.root.field(&FieldKey::root()).to_vec())
    }

    pub fn root_field_keys(&self) -> Vec<FieldKey> {
        self.root.field_keys().into_iter().cloned().collect()
    }

    /// Copy sharing all content with `self`, with an empty anchor set and no listeners.
    pub fn fork(&self) -> Forest {
        Forest {
            root: Arc::clone(&self.root),
            anchors: AnchorSet::new(),
            detached: self.detached.clone(),
            events: ForestEvents::default(),
        }
    }

    pub fn anchors(&self) -> &AnchorSet {
        &self.anchors
    }

    pub fn anchors_mut(&mut self) -> &mut AnchorSet {
        &mut self.anchors
    }

    pub fn detached_field_index(&self) -> &DetachedFieldIndex {
        &self.detached
    }

    /// Registers a listener fired once for each detached root field a build creates.
    pub fn on_after_root_field_created(&mut self, listener: impl FnMut(&FieldKey) + 'static) {
        self.events
            .after_root_field_created
            .push(Box::new(listener));
    }

    pub fn on_before_change(&mut self, listener: impl FnMut() + 'static) {
        self.events.before_change.push(Box::new(listener));
    }

    pub fn on_after_change(&mut self, listener: impl FnMut() + 'static) {
        self.events.after_change.push(Box::new(listener));
    }

    /// Applies `delta` to the content and the anchor set in one traversal.
    ///
    /// An error leaves the forest partially updated; callers treat it as fatal.
    pub fn apply_delta(&mut self, delta: &Root) -> Result<()> {
        if delta.is_empty() {
            return Ok(());
        }
        for listener in &mut self.events.before_change {
            listener();
        }
        let Forest {
            root,
            anchors,
            detached,
            events,
        } = self;
        let mut editor = ForestVisitor {
            root,
            fields: Vec::new(),
            indices: Vec::new(),
            created: &mut events.after_root_field_created,
        };
        {
            let visitors: Vec<&mut dyn DeltaVisitor> = vec![&mut editor, anchors];
            let mut visitor = CombinedVisitor::new(visitors);
            visit_delta(delta, &mut visitor, detached)?;
        }
        debug!(detached = detached.len(), "applied delta to forest");
        for listener in &mut self.events.after_change {
            listener();
        }
        Ok(())
    }
}

/// Mutates forest content, copying shared nodes along the path it writes through.
struct ForestVisitor<'f> {
    root: &'f mut Arc<ChunkNode>,
    fields: Vec<FieldKey>,
    indices: Vec<usize>,
    created: &'f mut Vec<RootFieldListener>,
}

impl ForestVisitor<'_> {
    fn current_key(&self) -> Result<FieldKey> {
        match self.fields.last() {
            Some(key) if self.fields.len() == self.indices.len() + 1 => Ok(key.clone()),
            _ => Err(Error::InconsistentState(
                "forest visitor is not in a field".into(),
            )),
        }
    }

    fn parent_node_mut(&mut self) -> Result<&mut ChunkNode> {
        let mut node = Arc::make_mut(&mut *self.root);
        for (key, &index) in self.fields.iter().zip(&self.indices) {
            let child = node
                .fields
                .get_mut(key)
                .and_then(|children| children.get_mut(index))
                .ok_or_else(|| {
                    Error::InconsistentState(format!("no node at {key}[{index}]"))
                })?;
            node = Arc::make_mut(child);
        }
        Ok(node)
    }

    fn with_field<R>(
        node: &mut ChunkNode,
        key: FieldKey,
        edit: impl FnOnce(&mut Vec<Arc<ChunkNode>>) -> Result<R>,
    ) -> Result<R> {
        let field = node.fields.entry(key.clone()).or_default();
        let out = edit(field);
        if field.is_empty() {
            node.fields.remove(&key);
        }
        out
    }

    fn with_current_field<R>(
        &mut self,
        edit: impl FnOnce(&mut Vec<Arc<ChunkNode>>) -> Result<R>,
    ) -> Result<R> {
        let key = self.current_key()?;
        let node = self.parent_node_mut()?;
        Self::with_field(node, key, edit)
    }

    fn with_root_field<R>(
        &mut self,
        key: &FieldKey,
        edit: impl FnOnce(&mut Vec<Arc<ChunkNode>>) -> Result<R>,
    ) -> Result<R> {
        Self::with_field(Arc::make_mut(&mut *self.root), key.clone(), edit)
    }
}

fn take_range(field: &mut Vec<Arc<ChunkNode>>, range: Range<usize>) -> Result<Vec<Arc<ChunkNode>>> {
    if range.end > field.len() {
        return Err(Error::InconsistentState(format!(
            "range {range:?} out of bounds for field of length {}",
            field.len()
        )));
    }
    Ok(field.drain(range).collect())
}

fn fill_empty(field: &mut Vec<Arc<ChunkNode>>, nodes: Vec<Arc<ChunkNode>>) -> Result<()> {
    if !field.is_empty() {
        return Err(Error::InconsistentState(
            "detached field is already occupied".into(),
        ));
    }
    field.extend(nodes);
    Ok(())
}

impl DeltaVisitor for ForestVisitor<'_> {
    fn create(&mut self, content: &TreeChunk, destination: &FieldKey) -> Result<()> {
        let nodes = content.roots.clone();
        self.with_root_field(destination, |field| fill_empty(field, nodes))?;
        for listener in self.created.iter_mut() {
            listener(destination);
        }
        Ok(())
    }

    fn destroy(&mut self, detached_field: &FieldKey, count: usize) -> Result<()> {
        self.with_root_field(detached_field, |field| take_range(field, 0..count))?;
        Ok(())
    }

    fn attach(&mut self, source: &FieldKey, count: usize, destination: usize) -> Result<()> {
        let nodes = self.with_root_field(source, |field| take_range(field, 0..count))?;
        self.with_current_field(|field| {
            if destination > field.len() {
                return Err(Error::InconsistentState(format!(
                    "attach at {destination} beyond field of length {}",
                    field.len()
                )));
            }
            field.splice(destination..destination, nodes);
            Ok(())
        })
    }

    fn detach(&mut self, source: Range<usize>, destination: &FieldKey) -> Result<()> {
        let nodes = self.with_current_field(|field| take_range(field, source))?;
        self.with_root_field(destination, |field| fill_empty(field, nodes))
    }

    fn enter_node(&mut self, index: usize) -> Result<()> {
        self.current_key()?;
        self.indices.push(index);
        Ok(())
    }

    fn exit_node(&mut self, _index: usize) -> Result<()> {
        self.indices.pop();
        Ok(())
    }

    fn enter_field(&mut self, key: &FieldKey) -> Result<()> {
        self.fields.push(key.clone());
        Ok(())
    }

    fn exit_field(&mut self, _key: &FieldKey) -> Result<()> {
        self.fields.pop();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;
    use crate::delta::{DetachedNodeBuild, FieldChanges, Mark};
    use crate::ids::ChangeAtomId;
    use crate::tree::PathStep;

    fn leaf(n: f64) -> MapTree {
        MapTree::leaf("number", n)
    }

    fn insert_root(forest: &mut Forest, id: u32, trees: &[MapTree]) {
        let atom = ChangeAtomId::new(None, id);
        let mut delta = Root::default();
        delta.build.push(DetachedNodeBuild {
            id: atom,
            trees: TreeChunk::from_map_trees(trees),
        });
        delta.fields.insert(
            FieldKey::root(),
            FieldChanges {
                local: vec![Mark::attach(atom, trees.len() as u32)],
                ..Default::default()
            },
        );
        forest.apply_delta(&delta).unwrap();
    }

    #[test]
    fn builds_then_attaches() {
        let mut forest = Forest::new();
        assert!(forest.is_empty());
        insert_root(&mut forest, 0, &[leaf(1.0), leaf(2.0)]);
        assert_eq!(forest.content(), vec![leaf(1.0), leaf(2.0)]);
        assert!(forest.detached_field_index().is_empty());
        assert_eq!(forest.root_field_keys(), vec![FieldKey::root()]);
    }

    #[test]
    fn fork_is_copy_on_write() {
        let mut forest = Forest::new();
        insert_root(&mut forest, 0, &[leaf(1.0)]);
        let fork = forest.fork();
        let mut delta = Root::default();
        delta.fields.insert(
            FieldKey::root(),
            FieldChanges {
                local: vec![Mark::detach(ChangeAtomId::new(None, 9), 1)],
                ..Default::default()
            },
        );
        forest.apply_delta(&delta).unwrap();
        assert!(forest.is_empty());
        assert_eq!(fork.content(), vec![leaf(1.0)]);
    }

    #[test]
    fn root_field_events_fire_per_build() {
        let mut forest = Forest::new();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        forest.on_after_root_field_created(move |key| sink.borrow_mut().push(key.clone()));
        insert_root(&mut forest, 0, &[leaf(1.0), leaf(2.0), leaf(3.0)]);
        assert_eq!(
            *seen.borrow(),
            vec![
                FieldKey::new("repair-0"),
                FieldKey::new("repair-1"),
                FieldKey::new("repair-2")
            ]
        );
    }

    #[test]
    fn anchored_navigation() {
        let mut forest = Forest::new();
        insert_root(&mut forest, 0, &[leaf(1.0), leaf(2.0)]);
        let anchor = forest
            .anchors_mut()
            .track(&UpPath::root(FieldKey::root(), 1));
        let mut cursor = forest.allocate_cursor();
        assert_eq!(
            forest.try_move_cursor_to_node(anchor, &mut cursor).unwrap(),
            NavigationResult::Ok
        );
        assert_eq!(cursor.value(), Some(&crate::tree::Value::Number(2.0)));
        assert_eq!(
            cursor.get_path().steps,
            vec![PathStep {
                parent_field: FieldKey::root(),
                parent_index: 1
            }]
        );
    }
}
