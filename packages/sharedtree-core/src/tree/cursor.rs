use crate::ids::{FieldKey, TreeNodeSchemaIdentifier};
use crate::tree::path::{PathStep, UpPath};
use crate::tree::value::Value;

/// Whether a cursor is positioned on a node or on a field.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CursorLocationType {
    Nodes,
    Fields,
}

/// Read cursor over tree content.
///
/// Methods are only valid in one mode: fields-mode methods (`get_field_key`, `first_node`,
/// `enter_node`, `next_field`, `exit_field`) and nodes-mode methods (`first_field`,
/// `enter_field`, `next_node`, `seek_nodes`, `exit_node`, `field_index`, `node_type`, `value`).
///
/// # Panics
///
/// Implementations panic when a method is called in the wrong mode, or when exiting past the
/// position the cursor was created at. Both indicate a caller bug.
pub trait TreeCursor {
    fn mode(&self) -> CursorLocationType;

    /// Content behind the cursor is still being populated and cannot be read synchronously.
    fn pending(&self) -> bool {
        false
    }

    fn get_field_key(&self) -> &FieldKey;
    fn get_field_length(&self) -> usize;
    /// Enters the first node of the current field. Returns false (and stays put) if empty.
    fn first_node(&mut self) -> bool;
    fn enter_node(&mut self, index: usize);
    /// Moves to the next non-empty field of the parent. Returns false after the last one,
    /// leaving the cursor on the parent node.
    fn next_field(&mut self) -> bool;
    fn exit_field(&mut self);

    /// Enters the first non-empty field. Returns false (and stays put) if there is none.
    fn first_field(&mut self) -> bool;
    fn enter_field(&mut self, key: &FieldKey);
    /// Moves to the next sibling. Returns false after the last one, leaving the cursor on
    /// the parent field.
    fn next_node(&mut self) -> bool;
    /// Moves `offset` siblings away. Returns false when out of range, leaving the cursor on
    /// the parent field.
    fn seek_nodes(&mut self, offset: isize) -> bool;
    fn exit_node(&mut self);
    fn field_index(&self) -> usize;
    fn node_type(&self) -> &TreeNodeSchemaIdentifier;
    fn value(&self) -> Option<&Value>;

    /// Path of the current node, relative to where the cursor was created.
    fn get_path(&self) -> UpPath;
}

/// Node storage a [`StackCursor`] can walk.
pub trait TreeNodeLike {
    type Child: AsRef<Self>;

    fn node_type(&self) -> &TreeNodeSchemaIdentifier;
    fn value(&self) -> Option<&Value>;
    fn field(&self, key: &FieldKey) -> &[Self::Child];
    /// Keys of the non-empty fields, in a stable order.
    fn field_keys(&self) -> Vec<&FieldKey>;
}

struct FieldFrame<'a, N: TreeNodeLike> {
    key: FieldKey,
    siblings: &'a [N::Child],
    index: usize,
    /// Set when the field was reached through `first_field`, so `next_field` can continue.
    keys: Option<(Vec<&'a FieldKey>, usize)>,
}

impl<'a, N: TreeNodeLike> Clone for FieldFrame<'a, N> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            siblings: self.siblings,
            index: self.index,
            keys: self.keys.clone(),
        }
    }
}

enum Frame<'a, N: TreeNodeLike> {
    Node(&'a N),
    Field(FieldFrame<'a, N>),
}

impl<'a, N: TreeNodeLike> Clone for Frame<'a, N> {
    fn clone(&self) -> Self {
        match self {
            Frame::Node(node) => Frame::Node(*node),
            Frame::Field(field) => Frame::Field(field.clone()),
        }
    }
}

/// Cursor over any [`TreeNodeLike`] storage, kept as an explicit stack of frames.
///
/// Cloning takes a snapshot of the position; assigning a snapshot back restores it.
pub struct StackCursor<'a, N: TreeNodeLike> {
    stack: Vec<Frame<'a, N>>,
}

impl<'a, N: TreeNodeLike> Clone for StackCursor<'a, N> {
    fn clone(&self) -> Self {
        Self {
            stack: self.stack.clone(),
        }
    }
}

impl<'a, N: TreeNodeLike> StackCursor<'a, N> {
    /// Cursor in nodes mode on `root`.
    pub fn at_node(root: &'a N) -> Self {
        Self {
            stack: vec![Frame::Node(root)],
        }
    }

    /// Cursor in fields mode on field `key` of `parent`.
    pub fn at_field(parent: &'a N, key: FieldKey) -> Self {
        let siblings = parent.field(&key);
        Self {
            stack: vec![
                Frame::Node(parent),
                Frame::Field(FieldFrame {
                    key,
                    siblings,
                    index: 0,
                    keys: None,
                }),
            ],
        }
    }

    /// Cursor in fields mode over `siblings`, which have no parent node.
    pub fn at_detached_field(key: FieldKey, siblings: &'a [N::Child]) -> Self {
        Self {
            stack: vec![Frame::Field(FieldFrame {
                key,
                siblings,
                index: 0,
                keys: None,
            })],
        }
    }

    /// Moves back to the bottom of the stack (where the cursor was created).
    pub fn reset(&mut self) {
        self.stack.truncate(1);
        if let Some(Frame::Field(field)) = self.stack.first_mut() {
            field.index = 0;
            field.keys = None;
        }
    }

    /// Descends along `steps` from the current node. Returns false (leaving the cursor at the
    /// deepest reachable node) if a step is out of range.
    pub fn descend(&mut self, steps: &[PathStep]) -> bool {
        for step in steps {
            self.enter_field(&step.parent_field);
            if step.parent_index >= self.get_field_length() {
                self.exit_field();
                return false;
            }
            self.enter_node(step.parent_index);
        }
        true
    }

    /// Node the cursor is on, with the storage's lifetime.
    pub fn current_node(&self) -> &'a N {
        self.node()
    }

    fn node(&self) -> &'a N {
        match self.stack.last() {
            Some(Frame::Node(node)) => *node,
            _ => panic!("cursor must be in nodes mode"),
        }
    }

    fn field(&self) -> &FieldFrame<'a, N> {
        match self.stack.last() {
            Some(Frame::Field(field)) => field,
            _ => panic!("cursor must be in fields mode"),
        }
    }

    fn field_mut(&mut self) -> &mut FieldFrame<'a, N> {
        match self.stack.last_mut() {
            Some(Frame::Field(field)) => field,
            _ => panic!("cursor must be in fields mode"),
        }
    }

    fn parent_field(&self) -> Option<&FieldFrame<'a, N>> {
        let len = self.stack.len();
        if len < 2 {
            return None;
        }
        match &self.stack[len - 2] {
            Frame::Field(field) => Some(field),
            Frame::Node(_) => None,
        }
    }

    fn parent_field_mut(&mut self) -> &mut FieldFrame<'a, N> {
        let len = self.stack.len();
        assert!(len >= 2, "cursor is at its root node");
        match &mut self.stack[len - 2] {
            Frame::Field(field) => field,
            Frame::Node(_) => panic!("cursor stack is corrupt"),
        }
    }

    fn open_field(&mut self, key: FieldKey, keys: Option<(Vec<&'a FieldKey>, usize)>) {
        let siblings = self.node().field(&key);
        self.stack.push(Frame::Field(FieldFrame {
            key,
            siblings,
            index: 0,
            keys,
        }));
    }
}

impl<'a, N: TreeNodeLike> TreeCursor for StackCursor<'a, N> {
    fn mode(&self) -> CursorLocationType {
        match self.stack.last() {
            Some(Frame::Field(_)) => CursorLocationType::Fields,
            _ => CursorLocationType::Nodes,
        }
    }

    fn get_field_key(&self) -> &FieldKey {
        &self.field().key
    }

    fn get_field_length(&self) -> usize {
        self.field().siblings.len()
    }

    fn first_node(&mut self) -> bool {
        if self.get_field_length() == 0 {
            return false;
        }
        self.enter_node(0);
        true
    }

    fn enter_node(&mut self, index: usize) {
        let field = self.field_mut();
        assert!(
            index < field.siblings.len(),
            "index {index} out of range for field of length {}",
            field.siblings.len()
        );
        field.index = index;
        let siblings = field.siblings;
        let node = siblings[index].as_ref();
        self.stack.push(Frame::Node(node));
    }

    fn next_field(&mut self) -> bool {
        let field = self.field_mut();
        let Some((keys, position)) = field.keys.as_mut() else {
            self.stack.pop();
            return false;
        };
        *position += 1;
        if *position >= keys.len() {
            self.stack.pop();
            return false;
        }
        let key = keys[*position].clone();
        let keys = field.keys.take();
        self.stack.pop();
        self.open_field(key, keys);
        true
    }

    fn exit_field(&mut self) {
        self.field();
        assert!(self.stack.len() >= 2, "cannot exit a parentless field");
        self.stack.pop();
    }

    fn first_field(&mut self) -> bool {
        let keys = self.node().field_keys();
        let Some(first) = keys.first().map(|key| (*key).clone()) else {
            return false;
        };
        self.open_field(first, Some((keys, 0)));
        true
    }

    fn enter_field(&mut self, key: &FieldKey) {
        self.node();
        self.open_field(key.clone(), None);
    }

    fn next_node(&mut self) -> bool {
        self.seek_nodes(1)
    }

    fn seek_nodes(&mut self, offset: isize) -> bool {
        self.node();
        let parent = self.parent_field_mut();
        let target = parent.index as isize + offset;
        if target < 0 || target as usize >= parent.siblings.len() {
            self.stack.pop();
            return false;
        }
        parent.index = target as usize;
        let siblings = parent.siblings;
        let node = siblings[target as usize].as_ref();
        if let Some(top) = self.stack.last_mut() {
            *top = Frame::Node(node);
        }
        true
    }

    fn exit_node(&mut self) {
        self.node();
        assert!(
            self.parent_field().is_some(),
            "cannot exit the node a cursor was created at"
        );
        self.stack.pop();
    }

    fn field_index(&self) -> usize {
        self.node();
        self.parent_field().map(|field| field.index).unwrap_or(0)
    }

    fn node_type(&self) -> &TreeNodeSchemaIdentifier {
        self.node().node_type()
    }

    fn value(&self) -> Option<&Value> {
        self.node().value()
    }

    fn get_path(&self) -> UpPath {
        self.node();
        let steps = self
            .stack
            .windows(2)
            .filter_map(|pair| match pair {
                [Frame::Field(field), Frame::Node(_)] => Some(PathStep {
                    parent_field: field.key.clone(),
                    parent_index: field.index,
                }),
                _ => None,
            })
            .collect();
        UpPath::new(steps)
    }
}
