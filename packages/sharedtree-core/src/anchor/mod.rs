//! Stable references to tree locations, kept in step with every forest mutation.
//!
//! Anchor nodes live in an arena and are addressed by index and generation. A node exists
//! while it is referenced by an anchor or has live descendants. Reclaiming a node bumps its
//! generation, so stale anchors are reported instead of resolving to a reused slot.

use std::collections::BTreeMap;
use std::ops::Range;

use tracing::trace;

use crate::delta::DeltaVisitor;
use crate::error::{Error, Result};
use crate::forest::TreeChunk;
use crate::ids::FieldKey;
use crate::tree::{PathStep, UpPath};

mod slots;

pub use slots::{anchor_slot, AnchorSlot, AnchorSlots};

const ROOT: u32 = 0;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct Anchor {
    index: u32,
    generation: u32,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AnchorStatus {
    Attached,
    /// The node was destroyed. Its anchor node stays around, without a path, until forgotten.
    Destroyed,
}

type DestroyListener = Box<dyn FnMut(Anchor, &mut AnchorSlots)>;

struct PathNode {
    parent: Option<u32>,
    parent_field: FieldKey,
    parent_index: usize,
    children: BTreeMap<FieldKey, Vec<u32>>,
    ref_count: u32,
    status: AnchorStatus,
    slots: AnchorSlots,
}

impl PathNode {
    fn new(parent: Option<u32>, parent_field: FieldKey, parent_index: usize) -> Self {
        Self {
            parent,
            parent_field,
            parent_index,
            children: BTreeMap::new(),
            ref_count: 0,
            status: AnchorStatus::Attached,
            slots: AnchorSlots::default(),
        }
    }
}

struct Entry {
    generation: u32,
    node: Option<PathNode>,
}

pub struct AnchorSet {
    entries: Vec<Entry>,
    free: Vec<u32>,
    after_destroy: Vec<DestroyListener>,
    visit_fields: Vec<FieldKey>,
    visit_indices: Vec<usize>,
}

impl Default for AnchorSet {
    fn default() -> Self {
        Self::new()
    }
}

/// Read view of one anchor node.
pub struct AnchorNode<'a> {
    set: &'a AnchorSet,
    index: u32,
    node: &'a PathNode,
}

impl<'a> AnchorNode<'a> {
    pub fn parent_field(&self) -> &'a FieldKey {
        &self.node.parent_field
    }

    pub fn parent_index(&self) -> usize {
        self.node.parent_index
    }

    /// Parent anchor node, or `None` for nodes directly under the root and destroyed nodes.
    pub fn parent(&self) -> Option<AnchorNode<'a>> {
        let parent = self.node.parent?;
        if parent == ROOT {
            return None;
        }
        self.set.view(parent)
    }

    pub fn status(&self) -> AnchorStatus {
        self.node.status
    }

    pub fn slots(&self) -> &'a AnchorSlots {
        &self.node.slots
    }

    pub fn path(&self) -> Option<UpPath> {
        self.set.path_of(self.index)
    }
}

impl AnchorSet {
    pub fn new() -> Self {
        Self {
            entries: vec![Entry {
                generation: 0,
                node: Some(PathNode::new(None, FieldKey::new(""), 0)),
            }],
            free: Vec::new(),
            after_destroy: Vec::new(),
            visit_fields: Vec::new(),
            visit_indices: Vec::new(),
        }
    }

    /// True when no anchor is held.
    pub fn is_empty(&self) -> bool {
        self.node(ROOT)
            .map(|root| root.children.is_empty())
            .unwrap_or(true)
    }

    /// Creates (or adds a reference to) the anchor for the node at `path`.
    pub fn track(&mut self, path: &UpPath) -> Anchor {
        let mut current = ROOT;
        for step in &path.steps {
            current = match self.find_child(current, &step.parent_field, step.parent_index) {
                Some(child) => child,
                None => self.add_child(current, step.parent_field.clone(), step.parent_index),
            };
        }
        if let Some(node) = self.node_mut(current) {
            node.ref_count += 1;
        }
        self.anchor_for(current)
    }

    /// Fails only for anchors that were never issued or have been forgotten.
    pub fn locate(&self, anchor: Anchor) -> Result<AnchorNode<'_>> {
        self.validate(anchor)?;
        self.view(anchor.index)
            .ok_or_else(|| Error::UnknownAnchor(format!("{anchor:?}")))
    }

    /// Current path of the anchored node, or `None` once it has been destroyed.
    pub fn locate_path(&self, anchor: Anchor) -> Result<Option<UpPath>> {
        self.validate(anchor)?;
        Ok(self.path_of(anchor.index))
    }

    pub fn ref_count(&self, anchor: Anchor) -> Result<u32> {
        self.validate(anchor)?;
        Ok(self.node(anchor.index).map(|n| n.ref_count).unwrap_or(0))
    }

    /// Drops one reference. The node is reclaimed once nothing keeps it alive.
    pub fn forget(&mut self, anchor: Anchor) -> Result<()> {
        self.validate(anchor)?;
        let node = self
            .node_mut(anchor.index)
            .ok_or_else(|| Error::UnknownAnchor(format!("{anchor:?}")))?;
        if node.ref_count == 0 {
            return Err(Error::UnknownAnchor(format!("{anchor:?} has no references")));
        }
        node.ref_count -= 1;
        self.try_reclaim(anchor.index);
        Ok(())
    }

    pub fn slots_mut(&mut self, anchor: Anchor) -> Result<&mut AnchorSlots> {
        self.validate(anchor)?;
        self.node_mut(anchor.index)
            .map(|node| &mut node.slots)
            .ok_or_else(|| Error::UnknownAnchor(format!("{anchor:?}")))
    }

    pub fn set_slot<T: 'static>(
        &mut self,
        anchor: Anchor,
        slot: AnchorSlot<T>,
        value: T,
    ) -> Result<Option<T>> {
        Ok(self.slots_mut(anchor)?.set(slot, value))
    }

    pub fn slot<T: 'static>(&self, anchor: Anchor, slot: AnchorSlot<T>) -> Result<Option<&T>> {
        Ok(self.locate(anchor)?.slots().get(slot))
    }

    pub fn slot_mut<T: 'static>(
        &mut self,
        anchor: Anchor,
        slot: AnchorSlot<T>,
    ) -> Result<Option<&mut T>> {
        Ok(self.slots_mut(anchor)?.get_mut(slot))
    }

    pub fn remove_slot<T: 'static>(
        &mut self,
        anchor: Anchor,
        slot: AnchorSlot<T>,
    ) -> Result<Option<T>> {
        Ok(self.slots_mut(anchor)?.remove(slot))
    }

    /// Listener fired, in registration order, just before an anchor node is reclaimed.
    pub fn on_after_destroy(&mut self, listener: impl FnMut(Anchor, &mut AnchorSlots) + 'static) {
        self.after_destroy.push(Box::new(listener));
    }

    fn validate(&self, anchor: Anchor) -> Result<()> {
        match self.entries.get(anchor.index as usize) {
            Some(entry) if entry.generation == anchor.generation && entry.node.is_some() => {
                Ok(())
            }
            _ => Err(Error::UnknownAnchor(format!("{anchor:?}"))),
        }
    }

    fn anchor_for(&self, index: u32) -> Anchor {
        Anchor {
            index,
            generation: self.entries[index as usize].generation,
        }
    }

    fn node(&self, index: u32) -> Option<&PathNode> {
        self.entries.get(index as usize)?.node.as_ref()
    }

    fn node_mut(&mut self, index: u32) -> Option<&mut PathNode> {
        self.entries.get_mut(index as usize)?.node.as_mut()
    }

    fn view(&self, index: u32) -> Option<AnchorNode<'_>> {
        Some(AnchorNode {
            set: self,
            index,
            node: self.node(index)?,
        })
    }

    fn path_of(&self, index: u32) -> Option<UpPath> {
        let mut steps = Vec::new();
        let mut current = index;
        while current != ROOT {
            let node = self.node(current)?;
            if node.status == AnchorStatus::Destroyed {
                return None;
            }
            steps.push(PathStep {
                parent_field: node.parent_field.clone(),
                parent_index: node.parent_index,
            });
            current = node.parent?;
        }
        steps.reverse();
        Some(UpPath::new(steps))
    }

    fn find_child(&self, parent: u32, field: &FieldKey, index: usize) -> Option<u32> {
        self.node(parent)?
            .children
            .get(field)?
            .iter()
            .copied()
            .find(|child| self.node(*child).is_some_and(|n| n.parent_index == index))
    }

    fn add_child(&mut self, parent: u32, field: FieldKey, index: usize) -> u32 {
        let node = PathNode::new(Some(parent), field.clone(), index);
        let child = match self.free.pop() {
            Some(slot) => {
                self.entries[slot as usize].node = Some(node);
                slot
            }
            None => {
                self.entries.push(Entry {
                    generation: 0,
                    node: Some(node),
                });
                (self.entries.len() - 1) as u32
            }
        };
        self.link(parent, field, child);
        child
    }

    fn link(&mut self, parent: u32, field: FieldKey, child: u32) {
        if let Some(parent_node) = self.node_mut(parent) {
            parent_node.children.entry(field).or_default().push(child);
        }
        self.sort_children(parent);
    }

    fn sort_children(&mut self, parent: u32) {
        let Some(node) = self.node(parent) else {
            return;
        };
        let sorted: BTreeMap<FieldKey, Vec<u32>> = node
            .children
            .iter()
            .map(|(key, ids)| {
                let mut ids = ids.clone();
                ids.sort_by_key(|id| self.node(*id).map(|n| n.parent_index).unwrap_or(0));
                (key.clone(), ids)
            })
            .collect();
        if let Some(node) = self.node_mut(parent) {
            node.children = sorted;
        }
    }

    fn unlink(&mut self, parent: u32, field: &FieldKey, child: u32) {
        if let Some(node) = self.node_mut(parent) {
            if let Some(siblings) = node.children.get_mut(field) {
                siblings.retain(|id| *id != child);
                if siblings.is_empty() {
                    node.children.remove(field);
                }
            }
        }
    }

    fn try_reclaim(&mut self, start: u32) {
        let mut current = Some(start);
        while let Some(index) = current {
            if index == ROOT {
                return;
            }
            let collectable = self
                .node(index)
                .is_some_and(|n| n.ref_count == 0 && n.children.is_empty());
            if !collectable {
                return;
            }
            let anchor = self.anchor_for(index);
            let entry = &mut self.entries[index as usize];
            let Some(mut node) = entry.node.take() else {
                return;
            };
            entry.generation = entry.generation.wrapping_add(1);
            self.free.push(index);
            trace!(?anchor, "reclaiming anchor node");
            for listener in &mut self.after_destroy {
                listener(anchor, &mut node.slots);
            }
            current = node.parent;
            if let Some(parent) = node.parent {
                self.unlink(parent, &node.parent_field, index);
            }
        }
    }

    fn mark_destroyed(&mut self, index: u32) {
        let mut stack = vec![index];
        while let Some(current) = stack.pop() {
            if let Some(node) = self.node_mut(current) {
                node.status = AnchorStatus::Destroyed;
                stack.extend(node.children.values().flatten().copied());
            }
        }
    }

    /// Anchor node of the parent of the field being visited, if one exists.
    fn visited_parent(&self) -> Option<u32> {
        let mut current = ROOT;
        for (key, index) in self.visit_fields.iter().zip(&self.visit_indices) {
            current = self.find_child(current, key, *index)?;
        }
        Some(current)
    }

    fn ensure_visited_parent(&mut self) -> u32 {
        let mut current = ROOT;
        let steps: Vec<(FieldKey, usize)> = self
            .visit_fields
            .iter()
            .cloned()
            .zip(self.visit_indices.iter().copied())
            .collect();
        for (key, index) in steps {
            current = match self.find_child(current, &key, index) {
                Some(child) => child,
                None => self.add_child(current, key, index),
            };
        }
        current
    }

    fn visited_field(&self) -> Result<FieldKey> {
        match self.visit_fields.last() {
            Some(key) if self.visit_fields.len() == self.visit_indices.len() + 1 => {
                Ok(key.clone())
            }
            _ => Err(Error::InconsistentState(
                "anchor visitor is not in a field".into(),
            )),
        }
    }

    fn children_in(&self, parent: u32, field: &FieldKey) -> Vec<u32> {
        self.node(parent)
            .and_then(|n| n.children.get(field))
            .cloned()
            .unwrap_or_default()
    }

    fn shift(&mut self, ids: &[u32], from: usize, delta: isize) {
        for id in ids {
            if let Some(node) = self.node_mut(*id) {
                if node.parent_index >= from {
                    node.parent_index = (node.parent_index as isize + delta) as usize;
                }
            }
        }
    }
}

impl DeltaVisitor for AnchorSet {
    fn create(&mut self, _content: &TreeChunk, _destination: &FieldKey) -> Result<()> {
        Ok(())
    }

    fn destroy(&mut self, detached_field: &FieldKey, count: usize) -> Result<()> {
        let doomed: Vec<u32> = self
            .children_in(ROOT, detached_field)
            .into_iter()
            .filter(|id| self.node(*id).is_some_and(|n| n.parent_index < count))
            .collect();
        for id in doomed {
            self.unlink(ROOT, detached_field, id);
            self.mark_destroyed(id);
            if let Some(node) = self.node_mut(id) {
                node.parent = None;
            }
            self.try_reclaim(id);
        }
        let remaining = self.children_in(ROOT, detached_field);
        self.shift(&remaining, count, -(count as isize));
        Ok(())
    }

    fn attach(&mut self, source: &FieldKey, count: usize, destination: usize) -> Result<()> {
        let field = self.visited_field()?;
        let moving: Vec<u32> = self
            .children_in(ROOT, source)
            .into_iter()
            .filter(|id| self.node(*id).is_some_and(|n| n.parent_index < count))
            .collect();
        let parent = if moving.is_empty() {
            match self.visited_parent() {
                Some(parent) => parent,
                None => return Ok(()),
            }
        } else {
            self.ensure_visited_parent()
        };
        let siblings = self.children_in(parent, &field);
        self.shift(&siblings, destination, count as isize);
        for id in moving {
            self.unlink(ROOT, source, id);
            if let Some(node) = self.node_mut(id) {
                node.parent = Some(parent);
                node.parent_field = field.clone();
                node.parent_index += destination;
            }
            self.link(parent, field.clone(), id);
        }
        Ok(())
    }

    fn detach(&mut self, source: Range<usize>, destination: &FieldKey) -> Result<()> {
        let field = self.visited_field()?;
        let Some(parent) = self.visited_parent() else {
            return Ok(());
        };
        let siblings = self.children_in(parent, &field);
        let mut moving = Vec::new();
        for id in &siblings {
            if self
                .node(*id)
                .is_some_and(|n| source.contains(&n.parent_index))
            {
                moving.push(*id);
            }
        }
        for id in &moving {
            self.unlink(parent, &field, *id);
            if let Some(node) = self.node_mut(*id) {
                node.parent = Some(ROOT);
                node.parent_field = destination.clone();
                node.parent_index -= source.start;
            }
            self.link(ROOT, destination.clone(), *id);
        }
        let remaining = self.children_in(parent, &field);
        self.shift(&remaining, source.end, -(source.len() as isize));
        self.try_reclaim(parent);
        Ok(())
    }

    fn enter_node(&mut self, index: usize) -> Result<()> {
        self.visit_indices.push(index);
        Ok(())
    }

    fn exit_node(&mut self, _index: usize) -> Result<()> {
        self.visit_indices.pop();
        Ok(())
    }

    fn enter_field(&mut self, key: &FieldKey) -> Result<()> {
        self.visit_fields.push(key.clone());
        Ok(())
    }

    fn exit_field(&mut self, _key: &FieldKey) -> Result<()> {
        self.visit_fields.pop();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;

    fn key(name: &str) -> FieldKey {
        FieldKey::new(name)
    }

    fn path(index: usize) -> UpPath {
        UpPath::root(FieldKey::root(), index)
    }

    fn detach_from_root(set: &mut AnchorSet, range: Range<usize>, destination: &str) {
        set.enter_field(&FieldKey::root()).unwrap();
        set.detach(range, &key(destination)).unwrap();
        set.exit_field(&FieldKey::root()).unwrap();
    }

    #[test]
    fn tracks_sibling_removal() {
        let mut set = AnchorSet::new();
        let anchor = set.track(&path(2));
        detach_from_root(&mut set, 0..1, "repair-0");
        assert_eq!(set.locate_path(anchor).unwrap(), Some(path(1)));
    }

    #[test]
    fn detached_nodes_move_to_detached_field() {
        let mut set = AnchorSet::new();
        let anchor = set.track(&path(1).child(key("items"), 0));
        detach_from_root(&mut set, 1..2, "repair-3");
        assert_eq!(
            set.locate_path(anchor).unwrap(),
            Some(UpPath::root(key("repair-3"), 0).child(key("items"), 0))
        );
    }

    #[test]
    fn attach_shifts_and_restores() {
        let mut set = AnchorSet::new();
        let moved = set.track(&path(0));
        let after = set.track(&path(1));
        detach_from_root(&mut set, 0..1, "repair-0");
        assert_eq!(set.locate_path(after).unwrap(), Some(path(0)));
        set.enter_field(&FieldKey::root()).unwrap();
        set.attach(&key("repair-0"), 1, 1).unwrap();
        set.exit_field(&FieldKey::root()).unwrap();
        assert_eq!(set.locate_path(moved).unwrap(), Some(path(1)));
        assert_eq!(set.locate_path(after).unwrap(), Some(path(0)));
    }

    #[test]
    fn destroy_then_forget_reclaims() {
        let mut set = AnchorSet::new();
        let anchor = set.track(&path(0));
        let slot = anchor_slot::<&'static str>();
        set.set_slot(anchor, slot, "cached").unwrap();
        let released = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&released);
        set.on_after_destroy(move |_, slots| {
            sink.borrow_mut().push(slots.remove(slot));
        });

        detach_from_root(&mut set, 0..1, "repair-0");
        set.destroy(&key("repair-0"), 1).unwrap();
        let node = set.locate(anchor).unwrap();
        assert_eq!(node.status(), AnchorStatus::Destroyed);
        assert_eq!(set.locate_path(anchor).unwrap(), None);

        set.forget(anchor).unwrap();
        assert_eq!(*released.borrow(), vec![Some("cached")]);
        assert!(matches!(set.locate(anchor), Err(Error::UnknownAnchor(_))));
        assert!(set.is_empty());
    }

    #[test]
    fn shared_prefix_is_kept_alive_by_children() {
        let mut set = AnchorSet::new();
        let parent = set.track(&path(0));
        let child = set.track(&path(0).child(key("items"), 2));
        set.forget(parent).unwrap();
        assert_eq!(
            set.locate_path(child).unwrap(),
            Some(path(0).child(key("items"), 2))
        );
        assert_eq!(set.locate(child).unwrap().parent_index(), 2);
        assert!(set.locate(child).unwrap().parent().is_some());
        set.forget(child).unwrap();
        assert!(set.is_empty());
    }

    #[test]
    fn track_twice_counts_references() {
        let mut set = AnchorSet::new();
        let a = set.track(&path(4));
        let b = set.track(&path(4));
        assert_eq!(a, b);
        assert_eq!(set.ref_count(a).unwrap(), 2);
        set.forget(a).unwrap();
        assert_eq!(set.locate_path(b).unwrap(), Some(path(4)));
    }
}
