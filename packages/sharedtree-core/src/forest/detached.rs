use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::ids::{DetachedNodeId, FieldKey};

/// Maps detached node ids to the forest root fields holding their content.
///
/// Each id owns its own root field holding exactly one node.
#[derive(Clone, Debug, Default)]
pub struct DetachedFieldIndex {
    entries: BTreeMap<DetachedNodeId, u64>,
    next_root: u64,
}

impl DetachedFieldIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_get(&self, id: DetachedNodeId) -> Option<FieldKey> {
        self.entries.get(&id).map(|root| Self::field_key(*root))
    }

    /// Allocates a fresh root field for `id`.
    pub fn create_entry(&mut self, id: DetachedNodeId) -> Result<FieldKey> {
        if self.entries.contains_key(&id) {
            return Err(Error::malformed(format!(
                "detached node {id:?} is already in use"
            )));
        }
        let root = self.next_root;
        self.next_root += 1;
        self.entries.insert(id, root);
        Ok(Self::field_key(root))
    }

    pub fn delete(&mut self, id: DetachedNodeId) {
        self.entries.remove(&id);
    }

    /// Re-addresses the content of `old` as `new`. The content stays in the same root field.
    pub fn rename(&mut self, old: DetachedNodeId, new: DetachedNodeId) -> Result<()> {
        if old == new {
            return Ok(());
        }
        let root = self
            .entries
            .remove(&old)
            .ok_or_else(|| Error::malformed(format!("rename of unknown detached node {old:?}")))?;
        if self.entries.insert(new, root).is_some() {
            return Err(Error::malformed(format!(
                "rename target {new:?} is already in use"
            )));
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = DetachedNodeId> + '_ {
        self.entries.keys().copied()
    }

    fn field_key(root: u64) -> FieldKey {
        FieldKey::new(format!("repair-{root}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::ChangeAtomId;

    #[test]
    fn entries_get_distinct_fields() {
        let mut index = DetachedFieldIndex::new();
        let a = index.create_entry(ChangeAtomId::new(None, 0)).unwrap();
        let b = index.create_entry(ChangeAtomId::new(None, 1)).unwrap();
        assert_ne!(a, b);
        assert!(index.create_entry(ChangeAtomId::new(None, 0)).is_err());
    }

    #[test]
    fn rename_keeps_field() {
        let mut index = DetachedFieldIndex::new();
        let old = ChangeAtomId::new(None, 0);
        let new = ChangeAtomId::new(None, 7);
        let key = index.create_entry(old).unwrap();
        index.rename(old, new).unwrap();
        assert_eq!(index.try_get(new), Some(key));
        assert_eq!(index.try_get(old), None);
    }
}
