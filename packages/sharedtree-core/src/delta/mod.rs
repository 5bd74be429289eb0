//! Concrete, position-based description of one tree mutation.
//!
//! Marks in a field are read in order. Detaching marks refer to the field's content before
//! the mutation; attaching marks refer to positions in the resulting content. Content that is
//! not under the document root lives in detached fields and is addressed by id.

use std::collections::BTreeMap;

use crate::forest::TreeChunk;
use crate::ids::{DetachedNodeId, FieldKey};

pub mod visit;
pub mod visitor;

pub use visit::visit_delta;
pub use visitor::{CombinedVisitor, DeltaVisitor};

pub type FieldMap = BTreeMap<FieldKey, FieldChanges>;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Root {
    pub fields: FieldMap,
    /// New content, placed into detached fields before anything else happens.
    pub build: Vec<DetachedNodeBuild>,
    /// Changes to content that is detached when the delta starts.
    pub global: Vec<DetachedNodeChanges>,
    pub rename: Vec<DetachedNodeRename>,
    pub destroy: Vec<DetachedNodeDestruction>,
}

impl Root {
    pub fn is_empty(&self) -> bool {
        self.fields.values().all(FieldChanges::is_empty)
            && self.build.is_empty()
            && self.global.is_empty()
            && self.rename.is_empty()
            && self.destroy.is_empty()
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct FieldChanges {
    pub local: Vec<Mark>,
    pub global: Vec<DetachedNodeChanges>,
    pub rename: Vec<DetachedNodeRename>,
}

impl FieldChanges {
    pub fn is_empty(&self) -> bool {
        self.local.iter().all(Mark::is_skip) && self.global.is_empty() && self.rename.is_empty()
    }
}

/// `count` nodes handled alike.
///
/// A mark with neither `attach` nor `detach` skips over (and optionally modifies) existing
/// content. `fields` describe nested changes to the single node under the mark; they are
/// applied before that node is detached. Attach marks never carry fields: changes to
/// attached content are expressed as global changes to its detached id.
#[derive(Clone, Debug, PartialEq)]
pub struct Mark {
    pub count: u32,
    pub attach: Option<DetachedNodeId>,
    pub detach: Option<DetachedNodeId>,
    pub fields: Option<FieldMap>,
}

impl Mark {
    pub fn skip(count: u32) -> Self {
        Self {
            count,
            attach: None,
            detach: None,
            fields: None,
        }
    }

    pub fn modify(fields: FieldMap) -> Self {
        Self {
            count: 1,
            attach: None,
            detach: None,
            fields: Some(fields),
        }
    }

    pub fn attach(id: DetachedNodeId, count: u32) -> Self {
        Self {
            count,
            attach: Some(id),
            detach: None,
            fields: None,
        }
    }

    pub fn detach(id: DetachedNodeId, count: u32) -> Self {
        Self {
            count,
            attach: None,
            detach: Some(id),
            fields: None,
        }
    }

    pub fn is_skip(&self) -> bool {
        self.attach.is_none() && self.detach.is_none() && self.fields.is_none()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct DetachedNodeBuild {
    pub id: DetachedNodeId,
    pub trees: TreeChunk,
}

#[derive(Clone, Debug, PartialEq)]
pub struct DetachedNodeChanges {
    pub id: DetachedNodeId,
    pub fields: FieldMap,
}

#[derive(Clone, Debug, PartialEq)]
pub struct DetachedNodeRename {
    pub count: u32,
    pub old_id: DetachedNodeId,
    pub new_id: DetachedNodeId,
}

#[derive(Clone, Debug, PartialEq)]
pub struct DetachedNodeDestruction {
    pub id: DetachedNodeId,
    pub count: u32,
}

/// Appends `mark`, merging it into the previous one when both are plain skips or both move
/// content to or from consecutive ids.
pub fn push_mark(marks: &mut Vec<Mark>, mark: Mark) {
    if mark.count == 0 {
        return;
    }
    if let Some(last) = marks.last_mut() {
        if last.fields.is_none() && mark.fields.is_none() {
            let contiguous = |a: Option<DetachedNodeId>, b: Option<DetachedNodeId>| match (a, b) {
                (None, None) => true,
                (Some(a), Some(b)) => a.offset(last.count) == b,
                _ => false,
            };
            if contiguous(last.attach, mark.attach) && contiguous(last.detach, mark.detach) {
                last.count += mark.count;
                return;
            }
        }
    }
    marks.push(mark);
}

/// Drops trailing plain skips, which have no effect.
pub fn trim_skips(marks: &mut Vec<Mark>) {
    while marks.last().is_some_and(Mark::is_skip) {
        marks.pop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::ChangeAtomId;

    #[test]
    fn push_mark_merges_runs() {
        let mut marks = Vec::new();
        push_mark(&mut marks, Mark::skip(1));
        push_mark(&mut marks, Mark::skip(2));
        push_mark(&mut marks, Mark::detach(ChangeAtomId::new(None, 4), 1));
        push_mark(&mut marks, Mark::detach(ChangeAtomId::new(None, 5), 1));
        push_mark(&mut marks, Mark::detach(ChangeAtomId::new(None, 9), 1));
        push_mark(&mut marks, Mark::skip(1));
        trim_skips(&mut marks);
        assert_eq!(
            marks,
            vec![
                Mark::skip(3),
                Mark::detach(ChangeAtomId::new(None, 4), 2),
                Mark::detach(ChangeAtomId::new(None, 9), 1),
            ]
        );
    }
}
