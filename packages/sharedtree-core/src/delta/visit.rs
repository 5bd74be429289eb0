use tracing::{debug, trace};

use crate::delta::{
    DeltaVisitor, DetachedNodeChanges, DetachedNodeRename, FieldChanges, FieldMap, Mark, Root,
};
use crate::error::{Error, Result};
use crate::forest::{DetachedFieldIndex, TreeChunk};
use crate::ids::FieldKey;

/// Replays `root` against `visitor`, keeping `index` in sync with the detached fields.
///
/// Phases run in a fixed order: builds, the detach pass over the root fields, changes to
/// detached content (detach then attach), renames, the attach pass over the root fields, and
/// finally destructions. Nodes that are detached while carrying nested changes receive their
/// nested attach pass in their detached field, before the root attach pass runs.
pub fn visit_delta(
    root: &Root,
    visitor: &mut dyn DeltaVisitor,
    index: &mut DetachedFieldIndex,
) -> Result<()> {
    let mut global: Vec<&DetachedNodeChanges> = root.global.iter().collect();
    let mut rename: Vec<&DetachedNodeRename> = root.rename.iter().collect();
    collect_detached_changes(&root.fields, &mut global, &mut rename);
    debug!(
        fields = root.fields.len(),
        builds = root.build.len(),
        global = global.len(),
        renames = rename.len(),
        destroys = root.destroy.len(),
        "visiting delta"
    );

    for build in &root.build {
        for (offset, tree) in build.trees.roots.iter().enumerate() {
            let id = build.id.offset(offset as u32);
            if index.try_get(id).is_some() {
                trace!(?id, "content already present, skipping build");
                continue;
            }
            let key = index.create_entry(id)?;
            visitor.create(&TreeChunk::from_roots(vec![tree.clone()]), &key)?;
        }
    }

    let mut pending = Vec::new();
    for (key, changes) in &root.fields {
        visitor.enter_field(key)?;
        detach_pass(&changes.local, visitor, index, &mut pending)?;
        visitor.exit_field(key)?;
    }

    for changes in global.iter().copied() {
        let key = index.try_get(changes.id).ok_or_else(|| {
            Error::malformed(format!("changes to unknown detached node {:?}", changes.id))
        })?;
        visit_detached_node(&key, visitor, |visitor| {
            nested_detach_pass(&changes.fields, visitor, index, &mut pending)
        })?;
        pending.push((key, &changes.fields));
    }

    for entry in &rename {
        for offset in 0..entry.count {
            index.rename(entry.old_id.offset(offset), entry.new_id.offset(offset))?;
        }
    }

    for (key, fields) in pending {
        visit_detached_node(&key, visitor, |visitor| {
            nested_attach_pass(fields, visitor, index)
        })?;
    }

    for (key, changes) in &root.fields {
        visitor.enter_field(key)?;
        attach_pass(&changes.local, visitor, index)?;
        visitor.exit_field(key)?;
    }

    for destruction in &root.destroy {
        for offset in 0..destruction.count {
            let id = destruction.id.offset(offset);
            if let Some(key) = index.try_get(id) {
                visitor.destroy(&key, 1)?;
                index.delete(id);
            }
        }
    }
    Ok(())
}

fn collect_detached_changes<'a>(
    fields: &'a FieldMap,
    global: &mut Vec<&'a DetachedNodeChanges>,
    rename: &mut Vec<&'a DetachedNodeRename>,
) {
    for changes in fields.values() {
        collect_from_field(changes, global, rename);
    }
}

fn collect_from_field<'a>(
    changes: &'a FieldChanges,
    global: &mut Vec<&'a DetachedNodeChanges>,
    rename: &mut Vec<&'a DetachedNodeRename>,
) {
    for nested in &changes.global {
        global.push(nested);
        collect_detached_changes(&nested.fields, global, rename);
    }
    rename.extend(changes.rename.iter());
    for mark in &changes.local {
        if let Some(fields) = &mark.fields {
            collect_detached_changes(fields, global, rename);
        }
    }
}

fn visit_detached_node<F>(
    key: &FieldKey,
    visitor: &mut dyn DeltaVisitor,
    body: F,
) -> Result<()>
where
    F: FnOnce(&mut dyn DeltaVisitor) -> Result<()>,
{
    visitor.enter_field(key)?;
    visitor.enter_node(0)?;
    body(&mut *visitor)?;
    visitor.exit_node(0)?;
    visitor.exit_field(key)
}

fn nested_detach_pass<'a>(
    fields: &'a FieldMap,
    visitor: &mut dyn DeltaVisitor,
    index: &mut DetachedFieldIndex,
    pending: &mut Vec<(FieldKey, &'a FieldMap)>,
) -> Result<()> {
    for (key, changes) in fields {
        visitor.enter_field(key)?;
        detach_pass(&changes.local, visitor, index, pending)?;
        visitor.exit_field(key)?;
    }
    Ok(())
}

fn nested_attach_pass(
    fields: &FieldMap,
    visitor: &mut dyn DeltaVisitor,
    index: &mut DetachedFieldIndex,
) -> Result<()> {
    for (key, changes) in fields {
        visitor.enter_field(key)?;
        attach_pass(&changes.local, visitor, index)?;
        visitor.exit_field(key)?;
    }
    Ok(())
}

fn check_fields(mark: &Mark) -> Result<()> {
    if mark.fields.is_some() && mark.count != 1 {
        return Err(Error::malformed("nested changes on a mark spanning several nodes"));
    }
    Ok(())
}

fn detach_pass<'a>(
    marks: &'a [Mark],
    visitor: &mut dyn DeltaVisitor,
    index: &mut DetachedFieldIndex,
    pending: &mut Vec<(FieldKey, &'a FieldMap)>,
) -> Result<()> {
    let mut position = 0usize;
    for mark in marks {
        check_fields(mark)?;
        if let Some(detach) = mark.detach {
            for offset in 0..mark.count {
                if let Some(fields) = &mark.fields {
                    visitor.enter_node(position)?;
                    nested_detach_pass(fields, visitor, index, pending)?;
                    visitor.exit_node(position)?;
                }
                let destination = index.create_entry(detach.offset(offset))?;
                trace!(position, %destination, "detach");
                visitor.detach(position..position + 1, &destination)?;
                if let Some(fields) = &mark.fields {
                    pending.push((destination, fields));
                }
            }
        } else if mark.attach.is_none() {
            if let Some(fields) = &mark.fields {
                visitor.enter_node(position)?;
                nested_detach_pass(fields, visitor, index, pending)?;
                visitor.exit_node(position)?;
            }
            position += mark.count as usize;
        }
    }
    Ok(())
}

fn attach_pass(
    marks: &[Mark],
    visitor: &mut dyn DeltaVisitor,
    index: &mut DetachedFieldIndex,
) -> Result<()> {
    let mut position = 0usize;
    for mark in marks {
        if let Some(attach) = mark.attach {
            if mark.fields.is_some() && mark.detach.is_none() {
                return Err(Error::malformed("attach mark carries nested changes"));
            }
            for offset in 0..mark.count {
                let id = attach.offset(offset);
                let source = index.try_get(id).ok_or_else(|| {
                    Error::malformed(format!("attach of unknown detached node {id:?}"))
                })?;
                trace!(position, %source, "attach");
                visitor.attach(&source, 1, position)?;
                index.delete(id);
                position += 1;
            }
        } else if mark.detach.is_none() {
            if let Some(fields) = &mark.fields {
                visitor.enter_node(position)?;
                nested_attach_pass(fields, visitor, index)?;
                visitor.exit_node(position)?;
            }
            position += mark.count as usize;
        }
    }
    Ok(())
}
