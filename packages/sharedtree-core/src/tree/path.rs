use std::fmt;

use crate::ids::FieldKey;

/// One step down from a parent: the field and the index within it.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct PathStep {
    pub parent_field: FieldKey,
    pub parent_index: usize,
}

/// Location of a node, as steps from the placeholder node above the root fields.
///
/// The empty path designates the placeholder itself. The first step names a root field
/// (the document field or a detached field).
#[derive(Clone, Debug, Default, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct UpPath {
    pub steps: Vec<PathStep>,
}

impl UpPath {
    pub fn new(steps: Vec<PathStep>) -> Self {
        Self { steps }
    }

    /// Path of the `index`th node of root field `field`.
    pub fn root(field: FieldKey, index: usize) -> Self {
        Self {
            steps: vec![PathStep {
                parent_field: field,
                parent_index: index,
            }],
        }
    }

    pub fn child(&self, field: FieldKey, index: usize) -> Self {
        let mut steps = self.steps.clone();
        steps.push(PathStep {
            parent_field: field,
            parent_index: index,
        });
        Self { steps }
    }

    pub fn parent(&self) -> Option<UpPath> {
        if self.steps.is_empty() {
            return None;
        }
        Some(Self {
            steps: self.steps[..self.steps.len() - 1].to_vec(),
        })
    }

    pub fn last(&self) -> Option<&PathStep> {
        self.steps.last()
    }

    pub fn depth(&self) -> usize {
        self.steps.len()
    }
}

impl fmt::Display for UpPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for step in &self.steps {
            write!(f, "/{}[{}]", step.parent_field, step.parent_index)?;
        }
        Ok(())
    }
}

/// Location of a field: the node owning it (`None` for root fields) and its key.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct FieldUpPath {
    pub parent: Option<UpPath>,
    pub field: FieldKey,
}

impl FieldUpPath {
    pub fn new(parent: Option<UpPath>, field: FieldKey) -> Self {
        Self { parent, field }
    }

    /// The document's root field.
    pub fn root() -> Self {
        Self {
            parent: None,
            field: FieldKey::root(),
        }
    }

    pub fn node(&self, index: usize) -> UpPath {
        match &self.parent {
            Some(parent) => parent.child(self.field.clone(), index),
            None => UpPath::root(self.field.clone(), index),
        }
    }
}
