use std::fmt;

use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::schema::{allows_tree_superset, SchemaPolicy, StoredSchema};

type SchemaListener = Box<dyn FnMut(&StoredSchema)>;

/// Whether [`StoredSchemaRepository::update`] may install a schema that rejects content the
/// current one admits.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum AllowIncompatible {
    #[default]
    No,
    Yes,
}

/// Holds the current stored schema and notifies listeners when it changes.
pub struct StoredSchemaRepository {
    schema: StoredSchema,
    policy: SchemaPolicy,
    listeners: Vec<SchemaListener>,
}

impl Default for StoredSchemaRepository {
    fn default() -> Self {
        Self::new(SchemaPolicy::default())
    }
}

impl fmt::Debug for StoredSchemaRepository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoredSchemaRepository")
            .field("schema", &self.schema)
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

impl StoredSchemaRepository {
    pub fn new(policy: SchemaPolicy) -> Self {
        Self {
            schema: StoredSchema::default(),
            policy,
            listeners: Vec::new(),
        }
    }

    pub fn schema(&self) -> &StoredSchema {
        &self.schema
    }

    pub fn policy(&self) -> &SchemaPolicy {
        &self.policy
    }

    pub fn on_after_schema_change(&mut self, listener: impl FnMut(&StoredSchema) + 'static) {
        self.listeners.push(Box::new(listener));
    }

    /// Replaces the stored schema. Narrowing requires [`AllowIncompatible::Yes`].
    pub fn update(&mut self, schema: StoredSchema, allow: AllowIncompatible) -> Result<()> {
        if schema == self.schema {
            return Ok(());
        }
        if !allows_tree_superset(&self.policy, &self.schema, &schema) {
            if allow == AllowIncompatible::No {
                return Err(Error::IncompatibleSchema(
                    "new schema does not admit all content the current schema admits".into(),
                ));
            }
            warn!(
                node_types = schema.nodes.len(),
                "installing schema incompatible with the current one"
            );
        }
        debug!(node_types = schema.nodes.len(), "schema updated");
        self.schema = schema;
        for listener in &mut self.listeners {
            listener(&self.schema);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::rc::Rc;

    use super::*;
    use crate::change::field_kind::{OPTIONAL, VALUE};
    use crate::schema::{FieldSchema, NodeSchema};
    use crate::tree::ValueSchema;

    fn schema(kind: &crate::change::FieldKind) -> StoredSchema {
        StoredSchema::new(FieldSchema::new(kind, ["number"]))
            .with_node("number", NodeSchema::Leaf { value: ValueSchema::Number })
    }

    #[test]
    fn narrowing_requires_override() {
        let mut repo = StoredSchemaRepository::default();
        let changes = Rc::new(Cell::new(0));
        let seen = Rc::clone(&changes);
        repo.on_after_schema_change(move |_| seen.set(seen.get() + 1));

        repo.update(schema(&OPTIONAL), AllowIncompatible::No).unwrap();
        let err = repo.update(schema(&VALUE), AllowIncompatible::No).unwrap_err();
        assert_eq!(err.code(), "ST0005");
        assert_eq!(repo.schema(), &schema(&OPTIONAL));

        repo.update(schema(&VALUE), AllowIncompatible::Yes).unwrap();
        assert_eq!(repo.schema(), &schema(&VALUE));
        assert_eq!(changes.get(), 2);
    }
}
