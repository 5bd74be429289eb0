//! Schema evolution checks: does one schema admit every document another one admits.

use std::collections::BTreeSet;

use crate::change::field_kind::Multiplicity;
use crate::schema::{FieldSchema, NodeSchema, SchemaPolicy, StoredSchema};

pub fn allows_multiplicity_superset(original: Multiplicity, superset: Multiplicity) -> bool {
    use Multiplicity::*;
    match (original, superset) {
        (_, Sequence) => true,
        (Forbidden, Forbidden | Optional) => true,
        (Single, Single | Optional) => true,
        (Optional, Optional) => true,
        _ => false,
    }
}

pub fn allows_field_superset(
    policy: &SchemaPolicy,
    original: &FieldSchema,
    superset: &FieldSchema,
) -> bool {
    let (Some(from), Some(to)) = (
        policy.multiplicity(&original.kind),
        policy.multiplicity(&superset.kind),
    ) else {
        return false;
    };
    if from == Multiplicity::Forbidden {
        return allows_multiplicity_superset(from, to);
    }
    if !allows_multiplicity_superset(from, to) {
        return false;
    }
    match (&original.types, &superset.types) {
        (_, None) => true,
        (None, Some(_)) => false,
        (Some(from), Some(to)) => from.is_subset(to),
    }
}

fn allows_node_superset(policy: &SchemaPolicy, original: &NodeSchema, superset: &NodeSchema) -> bool {
    match (original, superset) {
        (NodeSchema::Leaf { value: a }, NodeSchema::Leaf { value: b }) => a == b,
        (NodeSchema::Map { field: a }, NodeSchema::Map { field: b }) => {
            allows_field_superset(policy, a, b)
        }
        (NodeSchema::Object { fields: a }, NodeSchema::Object { fields: b }) => {
            let forbidden = FieldSchema::forbidden();
            let keys: BTreeSet<_> = a.keys().chain(b.keys()).collect();
            keys.into_iter().all(|key| {
                allows_field_superset(
                    policy,
                    a.get(key).unwrap_or(&forbidden),
                    b.get(key).unwrap_or(&forbidden),
                )
            })
        }
        _ => false,
    }
}

/// True when every document valid under `original` is also valid under `superset`.
pub fn allows_tree_superset(
    policy: &SchemaPolicy,
    original: &StoredSchema,
    superset: &StoredSchema,
) -> bool {
    allows_field_superset(policy, &original.root, &superset.root)
        && original.nodes.iter().all(|(name, node)| {
            superset
                .node(name)
                .map_or(false, |other| allows_node_superset(policy, node, other))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::field_kind::{OPTIONAL, SEQUENCE, VALUE};
    use crate::tree::ValueSchema;

    fn number_list(kind: &crate::change::FieldKind) -> StoredSchema {
        StoredSchema::new(FieldSchema::new(kind, ["number"]))
            .with_node("number", NodeSchema::Leaf { value: ValueSchema::Number })
    }

    #[test]
    fn multiplicity_lattice() {
        use Multiplicity::*;
        assert!(allows_multiplicity_superset(Single, Optional));
        assert!(allows_multiplicity_superset(Forbidden, Optional));
        assert!(allows_multiplicity_superset(Optional, Sequence));
        assert!(!allows_multiplicity_superset(Optional, Single));
        assert!(!allows_multiplicity_superset(Sequence, Optional));
        assert!(!allows_multiplicity_superset(Single, Forbidden));
    }

    #[test]
    fn widening_root_is_a_superset() {
        let policy = SchemaPolicy::default();
        assert!(allows_tree_superset(&policy, &number_list(&VALUE), &number_list(&OPTIONAL)));
        assert!(allows_tree_superset(&policy, &number_list(&OPTIONAL), &number_list(&SEQUENCE)));
        assert!(!allows_tree_superset(&policy, &number_list(&SEQUENCE), &number_list(&VALUE)));
    }

    #[test]
    fn empty_schema_admits_only_the_empty_document() {
        let policy = SchemaPolicy::default();
        assert!(allows_tree_superset(&policy, &StoredSchema::default(), &number_list(&OPTIONAL)));
        assert!(!allows_tree_superset(&policy, &StoredSchema::default(), &number_list(&VALUE)));
        assert!(!allows_tree_superset(&policy, &number_list(&VALUE), &StoredSchema::default()));
    }

    #[test]
    fn dropping_a_node_type_is_incompatible() {
        let policy = SchemaPolicy::default();
        let wider = number_list(&SEQUENCE)
            .with_node("text", NodeSchema::Leaf { value: ValueSchema::String });
        assert!(allows_tree_superset(&policy, &number_list(&SEQUENCE), &wider));
        assert!(!allows_tree_superset(&policy, &wider, &number_list(&SEQUENCE)));
    }
}
