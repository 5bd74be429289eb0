use std::cell::RefCell;
use std::rc::Rc;

use sharedtree_core::{
    Checkout, CoreConfig, Error, FieldKey, FieldUpPath, NavigationResult, SessionId, TreeChunk,
    TreeCursor, UpPath, Value,
};
use sharedtree_test_support::{init_test_logging, number, number_list_schema};

fn numbers(values: &[f64]) -> Checkout {
    init_test_logging();
    let mut checkout = Checkout::new(SessionId::from_u128(7), CoreConfig::default());
    let content: Vec<_> = values.iter().copied().map(number).collect();
    let commit = checkout.initialize(&content, number_list_schema()).unwrap();
    checkout.receive_sequenced(commit, 1, 0).unwrap();
    checkout
}

fn root(index: usize) -> UpPath {
    UpPath::root(FieldKey::root(), index)
}

fn value_at(checkout: &Checkout, anchor: sharedtree_core::Anchor) -> Option<Value> {
    let mut cursor = checkout.forest().allocate_cursor();
    match checkout.try_move_cursor_to_node(anchor, &mut cursor).unwrap() {
        NavigationResult::Ok => cursor.value().cloned(),
        NavigationResult::NotFound => None,
    }
}

#[test]
fn anchor_follows_its_node_across_sibling_edits() {
    let mut checkout = numbers(&[1.0, 2.0, 3.0]);
    let anchor = checkout.track(&root(1));

    checkout
        .edit(|builder| {
            builder
                .sequence_field(FieldUpPath::root())
                .insert(0, TreeChunk::from_map_trees(&[number(0.0)]))
        })
        .unwrap();
    assert_eq!(checkout.locate(anchor).unwrap(), Some(root(2)));
    assert_eq!(value_at(&checkout, anchor), Some(Value::Number(2.0)));

    checkout
        .edit(|builder| builder.sequence_field(FieldUpPath::root()).remove(3, 1))
        .unwrap();
    checkout
        .edit(|builder| builder.sequence_field(FieldUpPath::root()).remove(0, 1))
        .unwrap();
    assert_eq!(checkout.locate(anchor).unwrap(), Some(root(1)));
    assert_eq!(value_at(&checkout, anchor), Some(Value::Number(2.0)));
}

#[test]
fn anchor_outlives_removal_until_destroyed_and_forgotten() {
    let mut checkout = numbers(&[1.0, 2.0]);
    let anchor = checkout.track(&root(0));

    let removal = checkout
        .edit(|builder| builder.sequence_field(FieldUpPath::root()).remove(0, 1))
        .unwrap();
    let detached = checkout.locate(anchor).unwrap().unwrap();
    assert_ne!(detached.steps[0].parent_field, FieldKey::root());
    assert_eq!(value_at(&checkout, anchor), Some(Value::Number(1.0)));

    assert_eq!(checkout.purge_repair_data().unwrap(), 0);
    checkout.receive_sequenced(removal, 2, 1).unwrap();
    assert!(checkout.purge_repair_data().unwrap() > 0);
    assert_eq!(checkout.locate(anchor).unwrap(), None);
    assert_eq!(value_at(&checkout, anchor), None);

    checkout.forget(anchor).unwrap();
    assert!(matches!(checkout.locate(anchor), Err(Error::UnknownAnchor(_))));
    assert!(checkout.forest().anchors().is_empty());
}

#[test]
fn batch_insert_creates_one_root_field_per_tree_in_order() {
    let mut checkout = numbers(&[]);
    let created = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&created);
    checkout
        .forest_mut()
        .on_after_root_field_created(move |key| sink.borrow_mut().push(key.clone()));

    let batch = [number(10.0), number(20.0), number(30.0)];
    checkout
        .edit(|builder| {
            builder
                .sequence_field(FieldUpPath::root())
                .insert(0, TreeChunk::from_map_trees(&batch))
        })
        .unwrap();

    let created = created.borrow();
    assert_eq!(created.len(), batch.len());
    for pair in created.windows(2) {
        assert_ne!(pair[0], pair[1]);
    }
    assert_eq!(checkout.content(), batch.to_vec());
}
