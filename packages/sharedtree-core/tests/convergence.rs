use proptest::prelude::*;
use sharedtree_core::{FieldKey, FieldUpPath, MapTree, TreeChunk, UpPath};
use sharedtree_test_support::{
    folder, folder_schema, init_test_logging, number, number_list_schema, string, Harness,
};

fn numbers(values: &[f64]) -> Vec<MapTree> {
    values.iter().copied().map(number).collect()
}

fn insert(harness: &mut Harness, replica: usize, index: usize, value: f64) {
    harness
        .edit(replica, |builder| {
            builder
                .sequence_field(FieldUpPath::root())
                .insert(index, TreeChunk::from_map_trees(&[number(value)]))
        })
        .unwrap();
}

fn remove(harness: &mut Harness, replica: usize, index: usize) {
    harness
        .edit(replica, |builder| builder.sequence_field(FieldUpPath::root()).remove(index, 1))
        .unwrap();
}

#[test]
fn concurrent_inserts_at_one_position_converge() {
    init_test_logging();
    let mut harness = Harness::new(2, number_list_schema(), &numbers(&[1.0, 2.0])).unwrap();
    insert(&mut harness, 0, 1, 10.0);
    insert(&mut harness, 1, 1, 20.0);
    harness.deliver_all().unwrap();
    assert!(harness.converged());
    assert_eq!(harness.contents()[0], numbers(&[1.0, 10.0, 20.0, 2.0]));
}

#[test]
fn concurrent_removal_of_one_node_removes_it_once() {
    let mut harness = Harness::new(3, number_list_schema(), &numbers(&[1.0, 2.0, 3.0])).unwrap();
    remove(&mut harness, 0, 1);
    remove(&mut harness, 1, 1);
    remove(&mut harness, 2, 0);
    harness.deliver_all().unwrap();
    assert!(harness.converged());
    assert_eq!(harness.contents()[0], numbers(&[3.0]));
}

#[test]
fn insert_next_to_a_concurrently_moved_node() {
    let mut harness = Harness::new(2, number_list_schema(), &numbers(&[1.0, 2.0, 3.0])).unwrap();
    harness
        .edit(0, |builder| {
            builder.move_between(FieldUpPath::root(), 0, 1, FieldUpPath::root(), 2)
        })
        .unwrap();
    insert(&mut harness, 1, 3, 4.0);
    assert_eq!(harness.contents()[0], numbers(&[2.0, 3.0, 1.0]));
    harness.deliver_all().unwrap();
    assert!(harness.converged());
    assert_eq!(harness.contents()[0], numbers(&[2.0, 3.0, 1.0, 4.0]));
}

#[test]
fn nested_edits_under_one_node_merge() {
    let mut harness = Harness::new(2, folder_schema(), &[folder("root", vec![])]).unwrap();
    let root = UpPath::root(FieldKey::root(), 0);
    harness
        .edit(0, |builder| {
            builder
                .value_field(FieldUpPath::new(Some(root.clone()), "name".into()))
                .set(TreeChunk::from_map_trees(&[string("home")]), false)
        })
        .unwrap();
    harness
        .edit(1, |builder| {
            builder
                .sequence_field(FieldUpPath::new(Some(root.clone()), "children".into()))
                .insert(0, TreeChunk::from_map_trees(&[folder("music", vec![])]))
        })
        .unwrap();
    harness.deliver_all().unwrap();

    assert!(harness.converged());
    assert_eq!(
        harness.contents()[1],
        vec![folder("home", vec![folder("music", vec![])])]
    );
}

#[test]
fn local_edits_made_between_deliveries_stay_on_top() {
    let mut harness = Harness::new(2, number_list_schema(), &numbers(&[])).unwrap();
    insert(&mut harness, 0, 0, 1.0);
    insert(&mut harness, 1, 0, 2.0);
    harness.deliver_one().unwrap();
    insert(&mut harness, 1, 0, 3.0);
    assert_eq!(harness.contents()[1], numbers(&[3.0, 1.0, 2.0]));
    harness.deliver_all().unwrap();
    assert!(harness.converged());
    for replica in &harness.replicas {
        assert!(replica.edit_manager().local_commits().is_empty());
    }
}

#[derive(Clone, Debug)]
enum Step {
    Edit { replica: usize, kind: u8, a: usize, b: usize },
    Deliver,
}

fn step() -> impl Strategy<Value = Step> {
    prop_oneof![
        3 => (0usize..3, any::<u8>(), 0usize..8, 0usize..8)
            .prop_map(|(replica, kind, a, b)| Step::Edit { replica, kind, a, b }),
        1 => Just(Step::Deliver),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn replicas_converge(steps in prop::collection::vec(step(), 1..12)) {
        let mut harness = Harness::new(3, number_list_schema(), &numbers(&[0.0, 1.0, 2.0])).unwrap();
        for (i, step) in steps.into_iter().enumerate() {
            let Step::Edit { replica, kind, a, b } = step else {
                harness.deliver_one().unwrap();
                continue;
            };
            let len = harness.replicas[replica].content().len();
            let value = 100.0 + i as f64;
            harness
                .edit(replica, |builder| {
                    let root = FieldUpPath::root();
                    if len == 0 || kind % 3 == 0 {
                        let content = TreeChunk::from_map_trees(&[number(value)]);
                        builder.sequence_field(root).insert(a % (len + 1), content)
                    } else if kind % 3 == 1 {
                        builder.sequence_field(root).remove(a % len, 1)
                    } else {
                        builder.move_between(root.clone(), a % len, 1, root, b % len)
                    }
                })
                .unwrap();
        }
        harness.deliver_all().unwrap();
        prop_assert!(harness.converged(), "{:?}", harness.contents());
    }
}
