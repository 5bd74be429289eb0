use proptest::prelude::*;
use sharedtree_core::delta::{DetachedNodeBuild, FieldChanges, Mark};
use sharedtree_core::{
    ChangeAtomId, ChangeFamily, FieldKey, FieldUpPath, Forest, MapTree, ModularChangeset,
    ModularEditBuilder, RevisionMetadata, RevisionTag, Root, SessionId, TaggedChange, TreeChunk,
};
use sharedtree_core::change::SequenceKinds;
use sharedtree_test_support::number;

#[derive(Clone, Debug)]
enum Edit {
    Insert { index: usize, value: f64 },
    Remove { index: usize, count: u32 },
    Move { source: usize, destination: usize },
}

impl Edit {
    /// Reads raw draws as an edit that is valid on a list of `len` nodes.
    fn fit(kind: u8, a: usize, b: usize, len: usize, value: f64) -> Self {
        if len == 0 || kind % 3 == 0 {
            return Edit::Insert { index: a % (len + 1), value };
        }
        if kind % 3 == 1 {
            let index = a % len;
            let count = 1 + (b % (len - index)) as u32;
            return Edit::Remove { index, count };
        }
        Edit::Move { source: a % len, destination: b % len }
    }

    fn apply_to_len(&self, len: usize) -> usize {
        match self {
            Edit::Insert { .. } => len + 1,
            Edit::Remove { count, .. } => len - *count as usize,
            Edit::Move { .. } => len,
        }
    }

    fn build(&self, family: &ChangeFamily) -> ModularChangeset {
        let mut builder = ModularEditBuilder::new(family, &SequenceKinds);
        match self {
            Edit::Insert { index, value } => builder
                .sequence_field(FieldUpPath::root())
                .insert(*index, TreeChunk::from_map_trees(&[number(*value)])),
            Edit::Remove { index, count } => {
                builder.sequence_field(FieldUpPath::root()).remove(*index, *count)
            }
            Edit::Move { source, destination } => builder.move_between(
                FieldUpPath::root(),
                *source,
                1,
                FieldUpPath::root(),
                *destination,
            ),
        }
        .unwrap();
        builder.finish().unwrap()
    }
}

fn revision(seq: u64) -> RevisionTag {
    RevisionTag::new(SessionId::from_u128(3), seq)
}

fn forest_with(content: &[MapTree]) -> Forest {
    let mut forest = Forest::new();
    if content.is_empty() {
        return forest;
    }
    let id = ChangeAtomId::new(None, 0);
    let mut delta = Root::default();
    delta.build.push(DetachedNodeBuild {
        id,
        trees: TreeChunk::from_map_trees(content),
    });
    delta.fields.insert(
        FieldKey::root(),
        FieldChanges {
            local: vec![Mark::attach(id, content.len() as u32)],
            ..FieldChanges::default()
        },
    );
    forest.apply_delta(&delta).unwrap();
    forest
}

fn apply(family: &ChangeFamily, forest: &mut Forest, change: &ModularChangeset) {
    forest.apply_delta(&family.into_delta(change).unwrap()).unwrap();
}

fn initial(len: usize) -> Vec<MapTree> {
    (0..len).map(|i| number(i as f64)).collect()
}

/// Edits drawn so that each one is valid after the ones before it.
fn edit_sequence(len: usize, draws: &[(u8, usize, usize)]) -> Vec<Edit> {
    let mut len = len;
    let mut edits = Vec::with_capacity(draws.len());
    for (i, (kind, a, b)) in draws.iter().enumerate() {
        let edit = Edit::fit(*kind, *a, *b, len, 100.0 + i as f64);
        len = edit.apply_to_len(len);
        edits.push(edit);
    }
    edits
}

#[test]
fn remove_then_invert_restores_content() {
    let family = ChangeFamily::default();
    let content = initial(4);
    let mut forest = forest_with(&content);

    let change = family
        .tag(&TaggedChange::new(
            Some(revision(1)),
            Edit::Remove { index: 1, count: 2 }.build(&family),
        ))
        .unwrap();
    apply(&family, &mut forest, &change);
    assert_eq!(forest.content(), vec![number(0.0), number(3.0)]);

    let inverse = family
        .invert(&TaggedChange::new(Some(revision(1)), change), false, Some(revision(2)))
        .unwrap();
    apply(&family, &mut forest, &inverse);
    assert_eq!(forest.content(), content);
}

#[test]
fn concurrent_inserts_order_by_sequencing() {
    let family = ChangeFamily::default();
    let first = Edit::Insert { index: 1, value: 10.0 }.build(&family);
    let second = Edit::Insert { index: 1, value: 20.0 }.build(&family);
    let metadata = RevisionMetadata::new().with(revision(1), 1).with(revision(2), 2);
    let first = TaggedChange::new(Some(revision(1)), first);
    let second = TaggedChange::new(Some(revision(2)), second);

    let rebased = family.rebase(&second, &first, &metadata).unwrap();
    let mut forest = forest_with(&initial(2));
    apply(&family, &mut forest, &family.tag(&first).unwrap());
    apply(&family, &mut forest, &rebased);
    assert_eq!(
        forest.content(),
        vec![number(0.0), number(10.0), number(20.0), number(1.0)]
    );
}

proptest! {
    #[test]
    fn invert_cancels(
        len in 0usize..6,
        draw in (any::<u8>(), 0usize..16, 0usize..16),
    ) {
        let family = ChangeFamily::default();
        let content = initial(len);
        let edit = edit_sequence(len, &[draw]).remove(0);
        let change = family
            .tag(&TaggedChange::new(Some(revision(1)), edit.build(&family)))
            .unwrap();

        let mut forest = forest_with(&content);
        apply(&family, &mut forest, &change);
        let inverse = family
            .invert(&TaggedChange::new(Some(revision(1)), change), false, Some(revision(2)))
            .unwrap();
        apply(&family, &mut forest, &inverse);
        prop_assert_eq!(forest.content(), content);
    }

    #[test]
    fn compose_is_associative(
        len in 0usize..5,
        draws in prop::collection::vec((any::<u8>(), 0usize..16, 0usize..16), 3),
    ) {
        let family = ChangeFamily::default();
        let metadata = RevisionMetadata::new();
        let content = initial(len);
        let changes: Vec<TaggedChange> = edit_sequence(len, &draws)
            .iter()
            .enumerate()
            .map(|(i, edit)| TaggedChange::new(Some(revision(i as u64 + 1)), edit.build(&family)))
            .collect();

        let mut sequential = forest_with(&content);
        for change in &changes {
            apply(&family, &mut sequential, &family.tag(change).unwrap());
        }

        let ab = family.compose(&changes[..2], &metadata).unwrap();
        let left = family
            .compose(&[TaggedChange::untagged(ab), changes[2].clone()], &metadata)
            .unwrap();
        let bc = family.compose(&changes[1..], &metadata).unwrap();
        let right = family
            .compose(&[changes[0].clone(), TaggedChange::untagged(bc)], &metadata)
            .unwrap();

        let mut left_forest = forest_with(&content);
        apply(&family, &mut left_forest, &left);
        let mut right_forest = forest_with(&content);
        apply(&family, &mut right_forest, &right);

        prop_assert_eq!(left_forest.content(), sequential.content());
        prop_assert_eq!(right_forest.content(), sequential.content());
    }
}
