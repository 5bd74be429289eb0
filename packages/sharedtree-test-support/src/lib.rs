//! Shared fixtures for SharedTree core tests.

use std::collections::VecDeque;

use sharedtree_core::change::field_kind::{OPTIONAL, SEQUENCE, VALUE};
use sharedtree_core::{
    AllowIncompatible, Checkout, Commit, CoreConfig, FieldSchema, MapTree, ModularEditBuilder,
    NodeSchema, Result, SessionId, StoredSchema, ValueSchema,
};
use tracing_subscriber::EnvFilter;

/// Installs a test-friendly subscriber once; later calls are no-ops.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("sharedtree_core=info".parse().unwrap()),
        )
        .with_test_writer()
        .try_init();
}

pub const NUMBER: &str = "test.number";
pub const STRING: &str = "test.string";
pub const FOLDER: &str = "test.folder";

pub fn number(value: f64) -> MapTree {
    MapTree::leaf(NUMBER, value)
}

pub fn string(value: &str) -> MapTree {
    MapTree::leaf(STRING, value)
}

/// A folder with a required name and a sequence of child folders.
pub fn folder(name: &str, children: Vec<MapTree>) -> MapTree {
    MapTree::new(FOLDER)
        .with_field("name", vec![string(name)])
        .with_field("children", children)
}

/// Root: a sequence of numbers.
pub fn number_list_schema() -> StoredSchema {
    StoredSchema::new(FieldSchema::new(&SEQUENCE, [NUMBER]))
        .with_node(NUMBER, NodeSchema::Leaf { value: ValueSchema::Number })
}

/// Root: an optional folder; folders nest.
pub fn folder_schema() -> StoredSchema {
    StoredSchema::new(FieldSchema::new(&OPTIONAL, [FOLDER]))
        .with_node(STRING, NodeSchema::Leaf { value: ValueSchema::String })
        .with_node(
            FOLDER,
            NodeSchema::Object {
                fields: [
                    ("name".into(), FieldSchema::new(&VALUE, [STRING])),
                    ("children".into(), FieldSchema::new(&SEQUENCE, [FOLDER])),
                ]
                .into_iter()
                .collect(),
            },
        )
}

/// Replicas of one document and an in-order sequencing service between them.
///
/// Edits queue up until delivered, so anything submitted before a delivery is concurrent
/// with everything else in the queue.
pub struct Harness {
    pub replicas: Vec<Checkout>,
    pending: VecDeque<(Commit, u64)>,
    seq: u64,
}

impl Harness {
    pub fn new(replicas: usize, schema: StoredSchema, content: &[MapTree]) -> Result<Self> {
        let mut harness = Self {
            replicas: (0..replicas)
                .map(|i| Checkout::new(SessionId::from_u128(i as u128 + 1), CoreConfig::default()))
                .collect(),
            pending: VecDeque::new(),
            seq: 0,
        };
        // Empty replicas hold no content the schema could invalidate.
        for replica in harness.replicas.iter_mut().skip(1) {
            replica.update_schema(schema.clone(), AllowIncompatible::Yes)?;
        }
        let commit = harness.replicas[0].initialize(content, schema)?;
        harness.pending.push_back((commit, 0));
        harness.deliver_all()?;
        Ok(harness)
    }

    /// Applies an edit on one replica and queues it for sequencing.
    pub fn edit<F>(&mut self, replica: usize, edit: F) -> Result<Commit>
    where
        F: FnOnce(&mut ModularEditBuilder<'_>) -> Result<()>,
    {
        let checkout = &mut self.replicas[replica];
        let ref_seq = checkout.edit_manager().head_seq();
        let commit = checkout.edit(edit)?;
        self.pending.push_back((commit.clone(), ref_seq));
        Ok(commit)
    }

    /// Sequences the oldest queued commit and delivers it to every replica.
    pub fn deliver_one(&mut self) -> Result<bool> {
        let Some((commit, ref_seq)) = self.pending.pop_front() else {
            return Ok(false);
        };
        self.seq += 1;
        for replica in &mut self.replicas {
            replica.receive_sequenced(commit.clone(), self.seq, ref_seq)?;
        }
        Ok(true)
    }

    pub fn deliver_all(&mut self) -> Result<()> {
        while self.deliver_one()? {}
        Ok(())
    }

    pub fn contents(&self) -> Vec<Vec<MapTree>> {
        self.replicas.iter().map(Checkout::content).collect()
    }

    /// True when every replica holds the same document.
    pub fn converged(&self) -> bool {
        let contents = self.contents();
        contents.windows(2).all(|pair| pair[0] == pair[1])
    }
}
