use proptest::prelude::*;
use sharedtree_core::codec::{decode_chunks, encode_chunks, FieldBatchEncodingContext};
use sharedtree_core::schema::SchemaAndPolicy;
use sharedtree_core::{
    Checkout, CoreConfig, EncodedContent, EncodedFieldBatch, FieldUpPath, MapTree,
    SchemaPolicy, SessionId, TreeChunk, TreeCompressionStrategy, UpPath,
    Value,
};
use sharedtree_test_support::{folder, folder_schema, init_test_logging, string};

fn value() -> impl Strategy<Value = Value> {
    prop_oneof![
        (-1000i32..1000).prop_map(|n| Value::Number(f64::from(n) / 4.0)),
        "[a-z]{0,6}".prop_map(Value::String),
        any::<bool>().prop_map(Value::Boolean),
        Just(Value::Null),
    ]
}

fn tree() -> impl Strategy<Value = MapTree> {
    let leaf = (prop::sample::select(vec!["a", "b", "c"]), prop::option::of(value())).prop_map(
        |(node_type, value)| MapTree {
            value,
            ..MapTree::new(node_type)
        },
    );
    leaf.prop_recursive(4, 32, 3, |inner| {
        (
            prop::sample::select(vec!["p", "q"]),
            prop::option::of(value()),
            prop::collection::btree_map(
                prop::sample::select(vec!["x", "y", "z"]),
                prop::collection::vec(inner, 1..3),
                0..3,
            ),
        )
            .prop_map(|(node_type, value, fields)| {
                fields
                    .into_iter()
                    .fold(MapTree { value, ..MapTree::new(node_type) }, |node, (key, children)| {
                        node.with_field(key, children)
                    })
            })
    })
}

proptest! {
    #[test]
    fn uniform_encoding_roundtrips(
        fields in prop::collection::vec(prop::collection::vec(tree(), 0..4), 1..3),
    ) {
        let chunks: Vec<TreeChunk> = fields.iter().map(|f| TreeChunk::from_map_trees(f)).collect();
        let context = FieldBatchEncodingContext {
            strategy: TreeCompressionStrategy::Uncompressed,
            ..FieldBatchEncodingContext::default()
        };
        let encoded = encode_chunks(&chunks, &context).unwrap();
        let text = serde_json::to_string(&encoded).unwrap();
        let parsed: EncodedFieldBatch = serde_json::from_str(&text).unwrap();

        let decoded: Vec<Vec<MapTree>> = decode_chunks(&parsed, None)
            .unwrap()
            .iter()
            .map(TreeChunk::to_map_trees)
            .collect();
        prop_assert_eq!(decoded, fields);
    }
}

fn documents() -> Vec<MapTree> {
    vec![folder(
        "root",
        vec![
            folder("docs", vec![folder("drafts", vec![])]),
            folder("photos", vec![]),
            folder("docs", vec![]),
        ],
    )]
}

#[test]
fn schema_and_uniform_shapes_decode_alike() {
    let schema = folder_schema();
    let policy = SchemaPolicy::default();
    let chunks = [TreeChunk::from_map_trees(&documents())];

    let compressed = encode_chunks(
        &chunks,
        &FieldBatchEncodingContext {
            strategy: TreeCompressionStrategy::Compressed,
            schema: Some(SchemaAndPolicy::new(&schema, &policy)),
            compressor: None,
        },
    )
    .unwrap();
    let uniform = encode_chunks(
        &chunks,
        &FieldBatchEncodingContext {
            strategy: TreeCompressionStrategy::Uncompressed,
            ..FieldBatchEncodingContext::default()
        },
    )
    .unwrap();

    assert_ne!(compressed.shapes, uniform.shapes);
    for batch in [&compressed, &uniform] {
        let decoded = decode_chunks(batch, None).unwrap();
        assert_eq!(decoded[0].to_map_trees(), documents());
    }
}

#[test]
fn out_of_schema_content_falls_back_to_uniform_shapes() {
    let schema = folder_schema();
    let policy = SchemaPolicy::default();
    let stray = vec![string("not a folder")];
    let encoded = encode_chunks(
        &[TreeChunk::from_map_trees(&stray)],
        &FieldBatchEncodingContext {
            strategy: TreeCompressionStrategy::Compressed,
            schema: Some(SchemaAndPolicy::new(&schema, &policy)),
            compressor: None,
        },
    )
    .unwrap();
    assert_eq!(decode_chunks(&encoded, None).unwrap()[0].to_map_trees(), stray);
}

fn persisted(config: CoreConfig) -> (Checkout, EncodedContent) {
    init_test_logging();
    let mut checkout = Checkout::new(SessionId::from_u128(1), config);
    let commit = checkout.initialize(&documents(), folder_schema()).unwrap();
    checkout.receive_sequenced(commit, 1, 0).unwrap();
    checkout
        .edit(|builder| {
            let root = UpPath::root(sharedtree_core::FieldKey::root(), 0);
            builder
                .sequence_field(FieldUpPath::new(Some(root), "children".into()))
                .remove(1, 1)
        })
        .unwrap();
    let encoded = checkout.encode_content().unwrap();
    (checkout, encoded)
}

#[test]
fn checkout_content_survives_save_and_load() {
    for strategy in [
        TreeCompressionStrategy::Compressed,
        TreeCompressionStrategy::Uncompressed,
    ] {
        let config = CoreConfig {
            tree_encoding: strategy,
            ..CoreConfig::default()
        };
        let (original, encoded) = persisted(config.clone());
        let text = serde_json::to_string(&encoded).unwrap();

        let mut loaded = Checkout::new(SessionId::from_u128(2), config);
        loaded
            .load_content(&serde_json::from_str(&text).unwrap())
            .unwrap();
        assert_eq!(loaded.content(), original.content(), "{strategy:?}");
        assert_eq!(loaded.schema(), original.schema());
        assert!(loaded.edit_manager().local_commits().is_empty());
    }
}

#[test]
fn loading_into_an_initialized_checkout_is_rejected() {
    let (mut checkout, encoded) = persisted(CoreConfig::default());
    assert_eq!(checkout.load_content(&encoded).unwrap_err().code(), "ST0006");
}

fn nested_folders(depth: usize) -> MapTree {
    (0..depth).fold(folder("leaf", vec![]), |child, i| {
        folder(&format!("level-{i}"), vec![child])
    })
}

#[test]
fn deep_documents_survive_save_and_load() {
    let chain = (0..320).fold(MapTree::leaf("n", 1.0), |child, _| {
        MapTree::new("o").with_field("c", vec![child])
    });
    let chunks = [TreeChunk::from_map_trees(std::slice::from_ref(&chain))];
    let encoded = encode_chunks(&chunks, &FieldBatchEncodingContext::default()).unwrap();
    assert_eq!(decode_chunks(&encoded, None).unwrap()[0].to_map_trees(), vec![chain]);

    for strategy in [
        TreeCompressionStrategy::Compressed,
        TreeCompressionStrategy::Uncompressed,
    ] {
        let config = CoreConfig {
            tree_encoding: strategy,
            ..CoreConfig::default()
        };
        let mut original = Checkout::new(SessionId::from_u128(1), config.clone());
        let commit = original
            .initialize(&[nested_folders(320)], folder_schema())
            .unwrap();
        original.receive_sequenced(commit, 1, 0).unwrap();
        let encoded = original.encode_content().unwrap();

        let mut loaded = Checkout::new(SessionId::from_u128(2), config);
        loaded.load_content(&encoded).unwrap();
        assert_eq!(loaded.content(), original.content(), "{strategy:?}");
    }
}
