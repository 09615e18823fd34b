//! Property tests for the encode/order/merge laws.

use proptest::prelude::*;

use evolu_engine::{
    apply_patches, make_patches, MerkleTree, NodeId, Row, Timestamp, Value, MAX_MILLIS,
};

fn arb_timestamp() -> impl Strategy<Value = Timestamp> {
    (0..=MAX_MILLIS, any::<u16>(), any::<[u8; 8]>()).prop_map(|(millis, counter, node)| {
        Timestamp {
            millis,
            counter,
            node_id: NodeId(node),
        }
    })
}

fn arb_value() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<i64>().prop_map(Value::Integer),
        any::<f64>().prop_filter("NaN breaks row equality", |f| !f.is_nan())
            .prop_map(Value::Real),
        ".{0,12}".prop_map(Value::Text),
        proptest::collection::vec(any::<u8>(), 0..16).prop_map(Value::Blob),
    ]
}

fn arb_row() -> impl Strategy<Value = Row> {
    proptest::collection::vec(("[a-z]{1,6}", arb_value()), 0..4)
        .prop_map(Row::from_pairs)
}

proptest! {
    #[test]
    fn timestamp_codec_roundtrips(t in arb_timestamp()) {
        prop_assert_eq!(Timestamp::decode(&t.encode()), Some(t));
    }

    #[test]
    fn timestamp_byte_order_matches_semantic_order(
        a in arb_timestamp(),
        b in arb_timestamp(),
    ) {
        prop_assert_eq!(a.encode().cmp(&b.encode()), a.cmp(&b));
    }

    #[test]
    fn merkle_insertion_is_commutative(
        mut stamps in proptest::collection::vec(arb_timestamp(), 1..24),
    ) {
        let mut forward = MerkleTree::new();
        for t in &stamps {
            forward.insert(t);
        }

        stamps.reverse();
        let mut backward = MerkleTree::new();
        for t in &stamps {
            backward.insert(t);
        }

        prop_assert_eq!(forward, backward);
    }

    #[test]
    fn merkle_diff_is_none_iff_equal_sets(
        stamps in proptest::collection::vec(arb_timestamp(), 1..16),
        extra in arb_timestamp(),
    ) {
        let mut a = MerkleTree::new();
        let mut b = MerkleTree::new();
        for t in &stamps {
            a.insert(t);
            b.insert(t);
        }
        prop_assert_eq!(a.diff(&b), None);

        if !stamps.contains(&extra) {
            b.insert(&extra);
            let diff = a.diff(&b).expect("sets differ");
            prop_assert!(diff <= extra.millis / 60_000);
        }
    }

    #[test]
    fn patches_from_nothing_rebuild_the_snapshot(
        rows in proptest::collection::vec(arb_row(), 0..6),
    ) {
        let patches = make_patches(None, &rows);
        prop_assert_eq!(apply_patches(&patches, &[]), rows);
    }

    #[test]
    fn patches_transform_prev_into_next(
        pair in proptest::collection::vec((arb_row(), arb_row()), 0..6),
    ) {
        // Same-length snapshots, pairwise independent rows.
        let prev: Vec<Row> = pair.iter().map(|(a, _)| a.clone()).collect();
        let next: Vec<Row> = pair.iter().map(|(_, b)| b.clone()).collect();

        let patches = make_patches(Some(&prev), &next);
        prop_assert_eq!(apply_patches(&patches, &prev), next);
    }

    #[test]
    fn patches_handle_length_changes(
        prev in proptest::collection::vec(arb_row(), 0..6),
        next in proptest::collection::vec(arb_row(), 0..6),
    ) {
        let patches = make_patches(Some(&prev), &next);
        prop_assert_eq!(apply_patches(&patches, &prev), next);
    }
}
