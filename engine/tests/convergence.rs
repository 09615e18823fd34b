//! End-to-end replica convergence tests.
//!
//! Two engines sharing an owner exchange messages through the wire codec,
//! driven by Merkle diffs, and must end up with byte-identical query results.

use std::collections::BTreeMap;
use std::sync::Arc;

use evolu_engine::{
    decode_envelope, encode_envelope, open_envelope_records, validate_mutation, Change, Config,
    Db, DbDeps, DbSchema, Id, ManualClock, MutationKind, Query, Row, SeededRandom, SqliteStorage,
    Value,
};

const MNEMONIC: &str = "abandon abandon abandon abandon abandon abandon \
     abandon abandon abandon abandon abandon about";

const BASE_MILLIS: u64 = 1_706_745_600_000; // 2024-02-01T00:00:00Z

struct Replica {
    db: Db<SqliteStorage>,
    clock: Arc<ManualClock>,
    random: Arc<SeededRandom>,
}

impl Replica {
    fn open(seed: u64) -> Self {
        let clock = Arc::new(ManualClock::new(BASE_MILLIS));
        let random = Arc::new(SeededRandom::new(seed));
        let db = Db::init_with_mnemonic(
            SqliteStorage::open_in_memory().unwrap(),
            schema(),
            Config::default(),
            DbDeps {
                clock: clock.clone(),
                random: random.clone(),
            },
            Some(MNEMONIC),
        )
        .unwrap();
        Self { db, clock, random }
    }

    fn insert(&mut self, table: &str, values: &[(&str, Value)]) -> Id {
        let change = validate_mutation(
            &schema(),
            MutationKind::Insert,
            table,
            None,
            values
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect::<BTreeMap<_, _>>(),
            None,
            &*self.random,
        )
        .unwrap();
        let id = change.id;
        self.db.mutate(vec![change]).unwrap();
        id
    }

    fn update(&mut self, table: &str, id: Id, values: &[(&str, Value)]) {
        let change = Change {
            table: table.to_string(),
            id,
            owner_id: None,
            values: values
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
        };
        self.db.mutate(vec![change]).unwrap();
    }

    fn rows(&self, sql: &str) -> Vec<Row> {
        self.db.query(&Query::new(sql)).unwrap().as_ref().clone()
    }
}

fn schema() -> DbSchema {
    DbSchema::new().with_table("todo", ["title", "isCompleted"])
}

/// Ship every message since the peers' Merkle divergence, both ways, through
/// the wire codec.
fn sync(a: &mut Replica, b: &mut Replica) {
    for round in 0.. {
        assert!(round < 5, "replicas failed to converge");

        let tree_a = a.db.merkle_tree().unwrap();
        let tree_b = b.db.merkle_tree().unwrap();
        let Some(minute) = tree_a.diff(&tree_b) else {
            return;
        };

        let to_b = transfer(a, minute);
        let to_a = transfer(b, minute);
        deliver(b, &to_b);
        deliver(a, &to_a);
    }
}

fn transfer(from: &Replica, minute: u64) -> Vec<u8> {
    let owner = from.db.app_owner().owner.clone();
    let messages = from.db.messages_since(minute).unwrap();
    encode_envelope(
        owner.id,
        owner.write_key,
        &messages,
        &owner.encryption_key,
        None,
        &*from.random,
    )
    .unwrap()
}

fn deliver(to: &mut Replica, bytes: &[u8]) {
    let envelope = decode_envelope(bytes).unwrap();
    let key = to.db.app_owner().owner.encryption_key.clone();
    let opened = open_envelope_records(&envelope, &key);
    assert!(opened.dropped.is_empty());
    to.db.receive(opened.messages).unwrap();
}

#[test]
fn shared_mnemonic_shares_identity() {
    let a = Replica::open(1);
    let b = Replica::open(2);
    assert_eq!(a.db.app_owner().owner.id, b.db.app_owner().owner.id);
    assert_eq!(
        a.db.app_owner().owner.encryption_key,
        b.db.app_owner().owner.encryption_key
    );
}

#[test]
fn insert_on_a_appears_on_b() {
    let mut a = Replica::open(1);
    let mut b = Replica::open(2);

    a.insert("todo", &[("title", Value::from("hi"))]);
    sync(&mut a, &mut b);

    let rows = b.rows("SELECT \"title\" FROM \"todo\"");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("title"), Some(&Value::Text("hi".into())));
}

#[test]
fn concurrent_inserts_converge_to_both_rows() {
    let mut a = Replica::open(1);
    let mut b = Replica::open(2);

    // Both replicas write at the same wall-clock instant.
    a.insert("todo", &[("title", Value::from("a"))]);
    b.insert("todo", &[("title", Value::from("b"))]);

    sync(&mut a, &mut b);

    let sql = "SELECT \"title\" FROM \"todo\" ORDER BY \"title\"";
    let rows_a = a.rows(sql);
    let rows_b = b.rows(sql);
    assert_eq!(rows_a.len(), 2);
    assert_eq!(rows_a, rows_b);
}

#[test]
fn concurrent_updates_resolve_to_the_greater_timestamp() {
    let mut a = Replica::open(1);
    let mut b = Replica::open(2);

    let id = a.insert("todo", &[("title", Value::from("start"))]);
    sync(&mut a, &mut b);

    // Same wall clock on both sides; the node id breaks the tie, so one
    // deterministic winner must emerge on both replicas.
    a.update("todo", id, &[("title", Value::from("from a"))]);
    b.update("todo", id, &[("title", Value::from("from b"))]);
    sync(&mut a, &mut b);

    let rows_a = a.rows("SELECT \"title\" FROM \"todo\"");
    let rows_b = b.rows("SELECT \"title\" FROM \"todo\"");
    assert_eq!(rows_a, rows_b);

    let winner = rows_a[0].get("title").unwrap().as_text().unwrap();
    assert!(winner == "from a" || winner == "from b");
}

#[test]
fn later_wall_clock_wins_a_cell() {
    let mut a = Replica::open(1);
    let mut b = Replica::open(2);

    let id = a.insert("todo", &[("title", Value::from("start"))]);
    sync(&mut a, &mut b);

    a.update("todo", id, &[("title", Value::from("early"))]);
    b.clock.advance(60_000);
    b.update("todo", id, &[("title", Value::from("late"))]);
    sync(&mut a, &mut b);

    for replica in [&a, &b] {
        let rows = replica.rows("SELECT \"title\" FROM \"todo\"");
        assert_eq!(rows[0].get("title"), Some(&Value::Text("late".into())));
    }
}

#[test]
fn deletes_replicate_as_tombstones() {
    let mut a = Replica::open(1);
    let mut b = Replica::open(2);

    let id = a.insert("todo", &[("title", Value::from("doomed"))]);
    sync(&mut a, &mut b);

    a.update("todo", id, &[("isDeleted", Value::from(true))]);
    sync(&mut a, &mut b);

    let rows = b.rows("SELECT \"title\" FROM \"todo\" WHERE \"isDeleted\" IS NOT 1");
    assert!(rows.is_empty());

    // The row itself survives as a tombstone.
    let all = b.rows("SELECT \"title\" FROM \"todo\"");
    assert_eq!(all.len(), 1);
}

#[test]
fn corrupt_record_is_dropped_and_the_rest_still_applies() {
    let mut a = Replica::open(1);
    let mut b = Replica::open(2);

    a.insert("todo", &[("title", Value::from("one"))]);
    a.insert("todo", &[("title", Value::from("two"))]);

    let bytes = transfer(&a, 0);
    let mut envelope = decode_envelope(&bytes).unwrap();
    let tail = envelope.sealed_records[0].len() - 1;
    envelope.sealed_records[0][tail] ^= 0xff;

    let key = b.db.app_owner().owner.encryption_key.clone();
    let opened = open_envelope_records(&envelope, &key);
    assert_eq!(opened.dropped.len(), 1);
    b.db.receive(opened.messages).unwrap();

    // One of the two titles made it; the engine kept running.
    let rows = b.rows("SELECT \"title\" FROM \"todo\"");
    assert_eq!(rows.len(), 1);

    // A later full sync repairs the gap.
    sync(&mut a, &mut b);
    let rows = b.rows("SELECT \"title\" FROM \"todo\" ORDER BY \"title\"");
    assert_eq!(rows.len(), 2);
}

#[test]
fn three_replicas_converge_pairwise() {
    let mut a = Replica::open(1);
    let mut b = Replica::open(2);
    let mut c = Replica::open(3);

    a.insert("todo", &[("title", Value::from("from a"))]);
    b.insert("todo", &[("title", Value::from("from b"))]);
    c.insert("todo", &[("title", Value::from("from c"))]);

    sync(&mut a, &mut b);
    sync(&mut b, &mut c);
    sync(&mut a, &mut c);
    sync(&mut a, &mut b);

    let sql = "SELECT \"title\", \"id\" FROM \"todo\" ORDER BY \"id\"";
    let rows_a = a.rows(sql);
    assert_eq!(rows_a.len(), 3);
    assert_eq!(rows_a, b.rows(sql));
    assert_eq!(rows_a, c.rows(sql));
}
