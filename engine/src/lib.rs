//! # Evolu Engine
//!
//! The core of a local-first synchronizing database: applications declare a
//! tabular schema, every write becomes a causally ordered encrypted CRDT
//! message on top of a relational store, and replicas holding the same key
//! material converge to the same state. No server is authoritative.
//!
//! ## Design Principles
//!
//! - **Deterministic**: identities, timestamps, and merge results depend
//!   only on inputs; clock and randomness are injected seams.
//! - **Column-grain LWW**: a change decomposes into one message per
//!   `(row, column, value)`, totally ordered by a hybrid logical clock.
//! - **Storage behind a trait**: the engine speaks parameterized SQL through
//!   [`Storage`]; [`SqliteStorage`] is the bundled adapter.
//! - **End-to-end encrypted**: relays see owner ids and ciphertext only.
//!
//! ## Core Concepts
//!
//! ### Owners
//!
//! An [`Owner`] is derived from a 32-byte secret (or BIP-39 mnemonic) via
//! SLIP-21: a public id, a symmetric encryption key, and a rotatable write
//! key. Shard, shared, and read-only flavors partition and share data.
//!
//! ### Timestamps and the Merkle summary
//!
//! [`Timestamp`] implements a hybrid logical clock whose 16-byte encoding
//! orders bytewise. [`MerkleTree`] summarizes all known timestamps so two
//! replicas can locate their earliest divergent minute in logarithmic time.
//!
//! ### The engine
//!
//! [`Db`] applies local [`Change`]s and remote [`CrdtMessage`]s inside
//! exclusive storage transactions, maintains the `evolu_history` log, and
//! serves reads with row-level [`Patch`] diffs for reactive consumers.
//!
//! ## Quick Start
//!
//! ```rust
//! use std::collections::BTreeMap;
//! use evolu_engine::{
//!     validate_mutation, Config, Db, DbDeps, DbSchema, MutationKind, Query,
//!     SqliteStorage, Value,
//! };
//!
//! let schema = DbSchema::new().with_table("todo", ["title"]);
//! let mut db = Db::init(
//!     SqliteStorage::open_in_memory().unwrap(),
//!     schema.clone(),
//!     Config::default(),
//!     DbDeps::default(),
//! )
//! .unwrap();
//!
//! let change = validate_mutation(
//!     &schema,
//!     MutationKind::Insert,
//!     "todo",
//!     None,
//!     BTreeMap::from([("title".to_string(), Value::from("hi"))]),
//!     None,
//!     &evolu_engine::SystemRandom,
//! )
//! .unwrap();
//! db.mutate(vec![change]).unwrap();
//!
//! let rows = db.query(&Query::new("SELECT \"title\" FROM \"todo\"")).unwrap();
//! assert_eq!(rows[0].get("title"), Some(&Value::Text("hi".into())));
//! ```

pub mod config;
pub mod crypto;
pub mod db;
pub mod diff;
pub mod error;
pub mod merkle;
pub mod owner;
pub mod protocol;
pub mod query;
pub mod random;
pub mod schema;
pub mod storage;
pub mod time;
pub mod timestamp;
pub mod value;

// Re-export main types at crate root
pub use config::{Config, InitialData, InitialDataBuilder, DEFAULT_DISPOSAL_DELAY_MILLIS};
pub use db::{CrdtMessage, Db, DbDeps, MutateOutcome, QueryPatches};
pub use diff::{apply_patches, make_patches, Patch};
pub use error::{Error, Result, TimestampError};
pub use merkle::{MerkleTree, Minute, MINUTE_MILLIS};
pub use owner::{
    AppOwner, EncryptionKey, Owner, OwnerId, OwnerSecret, PathComponent, ShardOwner, SharedOwner,
    SharedReadonlyOwner, WriteKey,
};
pub use protocol::{
    decode_envelope, encode_envelope, open_envelope_records, Envelope, OpenedRecords, Usage,
    PROTOCOL_VERSION,
};
pub use query::{
    deserialize_query, serialize_query, Query, QueryOptions, QueryRowsCache, QuerySerial,
    SubscribedQueries,
};
pub use random::{RandomSource, SeededRandom, SystemRandom};
pub use schema::{
    validate_mutation, Change, DbIndex, DbSchema, Id, MutationKind, MAX_MUTATION_SIZE_BYTES,
};
pub use storage::{ExecResult, SqlQuery, SqliteStorage, Storage, TransactionMode};
pub use time::{Clock, ManualClock, Millis, SystemClock};
pub use timestamp::{
    receive as receive_timestamp, send as send_timestamp, NodeId, Timestamp,
    DEFAULT_MAX_DRIFT_MILLIS, MAX_MILLIS, TIMESTAMP_LENGTH,
};
pub use value::{Row, Value};

/// Type aliases for clarity
pub type TableName = String;
pub type ColumnName = String;
