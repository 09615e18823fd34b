//! The CRDT engine: local mutations, remote merges, queries.
//!
//! Every write becomes one message per `(row, column, value)`, stamped by
//! the hybrid logical clock, applied to the relational row, appended to the
//! `evolu_history` log, and folded into the Merkle summary — all inside one
//! exclusive storage transaction. Remote messages replay through the same
//! path guarded by a last-writer-wins probe against the history log.
//!
//! The HLC head and the Merkle tree are persisted in the owner row and are
//! read and written inside the same transaction as the messages they
//! describe; they are never cached across transactions.

use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};

use crate::config::{Config, InitialDataBuilder, InitialMutation};
use crate::diff::{make_patches, Patch};
use crate::error::{Error, Result};
use crate::merkle::{MerkleTree, Minute, MINUTE_MILLIS};
use crate::owner::{AppOwner, OwnerId, WriteKey};
use crate::query::{
    decode_json_columns, deserialize_query, JsonMarker, Query, QueryRowsCache, QuerySerial,
    SubscribedQueries,
};
use crate::random::{RandomSource, SystemRandom};
use crate::schema::{
    create_table_sql, plan_schema_statements, quote_ident, validate_mutation, Change, DbIndex,
    DbSchema, Id, COLUMN_IS_DELETED,
};
use crate::storage::{SqlQuery, Storage, TransactionMode};
use crate::time::{Clock, SystemClock};
use crate::timestamp::{receive as timestamp_receive, send as timestamp_send, Timestamp};
use crate::value::{Row, Value};
use crate::{ColumnName, TableName};

/// Internal table holding the owner identity, HLC head, and Merkle tree.
const OWNER_TABLE: &str = "evolu_owner";
/// Internal append-only message log.
const HISTORY_TABLE: &str = "evolu_history";

/// One CRDT message: a single column write with its total-order position.
#[derive(Debug, Clone, PartialEq)]
pub struct CrdtMessage {
    pub owner_id: OwnerId,
    pub table: TableName,
    pub id: Id,
    pub column: ColumnName,
    pub value: Value,
    pub timestamp: Timestamp,
}

/// Clock and randomness seams for the engine.
#[derive(Clone)]
pub struct DbDeps {
    pub clock: Arc<dyn Clock>,
    pub random: Arc<dyn RandomSource>,
}

impl Default for DbDeps {
    fn default() -> Self {
        Self {
            clock: Arc::new(SystemClock),
            random: Arc::new(SystemRandom),
        }
    }
}

/// Result of a local mutation: the messages to hand to the sync layer.
#[derive(Debug, Clone, Default)]
pub struct MutateOutcome {
    pub messages: Vec<CrdtMessage>,
}

/// Refreshed rows and the minimal patches against the previous snapshot.
#[derive(Debug, Clone)]
pub struct QueryPatches {
    pub serial: QuerySerial,
    pub patches: Vec<Patch>,
    pub rows: Arc<Vec<Row>>,
}

/// The engine over a storage adapter.
pub struct Db<S: Storage> {
    storage: S,
    schema: DbSchema,
    config: Config,
    clock: Arc<dyn Clock>,
    random: Arc<dyn RandomSource>,
    app_owner: AppOwner,
    json_marker: JsonMarker,
    cache: QueryRowsCache,
}

impl<S: Storage> Db<S> {
    /// Open the engine: idempotent bootstrap plus schema reconciliation.
    ///
    /// Empty storage gets a fresh [`AppOwner`] and the configured initial
    /// data; non-empty storage yields the persisted owner.
    pub fn init(storage: S, schema: DbSchema, config: Config, deps: DbDeps) -> Result<Self> {
        Self::init_with_mnemonic(storage, schema, config, deps, None)
    }

    /// Like [`Db::init`], but a fresh database derives its owner from the
    /// given mnemonic instead of generating one.
    pub fn init_with_mnemonic(
        storage: S,
        schema: DbSchema,
        config: Config,
        deps: DbDeps,
        mnemonic: Option<&str>,
    ) -> Result<Self> {
        let json_marker = JsonMarker::generate(&*deps.random);

        storage.begin(TransactionMode::Exclusive)?;
        let bootstrap = (|| {
            create_internal_tables(&storage)?;
            match read_owner_row(&storage)? {
                Some(owner) => Ok((owner, false)),
                None => {
                    let owner = match mnemonic {
                        Some(words) => AppOwner::from_mnemonic(words)?,
                        None => AppOwner::generate(&*deps.random),
                    };
                    let head = Timestamp::generate(&*deps.random);
                    write_owner_row(&storage, &owner, &head, &MerkleTree::new(), &*deps.clock)?;
                    Ok((owner, true))
                }
            }
        })();
        let (app_owner, fresh) = finish_txn(&storage, bootstrap)?;

        let mut db = Self {
            storage,
            schema,
            config,
            clock: deps.clock,
            random: deps.random,
            app_owner,
            json_marker,
            cache: QueryRowsCache::new(),
        };

        db.reconcile_schema()?;

        if fresh {
            if let Some(initial_data) = db.config.initial_data.clone() {
                let mut builder = InitialDataBuilder::default();
                initial_data(&mut builder);
                let changes = db.validate_initial(builder.into_mutations())?;
                if !changes.is_empty() {
                    db.mutate(changes)?;
                }
            }
        }

        Ok(db)
    }

    /// The coordinating owner.
    pub fn app_owner(&self) -> &AppOwner {
        &self.app_owner
    }

    /// The schema the engine currently knows (declared plus received).
    pub fn schema(&self) -> &DbSchema {
        &self.schema
    }

    /// The per-session JSON marker for SQL helpers.
    pub fn json_marker(&self) -> &str {
        self.json_marker.as_str()
    }

    fn validate_initial(&self, mutations: Vec<InitialMutation>) -> Result<Vec<Change>> {
        mutations
            .into_iter()
            .map(|m| {
                validate_mutation(
                    &self.schema,
                    m.kind,
                    &m.table,
                    m.id,
                    m.values,
                    None,
                    &*self.random,
                )
            })
            .collect()
    }

    /// Compare the declared schema against storage and evolve storage.
    fn reconcile_schema(&mut self) -> Result<()> {
        self.storage.begin(TransactionMode::Exclusive)?;
        let result = (|| {
            let current = introspect_schema(&self.storage)?;
            let statements = plan_schema_statements(&current, &self.schema);
            for sql in &statements {
                self.storage.exec(&SqlQuery::new(sql.clone()))?;
            }
            if self.config.enable_logging && !statements.is_empty() {
                tracing::debug!(statements = statements.len(), "schema reconciled");
            }
            Ok(())
        })();
        finish_txn(&self.storage, result)
    }

    /// Apply validated changes in one exclusive transaction.
    ///
    /// Each `(row, column, value)` gets a fresh `send` timestamp; the row is
    /// upserted, the message logged, the Merkle tree updated, and the HLC
    /// head written back. Any failure rolls the whole batch back.
    pub fn mutate(&mut self, changes: Vec<Change>) -> Result<MutateOutcome> {
        self.storage.begin(TransactionMode::Exclusive)?;
        let result = self.mutate_in_txn(changes);
        finish_txn(&self.storage, result)
    }

    fn mutate_in_txn(&mut self, changes: Vec<Change>) -> Result<MutateOutcome> {
        let (mut head, mut merkle) = load_clock_state(&self.storage)?;
        let now = self.clock.now_millis();
        let mut messages = Vec::new();

        for change in changes {
            // The validator already refuses these; a hand-built change must
            // not slip through as a phantom row either.
            if change.values.is_empty() {
                return Err(Error::EmptyMutation(change.table));
            }
            let owner_id = change.owner_id.unwrap_or(self.app_owner.owner.id);

            let mut change_messages = Vec::with_capacity(change.values.len());
            for (column, value) in &change.values {
                head = timestamp_send(&head, now, self.config.max_drift_millis)?;
                change_messages.push(CrdtMessage {
                    owner_id,
                    table: change.table.clone(),
                    id: change.id,
                    column: column.clone(),
                    value: value.clone(),
                    timestamp: head,
                });
            }

            if let (Some(first), Some(last)) = (change_messages.first(), change_messages.last()) {
                self.upsert_change_row(
                    &change,
                    owner_id,
                    &change_messages,
                    first.timestamp,
                    last.timestamp,
                )?;
            }
            for message in &change_messages {
                insert_history(&self.storage, message)?;
                merkle.insert(&message.timestamp);
            }
            messages.extend(change_messages);
        }

        save_clock_state(&self.storage, &head, &merkle)?;

        if self.config.enable_logging {
            tracing::debug!(messages = messages.len(), "mutation committed");
        }

        Ok(MutateOutcome { messages })
    }

    fn upsert_change_row(
        &self,
        change: &Change,
        owner_id: OwnerId,
        messages: &[CrdtMessage],
        first: Timestamp,
        last: Timestamp,
    ) -> Result<()> {
        let mut columns = String::new();
        let mut placeholders = String::new();
        let mut updates = String::new();
        let mut parameters = vec![
            Value::Text(change.id.to_string()),
            Value::Text(owner_id.to_string()),
            Value::Text(iso_millis(first.millis)?),
            Value::Text(iso_millis(last.millis)?),
        ];
        for message in messages {
            let quoted = quote_ident(&message.column);
            columns.push_str(&format!(", {quoted}"));
            placeholders.push_str(", ?");
            updates.push_str(&format!(", {quoted} = excluded.{quoted}"));
            parameters.push(message.value.clone());
        }

        let sql = format!(
            "INSERT INTO {table} (\"id\", \"ownerId\", \"createdAt\", \"updatedAt\"{columns}) \
             VALUES (?, ?, ?, ?{placeholders}) \
             ON CONFLICT (\"ownerId\", \"id\") DO UPDATE SET \
             \"updatedAt\" = excluded.\"updatedAt\"{updates}",
            table = quote_ident(&change.table),
        );
        self.storage.exec(&SqlQuery::with_params(sql, parameters))?;
        Ok(())
    }

    /// Merge remote messages, in ascending timestamp order, with per-cell
    /// last-writer-wins. Unknown tables and columns are created on demand.
    pub fn receive(&mut self, mut messages: Vec<CrdtMessage>) -> Result<()> {
        messages.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));

        self.storage.begin(TransactionMode::Exclusive)?;
        let result = (|| {
            let (mut head, mut merkle) = load_clock_state(&self.storage)?;
            let now = self.clock.now_millis();

            for message in &messages {
                self.ensure_table_column(&message.table, &message.column)?;

                if !has_newer_history(&self.storage, message)? {
                    self.apply_message_row(message)?;
                }
                if insert_history(&self.storage, message)? {
                    merkle.insert(&message.timestamp);
                }
                head = timestamp_receive(
                    &head,
                    &message.timestamp,
                    now,
                    self.config.max_drift_millis,
                )?;
            }

            save_clock_state(&self.storage, &head, &merkle)?;
            if self.config.enable_logging {
                tracing::debug!(messages = messages.len(), "remote batch merged");
            }
            Ok(())
        })();
        finish_txn(&self.storage, result)
    }

    fn apply_message_row(&self, message: &CrdtMessage) -> Result<()> {
        let quoted = quote_ident(&message.column);
        let sql = format!(
            "INSERT INTO {table} (\"id\", \"ownerId\", \"createdAt\", \"updatedAt\", {quoted}) \
             VALUES (?, ?, ?, ?, ?) \
             ON CONFLICT (\"ownerId\", \"id\") DO UPDATE SET \
             {quoted} = excluded.{quoted}, \"updatedAt\" = excluded.\"updatedAt\"",
            table = quote_ident(&message.table),
        );
        let iso = iso_millis(message.timestamp.millis)?;
        self.storage.exec(&SqlQuery::with_params(
            sql,
            vec![
                Value::Text(message.id.to_string()),
                Value::Text(message.owner_id.to_string()),
                Value::Text(iso.clone()),
                Value::Text(iso),
                message.value.clone(),
            ],
        ))?;
        Ok(())
    }

    /// Create a table or column a remote message refers to but the local
    /// schema does not know yet.
    fn ensure_table_column(&mut self, table: &str, column: &str) -> Result<()> {
        if !self.schema.tables.contains_key(table) {
            let mut columns = std::collections::BTreeSet::new();
            if column != COLUMN_IS_DELETED {
                columns.insert(column.to_string());
            }
            self.storage
                .exec(&SqlQuery::new(create_table_sql(table, &columns)))?;
            self.schema.tables.insert(table.to_string(), columns);
            return Ok(());
        }

        if column != COLUMN_IS_DELETED && !self.schema.has_column(table, column) {
            self.storage.exec(&SqlQuery::new(format!(
                "ALTER TABLE {} ADD COLUMN {} ANY",
                quote_ident(table),
                quote_ident(column),
            )))?;
            if let Some(columns) = self.schema.tables.get_mut(table) {
                columns.insert(column.to_string());
            }
        }
        Ok(())
    }

    /// Execute a read query under a shared transaction and post-process
    /// JSON-marked columns.
    pub fn query(&self, query: &Query) -> Result<Arc<Vec<Row>>> {
        let started = self.clock.now_millis();

        self.storage.begin(TransactionMode::Shared)?;
        let result = (|| {
            self.storage
                .exec(&SqlQuery::with_params(
                    query.sql.clone(),
                    query.parameters.clone(),
                ))
                .map(|r| r.rows)
        })();
        let mut rows = finish_txn(&self.storage, result)?;

        decode_json_columns(&mut rows, &self.json_marker);

        if query.options.log_query_execution_time {
            tracing::debug!(
                elapsed_millis = self.clock.now_millis() - started,
                sql = %query.sql,
                "query executed"
            );
        }

        Ok(Arc::new(rows))
    }

    /// Execute a query and remember its snapshot in the rows cache.
    pub fn load_query(&mut self, query: &Query) -> Result<Arc<Vec<Row>>> {
        let rows = self.query(query)?;
        self.cache.set(query.serialize(), rows.clone());
        Ok(rows)
    }

    /// The cached snapshot for a query, if any.
    pub fn cached_rows(&self, serial: &str) -> Option<Arc<Vec<Row>>> {
        self.cache.get(serial)
    }

    /// Re-run the given queries and diff each against its cached snapshot.
    pub fn refresh_queries(&mut self, serials: &[QuerySerial]) -> Result<Vec<QueryPatches>> {
        let mut refreshed = Vec::with_capacity(serials.len());
        for serial in serials {
            let query = deserialize_query(serial)?;
            let rows = self.query(&query)?;
            let previous = self.cache.get(serial);
            let patches = make_patches(previous.as_deref().map(Vec::as_slice), &rows);
            self.cache.set(serial.clone(), rows.clone());
            if !patches.is_empty() || previous.is_none() {
                refreshed.push(QueryPatches {
                    serial: serial.clone(),
                    patches,
                    rows,
                });
            }
        }
        Ok(refreshed)
    }

    /// Evict cached snapshots nobody subscribes to anymore.
    pub fn release_unsubscribed(&mut self, subscriptions: &SubscribedQueries) {
        subscriptions.release_unsubscribed(&mut self.cache);
    }

    /// All messages from `minute` onward, for anti-entropy after a Merkle
    /// diff.
    pub fn messages_since(&self, minute: Minute) -> Result<Vec<CrdtMessage>> {
        let floor = Timestamp {
            millis: minute * MINUTE_MILLIS,
            counter: 0,
            node_id: crate::timestamp::NodeId([0; 8]),
        };
        let result = self.storage.exec(&SqlQuery::with_params(
            format!(
                "SELECT \"ownerId\", \"table\", \"id\", \"column\", \"value\", \"timestamp\" \
                 FROM {HISTORY_TABLE} WHERE \"timestamp\" >= ? ORDER BY \"timestamp\" ASC"
            ),
            vec![Value::Blob(floor.encode().to_vec())],
        ))?;

        result.rows.iter().map(history_row_to_message).collect()
    }

    /// The current Merkle summary.
    pub fn merkle_tree(&self) -> Result<MerkleTree> {
        let (_, merkle) = load_clock_state(&self.storage)?;
        Ok(merkle)
    }

    /// Replace the write key with a fresh one. A single durable write.
    pub fn rotate_write_key(&mut self) -> Result<WriteKey> {
        let new_key = WriteKey::generate(&*self.random);

        self.storage.begin(TransactionMode::Exclusive)?;
        let result = self.storage.exec(&SqlQuery::with_params(
            format!("UPDATE {OWNER_TABLE} SET \"writeKey\" = ?"),
            vec![Value::Blob(new_key.0.to_vec())],
        ));
        finish_txn(&self.storage, result)?;

        self.app_owner.owner.write_key = Some(new_key);
        Ok(new_key)
    }

    /// Drop every table. The host is expected to reload afterwards, so this
    /// runs as the storage's final transaction.
    pub fn reset(&mut self) -> Result<()> {
        self.wipe(TransactionMode::Last)
    }

    fn wipe(&mut self, mode: TransactionMode) -> Result<()> {
        self.storage.begin(mode)?;
        let result = (|| {
            let tables = self.storage.exec(&SqlQuery::new(
                "SELECT name FROM sqlite_master WHERE type = 'table' \
                 AND name NOT LIKE 'sqlite_%'",
            ))?;
            for row in &tables.rows {
                if let Some(Value::Text(name)) = row.get("name") {
                    self.storage
                        .exec(&SqlQuery::new(format!("DROP TABLE {}", quote_ident(name))))?;
                }
            }
            Ok(())
        })();
        finish_txn(&self.storage, result)?;

        self.cache = QueryRowsCache::new();
        Ok(())
    }

    /// Reset, then re-initialize from a mnemonic. Data returns via sync.
    ///
    /// The wipe runs as an ordinary exclusive transaction: re-initialization
    /// still follows on the same storage handle.
    pub fn restore(&mut self, mnemonic: &str) -> Result<()> {
        let owner = AppOwner::from_mnemonic(mnemonic)?;
        self.wipe(TransactionMode::Exclusive)?;

        self.storage.begin(TransactionMode::Exclusive)?;
        let result = (|| {
            create_internal_tables(&self.storage)?;
            let head = Timestamp::generate(&*self.random);
            write_owner_row(&self.storage, &owner, &head, &MerkleTree::new(), &*self.clock)
        })();
        finish_txn(&self.storage, result)?;

        self.app_owner = owner;
        let declared = self.config_schema();
        self.schema = declared;
        self.reconcile_schema()
    }

    fn config_schema(&self) -> DbSchema {
        DbSchema {
            tables: self.schema.tables.clone(),
            indexes: self.config.indexes.clone(),
        }
    }

    /// Snapshot the underlying database file.
    pub fn export(&self) -> Result<Vec<u8>> {
        self.storage.export()
    }
}

fn finish_txn<S: Storage, T>(storage: &S, result: Result<T>) -> Result<T> {
    match result {
        Ok(value) => {
            storage.commit()?;
            Ok(value)
        }
        Err(err) => {
            let _ = storage.rollback();
            Err(err)
        }
    }
}

fn create_internal_tables<S: Storage>(storage: &S) -> Result<()> {
    storage.exec(&SqlQuery::new(format!(
        "CREATE TABLE IF NOT EXISTS {OWNER_TABLE} (\
         \"id\" TEXT NOT NULL PRIMARY KEY, \
         \"mnemonic\" TEXT, \
         \"encryptionKey\" BLOB NOT NULL, \
         \"writeKey\" BLOB NOT NULL, \
         \"timestamp\" BLOB NOT NULL, \
         \"merkle\" TEXT NOT NULL, \
         \"createdAt\" TEXT NOT NULL) STRICT"
    )))?;
    storage.exec(&SqlQuery::new(format!(
        "CREATE TABLE IF NOT EXISTS {HISTORY_TABLE} (\
         \"ownerId\" TEXT NOT NULL, \
         \"table\" TEXT NOT NULL, \
         \"id\" TEXT NOT NULL, \
         \"column\" TEXT NOT NULL, \
         \"timestamp\" BLOB NOT NULL, \
         \"value\" ANY, \
         PRIMARY KEY (\"table\", \"id\", \"column\", \"timestamp\")) \
         WITHOUT ROWID, STRICT"
    )))?;
    storage.exec(&SqlQuery::new(format!(
        "CREATE INDEX IF NOT EXISTS \"evolu_history_timestamp\" \
         ON {HISTORY_TABLE} (\"timestamp\")"
    )))?;
    Ok(())
}

fn read_owner_row<S: Storage>(storage: &S) -> Result<Option<AppOwner>> {
    let result = storage.exec(&SqlQuery::new(format!(
        "SELECT \"mnemonic\" FROM {OWNER_TABLE} LIMIT 1"
    )))?;
    let Some(row) = result.rows.first() else {
        return Ok(None);
    };
    match row.get("mnemonic") {
        Some(Value::Text(mnemonic)) => Ok(Some(AppOwner::from_mnemonic(mnemonic)?)),
        _ => Err(Error::Unknown("owner row without mnemonic".into())),
    }
}

fn write_owner_row<S: Storage>(
    storage: &S,
    owner: &AppOwner,
    head: &Timestamp,
    merkle: &MerkleTree,
    clock: &dyn Clock,
) -> Result<()> {
    let write_key = owner
        .owner
        .write_key
        .ok_or_else(|| Error::Unknown("app owner must have a write key".into()))?;
    storage.exec(&SqlQuery::with_params(
        format!(
            "INSERT INTO {OWNER_TABLE} \
             (\"id\", \"mnemonic\", \"encryptionKey\", \"writeKey\", \"timestamp\", \"merkle\", \"createdAt\") \
             VALUES (?, ?, ?, ?, ?, ?, ?)"
        ),
        vec![
            Value::Text(owner.owner.id.to_string()),
            Value::Text(owner.mnemonic.clone()),
            Value::Blob(owner.owner.encryption_key.0.to_vec()),
            Value::Blob(write_key.0.to_vec()),
            Value::Blob(head.encode().to_vec()),
            Value::Text(serialize_merkle(merkle)?),
            Value::Text(iso_millis(clock.now_millis())?),
        ],
    ))?;
    Ok(())
}

fn load_clock_state<S: Storage>(storage: &S) -> Result<(Timestamp, MerkleTree)> {
    let result = storage.exec(&SqlQuery::new(format!(
        "SELECT \"timestamp\", \"merkle\" FROM {OWNER_TABLE} LIMIT 1"
    )))?;
    let row = result
        .rows
        .first()
        .ok_or_else(|| Error::Unknown("owner row missing".into()))?;

    let head = match row.get("timestamp") {
        Some(Value::Blob(bytes)) => Timestamp::decode(bytes)
            .ok_or_else(|| Error::Unknown("corrupt timestamp head".into()))?,
        _ => return Err(Error::Unknown("corrupt timestamp head".into())),
    };
    let merkle = match row.get("merkle") {
        Some(Value::Text(json)) => serde_json::from_str(json)
            .map_err(|e| Error::Unknown(format!("corrupt merkle tree: {e}")))?,
        _ => return Err(Error::Unknown("corrupt merkle tree".into())),
    };
    Ok((head, merkle))
}

fn save_clock_state<S: Storage>(
    storage: &S,
    head: &Timestamp,
    merkle: &MerkleTree,
) -> Result<()> {
    storage.exec(&SqlQuery::with_params(
        format!("UPDATE {OWNER_TABLE} SET \"timestamp\" = ?, \"merkle\" = ?"),
        vec![
            Value::Blob(head.encode().to_vec()),
            Value::Text(serialize_merkle(merkle)?),
        ],
    ))?;
    Ok(())
}

fn serialize_merkle(merkle: &MerkleTree) -> Result<String> {
    serde_json::to_string(merkle).map_err(|e| Error::Unknown(format!("merkle encode: {e}")))
}

fn has_newer_history<S: Storage>(storage: &S, message: &CrdtMessage) -> Result<bool> {
    let result = storage.exec(&SqlQuery::with_params(
        format!(
            "SELECT 1 AS present FROM {HISTORY_TABLE} \
             WHERE \"table\" = ? AND \"id\" = ? AND \"column\" = ? AND \"timestamp\" >= ? \
             LIMIT 1"
        ),
        vec![
            Value::Text(message.table.clone()),
            Value::Text(message.id.to_string()),
            Value::Text(message.column.clone()),
            Value::Blob(message.timestamp.encode().to_vec()),
        ],
    ))?;
    Ok(!result.rows.is_empty())
}

/// Append a message to the history log. Returns whether it was new.
fn insert_history<S: Storage>(storage: &S, message: &CrdtMessage) -> Result<bool> {
    let result = storage.exec(&SqlQuery::with_params(
        format!(
            "INSERT OR IGNORE INTO {HISTORY_TABLE} \
             (\"ownerId\", \"table\", \"id\", \"column\", \"timestamp\", \"value\") \
             VALUES (?, ?, ?, ?, ?, ?)"
        ),
        vec![
            Value::Text(message.owner_id.to_string()),
            Value::Text(message.table.clone()),
            Value::Text(message.id.to_string()),
            Value::Text(message.column.clone()),
            Value::Blob(message.timestamp.encode().to_vec()),
            message.value.clone(),
        ],
    ))?;
    Ok(result.changes == 1)
}

fn history_row_to_message(row: &Row) -> Result<CrdtMessage> {
    let text = |column: &str| -> Result<String> {
        match row.get(column) {
            Some(Value::Text(s)) => Ok(s.clone()),
            _ => Err(Error::Unknown(format!("corrupt history column {column}"))),
        }
    };
    let timestamp = match row.get("timestamp") {
        Some(Value::Blob(bytes)) => Timestamp::decode(bytes)
            .ok_or_else(|| Error::Unknown("corrupt history timestamp".into()))?,
        _ => return Err(Error::Unknown("corrupt history timestamp".into())),
    };
    Ok(CrdtMessage {
        owner_id: OwnerId::parse(&text("ownerId")?)?,
        table: text("table")?,
        id: Id::parse(&text("id")?)?,
        column: text("column")?,
        value: row.get("value").cloned().unwrap_or(Value::Null),
        timestamp,
    })
}

/// Introspect the application tables, columns, and indexes in storage.
fn introspect_schema<S: Storage>(storage: &S) -> Result<DbSchema> {
    let mut schema = DbSchema::new();

    let tables = storage.exec(&SqlQuery::new(
        "SELECT name FROM sqlite_master WHERE type = 'table' \
         AND name NOT LIKE 'sqlite_%' AND name NOT LIKE 'evolu_%' ORDER BY name",
    ))?;
    for row in &tables.rows {
        let Some(Value::Text(table)) = row.get("name") else {
            continue;
        };
        let columns = storage.exec(&SqlQuery::with_params(
            "SELECT name FROM pragma_table_info(?) ORDER BY name",
            vec![Value::Text(table.clone())],
        ))?;
        let app_columns = columns
            .rows
            .iter()
            .filter_map(|r| match r.get("name") {
                Some(Value::Text(name)) if !is_system_column(name) => Some(name.clone()),
                _ => None,
            })
            .collect();
        schema.tables.insert(table.clone(), app_columns);
    }

    let indexes = storage.exec(&SqlQuery::new(
        "SELECT name, sql FROM sqlite_master WHERE type = 'index' \
         AND name NOT LIKE 'sqlite_%' AND name NOT LIKE 'evolu_%' \
         AND sql IS NOT NULL ORDER BY name",
    ))?;
    for row in &indexes.rows {
        if let (Some(Value::Text(name)), Some(Value::Text(sql))) =
            (row.get("name"), row.get("sql"))
        {
            schema.indexes.push(DbIndex {
                name: name.clone(),
                sql: sql.clone(),
            });
        }
    }

    Ok(schema)
}

fn is_system_column(name: &str) -> bool {
    matches!(
        name,
        "id" | "createdAt" | "updatedAt" | "isDeleted" | "ownerId"
    )
}

/// RFC 3339 rendering of an HLC millisecond value.
fn iso_millis(millis: u64) -> Result<String> {
    DateTime::<Utc>::from_timestamp_millis(millis as i64)
        .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Millis, true))
        .ok_or_else(|| Error::Unknown(format!("millis {millis} outside calendar range")))
}
