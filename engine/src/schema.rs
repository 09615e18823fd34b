//! Database schema, mutation validation, and schema reconciliation planning.
//!
//! The host declares tables and columns as data. Every table carries the
//! implicit system columns and a `(ownerId, id)` primary key; application
//! columns are stored untyped (`ANY`) and validated above storage.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::owner::OwnerId;
use crate::random::RandomSource;
use crate::value::Value;
use crate::{ColumnName, TableName};

/// System columns present on every application table.
pub const COLUMN_ID: &str = "id";
pub const COLUMN_CREATED_AT: &str = "createdAt";
pub const COLUMN_UPDATED_AT: &str = "updatedAt";
pub const COLUMN_IS_DELETED: &str = "isDeleted";
pub const COLUMN_OWNER_ID: &str = "ownerId";

/// Columns writes may never target directly. `isDeleted` is writable (a
/// delete is just a write of `isDeleted = 1`).
const RESERVED_COLUMNS: [&str; 4] = [
    COLUMN_ID,
    COLUMN_CREATED_AT,
    COLUMN_UPDATED_AT,
    COLUMN_OWNER_ID,
];

/// Serialized size cap for one change; exceeding it rejects the whole batch.
pub const MAX_MUTATION_SIZE_BYTES: usize = 1_048_576;

/// A 16-byte row identifier, shown URL-safe base64 (22 chars).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Id(pub [u8; 16]);

impl Id {
    /// Allocate a fresh random id.
    pub fn generate(random: &dyn RandomSource) -> Self {
        let mut bytes = [0u8; 16];
        random.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Parse the 22-char text form.
    pub fn parse(s: &str) -> Result<Self> {
        let bytes = URL_SAFE_NO_PAD
            .decode(s)
            .map_err(|_| Error::InvalidId(s.to_string()))?;
        let bytes: [u8; 16] = bytes
            .try_into()
            .map_err(|_| Error::InvalidId(s.to_string()))?;
        Ok(Self(bytes))
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", URL_SAFE_NO_PAD.encode(self.0))
    }
}

impl Serialize for Id {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Id {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Id::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// An index managed by the engine: a name and its `CREATE INDEX` statement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbIndex {
    pub name: String,
    pub sql: String,
}

/// The declared shape of the database.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DbSchema {
    /// Application tables and their application columns (system columns are
    /// implicit and must not be listed).
    pub tables: BTreeMap<TableName, BTreeSet<ColumnName>>,
    /// Engine-managed indexes, in creation order.
    pub indexes: Vec<DbIndex>,
}

impl DbSchema {
    /// An empty schema.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style method to add a table.
    pub fn with_table(
        mut self,
        name: impl Into<TableName>,
        columns: impl IntoIterator<Item = &'static str>,
    ) -> Self {
        self.tables.insert(
            name.into(),
            columns.into_iter().map(String::from).collect(),
        );
        self
    }

    /// Builder-style method to add an index.
    pub fn with_index(mut self, name: impl Into<String>, sql: impl Into<String>) -> Self {
        self.indexes.push(DbIndex {
            name: name.into(),
            sql: sql.into(),
        });
        self
    }

    /// Whether the schema declares `table.column`.
    pub fn has_column(&self, table: &str, column: &str) -> bool {
        self.tables
            .get(table)
            .is_some_and(|columns| columns.contains(column))
    }
}

/// A validated write at the row grain.
///
/// `owner_id` is `None` for the app owner; the engine fills it in. A change
/// decomposes into one CRDT message per column on commit.
#[derive(Debug, Clone, PartialEq)]
pub struct Change {
    pub table: TableName,
    pub id: Id,
    pub owner_id: Option<OwnerId>,
    pub values: BTreeMap<ColumnName, Value>,
}

/// The three mutation flavors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationKind {
    /// New row; the engine allocates the id.
    Insert,
    /// Existing row; the caller supplies the id.
    Update,
    /// Insert-or-update with a caller-supplied (often deterministic) id.
    Upsert,
}

/// Validate a mutation against the schema and produce a [`Change`].
///
/// Checks, in order: the table exists, the change writes at least one
/// column, no reserved column is targeted, every column is declared, and the
/// serialized size is within bounds. Update and upsert require an id; insert
/// allocates one.
pub fn validate_mutation(
    schema: &DbSchema,
    kind: MutationKind,
    table: &str,
    id: Option<Id>,
    values: BTreeMap<ColumnName, Value>,
    owner_id: Option<OwnerId>,
    random: &dyn RandomSource,
) -> Result<Change> {
    let columns = schema
        .tables
        .get(table)
        .ok_or_else(|| Error::TableNotFound(table.to_string()))?;

    // A change decomposes into one message per column; zero columns would
    // allocate an id that no write ever materializes.
    if values.is_empty() {
        return Err(Error::EmptyMutation(table.to_string()));
    }

    for column in values.keys() {
        if RESERVED_COLUMNS.contains(&column.as_str()) {
            return Err(Error::ReservedColumn(column.clone()));
        }
        if column != COLUMN_IS_DELETED && !columns.contains(column) {
            return Err(Error::ColumnNotFound {
                table: table.to_string(),
                column: column.clone(),
            });
        }
    }

    let id = match kind {
        MutationKind::Insert => Id::generate(random),
        MutationKind::Update | MutationKind::Upsert => {
            id.ok_or_else(|| Error::InvalidId(format!("{kind:?} requires an id")))?
        }
    };

    let change = Change {
        table: table.to_string(),
        id,
        owner_id,
        values,
    };

    let size = change_size(&change);
    if size > MAX_MUTATION_SIZE_BYTES {
        return Err(Error::InvalidMutationSize {
            size,
            limit: MAX_MUTATION_SIZE_BYTES,
        });
    }

    Ok(change)
}

/// Serialized size of a change, for the mutation size cap.
fn change_size(change: &Change) -> usize {
    change.table.len()
        + 22
        + change
            .values
            .iter()
            .map(|(column, value)| column.len() + value.byte_size())
            .sum::<usize>()
}

/// Quote an identifier for SQL.
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// `CREATE TABLE` statement for an application table.
pub fn create_table_sql(table: &str, columns: &BTreeSet<ColumnName>) -> String {
    let mut sql = format!(
        "CREATE TABLE {} ({} TEXT NOT NULL, {} TEXT, {} TEXT, {} INTEGER, {} TEXT NOT NULL",
        quote_ident(table),
        quote_ident(COLUMN_ID),
        quote_ident(COLUMN_CREATED_AT),
        quote_ident(COLUMN_UPDATED_AT),
        quote_ident(COLUMN_IS_DELETED),
        quote_ident(COLUMN_OWNER_ID),
    );
    for column in columns {
        sql.push_str(&format!(", {} ANY", quote_ident(column)));
    }
    sql.push_str(&format!(
        ", PRIMARY KEY ({}, {})) WITHOUT ROWID, STRICT",
        quote_ident(COLUMN_OWNER_ID),
        quote_ident(COLUMN_ID),
    ));
    sql
}

/// Plan the statements that evolve `current` into `desired`.
///
/// Missing tables are created with the system columns; missing columns are
/// added as `ANY`; indexes present locally but absent from the desired set
/// are dropped, new ones are created. Only indexes visible to introspection
/// are considered — internal (`evolu_`-prefixed) and `sqlite_` indexes never
/// show up in `current` and are left untouched.
pub fn plan_schema_statements(current: &DbSchema, desired: &DbSchema) -> Vec<String> {
    let mut statements = Vec::new();

    for (table, columns) in &desired.tables {
        match current.tables.get(table) {
            None => statements.push(create_table_sql(table, columns)),
            Some(existing) => {
                for column in columns.difference(existing) {
                    statements.push(format!(
                        "ALTER TABLE {} ADD COLUMN {} ANY",
                        quote_ident(table),
                        quote_ident(column),
                    ));
                }
            }
        }
    }

    let desired_names: BTreeSet<&String> = desired.indexes.iter().map(|i| &i.name).collect();
    for index in &current.indexes {
        if !desired_names.contains(&index.name) {
            statements.push(format!("DROP INDEX {}", quote_ident(&index.name)));
        }
    }
    let current_names: BTreeSet<&String> = current.indexes.iter().map(|i| &i.name).collect();
    for index in &desired.indexes {
        if !current_names.contains(&index.name) {
            statements.push(index.sql.clone());
        }
    }

    statements
}
