//! Storage engine adapter.
//!
//! The CRDT engine consumes a relational store only through the [`Storage`]
//! trait: parameterized SQL execution, explicit transactions, and a snapshot
//! export. [`SqliteStorage`] is the concrete adapter over rusqlite.

use rusqlite::types::ValueRef;
use rusqlite::Connection;

use crate::error::{Error, Result};
use crate::value::{Row, Value};

/// Transaction flavors.
///
/// Mutations run `Exclusive`; reads run `Shared` and do not block each
/// other. `Last` marks the final transaction before engine shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionMode {
    Shared,
    Exclusive,
    Last,
}

/// A parameterized SQL statement.
#[derive(Debug, Clone, PartialEq)]
pub struct SqlQuery {
    pub sql: String,
    pub parameters: Vec<Value>,
}

impl SqlQuery {
    /// A statement without parameters.
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            parameters: Vec::new(),
        }
    }

    /// A statement with parameters.
    pub fn with_params(sql: impl Into<String>, parameters: Vec<Value>) -> Self {
        Self {
            sql: sql.into(),
            parameters,
        }
    }
}

/// Result of executing one statement.
#[derive(Debug, Clone, Default)]
pub struct ExecResult {
    /// Result rows, empty for statements that return none.
    pub rows: Vec<Row>,
    /// Affected row count for write statements.
    pub changes: usize,
}

/// The contract the engine requires from the relational store.
pub trait Storage {
    /// Execute one parameterized statement.
    fn exec(&self, query: &SqlQuery) -> Result<ExecResult>;

    /// Open a transaction. Nesting is not supported.
    fn begin(&self, mode: TransactionMode) -> Result<()>;

    /// Commit the open transaction.
    fn commit(&self) -> Result<()>;

    /// Roll the open transaction back.
    fn rollback(&self) -> Result<()>;

    /// Snapshot the whole database file.
    fn export(&self) -> Result<Vec<u8>>;
}

/// SQLite-backed storage.
pub struct SqliteStorage {
    conn: Connection,
}

impl SqliteStorage {
    /// Open (or create) a database file.
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        Ok(Self { conn })
    }

    /// Open an in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(Self { conn })
    }
}

fn bind_value(value: &Value) -> rusqlite::types::Value {
    match value {
        Value::Null => rusqlite::types::Value::Null,
        Value::Integer(i) => rusqlite::types::Value::Integer(*i),
        Value::Real(f) => rusqlite::types::Value::Real(*f),
        Value::Text(s) => rusqlite::types::Value::Text(s.clone()),
        Value::Blob(b) => rusqlite::types::Value::Blob(b.clone()),
        // Json never reaches storage from the engine; serialize defensively.
        Value::Json(v) => rusqlite::types::Value::Text(v.to_string()),
    }
}

fn read_value(value: ValueRef<'_>) -> Result<Value> {
    Ok(match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::Integer(i),
        ValueRef::Real(f) => Value::Real(f),
        ValueRef::Text(bytes) => Value::Text(
            std::str::from_utf8(bytes)
                .map_err(|e| Error::Sqlite(e.to_string()))?
                .to_string(),
        ),
        ValueRef::Blob(bytes) => Value::Blob(bytes.to_vec()),
    })
}

impl Storage for SqliteStorage {
    fn exec(&self, query: &SqlQuery) -> Result<ExecResult> {
        let mut stmt = self.conn.prepare_cached(&query.sql)?;
        let params = rusqlite::params_from_iter(query.parameters.iter().map(bind_value));

        if stmt.column_count() == 0 {
            let changes = stmt.execute(params)?;
            return Ok(ExecResult {
                rows: Vec::new(),
                changes,
            });
        }

        let columns: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();
        let mut rows = stmt.query(params)?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let mut values = Row::new();
            for (i, column) in columns.iter().enumerate() {
                values.push(column.clone(), read_value(row.get_ref(i)?)?);
            }
            out.push(values);
        }

        Ok(ExecResult {
            rows: out,
            changes: 0,
        })
    }

    fn begin(&self, mode: TransactionMode) -> Result<()> {
        let sql = match mode {
            TransactionMode::Shared => "BEGIN",
            TransactionMode::Exclusive | TransactionMode::Last => "BEGIN IMMEDIATE",
        };
        self.conn.execute_batch(sql)?;
        Ok(())
    }

    fn commit(&self) -> Result<()> {
        self.conn.execute_batch("COMMIT")?;
        Ok(())
    }

    fn rollback(&self) -> Result<()> {
        self.conn.execute_batch("ROLLBACK")?;
        Ok(())
    }

    fn export(&self) -> Result<Vec<u8>> {
        let dir = tempfile::tempdir().map_err(|e| Error::Sqlite(e.to_string()))?;
        let path = dir.path().join("export.db");
        let path_str = path
            .to_str()
            .ok_or_else(|| Error::Sqlite("non-utf8 temp path".into()))?;

        self.conn
            .execute("VACUUM INTO ?1", rusqlite::params![path_str])?;
        std::fs::read(&path).map_err(|e| Error::Sqlite(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn storage_with_table() -> SqliteStorage {
        let storage = SqliteStorage::open_in_memory().unwrap();
        storage
            .exec(&SqlQuery::new(
                "CREATE TABLE t (\"id\" TEXT PRIMARY KEY, \"n\" ANY, \"data\" ANY) STRICT",
            ))
            .unwrap();
        storage
    }

    #[test]
    fn exec_reports_changes_for_writes() {
        let storage = storage_with_table();
        let result = storage
            .exec(&SqlQuery::with_params(
                "INSERT INTO t VALUES (?, ?, ?)",
                vec![
                    Value::from("a"),
                    Value::Integer(1),
                    Value::Blob(vec![1, 2, 3]),
                ],
            ))
            .unwrap();
        assert_eq!(result.changes, 1);
        assert!(result.rows.is_empty());
    }

    #[test]
    fn exec_returns_typed_rows() {
        let storage = storage_with_table();
        storage
            .exec(&SqlQuery::with_params(
                "INSERT INTO t VALUES (?, ?, ?)",
                vec![Value::from("a"), Value::Real(1.5), Value::Null],
            ))
            .unwrap();

        let result = storage
            .exec(&SqlQuery::new("SELECT \"id\", \"n\", \"data\" FROM t"))
            .unwrap();
        assert_eq!(result.rows.len(), 1);

        let row = &result.rows[0];
        assert_eq!(row.get("id"), Some(&Value::Text("a".into())));
        assert_eq!(row.get("n"), Some(&Value::Real(1.5)));
        assert_eq!(row.get("data"), Some(&Value::Null));
    }

    #[test]
    fn rollback_discards_writes() {
        let storage = storage_with_table();

        storage.begin(TransactionMode::Exclusive).unwrap();
        storage
            .exec(&SqlQuery::with_params(
                "INSERT INTO t (\"id\") VALUES (?)",
                vec![Value::from("a")],
            ))
            .unwrap();
        storage.rollback().unwrap();

        let result = storage
            .exec(&SqlQuery::new("SELECT count(*) AS c FROM t"))
            .unwrap();
        assert_eq!(result.rows[0].get("c"), Some(&Value::Integer(0)));
    }

    #[test]
    fn commit_keeps_writes() {
        let storage = storage_with_table();

        storage.begin(TransactionMode::Exclusive).unwrap();
        storage
            .exec(&SqlQuery::with_params(
                "INSERT INTO t (\"id\") VALUES (?)",
                vec![Value::from("a")],
            ))
            .unwrap();
        storage.commit().unwrap();

        let result = storage
            .exec(&SqlQuery::new("SELECT count(*) AS c FROM t"))
            .unwrap();
        assert_eq!(result.rows[0].get("c"), Some(&Value::Integer(1)));
    }

    #[test]
    fn export_produces_a_sqlite_image() {
        let storage = storage_with_table();
        storage
            .exec(&SqlQuery::with_params(
                "INSERT INTO t (\"id\") VALUES (?)",
                vec![Value::from("a")],
            ))
            .unwrap();

        let bytes = storage.export().unwrap();
        assert!(bytes.starts_with(b"SQLite format 3\0"));
    }

    #[test]
    fn sql_errors_are_surfaced() {
        let storage = storage_with_table();
        let result = storage.exec(&SqlQuery::new("SELECT nope FROM missing"));
        assert!(matches!(result, Err(Error::Sqlite(_))));
    }
}
