//! Query serialization, result post-processing, and caches.
//!
//! Queries are compiled SQL plus parameters. A canonical string form keys
//! deduplication: two queries are the same query iff their serialized forms
//! are byte-equal. Result rows may carry JSON emitted by SQL helpers; such
//! strings are prefixed with a per-session nonce and decoded after the query
//! returns.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::random::RandomSource;
use crate::value::{Row, Value};

/// Alphabet for the JSON marker nonce (URL-safe, like ids).
const NONCE_ALPHABET: &[u8] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789_-";

/// Length of the per-session JSON marker.
pub const JSON_MARKER_LENGTH: usize = 21;

/// Per-query execution options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryOptions {
    /// Log how long the storage call took.
    pub log_query_execution_time: bool,
}

/// A compiled, parameterized read query.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub sql: String,
    pub parameters: Vec<Value>,
    pub options: QueryOptions,
}

impl Query {
    /// A query without parameters.
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            parameters: Vec::new(),
            options: QueryOptions::default(),
        }
    }

    /// A query with parameters.
    pub fn with_params(sql: impl Into<String>, parameters: Vec<Value>) -> Self {
        Self {
            sql: sql.into(),
            parameters,
            options: QueryOptions::default(),
        }
    }

    /// The canonical string key for this query.
    pub fn serialize(&self) -> QuerySerial {
        serialize_query(self)
    }
}

/// The canonical string form of a query.
pub type QuerySerial = String;

fn encode_parameter(value: &Value) -> serde_json::Value {
    match value {
        Value::Null => serde_json::Value::Null,
        Value::Integer(i) => serde_json::json!(i),
        Value::Real(f) => serde_json::json!(f),
        Value::Text(s) => serde_json::json!(s),
        // Binary parameters get a hex marker object so they stay
        // distinguishable from text.
        Value::Blob(b) => serde_json::json!({ "_hex": hex::encode(b) }),
        Value::Json(v) => v.clone(),
    }
}

/// Serialize a query canonically: stable JSON of `[sql, params, options]`.
pub fn serialize_query(query: &Query) -> QuerySerial {
    let params: Vec<serde_json::Value> = query.parameters.iter().map(encode_parameter).collect();
    serde_json::to_string(&serde_json::json!([
        query.sql,
        params,
        { "logQueryExecutionTime": query.options.log_query_execution_time }
    ]))
    .expect("query serialization cannot fail")
}

fn decode_parameter(value: &serde_json::Value) -> Value {
    match value {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Integer(*b as i64),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(i) => Value::Integer(i),
            None => Value::Real(n.as_f64().unwrap_or(0.0)),
        },
        serde_json::Value::String(s) => Value::Text(s.clone()),
        serde_json::Value::Object(map) => {
            if let Some(serde_json::Value::String(h)) = map.get("_hex") {
                if map.len() == 1 {
                    if let Ok(bytes) = hex::decode(h) {
                        return Value::Blob(bytes);
                    }
                }
            }
            Value::Json(value.clone())
        }
        serde_json::Value::Array(_) => Value::Json(value.clone()),
    }
}

/// Parse a canonical serial back into a query. Inverse of [`serialize_query`].
pub fn deserialize_query(serial: &str) -> crate::error::Result<Query> {
    let parsed: serde_json::Value = serde_json::from_str(serial)
        .map_err(|e| crate::error::Error::Unknown(format!("bad query serial: {e}")))?;
    let parts = parsed
        .as_array()
        .filter(|a| a.len() == 3)
        .ok_or_else(|| crate::error::Error::Unknown("bad query serial shape".into()))?;

    let sql = parts[0]
        .as_str()
        .ok_or_else(|| crate::error::Error::Unknown("bad query serial sql".into()))?
        .to_string();
    let parameters = parts[1]
        .as_array()
        .ok_or_else(|| crate::error::Error::Unknown("bad query serial params".into()))?
        .iter()
        .map(decode_parameter)
        .collect();
    let log_query_execution_time = parts[2]
        .get("logQueryExecutionTime")
        .and_then(serde_json::Value::as_bool)
        .unwrap_or(false);

    Ok(Query {
        sql,
        parameters,
        options: QueryOptions {
            log_query_execution_time,
        },
    })
}

/// The per-session nonce prefixed to JSON emitted by SQL helpers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JsonMarker(String);

impl JsonMarker {
    /// Generate a fresh 21-char marker.
    pub fn generate(random: &dyn RandomSource) -> Self {
        let mut bytes = [0u8; JSON_MARKER_LENGTH];
        random.fill_bytes(&mut bytes);
        let marker: String = bytes
            .iter()
            .map(|b| NONCE_ALPHABET[(b & 63) as usize] as char)
            .collect();
        Self(marker)
    }

    /// The marker text, for embedding into SQL.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn scrub_json(marker: &str, value: &mut serde_json::Value) {
    match value {
        serde_json::Value::String(s) => {
            if let Some(rest) = s.strip_prefix(marker) {
                if let Ok(mut parsed) = serde_json::from_str::<serde_json::Value>(rest) {
                    scrub_json(marker, &mut parsed);
                    *value = parsed;
                }
            }
        }
        serde_json::Value::Array(items) => {
            for item in items {
                scrub_json(marker, item);
            }
        }
        serde_json::Value::Object(map) => {
            for item in map.values_mut() {
                scrub_json(marker, item);
            }
        }
        _ => {}
    }
}

/// Decode marker-prefixed JSON strings in query results, recursively.
pub fn decode_json_columns(rows: &mut [Row], marker: &JsonMarker) {
    for row in rows.iter_mut() {
        for (_, value) in row.iter_mut() {
            let Value::Text(text) = value else { continue };
            let Some(rest) = text.strip_prefix(marker.as_str()) else {
                continue;
            };
            if let Ok(mut parsed) = serde_json::from_str::<serde_json::Value>(rest) {
                scrub_json(marker.as_str(), &mut parsed);
                *value = Value::Json(parsed);
            }
        }
    }
}

/// Cached result rows keyed by query serial.
#[derive(Debug, Default)]
pub struct QueryRowsCache {
    rows: HashMap<QuerySerial, Arc<Vec<Row>>>,
}

impl QueryRowsCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// The cached snapshot for a query, if any.
    pub fn get(&self, serial: &str) -> Option<Arc<Vec<Row>>> {
        self.rows.get(serial).cloned()
    }

    /// Replace the snapshot for a query.
    pub fn set(&mut self, serial: QuerySerial, rows: Arc<Vec<Row>>) {
        self.rows.insert(serial, rows);
    }

    /// Drop a snapshot.
    pub fn remove(&mut self, serial: &str) {
        self.rows.remove(serial);
    }

    /// Serials with a cached snapshot.
    pub fn serials(&self) -> Vec<QuerySerial> {
        self.rows.keys().cloned().collect()
    }
}

/// Reference-counted registry of subscribed queries.
#[derive(Debug, Default)]
pub struct SubscribedQueries {
    counts: HashMap<QuerySerial, usize>,
}

impl SubscribedQueries {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber; returns the new count.
    pub fn subscribe(&mut self, serial: QuerySerial) -> usize {
        let count = self.counts.entry(serial).or_insert(0);
        *count += 1;
        *count
    }

    /// Drop a subscriber; removes the entry at zero.
    pub fn unsubscribe(&mut self, serial: &str) {
        if let Some(count) = self.counts.get_mut(serial) {
            *count -= 1;
            if *count == 0 {
                self.counts.remove(serial);
            }
        }
    }

    /// Whether anyone subscribes to this query.
    pub fn is_subscribed(&self, serial: &str) -> bool {
        self.counts.contains_key(serial)
    }

    /// All subscribed serials.
    pub fn serials(&self) -> Vec<QuerySerial> {
        self.counts.keys().cloned().collect()
    }

    /// Evict cache entries nobody subscribes to anymore. Called on every
    /// mutation so the cache tracks the live subscription set.
    pub fn release_unsubscribed(&self, cache: &mut QueryRowsCache) {
        for serial in cache.serials() {
            if !self.is_subscribed(&serial) {
                cache.remove(&serial);
            }
        }
    }
}
