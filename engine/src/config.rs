//! Engine and client configuration.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::schema::{DbIndex, Id, MutationKind};
use crate::time::Millis;
use crate::timestamp::DEFAULT_MAX_DRIFT_MILLIS;
use crate::value::Value;
use crate::{ColumnName, TableName};

/// Default delay before an unreferenced owner's connections are torn down.
pub const DEFAULT_DISPOSAL_DELAY_MILLIS: Millis = 100;

/// One queued initial-data mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct InitialMutation {
    pub kind: MutationKind,
    pub table: TableName,
    pub id: Option<Id>,
    pub values: BTreeMap<ColumnName, Value>,
}

/// Collects mutations to seed an empty database.
#[derive(Debug, Default)]
pub struct InitialDataBuilder {
    mutations: Vec<InitialMutation>,
}

impl InitialDataBuilder {
    /// Queue an insert; the engine allocates the id.
    pub fn insert(&mut self, table: impl Into<TableName>, values: BTreeMap<ColumnName, Value>) {
        self.mutations.push(InitialMutation {
            kind: MutationKind::Insert,
            table: table.into(),
            id: None,
            values,
        });
    }

    /// Queue an upsert with a caller-chosen id, for deterministic seeds.
    pub fn upsert(
        &mut self,
        table: impl Into<TableName>,
        id: Id,
        values: BTreeMap<ColumnName, Value>,
    ) {
        self.mutations.push(InitialMutation {
            kind: MutationKind::Upsert,
            table: table.into(),
            id: Some(id),
            values,
        });
    }

    pub(crate) fn into_mutations(self) -> Vec<InitialMutation> {
        self.mutations
    }
}

/// Callback invoked once when storage is empty.
pub type InitialData = Arc<dyn Fn(&mut InitialDataBuilder) + Send + Sync>;

/// Host-supplied configuration.
#[derive(Clone)]
pub struct Config {
    /// Storage namespace / filename prefix.
    pub name: String,
    /// Default transport URLs for sync.
    pub sync_urls: Vec<String>,
    /// Tolerated clock skew for timestamps.
    pub max_drift_millis: Millis,
    /// Delay before disposing unreferenced owners and connections.
    pub disposal_delay_millis: Millis,
    /// Emit engine debug logging.
    pub enable_logging: bool,
    /// Engine-managed indexes.
    pub indexes: Vec<DbIndex>,
    /// Seed mutations for a fresh database.
    pub initial_data: Option<InitialData>,
    /// Lowest level the host wants logged; `None` defers to the subscriber.
    pub minimum_log_level: Option<tracing::Level>,
    /// Where the host should navigate after a reset.
    pub reload_url: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: "evolu".to_string(),
            sync_urls: vec!["wss://free.evoluhq.com".to_string()],
            max_drift_millis: DEFAULT_MAX_DRIFT_MILLIS,
            disposal_delay_millis: DEFAULT_DISPOSAL_DELAY_MILLIS,
            enable_logging: false,
            indexes: Vec::new(),
            initial_data: None,
            minimum_log_level: None,
            reload_url: None,
        }
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("name", &self.name)
            .field("sync_urls", &self.sync_urls)
            .field("max_drift_millis", &self.max_drift_millis)
            .field("disposal_delay_millis", &self.disposal_delay_millis)
            .field("enable_logging", &self.enable_logging)
            .field("indexes", &self.indexes)
            .field("initial_data", &self.initial_data.is_some())
            .field("minimum_log_level", &self.minimum_log_level)
            .field("reload_url", &self.reload_url)
            .finish()
    }
}
