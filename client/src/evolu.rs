//! The public facade: one value assembling the engine, the query layer, and
//! the sync client.
//!
//! Mutations are coalesced: `insert`/`update`/`upsert` validate eagerly and
//! enqueue; a drain task commits the whole queue as one transaction on the
//! next scheduler tick. A single failed validation cancels the entire batch.
//! After every commit the subscribed queries are re-run and subscribers get
//! row-level patches; emitted messages are sealed into protocol envelopes
//! and handed to the sync client.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};

use dashmap::DashMap;
use evolu_engine::{
    decode_envelope, encode_envelope, open_envelope_records, validate_mutation, AppOwner, Change,
    ColumnName, Config, CrdtMessage, Db, DbDeps, DbSchema, Error, Id, MutationKind, Owner,
    OwnerId, Query, QueryPatches, QuerySerial, Result, Row, SqliteStorage, SubscribedQueries,
    Usage, Value,
};
use tokio::sync::{broadcast, watch};

use crate::sync::{SendFn, SyncClient, SyncConfig, SyncDelegate, SyncOwner};
use crate::transport::{Connector, WebSocketConnector};

/// A query snapshot pushed to subscribers.
pub type QueryUpdate = Arc<QueryPatches>;

type LoadSlot = watch::Receiver<Option<std::result::Result<Arc<Vec<Row>>, Error>>>;

struct EvoluInner {
    db: Mutex<Db<SqliteStorage>>,
    schema: DbSchema,
    config: Config,
    deps: DbDeps,
    app_owner: AppOwner,
    subscriptions: Mutex<SubscribedQueries>,
    listeners: DashMap<QuerySerial, broadcast::Sender<QueryUpdate>>,
    loads: DashMap<QuerySerial, LoadSlot>,
    errors: broadcast::Sender<Error>,
    pending: Mutex<Vec<Result<Change>>>,
    flush_scheduled: AtomicBool,
    usage: Mutex<HashMap<OwnerId, Usage>>,
    sync: OnceLock<SyncClient>,
}

/// The assembled local-first database.
#[derive(Clone)]
pub struct Evolu {
    inner: Arc<EvoluInner>,
}

impl Evolu {
    /// Open a file-backed database named by `config.name` and connect the
    /// WebSocket sync client to `config.sync_urls`.
    pub fn new(config: Config, schema: DbSchema) -> Result<Self> {
        let storage = SqliteStorage::open(&format!("{}.db", config.name))?;
        let deps = DbDeps::default();
        let connector = Arc::new(WebSocketConnector::new(crate::schedule::ScheduleDeps {
            clock: deps.clock.clone(),
            random: deps.random.clone(),
        }));
        Self::assemble(storage, config, schema, deps, Some(connector))
    }

    /// Open an in-memory database, optionally with a custom connector.
    /// `None` runs fully offline.
    pub fn new_in_memory(
        config: Config,
        schema: DbSchema,
        deps: DbDeps,
        connector: Option<Arc<dyn Connector>>,
    ) -> Result<Self> {
        let storage = SqliteStorage::open_in_memory()?;
        Self::assemble(storage, config, schema, deps, connector)
    }

    fn assemble(
        storage: SqliteStorage,
        config: Config,
        schema: DbSchema,
        deps: DbDeps,
        connector: Option<Arc<dyn Connector>>,
    ) -> Result<Self> {
        let db = Db::init(storage, schema.clone(), config.clone(), deps.clone())?;
        let app_owner = db.app_owner().clone();
        let (errors, _) = broadcast::channel(64);

        let inner = Arc::new(EvoluInner {
            db: Mutex::new(db),
            schema,
            config: config.clone(),
            deps,
            app_owner: app_owner.clone(),
            subscriptions: Mutex::new(SubscribedQueries::new()),
            listeners: DashMap::new(),
            loads: DashMap::new(),
            errors,
            pending: Mutex::new(Vec::new()),
            flush_scheduled: AtomicBool::new(false),
            usage: Mutex::new(HashMap::new()),
            sync: OnceLock::new(),
        });
        let evolu = Self { inner };

        if let Some(connector) = connector {
            let delegate = Arc::new(EvoluDelegate {
                inner: Arc::downgrade(&evolu.inner),
            });
            let sync = SyncClient::new(
                SyncConfig {
                    transports: config.sync_urls.clone(),
                    disposal_delay_millis: config.disposal_delay_millis,
                },
                connector,
                delegate,
            );
            sync.use_owner(true, &SyncOwner::new(app_owner.owner.clone()));
            let _ = evolu.inner.sync.set(sync);
        }

        Ok(evolu)
    }

    /// The coordinating owner (bears the backup mnemonic).
    pub fn app_owner(&self) -> &AppOwner {
        &self.inner.app_owner
    }

    /// The sync client, when one is attached.
    pub fn sync_client(&self) -> Option<&SyncClient> {
        self.inner.sync.get()
    }

    /// Register an extra owner (shard or shared) with the sync client.
    pub fn use_owner(&self, acquire: bool, owner: Owner) {
        if let Some(sync) = self.inner.sync.get() {
            sync.use_owner(acquire, &SyncOwner::new(owner));
        }
    }

    // -- Mutations ---------------------------------------------------------

    /// Queue an insert; the returned id is final once the batch commits.
    pub fn insert(&self, table: &str, values: BTreeMap<ColumnName, Value>) -> Result<Id> {
        self.enqueue(MutationKind::Insert, table, None, values)
    }

    /// Queue an update of an existing row.
    pub fn update(&self, table: &str, id: Id, values: BTreeMap<ColumnName, Value>) -> Result<Id> {
        self.enqueue(MutationKind::Update, table, Some(id), values)
    }

    /// Queue an insert-or-update with a caller-chosen id.
    pub fn upsert(&self, table: &str, id: Id, values: BTreeMap<ColumnName, Value>) -> Result<Id> {
        self.enqueue(MutationKind::Upsert, table, Some(id), values)
    }

    fn enqueue(
        &self,
        kind: MutationKind,
        table: &str,
        id: Option<Id>,
        values: BTreeMap<ColumnName, Value>,
    ) -> Result<Id> {
        let validated = validate_mutation(
            &self.inner.schema,
            kind,
            table,
            id,
            values,
            None,
            &*self.inner.deps.random,
        );
        let result = validated.as_ref().map(|change| change.id).map_err(Error::clone);

        // Failures enter the queue as sentinels: one bad mutation voids the
        // whole batch at flush time.
        self.inner
            .pending
            .lock()
            .expect("pending queue poisoned")
            .push(validated);
        self.schedule_flush();
        result
    }

    fn schedule_flush(&self) {
        if self
            .inner
            .flush_scheduled
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            let evolu = self.clone();
            tokio::spawn(async move {
                tokio::task::yield_now().await;
                evolu.flush();
            });
        }
    }

    /// Drain the mutation queue into one transaction. Runs automatically on
    /// the next scheduler tick after an enqueue; callers needing immediate
    /// durability may invoke it directly.
    pub fn flush(&self) {
        self.inner.flush_scheduled.store(false, Ordering::SeqCst);
        let batch: Vec<Result<Change>> = {
            let mut pending = self.inner.pending.lock().expect("pending queue poisoned");
            pending.drain(..).collect()
        };
        if batch.is_empty() {
            return;
        }

        let changes: Vec<Change> = match batch.into_iter().collect() {
            Ok(changes) => changes,
            Err(error) => {
                // The whole batch is cancelled.
                self.report_error(error);
                return;
            }
        };

        let outcome = {
            let mut db = self.inner.db.lock().expect("db poisoned");
            db.mutate(changes)
        };
        match outcome {
            Ok(outcome) => {
                self.broadcast_messages(outcome.messages);
                self.refresh_subscribed();
                self.collect_garbage();
            }
            Err(error) => self.report_error(error),
        }
    }

    fn broadcast_messages(&self, messages: Vec<CrdtMessage>) {
        let Some(sync) = self.inner.sync.get() else {
            return;
        };

        let mut by_owner: HashMap<OwnerId, Vec<CrdtMessage>> = HashMap::new();
        for message in messages {
            by_owner.entry(message.owner_id).or_default().push(message);
        }

        for (owner_id, messages) in by_owner {
            let owner = if owner_id == self.inner.app_owner.owner.id {
                Some(self.inner.app_owner.owner.clone())
            } else {
                sync.get_owner(&owner_id)
            };
            let Some(owner) = owner else { continue };

            let usage_snapshot = {
                let mut usage = self.inner.usage.lock().expect("usage poisoned");
                let entry = usage.entry(owner_id).or_default();
                for message in &messages {
                    entry.observe_timestamp(message.timestamp);
                }
                entry.clone()
            };

            match encode_envelope(
                owner_id,
                owner.write_key,
                &messages,
                &owner.encryption_key,
                Some(&usage_snapshot),
                &*self.inner.deps.random,
            ) {
                Ok(bytes) => {
                    let mut usage = self.inner.usage.lock().expect("usage poisoned");
                    if let Some(entry) = usage.get_mut(&owner_id) {
                        entry.sent_bytes += bytes.len() as u64;
                    }
                    sync.send(&owner_id, bytes);
                }
                Err(error) => self.report_error(error),
            }
        }
    }

    // -- Queries -----------------------------------------------------------

    /// Subscribe to a query. The subscription carries a broadcast receiver
    /// of patches; dropping it releases the registration.
    pub fn subscribe_query(&self, query: &Query) -> QuerySubscription {
        let serial = query.serialize();
        self.inner
            .subscriptions
            .lock()
            .expect("subscriptions poisoned")
            .subscribe(serial.clone());

        let receiver = self
            .inner
            .listeners
            .entry(serial.clone())
            .or_insert_with(|| broadcast::channel(16).0)
            .subscribe();

        QuerySubscription {
            inner: self.inner.clone(),
            serial,
            receiver,
        }
    }

    /// The cached rows of a query, if it has been loaded.
    pub fn get_query_rows(&self, query: &Query) -> Option<Arc<Vec<Row>>> {
        let db = self.inner.db.lock().expect("db poisoned");
        db.cached_rows(&query.serialize())
    }

    /// Load a query, coalescing concurrent loads of the same query into one
    /// storage call.
    pub async fn load_query(&self, query: &Query) -> Result<Arc<Vec<Row>>> {
        let serial = query.serialize();

        // Leader runs the query; followers await its watch channel. The map
        // entry guard is dropped before any storage work.
        enum Role {
            Leader(watch::Sender<Option<std::result::Result<Arc<Vec<Row>>, Error>>>),
            Follower(LoadSlot),
        }
        let role = match self.inner.loads.entry(serial) {
            dashmap::mapref::entry::Entry::Occupied(entry) => Role::Follower(entry.get().clone()),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let (tx, rx) = watch::channel(None);
                slot.insert(rx);
                Role::Leader(tx)
            }
        };

        match role {
            Role::Leader(tx) => {
                let rows = {
                    let mut db = self.inner.db.lock().expect("db poisoned");
                    db.load_query(query)
                };
                let _ = tx.send(Some(rows.clone()));
                rows
            }
            Role::Follower(mut receiver) => loop {
                if let Some(result) = receiver.borrow().clone() {
                    return result;
                }
                if receiver.changed().await.is_err() {
                    return Err(Error::Unknown("query load abandoned".into()));
                }
            },
        }
    }

    /// Re-run subscribed queries and push patches to their listeners.
    fn refresh_subscribed(&self) {
        let serials = self
            .inner
            .subscriptions
            .lock()
            .expect("subscriptions poisoned")
            .serials();
        if serials.is_empty() {
            return;
        }

        let refreshed = {
            let mut db = self.inner.db.lock().expect("db poisoned");
            db.refresh_queries(&serials)
        };
        match refreshed {
            Ok(updates) => {
                for update in updates {
                    if let Some(listener) = self.inner.listeners.get(&update.serial) {
                        let _ = listener.send(Arc::new(update));
                    }
                }
            }
            Err(error) => self.report_error(error),
        }
    }

    /// Drop caches, resolved loads, and listeners that lost their last
    /// subscriber. Runs after every mutation.
    fn collect_garbage(&self) {
        let subscriptions = self
            .inner
            .subscriptions
            .lock()
            .expect("subscriptions poisoned");
        {
            let mut db = self.inner.db.lock().expect("db poisoned");
            db.release_unsubscribed(&subscriptions);
        }
        self.inner
            .loads
            .retain(|serial, _| subscriptions.is_subscribed(serial));
        self.inner
            .listeners
            .retain(|serial, _| subscriptions.is_subscribed(serial));
    }

    // -- Errors ------------------------------------------------------------

    /// Subscribe to the engine's error channel.
    pub fn subscribe_errors(&self) -> broadcast::Receiver<Error> {
        self.inner.errors.subscribe()
    }

    fn report_error(&self, error: Error) {
        if self.inner.config.enable_logging {
            tracing::warn!(%error, "engine error");
        }
        let _ = self.inner.errors.send(error);
    }

    // -- Lifecycle ---------------------------------------------------------

    /// Apply remote messages (already decrypted) and notify subscribers.
    pub fn apply_messages(&self, messages: Vec<CrdtMessage>) -> Result<()> {
        {
            let mut db = self.inner.db.lock().expect("db poisoned");
            db.receive(messages)?;
        }
        self.refresh_subscribed();
        Ok(())
    }

    /// Snapshot the database file.
    pub fn export_database(&self) -> Result<Vec<u8>> {
        let db = self.inner.db.lock().expect("db poisoned");
        db.export()
    }

    /// Rotate the app owner's write key.
    pub fn rotate_write_key(&self) -> Result<()> {
        let mut db = self.inner.db.lock().expect("db poisoned");
        db.rotate_write_key()?;
        Ok(())
    }

    /// Wipe all local data; the host should reload at `config.reload_url`.
    pub fn reset(&self) -> Result<()> {
        if let Some(sync) = self.inner.sync.get() {
            sync.dispose();
        }
        {
            let mut db = self.inner.db.lock().expect("db poisoned");
            db.reset()?;
        }
        self.signal_reload();
        Ok(())
    }

    /// Wipe all local data and re-derive the identity from a mnemonic; data
    /// returns through sync.
    pub fn restore(&self, mnemonic: &str) -> Result<()> {
        {
            let mut db = self.inner.db.lock().expect("db poisoned");
            db.restore(mnemonic)?;
        }
        self.signal_reload();
        Ok(())
    }

    fn signal_reload(&self) {
        match &self.inner.config.reload_url {
            Some(url) => tracing::info!(%url, "local data wiped, host should reload"),
            None => tracing::info!("local data wiped, host should reload"),
        }
    }
}

/// A live query subscription; dropping it unsubscribes.
pub struct QuerySubscription {
    inner: Arc<EvoluInner>,
    serial: QuerySerial,
    receiver: broadcast::Receiver<QueryUpdate>,
}

impl QuerySubscription {
    /// Wait for the next patch set.
    pub async fn next_update(&mut self) -> Option<QueryUpdate> {
        self.receiver.recv().await.ok()
    }

    /// The query's canonical key.
    pub fn serial(&self) -> &QuerySerial {
        &self.serial
    }
}

impl Drop for QuerySubscription {
    fn drop(&mut self) {
        if let Ok(mut subscriptions) = self.inner.subscriptions.lock() {
            subscriptions.unsubscribe(&self.serial);
        }
    }
}

/// Bridges incoming transport traffic into the engine.
struct EvoluDelegate {
    inner: Weak<EvoluInner>,
}

impl SyncDelegate for EvoluDelegate {
    fn on_open(&self, owner_ids: Vec<OwnerId>, _send: SendFn) {
        // Anti-entropy negotiation with the relay is transport-specific;
        // connections start passive and react to incoming envelopes.
        tracing::debug!(owners = owner_ids.len(), "sync connection open");
    }

    fn on_message(&self, payload: Vec<u8>, _send: SendFn, client: &SyncClient) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let evolu = Evolu { inner };
        let payload_len = payload.len() as u64;

        let envelope = match decode_envelope(&payload) {
            Ok(envelope) => envelope,
            Err(error) => {
                evolu.report_error(error);
                return;
            }
        };

        let owner = if envelope.owner_id == evolu.inner.app_owner.owner.id {
            Some(evolu.inner.app_owner.owner.clone())
        } else {
            client.get_owner(&envelope.owner_id)
        };
        let Some(owner) = owner else {
            evolu.report_error(Error::Protocol(format!(
                "envelope for unknown owner {}",
                envelope.owner_id
            )));
            return;
        };

        {
            let mut usage = evolu.inner.usage.lock().expect("usage poisoned");
            usage.entry(envelope.owner_id).or_default().received_bytes += payload_len;
        }

        let opened = open_envelope_records(&envelope, &owner.encryption_key);
        for error in opened.dropped {
            evolu.report_error(error);
        }
        if let Err(error) = evolu.apply_messages(opened.messages) {
            evolu.report_error(error);
        }
    }
}
