//! The sync client: multiplexes active owners over shared transport
//! connections.
//!
//! Owners are reference-counted; a connection is shared by every active
//! owner configured for its URL. Dropping the last reference does not tear
//! the connection down immediately — disposal is delayed by
//! `disposal_delay_millis` to absorb rapid release/re-acquire churn (the
//! remount pattern of UI frameworks). Once disposed, the client turns every
//! operation into a no-op.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use evolu_engine::{Millis, Owner, OwnerId};
use tokio::task::JoinHandle;

use crate::transport::{Connector, Transport, TransportHandler};

/// Client-level sync configuration.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Default transport URLs for owners without their own set.
    pub transports: Vec<String>,
    /// Delay before an unreferenced connection is torn down.
    pub disposal_delay_millis: Millis,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            transports: Vec::new(),
            disposal_delay_millis: evolu_engine::DEFAULT_DISPOSAL_DELAY_MILLIS,
        }
    }
}

/// An owner to register, optionally pinned to its own transport set.
#[derive(Clone)]
pub struct SyncOwner {
    pub owner: Owner,
    pub transports: Option<Vec<String>>,
}

impl SyncOwner {
    pub fn new(owner: Owner) -> Self {
        Self {
            owner,
            transports: None,
        }
    }
}

/// Function handed to the delegate for writing back to one connection.
pub type SendFn = Arc<dyn Fn(Vec<u8>) + Send + Sync>;

/// The application half of the sync protocol.
pub trait SyncDelegate: Send + Sync {
    /// A connection opened; `owner_ids` are the owners multiplexed onto it.
    fn on_open(&self, owner_ids: Vec<OwnerId>, send: SendFn);

    /// A binary message arrived on a connection.
    fn on_message(&self, payload: Vec<u8>, send: SendFn, client: &SyncClient);
}

struct OwnerEntry {
    owner: Owner,
    transports: Vec<String>,
    ref_count: usize,
}

struct ConnectionEntry {
    transport: Arc<dyn Transport>,
    ref_count: usize,
    pending_disposal: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct State {
    disposed: bool,
    owners: HashMap<OwnerId, OwnerEntry>,
    connections: HashMap<String, ConnectionEntry>,
}

struct Inner {
    config: SyncConfig,
    connector: Arc<dyn Connector>,
    delegate: Arc<dyn SyncDelegate>,
    state: Mutex<State>,
}

/// Reference-counted sync client; clones share state.
#[derive(Clone)]
pub struct SyncClient {
    inner: Arc<Inner>,
}

impl SyncClient {
    pub fn new(
        config: SyncConfig,
        connector: Arc<dyn Connector>,
        delegate: Arc<dyn SyncDelegate>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                connector,
                delegate,
                state: Mutex::new(State::default()),
            }),
        }
    }

    /// Acquire (`true`) or release (`false`) an owner.
    ///
    /// The first acquisition ensures a connection per configured URL; the
    /// last release schedules disposal after the configured delay. Calls are
    /// serialized by arrival.
    pub fn use_owner(&self, acquire: bool, sync_owner: &SyncOwner) {
        let mut state = self.inner.state.lock().expect("sync state poisoned");
        if state.disposed {
            return;
        }

        let owner_id = sync_owner.owner.id;
        if acquire {
            let urls = sync_owner
                .transports
                .clone()
                .unwrap_or_else(|| self.inner.config.transports.clone());

            let entry = state.owners.entry(owner_id).or_insert_with(|| OwnerEntry {
                owner: sync_owner.owner.clone(),
                transports: urls.clone(),
                ref_count: 0,
            });
            entry.ref_count += 1;
            if entry.ref_count == 1 {
                let urls = entry.transports.clone();
                for url in urls {
                    self.acquire_connection(&mut state, &url);
                }
            }
        } else {
            let Some(entry) = state.owners.get_mut(&owner_id) else {
                return;
            };
            entry.ref_count = entry.ref_count.saturating_sub(1);
            if entry.ref_count == 0 {
                let urls = entry.transports.clone();
                state.owners.remove(&owner_id);
                for url in urls {
                    self.release_connection(&mut state, &url);
                }
            }
        }
    }

    /// The active owner with this id, if any.
    pub fn get_owner(&self, id: &OwnerId) -> Option<Owner> {
        let state = self.inner.state.lock().expect("sync state poisoned");
        state.owners.get(id).map(|entry| entry.owner.clone())
    }

    /// Forward a payload to every connection in the owner's transport set.
    pub fn send(&self, owner_id: &OwnerId, payload: Vec<u8>) {
        let transports: Vec<Arc<dyn Transport>> = {
            let state = self.inner.state.lock().expect("sync state poisoned");
            if state.disposed {
                return;
            }
            let Some(entry) = state.owners.get(owner_id) else {
                return;
            };
            entry
                .transports
                .iter()
                .filter_map(|url| state.connections.get(url))
                .map(|connection| connection.transport.clone())
                .collect()
        };
        for transport in transports {
            transport.send(payload.clone());
        }
    }

    /// Tear everything down. Afterwards every operation is a no-op.
    pub fn dispose(&self) {
        let mut state = self.inner.state.lock().expect("sync state poisoned");
        if state.disposed {
            return;
        }
        state.disposed = true;
        state.owners.clear();
        for (_, connection) in state.connections.drain() {
            if let Some(timer) = connection.pending_disposal {
                timer.abort();
            }
            connection.transport.close();
        }
    }

    fn acquire_connection(&self, state: &mut State, url: &str) {
        if let Some(connection) = state.connections.get_mut(url) {
            connection.ref_count += 1;
            if let Some(timer) = connection.pending_disposal.take() {
                timer.abort();
            }
            return;
        }

        let handler: Arc<dyn TransportHandler> = Arc::new(ConnectionHandler {
            url: url.to_string(),
            inner: Arc::downgrade(&self.inner),
        });
        let transport = self.inner.connector.connect(url, handler);
        tracing::debug!(%url, "connection opened");
        state.connections.insert(
            url.to_string(),
            ConnectionEntry {
                transport,
                ref_count: 1,
                pending_disposal: None,
            },
        );
    }

    fn release_connection(&self, state: &mut State, url: &str) {
        let Some(connection) = state.connections.get_mut(url) else {
            return;
        };
        connection.ref_count = connection.ref_count.saturating_sub(1);
        if connection.ref_count > 0 {
            return;
        }

        let inner = Arc::downgrade(&self.inner);
        let delay = self.inner.config.disposal_delay_millis;
        let url = url.to_string();
        let timer_url = url.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay)).await;
            if let Some(inner) = inner.upgrade() {
                let mut state = inner.state.lock().expect("sync state poisoned");
                let still_unused = state
                    .connections
                    .get(&timer_url)
                    .is_some_and(|c| c.ref_count == 0);
                if still_unused {
                    if let Some(connection) = state.connections.remove(&timer_url) {
                        tracing::debug!(url = %timer_url, "connection disposed");
                        connection.transport.close();
                    }
                }
            }
        });

        if let Some(connection) = state.connections.get_mut(&url) {
            if let Some(previous) = connection.pending_disposal.replace(timer) {
                previous.abort();
            }
        }
    }
}

struct ConnectionHandler {
    url: String,
    inner: Weak<Inner>,
}

impl ConnectionHandler {
    /// Snapshot (owners on this url, send fn) without holding the lock
    /// during delegate callbacks.
    fn context(&self) -> Option<(Arc<Inner>, Vec<OwnerId>, SendFn)> {
        let inner = self.inner.upgrade()?;
        let (owner_ids, transport) = {
            let state = inner.state.lock().expect("sync state poisoned");
            if state.disposed {
                return None;
            }
            let owner_ids = state
                .owners
                .iter()
                .filter(|(_, entry)| entry.transports.contains(&self.url))
                .map(|(id, _)| *id)
                .collect();
            let transport = state
                .connections
                .get(&self.url)
                .map(|connection| connection.transport.clone())?;
            (owner_ids, transport)
        };
        let send: SendFn = Arc::new(move |payload| transport.send(payload));
        Some((inner, owner_ids, send))
    }
}

impl TransportHandler for ConnectionHandler {
    fn on_open(&self) {
        if let Some((inner, owner_ids, send)) = self.context() {
            inner.delegate.on_open(owner_ids, send);
        }
    }

    fn on_message(&self, payload: Vec<u8>) {
        if let Some((inner, _, send)) = self.context() {
            let client = SyncClient {
                inner: inner.clone(),
            };
            inner.delegate.on_message(payload, send, &client);
        }
    }

    fn on_close(&self) {
        tracing::debug!(url = %self.url, "connection closed");
    }
}
