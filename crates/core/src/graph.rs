//! Graphwatch: embedded object graph with change tracking and watches.
//!
//! The graph holds three kinds of record: [`Entity`] (a typed node),
//! [`Relationship`] (a typed subject → object link between entities) and
//! [`Action`] (a typed n-ary event over ordered subject and object lists).
//! Every record carries typed properties and a set of tags.
//!
//! Mutations are staged on a [`Graph`] connection and applied atomically by
//! [`Graph::commit`]. Each commit is reduced to its net effect, a list of
//! [`ChangeFact`]s, which is matched against registered [`WatchPredicate`]s
//! and delivered to watchers on a dedicated dispatcher thread.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use graphwatch::{Entity, GraphObject, GraphStore, Relationship, WatchEvent, WatchResult};
//!
//! let store = GraphStore::open("employees.graphwatch").unwrap();
//! store.watch_for_relationship(["Employee"], |e: &WatchEvent<'_>| -> WatchResult {
//!     println!("{:?} {}", e.fact.change, e.fact.object_id);
//!     Ok(())
//! });
//!
//! let graph = store.connect().unwrap();
//! let alice = Entity::new(&graph, "Person").unwrap();
//! alice.set("name", "Alice").unwrap();
//! let acme = Entity::new(&graph, "Company").unwrap();
//! acme.set("name", "Acme").unwrap();
//!
//! let job = Relationship::new(&graph, "Employee").unwrap();
//! job.set_subject(Some(&alice)).unwrap();
//! job.set_object(Some(&acme)).unwrap();
//!
//! let receipt = graph.commit_and_wait().unwrap();
//! println!("commit {} produced {} facts", receipt.commit, receipt.facts.len());
//! ```

mod backend;
mod change;
mod confinement;
mod dispatch;
mod node;
mod record;
mod staging;
mod value;
mod watch;

pub use backend::{Backend, RedbBackend, StoreWrite};
pub use change::{Change, ChangeFact, CommitId, CommitReceipt, FactDetail, FactEvent};
pub use dispatch::{log_error_sink, Completion, ErrorSink, WatcherFailure};
pub use node::{Action, Entity, GraphObject, Node, ObjectHandle, Relationship};
pub use record::{Links, ObjectId, ObjectKind, StoredRecord};
pub use value::Value;
pub use watch::{GraphWatcher, WatchEvent, WatchHandle, WatchPredicate, WatchRegistry, WatchResult};

use confinement::Confinement;
use dispatch::{DispatchJob, Dispatcher};
use parking_lot::Mutex;
use staging::{CommitOutcome, ConnectionState, Descriptor};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Weak};

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("storage error: {0}")]
    Storage(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("identity allocation failed: {0}")]
    IdentityAllocationFailed(String),
    #[error("store commit failed: {0}")]
    StoreCommitFailed(String),
    #[error("invalid mutation: {0}")]
    InvalidMutation(String),
    #[error("watcher failed: {0}")]
    Watcher(String),
    #[error("connection worker is gone")]
    Disconnected,
}

impl From<redb::DatabaseError> for GraphError {
    fn from(e: redb::DatabaseError) -> Self {
        GraphError::Storage(e.to_string())
    }
}
impl From<redb::TransactionError> for GraphError {
    fn from(e: redb::TransactionError) -> Self {
        GraphError::Storage(e.to_string())
    }
}
impl From<redb::TableError> for GraphError {
    fn from(e: redb::TableError) -> Self {
        GraphError::Storage(e.to_string())
    }
}
impl From<redb::StorageError> for GraphError {
    fn from(e: redb::StorageError) -> Self {
        GraphError::Storage(e.to_string())
    }
}
impl From<redb::CommitError> for GraphError {
    fn from(e: redb::CommitError) -> Self {
        GraphError::Storage(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, GraphError>;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Options for [`GraphStore::with_backend`].
#[derive(Clone)]
pub struct StoreConfig {
    /// Prefix for the worker and dispatcher thread names.
    pub name: String,
    /// Receives every watcher error or panic.
    pub error_sink: ErrorSink,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            name: "graphwatch".to_string(),
            error_sink: log_error_sink(),
        }
    }
}

impl std::fmt::Debug for StoreConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreConfig")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// GraphStore
// ---------------------------------------------------------------------------

struct StoreInner {
    name: String,
    backend: Arc<dyn Backend>,
    registry: Arc<WatchRegistry>,
    dispatcher: Dispatcher,
    connections: Mutex<Vec<Weak<ConnectionInner>>>,
    next_connection: AtomicU64,
}

impl StoreInner {
    /// Ask every other live connection to reload `ids`.
    fn broadcast_refresh(&self, origin: u64, ids: &[ObjectId]) {
        if ids.is_empty() {
            return;
        }
        let peers: Vec<Arc<ConnectionInner>> = {
            let mut connections = self.connections.lock();
            connections.retain(|c| c.strong_count() > 0);
            connections.iter().filter_map(Weak::upgrade).collect()
        };
        for peer in peers.into_iter().filter(|p| p.id != origin) {
            let ids = ids.to_vec();
            let connection = peer.id;
            let sent = peer.confinement.perform(move |state| {
                if let Err(e) = state.refresh(&ids) {
                    tracing::warn!(connection, error = %e, "refresh after peer commit failed");
                }
            });
            if sent.is_err() {
                tracing::trace!(connection, "skipping refresh for closed connection");
            }
        }
    }
}

/// A shared graph database: one backend, one watch registry, one
/// dispatcher thread, any number of [`Graph`] connections.
///
/// Cloning is cheap and yields a handle to the same store.
#[derive(Clone)]
pub struct GraphStore {
    inner: Arc<StoreInner>,
}

impl GraphStore {
    /// Open or create a database file at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let backend = RedbBackend::open(path)?;
        Self::with_backend(Arc::new(backend), StoreConfig::default())
    }

    /// A store backed by an in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        let backend = RedbBackend::in_memory()?;
        Self::with_backend(Arc::new(backend), StoreConfig::default())
    }

    pub fn with_backend(backend: Arc<dyn Backend>, config: StoreConfig) -> Result<Self> {
        let registry = Arc::new(WatchRegistry::new());
        let dispatcher = Dispatcher::spawn(
            format!("{}-dispatch", config.name),
            Arc::clone(&registry),
            config.error_sink,
        )?;
        Ok(Self {
            inner: Arc::new(StoreInner {
                name: config.name,
                backend,
                registry,
                dispatcher,
                connections: Mutex::new(Vec::new()),
                next_connection: AtomicU64::new(1),
            }),
        })
    }

    /// Open a connection with its own confinement worker.
    pub fn connect(&self) -> Result<Graph> {
        self.open_connection(false)
    }

    /// Open a connection whose commits are reported as originating remotely.
    pub fn connect_remote(&self) -> Result<Graph> {
        self.open_connection(true)
    }

    fn open_connection(&self, remote: bool) -> Result<Graph> {
        let id = self.inner.next_connection.fetch_add(1, Ordering::Relaxed);
        let state = ConnectionState::new(Arc::clone(&self.inner.backend));
        let confinement = Confinement::spawn(format!("{}-conn-{id}", self.inner.name), state)?;
        let connection = Arc::new(ConnectionInner {
            id,
            remote,
            confinement,
            store: Arc::clone(&self.inner),
        });
        self.inner
            .connections
            .lock()
            .push(Arc::downgrade(&connection));
        tracing::debug!(connection = id, remote, "connection opened");
        Ok(Graph { inner: connection })
    }

    /// Register `watcher` for every fact matching `predicate`.
    pub fn watch(&self, predicate: WatchPredicate, watcher: impl GraphWatcher + 'static) -> WatchHandle {
        self.inner.registry.register(predicate, Arc::new(watcher))
    }

    /// Watch entities of the given types; an empty list matches every type.
    ///
    /// Shorthand for [`watch`](Self::watch) with a type-only predicate. To
    /// narrow by tags or property names as well, build the predicate:
    ///
    /// ```rust,no_run
    /// # use graphwatch::{GraphStore, WatchEvent, WatchPredicate, WatchResult};
    /// # let store = GraphStore::open_in_memory().unwrap();
    /// store.watch(
    ///     WatchPredicate::entity().types(["Person"]).tags(["vip"]).properties(["name"]),
    ///     |e: &WatchEvent<'_>| -> WatchResult { Ok(()) },
    /// );
    /// ```
    pub fn watch_for_entity<I, S>(&self, types: I, watcher: impl GraphWatcher + 'static) -> WatchHandle
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.watch(WatchPredicate::entity().types(types), watcher)
    }

    /// Watch relationships of the given types. Use
    /// [`WatchPredicate::relationship`] with [`watch`](Self::watch) to add
    /// tag or property filters.
    pub fn watch_for_relationship<I, S>(
        &self,
        types: I,
        watcher: impl GraphWatcher + 'static,
    ) -> WatchHandle
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.watch(WatchPredicate::relationship().types(types), watcher)
    }

    /// Watch actions of the given types. Use [`WatchPredicate::action`]
    /// with [`watch`](Self::watch) to add tag or property filters.
    pub fn watch_for_action<I, S>(&self, types: I, watcher: impl GraphWatcher + 'static) -> WatchHandle
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.watch(WatchPredicate::action().types(types), watcher)
    }

    /// Stop deliveries to `handle`, including the rest of a batch already
    /// being dispatched. Returns false for unknown handles.
    pub fn unwatch(&self, handle: WatchHandle) -> bool {
        self.inner.registry.unregister(handle)
    }

    pub fn registry(&self) -> &WatchRegistry {
        &self.inner.registry
    }
}

impl std::fmt::Debug for GraphStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphStore")
            .field("name", &self.inner.name)
            .field("watches", &self.inner.registry.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Graph (connection)
// ---------------------------------------------------------------------------

struct ConnectionInner {
    id: u64,
    remote: bool,
    confinement: Confinement,
    store: Arc<StoreInner>,
}

/// One connection to a [`GraphStore`].
///
/// A connection owns its staged mutations and its cached copies of records.
/// Every operation runs on the connection's worker thread, in the order it
/// was issued, so a `Graph` and the objects created from it can be shared
/// across threads freely.
#[derive(Clone)]
pub struct Graph {
    inner: Arc<ConnectionInner>,
}

impl Graph {
    /// Run `job` on the worker and wait for its result.
    pub(crate) fn run<R, F>(&self, job: F) -> Result<R>
    where
        F: FnOnce(&mut ConnectionState) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        self.inner.confinement.perform_and_wait(job)?
    }

    pub(crate) fn same_connection(&self, other: &Graph) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn store(&self) -> GraphStore {
        GraphStore {
            inner: Arc::clone(&self.inner.store),
        }
    }

    pub fn is_remote(&self) -> bool {
        self.inner.remote
    }

    /// Apply every staged mutation atomically, then notify watchers.
    ///
    /// Returns immediately. `completion` runs on the dispatcher thread after
    /// every matching watcher has seen every fact of the commit, or with the
    /// error if the commit failed. On failure staged mutations stay pending
    /// and a later commit retries them.
    pub fn commit<F>(&self, completion: F)
    where
        F: FnOnce(Result<CommitReceipt>) + Send + 'static,
    {
        let pending: Arc<Mutex<Option<Completion>>> = Arc::new(Mutex::new(Some(Box::new(completion))));
        let in_job = Arc::clone(&pending);
        let graph = self.clone();
        let sent = self.inner.confinement.perform(move |state| {
            let Some(completion) = in_job.lock().take() else {
                return;
            };
            let job = match state.commit() {
                Ok(outcome) => graph.committed(outcome, completion),
                Err(error) => {
                    tracing::warn!(connection = graph.inner.id, error = %error, "commit failed");
                    DispatchJob::Failed { error, completion }
                }
            };
            let store = Arc::clone(&graph.inner.store);
            drop(graph);
            store.dispatcher.submit(job);
        });
        if sent.is_err() {
            if let Some(completion) = pending.lock().take() {
                completion(Err(GraphError::Disconnected));
            }
        }
    }

    /// Runs on the worker right after a successful store commit.
    fn committed(&self, outcome: CommitOutcome, completion: Completion) -> DispatchJob {
        let commit = CommitId::new();
        tracing::debug!(
            commit = %commit,
            connection = self.inner.id,
            facts = outcome.facts.len(),
            remote = self.inner.remote,
            "commit applied"
        );
        self.inner
            .store
            .broadcast_refresh(self.inner.id, &outcome.touched);
        let deliveries = outcome
            .facts
            .into_iter()
            .map(|(fact, descriptor)| (fact, Node::new(self, descriptor)))
            .collect();
        DispatchJob::Committed {
            commit,
            originated_remotely: self.inner.remote,
            deliveries,
            completion,
        }
    }

    /// [`commit`](Self::commit) and block until its completion runs.
    ///
    /// Must not be called from inside a watcher: the completion runs on the
    /// dispatcher thread that the watcher is occupying.
    pub fn commit_and_wait(&self) -> Result<CommitReceipt> {
        let (tx, rx) = mpsc::sync_channel(1);
        self.commit(move |result| {
            let _ = tx.send(result);
        });
        rx.recv().map_err(|_| GraphError::Disconnected)?
    }

    /// Discard every staged mutation on this connection. Durable records
    /// return to their last committed state; new records become unstaged.
    pub fn rollback(&self) -> Result<()> {
        self.run(|s| {
            s.rollback();
            Ok(())
        })
    }

    /// Look up a record by id, from this connection's cache or the store.
    pub fn node(&self, id: &ObjectId) -> Result<Option<Node>> {
        let id = id.clone();
        let found = self.run(move |s| s.load(&id))?;
        Ok(found.map(|d| Node::new(self, d)))
    }

    /// Live records matching `predicate`, including ones staged on this
    /// connection but not yet committed.
    ///
    /// Tags and property names match when the record carries at least one
    /// of them.
    pub fn search(&self, predicate: &WatchPredicate) -> Result<Vec<Node>> {
        let kinds = match predicate.kind() {
            Some(kind) => vec![kind],
            None => vec![ObjectKind::Entity, ObjectKind::Relationship, ObjectKind::Action],
        };
        let mut nodes = Vec::new();
        for kind in kinds {
            let found = self.search_kind(
                kind,
                predicate.type_filter().clone(),
                predicate.tag_filter().clone(),
                predicate.property_filter().clone(),
            )?;
            nodes.extend(found.into_iter().map(|d| Node::new(self, d)));
        }
        Ok(nodes)
    }

    pub fn search_for_entity<I, S>(&self, types: I) -> Result<Vec<Entity>>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let nodes = self.search(&WatchPredicate::entity().types(types))?;
        Ok(nodes
            .into_iter()
            .filter_map(|n| match n {
                Node::Entity(e) => Some(e),
                _ => None,
            })
            .collect())
    }

    pub fn search_for_relationship<I, S>(&self, types: I) -> Result<Vec<Relationship>>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let nodes = self.search(&WatchPredicate::relationship().types(types))?;
        Ok(nodes
            .into_iter()
            .filter_map(|n| match n {
                Node::Relationship(r) => Some(r),
                _ => None,
            })
            .collect())
    }

    pub fn search_for_action<I, S>(&self, types: I) -> Result<Vec<Action>>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let nodes = self.search(&WatchPredicate::action().types(types))?;
        Ok(nodes
            .into_iter()
            .filter_map(|n| match n {
                Node::Action(a) => Some(a),
                _ => None,
            })
            .collect())
    }

    fn search_kind(
        &self,
        kind: ObjectKind,
        types: BTreeSet<String>,
        tags: BTreeSet<String>,
        properties: BTreeSet<String>,
    ) -> Result<Vec<Descriptor>> {
        self.run(move |s| s.search(kind, &types, &tags, &properties))
    }

    pub fn watch(&self, predicate: WatchPredicate, watcher: impl GraphWatcher + 'static) -> WatchHandle {
        self.store().watch(predicate, watcher)
    }

    pub fn watch_for_entity<I, S>(&self, types: I, watcher: impl GraphWatcher + 'static) -> WatchHandle
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.store().watch_for_entity(types, watcher)
    }

    pub fn watch_for_relationship<I, S>(
        &self,
        types: I,
        watcher: impl GraphWatcher + 'static,
    ) -> WatchHandle
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.store().watch_for_relationship(types, watcher)
    }

    pub fn watch_for_action<I, S>(&self, types: I, watcher: impl GraphWatcher + 'static) -> WatchHandle
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.store().watch_for_action(types, watcher)
    }

    pub fn unwatch(&self, handle: WatchHandle) -> bool {
        self.store().unwatch(handle)
    }
}

impl std::fmt::Debug for Graph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Graph")
            .field("connection", &self.inner.id)
            .field("remote", &self.inner.remote)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
