//! Watch predicates and the registry that matches change facts against them.
//!
//! The registry is copy-on-write: every register/unregister publishes a new
//! immutable [`WatchIndex`], and a dispatch works on the index it grabbed at
//! the start of its batch. Watches registered later never see that batch.
//! Unregistering also flips the entry's `active` flag, which the dispatcher
//! checks before every delivery, so an unregistered watch stops receiving
//! facts immediately, even mid-batch.

use crate::change::{ChangeFact, CommitId, FactDetail};
use crate::node::Node;
use crate::record::ObjectKind;
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Filter over change facts.
///
/// An empty set means "any". Tag filters only constrain tag facts and
/// property filters only constrain property facts; object facts pass on kind
/// and type alone.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct WatchPredicate {
    kind: Option<ObjectKind>,
    types: BTreeSet<String>,
    tags: BTreeSet<String>,
    properties: BTreeSet<String>,
}

fn to_set<I, S>(items: I) -> BTreeSet<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    items.into_iter().map(Into::into).collect()
}

impl WatchPredicate {
    pub fn entity() -> Self {
        Self::for_kind(ObjectKind::Entity)
    }

    pub fn relationship() -> Self {
        Self::for_kind(ObjectKind::Relationship)
    }

    pub fn action() -> Self {
        Self::for_kind(ObjectKind::Action)
    }

    /// Every kind.
    pub fn any() -> Self {
        Self::default()
    }

    pub fn for_kind(kind: ObjectKind) -> Self {
        Self {
            kind: Some(kind),
            ..Self::default()
        }
    }

    pub fn types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.types.extend(to_set(types));
        self
    }

    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(to_set(tags));
        self
    }

    pub fn properties<I, S>(mut self, properties: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.properties.extend(to_set(properties));
        self
    }

    pub fn kind(&self) -> Option<ObjectKind> {
        self.kind
    }

    pub fn type_filter(&self) -> &BTreeSet<String> {
        &self.types
    }

    pub fn tag_filter(&self) -> &BTreeSet<String> {
        &self.tags
    }

    pub fn property_filter(&self) -> &BTreeSet<String> {
        &self.properties
    }

    pub fn matches(&self, fact: &ChangeFact) -> bool {
        self.kind.is_none_or(|k| k == fact.object_kind)
            && (self.types.is_empty() || self.types.contains(&fact.object_type))
            && self.matches_detail(fact)
    }

    fn matches_detail(&self, fact: &ChangeFact) -> bool {
        match &fact.detail {
            FactDetail::Object => true,
            FactDetail::Tag { name } => self.tags.is_empty() || self.tags.contains(name),
            FactDetail::Property { name, .. } => {
                self.properties.is_empty() || self.properties.contains(name)
            }
        }
    }
}

/// Returned by registration; pass it back to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WatchHandle(pub u64);

impl std::fmt::Display for WatchHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "watch#{}", self.0)
    }
}

/// One delivery to one watcher.
#[derive(Debug, Clone, Copy)]
pub struct WatchEvent<'a> {
    /// The object the fact is about, bound to the committing connection.
    pub node: &'a Node,
    pub fact: &'a ChangeFact,
    /// `true` when the commit came from a remote (sync) connection.
    pub originated_remotely: bool,
    pub commit: CommitId,
    /// The watch this delivery is for.
    pub watch: WatchHandle,
}

pub type WatchResult = std::result::Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// Receives the facts its predicate matches.
///
/// Called on the store's dispatcher thread. A watcher may read and mutate
/// graph objects and may start new commits, but must not block waiting for
/// a commit to complete.
pub trait GraphWatcher: Send + Sync {
    fn on_change(&self, event: &WatchEvent<'_>) -> WatchResult;
}

impl<F> GraphWatcher for F
where
    F: Fn(&WatchEvent<'_>) -> WatchResult + Send + Sync,
{
    fn on_change(&self, event: &WatchEvent<'_>) -> WatchResult {
        self(event)
    }
}

pub(crate) struct WatchEntry {
    pub(crate) handle: WatchHandle,
    pub(crate) predicate: WatchPredicate,
    pub(crate) watcher: Arc<dyn GraphWatcher>,
    active: AtomicBool,
}

impl WatchEntry {
    pub(crate) fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

#[derive(Default)]
struct KindBucket {
    by_type: HashMap<String, Vec<usize>>,
    any_type: Vec<usize>,
}

/// Immutable lookup structure from a fact to the watches it may match.
///
/// Entries are bucketed by kind (or "any kind") and then by type (or "any
/// type"), so a lookup touches at most four short lists before the tag and
/// property filters run.
#[derive(Default)]
pub(crate) struct WatchIndex {
    entries: Vec<Arc<WatchEntry>>,
    buckets: HashMap<Option<ObjectKind>, KindBucket>,
}

impl WatchIndex {
    fn build(entries: Vec<Arc<WatchEntry>>) -> Self {
        let mut buckets: HashMap<Option<ObjectKind>, KindBucket> = HashMap::new();
        for (position, entry) in entries.iter().enumerate() {
            let bucket = buckets.entry(entry.predicate.kind).or_default();
            if entry.predicate.types.is_empty() {
                bucket.any_type.push(position);
            } else {
                for object_type in &entry.predicate.types {
                    bucket
                        .by_type
                        .entry(object_type.clone())
                        .or_default()
                        .push(position);
                }
            }
        }
        Self { entries, buckets }
    }

    /// Active watches matching `fact`, in registration order.
    pub(crate) fn matching(&self, fact: &ChangeFact) -> Vec<&Arc<WatchEntry>> {
        let mut positions = Vec::new();
        for kind in [Some(fact.object_kind), None] {
            if let Some(bucket) = self.buckets.get(&kind) {
                if let Some(typed) = bucket.by_type.get(&fact.object_type) {
                    positions.extend_from_slice(typed);
                }
                positions.extend_from_slice(&bucket.any_type);
            }
        }
        positions.sort_unstable();
        positions.dedup();
        positions
            .into_iter()
            .map(|p| &self.entries[p])
            .filter(|e| e.is_active() && e.predicate.matches_detail(fact))
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Registered watches of one store.
pub struct WatchRegistry {
    next: AtomicU64,
    index: RwLock<Arc<WatchIndex>>,
}

impl Default for WatchRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl WatchRegistry {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
            index: RwLock::new(Arc::new(WatchIndex::default())),
        }
    }

    /// Add a watch. Never fails; an empty predicate matches everything.
    pub fn register(&self, predicate: WatchPredicate, watcher: Arc<dyn GraphWatcher>) -> WatchHandle {
        let handle = WatchHandle(self.next.fetch_add(1, Ordering::Relaxed));
        let entry = Arc::new(WatchEntry {
            handle,
            predicate,
            watcher,
            active: AtomicBool::new(true),
        });
        let mut index = self.index.write();
        let mut entries = index.entries.clone();
        entries.push(entry);
        *index = Arc::new(WatchIndex::build(entries));
        handle
    }

    /// Remove a watch. Returns whether it was registered.
    pub fn unregister(&self, handle: WatchHandle) -> bool {
        let mut index = self.index.write();
        let Some(entry) = index.entries.iter().find(|e| e.handle == handle) else {
            return false;
        };
        entry.active.store(false, Ordering::Release);
        let entries = index
            .entries
            .iter()
            .filter(|e| e.handle != handle)
            .cloned()
            .collect();
        *index = Arc::new(WatchIndex::build(entries));
        true
    }

    /// Handles of the watches currently matching `fact`.
    pub fn matches(&self, fact: &ChangeFact) -> Vec<WatchHandle> {
        self.snapshot()
            .matching(fact)
            .into_iter()
            .map(|e| e.handle)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.index.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn snapshot(&self) -> Arc<WatchIndex> {
        Arc::clone(&self.index.read())
    }
}
