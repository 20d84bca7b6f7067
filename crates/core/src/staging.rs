//! Connection-local record cache, staging area and commit diff.
//!
//! A [`ConnectionState`] is owned by exactly one confinement worker; every
//! method here runs on that worker's thread. Records are addressed by
//! [`Slot`], a connection-local handle that exists before the record has a
//! permanent id and never changes afterwards.
//!
//! Every [`Descriptor`] handed out carries a [`SlotToken`]. When the last
//! token for a slot is dropped the slot is released, and the next job on
//! the worker discards the record unless it is durable with staged work or
//! still linked from another record. Discarded slots are reused.

use crate::backend::{Backend, StoreWrite};
use crate::change::{Change, ChangeFact, FactDetail};
use crate::record::{Links, ObjectId, ObjectKind, StoredRecord};
use crate::value::Value;
use crate::{GraphError, Result};
use chrono::{DateTime, Utc};
use indexmap::IndexSet;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Weak};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(crate) struct Slot(pub(crate) usize);

/// Which end of a link an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    Subject,
    Object,
}

#[derive(Debug, Clone, PartialEq)]
struct Body {
    properties: BTreeMap<String, Value>,
    tags: BTreeSet<String>,
    links: Links<Slot>,
}

impl Body {
    fn empty(kind: ObjectKind) -> Self {
        Self {
            properties: BTreeMap::new(),
            tags: BTreeSet::new(),
            links: Links::for_kind(kind),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    /// Constructed, never staged. A commit ignores it.
    Transient,
    /// Staged or durable.
    Live,
    /// Removal staged for the next commit.
    Deleted,
    /// Removed by a commit, or deleted before it was ever staged.
    Removed,
}

#[derive(Debug)]
struct Record {
    kind: ObjectKind,
    object_type: String,
    created_at: DateTime<Utc>,
    id: Option<ObjectId>,
    lifecycle: Lifecycle,
    /// Body as of the last successful commit. `None` until first durable.
    committed: Option<Body>,
    working: Body,
}

/// Static facts about a record that never change after construction.
#[derive(Debug, Clone)]
pub(crate) struct Descriptor {
    pub(crate) slot: Slot,
    pub(crate) kind: ObjectKind,
    pub(crate) object_type: String,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) token: Arc<SlotToken>,
}

/// Tracks which slots still have handles outside the worker.
#[derive(Default)]
struct HandleTable {
    held: Mutex<HashMap<Slot, Weak<SlotToken>>>,
    /// Slots whose last token was dropped, possibly on another thread.
    released: Mutex<Vec<Slot>>,
}

impl HandleTable {
    fn token(self: &Arc<Self>, slot: Slot) -> Arc<SlotToken> {
        let mut held = self.held.lock();
        if let Some(token) = held.get(&slot).and_then(Weak::upgrade) {
            return token;
        }
        let token = Arc::new(SlotToken {
            slot,
            table: Arc::clone(self),
        });
        held.insert(slot, Arc::downgrade(&token));
        token
    }

    fn is_held(&self, slot: Slot) -> bool {
        self.held
            .lock()
            .get(&slot)
            .is_some_and(|token| token.strong_count() > 0)
    }

    fn forget(&self, slot: Slot) {
        let mut held = self.held.lock();
        if held.get(&slot).is_some_and(|token| token.strong_count() == 0) {
            held.remove(&slot);
        }
    }

    fn take_released(&self) -> Vec<Slot> {
        std::mem::take(&mut *self.released.lock())
    }
}

/// Keeps a slot's record alive while any handle to it exists.
pub(crate) struct SlotToken {
    slot: Slot,
    table: Arc<HandleTable>,
}

impl Drop for SlotToken {
    fn drop(&mut self) {
        self.table.released.lock().push(self.slot);
    }
}

impl std::fmt::Debug for SlotToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("SlotToken").field(&self.slot.0).finish()
    }
}

/// Result of a successful commit, before notification.
#[derive(Debug, Default)]
pub(crate) struct CommitOutcome {
    /// Facts in pipeline order, each with the slot of the object it is about.
    pub(crate) facts: Vec<(ChangeFact, Descriptor)>,
    /// Every record the commit wrote, removed or detached.
    pub(crate) touched: Vec<ObjectId>,
}

pub(crate) struct ConnectionState {
    backend: Arc<dyn Backend>,
    records: Vec<Record>,
    by_id: HashMap<ObjectId, Slot>,
    staged: IndexSet<Slot>,
    handles: Arc<HandleTable>,
    /// Discarded slots, ready for reuse.
    free: BTreeSet<Slot>,
    /// Released slots that could not be discarded yet.
    parked: BTreeSet<Slot>,
    /// Set when staging or links changed, so parked slots get another look.
    revisit: bool,
}

impl ConnectionState {
    pub(crate) fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            backend,
            records: Vec::new(),
            by_id: HashMap::new(),
            staged: IndexSet::new(),
            handles: Arc::new(HandleTable::default()),
            free: BTreeSet::new(),
            parked: BTreeSet::new(),
            revisit: false,
        }
    }

    fn allocate(&mut self, record: Record) -> Slot {
        match self.free.pop_first() {
            Some(slot) => {
                self.records[slot.0] = record;
                slot
            }
            None => {
                self.records.push(record);
                Slot(self.records.len() - 1)
            }
        }
    }

    pub(crate) fn create(&mut self, kind: ObjectKind, object_type: &str) -> Result<Descriptor> {
        if object_type.is_empty() {
            return Err(GraphError::InvalidMutation(format!(
                "{kind} type must not be empty"
            )));
        }
        let slot = self.allocate(Record {
            kind,
            object_type: object_type.to_string(),
            created_at: Utc::now(),
            id: None,
            lifecycle: Lifecycle::Transient,
            committed: None,
            working: Body::empty(kind),
        });
        Ok(self.descriptor(slot))
    }

    fn descriptor(&self, slot: Slot) -> Descriptor {
        let record = &self.records[slot.0];
        Descriptor {
            slot,
            kind: record.kind,
            object_type: record.object_type.clone(),
            created_at: record.created_at,
            token: self.handles.token(slot),
        }
    }

    fn record(&self, slot: Slot) -> Result<&Record> {
        self.records
            .get(slot.0)
            .ok_or_else(|| GraphError::NotFound(format!("slot {}", slot.0)))
    }

    /// Mutable access for a write. Deleted records reject writes.
    fn writable(&mut self, slot: Slot) -> Result<&mut Record> {
        let record = self
            .records
            .get_mut(slot.0)
            .ok_or_else(|| GraphError::NotFound(format!("slot {}", slot.0)))?;
        match record.lifecycle {
            Lifecycle::Deleted | Lifecycle::Removed => Err(GraphError::InvalidMutation(format!(
                "{} of type {} is deleted",
                record.kind, record.object_type
            ))),
            Lifecycle::Transient | Lifecycle::Live => Ok(record),
        }
    }

    fn stage(&mut self, slot: Slot) {
        let record = &mut self.records[slot.0];
        if record.lifecycle == Lifecycle::Transient {
            record.lifecycle = Lifecycle::Live;
        }
        self.staged.insert(slot);
        self.revisit = true;
    }

    // -----------------------------------------------------------------------
    // Identity
    // -----------------------------------------------------------------------

    /// Stage the record and make sure it holds a permanent id.
    ///
    /// Idempotent: every call after the first returns the same id.
    pub(crate) fn materialize(&mut self, slot: Slot) -> Result<ObjectId> {
        if let Some(id) = &self.record(slot)?.id {
            return Ok(id.clone());
        }
        let record = self.writable(slot)?;
        let request = [(record.kind, record.object_type.clone())];
        let id = self
            .backend
            .allocate_ids(&request)
            .map_err(|e| GraphError::IdentityAllocationFailed(e.to_string()))?
            .into_iter()
            .next()
            .ok_or_else(|| {
                GraphError::IdentityAllocationFailed("store returned no identifier".to_string())
            })?;
        self.stage(slot);
        self.records[slot.0].id = Some(id.clone());
        self.by_id.insert(id.clone(), slot);
        Ok(id)
    }

    pub(crate) fn persist(&mut self, slot: Slot) -> Result<()> {
        self.writable(slot)?;
        self.stage(slot);
        Ok(())
    }

    pub(crate) fn is_deleted(&self, slot: Slot) -> Result<bool> {
        let record = self.record(slot)?;
        Ok(matches!(
            record.lifecycle,
            Lifecycle::Deleted | Lifecycle::Removed
        ))
    }

    // -----------------------------------------------------------------------
    // Properties and tags
    // -----------------------------------------------------------------------

    pub(crate) fn property(&self, slot: Slot, name: &str) -> Result<Option<Value>> {
        Ok(self.record(slot)?.working.properties.get(name).cloned())
    }

    pub(crate) fn properties(&self, slot: Slot) -> Result<BTreeMap<String, Value>> {
        Ok(self.record(slot)?.working.properties.clone())
    }

    pub(crate) fn set_property(&mut self, slot: Slot, name: &str, value: Value) -> Result<()> {
        self.writable(slot)?;
        self.stage(slot);
        self.records[slot.0]
            .working
            .properties
            .insert(name.to_string(), value);
        Ok(())
    }

    pub(crate) fn remove_property(&mut self, slot: Slot, name: &str) -> Result<Option<Value>> {
        let removed = self.writable(slot)?.working.properties.remove(name);
        if removed.is_some() {
            self.stage(slot);
        }
        Ok(removed)
    }

    pub(crate) fn has_tag(&self, slot: Slot, tag: &str) -> Result<bool> {
        Ok(self.record(slot)?.working.tags.contains(tag))
    }

    pub(crate) fn tags(&self, slot: Slot) -> Result<BTreeSet<String>> {
        Ok(self.record(slot)?.working.tags.clone())
    }

    pub(crate) fn add_tag(&mut self, slot: Slot, tag: &str) -> Result<()> {
        if self.writable(slot)?.working.tags.insert(tag.to_string()) {
            self.stage(slot);
        }
        Ok(())
    }

    pub(crate) fn remove_tag(&mut self, slot: Slot, tag: &str) -> Result<()> {
        if self.writable(slot)?.working.tags.remove(tag) {
            self.stage(slot);
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Deletion
    // -----------------------------------------------------------------------

    /// Stage a full removal.
    ///
    /// Properties, tags and outgoing links are cleared in the same step that
    /// marks the record deleted, and every cached record referencing it
    /// drops the reference.
    pub(crate) fn delete(&mut self, slot: Slot) -> Result<()> {
        let record = self
            .records
            .get_mut(slot.0)
            .ok_or_else(|| GraphError::NotFound(format!("slot {}", slot.0)))?;
        match record.lifecycle {
            Lifecycle::Deleted | Lifecycle::Removed => return Ok(()),
            Lifecycle::Transient => record.lifecycle = Lifecycle::Removed,
            Lifecycle::Live => record.lifecycle = Lifecycle::Deleted,
        }
        record.working = Body::empty(record.kind);
        if record.lifecycle == Lifecycle::Deleted {
            self.staged.insert(slot);
        }
        self.revisit = true;

        let mut referrers = Vec::new();
        for (index, other) in self.records.iter_mut().enumerate() {
            if index != slot.0 && other.working.links.detach(&slot) {
                referrers.push(Slot(index));
            }
        }
        for referrer in referrers {
            if self.records[referrer.0].lifecycle == Lifecycle::Live {
                self.stage(referrer);
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Links
    // -----------------------------------------------------------------------

    /// Validate a link target: an entity that is not deleted. Stages it so
    /// that the two records commit together.
    fn link_target(&mut self, target: Slot) -> Result<()> {
        let record = self.writable(target)?;
        if record.kind != ObjectKind::Entity {
            return Err(GraphError::InvalidMutation(format!(
                "link target must be an entity, got {}",
                record.kind
            )));
        }
        self.stage(target);
        Ok(())
    }

    fn linkable(&mut self, slot: Slot, kind: ObjectKind) -> Result<()> {
        let record = self.writable(slot)?;
        if record.kind != kind {
            return Err(GraphError::InvalidMutation(format!(
                "expected a {kind}, got a {}",
                record.kind
            )));
        }
        Ok(())
    }

    fn live(&self, slot: Slot) -> bool {
        matches!(
            self.records.get(slot.0).map(|r| r.lifecycle),
            Some(Lifecycle::Live | Lifecycle::Transient)
        )
    }

    pub(crate) fn set_pair(&mut self, slot: Slot, role: Role, target: Option<Slot>) -> Result<()> {
        self.linkable(slot, ObjectKind::Relationship)?;
        if let Some(target) = target {
            self.link_target(target)?;
        }
        self.stage(slot);
        if let Links::Pair { subject, object } = &mut self.records[slot.0].working.links {
            match role {
                Role::Subject => *subject = target,
                Role::Object => *object = target,
            }
        }
        Ok(())
    }

    pub(crate) fn pair(&self, slot: Slot, role: Role) -> Result<Option<Descriptor>> {
        let target = match &self.record(slot)?.working.links {
            Links::Pair { subject, object } => match role {
                Role::Subject => *subject,
                Role::Object => *object,
            },
            _ => None,
        };
        Ok(target
            .filter(|t| self.live(*t))
            .map(|t| self.descriptor(t)))
    }

    pub(crate) fn push_many(&mut self, slot: Slot, role: Role, target: Slot) -> Result<()> {
        self.linkable(slot, ObjectKind::Action)?;
        self.link_target(target)?;
        self.stage(slot);
        if let Links::Many { subjects, objects } = &mut self.records[slot.0].working.links {
            match role {
                Role::Subject => subjects.push(target),
                Role::Object => objects.push(target),
            }
        }
        Ok(())
    }

    /// Remove the first occurrence of `target`. Returns whether it was present.
    pub(crate) fn remove_many(&mut self, slot: Slot, role: Role, target: Slot) -> Result<bool> {
        self.linkable(slot, ObjectKind::Action)?;
        let removed = match &mut self.records[slot.0].working.links {
            Links::Many { subjects, objects } => {
                let list = match role {
                    Role::Subject => subjects,
                    Role::Object => objects,
                };
                match list.iter().position(|t| *t == target) {
                    Some(index) => {
                        list.remove(index);
                        true
                    }
                    None => false,
                }
            }
            _ => false,
        };
        if removed {
            self.stage(slot);
        }
        Ok(removed)
    }

    pub(crate) fn many(&self, slot: Slot, role: Role) -> Result<Vec<Descriptor>> {
        let list = match &self.record(slot)?.working.links {
            Links::Many { subjects, objects } => match role {
                Role::Subject => subjects.clone(),
                Role::Object => objects.clone(),
            },
            _ => Vec::new(),
        };
        Ok(list
            .into_iter()
            .filter(|t| self.live(*t))
            .map(|t| self.descriptor(t))
            .collect())
    }

    // -----------------------------------------------------------------------
    // Loading from the store
    // -----------------------------------------------------------------------

    /// Slot for a durable record, loading it on first access.
    pub(crate) fn load(&mut self, id: &ObjectId) -> Result<Option<Descriptor>> {
        if let Some(slot) = self.by_id.get(id).copied() {
            if self.records[slot.0].lifecycle == Lifecycle::Removed {
                return Ok(None);
            }
            return Ok(Some(self.descriptor(slot)));
        }
        match self.backend.load(id)? {
            Some(stored) => self.adopt(stored).map(Some),
            None => Ok(None),
        }
    }

    fn adopt(&mut self, stored: StoredRecord) -> Result<Descriptor> {
        if let Some(slot) = self.by_id.get(&stored.id) {
            return Ok(self.descriptor(*slot));
        }
        let slot = self.allocate(Record {
            kind: stored.kind,
            object_type: stored.object_type.clone(),
            created_at: stored.created_at,
            id: Some(stored.id.clone()),
            lifecycle: Lifecycle::Live,
            committed: None,
            working: Body::empty(stored.kind),
        });
        self.by_id.insert(stored.id.clone(), slot);

        let body = self.resolve(stored)?;
        let record = &mut self.records[slot.0];
        record.committed = Some(body.clone());
        record.working = body;
        Ok(self.descriptor(slot))
    }

    fn resolve(&mut self, stored: StoredRecord) -> Result<Body> {
        let mut slots = HashMap::new();
        for target in stored.links.targets() {
            if let Some(found) = self.load(target)? {
                slots.insert(target.clone(), found.slot);
            }
        }
        Ok(Body {
            properties: stored.properties,
            tags: stored.tags,
            links: stored.links.map(|id| slots.get(id).copied()),
        })
    }

    /// Reload cached copies of records another connection just committed.
    ///
    /// Records with local staged changes are rebased: whatever this
    /// connection has not touched takes the stored value.
    pub(crate) fn refresh(&mut self, ids: &[ObjectId]) -> Result<()> {
        self.revisit = true;
        for id in ids {
            let Some(slot) = self.by_id.get(id).copied() else {
                continue;
            };
            let staged = self.staged.contains(&slot);
            match self.backend.load(id)? {
                Some(stored) => {
                    let body = self.resolve(stored)?;
                    if staged {
                        self.rebase_onto(slot, body);
                    } else {
                        let record = &mut self.records[slot.0];
                        record.working = body.clone();
                        record.committed = Some(body);
                    }
                }
                None => {
                    let record = &mut self.records[slot.0];
                    record.committed = None;
                    if !staged {
                        record.lifecycle = Lifecycle::Removed;
                        record.working = Body::empty(record.kind);
                        self.detach_everywhere(slot);
                    }
                }
            }
        }
        Ok(())
    }

    /// Move the committed baseline to `theirs`, carrying over local edits.
    fn rebase_onto(&mut self, slot: Slot, theirs: Body) {
        let record = &mut self.records[slot.0];
        if let (Lifecycle::Live, Some(base)) = (record.lifecycle, record.committed.as_ref()) {
            rebase(&mut record.working, base, &theirs);
        }
        record.committed = Some(theirs);
    }

    /// Rebase every staged durable record on the store's current copy.
    fn rebase_staged(&mut self) -> Result<()> {
        let durable: Vec<(Slot, ObjectId)> = self
            .staged
            .iter()
            .filter_map(|slot| {
                let record = &self.records[slot.0];
                match (&record.id, &record.committed) {
                    (Some(id), Some(_)) => Some((*slot, id.clone())),
                    _ => None,
                }
            })
            .collect();
        for (slot, id) in durable {
            let stored = self
                .backend
                .load(&id)
                .map_err(|e| GraphError::StoreCommitFailed(e.to_string()))?;
            match stored {
                Some(stored) => {
                    let theirs = self.resolve(stored)?;
                    self.rebase_onto(slot, theirs);
                }
                None => self.records[slot.0].committed = None,
            }
        }
        Ok(())
    }

    fn detach_everywhere(&mut self, slot: Slot) {
        for record in &mut self.records {
            record.working.links.detach(&slot);
            if let Some(committed) = &mut record.committed {
                committed.links.detach(&slot);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Search
    // -----------------------------------------------------------------------

    /// Live records of `kind` matching the filters, durable ones first in
    /// store order, then records only staged on this connection.
    pub(crate) fn search(
        &mut self,
        kind: ObjectKind,
        types: &BTreeSet<String>,
        tags: &BTreeSet<String>,
        properties: &BTreeSet<String>,
    ) -> Result<Vec<Descriptor>> {
        let mut slots = IndexSet::new();
        for stored in self.backend.scan(kind, types)? {
            slots.insert(self.adopt(stored)?.slot);
        }
        for slot in self.staged.iter() {
            let record = &self.records[slot.0];
            if record.kind == kind
                && (types.is_empty() || types.contains(&record.object_type))
            {
                slots.insert(*slot);
            }
        }

        Ok(slots
            .into_iter()
            .filter(|slot| {
                let record = &self.records[slot.0];
                record.lifecycle == Lifecycle::Live
                    && (tags.is_empty() || tags.iter().any(|t| record.working.tags.contains(t)))
                    && (properties.is_empty()
                        || properties
                            .iter()
                            .any(|p| record.working.properties.contains_key(p)))
            })
            .map(|slot| self.descriptor(slot))
            .collect())
    }

    // -----------------------------------------------------------------------
    // Commit
    // -----------------------------------------------------------------------

    /// Apply every staged mutation through the backend.
    ///
    /// Durable records are first rebased on the store's copy, so the diff
    /// covers only what this connection changed and concurrent edits to
    /// other fields survive. On failure staged mutations stay pending and
    /// ids reserved for new records are kept for the retry.
    pub(crate) fn commit(&mut self) -> Result<CommitOutcome> {
        self.rebase_staged()?;
        self.reserve_ids()?;

        let mut writes = Vec::new();
        let mut facts = Vec::new();
        for slot in self.staged.iter().copied() {
            let record = &self.records[slot.0];
            let Some(id) = record.id.clone() else {
                continue;
            };
            let head = ChangeFact::object(Change::Inserted, &id, record.kind, &record.object_type);
            let descriptor = self.descriptor(slot);
            match (record.lifecycle, &record.committed) {
                (Lifecycle::Live, None) => {
                    facts.extend(
                        inserted_facts(&head, &record.working)
                            .into_iter()
                            .map(|f| (f, descriptor.clone())),
                    );
                    writes.push(StoreWrite::Upsert(self.stored_form(slot, &id)));
                }
                (Lifecycle::Live, Some(base)) if *base != record.working => {
                    facts.extend(
                        updated_facts(&head, base, &record.working)
                            .into_iter()
                            .map(|f| (f, descriptor.clone())),
                    );
                    writes.push(StoreWrite::Upsert(self.stored_form(slot, &id)));
                }
                (Lifecycle::Deleted, Some(base)) => {
                    facts.extend(
                        deleted_facts(&head, base)
                            .into_iter()
                            .map(|f| (f, descriptor.clone())),
                    );
                    writes.push(StoreWrite::Remove(id));
                }
                _ => {}
            }
        }

        let detached = if writes.is_empty() {
            Vec::new()
        } else {
            self.backend
                .commit(&writes)
                .map_err(|e| GraphError::StoreCommitFailed(e.to_string()))?
        };

        let mut removed = Vec::new();
        for slot in std::mem::take(&mut self.staged) {
            let record = &mut self.records[slot.0];
            match record.lifecycle {
                Lifecycle::Live => record.committed = Some(record.working.clone()),
                Lifecycle::Deleted => {
                    record.lifecycle = Lifecycle::Removed;
                    record.committed = None;
                    removed.push(slot);
                }
                Lifecycle::Transient | Lifecycle::Removed => {}
            }
        }
        for slot in removed {
            self.detach_everywhere(slot);
        }
        self.revisit = true;

        let mut touched: Vec<ObjectId> = writes
            .into_iter()
            .map(|w| match w {
                StoreWrite::Upsert(record) => record.id,
                StoreWrite::Remove(id) => id,
            })
            .collect();
        touched.extend(detached);
        Ok(CommitOutcome { facts, touched })
    }

    /// Throw away every staged mutation. Durable records return to their
    /// committed state and new records become unstaged.
    pub(crate) fn rollback(&mut self) {
        for slot in std::mem::take(&mut self.staged) {
            let record = &mut self.records[slot.0];
            match &record.committed {
                Some(base) => {
                    record.working = base.clone();
                    record.lifecycle = Lifecycle::Live;
                }
                None => {
                    record.working = Body::empty(record.kind);
                    record.lifecycle = Lifecycle::Transient;
                }
            }
        }
        self.revisit = true;
    }

    // -----------------------------------------------------------------------
    // Slot reclamation
    // -----------------------------------------------------------------------

    /// Discard records whose handles have all been dropped.
    ///
    /// A record is kept while it is durable with staged work, or while any
    /// other record links to it. Discarding a record can free the records
    /// it linked to.
    pub(crate) fn reclaim(&mut self) {
        let mut pending = self.handles.take_released();
        if self.revisit {
            self.revisit = false;
            pending.extend(std::mem::take(&mut self.parked));
        }
        if pending.is_empty() {
            return;
        }

        let mut referenced: HashMap<Slot, usize> = HashMap::new();
        for record in &self.records {
            for body in std::iter::once(&record.working).chain(record.committed.as_ref()) {
                for target in body.links.targets() {
                    *referenced.entry(*target).or_default() += 1;
                }
            }
        }

        let mut discarded = 0usize;
        while let Some(slot) = pending.pop() {
            if slot.0 >= self.records.len()
                || self.free.contains(&slot)
                || self.handles.is_held(slot)
            {
                continue;
            }
            let pinned = self.records[slot.0].committed.is_some() && self.staged.contains(&slot);
            let linked = referenced.get(&slot).is_some_and(|n| *n > 0);
            if pinned || linked {
                self.parked.insert(slot);
                continue;
            }
            for target in self.discard(slot) {
                if let Some(n) = referenced.get_mut(&target) {
                    *n = n.saturating_sub(1);
                }
                pending.push(target);
            }
            discarded += 1;
        }
        if discarded > 0 {
            tracing::trace!(discarded, free = self.free.len(), "reclaimed slots");
        }
    }

    /// Drop a record from the cache and free its slot. Returns the slots
    /// its links pointed at.
    fn discard(&mut self, slot: Slot) -> Vec<Slot> {
        self.staged.shift_remove(&slot);
        self.parked.remove(&slot);
        self.handles.forget(slot);
        self.free.insert(slot);
        let record = &mut self.records[slot.0];
        if let Some(id) = record.id.take() {
            self.by_id.remove(&id);
        }
        record.lifecycle = Lifecycle::Removed;
        let committed = record.committed.take();
        let working = std::mem::replace(&mut record.working, Body::empty(record.kind));
        let targets: Vec<Slot> = working
            .links
            .targets()
            .into_iter()
            .chain(committed.iter().flat_map(|body| body.links.targets()))
            .copied()
            .collect();
        targets
    }

    fn reserve_ids(&mut self) -> Result<()> {
        let pending: Vec<Slot> = self
            .staged
            .iter()
            .copied()
            .filter(|slot| {
                let record = &self.records[slot.0];
                record.id.is_none() && record.lifecycle == Lifecycle::Live
            })
            .collect();
        if pending.is_empty() {
            return Ok(());
        }
        let requests: Vec<(ObjectKind, String)> = pending
            .iter()
            .map(|slot| {
                let record = &self.records[slot.0];
                (record.kind, record.object_type.clone())
            })
            .collect();
        let ids = self
            .backend
            .allocate_ids(&requests)
            .map_err(|e| GraphError::IdentityAllocationFailed(e.to_string()))?;
        if ids.len() != pending.len() {
            return Err(GraphError::IdentityAllocationFailed(format!(
                "requested {} identifiers, store returned {}",
                pending.len(),
                ids.len()
            )));
        }
        for (slot, id) in pending.into_iter().zip(ids) {
            self.records[slot.0].id = Some(id.clone());
            self.by_id.insert(id, slot);
        }
        Ok(())
    }

    fn stored_form(&self, slot: Slot, id: &ObjectId) -> StoredRecord {
        let record = &self.records[slot.0];
        StoredRecord {
            id: id.clone(),
            kind: record.kind,
            object_type: record.object_type.clone(),
            created_at: record.created_at,
            properties: record.working.properties.clone(),
            tags: record.working.tags.clone(),
            links: record.working.links.map(|target| {
                let target = &self.records[target.0];
                match target.lifecycle {
                    Lifecycle::Live => target.id.clone(),
                    _ => None,
                }
            }),
        }
    }
}

/// Carry another connection's changes from `base` to `theirs` into
/// `working`, keeping every property, tag and link edited locally.
fn rebase(working: &mut Body, base: &Body, theirs: &Body) {
    let names: BTreeSet<String> = base
        .properties
        .keys()
        .chain(theirs.properties.keys())
        .cloned()
        .collect();
    for name in names {
        if working.properties.get(&name) != base.properties.get(&name) {
            continue;
        }
        match theirs.properties.get(&name) {
            Some(value) => {
                working.properties.insert(name, value.clone());
            }
            None => {
                working.properties.remove(&name);
            }
        }
    }

    let tags: BTreeSet<String> = base.tags.union(&theirs.tags).cloned().collect();
    for tag in tags {
        if working.tags.contains(&tag) != base.tags.contains(&tag) {
            continue;
        }
        if theirs.tags.contains(&tag) {
            working.tags.insert(tag);
        } else {
            working.tags.remove(&tag);
        }
    }

    if working.links == base.links {
        working.links = theirs.links.clone();
    }
}

fn inserted_facts(head: &ChangeFact, body: &Body) -> Vec<ChangeFact> {
    let mut facts = vec![head.clone()];
    for (name, value) in &body.properties {
        facts.push(head.with_detail(
            Change::Inserted,
            FactDetail::Property {
                name: name.clone(),
                value: Some(value.clone()),
                previous: None,
            },
        ));
    }
    for tag in &body.tags {
        facts.push(head.with_detail(Change::Inserted, FactDetail::Tag { name: tag.clone() }));
    }
    facts
}

fn deleted_facts(head: &ChangeFact, base: &Body) -> Vec<ChangeFact> {
    let mut facts = vec![head.with_detail(Change::Deleted, FactDetail::Object)];
    for (name, value) in &base.properties {
        facts.push(head.with_detail(
            Change::Deleted,
            FactDetail::Property {
                name: name.clone(),
                value: None,
                previous: Some(value.clone()),
            },
        ));
    }
    for tag in &base.tags {
        facts.push(head.with_detail(Change::Deleted, FactDetail::Tag { name: tag.clone() }));
    }
    facts
}

/// Net property and tag transitions between two bodies of a durable record.
fn updated_facts(head: &ChangeFact, base: &Body, working: &Body) -> Vec<ChangeFact> {
    let mut facts = Vec::new();

    let names: BTreeSet<&String> = base
        .properties
        .keys()
        .chain(working.properties.keys())
        .collect();
    for name in names {
        let before = base.properties.get(name);
        let after = working.properties.get(name);
        let change = match (before, after) {
            (None, Some(_)) => Change::Inserted,
            (Some(_), None) => Change::Deleted,
            (Some(b), Some(a)) if b != a => Change::Updated,
            _ => continue,
        };
        facts.push(head.with_detail(
            change,
            FactDetail::Property {
                name: name.clone(),
                value: after.cloned(),
                previous: before.cloned(),
            },
        ));
    }

    for tag in working.tags.difference(&base.tags) {
        facts.push(head.with_detail(Change::Inserted, FactDetail::Tag { name: tag.clone() }));
    }
    for tag in base.tags.difference(&working.tags) {
        facts.push(head.with_detail(Change::Deleted, FactDetail::Tag { name: tag.clone() }));
    }
    facts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::RedbBackend;

    fn state() -> ConnectionState {
        ConnectionState::new(Arc::new(RedbBackend::in_memory().unwrap()))
    }

    fn events(outcome: &CommitOutcome) -> Vec<(Change, FactDetail)> {
        outcome
            .facts
            .iter()
            .map(|(f, _)| (f.change, f.detail.clone()))
            .collect()
    }

    #[test]
    fn empty_type_is_rejected() {
        let mut s = state();
        let err = s.create(ObjectKind::Entity, "").unwrap_err();
        assert!(matches!(err, GraphError::InvalidMutation(_)));
    }

    #[test]
    fn transient_records_are_not_committed() {
        let mut s = state();
        s.create(ObjectKind::Entity, "T").unwrap();
        let outcome = s.commit().unwrap();
        assert!(outcome.facts.is_empty());
        assert!(outcome.touched.is_empty());
    }

    #[test]
    fn insert_emits_object_then_properties_then_tags() {
        let mut s = state();
        let e = s.create(ObjectKind::Entity, "T").unwrap().slot;
        s.add_tag(e, "G").unwrap();
        s.set_property(e, "P", Value::Int(111)).unwrap();

        let outcome = s.commit().unwrap();
        assert_eq!(
            events(&outcome),
            vec![
                (Change::Inserted, FactDetail::Object),
                (
                    Change::Inserted,
                    FactDetail::Property {
                        name: "P".into(),
                        value: Some(Value::Int(111)),
                        previous: None
                    }
                ),
                (Change::Inserted, FactDetail::Tag { name: "G".into() }),
            ]
        );
    }

    #[test]
    fn materialize_is_idempotent_and_survives_commit() {
        let mut s = state();
        let e = s.create(ObjectKind::Entity, "T").unwrap().slot;
        let first = s.materialize(e).unwrap();
        assert_eq!(s.materialize(e).unwrap(), first);
        let outcome = s.commit().unwrap();
        assert_eq!(outcome.facts[0].0.object_id, first);
        assert_eq!(s.materialize(e).unwrap(), first);
    }

    #[test]
    fn reverted_writes_produce_no_facts() {
        let mut s = state();
        let e = s.create(ObjectKind::Entity, "T").unwrap().slot;
        s.set_property(e, "P", Value::Int(111)).unwrap();
        s.commit().unwrap();

        s.set_property(e, "P", Value::Int(5)).unwrap();
        s.set_property(e, "P", Value::Int(111)).unwrap();
        s.add_tag(e, "X").unwrap();
        s.remove_tag(e, "X").unwrap();
        let outcome = s.commit().unwrap();
        assert!(outcome.facts.is_empty());
        assert!(outcome.touched.is_empty());
    }

    #[test]
    fn update_reports_old_and_new_values() {
        let mut s = state();
        let e = s.create(ObjectKind::Entity, "T").unwrap().slot;
        s.set_property(e, "P", Value::Int(111)).unwrap();
        s.commit().unwrap();

        s.set_property(e, "P", Value::Int(222)).unwrap();
        let outcome = s.commit().unwrap();
        assert_eq!(
            events(&outcome),
            vec![(
                Change::Updated,
                FactDetail::Property {
                    name: "P".into(),
                    value: Some(Value::Int(222)),
                    previous: Some(Value::Int(111))
                }
            )]
        );
    }

    #[test]
    fn writes_to_deleted_records_are_rejected() {
        let mut s = state();
        let e = s.create(ObjectKind::Entity, "T").unwrap().slot;
        s.set_property(e, "P", Value::Int(1)).unwrap();
        s.delete(e).unwrap();
        assert_eq!(s.property(e, "P").unwrap(), None);
        let err = s.set_property(e, "P", Value::Int(2)).unwrap_err();
        assert!(matches!(err, GraphError::InvalidMutation(_)));
        assert!(matches!(s.add_tag(e, "G"), Err(GraphError::InvalidMutation(_))));
        s.delete(e).unwrap();
    }

    #[test]
    fn deleting_an_uncommitted_record_emits_nothing() {
        let mut s = state();
        let e = s.create(ObjectKind::Entity, "T").unwrap().slot;
        s.set_property(e, "P", Value::Int(1)).unwrap();
        s.delete(e).unwrap();
        let outcome = s.commit().unwrap();
        assert!(outcome.facts.is_empty());
    }

    #[test]
    fn deleting_an_entity_detaches_it_from_links() {
        let mut s = state();
        let person = s.create(ObjectKind::Entity, "Person").unwrap().slot;
        let company = s.create(ObjectKind::Entity, "Company").unwrap().slot;
        let employee = s.create(ObjectKind::Relationship, "Employee").unwrap().slot;
        let meeting = s.create(ObjectKind::Action, "Meeting").unwrap().slot;
        s.set_pair(employee, Role::Subject, Some(person)).unwrap();
        s.set_pair(employee, Role::Object, Some(company)).unwrap();
        s.push_many(meeting, Role::Subject, person).unwrap();
        s.push_many(meeting, Role::Subject, person).unwrap();
        s.push_many(meeting, Role::Object, company).unwrap();
        s.commit().unwrap();

        s.delete(person).unwrap();
        assert!(s.pair(employee, Role::Subject).unwrap().is_none());
        assert_eq!(s.pair(employee, Role::Object).unwrap().unwrap().slot, company);
        assert!(s.many(meeting, Role::Subject).unwrap().is_empty());

        let outcome = s.commit().unwrap();
        let object_facts: Vec<_> = outcome
            .facts
            .iter()
            .filter(|(f, _)| f.detail == FactDetail::Object)
            .map(|(f, _)| (f.change, f.object_kind))
            .collect();
        assert_eq!(object_facts, vec![(Change::Deleted, ObjectKind::Entity)]);
        assert!(!s.is_deleted(employee).unwrap());
    }

    #[test]
    fn links_only_accept_entities() {
        let mut s = state();
        let employee = s.create(ObjectKind::Relationship, "Employee").unwrap().slot;
        let other = s.create(ObjectKind::Relationship, "Employee").unwrap().slot;
        let err = s.set_pair(employee, Role::Subject, Some(other)).unwrap_err();
        assert!(matches!(err, GraphError::InvalidMutation(_)));

        let entity = s.create(ObjectKind::Entity, "Person").unwrap().slot;
        let err = s.push_many(employee, Role::Subject, entity).unwrap_err();
        assert!(matches!(err, GraphError::InvalidMutation(_)));
    }

    #[test]
    fn remove_many_drops_first_occurrence_only() {
        let mut s = state();
        let meeting = s.create(ObjectKind::Action, "Meeting").unwrap().slot;
        let a = s.create(ObjectKind::Entity, "Person").unwrap().slot;
        let b = s.create(ObjectKind::Entity, "Person").unwrap().slot;
        s.push_many(meeting, Role::Object, a).unwrap();
        s.push_many(meeting, Role::Object, b).unwrap();
        s.push_many(meeting, Role::Object, a).unwrap();
        assert!(s.remove_many(meeting, Role::Object, a).unwrap());
        let order: Vec<Slot> = s
            .many(meeting, Role::Object)
            .unwrap()
            .into_iter()
            .map(|d| d.slot)
            .collect();
        assert_eq!(order, vec![b, a]);
    }

    #[test]
    fn committed_records_load_into_a_fresh_connection() {
        let backend: Arc<dyn Backend> = Arc::new(RedbBackend::in_memory().unwrap());
        let mut writer = ConnectionState::new(Arc::clone(&backend));
        let person = writer.create(ObjectKind::Entity, "Person").unwrap().slot;
        let employee = writer.create(ObjectKind::Relationship, "Employee").unwrap().slot;
        writer.set_pair(employee, Role::Subject, Some(person)).unwrap();
        writer.set_property(person, "name", Value::from("Tim")).unwrap();
        writer.commit().unwrap();
        let employee_id = writer.materialize(employee).unwrap();

        let mut reader = ConnectionState::new(backend);
        let loaded = reader.load(&employee_id).unwrap().unwrap();
        let subject = reader.pair(loaded.slot, Role::Subject).unwrap().unwrap();
        assert_eq!(
            reader.property(subject.slot, "name").unwrap(),
            Some(Value::from("Tim"))
        );

        let found = reader
            .search(
                ObjectKind::Relationship,
                &BTreeSet::from(["Employee".to_string()]),
                &BTreeSet::new(),
                &BTreeSet::new(),
            )
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].slot, loaded.slot);
    }

    #[test]
    fn deleting_a_durable_record_reports_its_properties_and_tags() {
        let mut s = state();
        let e = s.create(ObjectKind::Entity, "T").unwrap().slot;
        s.set_property(e, "P", Value::Int(7)).unwrap();
        s.add_tag(e, "G").unwrap();
        s.commit().unwrap();

        s.delete(e).unwrap();
        assert_eq!(s.property(e, "P").unwrap(), None);
        assert!(!s.has_tag(e, "G").unwrap());
        let outcome = s.commit().unwrap();
        assert_eq!(
            events(&outcome),
            vec![
                (Change::Deleted, FactDetail::Object),
                (
                    Change::Deleted,
                    FactDetail::Property {
                        name: "P".into(),
                        value: None,
                        previous: Some(Value::Int(7))
                    }
                ),
                (Change::Deleted, FactDetail::Tag { name: "G".into() }),
            ]
        );
    }

    #[test]
    fn concurrent_edits_to_different_properties_both_survive() {
        let backend: Arc<dyn Backend> = Arc::new(RedbBackend::in_memory().unwrap());
        let mut a = ConnectionState::new(Arc::clone(&backend));
        let e = a.create(ObjectKind::Entity, "T").unwrap().slot;
        a.set_property(e, "P", Value::Int(1)).unwrap();
        a.set_property(e, "Q", Value::Int(1)).unwrap();
        a.add_tag(e, "old").unwrap();
        a.commit().unwrap();
        let id = a.materialize(e).unwrap();

        let mut b = ConnectionState::new(Arc::clone(&backend));
        let theirs = b.load(&id).unwrap().unwrap().slot;

        a.set_property(e, "P", Value::Int(5)).unwrap();
        b.set_property(theirs, "Q", Value::Int(2)).unwrap();
        b.remove_tag(theirs, "old").unwrap();
        b.commit().unwrap();

        let outcome = a.commit().unwrap();
        assert_eq!(
            events(&outcome),
            vec![(
                Change::Updated,
                FactDetail::Property {
                    name: "P".into(),
                    value: Some(Value::Int(5)),
                    previous: Some(Value::Int(1))
                }
            )]
        );
        assert_eq!(a.property(e, "Q").unwrap(), Some(Value::Int(2)));
        assert!(!a.has_tag(e, "old").unwrap());

        let stored = backend.load(&id).unwrap().unwrap();
        assert_eq!(stored.properties.get("P"), Some(&Value::Int(5)));
        assert_eq!(stored.properties.get("Q"), Some(&Value::Int(2)));
        assert!(stored.tags.is_empty());
    }

    #[test]
    fn refresh_keeps_local_edits_and_takes_the_rest() {
        let backend: Arc<dyn Backend> = Arc::new(RedbBackend::in_memory().unwrap());
        let mut a = ConnectionState::new(Arc::clone(&backend));
        let e = a.create(ObjectKind::Entity, "T").unwrap().slot;
        a.set_property(e, "P", Value::Int(1)).unwrap();
        a.set_property(e, "Q", Value::Int(1)).unwrap();
        a.commit().unwrap();
        let id = a.materialize(e).unwrap();

        let mut b = ConnectionState::new(Arc::clone(&backend));
        let theirs = b.load(&id).unwrap().unwrap().slot;
        b.set_property(theirs, "P", Value::Int(9)).unwrap();

        a.set_property(e, "Q", Value::Int(3)).unwrap();
        a.add_tag(e, "G").unwrap();
        let outcome = a.commit().unwrap();
        b.refresh(&outcome.touched).unwrap();

        assert_eq!(b.property(theirs, "P").unwrap(), Some(Value::Int(9)));
        assert_eq!(b.property(theirs, "Q").unwrap(), Some(Value::Int(3)));
        assert!(b.has_tag(theirs, "G").unwrap());
        let outcome = b.commit().unwrap();
        assert_eq!(outcome.facts.len(), 1);
    }

    #[test]
    fn released_new_records_are_discarded_and_their_slots_reused() {
        let mut s = state();
        let kept = s.create(ObjectKind::Entity, "T").unwrap();
        let dropped = s.create(ObjectKind::Entity, "T").unwrap();
        let slot = dropped.slot;
        s.set_property(slot, "P", Value::Int(1)).unwrap();
        s.set_property(kept.slot, "P", Value::Int(2)).unwrap();
        drop(dropped);
        s.reclaim();

        assert!(s.is_deleted(slot).unwrap());
        let outcome = s.commit().unwrap();
        assert_eq!(outcome.facts.len(), 2);
        assert!(outcome.facts.iter().all(|(_, d)| d.slot == kept.slot));

        let reused = s.create(ObjectKind::Entity, "U").unwrap();
        assert_eq!(reused.slot, slot);
        assert_eq!(s.property(reused.slot, "P").unwrap(), None);
    }

    #[test]
    fn linked_records_wait_for_the_record_linking_them() {
        let mut s = state();
        let person = s.create(ObjectKind::Entity, "Person").unwrap();
        let job = s.create(ObjectKind::Relationship, "Employee").unwrap();
        let person_slot = person.slot;
        let job_slot = job.slot;
        s.set_pair(job_slot, Role::Subject, Some(person_slot)).unwrap();

        drop(person);
        s.reclaim();
        assert!(!s.is_deleted(person_slot).unwrap());
        assert_eq!(s.pair(job_slot, Role::Subject).unwrap().unwrap().slot, person_slot);

        drop(job);
        s.reclaim();
        assert!(s.is_deleted(job_slot).unwrap());
        assert!(s.is_deleted(person_slot).unwrap());
        assert!(s.commit().unwrap().facts.is_empty());
    }

    #[test]
    fn durable_records_with_staged_work_outlive_their_handles() {
        let mut s = state();
        let e = s.create(ObjectKind::Entity, "T").unwrap();
        let slot = e.slot;
        s.set_property(slot, "P", Value::Int(1)).unwrap();
        s.commit().unwrap();
        let id = s.materialize(slot).unwrap();

        s.delete(slot).unwrap();
        drop(e);
        s.reclaim();
        let outcome = s.commit().unwrap();
        assert_eq!(outcome.facts[0].0.change, Change::Deleted);

        s.reclaim();
        assert!(s.load(&id).unwrap().is_none());
    }

    #[test]
    fn rollback_restores_committed_state() {
        let mut s = state();
        let durable = s.create(ObjectKind::Entity, "T").unwrap().slot;
        s.set_property(durable, "P", Value::Int(1)).unwrap();
        s.commit().unwrap();

        s.set_property(durable, "P", Value::Int(2)).unwrap();
        s.add_tag(durable, "G").unwrap();
        let fresh = s.create(ObjectKind::Entity, "T").unwrap().slot;
        s.set_property(fresh, "P", Value::Int(3)).unwrap();
        s.rollback();

        assert_eq!(s.property(durable, "P").unwrap(), Some(Value::Int(1)));
        assert!(!s.has_tag(durable, "G").unwrap());
        assert_eq!(s.property(fresh, "P").unwrap(), None);
        assert!(s.commit().unwrap().facts.is_empty());

        s.delete(durable).unwrap();
        s.rollback();
        assert!(!s.is_deleted(durable).unwrap());
        assert_eq!(s.property(durable, "P").unwrap(), Some(Value::Int(1)));
    }
}
