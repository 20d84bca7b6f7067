//! User-facing handles: [`Entity`], [`Relationship`], [`Action`].
//!
//! A handle is a connection plus a slot. It carries no record state of its
//! own; every read and write is a blocking round-trip to the connection's
//! confinement worker, so handles can be cloned and used from any thread.
//!
//! Dropping the last handle to a record that was never committed discards
//! it, along with its staged changes.

use crate::record::{ObjectId, ObjectKind};
use crate::staging::{Descriptor, Role, Slot, SlotToken};
use crate::value::Value;
use crate::{Graph, GraphError, Result};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Connection-bound reference to one record.
///
/// Kind, type and creation time are immutable, so they are cached here and
/// read without a round-trip.
#[derive(Clone)]
pub struct ObjectHandle {
    graph: Graph,
    slot: Slot,
    kind: ObjectKind,
    object_type: Arc<str>,
    created_at: DateTime<Utc>,
    _token: Arc<SlotToken>,
}

impl ObjectHandle {
    pub(crate) fn new(graph: &Graph, descriptor: Descriptor) -> Self {
        Self {
            graph: graph.clone(),
            slot: descriptor.slot,
            kind: descriptor.kind,
            object_type: Arc::from(descriptor.object_type),
            created_at: descriptor.created_at,
            _token: descriptor.token,
        }
    }

    fn create(graph: &Graph, kind: ObjectKind, object_type: &str) -> Result<Self> {
        let object_type = object_type.to_string();
        let descriptor = graph.run(move |s| s.create(kind, &object_type))?;
        Ok(Self::new(graph, descriptor))
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    /// The slot of `other`, provided it lives on the same connection.
    fn same_connection(&self, other: &ObjectHandle) -> Result<Slot> {
        if self.graph.same_connection(&other.graph) {
            Ok(other.slot)
        } else {
            Err(GraphError::InvalidMutation(
                "objects belong to different connections".to_string(),
            ))
        }
    }
}

impl PartialEq for ObjectHandle {
    fn eq(&self, other: &Self) -> bool {
        self.slot == other.slot && self.graph.same_connection(&other.graph)
    }
}

impl Eq for ObjectHandle {}

impl std::fmt::Debug for ObjectHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectHandle")
            .field("kind", &self.kind)
            .field("type", &self.object_type)
            .field("slot", &self.slot.0)
            .finish()
    }
}

/// Operations shared by every graph object.
pub trait GraphObject {
    fn handle(&self) -> &ObjectHandle;

    /// The permanent id. The first call stages the object and reserves its
    /// id from the store; later calls return the same id.
    fn id(&self) -> Result<ObjectId> {
        let slot = self.handle().slot;
        self.handle().graph.run(move |s| s.materialize(slot))
    }

    fn kind(&self) -> ObjectKind {
        self.handle().kind
    }

    fn object_type(&self) -> &str {
        &self.handle().object_type
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.handle().created_at
    }

    /// Stage the object for the next commit without changing it.
    fn persist(&self) -> Result<()> {
        let slot = self.handle().slot;
        self.handle().graph.run(move |s| s.persist(slot))
    }

    fn get(&self, name: &str) -> Result<Option<Value>> {
        let slot = self.handle().slot;
        let name = name.to_string();
        self.handle().graph.run(move |s| s.property(slot, &name))
    }

    fn set(&self, name: &str, value: impl Into<Value>) -> Result<()> {
        let slot = self.handle().slot;
        let name = name.to_string();
        let value = value.into();
        self.handle()
            .graph
            .run(move |s| s.set_property(slot, &name, value))
    }

    /// Remove a property, returning the value it held.
    fn remove_property(&self, name: &str) -> Result<Option<Value>> {
        let slot = self.handle().slot;
        let name = name.to_string();
        self.handle()
            .graph
            .run(move |s| s.remove_property(slot, &name))
    }

    fn properties(&self) -> Result<BTreeMap<String, Value>> {
        let slot = self.handle().slot;
        self.handle().graph.run(move |s| s.properties(slot))
    }

    /// Adding a tag that is already present is a no-op.
    fn add_tag(&self, tag: &str) -> Result<()> {
        let slot = self.handle().slot;
        let tag = tag.to_string();
        self.handle().graph.run(move |s| s.add_tag(slot, &tag))
    }

    /// Removing a tag that is absent is a no-op.
    fn remove_tag(&self, tag: &str) -> Result<()> {
        let slot = self.handle().slot;
        let tag = tag.to_string();
        self.handle().graph.run(move |s| s.remove_tag(slot, &tag))
    }

    fn has_tag(&self, tag: &str) -> Result<bool> {
        let slot = self.handle().slot;
        let tag = tag.to_string();
        self.handle().graph.run(move |s| s.has_tag(slot, &tag))
    }

    fn tags(&self) -> Result<BTreeSet<String>> {
        let slot = self.handle().slot;
        self.handle().graph.run(move |s| s.tags(slot))
    }

    /// Stage removal of the object, its properties, its tags and every
    /// reference other objects hold to it.
    fn delete(&self) -> Result<()> {
        let slot = self.handle().slot;
        self.handle().graph.run(move |s| s.delete(slot))
    }

    fn is_deleted(&self) -> Result<bool> {
        let slot = self.handle().slot;
        self.handle().graph.run(move |s| s.is_deleted(slot))
    }
}

// ---------------------------------------------------------------------------
// Entity
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entity {
    handle: ObjectHandle,
}

impl Entity {
    /// Construct an unmaterialized entity. Nothing is stored until the
    /// entity is mutated, persisted, linked or asked for its id, and a new
    /// entity whose handles are all dropped before a commit is discarded.
    pub fn new(graph: &Graph, object_type: &str) -> Result<Self> {
        let handle = ObjectHandle::create(graph, ObjectKind::Entity, object_type)?;
        Ok(Self { handle })
    }
}

impl GraphObject for Entity {
    fn handle(&self) -> &ObjectHandle {
        &self.handle
    }
}

// ---------------------------------------------------------------------------
// Relationship
// ---------------------------------------------------------------------------

/// A typed link from one subject entity to one object entity.
///
/// Either end may be unset. References are lookups, not ownership: deleting
/// an entity clears the end that pointed at it and leaves the relationship.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relationship {
    handle: ObjectHandle,
}

impl Relationship {
    pub fn new(graph: &Graph, object_type: &str) -> Result<Self> {
        let handle = ObjectHandle::create(graph, ObjectKind::Relationship, object_type)?;
        Ok(Self { handle })
    }

    pub fn subject(&self) -> Result<Option<Entity>> {
        self.end(Role::Subject)
    }

    pub fn object(&self) -> Result<Option<Entity>> {
        self.end(Role::Object)
    }

    pub fn set_subject(&self, entity: Option<&Entity>) -> Result<()> {
        self.set_end(Role::Subject, entity)
    }

    pub fn set_object(&self, entity: Option<&Entity>) -> Result<()> {
        self.set_end(Role::Object, entity)
    }

    fn end(&self, role: Role) -> Result<Option<Entity>> {
        let slot = self.handle.slot;
        let found = self.handle.graph.run(move |s| s.pair(slot, role))?;
        Ok(found.map(|d| Entity {
            handle: ObjectHandle::new(&self.handle.graph, d),
        }))
    }

    fn set_end(&self, role: Role, entity: Option<&Entity>) -> Result<()> {
        let target = entity
            .map(|e| self.handle.same_connection(&e.handle))
            .transpose()?;
        let slot = self.handle.slot;
        self.handle.graph.run(move |s| s.set_pair(slot, role, target))
    }
}

impl GraphObject for Relationship {
    fn handle(&self) -> &ObjectHandle {
        &self.handle
    }
}

// ---------------------------------------------------------------------------
// Action
// ---------------------------------------------------------------------------

/// An n-ary event over ordered lists of subject and object entities.
/// Duplicates are allowed and order is preserved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Action {
    handle: ObjectHandle,
}

impl Action {
    pub fn new(graph: &Graph, object_type: &str) -> Result<Self> {
        let handle = ObjectHandle::create(graph, ObjectKind::Action, object_type)?;
        Ok(Self { handle })
    }

    pub fn subjects(&self) -> Result<Vec<Entity>> {
        self.list(Role::Subject)
    }

    pub fn objects(&self) -> Result<Vec<Entity>> {
        self.list(Role::Object)
    }

    pub fn add_subject(&self, entity: &Entity) -> Result<()> {
        self.push(Role::Subject, entity)
    }

    pub fn add_object(&self, entity: &Entity) -> Result<()> {
        self.push(Role::Object, entity)
    }

    /// Remove the first occurrence. Returns whether the entity was present.
    pub fn remove_subject(&self, entity: &Entity) -> Result<bool> {
        self.pull(Role::Subject, entity)
    }

    /// Remove the first occurrence. Returns whether the entity was present.
    pub fn remove_object(&self, entity: &Entity) -> Result<bool> {
        self.pull(Role::Object, entity)
    }

    fn list(&self, role: Role) -> Result<Vec<Entity>> {
        let slot = self.handle.slot;
        let found = self.handle.graph.run(move |s| s.many(slot, role))?;
        Ok(found
            .into_iter()
            .map(|d| Entity {
                handle: ObjectHandle::new(&self.handle.graph, d),
            })
            .collect())
    }

    fn push(&self, role: Role, entity: &Entity) -> Result<()> {
        let target = self.handle.same_connection(&entity.handle)?;
        let slot = self.handle.slot;
        self.handle.graph.run(move |s| s.push_many(slot, role, target))
    }

    fn pull(&self, role: Role, entity: &Entity) -> Result<bool> {
        let target = self.handle.same_connection(&entity.handle)?;
        let slot = self.handle.slot;
        self.handle
            .graph
            .run(move |s| s.remove_many(slot, role, target))
    }
}

impl GraphObject for Action {
    fn handle(&self) -> &ObjectHandle {
        &self.handle
    }
}

// ---------------------------------------------------------------------------
// Node
// ---------------------------------------------------------------------------

/// Any graph object, as delivered to watchers and returned by searches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Entity(Entity),
    Relationship(Relationship),
    Action(Action),
}

impl Node {
    pub(crate) fn new(graph: &Graph, descriptor: Descriptor) -> Self {
        let kind = descriptor.kind;
        let handle = ObjectHandle::new(graph, descriptor);
        match kind {
            ObjectKind::Entity => Node::Entity(Entity { handle }),
            ObjectKind::Relationship => Node::Relationship(Relationship { handle }),
            ObjectKind::Action => Node::Action(Action { handle }),
        }
    }

    pub fn as_entity(&self) -> Option<&Entity> {
        match self {
            Node::Entity(e) => Some(e),
            _ => None,
        }
    }

    pub fn as_relationship(&self) -> Option<&Relationship> {
        match self {
            Node::Relationship(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_action(&self) -> Option<&Action> {
        match self {
            Node::Action(a) => Some(a),
            _ => None,
        }
    }
}

impl GraphObject for Node {
    fn handle(&self) -> &ObjectHandle {
        match self {
            Node::Entity(e) => &e.handle,
            Node::Relationship(r) => &r.handle,
            Node::Action(a) => &a.handle,
        }
    }
}

impl From<Entity> for Node {
    fn from(e: Entity) -> Self {
        Node::Entity(e)
    }
}

impl From<Relationship> for Node {
    fn from(r: Relationship) -> Self {
        Node::Relationship(r)
    }
}

impl From<Action> for Node {
    fn from(a: Action) -> Self {
        Node::Action(a)
    }
}
