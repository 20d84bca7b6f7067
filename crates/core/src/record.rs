//! Record identity and the persisted record layout.

use crate::value::Value;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Which facade a record belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ObjectKind {
    Entity,
    Relationship,
    Action,
}

impl ObjectKind {
    /// Numeric class prefix used in identifiers.
    pub fn class(self) -> u8 {
        match self {
            ObjectKind::Entity => 1,
            ObjectKind::Relationship => 2,
            ObjectKind::Action => 3,
        }
    }
}

impl std::fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ObjectKind::Entity => "entity",
            ObjectKind::Relationship => "relationship",
            ObjectKind::Action => "action",
        };
        f.write_str(name)
    }
}

/// A stable, store-assigned identifier.
///
/// Formatted as `"{class}:{type}:{sequence}"`. The sequence is global across
/// kinds, so two ids never collide even when type names end in digits.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId(pub String);

impl ObjectId {
    pub fn new(kind: ObjectKind, object_type: &str, sequence: u64) -> Self {
        Self(format!("{}:{}:{}", kind.class(), object_type, sequence))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Outgoing references of a record.
///
/// Entities carry none. A relationship points at one optional subject and
/// one optional object. An action holds ordered, duplicate-friendly lists of
/// both. `T` is a connection-local slot in memory and an [`ObjectId`] once
/// persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "shape")]
pub enum Links<T> {
    Unlinked,
    Pair {
        subject: Option<T>,
        object: Option<T>,
    },
    Many {
        subjects: Vec<T>,
        objects: Vec<T>,
    },
}

impl<T: PartialEq> Links<T> {
    pub fn for_kind(kind: ObjectKind) -> Self {
        match kind {
            ObjectKind::Entity => Links::Unlinked,
            ObjectKind::Relationship => Links::Pair {
                subject: None,
                object: None,
            },
            ObjectKind::Action => Links::Many {
                subjects: Vec::new(),
                objects: Vec::new(),
            },
        }
    }

    /// Every referenced target, duplicates included.
    pub fn targets(&self) -> Vec<&T> {
        match self {
            Links::Unlinked => Vec::new(),
            Links::Pair { subject, object } => subject.iter().chain(object.iter()).collect(),
            Links::Many { subjects, objects } => subjects.iter().chain(objects.iter()).collect(),
        }
    }

    /// Drop every reference to `target`. Returns whether anything changed.
    pub fn detach(&mut self, target: &T) -> bool {
        match self {
            Links::Unlinked => false,
            Links::Pair { subject, object } => {
                let mut changed = false;
                if subject.as_ref() == Some(target) {
                    *subject = None;
                    changed = true;
                }
                if object.as_ref() == Some(target) {
                    *object = None;
                    changed = true;
                }
                changed
            }
            Links::Many { subjects, objects } => {
                let before = subjects.len() + objects.len();
                subjects.retain(|t| t != target);
                objects.retain(|t| t != target);
                before != subjects.len() + objects.len()
            }
        }
    }

    /// Translate every target. Targets for which `f` returns `None` are
    /// nulled (pairs) or dropped (lists).
    pub fn map<U>(&self, mut f: impl FnMut(&T) -> Option<U>) -> Links<U> {
        match self {
            Links::Unlinked => Links::Unlinked,
            Links::Pair { subject, object } => Links::Pair {
                subject: subject.as_ref().and_then(&mut f),
                object: object.as_ref().and_then(&mut f),
            },
            Links::Many { subjects, objects } => Links::Many {
                subjects: subjects.iter().filter_map(&mut f).collect(),
                objects: objects.iter().filter_map(&mut f).collect(),
            },
        }
    }
}

/// The durable form of a record, as handed to a [`Backend`](crate::Backend).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub id: ObjectId,
    pub kind: ObjectKind,
    pub object_type: String,
    pub created_at: DateTime<Utc>,
    pub properties: BTreeMap<String, Value>,
    pub tags: BTreeSet<String>,
    pub links: Links<ObjectId>,
}
