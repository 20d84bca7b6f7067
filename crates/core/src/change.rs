//! Change facts produced by a successful commit.

use crate::record::{ObjectId, ObjectKind};
use crate::value::Value;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Identifies one successful commit. Time-sortable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CommitId(pub Ulid);

impl CommitId {
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for CommitId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CommitId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Change {
    Inserted,
    Updated,
    Deleted,
}

/// What part of the object a fact is about.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FactDetail {
    /// The object itself.
    Object,
    /// A named property. `value` is the value after the commit (absent for a
    /// deletion), `previous` the value before it (absent for an insertion).
    Property {
        name: String,
        value: Option<Value>,
        previous: Option<Value>,
    },
    /// A named tag.
    Tag { name: String },
}

/// One net change to one object, produced by a successful commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeFact {
    pub change: Change,
    pub object_id: ObjectId,
    pub object_type: String,
    pub object_kind: ObjectKind,
    pub detail: FactDetail,
}

/// A [`ChangeFact`] classified the way delegate-style consumers want it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FactEvent<'a> {
    Inserted,
    Deleted,
    TagAdded(&'a str),
    TagRemoved(&'a str),
    /// First value set for the property.
    PropertyAdded(&'a str, &'a Value),
    /// The property held `previous` and now holds the first value.
    PropertyUpdated(&'a str, &'a Value, &'a Value),
    /// The property was removed while holding this value.
    PropertyRemoved(&'a str, &'a Value),
}

impl ChangeFact {
    pub(crate) fn object(change: Change, id: &ObjectId, kind: ObjectKind, object_type: &str) -> Self {
        Self {
            change,
            object_id: id.clone(),
            object_type: object_type.to_string(),
            object_kind: kind,
            detail: FactDetail::Object,
        }
    }

    pub(crate) fn with_detail(&self, change: Change, detail: FactDetail) -> Self {
        Self {
            change,
            object_id: self.object_id.clone(),
            object_type: self.object_type.clone(),
            object_kind: self.object_kind,
            detail,
        }
    }

    /// The tag name, for tag facts.
    pub fn tag(&self) -> Option<&str> {
        match &self.detail {
            FactDetail::Tag { name } => Some(name),
            _ => None,
        }
    }

    /// The property name, for property facts.
    pub fn property(&self) -> Option<&str> {
        match &self.detail {
            FactDetail::Property { name, .. } => Some(name),
            _ => None,
        }
    }

    pub fn event(&self) -> Option<FactEvent<'_>> {
        let event = match (&self.change, &self.detail) {
            (Change::Inserted, FactDetail::Object) => FactEvent::Inserted,
            (Change::Deleted, FactDetail::Object) => FactEvent::Deleted,
            (Change::Inserted, FactDetail::Tag { name }) => FactEvent::TagAdded(name),
            (Change::Deleted, FactDetail::Tag { name }) => FactEvent::TagRemoved(name),
            (
                Change::Inserted,
                FactDetail::Property {
                    name,
                    value: Some(v),
                    ..
                },
            ) => FactEvent::PropertyAdded(name, v),
            (
                Change::Updated,
                FactDetail::Property {
                    name,
                    value: Some(v),
                    previous: Some(p),
                },
            ) => FactEvent::PropertyUpdated(name, v, p),
            (
                Change::Deleted,
                FactDetail::Property {
                    name,
                    previous: Some(p),
                    ..
                },
            ) => FactEvent::PropertyRemoved(name, p),
            _ => return None,
        };
        Some(event)
    }
}

/// Outcome of a successful commit.
#[derive(Debug, Clone)]
pub struct CommitReceipt {
    pub commit: CommitId,
    /// Facts in pipeline order: objects in staging order, and per object the
    /// object fact, then property facts, then tag facts.
    pub facts: Vec<ChangeFact>,
}
