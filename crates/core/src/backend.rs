//! The transactional store behind a [`GraphStore`](crate::GraphStore).
//!
//! The core only needs four things from a store: hand out permanent
//! identifiers, load a record, list records by kind and type, and apply a
//! batch of writes atomically. [`RedbBackend`] provides them on top of
//! `redb`; other stores plug in through the [`Backend`] trait.

use crate::record::{ObjectId, ObjectKind, StoredRecord};
use crate::Result;
use redb::{
    Database, MultimapTableDefinition, ReadableDatabase, ReadableMultimapTable, ReadableTable,
    TableDefinition,
};
use std::collections::{BTreeSet, HashSet};
use std::path::Path;

/// A single staged write.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreWrite {
    /// Insert or replace the record under its id.
    Upsert(StoredRecord),
    /// Remove the record and null every reference other records hold to it.
    Remove(ObjectId),
}

/// An ACID store the commit pipeline can delegate to.
pub trait Backend: Send + Sync + 'static {
    /// Reserve one permanent id per `(kind, type)` request, in order.
    fn allocate_ids(&self, requests: &[(ObjectKind, String)]) -> Result<Vec<ObjectId>>;

    fn load(&self, id: &ObjectId) -> Result<Option<StoredRecord>>;

    /// Every record of `kind` whose type is in `types` (all types when empty).
    fn scan(&self, kind: ObjectKind, types: &BTreeSet<String>) -> Result<Vec<StoredRecord>>;

    /// Apply `writes` atomically: all of them or none.
    ///
    /// Upserts are applied before removals. Returns the ids of surviving
    /// records whose references were nulled because their target was removed.
    fn commit(&self, writes: &[StoreWrite]) -> Result<Vec<ObjectId>>;
}

/// Record id -> JSON-encoded [`StoredRecord`].
const OBJECTS: TableDefinition<&str, &str> = TableDefinition::new("objects");

/// Single-row table holding the next identifier sequence number.
const SEQUENCE: TableDefinition<&str, u64> = TableDefinition::new("sequence");
const NEXT_ID: &str = "next";

/// `"{class}:{type}"` -> record ids of that kind and type.
const TYPES: MultimapTableDefinition<&str, &str> = MultimapTableDefinition::new("types");

/// Target id -> ids of relationships/actions referencing it.
///
/// This is the association table that lets a removal null every
/// back-reference inside the same write transaction.
const REFERRERS: MultimapTableDefinition<&str, &str> = MultimapTableDefinition::new("referrers");

fn type_key(kind: ObjectKind, object_type: &str) -> String {
    format!("{}:{}", kind.class(), object_type)
}

/// [`Backend`] on an embedded `redb` database.
///
/// Write transactions are serialised by redb, so concurrent commits from
/// different connections apply one at a time.
pub struct RedbBackend {
    db: Database,
}

impl RedbBackend {
    /// Open or create a database file at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = Database::create(path)?;
        Self::init(db)
    }

    /// Create an in-memory database. Data is lost when it is dropped.
    pub fn in_memory() -> Result<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder().create_with_backend(backend)?;
        Self::init(db)
    }

    fn init(db: Database) -> Result<Self> {
        {
            let write_txn = db.begin_write()?;
            write_txn.open_table(OBJECTS)?;
            write_txn.open_table(SEQUENCE)?;
            write_txn.open_multimap_table(TYPES)?;
            write_txn.open_multimap_table(REFERRERS)?;
            write_txn.commit()?;
        }
        Ok(Self { db })
    }
}

impl Backend for RedbBackend {
    fn allocate_ids(&self, requests: &[(ObjectKind, String)]) -> Result<Vec<ObjectId>> {
        if requests.is_empty() {
            return Ok(Vec::new());
        }
        let write_txn = self.db.begin_write()?;
        let ids = {
            let mut table = write_txn.open_table(SEQUENCE)?;
            let mut next = table.get(NEXT_ID)?.map(|g| g.value()).unwrap_or(1);
            let ids: Vec<ObjectId> = requests
                .iter()
                .map(|(kind, object_type)| {
                    let id = ObjectId::new(*kind, object_type, next);
                    next += 1;
                    id
                })
                .collect();
            table.insert(NEXT_ID, next)?;
            ids
        };
        write_txn.commit()?;
        Ok(ids)
    }

    fn load(&self, id: &ObjectId) -> Result<Option<StoredRecord>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(OBJECTS)?;
        let json = table.get(id.as_str())?.map(|g| g.value().to_string());
        match json {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    fn scan(&self, kind: ObjectKind, types: &BTreeSet<String>) -> Result<Vec<StoredRecord>> {
        let read_txn = self.db.begin_read()?;
        let objects = read_txn.open_table(OBJECTS)?;
        let mut results = Vec::new();

        if types.is_empty() {
            for entry in objects.iter()? {
                let (_k, v) = entry?;
                let record: StoredRecord = serde_json::from_str(v.value())?;
                if record.kind == kind {
                    results.push(record);
                }
            }
        } else {
            let index = read_txn.open_multimap_table(TYPES)?;
            for object_type in types {
                for id in index.get(type_key(kind, object_type).as_str())? {
                    let id = id?;
                    let json = objects.get(id.value())?.map(|g| g.value().to_string());
                    if let Some(json) = json {
                        results.push(serde_json::from_str(&json)?);
                    }
                }
            }
        }

        results.sort_by(|a: &StoredRecord, b: &StoredRecord| {
            a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id))
        });
        Ok(results)
    }

    fn commit(&self, writes: &[StoreWrite]) -> Result<Vec<ObjectId>> {
        let removed: HashSet<&str> = writes
            .iter()
            .filter_map(|w| match w {
                StoreWrite::Remove(id) => Some(id.as_str()),
                StoreWrite::Upsert(_) => None,
            })
            .collect();
        let mut detached = Vec::new();

        let write_txn = self.db.begin_write()?;
        {
            let mut objects = write_txn.open_table(OBJECTS)?;
            let mut types = write_txn.open_multimap_table(TYPES)?;
            let mut referrers = write_txn.open_multimap_table(REFERRERS)?;

            for write in writes {
                let StoreWrite::Upsert(record) = write else {
                    continue;
                };
                let previous = objects.get(record.id.as_str())?.map(|g| g.value().to_string());
                if let Some(json) = previous {
                    let old: StoredRecord = serde_json::from_str(&json)?;
                    for target in old.links.targets() {
                        referrers.remove(target.as_str(), old.id.as_str())?;
                    }
                }
                let json = serde_json::to_string(record)?;
                objects.insert(record.id.as_str(), json.as_str())?;
                types.insert(
                    type_key(record.kind, &record.object_type).as_str(),
                    record.id.as_str(),
                )?;
                for target in record.links.targets() {
                    referrers.insert(target.as_str(), record.id.as_str())?;
                }
            }

            for write in writes {
                let StoreWrite::Remove(id) = write else {
                    continue;
                };
                let previous = objects.remove(id.as_str())?.map(|g| g.value().to_string());
                let Some(json) = previous else {
                    continue;
                };
                let old: StoredRecord = serde_json::from_str(&json)?;
                types.remove(type_key(old.kind, &old.object_type).as_str(), id.as_str())?;
                for target in old.links.targets() {
                    referrers.remove(target.as_str(), id.as_str())?;
                }

                let sources = referrers
                    .remove_all(id.as_str())?
                    .map(|r| r.map(|g| g.value().to_string()))
                    .collect::<std::result::Result<Vec<String>, _>>()?;
                for source in sources {
                    if removed.contains(source.as_str()) {
                        continue;
                    }
                    let json = objects.get(source.as_str())?.map(|g| g.value().to_string());
                    let Some(json) = json else {
                        continue;
                    };
                    let mut referrer: StoredRecord = serde_json::from_str(&json)?;
                    if referrer.links.detach(id) {
                        let json = serde_json::to_string(&referrer)?;
                        objects.insert(source.as_str(), json.as_str())?;
                        detached.push(referrer.id);
                    }
                }
            }
        }
        write_txn.commit()?;

        Ok(detached)
    }
}
