//! End-to-end watch delivery across connections and threads.

use graphwatch::{
    Action, Change, ChangeFact, Entity, FactDetail, FactEvent, GraphObject, GraphStore, Node,
    ObjectId, Relationship, Value, WatchEvent, WatchPredicate, WatchResult,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread;

#[derive(Debug, Clone)]
struct Seen {
    fact: ChangeFact,
    remote: bool,
}

#[derive(Clone, Default)]
struct Recorder {
    seen: Arc<Mutex<Vec<Seen>>>,
}

impl Recorder {
    fn watcher(&self) -> impl Fn(&WatchEvent<'_>) -> WatchResult + Send + Sync + 'static {
        let seen = Arc::clone(&self.seen);
        move |e: &WatchEvent<'_>| -> WatchResult {
            seen.lock().push(Seen {
                fact: e.fact.clone(),
                remote: e.originated_remotely,
            });
            Ok(())
        }
    }

    fn take(&self) -> Vec<Seen> {
        std::mem::take(&mut *self.seen.lock())
    }

    fn take_facts(&self) -> Vec<ChangeFact> {
        self.take().into_iter().map(|s| s.fact).collect()
    }
}

fn shapes(facts: &[ChangeFact]) -> Vec<(Change, FactDetail)> {
    facts.iter().map(|f| (f.change, f.detail.clone())).collect()
}

fn property(name: &str, value: Option<i64>, previous: Option<i64>) -> FactDetail {
    FactDetail::Property {
        name: name.into(),
        value: value.map(Value::Int),
        previous: previous.map(Value::Int),
    }
}

fn tag(name: &str) -> FactDetail {
    FactDetail::Tag { name: name.into() }
}

#[test]
fn entity_lifecycle_from_worker_threads() {
    let store = GraphStore::open_in_memory().unwrap();
    let recorder = Recorder::default();
    store.watch_for_entity(["T"], recorder.watcher());
    let graph = store.connect().unwrap();

    let entity = {
        let graph = graph.clone();
        thread::spawn(move || {
            let e = Entity::new(&graph, "T").unwrap();
            e.add_tag("G").unwrap();
            e.set("P", 111).unwrap();
            graph.commit_and_wait().unwrap();
            e
        })
        .join()
        .unwrap()
    };
    let id = entity.id().unwrap();
    let facts = recorder.take_facts();
    assert_eq!(
        shapes(&facts),
        vec![
            (Change::Inserted, FactDetail::Object),
            (Change::Inserted, property("P", Some(111), None)),
            (Change::Inserted, tag("G")),
        ]
    );
    assert!(facts.iter().all(|f| f.object_id == id));
    assert!(facts.iter().all(|f| f.object_type == "T"));

    let worker = entity.clone();
    thread::spawn(move || {
        worker.set("P", 222).unwrap();
        worker.handle().graph().commit_and_wait().unwrap();
    })
    .join()
    .unwrap();
    assert_eq!(
        shapes(&recorder.take_facts()),
        vec![(Change::Updated, property("P", Some(222), Some(111)))]
    );

    entity.remove_tag("G").unwrap();
    graph.commit_and_wait().unwrap();
    assert_eq!(
        shapes(&recorder.take_facts()),
        vec![(Change::Deleted, tag("G"))]
    );

    entity.delete().unwrap();
    graph.commit_and_wait().unwrap();
    assert_eq!(
        shapes(&recorder.take_facts()),
        vec![
            (Change::Deleted, FactDetail::Object),
            (Change::Deleted, property("P", None, Some(222))),
        ]
    );
    assert!(graph.node(&id).unwrap().is_none());
}

#[test]
fn deleting_a_tagged_entity_reports_everything_it_held() {
    let store = GraphStore::open_in_memory().unwrap();
    let recorder = Recorder::default();
    store.watch_for_entity(["T"], recorder.watcher());
    let graph = store.connect().unwrap();

    let e = Entity::new(&graph, "T").unwrap();
    e.set("P", 111).unwrap();
    e.add_tag("G").unwrap();
    graph.commit_and_wait().unwrap();
    let id = e.id().unwrap();
    recorder.take();

    e.delete().unwrap();
    assert_eq!(e.get("P").unwrap(), None);
    assert!(!e.has_tag("G").unwrap());
    graph.commit_and_wait().unwrap();

    let facts = recorder.take_facts();
    assert_eq!(
        shapes(&facts),
        vec![
            (Change::Deleted, FactDetail::Object),
            (Change::Deleted, property("P", None, Some(111))),
            (Change::Deleted, tag("G")),
        ]
    );
    assert!(facts.iter().all(|f| f.object_id == id));
    assert!(e.is_deleted().unwrap());
}

#[test]
fn fact_events_classify_deliveries() {
    let store = GraphStore::open_in_memory().unwrap();
    let graph = store.connect().unwrap();
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    graph.watch_for_entity(["T"], move |e: &WatchEvent<'_>| -> WatchResult {
        let label = match e.fact.event() {
            Some(FactEvent::Inserted) => "inserted".to_string(),
            Some(FactEvent::Deleted) => "deleted".to_string(),
            Some(FactEvent::TagAdded(t)) => format!("+#{t}"),
            Some(FactEvent::TagRemoved(t)) => format!("-#{t}"),
            Some(FactEvent::PropertyAdded(p, v)) => format!("+{p}={v}"),
            Some(FactEvent::PropertyUpdated(p, v, old)) => format!("{p}:{old}->{v}"),
            Some(FactEvent::PropertyRemoved(p, old)) => format!("-{p}={old}"),
            None => "?".to_string(),
        };
        sink.lock().push(label);
        Ok(())
    });

    let e = Entity::new(&graph, "T").unwrap();
    e.set("P", 1).unwrap();
    e.add_tag("G").unwrap();
    graph.commit_and_wait().unwrap();
    e.set("P", 2).unwrap();
    e.remove_tag("G").unwrap();
    graph.commit_and_wait().unwrap();
    e.remove_property("P").unwrap();
    graph.commit_and_wait().unwrap();

    assert_eq!(
        *events.lock(),
        vec!["inserted", "+P=1", "+#G", "P:1->2", "-#G", "-P=2"]
    );
}

#[test]
fn redundant_tag_changes_are_not_reported() {
    let store = GraphStore::open_in_memory().unwrap();
    let recorder = Recorder::default();
    store.watch(WatchPredicate::entity(), recorder.watcher());
    let graph = store.connect().unwrap();

    let e = Entity::new(&graph, "T").unwrap();
    e.add_tag("G").unwrap();
    e.add_tag("G").unwrap();
    graph.commit_and_wait().unwrap();
    assert_eq!(recorder.take().len(), 2);

    e.add_tag("G").unwrap();
    e.remove_tag("missing").unwrap();
    let receipt = graph.commit_and_wait().unwrap();
    assert!(receipt.facts.is_empty());
    assert!(recorder.take().is_empty());
}

#[test]
fn concurrent_commits_reach_only_their_watchers() {
    let store = GraphStore::open_in_memory().unwrap();
    let left = Recorder::default();
    let right = Recorder::default();
    store.watch_for_entity(["Left"], left.watcher());
    store.watch_for_entity(["Right"], right.watcher());

    let spawn = |object_type: &'static str| {
        let graph = store.connect().unwrap();
        thread::spawn(move || {
            for n in 0..20 {
                let e = Entity::new(&graph, object_type).unwrap();
                e.set("n", n).unwrap();
                graph.commit_and_wait().unwrap();
            }
        })
    };
    let a = spawn("Left");
    let b = spawn("Right");
    a.join().unwrap();
    b.join().unwrap();

    let left = left.take_facts();
    let right = right.take_facts();
    assert_eq!(left.len(), 40);
    assert_eq!(right.len(), 40);
    assert!(left.iter().all(|f| f.object_type == "Left"));
    assert!(right.iter().all(|f| f.object_type == "Right"));

    let mut ids: Vec<&ObjectId> = left
        .iter()
        .chain(right.iter())
        .filter(|f| f.detail == FactDetail::Object)
        .map(|f| &f.object_id)
        .collect();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 40);
}

#[test]
fn empty_type_filter_matches_every_type() {
    let store = GraphStore::open_in_memory().unwrap();
    let recorder = Recorder::default();
    store.watch_for_entity(Vec::<String>::new(), recorder.watcher());
    let graph = store.connect().unwrap();

    let a = Entity::new(&graph, "A").unwrap();
    a.persist().unwrap();
    let b = Entity::new(&graph, "B").unwrap();
    b.persist().unwrap();
    let r = Relationship::new(&graph, "R").unwrap();
    r.persist().unwrap();
    graph.commit_and_wait().unwrap();

    let types: Vec<String> = recorder
        .take_facts()
        .into_iter()
        .map(|f| f.object_type)
        .collect();
    assert_eq!(types, vec!["A", "B"]);
}

#[test]
fn property_filters_skip_other_properties() {
    let store = GraphStore::open_in_memory().unwrap();
    let recorder = Recorder::default();
    store.watch(WatchPredicate::entity().properties(["P"]), recorder.watcher());
    let graph = store.connect().unwrap();

    let e = Entity::new(&graph, "T").unwrap();
    e.set("P", 1).unwrap();
    e.set("Q", 2).unwrap();
    graph.commit_and_wait().unwrap();

    let facts = recorder.take_facts();
    assert_eq!(
        shapes(&facts),
        vec![
            (Change::Inserted, FactDetail::Object),
            (Change::Inserted, property("P", Some(1), None)),
        ]
    );
}

#[test]
fn full_predicates_filter_on_type_tags_and_properties() {
    let store = GraphStore::open_in_memory().unwrap();
    let recorder = Recorder::default();
    store.watch(
        WatchPredicate::entity().types(["Person"]).tags(["vip"]).properties(["name"]),
        recorder.watcher(),
    );
    let graph = store.connect().unwrap();

    let p = Entity::new(&graph, "Person").unwrap();
    p.set("name", "Ann").unwrap();
    p.set("age", 40).unwrap();
    p.add_tag("vip").unwrap();
    p.add_tag("staff").unwrap();
    let c = Entity::new(&graph, "Company").unwrap();
    c.add_tag("vip").unwrap();
    graph.commit_and_wait().unwrap();

    let facts = recorder.take_facts();
    assert!(facts.iter().all(|f| f.object_type == "Person"));
    assert_eq!(
        shapes(&facts),
        vec![
            (Change::Inserted, FactDetail::Object),
            (
                Change::Inserted,
                FactDetail::Property {
                    name: "name".into(),
                    value: Some(Value::from("Ann")),
                    previous: None,
                }
            ),
            (Change::Inserted, tag("vip")),
        ]
    );
}

#[test]
fn relationship_outlives_its_subject() {
    let store = GraphStore::open_in_memory().unwrap();
    let relationships = Recorder::default();
    store.watch_for_relationship(["Employee"], relationships.watcher());
    let graph = store.connect().unwrap();

    let alice = Entity::new(&graph, "Person").unwrap();
    alice.set("name", "Alice").unwrap();
    let acme = Entity::new(&graph, "Company").unwrap();
    acme.set("name", "Acme").unwrap();
    let job = Relationship::new(&graph, "Employee").unwrap();
    job.set_subject(Some(&alice)).unwrap();
    job.set_object(Some(&acme)).unwrap();
    graph.commit_and_wait().unwrap();
    assert_eq!(relationships.take().len(), 1);

    alice.delete().unwrap();
    graph.commit_and_wait().unwrap();
    assert!(relationships.take().is_empty());
    assert_eq!(job.subject().unwrap(), None);
    assert_eq!(job.object().unwrap(), Some(acme.clone()));

    let other = store.connect().unwrap();
    let stored = other.node(&job.id().unwrap()).unwrap().unwrap();
    let stored = stored.as_relationship().unwrap();
    assert_eq!(stored.subject().unwrap(), None);
    let company = stored.object().unwrap().unwrap();
    assert_eq!(company.id().unwrap(), acme.id().unwrap());
    assert_eq!(company.get("name").unwrap(), Some(Value::from("Acme")));
}

#[test]
fn action_lists_keep_order_and_duplicates() {
    let store = GraphStore::open_in_memory().unwrap();
    let graph = store.connect().unwrap();
    let a = Entity::new(&graph, "Person").unwrap();
    let b = Entity::new(&graph, "Person").unwrap();
    let meeting = Action::new(&graph, "Meeting").unwrap();
    meeting.add_subject(&a).unwrap();
    meeting.add_subject(&b).unwrap();
    meeting.add_subject(&a).unwrap();
    meeting.add_object(&b).unwrap();
    graph.commit_and_wait().unwrap();

    let other = store.connect().unwrap();
    let stored = other.node(&meeting.id().unwrap()).unwrap().unwrap();
    let stored = stored.as_action().unwrap();
    let subjects: Vec<ObjectId> = stored
        .subjects()
        .unwrap()
        .iter()
        .map(|e| e.id().unwrap())
        .collect();
    assert_eq!(
        subjects,
        vec![a.id().unwrap(), b.id().unwrap(), a.id().unwrap()]
    );

    assert!(meeting.remove_subject(&a).unwrap());
    b.delete().unwrap();
    graph.commit_and_wait().unwrap();
    assert_eq!(meeting.subjects().unwrap(), vec![a]);
    assert!(meeting.objects().unwrap().is_empty());
}

#[test]
fn remote_connections_flag_their_commits() {
    let store = GraphStore::open_in_memory().unwrap();
    let recorder = Recorder::default();
    store.watch(WatchPredicate::any(), recorder.watcher());

    let local = store.connect().unwrap();
    let remote = store.connect_remote().unwrap();
    assert!(remote.is_remote());

    let mine = Entity::new(&local, "T").unwrap();
    mine.persist().unwrap();
    local.commit_and_wait().unwrap();
    let theirs = Entity::new(&remote, "T").unwrap();
    theirs.persist().unwrap();
    remote.commit_and_wait().unwrap();

    let flags: Vec<bool> = recorder.take().into_iter().map(|s| s.remote).collect();
    assert_eq!(flags, vec![false, true]);
}

#[test]
fn unwatched_handles_receive_nothing() {
    let store = GraphStore::open_in_memory().unwrap();
    let recorder = Recorder::default();
    let handle = store.watch_for_entity(["T"], recorder.watcher());
    let graph = store.connect().unwrap();

    assert!(store.unwatch(handle));
    assert!(!store.unwatch(handle));
    let e = Entity::new(&graph, "T").unwrap();
    e.persist().unwrap();
    graph.commit_and_wait().unwrap();
    assert!(recorder.take().is_empty());
}

#[test]
fn watchers_can_read_the_committed_node() {
    let store = GraphStore::open_in_memory().unwrap();
    let names = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&names);
    store.watch(
        WatchPredicate::entity().types(["Person"]),
        move |e: &WatchEvent<'_>| -> WatchResult {
            if e.fact.detail == FactDetail::Object {
                if let Node::Entity(person) = e.node {
                    sink.lock().push(person.get("name")?);
                }
            }
            Ok(())
        },
    );
    let graph = store.connect().unwrap();
    let alice = Entity::new(&graph, "Person").unwrap();
    alice.set("name", "Alice").unwrap();
    graph.commit_and_wait().unwrap();

    assert_eq!(*names.lock(), vec![Some(Value::from("Alice"))]);
}
