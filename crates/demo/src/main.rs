use anyhow::{bail, Context, Result};
use graphwatch::{
    Entity, FactEvent, Graph, GraphObject, GraphStore, Node, Relationship, Value,
    WatchEvent, WatchResult,
};
use std::env;
use tracing_subscriber::EnvFilter;

const PERSON: &str = "Person";
const COMPANY: &str = "Company";
const EMPLOYEE: &str = "Employee";

const USAGE: &str = "usage: employees [list | hire <person> <company> | leave <person> | forget <person>]";

struct AppState {
    store: GraphStore,
    graph: Graph,
}

impl AppState {
    fn open() -> Result<Self> {
        let db_path = env::var("GRAPHWATCH_DB_PATH")
            .unwrap_or_else(|_| "./employees.graphwatch".to_string());
        let store = GraphStore::open(&db_path)
            .with_context(|| format!("failed to open graph database at {db_path}"))?;
        tracing::info!(path = %db_path, "opened employees database");
        Self::with_store(store)
    }

    fn with_store(store: GraphStore) -> Result<Self> {
        let graph = store.connect().context("failed to connect to graph store")?;
        Ok(Self { store, graph })
    }

    /// Print every change to an employment as it is committed.
    fn watch_employments(&self) {
        self.store
            .watch_for_relationship([EMPLOYEE], |e: &WatchEvent<'_>| -> WatchResult {
                if let Some(line) = describe(e)? {
                    println!("{line}");
                }
                Ok(())
            });
    }

    fn named(&self, object_type: &str, name: &str) -> Result<Option<Entity>> {
        for entity in self.graph.search_for_entity([object_type])? {
            if entity.get("name")?.as_ref().and_then(Value::as_text) == Some(name) {
                return Ok(Some(entity));
            }
        }
        Ok(None)
    }

    fn named_or_new(&self, object_type: &str, name: &str) -> Result<Entity> {
        if let Some(entity) = self.named(object_type, name)? {
            return Ok(entity);
        }
        let entity = Entity::new(&self.graph, object_type)?;
        entity.set("name", name)?;
        Ok(entity)
    }

    fn employments_of(&self, person: &Entity) -> Result<Vec<Relationship>> {
        let mut found = Vec::new();
        for job in self.graph.search_for_relationship([EMPLOYEE])? {
            if job.subject()?.as_ref() == Some(person) {
                found.push(job);
            }
        }
        Ok(found)
    }

    fn hire(&self, person: &str, company: &str) -> Result<()> {
        let person = self.named_or_new(PERSON, person)?;
        let company = self.named_or_new(COMPANY, company)?;
        let job = Relationship::new(&self.graph, EMPLOYEE)?;
        job.set_subject(Some(&person))?;
        job.set_object(Some(&company))?;
        job.set("since", chrono::Utc::now())?;
        self.graph.commit_and_wait().context("failed to record hire")?;
        Ok(())
    }

    fn leave(&self, person: &str) -> Result<()> {
        let Some(person) = self.named(PERSON, person)? else {
            bail!("no person named {person}");
        };
        for job in self.employments_of(&person)? {
            job.delete()?;
        }
        self.graph.commit_and_wait().context("failed to record leave")?;
        Ok(())
    }

    /// Delete the person; their employments stay, with no subject.
    fn forget(&self, person: &str) -> Result<()> {
        let Some(entity) = self.named(PERSON, person)? else {
            bail!("no person named {person}");
        };
        entity.delete()?;
        self.graph.commit_and_wait().context("failed to forget person")?;
        Ok(())
    }

    fn rows(&self) -> Result<Vec<(String, String)>> {
        let mut rows = Vec::new();
        for job in self.graph.search_for_relationship([EMPLOYEE])? {
            rows.push((name_of(job.subject()?)?, name_of(job.object()?)?));
        }
        Ok(rows)
    }
}

fn name_of(entity: Option<Entity>) -> Result<String> {
    let name = match entity {
        Some(e) => e.get("name")?,
        None => None,
    };
    Ok(name
        .as_ref()
        .and_then(Value::as_text)
        .unwrap_or("-")
        .to_string())
}

fn describe(event: &WatchEvent<'_>) -> Result<Option<String>> {
    let Node::Relationship(job) = event.node else {
        return Ok(None);
    };
    let line = match event.fact.event() {
        Some(FactEvent::Inserted) => format!(
            "hired: {} at {}",
            name_of(job.subject()?)?,
            name_of(job.object()?)?
        ),
        Some(FactEvent::Deleted) => format!("employment {} ended", event.fact.object_id),
        _ => return Ok(None),
    };
    Ok(Some(line))
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let state = AppState::open()?;
    state.watch_employments();

    let args: Vec<String> = env::args().skip(1).collect();
    match args.iter().map(String::as_str).collect::<Vec<_>>().as_slice() {
        [] | ["list"] => {}
        ["hire", person, company] => state.hire(person, company)?,
        ["leave", person] => state.leave(person)?,
        ["forget", person] => state.forget(person)?,
        _ => bail!(USAGE),
    }

    for (person, company) in state.rows()? {
        println!("{person:<20} {company}");
    }
    Ok(())
}
