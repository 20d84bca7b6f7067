//! Notification dispatcher.
//!
//! One thread per store. Commit outcomes arrive in the order workers
//! finished them; each batch is matched against a registry snapshot taken
//! when the batch starts, delivered fact by fact, and only then is the
//! commit's completion callback run.

use crate::change::{ChangeFact, CommitId, CommitReceipt};
use crate::node::Node;
use crate::watch::{WatchEntry, WatchEvent, WatchHandle, WatchRegistry};
use crate::{GraphError, Result};
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc::{self, SendError, Sender};
use std::sync::Arc;
use std::thread;

/// Called once when a commit has been stored and dispatched, or has failed.
pub type Completion = Box<dyn FnOnce(Result<CommitReceipt>) + Send>;

/// Receives every watcher error or panic.
pub type ErrorSink = Arc<dyn Fn(&WatcherFailure) + Send + Sync>;

/// A watcher returned an error or panicked while handling a fact.
#[derive(Debug, Clone)]
pub struct WatcherFailure {
    pub watch: WatchHandle,
    pub commit: CommitId,
    pub fact: ChangeFact,
    pub message: String,
}

impl WatcherFailure {
    pub fn to_error(&self) -> GraphError {
        GraphError::Watcher(format!("{}: {}", self.watch, self.message))
    }
}

/// Sink used when none is configured.
pub fn log_error_sink() -> ErrorSink {
    Arc::new(|failure: &WatcherFailure| {
        tracing::error!(
            watch = %failure.watch,
            commit = %failure.commit,
            object = %failure.fact.object_id,
            error = %failure.message,
            "watcher failed"
        );
    })
}

pub(crate) enum DispatchJob {
    Committed {
        commit: CommitId,
        originated_remotely: bool,
        deliveries: Vec<(ChangeFact, Node)>,
        completion: Completion,
    },
    Failed {
        error: GraphError,
        completion: Completion,
    },
}

impl DispatchJob {
    fn run(self, registry: &WatchRegistry, sink: &ErrorSink) {
        match self {
            DispatchJob::Failed { error, completion } => complete(completion, Err(error)),
            DispatchJob::Committed {
                commit,
                originated_remotely,
                deliveries,
                completion,
            } => {
                let index = registry.snapshot();
                for (fact, node) in &deliveries {
                    for entry in index.matching(fact) {
                        if !entry.is_active() {
                            continue;
                        }
                        let event = WatchEvent {
                            node,
                            fact,
                            originated_remotely,
                            commit,
                            watch: entry.handle,
                        };
                        if let Err(message) = deliver(entry, &event) {
                            sink(&WatcherFailure {
                                watch: entry.handle,
                                commit,
                                fact: fact.clone(),
                                message,
                            });
                        }
                    }
                }
                let facts = deliveries.into_iter().map(|(fact, _)| fact).collect();
                complete(completion, Ok(CommitReceipt { commit, facts }));
            }
        }
    }

    /// Run the completion without dispatching; used when the dispatcher is gone.
    fn abandon(self) {
        let completion = match self {
            DispatchJob::Committed { completion, .. } | DispatchJob::Failed { completion, .. } => {
                completion
            }
        };
        complete(completion, Err(GraphError::Disconnected));
    }
}

fn deliver(entry: &WatchEntry, event: &WatchEvent<'_>) -> std::result::Result<(), String> {
    match catch_unwind(AssertUnwindSafe(|| entry.watcher.on_change(event))) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e.to_string()),
        Err(payload) => Err(panic_message(payload.as_ref())),
    }
}

fn complete(completion: Completion, result: Result<CommitReceipt>) {
    if let Err(payload) = catch_unwind(AssertUnwindSafe(move || completion(result))) {
        tracing::error!(
            panic = %panic_message(payload.as_ref()),
            "commit completion panicked"
        );
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panicked: {s}")
    } else {
        "panicked".to_string()
    }
}

pub(crate) struct Dispatcher {
    sender: Sender<DispatchJob>,
}

impl Dispatcher {
    pub(crate) fn spawn(name: String, registry: Arc<WatchRegistry>, sink: ErrorSink) -> Result<Self> {
        let (sender, receiver) = mpsc::channel::<DispatchJob>();
        thread::Builder::new()
            .name(name)
            .spawn(move || {
                for job in receiver {
                    job.run(&registry, &sink);
                }
                tracing::trace!("dispatcher stopped");
            })
            .map_err(|e| GraphError::Storage(format!("failed to spawn dispatcher: {e}")))?;
        Ok(Self { sender })
    }

    pub(crate) fn submit(&self, job: DispatchJob) {
        if let Err(SendError(job)) = self.sender.send(job) {
            job.abandon();
        }
    }
}
