//! Single-threaded confinement worker.
//!
//! Each connection owns one worker thread and one [`ConnectionState`]. All
//! access to that state is a job sent through the worker's mailbox, so the
//! state is only ever touched from one thread. Before each job the worker
//! reclaims records whose handles have all been dropped.

use crate::staging::ConnectionState;
use crate::{GraphError, Result};
use std::sync::mpsc::{self, Sender};
use std::thread::{self, JoinHandle};

type Job = Box<dyn FnOnce(&mut ConnectionState) + Send>;

pub(crate) struct Confinement {
    sender: Option<Sender<Job>>,
    worker: Option<JoinHandle<()>>,
}

impl Confinement {
    /// Start a worker thread that owns `state` until every sender is dropped.
    pub(crate) fn spawn(name: String, mut state: ConnectionState) -> Result<Self> {
        let (sender, receiver) = mpsc::channel::<Job>();
        let thread_name = name.clone();
        let worker = thread::Builder::new()
            .name(thread_name)
            .spawn(move || {
                tracing::trace!(worker = %name, "confinement worker started");
                for job in receiver {
                    state.reclaim();
                    job(&mut state);
                }
                tracing::trace!(worker = %name, "confinement worker stopped");
            })
            .map_err(|e| GraphError::Storage(format!("failed to spawn worker: {e}")))?;
        Ok(Self {
            sender: Some(sender),
            worker: Some(worker),
        })
    }

    /// Enqueue `job` and return immediately.
    pub(crate) fn perform<F>(&self, job: F) -> Result<()>
    where
        F: FnOnce(&mut ConnectionState) + Send + 'static,
    {
        let sender = self.sender.as_ref().ok_or(GraphError::Disconnected)?;
        sender
            .send(Box::new(job))
            .map_err(|_| GraphError::Disconnected)
    }

    /// Enqueue `job` and block until the worker has run it.
    pub(crate) fn perform_and_wait<R, F>(&self, job: F) -> Result<R>
    where
        F: FnOnce(&mut ConnectionState) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (reply, response) = mpsc::sync_channel(1);
        self.perform(move |state| {
            let _ = reply.send(job(state));
        })?;
        response.recv().map_err(|_| GraphError::Disconnected)
    }
}

impl Drop for Confinement {
    /// Close the mailbox and wait for queued jobs to drain, so the state
    /// (and the store it holds) is released before the drop returns.
    fn drop(&mut self) {
        self.sender.take();
        if let Some(worker) = self.worker.take() {
            if worker.thread().id() != thread::current().id() {
                let _ = worker.join();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::RedbBackend;
    use crate::record::ObjectKind;
    use crate::value::Value;
    use std::sync::Arc;

    fn worker() -> Confinement {
        let state = ConnectionState::new(Arc::new(RedbBackend::in_memory().unwrap()));
        Confinement::spawn("graphwatch-test".into(), state).unwrap()
    }

    #[test]
    fn jobs_run_in_submission_order() {
        let worker = worker();
        let entity = worker
            .perform_and_wait(|s| s.create(ObjectKind::Entity, "T"))
            .unwrap()
            .unwrap();
        let slot = entity.slot;
        for n in 0..100 {
            worker
                .perform(move |s| {
                    s.set_property(slot, "n", Value::Int(n)).unwrap();
                })
                .unwrap();
        }
        let last = worker
            .perform_and_wait(move |s| s.property(slot, "n"))
            .unwrap()
            .unwrap();
        assert_eq!(last, Some(Value::Int(99)));
    }

    #[test]
    fn callers_on_many_threads_share_one_worker() {
        let worker = Arc::new(worker());
        let entity = worker
            .perform_and_wait(|s| s.create(ObjectKind::Entity, "T"))
            .unwrap()
            .unwrap();
        let slot = entity.slot;

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let worker = Arc::clone(&worker);
                thread::spawn(move || {
                    worker
                        .perform_and_wait(move |s| s.add_tag(slot, &format!("t{i}")))
                        .unwrap()
                        .unwrap();
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let tags = worker.perform_and_wait(move |s| s.tags(slot)).unwrap().unwrap();
        assert_eq!(tags.len(), 8);
    }

    #[test]
    fn drop_waits_for_queued_jobs() {
        let worker = worker();
        let (tx, rx) = mpsc::channel();
        for n in 0..10 {
            let tx = tx.clone();
            worker.perform(move |_| tx.send(n).unwrap()).unwrap();
        }
        drop(tx);
        drop(worker);
        assert_eq!(rx.try_iter().count(), 10);
    }

    #[test]
    fn records_without_handles_are_reclaimed_before_the_next_job() {
        let worker = worker();
        let slot = {
            let entity = worker
                .perform_and_wait(|s| s.create(ObjectKind::Entity, "T"))
                .unwrap()
                .unwrap();
            worker
                .perform_and_wait(move |s| s.set_property(entity.slot, "P", Value::Int(1)))
                .unwrap()
                .unwrap();
            entity.slot
        };
        let discarded = worker
            .perform_and_wait(move |s| s.is_deleted(slot))
            .unwrap()
            .unwrap();
        assert!(discarded);
    }
}
