//! Resource Store.
//!
//! In-process transactional entity store. Transactions are serializable: a
//! single lock is held for the whole closure. Each table journals the prior
//! value of the rows the closure touches; if the closure returns `Err` the
//! journal is replayed, so a failed transaction leaves no trace.
//!
//! Deleted rows are dropped by [`ResourceStore::purge_finished`] once they
//! have sat unreferenced for the retention period.
//!
//! Work items and lifecycle events recorded on a [`Transaction`] form its
//! outbox. They are handed to the work queue and event bus after commit and
//! discarded on rollback.
//!
//! Closures are synchronous. Remote calls are never made while a
//! transaction is open.

pub mod tables;

pub use tables::{PurgeStats, Record, Table, Tables};

use crate::errors::SfuError;
use crate::queue::{EventBus, LifecycleEvent, WorkItem, WorkQueue};
use chrono::Utc;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::trace;

/// A transaction in progress: the journaled tables plus the outbox.
pub struct Transaction<'a> {
    tables: &'a mut Tables,
    work: Vec<WorkItem>,
    events: Vec<LifecycleEvent>,
}

impl<'a> Transaction<'a> {
    fn new(tables: &'a mut Tables) -> Self {
        Self {
            tables,
            work: Vec::new(),
            events: Vec::new(),
        }
    }

    /// Queue `item` for delivery on commit.
    pub fn push_work(&mut self, item: WorkItem) {
        self.work.push(item);
    }

    /// Publish `event` on commit.
    pub fn emit(&mut self, event: LifecycleEvent) {
        self.events.push(event);
    }

    fn into_outbox(self) -> (Vec<WorkItem>, Vec<LifecycleEvent>) {
        (self.work, self.events)
    }
}

impl Deref for Transaction<'_> {
    type Target = Tables;

    fn deref(&self) -> &Tables {
        &*self.tables
    }
}

impl DerefMut for Transaction<'_> {
    fn deref_mut(&mut self) -> &mut Tables {
        &mut *self.tables
    }
}

pub struct ResourceStore {
    tables: Mutex<Tables>,
    queue: Arc<WorkQueue>,
    events: Arc<EventBus>,
}

impl ResourceStore {
    pub fn new(queue: Arc<WorkQueue>, events: Arc<EventBus>) -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            queue,
            events,
        }
    }

    pub fn queue(&self) -> &Arc<WorkQueue> {
        &self.queue
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// Run `f` in a serializable transaction.
    pub fn transact<T>(
        &self,
        f: impl FnOnce(&mut Transaction<'_>) -> Result<T, SfuError>,
    ) -> Result<T, SfuError> {
        let (value, work, events) = {
            let mut guard = self
                .tables
                .lock()
                .map_err(|_| SfuError::Store("resource store lock poisoned".to_string()))?;
            guard.begin();
            let outcome = {
                let mut tx = Transaction::new(&mut guard);
                f(&mut tx).map(|value| (value, tx.into_outbox()))
            };
            match outcome {
                Ok((value, (work, events))) => {
                    guard.commit();
                    (value, work, events)
                }
                Err(e) => {
                    guard.rollback();
                    return Err(e);
                }
            }
        };

        trace!(
            target: "sfu.store",
            work_items = work.len(),
            events = events.len(),
            "Transaction committed"
        );

        for item in work {
            self.queue.push(item);
        }
        for event in events {
            self.events.publish(event);
        }
        Ok(value)
    }

    /// Drop Deleted rows untouched for at least `retention`.
    pub fn purge_finished(&self, retention: Duration) -> Result<PurgeStats, SfuError> {
        let retention = chrono::Duration::from_std(retention)
            .map_err(|e| SfuError::Store(format!("invalid retention: {e}")))?;
        let cutoff = Utc::now() - retention;
        self.transact(|tx| Ok(tx.purge_finished(cutoff)))
    }

    /// Read-only access to the committed tables.
    pub fn read<T>(&self, f: impl FnOnce(&Tables) -> T) -> Result<T, SfuError> {
        let guard = self
            .tables
            .lock()
            .map_err(|_| SfuError::Store("resource store lock poisoned".to_string()))?;
        Ok(f(&guard))
    }
}
