//! Tables and secondary index queries of the resource store.

use crate::errors::SfuError;
use crate::models::{
    CallRecord, ConsumerRecord, Lifecycle, ProducerRecord, RouterRecord, TransportRecord,
    WorkerRecord,
};
use crate::negotiation::end_stream::EndStreamRecord;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};

/// A row type stored in a [`Table`].
pub trait Record: Clone {
    /// Entity label used in not-found errors.
    const KIND: &'static str;

    fn id(&self) -> &str;

    fn touch(&mut self, now: DateTime<Utc>);
}

macro_rules! impl_record {
    ($ty:ty, $kind:literal) => {
        impl Record for $ty {
            const KIND: &'static str = $kind;

            fn id(&self) -> &str {
                &self.id
            }

            fn touch(&mut self, now: DateTime<Utc>) {
                self.updated_at = now;
            }
        }
    };
}

impl_record!(WorkerRecord, "worker");
impl_record!(RouterRecord, "router");
impl_record!(TransportRecord, "transport");
impl_record!(ProducerRecord, "producer");
impl_record!(ConsumerRecord, "consumer");
impl_record!(CallRecord, "call");
impl_record!(EndStreamRecord, "stream");

/// Id-keyed table.
///
/// While a transaction is open the table journals the prior value of every
/// row it touches, so a rollback only restores what changed.
#[derive(Debug, Clone)]
pub struct Table<T> {
    rows: BTreeMap<String, T>,
    /// Prior value per touched id; `None` means the row did not exist.
    undo: Option<BTreeMap<String, Option<T>>>,
}

impl<T> Default for Table<T> {
    fn default() -> Self {
        Self {
            rows: BTreeMap::new(),
            undo: None,
        }
    }
}

impl<T: Record> Table<T> {
    pub fn find(&self, id: &str) -> Option<&T> {
        self.rows.get(id)
    }

    /// Like [`Table::find`] but fails with `NotFound`.
    pub fn get(&self, id: &str) -> Result<&T, SfuError> {
        self.rows
            .get(id)
            .ok_or_else(|| SfuError::NotFound(format!("{} {id}", T::KIND)))
    }

    /// Mutable access; stamps `updated_at`.
    pub fn get_mut(&mut self, id: &str) -> Result<&mut T, SfuError> {
        self.find_mut(id)
            .ok_or_else(|| SfuError::NotFound(format!("{} {id}", T::KIND)))
    }

    /// Like [`Table::get_mut`] but a missing row is `None`.
    pub fn find_mut(&mut self, id: &str) -> Option<&mut T> {
        if !self.rows.contains_key(id) {
            return None;
        }
        self.save(id);
        let row = self.rows.get_mut(id)?;
        row.touch(Utc::now());
        Some(row)
    }

    pub fn insert(&mut self, row: T) {
        self.save(row.id());
        self.rows.insert(row.id().to_string(), row);
    }

    pub fn remove(&mut self, id: &str) -> Option<T> {
        self.save(id);
        self.rows.remove(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.rows.contains_key(id)
    }

    pub fn values(&self) -> impl Iterator<Item = &T> {
        self.rows.values()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Ids of rows matching `pred`, in id order.
    pub fn ids_where(&self, pred: impl Fn(&T) -> bool) -> Vec<String> {
        self.rows
            .values()
            .filter(|row| pred(row))
            .map(|row| row.id().to_string())
            .collect()
    }

    /// Journal the current value of `id` on its first touch.
    fn save(&mut self, id: &str) {
        if let Some(undo) = self.undo.as_mut() {
            if !undo.contains_key(id) {
                undo.insert(id.to_string(), self.rows.get(id).cloned());
            }
        }
    }

    fn begin(&mut self) {
        self.undo = Some(BTreeMap::new());
    }

    fn commit(&mut self) {
        self.undo = None;
    }

    fn rollback(&mut self) {
        for (id, prior) in self.undo.take().unwrap_or_default() {
            match prior {
                Some(row) => {
                    self.rows.insert(id, row);
                }
                None => {
                    self.rows.remove(&id);
                }
            }
        }
    }
}

/// Rows dropped by [`Tables::purge_finished`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeStats {
    pub routers: usize,
    pub transports: usize,
    pub producers: usize,
    pub consumers: usize,
}

impl PurgeStats {
    pub fn total(&self) -> usize {
        self.routers + self.transports + self.producers + self.consumers
    }
}

#[derive(Debug, Clone, Default)]
pub struct Tables {
    pub workers: Table<WorkerRecord>,
    pub routers: Table<RouterRecord>,
    pub transports: Table<TransportRecord>,
    pub producers: Table<ProducerRecord>,
    pub consumers: Table<ConsumerRecord>,
    pub calls: Table<CallRecord>,
    pub end_streams: Table<EndStreamRecord>,
}

impl Tables {
    /// Healthy, non-deleted workers.
    pub fn active_workers(&self) -> Vec<&WorkerRecord> {
        self.workers.values().filter(|w| w.is_active()).collect()
    }

    pub fn routers_by_worker(&self, worker_id: &str) -> Vec<String> {
        self.routers
            .ids_where(|r| r.worker_id.as_deref() == Some(worker_id))
    }

    pub fn transports_by_router(&self, router_id: &str) -> Vec<String> {
        self.transports.ids_where(|t| t.router_id == router_id)
    }

    pub fn producers_by_transport(&self, transport_id: &str) -> Vec<String> {
        self.producers.ids_where(|p| p.transport_id == transport_id)
    }

    pub fn consumers_by_transport(&self, transport_id: &str) -> Vec<String> {
        self.consumers.ids_where(|c| c.transport_id == transport_id)
    }

    pub fn consumers_by_producer(&self, producer_id: &str) -> Vec<String> {
        self.consumers.ids_where(|c| c.producer_id == producer_id)
    }

    pub fn end_streams_by_peer(&self, call_id: &str, peer_id: &str) -> Vec<&EndStreamRecord> {
        self.end_streams
            .values()
            .filter(|s| s.call_id == call_id && s.peer_id == peer_id)
            .collect()
    }

    /// Drop Deleted rows last changed at or before `cutoff`, bottom-up. A row
    /// stays while anything live still names it: a consumer its producer, a
    /// peer its transport, a call its router. A transport takes its
    /// end-stream with it. Workers are kept.
    pub fn purge_finished(&mut self, cutoff: DateTime<Utc>) -> PurgeStats {
        let mut stats = PurgeStats::default();

        let consumers = self
            .consumers
            .ids_where(|c| c.state.is_terminal() && c.updated_at <= cutoff);
        for id in consumers {
            self.consumers.remove(&id);
            stats.consumers += 1;
        }

        let peers: Vec<_> = self
            .calls
            .values()
            .flat_map(|call| call.peers.values())
            .collect();
        let held: BTreeSet<&str> = self
            .consumers
            .values()
            .map(|c| c.producer_id.as_str())
            .chain(peers.iter().flat_map(|p| p.producers.values().map(String::as_str)))
            .collect();
        let producers = self.producers.ids_where(|p| {
            p.state.is_terminal() && p.updated_at <= cutoff && !held.contains(p.id.as_str())
        });
        for id in producers {
            self.producers.remove(&id);
            stats.producers += 1;
        }

        let mut held: BTreeSet<String> = self
            .producers
            .values()
            .map(|p| p.transport_id.clone())
            .chain(self.consumers.values().map(|c| c.transport_id.clone()))
            .collect();
        for peer in &peers {
            held.extend(peer.send_transport_id.iter().cloned());
            held.extend(peer.recv_transport_id.iter().cloned());
            held.extend(peer.consumes.iter().cloned());
        }
        let transports = self.transports.ids_where(|t| {
            t.state.is_terminal() && t.updated_at <= cutoff && !held.contains(&t.id)
        });
        for id in transports {
            self.transports.remove(&id);
            self.end_streams.remove(&id);
            stats.transports += 1;
        }

        let mut held: BTreeSet<String> = self
            .transports
            .values()
            .map(|t| t.router_id.clone())
            .collect();
        held.extend(self.calls.values().filter_map(|c| c.router_id.clone()));
        let routers = self.routers.ids_where(|r| {
            r.state.is_terminal() && r.updated_at <= cutoff && !held.contains(&r.id)
        });
        for id in routers {
            self.routers.remove(&id);
            stats.routers += 1;
        }

        stats
    }

    pub(crate) fn begin(&mut self) {
        self.workers.begin();
        self.routers.begin();
        self.transports.begin();
        self.producers.begin();
        self.consumers.begin();
        self.calls.begin();
        self.end_streams.begin();
    }

    pub(crate) fn commit(&mut self) {
        self.workers.commit();
        self.routers.commit();
        self.transports.commit();
        self.producers.commit();
        self.consumers.commit();
        self.calls.commit();
        self.end_streams.commit();
    }

    pub(crate) fn rollback(&mut self) {
        self.workers.rollback();
        self.routers.rollback();
        self.transports.rollback();
        self.producers.rollback();
        self.consumers.rollback();
        self.calls.rollback();
        self.end_streams.rollback();
    }
}
