//! Generic table-driven state machine.
//!
//! Each protocol declares its transition table once; the [`Exchange`]
//! applies incoming message kinds against the table under the per-thread
//! lock, persisting the record and emitting a `StateChanged` event per
//! committed transition. A missing edge fails without mutating anything.

use crate::event_bus::EventBus;
use crate::lock::ThreadLocks;
use skein_store::{RecordStore, RecordStoreExt};
use skein_types::event::EventPayload;
use skein_types::records::ExchangeRecord;
use skein_types::{SkeinError, SkeinResult};
use std::fmt::Display;
use std::sync::Arc;
use tracing::{debug, warn};

/// A protocol's declared transition table.
///
/// Edges are `(state, incoming kind, role) -> next state`. Creation
/// entries name the message kinds allowed to bring a record into
/// existence, with the state the fresh record starts in. Ignore entries
/// mark `(state, kind)` pairs that are silent no-ops (duplicate acks on
/// a terminal record).
#[derive(Debug, Clone)]
pub struct TransitionTable<S, K, R> {
    protocol: &'static str,
    edges: Vec<(S, K, R, S)>,
    creations: Vec<(K, R, S)>,
    ignored: Vec<(S, K)>,
    terminal: Vec<S>,
}

impl<S, K, R> TransitionTable<S, K, R>
where
    S: Copy + Eq,
    K: Copy + Eq,
    R: Copy + Eq,
{
    /// Start an empty table for `protocol`.
    pub fn new(protocol: &'static str) -> Self {
        Self {
            protocol,
            edges: Vec::new(),
            creations: Vec::new(),
            ignored: Vec::new(),
            terminal: Vec::new(),
        }
    }

    /// Protocol name this table belongs to.
    pub fn protocol(&self) -> &'static str {
        self.protocol
    }

    /// Declare an edge.
    pub fn edge(mut self, from: S, on: K, role: R, to: S) -> Self {
        self.edges.push((from, on, role, to));
        self
    }

    /// Declare a message kind that may create a record for `role`,
    /// starting in `initial`.
    pub fn creates(mut self, on: K, role: R, initial: S) -> Self {
        self.creations.push((on, role, initial));
        self
    }

    /// Declare a silent no-op for `(state, kind)`.
    pub fn ignores(mut self, state: S, on: K) -> Self {
        self.ignored.push((state, on));
        self
    }

    /// Declare a terminal state.
    pub fn terminal(mut self, state: S) -> Self {
        self.terminal.push(state);
        self
    }

    /// Look up the edge for `(from, on, role)`.
    pub fn next(&self, from: S, on: K, role: R) -> Option<S> {
        self.edges
            .iter()
            .find(|(s, k, r, _)| *s == from && *k == on && *r == role)
            .map(|(_, _, _, to)| *to)
    }

    /// The initial state a record created by `(on, role)` starts in.
    pub fn creation_state(&self, on: K, role: R) -> Option<S> {
        self.creations
            .iter()
            .find(|(k, r, _)| *k == on && *r == role)
            .map(|(_, _, initial)| *initial)
    }

    /// Whether `(state, on)` is a declared no-op.
    pub fn is_ignored(&self, state: S, on: K) -> bool {
        self.ignored.iter().any(|(s, k)| *s == state && *k == on)
    }

    /// Whether `state` is terminal.
    pub fn is_terminal(&self, state: S) -> bool {
        self.terminal.contains(&state)
    }

    /// Fold a kind sequence over the table from `start`. Returns `None`
    /// as soon as an edge is missing. The unique reachable state for a
    /// message sequence, used by property tests.
    pub fn fold(&self, start: S, role: R, kinds: &[K]) -> Option<S> {
        kinds.iter().try_fold(start, |state, kind| {
            if self.is_ignored(state, *kind) {
                Some(state)
            } else {
                self.next(state, *kind, role)
            }
        })
    }
}

/// The outcome of applying a message kind to an exchange.
#[derive(Debug, Clone)]
pub struct Applied<Rec> {
    /// The record after the transition.
    pub record: Rec,
    /// Whether anything changed (false for declared no-ops).
    pub changed: bool,
}

/// A protocol state machine bound to its table, store, locks and bus.
pub struct Exchange<Rec: ExchangeRecord, K> {
    table: TransitionTable<Rec::State, K, Rec::Role>,
    store: Arc<dyn RecordStore>,
    locks: Arc<ThreadLocks>,
    events: EventBus,
}

impl<Rec, K> Exchange<Rec, K>
where
    Rec: ExchangeRecord,
    K: Copy + Eq + Display + Send + Sync,
{
    /// Bind a transition table to the shared infrastructure.
    pub fn new(
        table: TransitionTable<Rec::State, K, Rec::Role>,
        store: Arc<dyn RecordStore>,
        locks: Arc<ThreadLocks>,
        events: EventBus,
    ) -> Self {
        Self {
            table,
            store,
            locks,
            events,
        }
    }

    /// The underlying table.
    pub fn table(&self) -> &TransitionTable<Rec::State, K, Rec::Role> {
        &self.table
    }

    fn lock_key(thread_id: &str) -> String {
        format!("{}/{thread_id}", Rec::PROTOCOL)
    }

    /// Find the live record for a thread.
    pub async fn find(&self, thread_id: &str) -> SkeinResult<Option<Rec>> {
        self.store.find_by_thread(thread_id).await
    }

    /// Persist a locally-created record (we initiated the exchange by
    /// sending its first message). Emits `StateChanged` with no previous
    /// state.
    pub async fn create(&self, record: Rec) -> SkeinResult<Rec> {
        let _guard = self.locks.acquire(&Self::lock_key(record.thread_id())).await;
        if self.find(record.thread_id()).await?.is_some() {
            return Err(SkeinError::DuplicateRecord(format!(
                "{}/{}",
                Rec::PROTOCOL,
                record.thread_id()
            )));
        }
        self.store.save_record(&record).await?;
        self.emit(&record, None);
        Ok(record)
    }

    /// Apply an incoming kind to an existing record. Rejects messages
    /// for unknown threads without creating anything.
    pub async fn apply(&self, thread_id: &str, kind: K) -> SkeinResult<Rec> {
        self.transition(thread_id, kind, no_creation::<Rec>(), no_mutation::<Rec>())
            .await
            .map(|applied| applied.record)
    }

    /// Apply an incoming kind, additionally mutating record fields inside
    /// the same locked transition (before persist).
    pub async fn apply_with<F>(&self, thread_id: &str, kind: K, mutate: F) -> SkeinResult<Rec>
    where
        F: FnOnce(&mut Rec) + Send,
    {
        self.transition(thread_id, kind, no_creation::<Rec>(), Some(mutate))
            .await
            .map(|applied| applied.record)
    }

    /// Apply an incoming kind, creating the record from `create` when the
    /// thread has none. Creation is permitted only if the kind is a declared
    /// creation kind for the new record's role.
    pub async fn apply_or_create<C>(&self, thread_id: &str, kind: K, create: C) -> SkeinResult<Rec>
    where
        C: FnOnce() -> Rec + Send,
    {
        self.transition(thread_id, kind, Some(create), no_mutation::<Rec>())
            .await
            .map(|applied| applied.record)
    }

    /// Combination of [`Exchange::apply_or_create`] and
    /// [`Exchange::apply_with`]: creates when the thread is unknown (for
    /// declared creation kinds), mutates existing records inside the
    /// locked transition.
    pub async fn apply_or_create_with<C, F>(
        &self,
        thread_id: &str,
        kind: K,
        create: C,
        mutate: F,
    ) -> SkeinResult<Rec>
    where
        C: FnOnce() -> Rec + Send,
        F: FnOnce(&mut Rec) + Send,
    {
        self.transition(thread_id, kind, Some(create), Some(mutate))
            .await
            .map(|applied| applied.record)
    }

    /// Like [`Exchange::apply`], reporting whether the record changed
    /// (declared no-ops return `changed: false`).
    pub async fn apply_checked(&self, thread_id: &str, kind: K) -> SkeinResult<Applied<Rec>> {
        self.transition(thread_id, kind, no_creation::<Rec>(), no_mutation::<Rec>())
            .await
    }

    /// Mutate record fields without a state transition (keylist updates
    /// and similar). Locked, persisted, no event.
    pub async fn mutate<F>(&self, thread_id: &str, mutate: F) -> SkeinResult<Rec>
    where
        F: FnOnce(&mut Rec) + Send,
    {
        let _guard = self.locks.acquire(&Self::lock_key(thread_id)).await;
        let mut record: Rec = self
            .find(thread_id)
            .await?
            .ok_or_else(|| SkeinError::RecordNotFound(thread_id.to_string()))?;
        mutate(&mut record);
        self.store.update_record(&record).await?;
        Ok(record)
    }

    async fn transition<C, F>(
        &self,
        thread_id: &str,
        kind: K,
        create: Option<C>,
        mutate: Option<F>,
    ) -> SkeinResult<Applied<Rec>>
    where
        C: FnOnce() -> Rec + Send,
        F: FnOnce(&mut Rec) + Send,
    {
        let _guard = self.locks.acquire(&Self::lock_key(thread_id)).await;

        match self.find(thread_id).await? {
            Some(mut record) => {
                if self.table.is_ignored(record.state(), kind) {
                    debug!(
                        protocol = Rec::PROTOCOL,
                        thread_id,
                        state = %record.state(),
                        kind = %kind,
                        "duplicate message ignored"
                    );
                    return Ok(Applied {
                        record,
                        changed: false,
                    });
                }
                let previous = record.state();
                let next = self
                    .table
                    .next(previous, kind, record.role())
                    .ok_or_else(|| SkeinError::StateTransition {
                        thread_id: thread_id.to_string(),
                        state: previous.to_string(),
                        trigger: kind.to_string(),
                    })?;
                if let Some(mutate) = mutate {
                    mutate(&mut record);
                }
                record.set_state(next);
                self.store.update_record(&record).await?;
                self.emit(&record, Some(previous));
                Ok(Applied {
                    record,
                    changed: true,
                })
            }
            None => {
                let Some(create) = create else {
                    warn!(
                        protocol = Rec::PROTOCOL,
                        thread_id,
                        kind = %kind,
                        "message for unknown thread rejected"
                    );
                    return Err(SkeinError::no_record(thread_id, kind.to_string()));
                };
                let mut record = create();
                let initial = self
                    .table
                    .creation_state(kind, record.role())
                    .ok_or_else(|| SkeinError::no_record(thread_id, kind.to_string()))?;
                if let Some(mutate) = mutate {
                    mutate(&mut record);
                }
                record.set_state(initial);
                self.store.save_record(&record).await?;
                self.emit(&record, None);
                Ok(Applied {
                    record,
                    changed: true,
                })
            }
        }
    }

    fn emit(&self, record: &Rec, previous: Option<Rec::State>) {
        self.events.publish(EventPayload::StateChanged {
            protocol: Rec::PROTOCOL.to_string(),
            record_id: record.id().to_string(),
            thread_id: record.thread_id().to_string(),
            previous_state: previous.map(|s| s.to_string()),
            new_state: record.state().to_string(),
        });
    }
}

/// Typed `None` for the optional mutation closure.
fn no_mutation<Rec>() -> Option<fn(&mut Rec)> {
    None
}

/// Typed `None` for the optional creation closure.
fn no_creation<Rec>() -> Option<fn() -> Rec> {
    None
}
