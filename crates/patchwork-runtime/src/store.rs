#![forbid(unsafe_code)]

//! The tracked data store.
//!
//! A [`Store`] owns the current [`Snapshot`] and a list of listeners. Writes
//! made through [`Store::update`] are tracked, and the resulting merges are
//! delivered to listeners either right after the update (synchronous mode)
//! or coalesced into one merge by a deferred flush (batched mode).
//!
//! Listeners come in two kinds:
//!
//! - raw merge listeners, registered with [`Store::track_merges`];
//! - update routines, registered with [`Store::add_updates`], which are
//!   combined into an [`UpdateScheduler`], rendered once immediately, and
//!   then dispatched with every merge.
//!
//! # Re-entrancy
//!
//! While listeners run, the snapshot is borrowed. Consumers that want to
//! write go through a [`StoreHandle`]: [`StoreHandle::enqueue`] queues the
//! write, which is applied once the dispatch finishes. Its merge is held for
//! the next dispatch (or handed to the batch in batched mode); it never
//! re-enters the listeners that are running.
//!
//! # Failure Modes
//!
//! - A consumer failure is returned from the call that triggered the
//!   dispatch. Update listeners after the failing one are invalidated and do
//!   a full render on their next dispatch.
//! - Failures inside a deferred flush have no caller. They are logged and
//!   kept for [`Store::check_error`].

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::mem;
use std::rc::{Rc, Weak};

use patchwork_core::merge::{apply, make};
use patchwork_core::{
    EngineError, Merge, MergeBuffer, MergeSink, Result, Snapshot, SnapshotId, Tracked, Value,
};
use tracing::{debug, warn};

use crate::batch::BatchedSink;
use crate::config::{DeliveryMode, StoreConfig};
use crate::deferred::{Deferred, TurnQueue};
use crate::scheduler::{Routine, UpdateScheduler};

type MergeListener = Box<dyn FnMut(&Merge)>;
type Mutation = Box<dyn FnOnce(&mut Tracked<'_>) -> Result<()>>;

enum ListenerKind {
    Merges(MergeListener),
    Updates(UpdateScheduler),
}

struct Listener {
    kind: ListenerKind,
    notify_external: bool,
}

struct StoreInner {
    config: StoreConfig,
    snapshot: RefCell<Snapshot>,
    listeners: RefCell<Vec<Listener>>,
    batch: Option<BatchedSink>,
    turns: Option<Rc<TurnQueue>>,
    dispatching: Cell<bool>,
    queued: RefCell<VecDeque<Mutation>>,
    carry: RefCell<Option<Merge>>,
    error: RefCell<Option<EngineError>>,
}

/// Marks the store as dispatching until dropped.
struct DispatchGuard<'a>(&'a Cell<bool>);

impl<'a> DispatchGuard<'a> {
    fn enter(flag: &'a Cell<bool>) -> Self {
        flag.set(true);
        Self(flag)
    }
}

impl Drop for DispatchGuard<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

/// Owner of the live snapshot and its listeners.
pub struct Store {
    inner: Rc<StoreInner>,
}

/// Non-owning handle to a [`Store`], safe to capture in consumers.
#[derive(Clone)]
pub struct StoreHandle {
    inner: Weak<StoreInner>,
}

impl Store {
    /// A synchronous store over `data`.
    pub fn new(data: impl Into<Value>) -> Self {
        Self::with_config(data, StoreConfig::default())
    }

    /// A store configured by `config`.
    ///
    /// Batched stores get their own [`TurnQueue`], reachable through
    /// [`Store::turns`].
    pub fn with_config(data: impl Into<Value>, config: StoreConfig) -> Self {
        let turns = (config.delivery == DeliveryMode::Batched).then(|| Rc::new(TurnQueue::new()));
        let deferred = turns.clone().map(|queue| queue as Rc<dyn Deferred>);
        Self::build(data.into(), config, deferred, turns)
    }

    /// A store whose batched flushes are scheduled on `deferred`.
    pub fn with_deferred(
        data: impl Into<Value>,
        config: StoreConfig,
        deferred: Rc<dyn Deferred>,
    ) -> Self {
        Self::build(data.into(), config, Some(deferred), None)
    }

    fn build(
        data: Value,
        config: StoreConfig,
        deferred: Option<Rc<dyn Deferred>>,
        turns: Option<Rc<TurnQueue>>,
    ) -> Self {
        let inner = Rc::new_cyclic(|weak: &Weak<StoreInner>| {
            let batch = match (config.delivery, deferred) {
                (DeliveryMode::Batched, Some(deferred)) => {
                    let weak = weak.clone();
                    Some(BatchedSink::new(deferred, move |merge| {
                        if let Some(inner) = weak.upgrade() {
                            inner.deliver_deferred(merge);
                        }
                    }))
                }
                _ => None,
            };
            StoreInner {
                config,
                snapshot: RefCell::new(Snapshot::new(data)),
                listeners: RefCell::new(Vec::new()),
                batch,
                turns,
                dispatching: Cell::new(false),
                queued: RefCell::new(VecDeque::new()),
                carry: RefCell::new(None),
                error: RefCell::new(None),
            }
        });
        debug!(store = inner.config.label_or_default(), delivery = %inner.config.delivery, "store created");
        Self { inner }
    }

    #[must_use]
    pub fn handle(&self) -> StoreHandle {
        StoreHandle {
            inner: Rc::downgrade(&self.inner),
        }
    }

    #[must_use]
    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    /// The current data. Cheap: containers are shared.
    #[must_use]
    pub fn data(&self) -> Value {
        self.inner.snapshot.borrow().root().clone()
    }

    #[must_use]
    pub fn snapshot_id(&self) -> SnapshotId {
        self.inner.snapshot.borrow().id()
    }

    /// The store's own turn queue, for batched stores built by
    /// [`Store::with_config`].
    #[must_use]
    pub fn turns(&self) -> Option<&TurnQueue> {
        self.inner.turns.as_deref()
    }

    /// Write through a tracked handle; the writes become merges for the
    /// listeners.
    pub fn update<R>(&self, f: impl FnOnce(&mut Tracked<'_>) -> R) -> Result<R> {
        if self.inner.dispatching.get() {
            return Err(EngineError::DispatchInProgress);
        }
        let (out, merges) = self.inner.write(f)?;
        // Every write is already in the snapshot, so every merge is delivered
        // even after a failure.
        let mut first_err = None;
        for merge in merges {
            if let Err(err) = self.inner.route(merge) {
                first_err.get_or_insert(err);
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(out),
        }
    }

    /// Apply an externally produced merge and notify listeners that accept
    /// external merges.
    pub fn merge(&self, merge: Merge) -> Result<()> {
        if self.inner.dispatching.get() {
            return Err(EngineError::DispatchInProgress);
        }
        self.inner.flush_batch();
        {
            let mut snapshot = self.inner.borrow_snapshot_mut()?;
            let root = mem::take(snapshot.root_mut());
            *snapshot.root_mut() = apply(root, &merge, false);
        }
        self.inner.send(merge, true)
    }

    /// Replace the data wholesale under a new identity.
    ///
    /// Update routines re-render in full; raw merge listeners that accept
    /// external merges receive the diff between old and new data.
    pub fn set_data(&self, data: impl Into<Value>) -> Result<()> {
        if self.inner.dispatching.get() {
            return Err(EngineError::DispatchInProgress);
        }
        self.inner.flush_batch();
        let merge = {
            let mut snapshot = self.inner.borrow_snapshot_mut()?;
            let old = snapshot.replace(data);
            make(&old, snapshot.root(), false)
        };
        match merge {
            Some(merge) => self.inner.send(merge, true),
            None => Ok(()),
        }
    }

    /// Register a raw merge listener.
    ///
    /// Without `notify_external`, the listener only sees merges from tracked
    /// writes, not from [`Store::merge`] or [`Store::set_data`].
    pub fn track_merges(
        &self,
        listener: impl FnMut(&Merge) + 'static,
        notify_external: bool,
    ) -> Result<()> {
        let mut listeners = self
            .inner
            .listeners
            .try_borrow_mut()
            .map_err(|_| EngineError::DispatchInProgress)?;
        listeners.push(Listener {
            kind: ListenerKind::Merges(Box::new(listener)),
            notify_external,
        });
        Ok(())
    }

    /// Combine `routines`, render them once against the current data, and
    /// keep them updated from then on.
    ///
    /// The routines are registered even if the first render fails; they
    /// render in full on the next dispatch.
    pub fn add_updates(&self, routines: impl IntoIterator<Item = Routine>) -> Result<()> {
        if self.inner.dispatching.get() {
            return Err(EngineError::DispatchInProgress);
        }
        let mut scheduler = UpdateScheduler::combine(routines);
        if scheduler.is_empty() {
            return Err(EngineError::NoConsumers);
        }
        let rendered = {
            let _guard = DispatchGuard::enter(&self.inner.dispatching);
            let result = scheduler.dispatch(&self.inner.snapshot.borrow(), None);
            result.and(self.inner.drain_queued())
        };
        self.inner.listeners.borrow_mut().push(Listener {
            kind: ListenerKind::Updates(scheduler),
            notify_external: true,
        });
        rendered
    }

    /// Deliver anything pending now: the open batch, and writes queued by
    /// consumers during the last dispatch.
    pub fn flush(&self) -> Result<()> {
        if self.inner.dispatching.get() {
            return Err(EngineError::DispatchInProgress);
        }
        self.inner.flush_batch();
        let carried = self.inner.carry.borrow_mut().take();
        if let Some(merge) = carried {
            self.inner.dispatch(&merge, false)?;
        }
        self.check_error()
    }

    /// Take the error left by a deferred flush, if any.
    pub fn check_error(&self) -> Result<()> {
        match self.inner.error.borrow_mut().take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Whether merges are waiting for delivery.
    #[must_use]
    pub fn has_pending(&self) -> bool {
        self.inner.carry.borrow().is_some()
            || self.inner.batch.as_ref().is_some_and(BatchedSink::has_pending)
    }
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("label", &self.inner.config.label_or_default())
            .field("delivery", &self.inner.config.delivery)
            .field("listeners", &self.inner.listeners.try_borrow().map(|l| l.len()).ok())
            .field("dispatching", &self.inner.dispatching.get())
            .finish_non_exhaustive()
    }
}

impl StoreHandle {
    /// The store, if it is still alive.
    #[must_use]
    pub fn upgrade(&self) -> Option<Store> {
        self.inner.upgrade().map(|inner| Store { inner })
    }

    /// Write through a tracked handle, now or once the running dispatch
    /// finishes.
    pub fn enqueue(
        &self,
        mutation: impl FnOnce(&mut Tracked<'_>) -> Result<()> + 'static,
    ) -> Result<()> {
        let store = self.upgrade().ok_or(EngineError::StoreDropped)?;
        if store.inner.dispatching.get() {
            store.inner.queued.borrow_mut().push_back(Box::new(mutation));
            return Ok(());
        }
        store.update(mutation)?
    }
}

impl fmt::Debug for StoreHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreHandle")
            .field("alive", &(self.inner.strong_count() > 0))
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Delivery
// ---------------------------------------------------------------------------

impl StoreInner {
    fn borrow_snapshot_mut(&self) -> Result<std::cell::RefMut<'_, Snapshot>> {
        self.snapshot
            .try_borrow_mut()
            .map_err(|_| EngineError::DispatchInProgress)
    }

    fn write<R>(&self, f: impl FnOnce(&mut Tracked<'_>) -> R) -> Result<(R, Vec<Merge>)> {
        let mut snapshot = self.borrow_snapshot_mut()?;
        let buffer = MergeBuffer::new();
        let out = {
            let mut tracked = Tracked::new(snapshot.root_mut(), &buffer);
            f(&mut tracked)
        };
        Ok((out, buffer.take()))
    }

    /// Deliver the open batch now. External changes call this first so that
    /// listeners see merges in the order the data changed; a failure is kept
    /// for [`Store::check_error`] like any other deferred delivery.
    fn flush_batch(&self) {
        if let Some(batch) = &self.batch {
            batch.flush();
        }
    }

    /// Hand a tracked-write merge to the batch, or dispatch it now.
    fn route(&self, merge: Merge) -> Result<()> {
        match &self.batch {
            Some(batch) => {
                batch.deliver(merge);
                Ok(())
            }
            None => self.send(merge, false),
        }
    }

    fn send(&self, merge: Merge, external: bool) -> Result<()> {
        if self.dispatching.get() {
            absorb_into(&self.carry, merge);
            return Ok(());
        }
        let carried = self.carry.borrow_mut().take();
        match carried {
            Some(mut carried) if !external => {
                carried.absorb(merge);
                self.dispatch(&carried, false)
            }
            Some(carried) => {
                let earlier = self.dispatch(&carried, false);
                let external = self.dispatch(&merge, true);
                earlier.and(external)
            }
            None => self.dispatch(&merge, external),
        }
    }

    fn dispatch(&self, merge: &Merge, external: bool) -> Result<()> {
        let _guard = DispatchGuard::enter(&self.dispatching);
        let notified = self.notify(merge, external);
        let drained = self.drain_queued();
        notified.and(drained)
    }

    fn notify(&self, merge: &Merge, external: bool) -> Result<()> {
        let snapshot = self.snapshot.borrow();
        let mut listeners = self.listeners.borrow_mut();
        let mut failure: Option<EngineError> = None;
        for listener in listeners.iter_mut() {
            if external && !listener.notify_external {
                continue;
            }
            match &mut listener.kind {
                ListenerKind::Merges(f) => f(merge),
                ListenerKind::Updates(scheduler) if failure.is_some() => scheduler.invalidate(),
                ListenerKind::Updates(scheduler) => {
                    if let Err(err) = scheduler.dispatch(&snapshot, Some(merge)) {
                        failure = Some(err);
                    }
                }
            }
        }
        debug!(
            store = self.config.label_or_default(),
            external,
            listeners = listeners.len(),
            failed = failure.is_some(),
            "merge delivered"
        );
        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Apply writes queued during a dispatch. Their merges wait for the next
    /// delivery.
    fn drain_queued(&self) -> Result<()> {
        let mut first_err = None;
        loop {
            let next = self.queued.borrow_mut().pop_front();
            let Some(mutation) = next else {
                break;
            };
            let written = self.write(mutation);
            let (result, merges) = match written {
                Ok(written) => written,
                Err(err) => (Err(err), Vec::new()),
            };
            for merge in merges {
                match &self.batch {
                    Some(batch) => batch.deliver(merge),
                    None => absorb_into(&self.carry, merge),
                }
            }
            if let Err(err) = result {
                warn!(store = self.config.label_or_default(), %err, "queued write failed");
                first_err.get_or_insert(err);
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn deliver_deferred(&self, merge: Merge) {
        if let Err(err) = self.send(merge, false) {
            warn!(store = self.config.label_or_default(), %err, "deferred delivery failed");
            *self.error.borrow_mut() = Some(err);
        }
    }
}

fn absorb_into(slot: &RefCell<Option<Merge>>, merge: Merge) {
    let mut slot = slot.borrow_mut();
    match slot.as_mut() {
        Some(existing) => existing.absorb(merge),
        None => *slot = Some(merge),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
