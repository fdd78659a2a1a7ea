#![forbid(unsafe_code)]

//! Batched merge delivery.
//!
//! [`BatchedSink`] is a [`MergeSink`] that folds every merge it receives into
//! one pending merge and delivers it from a single deferred flush.
//!
//! # Invariants
//!
//! 1. At most one flush is scheduled at any time. A write arriving while a
//!    flush is pending cancels it and schedules a fresh one.
//! 2. The delivered merge, applied to the value before the first write,
//!    yields the value after the last write. Deletions inside the batch stay
//!    visible until a later write overwrites them.
//! 3. Writes made by the delivery callback itself start a new batch.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

use patchwork_core::{Merge, MergeSink};
use tracing::trace;
use web_time::Instant;

use crate::deferred::{Deferred, TaskId};

struct BatchState {
    deferred: Rc<dyn Deferred>,
    deliver: Box<dyn Fn(Merge)>,
    pending: RefCell<Option<Merge>>,
    opened_at: Cell<Option<Instant>>,
    scheduled: Cell<Option<TaskId>>,
    flushes: Cell<u64>,
}

impl BatchState {
    fn flush(&self) -> bool {
        if let Some(task) = self.scheduled.take() {
            self.deferred.cancel(task);
        }
        let merge = self.pending.borrow_mut().take();
        let Some(merge) = merge else {
            return false;
        };
        let waited_us = self
            .opened_at
            .take()
            .map_or(0, |opened| opened.elapsed().as_micros() as u64);
        self.flushes.set(self.flushes.get() + 1);
        trace!(waited_us, flushes = self.flushes.get(), "flushing batched merge");
        (self.deliver)(merge);
        true
    }
}

/// Coalescing merge sink with a single deferred flush.
#[derive(Clone)]
pub struct BatchedSink {
    state: Rc<BatchState>,
}

impl BatchedSink {
    /// Deliver coalesced merges to `deliver`, flushing via `deferred`.
    pub fn new(deferred: Rc<dyn Deferred>, deliver: impl Fn(Merge) + 'static) -> Self {
        Self {
            state: Rc::new(BatchState {
                deferred,
                deliver: Box::new(deliver),
                pending: RefCell::new(None),
                opened_at: Cell::new(None),
                scheduled: Cell::new(None),
                flushes: Cell::new(0),
            }),
        }
    }

    /// Deliver the pending merge now. Returns whether there was one.
    pub fn flush(&self) -> bool {
        self.state.flush()
    }

    #[must_use]
    pub fn has_pending(&self) -> bool {
        self.state.pending.borrow().is_some()
    }

    /// Microseconds since the first write of the open batch.
    #[must_use]
    pub fn pending_us(&self) -> Option<u64> {
        self.state
            .opened_at
            .get()
            .map(|opened| opened.elapsed().as_micros() as u64)
    }

    /// Number of flushes that delivered a merge.
    #[must_use]
    pub fn flush_count(&self) -> u64 {
        self.state.flushes.get()
    }

    fn arm(&self) {
        if let Some(previous) = self.state.scheduled.take() {
            self.state.deferred.cancel(previous);
        }
        let weak: Weak<BatchState> = Rc::downgrade(&self.state);
        let task = self.state.deferred.schedule(Box::new(move || {
            if let Some(state) = weak.upgrade() {
                state.scheduled.set(None);
                state.flush();
            }
        }));
        self.state.scheduled.set(Some(task));
    }
}

impl MergeSink for BatchedSink {
    fn deliver(&self, merge: Merge) {
        {
            let mut pending = self.state.pending.borrow_mut();
            match pending.as_mut() {
                Some(existing) => existing.absorb(merge),
                None => {
                    *pending = Some(merge);
                    self.state.opened_at.set(Some(Instant::now()));
                }
            }
        }
        self.arm();
    }
}

impl fmt::Debug for BatchedSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchedSink")
            .field("pending", &self.state.pending.borrow())
            .field("scheduled", &self.state.scheduled.get())
            .field("flushes", &self.state.flushes.get())
            .finish_non_exhaustive()
    }
}
