#![forbid(unsafe_code)]

//! Dependency-tracked consumer scheduling.
//!
//! An [`UpdateScheduler`] holds an ordered list of consumers. Each consumer
//! reads the snapshot through a [`View`], and the scheduler keeps the
//! [`AccessShape`] recorded during its last run. When a merge arrives, the
//! shape is walked against the merge and only consumers whose reads
//! intersect it run again.
//!
//! # Design
//!
//! Dependencies are discovered from each consumer's own last run rather than
//! kept in a persistent graph: a rerun replaces the shape wholesale, and
//! nothing is maintained when no consumer needs to run.
//!
//! # Invariants
//!
//! 1. Consumers run in registration order within one dispatch.
//! 2. The first dispatch, a dispatch with a new snapshot identity, and a
//!    dispatch without a merge run every consumer.
//! 3. A consumer whose last run read a path changed by the merge (or whose
//!    listed keys gained or lost an entry) reruns.
//! 4. A consumer without a trustworthy shape (never run, or failed) reruns.
//!
//! # Failure Modes
//!
//! - A consumer error stops the dispatch and is returned as
//!   [`EngineError::Consumer`]. The failing consumer's shape is discarded.
//!   Consumers after it that the merge would have rerun are also marked
//!   stale, so the next dispatch catches them up.
//! - A panicking consumer leaves its shape discarded as well, because the
//!   shape is cleared before the consumer is called.
//! - A failed full render forgets the snapshot identity, so the next
//!   dispatch is a full render again.

use std::fmt;

use patchwork_core::{
    AccessShape, Change, ConsumerError, EngineError, Merge, Recorder, Result, Snapshot,
    SnapshotId, Value, View,
};
use tracing::{debug, debug_span, trace, warn};
use web_time::Instant;

/// A boxed consumer routine.
pub type BoxedConsumer = Box<dyn FnMut(View<'_>) -> std::result::Result<(), ConsumerError>>;

/// Input to [`UpdateScheduler::combine`].
pub enum Routine {
    Consumer(BoxedConsumer),
    /// A previously built scheduler; its consumers are spliced in place.
    Combined(UpdateScheduler),
}

impl Routine {
    pub fn consumer<F>(f: F) -> Self
    where
        F: FnMut(View<'_>) -> std::result::Result<(), ConsumerError> + 'static,
    {
        Self::Consumer(Box::new(f))
    }
}

impl From<UpdateScheduler> for Routine {
    fn from(scheduler: UpdateScheduler) -> Self {
        Self::Combined(scheduler)
    }
}

impl fmt::Debug for Routine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Consumer(_) => f.write_str("Routine::Consumer(..)"),
            Self::Combined(inner) => f.debug_tuple("Routine::Combined").field(inner).finish(),
        }
    }
}

/// How a dispatch treated its consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchKind {
    /// Every consumer ran.
    Full,
    /// Some consumers ran.
    Incremental,
    /// Nothing ran.
    Skipped,
}

/// Outcome of a successful dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchReport {
    pub kind: DispatchKind,
    /// Indices of the consumers that ran, in order.
    pub rerun: Vec<usize>,
}

impl DispatchReport {
    #[must_use]
    pub fn ran(&self, index: usize) -> bool {
        self.rerun.contains(&index)
    }
}

struct Entry {
    consumer: BoxedConsumer,
    /// `None` until the consumer has completed a run, or after it failed.
    shape: Option<AccessShape>,
}

/// Ordered consumers plus the access shape of each one's last run.
#[derive(Default)]
pub struct UpdateScheduler {
    entries: Vec<Entry>,
    last_id: Option<SnapshotId>,
}

impl fmt::Debug for UpdateScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpdateScheduler")
            .field("consumers", &self.entries.len())
            .field("stale", &self.entries.iter().filter(|e| e.shape.is_none()).count())
            .field("last_id", &self.last_id)
            .finish()
    }
}

impl UpdateScheduler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a scheduler from routines, flattening nested schedulers.
    ///
    /// A single already-combined scheduler is returned unchanged.
    pub fn combine(routines: impl IntoIterator<Item = Routine>) -> Self {
        let mut routines: Vec<Routine> = routines.into_iter().collect();
        if routines.len() == 1 && matches!(routines[0], Routine::Combined(_)) {
            if let Some(Routine::Combined(scheduler)) = routines.pop() {
                return scheduler;
            }
        }
        let mut combined = Self::new();
        for routine in routines {
            match routine {
                Routine::Consumer(consumer) => combined.push(consumer),
                Routine::Combined(inner) => {
                    combined.entries.extend(inner.entries.into_iter().map(|entry| Entry {
                        consumer: entry.consumer,
                        shape: None,
                    }));
                }
            }
        }
        combined
    }

    /// Append a consumer; returns its index.
    pub fn register<F>(&mut self, consumer: F) -> usize
    where
        F: FnMut(View<'_>) -> std::result::Result<(), ConsumerError> + 'static,
    {
        self.push(Box::new(consumer));
        self.entries.len() - 1
    }

    fn push(&mut self, consumer: BoxedConsumer) {
        self.entries.push(Entry {
            consumer,
            shape: None,
        });
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Shape recorded by consumer `index` on its last successful run.
    #[must_use]
    pub fn shape(&self, index: usize) -> Option<&AccessShape> {
        self.entries.get(index).and_then(|entry| entry.shape.as_ref())
    }

    /// Forget the last snapshot identity; the next dispatch is a full render.
    pub fn invalidate(&mut self) {
        self.last_id = None;
    }

    /// Run the consumers affected by `merge` against `snapshot`.
    pub fn dispatch(&mut self, snapshot: &Snapshot, merge: Option<&Merge>) -> Result<DispatchReport> {
        if self.entries.is_empty() {
            return Err(EngineError::NoConsumers);
        }
        let id = snapshot.id();
        let full = merge.is_none() || self.last_id != Some(id);
        let change = if full {
            Change::Unknown
        } else {
            Change::from_merge(merge)
        };
        match self.run(snapshot.root(), change) {
            Ok(report) => {
                self.last_id = Some(id);
                Ok(report)
            }
            Err(err) => {
                if full {
                    self.last_id = None;
                }
                Err(err)
            }
        }
    }

    /// Run against a bare value, for a pass nested inside another consumer.
    ///
    /// `Change::Unknown` runs everything; `Change::Unchanged` only catches up
    /// stale consumers.
    pub fn dispatch_value(&mut self, value: &Value, change: Change<'_>) -> Result<DispatchReport> {
        if self.entries.is_empty() {
            return Err(EngineError::NoConsumers);
        }
        self.run(value, change)
    }

    fn run(&mut self, root: &Value, change: Change<'_>) -> Result<DispatchReport> {
        let full = matches!(change, Change::Unknown);
        let span = debug_span!(
            "scheduler.dispatch",
            consumers = self.entries.len(),
            full,
            dispatch_duration_us = tracing::field::Empty
        );
        let _guard = span.enter();
        let started = Instant::now();
        let mut rerun = Vec::new();

        for index in 0..self.entries.len() {
            let entry = &mut self.entries[index];
            if !full && !entry_is_affected(entry, change) {
                continue;
            }
            entry.shape = None;
            let recorder = Recorder::new();
            let result = (entry.consumer)(recorder.view(root, change));
            match result {
                Ok(()) => {
                    let shape = recorder.finish();
                    trace!(index, nodes = shape.node_count(), "consumer ran");
                    entry.shape = Some(shape);
                    rerun.push(index);
                }
                Err(source) => {
                    let mut stale = 0usize;
                    for later in &mut self.entries[index + 1..] {
                        if full || entry_is_affected(later, change) {
                            later.shape = None;
                            stale += 1;
                        }
                    }
                    warn!(index, stale, error = %source, "consumer failed during dispatch");
                    return Err(EngineError::Consumer { index, source });
                }
            }
        }

        let kind = if full {
            DispatchKind::Full
        } else if rerun.is_empty() {
            DispatchKind::Skipped
        } else {
            DispatchKind::Incremental
        };
        span.record("dispatch_duration_us", started.elapsed().as_micros() as u64);
        debug!(?kind, rerun = rerun.len(), consumers = self.entries.len(), "dispatch");
        Ok(DispatchReport { kind, rerun })
    }
}

fn entry_is_affected(entry: &Entry, change: Change<'_>) -> bool {
    let Some(shape) = &entry.shape else {
        return true;
    };
    match change {
        Change::Unchanged => false,
        Change::Unknown => true,
        Change::Merged(merge) => needs_rerun(shape, merge),
    }
}

// ---------------------------------------------------------------------------
// Shape / merge intersection
// ---------------------------------------------------------------------------

/// Whether a consumer that recorded `shape` must rerun for `merge`.
///
/// Walks shape and merge in lock-step with an explicit stack. A node forces
/// a rerun when it was read as a whole, when the merge replaces or deletes
/// it, or when it was listed and the merge adds or removes one of its keys.
#[must_use]
pub fn needs_rerun(shape: &AccessShape, merge: &Merge) -> bool {
    let mut stack = vec![(AccessShape::ROOT, merge)];
    while let Some((node, merge)) = stack.pop() {
        if shape.is_accessed(node) {
            return true;
        }
        let Merge::Patch(patch) = merge else {
            return true;
        };
        let listing = shape.listing(node);
        for (key, child) in patch {
            if listing.is_some_and(|listing| listing.adds_or_removes(key, child)) {
                return true;
            }
            if let Some(next) = shape.child(node, key) {
                stack.push((next, child));
            }
        }
    }
    false
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;

    fn data() -> Snapshot {
        Snapshot::new(Value::from_pairs([
            ("foo", Value::from("bar")),
            ("baz", Value::from_items(["bing", "zap"])),
        ]))
    }

    fn counter() -> (Rc<Cell<u32>>, Rc<Cell<u32>>) {
        let c = Rc::new(Cell::new(0));
        (Rc::clone(&c), c)
    }

    fn shape_of(f: impl FnOnce(View<'_>)) -> AccessShape {
        let value = data().into_root();
        let recorder = Recorder::new();
        f(recorder.view(&value, Change::Unknown));
        recorder.finish()
    }

    #[test]
    fn empty_scheduler_is_misuse() {
        let mut scheduler = UpdateScheduler::new();
        let err = scheduler.dispatch(&data(), None).expect_err("no consumers");
        assert!(matches!(err, EngineError::NoConsumers));
        assert!(err.is_misuse());
    }

    #[test]
    fn first_dispatch_runs_everything() {
        let snapshot = data();
        let (runs, seen) = counter();
        let mut scheduler = UpdateScheduler::new();
        scheduler.register(move |view| {
            let _ = view.get("foo").as_str();
            seen.set(seen.get() + 1);
            Ok(())
        });
        let merge = Merge::empty();
        let report = scheduler.dispatch(&snapshot, Some(&merge)).expect("dispatch");
        assert_eq!(report.kind, DispatchKind::Full);
        assert_eq!(runs.get(), 1);
        assert!(scheduler.shape(0).is_some_and(|s| s.is_accessed_at(&["foo"])));
    }

    #[test]
    fn reads_and_listings_select_consumers() {
        let snapshot = data();
        let mut scheduler = UpdateScheduler::new();
        scheduler.register(|view| {
            assert!(view.get("foo").as_str().is_some());
            Ok(())
        });
        scheduler.register(|view| {
            assert_eq!(view.keys().len(), 2);
            Ok(())
        });
        scheduler.dispatch(&snapshot, None).expect("full");

        let changed_foo = Merge::patch([("foo", Merge::replace("BAZ"))]);
        let report = scheduler.dispatch(&snapshot, Some(&changed_foo)).expect("foo");
        assert_eq!(report.rerun, vec![0]);

        let added = Merge::patch([("extra", Merge::replace("x"))]);
        let report = scheduler.dispatch(&snapshot, Some(&added)).expect("extra");
        assert_eq!(report.rerun, vec![1]);

        let report = scheduler
            .dispatch(&snapshot, Some(&Merge::empty()))
            .expect("empty");
        assert_eq!(report.kind, DispatchKind::Skipped);
        assert!(report.rerun.is_empty());
    }

    #[test]
    fn new_identity_forces_full_render() {
        let (runs, seen) = counter();
        let mut scheduler = UpdateScheduler::new();
        scheduler.register(move |view| {
            let _ = view.get("foo").as_str();
            seen.set(seen.get() + 1);
            Ok(())
        });
        scheduler.dispatch(&data(), None).expect("first");
        let report = scheduler
            .dispatch(&data(), Some(&Merge::empty()))
            .expect("second");
        assert_eq!(report.kind, DispatchKind::Full);
        assert_eq!(runs.get(), 2);
    }

    #[test]
    fn needs_rerun_rules() {
        let leaf = shape_of(|view| {
            let _ = view.get("baz").index(0).as_str();
        });
        assert!(needs_rerun(
            &leaf,
            &Merge::patch([("baz", Merge::patch([("0", Merge::replace("x"))]))])
        ));
        assert!(!needs_rerun(
            &leaf,
            &Merge::patch([("baz", Merge::patch([("1", Merge::replace("x"))]))])
        ));
        // Replacing an ancestor wholesale touches everything below it.
        assert!(needs_rerun(
            &leaf,
            &Merge::patch([("baz", Merge::replace(Value::from_items(["q"])))])
        ));
        assert!(needs_rerun(&leaf, &Merge::patch([("baz", Merge::Delete)])));
        assert!(!needs_rerun(&leaf, &Merge::patch([("foo", Merge::Delete)])));

        let pierced = shape_of(|view| {
            let _ = view.get("baz").pierce();
        });
        assert!(needs_rerun(
            &pierced,
            &Merge::patch([("baz", Merge::patch([("7", Merge::replace(1))]))])
        ));

        let silent = shape_of(|view| {
            let _ = view.get("baz").pierce_silent();
        });
        assert!(!needs_rerun(
            &silent,
            &Merge::patch([("baz", Merge::patch([("1", Merge::replace(1))]))])
        ));

        let listed = shape_of(|view| {
            let _ = view.get("baz").len();
        });
        assert!(needs_rerun(
            &listed,
            &Merge::patch([("baz", Merge::patch([("2", Merge::replace("new"))]))])
        ));
        assert!(!needs_rerun(
            &listed,
            &Merge::patch([("baz", Merge::patch([("1", Merge::replace("new"))]))])
        ));
    }

    #[test]
    fn root_replacement_reruns_everyone() {
        let shape = shape_of(|view| {
            let _ = view.get("foo").as_str();
        });
        assert!(needs_rerun(&shape, &Merge::replace(Value::map())));
        assert!(!needs_rerun(&shape, &Merge::empty()));
    }

    #[test]
    fn combine_flattens_and_passes_single_through() {
        let mut inner = UpdateScheduler::new();
        inner.register(|_| Ok(()));
        inner.register(|_| Ok(()));
        let combined = UpdateScheduler::combine([
            Routine::consumer(|_| Ok(())),
            Routine::from(inner),
        ]);
        assert_eq!(combined.len(), 3);

        let single = UpdateScheduler::combine([Routine::from(combined)]);
        assert_eq!(single.len(), 3);
    }

    #[test]
    fn failure_marks_consumer_and_followers_stale() {
        let snapshot = data();
        let fail = Rc::new(Cell::new(false));
        let log = Rc::new(RefCell::new(Vec::new()));

        let mut scheduler = UpdateScheduler::new();
        {
            let log = Rc::clone(&log);
            scheduler.register(move |view| {
                let _ = view.get("foo").as_str();
                log.borrow_mut().push("a");
                Ok(())
            });
        }
        {
            let log = Rc::clone(&log);
            let fail = Rc::clone(&fail);
            scheduler.register(move |view| {
                let _ = view.get("foo").as_str();
                log.borrow_mut().push("b");
                if fail.get() {
                    return Err(EngineError::mismatch("$.foo").into());
                }
                Ok(())
            });
        }
        {
            let log = Rc::clone(&log);
            scheduler.register(move |view| {
                let _ = view.get("foo").as_str();
                log.borrow_mut().push("c");
                Ok(())
            });
        }
        {
            let log = Rc::clone(&log);
            scheduler.register(move |view| {
                let _ = view.get("baz").index(0).as_str();
                log.borrow_mut().push("d");
                Ok(())
            });
        }
        scheduler.dispatch(&snapshot, None).expect("full");
        log.borrow_mut().clear();

        fail.set(true);
        let merge = Merge::patch([("foo", Merge::replace("x"))]);
        let err = scheduler
            .dispatch(&snapshot, Some(&merge))
            .expect_err("consumer fails");
        assert_eq!(err.consumer_index(), Some(1));
        assert_eq!(*log.borrow(), vec!["a", "b"]);
        assert!(scheduler.shape(1).is_none());
        assert!(scheduler.shape(2).is_none());
        assert!(scheduler.shape(3).is_some());

        fail.set(false);
        log.borrow_mut().clear();
        let report = scheduler
            .dispatch(&snapshot, Some(&Merge::empty()))
            .expect("catch up");
        assert_eq!(report.rerun, vec![1, 2]);
        assert_eq!(*log.borrow(), vec!["b", "c"]);
    }

    #[test]
    fn failed_full_render_stays_full() {
        let snapshot = data();
        let attempts = Rc::new(Cell::new(0u32));
        let mut scheduler = UpdateScheduler::new();
        {
            let attempts = Rc::clone(&attempts);
            scheduler.register(move |view| {
                attempts.set(attempts.get() + 1);
                if attempts.get() == 1 {
                    view.try_get("missing")?;
                }
                Ok(())
            });
        }
        scheduler.register(|view| {
            let _ = view.get("foo").as_str();
            Ok(())
        });

        let err = scheduler.dispatch(&snapshot, None).expect_err("missing key");
        assert!(matches!(err, EngineError::Consumer { index: 0, .. }));
        assert!(scheduler.shape(1).is_none());

        let report = scheduler
            .dispatch(&snapshot, Some(&Merge::empty()))
            .expect("retry");
        assert_eq!(report.kind, DispatchKind::Full);
        assert_eq!(report.rerun, vec![0, 1]);
    }

    #[test]
    fn nested_pass_only_reruns_inner_readers() {
        let snapshot = Snapshot::new(Value::from_pairs([(
            "items",
            Value::from_pairs([("a", 1), ("b", 2)]),
        )]));
        let inner_runs = Rc::new(RefCell::new(Vec::new()));

        let mut inner = UpdateScheduler::new();
        for key in ["a", "b"] {
            let inner_runs = Rc::clone(&inner_runs);
            inner.register(move |view| {
                let _ = view.get(key).as_f64();
                inner_runs.borrow_mut().push(key);
                Ok(())
            });
        }

        let mut outer = UpdateScheduler::new();
        outer.register(move |view| {
            let items = view.get("items");
            let Some(raw) = items.pierce() else {
                return Ok(());
            };
            inner.dispatch_value(raw, items.change())?;
            Ok(())
        });

        outer.dispatch(&snapshot, None).expect("full");
        assert_eq!(*inner_runs.borrow(), vec!["a", "b"]);
        inner_runs.borrow_mut().clear();

        let merge = Merge::patch([("items", Merge::patch([("b", Merge::replace(5))]))]);
        let report = outer.dispatch(&snapshot, Some(&merge)).expect("incremental");
        assert_eq!(report.rerun, vec![0]);
        assert_eq!(*inner_runs.borrow(), vec!["b"]);
    }
}
