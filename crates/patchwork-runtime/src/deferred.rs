#![forbid(unsafe_code)]

//! "Run soon, at most once per turn" task scheduling.
//!
//! Batched delivery needs a host primitive that runs a callback a little
//! later, after the current burst of writes. [`Deferred`] abstracts it.
//!
//! - [`TurnQueue`] is a deterministic queue driven by the embedder (or a
//!   test): each [`TurnQueue::run_turn`] runs what was due at the start of
//!   the turn. Tasks scheduled while a turn runs wait for the next one.
//! - [`FirstOf`] schedules on two primitives and runs the task on whichever
//!   fires first, like an animation frame with a timer fallback.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::rc::{Rc, Weak};

use ahash::AHashMap;

/// Handle for cancelling a scheduled task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(u64);

impl TaskId {
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

pub type Task = Box<dyn FnOnce()>;

/// A deferred-task primitive.
pub trait Deferred {
    /// Run `task` later. Never runs it before returning.
    fn schedule(&self, task: Task) -> TaskId;

    /// Drop a scheduled task. Returns whether it was still pending.
    fn cancel(&self, id: TaskId) -> bool;
}

impl<T: Deferred + ?Sized> Deferred for Rc<T> {
    fn schedule(&self, task: Task) -> TaskId {
        (**self).schedule(task)
    }

    fn cancel(&self, id: TaskId) -> bool {
        (**self).cancel(id)
    }
}

// ---------------------------------------------------------------------------
// TurnQueue
// ---------------------------------------------------------------------------

/// Deterministic turn-based task queue.
#[derive(Default)]
pub struct TurnQueue {
    next_id: Cell<u64>,
    queue: RefCell<VecDeque<(TaskId, Task)>>,
}

impl TurnQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tasks waiting.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.queue.borrow().len()
    }

    /// Run the tasks that were queued when the turn began; returns how many
    /// ran.
    pub fn run_turn(&self) -> usize {
        let horizon = self.next_id.get();
        let mut ran = 0;
        loop {
            let next = {
                let mut queue = self.queue.borrow_mut();
                match queue.front() {
                    Some((id, _)) if id.0 < horizon => queue.pop_front(),
                    _ => None,
                }
            };
            let Some((_, task)) = next else {
                break;
            };
            task();
            ran += 1;
        }
        ran
    }

    /// Run turns until nothing is pending or `max_turns` is reached; returns
    /// the number of turns run.
    pub fn run_until_idle(&self, max_turns: usize) -> usize {
        let mut turns = 0;
        while turns < max_turns && self.pending() > 0 {
            self.run_turn();
            turns += 1;
        }
        turns
    }
}

impl Deferred for TurnQueue {
    fn schedule(&self, task: Task) -> TaskId {
        let id = TaskId(self.next_id.get());
        self.next_id.set(id.0 + 1);
        self.queue.borrow_mut().push_back((id, task));
        id
    }

    fn cancel(&self, id: TaskId) -> bool {
        let mut queue = self.queue.borrow_mut();
        match queue.iter().position(|(queued, _)| *queued == id) {
            Some(index) => {
                queue.remove(index);
                true
            }
            None => false,
        }
    }
}

impl fmt::Debug for TurnQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TurnQueue")
            .field("pending", &self.pending())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// FirstOf
// ---------------------------------------------------------------------------

type LiveTasks = Rc<RefCell<AHashMap<TaskId, (TaskId, TaskId)>>>;

/// Runs each task on whichever of two primitives fires first; the other
/// registration is cancelled.
pub struct FirstOf<A, B> {
    primary: Rc<A>,
    fallback: Rc<B>,
    next_id: Cell<u64>,
    live: LiveTasks,
}

impl<A: Deferred + 'static, B: Deferred + 'static> FirstOf<A, B> {
    pub fn new(primary: A, fallback: B) -> Self {
        Self {
            primary: Rc::new(primary),
            fallback: Rc::new(fallback),
            next_id: Cell::new(0),
            live: Rc::new(RefCell::new(AHashMap::new())),
        }
    }

    pub fn primary(&self) -> &A {
        &self.primary
    }

    pub fn fallback(&self) -> &B {
        &self.fallback
    }
}

/// The half of a [`FirstOf`] registration that lives on one primitive.
fn arm(
    id: TaskId,
    slot: Rc<RefCell<Option<Task>>>,
    live: LiveTasks,
    other: Weak<dyn Deferred>,
    other_id: fn((TaskId, TaskId)) -> TaskId,
) -> Task {
    Box::new(move || {
        let Some(task) = slot.borrow_mut().take() else {
            return;
        };
        let ids = live.borrow_mut().remove(&id);
        if let (Some(ids), Some(other)) = (ids, other.upgrade()) {
            other.cancel(other_id(ids));
        }
        task();
    })
}

impl<A: Deferred + 'static, B: Deferred + 'static> Deferred for FirstOf<A, B> {
    fn schedule(&self, task: Task) -> TaskId {
        let id = TaskId(self.next_id.get());
        self.next_id.set(id.0 + 1);

        let slot = Rc::new(RefCell::new(Some(task)));
        let primary_weak = Rc::downgrade(&self.primary);
        let fallback_weak = Rc::downgrade(&self.fallback);
        let a = self.primary.schedule(arm(
            id,
            Rc::clone(&slot),
            Rc::clone(&self.live),
            fallback_weak,
            |(_, b)| b,
        ));
        let b = self.fallback.schedule(arm(
            id,
            slot,
            Rc::clone(&self.live),
            primary_weak,
            |(a, _)| a,
        ));
        self.live.borrow_mut().insert(id, (a, b));
        id
    }

    fn cancel(&self, id: TaskId) -> bool {
        let Some((a, b)) = self.live.borrow_mut().remove(&id) else {
            return false;
        };
        let cancelled_a = self.primary.cancel(a);
        let cancelled_b = self.fallback.cancel(b);
        cancelled_a || cancelled_b
    }
}

impl<A, B> fmt::Debug for FirstOf<A, B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FirstOf")
            .field("live", &self.live.borrow().len())
            .finish_non_exhaustive()
    }
}
