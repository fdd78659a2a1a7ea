#![forbid(unsafe_code)]

//! Runtime: deciding which consumers rerun, and the store that feeds them.
//!
//! - [`scheduler`]: [`UpdateScheduler`] runs consumers, records what they
//!   read, and on later dispatches reruns only those whose reads intersect
//!   the incoming merge.
//! - [`deferred`]: the "run soon, at most once per turn" primitive used for
//!   batched delivery, with a deterministic [`TurnQueue`].
//! - [`batch`]: [`BatchedSink`] coalesces merges until the deferred flush.
//! - [`store`]: [`Store`] owns the snapshot, tracks writes, and fans merges
//!   out to registered listeners.
//! - [`config`]: [`StoreConfig`] and environment overrides.

pub mod batch;
pub mod config;
pub mod deferred;
pub mod scheduler;
pub mod store;

pub use batch::BatchedSink;
pub use config::{DeliveryMode, ParseDeliveryModeError, StoreConfig};
pub use deferred::{Deferred, FirstOf, TaskId, TurnQueue};
pub use scheduler::{
    BoxedConsumer, DispatchKind, DispatchReport, Routine, UpdateScheduler, needs_rerun,
};
pub use store::{Store, StoreHandle};
