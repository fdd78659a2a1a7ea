#![forbid(unsafe_code)]

//! Patchwork public facade crate.
//!
//! Re-exports the core value and merge types alongside the scheduler and
//! store, so most users only need `use patchwork::prelude::*`.

pub use patchwork_core as core;
#[cfg(feature = "runtime")]
pub use patchwork_runtime as runtime;

pub mod prelude {
    pub use patchwork_core::merge::{apply, make, nest};
    pub use patchwork_core::{
        AccessShape, Change, ConsumerError, EngineError, Merge, MergeSink, Recorder,
        Snapshot, Tracked, Value, View,
    };
    #[cfg(feature = "runtime")]
    pub use patchwork_runtime::{
        DeliveryMode, DispatchKind, DispatchReport, Routine, Store, StoreConfig, StoreHandle,
        UpdateScheduler,
    };
}
