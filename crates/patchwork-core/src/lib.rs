#![forbid(unsafe_code)]

//! Core: value trees, structural merges, access recording, and tracked writes.
//!
//! - [`value`]: the [`Value`] tree and identity-carrying [`Snapshot`].
//! - [`merge`]: computing, applying, and coalescing [`Merge`]s.
//! - [`access`]: recording which paths a consumer reads into an
//!   [`AccessShape`].
//! - [`tracked`]: a write handle that turns every mutation into a minimal
//!   merge and hands it to a [`MergeSink`].

pub mod access;
pub mod error;
pub(crate) mod logging;
pub mod merge;
pub mod tracked;
pub mod value;

pub use access::{AccessShape, Listing, Recorder, ShapeNodeId, View};
pub use error::{ConsumerError, EngineError, Result};
pub use merge::{Change, Merge, Patch};
pub use tracked::{MergeBuffer, MergeSink, Tracked};
pub use value::{Map, Opaque, Snapshot, SnapshotId, Value};
