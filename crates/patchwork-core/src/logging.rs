//! Logging shims: forward to `tracing` when the `tracing` feature is enabled,
//! and expand to nothing otherwise.
//!
//! Only `trace` is provided. Core writes are the one hot path that logs;
//! everything above trace level is logged by the runtime.

#[cfg(feature = "tracing")]
pub(crate) use tracing::trace;

#[cfg(not(feature = "tracing"))]
macro_rules! trace {
    ($($arg:tt)*) => {};
}

#[cfg(not(feature = "tracing"))]
pub(crate) use trace;
