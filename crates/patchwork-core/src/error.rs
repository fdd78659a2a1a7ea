#![forbid(unsafe_code)]

//! Error type shared by every patchwork crate.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngineError>;

/// Error returned by a consumer routine.
///
/// Consumers are free to fail with any error type; `?` on an
/// [`EngineError`] inside a consumer converts automatically.
pub type ConsumerError = Box<dyn std::error::Error + 'static>;

#[derive(Debug, Error)]
pub enum EngineError {
    /// A consumer dereferenced a path that does not exist in the snapshot.
    #[error("structural mismatch: no value at `{path}`")]
    StructuralMismatch { path: String },

    #[error("dispatch called with no registered consumers")]
    NoConsumers,

    #[error("expected a mapping at `{path}`")]
    NotAMapping { path: String },

    #[error("expected a sequence at `{path}`")]
    NotASequence { path: String },

    #[error("index {index} out of bounds at `{path}` (len={len})")]
    IndexOutOfBounds {
        path: String,
        index: usize,
        len: usize,
    },

    #[error("snapshot is borrowed by a running dispatch")]
    DispatchInProgress,

    #[error("store has been dropped")]
    StoreDropped,

    #[error("consumer #{index} failed: {source}")]
    Consumer {
        index: usize,
        #[source]
        source: ConsumerError,
    },
}

impl EngineError {
    #[must_use]
    pub fn mismatch(path: impl Into<String>) -> Self {
        Self::StructuralMismatch { path: path.into() }
    }

    /// Whether this error is a misuse of the engine rather than a data or
    /// consumer failure.
    #[must_use]
    pub fn is_misuse(&self) -> bool {
        matches!(
            self,
            Self::NoConsumers
                | Self::NotAMapping { .. }
                | Self::NotASequence { .. }
                | Self::IndexOutOfBounds { .. }
                | Self::DispatchInProgress
                | Self::StoreDropped
        )
    }

    /// Index of the consumer that failed, if this is a consumer failure.
    #[must_use]
    pub fn consumer_index(&self) -> Option<usize> {
        match self {
            Self::Consumer { index, .. } => Some(*index),
            _ => None,
        }
    }
}

/// Render a key path as a dotted string (`$` for the root).
pub(crate) fn display_path<S: AsRef<str>>(path: &[S]) -> String {
    if path.is_empty() {
        return "$".to_string();
    }
    let mut out = String::from("$");
    for key in path {
        out.push('.');
        out.push_str(key.as_ref());
    }
    out
}
