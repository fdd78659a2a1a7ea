#![forbid(unsafe_code)]

//! Store configuration.
//!
//! | Variable             | Effect                                   |
//! |----------------------|------------------------------------------|
//! | `PATCHWORK_DELIVERY` | `sync` or `batched` delivery of writes   |
//! | `PATCHWORK_LABEL`    | label attached to the store's log events |
//!
//! Environment values override defaults; explicit `with_*` calls made after
//! [`StoreConfig::from_env`] override both. Unparseable values are ignored
//! with a warning.

use std::env;
use std::fmt;
use std::str::FromStr;

use thiserror::Error;
use tracing::warn;

pub const DELIVERY_ENV: &str = "PATCHWORK_DELIVERY";
pub const LABEL_ENV: &str = "PATCHWORK_LABEL";

/// How tracked writes reach listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeliveryMode {
    /// Every write is delivered as soon as the update that made it returns.
    #[default]
    Synchronous,
    /// Writes are coalesced and delivered once from a deferred flush.
    Batched,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown delivery mode `{0}` (expected `sync` or `batched`)")]
pub struct ParseDeliveryModeError(pub String);

impl FromStr for DeliveryMode {
    type Err = ParseDeliveryModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sync" | "synchronous" => Ok(Self::Synchronous),
            "batch" | "batched" | "async" => Ok(Self::Batched),
            _ => Err(ParseDeliveryModeError(s.to_string())),
        }
    }
}

impl fmt::Display for DeliveryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Synchronous => "sync",
            Self::Batched => "batched",
        })
    }
}

/// Configuration for a [`Store`](crate::store::Store).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreConfig {
    pub delivery: DeliveryMode,
    /// Label attached to log events, for telling stores apart.
    pub label: Option<String>,
}

impl StoreConfig {
    /// Defaults with environment overrides applied.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Like [`from_env`](Self::from_env), reading variables through `lookup`.
    #[must_use]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(val) = lookup(DELIVERY_ENV) {
            match val.parse() {
                Ok(mode) => config.delivery = mode,
                Err(err) => warn!(%err, "ignoring {DELIVERY_ENV}"),
            }
        }
        if let Some(val) = lookup(LABEL_ENV)
            && !val.trim().is_empty()
        {
            config.label = Some(val);
        }
        config
    }

    #[must_use]
    pub fn with_delivery(mut self, delivery: DeliveryMode) -> Self {
        self.delivery = delivery;
        self
    }

    #[must_use]
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    #[must_use]
    pub fn batched() -> Self {
        Self::default().with_delivery(DeliveryMode::Batched)
    }

    pub(crate) fn label_or_default(&self) -> &str {
        self.label.as_deref().unwrap_or("store")
    }
}
