#![forbid(unsafe_code)]

//! The value tree that snapshots, merges, and views are built from.
//!
//! # Design
//!
//! Mapping and sequence nodes are reference-counted. Two handles to the same
//! allocation are "identical" ([`Value::same`]), which lets
//! [`make`](crate::merge::make) prune untouched subtrees without comparing
//! them. Mutation goes through [`Rc::make_mut`], so a subtree that is still
//! shared elsewhere is copied before it is written; holders of an older
//! handle never observe the change.
//!
//! A [`Snapshot`] pairs a root value with a [`SnapshotId`]. Tracked writes keep
//! the id; replacing the data wholesale mints a new one.

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Keyed children of a mapping node.
pub type Map = BTreeMap<String, Value>;

/// A node in a snapshot tree.
///
/// Equality is structural, except that every NaN equals every other NaN.
#[derive(Clone, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Number(f64),
    String(Rc<str>),
    Seq(Rc<Vec<Value>>),
    Map(Rc<Map>),
    /// A leaf that is never traversed into (callbacks, handles, ...).
    Opaque(Opaque),
}

impl Value {
    /// An empty mapping.
    #[must_use]
    pub fn map() -> Self {
        Self::Map(Rc::new(Map::new()))
    }

    /// An empty sequence.
    #[must_use]
    pub fn seq() -> Self {
        Self::Seq(Rc::new(Vec::new()))
    }

    /// Build a mapping from key/value pairs.
    #[must_use]
    pub fn from_pairs<K, V, I>(pairs: I) -> Self
    where
        K: Into<String>,
        V: Into<Value>,
        I: IntoIterator<Item = (K, V)>,
    {
        Self::Map(Rc::new(
            pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        ))
    }

    /// Build a sequence from items.
    #[must_use]
    pub fn from_items<V: Into<Value>, I: IntoIterator<Item = V>>(items: I) -> Self {
        Self::Seq(Rc::new(items.into_iter().map(Into::into).collect()))
    }

    /// Wrap an arbitrary value as an opaque leaf.
    #[must_use]
    pub fn opaque<T: Any>(value: T) -> Self {
        Self::Opaque(Opaque::new(value))
    }

    /// Whether this node can be descended into (mapping or sequence).
    #[must_use]
    pub fn is_container(&self) -> bool {
        matches!(self, Self::Map(_) | Self::Seq(_))
    }

    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    #[must_use]
    pub fn as_map(&self) -> Option<&Map> {
        match self {
            Self::Map(map) => Some(map),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_seq(&self) -> Option<&[Value]> {
        match self {
            Self::Seq(items) => Some(items),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_opaque(&self) -> Option<&Opaque> {
        match self {
            Self::Opaque(o) => Some(o),
            _ => None,
        }
    }

    /// Child by key. Sequences accept decimal indices.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Self::Map(map) => map.get(key),
            Self::Seq(items) => key.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        }
    }

    /// Number of children (0 for leaves).
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Map(map) => map.len(),
            Self::Seq(items) => items.len(),
            _ => 0,
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reference identity.
    ///
    /// Containers and opaque leaves are identical only when they share an
    /// allocation; scalars are identical when they are equal.
    #[must_use]
    pub fn same(&self, other: &Value) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Number(a), Self::Number(b)) => same_number(*a, *b),
            (Self::String(a), Self::String(b)) => a == b,
            (Self::Seq(a), Self::Seq(b)) => Rc::ptr_eq(a, b),
            (Self::Map(a), Self::Map(b)) => Rc::ptr_eq(a, b),
            (Self::Opaque(a), Self::Opaque(b)) => a == b,
            _ => false,
        }
    }

    /// Short name of the node kind, for diagnostics.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Number(_) => "number",
            Self::String(_) => "string",
            Self::Seq(_) => "sequence",
            Self::Map(_) => "mapping",
            Self::Opaque(_) => "opaque",
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("null"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => write!(f, "{s:?}"),
            Self::Seq(items) => f.debug_list().entries(items.iter()).finish(),
            Self::Map(map) => f.debug_map().entries(map.iter()).finish(),
            Self::Opaque(o) => fmt::Debug::fmt(o, f),
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Self::Number(f64::from(value))
    }
}

impl From<u32> for Value {
    fn from(value: u32) -> Self {
        Self::Number(f64::from(value))
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::String(Rc::from(value))
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::String(Rc::from(value))
    }
}

impl From<Map> for Value {
    fn from(value: Map) -> Self {
        Self::Map(Rc::new(value))
    }
}

impl From<Vec<Value>> for Value {
    fn from(value: Vec<Value>) -> Self {
        Self::Seq(Rc::new(value))
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

// ---------------------------------------------------------------------------
// Opaque
// ---------------------------------------------------------------------------

/// A leaf holding an arbitrary value, compared by identity.
#[derive(Clone)]
pub struct Opaque(Rc<dyn Any>);

impl Opaque {
    #[must_use]
    pub fn new<T: Any>(value: T) -> Self {
        Self(Rc::new(value))
    }

    /// Borrow the inner value if it has type `T`.
    #[must_use]
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Number(a), Self::Number(b)) => same_number(*a, *b),
            (Self::String(a), Self::String(b)) => a == b,
            (Self::Seq(a), Self::Seq(b)) => Rc::ptr_eq(a, b) || a == b,
            (Self::Map(a), Self::Map(b)) => Rc::ptr_eq(a, b) || a == b,
            (Self::Opaque(a), Self::Opaque(b)) => a == b,
            _ => false,
        }
    }
}

fn same_number(a: f64, b: f64) -> bool {
    a == b || (a.is_nan() && b.is_nan())
}

impl PartialEq for Opaque {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for Opaque {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Opaque({:p})", Rc::as_ptr(&self.0))
    }
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

static NEXT_SNAPSHOT_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SnapshotId(u64);

impl SnapshotId {
    fn next() -> Self {
        Self(NEXT_SNAPSHOT_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

/// A root value plus the identity the scheduler keys full renders on.
#[derive(Debug, Clone)]
pub struct Snapshot {
    id: SnapshotId,
    root: Value,
}

impl Snapshot {
    /// Take ownership of `root` under a fresh identity.
    #[must_use]
    pub fn new(root: impl Into<Value>) -> Self {
        Self {
            id: SnapshotId::next(),
            root: root.into(),
        }
    }

    #[must_use]
    pub fn id(&self) -> SnapshotId {
        self.id
    }

    #[must_use]
    pub fn root(&self) -> &Value {
        &self.root
    }

    /// Mutable access to the root.
    ///
    /// Writes made here bypass merge tracking; use
    /// [`Tracked`](crate::tracked::Tracked) unless the change is announced
    /// some other way.
    pub fn root_mut(&mut self) -> &mut Value {
        &mut self.root
    }

    /// Replace the data wholesale, minting a new identity.
    pub fn replace(&mut self, root: impl Into<Value>) -> Value {
        self.id = SnapshotId::next();
        std::mem::replace(&mut self.root, root.into())
    }

    #[must_use]
    pub fn into_root(self) -> Value {
        self.root
    }
}

// ---------------------------------------------------------------------------
// JSON interop
// ---------------------------------------------------------------------------

#[cfg(feature = "json")]
mod json {
    use super::{Map, Value};
    use std::rc::Rc;

    impl From<serde_json::Value> for Value {
        fn from(value: serde_json::Value) -> Self {
            match value {
                serde_json::Value::Null => Self::Null,
                serde_json::Value::Bool(b) => Self::Bool(b),
                serde_json::Value::Number(n) => Self::Number(n.as_f64().unwrap_or(f64::NAN)),
                serde_json::Value::String(s) => Self::String(Rc::from(s)),
                serde_json::Value::Array(items) => {
                    Self::Seq(Rc::new(items.into_iter().map(Value::from).collect()))
                }
                serde_json::Value::Object(obj) => Self::Map(Rc::new(
                    obj.into_iter()
                        .map(|(k, v)| (k, Value::from(v)))
                        .collect::<Map>(),
                )),
            }
        }
    }

    impl Value {
        /// Convert to JSON. Opaque leaves and non-finite numbers become `null`.
        #[must_use]
        pub fn to_json(&self) -> serde_json::Value {
            match self {
                Value::Null | Value::Opaque(_) => serde_json::Value::Null,
                Value::Bool(b) => serde_json::Value::Bool(*b),
                Value::Number(n) => serde_json::Number::from_f64(*n)
                    .map_or(serde_json::Value::Null, serde_json::Value::Number),
                Value::String(s) => serde_json::Value::String(s.to_string()),
                Value::Seq(items) => {
                    serde_json::Value::Array(items.iter().map(Value::to_json).collect())
                }
                Value::Map(map) => serde_json::Value::Object(
                    map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
                ),
            }
        }
    }
}
