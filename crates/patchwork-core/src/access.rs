#![forbid(unsafe_code)]

//! Access recording: which parts of a snapshot did a consumer read?
//!
//! A [`Recorder`] accumulates an [`AccessShape`] while a consumer reads the
//! snapshot through [`View`]s handed out by the recorder. Views are `Copy`
//! and read-only; every read goes through the view so the recorder sees it.
//!
//! # What gets recorded
//!
//! | Read                                  | Effect on the shape           |
//! |---------------------------------------|-------------------------------|
//! | [`View::get`] of a leaf or missing key | child node marked *accessed*  |
//! | [`View::get`] of a container           | child node created, unmarked  |
//! | [`View::as_str`] and friends           | node marked *accessed*        |
//! | [`View::len`] / [`View::keys`] / iteration | node marked *listed*      |
//! | [`View::pierce`]                       | node marked *accessed*        |
//! | [`View::pierce_silent`]                | nothing                       |
//!
//! A listed node remembers what it saw (the key set of a mapping, the length
//! of a sequence). A later merge that only rewrites existing entries does not
//! count as a listing change; one that adds or removes entries does.
//!
//! Shapes are stored as an arena indexed by [`ShapeNodeId`]; the root is
//! [`AccessShape::ROOT`].

use std::cell::RefCell;
use std::fmt;

use ahash::{AHashMap, AHashSet};

use crate::error::{EngineError, Result, display_path};
use crate::merge::{Change, Merge};
use crate::value::{Opaque, Value};

/// Handle to a node of an [`AccessShape`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShapeNodeId(usize);

/// What a listing read observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Listing {
    /// The keys of a mapping.
    Keys(AHashSet<String>),
    /// The length of a sequence.
    Len(usize),
}

impl Listing {
    /// Whether `merge` under `key` adds or removes an entry relative to what
    /// was listed.
    #[must_use]
    pub fn adds_or_removes(&self, key: &str, merge: &Merge) -> bool {
        let deleting = matches!(merge, Merge::Delete);
        match self {
            Self::Keys(keys) => keys.contains(key) == deleting,
            Self::Len(len) => match key.parse::<usize>() {
                Ok(index) => (index < *len) == deleting,
                Err(_) => true,
            },
        }
    }
}

#[derive(Debug, Clone)]
struct ShapeNode {
    parent: Option<usize>,
    key: String,
    accessed: bool,
    listing: Option<Listing>,
    children: AHashMap<String, usize>,
}

impl ShapeNode {
    fn new(parent: Option<usize>, key: String) -> Self {
        Self {
            parent,
            key,
            accessed: false,
            listing: None,
            children: AHashMap::new(),
        }
    }
}

/// Record of which snapshot paths one consumer run touched.
#[derive(Debug, Clone)]
pub struct AccessShape {
    nodes: Vec<ShapeNode>,
}

impl Default for AccessShape {
    fn default() -> Self {
        Self {
            nodes: vec![ShapeNode::new(None, String::new())],
        }
    }
}

impl AccessShape {
    pub const ROOT: ShapeNodeId = ShapeNodeId(0);

    #[must_use]
    pub fn is_accessed(&self, node: ShapeNodeId) -> bool {
        self.nodes[node.0].accessed
    }

    #[must_use]
    pub fn listing(&self, node: ShapeNodeId) -> Option<&Listing> {
        self.nodes[node.0].listing.as_ref()
    }

    #[must_use]
    pub fn child(&self, node: ShapeNodeId, key: &str) -> Option<ShapeNodeId> {
        self.nodes[node.0].children.get(key).copied().map(ShapeNodeId)
    }

    /// Number of recorded nodes, including the root.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Whether nothing at all was read.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.len() == 1 && !self.nodes[0].accessed && self.nodes[0].listing.is_none()
    }

    /// Node at `path`, if the consumer reached it.
    #[must_use]
    pub fn find(&self, path: &[&str]) -> Option<ShapeNodeId> {
        path.iter()
            .try_fold(Self::ROOT, |node, key| self.child(node, key))
    }

    #[must_use]
    pub fn is_accessed_at(&self, path: &[&str]) -> bool {
        self.find(path).is_some_and(|node| self.is_accessed(node))
    }

    #[must_use]
    pub fn is_listed_at(&self, path: &[&str]) -> bool {
        self.find(path).is_some_and(|node| self.listing(node).is_some())
    }

    /// Key path from the root to `node`.
    #[must_use]
    pub fn path(&self, node: ShapeNodeId) -> Vec<String> {
        let mut keys = Vec::new();
        let mut cursor = Some(node.0);
        while let Some(index) = cursor {
            let n = &self.nodes[index];
            if n.parent.is_some() {
                keys.push(n.key.clone());
            }
            cursor = n.parent;
        }
        keys.reverse();
        keys
    }
}

// ---------------------------------------------------------------------------
// Recorder
// ---------------------------------------------------------------------------

/// Accumulates an [`AccessShape`] for one consumer run.
#[derive(Debug, Default)]
pub struct Recorder {
    shape: RefCell<AccessShape>,
}

impl Recorder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A view of `value` at the root of this recorder.
    #[must_use]
    pub fn view<'a>(&'a self, value: &'a Value, change: Change<'a>) -> View<'a> {
        View {
            value: Some(value),
            change,
            recorder: self,
            node: 0,
        }
    }

    /// Stop recording and hand back the shape.
    #[must_use]
    pub fn finish(self) -> AccessShape {
        self.shape.into_inner()
    }

    fn child(&self, parent: usize, key: &str) -> usize {
        let mut shape = self.shape.borrow_mut();
        if let Some(&existing) = shape.nodes[parent].children.get(key) {
            return existing;
        }
        let index = shape.nodes.len();
        shape
            .nodes
            .push(ShapeNode::new(Some(parent), key.to_owned()));
        shape.nodes[parent].children.insert(key.to_owned(), index);
        index
    }

    fn mark_accessed(&self, node: usize) {
        self.shape.borrow_mut().nodes[node].accessed = true;
    }

    fn mark_listed(&self, node: usize, listing: Listing) {
        self.shape.borrow_mut().nodes[node].listing = Some(listing);
    }

    fn path(&self, node: usize) -> Vec<String> {
        self.shape.borrow().path(ShapeNodeId(node))
    }
}

// ---------------------------------------------------------------------------
// View
// ---------------------------------------------------------------------------

/// Read-only, access-recording view of one node of a snapshot.
#[derive(Clone, Copy)]
pub struct View<'a> {
    value: Option<&'a Value>,
    change: Change<'a>,
    recorder: &'a Recorder,
    node: usize,
}

impl<'a> View<'a> {
    /// Step to child `key`. Reaching a leaf (or nothing) counts as reading it.
    #[must_use]
    pub fn get(self, key: &str) -> View<'a> {
        let value = self.value.and_then(|v| v.get(key));
        let node = self.recorder.child(self.node, key);
        if !value.is_some_and(Value::is_container) {
            self.recorder.mark_accessed(node);
        }
        View {
            value,
            change: self.change.child(key),
            recorder: self.recorder,
            node,
        }
    }

    /// Step to element `index` of a sequence.
    #[must_use]
    pub fn index(self, index: usize) -> View<'a> {
        self.get(&index.to_string())
    }

    /// Like [`get`](Self::get), but a missing child is a
    /// [`EngineError::StructuralMismatch`].
    pub fn try_get(self, key: &str) -> Result<View<'a>> {
        let child = self.get(key);
        if child.value.is_none() {
            return Err(EngineError::mismatch(child.path()));
        }
        Ok(child)
    }

    /// Whether a value exists here.
    #[must_use]
    pub fn exists(self) -> bool {
        self.value.is_some()
    }

    /// Number of entries. Marks the node listed.
    #[must_use]
    pub fn len(self) -> usize {
        self.record_listing();
        self.value.map_or(0, Value::len)
    }

    #[must_use]
    pub fn is_empty(self) -> bool {
        self.len() == 0
    }

    /// Keys of a mapping, or indices of a sequence. Marks the node listed.
    #[must_use]
    pub fn keys(self) -> Vec<String> {
        self.record_listing();
        child_keys(self.value)
    }

    /// Child views in key (or index) order. Marks the node listed.
    pub fn iter(self) -> impl Iterator<Item = View<'a>> {
        self.keys().into_iter().map(move |key| self.get(&key))
    }

    /// `(key, child)` pairs in key order. Marks the node listed.
    pub fn entries(self) -> impl Iterator<Item = (String, View<'a>)> {
        self.keys().into_iter().map(move |key| {
            let child = self.get(&key);
            (key, child)
        })
    }

    #[must_use]
    pub fn as_str(self) -> Option<&'a str> {
        self.read().and_then(Value::as_str)
    }

    #[must_use]
    pub fn as_f64(self) -> Option<f64> {
        self.read().and_then(Value::as_f64)
    }

    #[must_use]
    pub fn as_bool(self) -> Option<bool> {
        self.read().and_then(Value::as_bool)
    }

    #[must_use]
    pub fn as_opaque(self) -> Option<&'a Opaque> {
        self.read().and_then(Value::as_opaque)
    }

    /// Missing or `Null`.
    #[must_use]
    pub fn is_null(self) -> bool {
        self.read().is_none_or(Value::is_null)
    }

    /// The raw value; the consumer now depends on everything below here.
    #[must_use]
    pub fn pierce(self) -> Option<&'a Value> {
        self.read()
    }

    /// The raw value without recording anything.
    ///
    /// For handing a subtree to a nested render pass that tracks its own
    /// reads.
    #[must_use]
    pub fn pierce_silent(self) -> Option<&'a Value> {
        self.value
    }

    /// The pending change for this node.
    #[must_use]
    pub fn change(self) -> Change<'a> {
        self.change
    }

    /// Dotted path of this node (`$` is the root).
    #[must_use]
    pub fn path(self) -> String {
        display_path(&self.recorder.path(self.node))
    }

    fn read(self) -> Option<&'a Value> {
        self.recorder.mark_accessed(self.node);
        self.value
    }

    fn record_listing(self) {
        match self.value {
            Some(Value::Map(map)) => self
                .recorder
                .mark_listed(self.node, Listing::Keys(map.keys().cloned().collect())),
            Some(Value::Seq(items)) => self
                .recorder
                .mark_listed(self.node, Listing::Len(items.len())),
            _ => self.recorder.mark_accessed(self.node),
        }
    }
}

impl fmt::Debug for View<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("View")
            .field("path", &self.path())
            .field("value", &self.value)
            .field("change", &self.change)
            .finish()
    }
}

fn child_keys(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Map(map)) => map.keys().cloned().collect(),
        Some(Value::Seq(items)) => (0..items.len()).map(|i| i.to_string()).collect(),
        _ => Vec::new(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
