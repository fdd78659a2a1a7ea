#![forbid(unsafe_code)]

//! Tracked writes.
//!
//! A [`Tracked`] handle wraps a mutable node of a snapshot. Every write goes
//! through it, updates the node in place (copy-on-write for shared
//! containers), and delivers the minimal [`Merge`] describing the write to a
//! [`MergeSink`], addressed from the snapshot root.
//!
//! Writing `Null` to a mapping key removes the key. A node that must hold a
//! real null should store an [`Opaque`](crate::value::Opaque) marker instead.
//!
//! # Sequences
//!
//! Element writes and appends produce index-keyed patches. Popping the last
//! element produces an index deletion. Removing from the middle shifts
//! indices, so it replaces the whole sequence.

use std::cell::RefCell;
use std::rc::Rc;

use crate::error::{EngineError, Result, display_path};
use crate::logging::trace;
use crate::merge::{Merge, make, nest};
use crate::value::Value;

/// Receiver of merges produced by tracked writes.
pub trait MergeSink {
    fn deliver(&self, merge: Merge);
}

impl<F: Fn(Merge)> MergeSink for F {
    fn deliver(&self, merge: Merge) {
        self(merge);
    }
}

/// Sink that keeps merges in write order until they are taken.
#[derive(Debug, Default)]
pub struct MergeBuffer {
    merges: RefCell<Vec<Merge>>,
}

impl MergeBuffer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.merges.borrow().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.merges.borrow().is_empty()
    }

    /// Drain the buffered merges, oldest first.
    pub fn take(&self) -> Vec<Merge> {
        std::mem::take(&mut *self.merges.borrow_mut())
    }

    /// Drain the buffered merges folded into one.
    pub fn coalesce(&self) -> Option<Merge> {
        self.take().into_iter().reduce(|mut acc, next| {
            acc.absorb(next);
            acc
        })
    }
}

impl MergeSink for MergeBuffer {
    fn deliver(&self, merge: Merge) {
        self.merges.borrow_mut().push(merge);
    }
}

// ---------------------------------------------------------------------------
// Tracked
// ---------------------------------------------------------------------------

/// Write handle over one node of a snapshot.
pub struct Tracked<'a> {
    node: &'a mut Value,
    path: Vec<String>,
    sink: &'a dyn MergeSink,
}

impl<'a> Tracked<'a> {
    /// Track writes to `root`, delivering merges to `sink`.
    pub fn new(root: &'a mut Value, sink: &'a dyn MergeSink) -> Self {
        Self {
            node: root,
            path: Vec::new(),
            sink,
        }
    }

    #[must_use]
    pub fn value(&self) -> &Value {
        self.node
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.node.get(key)
    }

    /// Key path of this node from the root.
    #[must_use]
    pub fn path(&self) -> &[String] {
        &self.path
    }

    /// Handle to existing child `key` of a mapping (or sequence, by decimal
    /// index).
    pub fn at(&mut self, key: &str) -> Result<Tracked<'_>> {
        if !self.node.is_container() {
            return Err(self.not_a_mapping());
        }
        let path = self.child_path(key);
        // Shared containers are only unshared once the child is known to exist.
        let child = match &mut *self.node {
            Value::Map(map) if map.contains_key(key) => Rc::make_mut(map).get_mut(key),
            Value::Seq(items) => match key.parse::<usize>() {
                Ok(index) if index < items.len() => Rc::make_mut(items).get_mut(index),
                _ => None,
            },
            _ => None,
        };
        let Some(node) = child else {
            return Err(EngineError::mismatch(display_path(&path)));
        };
        Ok(Tracked {
            node,
            path,
            sink: self.sink,
        })
    }

    /// Handle to element `index` of a sequence.
    pub fn at_index(&mut self, index: usize) -> Result<Tracked<'_>> {
        let path = self.child_path(&index.to_string());
        let here = display_path(&self.path);
        let Value::Seq(items) = &mut *self.node else {
            return Err(EngineError::NotASequence { path: here });
        };
        let len = items.len();
        if index >= len {
            return Err(EngineError::IndexOutOfBounds {
                path: here,
                index,
                len,
            });
        }
        let node = &mut Rc::make_mut(items)[index];
        Ok(Tracked {
            node,
            path,
            sink: self.sink,
        })
    }

    /// Write `value` under `key`. `Null` removes the key.
    pub fn set(&mut self, key: &str, value: impl Into<Value>) -> Result<()> {
        let value = value.into();
        if value.is_null() {
            return self.remove(key).map(drop);
        }
        let Value::Map(map) = &mut *self.node else {
            return Err(self.not_a_mapping());
        };
        let old = Rc::make_mut(map).insert(key.to_owned(), value.clone());
        let merge = diff(old.as_ref(), value);
        self.emit_child(key, merge);
        Ok(())
    }

    /// Remove `key`, returning the old value if there was one.
    pub fn remove(&mut self, key: &str) -> Result<Option<Value>> {
        let Value::Map(map) = &mut *self.node else {
            return Err(self.not_a_mapping());
        };
        if !map.contains_key(key) {
            return Ok(None);
        }
        let old = Rc::make_mut(map).remove(key);
        self.emit_child(key, Merge::Delete);
        Ok(old)
    }

    /// Overwrite element `index`; `index == len` appends and `Null` removes.
    pub fn set_index(&mut self, index: usize, value: impl Into<Value>) -> Result<()> {
        let value = value.into();
        if value.is_null() {
            return self.remove_index(index).map(drop);
        }
        let len = self.seq_len()?;
        if index == len {
            return self.push(value);
        }
        if index > len {
            return Err(self.out_of_bounds(index, len));
        }
        let Value::Seq(items) = &mut *self.node else {
            return Err(self.not_a_sequence());
        };
        let slot = &mut Rc::make_mut(items)[index];
        let old = std::mem::replace(slot, value.clone());
        let merge = diff(Some(&old), value);
        self.emit_child(&index.to_string(), merge);
        Ok(())
    }

    /// Append to a sequence.
    pub fn push(&mut self, value: impl Into<Value>) -> Result<()> {
        let value = value.into();
        let Value::Seq(items) = &mut *self.node else {
            return Err(self.not_a_sequence());
        };
        let index = items.len();
        Rc::make_mut(items).push(value.clone());
        self.emit_child(&index.to_string(), Merge::Replace(value));
        Ok(())
    }

    /// Remove the last element of a sequence.
    pub fn pop(&mut self) -> Result<Option<Value>> {
        let Value::Seq(items) = &mut *self.node else {
            return Err(self.not_a_sequence());
        };
        if items.is_empty() {
            return Ok(None);
        }
        let Some(last) = Rc::make_mut(items).pop() else {
            return Ok(None);
        };
        let index = items.len();
        self.emit_child(&index.to_string(), Merge::Delete);
        Ok(Some(last))
    }

    /// Remove element `index`, shifting the rest down.
    pub fn remove_index(&mut self, index: usize) -> Result<Value> {
        let len = self.seq_len()?;
        if index >= len {
            return Err(self.out_of_bounds(index, len));
        }
        if index + 1 == len {
            return self.pop().map(Option::unwrap_or_default);
        }
        let Value::Seq(items) = &mut *self.node else {
            return Err(self.not_a_sequence());
        };
        let removed = Rc::make_mut(items).remove(index);
        let merge = Merge::Replace(self.node.clone());
        self.emit(merge);
        Ok(removed)
    }

    /// Overwrite this node wholesale, returning the old value.
    pub fn replace(&mut self, value: impl Into<Value>) -> Value {
        let value = value.into();
        let old = std::mem::replace(self.node, value.clone());
        let merge = diff(Some(&old), value);
        self.emit(merge);
        old
    }

    fn emit_child(&self, key: &str, merge: Merge) {
        self.emit(Merge::patch([(key, merge)]));
    }

    fn emit(&self, merge: Merge) {
        trace!(path = %display_path(&self.path), "tracked write");
        self.sink.deliver(nest(&self.path, merge));
    }

    fn child_path(&self, key: &str) -> Vec<String> {
        let mut path = self.path.clone();
        path.push(key.to_owned());
        path
    }

    fn seq_len(&self) -> Result<usize> {
        match &*self.node {
            Value::Seq(items) => Ok(items.len()),
            _ => Err(self.not_a_sequence()),
        }
    }

    fn not_a_mapping(&self) -> EngineError {
        EngineError::NotAMapping {
            path: display_path(&self.path),
        }
    }

    fn not_a_sequence(&self) -> EngineError {
        EngineError::NotASequence {
            path: display_path(&self.path),
        }
    }

    fn out_of_bounds(&self, index: usize, len: usize) -> EngineError {
        EngineError::IndexOutOfBounds {
            path: display_path(&self.path),
            index,
            len,
        }
    }
}

impl std::fmt::Debug for Tracked<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tracked")
            .field("path", &display_path(&self.path))
            .field("value", &self.node)
            .finish_non_exhaustive()
    }
}

fn diff(old: Option<&Value>, new: Value) -> Merge {
    match old {
        Some(old) => make(old, &new, false).unwrap_or(Merge::Replace(new)),
        None => Merge::Replace(new),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merge::apply;

    fn data() -> Value {
        Value::from_pairs([(
            "foo",
            Value::from_pairs([("bing", Value::from_items(["a", "b"]))]),
        )])
    }

    #[test]
    fn nested_element_write_is_addressed_from_root() {
        let mut root = data();
        let buffer = MergeBuffer::new();
        let mut tracked = Tracked::new(&mut root, &buffer);
        tracked
            .at("foo")
            .and_then(|mut foo| foo.at("bing")?.set_index(1, "x"))
            .expect("write");
        let merges = buffer.take();
        assert_eq!(
            merges,
            vec![Merge::patch([(
                "foo",
                Merge::patch([("bing", Merge::patch([("1", Merge::replace("x"))]))]),
            )])]
        );
        assert_eq!(root.get("foo").and_then(|f| f.get("bing")).and_then(|b| b.get("1")), Some(&Value::from("x")));
    }

    #[test]
    fn replacing_a_mapping_diffs_its_keys() {
        let mut root = data();
        let buffer = MergeBuffer::new();
        Tracked::new(&mut root, &buffer)
            .set("foo", Value::from_pairs([("zap", 5)]))
            .expect("set");
        assert_eq!(
            buffer.take(),
            vec![Merge::patch([(
                "foo",
                Merge::patch([("bing", Merge::Delete), ("zap", Merge::replace(5))]),
            )])]
        );
    }

    #[test]
    fn failed_navigation_keeps_containers_shared() {
        let mut root = Value::from_pairs([
            ("foo", Value::from_pairs([("bar", 1)])),
            ("list", Value::from_items([1, 2])),
        ]);
        let before = root.clone();
        let buffer = MergeBuffer::new();
        let mut tracked = Tracked::new(&mut root, &buffer);
        assert!(tracked.at("missing").is_err());
        drop(tracked);
        assert!(root.same(&before));

        let mut list = before.get("list").cloned().unwrap_or_default();
        let shared = list.clone();
        let mut tracked = Tracked::new(&mut list, &buffer);
        assert!(tracked.at_index(2).is_err());
        assert!(tracked.at("7").is_err());
        drop(tracked);
        assert!(list.same(&shared));

        let mut empty = Value::from_items(Vec::<Value>::new());
        let shared = empty.clone();
        assert_eq!(Tracked::new(&mut empty, &buffer).pop().expect("pop"), None);
        assert!(empty.same(&shared));
        assert!(buffer.take().is_empty());
    }

    #[test]
    fn writing_null_deletes() {
        let mut root = data();
        let buffer = MergeBuffer::new();
        let mut tracked = Tracked::new(&mut root, &buffer);
        tracked.set("foo", Value::Null).expect("delete");
        // Already gone: nothing to report.
        tracked.set("foo", Value::Null).expect("delete again");
        assert_eq!(buffer.take(), vec![Merge::patch([("foo", Merge::Delete)])]);
        assert!(root.get("foo").is_none());
    }

    #[test]
    fn synchronous_sequence_of_writes_replays() {
        let mut root = Value::from_pairs([("count", 0)]);
        let before = root.clone();
        let buffer = MergeBuffer::new();
        {
            let mut tracked = Tracked::new(&mut root, &buffer);
            tracked.set("count", 1).expect("set");
            tracked.set("name", "x").expect("set");
            tracked.set("count", 2).expect("set");
            tracked.remove("name").expect("remove");
        }
        let merges = buffer.take();
        assert_eq!(merges.len(), 4);
        let replayed = merges
            .iter()
            .fold(before.clone(), |value, merge| apply(value, merge, false));
        assert_eq!(replayed, root);
        assert_eq!(root, Value::from_pairs([("count", 2)]));
    }

    #[test]
    fn coalesced_buffer_matches_sequential_application() {
        let mut root = data();
        let before = root.clone();
        let buffer = MergeBuffer::new();
        {
            let mut tracked = Tracked::new(&mut root, &buffer);
            tracked.set("a", 1).expect("set");
            tracked.remove("foo").expect("remove");
            tracked.set("foo", Value::from_pairs([("x", true)])).expect("set");
            tracked.set("b", 2).expect("set");
        }
        let merge = buffer.coalesce().expect("merge");
        assert!(buffer.is_empty());
        assert_eq!(apply(before, &merge, false), root);
    }

    #[test]
    fn sequence_push_pop_and_remove() {
        let mut root = Value::from_pairs([("list", Value::from_items([1, 2, 3]))]);
        let before = root.clone();
        let buffer = MergeBuffer::new();
        {
            let mut tracked = Tracked::new(&mut root, &buffer);
            let mut list = tracked.at("list").expect("list");
            list.push(4).expect("push");
            assert_eq!(list.pop().expect("pop"), Some(Value::from(4)));
            assert_eq!(list.remove_index(0).expect("remove"), Value::from(1));
            list.set_index(2, 9).expect("append via set");
        }
        let merges = buffer.take();
        assert_eq!(merges[0], Merge::patch([("list", Merge::patch([("3", Merge::replace(4))]))]));
        assert_eq!(merges[1], Merge::patch([("list", Merge::patch([("3", Merge::Delete)]))]));
        assert!(matches!(merges[2].get("list"), Some(Merge::Replace(_))));
        let replayed = merges
            .iter()
            .fold(before, |value, merge| apply(value, merge, false));
        assert_eq!(replayed, root);
        assert_eq!(root.get("list"), Some(&Value::from_items([2, 3, 9])));
    }

    #[test]
    fn misuse_errors_carry_paths() {
        let mut root = data();
        let buffer = MergeBuffer::new();
        let mut tracked = Tracked::new(&mut root, &buffer);
        let mut foo = tracked.at("foo").expect("foo");
        assert!(matches!(foo.push(1), Err(EngineError::NotASequence { ref path }) if path == "$.foo"));
        let mut bing = foo.at("bing").expect("bing");
        assert!(matches!(bing.set("k", 1), Err(EngineError::NotAMapping { ref path }) if path == "$.foo.bing"));
        assert!(matches!(
            bing.set_index(5, 1),
            Err(EngineError::IndexOutOfBounds { index: 5, len: 2, .. })
        ));
        assert!(matches!(
            tracked.at("missing"),
            Err(EngineError::StructuralMismatch { .. })
        ));
        assert!(buffer.is_empty());
    }

    #[test]
    fn writes_do_not_disturb_shared_snapshots() {
        let mut root = data();
        let old = root.clone();
        let sink = |_merge: Merge| {};
        Tracked::new(&mut root, &sink)
            .at("foo")
            .and_then(|mut foo| foo.set("new", 1))
            .expect("write");
        assert!(old.get("foo").and_then(|f| f.get("new")).is_none());
        assert!(root.get("foo").and_then(|f| f.get("new")).is_some());
        assert!(!old.same(&root));
    }

    #[test]
    fn replace_at_root_diffs_against_old() {
        let mut root = Value::from_pairs([("a", 1), ("b", 2)]);
        let buffer = MergeBuffer::new();
        let old = Tracked::new(&mut root, &buffer).replace(Value::from_pairs([("a", 1)]));
        assert_eq!(old.len(), 2);
        assert_eq!(buffer.take(), vec![Merge::patch([("b", Merge::Delete)])]);
    }
}
