#![forbid(unsafe_code)]

//! Structural merges between snapshots.
//!
//! A [`Merge`] describes how to turn one value tree into another:
//!
//! - [`Merge::Delete`] removes the node.
//! - [`Merge::Replace`] overwrites the node wholesale. When the replacement is
//!   a mapping or a sequence this is a *full replacement*: nothing below the
//!   node may be assumed unchanged.
//! - [`Merge::Patch`] edits a mapping key by key. Keys the patch does not
//!   mention are untouched.
//!
//! "No information" is `Option::<Merge>::None`; an empty patch is a present
//! merge that changes nothing.
//!
//! # Invariants
//!
//! 1. `apply(a, make(a, b, false), false) == b` for all `a`, `b`.
//! 2. `make(a, a, true)` is `None`. Numbers compare by value with all NaNs
//!    equal, so this holds for NaN leaves too.
//! 3. A patch produced by [`make`] never mentions a key whose old and new
//!    values are equal, except below a full replacement.
//! 4. Sequences are never diffed by [`make`]; a changed sequence is always
//!    replaced wholesale.
//! 5. A kind change (scalar to mapping, anything to sequence, ...) is always
//!    a full replacement.
//!
//! # Sequences
//!
//! Tracked element writes produce patches keyed by decimal index. [`apply`]
//! honours those: writes go first in ascending index order (an index equal to
//! the length appends), then deletions are removed highest index first.

use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::rc::Rc;

use crate::value::Value;

/// Keyed children of a partial mapping merge.
pub type Patch = BTreeMap<String, Merge>;

/// A tree-shaped delta between two values.
#[derive(Debug, Clone, PartialEq)]
pub enum Merge {
    /// Remove the node.
    Delete,
    /// Overwrite the node wholesale.
    Replace(Value),
    /// Edit a mapping key by key.
    Patch(Patch),
}

impl Merge {
    /// Wholesale replacement by `value`.
    #[must_use]
    pub fn replace(value: impl Into<Value>) -> Self {
        Self::Replace(value.into())
    }

    /// A partial merge from key/merge pairs.
    #[must_use]
    pub fn patch<K: Into<String>, I: IntoIterator<Item = (K, Merge)>>(entries: I) -> Self {
        Self::Patch(entries.into_iter().map(|(k, m)| (k.into(), m)).collect())
    }

    /// A patch that changes nothing.
    #[must_use]
    pub fn empty() -> Self {
        Self::Patch(Patch::new())
    }

    /// Whether everything below this node must be treated as changed.
    #[must_use]
    pub fn is_full_replacement(&self) -> bool {
        matches!(self, Self::Replace(v) if v.is_container())
    }

    /// Whether this merge can be followed key by key.
    #[must_use]
    pub fn is_patch(&self) -> bool {
        matches!(self, Self::Patch(_))
    }

    #[must_use]
    pub fn as_patch(&self) -> Option<&Patch> {
        match self {
            Self::Patch(patch) => Some(patch),
            _ => None,
        }
    }

    /// Child merge for `key`, if this is a patch mentioning it.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Merge> {
        self.as_patch().and_then(|patch| patch.get(key))
    }

    /// Whether this is a patch with no entries.
    #[must_use]
    pub fn is_noop(&self) -> bool {
        matches!(self, Self::Patch(patch) if patch.is_empty())
    }

    /// Fold a later merge into this one.
    ///
    /// The result applied to the original value equals applying `self` then
    /// `incoming`. Deletion markers survive so that a later
    /// [`apply`] still removes the keys; a patch arriving on top of a deletion
    /// becomes a full replacement of a fresh mapping.
    pub fn absorb(&mut self, incoming: Merge) {
        let incoming = match incoming {
            Merge::Patch(patch) => patch,
            other => {
                *self = other;
                return;
            }
        };
        match self {
            Merge::Patch(mine) => {
                for (key, child) in incoming {
                    match mine.entry(key) {
                        Entry::Occupied(mut slot) => slot.get_mut().absorb(child),
                        Entry::Vacant(slot) => {
                            slot.insert(child);
                        }
                    }
                }
            }
            Merge::Replace(value) => {
                let base = std::mem::take(value);
                *value = apply_patch(base, &incoming, false);
            }
            Merge::Delete => {
                *self = Merge::Replace(apply_patch(Value::map(), &incoming, false));
            }
        }
    }
}

/// Apply `merge` to `value`.
///
/// With `keep_deletions`, deleted mapping keys (and sequence slots) are kept
/// as `Null` markers instead of being removed.
#[must_use]
pub fn apply(value: Value, merge: &Merge, keep_deletions: bool) -> Value {
    match merge {
        Merge::Replace(replacement) => replacement.clone(),
        Merge::Delete => Value::Null,
        Merge::Patch(patch) => apply_patch(value, patch, keep_deletions),
    }
}

fn apply_patch(value: Value, patch: &Patch, keep_deletions: bool) -> Value {
    match value {
        Value::Map(mut map) => {
            let entries = Rc::make_mut(&mut map);
            for (key, child) in patch {
                if matches!(child, Merge::Delete) {
                    if keep_deletions {
                        if let Some(slot) = entries.get_mut(key) {
                            *slot = Value::Null;
                        }
                    } else {
                        entries.remove(key);
                    }
                    continue;
                }
                match entries.get_mut(key) {
                    Some(slot) => {
                        let old = std::mem::take(slot);
                        *slot = apply(old, child, keep_deletions);
                    }
                    None => {
                        entries.insert(key.clone(), apply(Value::Null, child, keep_deletions));
                    }
                }
            }
            Value::Map(map)
        }
        Value::Seq(mut items) => {
            apply_index_patch(Rc::make_mut(&mut items), patch, keep_deletions);
            Value::Seq(items)
        }
        // A patch landing on a leaf starts a fresh mapping.
        _ => apply_patch(Value::map(), patch, keep_deletions),
    }
}

fn apply_index_patch(items: &mut Vec<Value>, patch: &Patch, keep_deletions: bool) {
    let mut entries: Vec<(usize, &Merge)> = patch
        .iter()
        .filter_map(|(key, child)| key.parse::<usize>().ok().map(|i| (i, child)))
        .collect();
    entries.sort_by_key(|(index, _)| *index);

    for (index, child) in entries.iter().filter(|(_, m)| !matches!(m, Merge::Delete)) {
        if let Some(slot) = items.get_mut(*index) {
            let old = std::mem::take(slot);
            *slot = apply(old, child, keep_deletions);
        } else {
            items.push(apply(Value::Null, child, keep_deletions));
        }
    }
    for (index, _) in entries
        .iter()
        .rev()
        .filter(|(_, m)| matches!(m, Merge::Delete))
    {
        if *index < items.len() {
            if keep_deletions {
                items[*index] = Value::Null;
            } else {
                items.remove(*index);
            }
        }
    }
}

/// Compute the minimal merge turning `from` into `to`.
///
/// With `allow_noop`, an unchanged value yields `None` instead of a merge.
/// Nested keys are always diffed with `allow_noop`, so untouched subtrees are
/// pruned.
#[must_use]
pub fn make(from: &Value, to: &Value, allow_noop: bool) -> Option<Merge> {
    if allow_noop && from.same(to) {
        return None;
    }
    match (from, to) {
        (Value::Map(old), Value::Map(new)) => {
            let mut patch = Patch::new();
            for (key, new_child) in new.iter() {
                match old.get(key) {
                    Some(old_child) => {
                        if let Some(child) = make(old_child, new_child, true) {
                            patch.insert(key.clone(), child);
                        }
                    }
                    None => {
                        patch.insert(key.clone(), Merge::Replace(new_child.clone()));
                    }
                }
            }
            for key in old.keys() {
                if !new.contains_key(key) {
                    patch.insert(key.clone(), Merge::Delete);
                }
            }
            if allow_noop && patch.is_empty() {
                None
            } else {
                Some(Merge::Patch(patch))
            }
        }
        _ if allow_noop && from == to => None,
        _ => Some(Merge::Replace(to.clone())),
    }
}

/// Wrap `merge` so it addresses the node at `path`.
#[must_use]
pub fn nest<S: AsRef<str>>(path: &[S], merge: Merge) -> Merge {
    let mut merge = merge;
    for key in path.iter().rev() {
        let mut patch = Patch::new();
        patch.insert(key.as_ref().to_owned(), merge);
        merge = Merge::Patch(patch);
    }
    merge
}

// ---------------------------------------------------------------------------
// Change
// ---------------------------------------------------------------------------

/// The pending change for one node of a snapshot, navigable by key.
///
/// `Unknown` means there is no merge information and everything must be
/// assumed new, which is what a full render sees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Change<'a> {
    Unchanged,
    Unknown,
    Merged(&'a Merge),
}

impl<'a> Change<'a> {
    /// `Unknown` when there is no merge, otherwise `Merged`.
    #[must_use]
    pub fn from_merge(merge: Option<&'a Merge>) -> Self {
        merge.map_or(Self::Unknown, Self::Merged)
    }

    /// The change for child `key`.
    #[must_use]
    pub fn child(self, key: &str) -> Change<'a> {
        match self {
            Self::Unchanged => Self::Unchanged,
            Self::Unknown => Self::Unknown,
            Self::Merged(Merge::Patch(patch)) => patch.get(key).map_or(Self::Unchanged, Self::Merged),
            Self::Merged(_) => Self::Unknown,
        }
    }

    #[must_use]
    pub fn is_unchanged(self) -> bool {
        matches!(self, Self::Unchanged)
    }

    /// Whether child `key` may have changed.
    #[must_use]
    pub fn touches(self, key: &str) -> bool {
        !self.child(key).is_unchanged()
    }

    #[must_use]
    pub fn merge(self) -> Option<&'a Merge> {
        match self {
            Self::Merged(merge) => Some(merge),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn obj<const N: usize>(pairs: [(&str, Value); N]) -> Value {
        Value::from_pairs(pairs)
    }

    #[test]
    fn apply_scalar_overwrites() {
        assert_eq!(apply(Value::from(1), &Merge::replace("x"), false), Value::from("x"));
        assert_eq!(apply(obj([("a", 1.into())]), &Merge::replace(5), false), Value::from(5));
    }

    #[test]
    fn apply_sequence_overwrites_mapping() {
        let seq = Value::from_items([1, 2]);
        let out = apply(obj([("a", 1.into())]), &Merge::Replace(seq.clone()), false);
        assert_eq!(out, seq);
    }

    #[test]
    fn apply_mappings_recurse() {
        let base = obj([
            ("foo", obj([("bar", 5.into()), ("bing", 1.into())])),
            ("keep", "me".into()),
        ]);
        let merge = Merge::patch([
            ("foo", Merge::patch([("bar", Merge::replace("five"))])),
            ("added", Merge::replace(true)),
        ]);
        let out = apply(base, &merge, false);
        let expected = obj([
            ("added", true.into()),
            ("foo", obj([("bar", "five".into()), ("bing", 1.into())])),
            ("keep", "me".into()),
        ]);
        assert_eq!(out, expected);
    }

    #[test]
    fn apply_deletes_unless_keeping_markers() {
        let base = obj([("a", 1.into()), ("b", 2.into())]);
        let merge = Merge::patch([("a", Merge::Delete), ("missing", Merge::Delete)]);

        let removed = apply(base.clone(), &merge, false);
        assert_eq!(removed, obj([("b", 2.into())]));

        let kept = apply(base, &merge, true);
        assert_eq!(kept, obj([("a", Value::Null), ("b", 2.into())]));
    }

    #[test]
    fn apply_patch_onto_leaf_materializes_mapping() {
        let merge = Merge::patch([
            ("x", Merge::replace(1)),
            ("gone", Merge::Delete),
            ("nested", Merge::patch([("y", Merge::replace(2))])),
        ]);
        let out = apply(Value::from("scalar"), &merge, false);
        assert_eq!(out, obj([("nested", obj([("y", 2.into())])), ("x", 1.into())]));
    }

    #[test]
    fn apply_index_patch_to_sequence() {
        let base = Value::from_items([0, 1, 2]);
        let merge = Merge::patch([("1", Merge::replace("one")), ("3", Merge::replace(3))]);
        let out = apply(base, &merge, false);
        assert_eq!(
            out,
            Value::from_items([Value::from(0), "one".into(), 2.into(), 3.into()])
        );

        let popped = apply(Value::from_items([0, 1, 2]), &Merge::patch([("2", Merge::Delete)]), false);
        assert_eq!(popped, Value::from_items([0, 1]));
    }

    #[test]
    fn apply_does_not_disturb_shared_handles() {
        let base = obj([("a", 1.into())]);
        let alias = base.clone();
        let _ = apply(base, &Merge::patch([("a", Merge::replace(2))]), false);
        assert_eq!(alias, obj([("a", 1.into())]));
    }

    #[test]
    fn make_identical_is_absent() {
        let v = obj([("a", Value::from_items([1, 2]))]);
        assert_eq!(make(&v, &v, true), None);
        assert_eq!(make(&Value::from(3), &Value::from(3), true), None);
    }

    #[test]
    fn make_nan_leaf_is_unchanged() {
        let nan = Value::from(f64::NAN);
        assert_eq!(make(&nan, &Value::from(f64::NAN), true), None);
        let tree = obj([("x", Value::from(f64::NAN))]);
        let copy = obj([("x", Value::from(f64::NAN))]);
        assert_eq!(make(&tree, &copy, true), None);
    }

    #[test]
    fn make_without_noop_always_produces_merge() {
        assert_eq!(make(&Value::from(3), &Value::from(3), false), Some(Merge::replace(3)));
        let v = obj([("a", 1.into())]);
        assert_eq!(make(&v, &v, false), Some(Merge::empty()));
    }

    #[test]
    fn make_mapping_diff() {
        let from = obj([
            ("bar", 5.into()),
            ("bing", Value::from_items([0, 1, 2])),
            ("same", "s".into()),
        ]);
        let to = obj([("same", "s".into()), ("zap", 5.into())]);
        let merge = make(&from, &to, false);
        assert_eq!(
            merge,
            Some(Merge::patch([
                ("bar", Merge::Delete),
                ("bing", Merge::Delete),
                ("zap", Merge::replace(5)),
            ]))
        );
    }

    #[test]
    fn make_prunes_deep_equal_sequences() {
        let from = obj([("list", Value::from_items([1, 2]))]);
        let to = obj([("list", Value::from_items([1, 2]))]);
        assert_eq!(make(&from, &to, true), None);
    }

    #[test]
    fn make_kind_change_is_full_replacement() {
        let to = obj([("x", 1.into())]);
        let merge = make(&Value::from("scalar"), &to, true).expect("kind change");
        assert!(merge.is_full_replacement());
        assert_eq!(merge, Merge::Replace(to.clone()));

        let seq = Value::from_items([1]);
        let merge = make(&to, &seq, true).expect("kind change");
        assert!(merge.is_full_replacement());

        let merge = make(&to, &Value::from(1), true).expect("kind change");
        assert!(!merge.is_full_replacement());
    }

    #[test]
    fn round_trip_with_null_values() {
        let from = obj([("a", 1.into())]);
        let to = obj([("a", Value::Null), ("b", Value::Null)]);
        let merge = make(&from, &to, false).expect("merge");
        assert_eq!(apply(from, &merge, false), to);
    }

    #[test]
    fn absorb_combines_disjoint_patches() {
        let mut pending = Merge::patch([("a", Merge::replace(1))]);
        pending.absorb(Merge::patch([("b", Merge::replace(2))]));
        assert_eq!(
            pending,
            Merge::patch([("a", Merge::replace(1)), ("b", Merge::replace(2))])
        );
    }

    #[test]
    fn absorb_keeps_deletion_markers() {
        let mut pending = Merge::patch([("a", Merge::replace(1))]);
        pending.absorb(Merge::patch([("a", Merge::Delete)]));
        assert_eq!(pending, Merge::patch([("a", Merge::Delete)]));

        let base = obj([("a", 0.into())]);
        assert_eq!(apply(base, &pending, false), Value::map());
    }

    #[test]
    fn absorb_patch_after_delete_is_full_replacement() {
        let mut pending = Merge::patch([("foo", Merge::Delete)]);
        pending.absorb(Merge::patch([(
            "foo",
            Merge::patch([("x", Merge::replace(1)), ("y", Merge::Delete)]),
        )]));
        let foo = pending.get("foo").expect("foo");
        assert!(foo.is_full_replacement());
        assert_eq!(foo, &Merge::Replace(obj([("x", 1.into())])));
    }

    #[test]
    fn absorb_patch_into_replacement_edits_value() {
        let mut pending = Merge::Replace(obj([("a", 1.into()), ("b", 2.into())]));
        pending.absorb(Merge::patch([("a", Merge::Delete), ("c", Merge::replace(3))]));
        assert_eq!(pending, Merge::Replace(obj([("b", 2.into()), ("c", 3.into())])));
    }

    #[test]
    fn absorb_replacement_wins() {
        let mut pending = Merge::patch([("a", Merge::replace(1))]);
        pending.absorb(Merge::replace("all"));
        assert_eq!(pending, Merge::replace("all"));
    }

    #[test]
    fn nest_wraps_innermost_first() {
        let merge = nest(&["foo", "bing"], Merge::patch([("1", Merge::replace("one"))]));
        assert_eq!(
            merge,
            Merge::patch([(
                "foo",
                Merge::patch([("bing", Merge::patch([("1", Merge::replace("one"))]))])
            )])
        );
        let empty: [&str; 0] = [];
        assert_eq!(nest(&empty, Merge::Delete), Merge::Delete);
    }

    #[test]
    fn change_navigation() {
        let merge = Merge::patch([
            ("foo", Merge::patch([("bar", Merge::replace(10))])),
            ("gone", Merge::Delete),
        ]);
        let root = Change::Merged(&merge);
        assert_eq!(root.child("foo").merge(), merge.get("foo"));
        assert_eq!(root.child("foo").child("bar").merge(), Some(&Merge::replace(10)));
        assert!(root.child("extra").is_unchanged());
        assert_eq!(root.child("gone").child("deep"), Change::Unknown);
        assert!(root.touches("foo"));
        assert!(!root.touches("extra"));
        assert_eq!(Change::from_merge(None), Change::Unknown);
        assert_eq!(Change::Unknown.child("x"), Change::Unknown);
    }
}
