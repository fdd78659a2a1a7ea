#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use patchwork_core::merge::apply;
use patchwork_core::{MergeBuffer, Tracked, Value};

#[derive(Arbitrary, Debug)]
enum FuzzOp {
    Set { path: Vec<u8>, key: u8, value: i16 },
    SetMap { path: Vec<u8>, key: u8 },
    SetSeq { path: Vec<u8>, key: u8 },
    Remove { path: Vec<u8>, key: u8 },
    Push { path: Vec<u8>, value: i16 },
    Pop { path: Vec<u8> },
    RemoveIndex { path: Vec<u8>, index: u8 },
    SetIndex { path: Vec<u8>, index: u8, value: i16 },
}

fn key(k: u8) -> String {
    format!("k{}", k % 4)
}

/// Walk `path` one step at a time, treating each byte as a mapping key or a
/// sequence index depending on what the node holds. Errors end the walk.
fn apply_op(tracked: &mut Tracked<'_>, path: &[u8], op: &FuzzOp) {
    if let Some((&first, rest)) = path.split_first() {
        let next = if tracked.value().as_seq().is_some() {
            tracked.at_index(usize::from(first % 4))
        } else {
            tracked.at(&key(first))
        };
        if let Ok(mut child) = next {
            apply_op(&mut child, rest, op);
        }
        return;
    }
    let _ = match op {
        FuzzOp::Set { key: k, value, .. } => tracked.set(&key(*k), i32::from(*value)),
        FuzzOp::SetMap { key: k, .. } => tracked.set(&key(*k), Value::map()),
        FuzzOp::SetSeq { key: k, .. } => tracked.set(&key(*k), Value::seq()),
        FuzzOp::Remove { key: k, .. } => tracked.remove(&key(*k)).map(drop),
        FuzzOp::Push { value, .. } => tracked.push(i32::from(*value)),
        FuzzOp::Pop { .. } => tracked.pop().map(drop),
        FuzzOp::RemoveIndex { index, .. } => tracked.remove_index(usize::from(*index % 4)).map(drop),
        FuzzOp::SetIndex { index, value, .. } => {
            tracked.set_index(usize::from(*index % 5), i32::from(*value))
        }
    };
}

fn path_of(op: &FuzzOp) -> &[u8] {
    let path = match op {
        FuzzOp::Set { path, .. }
        | FuzzOp::SetMap { path, .. }
        | FuzzOp::SetSeq { path, .. }
        | FuzzOp::Remove { path, .. }
        | FuzzOp::Push { path, .. }
        | FuzzOp::Pop { path }
        | FuzzOp::RemoveIndex { path, .. }
        | FuzzOp::SetIndex { path, .. } => path,
    };
    &path[..path.len().min(3)]
}

fuzz_target!(|ops: Vec<FuzzOp>| {
    let mut root = Value::map();
    let before = root.clone();
    let buffer = MergeBuffer::new();
    {
        let mut tracked = Tracked::new(&mut root, &buffer);
        for op in ops.iter().take(64) {
            apply_op(&mut tracked, path_of(op), op);
        }
    }

    let merges = buffer.take();
    let replayed = merges
        .iter()
        .fold(before.clone(), |value, merge| apply(value, merge, false));
    assert!(replayed == root, "replaying every write reproduces the tree");

    let coalesced = merges.into_iter().reduce(|mut acc, next| {
        acc.absorb(next);
        acc
    });
    if let Some(coalesced) = coalesced {
        assert!(apply(before, &coalesced, false) == root, "coalesced writes reproduce the tree");
    }
});
