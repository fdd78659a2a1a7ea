#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use patchwork_core::Value;
use patchwork_core::merge::{apply, make};

#[derive(Arbitrary, Debug)]
enum FuzzTree {
    Null,
    Bool(bool),
    Number(i16),
    Text(u8),
    Seq(Vec<FuzzTree>),
    Map(Vec<(u8, FuzzTree)>),
}

impl FuzzTree {
    fn to_value(&self, depth: usize) -> Value {
        if depth > 6 {
            return Value::Null;
        }
        match self {
            FuzzTree::Null => Value::Null,
            FuzzTree::Bool(b) => Value::from(*b),
            FuzzTree::Number(n) => Value::from(i32::from(*n)),
            FuzzTree::Text(t) => Value::from(format!("s{}", t % 8)),
            FuzzTree::Seq(items) => {
                Value::from_items(items.iter().take(8).map(|item| item.to_value(depth + 1)))
            }
            FuzzTree::Map(entries) => Value::from_pairs(
                entries
                    .iter()
                    .take(8)
                    .map(|(k, v)| (format!("k{}", k % 6), v.to_value(depth + 1))),
            ),
        }
    }
}

fuzz_target!(|input: (FuzzTree, FuzzTree, FuzzTree)| {
    let a = input.0.to_value(0);
    let b = input.1.to_value(0);
    let c = input.2.to_value(0);

    let Some(ab) = make(&a, &b, false) else {
        panic!("make without allow_noop returned None");
    };
    assert!(apply(a.clone(), &ab, false) == b, "round trip a -> b");

    match make(&a, &b, true) {
        Some(pruned) => assert!(apply(a.clone(), &pruned, false) == b),
        None => assert!(a == b),
    }

    // Coalescing two successive merges equals applying them in turn.
    if let Some(bc) = make(&b, &c, false) {
        let mut combined = ab.clone();
        combined.absorb(bc);
        assert!(apply(a, &combined, false) == c, "coalesced a -> c");
    }
});
