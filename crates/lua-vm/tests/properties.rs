//! Property-based tests for table invariants and numeric round-trips.
//!
//! - `#t` of a gap-free sequence equals its element count after any mix of
//!   appends, inserts and removes
//! - traversal with `next` visits every present key exactly once
//! - integers survive `tonumber(tostring(n))`; float formatting is stable

use std::collections::HashSet;

use lua_vm::{LuaTable, LuaValue, Vm};
use proptest::prelude::*;

// =============================================================================
// Strategies
// =============================================================================

#[derive(Debug, Clone)]
enum SeqOp {
    Push(i64),
    Insert(usize, i64),
    Remove(usize),
}

fn arb_seq_op() -> impl Strategy<Value = SeqOp> {
    prop_oneof![
        any::<i64>().prop_map(SeqOp::Push),
        (0usize..64, any::<i64>()).prop_map(|(at, v)| SeqOp::Insert(at, v)),
        (0usize..64).prop_map(SeqOp::Remove),
    ]
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Key {
    Int(i64),
    Str(String),
}

fn arb_key() -> impl Strategy<Value = Key> {
    prop_oneof![
        (-5i64..80).prop_map(Key::Int),
        "[a-z]{1,6}".prop_map(Key::Str),
    ]
}

impl Key {
    fn to_value(&self) -> LuaValue {
        match self {
            Key::Int(i) => LuaValue::Number(*i as f64),
            Key::Str(s) => LuaValue::from(s.as_str()),
        }
    }
}

fn num_key(v: &LuaValue) -> Key {
    match v {
        LuaValue::Number(n) => Key::Int(*n as i64),
        LuaValue::LuaString(s) => Key::Str(s.to_string()),
        other => panic!("unexpected key {other:?}"),
    }
}

// =============================================================================
// Table invariants
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// The border of a sequence tracks a plain vector under the same edits.
    #[test]
    fn length_matches_sequence_model(ops in prop::collection::vec(arb_seq_op(), 0..80)) {
        let table = LuaTable::new();
        let mut model: Vec<i64> = Vec::new();
        for op in ops {
            match op {
                SeqOp::Push(v) => {
                    table.set_int(model.len() as i64 + 1, v as f64);
                    model.push(v);
                }
                SeqOp::Insert(at, v) => {
                    let pos = at % (model.len() + 1);
                    table.insert(pos + 1, LuaValue::Number(v as f64));
                    model.insert(pos, v);
                }
                SeqOp::Remove(at) => {
                    if model.is_empty() {
                        continue;
                    }
                    let pos = at % model.len();
                    let removed = table.remove(pos + 1);
                    prop_assert_eq!(removed, LuaValue::Number(model.remove(pos) as f64));
                }
            }
            prop_assert_eq!(table.len(), model.len());
        }
        for (i, v) in model.iter().enumerate() {
            prop_assert_eq!(table.get_int(i as i64 + 1), LuaValue::Number(*v as f64));
        }
    }

    /// `next` reaches every live key once, wherever it is stored.
    #[test]
    fn traversal_visits_each_key_once(
        inserts in prop::collection::vec((arb_key(), 1i64..1000), 0..60),
        deletes in prop::collection::vec(arb_key(), 0..20),
    ) {
        let table = LuaTable::new();
        let mut expected = HashSet::new();
        for (key, v) in &inserts {
            table.set(key.to_value(), LuaValue::Number(*v as f64)).unwrap();
            expected.insert(key.clone());
        }
        for key in &deletes {
            table.set(key.to_value(), LuaValue::Nil).unwrap();
            expected.remove(key);
        }

        let mut seen = HashSet::new();
        let mut key = LuaValue::Nil;
        while let Some((k, v)) = table.next(&key).unwrap() {
            prop_assert!(!v.is_nil());
            prop_assert!(seen.insert(num_key(&k)), "visited {:?} twice", k);
            key = k;
        }
        prop_assert_eq!(seen, expected);
    }
}

// =============================================================================
// Numeric round-trips
// =============================================================================

fn round_trip(vm: &mut Vm, x: f64) -> (LuaValue, LuaValue) {
    vm.set_global("x", x);
    let mut results = vm
        .exec("local s = tostring(x) return tonumber(s), s", "prop")
        .unwrap();
    let text = results.pop().unwrap_or_default();
    let back = results.pop().unwrap_or_default();
    (back, text)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn integers_round_trip_exactly(n in -(1i64 << 53)..(1i64 << 53)) {
        let mut vm = Vm::new();
        let (back, text) = round_trip(&mut vm, n as f64);
        prop_assert_eq!(back, LuaValue::Number(n as f64));
        prop_assert_eq!(text, LuaValue::from(n.to_string()));
    }

    /// Floats print with 14 significant digits, so the first conversions may
    /// round (a rounded value can land on an integer); the text then settles.
    #[test]
    fn float_text_is_stable(x in any::<f64>().prop_filter("finite", |f| f.is_finite())) {
        let mut vm = Vm::new();
        let (first, _) = round_trip(&mut vm, x);
        let first = first.as_number().expect("tostring output parses");
        let (second, text) = round_trip(&mut vm, first);
        let second = second.as_number().expect("tostring output parses");
        let (_, again) = round_trip(&mut vm, second);
        prop_assert_eq!(again, text);
    }

    #[test]
    fn tonumber_accepts_hex_and_whitespace(n in 0u32..u32::MAX, pad in 0usize..4) {
        let mut vm = Vm::new();
        let src = format!("return tonumber('{}0x{:x}{}')", " ".repeat(pad), n, " ".repeat(pad));
        let results = vm.exec(&src, "prop").unwrap();
        prop_assert_eq!(results, vec![LuaValue::Number(f64::from(n))]);
    }
}
