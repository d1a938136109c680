//! Lua tables: a dense array part for keys `1..n` plus an insertion-ordered
//! hash part for everything else.

use std::cell::{Ref, RefCell, RefMut};
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

use lua_core::number::to_integer;

use crate::error::LuaError;
use crate::value::LuaValue;

/// Shared handle to a table. Clones alias the same table.
#[derive(Clone, Default)]
pub struct LuaTable(Rc<RefCell<Table>>);

/// Table storage.
///
/// Invariants:
/// - `array` holds exactly the run of present keys `1..=n` and no nil slot,
///   so `array.len()` is always a border;
/// - key `array.len() + 1` is never in the hash part, because writing it
///   extends the array and migrates the following keys out of the hash;
/// - writing nil inside the array moves the rest of the run to the *front*
///   of the hash part, where a traversal already in the hash never sees it
///   again and one still in the array reaches it next;
/// - hash entries keep their relative order until compaction, so clearing a
///   field during traversal never disturbs `next`.
#[derive(Default)]
pub(crate) struct Table {
    array: Vec<LuaValue>,
    /// `(key, value)` in traversal order; a nil value is a tombstone.
    entries: VecDeque<(LuaValue, LuaValue)>,
    /// Sequence number of each key; `seq - first` is its slot in `entries`.
    index: HashMap<TableKey, isize>,
    /// Sequence number of `entries[0]`.
    first: isize,
    tombstones: usize,
    metatable: Option<LuaTable>,
}

/// Hashable identity of a non-nil, non-NaN key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum TableKey {
    Bool(bool),
    /// Bit pattern of the number, with `-0.0` folded into `0.0`.
    Number(u64),
    Str(Rc<str>),
    Ref(usize),
}

impl TableKey {
    fn from_value(v: &LuaValue) -> Option<TableKey> {
        match v {
            LuaValue::Nil => None,
            LuaValue::Boolean(b) => Some(TableKey::Bool(*b)),
            LuaValue::Number(n) if n.is_nan() => None,
            LuaValue::Number(n) => Some(TableKey::Number((*n + 0.0).to_bits())),
            LuaValue::LuaString(s) => Some(TableKey::Str(s.clone())),
            other => other.address().map(TableKey::Ref),
        }
    }
}

/// 1-based array position named by `key`, if it is a positive integer.
fn array_index(key: &LuaValue) -> Option<usize> {
    match key {
        LuaValue::Number(n) => to_integer(*n).filter(|&i| i >= 1).map(|i| i as usize),
        _ => None,
    }
}

fn check_key(key: &LuaValue) -> Result<(), LuaError> {
    match key {
        LuaValue::Nil => Err(LuaError::msg("table index is nil")),
        LuaValue::Number(n) if n.is_nan() => Err(LuaError::msg("table index is NaN")),
        _ => Ok(()),
    }
}

impl Table {
    fn get(&self, key: &LuaValue) -> LuaValue {
        if let Some(i) = array_index(key) {
            if i <= self.array.len() {
                return self.array[i - 1].clone();
            }
        }
        self.get_hashed(key)
    }

    fn get_hashed(&self, key: &LuaValue) -> LuaValue {
        TableKey::from_value(key)
            .and_then(|k| self.position(&k))
            .map(|pos| self.entries[pos].1.clone())
            .unwrap_or_default()
    }

    fn position(&self, key: &TableKey) -> Option<usize> {
        self.index.get(key).map(|&seq| (seq - self.first) as usize)
    }

    fn push_entry(&mut self, hkey: TableKey, key: LuaValue, val: LuaValue) {
        self.index.insert(hkey, self.first + self.entries.len() as isize);
        self.entries.push_back((key, val));
    }

    /// `t[key] = val` for a key already known to be valid.
    fn set(&mut self, key: LuaValue, val: LuaValue) {
        if let Some(i) = array_index(&key) {
            let len = self.array.len();
            if i < len && val.is_nil() {
                self.split_array(i);
                return;
            }
            if i <= len {
                self.array[i - 1] = val;
                if i == len {
                    self.trim_array();
                }
                return;
            }
            if i == len + 1 {
                if !val.is_nil() {
                    self.array.push(val);
                    self.migrate_from_hash();
                }
                return;
            }
        }
        let Some(hkey) = TableKey::from_value(&key) else {
            return;
        };
        match self.position(&hkey) {
            Some(pos) => {
                let slot = &mut self.entries[pos].1;
                match (slot.is_nil(), val.is_nil()) {
                    (false, true) => self.tombstones += 1,
                    (true, false) => self.tombstones -= 1,
                    _ => {}
                }
                *slot = val;
            }
            None if val.is_nil() => {}
            None => {
                self.compact_if_sparse();
                self.push_entry(hkey, key, val);
            }
        }
    }

    /// `t[i] = nil` for `i` inside the array: keep `1..i` there and move
    /// `i+1..=n` to the front of the hash part, in key order.
    fn split_array(&mut self, i: usize) {
        let tail = self.array.split_off(i);
        self.array.truncate(i - 1);
        for (offset, val) in tail.into_iter().enumerate().rev() {
            let key = LuaValue::Number((i + 1 + offset) as f64);
            if let Some(hkey) = TableKey::from_value(&key) {
                self.first -= 1;
                self.index.insert(hkey, self.first);
                self.entries.push_front((key, val));
            }
        }
    }

    /// Drop trailing nils so the last array slot is present.
    fn trim_array(&mut self) {
        while matches!(self.array.last(), Some(LuaValue::Nil)) {
            self.array.pop();
        }
    }

    /// Pull `len+1, len+2, ...` out of the hash part after the array grew.
    fn migrate_from_hash(&mut self) {
        loop {
            let next = LuaValue::Number((self.array.len() + 1) as f64);
            let Some(hkey) = TableKey::from_value(&next) else {
                return;
            };
            let Some(pos) = self.position(&hkey) else {
                return;
            };
            if self.entries[pos].1.is_nil() {
                return;
            }
            let val = std::mem::take(&mut self.entries[pos].1);
            self.index.remove(&hkey);
            self.tombstones += 1;
            self.array.push(val);
        }
    }

    fn remove_hashed(&mut self, key: &LuaValue) {
        let Some(hkey) = TableKey::from_value(key) else {
            return;
        };
        if let Some(seq) = self.index.remove(&hkey) {
            let pos = (seq - self.first) as usize;
            if !self.entries[pos].1.is_nil() {
                self.tombstones += 1;
            }
            self.entries[pos].1 = LuaValue::Nil;
        }
    }

    /// Rebuild the hash part once more than half of it is tombstones.
    /// Only runs when a new key is inserted.
    fn compact_if_sparse(&mut self) {
        if self.entries.len() < 8 || self.tombstones * 2 <= self.entries.len() {
            return;
        }
        let entries = std::mem::take(&mut self.entries);
        self.index.clear();
        self.tombstones = 0;
        self.first = 0;
        for (key, val) in entries.into_iter().filter(|(_, v)| !v.is_nil()) {
            if let Some(hkey) = TableKey::from_value(&key) {
                self.push_entry(hkey, key, val);
            }
        }
    }

    fn next(&self, key: &LuaValue) -> Result<Option<(LuaValue, LuaValue)>, LuaError> {
        let (mut array_pos, mut hash_pos) = (0, 0);
        match key {
            LuaValue::Nil => {}
            _ => match array_index(key) {
                Some(i) if i <= self.array.len() => array_pos = i,
                _ => {
                    array_pos = self.array.len();
                    match TableKey::from_value(key).and_then(|k| self.position(&k)) {
                        Some(pos) => hash_pos = pos + 1,
                        // An array key whose slot was trimmed away while iterating.
                        None if array_index(key).is_some() => {}
                        None => return Err(LuaError::msg("invalid key to 'next'")),
                    }
                }
            },
        }
        for (i, v) in self.array.iter().enumerate().skip(array_pos) {
            if !v.is_nil() {
                return Ok(Some((LuaValue::Number((i + 1) as f64), v.clone())));
            }
        }
        Ok(self
            .entries
            .iter()
            .skip(hash_pos)
            .find(|(_, v)| !v.is_nil())
            .cloned())
    }
}

impl LuaTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-size both parts, as the table constructor knows its shape.
    pub fn with_capacity(narray: usize, nhash: usize) -> Self {
        Self(Rc::new(RefCell::new(Table {
            array: Vec::with_capacity(narray),
            entries: VecDeque::with_capacity(nhash),
            index: HashMap::with_capacity(nhash),
            ..Default::default()
        })))
    }

    /// Build a sequence `{v1, v2, ...}`.
    pub fn from_values(values: impl IntoIterator<Item = LuaValue>) -> Self {
        let t = Self::new();
        t.set_list(1, values);
        t
    }

    pub(crate) fn address(&self) -> usize {
        Rc::as_ptr(&self.0) as *const u8 as usize
    }

    pub(crate) fn borrow(&self) -> Ref<'_, Table> {
        self.0.borrow()
    }

    fn borrow_mut(&self) -> RefMut<'_, Table> {
        self.0.borrow_mut()
    }

    /// Raw read of `t[key]`; missing keys read as nil.
    pub fn get(&self, key: &LuaValue) -> LuaValue {
        self.borrow().get(key)
    }

    pub fn get_field(&self, name: &str) -> LuaValue {
        self.borrow().get_hashed(&LuaValue::from(name))
    }

    pub fn get_int(&self, i: i64) -> LuaValue {
        self.get(&LuaValue::Number(i as f64))
    }

    /// Raw write of `t[key] = val`. Assigning nil removes the key.
    pub fn set(&self, key: LuaValue, val: LuaValue) -> Result<(), LuaError> {
        check_key(&key)?;
        self.borrow_mut().set(key, val);
        Ok(())
    }

    pub fn set_field(&self, name: &str, val: impl Into<LuaValue>) {
        self.borrow_mut().set(LuaValue::from(name), val.into());
    }

    pub fn set_int(&self, i: i64, val: impl Into<LuaValue>) {
        self.borrow_mut().set(LuaValue::Number(i as f64), val.into());
    }

    /// Store `values` at `start, start+1, ...`. Values after a nil land in
    /// the hash part, so `{1, nil, 3}` has border 1.
    pub fn set_list(&self, start: usize, values: impl IntoIterator<Item = LuaValue>) {
        let mut t = self.borrow_mut();
        for (i, val) in (start.max(1)..).zip(values) {
            t.set(LuaValue::Number(i as f64), val);
        }
    }

    /// The length border `#t` (ignores `__len`).
    pub fn len(&self) -> usize {
        self.borrow().array.len()
    }

    pub fn is_empty(&self) -> bool {
        let t = self.borrow();
        t.array.is_empty() && t.tombstones == t.entries.len()
    }

    /// Insert `val` at `pos` (1-based), shifting `t[pos..=#t]` up by one.
    pub fn insert(&self, pos: usize, val: LuaValue) {
        let mut t = self.borrow_mut();
        let len = t.array.len();
        if (1..=len + 1).contains(&pos) && !val.is_nil() {
            t.array.insert(pos - 1, val);
            t.migrate_from_hash();
            return;
        }
        for i in (pos.max(1)..=len).rev() {
            let moved = t.get(&LuaValue::Number(i as f64));
            t.set(LuaValue::Number((i + 1) as f64), moved);
        }
        t.set(LuaValue::Number(pos as f64), val);
    }

    /// Remove `t[pos]` (1-based), shifting `t[pos+1..=#t]` down by one.
    pub fn remove(&self, pos: usize) -> LuaValue {
        let mut t = self.borrow_mut();
        if (1..=t.array.len()).contains(&pos) {
            let removed = t.array.remove(pos - 1);
            t.trim_array();
            return removed;
        }
        let key = LuaValue::Number(pos as f64);
        let removed = t.get(&key);
        t.set(key, LuaValue::Nil);
        removed
    }

    /// The entry following `key` in traversal order (`Nil` starts).
    pub fn next(&self, key: &LuaValue) -> Result<Option<(LuaValue, LuaValue)>, LuaError> {
        self.borrow().next(key)
    }

    /// Remove every entry and the metatable.
    pub(crate) fn clear(&self) {
        let old = std::mem::take(&mut *self.borrow_mut());
        drop(old);
    }

    /// The first entry in traversal order, or `None` for an empty table.
    pub fn start(&self) -> Option<(LuaValue, LuaValue)> {
        self.borrow().next(&LuaValue::Nil).ok().flatten()
    }

    /// Snapshot of all present entries, array part first.
    pub fn pairs(&self) -> Vec<(LuaValue, LuaValue)> {
        let t = self.borrow();
        let array = t
            .array
            .iter()
            .enumerate()
            .filter(|(_, v)| !v.is_nil())
            .map(|(i, v)| (LuaValue::Number((i + 1) as f64), v.clone()));
        let hash = t.entries.iter().filter(|(_, v)| !v.is_nil()).cloned();
        array.chain(hash).collect()
    }

    pub fn metatable(&self) -> Option<LuaTable> {
        self.borrow().metatable.clone()
    }

    pub fn set_metatable(&self, metatable: Option<LuaTable>) {
        self.borrow_mut().metatable = metatable;
    }
}

impl PartialEq for LuaTable {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl std::fmt::Debug for LuaTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "LuaTable({:#x})", self.address())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn n(v: f64) -> LuaValue {
        LuaValue::Number(v)
    }

    #[test]
    fn sequential_writes_use_the_array_part() {
        let t = LuaTable::new();
        for i in 1..=5 {
            t.set_int(i, i * 10);
        }
        assert_eq!(t.len(), 5);
        assert_eq!(t.get_int(3), n(30.0));
        assert!(t.borrow().entries.is_empty());
    }

    #[test]
    fn out_of_order_keys_migrate_into_the_array() {
        let t = LuaTable::new();
        t.set_int(3, "c");
        t.set_int(2, "b");
        assert_eq!(t.len(), 0);
        t.set_int(1, "a");
        assert_eq!(t.len(), 3);
        assert_eq!(t.get_int(3), LuaValue::from("c"));
    }

    #[test]
    fn float_keys_normalise_to_integers() {
        let t = LuaTable::new();
        t.set(n(1.0), LuaValue::from("one")).unwrap();
        assert_eq!(t.get(&n(1.0)), LuaValue::from("one"));
        t.set(n(-0.0), LuaValue::from("zero")).unwrap();
        assert_eq!(t.get(&n(0.0)), LuaValue::from("zero"));
        t.set(n(1.5), LuaValue::from("frac")).unwrap();
        assert_eq!(t.get(&n(1.5)), LuaValue::from("frac"));
    }

    #[test]
    fn nil_and_nan_keys_are_rejected() {
        let t = LuaTable::new();
        let err = t.set(LuaValue::Nil, n(1.0)).unwrap_err();
        assert_eq!(err.to_string(), "table index is nil");
        let err = t.set(n(f64::NAN), n(1.0)).unwrap_err();
        assert_eq!(err.to_string(), "table index is NaN");
        assert_eq!(t.get(&LuaValue::Nil), LuaValue::Nil);
    }

    #[test]
    fn clearing_the_tail_shrinks_the_border() {
        let t = LuaTable::from_values([n(1.0), n(2.0), n(3.0)]);
        t.set_int(3, LuaValue::Nil);
        assert_eq!(t.len(), 2);
        t.set_int(2, LuaValue::Nil);
        t.set_int(1, LuaValue::Nil);
        assert_eq!(t.len(), 0);
        assert!(t.is_empty());
    }

    #[test]
    fn set_list_stops_the_array_at_a_hole() {
        let t = LuaTable::new();
        t.set_list(1, [n(1.0), LuaValue::Nil, n(3.0)]);
        assert_eq!(t.len(), 1);
        assert_eq!(t.get_int(3), n(3.0));
        t.set_list(2, [n(2.0)]);
        assert_eq!(t.len(), 3);
        assert!(t.borrow().array.iter().all(|v| !v.is_nil()));
    }

    #[test]
    fn interior_nil_moves_the_tail_to_the_hash_part() {
        let t = LuaTable::from_values((1..=5).map(|i| n(i as f64)));
        t.set_int(2, LuaValue::Nil);
        {
            let inner = t.borrow();
            assert_eq!(inner.array, vec![n(1.0)]);
            let hashed: Vec<_> = inner.entries.iter().map(|(k, _)| k.clone()).collect();
            assert_eq!(hashed, vec![n(3.0), n(4.0), n(5.0)]);
        }
        assert_eq!(t.len(), 1);
        assert_eq!(t.get_int(4), n(4.0));
        t.set_int(2, n(2.0));
        assert_eq!(t.len(), 5);
        assert!(t.borrow().entries.iter().all(|(_, v)| v.is_nil()));
    }

    #[test]
    fn clearing_array_keys_while_traversing_the_hash() {
        let t = LuaTable::from_values([n(1.0), n(2.0), n(3.0)]);
        t.set_field("x", true);
        let mut key = LuaValue::Nil;
        let mut seen = Vec::new();
        while let Some((k, _)) = t.next(&key).unwrap() {
            if k == LuaValue::from("x") {
                t.set_int(1, LuaValue::Nil);
            }
            seen.push(k.clone());
            key = k;
        }
        assert_eq!(seen, vec![n(1.0), n(2.0), n(3.0), LuaValue::from("x")]);

        let t = LuaTable::from_values([n(1.0), n(2.0), n(3.0), n(4.0)]);
        let mut key = LuaValue::Nil;
        let mut count = 0;
        while let Some((k, _)) = t.next(&key).unwrap() {
            t.set(k.clone(), LuaValue::Nil).unwrap();
            count += 1;
            key = k;
        }
        assert_eq!(count, 4);
        assert!(t.is_empty());
    }

    #[test]
    fn set_list_overrides_hashed_keys() {
        let t = LuaTable::new();
        t.set_int(2, "hashed");
        t.set_list(1, [n(1.0), LuaValue::Nil, n(3.0)]);
        assert_eq!(t.get_int(2), LuaValue::Nil);
        let keys: Vec<_> = t.pairs().into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec![n(1.0), n(3.0)]);
    }

    #[test]
    fn insert_and_remove_shift_elements() {
        let t = LuaTable::from_values([n(1.0), n(2.0), n(3.0)]);
        t.insert(1, n(0.0));
        assert_eq!(t.len(), 4);
        assert_eq!(t.get_int(1), n(0.0));
        assert_eq!(t.get_int(4), n(3.0));
        assert_eq!(t.remove(2), n(1.0));
        assert_eq!(t.len(), 3);
        assert_eq!(t.get_int(2), n(2.0));
        assert_eq!(t.remove(3), n(3.0));
        assert_eq!(t.len(), 2);
    }

    #[test]
    fn next_walks_array_then_hash() {
        let t = LuaTable::from_values([n(10.0), n(20.0)]);
        t.set_field("x", 1.0);
        t.set_int(5, 50.0);
        let mut key = LuaValue::Nil;
        let mut seen = Vec::new();
        while let Some((k, _)) = t.next(&key).unwrap() {
            seen.push(k.clone());
            key = k;
        }
        assert_eq!(seen, vec![n(1.0), n(2.0), LuaValue::from("x"), n(5.0)]);
        assert_eq!(t.start(), Some((n(1.0), n(10.0))));
        assert_eq!(LuaTable::new().start(), None);
    }

    #[test]
    fn clearing_during_traversal_is_allowed() {
        let t = LuaTable::new();
        for name in ["a", "b", "c", "d"] {
            t.set_field(name, true);
        }
        let mut key = LuaValue::Nil;
        let mut count = 0;
        while let Some((k, _)) = t.next(&key).unwrap() {
            t.set(k.clone(), LuaValue::Nil).unwrap();
            count += 1;
            key = k;
        }
        assert_eq!(count, 4);
        assert!(t.is_empty());
    }

    #[test]
    fn unknown_key_to_next_is_an_error() {
        let t = LuaTable::new();
        t.set_field("a", 1.0);
        let err = t.next(&LuaValue::from("zzz")).unwrap_err();
        assert_eq!(err.to_string(), "invalid key to 'next'");
    }

    #[test]
    fn tombstones_are_compacted_on_insert() {
        let t = LuaTable::new();
        for i in 0..20 {
            t.set_field(&format!("k{i}"), 1.0);
        }
        for i in 0..15 {
            t.set_field(&format!("k{i}"), LuaValue::Nil);
        }
        t.set_field("fresh", 2.0);
        assert!(t.borrow().entries.len() < 20);
        assert_eq!(t.get_field("k19"), n(1.0));
        assert_eq!(t.get_field("fresh"), n(2.0));
    }

    #[test]
    fn reference_keys_use_identity() {
        let t = LuaTable::new();
        let k1 = LuaValue::new_table();
        let k2 = LuaValue::new_table();
        t.set(k1.clone(), n(1.0)).unwrap();
        assert_eq!(t.get(&k1), n(1.0));
        assert_eq!(t.get(&k2), LuaValue::Nil);
    }
}
