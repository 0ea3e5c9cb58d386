//! Hybrid array+hash table.
//!
//! Integer keys in `[1, len]` live in a dense array part; everything else
//! lives in an insertion-order-preserving hash part. The hash order is what
//! carries the `next` iteration contract: a traversal seeded with nil visits
//! every live pair exactly once as long as no keys are inserted meanwhile.
//! Deleting the current key is allowed: hash deletions of existing keys
//! leave a nil tombstone that `next` skips, so the successor is still
//! reachable.

use crate::string::StrId;
use crate::value::{exact_int, ClosureRef, TableRef, ThreadRef, UserDataRef, Value};
use indexmap::IndexMap;

/// A key in the hash part. Float keys with an exact integer value are
/// normalized to `Int` so `t[2]` and `t[2.0]` address the same slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TableKey {
    Int(i64),
    Str(StrId),
    /// Raw bits of a float key (never NaN, never an exact integer).
    Float(u64),
    Bool(bool),
    Table(TableRef),
    Closure(ClosureRef),
    UserData(UserDataRef),
    Thread(ThreadRef),
}

/// Convert a value to a hash key. Nil and NaN have no key form.
pub fn value_to_key(v: Value) -> Option<TableKey> {
    match v {
        Value::Nil => None,
        Value::Bool(b) => Some(TableKey::Bool(b)),
        Value::Number(n) => {
            let f = match n {
                crate::value::Number::Int(i) => return Some(TableKey::Int(i)),
                crate::value::Number::Float(f) => f,
            };
            if f.is_nan() {
                return None;
            }
            match exact_int(f) {
                Some(i) => Some(TableKey::Int(i)),
                None => Some(TableKey::Float(f.to_bits())),
            }
        }
        Value::Str(s) => Some(TableKey::Str(s)),
        Value::Table(t) => Some(TableKey::Table(t)),
        Value::Closure(c) => Some(TableKey::Closure(c)),
        Value::UserData(u) => Some(TableKey::UserData(u)),
        Value::Thread(t) => Some(TableKey::Thread(t)),
    }
}

/// Convert a hash key back to the value handed out by iteration.
pub fn key_to_value(k: TableKey) -> Value {
    match k {
        TableKey::Int(i) => Value::integer(i),
        TableKey::Str(s) => Value::Str(s),
        TableKey::Float(bits) => Value::float(f64::from_bits(bits)),
        TableKey::Bool(b) => Value::Bool(b),
        TableKey::Table(t) => Value::Table(t),
        TableKey::Closure(c) => Value::Closure(c),
        TableKey::UserData(u) => Value::UserData(u),
        TableKey::Thread(t) => Value::Thread(t),
    }
}

pub struct Table {
    /// Array part; `array[0]` is key 1.
    array: Vec<Value>,
    hash: IndexMap<TableKey, Value>,
    pub metatable: Option<TableRef>,
}

impl Table {
    pub fn new(array_hint: usize, hash_hint: usize) -> Self {
        Table {
            array: Vec::with_capacity(array_hint),
            hash: IndexMap::with_capacity(hash_hint),
            metatable: None,
        }
    }

    /// Raw get. Missing keys (and nil/NaN keys) return nil; metatable
    /// dispatch happens in the VM layer above.
    pub fn get(&self, key: Value) -> Value {
        let tk = match value_to_key(key) {
            Some(tk) => tk,
            None => return Value::Nil,
        };
        if let TableKey::Int(i) = tk {
            if i >= 1 && (i as usize) <= self.array.len() {
                return self.array[(i - 1) as usize];
            }
        }
        self.hash.get(&tk).copied().unwrap_or(Value::Nil)
    }

    /// Raw set. Nil and NaN keys fail silently here; the VM layer raises
    /// before calling. Writing nil deletes.
    pub fn set(&mut self, key: Value, val: Value) {
        let tk = match value_to_key(key) {
            Some(tk) => tk,
            None => return,
        };
        self.set_key(tk, val);
    }

    fn set_key(&mut self, tk: TableKey, val: Value) {
        if let TableKey::Int(i) = tk {
            if i >= 1 {
                let arr_len = self.array.len() as i64;
                if i <= arr_len {
                    self.array[(i - 1) as usize] = val;
                    if i == arr_len && val.is_nil() {
                        self.shrink_array();
                    }
                    return;
                }
                if i == arr_len + 1 {
                    // Key may also exist in the hash part from before the
                    // array grew this far.
                    self.hash.shift_remove(&tk);
                    if !val.is_nil() {
                        self.array.push(val);
                        self.expand_array();
                    }
                    return;
                }
            }
        }
        if val.is_nil() {
            // Tombstone existing keys so an in-flight traversal can still
            // find its successor; never insert a key that was absent.
            if self.hash.contains_key(&tk) {
                self.hash.insert(tk, Value::Nil);
            }
        } else {
            self.hash.insert(tk, val);
        }
    }

    /// Fast path for integer keys.
    pub fn get_int(&self, key: i64) -> Value {
        if key >= 1 && (key as usize) <= self.array.len() {
            self.array[(key - 1) as usize]
        } else {
            self.hash
                .get(&TableKey::Int(key))
                .copied()
                .unwrap_or(Value::Nil)
        }
    }

    pub fn set_int(&mut self, key: i64, val: Value) {
        self.set_key(TableKey::Int(key), val);
    }

    /// Fast path for string keys.
    pub fn get_str(&self, key: StrId) -> Value {
        self.hash
            .get(&TableKey::Str(key))
            .copied()
            .unwrap_or(Value::Nil)
    }

    pub fn set_str(&mut self, key: StrId, val: Value) {
        self.set_key(TableKey::Str(key), val);
    }

    /// The length operator's border: an `n` with `t[n] ~= nil` and
    /// `t[n+1] == nil`. When the array part ends in nils, a binary search
    /// locates one of the borders.
    pub fn length(&self) -> i64 {
        if self.array.is_empty() {
            return 0;
        }
        if !self.array.last().unwrap().is_nil() {
            return self.array.len() as i64;
        }
        let mut lo = 0usize;
        let mut hi = self.array.len();
        while lo < hi {
            let mid = (lo + hi) / 2;
            if self.array[mid].is_nil() {
                hi = mid;
            } else {
                lo = mid + 1;
            }
        }
        lo as i64
    }

    /// Next live pair after `key`; nil seeds the traversal. `Err(())` means
    /// the key was never in the table.
    #[allow(clippy::result_unit_err)]
    pub fn next(&self, key: Value) -> Result<Option<(Value, Value)>, ()> {
        if key.is_nil() {
            return Ok(self.first_from_array(0));
        }
        if let Some(TableKey::Int(i)) = value_to_key(key) {
            if i >= 1 && (i as usize) <= self.array.len() {
                return Ok(self.first_from_array(i as usize));
            }
        }
        let tk = match value_to_key(key) {
            Some(tk) => tk,
            None => return Err(()),
        };
        let idx = match self.hash.get_index_of(&tk) {
            Some(idx) => idx,
            None => {
                // An array key whose trailing run was deleted out from under
                // the traversal: the array part is exhausted, continue into
                // the hash part.
                if matches!(tk, TableKey::Int(i) if i >= 1) {
                    return Ok(self.first_from_hash(0));
                }
                return Err(());
            }
        };
        Ok(self.first_from_hash(idx + 1))
    }

    /// First non-nil array element at or after `start` (0-based), falling
    /// through into the hash part.
    fn first_from_array(&self, start: usize) -> Option<(Value, Value)> {
        for (j, v) in self.array.iter().enumerate().skip(start) {
            if !v.is_nil() {
                return Some((Value::integer((j + 1) as i64), *v));
            }
        }
        self.first_from_hash(0)
    }

    fn first_from_hash(&self, start: usize) -> Option<(Value, Value)> {
        for idx in start..self.hash.len() {
            let (&k, &v) = self.hash.get_index(idx).unwrap();
            if !v.is_nil() {
                return Some((key_to_value(k), v));
            }
        }
        None
    }

    /// Drop the trailing nil run after the border element was deleted.
    fn shrink_array(&mut self) {
        while self.array.last().is_some_and(|v| v.is_nil()) {
            self.array.pop();
        }
    }

    /// After an append, drain hash entries keyed by the successive integers
    /// into the array part.
    fn expand_array(&mut self) {
        loop {
            let next_key = TableKey::Int(self.array.len() as i64 + 1);
            match self.hash.shift_remove(&next_key) {
                Some(v) if !v.is_nil() => self.array.push(v),
                // A tombstone ends the run just like an absent key.
                _ => break,
            }
        }
    }

    /// Current extent of the array part (not the border).
    pub fn array_len(&self) -> usize {
        self.array.len()
    }

    /// Live entry count across both parts (tombstones excluded).
    pub fn live_len(&self) -> usize {
        self.array.iter().filter(|v| !v.is_nil()).count()
            + self.hash.values().filter(|v| !v.is_nil()).count()
    }
}

impl std::fmt::Debug for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "table(array={}, hash={})",
            self.array.len(),
            self.hash.len()
        )
    }
}
