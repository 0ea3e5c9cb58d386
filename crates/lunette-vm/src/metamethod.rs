//! Metatable lookup.
//!
//! Tables and userdata carry their own metatable slot; every other type
//! shares a per-type metatable stored in the registry under a `_MT<tag>`
//! string key.

use crate::arith::{ArithOp, OPERATORS};
use crate::state::State;
use lunette_core::string::{Interner, StrId};
use lunette_core::value::{TableRef, Value};

/// Pre-interned metamethod and registry key names.
pub struct MetaNames {
    pub index: StrId,
    pub newindex: StrId,
    pub call: StrId,
    pub eq: StrId,
    pub lt: StrId,
    pub le: StrId,
    pub len: StrId,
    pub concat: StrId,
    /// Aligned with `ArithOp` discriminants.
    pub arith: [StrId; 14],
    /// `_MT<tag>` registry keys, indexed by `Value::type_tag`.
    pub type_mt: [StrId; 8],
}

impl MetaNames {
    pub fn init(strings: &mut Interner) -> MetaNames {
        let arith = std::array::from_fn(|i| strings.intern(OPERATORS[i].metamethod.as_bytes()));
        let type_mt = std::array::from_fn(|tag| strings.intern(format!("_MT{tag}").as_bytes()));
        MetaNames {
            index: strings.intern(b"__index"),
            newindex: strings.intern(b"__newindex"),
            call: strings.intern(b"__call"),
            eq: strings.intern(b"__eq"),
            lt: strings.intern(b"__lt"),
            le: strings.intern(b"__le"),
            len: strings.intern(b"__len"),
            concat: strings.intern(b"__concat"),
            arith,
            type_mt,
        }
    }

    pub fn arith_name(&self, op: ArithOp) -> StrId {
        self.arith[op as usize]
    }
}

impl State {
    /// The metatable governing a value, if any.
    pub fn metatable_of(&self, v: Value) -> Option<TableRef> {
        match v {
            Value::Table(t) => self.heap.table(t).metatable,
            Value::UserData(u) => self.heap.userdata(u).metatable,
            other => {
                let key = self.names.type_mt[other.type_tag() as usize];
                self.heap.table(self.registry).get_str(key).as_table_ref()
            }
        }
    }

    /// Install (or clear) the metatable governing a value.
    pub fn set_metatable_of(&mut self, v: Value, mt: Option<TableRef>) {
        let mt_val = match mt {
            Some(t) => Value::Table(t),
            None => Value::Nil,
        };
        match v {
            Value::Table(t) => self.heap.table_mut(t).metatable = mt,
            Value::UserData(u) => self.heap.userdata_mut(u).metatable = mt,
            other => {
                let key = self.names.type_mt[other.type_tag() as usize];
                self.heap.table_mut(self.registry).set_str(key, mt_val);
            }
        }
    }

    /// A named field of the value's metatable, or nil.
    pub fn get_metafield(&self, v: Value, name: StrId) -> Value {
        match self.metatable_of(v) {
            Some(mt) => self.heap.table(mt).get_str(name),
            None => Value::Nil,
        }
    }

    /// The metamethod for a binary operation: the first operand's wins.
    pub(crate) fn binary_metamethod(&self, name: StrId, a: Value, b: Value) -> Value {
        let mm = self.get_metafield(a, name);
        if mm.is_nil() {
            self.get_metafield(b, name)
        } else {
            mm
        }
    }
}
