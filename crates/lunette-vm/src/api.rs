//! The stack-based embedding API: type queries, coercions, table access
//! with metamethod dispatch, metatable management, loading, and calls.

use crate::arith::ArithOp;
use crate::coerce;
use crate::compare;
use crate::dispatch::{self, CallStatus};
use crate::error::{Control, VmError};
use crate::heap::{Closure, Upvalue};
use lunette_core::proto::Proto;
use lunette_core::string::StrId;
use lunette_core::value::{ClosureRef, Number, TableRef, ThreadRef, UserDataRef, Value};
use std::rc::Rc;

use crate::heap::HostFn;
use crate::state::State;

/// Bound on `__index`/`__newindex` chain traversal.
const MAX_META_CHAIN: usize = 100;

/// Comparison selector for the embedding `compare` operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Lt,
    Le,
}

impl State {
    // ---- Type queries and coercions ----

    pub fn type_name_at(&self, idx: i64) -> &'static str {
        if !self.is_valid(idx) {
            return "no value";
        }
        self.get(idx).type_name()
    }

    pub fn is_nil(&self, idx: i64) -> bool {
        self.get(idx).is_nil()
    }

    pub fn is_number(&self, idx: i64) -> bool {
        self.get(idx).is_number()
    }

    pub fn is_string_at(&self, idx: i64) -> bool {
        self.get(idx).is_string()
    }

    pub fn to_boolean(&self, idx: i64) -> bool {
        self.get(idx).is_truthy()
    }

    pub fn to_integer_x(&self, idx: i64) -> Option<i64> {
        coerce::to_integer(self.get(idx), &self.strings)
    }

    pub fn to_integer(&self, idx: i64) -> i64 {
        self.to_integer_x(idx).unwrap_or(0)
    }

    pub fn to_number_x(&self, idx: i64) -> Option<f64> {
        coerce::to_number(self.get(idx), &self.strings)
    }

    pub fn to_number(&self, idx: i64) -> f64 {
        self.to_number_x(idx).unwrap_or(0.0)
    }

    /// String coercion: strings pass through; numbers are rendered and the
    /// slot is replaced with the rendered string.
    pub fn to_str_id(&mut self, idx: i64) -> Option<StrId> {
        match self.get(idx) {
            Value::Str(s) => Some(s),
            Value::Number(n) => {
                let rendered = coerce::number_to_string(n);
                let id = self.strings.intern(rendered.as_bytes());
                self.set(idx, Value::Str(id));
                Some(id)
            }
            _ => None,
        }
    }

    pub fn to_rust_string(&mut self, idx: i64) -> Option<String> {
        let id = self.to_str_id(idx)?;
        Some(self.strings.to_display(id))
    }

    pub fn to_thread(&self, idx: i64) -> Option<ThreadRef> {
        match self.get(idx) {
            Value::Thread(t) => Some(t),
            _ => None,
        }
    }

    // ---- Push helpers ----

    pub fn push_nil(&mut self) {
        self.push(Value::Nil);
    }

    pub fn push_bool(&mut self, b: bool) {
        self.push(Value::Bool(b));
    }

    pub fn push_integer(&mut self, i: i64) {
        self.push(Value::integer(i));
    }

    pub fn push_float(&mut self, f: f64) {
        self.push(Value::float(f));
    }

    pub fn push_bytes(&mut self, bytes: &[u8]) {
        let id = self.strings.intern(bytes);
        self.push(Value::Str(id));
    }

    pub fn push_str(&mut self, s: &str) {
        self.push_bytes(s.as_bytes());
    }

    pub fn push_host_fn(&mut self, f: HostFn) {
        let c = self.heap.new_closure(Closure::Host {
            func: f,
            upvals: Vec::new(),
        });
        self.push(Value::Closure(c));
    }

    /// Pop `n` values into closed upvalue cells owned by the new host
    /// closure; the bottommost popped value becomes upvalue 1.
    pub fn push_host_closure(&mut self, f: HostFn, n: usize) {
        let vals = self.pop_n(n);
        let upvals = vals
            .into_iter()
            .map(|v| self.heap.new_upval(Upvalue::Closed(v)))
            .collect();
        let c = self.heap.new_closure(Closure::Host { func: f, upvals });
        self.push(Value::Closure(c));
    }

    pub fn push_current_thread(&mut self) -> bool {
        let cur = self.current;
        self.push(Value::Thread(cur));
        cur == self.main
    }

    // ---- Table construction and raw access ----

    pub fn new_table(&mut self) -> TableRef {
        self.create_table(0, 0)
    }

    /// Fresh table with capacity hints, pushed onto the stack.
    pub fn create_table(&mut self, narr: usize, nrec: usize) -> TableRef {
        let t = self.heap.new_table(narr, nrec);
        self.push(Value::Table(t));
        t
    }

    fn table_at(&self, idx: i64) -> Result<TableRef, Control> {
        match self.get(idx) {
            Value::Table(t) => Ok(t),
            v => Err(self.error_where(VmError::TypeMismatch(format!(
                "table expected, got {}",
                v.type_name()
            )))),
        }
    }

    /// `t[k]` without metamethods; key popped, value pushed.
    pub fn raw_get(&mut self, idx: i64) -> Result<(), Control> {
        let t = self.table_at(idx)?;
        let k = self.pop();
        let v = self.heap.table(t).get(k);
        self.push(v);
        Ok(())
    }

    pub fn raw_get_i(&mut self, idx: i64, i: i64) -> Result<(), Control> {
        let t = self.table_at(idx)?;
        let v = self.heap.table(t).get_int(i);
        self.push(v);
        Ok(())
    }

    /// `t[k] = v` without metamethods; value then key popped.
    pub fn raw_set(&mut self, idx: i64) -> Result<(), Control> {
        let t = self.table_at(idx)?;
        let v = self.pop();
        let k = self.pop();
        self.check_table_key(k)?;
        self.heap.table_mut(t).set(k, v);
        Ok(())
    }

    pub fn raw_set_i(&mut self, idx: i64, i: i64) -> Result<(), Control> {
        let t = self.table_at(idx)?;
        let v = self.pop();
        self.heap.table_mut(t).set_int(i, v);
        Ok(())
    }

    pub fn raw_len(&self, idx: i64) -> i64 {
        match self.get(idx) {
            Value::Table(t) => self.heap.table(t).length(),
            Value::Str(s) => self.strings.get(s).len() as i64,
            _ => 0,
        }
    }

    fn check_table_key(&self, k: Value) -> Result<(), Control> {
        if k.is_nil() {
            return Err(self.error_where(VmError::Index("table index is nil".to_string())));
        }
        if matches!(k, Value::Number(Number::Float(f)) if f.is_nan()) {
            return Err(self.error_where(VmError::Index("table index is NaN".to_string())));
        }
        Ok(())
    }

    // ---- Metamethod-aware table access ----

    /// `t[k]` following the `__index` chain.
    pub(crate) fn table_get_value(&mut self, t: Value, k: Value) -> Result<Value, Control> {
        let index_name = self.names.index;
        let mut t = t;
        for _ in 0..MAX_META_CHAIN {
            if let Value::Table(tr) = t {
                let raw = self.heap.table(tr).get(k);
                if !raw.is_nil() {
                    return Ok(raw);
                }
                let mi = self.get_metafield(t, index_name);
                match mi {
                    Value::Nil => return Ok(Value::Nil),
                    Value::Closure(_) => return self.call_meta_2(mi, t, k),
                    other => t = other,
                }
            } else {
                let mi = self.get_metafield(t, index_name);
                match mi {
                    Value::Nil => {
                        return Err(self.error_where(VmError::Index(format!(
                            "attempt to index a {} value",
                            t.type_name()
                        ))))
                    }
                    Value::Closure(_) => return self.call_meta_2(mi, t, k),
                    other => t = other,
                }
            }
        }
        Err(self.error_where(VmError::Index("'__index' chain too long; possible loop".to_string())))
    }

    /// `t[k] = v` following the `__newindex` chain.
    pub(crate) fn table_set_value(
        &mut self,
        t: Value,
        k: Value,
        v: Value,
    ) -> Result<(), Control> {
        let newindex_name = self.names.newindex;
        let mut t = t;
        for _ in 0..MAX_META_CHAIN {
            if let Value::Table(tr) = t {
                let existing = self.heap.table(tr).get(k);
                let has_meta = !self.get_metafield(t, newindex_name).is_nil();
                if !existing.is_nil() || !has_meta {
                    self.check_table_key(k)?;
                    self.heap.table_mut(tr).set(k, v);
                    return Ok(());
                }
            }
            let mf = self.get_metafield(t, newindex_name);
            match mf {
                Value::Nil => {
                    return Err(self.error_where(VmError::Index(format!(
                        "attempt to index a {} value",
                        t.type_name()
                    ))))
                }
                Value::Closure(_) => {
                    self.check_stack(4)?;
                    self.push(mf);
                    self.push(t);
                    self.push(k);
                    self.push(v);
                    dispatch::do_call(self, 3, 0, false)?;
                    return Ok(());
                }
                other => t = other,
            }
        }
        Err(self.error_where(VmError::Index("'__newindex' chain too long; possible loop".to_string())))
    }

    /// Pop a key, push `t[k]`.
    pub fn get_table(&mut self, idx: i64) -> Result<(), Control> {
        let t = self.get(idx);
        let k = self.pop();
        let v = self.table_get_value(t, k)?;
        self.push(v);
        Ok(())
    }

    pub fn get_field(&mut self, idx: i64, name: &str) -> Result<(), Control> {
        let t = self.get(idx);
        let k = Value::Str(self.strings.intern(name.as_bytes()));
        let v = self.table_get_value(t, k)?;
        self.push(v);
        Ok(())
    }

    pub fn get_i(&mut self, idx: i64, i: i64) -> Result<(), Control> {
        let t = self.get(idx);
        let v = self.table_get_value(t, Value::integer(i))?;
        self.push(v);
        Ok(())
    }

    /// Pop value then key, perform `t[k] = v`.
    pub fn set_table(&mut self, idx: i64) -> Result<(), Control> {
        let t = self.get(idx);
        let v = self.pop();
        let k = self.pop();
        self.table_set_value(t, k, v)
    }

    pub fn set_field(&mut self, idx: i64, name: &str) -> Result<(), Control> {
        let t = self.get(idx);
        let v = self.pop();
        let k = Value::Str(self.strings.intern(name.as_bytes()));
        self.table_set_value(t, k, v)
    }

    pub fn set_i(&mut self, idx: i64, i: i64) -> Result<(), Control> {
        let t = self.get(idx);
        let v = self.pop();
        self.table_set_value(t, Value::integer(i), v)
    }

    /// Pop a key, push the next key/value pair; false at the end of the
    /// traversal.
    pub fn next(&mut self, idx: i64) -> Result<bool, Control> {
        let t = self.table_at(idx)?;
        let k = self.pop();
        match self.heap.table(t).next(k) {
            Ok(Some((nk, nv))) => {
                self.check_stack(2)?;
                self.push(nk);
                self.push(nv);
                Ok(true)
            }
            Ok(None) => Ok(false),
            Err(()) => {
                Err(self.error_where(VmError::Runtime("invalid key to 'next'".to_string())))
            }
        }
    }

    // ---- Globals ----

    pub fn get_global(&mut self, name: &str) -> Result<(), Control> {
        let g = Value::Table(self.globals());
        let k = Value::Str(self.strings.intern(name.as_bytes()));
        let v = self.table_get_value(g, k)?;
        self.push(v);
        Ok(())
    }

    /// Pop a value and store it as a global.
    pub fn set_global(&mut self, name: &str) -> Result<(), Control> {
        let g = Value::Table(self.globals());
        let v = self.pop();
        let k = Value::Str(self.strings.intern(name.as_bytes()));
        self.table_set_value(g, k, v)
    }

    pub fn push_global_table(&mut self) {
        let g = self.globals();
        self.push(Value::Table(g));
    }

    /// Install a host function as a global.
    pub fn register(&mut self, name: &str, f: HostFn) -> Result<(), Control> {
        self.push_host_fn(f);
        self.set_global(name)
    }

    // ---- Metatable API ----

    /// Push the metatable of the value at `idx`; false (nothing pushed) if
    /// it has none.
    pub fn get_metatable(&mut self, idx: i64) -> bool {
        let v = self.get(idx);
        match self.metatable_of(v) {
            Some(mt) => {
                self.push(Value::Table(mt));
                true
            }
            None => false,
        }
    }

    /// Pop a table (or nil) and install it as the metatable of the value at
    /// `idx`.
    pub fn set_metatable(&mut self, idx: i64) -> Result<(), Control> {
        let v = self.get(idx);
        let mt = self.pop();
        let mt = match mt {
            Value::Nil => None,
            Value::Table(t) => Some(t),
            other => {
                return Err(self.error_where(VmError::TypeMismatch(format!(
                    "nil or table expected, got {}",
                    other.type_name()
                ))))
            }
        };
        self.set_metatable_of(v, mt);
        Ok(())
    }

    /// Push the named metafield of the value at `idx`; false when absent.
    pub fn get_metafield_at(&mut self, idx: i64, name: &str) -> bool {
        let v = self.get(idx);
        let key = self.strings.intern(name.as_bytes());
        let mf = self.get_metafield(v, key);
        if mf.is_nil() {
            false
        } else {
            self.push(mf);
            true
        }
    }

    /// If the value at `idx` has the named metamethod, call it with the
    /// value as sole argument and leave the result on top.
    pub fn call_meta(&mut self, idx: i64, name: &str) -> Result<bool, Control> {
        let idx = self.abs_index(idx);
        let v = self.get(idx);
        let key = self.strings.intern(name.as_bytes());
        let mf = self.get_metafield(v, key);
        if mf.is_nil() {
            return Ok(false);
        }
        self.check_stack(2)?;
        self.push(mf);
        self.push(v);
        dispatch::do_call(self, 1, 1, false)?;
        Ok(true)
    }

    /// Invoke a metamethod with two arguments and one result.
    pub(crate) fn call_meta_2(&mut self, mm: Value, a: Value, b: Value) -> Result<Value, Control> {
        self.check_stack(4)?;
        self.push(mm);
        self.push(a);
        self.push(b);
        dispatch::do_call(self, 2, 1, false)?;
        Ok(self.pop())
    }

    // ---- Operators ----

    /// Pop the operands (one for unary ops), apply the operator with
    /// metamethod fallback, push the result.
    pub fn arith(&mut self, op: ArithOp) -> Result<(), Control> {
        let (a, b) = if op.is_unary() {
            let a = self.pop();
            (a, a)
        } else {
            let b = self.pop();
            let a = self.pop();
            (a, b)
        };
        match crate::arith::raw_arith(op, a, b, &self.strings) {
            Ok(Some(v)) => {
                self.push(v);
                Ok(())
            }
            Ok(None) => {
                let name = self.names.arith_name(op);
                let mm = self.binary_metamethod(name, a, b);
                if mm.is_nil() {
                    let blame = if coerce::to_number(a, &self.strings).is_none() {
                        a
                    } else {
                        b
                    };
                    return Err(self.error_where(VmError::Arith(format!(
                        "attempt to perform arithmetic on a {} value",
                        blame.type_name()
                    ))));
                }
                let r = self.call_meta_2(mm, a, b)?;
                self.push(r);
                Ok(())
            }
            Err(e) => Err(self.error_where(e)),
        }
    }

    /// Compare two stack positions with metamethod fallback.
    pub fn compare(&mut self, i1: i64, i2: i64, op: CompareOp) -> Result<bool, Control> {
        let a = self.get(i1);
        let b = self.get(i2);
        match op {
            CompareOp::Eq => self.value_eq(a, b),
            CompareOp::Lt => self.value_lt(a, b),
            CompareOp::Le => self.value_le(a, b),
        }
    }

    pub fn raw_equal(&self, i1: i64, i2: i64) -> bool {
        compare::raw_eq(self.get(i1), self.get(i2))
    }

    pub(crate) fn value_eq(&mut self, a: Value, b: Value) -> Result<bool, Control> {
        if compare::raw_eq(a, b) {
            return Ok(true);
        }
        let both_tables = a.is_table() && b.is_table();
        let both_userdata =
            matches!(a, Value::UserData(_)) && matches!(b, Value::UserData(_));
        if !(both_tables || both_userdata) {
            return Ok(false);
        }
        let eq_name = self.names.eq;
        let mm = self.binary_metamethod(eq_name, a, b);
        if mm.is_nil() {
            return Ok(false);
        }
        let r = self.call_meta_2(mm, a, b)?;
        Ok(r.is_truthy())
    }

    pub(crate) fn value_lt(&mut self, a: Value, b: Value) -> Result<bool, Control> {
        if let Some(r) = compare::lt(a, b, &self.strings) {
            return Ok(r);
        }
        let lt_name = self.names.lt;
        let mm = self.binary_metamethod(lt_name, a, b);
        if !mm.is_nil() {
            let r = self.call_meta_2(mm, a, b)?;
            return Ok(r.is_truthy());
        }
        Err(self.compare_error(a, b))
    }

    pub(crate) fn value_le(&mut self, a: Value, b: Value) -> Result<bool, Control> {
        if let Some(r) = compare::le(a, b, &self.strings) {
            return Ok(r);
        }
        let le_name = self.names.le;
        let mm = self.binary_metamethod(le_name, a, b);
        if !mm.is_nil() {
            let r = self.call_meta_2(mm, a, b)?;
            return Ok(r.is_truthy());
        }
        // Fall back to `not (b < a)` through `__lt` with swapped operands.
        let lt_name = self.names.lt;
        let mm = self.binary_metamethod(lt_name, a, b);
        if !mm.is_nil() {
            let r = self.call_meta_2(mm, b, a)?;
            return Ok(r.is_falsy());
        }
        Err(self.compare_error(a, b))
    }

    fn compare_error(&self, a: Value, b: Value) -> Control {
        self.error_where(VmError::TypeMismatch(format!(
            "attempt to compare {} with {}",
            a.type_name(),
            b.type_name()
        )))
    }

    /// Push the length of the value at `idx`: byte count for strings,
    /// `__len` when present, otherwise a table border.
    pub fn len_of(&mut self, idx: i64) -> Result<(), Control> {
        let v = self.get(idx);
        if let Value::Str(s) = v {
            let n = self.strings.get(s).len() as i64;
            self.push(Value::integer(n));
            return Ok(());
        }
        let len_name = self.names.len;
        let mm = self.get_metafield(v, len_name);
        if !mm.is_nil() {
            let r = self.call_meta_2(mm, v, v)?;
            self.push(r);
            return Ok(());
        }
        if let Value::Table(t) = v {
            let n = self.heap.table(t).length();
            self.push(Value::integer(n));
            return Ok(());
        }
        Err(self.error_where(VmError::TypeMismatch(format!(
            "attempt to get length of a {} value",
            v.type_name()
        ))))
    }

    /// Concatenate the top `n` values, right-to-left pairwise, with
    /// `__concat` fallback. Leaves a single value.
    pub fn concat_n(&mut self, n: usize) -> Result<(), Control> {
        if n == 0 {
            let id = self.strings.intern(b"");
            self.push(Value::Str(id));
            return Ok(());
        }
        let mut remaining = n;
        while remaining > 1 {
            let b = self.get(-1);
            let a = self.get(-2);
            if concatable(a) && concatable(b) {
                let mut buf = self.concat_bytes(a);
                buf.extend_from_slice(&self.concat_bytes(b));
                let id = self.strings.intern(&buf);
                self.pop();
                self.pop();
                self.push(Value::Str(id));
            } else {
                let concat_name = self.names.concat;
                let mm = self.binary_metamethod(concat_name, a, b);
                if mm.is_nil() {
                    let blame = if concatable(a) { b } else { a };
                    return Err(self.error_where(VmError::Arith(format!(
                        "attempt to concatenate a {} value",
                        blame.type_name()
                    ))));
                }
                let r = self.call_meta_2(mm, a, b)?;
                self.pop();
                self.pop();
                self.push(r);
            }
            remaining -= 1;
        }
        Ok(())
    }

    fn concat_bytes(&self, v: Value) -> Vec<u8> {
        match v {
            Value::Str(s) => self.strings.get(s).to_vec(),
            Value::Number(num) => coerce::number_to_string(num).into_bytes(),
            _ => unreachable!("concat_bytes on non-concatable value"),
        }
    }

    // ---- Loading and calling ----

    /// Load a textual chunk through the external compiler collaborator and
    /// push the resulting closure. Compiler rejections surface as syntax
    /// errors.
    pub fn load_chunk<F>(
        &mut self,
        chunk: &[u8],
        chunk_name: &str,
        compile: F,
    ) -> Result<ClosureRef, VmError>
    where
        F: FnOnce(&[u8], &str) -> Result<Proto, String>,
    {
        match compile(chunk, chunk_name) {
            Ok(p) => Ok(self.load(Rc::new(p))),
            Err(msg) => Err(VmError::Syntax(msg)),
        }
    }

    /// Load a chunk from a file.
    pub fn load_file<F>(&mut self, path: &str, compile: F) -> Result<ClosureRef, VmError>
    where
        F: FnOnce(&[u8], &str) -> Result<Proto, String>,
    {
        let data = std::fs::read(path)
            .map_err(|e| VmError::File(format!("cannot open {path}: {e}")))?;
        self.load_chunk(&data, &format!("@{path}"), compile)
    }

    /// Push a closure over a compiled prototype. When the prototype captures
    /// upvalues, the first one is bound to the globals table, matching how
    /// chunks receive their environment.
    pub fn load(&mut self, proto: Rc<Proto>) -> ClosureRef {
        let mut upvals = Vec::with_capacity(proto.upvalues.len());
        if !proto.upvalues.is_empty() {
            let g = Value::Table(self.globals());
            upvals.push(self.heap.new_upval(Upvalue::Closed(g)));
            for _ in 1..proto.upvalues.len() {
                upvals.push(self.heap.new_upval(Upvalue::Closed(Value::Nil)));
            }
        }
        let c = self.heap.new_closure(Closure::Script { proto, upvals });
        self.push(Value::Closure(c));
        c
    }

    /// Unprotected call: pops the callable and `nargs` arguments, pushes up
    /// to `nresults` results (-1 keeps them all). Errors unwind back to the
    /// pre-call frame before surfacing.
    pub fn call(&mut self, nargs: usize, nresults: i64) -> Result<(), VmError> {
        let depth = self.cur_frames_len();
        match dispatch::do_call(self, nargs, nresults, false) {
            Ok(CallStatus::Done) => Ok(()),
            Ok(CallStatus::Yielded(_)) => {
                unreachable!("yield surfaced from a non-resuming call")
            }
            Err(Control::Error(e)) => {
                self.unwind_current(depth);
                Err(e)
            }
            Err(Control::Yield(_)) => {
                unreachable!("yield signal escaped do_call")
            }
        }
    }

    /// Protected call. On failure the frames below the caller are unwound
    /// (closing their open upvalues), the caller's stack is restored to its
    /// pre-call shape, and the error value alone is pushed. A non-zero
    /// message-handler index is accepted and ignored.
    pub fn pcall(&mut self, nargs: usize, nresults: i64, _msgh: i64) -> Result<(), VmError> {
        let depth = self.cur_frames_len();
        let base_top = self.get_top() - (nargs + 1);
        match dispatch::do_call(self, nargs, nresults, false) {
            Ok(CallStatus::Done) => Ok(()),
            Ok(CallStatus::Yielded(_)) => {
                unreachable!("yield surfaced from a non-resuming call")
            }
            Err(Control::Error(e)) => {
                self.unwind_current(depth);
                self.frame_mut().set_top(base_top);
                let v = e.to_value(&mut self.strings);
                self.push(v);
                Err(e)
            }
            Err(Control::Yield(_)) => {
                unreachable!("yield signal escaped do_call")
            }
        }
    }

    /// Raise: pop the error value from the stack and start unwinding.
    pub fn raise_from_stack(&mut self) -> Control {
        let v = self.pop();
        Control::Error(match v {
            Value::Str(s) => VmError::Runtime(self.strings.to_display(s)),
            other => VmError::Thrown(other),
        })
    }

    // ---- Userdata ----

    pub fn new_userdata(&mut self, data: Box<dyn std::any::Any>) -> UserDataRef {
        let u = self.heap.new_userdata(data);
        self.push(Value::UserData(u));
        u
    }
}

fn concatable(v: Value) -> bool {
    v.is_string() || v.is_number()
}
