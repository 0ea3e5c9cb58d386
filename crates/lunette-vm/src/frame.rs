//! Per-call activation records.
//!
//! Each call owns its slot vector. Registers are stack positions
//! `1..=max_stack_size` from the frame base; positive embedding indices are
//! base-relative, negative ones count down from the top.

use lunette_core::value::{ClosureRef, UpvalRef, Value};
use std::collections::HashMap;

/// Guaranteed free slots past the register window of every frame.
pub const MIN_STACK: usize = 20;

/// How a frame's results are delivered to its caller when it returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetMode {
    /// Push onto the caller's stack top (embedding calls, coroutine bodies).
    Stack,
    /// Move into the caller's registers starting at this 1-based position
    /// (the CALL family). A negative wanted count leaves the results on top
    /// followed by the position marker the next variadic consumer fixes up.
    Register(usize),
}

pub struct Frame {
    pub slots: Vec<Value>,
    /// Number of occupied positions; position `top` is the topmost value.
    pub top: usize,
    pub pc: usize,
    pub closure: Option<ClosureRef>,
    /// Register window width (0 for host and base frames).
    pub nregs: usize,
    /// Extra actuals captured by a variadic prototype.
    pub varargs: Vec<Value>,
    /// Open upvalues over this frame, keyed by 0-based slot.
    pub open_upvals: HashMap<usize, UpvalRef>,
    pub ret: RetMode,
    pub want: i64,
}

impl Frame {
    pub fn new(capacity: usize) -> Frame {
        Frame {
            slots: vec![Value::Nil; capacity],
            top: 0,
            pc: 0,
            closure: None,
            nregs: 0,
            varargs: Vec::new(),
            open_upvals: HashMap::new(),
            ret: RetMode::Stack,
            want: -1,
        }
    }

    #[inline]
    pub fn push(&mut self, v: Value) {
        if self.top == self.slots.len() {
            self.slots.push(Value::Nil);
        }
        self.slots[self.top] = v;
        self.top += 1;
    }

    #[inline]
    pub fn pop(&mut self) -> Value {
        assert!(self.top > 0, "stack underflow");
        self.top -= 1;
        std::mem::replace(&mut self.slots[self.top], Value::Nil)
    }

    /// Pop `n` values, returned bottom-to-top.
    pub fn pop_n(&mut self, n: usize) -> Vec<Value> {
        assert!(n <= self.top, "stack underflow");
        let mut out = Vec::with_capacity(n);
        for i in self.top - n..self.top {
            out.push(std::mem::replace(&mut self.slots[i], Value::Nil));
        }
        self.top -= n;
        out
    }

    /// Push exactly `n` values from `vals`, padding with nil or truncating.
    /// `n < 0` means all of them.
    pub fn push_n(&mut self, vals: &[Value], n: i64) {
        let n = if n < 0 { vals.len() } else { n as usize };
        for i in 0..n {
            self.push(vals.get(i).copied().unwrap_or(Value::Nil));
        }
    }

    /// Convert a negative index to its positive form. Sentinel indices at or
    /// below the registry index pass through.
    #[inline]
    pub fn abs_index(&self, idx: i64) -> i64 {
        if idx >= 0 || idx <= crate::state::REGISTRY_INDEX {
            idx
        } else {
            idx + self.top as i64 + 1
        }
    }

    /// Whether an index names an occupied position.
    #[inline]
    pub fn is_valid(&self, idx: i64) -> bool {
        let abs = self.abs_index(idx);
        abs >= 1 && abs <= self.top as i64
    }

    /// Read a position; invalid indices read as nil.
    pub fn get(&self, idx: i64) -> Value {
        let abs = self.abs_index(idx);
        if abs >= 1 && abs <= self.top as i64 {
            self.slots[abs as usize - 1]
        } else {
            Value::Nil
        }
    }

    /// Write a position. Panics on an invalid index.
    pub fn set(&mut self, idx: i64, v: Value) {
        let abs = self.abs_index(idx);
        assert!(
            abs >= 1 && abs <= self.top as i64,
            "invalid stack index {idx}"
        );
        self.slots[abs as usize - 1] = v;
    }

    /// Raise or lower the top. Lowered slots are cleared; raised slots read
    /// as nil.
    pub fn set_top(&mut self, new_top: usize) {
        if new_top > self.slots.len() {
            self.slots.resize(new_top, Value::Nil);
        }
        for i in new_top..self.top {
            self.slots[i] = Value::Nil;
        }
        self.top = new_top;
    }

    /// Grow the slot vector by `extra` positions.
    pub fn grow(&mut self, extra: usize) {
        let new_len = self.slots.len() + extra;
        self.slots.resize(new_len, Value::Nil);
    }

    /// Reverse positions `from..=to` (1-based, inclusive).
    fn reverse(&mut self, mut from: usize, mut to: usize) {
        while from < to {
            self.slots.swap(from - 1, to - 1);
            from += 1;
            to -= 1;
        }
    }

    /// Cyclic rotation of `idx..=top`: `n > 0` moves the top `n` values down
    /// to `idx`, `n < 0` moves `-n` values from `idx` up to the top.
    /// Realized as three reversals.
    pub fn rotate(&mut self, idx: i64, n: i64) {
        let t = self.top as i64;
        let p = self.abs_index(idx);
        assert!(p >= 1 && p <= t, "invalid rotate index {idx}");
        assert!(n.abs() <= t - p + 1, "rotate count out of range");
        let m = if n >= 0 { t - n } else { p - n - 1 };
        self.reverse(p as usize, m as usize);
        self.reverse(m as usize + 1, t as usize);
        self.reverse(p as usize, t as usize);
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "frame(top={}, pc={}, nregs={}, cap={})",
            self.top,
            self.pc,
            self.nregs,
            self.slots.len()
        )
    }
}
