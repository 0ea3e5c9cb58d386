//! The VM state: heap, interner, registry, thread bookkeeping, and the
//! frame-stack indexing layer of the embedding API.

use crate::error::{Control, VmError};
use crate::frame::Frame;
use crate::heap::{Closure, CoStatus, Heap, Thread, Upvalue};
use crate::metamethod::MetaNames;
use lunette_core::string::Interner;
use lunette_core::value::{TableRef, ThreadRef, UpvalRef, Value};

/// Per-thread slot ceiling; exceeding it raises StackOverflow.
pub const LUAI_MAXSTACK: usize = 1_000_000;

/// Maximum nesting of host-level call entries (protects the Rust stack the
/// way the reference interpreter bounds nested C calls).
pub const MAX_HOST_CALLS: usize = 200;

/// Sentinel index addressing the registry table.
pub const REGISTRY_INDEX: i64 = -(LUAI_MAXSTACK as i64) - 1000;

/// Registry key of the main thread.
pub const RIDX_MAIN_THREAD: i64 = 1;
/// Registry key of the globals table.
pub const RIDX_GLOBALS: i64 = 2;

/// Pseudo-index addressing the current closure's `i`-th upvalue (1-based).
pub fn upvalue_index(i: usize) -> i64 {
    REGISTRY_INDEX - i as i64
}

pub struct State {
    pub heap: Heap,
    pub strings: Interner,
    pub registry: TableRef,
    pub(crate) current: ThreadRef,
    pub(crate) main: ThreadRef,
    pub(crate) names: MetaNames,
    /// Depth of nested host-level call entries.
    pub(crate) host_calls: usize,
}

impl State {
    pub fn new() -> State {
        let mut heap = Heap::new();
        let mut strings = Interner::new();
        let registry = heap.new_table(8, 0);
        let globals = heap.new_table(0, 20);
        let main = heap.new_thread(Thread::new_main());
        heap.table_mut(registry)
            .set_int(RIDX_MAIN_THREAD, Value::Thread(main));
        heap.table_mut(registry)
            .set_int(RIDX_GLOBALS, Value::Table(globals));
        let names = MetaNames::init(&mut strings);
        State {
            heap,
            strings,
            registry,
            current: main,
            main,
            names,
            host_calls: 0,
        }
    }

    // ---- Thread and frame access ----

    pub fn main_thread(&self) -> ThreadRef {
        self.main
    }

    pub fn current_thread(&self) -> ThreadRef {
        self.current
    }

    pub fn is_main_thread(&self) -> bool {
        self.current == self.main
    }

    pub(crate) fn cur(&self) -> &Thread {
        self.heap.thread(self.current)
    }

    pub(crate) fn cur_mut(&mut self) -> &mut Thread {
        self.heap.thread_mut(self.current)
    }

    pub(crate) fn frame(&self) -> &Frame {
        self.cur().frames.last().expect("thread has no frames")
    }

    pub(crate) fn frame_mut(&mut self) -> &mut Frame {
        self.cur_mut().frames.last_mut().expect("thread has no frames")
    }

    pub(crate) fn cur_frames_len(&self) -> usize {
        self.cur().frames.len()
    }

    /// The globals table from its registry slot.
    pub fn globals(&self) -> TableRef {
        self.heap
            .table(self.registry)
            .get_int(RIDX_GLOBALS)
            .as_table_ref()
            .expect("registry globals entry is not a table")
    }

    // ---- Frame-stack operations ----

    pub fn push(&mut self, v: Value) {
        self.frame_mut().push(v);
    }

    pub fn pop(&mut self) -> Value {
        self.frame_mut().pop()
    }

    pub fn pop_n(&mut self, n: usize) -> Vec<Value> {
        self.frame_mut().pop_n(n)
    }

    pub fn push_n(&mut self, vals: &[Value], n: i64) {
        self.frame_mut().push_n(vals, n);
    }

    pub fn get_top(&self) -> usize {
        self.frame().top
    }

    /// Set the top to an absolute position (or negative relative form);
    /// pops or pushes nils as needed.
    pub fn set_top(&mut self, idx: i64) {
        let top = self.frame().top as i64;
        let new_top = if idx >= 0 { idx } else { top + idx + 1 };
        assert!(new_top >= 0, "invalid new top {idx}");
        self.frame_mut().set_top(new_top as usize);
    }

    pub fn abs_index(&self, idx: i64) -> i64 {
        self.frame().abs_index(idx)
    }

    pub fn is_valid(&self, idx: i64) -> bool {
        if idx == REGISTRY_INDEX {
            return true;
        }
        self.frame().is_valid(idx)
    }

    /// Read any index, including the registry and upvalue sentinels.
    /// Invalid indices read as nil.
    pub fn get(&self, idx: i64) -> Value {
        if idx == REGISTRY_INDEX {
            return Value::Table(self.registry);
        }
        if idx < REGISTRY_INDEX {
            let n = (REGISTRY_INDEX - idx) as usize;
            if let Some(cl) = self.frame().closure {
                let ups = self.heap.closure(cl).upvals();
                if n <= ups.len() {
                    return self.upval_get(ups[n - 1]);
                }
            }
            return Value::Nil;
        }
        self.frame().get(idx)
    }

    /// Write any index. Upvalue sentinels write through to the cell;
    /// invalid frame indices panic.
    pub fn set(&mut self, idx: i64, v: Value) {
        if idx < REGISTRY_INDEX {
            let n = (REGISTRY_INDEX - idx) as usize;
            let cl = self.frame().closure.expect("no closure for upvalue index");
            let ups = self.heap.closure(cl).upvals();
            assert!(n <= ups.len(), "upvalue index {n} out of range");
            let uv = ups[n - 1];
            self.upval_set(uv, v);
            return;
        }
        assert!(idx != REGISTRY_INDEX, "cannot write the registry index");
        self.frame_mut().set(idx, v);
    }

    pub fn push_value(&mut self, idx: i64) {
        let v = self.get(idx);
        self.push(v);
    }

    /// Pop the top into position `idx`.
    pub fn replace(&mut self, idx: i64) {
        let v = self.pop();
        self.set(idx, v);
    }

    pub fn copy(&mut self, from: i64, to: i64) {
        let v = self.get(from);
        self.set(to, v);
    }

    pub fn rotate(&mut self, idx: i64, n: i64) {
        self.frame_mut().rotate(idx, n);
    }

    /// Move the top into position `idx`, shifting values up.
    pub fn insert(&mut self, idx: i64) {
        self.rotate(idx, 1);
    }

    /// Remove position `idx`, shifting values down.
    pub fn remove(&mut self, idx: i64) {
        self.rotate(idx, -1);
        self.pop();
    }

    /// Ensure `n` free slots above the top, growing the frame and charging
    /// the growth against the per-thread ceiling.
    pub fn check_stack(&mut self, n: usize) -> Result<(), Control> {
        let need = {
            let f = self.frame();
            (f.top + n).saturating_sub(f.slots.len())
        };
        if need > 0 {
            let t = self.cur_mut();
            t.slots_in_use += need;
            if t.slots_in_use > LUAI_MAXSTACK {
                return Err(Control::Error(VmError::StackOverflow));
            }
            t.frames.last_mut().expect("thread has no frames").grow(need);
        }
        Ok(())
    }

    // ---- Frame linkage ----

    pub(crate) fn push_frame(&mut self, frame: Frame) -> Result<(), Control> {
        let t = self.cur_mut();
        t.slots_in_use += frame.slots.len();
        if t.slots_in_use > LUAI_MAXSTACK {
            t.slots_in_use -= frame.slots.len();
            return Err(Control::Error(VmError::StackOverflow));
        }
        t.frames.push(frame);
        Ok(())
    }

    pub(crate) fn pop_frame(&mut self) -> Frame {
        let t = self.cur_mut();
        let f = t.frames.pop().expect("frame underflow");
        // Saturating: small unaccounted growth from push auto-extension.
        t.slots_in_use = t.slots_in_use.saturating_sub(f.slots.len());
        f
    }

    // ---- Upvalue machinery ----

    pub(crate) fn upval_get(&self, uv: UpvalRef) -> Value {
        match *self.heap.upval(uv) {
            Upvalue::Open {
                thread,
                frame,
                slot,
            } => self.heap.thread(thread).frames[frame].slots[slot],
            Upvalue::Closed(v) => v,
        }
    }

    pub(crate) fn upval_set(&mut self, uv: UpvalRef, v: Value) {
        match *self.heap.upval(uv) {
            Upvalue::Open {
                thread,
                frame,
                slot,
            } => self.heap.thread_mut(thread).frames[frame].slots[slot] = v,
            Upvalue::Closed(_) => *self.heap.upval_mut(uv) = Upvalue::Closed(v),
        }
    }

    /// Find the open upvalue covering a register slot of the current frame,
    /// creating and registering one if absent. Sibling closures capturing
    /// the same slot share the cell.
    pub(crate) fn capture_upval(&mut self, slot: usize) -> UpvalRef {
        let thread = self.current;
        let fi = self.cur().frames.len() - 1;
        if let Some(&uv) = self.cur().frames[fi].open_upvals.get(&slot) {
            return uv;
        }
        let uv = self.heap.new_upval(Upvalue::Open { thread, frame: fi, slot });
        self.heap.thread_mut(thread).frames[fi]
            .open_upvals
            .insert(slot, uv);
        uv
    }

    /// Close all open upvalues of the current frame covering slots at or
    /// above `from_slot` (0-based), lifting their current values into
    /// private cells.
    pub(crate) fn close_upvalues(&mut self, from_slot: usize) {
        let thread = self.current;
        let fi = self.cur().frames.len() - 1;
        let to_close: Vec<(usize, UpvalRef)> = self.cur().frames[fi]
            .open_upvals
            .iter()
            .filter(|(slot, _)| **slot >= from_slot)
            .map(|(s, u)| (*s, *u))
            .collect();
        for (slot, uv) in to_close {
            let v = self.heap.thread(thread).frames[fi].slots[slot];
            *self.heap.upval_mut(uv) = Upvalue::Closed(v);
            self.heap.thread_mut(thread).frames[fi].open_upvals.remove(&slot);
        }
    }

    /// Unwind a thread's frames down to `depth`, closing each frame's open
    /// upvalues so captured locals keep correct semantics in closures that
    /// survive the error.
    pub(crate) fn unwind_thread(&mut self, thread: ThreadRef, depth: usize) {
        while self.heap.thread(thread).frames.len() > depth {
            let fi = self.heap.thread(thread).frames.len() - 1;
            let entries: Vec<(usize, UpvalRef)> = self.heap.thread(thread).frames[fi]
                .open_upvals
                .iter()
                .map(|(s, u)| (*s, *u))
                .collect();
            for (slot, uv) in entries {
                let v = self.heap.thread(thread).frames[fi].slots[slot];
                *self.heap.upval_mut(uv) = Upvalue::Closed(v);
            }
            let t = self.heap.thread_mut(thread);
            let f = t.frames.pop().expect("frame underflow");
            t.slots_in_use = t.slots_in_use.saturating_sub(f.slots.len());
        }
        self.heap.thread_mut(thread).pending = None;
    }

    pub(crate) fn unwind_current(&mut self, depth: usize) {
        self.unwind_thread(self.current, depth);
    }

    // ---- Diagnostics ----

    /// `chunk:line: ` prefix for the `level`-th script frame from the top of
    /// the current thread, or empty when there is none.
    pub fn location(&self, level: usize) -> String {
        let mut remaining = level;
        for f in self.cur().frames.iter().rev() {
            let Some(cl) = f.closure else { continue };
            if let Closure::Script { proto, .. } = self.heap.closure(cl) {
                if remaining == 0 {
                    let line = proto.line(f.pc.saturating_sub(1));
                    return format!("{}:{}: ", proto.source_name(), line);
                }
                remaining -= 1;
            }
        }
        String::new()
    }

    /// Attach the current source position to an error.
    pub(crate) fn error_where(&self, e: VmError) -> Control {
        let prefix = self.location(0);
        Control::Error(e.with_location(&prefix))
    }

    /// Invariant snapshot used by tests: top within bounds, every
    /// registered open upvalue pointing at a live slot of its frame.
    pub fn assert_frame_invariants(&self) {
        for (fi, f) in self.cur().frames.iter().enumerate() {
            assert!(f.top <= f.slots.len(), "top beyond capacity");
            for (&slot, &uv) in &f.open_upvals {
                assert!(slot < f.slots.len(), "open upvalue slot out of range");
                match *self.heap.upval(uv) {
                    Upvalue::Open { frame, slot: s, .. } => {
                        assert_eq!(frame, fi);
                        assert_eq!(s, slot);
                    }
                    Upvalue::Closed(_) => panic!("registered upvalue is closed"),
                }
            }
        }
    }
}

impl Default for State {
    fn default() -> Self {
        Self::new()
    }
}

/// Status transitions used by the coroutine layer.
impl State {
    pub(crate) fn set_status(&mut self, t: ThreadRef, s: CoStatus) {
        self.heap.thread_mut(t).status = s;
    }
}
