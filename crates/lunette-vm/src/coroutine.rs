//! Cooperative coroutine scheduler.
//!
//! A coroutine is a thread value with its own frame chain. Because the
//! dispatch loop is non-recursive, suspending is cheap: a yield pops out of
//! the loop with the transfer values while the thread's frames (each holding
//! its own pc) stay live, and the interrupted call records where the next
//! resume's arguments should land. At most one thread runs at any instant;
//! resume/yield hand control along the resumer chain.

use crate::dispatch::{self, CallStatus};
use crate::error::{Control, VmError};
use crate::heap::{CoStatus, Thread};
use crate::state::{State, MAX_HOST_CALLS};
use lunette_core::value::{ThreadRef, Value};

/// What a resume produced, with the count of values moved onto the
/// resumer's stack. `Error` leaves the error value alone on top.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resume {
    /// The body returned; the coroutine is dead.
    Return(usize),
    /// The coroutine yielded and is suspended.
    Yield(usize),
    Error,
}

impl State {
    /// Create a fresh suspended thread and push it. Its base frame will
    /// receive the body function (typically via `xmove`) before the first
    /// resume.
    pub fn new_thread(&mut self) -> ThreadRef {
        let t = self.heap.new_thread(Thread::new_coroutine());
        self.push(Value::Thread(t));
        t
    }

    /// Pop `n` values from `from`'s stack and push them onto `to`'s.
    pub fn xmove(&mut self, from: ThreadRef, to: ThreadRef, n: usize) {
        if from == to || n == 0 {
            return;
        }
        let vals = self
            .heap
            .thread_mut(from)
            .frames
            .last_mut()
            .expect("thread has no frames")
            .pop_n(n);
        let dst = self
            .heap
            .thread_mut(to)
            .frames
            .last_mut()
            .expect("thread has no frames");
        for v in vals {
            dst.push(v);
        }
    }

    /// Only non-main threads may yield.
    pub fn is_yieldable(&self) -> bool {
        self.current != self.main
    }

    /// Status as the standard library reports it: the asking thread always
    /// sees itself as running.
    pub fn status_of(&self, co: ThreadRef) -> &'static str {
        if co == self.current {
            return "running";
        }
        match self.heap.thread(co).status {
            CoStatus::Suspended => "suspended",
            CoStatus::Running => "running",
            CoStatus::Normal => "normal",
            CoStatus::Dead => "dead",
        }
    }

    /// Begin a yield carrying the top `nresults` values. The returned
    /// signal must be propagated out of the calling host function; the
    /// resume entry absorbs it.
    pub fn yield_values(&mut self, nresults: usize) -> Control {
        if !self.is_yieldable() || self.cur().resumer.is_none() {
            return Control::Error(VmError::Coroutine(
                "attempt to yield from outside a coroutine".to_string(),
            ));
        }
        let vals = self.pop_n(nresults);
        Control::Yield(vals)
    }

    /// Resume `co`, transferring the top `nargs` values of the current
    /// thread as arguments. Results (or yielded values, or the error) land
    /// on the current thread's stack. Never raises: failures report as
    /// `Resume::Error`.
    pub fn resume(&mut self, co: ThreadRef, nargs: usize) -> Resume {
        if co == self.current {
            return self.resume_error(nargs, "cannot resume non-suspended coroutine");
        }
        match self.heap.thread(co).status {
            CoStatus::Dead => return self.resume_error(nargs, "cannot resume dead coroutine"),
            CoStatus::Running | CoStatus::Normal => {
                return self.resume_error(nargs, "cannot resume non-suspended coroutine")
            }
            CoStatus::Suspended => {}
        }
        let fresh =
            self.heap.thread(co).pending.is_none() && self.heap.thread(co).frames.len() == 1;
        if fresh && self.heap.thread(co).frames[0].top == 0 {
            // Created but never given a body.
            return self.resume_error(nargs, "cannot resume dead coroutine");
        }
        if self.host_calls >= MAX_HOST_CALLS {
            return self.resume_error(nargs, "stack overflow");
        }

        let args = self.pop_n(nargs);
        let prev = self.current;
        self.set_status(prev, CoStatus::Normal);
        {
            let t = self.heap.thread_mut(co);
            t.status = CoStatus::Running;
            t.resumer = Some(prev);
        }
        self.current = co;
        self.host_calls += 1;

        let outcome = self.resume_body(fresh, args);

        self.host_calls -= 1;
        self.current = prev;
        self.set_status(prev, CoStatus::Running);

        match outcome {
            Ok(CallStatus::Done) => {
                self.set_status(co, CoStatus::Dead);
                let n = self
                    .heap
                    .thread(co)
                    .frames
                    .last()
                    .expect("thread has no frames")
                    .top;
                self.xmove(co, prev, n);
                Resume::Return(n)
            }
            Ok(CallStatus::Yielded(vals)) => {
                self.set_status(co, CoStatus::Suspended);
                let n = vals.len();
                for v in vals {
                    self.push(v);
                }
                Resume::Yield(n)
            }
            Err(Control::Error(e)) => {
                // Unwind the dead body (closing upvalues) but keep the base
                // frame so the thread value stays inspectable.
                self.unwind_thread(co, 1);
                self.set_status(co, CoStatus::Dead);
                let v = e.to_value(&mut self.strings);
                self.push(v);
                Resume::Error
            }
            Err(Control::Yield(_)) => unreachable!("yield signal escaped the resume entry"),
        }
    }

    fn resume_body(&mut self, fresh: bool, args: Vec<Value>) -> Result<CallStatus, Control> {
        if fresh {
            // Base frame holds the body function; arguments go on top of it.
            let nargs = args.len();
            for v in args {
                self.push(v);
            }
            dispatch::do_call(self, nargs, -1, true)
        } else {
            // Deliver the resume arguments as the results of the
            // interrupted call, then continue the loop.
            let pending = self.cur_mut().pending.take().ok_or_else(|| {
                Control::Error(VmError::Coroutine(
                    "cannot resume non-suspended coroutine".to_string(),
                ))
            })?;
            dispatch::postcall(self, args, pending.ret, pending.want)?;
            match dispatch::run(self, 1) {
                Ok(()) => Ok(CallStatus::Done),
                Err(Control::Yield(vals)) => Ok(CallStatus::Yielded(vals)),
                Err(e) => Err(e),
            }
        }
    }

    /// Drop the would-be arguments and report a resume failure with the
    /// message on top of the caller's stack.
    fn resume_error(&mut self, nargs: usize, msg: &str) -> Resume {
        self.set_top(-(nargs as i64) - 1);
        let id = self.strings.intern(msg.as_bytes());
        self.push(Value::Str(id));
        Resume::Error
    }
}
