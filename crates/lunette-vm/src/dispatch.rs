//! The fetch-execute loop and the calling convention.
//!
//! The loop is non-recursive over the current thread's frame vector: a call
//! to a script closure pushes a frame and the loop keeps going, a RETURN
//! pops one and marshals results into the caller. Each frame carries its own
//! pc, so when a yield unwinds the loop the thread's frames stay live in the
//! heap and a later resume re-enters where it left off. Host functions are
//! the only thing executed on the Rust call stack.
//!
//! Multi-value flow ("to top") uses the caller's slots above the register
//! window: a producer with an open result count leaves its results there
//! plus a register-position marker; the next variadic consumer merges the
//! fixed registers below the marker with the pending results by rotation.

use crate::api::CompareOp;
use crate::arith::ArithOp;
use crate::coerce;
use crate::error::{Control, VmError};
use crate::frame::{Frame, RetMode, MIN_STACK};
use crate::heap::{Closure, HostFn, Pending};
use crate::state::{upvalue_index, State, MAX_HOST_CALLS};
use lunette_core::instruction::{fb2int, OpCode, FIELDS_PER_FLUSH};
use lunette_core::proto::{Constant, Proto};
use lunette_core::value::Value;
use std::rc::Rc;

/// Outcome of a completed host-level call entry.
pub(crate) enum CallStatus {
    Done,
    /// The thread suspended; these are the yielded values.
    Yielded(Vec<Value>),
}

pub(crate) enum Precall {
    /// A script frame was pushed; the dispatch loop continues into it.
    Script,
    /// A host function ran to completion and its results are delivered.
    Done,
}

/// Host-level call entry: pops the callable and its arguments from the
/// current frame, runs the callee to completion, and delivers results onto
/// the caller's stack top. `allow_yield` is set only by the coroutine
/// resume path; anywhere else a yield crossing this entry is an error.
pub(crate) fn do_call(
    st: &mut State,
    nargs: usize,
    want: i64,
    allow_yield: bool,
) -> Result<CallStatus, Control> {
    if st.host_calls >= MAX_HOST_CALLS {
        return Err(Control::Error(VmError::StackOverflow));
    }
    st.host_calls += 1;
    let boundary = st.cur_frames_len();
    let result = match precall(st, nargs, want, RetMode::Stack) {
        Ok(Precall::Done) => Ok(CallStatus::Done),
        Ok(Precall::Script) => run(st, boundary).map(|()| CallStatus::Done),
        Err(e) => Err(e),
    };
    st.host_calls -= 1;
    match result {
        Ok(s) => Ok(s),
        Err(Control::Yield(vals)) => {
            if allow_yield {
                Ok(CallStatus::Yielded(vals))
            } else {
                Err(Control::Error(VmError::Coroutine(
                    "attempt to yield across a host-call boundary".to_string(),
                )))
            }
        }
        Err(e) => Err(e),
    }
}

/// Execute frames of the current thread until its frame count drops back to
/// `boundary`.
pub(crate) fn run(st: &mut State, boundary: usize) -> Result<(), Control> {
    while st.cur_frames_len() > boundary {
        step(st)?;
    }
    Ok(())
}

/// Dispatch the callable sitting `nargs` positions below the top.
pub(crate) fn precall(
    st: &mut State,
    nargs: usize,
    want: i64,
    ret: RetMode,
) -> Result<Precall, Control> {
    let mut nargs = nargs;
    let func_pos = st.get_top() as i64 - nargs as i64;
    let mut callee = st.get(func_pos);
    if !callee.is_closure() {
        // A table or userdata with __call becomes its own first argument.
        let call_name = st.names.call;
        let mm = st.get_metafield(callee, call_name);
        if let Value::Closure(_) = mm {
            st.check_stack(1)?;
            st.push(mm);
            st.insert(func_pos);
            nargs += 1;
            callee = mm;
        } else {
            return Err(st.error_where(VmError::TypeMismatch(format!(
                "attempt to call a {} value",
                callee.type_name()
            ))));
        }
    }
    let cl_ref = match callee {
        Value::Closure(c) => c,
        _ => unreachable!("checked above"),
    };
    let mut args = st.pop_n(nargs);
    st.pop(); // the callable itself

    enum Kind {
        Script(Rc<Proto>),
        Host(HostFn),
    }
    let kind = match st.heap.closure(cl_ref) {
        Closure::Script { proto, .. } => Kind::Script(proto.clone()),
        Closure::Host { func, .. } => Kind::Host(*func),
    };

    match kind {
        Kind::Script(proto) => {
            let nregs = proto.max_stack_size as usize;
            let nparams = proto.num_params as usize;
            let mut frame = Frame::new(nregs + MIN_STACK);
            frame.closure = Some(cl_ref);
            frame.nregs = nregs;
            frame.ret = ret;
            frame.want = want;
            for i in 0..nparams.min(args.len()) {
                frame.slots[i] = args[i];
            }
            if proto.is_vararg && args.len() > nparams {
                frame.varargs = args.split_off(nparams);
            }
            frame.top = nregs;
            st.push_frame(frame)?;
            Ok(Precall::Script)
        }
        Kind::Host(f) => {
            let mut frame = Frame::new(args.len() + MIN_STACK);
            frame.closure = Some(cl_ref);
            frame.ret = ret;
            frame.want = want;
            for (i, v) in args.iter().enumerate() {
                frame.slots[i] = *v;
            }
            frame.top = args.len();
            st.push_frame(frame)?;
            match f(st) {
                Ok(n) => {
                    let n = n.min(st.frame().top);
                    let results = st.frame_mut().pop_n(n);
                    let fr = st.pop_frame();
                    postcall(st, results, fr.ret, fr.want)?;
                    Ok(Precall::Done)
                }
                Err(Control::Yield(vals)) => {
                    // Remember how the interrupted call delivers results so
                    // the next resume's arguments can stand in for them.
                    let fr = st.pop_frame();
                    st.cur_mut().pending = Some(Pending {
                        ret: fr.ret,
                        want: fr.want,
                    });
                    Err(Control::Yield(vals))
                }
                Err(e) => {
                    st.pop_frame();
                    Err(e)
                }
            }
        }
    }
}

/// Deliver a returned value sequence onto the current (caller) frame.
pub(crate) fn postcall(
    st: &mut State,
    results: Vec<Value>,
    ret: RetMode,
    want: i64,
) -> Result<(), Control> {
    let needed = results.len().max(want.max(0) as usize) + 1;
    st.check_stack(needed)?;
    match ret {
        RetMode::Stack => st.frame_mut().push_n(&results, want),
        RetMode::Register(a) => {
            if want < 0 {
                // Open result count: leave everything on top plus the
                // register-position marker for the next variadic consumer.
                st.frame_mut().push_n(&results, -1);
                st.push(Value::integer(a as i64));
            } else {
                st.frame_mut().push_n(&results, want);
                for i in (a..a + want as usize).rev() {
                    st.replace(i as i64);
                }
            }
        }
    }
    Ok(())
}

/// Finish the current frame: close its upvalues, pop it, deliver results.
fn do_return(st: &mut State, results: Vec<Value>) -> Result<(), Control> {
    st.close_upvalues(0);
    let fr = st.pop_frame();
    postcall(st, results, fr.ret, fr.want)
}

fn cur_proto(st: &State) -> Result<Rc<Proto>, Control> {
    let cl = st
        .frame()
        .closure
        .ok_or_else(|| Control::Error(VmError::Runtime("no running function".to_string())))?;
    match st.heap.closure(cl) {
        Closure::Script { proto, .. } => Ok(proto.clone()),
        Closure::Host { .. } => Err(Control::Error(VmError::Runtime(
            "frame is not a script function".to_string(),
        ))),
    }
}

fn push_const(st: &mut State, idx: usize) -> Result<(), Control> {
    let proto = cur_proto(st)?;
    let k = proto.constants.get(idx).ok_or_else(|| {
        Control::Error(VmError::Runtime(format!("no constant {idx}")))
    })?;
    let v = match k {
        Constant::Nil => Value::Nil,
        Constant::Bool(b) => Value::Bool(*b),
        Constant::Int(i) => Value::integer(*i),
        Constant::Float(f) => Value::float(*f),
        Constant::Str(bytes) => Value::Str(st.strings.intern(bytes)),
    };
    st.check_stack(1)?;
    st.push(v);
    Ok(())
}

/// Push an RK operand: register when below the constant bit, constant
/// otherwise.
fn push_rk(st: &mut State, rk: u32) -> Result<(), Control> {
    if rk > 0xFF {
        push_const(st, (rk & 0xFF) as usize)
    } else {
        st.check_stack(1)?;
        st.push_value(rk as i64 + 1);
        Ok(())
    }
}

/// Merge pending open results with the fixed registers below their marker,
/// leaving callable-plus-arguments contiguous above the register window.
fn fix_stack(st: &mut State, a1: usize) -> Result<(), Control> {
    let marker = st
        .get(-1)
        .as_integer()
        .ok_or_else(|| Control::Error(VmError::Runtime("corrupted result marker".to_string())))?
        as usize;
    st.pop();
    if marker < a1 {
        return Err(Control::Error(VmError::Runtime(
            "corrupted result marker".to_string(),
        )));
    }
    if marker > a1 {
        st.check_stack(marker - a1)?;
        for i in a1..marker {
            st.push_value(i as i64);
        }
        let nregs = st.frame().nregs;
        st.rotate((nregs + 1) as i64, (marker - a1) as i64);
    }
    Ok(())
}

/// Push the callable and its arguments for a CALL-family opcode; returns the
/// argument count.
fn push_func_and_args(st: &mut State, a1: usize, b: usize) -> Result<usize, Control> {
    if b >= 1 {
        st.check_stack(b)?;
        for i in a1..a1 + b {
            st.push_value(i as i64);
        }
        Ok(b - 1)
    } else {
        fix_stack(st, a1)?;
        let nregs = st.frame().nregs;
        Ok(st.get_top() - nregs - 1)
    }
}

/// Instantiate nested prototype `idx` of the running function, capturing
/// upvalues per its descriptors: fresh-or-shared open upvalues for
/// `in_stack` captures, inherited cells otherwise.
fn load_proto(st: &mut State, idx: usize) -> Result<(), Control> {
    let proto = cur_proto(st)?;
    let child = proto
        .protos
        .get(idx)
        .cloned()
        .ok_or_else(|| Control::Error(VmError::Runtime(format!("no nested prototype {idx}"))))?;
    let parent = st.frame().closure;
    let mut upvals = Vec::with_capacity(child.upvalues.len());
    for d in child.upvalues.iter() {
        if d.in_stack {
            upvals.push(st.capture_upval(d.index as usize));
        } else {
            let p = parent.ok_or_else(|| {
                Control::Error(VmError::Runtime("upvalue capture outside a closure".to_string()))
            })?;
            let ups = st.heap.closure(p).upvals();
            let uv = *ups.get(d.index as usize).ok_or_else(|| {
                Control::Error(VmError::Runtime("upvalue index out of range".to_string()))
            })?;
            upvals.push(uv);
        }
    }
    let c = st.heap.new_closure(Closure::Script {
        proto: child,
        upvals,
    });
    st.check_stack(1)?;
    st.push(Value::Closure(c));
    Ok(())
}

fn arith_op_of(op: OpCode) -> ArithOp {
    match op {
        OpCode::Add => ArithOp::Add,
        OpCode::Sub => ArithOp::Sub,
        OpCode::Mul => ArithOp::Mul,
        OpCode::Mod => ArithOp::Mod,
        OpCode::Pow => ArithOp::Pow,
        OpCode::Div => ArithOp::Div,
        OpCode::IDiv => ArithOp::IDiv,
        OpCode::BAnd => ArithOp::BAnd,
        OpCode::BOr => ArithOp::BOr,
        OpCode::BXor => ArithOp::BXor,
        OpCode::Shl => ArithOp::Shl,
        OpCode::Shr => ArithOp::Shr,
        OpCode::Unm => ArithOp::Unm,
        OpCode::BNot => ArithOp::BNot,
        _ => unreachable!("not an arithmetic opcode"),
    }
}

/// Fetch and execute one instruction of the current frame.
fn step(st: &mut State) -> Result<(), Control> {
    let proto = cur_proto(st)?;
    let pc = st.frame().pc;
    let Some(&inst) = proto.code.get(pc) else {
        // Fell off the end: return with no values.
        return do_return(st, Vec::new());
    };
    st.frame_mut().pc = pc + 1;

    match inst.opcode() {
        OpCode::Move => {
            let (a, b, _) = inst.abc();
            st.copy(b as i64 + 1, a as i64 + 1);
        }

        OpCode::LoadK => {
            let (a, bx) = inst.abx();
            push_const(st, bx as usize)?;
            st.replace(a as i64 + 1);
        }

        OpCode::LoadKx => {
            let (a, _) = inst.abx();
            let next = *proto.code.get(st.frame().pc).ok_or_else(|| {
                Control::Error(VmError::Runtime("LOADKX without EXTRAARG".to_string()))
            })?;
            st.frame_mut().pc += 1;
            push_const(st, next.ax() as usize)?;
            st.replace(a as i64 + 1);
        }

        OpCode::LoadBool => {
            let (a, b, c) = inst.abc();
            st.set(a as i64 + 1, Value::Bool(b != 0));
            if c != 0 {
                st.frame_mut().pc += 1;
            }
        }

        OpCode::LoadNil => {
            let (a, b, _) = inst.abc();
            for i in a..=a + b {
                st.set(i as i64 + 1, Value::Nil);
            }
        }

        OpCode::GetUpval => {
            let (a, b, _) = inst.abc();
            st.copy(upvalue_index(b as usize + 1), a as i64 + 1);
        }

        OpCode::SetUpval => {
            let (a, b, _) = inst.abc();
            st.copy(a as i64 + 1, upvalue_index(b as usize + 1));
        }

        OpCode::GetTabUp => {
            let (a, b, c) = inst.abc();
            push_rk(st, c)?;
            st.get_table(upvalue_index(b as usize + 1))?;
            st.replace(a as i64 + 1);
        }

        OpCode::GetTable => {
            let (a, b, c) = inst.abc();
            push_rk(st, c)?;
            st.get_table(b as i64 + 1)?;
            st.replace(a as i64 + 1);
        }

        OpCode::SetTabUp => {
            let (a, b, c) = inst.abc();
            push_rk(st, b)?;
            push_rk(st, c)?;
            st.set_table(upvalue_index(a as usize + 1))?;
        }

        OpCode::SetTable => {
            let (a, b, c) = inst.abc();
            push_rk(st, b)?;
            push_rk(st, c)?;
            st.set_table(a as i64 + 1)?;
        }

        OpCode::NewTable => {
            let (a, b, c) = inst.abc();
            st.check_stack(1)?;
            st.create_table(fb2int(b), fb2int(c));
            st.replace(a as i64 + 1);
        }

        OpCode::Self_ => {
            let (a, b, c) = inst.abc();
            let a1 = a as i64 + 1;
            let b1 = b as i64 + 1;
            st.copy(b1, a1 + 1);
            push_rk(st, c)?;
            st.get_table(b1)?;
            st.replace(a1);
        }

        op @ (OpCode::Add
        | OpCode::Sub
        | OpCode::Mul
        | OpCode::Mod
        | OpCode::Pow
        | OpCode::Div
        | OpCode::IDiv
        | OpCode::BAnd
        | OpCode::BOr
        | OpCode::BXor
        | OpCode::Shl
        | OpCode::Shr) => {
            let (a, b, c) = inst.abc();
            push_rk(st, b)?;
            push_rk(st, c)?;
            st.arith(arith_op_of(op))?;
            st.replace(a as i64 + 1);
        }

        op @ (OpCode::Unm | OpCode::BNot) => {
            let (a, b, _) = inst.abc();
            st.check_stack(1)?;
            st.push_value(b as i64 + 1);
            st.arith(arith_op_of(op))?;
            st.replace(a as i64 + 1);
        }

        OpCode::Not => {
            let (a, b, _) = inst.abc();
            let v = !st.to_boolean(b as i64 + 1);
            st.set(a as i64 + 1, Value::Bool(v));
        }

        OpCode::Len => {
            let (a, b, _) = inst.abc();
            st.len_of(b as i64 + 1)?;
            st.replace(a as i64 + 1);
        }

        OpCode::Concat => {
            let (a, b, c) = inst.abc();
            let n = (c - b + 1) as usize;
            st.check_stack(n)?;
            for i in b..=c {
                st.push_value(i as i64 + 1);
            }
            st.concat_n(n)?;
            st.replace(a as i64 + 1);
        }

        OpCode::Jmp => {
            let (a, sbx) = inst.asbx();
            let new_pc = st.frame().pc as i64 + sbx as i64;
            st.frame_mut().pc = new_pc as usize;
            if a != 0 {
                st.close_upvalues(a as usize - 1);
            }
        }

        op @ (OpCode::Eq | OpCode::Lt | OpCode::Le) => {
            let (a, b, c) = inst.abc();
            push_rk(st, b)?;
            push_rk(st, c)?;
            let cmp = match op {
                OpCode::Eq => CompareOp::Eq,
                OpCode::Lt => CompareOp::Lt,
                _ => CompareOp::Le,
            };
            let r = st.compare(-2, -1, cmp)?;
            st.pop();
            st.pop();
            if r != (a != 0) {
                st.frame_mut().pc += 1;
            }
        }

        OpCode::Test => {
            let (a, _, c) = inst.abc();
            if st.to_boolean(a as i64 + 1) != (c != 0) {
                st.frame_mut().pc += 1;
            }
        }

        OpCode::TestSet => {
            let (a, b, c) = inst.abc();
            if st.to_boolean(b as i64 + 1) == (c != 0) {
                st.copy(b as i64 + 1, a as i64 + 1);
            } else {
                st.frame_mut().pc += 1;
            }
        }

        OpCode::Call => {
            let (a, b, c) = inst.abc();
            let a1 = a as usize + 1;
            let nargs = push_func_and_args(st, a1, b as usize)?;
            precall(st, nargs, c as i64 - 1, RetMode::Register(a1))?;
        }

        OpCode::TailCall => {
            // A plain call returning everything; the paired RETURN with an
            // open operand forwards the results.
            let (a, b, _) = inst.abc();
            let a1 = a as usize + 1;
            let nargs = push_func_and_args(st, a1, b as usize)?;
            precall(st, nargs, -1, RetMode::Register(a1))?;
        }

        OpCode::Return => {
            let (a, b, _) = inst.abc();
            let a1 = a as i64 + 1;
            if b > 1 {
                st.check_stack(b as usize - 1)?;
                for i in a1..a1 + b as i64 - 1 {
                    st.push_value(i);
                }
            } else if b == 0 {
                fix_stack(st, a1 as usize)?;
            }
            let nregs = st.frame().nregs;
            let count = st.frame().top - nregs;
            let results = st.frame_mut().pop_n(count);
            do_return(st, results)?;
        }

        OpCode::ForPrep => {
            let (a, sbx) = inst.asbx();
            let a1 = a as i64 + 1;
            const WHICH: [&str; 3] = ["initial value", "limit", "step"];
            for (j, what) in WHICH.iter().enumerate() {
                let pos = a1 + j as i64;
                let v = st.get(pos);
                if let Value::Str(s) = v {
                    let text = String::from_utf8_lossy(st.strings.get(s)).into_owned();
                    let parsed = coerce::parse_number(&text).ok_or_else(|| {
                        st.error_where(VmError::Arith(format!(
                            "'for' {what} must be a number"
                        )))
                    })?;
                    st.set(pos, Value::Number(parsed));
                }
            }
            if st.to_number_x(a1 + 2) == Some(0.0) {
                return Err(st.error_where(VmError::Arith("'for' step is zero".to_string())));
            }
            st.check_stack(2)?;
            st.push_value(a1);
            st.push_value(a1 + 2);
            st.arith(ArithOp::Sub)?;
            st.replace(a1);
            let new_pc = st.frame().pc as i64 + sbx as i64;
            st.frame_mut().pc = new_pc as usize;
        }

        OpCode::ForLoop => {
            let (a, sbx) = inst.asbx();
            let a1 = a as i64 + 1;
            st.check_stack(2)?;
            st.push_value(a1 + 2);
            st.push_value(a1);
            st.arith(ArithOp::Add)?;
            st.replace(a1);
            let positive_step = st.to_number(a1 + 2) >= 0.0;
            let cont = if positive_step {
                st.compare(a1, a1 + 1, CompareOp::Le)?
            } else {
                st.compare(a1 + 1, a1, CompareOp::Le)?
            };
            if cont {
                let new_pc = st.frame().pc as i64 + sbx as i64;
                st.frame_mut().pc = new_pc as usize;
                st.copy(a1, a1 + 3);
            }
        }

        OpCode::TForCall => {
            let (a, _, c) = inst.abc();
            let a1 = a as usize + 1;
            st.check_stack(3)?;
            for i in a1..a1 + 3 {
                st.push_value(i as i64);
            }
            precall(st, 2, c as i64, RetMode::Register(a1 + 3))?;
        }

        OpCode::TForLoop => {
            let (a, sbx) = inst.asbx();
            let a1 = a as i64 + 1;
            if !st.get(a1 + 1).is_nil() {
                st.copy(a1 + 1, a1);
                let new_pc = st.frame().pc as i64 + sbx as i64;
                st.frame_mut().pc = new_pc as usize;
            }
        }

        OpCode::SetList => {
            let (a, b, c) = inst.abc();
            let a1 = a as usize + 1;
            let block = if c > 0 {
                c as i64 - 1
            } else {
                let next = *proto.code.get(st.frame().pc).ok_or_else(|| {
                    Control::Error(VmError::Runtime("SETLIST without EXTRAARG".to_string()))
                })?;
                st.frame_mut().pc += 1;
                next.ax() as i64
            };
            let b_is_zero = b == 0;
            let mut count = b as usize;
            if b_is_zero {
                let marker = st.get(-1).as_integer().ok_or_else(|| {
                    Control::Error(VmError::Runtime("corrupted result marker".to_string()))
                })? as usize;
                st.pop();
                count = marker.checked_sub(a1 + 1).ok_or_else(|| {
                    Control::Error(VmError::Runtime("corrupted result marker".to_string()))
                })?;
            }
            st.check_stack(1)?;
            let mut idx = block * FIELDS_PER_FLUSH;
            for j in 1..=count {
                idx += 1;
                st.push_value((a1 + j) as i64);
                st.set_i(a1 as i64, idx)?;
            }
            if b_is_zero {
                let nregs = st.frame().nregs;
                let top = st.get_top();
                for j in nregs + 1..=top {
                    idx += 1;
                    st.push_value(j as i64);
                    st.set_i(a1 as i64, idx)?;
                }
                st.set_top(nregs as i64);
            }
        }

        OpCode::Closure => {
            let (a, bx) = inst.abx();
            load_proto(st, bx as usize)?;
            st.replace(a as i64 + 1);
        }

        OpCode::Vararg => {
            let (a, b, _) = inst.abc();
            let a1 = a as usize + 1;
            if b != 1 {
                let varargs = st.frame().varargs.clone();
                postcall(st, varargs, RetMode::Register(a1), b as i64 - 1)?;
            }
        }

        OpCode::ExtraArg => {
            return Err(Control::Error(VmError::Runtime(
                "unexpected EXTRAARG".to_string(),
            )));
        }
    }
    Ok(())
}
