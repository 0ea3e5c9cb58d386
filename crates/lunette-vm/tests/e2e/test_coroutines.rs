use super::helpers::*;
use lunette_core::instruction::OpCode::*;
use lunette_core::value::Value;
use lunette_vm::{Resume, State};
use std::rc::Rc;

/// Body of: function(a) local b = yield(a + 1); return b * 2 end
fn yield_body() -> lunette_core::proto::Proto {
    with_env(proto(
        3,
        1,
        vec![s("yield"), int(1), int(2)],
        vec![
            abc(GetTabUp, 1, 0, k(0)),
            abc(Add, 2, 0, k(1)),
            abc(Call, 1, 2, 2), // R1 = yield(a + 1)
            abc(Mul, 2, 1, k(2)),
            abc(Return, 2, 2, 0),
        ],
    ))
}

/// The §8 scenario driven through the embedding API:
/// resume(co, 10) yields 11; resume(co, 5) returns 10; co is then dead.
#[test]
fn test_yield_resume_roundtrip() {
    let mut st = State::new();
    install_base(&mut st);

    let co = st.new_thread();
    st.load(Rc::new(yield_body()));
    let main = st.current_thread();
    st.xmove(main, co, 1); // hand the body over
    st.pop(); // drop the thread value; we hold the handle

    assert_eq!(st.status_of(co), "suspended");

    st.push_integer(10);
    assert_eq!(st.resume(co, 1), Resume::Yield(1));
    assert_eq!(st.pop(), Value::integer(11));
    assert_eq!(st.status_of(co), "suspended");

    st.push_integer(5);
    assert_eq!(st.resume(co, 1), Resume::Return(1));
    assert_eq!(st.pop(), Value::integer(10));
    assert_eq!(st.status_of(co), "dead");

    // Dead coroutines refuse further resumes, reporting rather than raising.
    assert_eq!(st.resume(co, 0), Resume::Error);
    let msg = st.to_rust_string(-1).unwrap();
    assert!(msg.contains("dead coroutine"), "got {msg:?}");
    st.set_top(0);
    st.assert_frame_invariants();
}

/// The same scenario written in bytecode against resume/status globals.
#[test]
fn test_coroutine_script_driven() {
    let mut st = State::new();
    install_base(&mut st);
    let main = with_children(
        with_env(proto(
            9,
            0,
            vec![s("create"), s("resume"), int(10), int(5), s("status")],
            vec![
                abc(GetTabUp, 0, 0, k(0)),
                abx(Closure, 1, 0),
                abc(Call, 0, 2, 2), // R0 = create(body)
                abc(GetTabUp, 1, 0, k(1)),
                abc(Move, 2, 0, 0),
                abx(LoadK, 3, 2),
                abc(Call, 1, 3, 3), // R1, R2 = resume(co, 10) -> true, 11
                abc(Move, 5, 2, 0), // x
                abc(GetTabUp, 2, 0, k(1)),
                abc(Move, 3, 0, 0),
                abx(LoadK, 4, 3),
                abc(Call, 2, 3, 3), // R2, R3 = resume(co, 5) -> true, 10
                abc(Move, 6, 3, 0), // y
                abc(GetTabUp, 7, 0, k(4)),
                abc(Move, 8, 0, 0),
                abc(Call, 7, 2, 2), // R7 = status(co)
                abc(Return, 5, 4, 0), // x, y, status
            ],
        )),
        vec![yield_body()],
    );
    let r = run_proto(&mut st, main, &[]);
    assert_eq!(r[0], Value::integer(11));
    assert_eq!(r[1], Value::integer(10));
    assert_eq!(str_of(&st, r[2]), "dead");
}

#[test]
fn test_coroutine_immediate_return() {
    let mut st = State::new();
    let body = proto(
        2,
        2,
        vec![],
        vec![abc(Add, 0, 0, 1), abc(Return, 0, 2, 0)],
    );
    let co = st.new_thread();
    st.load(Rc::new(body));
    let main = st.current_thread();
    st.xmove(main, co, 1);
    st.pop();

    st.push_integer(4);
    st.push_integer(5);
    assert_eq!(st.resume(co, 2), Resume::Return(1));
    assert_eq!(st.pop(), Value::integer(9));
    assert_eq!(st.status_of(co), "dead");
}

#[test]
fn test_coroutine_body_error_kills_it() {
    let mut st = State::new();
    install_base(&mut st);
    let body = with_env(proto(
        2,
        0,
        vec![s("error"), s("exploded")],
        vec![
            abc(GetTabUp, 0, 0, k(0)),
            abx(LoadK, 1, 1),
            abc(Call, 0, 2, 1),
            abc(Return, 0, 1, 0),
        ],
    ));
    let co = st.new_thread();
    st.load(Rc::new(body));
    let main = st.current_thread();
    st.xmove(main, co, 1);
    st.pop();

    assert_eq!(st.resume(co, 0), Resume::Error);
    let msg = st.to_rust_string(-1).unwrap();
    assert!(msg.contains("exploded"), "got {msg:?}");
    assert_eq!(st.status_of(co), "dead");
    st.set_top(0);
}

#[test]
fn test_yield_from_main_thread_fails() {
    let mut st = State::new();
    install_base(&mut st);
    let main = with_env(proto(
        2,
        0,
        vec![s("yield"), int(1)],
        vec![
            abc(GetTabUp, 0, 0, k(0)),
            abx(LoadK, 1, 1),
            abc(Call, 0, 2, 1),
            abc(Return, 0, 1, 0),
        ],
    ));
    let e = run_proto_err(&mut st, main, &[]);
    assert!(
        e.to_string().contains("outside a coroutine"),
        "got {e:?}"
    );
}

/// While a coroutine runs, its resumer reads as "normal".
#[test]
fn test_resumer_status_is_normal() {
    let mut st = State::new();
    install_base(&mut st);
    let body = with_env(proto(
        2,
        0,
        vec![s("mainstatus")],
        vec![
            abc(GetTabUp, 0, 0, k(0)),
            abc(Call, 0, 1, 2), // R0 = mainstatus()
            abc(Return, 0, 2, 0),
        ],
    ));
    let co = st.new_thread();
    st.load(Rc::new(body));
    let main = st.current_thread();
    st.xmove(main, co, 1);
    st.pop();

    assert_eq!(st.resume(co, 0), Resume::Return(1));
    let status = st.to_rust_string(-1).unwrap();
    assert_eq!(status, "normal");
    st.set_top(0);
}

/// yieldable() is false on the main thread, true inside a coroutine.
#[test]
fn test_is_yieldable() {
    let mut st = State::new();
    install_base(&mut st);
    assert!(!st.is_yieldable());

    let body = with_env(proto(
        2,
        0,
        vec![s("yieldable")],
        vec![
            abc(GetTabUp, 0, 0, k(0)),
            abc(Call, 0, 1, 2),
            abc(Return, 0, 2, 0),
        ],
    ));
    let co = st.new_thread();
    st.load(Rc::new(body));
    let main = st.current_thread();
    st.xmove(main, co, 1);
    st.pop();
    assert_eq!(st.resume(co, 0), Resume::Return(1));
    assert_eq!(st.pop(), Value::Bool(true));
}

/// Nested coroutines: the inner yield is caught by the inner resume, and
/// the outer coroutine relays a value of its own before finishing.
#[test]
fn test_nested_coroutines() {
    let mut st = State::new();
    install_base(&mut st);

    // co2 body: yield(2); return 0
    let co2_body = with_env(proto(
        2,
        0,
        vec![s("yield"), int(2), int(0)],
        vec![
            abc(GetTabUp, 0, 0, k(0)),
            abx(LoadK, 1, 1),
            abc(Call, 0, 2, 1),
            abx(LoadK, 0, 2),
            abc(Return, 0, 2, 0),
        ],
    ));
    // co1 body(co2): local ok, v = resume(co2); yield(v + 1); return 99
    let co1_body = with_env(proto(
        5,
        1,
        vec![s("resume"), s("yield"), int(1), int(99)],
        vec![
            abc(GetTabUp, 1, 0, k(0)),
            abc(Move, 2, 0, 0),
            abc(Call, 1, 2, 3), // R1, R2 = resume(co2) -> true, 2
            abc(GetTabUp, 3, 0, k(1)),
            abc(Add, 4, 2, k(2)),
            abc(Call, 3, 2, 1), // yield(3)
            abx(LoadK, 1, 3),
            abc(Return, 1, 2, 0),
        ],
    ));

    let main = st.current_thread();
    let co2 = st.new_thread();
    st.load(Rc::new(co2_body));
    st.xmove(main, co2, 1);
    st.pop();
    let co1 = st.new_thread();
    st.load(Rc::new(co1_body));
    st.xmove(main, co1, 1);
    st.pop();

    st.push(Value::Thread(co2));
    assert_eq!(st.resume(co1, 1), Resume::Yield(1));
    assert_eq!(st.pop(), Value::integer(3));
    assert_eq!(st.status_of(co1), "suspended");
    assert_eq!(st.status_of(co2), "suspended");

    assert_eq!(st.resume(co1, 0), Resume::Return(1));
    assert_eq!(st.pop(), Value::integer(99));
    assert_eq!(st.status_of(co1), "dead");
}

/// Resuming a fresh thread with no body reports a dead coroutine.
#[test]
fn test_resume_empty_thread() {
    let mut st = State::new();
    let co = st.new_thread();
    st.pop();
    assert_eq!(st.resume(co, 0), Resume::Error);
    let msg = st.to_rust_string(-1).unwrap();
    assert!(msg.contains("dead coroutine"));
    st.set_top(0);
}
