use super::helpers::*;
use lunette_core::instruction::OpCode::*;
use lunette_core::value::Value;
use lunette_vm::{State, VmError};

/// local ok, err = pcall(function() error("boom") end)
/// return ok, err   --> false, "...boom"
#[test]
fn test_pcall_catches_error() {
    let mut st = State::new();
    install_base(&mut st);
    let failing = with_env(proto(
        2,
        0,
        vec![s("error"), s("boom")],
        vec![
            abc(GetTabUp, 0, 0, k(0)),
            abx(LoadK, 1, 1),
            abc(Call, 0, 2, 1),
            abc(Return, 0, 1, 0),
        ],
    ));
    let main = with_children(
        with_env(proto(
            3,
            0,
            vec![s("pcall")],
            vec![
                abc(GetTabUp, 0, 0, k(0)),
                abx(Closure, 1, 0),
                abc(Call, 0, 2, 3),
                abc(Return, 0, 3, 0),
            ],
        )),
        vec![failing],
    );
    let r = run_proto(&mut st, main, &[]);
    assert_eq!(r[0], Value::Bool(false));
    let msg = str_of(&st, r[1]);
    assert!(msg.contains("boom"), "error message was {msg:?}");
    assert!(msg.contains("@test"), "position prefix missing from {msg:?}");

    // The state stays usable after recovery.
    let p = proto(
        1,
        0,
        vec![int(7)],
        vec![abx(LoadK, 0, 0), abc(Return, 0, 2, 0)],
    );
    assert_ints(&run_proto(&mut st, p, &[]), &[7]);
}

#[test]
fn test_pcall_success_passes_results_through() {
    let mut st = State::new();
    install_base(&mut st);
    let fine = proto(
        2,
        0,
        vec![int(1), int(2)],
        vec![
            abx(LoadK, 0, 0),
            abx(LoadK, 1, 1),
            abc(Return, 0, 3, 0),
        ],
    );
    let main = with_children(
        with_env(proto(
            4,
            0,
            vec![s("pcall")],
            vec![
                abc(GetTabUp, 0, 0, k(0)),
                abx(Closure, 1, 0),
                abc(Call, 0, 2, 4),
                abc(Return, 0, 4, 0),
            ],
        )),
        vec![fine],
    );
    let r = run_proto(&mut st, main, &[]);
    assert_eq!(r[0], Value::Bool(true));
    assert_ints(&r[1..], &[1, 2]);
}

/// error with a non-string value surfaces that exact value.
#[test]
fn test_error_with_non_string_value() {
    let mut st = State::new();
    install_base(&mut st);
    let failing = with_env(proto(
        2,
        0,
        vec![s("error"), int(42)],
        vec![
            abc(GetTabUp, 0, 0, k(0)),
            abx(LoadK, 1, 1),
            abc(Call, 0, 2, 1),
            abc(Return, 0, 1, 0),
        ],
    ));
    let main = with_children(
        with_env(proto(
            3,
            0,
            vec![s("pcall")],
            vec![
                abc(GetTabUp, 0, 0, k(0)),
                abx(Closure, 1, 0),
                abc(Call, 0, 2, 3),
                abc(Return, 0, 3, 0),
            ],
        )),
        vec![failing],
    );
    let r = run_proto(&mut st, main, &[]);
    assert_eq!(r[0], Value::Bool(false));
    assert_eq!(r[1], Value::integer(42));
}

#[test]
fn test_nested_pcall_inner_catches() {
    let mut st = State::new();
    install_base(&mut st);
    // inner = function() error("inner") end
    let inner = with_env(proto(
        2,
        0,
        vec![s("error"), s("inner")],
        vec![
            abc(GetTabUp, 0, 0, k(0)),
            abx(LoadK, 1, 1),
            abc(Call, 0, 2, 1),
            abc(Return, 0, 1, 0),
        ],
    ));
    // mid = function() local ok = pcall(inner); return ok, "survived" end
    let mid = with_children(
        with_env(proto(
            3,
            0,
            vec![s("pcall"), s("survived")],
            vec![
                abc(GetTabUp, 0, 0, k(0)),
                abx(Closure, 1, 0),
                abc(Call, 0, 2, 2),
                abx(LoadK, 1, 1),
                abc(Return, 0, 3, 0),
            ],
        )),
        vec![inner],
    );
    // main = function() return pcall(mid) end
    let main = with_children(
        with_env(proto(
            4,
            0,
            vec![s("pcall")],
            vec![
                abc(GetTabUp, 0, 0, k(0)),
                abx(Closure, 1, 0),
                abc(Call, 0, 2, 4),
                abc(Return, 0, 4, 0),
            ],
        )),
        vec![mid],
    );
    let r = run_proto(&mut st, main, &[]);
    assert_eq!(r[0], Value::Bool(true)); // outer pcall: mid succeeded
    assert_eq!(r[1], Value::Bool(false)); // inner pcall caught the error
    assert_eq!(str_of(&st, r[2]), "survived");
}

/// API-level pcall: error value on top, stack shape restored.
#[test]
fn test_api_pcall_stack_shape() {
    let mut st = State::new();
    st.push_integer(111); // untouched ballast below the call
    let failing = proto(
        2,
        0,
        vec![int(5)],
        vec![
            abc(LoadNil, 0, 0, 0),
            abc(Add, 1, 0, k(0)), // nil + 5 raises
            abc(Return, 1, 2, 0),
        ],
    );
    st.load(std::rc::Rc::new(failing));
    st.push_integer(1); // an argument, discarded on failure
    let err = st.pcall(1, -1, 0).unwrap_err();
    assert!(matches!(err, VmError::Arith(_)));
    // ballast + the error value
    assert_eq!(st.get_top(), 2);
    assert_eq!(st.get(1), Value::integer(111));
    assert!(st.get(-1).is_string());
    st.assert_frame_invariants();
}

#[test]
fn test_unprotected_call_unwinds_before_surfacing() {
    let mut st = State::new();
    let failing = proto(
        2,
        0,
        vec![int(5)],
        vec![
            abc(LoadNil, 0, 0, 0),
            abc(Add, 1, 0, k(0)),
            abc(Return, 1, 2, 0),
        ],
    );
    let e = run_proto_err(&mut st, failing, &[]);
    assert!(matches!(e, VmError::Arith(_)));
    st.assert_frame_invariants();
}
