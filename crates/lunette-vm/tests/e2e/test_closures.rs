use super::helpers::*;
use lunette_core::instruction::OpCode::*;
use lunette_vm::State;

/// local x = 1
/// local f = function() x = x + 1; return x end
/// return f(), f(), f()   --> 2, 3, 4
#[test]
fn test_counter_closure_captures_local() {
    let mut st = State::new();
    let counter = with_upvals(
        proto(
            2,
            0,
            vec![int(1)],
            vec![
                abc(GetUpval, 0, 0, 0),
                abc(Add, 0, 0, k(0)),
                abc(SetUpval, 0, 0, 0),
                abc(Return, 0, 2, 0),
            ],
        ),
        &[(true, 0)],
    );
    let main = with_children(
        proto(
            5,
            0,
            vec![int(1)],
            vec![
                abx(LoadK, 0, 0),
                abx(Closure, 1, 0),
                abc(Move, 2, 1, 0),
                abc(Call, 2, 1, 2),
                abc(Move, 3, 1, 0),
                abc(Call, 3, 1, 2),
                abc(Move, 4, 1, 0),
                abc(Call, 4, 1, 2),
                abc(Return, 2, 4, 0),
            ],
        ),
        vec![counter],
    );
    assert_ints(&run_proto(&mut st, main, &[]), &[2, 3, 4]);
}

/// Two closures over the same local share one cell, before and after the
/// scope closes.
#[test]
fn test_sibling_closures_share_upvalue() {
    let mut st = State::new();
    let inc = with_upvals(
        proto(
            2,
            0,
            vec![int(1)],
            vec![
                abc(GetUpval, 0, 0, 0),
                abc(Add, 0, 0, k(0)),
                abc(SetUpval, 0, 0, 0),
                abc(Return, 0, 1, 0),
            ],
        ),
        &[(true, 0)],
    );
    let get = with_upvals(
        proto(
            1,
            0,
            vec![],
            vec![abc(GetUpval, 0, 0, 0), abc(Return, 0, 2, 0)],
        ),
        &[(true, 0)],
    );
    let main = with_children(
        proto(
            5,
            0,
            vec![int(0)],
            vec![
                abx(LoadK, 0, 0),    // x = 0
                abx(Closure, 1, 0),  // inc
                abx(Closure, 2, 1),  // get
                abc(Move, 3, 1, 0),
                abc(Call, 3, 1, 1),  // inc(): x = 1  (through the open upvalue)
                asbx(Jmp, 1, 0),     // close upvalues from R0 up; scope exits
                abc(Move, 3, 1, 0),
                abc(Call, 3, 1, 1),  // inc(): x = 2  (now through the closed cell)
                abc(Move, 3, 2, 0),
                abc(Call, 3, 1, 2),  // R3 = get()
                abc(Return, 3, 2, 0),
            ],
        ),
        vec![inc, get],
    );
    assert_ints(&run_proto(&mut st, main, &[]), &[2]);
}

/// An upvalue inherited through an intermediate closure still reaches the
/// original cell.
#[test]
fn test_upvalue_inherited_two_levels() {
    let mut st = State::new();
    // innermost: returns grandparent's x
    let inner = with_upvals(
        proto(
            1,
            0,
            vec![],
            vec![abc(GetUpval, 0, 0, 0), abc(Return, 0, 2, 0)],
        ),
        &[(false, 0)],
    );
    // middle: builds and returns innermost, passing its own upvalue down
    let middle = with_children(
        with_upvals(
            proto(
                1,
                0,
                vec![],
                vec![abx(Closure, 0, 0), abc(Return, 0, 2, 0)],
            ),
            &[(true, 0)],
        ),
        vec![inner],
    );
    let main = with_children(
        proto(
            4,
            0,
            vec![int(77)],
            vec![
                abx(LoadK, 0, 0),   // x = 77
                abx(Closure, 1, 0), // middle (captures x)
                abc(Move, 2, 1, 0),
                abc(Call, 2, 1, 2), // R2 = middle() = inner
                abc(Move, 3, 2, 0),
                abc(Call, 3, 1, 2), // R3 = inner() = 77
                abc(Return, 3, 2, 0),
            ],
        ),
        vec![middle],
    );
    assert_ints(&run_proto(&mut st, main, &[]), &[77]);
}

/// Frames unwound by a protected call still close their open upvalues, so a
/// closure that escaped before the error observes the captured value.
#[test]
fn test_error_unwind_closes_upvalues() {
    let mut st = State::new();
    install_base(&mut st);

    let getter = with_upvals(
        proto(
            1,
            0,
            vec![],
            vec![abc(GetUpval, 0, 0, 0), abc(Return, 0, 2, 0)],
        ),
        &[(true, 0)],
    );
    // local v = 99; _G.g = getter; error("boom")
    let failing = with_children(
        with_env(proto(
            4,
            0,
            vec![int(99), s("g"), s("error"), s("boom")],
            vec![
                abx(LoadK, 0, 0),
                abx(Closure, 1, 0),
                abc(SetTabUp, 0, k(1), 1),
                abc(GetTabUp, 2, 0, k(2)),
                abx(LoadK, 3, 3),
                abc(Call, 2, 2, 1),
                abc(Return, 0, 1, 0),
            ],
        )),
        vec![getter],
    );
    // pcall(failing); return _G.g()
    let main = with_children(
        with_env(proto(
            3,
            0,
            vec![s("pcall"), s("g")],
            vec![
                abc(GetTabUp, 0, 0, k(0)),
                abx(Closure, 1, 0),
                abc(Call, 0, 2, 1),
                abc(GetTabUp, 2, 0, k(1)),
                abc(Call, 2, 1, 2),
                abc(Return, 2, 2, 0),
            ],
        )),
        vec![failing],
    );
    assert_ints(&run_proto(&mut st, main, &[]), &[99]);
}
