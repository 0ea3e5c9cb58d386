use super::helpers::*;
use lunette_core::instruction::OpCode::*;
use lunette_vm::{State, VmError};

#[test]
fn test_newtable_settable_gettable() {
    let mut st = State::new();
    // local t = {}; t["x"] = 42; return t["x"]
    let p = proto(
        2,
        0,
        vec![s("x"), int(42)],
        vec![
            abc(NewTable, 0, 0, 1),
            abc(SetTable, 0, k(0), k(1)),
            abc(GetTable, 1, 0, k(0)),
            abc(Return, 1, 2, 0),
        ],
    );
    assert_ints(&run_proto(&mut st, p, &[]), &[42]);
}

#[test]
fn test_setlist_constructor_and_len() {
    let mut st = State::new();
    // local t = {10, 20, 30}; return #t, t[2]
    let p = proto(
        5,
        0,
        vec![int(10), int(20), int(30), int(2)],
        vec![
            abc(NewTable, 0, 3, 0),
            abx(LoadK, 1, 0),
            abx(LoadK, 2, 1),
            abx(LoadK, 3, 2),
            abc(SetList, 0, 3, 1),
            abc(Len, 1, 0, 0),
            abc(GetTable, 2, 0, k(3)),
            abc(Return, 1, 3, 0),
        ],
    );
    assert_ints(&run_proto(&mut st, p, &[]), &[3, 20]);
}

/// SETLIST with an open item count collects a call's results.
#[test]
fn test_setlist_with_open_count() {
    let mut st = State::new();
    // local t = {f()}; return #t
    let f = proto(
        3,
        0,
        vec![int(1), int(2), int(3)],
        vec![
            abx(LoadK, 0, 0),
            abx(LoadK, 1, 1),
            abx(LoadK, 2, 2),
            abc(Return, 0, 4, 0),
        ],
    );
    let main = with_children(
        proto(
            3,
            0,
            vec![],
            vec![
                abx(Closure, 0, 0),
                abc(NewTable, 1, 0, 0),
                abc(Move, 2, 0, 0),
                abc(Call, 2, 1, 0), // open result count
                abc(SetList, 1, 0, 1),
                abc(Len, 2, 1, 0),
                abc(Return, 2, 2, 0),
            ],
        ),
        vec![f],
    );
    assert_ints(&run_proto(&mut st, main, &[]), &[3]);
}

/// SELF prepares a method call: t:f() passes t as the receiver.
#[test]
fn test_self_method_call() {
    let mut st = State::new();
    let method = proto(
        2,
        1,
        vec![s("v")],
        vec![abc(GetTable, 1, 0, k(0)), abc(Return, 1, 2, 0)],
    );
    let main = with_children(
        proto(
            6,
            0,
            vec![s("f"), s("v"), int(42)],
            vec![
                abc(NewTable, 0, 0, 2),
                abx(Closure, 1, 0),
                abc(SetTable, 0, k(0), 1),
                abc(SetTable, 0, k(1), k(2)),
                abc(Self_, 2, 0, k(0)),
                abc(Call, 2, 2, 2),
                abc(Return, 2, 2, 0),
            ],
        ),
        vec![method],
    );
    assert_ints(&run_proto(&mut st, main, &[]), &[42]);
}

#[test]
fn test_indexing_nil_errors() {
    let mut st = State::new();
    // local x; return x.y
    let p = proto(
        2,
        0,
        vec![s("y")],
        vec![
            abc(LoadNil, 0, 0, 0),
            abc(GetTable, 1, 0, k(0)),
            abc(Return, 1, 2, 0),
        ],
    );
    let e = run_proto_err(&mut st, p, &[]);
    assert!(matches!(e, VmError::Index(_)), "got {e:?}");
    assert!(e.to_string().contains("attempt to index a nil value"));
}

#[test]
fn test_nil_table_key_errors() {
    let mut st = State::new();
    // local t = {}; t[nil] = 1
    let p = proto(
        2,
        0,
        vec![int(1)],
        vec![
            abc(NewTable, 0, 0, 0),
            abc(LoadNil, 1, 0, 0),
            abc(SetTable, 0, 1, k(0)),
            abc(Return, 0, 1, 0),
        ],
    );
    let e = run_proto_err(&mut st, p, &[]);
    assert!(e.to_string().contains("table index is nil"));
}

#[test]
fn test_float_keys_alias_integer_slots() {
    let mut st = State::new();
    // t[1] = 7; return t[1.0]
    let p = proto(
        2,
        0,
        vec![int(1), num(1.0), int(7)],
        vec![
            abc(NewTable, 0, 1, 0),
            abc(SetTable, 0, k(0), k(2)),
            abc(GetTable, 1, 0, k(1)),
            abc(Return, 1, 2, 0),
        ],
    );
    assert_ints(&run_proto(&mut st, p, &[]), &[7]);
}

/// NEWTABLE size hints travel through the floating-byte encoding.
#[test]
fn test_newtable_floating_byte_hints() {
    let mut st = State::new();
    // Hints only affect capacity; behavior stays the same.
    let p = proto(
        2,
        0,
        vec![int(5)],
        vec![
            abc(NewTable, 0, 17, 9), // decodes to 18 and 9
            abc(SetTable, 0, k(0), k(0)),
            abc(GetTable, 1, 0, k(0)),
            abc(Return, 1, 2, 0),
        ],
    );
    assert_ints(&run_proto(&mut st, p, &[]), &[5]);
}
