use super::helpers::*;
use lunette_core::instruction::OpCode::*;
use lunette_core::value::Value;
use lunette_vm::{State, VmError};

#[test]
fn test_load_constants_and_return() {
    let mut st = State::new();
    let p = proto(
        5,
        0,
        vec![int(1), num(2.5), s("hi")],
        vec![
            abx(LoadK, 0, 0),
            abx(LoadK, 1, 1),
            abx(LoadK, 2, 2),
            abc(LoadBool, 3, 1, 0),
            abc(LoadNil, 4, 0, 0),
            abc(Return, 0, 6, 0),
        ],
    );
    let r = run_proto(&mut st, p, &[]);
    assert_eq!(r.len(), 5);
    assert_eq!(r[0], Value::integer(1));
    assert_eq!(r[1], Value::float(2.5));
    assert_eq!(str_of(&st, r[2]), "hi");
    assert_eq!(r[3], Value::Bool(true));
    assert_eq!(r[4], Value::Nil);
}

#[test]
fn test_move() {
    let mut st = State::new();
    let p = proto(
        2,
        0,
        vec![int(7)],
        vec![
            abx(LoadK, 0, 0),
            abc(Move, 1, 0, 0),
            abc(Return, 1, 2, 0),
        ],
    );
    assert_ints(&run_proto(&mut st, p, &[]), &[7]);
}

#[test]
fn test_arith_rk_operands() {
    let mut st = State::new();
    // 2+3, 7//2, 7%3, 2^10, 10/4
    let p = proto(
        5,
        0,
        vec![int(2), int(3), int(7), int(10), int(4)],
        vec![
            abc(Add, 0, k(0), k(1)),
            abc(IDiv, 1, k(2), k(0)),
            abc(Mod, 2, k(2), k(1)),
            abc(Pow, 3, k(0), k(3)),
            abc(Div, 4, k(3), k(4)),
            abc(Return, 0, 6, 0),
        ],
    );
    let r = run_proto(&mut st, p, &[]);
    assert_eq!(r[0], Value::integer(5));
    assert_eq!(r[1], Value::integer(3));
    assert_eq!(r[2], Value::integer(1));
    assert_eq!(r[3], Value::float(1024.0));
    assert_eq!(r[4], Value::float(2.5));
}

#[test]
fn test_bitwise_ops() {
    let mut st = State::new();
    let p = proto(
        4,
        0,
        vec![int(0b1100), int(0b1010), int(1), int(3)],
        vec![
            abc(BAnd, 0, k(0), k(1)),
            abc(BOr, 1, k(0), k(1)),
            abc(Shl, 2, k(2), k(3)),
            abc(BNot, 3, 2, 0), // ~R2
            abc(Return, 0, 5, 0),
        ],
    );
    let r = run_proto(&mut st, p, &[]);
    assert_eq!(r[0], Value::integer(0b1000));
    assert_eq!(r[1], Value::integer(0b1110));
    assert_eq!(r[2], Value::integer(8));
    assert_eq!(r[3], Value::integer(!8));
}

#[test]
fn test_comparison_branching() {
    // if 1 < 2 then return 10 else return 20 end
    let mut st = State::new();
    let p = proto(
        1,
        0,
        vec![int(1), int(2), int(20), int(10)],
        vec![
            abc(Lt, 1, k(0), k(1)),
            asbx(Jmp, 0, 2),
            abx(LoadK, 0, 2),
            abc(Return, 0, 2, 0),
            abx(LoadK, 0, 3),
            abc(Return, 0, 2, 0),
        ],
    );
    assert_ints(&run_proto(&mut st, p, &[]), &[10]);

    // 2 < 1 takes the other branch.
    let mut st = State::new();
    let p = proto(
        1,
        0,
        vec![int(2), int(1), int(20), int(10)],
        vec![
            abc(Lt, 1, k(0), k(1)),
            asbx(Jmp, 0, 2),
            abx(LoadK, 0, 2),
            abc(Return, 0, 2, 0),
            abx(LoadK, 0, 3),
            abc(Return, 0, 2, 0),
        ],
    );
    assert_ints(&run_proto(&mut st, p, &[]), &[20]);
}

#[test]
fn test_testset_implements_or() {
    // return a or b
    let or_proto = || {
        proto(
            3,
            2,
            vec![],
            vec![
                abc(TestSet, 2, 0, 1),
                asbx(Jmp, 0, 1),
                abc(Move, 2, 1, 0),
                abc(Return, 2, 2, 0),
            ],
        )
    };
    let mut st = State::new();
    let r = run_proto(&mut st, or_proto(), &[Value::Nil, Value::integer(5)]);
    assert_ints(&r, &[5]);
    let mut st = State::new();
    let r = run_proto(&mut st, or_proto(), &[Value::integer(7), Value::integer(5)]);
    assert_ints(&r, &[7]);
}

#[test]
fn test_concat_strings_and_numbers() {
    let mut st = State::new();
    let p = proto(
        4,
        0,
        vec![s("a"), s("b"), int(1)],
        vec![
            abx(LoadK, 0, 0),
            abx(LoadK, 1, 1),
            abx(LoadK, 2, 2),
            abc(Concat, 3, 0, 2),
            abc(Return, 3, 2, 0),
        ],
    );
    let r = run_proto(&mut st, p, &[]);
    assert_eq!(str_of(&st, r[0]), "ab1");
}

#[test]
fn test_len_not_unm() {
    let mut st = State::new();
    let p = proto(
        4,
        0,
        vec![s("hello")],
        vec![
            abx(LoadK, 0, 0),
            abc(Len, 1, 0, 0),
            abc(Unm, 2, 1, 0), // -#s
            abc(Not, 3, 0, 0),
            abc(Return, 1, 4, 0),
        ],
    );
    let r = run_proto(&mut st, p, &[]);
    assert_eq!(r[0], Value::integer(5));
    assert_eq!(r[1], Value::integer(-5));
    assert_eq!(r[2], Value::Bool(false)); // not "hello"
}

#[test]
fn test_string_arith_coercion() {
    // "10" + 5 == 15 (integer)
    let mut st = State::new();
    let p = proto(
        1,
        0,
        vec![s("10"), int(5)],
        vec![abc(Add, 0, k(0), k(1)), abc(Return, 0, 2, 0)],
    );
    let r = run_proto(&mut st, p, &[]);
    assert_eq!(r[0], Value::integer(15));
}

#[test]
fn test_arith_error_without_metamethod() {
    let mut st = State::new();
    // nil + 1
    let p = proto(
        2,
        0,
        vec![int(1)],
        vec![
            abc(LoadNil, 0, 0, 0),
            abc(Add, 1, 0, k(0)),
            abc(Return, 1, 2, 0),
        ],
    );
    let e = run_proto_err(&mut st, p, &[]);
    assert!(matches!(e, VmError::Arith(_)), "got {e:?}");
    assert!(e.to_string().contains("attempt to perform arithmetic"));
}

#[test]
fn test_integer_division_by_zero_raises() {
    let mut st = State::new();
    let p = proto(
        1,
        0,
        vec![int(1), int(0)],
        vec![abc(IDiv, 0, k(0), k(1)), abc(Return, 0, 2, 0)],
    );
    let e = run_proto_err(&mut st, p, &[]);
    assert!(matches!(e, VmError::Arith(_)));
}

#[test]
fn test_runaway_recursion_overflows() {
    // f = function() return f() end (via a global); f()
    let mut st = State::new();
    let f = with_env(proto(
        2,
        0,
        vec![s("f")],
        vec![
            abc(GetTabUp, 0, 0, k(0)),
            abc(Call, 0, 1, 1),
            abc(Return, 0, 1, 0),
        ],
    ));
    let main = with_env(with_children(
        proto(
            2,
            0,
            vec![s("f")],
            vec![
                abx(Closure, 0, 0),
                abc(SetTabUp, 0, k(0), 0),
                abc(GetTabUp, 1, 0, k(0)),
                abc(Call, 1, 1, 1),
                abc(Return, 0, 1, 0),
            ],
        ),
        vec![f],
    ));
    let e = run_proto_err(&mut st, main, &[]);
    assert_eq!(e, VmError::StackOverflow);
}
