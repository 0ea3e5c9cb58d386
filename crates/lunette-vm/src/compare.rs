//! Raw equality and ordering. Metamethod fallback happens a layer up.

use lunette_core::string::Interner;
use lunette_core::value::{Number, Value};

/// Raw equality: numbers compare across subtypes by float value, strings by
/// content (ids are canonical), everything heap-resident by identity.
pub fn raw_eq(a: Value, b: Value) -> bool {
    match (a, b) {
        (Value::Nil, Value::Nil) => true,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::Number(Number::Int(x)), Value::Number(Number::Int(y))) => x == y,
        (Value::Number(x), Value::Number(y)) => x.as_float() == y.as_float(),
        (Value::Str(x), Value::Str(y)) => x == y,
        (Value::Table(x), Value::Table(y)) => x == y,
        (Value::Closure(x), Value::Closure(y)) => x == y,
        (Value::UserData(x), Value::UserData(y)) => x == y,
        (Value::Thread(x), Value::Thread(y)) => x == y,
        _ => false,
    }
}

/// Raw `<`. `None` means the pair is not orderable without a metamethod.
pub fn lt(a: Value, b: Value, strings: &Interner) -> Option<bool> {
    match (a, b) {
        (Value::Number(Number::Int(x)), Value::Number(Number::Int(y))) => Some(x < y),
        (Value::Number(x), Value::Number(y)) => Some(x.as_float() < y.as_float()),
        (Value::Str(x), Value::Str(y)) => Some(strings.get(x) < strings.get(y)),
        _ => None,
    }
}

/// Raw `<=`.
pub fn le(a: Value, b: Value, strings: &Interner) -> Option<bool> {
    match (a, b) {
        (Value::Number(Number::Int(x)), Value::Number(Number::Int(y))) => Some(x <= y),
        (Value::Number(x), Value::Number(y)) => Some(x.as_float() <= y.as_float()),
        (Value::Str(x), Value::Str(y)) => Some(strings.get(x) <= strings.get(y)),
        _ => None,
    }
}
