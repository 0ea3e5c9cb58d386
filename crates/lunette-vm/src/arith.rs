//! Arithmetic and bitwise kernels with the metamethod-fallback policy.
//!
//! Each operator pairs an optional integer kernel with an optional float
//! kernel. The integer path runs when both operands coerce to integer and
//! the kernel exists; otherwise the float path; otherwise the caller falls
//! back to the operator's metamethod. Bitwise operators are integer-only
//! and fail outright when a number refuses integer coercion.

use crate::coerce;
use crate::error::VmError;
use lunette_core::string::Interner;
use lunette_core::value::Value;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(usize)]
pub enum ArithOp {
    Add = 0,
    Sub,
    Mul,
    Mod,
    Pow,
    Div,
    IDiv,
    BAnd,
    BOr,
    BXor,
    Shl,
    Shr,
    Unm,
    BNot,
}

impl ArithOp {
    pub fn is_unary(self) -> bool {
        matches!(self, ArithOp::Unm | ArithOp::BNot)
    }

    pub fn metamethod(self) -> &'static str {
        OPERATORS[self as usize].metamethod
    }
}

type IntFn = fn(i64, i64) -> Result<i64, VmError>;
type FloatFn = fn(f64, f64) -> f64;

pub struct Operator {
    pub metamethod: &'static str,
    pub int_fn: Option<IntFn>,
    pub float_fn: Option<FloatFn>,
}

pub static OPERATORS: [Operator; 14] = [
    Operator { metamethod: "__add", int_fn: Some(int_add), float_fn: Some(|a, b| a + b) },
    Operator { metamethod: "__sub", int_fn: Some(int_sub), float_fn: Some(|a, b| a - b) },
    Operator { metamethod: "__mul", int_fn: Some(int_mul), float_fn: Some(|a, b| a * b) },
    Operator { metamethod: "__mod", int_fn: Some(int_mod), float_fn: Some(float_mod) },
    Operator { metamethod: "__pow", int_fn: None, float_fn: Some(|a, b| a.powf(b)) },
    Operator { metamethod: "__div", int_fn: None, float_fn: Some(|a, b| a / b) },
    Operator { metamethod: "__idiv", int_fn: Some(int_idiv), float_fn: Some(|a, b| (a / b).floor()) },
    Operator { metamethod: "__band", int_fn: Some(|a, b| Ok(a & b)), float_fn: None },
    Operator { metamethod: "__bor", int_fn: Some(|a, b| Ok(a | b)), float_fn: None },
    Operator { metamethod: "__bxor", int_fn: Some(|a, b| Ok(a ^ b)), float_fn: None },
    Operator { metamethod: "__shl", int_fn: Some(|a, b| Ok(shift_left(a, b))), float_fn: None },
    Operator { metamethod: "__shr", int_fn: Some(|a, b| Ok(shift_right(a, b))), float_fn: None },
    Operator { metamethod: "__unm", int_fn: Some(|a, _| Ok(a.wrapping_neg())), float_fn: Some(|a, _| -a) },
    Operator { metamethod: "__bnot", int_fn: Some(|a, _| Ok(!a)), float_fn: None },
];

fn int_add(a: i64, b: i64) -> Result<i64, VmError> {
    Ok(a.wrapping_add(b))
}

fn int_sub(a: i64, b: i64) -> Result<i64, VmError> {
    Ok(a.wrapping_sub(b))
}

fn int_mul(a: i64, b: i64) -> Result<i64, VmError> {
    Ok(a.wrapping_mul(b))
}

/// Floor division; `i64::MIN // -1` wraps.
fn int_idiv(a: i64, b: i64) -> Result<i64, VmError> {
    if b == 0 {
        return Err(VmError::Arith("attempt to perform 'n//0'".to_string()));
    }
    let d = a.wrapping_div(b);
    let r = a.wrapping_rem(b);
    Ok(if r != 0 && (r ^ b) < 0 { d - 1 } else { d })
}

/// Floor modulo: the result takes the divisor's sign.
fn int_mod(a: i64, b: i64) -> Result<i64, VmError> {
    if b == 0 {
        return Err(VmError::Arith("attempt to perform 'n%0'".to_string()));
    }
    let r = a.wrapping_rem(b);
    Ok(if r != 0 && (r ^ b) < 0 {
        r.wrapping_add(b)
    } else {
        r
    })
}

/// Float floor modulo: `a - floor(a/b)*b`, via sign correction of the IEEE
/// truncated remainder. Division by zero follows IEEE (NaN).
fn float_mod(a: f64, b: f64) -> f64 {
    let r = a % b;
    if r != 0.0 && (r > 0.0) != (b > 0.0) {
        r + b
    } else {
        r
    }
}

/// Shift left; negative counts shift the other way, |n| >= 64 yields 0.
pub fn shift_left(a: i64, n: i64) -> i64 {
    if n <= -64 || n >= 64 {
        0
    } else if n < 0 {
        shift_right(a, -n)
    } else {
        ((a as u64) << n as u32) as i64
    }
}

/// Logical (unsigned) shift right.
pub fn shift_right(a: i64, n: i64) -> i64 {
    if n <= -64 || n >= 64 {
        0
    } else if n < 0 {
        shift_left(a, -n)
    } else {
        ((a as u64) >> n as u32) as i64
    }
}

/// Run the kernels for `op`. `Ok(None)` means no numeric path applied and
/// the caller should try the metamethod.
pub fn raw_arith(
    op: ArithOp,
    a: Value,
    b: Value,
    strings: &Interner,
) -> Result<Option<Value>, VmError> {
    let desc = &OPERATORS[op as usize];
    if desc.float_fn.is_none() {
        // Integer-only (bitwise) operator.
        let int_fn = desc.int_fn.expect("bitwise operator without kernel");
        let (ia, ib) = match (coerce::to_integer(a, strings), coerce::to_integer(b, strings)) {
            (Some(ia), Some(ib)) => (ia, ib),
            _ => {
                // A number that refuses integer coercion fails the op; a
                // non-number gets a chance at its metamethod.
                let offender = if coerce::to_integer(a, strings).is_none() { a } else { b };
                if coerce::to_number(offender, strings).is_some() {
                    return Err(VmError::Arith(
                        "number has no integer representation".to_string(),
                    ));
                }
                return Ok(None);
            }
        };
        return int_fn(ia, ib).map(|i| Some(Value::integer(i)));
    }
    if desc.int_fn.is_some() {
        if let (Some(ia), Some(ib)) =
            (coerce::to_integer(a, strings), coerce::to_integer(b, strings))
        {
            let int_fn = desc.int_fn.expect("checked above");
            return int_fn(ia, ib).map(|i| Some(Value::integer(i)));
        }
    }
    if let (Some(fa), Some(fb)) = (coerce::to_number(a, strings), coerce::to_number(b, strings)) {
        let float_fn = desc.float_fn.expect("checked above");
        return Ok(Some(Value::float(float_fn(fa, fb))));
    }
    Ok(None)
}
