//! Coercions between numbers and strings.
//!
//! String parses trim surrounding whitespace and try integer forms first
//! (decimal, then 0x hex with wraparound), then float forms including hex
//! floats and exponents. A float coerces to integer only when the
//! conversion round-trips exactly.

use lunette_core::string::Interner;
use lunette_core::value::{exact_int, Number, Value};

/// Widen a value to float: numbers directly, strings by parsing.
pub fn to_number(v: Value, strings: &Interner) -> Option<f64> {
    match v {
        Value::Number(n) => Some(n.as_float()),
        Value::Str(s) => parse_number(std::str::from_utf8(strings.get(s)).ok()?)
            .map(|n| n.as_float()),
        _ => None,
    }
}

/// Narrow a value to integer: integers directly, floats and numeric strings
/// when the value round-trips.
pub fn to_integer(v: Value, strings: &Interner) -> Option<i64> {
    match v {
        Value::Number(Number::Int(i)) => Some(i),
        Value::Number(Number::Float(f)) => exact_int(f),
        Value::Str(s) => match parse_number(std::str::from_utf8(strings.get(s)).ok()?)? {
            Number::Int(i) => Some(i),
            Number::Float(f) => exact_int(f),
        },
        _ => None,
    }
}

/// Parse a numeric literal. Integer parses take priority over float parses.
pub fn parse_number(s: &str) -> Option<Number> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    let unsigned = s.strip_prefix(['-', '+']).unwrap_or(s);
    if unsigned.starts_with("0x") || unsigned.starts_with("0X") {
        if unsigned.contains(['.', 'p', 'P']) {
            return parse_hex_float(s).map(Number::Float);
        }
        return parse_hex_int(s).map(Number::Int);
    }
    if let Ok(i) = s.parse::<i64>() {
        return Some(Number::Int(i));
    }
    // Reject the "inf"/"nan" words Rust accepts but the language does not.
    let lower = unsigned.to_ascii_lowercase();
    if lower.starts_with("inf") || lower.starts_with("nan") {
        return None;
    }
    s.parse::<f64>().ok().map(Number::Float)
}

/// Hex integer with unsigned wraparound on overflow.
fn parse_hex_int(s: &str) -> Option<i64> {
    let (neg, rest) = match s.strip_prefix('-') {
        Some(r) => (true, r),
        None => (false, s.strip_prefix('+').unwrap_or(s)),
    };
    let hex = rest.strip_prefix("0x").or_else(|| rest.strip_prefix("0X"))?;
    if hex.is_empty() {
        return None;
    }
    let mut val: u64 = 0;
    for c in hex.chars() {
        let digit = c.to_digit(16)? as u64;
        val = val.wrapping_mul(16).wrapping_add(digit);
    }
    let result = val as i64;
    Some(if neg { result.wrapping_neg() } else { result })
}

/// Hex float such as `0x1.8p1` (= 3.0). The mantissa accumulates as f64
/// with a separate binary exponent so long digit strings stay finite.
fn parse_hex_float(s: &str) -> Option<f64> {
    let (neg, rest) = match s.strip_prefix('-') {
        Some(r) => (true, r),
        None => (false, s.strip_prefix('+').unwrap_or(s)),
    };
    let hex = rest.strip_prefix("0x").or_else(|| rest.strip_prefix("0X"))?;

    let (mantissa, exp) = match hex.find(['p', 'P']) {
        Some(pos) => {
            let exp: i64 = hex[pos + 1..].parse().ok()?;
            (&hex[..pos], exp)
        }
        None => (hex, 0),
    };
    if mantissa.is_empty() || mantissa == "." {
        return None;
    }
    let (int_part, frac_part) = match mantissa.find('.') {
        Some(dot) => (&mantissa[..dot], &mantissa[dot + 1..]),
        None => (mantissa, ""),
    };

    let mut value = 0.0f64;
    let mut bin_exp = exp;
    for c in int_part.chars() {
        value = value * 16.0 + c.to_digit(16)? as f64;
        if value > 1e18 {
            value /= (1u64 << 52) as f64;
            bin_exp += 52;
        }
    }
    for c in frac_part.chars() {
        value = value * 16.0 + c.to_digit(16)? as f64;
        bin_exp -= 4;
        if value > 1e18 {
            value /= (1u64 << 52) as f64;
            bin_exp += 52;
        }
    }

    while bin_exp > 1023 {
        value *= 2.0f64.powi(1023);
        bin_exp -= 1023;
    }
    while bin_exp < -1023 {
        value *= 2.0f64.powi(-1023);
        bin_exp += 1023;
    }
    value *= 2.0f64.powi(bin_exp as i32);
    Some(if neg { -value } else { value })
}

/// Render a number the way concatenation and tostring see it: integers
/// verbatim, floats in a `%.14g`-like shape.
pub fn number_to_string(n: Number) -> String {
    match n {
        Number::Int(i) => i.to_string(),
        Number::Float(f) => format_float(f),
    }
}

/// `%.14g`-equivalent float rendering: fixed notation keeps a trailing
/// `.0`, large or tiny magnitudes switch to `e+XX` scientific form.
pub fn format_float(f: f64) -> String {
    if f.is_nan() {
        return "nan".to_string();
    }
    if f.is_infinite() {
        return if f > 0.0 { "inf" } else { "-inf" }.to_string();
    }
    if f == 0.0 {
        return if f.is_sign_negative() { "-0.0" } else { "0.0" }.to_string();
    }
    let exp = f.abs().log10().floor() as i32;
    if (-4..14).contains(&exp) {
        let decimals = (13 - exp).max(0) as usize;
        let s = format!("{:.*}", decimals, f);
        trim_fixed(&s)
    } else {
        let s = format!("{:.13e}", f);
        fix_scientific(&s)
    }
}

fn trim_fixed(s: &str) -> String {
    if !s.contains('.') {
        return format!("{s}.0");
    }
    let t = s.trim_end_matches('0');
    if t.ends_with('.') {
        format!("{t}0")
    } else {
        t.to_string()
    }
}

fn fix_scientific(s: &str) -> String {
    let Some(e_pos) = s.find('e') else {
        return s.to_string();
    };
    let mantissa = &s[..e_pos];
    let exp_str = &s[e_pos + 1..];
    let (sign, digits) = match exp_str.strip_prefix('-') {
        Some(r) => ("-", r),
        None => ("+", exp_str.strip_prefix('+').unwrap_or(exp_str)),
    };
    let exp_num: i32 = digits.parse().unwrap_or(0);
    let mantissa = {
        let t = mantissa.trim_end_matches('0');
        if t.ends_with('.') {
            format!("{t}0")
        } else {
            t.to_string()
        }
    };
    format!("{}e{}{:02}", mantissa, sign, exp_num.abs())
}
