//! Numeric conversions shared by the lexer, the VM and the standard library.
//!
//! Every Lua number is an `f64`. "Integer" is a derived property: a number
//! is an integer when it has no fractional part and fits in an `i64`.

/// Convert `n` to an `i64` when it has an exact integer representation.
pub fn to_integer(n: f64) -> Option<i64> {
    // 2^63 is exactly representable; anything >= it overflows i64.
    const LIMIT: f64 = 9_223_372_036_854_775_808.0;
    if n.fract() == 0.0 && (-LIMIT..LIMIT).contains(&n) {
        Some(n as i64)
    } else {
        None
    }
}

/// Floor division (`//`).
pub fn floor_div(a: f64, b: f64) -> f64 {
    (a / b).floor()
}

/// Floor modulo (`%`): the result takes the sign of the divisor.
pub fn floor_mod(a: f64, b: f64) -> f64 {
    let m = a % b;
    if (m > 0.0 && b < 0.0) || (m < 0.0 && b > 0.0) {
        m + b
    } else {
        m
    }
}

fn is_lua_space(b: u8) -> bool {
    matches!(b, b' ' | b'\t' | b'\n' | b'\r' | 0x0b | 0x0c)
}

/// Parse a numeric string the way `tonumber` and arithmetic coercion do.
///
/// Accepts surrounding whitespace, an optional sign, decimal literals with
/// optional fraction and exponent, and `0x` hexadecimal integers.
/// Hexadecimal values wrap modulo 2^64 like integer literals do.
pub fn parse_number(text: &str) -> Option<f64> {
    let bytes = text.as_bytes();
    let start = bytes.iter().position(|&b| !is_lua_space(b))?;
    let end = bytes.iter().rposition(|&b| !is_lua_space(b))? + 1;
    let body = &text[start..end];

    let (negative, unsigned) = match body.as_bytes()[0] {
        b'-' => (true, &body[1..]),
        b'+' => (false, &body[1..]),
        _ => (false, body),
    };

    let value = if let Some(hex) = unsigned
        .strip_prefix("0x")
        .or_else(|| unsigned.strip_prefix("0X"))
    {
        parse_hex(hex)?
    } else if is_decimal_literal(unsigned) {
        unsigned.parse::<f64>().ok()?
    } else {
        return None;
    };
    Some(if negative { -value } else { value })
}

/// Parse the digits of a hexadecimal integer (without the `0x` prefix).
pub fn parse_hex(digits: &str) -> Option<f64> {
    if digits.is_empty() {
        return None;
    }
    let mut acc: u64 = 0;
    for c in digits.chars() {
        let d = c.to_digit(16)?;
        acc = acc.wrapping_mul(16).wrapping_add(u64::from(d));
    }
    Some(acc as i64 as f64)
}

/// `digits [. digits] [(e|E) [+|-] digits]` with at least one mantissa digit.
fn is_decimal_literal(s: &str) -> bool {
    let b = s.as_bytes();
    let mut i = 0;
    let mut mantissa_digits = 0;
    while i < b.len() && b[i].is_ascii_digit() {
        i += 1;
        mantissa_digits += 1;
    }
    if i < b.len() && b[i] == b'.' {
        i += 1;
        while i < b.len() && b[i].is_ascii_digit() {
            i += 1;
            mantissa_digits += 1;
        }
    }
    if mantissa_digits == 0 {
        return false;
    }
    if i < b.len() && (b[i] == b'e' || b[i] == b'E') {
        i += 1;
        if i < b.len() && (b[i] == b'+' || b[i] == b'-') {
            i += 1;
        }
        let exp_start = i;
        while i < b.len() && b[i].is_ascii_digit() {
            i += 1;
        }
        if i == exp_start {
            return false;
        }
    }
    i == b.len()
}

/// Format a number the way `tostring` does.
///
/// Integral values within `i64` range print without a fractional part;
/// everything else follows C's `%.14g`.
pub fn format_number(n: f64) -> String {
    if n.is_nan() {
        return if n.is_sign_negative() { "-nan" } else { "nan" }.to_string();
    }
    if n.is_infinite() {
        return if n < 0.0 { "-inf" } else { "inf" }.to_string();
    }
    if let Some(i) = to_integer(n) {
        return i.to_string();
    }
    format_g(n, 14)
}

/// C-style `%.{precision}g`.
pub fn format_g(n: f64, precision: usize) -> String {
    if n == 0.0 {
        return if n.is_sign_negative() { "-0" } else { "0" }.to_string();
    }
    let precision = precision.max(1);
    let sci = format!("{:.*e}", precision - 1, n);
    let (mantissa, exponent) = match sci.split_once('e') {
        Some((m, e)) => (m, e.parse::<i32>().unwrap_or(0)),
        None => (sci.as_str(), 0),
    };
    if exponent < -4 || exponent >= precision as i32 {
        let mantissa = strip_fraction_zeros(mantissa);
        let sign = if exponent < 0 { '-' } else { '+' };
        format!("{mantissa}e{sign}{:02}", exponent.abs())
    } else {
        let decimals = (precision as i32 - 1 - exponent).max(0) as usize;
        strip_fraction_zeros(&format!("{n:.decimals$}")).to_string()
    }
}

fn strip_fraction_zeros(s: &str) -> &str {
    if s.contains('.') {
        s.trim_end_matches('0').trim_end_matches('.')
    } else {
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integers_print_without_fraction() {
        assert_eq!(format_number(3.0), "3");
        assert_eq!(format_number(-42.0), "-42");
        assert_eq!(format_number(1e15), "1000000000000000");
    }

    #[test]
    fn floats_use_fourteen_significant_digits() {
        assert_eq!(format_number(0.1), "0.1");
        assert_eq!(format_number(1.0 / 3.0), "0.33333333333333");
        assert_eq!(format_number(2.5), "2.5");
        assert_eq!(format_number(1e100), "1e+100");
        assert_eq!(format_number(1.5e-7), "1.5e-07");
    }

    #[test]
    fn special_values() {
        assert_eq!(format_number(f64::INFINITY), "inf");
        assert_eq!(format_number(f64::NEG_INFINITY), "-inf");
    }

    #[test]
    fn parses_decimal_and_hex() {
        assert_eq!(parse_number("42"), Some(42.0));
        assert_eq!(parse_number("  -3.5e2 "), Some(-350.0));
        assert_eq!(parse_number(".5"), Some(0.5));
        assert_eq!(parse_number("5."), Some(5.0));
        assert_eq!(parse_number("0x1F"), Some(31.0));
        assert_eq!(parse_number("0xffffffffffffffff"), Some(-1.0));
    }

    #[test]
    fn rejects_malformed_numbers() {
        for bad in ["", "  ", "abc", "1e", "1..2", "inf", "nan", "0x", "1 2", "--1"] {
            assert_eq!(parse_number(bad), None, "{bad:?}");
        }
    }

    #[test]
    fn floor_semantics_for_negative_operands() {
        assert_eq!(floor_div(7.0, 2.0), 3.0);
        assert_eq!(floor_div(-7.0, 2.0), -4.0);
        assert_eq!(floor_mod(-7.0, 2.0), 1.0);
        assert_eq!(floor_mod(7.0, -2.0), -1.0);
        assert_eq!(floor_mod(6.0, -2.0), 0.0);
        assert!(floor_mod(1.0, 0.0).is_nan());
    }

    #[test]
    fn integer_representation() {
        assert_eq!(to_integer(3.0), Some(3));
        assert_eq!(to_integer(3.5), None);
        assert_eq!(to_integer(1e19), None);
        assert_eq!(to_integer(f64::NAN), None);
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn integers_print_and_parse_exactly(n in -(1i64 << 53)..(1i64 << 53)) {
                prop_assert_eq!(format_number(n as f64), n.to_string());
                prop_assert_eq!(parse_number(&n.to_string()), Some(n as f64));
            }

            #[test]
            fn floor_mod_takes_the_divisor_sign(
                a in -1e9f64..1e9,
                b in prop_oneof![-1e6f64..-1e-3, 1e-3f64..1e6],
            ) {
                let m = floor_mod(a, b);
                prop_assert!(m == 0.0 || (m < 0.0) == (b < 0.0), "{} % {} = {}", a, b, m);
                prop_assert!(m.abs() <= b.abs());
            }

            #[test]
            fn formatted_floats_parse(x in any::<f64>().prop_filter("finite", |f| f.is_finite())) {
                let text = format_number(x);
                let back = parse_number(&text);
                prop_assert!(back.is_some(), "{} did not parse", text);
            }
        }
    }
}
