//! Byte-oriented string functions. Strings are stored as UTF-8; slicing in
//! the middle of a multi-byte sequence yields replacement characters.

use std::iter::Peekable;
use std::str::Chars;

use lua_core::number::{format_g, format_number, to_integer};

use super::library;
use crate::error::LuaError;
use crate::table::LuaTable;
use crate::thread::Thread;
use crate::value::LuaValue;

/// Longest string `rep` will build.
const MAX_STRING: usize = i32::MAX as usize;

pub(super) fn module() -> LuaTable {
    library(&[
        ("len", len),
        ("sub", sub),
        ("upper", upper),
        ("lower", lower),
        ("rep", rep),
        ("reverse", reverse),
        ("byte", byte),
        ("char", char),
        ("format", format),
    ])
}

/// Start position of a range: negative counts from the end, clamped to 1.
fn start_index(i: i64, len: usize) -> usize {
    if i > 0 {
        i as usize
    } else if i == 0 || i.unsigned_abs() as usize > len {
        1
    } else {
        len - i.unsigned_abs() as usize + 1
    }
}

/// End position of a range: negative counts from the end, clamped to `len`.
fn end_index(j: i64, len: usize) -> usize {
    if j > len as i64 {
        len
    } else if j >= 0 {
        j as usize
    } else if j.unsigned_abs() as usize > len {
        0
    } else {
        len - j.unsigned_abs() as usize + 1
    }
}

fn from_bytes(bytes: &[u8]) -> LuaValue {
    LuaValue::from(String::from_utf8_lossy(bytes).into_owned())
}

fn len(t: &mut Thread) -> Result<usize, LuaError> {
    let s = t.string(1)?;
    t.push(s.len());
    Ok(1)
}

fn sub(t: &mut Thread) -> Result<usize, LuaError> {
    let s = t.string(1)?;
    let start = start_index(t.opt_integer(2, 1)?, s.len());
    let end = end_index(t.opt_integer(3, -1)?, s.len());
    let v = if start > end {
        LuaValue::from("")
    } else {
        from_bytes(&s.as_bytes()[start - 1..end])
    };
    t.push(v);
    Ok(1)
}

fn upper(t: &mut Thread) -> Result<usize, LuaError> {
    let s = t.string(1)?;
    t.push(s.to_ascii_uppercase());
    Ok(1)
}

fn lower(t: &mut Thread) -> Result<usize, LuaError> {
    let s = t.string(1)?;
    t.push(s.to_ascii_lowercase());
    Ok(1)
}

fn rep(t: &mut Thread) -> Result<usize, LuaError> {
    let s = t.string(1)?;
    let n = t.integer(2)?;
    let sep = t.opt_string(3)?.unwrap_or_else(|| "".into());
    if n <= 0 {
        t.push("");
        return Ok(1);
    }
    let n = n as usize;
    let total = s
        .len()
        .checked_mul(n)
        .and_then(|body| sep.len().checked_mul(n - 1).and_then(|seps| body.checked_add(seps)));
    if total.map_or(true, |total| total > MAX_STRING) {
        return Err(LuaError::msg("resulting string too large"));
    }
    let mut out = String::with_capacity(total.unwrap_or(0));
    for i in 0..n {
        if i > 0 {
            out.push_str(&sep);
        }
        out.push_str(&s);
    }
    t.push(out);
    Ok(1)
}

fn reverse(t: &mut Thread) -> Result<usize, LuaError> {
    let s = t.string(1)?;
    t.push(s.chars().rev().collect::<String>());
    Ok(1)
}

fn byte(t: &mut Thread) -> Result<usize, LuaError> {
    let s = t.string(1)?;
    let i = t.opt_integer(2, 1)?;
    let start = start_index(i, s.len());
    let end = end_index(t.opt_integer(3, i)?, s.len());
    if start > end {
        return Ok(0);
    }
    let codes: Vec<usize> = s.as_bytes()[start - 1..end].iter().map(|&b| b as usize).collect();
    Ok(t.ret(codes))
}

fn char(t: &mut Thread) -> Result<usize, LuaError> {
    let mut bytes = Vec::with_capacity(t.count());
    for i in 1..=t.count() {
        let c = t.integer(i)?;
        let b = u8::try_from(c).map_err(|_| t.arg_error(i, "value out of range"))?;
        bytes.push(b);
    }
    let s = String::from_utf8(bytes).map_err(|_| t.arg_error(1, "invalid UTF-8 sequence"))?;
    t.push(s);
    Ok(1)
}

// ── format ────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct Spec {
    left: bool,
    plus: bool,
    space: bool,
    alt: bool,
    zero: bool,
    width: usize,
    precision: Option<usize>,
}

impl Spec {
    /// Parse flags, width and precision after a `%`, up to the conversion
    /// character, which is returned too.
    fn parse(chars: &mut Peekable<Chars<'_>>) -> Result<(Spec, char), LuaError> {
        let mut spec = Spec::default();
        let mut raw = String::from("%");
        while let Some(&c) = chars.peek() {
            match c {
                '-' => spec.left = true,
                '+' => spec.plus = true,
                ' ' => spec.space = true,
                '#' => spec.alt = true,
                '0' => spec.zero = true,
                _ => break,
            }
            raw.push(c);
            chars.next();
        }
        spec.width = digits(chars, &mut raw);
        if chars.peek() == Some(&'.') {
            raw.push('.');
            chars.next();
            spec.precision = Some(digits(chars, &mut raw));
        }
        let conv = chars.next();
        if let Some(c) = conv {
            raw.push(c);
        }
        match conv {
            Some(c) if c.is_ascii_alphabetic() => Ok((spec, c)),
            _ => Err(invalid_conversion(&raw)),
        }
    }

    fn pad(&self, prefix: &str, body: &str, zero_ok: bool) -> String {
        let len = prefix.chars().count() + body.chars().count();
        if len >= self.width {
            return format!("{prefix}{body}");
        }
        let fill = self.width - len;
        if self.left {
            format!("{prefix}{body}{}", " ".repeat(fill))
        } else if self.zero && zero_ok {
            format!("{prefix}{}{body}", "0".repeat(fill))
        } else {
            format!("{}{prefix}{body}", " ".repeat(fill))
        }
    }

    fn sign(&self, negative: bool) -> &'static str {
        if negative {
            "-"
        } else if self.plus {
            "+"
        } else if self.space {
            " "
        } else {
            ""
        }
    }
}

/// At most two digits of width or precision.
fn digits(chars: &mut Peekable<Chars<'_>>, raw: &mut String) -> usize {
    let mut n = 0;
    for _ in 0..2 {
        match chars.peek().and_then(|c| c.to_digit(10)) {
            Some(d) => {
                n = n * 10 + d as usize;
                raw.push(chars.next().unwrap_or('0'));
            }
            None => break,
        }
    }
    n
}

fn invalid_conversion(raw: &str) -> LuaError {
    LuaError::msg(format!("invalid conversion '{raw}' to 'format'"))
}

fn format(t: &mut Thread) -> Result<usize, LuaError> {
    let fmt = t.string(1)?;
    let mut out = String::with_capacity(fmt.len());
    let mut chars = fmt.chars().peekable();
    let mut arg = 1;
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        if chars.peek() == Some(&'%') {
            chars.next();
            out.push('%');
            continue;
        }
        let (spec, conv) = Spec::parse(&mut chars)?;
        arg += 1;
        let piece = match conv {
            'd' | 'i' | 'u' => {
                let n = t.integer(arg)?;
                let mut body = n.unsigned_abs().to_string();
                if let Some(p) = spec.precision {
                    body = format!("{body:0>p$}");
                }
                spec.pad(spec.sign(n < 0), &body, spec.precision.is_none())
            }
            'c' => {
                let c = u8::try_from(t.integer(arg)?)
                    .ok()
                    .filter(u8::is_ascii)
                    .map(char::from)
                    .ok_or_else(|| t.arg_error(arg, "value out of range"))?;
                spec.pad("", &c.to_string(), false)
            }
            'x' | 'X' | 'o' => {
                let n = t.integer(arg)? as u64;
                let mut body = match conv {
                    'x' => format!("{n:x}"),
                    'X' => format!("{n:X}"),
                    _ => format!("{n:o}"),
                };
                if let Some(p) = spec.precision {
                    body = format!("{body:0>p$}");
                }
                let prefix = match conv {
                    _ if !spec.alt || n == 0 => "",
                    'x' => "0x",
                    'X' => "0X",
                    _ if body.starts_with('0') => "",
                    _ => "0",
                };
                spec.pad(prefix, &body, spec.precision.is_none())
            }
            'e' | 'E' | 'f' | 'F' | 'g' | 'G' | 'a' | 'A' => {
                let x = t.number(arg)?;
                format_float(&spec, conv, x)
            }
            'q' => quoted(t, arg)?,
            's' => {
                let v = t.check_any(arg)?;
                let s = t.tostring(&v)?.to_string();
                let body: String = match spec.precision {
                    Some(p) => s.chars().take(p).collect(),
                    None => s,
                };
                spec.pad("", &body, false)
            }
            _ => return Err(invalid_conversion(&format!("%{conv}"))),
        };
        out.push_str(&piece);
    }
    t.push(out);
    Ok(1)
}

fn format_float(spec: &Spec, conv: char, x: f64) -> String {
    let upper = conv.is_ascii_uppercase();
    let negative = x.is_sign_negative() && !x.is_nan();
    let sign = spec.sign(negative);
    let x = x.abs();
    if !x.is_finite() {
        let body = if x.is_nan() { "nan" } else { "inf" };
        let body = if upper { body.to_ascii_uppercase() } else { body.to_string() };
        return spec.pad(sign, &body, false);
    }
    let precision = spec.precision.unwrap_or(6);
    let body = match conv.to_ascii_lowercase() {
        'e' => exponent_form(x, precision),
        'f' => format!("{x:.precision$}"),
        'g' => format_g(x, precision.max(1)),
        _ => hex_float(x),
    };
    let body = if upper { body.to_ascii_uppercase() } else { body };
    spec.pad(sign, &body, true)
}

/// C's `%.{precision}e`: at least two exponent digits, always signed.
fn exponent_form(x: f64, precision: usize) -> String {
    let sci = format!("{x:.precision$e}");
    match sci.split_once('e') {
        Some((mantissa, exp)) => {
            let exp: i32 = exp.parse().unwrap_or(0);
            let sign = if exp < 0 { '-' } else { '+' };
            format!("{mantissa}e{sign}{:02}", exp.unsigned_abs())
        }
        None => sci,
    }
}

/// C's `%a` for a non-negative finite value.
fn hex_float(x: f64) -> String {
    if x == 0.0 {
        return "0x0p+0".to_string();
    }
    let bits = x.to_bits();
    let exp_bits = ((bits >> 52) & 0x7ff) as i64;
    let mantissa = bits & ((1u64 << 52) - 1);
    let (lead, exp) = if exp_bits == 0 {
        (0, -1022)
    } else {
        (1, exp_bits - 1023)
    };
    let hex = format!("{mantissa:013x}");
    let hex = hex.trim_end_matches('0');
    if hex.is_empty() {
        format!("0x{lead}p{exp:+}")
    } else {
        format!("0x{lead}.{hex}p{exp:+}")
    }
}

/// `%q`: a literal that reads back as the same value.
fn quoted(t: &Thread, arg: usize) -> Result<String, LuaError> {
    match t.check_any(arg)? {
        LuaValue::LuaString(s) => {
            let mut out = String::with_capacity(s.len() + 2);
            out.push('"');
            let mut chars = s.chars().peekable();
            while let Some(c) = chars.next() {
                match c {
                    '"' => out.push_str("\\\""),
                    '\\' => out.push_str("\\\\"),
                    '\n' => out.push_str("\\\n"),
                    '\r' => out.push_str("\\r"),
                    '\0' => {
                        let next_is_digit = chars.peek().is_some_and(|d| d.is_ascii_digit());
                        out.push_str(if next_is_digit { "\\000" } else { "\\0" });
                    }
                    c if c.is_ascii_control() => out.push_str(&format!("\\{:03}", c as u32)),
                    c => out.push(c),
                }
            }
            out.push('"');
            Ok(out)
        }
        LuaValue::Number(n) => Ok(if n.is_nan() {
            "(0/0)".to_string()
        } else if n.is_infinite() {
            let inf = if n > 0.0 { "1e9999" } else { "-1e9999" };
            inf.to_string()
        } else if to_integer(n).is_some() {
            format_number(n)
        } else {
            let sign = if n < 0.0 { "-" } else { "" };
            format!("{sign}{}", hex_float(n.abs()))
        }),
        v @ (LuaValue::Nil | LuaValue::Boolean(_)) => Ok(v.to_string()),
        _ => Err(t.arg_error(arg, "value has no literal form")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Vm;

    fn run1(src: &str) -> LuaValue {
        Vm::new()
            .exec(src, "str")
            .unwrap()
            .into_iter()
            .next()
            .unwrap_or_default()
    }

    fn fmt(src: &str) -> String {
        run1(&format!("return string.format({src})"))
            .as_str()
            .unwrap()
            .to_string()
    }

    #[test]
    fn index_normalisation() {
        assert_eq!(start_index(-3, 5), 3);
        assert_eq!(start_index(-10, 5), 1);
        assert_eq!(start_index(0, 5), 1);
        assert_eq!(end_index(-1, 5), 5);
        assert_eq!(end_index(10, 5), 5);
        assert_eq!(end_index(-10, 5), 0);
    }

    #[test]
    fn sub_and_byte() {
        assert_eq!(run1("return ('hello'):sub(2, 4)"), LuaValue::from("ell"));
        assert_eq!(run1("return ('hello'):sub(-3)"), LuaValue::from("llo"));
        assert_eq!(run1("return ('hello'):sub(4, 2)"), LuaValue::from(""));
        assert_eq!(run1("return ('A'):byte()"), LuaValue::Number(65.0));
        assert_eq!(run1("return select('#', ('abc'):byte(1, -1))"), LuaValue::Number(3.0));
        assert_eq!(run1("return string.char(72, 105)"), LuaValue::from("Hi"));
    }

    #[test]
    fn case_rep_reverse() {
        assert_eq!(run1("return ('MiXed'):upper()"), LuaValue::from("MIXED"));
        assert_eq!(run1("return string.lower('MiXed')"), LuaValue::from("mixed"));
        assert_eq!(run1("return string.rep('ab', 3, ',')"), LuaValue::from("ab,ab,ab"));
        assert_eq!(run1("return string.rep('x', 0)"), LuaValue::from(""));
        assert_eq!(run1("return string.reverse('abc')"), LuaValue::from("cba"));
        assert_eq!(run1("return #'four'"), LuaValue::Number(4.0));
    }

    #[test]
    fn char_rejects_out_of_range() {
        let err = Vm::new().exec("return string.char(256)", "str").unwrap_err();
        assert_eq!(err.to_string(), "str:1: bad argument #1 to 'char' (value out of range)");
        let err = Vm::new().exec("return string.char(255)", "str").unwrap_err();
        assert_eq!(err.to_string(), "str:1: bad argument #1 to 'char' (invalid UTF-8 sequence)");
        assert_eq!(run1("return #string.char(195, 169)"), LuaValue::Number(2.0));
    }

    #[test]
    fn format_integers() {
        assert_eq!(fmt("'%d', 42"), "42");
        assert_eq!(fmt("'%5d|%-5d|%05d', 42, 42, 42"), "   42|42   |00042");
        assert_eq!(fmt("'%+d %+d', 5, -5"), "+5 -5");
        assert_eq!(fmt("'%.3d', 7"), "007");
        assert_eq!(fmt("'%x %X %#x %o', 255, 255, 255, 8"), "ff FF 0xff 10");
        assert_eq!(fmt("'%c%c', 104, 105"), "hi");
    }

    #[test]
    fn format_floats() {
        assert_eq!(fmt("'%.2f', 3.14159"), "3.14");
        assert_eq!(fmt("'%8.3f', -1.5"), "  -1.500");
        assert_eq!(fmt("'%e', 12345.678"), "1.234568e+04");
        assert_eq!(fmt("'%.1E', 0.00012"), "1.2E-04");
        assert_eq!(fmt("'%g %g', 0.0001, 1e20"), "0.0001 1e+20");
        assert_eq!(fmt("'%a', 1"), "0x1p+0");
        assert_eq!(fmt("'%f', math.huge"), "inf");
    }

    #[test]
    fn format_strings_and_quotes() {
        assert_eq!(fmt("'%s=%s', 'k', 1.5"), "k=1.5");
        assert_eq!(fmt("'[%5s][%-5s][%.2s]', 'ab', 'ab', 'abc'"), "[   ab][ab   ][ab]");
        assert_eq!(fmt("'%q', 'a\"b\\\\c'"), "\"a\\\"b\\\\c\"");
        assert_eq!(fmt("'%q', 10"), "10");
        assert_eq!(fmt("'100%%'"), "100%");
        assert_eq!(
            fmt("'%s', setmetatable({}, {__tostring = function() return 'obj' end})"),
            "obj"
        );
    }

    #[test]
    fn format_errors() {
        let err = Vm::new().exec("return string.format('%d')", "str").unwrap_err();
        assert_eq!(err.to_string(), "str:1: bad argument #2 to 'format' (number expected, got no value)");
        let err = Vm::new().exec("return string.format('%y', 1)", "str").unwrap_err();
        assert_eq!(err.to_string(), "str:1: invalid conversion '%y' to 'format'");
        let err = Vm::new().exec("return string.format('%d', 1.5)", "str").unwrap_err();
        assert_eq!(
            err.to_string(),
            "str:1: bad argument #2 to 'format' (number has no integer representation)"
        );
    }
}
