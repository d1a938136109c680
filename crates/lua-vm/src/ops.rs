//! Operator semantics: coercions, metamethod fallbacks and the messages
//! raised when neither applies.

use std::borrow::Cow;

use lua_core::number::{floor_div, floor_mod, format_number, to_integer};

use crate::error::LuaError;
use crate::table::LuaTable;
use crate::thread::{Event, Thread};
use crate::value::LuaValue;

/// Longest `__index`/`__newindex` chain followed before giving up.
const MAX_TAG_LOOP: usize = 2000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    IDiv,
    Unm,
    BAnd,
    BOr,
    BXor,
    Shl,
    Shr,
    BNot,
}

impl ArithOp {
    pub(crate) fn is_bitwise(self) -> bool {
        matches!(
            self,
            ArithOp::BAnd | ArithOp::BOr | ArithOp::BXor | ArithOp::Shl | ArithOp::Shr | ArithOp::BNot
        )
    }

    /// Float semantics of the non-bitwise operators.
    pub(crate) fn apply(self, a: f64, b: f64) -> f64 {
        match self {
            ArithOp::Add => a + b,
            ArithOp::Sub => a - b,
            ArithOp::Mul => a * b,
            ArithOp::Div => a / b,
            ArithOp::Mod => floor_mod(a, b),
            ArithOp::Pow => a.powf(b),
            ArithOp::IDiv => floor_div(a, b),
            ArithOp::Unm => -a,
            _ => f64::NAN,
        }
    }

    fn apply_int(self, a: i64, b: i64) -> i64 {
        match self {
            ArithOp::BAnd => a & b,
            ArithOp::BOr => a | b,
            ArithOp::BXor => a ^ b,
            ArithOp::Shl => shift_left(a, b),
            ArithOp::Shr => shift_left(a, b.wrapping_neg()),
            ArithOp::BNot => !a,
            _ => 0,
        }
    }

    fn event(self) -> Event {
        match self {
            ArithOp::Add => Event::Add,
            ArithOp::Sub => Event::Sub,
            ArithOp::Mul => Event::Mul,
            ArithOp::Div => Event::Div,
            ArithOp::Mod => Event::Mod,
            ArithOp::Pow => Event::Pow,
            ArithOp::IDiv => Event::IDiv,
            ArithOp::Unm => Event::Unm,
            ArithOp::BAnd => Event::BAnd,
            ArithOp::BOr => Event::BOr,
            ArithOp::BXor => Event::BXor,
            ArithOp::Shl => Event::Shl,
            ArithOp::Shr => Event::Shr,
            ArithOp::BNot => Event::BNot,
        }
    }
}

/// Logical shift; negative counts shift right, counts of 64 or more clear.
fn shift_left(x: i64, n: i64) -> i64 {
    if n <= -64 || n >= 64 {
        0
    } else if n >= 0 {
        ((x as u64) << n) as i64
    } else {
        ((x as u64) >> -n) as i64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CompareOp {
    Lt,
    Le,
}

/// Integer view of a bitwise operand: `None` when the operand is not a
/// number at all, `Some(None)` when it is one without an integer value.
fn integer_operand(v: &LuaValue) -> Option<Option<i64>> {
    v.to_number().map(to_integer)
}

impl Thread {
    // ── Metatables ────────────────────────────────────────────────────────────

    pub(crate) fn metatable_of(&self, v: &LuaValue) -> Option<LuaTable> {
        match v {
            LuaValue::Table(t) => t.metatable(),
            LuaValue::LuaString(_) => self.rt.string_meta.borrow().clone(),
            LuaValue::Userdata(u) => u.metatable(),
            _ => None,
        }
    }

    /// The handler for `event` in `v`'s metatable, or nil.
    pub(crate) fn metamethod(&self, v: &LuaValue, event: Event) -> LuaValue {
        match self.metatable_of(v) {
            Some(mt) => mt.get(self.rt.event(event)),
            None => LuaValue::Nil,
        }
    }

    fn binary_metamethod(&self, a: &LuaValue, b: &LuaValue, event: Event) -> LuaValue {
        let h = self.metamethod(a, event);
        if h.is_nil() {
            self.metamethod(b, event)
        } else {
            h
        }
    }

    // ── Arithmetic ────────────────────────────────────────────────────────────

    /// Full arithmetic: coercion, then metamethods. Unary operators pass
    /// their operand twice.
    pub(crate) fn arith(&mut self, op: ArithOp, a: &LuaValue, b: &LuaValue) -> Result<LuaValue, LuaError> {
        if op.is_bitwise() {
            if let (Some(Some(x)), Some(Some(y))) = (integer_operand(a), integer_operand(b)) {
                return Ok(LuaValue::Number(op.apply_int(x, y) as f64));
            }
        } else if let (Some(x), Some(y)) = (a.to_number(), b.to_number()) {
            return Ok(LuaValue::Number(op.apply(x, y)));
        }

        let h = self.binary_metamethod(a, b, op.event());
        if !h.is_nil() {
            return self.call1(h, [a.clone(), b.clone()]);
        }

        if op.is_bitwise() {
            let culprit = if integer_operand(a).is_none() { a } else { b };
            if integer_operand(culprit).is_some() {
                return Err(LuaError::msg("number has no integer representation"));
            }
            return Err(LuaError::msg(format!(
                "attempt to perform bitwise operation on a {} value",
                culprit.type_name()
            )));
        }
        let culprit = if a.to_number().is_none() { a } else { b };
        Err(LuaError::msg(format!(
            "attempt to perform arithmetic on a {} value",
            culprit.type_name()
        )))
    }

    // ── Comparison ────────────────────────────────────────────────────────────

    /// `a == b`: raw equality, then `__eq` for two tables or two userdata.
    pub(crate) fn equals(&mut self, a: &LuaValue, b: &LuaValue) -> Result<bool, LuaError> {
        if a == b {
            return Ok(true);
        }
        let comparable = matches!(
            (a, b),
            (LuaValue::Table(_), LuaValue::Table(_)) | (LuaValue::Userdata(_), LuaValue::Userdata(_))
        );
        if !comparable {
            return Ok(false);
        }
        let h = self.binary_metamethod(a, b, Event::Eq);
        if h.is_nil() {
            return Ok(false);
        }
        Ok(self.call1(h, [a.clone(), b.clone()])?.is_truthy())
    }

    pub(crate) fn compare(&mut self, op: CompareOp, a: &LuaValue, b: &LuaValue) -> Result<bool, LuaError> {
        match (a, b) {
            (LuaValue::Number(x), LuaValue::Number(y)) => {
                return Ok(match op {
                    CompareOp::Lt => x < y,
                    CompareOp::Le => x <= y,
                })
            }
            (LuaValue::LuaString(x), LuaValue::LuaString(y)) => {
                return Ok(match op {
                    CompareOp::Lt => x.as_bytes() < y.as_bytes(),
                    CompareOp::Le => x.as_bytes() <= y.as_bytes(),
                })
            }
            _ => {}
        }
        let event = match op {
            CompareOp::Lt => Event::Lt,
            CompareOp::Le => Event::Le,
        };
        let h = self.binary_metamethod(a, b, event);
        if !h.is_nil() {
            return Ok(self.call1(h, [a.clone(), b.clone()])?.is_truthy());
        }
        let (ta, tb) = (a.type_name(), b.type_name());
        if ta == tb {
            Err(LuaError::msg(format!("attempt to compare two {ta} values")))
        } else {
            Err(LuaError::msg(format!("attempt to compare {ta} with {tb}")))
        }
    }

    // ── Strings and length ────────────────────────────────────────────────────

    pub(crate) fn concat(&mut self, a: &LuaValue, b: &LuaValue) -> Result<LuaValue, LuaError> {
        if let (Some(x), Some(y)) = (concat_piece(a), concat_piece(b)) {
            let mut s = String::with_capacity(x.len() + y.len());
            s.push_str(&x);
            s.push_str(&y);
            return Ok(LuaValue::from(s));
        }
        let h = self.binary_metamethod(a, b, Event::Concat);
        if !h.is_nil() {
            return self.call1(h, [a.clone(), b.clone()]);
        }
        let culprit = if concat_piece(a).is_none() { a } else { b };
        Err(LuaError::msg(format!(
            "attempt to concatenate a {} value",
            culprit.type_name()
        )))
    }

    pub(crate) fn length(&mut self, v: &LuaValue) -> Result<LuaValue, LuaError> {
        if let LuaValue::LuaString(s) = v {
            return Ok(LuaValue::Number(s.len() as f64));
        }
        let h = self.metamethod(v, Event::Len);
        if !h.is_nil() {
            return self.call1(h, [v.clone()]);
        }
        match v {
            LuaValue::Table(t) => Ok(LuaValue::Number(t.len() as f64)),
            other => Err(LuaError::msg(format!(
                "attempt to get length of a {} value",
                other.type_name()
            ))),
        }
    }

    // ── Indexing ──────────────────────────────────────────────────────────────

    /// `obj[key]` with `__index` fallbacks.
    pub(crate) fn index(&mut self, obj: &LuaValue, key: &LuaValue) -> Result<LuaValue, LuaError> {
        let mut obj = obj.clone();
        for _ in 0..MAX_TAG_LOOP {
            let handler = match &obj {
                LuaValue::Table(t) => {
                    let v = t.get(key);
                    if !v.is_nil() {
                        return Ok(v);
                    }
                    match t.metatable() {
                        Some(mt) => mt.get(self.rt.event(Event::Index)),
                        None => return Ok(LuaValue::Nil),
                    }
                }
                other => {
                    let h = self.metamethod(other, Event::Index);
                    if h.is_nil() {
                        return Err(LuaError::msg(format!(
                            "attempt to index a {} value",
                            other.type_name()
                        )));
                    }
                    h
                }
            };
            match handler {
                LuaValue::Nil => return Ok(LuaValue::Nil),
                LuaValue::Function(_) => return self.call1(handler, [obj, key.clone()]),
                next => obj = next,
            }
        }
        Err(LuaError::msg("'__index' chain too long; possible loop"))
    }

    /// `obj[key] = val` with `__newindex` fallbacks.
    pub(crate) fn set_index(&mut self, obj: &LuaValue, key: LuaValue, val: LuaValue) -> Result<(), LuaError> {
        let mut obj = obj.clone();
        for _ in 0..MAX_TAG_LOOP {
            let handler = match &obj {
                LuaValue::Table(t) => {
                    let handler = match t.metatable() {
                        Some(mt) if t.get(&key).is_nil() => mt.get(self.rt.event(Event::NewIndex)),
                        _ => LuaValue::Nil,
                    };
                    if handler.is_nil() {
                        return t.set(key, val);
                    }
                    handler
                }
                other => {
                    let h = self.metamethod(other, Event::NewIndex);
                    if h.is_nil() {
                        return Err(LuaError::msg(format!(
                            "attempt to index a {} value",
                            other.type_name()
                        )));
                    }
                    h
                }
            };
            if let LuaValue::Function(_) = handler {
                self.call(handler, [obj, key, val])?;
                return Ok(());
            }
            obj = handler;
        }
        Err(LuaError::msg("'__newindex' chain too long; possible loop"))
    }

    // ── Conversion ────────────────────────────────────────────────────────────

    /// `tostring(v)`: `__tostring`, then `__name`, then the default form.
    pub(crate) fn tostring(&mut self, v: &LuaValue) -> Result<LuaValue, LuaError> {
        let h = self.metamethod(v, Event::ToString);
        if !h.is_nil() {
            return match self.call1(h, [v.clone()])? {
                s @ LuaValue::LuaString(_) => Ok(s),
                LuaValue::Number(n) => Ok(LuaValue::from(format_number(n))),
                _ => Err(LuaError::msg("'__tostring' must return a string")),
            };
        }
        if let LuaValue::LuaString(_) = v {
            return Ok(v.clone());
        }
        if let (LuaValue::LuaString(name), Some(addr)) = (self.metamethod(v, Event::Name), v.address()) {
            return Ok(LuaValue::from(format!("{name}: {addr:#014x}")));
        }
        Ok(LuaValue::from(v.to_string()))
    }
}

fn concat_piece(v: &LuaValue) -> Option<Cow<'_, str>> {
    match v {
        LuaValue::LuaString(s) => Some(Cow::Borrowed(&**s)),
        LuaValue::Number(n) => Some(Cow::Owned(format_number(*n))),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Vm;

    fn run1(src: &str) -> LuaValue {
        Vm::new()
            .exec(src, "ops")
            .unwrap()
            .into_iter()
            .next()
            .unwrap_or_default()
    }

    fn run_err(src: &str) -> String {
        Vm::new().exec(src, "ops").unwrap_err().to_string()
    }

    #[test]
    fn shifts_are_logical() {
        assert_eq!(shift_left(1, 3), 8);
        assert_eq!(shift_left(-1, -60), 15);
        assert_eq!(shift_left(1, 64), 0);
        assert_eq!(shift_left(1, -64), 0);
        assert_eq!(ArithOp::Shr.apply_int(16, 2), 4);
        assert_eq!(ArithOp::Shr.apply_int(16, -2), 64);
    }

    #[test]
    fn floor_semantics_for_negative_operands() {
        assert_eq!(ArithOp::Mod.apply(-7.0, 3.0), 2.0);
        assert_eq!(ArithOp::IDiv.apply(-7.0, 2.0), -4.0);
        assert_eq!(ArithOp::Div.apply(1.0, 0.0), f64::INFINITY);
    }

    #[test]
    fn bitwise_operators() {
        assert_eq!(run1("return 5 & 3, 5 | 3"), LuaValue::Number(1.0));
        assert_eq!(run1("return 5 ~ 3"), LuaValue::Number(6.0));
        assert_eq!(run1("return ~0"), LuaValue::Number(-1.0));
        assert_eq!(run1("return '3' << 2"), LuaValue::Number(12.0));
        assert_eq!(run_err("return 1.5 | 0"), "ops:1: number has no integer representation");
        assert_eq!(
            run_err("return {} & 1"),
            "ops:1: attempt to perform bitwise operation on a table value"
        );
    }

    #[test]
    fn string_coercion_in_arithmetic() {
        assert_eq!(run1("return '0x10' + 0"), LuaValue::Number(16.0));
        assert_eq!(run1("return 10 .. 20"), LuaValue::from("1020"));
        assert_eq!(run_err("return 'abc' + 1"), "ops:1: attempt to perform arithmetic on a string value");
    }

    #[test]
    fn comparison_errors_name_both_types() {
        assert_eq!(run_err("return 1 < 'x'"), "ops:1: attempt to compare number with string");
        assert_eq!(run_err("return {} < {}"), "ops:1: attempt to compare two table values");
    }

    #[test]
    fn index_errors() {
        assert_eq!(run_err("local t return t.x"), "ops:1: attempt to index a nil value");
        assert_eq!(run_err("local n = 1 n.x = 2"), "ops:1: attempt to index a number value");
    }

    #[test]
    fn index_chain_through_tables_and_functions() {
        let src = "local base = {greet = 'hi'}
                   local mid = setmetatable({}, {__index = base})
                   local top = setmetatable({}, {__index = mid})
                   local dyn = setmetatable({}, {__index = function(t, k) return k .. '!' end})
                   return top.greet .. dyn.x";
        assert_eq!(run1(src), LuaValue::from("hix!"));
    }

    #[test]
    fn index_loop_is_detected() {
        let src = "local t = {} setmetatable(t, {__index = t}) local mt = getmetatable(t)
                   local u = setmetatable({}, {__index = t}) mt.__index = u return t.x";
        assert_eq!(run_err(src), "ops:2: '__index' chain too long; possible loop");
    }

    #[test]
    fn newindex_only_for_missing_keys() {
        let src = "local log = {}
                   local t = setmetatable({a = 1}, {__newindex = function(t, k, v) log[#log + 1] = k end})
                   t.a = 2 t.b = 3
                   return #log, t.a, rawget(t, 'b')";
        let results = Vm::new().exec(src, "ops").unwrap();
        assert_eq!(results, vec![LuaValue::Number(1.0), LuaValue::Number(2.0), LuaValue::Nil]);
    }

    #[test]
    fn tostring_uses_metamethods() {
        let src = "local p = setmetatable({}, {__tostring = function() return 'point' end})
                   return tostring(p)";
        assert_eq!(run1(src), LuaValue::from("point"));
        let named = run1("return tostring(setmetatable({}, {__name = 'Vec'}))");
        assert!(named.as_str().unwrap().starts_with("Vec: 0x"));
        assert_eq!(
            run_err("return tostring(setmetatable({}, {__tostring = function() return {} end}))"),
            "ops:1: '__tostring' must return a string"
        );
    }

    #[test]
    fn length_and_concat_metamethods() {
        let src = "local mt = {__len = function() return 42 end,
                               __concat = function(a, b) return 'joined' end}
                   local t = setmetatable({}, mt)
                   return #t, t .. 'x', 1 .. t";
        let results = Vm::new().exec(src, "ops").unwrap();
        assert_eq!(
            results,
            vec![LuaValue::Number(42.0), LuaValue::from("joined"), LuaValue::from("joined")]
        );
        assert_eq!(run_err("return #5"), "ops:1: attempt to get length of a number value");
        assert_eq!(run_err("return 'a' .. {}"), "ops:1: attempt to concatenate a table value");
    }
}
