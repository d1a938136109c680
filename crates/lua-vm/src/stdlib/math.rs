use std::cell::RefCell;
use std::rc::Rc;

use lua_core::number::to_integer;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::library;
use crate::closure::LuaFunction;
use crate::error::LuaError;
use crate::table::LuaTable;
use crate::thread::Thread;
use crate::value::LuaValue;

pub(super) fn module() -> LuaTable {
    let m = library(&[
        ("abs", |t| unary(t, f64::abs)),
        ("ceil", |t| unary(t, f64::ceil)),
        ("floor", |t| unary(t, f64::floor)),
        ("sqrt", |t| unary(t, f64::sqrt)),
        ("exp", |t| unary(t, f64::exp)),
        ("sin", |t| unary(t, f64::sin)),
        ("cos", |t| unary(t, f64::cos)),
        ("tan", |t| unary(t, f64::tan)),
        ("asin", |t| unary(t, f64::asin)),
        ("acos", |t| unary(t, f64::acos)),
        ("atan", atan),
        ("log", log),
        ("fmod", fmod),
        ("modf", modf),
        ("max", max),
        ("min", min),
        ("tointeger", tointeger),
        ("type", type_),
        ("ult", ult),
    ]);
    m.set_field("huge", f64::INFINITY);
    m.set_field("pi", std::f64::consts::PI);
    m.set_field("maxinteger", i64::MAX as f64);
    m.set_field("mininteger", i64::MIN as f64);

    let rng = Rc::new(RefCell::new(StdRng::from_entropy()));
    let shared = rng.clone();
    m.set_field(
        "random",
        LuaFunction::native("random", move |t| random(t, &mut shared.borrow_mut())),
    );
    m.set_field(
        "randomseed",
        LuaFunction::native("randomseed", move |t| randomseed(t, &mut rng.borrow_mut())),
    );
    m
}

fn unary(t: &mut Thread, f: fn(f64) -> f64) -> Result<usize, LuaError> {
    let x = t.number(1)?;
    t.push(f(x));
    Ok(1)
}

fn atan(t: &mut Thread) -> Result<usize, LuaError> {
    let y = t.number(1)?;
    let x = t.opt_number(2, 1.0)?;
    t.push(y.atan2(x));
    Ok(1)
}

fn log(t: &mut Thread) -> Result<usize, LuaError> {
    let x = t.number(1)?;
    let r = match t.opt_number(2, std::f64::consts::E)? {
        b if b == 2.0 => x.log2(),
        b if b == 10.0 => x.log10(),
        b if b == std::f64::consts::E => x.ln(),
        b => x.ln() / b.ln(),
    };
    t.push(r);
    Ok(1)
}

fn fmod(t: &mut Thread) -> Result<usize, LuaError> {
    let a = t.number(1)?;
    let b = t.number(2)?;
    t.push(a % b);
    Ok(1)
}

fn modf(t: &mut Thread) -> Result<usize, LuaError> {
    let x = t.number(1)?;
    let int = x.trunc();
    let frac = if x.is_infinite() { 0.0 } else { x - int };
    Ok(t.ret([int, frac]))
}

fn extreme(t: &mut Thread, better: fn(f64, f64) -> bool) -> Result<usize, LuaError> {
    let mut best = t.number(1)?;
    for i in 2..=t.count() {
        let x = t.number(i)?;
        if better(x, best) {
            best = x;
        }
    }
    t.push(best);
    Ok(1)
}

fn max(t: &mut Thread) -> Result<usize, LuaError> {
    extreme(t, |x, best| x > best)
}

fn min(t: &mut Thread) -> Result<usize, LuaError> {
    extreme(t, |x, best| x < best)
}

fn tointeger(t: &mut Thread) -> Result<usize, LuaError> {
    let v = match t.arg(1) {
        LuaValue::Number(n) => to_integer(n).map(|i| i as f64),
        _ => None,
    };
    t.push(v);
    Ok(1)
}

fn type_(t: &mut Thread) -> Result<usize, LuaError> {
    let kind = match t.check_any(1)? {
        LuaValue::Number(n) if to_integer(n).is_some() => LuaValue::from("integer"),
        LuaValue::Number(_) => LuaValue::from("float"),
        _ => LuaValue::Nil,
    };
    t.push(kind);
    Ok(1)
}

fn ult(t: &mut Thread) -> Result<usize, LuaError> {
    let a = t.integer(1)?;
    let b = t.integer(2)?;
    t.push((a as u64) < (b as u64));
    Ok(1)
}

fn random(t: &mut Thread, rng: &mut StdRng) -> Result<usize, LuaError> {
    let (low, high) = match t.count() {
        0 => {
            t.push(rng.gen::<f64>());
            return Ok(1);
        }
        1 => {
            let m = t.integer(1)?;
            if m == 0 {
                t.push(rng.gen::<i64>() as f64);
                return Ok(1);
            }
            (1, m)
        }
        2 => (t.integer(1)?, t.integer(2)?),
        _ => return Err(LuaError::msg("wrong number of arguments")),
    };
    if low > high {
        let arg = if t.count() == 1 { 1 } else { 2 };
        return Err(t.arg_error(arg, "interval is empty"));
    }
    t.push(rng.gen_range(low..=high) as f64);
    Ok(1)
}

fn randomseed(t: &mut Thread, rng: &mut StdRng) -> Result<usize, LuaError> {
    *rng = if t.count() == 0 {
        StdRng::from_entropy()
    } else {
        let n = t.number(1)?;
        StdRng::seed_from_u64(n.to_bits())
    };
    Ok(0)
}

#[cfg(test)]
mod tests {
    use crate::{LuaValue, Vm};

    fn run(src: &str) -> Vec<LuaValue> {
        Vm::new().exec(src, "math").unwrap()
    }

    fn run1(src: &str) -> LuaValue {
        run(src).into_iter().next().unwrap_or_default()
    }

    #[test]
    fn rounding_and_roots() {
        assert_eq!(run1("return math.floor(-3.5)"), LuaValue::Number(-4.0));
        assert_eq!(run1("return math.ceil(3.2)"), LuaValue::Number(4.0));
        assert_eq!(run1("return math.sqrt(16)"), LuaValue::Number(4.0));
        assert_eq!(run1("return math.abs(-2)"), LuaValue::Number(2.0));
        assert_eq!(run("return math.modf(3.75)"), vec![LuaValue::Number(3.0), LuaValue::Number(0.75)]);
        assert_eq!(run1("return math.fmod(-7, 3)"), LuaValue::Number(-1.0));
    }

    #[test]
    fn logarithms() {
        assert_eq!(run1("return math.log(8, 2)"), LuaValue::Number(3.0));
        assert_eq!(run1("return math.log(100, 10)"), LuaValue::Number(2.0));
        assert_eq!(run1("return math.log(1)"), LuaValue::Number(0.0));
    }

    #[test]
    fn extremes() {
        assert_eq!(run1("return math.max(3, 9, -1)"), LuaValue::Number(9.0));
        assert_eq!(run1("return math.min(3, 9, -1)"), LuaValue::Number(-1.0));
        let err = Vm::new().exec("return math.max()", "math").unwrap_err();
        assert_eq!(err.to_string(), "math:1: bad argument #1 to 'max' (number expected, got no value)");
    }

    #[test]
    fn integer_queries() {
        assert_eq!(run1("return math.tointeger(3.0)"), LuaValue::Number(3.0));
        assert_eq!(run1("return math.tointeger(3.5)"), LuaValue::Nil);
        assert_eq!(run("return math.type(1), math.type(1.5), math.type('1')"), vec![
            LuaValue::from("integer"),
            LuaValue::from("float"),
            LuaValue::Nil,
        ]);
        assert_eq!(run1("return math.ult(1, -1)"), LuaValue::Boolean(true));
        assert_eq!(run1("return math.huge > math.maxinteger"), LuaValue::Boolean(true));
    }

    #[test]
    fn random_is_seedable_and_bounded() {
        let src = "math.randomseed(42) local a = {math.random(1, 100), math.random(), math.random(6)}
                   math.randomseed(42) local b = {math.random(1, 100), math.random(), math.random(6)}
                   return a[1] == b[1] and a[2] == b[2] and a[3] == b[3],
                          a[1] >= 1 and a[1] <= 100, a[2] >= 0 and a[2] < 1, a[3] >= 1 and a[3] <= 6";
        assert_eq!(run(src), vec![LuaValue::Boolean(true); 4]);
        let err = Vm::new().exec("return math.random(5, 1)", "math").unwrap_err();
        assert_eq!(err.to_string(), "math:1: bad argument #2 to 'random' (interval is empty)");
    }
}
