use std::io::Write;

use lua_core::number::parse_number;

use super::{set_functions, table::unpack};
use crate::closure::{new_upvalue, LuaFunction};
use crate::error::LuaError;
use crate::table::LuaTable;
use crate::thread::{Event, Thread};
use crate::value::LuaValue;
use crate::vm::instantiate;

pub(super) fn open(g: &LuaTable) {
    set_functions(
        g,
        &[
            ("print", print),
            ("type", type_),
            ("tostring", tostring),
            ("tonumber", tonumber),
            ("ipairs", ipairs),
            ("pairs", pairs),
            ("next", next),
            ("select", select),
            ("rawget", rawget),
            ("rawset", rawset),
            ("rawequal", rawequal),
            ("rawlen", rawlen),
            ("setmetatable", setmetatable),
            ("getmetatable", getmetatable),
            ("assert", assert),
            ("error", error),
            ("pcall", pcall),
            ("xpcall", xpcall),
            ("unpack", unpack),
            ("load", load),
            ("collectgarbage", collectgarbage),
        ],
    );
    g.set_field("_G", g.clone());
    g.set_field("_VERSION", "Lua 5.4");
}

fn print(t: &mut Thread) -> Result<usize, LuaError> {
    let mut line = String::new();
    for (i, v) in t.args().iter().enumerate() {
        if i > 0 {
            line.push('\t');
        }
        line.push_str(&t.tostring(v)?.to_string());
    }
    let mut out = std::io::stdout().lock();
    writeln!(out, "{line}").map_err(|e| LuaError::msg(e.to_string()))?;
    Ok(0)
}

fn type_(t: &mut Thread) -> Result<usize, LuaError> {
    let v = t.check_any(1)?;
    t.push(v.type_name());
    Ok(1)
}

fn tostring(t: &mut Thread) -> Result<usize, LuaError> {
    let v = t.check_any(1)?;
    let s = t.tostring(&v)?;
    t.push(s);
    Ok(1)
}

fn tonumber(t: &mut Thread) -> Result<usize, LuaError> {
    if t.arg(2).is_nil() {
        let n = match t.check_any(1)? {
            LuaValue::Number(n) => Some(n),
            LuaValue::LuaString(s) => parse_number(&s),
            _ => None,
        };
        t.push(n);
        return Ok(1);
    }
    let base = t.integer(2)?;
    let LuaValue::LuaString(s) = t.arg(1) else {
        return Err(t.type_error(1, "string"));
    };
    if !(2..=36).contains(&base) {
        return Err(t.arg_error(2, "base out of range"));
    }
    t.push(parse_in_base(&s, base as u32));
    Ok(1)
}

/// An integer numeral in `base`, with optional surrounding spaces and sign.
fn parse_in_base(text: &str, base: u32) -> Option<f64> {
    let text = text.trim_matches(|c: char| c.is_ascii_whitespace() || c == '\x0b');
    let (negative, digits) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text),
    };
    if digits.is_empty() {
        return None;
    }
    let mut acc: i64 = 0;
    for c in digits.chars() {
        let d = c.to_digit(base)?;
        acc = acc.wrapping_mul(base as i64).wrapping_add(d as i64);
    }
    let value = if negative { acc.wrapping_neg() } else { acc };
    Some(value as f64)
}

fn ipairs(t: &mut Thread) -> Result<usize, LuaError> {
    let v = t.check_any(1)?;
    let iter = LuaFunction::native("ipairs_iterator", ipairs_next);
    Ok(t.ret([LuaValue::Function(iter), v, LuaValue::Number(0.0)]))
}

fn ipairs_next(t: &mut Thread) -> Result<usize, LuaError> {
    let v = t.arg(1);
    let i = t.integer(2)? + 1;
    let key = LuaValue::from(i);
    let value = t.index(&v, &key)?;
    if value.is_nil() {
        t.push(LuaValue::Nil);
        return Ok(1);
    }
    Ok(t.ret([key, value]))
}

fn pairs(t: &mut Thread) -> Result<usize, LuaError> {
    let v = t.check_any(1)?;
    let h = t.metamethod(&v, Event::Pairs);
    if !h.is_nil() {
        let mut results = t.call(h, [v])?;
        results.resize(3, LuaValue::Nil);
        return Ok(t.ret(results));
    }
    t.table(1)?;
    let next = LuaFunction::native("next", next);
    Ok(t.ret([LuaValue::Function(next), v, LuaValue::Nil]))
}

fn next(t: &mut Thread) -> Result<usize, LuaError> {
    let table = t.table(1)?;
    match table.next(&t.arg(2))? {
        Some((k, v)) => Ok(t.ret([k, v])),
        None => {
            t.push(LuaValue::Nil);
            Ok(1)
        }
    }
}

fn select(t: &mut Thread) -> Result<usize, LuaError> {
    let extra = t.count().saturating_sub(1);
    if let LuaValue::LuaString(s) = t.arg(1) {
        if &*s == "#" {
            t.push(extra);
            return Ok(1);
        }
    }
    let n = t.integer(1)?;
    if n <= 0 {
        return Err(t.arg_error(1, "index out of range"));
    }
    let rest = t.args_from(n as usize + 1);
    Ok(t.ret(rest))
}

fn rawget(t: &mut Thread) -> Result<usize, LuaError> {
    let table = t.table(1)?;
    let key = t.check_any(2)?;
    t.push(table.get(&key));
    Ok(1)
}

fn rawset(t: &mut Thread) -> Result<usize, LuaError> {
    let table = t.table(1)?;
    let key = t.check_any(2)?;
    let value = t.check_any(3)?;
    table.set(key, value)?;
    t.push(table);
    Ok(1)
}

fn rawequal(t: &mut Thread) -> Result<usize, LuaError> {
    let a = t.check_any(1)?;
    let b = t.check_any(2)?;
    t.push(a == b);
    Ok(1)
}

fn rawlen(t: &mut Thread) -> Result<usize, LuaError> {
    let n = match t.arg(1) {
        LuaValue::Table(table) => table.len(),
        LuaValue::LuaString(s) => s.len(),
        _ => return Err(t.arg_error(1, "table or string expected")),
    };
    t.push(n);
    Ok(1)
}

fn setmetatable(t: &mut Thread) -> Result<usize, LuaError> {
    let table = t.table(1)?;
    let mt = match t.arg(2) {
        LuaValue::Nil => None,
        LuaValue::Table(mt) => Some(mt),
        _ => return Err(t.type_error(2, "nil or table")),
    };
    let protected = table
        .metatable()
        .is_some_and(|old| !old.get_field("__metatable").is_nil());
    if protected {
        return Err(LuaError::msg("cannot change a protected metatable"));
    }
    table.set_metatable(mt);
    t.push(table);
    Ok(1)
}

fn getmetatable(t: &mut Thread) -> Result<usize, LuaError> {
    let v = t.check_any(1)?;
    let result = match t.metatable_of(&v) {
        Some(mt) => {
            let guard = mt.get_field("__metatable");
            if guard.is_nil() {
                LuaValue::Table(mt)
            } else {
                guard
            }
        }
        None => LuaValue::Nil,
    };
    t.push(result);
    Ok(1)
}

fn assert(t: &mut Thread) -> Result<usize, LuaError> {
    let v = t.check_any(1)?;
    if v.is_truthy() {
        return Ok(t.count());
    }
    if t.count() >= 2 {
        return Err(LuaError::Runtime(t.arg(2)));
    }
    Err(LuaError::msg("assertion failed!"))
}

fn error(t: &mut Thread) -> Result<usize, LuaError> {
    let value = t.arg(1);
    let level = t.opt_integer(2, 1)?;
    if let LuaValue::LuaString(msg) = &value {
        if level > 0 {
            if let Some(pos) = t.where_(level as usize) {
                return Err(LuaError::Runtime(LuaValue::from(format!("{pos} {msg}"))));
            }
        }
    }
    Err(LuaError::Runtime(value))
}

fn pcall(t: &mut Thread) -> Result<usize, LuaError> {
    t.check_any(1)?;
    t.request_protected_call(None);
    Ok(0)
}

fn xpcall(t: &mut Thread) -> Result<usize, LuaError> {
    let handler = t.check_any(2)?;
    t.remove_arg(2);
    t.request_protected_call(Some(handler));
    Ok(0)
}

fn load(t: &mut Thread) -> Result<usize, LuaError> {
    let (source, default_name) = match t.arg(1) {
        LuaValue::LuaString(s) => {
            let name = string_chunk_name(&s);
            (s.to_string(), name)
        }
        f @ LuaValue::Function(_) => {
            let mut source = String::new();
            loop {
                match t.call1(f.clone(), [])? {
                    LuaValue::LuaString(piece) if !piece.is_empty() => source.push_str(&piece),
                    LuaValue::Nil | LuaValue::LuaString(_) => break,
                    _ => {
                        return Ok(t.ret([
                            LuaValue::Nil,
                            LuaValue::from("reader function must return a string"),
                        ]))
                    }
                }
            }
            (source, "(load)".to_string())
        }
        _ => return Err(t.type_error(1, "string")),
    };
    let name = match t.opt_string(2)? {
        Some(name) => match name.strip_prefix(['=', '@']) {
            Some(stripped) => stripped.to_string(),
            None => format!("[string \"{name}\"]"),
        },
        None => default_name,
    };
    if let Some(mode) = t.opt_string(3)? {
        if !mode.contains('t') {
            let msg = format!("attempt to load a text chunk (mode is '{mode}')");
            return Ok(t.ret([LuaValue::Nil, LuaValue::from(msg)]));
        }
    }
    let proto = match lua_compiler::compile(&source, &name) {
        Ok(proto) => proto,
        Err(err) => return Ok(t.ret([LuaValue::Nil, LuaValue::from(err.to_string())])),
    };
    let env = if t.count() >= 4 {
        new_upvalue(t.arg(4))
    } else {
        t.rt.env.clone()
    };
    t.push(instantiate(proto, env));
    Ok(1)
}

/// `[string "first line..."]`, the display name of a string chunk.
fn string_chunk_name(source: &str) -> String {
    const MAX: usize = 40;
    let first = source.lines().next().unwrap_or("");
    let mut shown: String = first.chars().take(MAX).collect();
    if shown.len() < source.len() {
        shown.push_str("...");
    }
    format!("[string \"{shown}\"]")
}

fn collectgarbage(t: &mut Thread) -> Result<usize, LuaError> {
    let opt = t.opt_string(1)?;
    match opt.as_deref().unwrap_or("collect") {
        "collect" | "count" | "step" | "incremental" | "generational" | "stop" | "restart" => {
            t.push(0.0)
        }
        "isrunning" => t.push(true),
        other => {
            let msg = format!("invalid option '{other}'");
            return Err(t.arg_error(1, msg));
        }
    }
    Ok(1)
}
