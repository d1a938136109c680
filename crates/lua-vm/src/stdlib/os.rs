//! `os`: wall-clock time and dates (always UTC), process clock, and the
//! host-touching functions gated behind `include_unsafe`.

use std::fmt::Write as _;
use std::io;
use std::time::Instant;

use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, Datelike, NaiveDate, Timelike, Utc};
use lua_core::number::to_integer;

use super::{library, set_functions};
use crate::closure::LuaFunction;
use crate::error::LuaError;
use crate::table::LuaTable;
use crate::thread::Thread;
use crate::value::LuaValue;

pub(super) fn module(include_unsafe: bool) -> LuaTable {
    let m = library(&[("time", time), ("date", date)]);
    let started = Instant::now();
    m.set_field(
        "clock",
        LuaFunction::native("clock", move |t| {
            t.push(started.elapsed().as_secs_f64());
            Ok(1)
        }),
    );
    if include_unsafe {
        set_functions(
            &m,
            &[
                ("getenv", getenv),
                ("exit", exit),
                ("remove", remove),
                ("rename", rename),
            ],
        );
    }
    m
}

// ── Calendar ──────────────────────────────────────────────────────────────────

fn utc(ts: i64) -> Result<DateTime<Utc>, LuaError> {
    DateTime::from_timestamp(ts, 0).ok_or_else(|| LuaError::msg("time out of range"))
}

/// `strftime` through chrono. Each `%x` is checked on its own so the error
/// names the conversion.
fn strftime(dt: &DateTime<Utc>, fmt: &str) -> Result<String, LuaError> {
    let mut chars = fmt.chars();
    while let Some(c) = chars.next() {
        if c != '%' {
            continue;
        }
        let spec = chars.next().map_or_else(|| "%".to_string(), |c| format!("%{c}"));
        if StrftimeItems::new(&spec).any(|item| matches!(item, Item::Error)) {
            return Err(LuaError::msg(format!("invalid conversion specifier '{spec}'")));
        }
    }
    let mut out = String::with_capacity(fmt.len() * 2);
    write!(out, "{}", dt.format(fmt))
        .map_err(|_| LuaError::msg(format!("invalid conversion specifier '{fmt}'")))?;
    Ok(out)
}

fn date_table(dt: &DateTime<Utc>) -> LuaTable {
    let t = LuaTable::with_capacity(0, 9);
    t.set_field("year", i64::from(dt.year()));
    t.set_field("month", i64::from(dt.month()));
    t.set_field("day", i64::from(dt.day()));
    t.set_field("hour", i64::from(dt.hour()));
    t.set_field("min", i64::from(dt.minute()));
    t.set_field("sec", i64::from(dt.second()));
    t.set_field("wday", i64::from(dt.weekday().num_days_from_sunday() + 1));
    t.set_field("yday", i64::from(dt.ordinal()));
    t.set_field("isdst", false);
    t
}

// ── Safe functions ────────────────────────────────────────────────────────────

fn date_field(t: &LuaTable, name: &str, default: Option<i64>) -> Result<i64, LuaError> {
    match t.get_field(name) {
        LuaValue::Nil => default
            .ok_or_else(|| LuaError::msg(format!("field '{name}' missing in date table"))),
        v => v
            .to_number()
            .and_then(to_integer)
            .ok_or_else(|| LuaError::msg(format!("field '{name}' is not an integer"))),
    }
}

fn time(t: &mut Thread) -> Result<usize, LuaError> {
    if t.arg(1).is_nil() {
        t.push(Utc::now().timestamp());
        return Ok(1);
    }
    let fields = t.table(1)?;
    let year = date_field(&fields, "year", None)?;
    let month = date_field(&fields, "month", None)?;
    let day = date_field(&fields, "day", None)?;
    let hour = date_field(&fields, "hour", Some(12))?;
    let min = date_field(&fields, "min", Some(0))?;
    let sec = date_field(&fields, "sec", Some(0))?;
    // Out-of-range fields roll over: months into years, the rest into seconds.
    let year = year + (month - 1).div_euclid(12);
    let month = (month - 1).rem_euclid(12) + 1;
    let first = i32::try_from(year)
        .ok()
        .and_then(|y| NaiveDate::from_ymd_opt(y, month as u32, 1))
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .ok_or_else(|| LuaError::msg("field 'year' is out-of-bound"))?;
    let ts = first.and_utc().timestamp() + (day - 1) * 86_400 + hour * 3600 + min * 60 + sec;
    t.push(ts);
    Ok(1)
}

fn date(t: &mut Thread) -> Result<usize, LuaError> {
    let fmt = t.opt_string(1)?.unwrap_or_else(|| "%c".into());
    let ts = t.opt_integer(2, Utc::now().timestamp())?;
    let fmt = fmt.strip_prefix('!').unwrap_or(&fmt);
    let dt = utc(ts)?;
    if fmt.starts_with("*t") {
        t.push(date_table(&dt));
    } else {
        let s = strftime(&dt, fmt)?;
        t.push(s);
    }
    Ok(1)
}

// ── Unsafe functions ──────────────────────────────────────────────────────────

fn getenv(t: &mut Thread) -> Result<usize, LuaError> {
    let name = t.string(1)?;
    t.push(std::env::var(&*name).ok());
    Ok(1)
}

fn exit(t: &mut Thread) -> Result<usize, LuaError> {
    let code = match t.arg(1) {
        LuaValue::Nil | LuaValue::Boolean(true) => 0,
        LuaValue::Boolean(false) => 1,
        _ => t.integer(1)? as i32,
    };
    tracing::debug!(code, "os.exit");
    std::process::exit(code)
}

/// `nil, "path: reason", errno` for a failed file operation.
fn io_failure(t: &mut Thread, path: &str, err: io::Error) -> usize {
    let code = err.raw_os_error().unwrap_or(0);
    let text = err.to_string();
    let reason = text.split(" (os error").next().unwrap_or(&text);
    t.ret([
        LuaValue::Nil,
        LuaValue::from(format!("{path}: {reason}")),
        LuaValue::from(i64::from(code)),
    ])
}

fn remove(t: &mut Thread) -> Result<usize, LuaError> {
    let path = t.string(1)?;
    let result = match std::fs::metadata(&*path) {
        Ok(meta) if meta.is_dir() => std::fs::remove_dir(&*path),
        _ => std::fs::remove_file(&*path),
    };
    match result {
        Ok(()) => {
            t.push(true);
            Ok(1)
        }
        Err(err) => Ok(io_failure(t, &path, err)),
    }
}

fn rename(t: &mut Thread) -> Result<usize, LuaError> {
    let from = t.string(1)?;
    let to = t.string(2)?;
    match std::fs::rename(&*from, &*to) {
        Ok(()) => {
            t.push(true);
            Ok(1)
        }
        Err(err) => Ok(io_failure(t, &from, err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{StdLib, Vm, VmConfig};

    fn run(src: &str) -> Vec<LuaValue> {
        Vm::new().exec(src, "os").unwrap()
    }

    #[test]
    fn broken_down_time() {
        let src = "local t = os.date('!*t', 951782400 + 3661)
                   return t.year, t.month, t.day, t.hour, t.min, t.sec, t.wday, t.yday";
        let expected: Vec<LuaValue> = [2000.0, 2.0, 29.0, 1.0, 1.0, 1.0, 3.0, 60.0]
            .into_iter()
            .map(LuaValue::Number)
            .collect();
        assert_eq!(run(src), expected);
    }

    #[test]
    fn date_formats_with_strftime() {
        let src = "local ts = 951782400 + 3661
                   return os.date('!%Y-%m-%d %H:%M:%S %a %b %j', ts), os.date('!%c', ts), os.date('%x', ts)";
        assert_eq!(
            run(src),
            vec![
                LuaValue::from("2000-02-29 01:01:01 Tue Feb 060"),
                LuaValue::from("Tue Feb 29 01:01:01 2000"),
                LuaValue::from("02/29/00"),
            ]
        );
        let err = Vm::new().exec("return os.date('%Q', 0)", "os").unwrap_err();
        assert_eq!(err.to_string(), "os:1: invalid conversion specifier '%Q'");
    }

    #[test]
    fn time_from_table() {
        let src = "return os.time{year = 2000, month = 1, day = 1, hour = 0},
                          os.time{year = 1999, month = 13, day = 1, hour = 0},
                          os.time{year = 1999, month = 12, day = 32, hour = 0}";
        assert_eq!(run(src), vec![LuaValue::Number(946_684_800.0); 3]);
        let err = Vm::new().exec("return os.time{year = 2000, month = 1}", "os").unwrap_err();
        assert_eq!(err.to_string(), "os:1: field 'day' missing in date table");
    }

    #[test]
    fn date_round_trips_through_time() {
        let src = "local t = os.date('!*t', 86400 * 365)
                   return t.year, t.month, t.day, t.wday, os.time(t) == 86400 * 365,
                          os.date('!%Y-%m-%d', 0)";
        assert_eq!(
            run(src),
            vec![
                LuaValue::Number(1971.0),
                LuaValue::Number(1.0),
                LuaValue::Number(1.0),
                LuaValue::Number(6.0),
                LuaValue::Boolean(true),
                LuaValue::from("1970-01-01"),
            ]
        );
    }

    #[test]
    fn clock_advances() {
        let src = "local a = os.clock() local b = os.clock() return type(a), b >= a";
        assert_eq!(run(src), vec![LuaValue::from("number"), LuaValue::Boolean(true)]);
    }

    #[test]
    fn unsafe_functions_are_gated() {
        let mut vm = Vm::with_config(VmConfig::default().libs(StdLib::safe()));
        let results = vm
            .exec("return os.getenv, os.exit, os.remove, os.rename, os.time ~= nil", "os")
            .unwrap();
        assert_eq!(
            results,
            vec![
                LuaValue::Nil,
                LuaValue::Nil,
                LuaValue::Nil,
                LuaValue::Nil,
                LuaValue::Boolean(true),
            ]
        );
    }

    #[test]
    fn file_operations_report_failures() {
        let results = run("return os.remove('/nonexistent/definitely/missing')");
        assert_eq!(results[0], LuaValue::Nil);
        let msg = results[1].as_str().unwrap();
        assert!(msg.starts_with("/nonexistent/definitely/missing: "), "{msg}");
        assert_eq!(results[2], LuaValue::Number(2.0));

        let dir = std::env::temp_dir().join(format!("lua-os-{}", std::process::id()));
        std::fs::write(&dir, "x").unwrap();
        let target = dir.with_extension("moved");
        let src = format!(
            "return os.rename({:?}, {:?}), os.remove({:?})",
            dir.display().to_string(),
            target.display().to_string(),
            target.display().to_string()
        );
        assert_eq!(run(&src), vec![LuaValue::Boolean(true), LuaValue::Boolean(true)]);
    }
}
