use super::library;
use crate::closure::LuaFunction;
use crate::coroutine::LuaThread;
use crate::error::LuaError;
use crate::table::LuaTable;
use crate::thread::Thread;
use crate::value::LuaValue;

pub(super) fn module() -> LuaTable {
    library(&[
        ("create", create),
        ("resume", resume),
        ("yield", yield_),
        ("status", status),
        ("running", running),
        ("isyieldable", isyieldable),
        ("wrap", wrap),
        ("close", close),
    ])
}

fn create(t: &mut Thread) -> Result<usize, LuaError> {
    let body = t.function(1)?;
    let co = LuaThread::new(t.rt.clone(), body);
    t.push(co);
    Ok(1)
}

fn resume(t: &mut Thread) -> Result<usize, LuaError> {
    let co = t.thread(1)?;
    let args = t.args_from(2);
    match co.resume(t, args) {
        Ok(values) => {
            t.push(true);
            Ok(1 + t.ret(values))
        }
        Err(err) => Ok(t.ret([LuaValue::Boolean(false), err.into_value()])),
    }
}

fn yield_(t: &mut Thread) -> Result<usize, LuaError> {
    t.request_yield()?;
    // The arguments are the topmost values; they are what gets yielded.
    Ok(t.count())
}

fn status(t: &mut Thread) -> Result<usize, LuaError> {
    let co = t.thread(1)?;
    t.push(co.status().as_str());
    Ok(1)
}

fn running(t: &mut Thread) -> Result<usize, LuaError> {
    match t.current() {
        Some(co) => {
            let is_main = co.is_main();
            Ok(t.ret([LuaValue::Thread(co), LuaValue::Boolean(is_main)]))
        }
        None => Ok(t.ret([LuaValue::Nil, LuaValue::Boolean(true)])),
    }
}

fn isyieldable(t: &mut Thread) -> Result<usize, LuaError> {
    let yieldable = t.is_yieldable();
    t.push(yieldable);
    Ok(1)
}

fn wrap(t: &mut Thread) -> Result<usize, LuaError> {
    let body = t.function(1)?;
    let co = LuaThread::new(t.rt.clone(), body);
    let f = LuaFunction::native("wrap", move |t| {
        let args = t.args();
        let values = co.resume(t, args)?;
        Ok(t.ret(values))
    });
    t.push(f);
    Ok(1)
}

fn close(t: &mut Thread) -> Result<usize, LuaError> {
    let co = t.thread(1)?;
    match co.close()? {
        None => t.push(true),
        Some(err) => {
            return Ok(t.ret([LuaValue::Boolean(false), err]));
        }
    }
    Ok(1)
}

#[cfg(test)]
mod tests {
    use crate::{LuaValue, Vm};

    fn run(src: &str) -> Vec<LuaValue> {
        Vm::new().exec(src, "co").unwrap()
    }

    fn strs(values: &[&str]) -> Vec<LuaValue> {
        values.iter().map(|s| LuaValue::from(*s)).collect()
    }

    #[test]
    fn status_transitions() {
        let src = "local co
                   co = coroutine.create(function()
                       local inner = coroutine.status(co)
                       coroutine.yield(inner)
                   end)
                   local before = coroutine.status(co)
                   local _, inside = coroutine.resume(co)
                   local paused = coroutine.status(co)
                   coroutine.resume(co)
                   return before, inside, paused, coroutine.status(co)";
        assert_eq!(run(src), strs(&["suspended", "running", "suspended", "dead"]));
    }

    #[test]
    fn resumer_is_normal_while_nested_runs() {
        let src = "local outer
                   outer = coroutine.create(function()
                       local inner = coroutine.create(function() return coroutine.status(outer) end)
                       local _, s = coroutine.resume(inner)
                       return s
                   end)
                   local _, s = coroutine.resume(outer)
                   return s";
        assert_eq!(run(src), strs(&["normal"]));
    }

    #[test]
    fn running_and_isyieldable() {
        let src = "local main, is_main = coroutine.running()
                   local co = coroutine.create(function()
                       local me, flag = coroutine.running()
                       return type(me), flag, coroutine.isyieldable()
                   end)
                   local _, t, flag, y = coroutine.resume(co)
                   return type(main), is_main, t, flag, y, coroutine.isyieldable()";
        assert_eq!(
            run(src),
            vec![
                LuaValue::from("thread"),
                LuaValue::Boolean(true),
                LuaValue::from("thread"),
                LuaValue::Boolean(false),
                LuaValue::Boolean(true),
                LuaValue::Boolean(false),
            ]
        );
    }

    #[test]
    fn wrap_propagates_errors() {
        let src = "local gen = coroutine.wrap(function() coroutine.yield(1) error('done', 0) end)
                   local first = gen()
                   local ok, err = pcall(gen)
                   return first, ok, err";
        assert_eq!(
            run(src),
            vec![LuaValue::Number(1.0), LuaValue::Boolean(false), LuaValue::from("done")]
        );
    }

    #[test]
    fn close_reports_failures() {
        let src = "local ok_co = coroutine.create(function() coroutine.yield() end)
                   coroutine.resume(ok_co)
                   local closed = coroutine.close(ok_co)
                   local bad = coroutine.create(function() error('x', 0) end)
                   coroutine.resume(bad)
                   local ok, err = coroutine.close(bad)
                   return closed, coroutine.status(ok_co), ok, err";
        assert_eq!(
            run(src),
            vec![
                LuaValue::Boolean(true),
                LuaValue::from("dead"),
                LuaValue::Boolean(false),
                LuaValue::from("x"),
            ]
        );
    }

    #[test]
    fn yield_outside_coroutine_fails() {
        let err = Vm::new().exec("coroutine.yield(1)", "co").unwrap_err();
        assert_eq!(err.to_string(), "co:1: attempt to yield from outside a coroutine");
    }

    #[test]
    fn yield_across_native_boundary_fails() {
        let src = "local co = coroutine.create(function()
                       return pcall(coroutine.yield, 1)
                   end)
                   return coroutine.resume(co)";
        assert_eq!(
            run(src),
            vec![
                LuaValue::Boolean(true),
                LuaValue::Boolean(false),
                LuaValue::from("attempt to yield across a C-call boundary"),
            ]
        );
    }
}
