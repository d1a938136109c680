//! Coroutines driven from Lua and from the host.

use lua_vm::{CoStatus, LuaValue, Vm};

fn run(src: &str) -> Vec<LuaValue> {
    Vm::new()
        .exec(src, "co")
        .unwrap_or_else(|e| panic!("{src:?} failed: {e}"))
}

fn num(n: f64) -> LuaValue {
    LuaValue::Number(n)
}

fn yes() -> LuaValue {
    LuaValue::Boolean(true)
}

#[test]
fn yield_from_three_nested_calls() {
    let src = "local function level3(x)
                   local got = coroutine.yield(x * 2, 'deep')
                   return got + 1
               end
               local function level2(x) local r = level3(x + 1) return r * 10 end
               local function level1(x) local keep = x return level2(x) + keep end
               local co = coroutine.create(level1)
               local ok1, a, b = coroutine.resume(co, 1)
               local ok2, final = coroutine.resume(co, 100)
               local ok3, err = coroutine.resume(co)
               return ok1, a, b, ok2, final, ok3, err";
    assert_eq!(
        run(src),
        vec![
            yes(),
            num(4.0),
            LuaValue::from("deep"),
            yes(),
            num(1011.0),
            LuaValue::Boolean(false),
            LuaValue::from("cannot resume dead coroutine"),
        ]
    );
}

#[test]
fn registers_survive_suspension() {
    let src = "local co = coroutine.wrap(function(a, b)
                   local sum = 0
                   for i = a, b do
                       local before = sum
                       sum = sum + i
                       coroutine.yield(before, sum)
                   end
                   return 'finished', sum
               end)
               local log = {}
               for _ = 1, 3 do
                   local x, y = co(1, 3)
                   log[#log + 1] = x .. ':' .. y
               end
               local tag, total = co()
               return table.concat(log, ' '), tag, total";
    assert_eq!(
        run(src),
        vec![LuaValue::from("0:1 1:3 3:6"), LuaValue::from("finished"), num(6.0)]
    );
}

#[test]
fn generators_in_generic_for() {
    let src = "local function range(n)
                   return coroutine.wrap(function()
                       for i = 1, n do coroutine.yield(i) end
                   end)
               end
               local total = 0
               for v in range(5) do total = total + v end
               return total";
    assert_eq!(run(src), vec![num(15.0)]);
}

#[test]
fn errors_inside_coroutines_kill_them() {
    let src = "local co = coroutine.create(function() local x = nil; return x.field end)
               local ok, err = coroutine.resume(co)
               return ok, err, coroutine.status(co)";
    assert_eq!(
        run(src),
        vec![
            LuaValue::Boolean(false),
            LuaValue::from("co:1: attempt to index a nil value"),
            LuaValue::from("dead"),
        ]
    );
}

#[test]
fn pcall_inside_coroutine_catches_and_yield_still_works() {
    let src = "local co = coroutine.create(function()
                   local ok, err = pcall(function()
                       coroutine.yield('inside pcall')
                       error('after resume', 0)
                   end)
                   coroutine.yield(ok, err)
                   return 'done'
               end)
               local _, a = coroutine.resume(co)
               local _, ok, err = coroutine.resume(co)
               local _, last = coroutine.resume(co)
               return a, ok, err, last";
    assert_eq!(
        run(src),
        vec![
            LuaValue::from("inside pcall"),
            LuaValue::Boolean(false),
            LuaValue::from("after resume"),
            LuaValue::from("done"),
        ]
    );
}

#[test]
fn resuming_a_running_coroutine_fails() {
    let src = "local co
               co = coroutine.create(function() return coroutine.resume(co) end)
               return coroutine.resume(co)";
    assert_eq!(
        run(src),
        vec![
            yes(),
            LuaValue::Boolean(false),
            LuaValue::from("cannot resume non-suspended coroutine"),
        ]
    );
}

#[test]
fn host_drives_a_coroutine() {
    let mut vm = Vm::new();
    let body = vm
        .exec(
            "return function(a) local b = coroutine.yield(a + 1) return b * 2 end",
            "host",
        )
        .unwrap()
        .remove(0);
    let co = vm.create_thread(body);
    assert_eq!(co.status(), CoStatus::Suspended);

    let main = vm.main_thread();
    assert_eq!(co.resume(main, vec![num(1.0)]).unwrap(), vec![num(2.0)]);
    assert_eq!(co.status(), CoStatus::Suspended);
    assert_eq!(co.resume(main, vec![num(21.0)]).unwrap(), vec![num(42.0)]);
    assert_eq!(co.status(), CoStatus::Dead);
    assert!(co.resume(main, vec![]).is_err());
}
