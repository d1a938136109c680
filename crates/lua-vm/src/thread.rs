//! Execution state: the runtime shared by all threads, and the per-thread
//! register stack and call-frame stack.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use lua_core::MULTI;

use crate::closure::{new_upvalue, LuaClosure, LuaFunction, NativeFunction, Upvalue};
use crate::config::VmConfig;
use crate::coroutine::Coroutine;
use crate::error::LuaError;
use crate::table::LuaTable;
use crate::value::LuaValue;

/// Free native stack required before a host re-entry runs in place.
pub(crate) const STACK_RED_ZONE: usize = 256 * 1024;
/// Size of each extra native stack segment.
pub(crate) const STACK_GROW_SIZE: usize = 1024 * 1024;

// ── Metamethod events ─────────────────────────────────────────────────────────

/// Metatable keys the VM consults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Event {
    Index,
    NewIndex,
    Call,
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
    Concat,
    Len,
    Eq,
    Lt,
    Le,
    ToString,
    Name,
    Pairs,
    Metatable,
}

impl Event {
    const ALL: [Event; 26] = [
        Event::Index,
        Event::NewIndex,
        Event::Call,
        Event::Add,
        Event::Sub,
        Event::Mul,
        Event::Div,
        Event::Mod,
        Event::Pow,
        Event::IDiv,
        Event::Unm,
        Event::BAnd,
        Event::BOr,
        Event::BXor,
        Event::Shl,
        Event::Shr,
        Event::BNot,
        Event::Concat,
        Event::Len,
        Event::Eq,
        Event::Lt,
        Event::Le,
        Event::ToString,
        Event::Name,
        Event::Pairs,
        Event::Metatable,
    ];

    pub(crate) fn key(self) -> &'static str {
        match self {
            Event::Index => "__index",
            Event::NewIndex => "__newindex",
            Event::Call => "__call",
            Event::Add => "__add",
            Event::Sub => "__sub",
            Event::Mul => "__mul",
            Event::Div => "__div",
            Event::Mod => "__mod",
            Event::Pow => "__pow",
            Event::IDiv => "__idiv",
            Event::Unm => "__unm",
            Event::BAnd => "__band",
            Event::BOr => "__bor",
            Event::BXor => "__bxor",
            Event::Shl => "__shl",
            Event::Shr => "__shr",
            Event::BNot => "__bnot",
            Event::Concat => "__concat",
            Event::Len => "__len",
            Event::Eq => "__eq",
            Event::Lt => "__lt",
            Event::Le => "__le",
            Event::ToString => "__tostring",
            Event::Name => "__name",
            Event::Pairs => "__pairs",
            Event::Metatable => "__metatable",
        }
    }
}

// ── Runtime ───────────────────────────────────────────────────────────────────

/// State shared by the main thread and every coroutine of one interpreter.
pub(crate) struct Runtime {
    pub globals: LuaTable,
    /// The `_ENV` cell every top-level chunk captures.
    pub env: Upvalue,
    /// Metatable shared by all strings (`("x"):upper()`).
    pub string_meta: RefCell<Option<LuaTable>>,
    pub config: VmConfig,
    /// Interned event keys, indexed by `Event as usize`.
    events: Vec<LuaValue>,
    /// Nested host re-entries across all threads.
    pub host_depth: Cell<usize>,
}

impl Runtime {
    pub fn new(config: VmConfig) -> Self {
        let globals = LuaTable::new();
        Self {
            env: new_upvalue(LuaValue::Table(globals.clone())),
            globals,
            string_meta: RefCell::new(None),
            config,
            events: Event::ALL.iter().map(|e| LuaValue::from(e.key())).collect(),
            host_depth: Cell::new(0),
        }
    }

    pub fn event(&self, event: Event) -> &LuaValue {
        &self.events[event as usize]
    }
}

// ── Call frame ────────────────────────────────────────────────────────────────

/// A single entry on the call stack.
pub(crate) struct CallFrame {
    /// The function being executed.
    pub closure: Rc<LuaClosure>,
    /// Index of the next instruction.
    pub pc: usize,
    /// Absolute stack index of register 0.
    pub base: usize,
    /// Absolute stack index the results are copied to.
    pub ret_dst: usize,
    /// Results the caller wants (`MULTI`: all).
    pub nresults: u8,
    /// Arguments beyond the fixed parameters.
    pub varargs: Vec<LuaValue>,
    /// Cells of captured locals, indexed by `NewCell`/`GetCell` operands.
    pub cells: Vec<Upvalue>,
    /// Set on frames entered through `pcall`/`xpcall`.
    pub catch: Option<Catch>,
}

/// A protected-call boundary.
#[derive(Clone)]
pub(crate) struct Catch {
    /// `xpcall` message handler.
    pub handler: Option<LuaValue>,
}

/// What a native function asked the VM to do after it returns.
pub(crate) enum Request {
    /// Suspend the coroutine, yielding the native's results.
    Yield,
    /// Call the value after the native's own slot in protected mode.
    ProtectedCall { handler: Option<LuaValue> },
}

/// Arguments of the native function currently running.
#[derive(Clone, Default)]
pub(crate) struct NativeCall {
    pub base: usize,
    pub nargs: usize,
    pub name: Option<Rc<str>>,
}

pub(crate) enum Called {
    /// A Lua frame was pushed; the dispatch loop continues in it.
    Lua,
    /// The callee finished; results are in place.
    Native,
    /// A native asked to suspend the running coroutine.
    Yield(Vec<LuaValue>),
}

pub(crate) enum Exit {
    /// The entry frame returned; results are at its `ret_dst..top`.
    Returned,
    Yielded(Vec<LuaValue>),
}

// ── Thread ────────────────────────────────────────────────────────────────────

/// One Lua execution context: a register stack and a call-frame stack.
///
/// Native functions receive the thread that called them and use it to read
/// arguments, push results and call back into Lua.
pub struct Thread {
    pub(crate) rt: Rc<Runtime>,
    pub(crate) stack: Vec<LuaValue>,
    pub(crate) frames: Vec<CallFrame>,
    /// End of the last variable-length run of values.
    pub(crate) top: usize,
    pub(crate) native: NativeCall,
    pub(crate) request: Option<Request>,
    /// Where the values passed to the next `resume` go.
    pub(crate) resume_target: Option<(usize, u8)>,
    /// Host re-entries active on this thread; yielding needs zero.
    pub(crate) nny: usize,
    pub(crate) handle: Weak<RefCell<Coroutine>>,
    pub(crate) is_main: bool,
}

impl Thread {
    pub(crate) fn new(rt: Rc<Runtime>, handle: Weak<RefCell<Coroutine>>, is_main: bool) -> Self {
        Self {
            rt,
            stack: Vec::new(),
            frames: Vec::new(),
            top: 0,
            native: NativeCall::default(),
            request: None,
            resume_target: None,
            nny: 0,
            handle,
            is_main,
        }
    }

    pub(crate) fn config(&self) -> &VmConfig {
        &self.rt.config
    }

    // ── Calls ─────────────────────────────────────────────────────────────────

    /// Start a call of `stack[func]` with `nargs` arguments after it.
    ///
    /// Results go to `ret_dst` (equal to `func`, or `func - 1` for protected
    /// calls whose status flag occupies that slot).
    pub(crate) fn precall(
        &mut self,
        func: usize,
        nargs: usize,
        nresults: u8,
        ret_dst: usize,
        catch: Option<Catch>,
    ) -> Result<Called, LuaError> {
        let callee = self.stack[func].clone();
        match callee {
            LuaValue::Function(LuaFunction::Lua(closure)) => {
                self.push_frame(closure, func, nargs, nresults, ret_dst, catch)?;
                Ok(Called::Lua)
            }
            LuaValue::Function(LuaFunction::Native(native)) => match catch {
                Some(catch) => self.protected_native(func, nargs, nresults, ret_dst, catch),
                None => self.call_native(&native, func, nargs, nresults, ret_dst),
            },
            other => {
                let handler = self.metamethod(&other, Event::Call);
                if !matches!(handler, LuaValue::Function(_)) {
                    return Err(LuaError::msg(format!(
                        "attempt to call a {} value",
                        other.type_name()
                    )));
                }
                self.stack.truncate(func + 1 + nargs);
                self.stack.insert(func, handler);
                self.precall(func, nargs + 1, nresults, ret_dst, catch)
            }
        }
    }

    fn push_frame(
        &mut self,
        closure: Rc<LuaClosure>,
        func: usize,
        nargs: usize,
        nresults: u8,
        ret_dst: usize,
        catch: Option<Catch>,
    ) -> Result<(), LuaError> {
        if self.frames.len() >= self.rt.config.max_call_depth {
            return Err(LuaError::StackOverflow);
        }
        let proto = &closure.proto;
        let base = func + 1;
        let extent = base + proto.max_stack.max(proto.param_count as usize);
        if extent > self.rt.config.max_stack_slots {
            return Err(LuaError::StackOverflow);
        }
        let nparams = proto.param_count as usize;
        let varargs = if proto.is_vararg && nargs > nparams {
            self.stack.drain(base + nparams..base + nargs).collect()
        } else {
            Vec::new()
        };
        self.stack.truncate(base + nargs.min(nparams));
        self.stack.resize(extent, LuaValue::Nil);
        self.frames.push(CallFrame {
            closure,
            pc: 0,
            base,
            ret_dst,
            nresults,
            varargs,
            cells: Vec::new(),
            catch,
        });
        Ok(())
    }

    /// Replace the current frame with a call to the Lua closure at `func`.
    ///
    /// Returns `false` when the replaced frame was protected and the callee
    /// failed to start; the failure status is then already in place.
    pub(crate) fn tail_call(
        &mut self,
        closure: Rc<LuaClosure>,
        func: usize,
        nargs: usize,
    ) -> Result<bool, LuaError> {
        let Some(frame) = self.frames.pop() else {
            return Err(LuaError::msg("tail call without a caller"));
        };
        let slot = frame.base - 1;
        for i in 0..=nargs {
            self.stack[slot + i] = std::mem::take(&mut self.stack[func + i]);
        }
        let (nresults, ret_dst, catch) = (frame.nresults, frame.ret_dst, frame.catch);
        // Same depth as before, so only the slot limit can fail here.
        let result = self.push_frame(closure, slot, nargs, nresults, ret_dst, catch.clone());
        if let Err(err) = result {
            if let Some(catch) = catch {
                self.fail_protected(ret_dst, nresults, catch, err);
                return Ok(false);
            }
            return Err(err);
        }
        Ok(true)
    }

    fn call_native(
        &mut self,
        native: &NativeFunction,
        func: usize,
        nargs: usize,
        nresults: u8,
        ret_dst: usize,
    ) -> Result<Called, LuaError> {
        self.stack.truncate(func + 1 + nargs);
        let saved = std::mem::replace(
            &mut self.native,
            NativeCall {
                base: func + 1,
                nargs,
                name: Some(native.name.clone()),
            },
        );
        let result = (native.func)(self);
        self.native = saved;
        let n = match result {
            Ok(n) => n.min(self.stack.len() - (func + 1)),
            Err(err) => {
                self.request = None;
                return Err(err);
            }
        };
        match self.request.take() {
            None => {
                let first = self.stack.len() - n;
                self.move_results(first, n, ret_dst, nresults);
                Ok(Called::Native)
            }
            Some(Request::Yield) => {
                let first = self.stack.len() - n;
                let values = self.stack.split_off(first);
                self.stack.truncate(func + 1);
                self.resume_target = Some((ret_dst, nresults));
                Ok(Called::Yield(values))
            }
            Some(Request::ProtectedCall { handler }) => {
                let target = func + 1;
                let nargs = self.stack.len().saturating_sub(target + 1);
                let catch = Catch { handler };
                if target >= self.stack.len() {
                    self.stack.push(LuaValue::Nil);
                }
                match self.precall(target, nargs, nresults, ret_dst, Some(catch.clone())) {
                    Ok(called) => Ok(called),
                    Err(err) => {
                        self.fail_protected(ret_dst, nresults, catch, err);
                        Ok(Called::Native)
                    }
                }
            }
        }
    }

    /// A protected call whose callee is not a Lua closure runs as a host
    /// call, so its errors are caught right here.
    fn protected_native(
        &mut self,
        func: usize,
        nargs: usize,
        nresults: u8,
        ret_dst: usize,
        catch: Catch,
    ) -> Result<Called, LuaError> {
        match self.call_at(func, nargs) {
            Ok(n) => {
                // Results sit at `func..`, right after the status slot.
                debug_assert_eq!(func, ret_dst + 1);
                self.stack[ret_dst] = LuaValue::Boolean(true);
                self.move_results(ret_dst, n + 1, ret_dst, nresults);
                Ok(Called::Native)
            }
            Err(err) => {
                self.fail_protected(ret_dst, nresults, catch, err);
                Ok(Called::Native)
            }
        }
    }

    /// Place `false, message` for a failed protected call.
    pub(crate) fn fail_protected(&mut self, ret_dst: usize, nresults: u8, catch: Catch, err: LuaError) {
        let mut value = err.into_value();
        if let Some(handler) = catch.handler {
            value = match self.call(handler, [value]) {
                Ok(results) => results.into_iter().next().unwrap_or_default(),
                Err(err) => err.into_value(),
            };
        }
        self.stack.truncate(ret_dst);
        self.stack.push(LuaValue::Boolean(false));
        self.stack.push(value);
        self.move_results(ret_dst, 2, ret_dst, nresults);
    }

    /// Copy `n` values from `src` down to `dst`, then pad or cut them to
    /// `wanted` (`MULTI` keeps all of them and marks `top`).
    pub(crate) fn move_results(&mut self, src: usize, n: usize, dst: usize, wanted: u8) {
        if src != dst {
            for i in 0..n {
                let v = std::mem::take(&mut self.stack[src + i]);
                self.stack[dst + i] = v;
            }
        }
        if wanted == MULTI {
            self.stack.truncate(dst + n);
            self.top = dst + n;
        } else {
            let wanted = wanted as usize;
            if self.stack.len() < dst + wanted {
                self.stack.resize(dst + wanted, LuaValue::Nil);
            }
            for slot in &mut self.stack[dst + n.min(wanted)..dst + wanted] {
                *slot = LuaValue::Nil;
            }
            self.top = dst + wanted;
        }
    }

    /// Give the current frame its full register window back after a call.
    pub(crate) fn restore_extent(&mut self) {
        if let Some(frame) = self.frames.last() {
            let extent = (frame.base + frame.closure.proto.max_stack).max(self.top);
            self.stack.resize(extent, LuaValue::Nil);
        }
    }

    /// Run the dispatch loop until the frame at depth `entry` returns,
    /// unwinding errors to the nearest protected call above `entry`.
    pub(crate) fn execute(&mut self, entry: usize) -> Result<Exit, LuaError> {
        loop {
            let err = match self.dispatch(entry) {
                Ok(exit) => return Ok(exit),
                Err(err) => self.locate(err),
            };
            let catcher = self
                .frames
                .get(entry..)
                .unwrap_or_default()
                .iter()
                .rposition(|f| f.catch.is_some())
                .map(|i| i + entry);
            let Some(depth) = catcher else {
                self.frames.truncate(entry);
                return Err(err);
            };
            self.frames.truncate(depth + 1);
            let Some(frame) = self.frames.pop() else {
                return Err(err);
            };
            let catch = frame.catch.unwrap_or(Catch { handler: None });
            self.fail_protected(frame.ret_dst, frame.nresults, catch, err);
            if self.frames.len() == entry {
                return Ok(Exit::Returned);
            }
            self.restore_extent();
        }
    }

    /// Turn a VM-raised error into a string value carrying the position of
    /// the instruction being executed.
    fn locate(&self, err: LuaError) -> LuaError {
        match err {
            LuaError::Runtime(_) => err,
            LuaError::Syntax(e) => LuaError::Runtime(LuaValue::from(e.to_string())),
            other => {
                let msg = match self.where_(1) {
                    Some(pos) => format!("{pos} {other}"),
                    None => other.to_string(),
                };
                LuaError::Runtime(LuaValue::from(msg))
            }
        }
    }

    /// `chunk:line:` of the Lua frame `level` levels up (1 = innermost).
    pub(crate) fn where_(&self, level: usize) -> Option<String> {
        let frame = self.frames.len().checked_sub(level).map(|i| &self.frames[i])?;
        let proto = &frame.closure.proto;
        Some(format!("{}:{}:", proto.source, proto.line_at(frame.pc.saturating_sub(1))))
    }

    /// Host-level call of `stack[func]`. Results end up at `func..func+n`.
    pub(crate) fn call_at(&mut self, func: usize, nargs: usize) -> Result<usize, LuaError> {
        let depth = self.rt.host_depth.get();
        if depth >= self.rt.config.max_host_depth {
            return Err(LuaError::msg("C stack overflow"));
        }
        self.rt.host_depth.set(depth + 1);
        self.nny += 1;
        let result = stacker::maybe_grow(STACK_RED_ZONE, STACK_GROW_SIZE, || self.reenter(func, nargs));
        self.nny -= 1;
        self.rt.host_depth.set(depth);
        result?;
        Ok(self.top - func)
    }

    fn reenter(&mut self, func: usize, nargs: usize) -> Result<(), LuaError> {
        let entry = self.frames.len();
        match self.precall(func, nargs, MULTI, func, None)? {
            Called::Lua => match self.execute(entry)? {
                Exit::Returned => Ok(()),
                Exit::Yielded(_) => Err(yield_across_host()),
            },
            Called::Native => Ok(()),
            Called::Yield(_) => Err(yield_across_host()),
        }
    }

    /// Call `f` with `args` and collect all of its results.
    ///
    /// Runs synchronously on this thread's stack above everything in use, so
    /// natives (comparators, metamethods) can re-enter the VM safely.
    pub fn call(
        &mut self,
        f: LuaValue,
        args: impl IntoIterator<Item = LuaValue>,
    ) -> Result<Vec<LuaValue>, LuaError> {
        let func = self.stack.len();
        let saved_top = self.top;
        self.stack.push(f);
        self.stack.extend(args);
        let nargs = self.stack.len() - func - 1;
        let result = self
            .call_at(func, nargs)
            .map(|n| self.stack.drain(func..func + n).collect());
        self.stack.truncate(func);
        self.top = saved_top;
        result
    }

    /// Like [`Thread::call`], keeping only the first result.
    pub fn call1(
        &mut self,
        f: LuaValue,
        args: impl IntoIterator<Item = LuaValue>,
    ) -> Result<LuaValue, LuaError> {
        Ok(self.call(f, args)?.into_iter().next().unwrap_or_default())
    }

    /// Ask the VM to suspend the running coroutine once the current native
    /// returns; its results become the values `resume` hands back.
    pub fn request_yield(&mut self) -> Result<(), LuaError> {
        if self.is_main {
            return Err(LuaError::msg("attempt to yield from outside a coroutine"));
        }
        if self.nny > 0 {
            return Err(yield_across_host());
        }
        self.request = Some(Request::Yield);
        Ok(())
    }

    /// Ask the VM to call the first argument of the current native (with the
    /// remaining ones) in protected mode once the native returns.
    pub(crate) fn request_protected_call(&mut self, handler: Option<LuaValue>) {
        self.request = Some(Request::ProtectedCall { handler });
    }

    pub fn is_yieldable(&self) -> bool {
        !self.is_main && self.nny == 0
    }
}

fn yield_across_host() -> LuaError {
    LuaError::msg("attempt to yield across a C-call boundary")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Vm;

    #[test]
    fn move_results_pads_and_truncates() {
        let mut vm = Vm::new();
        let t = vm.main_thread();
        t.stack = (0..6).map(|i| LuaValue::Number(i as f64)).collect();
        t.move_results(3, 3, 0, 2);
        assert_eq!(t.stack[0], LuaValue::Number(3.0));
        assert_eq!(t.stack[1], LuaValue::Number(4.0));
        assert_eq!(t.top, 2);

        t.stack = (0..4).map(|i| LuaValue::Number(i as f64)).collect();
        t.move_results(3, 1, 1, 3);
        assert_eq!(t.stack[1], LuaValue::Number(3.0));
        assert_eq!(t.stack[2], LuaValue::Nil);
        assert_eq!(t.stack[3], LuaValue::Nil);

        t.stack = (0..4).map(|i| LuaValue::Number(i as f64)).collect();
        t.move_results(2, 2, 0, MULTI);
        assert_eq!(t.stack.len(), 2);
        assert_eq!(t.top, 2);
    }

    #[test]
    fn host_calls_leave_the_stack_as_found() {
        let mut vm = Vm::new();
        let f = vm.compile("local a, b = ... return b, a", "swap").unwrap();
        let t = vm.main_thread();
        let before = t.stack.len();
        let results = t.call(f, [LuaValue::Number(1.0), LuaValue::Number(2.0)]).unwrap();
        assert_eq!(results, vec![LuaValue::Number(2.0), LuaValue::Number(1.0)]);
        assert_eq!(t.stack.len(), before);
        assert!(t.frames.is_empty());
    }

    #[test]
    fn errors_are_located_at_the_failing_line() {
        let mut vm = Vm::new();
        let err = vm.exec("local x = 1\nreturn x + nil", "calc").unwrap_err();
        assert_eq!(
            err.to_string(),
            "calc:2: attempt to perform arithmetic on a nil value"
        );
    }

    #[test]
    fn main_thread_cannot_yield() {
        let mut vm = Vm::new();
        let t = vm.main_thread();
        let err = t.request_yield().unwrap_err();
        assert_eq!(err.to_string(), "attempt to yield from outside a coroutine");
        assert!(!t.is_yieldable());
    }
}
