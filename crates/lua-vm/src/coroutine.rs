//! Stackful coroutines.
//!
//! Each coroutine owns a whole [`Thread`]: its register stack and call-frame
//! stack. Yielding stops the dispatch loop and leaves those stacks as they
//! are; resuming moves the resume arguments into place and re-enters the
//! loop at the saved frame.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use lua_core::MULTI;

use crate::error::LuaError;
use crate::thread::{Called, Exit, Runtime, Thread, STACK_GROW_SIZE, STACK_RED_ZONE};
use crate::value::LuaValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoStatus {
    /// Created but not started, or stopped at a yield.
    Suspended,
    Running,
    /// Resumed another coroutine and waits for it.
    Normal,
    Dead,
}

impl CoStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CoStatus::Suspended => "suspended",
            CoStatus::Running => "running",
            CoStatus::Normal => "normal",
            CoStatus::Dead => "dead",
        }
    }
}

pub(crate) struct Coroutine {
    pub status: CoStatus,
    /// The execution state; taken out while the coroutine runs. The main
    /// thread's state is owned by the `Vm` instead.
    pub exec: Option<Box<Thread>>,
    pub started: bool,
    pub is_main: bool,
    /// Error value the coroutine died with.
    pub failure: Option<LuaValue>,
}

/// Handle to a coroutine (or the main thread), shared by reference.
#[derive(Clone)]
pub struct LuaThread(pub(crate) Rc<RefCell<Coroutine>>);

impl LuaThread {
    /// A suspended coroutine that will run `body` on its first resume.
    pub(crate) fn new(rt: Rc<Runtime>, body: LuaValue) -> Self {
        let inner = Rc::new_cyclic(|weak| {
            let mut exec = Thread::new(rt, weak.clone(), false);
            exec.stack.push(body);
            RefCell::new(Coroutine {
                status: CoStatus::Suspended,
                exec: Some(Box::new(exec)),
                started: false,
                is_main: false,
                failure: None,
            })
        });
        LuaThread(inner)
    }

    /// The handle of a main thread, whose state lives outside the handle.
    pub(crate) fn main() -> Self {
        LuaThread(Rc::new(RefCell::new(Coroutine {
            status: CoStatus::Running,
            exec: None,
            started: true,
            is_main: true,
            failure: None,
        })))
    }

    pub fn status(&self) -> CoStatus {
        self.0.borrow().status
    }

    pub fn is_main(&self) -> bool {
        self.0.borrow().is_main
    }

    pub(crate) fn address(&self) -> usize {
        Rc::as_ptr(&self.0) as *const u8 as usize
    }

    /// Run the coroutine until it yields, returns or fails.
    ///
    /// Yielded or returned values come back as `Ok`; a failure (including
    /// resuming a coroutine that cannot be resumed) as `Err` carrying the
    /// error value.
    pub fn resume(&self, caller: &mut Thread, args: Vec<LuaValue>) -> Result<Vec<LuaValue>, LuaError> {
        let mut exec = {
            let mut co = self.0.borrow_mut();
            match co.status {
                CoStatus::Suspended => {}
                CoStatus::Dead => return Err(LuaError::msg("cannot resume dead coroutine")),
                _ => return Err(LuaError::msg("cannot resume non-suspended coroutine")),
            }
            let depth = caller.rt.host_depth.get();
            if depth >= caller.rt.config.max_host_depth {
                return Err(LuaError::msg("C stack overflow"));
            }
            let Some(exec) = co.exec.take() else {
                return Err(LuaError::msg("cannot resume non-suspended coroutine"));
            };
            co.status = CoStatus::Running;
            exec
        };
        let caller_handle = caller.handle.upgrade();
        if let Some(h) = &caller_handle {
            h.borrow_mut().status = CoStatus::Normal;
        }

        let started = std::mem::replace(&mut self.0.borrow_mut().started, true);
        tracing::trace!(coroutine = format_args!("{:#x}", self.address()), started, "resume");

        let depth = caller.rt.host_depth.get();
        caller.rt.host_depth.set(depth + 1);
        let outcome = stacker::maybe_grow(STACK_RED_ZONE, STACK_GROW_SIZE, || {
            if started {
                continue_after_yield(&mut exec, args)
            } else {
                start(&mut exec, args)
            }
        });
        caller.rt.host_depth.set(depth);

        if let Some(h) = &caller_handle {
            h.borrow_mut().status = CoStatus::Running;
        }
        let mut co = self.0.borrow_mut();
        let result = match outcome {
            Ok(Exit::Yielded(values)) => {
                tracing::trace!(coroutine = format_args!("{:#x}", self.address()), n = values.len(), "yield");
                co.status = CoStatus::Suspended;
                Ok(values)
            }
            Ok(Exit::Returned) => {
                tracing::trace!(coroutine = format_args!("{:#x}", self.address()), "return");
                let top = exec.top.min(exec.stack.len());
                let values = exec.stack.drain(..top).collect();
                exec.stack.clear();
                co.status = CoStatus::Dead;
                Ok(values)
            }
            Err(err) => {
                let value = err.into_value();
                tracing::trace!(coroutine = format_args!("{:#x}", self.address()), error = %value, "died");
                exec.stack.clear();
                exec.frames.clear();
                co.status = CoStatus::Dead;
                co.failure = Some(value.clone());
                Err(LuaError::Runtime(value))
            }
        };
        co.exec = Some(exec);
        result
    }

    /// `coroutine.close`: kill a suspended or dead coroutine.
    ///
    /// Returns the error value the coroutine died with, if any.
    pub fn close(&self) -> Result<Option<LuaValue>, LuaError> {
        let mut co = self.0.borrow_mut();
        match co.status {
            CoStatus::Running => Err(LuaError::msg("cannot close a running coroutine")),
            CoStatus::Normal => Err(LuaError::msg("cannot close a normal coroutine")),
            CoStatus::Suspended | CoStatus::Dead => {
                co.status = CoStatus::Dead;
                if let Some(exec) = co.exec.as_mut() {
                    exec.frames.clear();
                    exec.stack.clear();
                }
                Ok(co.failure.take())
            }
        }
    }
}

fn start(exec: &mut Thread, args: Vec<LuaValue>) -> Result<Exit, LuaError> {
    let nargs = args.len();
    exec.stack.truncate(1);
    exec.stack.extend(args);
    match exec.precall(0, nargs, MULTI, 0, None)? {
        Called::Lua => exec.execute(0),
        Called::Native => Ok(Exit::Returned),
        Called::Yield(values) => Ok(Exit::Yielded(values)),
    }
}

fn continue_after_yield(exec: &mut Thread, args: Vec<LuaValue>) -> Result<Exit, LuaError> {
    let (dst, wanted) = exec.resume_target.take().unwrap_or((0, MULTI));
    let n = args.len();
    exec.stack.truncate(dst);
    exec.stack.extend(args);
    exec.move_results(dst, n, dst, wanted);
    if exec.frames.is_empty() {
        return Ok(Exit::Returned);
    }
    exec.restore_extent();
    exec.execute(0)
}

impl PartialEq for LuaThread {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for LuaThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "thread({:#x}, {})", self.address(), self.status().as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Vm;

    #[test]
    fn resume_runs_until_yield_then_to_completion() {
        let mut vm = Vm::new();
        let body = vm
            .compile("local a = ... local b = coroutine.yield(a + 1) return b * 2", "co")
            .unwrap();
        let co = vm.create_thread(body);
        assert_eq!(co.status(), CoStatus::Suspended);

        let first = co.resume(vm.main_thread(), vec![LuaValue::Number(1.0)]).unwrap();
        assert_eq!(first, vec![LuaValue::Number(2.0)]);
        assert_eq!(co.status(), CoStatus::Suspended);

        let second = co.resume(vm.main_thread(), vec![LuaValue::Number(5.0)]).unwrap();
        assert_eq!(second, vec![LuaValue::Number(10.0)]);
        assert_eq!(co.status(), CoStatus::Dead);

        let err = co.resume(vm.main_thread(), vec![]).unwrap_err();
        assert_eq!(err.to_string(), "cannot resume dead coroutine");
    }

    #[test]
    fn failure_kills_the_coroutine() {
        let mut vm = Vm::new();
        let body = vm.compile("error('boom', 0)", "co").unwrap();
        let co = vm.create_thread(body);
        let err = co.resume(vm.main_thread(), vec![]).unwrap_err();
        assert_eq!(err.to_string(), "boom");
        assert_eq!(co.status(), CoStatus::Dead);
        assert_eq!(co.close().unwrap(), Some(LuaValue::from("boom")));
    }

    #[test]
    fn native_body_yields() {
        let mut vm = Vm::new();
        let yield_fn = vm.get_global("coroutine").as_table().unwrap().get_field("yield");
        let co = vm.create_thread(yield_fn);
        let first = co.resume(vm.main_thread(), vec![LuaValue::from("x")]).unwrap();
        assert_eq!(first, vec![LuaValue::from("x")]);
        let last = co.resume(vm.main_thread(), vec![LuaValue::from("y")]).unwrap();
        assert_eq!(last, vec![LuaValue::from("y")]);
        assert_eq!(co.status(), CoStatus::Dead);
    }

    #[test]
    fn main_handle_is_running() {
        let vm = Vm::new();
        let main = vm.main_handle();
        assert!(main.is_main());
        assert_eq!(main.status(), CoStatus::Running);
        assert!(main.close().is_err());
    }
}
