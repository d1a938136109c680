//! The native-function protocol: positional argument accessors and result
//! publishing on the calling [`Thread`].
//!
//! Arguments are 1-based. Results are pushed onto the stack and the native
//! returns how many it pushed:
//!
//! ```ignore
//! vm.register("add", |t: &mut Thread| {
//!     let sum = t.number(1)? + t.number(2)?;
//!     Ok(t.ret([sum]))
//! });
//! ```

use std::rc::Rc;

use lua_core::number::{format_number, to_integer};

use crate::coroutine::LuaThread;
use crate::error::LuaError;
use crate::table::LuaTable;
use crate::thread::Thread;
use crate::value::LuaValue;

impl Thread {
    // ── Arguments ─────────────────────────────────────────────────────────────

    /// Number of arguments passed to the running native.
    pub fn count(&self) -> usize {
        self.native.nargs
    }

    /// Argument `i` (1-based), nil when absent.
    pub fn arg(&self, i: usize) -> LuaValue {
        if i == 0 || i > self.native.nargs {
            return LuaValue::Nil;
        }
        self.stack.get(self.native.base + i - 1).cloned().unwrap_or_default()
    }

    pub fn args(&self) -> Vec<LuaValue> {
        self.args_from(1)
    }

    /// Arguments `i..=count()`.
    pub fn args_from(&self, i: usize) -> Vec<LuaValue> {
        (i.max(1)..=self.native.nargs).map(|k| self.arg(k)).collect()
    }

    /// Name of the running native, for argument errors.
    pub fn func_name(&self) -> Rc<str> {
        self.native.name.clone().unwrap_or_else(|| "?".into())
    }

    /// Drop argument `i`, shifting the later ones down.
    pub(crate) fn remove_arg(&mut self, i: usize) {
        if i == 0 || i > self.native.nargs {
            return;
        }
        let at = self.native.base + i - 1;
        if at < self.stack.len() {
            self.stack.remove(at);
            self.native.nargs -= 1;
        }
    }

    pub fn arg_error(&self, i: usize, msg: impl Into<String>) -> LuaError {
        LuaError::ArgError {
            func: self.func_name(),
            arg: i,
            msg: msg.into(),
        }
    }

    pub(crate) fn type_error(&self, i: usize, expected: &'static str) -> LuaError {
        if i > self.native.nargs {
            LuaError::WrongNumberOfArguments {
                func: self.func_name(),
                arg: i,
                expected,
            }
        } else {
            LuaError::BadArgument {
                func: self.func_name(),
                arg: i,
                expected,
                got: self.arg(i).type_name(),
            }
        }
    }

    /// Any value, but the argument must be present.
    pub fn check_any(&self, i: usize) -> Result<LuaValue, LuaError> {
        if i > self.native.nargs {
            return Err(self.type_error(i, "value"));
        }
        Ok(self.arg(i))
    }

    /// A number, coercing numeric strings.
    pub fn number(&self, i: usize) -> Result<f64, LuaError> {
        self.arg(i).to_number().ok_or_else(|| self.type_error(i, "number"))
    }

    /// A number with an exact integer value.
    pub fn integer(&self, i: usize) -> Result<i64, LuaError> {
        let n = self.number(i)?;
        to_integer(n).ok_or_else(|| LuaError::NoIntegerRepresentation {
            func: self.func_name(),
            arg: i,
        })
    }

    /// A string; numbers are converted.
    pub fn string(&self, i: usize) -> Result<Rc<str>, LuaError> {
        match self.arg(i) {
            LuaValue::LuaString(s) => Ok(s),
            LuaValue::Number(n) => Ok(format_number(n).into()),
            _ => Err(self.type_error(i, "string")),
        }
    }

    pub fn table(&self, i: usize) -> Result<LuaTable, LuaError> {
        match self.arg(i) {
            LuaValue::Table(t) => Ok(t),
            _ => Err(self.type_error(i, "table")),
        }
    }

    pub fn function(&self, i: usize) -> Result<LuaValue, LuaError> {
        match self.arg(i) {
            f @ LuaValue::Function(_) => Ok(f),
            _ => Err(self.type_error(i, "function")),
        }
    }

    pub fn thread(&self, i: usize) -> Result<LuaThread, LuaError> {
        match self.arg(i) {
            LuaValue::Thread(co) => Ok(co),
            _ => Err(self.type_error(i, "thread")),
        }
    }

    pub fn truthy(&self, i: usize) -> bool {
        self.arg(i).is_truthy()
    }

    pub fn opt_number(&self, i: usize, default: f64) -> Result<f64, LuaError> {
        if self.arg(i).is_nil() {
            Ok(default)
        } else {
            self.number(i)
        }
    }

    pub fn opt_integer(&self, i: usize, default: i64) -> Result<i64, LuaError> {
        if self.arg(i).is_nil() {
            Ok(default)
        } else {
            self.integer(i)
        }
    }

    pub fn opt_string(&self, i: usize) -> Result<Option<Rc<str>>, LuaError> {
        if self.arg(i).is_nil() {
            Ok(None)
        } else {
            self.string(i).map(Some)
        }
    }

    // ── Results ───────────────────────────────────────────────────────────────

    pub fn push(&mut self, value: impl Into<LuaValue>) {
        self.stack.push(value.into());
    }

    /// Push every value and return how many were pushed.
    pub fn ret<V: Into<LuaValue>>(&mut self, values: impl IntoIterator<Item = V>) -> usize {
        let before = self.stack.len();
        self.stack.extend(values.into_iter().map(Into::into));
        self.stack.len() - before
    }

    // ── Environment ───────────────────────────────────────────────────────────

    pub fn globals(&self) -> LuaTable {
        self.rt.globals.clone()
    }

    /// Handle of the coroutine this thread belongs to.
    pub fn current(&self) -> Option<LuaThread> {
        self.handle.upgrade().map(LuaThread)
    }
}
