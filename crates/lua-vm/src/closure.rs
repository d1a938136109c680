//! Closures, native functions and upvalue cells.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use lua_core::Proto;

use crate::error::LuaError;
use crate::thread::Thread;
use crate::value::LuaValue;

// ── Upvalue cells ─────────────────────────────────────────────────────────────

/// A shared, mutable upvalue cell.
///
/// Created by `NewCell` when a captured local comes into scope; the declaring
/// frame and every closure that captured it hold the same cell, so a write
/// through any of them is visible to all.
pub type Upvalue = Rc<RefCell<LuaValue>>;

pub fn new_upvalue(value: LuaValue) -> Upvalue {
    Rc::new(RefCell::new(value))
}

// ── Lua closure ───────────────────────────────────────────────────────────────

/// A runtime closure: a `Proto` paired with its captured upvalue cells.
pub struct LuaClosure {
    /// The compiled function body.
    pub proto: Rc<Proto>,
    /// Upvalue cells, one per `proto.upvalue_descs` entry.
    pub upvalues: Vec<Upvalue>,
}

impl LuaClosure {
    pub fn new(proto: Rc<Proto>, upvalues: Vec<Upvalue>) -> Self {
        Self { proto, upvalues }
    }
}

// ── Native functions ──────────────────────────────────────────────────────────

/// Signature of a host function: it reads its arguments from the thread,
/// pushes its results and returns how many it pushed.
pub type NativeFn = dyn Fn(&mut Thread) -> Result<usize, LuaError>;

/// A host function callable from Lua.
#[derive(Clone)]
pub struct NativeFunction {
    /// Name used in argument errors (`bad argument #1 to 'name'`).
    pub name: Rc<str>,
    pub func: Rc<NativeFn>,
}

impl NativeFunction {
    pub fn new(
        name: &str,
        func: impl Fn(&mut Thread) -> Result<usize, LuaError> + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            func: Rc::new(func),
        }
    }
}

/// A callable value: a compiled closure or a native function.
#[derive(Clone)]
pub enum LuaFunction {
    Lua(Rc<LuaClosure>),
    Native(NativeFunction),
}

impl LuaFunction {
    pub fn native(
        name: &str,
        func: impl Fn(&mut Thread) -> Result<usize, LuaError> + 'static,
    ) -> Self {
        LuaFunction::Native(NativeFunction::new(name, func))
    }

    pub fn is_native(&self) -> bool {
        matches!(self, LuaFunction::Native(_))
    }

    pub(crate) fn address(&self) -> usize {
        match self {
            LuaFunction::Lua(c) => Rc::as_ptr(c) as *const u8 as usize,
            LuaFunction::Native(n) => Rc::as_ptr(&n.func) as *const u8 as usize,
        }
    }
}

// Functions are equal only if they are the exact same object.
impl PartialEq for LuaFunction {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (LuaFunction::Lua(a), LuaFunction::Lua(b)) => Rc::ptr_eq(a, b),
            (LuaFunction::Native(a), LuaFunction::Native(b)) => {
                Rc::as_ptr(&a.func) as *const u8 == Rc::as_ptr(&b.func) as *const u8
            }
            _ => false,
        }
    }
}

impl fmt::Debug for LuaFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LuaFunction::Lua(c) => write!(f, "function <{}:{}>", c.proto.source, c.proto.line_defined),
            LuaFunction::Native(n) => write!(f, "builtin '{}'", n.name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_cells_see_each_other() {
        let cell = new_upvalue(LuaValue::Number(0.0));
        let proto = Rc::new(Proto::new("test"));
        let a = LuaClosure::new(proto.clone(), vec![cell.clone()]);
        let b = LuaClosure::new(proto, vec![cell]);
        *a.upvalues[0].borrow_mut() = LuaValue::Number(2.0);
        assert_eq!(*b.upvalues[0].borrow(), LuaValue::Number(2.0));
    }

    #[test]
    fn function_identity() {
        let f = LuaFunction::native("f", |_| Ok(0));
        let g = LuaFunction::native("f", |_| Ok(0));
        assert_eq!(f, f.clone());
        assert_ne!(f, g);
        assert!(f.is_native());
    }
}
