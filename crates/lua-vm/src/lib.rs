//! `lua-vm`: register-based virtual machine that executes compiled [`lua_core::Proto`]s.
//!
//! - [`Vm`]: interpreter instance and embedding entry point
//! - [`Thread`]: a register stack plus call frames; natives receive it as
//!   their argument/result interface
//! - [`LuaThread`]: a coroutine handle (stackful: yields from any Lua depth)
//! - [`LuaValue`], [`LuaTable`], [`LuaFunction`]: the shared data model
//! - the standard library, selected through [`StdLib`]

mod api;
mod closure;
mod config;
mod coroutine;
mod error;
mod interp;
mod ops;
mod stdlib;
mod table;
mod thread;
mod value;
mod vm;

pub use closure::{new_upvalue, LuaClosure, LuaFunction, NativeFn, NativeFunction, Upvalue};
pub use config::{StdLib, VmConfig};
pub use coroutine::{CoStatus, LuaThread};
pub use error::LuaError;
pub use table::LuaTable;
pub use thread::Thread;
pub use value::{LuaUserdata, LuaValue};
pub use vm::Vm;
