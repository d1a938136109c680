//! The standard library, installed per [`StdLib`] selection.

mod base;
mod coroutine;
mod math;
mod os;
mod string;
mod table;

use crate::closure::LuaFunction;
use crate::config::StdLib;
use crate::error::LuaError;
use crate::table::LuaTable;
use crate::thread::{Runtime, Thread};
use crate::value::LuaValue;

type Native = fn(&mut Thread) -> Result<usize, LuaError>;

/// Populate the runtime's globals with the selected modules.
pub(crate) fn install(rt: &Runtime, libs: &StdLib) {
    let g = &rt.globals;
    if libs.base {
        base::open(g);
    }
    if libs.coroutine {
        g.set_field("coroutine", coroutine::module());
    }
    if libs.math {
        g.set_field("math", math::module());
    }
    if libs.string {
        let string = string::module();
        let meta = LuaTable::new();
        meta.set_field("__index", string.clone());
        *rt.string_meta.borrow_mut() = Some(meta);
        g.set_field("string", string);
    }
    if libs.table {
        g.set_field("table", table::module());
    }
    if libs.os {
        g.set_field("os", os::module(libs.include_unsafe));
    }
}

fn set_functions(t: &LuaTable, functions: &[(&str, Native)]) {
    for &(name, f) in functions {
        t.set_field(name, LuaValue::Function(LuaFunction::native(name, f)));
    }
}

fn library(functions: &[(&str, Native)]) -> LuaTable {
    let t = LuaTable::new();
    set_functions(&t, functions);
    t
}
