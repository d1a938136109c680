use std::rc::Rc;

use lua_core::Proto;

use crate::closure::{LuaClosure, LuaFunction, Upvalue};
use crate::config::VmConfig;
use crate::coroutine::LuaThread;
use crate::error::LuaError;
use crate::table::LuaTable;
use crate::thread::{Event, Runtime, Thread};
use crate::value::LuaValue;

// ── VM ────────────────────────────────────────────────────────────────────────

/// One interpreter instance: a globals table, the main thread and the
/// installed standard library.
///
/// ```ignore
/// let mut vm = Vm::new();
/// let results = vm.exec("return 1 + 2", "example")?;
/// ```
pub struct Vm {
    rt: Rc<Runtime>,
    main: Box<Thread>,
    main_handle: LuaThread,
}

impl Vm {
    pub fn new() -> Self {
        Self::with_config(VmConfig::default())
    }

    pub fn with_config(config: VmConfig) -> Self {
        let libs = config.libs;
        let rt = Rc::new(Runtime::new(config));
        let main_handle = LuaThread::main();
        let main = Box::new(Thread::new(rt.clone(), Rc::downgrade(&main_handle.0), true));
        let vm = Vm {
            rt,
            main,
            main_handle,
        };
        crate::stdlib::install(&vm.rt, &libs);
        vm
    }

    pub fn config(&self) -> &VmConfig {
        &self.rt.config
    }

    pub fn globals(&self) -> LuaTable {
        self.rt.globals.clone()
    }

    /// Compile `source` into a function value closing over the globals.
    pub fn compile(&self, source: &str, chunk_name: &str) -> Result<LuaValue, LuaError> {
        let proto = lua_compiler::compile(source, chunk_name)?;
        Ok(instantiate(proto, self.rt.env.clone()))
    }

    /// Call `f` on the main thread.
    pub fn execute(&mut self, f: &LuaValue, args: &[LuaValue]) -> Result<Vec<LuaValue>, LuaError> {
        let result = self.main.call(f.clone(), args.iter().cloned());
        if let Err(err) = &result {
            tracing::debug!(error = %err, "uncaught error");
        }
        result
    }

    /// Compile and run `source`, returning the chunk's results.
    pub fn exec(&mut self, source: &str, chunk_name: &str) -> Result<Vec<LuaValue>, LuaError> {
        let f = self.compile(source, chunk_name)?;
        self.execute(&f, &[])
    }

    /// Install a native function as a global.
    pub fn register(
        &mut self,
        name: &str,
        func: impl Fn(&mut Thread) -> Result<usize, LuaError> + 'static,
    ) {
        self.rt
            .globals
            .set_field(name, LuaValue::Function(LuaFunction::native(name, func)));
    }

    pub fn set_global(&mut self, name: &str, value: impl Into<LuaValue>) {
        self.rt.globals.set_field(name, value);
    }

    pub fn get_global(&self, name: &str) -> LuaValue {
        self.rt.globals.get_field(name)
    }

    /// Render an uncaught error for display, honouring `__tostring` on
    /// error objects.
    pub fn error_to_string(&mut self, err: &LuaError) -> String {
        if let LuaError::Runtime(value) = err {
            if !self.main.metamethod(value, Event::ToString).is_nil() {
                if let Ok(LuaValue::LuaString(s)) = self.main.tostring(value) {
                    return s.to_string();
                }
            }
        }
        err.to_string()
    }

    /// The main thread, for calling into Lua from host code.
    pub fn main_thread(&mut self) -> &mut Thread {
        &mut self.main
    }

    pub fn main_handle(&self) -> LuaThread {
        self.main_handle.clone()
    }

    /// A new suspended coroutine running `body`.
    pub fn create_thread(&self, body: LuaValue) -> LuaThread {
        LuaThread::new(self.rt.clone(), body)
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Vm {
    /// The globals reach themselves through `_G`, through every closure's
    /// `_ENV` cell and through each coroutine's runtime handle. Emptying
    /// them releases those cycles.
    fn drop(&mut self) {
        let env = self.rt.env.replace(LuaValue::Nil);
        let string_meta = self.rt.string_meta.borrow_mut().take();
        self.rt.globals.clear();
        drop((env, string_meta));
    }
}

/// Wrap a main-chunk prototype in a closure whose `_ENV` is `env`.
pub(crate) fn instantiate(proto: Rc<Proto>, env: Upvalue) -> LuaValue {
    let upvalues = proto.upvalue_descs.iter().map(|_| env.clone()).collect();
    LuaValue::Function(LuaFunction::Lua(Rc::new(LuaClosure::new(proto, upvalues))))
}

// ── Tests ─────────────────────────────────────────────────────────────────────
