use std::any::Any;
use std::cell::{Ref, RefCell};
use std::fmt;
use std::rc::Rc;

use lua_core::number::{format_number, parse_number};

use crate::closure::LuaFunction;
use crate::coroutine::LuaThread;
use crate::table::LuaTable;

/// All Lua value types, mirroring the Lua 5.4 type system.
///
/// Every number is an `f64`; strings, tables, functions, threads and userdata
/// are shared handles, so cloning a value never copies the object behind it.
#[derive(Clone, Default)]
pub enum LuaValue {
    #[default]
    Nil,
    Boolean(bool),
    Number(f64),
    LuaString(Rc<str>),
    Table(LuaTable),
    Function(LuaFunction),
    Thread(LuaThread),
    Userdata(LuaUserdata),
}

impl LuaValue {
    /// Returns the Lua type name string as per the reference manual.
    pub fn type_name(&self) -> &'static str {
        match self {
            LuaValue::Nil => "nil",
            LuaValue::Boolean(_) => "boolean",
            LuaValue::Number(_) => "number",
            LuaValue::LuaString(_) => "string",
            LuaValue::Table(_) => "table",
            LuaValue::Function(_) => "function",
            LuaValue::Thread(_) => "thread",
            LuaValue::Userdata(_) => "userdata",
        }
    }

    /// Returns `true` if the value is truthy in Lua's sense
    /// (everything except `nil` and `false` is truthy).
    pub fn is_truthy(&self) -> bool {
        !matches!(self, LuaValue::Nil | LuaValue::Boolean(false))
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, LuaValue::Nil)
    }

    /// Create a new empty table value.
    pub fn new_table() -> Self {
        LuaValue::Table(LuaTable::new())
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            LuaValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            LuaValue::LuaString(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_table(&self) -> Option<&LuaTable> {
        match self {
            LuaValue::Table(t) => Some(t),
            _ => None,
        }
    }

    /// Numeric value with string coercion, as arithmetic sees it.
    pub fn to_number(&self) -> Option<f64> {
        match self {
            LuaValue::Number(n) => Some(*n),
            LuaValue::LuaString(s) => parse_number(s),
            _ => None,
        }
    }

    /// Identity of heap-allocated values; `None` for nil, booleans, numbers
    /// and strings.
    pub(crate) fn address(&self) -> Option<usize> {
        match self {
            LuaValue::Table(t) => Some(t.address()),
            LuaValue::Function(f) => Some(f.address()),
            LuaValue::Thread(t) => Some(t.address()),
            LuaValue::Userdata(u) => Some(Rc::as_ptr(&u.0) as *const u8 as usize),
            _ => None,
        }
    }
}

// Raw equality: no coercion across types, reference identity for objects.
impl PartialEq for LuaValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (LuaValue::Nil, LuaValue::Nil) => true,
            (LuaValue::Boolean(a), LuaValue::Boolean(b)) => a == b,
            (LuaValue::Number(a), LuaValue::Number(b)) => a == b,
            (LuaValue::LuaString(a), LuaValue::LuaString(b)) => a == b,
            (LuaValue::Table(a), LuaValue::Table(b)) => a == b,
            (LuaValue::Function(a), LuaValue::Function(b)) => a == b,
            (LuaValue::Thread(a), LuaValue::Thread(b)) => a == b,
            (LuaValue::Userdata(a), LuaValue::Userdata(b)) => Rc::ptr_eq(&a.0, &b.0),
            _ => false,
        }
    }
}

impl fmt::Debug for LuaValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LuaValue::Nil => write!(f, "LuaValue::Nil"),
            LuaValue::Boolean(b) => write!(f, "LuaValue::Boolean({b})"),
            LuaValue::Number(n) => write!(f, "LuaValue::Number({n})"),
            LuaValue::LuaString(s) => write!(f, "LuaValue::LuaString({s:?})"),
            other => write!(f, "LuaValue::{}({other})", other.type_name()),
        }
    }
}

/// Plain `tostring` rendering, without consulting `__tostring` or `__name`.
impl fmt::Display for LuaValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LuaValue::Nil => f.write_str("nil"),
            LuaValue::Boolean(b) => write!(f, "{b}"),
            LuaValue::Number(n) => f.write_str(&format_number(*n)),
            LuaValue::LuaString(s) => f.write_str(s),
            other => {
                let addr = other.address().unwrap_or_default();
                write!(f, "{}: {addr:#014x}", other.type_name())
            }
        }
    }
}

impl From<bool> for LuaValue {
    fn from(b: bool) -> Self {
        LuaValue::Boolean(b)
    }
}

impl From<f64> for LuaValue {
    fn from(n: f64) -> Self {
        LuaValue::Number(n)
    }
}

impl From<i64> for LuaValue {
    fn from(n: i64) -> Self {
        LuaValue::Number(n as f64)
    }
}

impl From<usize> for LuaValue {
    fn from(n: usize) -> Self {
        LuaValue::Number(n as f64)
    }
}

impl From<&str> for LuaValue {
    fn from(s: &str) -> Self {
        LuaValue::LuaString(s.into())
    }
}

impl From<String> for LuaValue {
    fn from(s: String) -> Self {
        LuaValue::LuaString(s.into())
    }
}

impl From<Rc<str>> for LuaValue {
    fn from(s: Rc<str>) -> Self {
        LuaValue::LuaString(s)
    }
}

impl From<LuaTable> for LuaValue {
    fn from(t: LuaTable) -> Self {
        LuaValue::Table(t)
    }
}

impl From<LuaFunction> for LuaValue {
    fn from(f: LuaFunction) -> Self {
        LuaValue::Function(f)
    }
}

impl From<LuaThread> for LuaValue {
    fn from(t: LuaThread) -> Self {
        LuaValue::Thread(t)
    }
}

impl From<LuaUserdata> for LuaValue {
    fn from(u: LuaUserdata) -> Self {
        LuaValue::Userdata(u)
    }
}

impl<T: Into<LuaValue>> From<Option<T>> for LuaValue {
    fn from(v: Option<T>) -> Self {
        v.map_or(LuaValue::Nil, Into::into)
    }
}

// ── Userdata ─────────────────────────────────────────────────────────────────

/// An opaque host object. Lua code can only pass it around, compare it and
/// reach it through its metatable.
#[derive(Clone)]
pub struct LuaUserdata(Rc<UserdataBox>);

struct UserdataBox {
    data: RefCell<Box<dyn Any>>,
    metatable: RefCell<Option<LuaTable>>,
}

impl LuaUserdata {
    pub fn new<T: Any>(data: T) -> Self {
        Self(Rc::new(UserdataBox {
            data: RefCell::new(Box::new(data)),
            metatable: RefCell::new(None),
        }))
    }

    pub fn with_metatable<T: Any>(data: T, metatable: LuaTable) -> Self {
        let ud = Self::new(data);
        ud.set_metatable(Some(metatable));
        ud
    }

    /// Borrow the payload if it has type `T`.
    pub fn borrow<T: Any>(&self) -> Option<Ref<'_, T>> {
        Ref::filter_map(self.0.data.borrow(), |b| b.downcast_ref::<T>()).ok()
    }

    /// Mutate the payload if it has type `T`.
    pub fn with_mut<T: Any, R>(&self, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        let mut data = self.0.data.borrow_mut();
        data.downcast_mut::<T>().map(f)
    }

    pub fn metatable(&self) -> Option<LuaTable> {
        self.0.metatable.borrow().clone()
    }

    pub fn set_metatable(&self, metatable: Option<LuaTable>) {
        *self.0.metatable.borrow_mut() = metatable;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nil_and_false_are_falsy() {
        assert!(!LuaValue::Nil.is_truthy());
        assert!(!LuaValue::Boolean(false).is_truthy());
        // In Lua, 0 and "" are truthy!
        assert!(LuaValue::Number(0.0).is_truthy());
        assert!(LuaValue::from("").is_truthy());
    }

    #[test]
    fn type_names() {
        assert_eq!(LuaValue::Nil.type_name(), "nil");
        assert_eq!(LuaValue::Boolean(true).type_name(), "boolean");
        assert_eq!(LuaValue::Number(1.5).type_name(), "number");
        assert_eq!(LuaValue::from("hi").type_name(), "string");
        assert_eq!(LuaValue::new_table().type_name(), "table");
        assert_eq!(LuaValue::from(LuaUserdata::new(7u8)).type_name(), "userdata");
    }

    #[test]
    fn equality_never_coerces() {
        assert_ne!(LuaValue::from("1"), LuaValue::Number(1.0));
        assert_eq!(LuaValue::from("a"), LuaValue::from("a"));
        assert_ne!(LuaValue::Number(f64::NAN), LuaValue::Number(f64::NAN));
    }

    #[test]
    fn table_reference_equality() {
        let t1 = LuaValue::new_table();
        let t2 = LuaValue::new_table();
        assert_eq!(t1, t1.clone());
        assert_ne!(t1, t2);
    }

    #[test]
    fn string_coercion() {
        assert_eq!(LuaValue::from(" 0x10 ").to_number(), Some(16.0));
        assert_eq!(LuaValue::from("1e2").to_number(), Some(100.0));
        assert_eq!(LuaValue::from("ten").to_number(), None);
        assert_eq!(LuaValue::Boolean(true).to_number(), None);
    }

    #[test]
    fn display_formats_numbers_and_addresses() {
        assert_eq!(LuaValue::Number(10.0).to_string(), "10");
        assert_eq!(LuaValue::Number(0.5).to_string(), "0.5");
        assert!(LuaValue::new_table().to_string().starts_with("table: 0x"));
    }

    #[test]
    fn userdata_payload_round_trip() {
        let ud = LuaUserdata::new(41i32);
        ud.with_mut(|n: &mut i32| *n += 1);
        assert_eq!(*ud.borrow::<i32>().unwrap(), 42);
        assert!(ud.borrow::<String>().is_none());
    }
}
