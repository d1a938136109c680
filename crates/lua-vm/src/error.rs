use std::rc::Rc;

use lua_core::SyntaxError;
use thiserror::Error;

use crate::value::LuaValue;

/// Every failure the runtime can produce.
///
/// `Runtime` carries an arbitrary Lua value: that is what `error(v)` raises and
/// what `pcall` hands back. The other variants are raised by the VM and by
/// native functions; they become string values (with a source position when a
/// Lua frame is executing) as soon as they start unwinding.
#[derive(Debug, Clone, Error)]
pub enum LuaError {
    #[error(transparent)]
    Syntax(#[from] SyntaxError),

    #[error("{}", describe(.0))]
    Runtime(LuaValue),

    #[error("{0}")]
    Message(String),

    #[error("bad argument #{arg} to '{func}' ({})", missing(.expected))]
    WrongNumberOfArguments {
        func: Rc<str>,
        arg: usize,
        expected: &'static str,
    },

    #[error("bad argument #{arg} to '{func}' (number has no integer representation)")]
    NoIntegerRepresentation { func: Rc<str>, arg: usize },

    #[error("bad argument #{arg} to '{func}' ({expected} expected, got {got})")]
    BadArgument {
        func: Rc<str>,
        arg: usize,
        expected: &'static str,
        got: &'static str,
    },

    #[error("bad argument #{arg} to '{func}' ({msg})")]
    ArgError {
        func: Rc<str>,
        arg: usize,
        msg: String,
    },

    #[error("stack overflow")]
    StackOverflow,
}

impl LuaError {
    /// Shorthand for a VM-raised message.
    pub fn msg(text: impl Into<String>) -> Self {
        LuaError::Message(text.into())
    }

    /// The Lua value a protected call reports for this error.
    pub fn into_value(self) -> LuaValue {
        match self {
            LuaError::Runtime(value) => value,
            other => LuaValue::from(other.to_string()),
        }
    }
}

fn describe(value: &LuaValue) -> String {
    match value {
        LuaValue::LuaString(s) => s.to_string(),
        LuaValue::Number(_) => value.to_string(),
        other => format!("(error object is a {} value)", other.type_name()),
    }
}

fn missing(expected: &str) -> String {
    if expected == "value" {
        "value expected".to_string()
    } else {
        format!("{expected} expected, got no value")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn argument_errors_read_like_lua() {
        let err = LuaError::BadArgument {
            func: "rep".into(),
            arg: 1,
            expected: "string",
            got: "table",
        };
        assert_eq!(err.to_string(), "bad argument #1 to 'rep' (string expected, got table)");

        let err = LuaError::WrongNumberOfArguments {
            func: "insert".into(),
            arg: 2,
            expected: "value",
        };
        assert_eq!(err.to_string(), "bad argument #2 to 'insert' (value expected)");

        let err = LuaError::WrongNumberOfArguments {
            func: "floor".into(),
            arg: 1,
            expected: "number",
        };
        assert_eq!(err.to_string(), "bad argument #1 to 'floor' (number expected, got no value)");
    }

    #[test]
    fn runtime_values_describe_themselves() {
        assert_eq!(LuaError::Runtime(LuaValue::from("boom")).to_string(), "boom");
        assert_eq!(LuaError::Runtime(LuaValue::Number(3.0)).to_string(), "3");
        assert_eq!(
            LuaError::Runtime(LuaValue::Boolean(true)).to_string(),
            "(error object is a boolean value)"
        );
    }

    #[test]
    fn non_runtime_errors_become_strings() {
        let value = LuaError::StackOverflow.into_value();
        assert_eq!(value, LuaValue::from("stack overflow"));
    }
}
