//! `lua-core`: foundational types shared across the interpreter workspace.
//!
//! This crate defines:
//! - Bytecode [`OpCode`] definitions and the operand conventions around them
//! - Compiled function prototypes ([`Proto`], [`Constant`], [`UpvalueDesc`])
//! - [`SyntaxError`], the front end's error type
//! - Number parsing and formatting shared by the lexer and the runtime

pub mod error;
pub mod number;
pub mod opcode;
pub mod proto;

pub use error::SyntaxError;
pub use opcode::{OpCode, FIELDS_PER_FLUSH, MULTI};
pub use proto::{Constant, Proto, UpvalueDesc, UpvalueSource};
