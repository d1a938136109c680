//! `lua-parser`: builds an AST from the lazy token stream of `lua-lexer`,
//! resolving which locals are captured by nested functions on the way.

pub mod ast;
pub mod parser;

pub use ast::{Block, Program};
pub use parser::{parse, Parser};
