//! `lua-compiler`: compiles a Lua AST to register bytecode prototypes.

pub mod builder;
pub mod compiler;
pub mod disasm;

use std::rc::Rc;

use lua_core::{Proto, SyntaxError};

pub use builder::ProtoBuilder;
pub use compiler::Compiler;
pub use disasm::disassemble;

/// Parse and compile `source` as a main chunk named `chunk_name`.
pub fn compile(source: &str, chunk_name: &str) -> Result<Rc<Proto>, SyntaxError> {
    let program = lua_parser::parse(source, chunk_name)?;
    let proto = Compiler::new(chunk_name).compile(&program)?;
    tracing::debug!(
        chunk = chunk_name,
        instructions = proto.instructions.len(),
        functions = proto.protos.len() + 1,
        "compiled chunk"
    );
    Ok(proto)
}
