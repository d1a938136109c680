//! Function prototypes: the immutable output of the compiler.

use std::fmt;
use std::rc::Rc;

use crate::opcode::OpCode;

// ── Constants ─────────────────────────────────────────────────────────────────

/// An entry in a prototype's constant pool.
///
/// `nil` and booleans have dedicated load instructions and never appear here.
#[derive(Debug, Clone)]
pub enum Constant {
    Number(f64),
    Str(Rc<str>),
}

impl PartialEq for Constant {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            // Bitwise so that 0.0 and -0.0 (and NaN payloads) stay distinct entries.
            (Constant::Number(a), Constant::Number(b)) => a.to_bits() == b.to_bits(),
            (Constant::Str(a), Constant::Str(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for Constant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Constant::Number(n) => f.write_str(&crate::number::format_number(*n)),
            Constant::Str(s) => write!(f, "{s:?}"),
        }
    }
}

// ── Upvalue descriptors ───────────────────────────────────────────────────────

/// Describes where to find an upvalue at closure instantiation time.
#[derive(Debug, Clone, PartialEq)]
pub struct UpvalueDesc {
    /// Variable name, for disassembly and debugging.
    pub name: Rc<str>,
    pub source: UpvalueSource,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UpvalueSource {
    /// Share cell `idx` of the **immediately enclosing** call frame.
    Cell(u8),
    /// Re-use upvalue at index `idx` from the **enclosing** closure.
    Upvalue(u8),
}

// ── Function prototype ────────────────────────────────────────────────────────

/// A compiled function prototype, immutable after compilation.
///
/// Every Lua function (top-level chunk or nested lambda) compiles to a `Proto`.
/// Closures share a `Proto` via `Rc`; upvalue cells are per-instance.
#[derive(Debug, Default)]
pub struct Proto {
    /// Bytecode instructions.
    pub instructions: Vec<OpCode>,
    /// Source line of each instruction, parallel to `instructions`.
    pub lines: Vec<u32>,
    /// Constant pool (numbers and strings).
    pub constants: Vec<Constant>,
    /// Nested function prototypes referenced by `Closure` opcodes.
    pub protos: Vec<Rc<Proto>>,
    /// How to obtain each upvalue when the closure is instantiated.
    pub upvalue_descs: Vec<UpvalueDesc>,
    /// Number of fixed parameters.
    pub param_count: u8,
    /// Whether the function accepts varargs (`...`).
    pub is_vararg: bool,
    /// Registers needed by one activation.
    pub max_stack: usize,
    /// Heap cells needed by one activation (one per captured local).
    pub num_cells: usize,
    /// Chunk name, used in error positions.
    pub source: Rc<str>,
    /// Line of the `function` keyword; 0 for the main chunk.
    pub line_defined: u32,
}

impl Proto {
    /// Create an empty proto with the given source label.
    pub fn new(source: impl Into<Rc<str>>) -> Self {
        Self {
            source: source.into(),
            ..Default::default()
        }
    }

    /// Source line of the instruction at `pc`, or the definition line when
    /// `pc` is out of range.
    pub fn line_at(&self, pc: usize) -> u32 {
        self.lines.get(pc).copied().unwrap_or(self.line_defined)
    }
}
