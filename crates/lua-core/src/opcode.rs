/// Operand value meaning "variable number of values" for call argument
/// counts, result counts, returns, varargs and table-constructor flushes.
///
/// When an instruction produces a variable number of values it records the
/// end of the produced run as the thread's `top`; the next instruction with a
/// `MULTI` operand consumes everything up to that top.
pub const MULTI: u8 = u8::MAX;

/// Number of positional table-constructor items buffered in registers before
/// they are flushed into the table with one [`OpCode::SetList`].
pub const FIELDS_PER_FLUSH: u32 = 50;

/// Bytecode instruction set for the virtual machine.
///
/// This is a register-based ISA, loosely inspired by the PUC-Lua 5.4 opcode set.
/// Registers are relative to the current frame's base. Locals captured by
/// nested functions live in per-frame heap cells instead of registers and are
/// addressed through the `*Cell` instructions.
///
/// Jump offsets are relative to the instruction *following* the jump.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OpCode {
    /// Load constant `const_idx` into register `dst`.
    LoadConst {
        dst: u8,
        const_idx: u32,
    },
    /// Load `nil` into `count` consecutive registers starting at `dst`.
    LoadNil {
        dst: u8,
        count: u8,
    },
    LoadBool {
        dst: u8,
        value: bool,
    },
    Move {
        dst: u8,
        src: u8,
    },

    // Upvalues and captured locals
    GetUpvalue {
        dst: u8,
        idx: u8,
    },
    SetUpvalue {
        idx: u8,
        src: u8,
    },
    /// `dst = upvalues[upval][constants[key]]`; how globals are read through `_ENV`.
    GetTabUp {
        dst: u8,
        upval: u8,
        key: u32,
    },
    /// `upvalues[upval][constants[key]] = src`
    SetTabUp {
        upval: u8,
        key: u32,
        src: u8,
    },
    /// Allocate a fresh cell for a captured local and initialise it from `src`.
    /// Executed every time the declaration runs, so each loop iteration gets
    /// its own cell.
    NewCell {
        cell: u8,
        src: u8,
    },
    GetCell {
        dst: u8,
        cell: u8,
    },
    SetCell {
        cell: u8,
        src: u8,
    },

    // Tables
    NewTable {
        dst: u8,
        array_hint: u16,
        hash_hint: u16,
    },
    GetTable {
        dst: u8,
        table: u8,
        key: u8,
    },
    SetTable {
        table: u8,
        key: u8,
        src: u8,
    },
    /// `dst = table[constants[key]]` for string-constant keys.
    GetField {
        dst: u8,
        table: u8,
        key: u32,
    },
    SetField {
        table: u8,
        key: u32,
        src: u8,
    },
    /// Method-call preparation: `dst+1 = obj; dst = obj[constants[key]]`.
    SelfMethod {
        dst: u8,
        obj: u8,
        key: u32,
    },
    /// Store `count` values from registers `table+1..` into `table` starting at
    /// array index `offset + 1`.
    SetList {
        table: u8,
        count: u8,
        offset: u32,
    },

    // Arithmetic
    Add {
        dst: u8,
        lhs: u8,
        rhs: u8,
    },
    Sub {
        dst: u8,
        lhs: u8,
        rhs: u8,
    },
    Mul {
        dst: u8,
        lhs: u8,
        rhs: u8,
    },
    Div {
        dst: u8,
        lhs: u8,
        rhs: u8,
    },
    Mod {
        dst: u8,
        lhs: u8,
        rhs: u8,
    },
    Pow {
        dst: u8,
        lhs: u8,
        rhs: u8,
    },
    /// Floor division (`//`)
    IDiv {
        dst: u8,
        lhs: u8,
        rhs: u8,
    },
    Unm {
        dst: u8,
        src: u8,
    },

    // Bitwise
    BAnd {
        dst: u8,
        lhs: u8,
        rhs: u8,
    },
    BOr {
        dst: u8,
        lhs: u8,
        rhs: u8,
    },
    BXor {
        dst: u8,
        lhs: u8,
        rhs: u8,
    },
    Shl {
        dst: u8,
        lhs: u8,
        rhs: u8,
    },
    Shr {
        dst: u8,
        lhs: u8,
        rhs: u8,
    },
    BNot {
        dst: u8,
        src: u8,
    },

    // Comparison (result stored as boolean in `dst`)
    Eq {
        dst: u8,
        lhs: u8,
        rhs: u8,
    },
    Lt {
        dst: u8,
        lhs: u8,
        rhs: u8,
    },
    Le {
        dst: u8,
        lhs: u8,
        rhs: u8,
    },

    // Logical / misc
    Not {
        dst: u8,
        src: u8,
    },
    /// Length operator `#`
    Len {
        dst: u8,
        src: u8,
    },
    /// `dst = lhs .. rhs`
    Concat {
        dst: u8,
        lhs: u8,
        rhs: u8,
    },

    // Control flow
    Jump {
        offset: i32,
    },
    JumpIfFalse {
        src: u8,
        offset: i32,
    },
    JumpIfTrue {
        src: u8,
        offset: i32,
    },

    // Calls
    /// Call the function in `func` with `nargs` arguments in the registers
    /// after it (`MULTI`: up to `top`). Results land at `func..`; `nresults`
    /// may be `MULTI`.
    Call {
        func: u8,
        nargs: u8,
        nresults: u8,
    },
    /// Like `Call`, but replaces the current frame when the callee is a Lua
    /// function. Always followed by `Return { src: func, count: MULTI }`.
    TailCall {
        func: u8,
        nargs: u8,
    },
    Return {
        src: u8,
        count: u8,
    },

    // Loops
    /// Numeric `for` prologue: checks `base..base+2` (start, limit, step),
    /// copies start into `base+3`, or jumps past the loop when no iteration runs.
    ForPrep {
        base: u8,
        offset: i32,
    },
    /// Numeric `for` step: advances `base`, jumps back while within the limit.
    ForLoop {
        base: u8,
        offset: i32,
    },
    /// Generic `for` step: when `base+3` is not nil, copies it into the
    /// control variable `base+2` and jumps back to the body.
    TForLoop {
        base: u8,
        offset: i32,
    },

    // Closures and varargs
    Closure {
        dst: u8,
        proto_idx: u32,
    },
    /// Copy `count` varargs (`MULTI`: all of them) into `dst..`.
    VarArg {
        dst: u8,
        count: u8,
    },
}

impl OpCode {
    /// Instruction mnemonic used by the disassembler.
    pub fn name(&self) -> &'static str {
        match self {
            OpCode::LoadConst { .. } => "LOADK",
            OpCode::LoadNil { .. } => "LOADNIL",
            OpCode::LoadBool { .. } => "LOADBOOL",
            OpCode::Move { .. } => "MOVE",
            OpCode::GetUpvalue { .. } => "GETUPVAL",
            OpCode::SetUpvalue { .. } => "SETUPVAL",
            OpCode::GetTabUp { .. } => "GETTABUP",
            OpCode::SetTabUp { .. } => "SETTABUP",
            OpCode::NewCell { .. } => "NEWCELL",
            OpCode::GetCell { .. } => "GETCELL",
            OpCode::SetCell { .. } => "SETCELL",
            OpCode::NewTable { .. } => "NEWTABLE",
            OpCode::GetTable { .. } => "GETTABLE",
            OpCode::SetTable { .. } => "SETTABLE",
            OpCode::GetField { .. } => "GETFIELD",
            OpCode::SetField { .. } => "SETFIELD",
            OpCode::SelfMethod { .. } => "SELF",
            OpCode::SetList { .. } => "SETLIST",
            OpCode::Add { .. } => "ADD",
            OpCode::Sub { .. } => "SUB",
            OpCode::Mul { .. } => "MUL",
            OpCode::Div { .. } => "DIV",
            OpCode::Mod { .. } => "MOD",
            OpCode::Pow { .. } => "POW",
            OpCode::IDiv { .. } => "IDIV",
            OpCode::Unm { .. } => "UNM",
            OpCode::BAnd { .. } => "BAND",
            OpCode::BOr { .. } => "BOR",
            OpCode::BXor { .. } => "BXOR",
            OpCode::Shl { .. } => "SHL",
            OpCode::Shr { .. } => "SHR",
            OpCode::BNot { .. } => "BNOT",
            OpCode::Eq { .. } => "EQ",
            OpCode::Lt { .. } => "LT",
            OpCode::Le { .. } => "LE",
            OpCode::Not { .. } => "NOT",
            OpCode::Len { .. } => "LEN",
            OpCode::Concat { .. } => "CONCAT",
            OpCode::Jump { .. } => "JMP",
            OpCode::JumpIfFalse { .. } => "JMPIFNOT",
            OpCode::JumpIfTrue { .. } => "JMPIF",
            OpCode::Call { .. } => "CALL",
            OpCode::TailCall { .. } => "TAILCALL",
            OpCode::Return { .. } => "RETURN",
            OpCode::ForPrep { .. } => "FORPREP",
            OpCode::ForLoop { .. } => "FORLOOP",
            OpCode::TForLoop { .. } => "TFORLOOP",
            OpCode::Closure { .. } => "CLOSURE",
            OpCode::VarArg { .. } => "VARARG",
        }
    }

    /// Redirect a jump instruction to a new relative offset.
    ///
    /// Returns `false` if the instruction is not a jump.
    pub fn set_jump_offset(&mut self, new_offset: i32) -> bool {
        match self {
            OpCode::Jump { offset }
            | OpCode::JumpIfFalse { offset, .. }
            | OpCode::JumpIfTrue { offset, .. }
            | OpCode::ForPrep { offset, .. }
            | OpCode::ForLoop { offset, .. }
            | OpCode::TForLoop { offset, .. } => {
                *offset = new_offset;
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcodes_are_small_and_copy() {
        let op = OpCode::Add { dst: 0, lhs: 1, rhs: 2 };
        let copy = op;
        assert_eq!(op, copy);
        assert!(std::mem::size_of::<OpCode>() <= 12);
    }

    #[test]
    fn patching_only_touches_jumps() {
        let mut jump = OpCode::JumpIfFalse { src: 3, offset: 0 };
        assert!(jump.set_jump_offset(7));
        assert_eq!(jump, OpCode::JumpIfFalse { src: 3, offset: 7 });

        let mut mov = OpCode::Move { dst: 0, src: 1 };
        assert!(!mov.set_jump_offset(7));
    }
}
