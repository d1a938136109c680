//! Lua 5.4 Abstract Syntax Tree types.
//!
//! A source file parses to a [`Program`]: the top-level [`Block`] plus the
//! capture analysis the compiler needs to decide which locals live in
//! registers and which live in heap cells.

use std::collections::HashSet;

// ── Shared span info ─────────────────────────────────────────────────────────

/// 1-based source line number attached to nodes that need it for error messages.
pub type Line = u32;

/// Unique identity of one local variable declaration within a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LocalId(pub u32);

/// A declared local: its source name plus the declaration identity.
#[derive(Debug, Clone, PartialEq)]
pub struct Binding {
    pub name: String,
    pub id: LocalId,
}

/// A parsed chunk.
#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    pub block: Block,
    /// Locals referenced from a function nested inside their declaring one.
    pub captured: HashSet<LocalId>,
}

impl Program {
    pub fn is_captured(&self, binding: &Binding) -> bool {
        self.captured.contains(&binding.id)
    }
}

// ── Blocks & Statements ──────────────────────────────────────────────────────

/// A sequence of statements, optionally terminated by an explicit `return`.
#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    pub stmts: Vec<Stmt>,
    pub ret: Option<ReturnStmt>,
    pub line: Line,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReturnStmt {
    pub values: Vec<Expr>,
    pub line: Line,
}

/// All statement forms in Lua 5.4.
#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    /// `varlist = explist`
    Assign {
        targets: Vec<Expr>,
        values: Vec<Expr>,
        line: Line,
    },

    /// `local namelist [= explist]`
    Local {
        names: Vec<LocalName>,
        values: Vec<Expr>,
        line: Line,
    },

    /// A bare function-call statement: `f(args)` or `o:method(args)`
    FnCall(Expr),

    /// `do block end`
    Do(Block),

    /// `while exp do block end`
    While { cond: Expr, body: Block, line: Line },

    /// `repeat block until exp`; locals of `body` are visible in `cond`.
    Repeat { body: Block, cond: Expr, line: Line },

    /// `if exp then block {elseif exp then block} [else block] end`
    If {
        cond: Expr,
        then: Block,
        elseifs: Vec<(Expr, Block)>,
        else_: Option<Block>,
        line: Line,
    },

    /// Numeric for: `for Name = exp, exp [, exp] do block end`
    NumericFor {
        var: Binding,
        start: Expr,
        limit: Expr,
        step: Option<Expr>,
        body: Block,
        line: Line,
    },

    /// Generic for: `for namelist in explist do block end`
    GenericFor {
        vars: Vec<Binding>,
        iterators: Vec<Expr>,
        body: Block,
        line: Line,
    },

    /// `function funcname funcbody`
    FnDef {
        name: FuncName,
        body: FuncBody,
        line: Line,
    },

    /// `local function Name funcbody`
    LocalFn {
        name: Binding,
        body: FuncBody,
        line: Line,
    },

    /// `goto Name`
    Goto { label: String, line: Line },

    /// `::Name::`
    Label { name: String, line: Line },

    /// `break`
    Break(Line),
}

/// Local variable attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attrib {
    Const,
    Close,
}

/// A local variable declaration item with an optional attribute.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalName {
    pub binding: Binding,
    pub attrib: Option<Attrib>,
}

/// Dotted function name, e.g. `a.b.c:method`
#[derive(Debug, Clone, PartialEq)]
pub struct FuncName {
    pub parts: Vec<String>,
    pub method: Option<String>,
}

/// Function parameters + body block.
#[derive(Debug, Clone, PartialEq)]
pub struct FuncBody {
    /// Includes the implicit `self` of method definitions.
    pub params: Vec<Binding>,
    pub vararg: bool,
    pub body: Block,
    pub line: Line,
    /// Line of the closing `end`.
    pub end_line: Line,
}

// ── Expressions ──────────────────────────────────────────────────────────────

/// All expression forms in Lua 5.4.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Nil(Line),
    True(Line),
    False(Line),
    Number(f64, Line),
    LuaString(String, Line),
    Vararg(Line),

    /// Variable / name reference
    Name(String, Line),

    /// `(expr)`: truncates calls and varargs to a single value.
    Paren(Box<Expr>),

    /// `lhs op rhs`
    BinOp {
        op: BinOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
        line: Line,
    },

    /// `op operand`
    UnOp {
        op: UnOp,
        operand: Box<Expr>,
        line: Line,
    },

    /// `table[key]`
    Index {
        table: Box<Expr>,
        key: Box<Expr>,
        line: Line,
    },

    /// `table.field`
    Field {
        table: Box<Expr>,
        field: String,
        line: Line,
    },

    /// `func(args)` or `func{table}` or `func"string"`
    FnCall {
        func: Box<Expr>,
        args: CallArgs,
        line: Line,
    },

    /// `obj:method(args)`
    MethodCall {
        obj: Box<Expr>,
        method: String,
        args: CallArgs,
        line: Line,
    },

    /// `function(params) body end`
    FnDef(FuncBody),

    /// `{ field, field, ... }`
    Table(Vec<Field>, Line),
}

impl Expr {
    pub fn line(&self) -> Line {
        match self {
            Expr::Nil(l) | Expr::True(l) | Expr::False(l) | Expr::Vararg(l) => *l,
            Expr::Number(_, l) | Expr::LuaString(_, l) => *l,
            Expr::Name(_, l) => *l,
            Expr::Paren(inner) => inner.line(),
            Expr::BinOp { line, .. } | Expr::UnOp { line, .. } => *line,
            Expr::Index { line, .. } | Expr::Field { line, .. } => *line,
            Expr::FnCall { line, .. } | Expr::MethodCall { line, .. } => *line,
            Expr::FnDef(fb) => fb.line,
            Expr::Table(_, l) => *l,
        }
    }

    /// Calls and `...` produce a variable number of values.
    pub fn is_multi(&self) -> bool {
        matches!(
            self,
            Expr::FnCall { .. } | Expr::MethodCall { .. } | Expr::Vararg(_)
        )
    }
}

/// Arguments passed to a function call.
#[derive(Debug, Clone, PartialEq)]
pub enum CallArgs {
    /// `(explist)`
    Exprs(Vec<Expr>),
    /// `{table}`
    Table(Vec<Field>, Line),
    /// `"string"`: single string arg, no parens
    String(String, Line),
}

/// A single field in a table constructor.
#[derive(Debug, Clone, PartialEq)]
pub enum Field {
    /// `[expr] = expr`
    Index(Expr, Expr),
    /// `Name = expr`
    Named(String, Expr),
    /// `expr`  (positional)
    Positional(Expr),
}

// ── Operators ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    // Arithmetic
    Add,
    Sub,
    Mul,
    Div,
    IDiv,
    Mod,
    Pow,
    // Bitwise
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Shr,
    // String
    Concat,
    // Comparison
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    // Logical
    And,
    Or,
}

impl BinOp {
    /// `(left, right)` binding priorities following the Lua 5.4 manual §3.4.8.
    /// Right-associative operators have `right < left`.
    pub fn priority(self) -> (u8, u8) {
        match self {
            BinOp::Or => (1, 1),
            BinOp::And => (2, 2),
            BinOp::Eq | BinOp::NotEq | BinOp::Lt | BinOp::LtEq | BinOp::Gt | BinOp::GtEq => (3, 3),
            BinOp::BitOr => (4, 4),
            BinOp::BitXor => (5, 5),
            BinOp::BitAnd => (6, 6),
            BinOp::Shl | BinOp::Shr => (7, 7),
            BinOp::Concat => (9, 8),
            BinOp::Add | BinOp::Sub => (10, 10),
            BinOp::Mul | BinOp::Div | BinOp::IDiv | BinOp::Mod => (11, 11),
            BinOp::Pow => (14, 13),
        }
    }
}

/// Operand priority of unary operators: tighter than `*`, looser than `^`.
pub const UNARY_PRIORITY: u8 = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnOp {
    Neg,    // -
    Not,    // not
    Len,    // #
    BitNot, // ~
}
