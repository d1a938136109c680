use std::collections::HashSet;

use crate::ast::*;
use lua_core::SyntaxError;
use lua_lexer::{Lexer, Token, TokenKind};

/// Recursive-descent parser for Lua 5.4.
///
/// Pulls tokens lazily from a [`Lexer`] and tracks lexical scopes while it
/// goes, so every local gets a unique [`LocalId`] and references from nested
/// functions are recorded in [`Program::captured`].
///
/// Usage:
/// ```ignore
/// let program = Parser::new("local x = 1 + 2", "main").parse()?;
/// ```
pub struct Parser<'src> {
    lexer: Lexer<'src>,
    /// One entry per function being parsed, innermost last.
    functions: Vec<FunctionScope>,
    next_id: u32,
    captured: HashSet<LocalId>,
}

/// Visible locals of one function, one `Vec` per open block.
struct FunctionScope {
    blocks: Vec<Vec<(String, LocalId)>>,
    vararg: bool,
}

impl FunctionScope {
    fn lookup(&self, name: &str) -> Option<LocalId> {
        self.blocks
            .iter()
            .rev()
            .flat_map(|block| block.iter().rev())
            .find(|(n, _)| n == name)
            .map(|(_, id)| *id)
    }
}

/// Parse `src` as a chunk named `chunk`.
pub fn parse(src: &str, chunk: &str) -> Result<Program, SyntaxError> {
    Parser::new(src, chunk).parse()
}

// ── Constructor ───────────────────────────────────────────────────────────────

impl<'src> Parser<'src> {
    pub fn new(src: &'src str, chunk: &str) -> Self {
        Self {
            lexer: Lexer::with_chunk_name(src, chunk),
            functions: Vec::new(),
            next_id: 0,
            captured: HashSet::new(),
        }
    }

    /// Parse the entire source as a main chunk (an implicitly vararg function).
    pub fn parse(mut self) -> Result<Program, SyntaxError> {
        self.enter_function(true);
        let block = self.parse_block()?;
        self.expect(&TokenKind::Eof)?;
        self.leave_function();
        Ok(Program {
            block,
            captured: self.captured,
        })
    }
}

// ── Token navigation ──────────────────────────────────────────────────────────

impl Parser<'_> {
    fn peek(&mut self) -> Result<&TokenKind, SyntaxError> {
        Ok(&self.lexer.peek()?.kind)
    }

    fn peek_line(&mut self) -> Result<Line, SyntaxError> {
        Ok(self.lexer.peek()?.line)
    }

    fn check(&mut self, kind: &TokenKind) -> Result<bool, SyntaxError> {
        Ok(self.peek()?.same_type(kind))
    }

    fn advance(&mut self) -> Result<Token, SyntaxError> {
        self.lexer.next_token()
    }

    /// Advance if the current token matches `kind`.
    fn eat(&mut self, kind: &TokenKind) -> Result<bool, SyntaxError> {
        if self.check(kind)? {
            self.advance()?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn expect(&mut self, kind: &TokenKind) -> Result<Token, SyntaxError> {
        self.lexer.expect(kind)
    }

    /// Expect a `Name` token and return the identifier string.
    fn expect_name(&mut self) -> Result<String, SyntaxError> {
        let tok = self.expect(&TokenKind::Name(String::new()))?;
        match &tok.kind {
            TokenKind::Name(s) => Ok(s.clone()),
            _ => Err(self.lexer.error_at(&tok, "<name> expected")),
        }
    }

    /// `close` expected after `open` opened at `line`, Lua style.
    fn expect_match(&mut self, close: &TokenKind, open: &TokenKind, line: Line) -> Result<Token, SyntaxError> {
        let tok = self.advance()?;
        if tok.kind.same_type(close) {
            return Ok(tok);
        }
        let message = if tok.line == line {
            format!("{close} expected near {}", tok.kind)
        } else {
            format!("{close} expected (to close {open} at line {line}) near {}", tok.kind)
        };
        Err(self.lexer.error_at(&tok, message))
    }

    fn error_near_next(&mut self, message: &str) -> SyntaxError {
        match self.lexer.peek() {
            Ok(tok) => {
                let tok = tok.clone();
                self.lexer.error_at(&tok, format!("{message} near {}", tok.kind))
            }
            Err(err) => err,
        }
    }
}

// ── Scopes ────────────────────────────────────────────────────────────────────

impl Parser<'_> {
    fn enter_function(&mut self, vararg: bool) {
        self.functions.push(FunctionScope {
            blocks: vec![Vec::new()],
            vararg,
        });
    }

    fn leave_function(&mut self) {
        self.functions.pop();
    }

    fn enter_block(&mut self) {
        if let Some(f) = self.functions.last_mut() {
            f.blocks.push(Vec::new());
        }
    }

    fn leave_block(&mut self) {
        if let Some(f) = self.functions.last_mut() {
            f.blocks.pop();
        }
    }

    /// Allocate a binding without bringing it into scope yet.
    fn new_binding(&mut self, name: String) -> Binding {
        let id = LocalId(self.next_id);
        self.next_id += 1;
        Binding { name, id }
    }

    fn activate(&mut self, binding: &Binding) {
        if let Some(block) = self.functions.last_mut().and_then(|f| f.blocks.last_mut()) {
            block.push((binding.name.clone(), binding.id));
        }
    }

    fn declare(&mut self, name: String) -> Binding {
        let binding = self.new_binding(name);
        self.activate(&binding);
        binding
    }

    /// Resolve a name reference, marking outer-function locals as captured.
    /// Globals are accessed through `_ENV`, so `_ENV` is resolved for them.
    fn reference(&mut self, name: &str) {
        if !self.mark_captured(name) {
            self.mark_captured("_ENV");
        }
    }

    fn mark_captured(&mut self, name: &str) -> bool {
        let current = self.functions.len().saturating_sub(1);
        for (level, function) in self.functions.iter().enumerate().rev() {
            if let Some(id) = function.lookup(name) {
                if level < current {
                    self.captured.insert(id);
                }
                return true;
            }
        }
        false
    }

    /// Parse a block in its own scope.
    fn parse_scoped_block(&mut self) -> Result<Block, SyntaxError> {
        self.enter_block();
        let block = self.parse_block();
        self.leave_block();
        block
    }
}

// ── Block & Statements ────────────────────────────────────────────────────────

impl Parser<'_> {
    /// `block ::= {stat} [retstat]`
    fn parse_block(&mut self) -> Result<Block, SyntaxError> {
        let line = self.peek_line()?;
        let mut stmts = Vec::new();
        loop {
            while self.eat(&TokenKind::Semicolon)? {}

            if self.check(&TokenKind::Return)? {
                let ret = self.parse_return()?;
                return Ok(Block {
                    stmts,
                    ret: Some(ret),
                    line,
                });
            }
            if self.is_block_end()? {
                break;
            }
            stmts.push(self.parse_stmt()?);
        }
        Ok(Block {
            stmts,
            ret: None,
            line,
        })
    }

    /// Returns true when the current token signals the end of a block.
    fn is_block_end(&mut self) -> Result<bool, SyntaxError> {
        Ok(matches!(
            self.peek()?,
            TokenKind::Eof | TokenKind::End | TokenKind::Else | TokenKind::Elseif | TokenKind::Until
        ))
    }

    fn parse_return(&mut self) -> Result<ReturnStmt, SyntaxError> {
        let line = self.expect(&TokenKind::Return)?.line;
        let values = if self.is_block_end()? || self.check(&TokenKind::Semicolon)? {
            vec![]
        } else {
            self.parse_expr_list()?
        };
        self.eat(&TokenKind::Semicolon)?;
        if !self.is_block_end()? {
            return Err(self.error_near_next("'<eof>' expected"));
        }
        Ok(ReturnStmt { values, line })
    }

    fn parse_stmt(&mut self) -> Result<Stmt, SyntaxError> {
        let line = self.peek_line()?;
        let stmt = match self.peek()? {
            TokenKind::If => self.parse_if()?,
            TokenKind::While => self.parse_while()?,
            TokenKind::Do => {
                self.advance()?;
                let b = self.parse_scoped_block()?;
                self.expect_match(&TokenKind::End, &TokenKind::Do, line)?;
                Stmt::Do(b)
            }
            TokenKind::For => self.parse_for()?,
            TokenKind::Repeat => self.parse_repeat()?,
            TokenKind::Function => self.parse_fn_def()?,
            TokenKind::Local => self.parse_local()?,
            TokenKind::Goto => {
                self.advance()?;
                let label = self.expect_name()?;
                Stmt::Goto { label, line }
            }
            TokenKind::Break => {
                self.advance()?;
                Stmt::Break(line)
            }
            TokenKind::ColonColon => self.parse_label()?,
            _ => self.parse_expr_stat()?,
        };
        Ok(stmt)
    }

    // ── Control flow ─────────────────────────────────────────────────────────

    fn parse_if(&mut self) -> Result<Stmt, SyntaxError> {
        let line = self.expect(&TokenKind::If)?.line;
        let cond = self.parse_expr()?;
        self.expect(&TokenKind::Then)?;
        let then = self.parse_scoped_block()?;

        let mut elseifs = Vec::new();
        let mut else_ = None;
        loop {
            if self.eat(&TokenKind::Elseif)? {
                let ec = self.parse_expr()?;
                self.expect(&TokenKind::Then)?;
                let eb = self.parse_scoped_block()?;
                elseifs.push((ec, eb));
            } else if self.eat(&TokenKind::Else)? {
                else_ = Some(self.parse_scoped_block()?);
                break;
            } else {
                break;
            }
        }
        self.expect_match(&TokenKind::End, &TokenKind::If, line)?;
        Ok(Stmt::If {
            cond,
            then,
            elseifs,
            else_,
            line,
        })
    }

    fn parse_while(&mut self) -> Result<Stmt, SyntaxError> {
        let line = self.expect(&TokenKind::While)?.line;
        let cond = self.parse_expr()?;
        self.expect(&TokenKind::Do)?;
        let body = self.parse_scoped_block()?;
        self.expect_match(&TokenKind::End, &TokenKind::While, line)?;
        Ok(Stmt::While { cond, body, line })
    }

    fn parse_repeat(&mut self) -> Result<Stmt, SyntaxError> {
        let line = self.expect(&TokenKind::Repeat)?.line;
        // The condition sees the body's locals, so one scope spans both.
        self.enter_block();
        let result = self.parse_repeat_tail(line);
        self.leave_block();
        result
    }

    fn parse_repeat_tail(&mut self, line: Line) -> Result<Stmt, SyntaxError> {
        let body = self.parse_block()?;
        self.expect_match(&TokenKind::Until, &TokenKind::Repeat, line)?;
        let cond = self.parse_expr()?;
        Ok(Stmt::Repeat { body, cond, line })
    }

    fn parse_for(&mut self) -> Result<Stmt, SyntaxError> {
        let line = self.expect(&TokenKind::For)?.line;
        let first_name = self.expect_name()?;

        if self.eat(&TokenKind::Assign)? {
            let start = self.parse_expr()?;
            self.expect(&TokenKind::Comma)?;
            let limit = self.parse_expr()?;
            let step = if self.eat(&TokenKind::Comma)? {
                Some(self.parse_expr()?)
            } else {
                None
            };
            self.expect(&TokenKind::Do)?;
            self.enter_block();
            let var = self.declare(first_name);
            let body = self.parse_block();
            self.leave_block();
            let body = body?;
            self.expect_match(&TokenKind::End, &TokenKind::For, line)?;
            Ok(Stmt::NumericFor {
                var,
                start,
                limit,
                step,
                body,
                line,
            })
        } else if self.check(&TokenKind::Comma)? || self.check(&TokenKind::In)? {
            let mut names = vec![first_name];
            while self.eat(&TokenKind::Comma)? {
                names.push(self.expect_name()?);
            }
            self.expect(&TokenKind::In)?;
            let iterators = self.parse_expr_list()?;
            self.expect(&TokenKind::Do)?;
            self.enter_block();
            let vars: Vec<Binding> = names.into_iter().map(|n| self.declare(n)).collect();
            let body = self.parse_block();
            self.leave_block();
            let body = body?;
            self.expect_match(&TokenKind::End, &TokenKind::For, line)?;
            Ok(Stmt::GenericFor {
                vars,
                iterators,
                body,
                line,
            })
        } else {
            Err(self.error_near_next("'=' or 'in' expected"))
        }
    }

    fn parse_fn_def(&mut self) -> Result<Stmt, SyntaxError> {
        let line = self.expect(&TokenKind::Function)?.line;
        let name = self.parse_func_name()?;
        let is_method = name.method.is_some();
        let body = self.parse_func_body(is_method, line)?;
        Ok(Stmt::FnDef { name, body, line })
    }

    fn parse_local(&mut self) -> Result<Stmt, SyntaxError> {
        let line = self.expect(&TokenKind::Local)?.line;
        if self.eat(&TokenKind::Function)? {
            let name = self.expect_name()?;
            // Visible inside its own body, so recursion resolves to it.
            let name = self.declare(name);
            let body = self.parse_func_body(false, line)?;
            return Ok(Stmt::LocalFn { name, body, line });
        }

        let mut names = Vec::new();
        loop {
            let name = self.expect_name()?;
            let attrib = if self.check(&TokenKind::Lt)? {
                let open = self.advance()?;
                let attr = self.expect_name()?;
                self.expect(&TokenKind::Gt)?;
                match attr.as_str() {
                    "const" => Some(Attrib::Const),
                    "close" => Some(Attrib::Close),
                    other => {
                        return Err(self
                            .lexer
                            .error_at(&open, format!("unknown attribute '{other}'")))
                    }
                }
            } else {
                None
            };
            let binding = self.new_binding(name);
            names.push(LocalName { binding, attrib });
            if !self.eat(&TokenKind::Comma)? {
                break;
            }
        }
        let values = if self.eat(&TokenKind::Assign)? {
            self.parse_expr_list()?
        } else {
            vec![]
        };
        // New locals come into scope only after their initialisers.
        for name in &names {
            self.activate(&name.binding);
        }
        Ok(Stmt::Local {
            names,
            values,
            line,
        })
    }

    /// `::label::`
    fn parse_label(&mut self) -> Result<Stmt, SyntaxError> {
        let line = self.expect(&TokenKind::ColonColon)?.line;
        let name = self.expect_name()?;
        self.expect(&TokenKind::ColonColon)?;
        Ok(Stmt::Label { name, line })
    }

    /// Assignment or bare function-call statement.
    fn parse_expr_stat(&mut self) -> Result<Stmt, SyntaxError> {
        let line = self.peek_line()?;
        let expr = self.parse_suffixed_expr()?;

        if self.check(&TokenKind::Assign)? || self.check(&TokenKind::Comma)? {
            let mut targets = vec![expr];
            while self.eat(&TokenKind::Comma)? {
                targets.push(self.parse_suffixed_expr()?);
            }
            for target in &targets {
                if !matches!(target, Expr::Name(..) | Expr::Index { .. } | Expr::Field { .. }) {
                    return Err(self.error_near_next("syntax error"));
                }
            }
            self.expect(&TokenKind::Assign)?;
            let values = self.parse_expr_list()?;
            return Ok(Stmt::Assign {
                targets,
                values,
                line,
            });
        }

        match &expr {
            Expr::FnCall { .. } | Expr::MethodCall { .. } => Ok(Stmt::FnCall(expr)),
            _ => Err(self.error_near_next("syntax error")),
        }
    }

    // ── Functions ─────────────────────────────────────────────────────────────

    /// `funcname ::= Name {'.' Name} [':' Name]`
    fn parse_func_name(&mut self) -> Result<FuncName, SyntaxError> {
        let first = self.expect_name()?;
        self.reference(&first);
        let mut parts = vec![first];
        while self.eat(&TokenKind::Dot)? {
            parts.push(self.expect_name()?);
        }
        let method = if self.eat(&TokenKind::Colon)? {
            Some(self.expect_name()?)
        } else {
            None
        };
        Ok(FuncName { parts, method })
    }

    /// `funcbody ::= '(' [parlist] ')' block end`
    fn parse_func_body(&mut self, implicit_self: bool, line: Line) -> Result<FuncBody, SyntaxError> {
        self.expect(&TokenKind::LParen)?;
        let mut names = Vec::new();
        let mut vararg = false;

        if implicit_self {
            names.push("self".to_string());
        }

        if !self.check(&TokenKind::RParen)? {
            loop {
                if self.eat(&TokenKind::DotDotDot)? {
                    vararg = true;
                    break;
                }
                names.push(self.expect_name()?);
                if !self.eat(&TokenKind::Comma)? {
                    break;
                }
            }
        }
        self.expect(&TokenKind::RParen)?;

        self.enter_function(vararg);
        let params: Vec<Binding> = names.into_iter().map(|n| self.declare(n)).collect();
        let body = self.parse_block();
        self.leave_function();
        let body = body?;
        let end_line = self.expect_match(&TokenKind::End, &TokenKind::Function, line)?.line;
        Ok(FuncBody {
            params,
            vararg,
            body,
            line,
            end_line,
        })
    }

    // ── Expression list ───────────────────────────────────────────────────────

    fn parse_expr_list(&mut self) -> Result<Vec<Expr>, SyntaxError> {
        let mut list = vec![self.parse_expr()?];
        while self.eat(&TokenKind::Comma)? {
            list.push(self.parse_expr()?);
        }
        Ok(list)
    }

    // ── Expressions (precedence climbing) ─────────────────────────────────────

    pub fn parse_expr(&mut self) -> Result<Expr, SyntaxError> {
        self.parse_subexpr(0)
    }

    /// Parse an expression whose binary operators all bind tighter than `limit`.
    fn parse_subexpr(&mut self, limit: u8) -> Result<Expr, SyntaxError> {
        let line = self.peek_line()?;
        let mut lhs = self.parse_unary_expr()?;

        while let Some(op) = self.peek_binop()? {
            let (left, right) = op.priority();
            if left <= limit {
                break;
            }
            self.advance()?;
            let rhs = self.parse_subexpr(right)?;
            lhs = Expr::BinOp {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
                line,
            };
        }
        Ok(lhs)
    }

    fn peek_binop(&mut self) -> Result<Option<BinOp>, SyntaxError> {
        Ok(Some(match self.peek()? {
            TokenKind::Or => BinOp::Or,
            TokenKind::And => BinOp::And,
            TokenKind::Lt => BinOp::Lt,
            TokenKind::Gt => BinOp::Gt,
            TokenKind::LtEq => BinOp::LtEq,
            TokenKind::GtEq => BinOp::GtEq,
            TokenKind::Eq => BinOp::Eq,
            TokenKind::NotEq => BinOp::NotEq,
            TokenKind::Pipe => BinOp::BitOr,
            TokenKind::Tilde => BinOp::BitXor,
            TokenKind::Ampersand => BinOp::BitAnd,
            TokenKind::ShiftLeft => BinOp::Shl,
            TokenKind::ShiftRight => BinOp::Shr,
            TokenKind::DotDot => BinOp::Concat,
            TokenKind::Plus => BinOp::Add,
            TokenKind::Minus => BinOp::Sub,
            TokenKind::Star => BinOp::Mul,
            TokenKind::Slash => BinOp::Div,
            TokenKind::SlashSlash => BinOp::IDiv,
            TokenKind::Percent => BinOp::Mod,
            TokenKind::Caret => BinOp::Pow,
            _ => return Ok(None),
        }))
    }

    fn parse_unary_expr(&mut self) -> Result<Expr, SyntaxError> {
        let line = self.peek_line()?;
        let op = match self.peek()? {
            TokenKind::Not => UnOp::Not,
            TokenKind::Minus => UnOp::Neg,
            TokenKind::Hash => UnOp::Len,
            TokenKind::Tilde => UnOp::BitNot,
            _ => return self.parse_simple_expr(),
        };
        self.advance()?;
        let operand = self.parse_subexpr(UNARY_PRIORITY)?;
        Ok(Expr::UnOp {
            op,
            operand: Box::new(operand),
            line,
        })
    }

    fn parse_simple_expr(&mut self) -> Result<Expr, SyntaxError> {
        let line = self.peek_line()?;
        let expr = match self.peek()? {
            TokenKind::Number(n) => {
                let n = *n;
                self.advance()?;
                Expr::Number(n, line)
            }
            TokenKind::LuaString(_) | TokenKind::Quote(_) => {
                let s = self.parse_string_literal()?;
                Expr::LuaString(s, line)
            }
            TokenKind::Nil => {
                self.advance()?;
                Expr::Nil(line)
            }
            TokenKind::True => {
                self.advance()?;
                Expr::True(line)
            }
            TokenKind::False => {
                self.advance()?;
                Expr::False(line)
            }
            TokenKind::DotDotDot => {
                let tok = self.advance()?;
                let vararg = self.functions.last().is_some_and(|f| f.vararg);
                if !vararg {
                    return Err(self
                        .lexer
                        .error_at(&tok, "cannot use '...' outside a vararg function near '...'"));
                }
                Expr::Vararg(line)
            }
            TokenKind::Function => {
                self.advance()?;
                Expr::FnDef(self.parse_func_body(false, line)?)
            }
            TokenKind::LBrace => {
                let fields = self.parse_table_fields()?;
                Expr::Table(fields, line)
            }
            _ => self.parse_suffixed_expr()?,
        };
        Ok(expr)
    }

    /// Consume a string token: either a complete long string or a quote
    /// whose body is read from the lexer right away.
    fn parse_string_literal(&mut self) -> Result<String, SyntaxError> {
        let tok = self.advance()?;
        match &tok.kind {
            TokenKind::LuaString(s) => Ok(s.clone()),
            TokenKind::Quote(q) => self.lexer.parse_string(*q),
            _ => Err(self
                .lexer
                .error_at(&tok, format!("<string> expected near {}", tok.kind))),
        }
    }

    /// Primary + chain of `.field`, `[key]`, `(args)`, `:method(args)` suffixes.
    fn parse_suffixed_expr(&mut self) -> Result<Expr, SyntaxError> {
        let mut expr = self.parse_primary_expr()?;
        loop {
            let line = self.peek_line()?;
            match self.peek()? {
                TokenKind::Dot => {
                    self.advance()?;
                    let field = self.expect_name()?;
                    expr = Expr::Field {
                        table: Box::new(expr),
                        field,
                        line,
                    };
                }
                TokenKind::LBracket => {
                    self.advance()?;
                    let key = self.parse_expr()?;
                    self.expect(&TokenKind::RBracket)?;
                    expr = Expr::Index {
                        table: Box::new(expr),
                        key: Box::new(key),
                        line,
                    };
                }
                TokenKind::Colon => {
                    self.advance()?;
                    let method = self.expect_name()?;
                    let args = self.parse_call_args()?;
                    expr = Expr::MethodCall {
                        obj: Box::new(expr),
                        method,
                        args,
                        line,
                    };
                }
                TokenKind::LParen | TokenKind::LBrace | TokenKind::LuaString(_) | TokenKind::Quote(_) => {
                    let args = self.parse_call_args()?;
                    expr = Expr::FnCall {
                        func: Box::new(expr),
                        args,
                        line,
                    };
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    fn parse_primary_expr(&mut self) -> Result<Expr, SyntaxError> {
        let tok = self.advance()?;
        match &tok.kind {
            TokenKind::Name(n) => {
                let n = n.clone();
                self.reference(&n);
                Ok(Expr::Name(n, tok.line))
            }
            TokenKind::LParen => {
                let e = self.parse_expr()?;
                self.expect_match(&TokenKind::RParen, &TokenKind::LParen, tok.line)?;
                Ok(Expr::Paren(Box::new(e)))
            }
            other => Err(self
                .lexer
                .error_at(&tok, format!("unexpected symbol near {other}"))),
        }
    }

    // ── Call arguments ────────────────────────────────────────────────────────

    fn parse_call_args(&mut self) -> Result<CallArgs, SyntaxError> {
        let line = self.peek_line()?;
        match self.peek()? {
            TokenKind::LParen => {
                self.advance()?;
                if self.eat(&TokenKind::RParen)? {
                    Ok(CallArgs::Exprs(vec![]))
                } else {
                    let exprs = self.parse_expr_list()?;
                    self.expect_match(&TokenKind::RParen, &TokenKind::LParen, line)?;
                    Ok(CallArgs::Exprs(exprs))
                }
            }
            TokenKind::LBrace => Ok(CallArgs::Table(self.parse_table_fields()?, line)),
            TokenKind::LuaString(_) | TokenKind::Quote(_) => {
                Ok(CallArgs::String(self.parse_string_literal()?, line))
            }
            _ => Err(self.error_near_next("function arguments expected")),
        }
    }

    // ── Table constructors ────────────────────────────────────────────────────

    fn parse_table_fields(&mut self) -> Result<Vec<Field>, SyntaxError> {
        let line = self.expect(&TokenKind::LBrace)?.line;
        let mut fields = Vec::new();
        while !self.check(&TokenKind::RBrace)? {
            fields.push(self.parse_field()?);
            if !self.eat(&TokenKind::Comma)? && !self.eat(&TokenKind::Semicolon)? {
                break;
            }
        }
        self.expect_match(&TokenKind::RBrace, &TokenKind::LBrace, line)?;
        Ok(fields)
    }

    fn parse_field(&mut self) -> Result<Field, SyntaxError> {
        match self.peek()? {
            TokenKind::LBracket => {
                self.advance()?;
                let key = self.parse_expr()?;
                self.expect(&TokenKind::RBracket)?;
                self.expect(&TokenKind::Assign)?;
                let val = self.parse_expr()?;
                Ok(Field::Index(key, val))
            }
            TokenKind::Name(_) => {
                // `Name = expr` needs one token of lookahead past the name.
                let name_tok = self.advance()?;
                if self.check(&TokenKind::Assign)? {
                    self.advance()?;
                    let val = self.parse_expr()?;
                    match &name_tok.kind {
                        TokenKind::Name(n) => Ok(Field::Named(n.clone(), val)),
                        _ => Err(self.lexer.error_at(&name_tok, "<name> expected")),
                    }
                } else {
                    self.lexer.push_back(name_tok);
                    Ok(Field::Positional(self.parse_expr()?))
                }
            }
            _ => Ok(Field::Positional(self.parse_expr()?)),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_program(src: &str) -> Program {
        parse(src, "test").unwrap()
    }

    fn parse_block(src: &str) -> Block {
        parse_program(src).block
    }

    fn parse_expr(src: &str) -> Expr {
        // Wrap in `return` to get an expression out
        let b = parse_block(&format!("return {src}"));
        b.ret.unwrap().values.into_iter().next().unwrap()
    }

    fn parse_err(src: &str) -> SyntaxError {
        parse(src, "test").unwrap_err()
    }

    // ── Empty / trivial ──────────────────────────────────────────────────────
    #[test]
    fn empty_block() {
        let b = parse_block("");
        assert!(b.stmts.is_empty());
        assert!(b.ret.is_none());
    }

    #[test]
    fn bare_return() {
        let b = parse_block("return;");
        assert!(b.ret.unwrap().values.is_empty());
    }

    #[test]
    fn return_must_end_block() {
        assert!(parse_err("return 1 x = 2").message.contains("'<eof>' expected"));
    }

    // ── Literals ─────────────────────────────────────────────────────────────
    #[test]
    fn number_expr() {
        assert!(matches!(parse_expr("42"), Expr::Number(n, _) if n == 42.0));
        assert!(matches!(parse_expr("3.14"), Expr::Number(n, _) if n == 3.14));
    }

    #[test]
    fn string_expr() {
        assert!(matches!(parse_expr(r#""hello""#), Expr::LuaString(s, _) if s == "hello"));
        assert!(matches!(parse_expr("[[long]]"), Expr::LuaString(s, _) if s == "long"));
    }

    #[test]
    fn keyword_literals() {
        assert!(matches!(parse_expr("nil"), Expr::Nil(_)));
        assert!(matches!(parse_expr("true"), Expr::True(_)));
        assert!(matches!(parse_expr("false"), Expr::False(_)));
    }

    // ── Binary ops ───────────────────────────────────────────────────────────
    #[test]
    fn precedence_mul_over_add() {
        // 1 + 2 * 3  should parse as  1 + (2 * 3)
        match parse_expr("1 + 2 * 3") {
            Expr::BinOp {
                op: BinOp::Add,
                lhs,
                rhs,
                ..
            } => {
                assert!(matches!(*lhs, Expr::Number(n, _) if n == 1.0));
                assert!(matches!(*rhs, Expr::BinOp { op: BinOp::Mul, .. }));
            }
            other => panic!("expected Add at top level, got {other:?}"),
        }
    }

    #[test]
    fn subtraction_is_left_associative() {
        // 1 - 2 - 3  should parse as  (1 - 2) - 3
        match parse_expr("1 - 2 - 3") {
            Expr::BinOp {
                op: BinOp::Sub,
                lhs,
                rhs,
                ..
            } => {
                assert!(matches!(*lhs, Expr::BinOp { op: BinOp::Sub, .. }));
                assert!(matches!(*rhs, Expr::Number(n, _) if n == 3.0));
            }
            other => panic!("expected Sub at top level, got {other:?}"),
        }
    }

    #[test]
    fn concat_and_pow_are_right_associative() {
        let e = parse_expr(r#""a" .. "b" .. "c""#);
        assert!(matches!(e, Expr::BinOp { op: BinOp::Concat, rhs, .. }
            if matches!(*rhs, Expr::BinOp { op: BinOp::Concat, .. })));
        let e = parse_expr("2 ^ 3 ^ 2");
        assert!(matches!(e, Expr::BinOp { op: BinOp::Pow, rhs, .. }
            if matches!(*rhs, Expr::BinOp { op: BinOp::Pow, .. })));
    }

    #[test]
    fn unary_binds_looser_than_pow() {
        // -2 ^ 2  should parse as  -(2 ^ 2)
        let e = parse_expr("-2 ^ 2");
        assert!(matches!(e, Expr::UnOp { op: UnOp::Neg, operand, .. }
            if matches!(*operand, Expr::BinOp { op: BinOp::Pow, .. })));
        // not a == b  should parse as  (not a) == b
        let e = parse_expr("not a == b");
        assert!(matches!(e, Expr::BinOp { op: BinOp::Eq, lhs, .. }
            if matches!(*lhs, Expr::UnOp { op: UnOp::Not, .. })));
    }

    #[test]
    fn parens_are_kept() {
        assert!(matches!(parse_expr("(f())"), Expr::Paren(_)));
    }

    // ── Statements ───────────────────────────────────────────────────────────
    #[test]
    fn local_assign() {
        let b = parse_block("local x <const> = 1");
        assert!(matches!(&b.stmts[0], Stmt::Local { names, .. }
            if names[0].binding.name == "x" && names[0].attrib == Some(Attrib::Const)));
    }

    #[test]
    fn unknown_attribute_is_error() {
        assert!(parse_err("local x <weak> = 1").message.contains("unknown attribute 'weak'"));
    }

    #[test]
    fn control_statements() {
        let b = parse_block(
            "while true do break end
             repeat until x
             if x then elseif y then else end
             for i = 1, 10 do end
             for k, v in pairs(t) do end
             do end",
        );
        assert!(matches!(&b.stmts[0], Stmt::While { body, .. } if matches!(body.stmts[0], Stmt::Break(_))));
        assert!(matches!(&b.stmts[1], Stmt::Repeat { .. }));
        assert!(matches!(&b.stmts[2], Stmt::If { elseifs, else_: Some(_), .. } if elseifs.len() == 1));
        assert!(matches!(&b.stmts[3], Stmt::NumericFor { var, .. } if var.name == "i"));
        assert!(matches!(&b.stmts[4], Stmt::GenericFor { vars, .. } if vars.len() == 2));
        assert!(matches!(&b.stmts[5], Stmt::Do(_)));
    }

    #[test]
    fn function_definitions() {
        let b = parse_block("function a.b:c(x) end local function f() end");
        assert!(matches!(&b.stmts[0], Stmt::FnDef { name, body, .. }
            if name.parts == ["a", "b"] && name.method.as_deref() == Some("c")
                && body.params.len() == 2 && body.params[0].name == "self"));
        assert!(matches!(&b.stmts[1], Stmt::LocalFn { name, .. } if name.name == "f"));
    }

    #[test]
    fn call_sugar() {
        let b = parse_block(r#"f"x" f{1} f[[y]] o:m "z""#);
        assert!(matches!(&b.stmts[0], Stmt::FnCall(Expr::FnCall { args: CallArgs::String(s, _), .. }) if s == "x"));
        assert!(matches!(&b.stmts[1], Stmt::FnCall(Expr::FnCall { args: CallArgs::Table(..), .. })));
        assert!(matches!(&b.stmts[2], Stmt::FnCall(Expr::FnCall { args: CallArgs::String(s, _), .. }) if s == "y"));
        assert!(matches!(&b.stmts[3], Stmt::FnCall(Expr::MethodCall { method, .. }) if method == "m"));
    }

    #[test]
    fn label_and_goto() {
        let b = parse_block("::start:: goto start");
        assert!(matches!(&b.stmts[0], Stmt::Label { name, .. } if name == "start"));
        assert!(matches!(&b.stmts[1], Stmt::Goto { label, .. } if label == "start"));
    }

    // ── Tables ───────────────────────────────────────────────────────────────
    #[test]
    fn table_constructor_fields() {
        let e = parse_expr(r#"{1, x = 2, [3] = 4; y, "s"}"#);
        match e {
            Expr::Table(fields, _) => {
                assert_eq!(fields.len(), 5);
                assert!(matches!(&fields[0], Field::Positional(_)));
                assert!(matches!(&fields[1], Field::Named(n, _) if n == "x"));
                assert!(matches!(&fields[2], Field::Index(..)));
                assert!(matches!(&fields[3], Field::Positional(Expr::Name(n, _)) if n == "y"));
                assert!(matches!(&fields[4], Field::Positional(Expr::LuaString(s, _)) if s == "s"));
            }
            other => panic!("expected table, got {other:?}"),
        }
    }

    // ── Scope analysis ───────────────────────────────────────────────────────
    #[test]
    fn captured_locals_are_reported() {
        let p = parse_program(
            "local a, b = 1, 2
             local function f() return a end
             return b",
        );
        let Stmt::Local { names, .. } = &p.block.stmts[0] else {
            panic!("expected local");
        };
        assert!(p.is_captured(&names[0].binding));
        assert!(!p.is_captured(&names[1].binding));
    }

    #[test]
    fn local_initialiser_sees_outer_binding() {
        // The inner `x` on the right-hand side refers to the outer local.
        let p = parse_program("local x = 1 local function f() local x = x end");
        let Stmt::Local { names, .. } = &p.block.stmts[0] else {
            panic!("expected local");
        };
        assert!(p.is_captured(&names[0].binding));
    }

    #[test]
    fn recursive_local_function_captures_itself() {
        let p = parse_program("local function f(n) return f(n) end");
        let Stmt::LocalFn { name, .. } = &p.block.stmts[0] else {
            panic!("expected local function");
        };
        assert!(p.is_captured(name));
    }

    #[test]
    fn repeat_condition_sees_body_locals() {
        let p = parse_program("repeat local done = true until function() return done end");
        let Stmt::Repeat { body, .. } = &p.block.stmts[0] else {
            panic!("expected repeat");
        };
        let Stmt::Local { names, .. } = &body.stmts[0] else {
            panic!("expected local");
        };
        assert!(p.is_captured(&names[0].binding));
    }

    // ── Error cases ──────────────────────────────────────────────────────────
    #[test]
    fn missing_then_is_error() {
        let err = parse_err("if true end");
        assert_eq!(err.message, "'then' expected near 'end'");
    }

    #[test]
    fn missing_end_reports_opener() {
        let err = parse_err("while true do\n x = 1\n");
        assert_eq!(err.message, "'end' expected (to close 'while' at line 1) near <eof>");
    }

    #[test]
    fn vararg_outside_vararg_function() {
        assert!(parse_err("function f() return ... end")
            .message
            .contains("cannot use '...' outside a vararg function"));
        assert!(parse("return ...", "t").is_ok());
    }

    #[test]
    fn invalid_statements() {
        assert!(parse_err("x").message.contains("syntax error"));
        assert!(parse_err("f() = 1").message.contains("syntax error"));
        assert!(parse_err("1 + 2").message.contains("unexpected symbol"));
    }
}
