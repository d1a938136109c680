use std::collections::HashSet;
use std::rc::Rc;

use lua_core::{
    Constant, OpCode, Proto, SyntaxError, UpvalueDesc, UpvalueSource, FIELDS_PER_FLUSH, MULTI,
};
use lua_parser::ast::{
    Attrib, BinOp, Binding, Block, CallArgs, Expr, Field, FuncBody, FuncName, Line, LocalId,
    LocalName, Program, ReturnStmt, Stmt, UnOp,
};

use crate::builder::ProtoBuilder;

/// Registers available to one activation. The top of the 8-bit operand
/// space is kept free so that fixed offsets such as the generic `for` call
/// window never overflow.
const MAX_REGISTERS: usize = 250;

/// Upper bound on upvalues and captured locals per function.
const MAX_UPVALUES: usize = 255;

// ── Scope tracking ───────────────────────────────────────────────────────────

/// A local variable that is currently in scope.
#[derive(Debug, Clone)]
struct LocalVar {
    name: String,
    /// Register reserved for the local. For captured locals it only holds
    /// the initial value; every later access goes through `cell`.
    reg: u8,
    cell: Option<u8>,
    constant: bool,
}

/// An upvalue of the function being compiled.
#[derive(Debug, Clone)]
struct UpvalueEntry {
    name: String,
    source: UpvalueSource,
    constant: bool,
}

#[derive(Debug)]
struct BlockScope {
    /// Number of active locals when the block was opened.
    nactvar: usize,
    is_loop: bool,
    /// Pending `break` jumps, patched when the loop is closed.
    breaks: Vec<usize>,
    /// `labels.len()` when the block was opened.
    first_label: usize,
}

#[derive(Debug)]
struct LabelInfo {
    name: String,
    pc: usize,
    line: Line,
}

/// A forward `goto` waiting for its label.
#[derive(Debug)]
struct PendingGoto {
    name: String,
    jump: usize,
    line: Line,
    nactvar: usize,
    /// Block nesting depth the goto currently belongs to.
    depth: usize,
}

/// Compilation state of one function body.
struct FuncState {
    builder: ProtoBuilder,
    actives: Vec<LocalVar>,
    blocks: Vec<BlockScope>,
    upvalues: Vec<UpvalueEntry>,
    labels: Vec<LabelInfo>,
    pending_gotos: Vec<PendingGoto>,
    /// First register not held by a local or a live temporary.
    free_reg: u8,
    active_cells: usize,
    max_cells: usize,
    param_count: u8,
    is_vararg: bool,
    /// Source line attached to emitted instructions.
    line: Line,
}

impl FuncState {
    fn new(builder: ProtoBuilder, is_vararg: bool, line: Line) -> Self {
        Self {
            builder,
            actives: Vec::new(),
            blocks: Vec::new(),
            upvalues: Vec::new(),
            labels: Vec::new(),
            pending_gotos: Vec::new(),
            free_reg: 0,
            active_cells: 0,
            max_cells: 0,
            param_count: 0,
            is_vararg,
            line,
        }
    }

    /// First register above all active locals.
    fn reg_top(&self) -> u8 {
        self.actives.last().map_or(0, |v| v.reg + 1)
    }

    fn finish(self) -> Proto {
        let upvalue_descs = self
            .upvalues
            .into_iter()
            .map(|u| UpvalueDesc {
                name: u.name.into(),
                source: u.source,
            })
            .collect();
        self.builder
            .finish(self.param_count, self.is_vararg, self.max_cells, upvalue_descs)
    }
}

/// How a name resolves from the function being compiled.
#[derive(Debug, Clone, Copy, PartialEq)]
enum VarRef {
    Reg(u8),
    Cell(u8),
    Upvalue(u8),
    Global,
}

/// An assignment target, evaluated before the right-hand side.
#[derive(Debug, Clone)]
enum LValue {
    Var(VarRef, String),
    Index { table: u8, key: u8 },
    Field { table: u8, key: u32 },
}

/// How many values an expression list must produce.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Want {
    /// Everything the last expression yields; the run ends at `top`.
    Multi,
    Fixed(usize),
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum CallKind {
    Normal(u8),
    Tail,
}

// ── Compiler ─────────────────────────────────────────────────────────────────

/// Compiles a parsed [`Program`] into a tree of register-based [`Proto`]s.
pub struct Compiler {
    chunk: Rc<str>,
    captured: HashSet<LocalId>,
    /// Function currently being compiled.
    fs: FuncState,
    /// Enclosing functions, outermost first.
    parents: Vec<FuncState>,
}

impl Compiler {
    pub fn new(chunk: &str) -> Self {
        let chunk: Rc<str> = chunk.into();
        let builder = ProtoBuilder::new(chunk.clone(), 0);
        Self {
            chunk,
            captured: HashSet::new(),
            fs: FuncState::new(builder, true, 0),
            parents: Vec::new(),
        }
    }

    /// Compile the main chunk. Upvalue 0 of the result is `_ENV`.
    pub fn compile(mut self, program: &Program) -> Result<Rc<Proto>, SyntaxError> {
        self.captured = program.captured.clone();
        self.fs.upvalues.push(UpvalueEntry {
            name: "_ENV".to_string(),
            source: UpvalueSource::Upvalue(0),
            constant: false,
        });
        self.enter_block(false);
        self.compile_block_body(&program.block, false)?;
        self.leave_block()?;
        self.emit(OpCode::Return { src: 0, count: 0 });
        Ok(Rc::new(self.fs.finish()))
    }

    fn error(&self, line: Line, message: impl Into<String>) -> SyntaxError {
        SyntaxError::new(&*self.chunk, line, 0, message)
    }

    // ── Emission helpers ──────────────────────────────────────────────────────

    fn emit(&mut self, op: OpCode) -> usize {
        let line = self.fs.line;
        self.fs.builder.emit(op, line)
    }

    fn set_line(&mut self, line: Line) {
        if line > 0 {
            self.fs.line = line;
        }
    }

    fn pc(&self) -> usize {
        self.fs.builder.pc()
    }

    /// Point the jump at `idx` to `target`.
    fn patch_jump(&mut self, idx: usize, target: usize) {
        let offset = target as i32 - (idx as i32 + 1);
        if let Some(op) = self.fs.builder.instruction_mut(idx) {
            op.set_jump_offset(offset);
        }
    }

    fn patch_to_here(&mut self, idx: usize) {
        let here = self.pc();
        self.patch_jump(idx, here);
    }

    fn string_constant(&mut self, s: &str) -> u32 {
        self.fs.builder.add_constant(Constant::Str(s.into()))
    }

    fn number_constant(&mut self, n: f64) -> u32 {
        self.fs.builder.add_constant(Constant::Number(n))
    }

    // ── Registers ─────────────────────────────────────────────────────────────

    fn alloc_reg(&mut self) -> Result<u8, SyntaxError> {
        if self.fs.free_reg as usize >= MAX_REGISTERS {
            return Err(self.error(
                self.fs.line,
                "function or expression needs too many registers",
            ));
        }
        let reg = self.fs.free_reg;
        self.fs.free_reg += 1;
        self.fs.builder.ensure_stack(self.fs.free_reg as usize);
        Ok(reg)
    }

    fn alloc_regs(&mut self, n: usize) -> Result<(), SyntaxError> {
        for _ in 0..n {
            self.alloc_reg()?;
        }
        Ok(())
    }

    fn set_free_reg(&mut self, reg: u8) {
        self.fs.free_reg = reg;
        self.fs.builder.ensure_stack(reg as usize);
    }

    // ── Locals and blocks ─────────────────────────────────────────────────────

    /// Bring `binding` into scope in register `reg`. Captured locals get a
    /// fresh cell initialised from the register.
    fn activate_local(&mut self, binding: &Binding, reg: u8, constant: bool) -> Result<(), SyntaxError> {
        let cell = if self.captured.contains(&binding.id) {
            let cell = self.fs.active_cells;
            if cell >= MAX_UPVALUES {
                return Err(self.error(self.fs.line, "too many captured local variables"));
            }
            self.fs.active_cells += 1;
            self.fs.max_cells = self.fs.max_cells.max(self.fs.active_cells);
            Some(cell as u8)
        } else {
            None
        };
        self.fs.actives.push(LocalVar {
            name: binding.name.clone(),
            reg,
            cell,
            constant,
        });
        if let Some(cell) = cell {
            self.emit(OpCode::NewCell { cell, src: reg });
        }
        Ok(())
    }

    /// Internal loop state that user code cannot name.
    fn add_hidden_local(&mut self, reg: u8) {
        self.fs.actives.push(LocalVar {
            name: "(for state)".to_string(),
            reg,
            cell: None,
            constant: false,
        });
    }

    fn enter_block(&mut self, is_loop: bool) {
        self.fs.blocks.push(BlockScope {
            nactvar: self.fs.actives.len(),
            is_loop,
            breaks: Vec::new(),
            first_label: self.fs.labels.len(),
        });
    }

    /// Close the innermost block and return its pending `break` jumps.
    fn leave_block(&mut self) -> Result<Vec<usize>, SyntaxError> {
        let depth = self.fs.blocks.len();
        let Some(block) = self.fs.blocks.pop() else {
            return Ok(Vec::new());
        };
        self.fs.labels.truncate(block.first_label);

        // Gotos still looking for a label move out to the enclosing block.
        for goto in &mut self.fs.pending_gotos {
            if goto.depth == depth {
                goto.depth -= 1;
                goto.nactvar = goto.nactvar.min(block.nactvar);
            }
        }
        if self.fs.blocks.is_empty() {
            if let Some(goto) = self.fs.pending_gotos.first() {
                return Err(self.error(
                    goto.line,
                    format!(
                        "no visible label '{}' for goto at line {}",
                        goto.name, goto.line
                    ),
                ));
            }
        }

        self.fs.actives.truncate(block.nactvar);
        self.fs.active_cells = self.fs.actives.iter().filter(|v| v.cell.is_some()).count();
        let top = self.fs.reg_top();
        self.set_free_reg(top);
        Ok(block.breaks)
    }

    fn compile_scoped_block(&mut self, block: &Block) -> Result<(), SyntaxError> {
        self.enter_block(false);
        self.compile_block_body(block, false)?;
        self.leave_block()?;
        Ok(())
    }

    /// Compile the statements of `block` into the current scope. Inside a
    /// `repeat` body the `until` condition still follows, so trailing labels
    /// do not count as the end of the block.
    fn compile_block_body(&mut self, block: &Block, is_repeat: bool) -> Result<(), SyntaxError> {
        for (i, stmt) in block.stmts.iter().enumerate() {
            if let Stmt::Label { name, line } = stmt {
                let at_end = !is_repeat
                    && block.ret.is_none()
                    && block.stmts[i + 1..]
                        .iter()
                        .all(|s| matches!(s, Stmt::Label { .. }));
                self.set_line(*line);
                self.compile_label(name, *line, at_end)?;
            } else {
                self.compile_stmt(stmt)?;
            }
            let top = self.fs.reg_top();
            self.set_free_reg(top);
        }
        if let Some(ret) = &block.ret {
            self.compile_return(ret)?;
            let top = self.fs.reg_top();
            self.set_free_reg(top);
        }
        Ok(())
    }

    // ── Name resolution ───────────────────────────────────────────────────────

    fn state(&self, level: usize) -> &FuncState {
        if level == self.parents.len() {
            &self.fs
        } else {
            &self.parents[level]
        }
    }

    fn state_mut(&mut self, level: usize) -> &mut FuncState {
        if level == self.parents.len() {
            &mut self.fs
        } else {
            &mut self.parents[level]
        }
    }

    /// Resolve `name` from the current function; the flag tells whether the
    /// variable was declared `<const>`.
    fn resolve(&mut self, name: &str) -> Result<(VarRef, bool), SyntaxError> {
        let level = self.parents.len();
        Ok(self.resolve_at(level, name)?.unwrap_or((VarRef::Global, false)))
    }

    fn resolve_at(&mut self, level: usize, name: &str) -> Result<Option<(VarRef, bool)>, SyntaxError> {
        let fs = self.state(level);
        if let Some(var) = fs.actives.iter().rev().find(|v| v.name == name) {
            let var_ref = match var.cell {
                Some(cell) => VarRef::Cell(cell),
                None => VarRef::Reg(var.reg),
            };
            return Ok(Some((var_ref, var.constant)));
        }
        if let Some(idx) = fs.upvalues.iter().position(|u| u.name == name) {
            return Ok(Some((VarRef::Upvalue(idx as u8), fs.upvalues[idx].constant)));
        }
        if level == 0 {
            return Ok(None);
        }
        let (source, constant) = match self.resolve_at(level - 1, name)? {
            None | Some((VarRef::Global, _)) => return Ok(None),
            Some((VarRef::Cell(cell), constant)) => (UpvalueSource::Cell(cell), constant),
            Some((VarRef::Upvalue(idx), constant)) => (UpvalueSource::Upvalue(idx), constant),
            Some((VarRef::Reg(_), _)) => {
                return Err(self.error(
                    self.fs.line,
                    format!("local '{name}' is referenced from a nested function but has no cell"),
                ))
            }
        };
        if self.state(level).upvalues.len() >= MAX_UPVALUES {
            return Err(self.error(self.fs.line, "too many upvalues"));
        }
        let fs = self.state_mut(level);
        fs.upvalues.push(UpvalueEntry {
            name: name.to_string(),
            source,
            constant,
        });
        Ok(Some((VarRef::Upvalue((fs.upvalues.len() - 1) as u8), constant)))
    }

    /// Load variable `name` into `dst`.
    fn load_var(&mut self, name: &str, dst: u8) -> Result<(), SyntaxError> {
        match self.resolve(name)?.0 {
            VarRef::Reg(reg) => {
                if reg != dst {
                    self.emit(OpCode::Move { dst, src: reg });
                }
            }
            VarRef::Cell(cell) => {
                self.emit(OpCode::GetCell { dst, cell });
            }
            VarRef::Upvalue(idx) => {
                self.emit(OpCode::GetUpvalue { dst, idx });
            }
            VarRef::Global => {
                let key = self.string_constant(name);
                match self.resolve("_ENV")?.0 {
                    VarRef::Upvalue(upval) => {
                        self.emit(OpCode::GetTabUp { dst, upval, key });
                    }
                    VarRef::Reg(table) => {
                        self.emit(OpCode::GetField { dst, table, key });
                    }
                    VarRef::Cell(cell) => {
                        self.emit(OpCode::GetCell { dst, cell });
                        self.emit(OpCode::GetField { dst, table: dst, key });
                    }
                    VarRef::Global => return Err(self.error(self.fs.line, "'_ENV' is not in scope")),
                }
            }
        }
        Ok(())
    }

    /// Store register `src` into variable `name`.
    fn store_var(&mut self, var: VarRef, name: &str, src: u8) -> Result<(), SyntaxError> {
        match var {
            VarRef::Reg(reg) => {
                if reg != src {
                    self.emit(OpCode::Move { dst: reg, src });
                }
            }
            VarRef::Cell(cell) => {
                self.emit(OpCode::SetCell { cell, src });
            }
            VarRef::Upvalue(idx) => {
                self.emit(OpCode::SetUpvalue { idx, src });
            }
            VarRef::Global => {
                let key = self.string_constant(name);
                match self.resolve("_ENV")?.0 {
                    VarRef::Upvalue(upval) => {
                        self.emit(OpCode::SetTabUp { upval, key, src });
                    }
                    VarRef::Reg(table) => {
                        self.emit(OpCode::SetField { table, key, src });
                    }
                    VarRef::Cell(cell) => {
                        let table = self.alloc_reg()?;
                        self.emit(OpCode::GetCell { dst: table, cell });
                        self.emit(OpCode::SetField { table, key, src });
                    }
                    VarRef::Global => return Err(self.error(self.fs.line, "'_ENV' is not in scope")),
                }
            }
        }
        Ok(())
    }

    /// Resolve an assignment target name, rejecting `<const>` locals.
    fn resolve_target(&mut self, name: &str, line: Line) -> Result<VarRef, SyntaxError> {
        let (var, constant) = self.resolve(name)?;
        if constant {
            return Err(self.error(
                line,
                format!("attempt to assign to const variable '{name}'"),
            ));
        }
        Ok(var)
    }

    // ── Statements ────────────────────────────────────────────────────────────

    fn compile_stmt(&mut self, stmt: &Stmt) -> Result<(), SyntaxError> {
        match stmt {
            Stmt::Local {
                names,
                values,
                line,
            } => {
                self.set_line(*line);
                self.compile_local(names, values, *line)?;
            }

            Stmt::Assign {
                targets,
                values,
                line,
            } => {
                self.set_line(*line);
                self.compile_assign(targets, values, *line)?;
            }

            Stmt::FnCall(expr) => {
                self.set_line(expr.line());
                self.compile_call(expr, CallKind::Normal(0))?;
            }

            Stmt::Do(block) => {
                self.compile_scoped_block(block)?;
            }

            Stmt::While { cond, body, line } => {
                self.set_line(*line);
                let loop_start = self.pc();
                let cond_reg = self.expr_to_any_reg(cond)?;
                let exit_jump = self.emit(OpCode::JumpIfFalse {
                    src: cond_reg,
                    offset: 0,
                });
                let top = self.fs.reg_top();
                self.set_free_reg(top);

                self.enter_block(true);
                self.compile_block_body(body, false)?;
                let breaks = self.leave_block()?;

                let back = self.emit(OpCode::Jump { offset: 0 });
                self.patch_jump(back, loop_start);
                self.patch_to_here(exit_jump);
                for jump in breaks {
                    self.patch_to_here(jump);
                }
            }

            Stmt::Repeat { body, cond, line } => {
                let loop_start = self.pc();
                self.enter_block(true);
                self.compile_block_body(body, true)?;
                // The condition sees the body's locals.
                self.set_line(*line);
                let cond_reg = self.expr_to_any_reg(cond)?;
                let back = self.emit(OpCode::JumpIfFalse {
                    src: cond_reg,
                    offset: 0,
                });
                self.patch_jump(back, loop_start);
                let breaks = self.leave_block()?;
                for jump in breaks {
                    self.patch_to_here(jump);
                }
            }

            Stmt::If {
                cond,
                then,
                elseifs,
                else_,
                line,
            } => {
                self.set_line(*line);
                self.compile_if(cond, then, elseifs, else_.as_ref())?;
            }

            Stmt::NumericFor {
                var,
                start,
                limit,
                step,
                body,
                line,
            } => {
                self.set_line(*line);
                self.compile_numeric_for(var, start, limit, step.as_ref(), body, *line)?;
            }

            Stmt::GenericFor {
                vars,
                iterators,
                body,
                line,
            } => {
                self.set_line(*line);
                self.compile_generic_for(vars, iterators, body, *line)?;
            }

            Stmt::FnDef { name, body, line } => {
                self.set_line(*line);
                self.compile_fn_def(name, body, *line)?;
            }

            Stmt::LocalFn { name, body, line } => {
                self.set_line(*line);
                // The local is in scope inside its own body so it can recurse.
                let reg = self.alloc_reg()?;
                let captured = self.captured.contains(&name.id);
                if captured {
                    self.emit(OpCode::LoadNil { dst: reg, count: 1 });
                }
                self.activate_local(name, reg, false)?;
                let proto_idx = self.compile_function(body)?;
                self.emit(OpCode::Closure {
                    dst: reg,
                    proto_idx,
                });
                if let Some(cell) = self.fs.actives.last().and_then(|v| v.cell) {
                    self.emit(OpCode::SetCell { cell, src: reg });
                }
            }

            Stmt::Goto { label, line } => {
                self.set_line(*line);
                self.compile_goto(label, *line);
            }

            Stmt::Label { name, line } => {
                self.compile_label(name, *line, false)?;
            }

            Stmt::Break(line) => {
                self.set_line(*line);
                let jump = self.emit(OpCode::Jump { offset: 0 });
                match self.fs.blocks.iter_mut().rev().find(|b| b.is_loop) {
                    Some(block) => block.breaks.push(jump),
                    None => {
                        return Err(self.error(*line, format!("break outside a loop at line {line}")))
                    }
                }
            }
        }
        Ok(())
    }

    fn compile_local(&mut self, names: &[LocalName], values: &[Expr], line: Line) -> Result<(), SyntaxError> {
        if let Some(close) = names.iter().find(|n| n.attrib == Some(Attrib::Close)) {
            return Err(self.error(
                line,
                format!(
                    "to-be-closed variable '{}' is not supported",
                    close.binding.name
                ),
            ));
        }
        let base = self.fs.free_reg;
        if values.is_empty() {
            self.alloc_regs(names.len())?;
            self.emit(OpCode::LoadNil {
                dst: base,
                count: names.len() as u8,
            });
        } else {
            self.expr_list_to_regs(values, Want::Fixed(names.len()))?;
        }
        self.set_free_reg(base + names.len() as u8);
        for (i, name) in names.iter().enumerate() {
            let constant = name.attrib == Some(Attrib::Const);
            self.activate_local(&name.binding, base + i as u8, constant)?;
        }
        Ok(())
    }

    fn compile_assign(&mut self, targets: &[Expr], values: &[Expr], line: Line) -> Result<(), SyntaxError> {
        // With several targets, table and key operands are copied so that an
        // assignment to one target cannot change another target's location.
        let isolate = targets.len() > 1;
        let mut lvalues = Vec::with_capacity(targets.len());
        for target in targets {
            lvalues.push(self.lvalue(target, isolate, line)?);
        }

        if targets.len() == 1 && values.len() == 1 {
            let src = self.expr_to_any_reg(&values[0])?;
            self.set_line(line);
            return self.store(&lvalues[0], src);
        }

        let base = self.fs.free_reg;
        self.expr_list_to_regs(values, Want::Fixed(targets.len()))?;
        self.set_line(line);
        for (i, lvalue) in lvalues.iter().enumerate().rev() {
            self.store(lvalue, base + i as u8)?;
        }
        Ok(())
    }

    fn lvalue(&mut self, target: &Expr, isolate: bool, line: Line) -> Result<LValue, SyntaxError> {
        match target {
            Expr::Name(name, line) => {
                let var = self.resolve_target(name, *line)?;
                Ok(LValue::Var(var, name.clone()))
            }
            Expr::Index { table, key, .. } => {
                let table = self.operand_reg(table, isolate)?;
                if let Expr::LuaString(s, _) = key.as_ref() {
                    let key = self.string_constant(s);
                    return Ok(LValue::Field { table, key });
                }
                let key = self.operand_reg(key, isolate)?;
                Ok(LValue::Index { table, key })
            }
            Expr::Field { table, field, .. } => {
                let table = self.operand_reg(table, isolate)?;
                let key = self.string_constant(field);
                Ok(LValue::Field { table, key })
            }
            _ => Err(self.error(line, "syntax error near '='")),
        }
    }

    fn operand_reg(&mut self, expr: &Expr, fresh: bool) -> Result<u8, SyntaxError> {
        if fresh {
            self.expr_to_next_reg(expr)
        } else {
            self.expr_to_any_reg(expr)
        }
    }

    fn store(&mut self, lvalue: &LValue, src: u8) -> Result<(), SyntaxError> {
        match lvalue {
            LValue::Var(var, name) => self.store_var(*var, name, src)?,
            LValue::Index { table, key } => {
                self.emit(OpCode::SetTable {
                    table: *table,
                    key: *key,
                    src,
                });
            }
            LValue::Field { table, key } => {
                self.emit(OpCode::SetField {
                    table: *table,
                    key: *key,
                    src,
                });
            }
        }
        Ok(())
    }

    fn compile_if(
        &mut self,
        cond: &Expr,
        then: &Block,
        elseifs: &[(Expr, Block)],
        else_: Option<&Block>,
    ) -> Result<(), SyntaxError> {
        let mut end_jumps = Vec::new();
        let mut false_jump = self.compile_condition(cond)?;
        self.compile_scoped_block(then)?;

        for (ei_cond, ei_body) in elseifs {
            end_jumps.push(self.emit(OpCode::Jump { offset: 0 }));
            self.patch_to_here(false_jump);
            self.set_line(ei_cond.line());
            false_jump = self.compile_condition(ei_cond)?;
            self.compile_scoped_block(ei_body)?;
        }

        if let Some(else_block) = else_ {
            end_jumps.push(self.emit(OpCode::Jump { offset: 0 }));
            self.patch_to_here(false_jump);
            self.compile_scoped_block(else_block)?;
        } else {
            self.patch_to_here(false_jump);
        }

        for jump in end_jumps {
            self.patch_to_here(jump);
        }
        Ok(())
    }

    /// Evaluate `cond` and emit a jump taken when it is falsy.
    fn compile_condition(&mut self, cond: &Expr) -> Result<usize, SyntaxError> {
        let reg = self.expr_to_any_reg(cond)?;
        let jump = self.emit(OpCode::JumpIfFalse {
            src: reg,
            offset: 0,
        });
        let top = self.fs.reg_top();
        self.set_free_reg(top);
        Ok(jump)
    }

    fn compile_numeric_for(
        &mut self,
        var: &Binding,
        start: &Expr,
        limit: &Expr,
        step: Option<&Expr>,
        body: &Block,
        line: Line,
    ) -> Result<(), SyntaxError> {
        self.enter_block(true);
        let base = self.fs.free_reg;
        self.expr_to_next_reg(start)?;
        self.expr_to_next_reg(limit)?;
        match step {
            Some(step) => {
                self.expr_to_next_reg(step)?;
            }
            None => {
                let reg = self.alloc_reg()?;
                let const_idx = self.number_constant(1.0);
                self.emit(OpCode::LoadConst {
                    dst: reg,
                    const_idx,
                });
            }
        }
        for i in 0..3 {
            self.add_hidden_local(base + i);
        }

        self.set_line(line);
        let prep = self.emit(OpCode::ForPrep { base, offset: 0 });
        let body_start = self.pc();
        let var_reg = self.alloc_reg()?;
        self.activate_local(var, var_reg, false)?;
        self.compile_scoped_block(body)?;

        self.set_line(line);
        let step_jump = self.emit(OpCode::ForLoop { base, offset: 0 });
        self.patch_jump(step_jump, body_start);
        self.patch_to_here(prep);

        for jump in self.leave_block()? {
            self.patch_to_here(jump);
        }
        Ok(())
    }

    /// Layout: `base..base+2` hold the iterator function, state and control
    /// value; the loop variables start at `base+3`, which is also where the
    /// iterator is called each round.
    fn compile_generic_for(
        &mut self,
        vars: &[Binding],
        iterators: &[Expr],
        body: &Block,
        line: Line,
    ) -> Result<(), SyntaxError> {
        self.enter_block(true);
        let base = self.fs.free_reg;
        self.expr_list_to_regs(iterators, Want::Fixed(3))?;
        self.set_free_reg(base + 3);
        for i in 0..3 {
            self.add_hidden_local(base + i);
        }

        let to_call = self.emit(OpCode::Jump { offset: 0 });
        let body_start = self.pc();
        for var in vars {
            let reg = self.alloc_reg()?;
            self.activate_local(var, reg, false)?;
        }
        self.compile_scoped_block(body)?;

        self.patch_to_here(to_call);
        self.fs.builder.ensure_stack(base as usize + 6);
        self.set_line(line);
        for i in 0..3 {
            self.emit(OpCode::Move {
                dst: base + 3 + i,
                src: base + i,
            });
        }
        self.emit(OpCode::Call {
            func: base + 3,
            nargs: 2,
            nresults: vars.len() as u8,
        });
        let back = self.emit(OpCode::TForLoop { base, offset: 0 });
        self.patch_jump(back, body_start);

        for jump in self.leave_block()? {
            self.patch_to_here(jump);
        }
        Ok(())
    }

    fn compile_fn_def(&mut self, name: &FuncName, body: &FuncBody, line: Line) -> Result<(), SyntaxError> {
        let Some((first, rest)) = name.parts.split_first() else {
            return Err(self.error(line, "<name> expected"));
        };

        if rest.is_empty() && name.method.is_none() {
            let var = self.resolve_target(first, line)?;
            let reg = self.alloc_reg()?;
            let proto_idx = self.compile_function(body)?;
            self.emit(OpCode::Closure {
                dst: reg,
                proto_idx,
            });
            return self.store_var(var, first, reg);
        }

        let table = self.alloc_reg()?;
        self.load_var(first, table)?;
        let (last, path) = match &name.method {
            Some(method) => (method.as_str(), rest),
            None => match rest.split_last() {
                Some((last, path)) => (last.as_str(), path),
                None => return Err(self.error(line, "<name> expected")),
            },
        };
        for part in path {
            let key = self.string_constant(part);
            self.emit(OpCode::GetField {
                dst: table,
                table,
                key,
            });
        }
        let func = self.alloc_reg()?;
        let proto_idx = self.compile_function(body)?;
        self.emit(OpCode::Closure {
            dst: func,
            proto_idx,
        });
        let key = self.string_constant(last);
        self.set_line(line);
        self.emit(OpCode::SetField {
            table,
            key,
            src: func,
        });
        Ok(())
    }

    fn compile_return(&mut self, ret: &ReturnStmt) -> Result<(), SyntaxError> {
        self.set_line(ret.line);
        match ret.values.as_slice() {
            [] => {
                self.emit(OpCode::Return { src: 0, count: 0 });
            }
            [call @ (Expr::FnCall { .. } | Expr::MethodCall { .. })] => {
                let func = self.compile_call(call, CallKind::Tail)?;
                self.emit(OpCode::Return {
                    src: func,
                    count: MULTI,
                });
            }
            [single] if !single.is_multi() => {
                let src = self.expr_to_any_reg(single)?;
                self.emit(OpCode::Return { src, count: 1 });
            }
            values => {
                let base = self.fs.free_reg;
                let (count, open) = self.expr_list_to_regs(values, Want::Multi)?;
                self.emit(OpCode::Return {
                    src: base,
                    count: if open { MULTI } else { count as u8 },
                });
            }
        }
        Ok(())
    }

    fn compile_goto(&mut self, name: &str, line: Line) {
        if let Some(label) = self.fs.labels.iter().find(|l| l.name == name) {
            let target = label.pc;
            let jump = self.emit(OpCode::Jump { offset: 0 });
            self.patch_jump(jump, target);
            return;
        }
        let jump = self.emit(OpCode::Jump { offset: 0 });
        self.fs.pending_gotos.push(PendingGoto {
            name: name.to_string(),
            jump,
            line,
            nactvar: self.fs.actives.len(),
            depth: self.fs.blocks.len(),
        });
    }

    /// Define a label and resolve the pending gotos of the current block
    /// that target it. A label that ends its block is treated as lying
    /// outside the block's locals.
    fn compile_label(&mut self, name: &str, line: Line, at_end: bool) -> Result<(), SyntaxError> {
        if let Some(existing) = self.fs.labels.iter().find(|l| l.name == name) {
            return Err(self.error(
                line,
                format!("label '{name}' already defined on line {}", existing.line),
            ));
        }
        let nactvar = match (at_end, self.fs.blocks.last()) {
            (true, Some(block)) => block.nactvar,
            _ => self.fs.actives.len(),
        };
        let pc = self.pc();
        self.fs.labels.push(LabelInfo {
            name: name.to_string(),
            pc,
            line,
        });

        let depth = self.fs.blocks.len();
        let mut i = 0;
        while i < self.fs.pending_gotos.len() {
            let goto = &self.fs.pending_gotos[i];
            if goto.depth != depth || goto.name != name {
                i += 1;
                continue;
            }
            if goto.nactvar < nactvar {
                let local = self.fs.actives[goto.nactvar].name.clone();
                return Err(self.error(
                    goto.line,
                    format!(
                        "<goto {name}> at line {} jumps into the scope of local '{local}'",
                        goto.line
                    ),
                ));
            }
            let goto = self.fs.pending_gotos.remove(i);
            self.patch_jump(goto.jump, pc);
        }
        Ok(())
    }

    // ── Functions ─────────────────────────────────────────────────────────────

    /// Compile a nested function body and register it with the current
    /// function; returns its index in `protos`.
    fn compile_function(&mut self, body: &FuncBody) -> Result<u32, SyntaxError> {
        if body.params.len() >= MAX_REGISTERS {
            return Err(self.error(body.line, "too many parameters"));
        }
        let builder = ProtoBuilder::new(self.chunk.clone(), body.line);
        let child = FuncState::new(builder, body.vararg, body.line);
        let parent = std::mem::replace(&mut self.fs, child);
        self.parents.push(parent);

        let result = self.compile_function_body(body);

        let Some(parent) = self.parents.pop() else {
            return Err(self.error(body.line, "function nesting is unbalanced"));
        };
        let child = std::mem::replace(&mut self.fs, parent);
        result?;
        let proto = Rc::new(child.finish());
        Ok(self.fs.builder.add_proto(proto))
    }

    fn compile_function_body(&mut self, body: &FuncBody) -> Result<(), SyntaxError> {
        self.fs.param_count = body.params.len() as u8;
        self.enter_block(false);
        for param in &body.params {
            let reg = self.alloc_reg()?;
            self.activate_local(param, reg, false)?;
        }
        self.compile_block_body(&body.body, false)?;
        self.set_line(body.end_line);
        self.emit(OpCode::Return { src: 0, count: 0 });
        self.leave_block()?;
        Ok(())
    }

    // ── Expressions ───────────────────────────────────────────────────────────

    /// Register holding the value of `expr`: a local's own register when
    /// possible, otherwise a fresh temporary.
    fn expr_to_any_reg(&mut self, expr: &Expr) -> Result<u8, SyntaxError> {
        if let Expr::Name(name, _) = expr {
            if let VarRef::Reg(reg) = self.resolve(name)?.0 {
                return Ok(reg);
            }
        }
        self.expr_to_next_reg(expr)
    }

    fn expr_to_next_reg(&mut self, expr: &Expr) -> Result<u8, SyntaxError> {
        let reg = self.alloc_reg()?;
        self.expr_to_reg(expr, reg)?;
        Ok(reg)
    }

    /// Compile `expr` so that exactly one value ends up in `dst`.
    fn expr_to_reg(&mut self, expr: &Expr, dst: u8) -> Result<(), SyntaxError> {
        let saved = self.fs.free_reg;
        match expr {
            Expr::Nil(_) => {
                self.emit(OpCode::LoadNil { dst, count: 1 });
            }
            Expr::True(_) => {
                self.emit(OpCode::LoadBool { dst, value: true });
            }
            Expr::False(_) => {
                self.emit(OpCode::LoadBool { dst, value: false });
            }
            Expr::Number(n, _) => {
                let const_idx = self.number_constant(*n);
                self.emit(OpCode::LoadConst { dst, const_idx });
            }
            Expr::LuaString(s, _) => {
                let const_idx = self.string_constant(s);
                self.emit(OpCode::LoadConst { dst, const_idx });
            }
            Expr::Vararg(_) => {
                self.emit(OpCode::VarArg { dst, count: 1 });
            }
            Expr::Name(name, _) => {
                self.load_var(name, dst)?;
            }
            Expr::Paren(inner) => {
                self.expr_to_reg(inner, dst)?;
            }
            Expr::BinOp { op, lhs, rhs, line } => {
                self.compile_binop(*op, lhs, rhs, *line, dst)?;
            }
            Expr::UnOp { op, operand, line } => {
                if let (UnOp::Neg, Expr::Number(n, _)) = (op, operand.as_ref()) {
                    let const_idx = self.number_constant(-n);
                    self.emit(OpCode::LoadConst { dst, const_idx });
                } else {
                    let src = self.expr_to_any_reg(operand)?;
                    self.set_line(*line);
                    self.emit(match op {
                        UnOp::Neg => OpCode::Unm { dst, src },
                        UnOp::Not => OpCode::Not { dst, src },
                        UnOp::Len => OpCode::Len { dst, src },
                        UnOp::BitNot => OpCode::BNot { dst, src },
                    });
                }
            }
            Expr::Index { table, key, line } => {
                let table = self.expr_to_any_reg(table)?;
                if let Expr::LuaString(s, _) = key.as_ref() {
                    let key = self.string_constant(s);
                    self.set_line(*line);
                    self.emit(OpCode::GetField { dst, table, key });
                } else {
                    let key = self.expr_to_any_reg(key)?;
                    self.set_line(*line);
                    self.emit(OpCode::GetTable { dst, table, key });
                }
            }
            Expr::Field { table, field, line } => {
                let table = self.expr_to_any_reg(table)?;
                let key = self.string_constant(field);
                self.set_line(*line);
                self.emit(OpCode::GetField { dst, table, key });
            }
            Expr::FnCall { .. } | Expr::MethodCall { .. } => {
                self.reuse_if_top(dst);
                let base = self.compile_call(expr, CallKind::Normal(1))?;
                if base != dst {
                    self.emit(OpCode::Move { dst, src: base });
                }
            }
            Expr::FnDef(body) => {
                let proto_idx = self.compile_function(body)?;
                self.emit(OpCode::Closure { dst, proto_idx });
            }
            Expr::Table(fields, line) => {
                self.reuse_if_top(dst);
                let base = self.alloc_reg()?;
                self.set_line(*line);
                self.compile_table(fields, base)?;
                if base != dst {
                    self.emit(OpCode::Move { dst, src: base });
                }
            }
        }
        self.set_free_reg(saved);
        Ok(())
    }

    /// Calls and constructors need a window of consecutive registers; when
    /// `dst` is the newest temporary that window can start at `dst` itself.
    fn reuse_if_top(&mut self, dst: u8) {
        if dst as usize + 1 == self.fs.free_reg as usize {
            self.fs.free_reg = dst;
        }
    }

    fn compile_binop(&mut self, op: BinOp, lhs: &Expr, rhs: &Expr, line: Line, dst: u8) -> Result<(), SyntaxError> {
        if matches!(op, BinOp::And | BinOp::Or) {
            self.expr_to_reg(lhs, dst)?;
            let skip = self.emit(if op == BinOp::And {
                OpCode::JumpIfFalse { src: dst, offset: 0 }
            } else {
                OpCode::JumpIfTrue { src: dst, offset: 0 }
            });
            self.expr_to_reg(rhs, dst)?;
            self.patch_to_here(skip);
            return Ok(());
        }

        let l = self.expr_to_any_reg(lhs)?;
        let r = self.expr_to_any_reg(rhs)?;
        self.set_line(line);
        let (lhs, rhs) = (l, r);
        let op = match op {
            BinOp::Add => OpCode::Add { dst, lhs, rhs },
            BinOp::Sub => OpCode::Sub { dst, lhs, rhs },
            BinOp::Mul => OpCode::Mul { dst, lhs, rhs },
            BinOp::Div => OpCode::Div { dst, lhs, rhs },
            BinOp::IDiv => OpCode::IDiv { dst, lhs, rhs },
            BinOp::Mod => OpCode::Mod { dst, lhs, rhs },
            BinOp::Pow => OpCode::Pow { dst, lhs, rhs },
            BinOp::BitAnd => OpCode::BAnd { dst, lhs, rhs },
            BinOp::BitOr => OpCode::BOr { dst, lhs, rhs },
            BinOp::BitXor => OpCode::BXor { dst, lhs, rhs },
            BinOp::Shl => OpCode::Shl { dst, lhs, rhs },
            BinOp::Shr => OpCode::Shr { dst, lhs, rhs },
            BinOp::Concat => OpCode::Concat { dst, lhs, rhs },
            BinOp::Eq => OpCode::Eq { dst, lhs, rhs },
            BinOp::Lt => OpCode::Lt { dst, lhs, rhs },
            BinOp::LtEq => OpCode::Le { dst, lhs, rhs },
            // `a > b` is `b < a`; operands were already evaluated left to right.
            BinOp::Gt => OpCode::Lt {
                dst,
                lhs: rhs,
                rhs: lhs,
            },
            BinOp::GtEq => OpCode::Le {
                dst,
                lhs: rhs,
                rhs: lhs,
            },
            BinOp::NotEq => {
                self.emit(OpCode::Eq { dst, lhs, rhs });
                OpCode::Not { dst, src: dst }
            }
            BinOp::And | BinOp::Or => return Ok(()),
        };
        self.emit(op);
        Ok(())
    }

    /// Compile `exprs` into consecutive registers starting at the current
    /// free register. Returns the number of values placed and whether the
    /// run is open (ends at `top`).
    fn expr_list_to_regs(&mut self, exprs: &[Expr], want: Want) -> Result<(usize, bool), SyntaxError> {
        let last = exprs.len().saturating_sub(1);
        for (i, expr) in exprs.iter().enumerate() {
            if i == last && expr.is_multi() {
                match want {
                    Want::Multi => {
                        self.compile_multi(expr, MULTI)?;
                        return Ok((i, true));
                    }
                    Want::Fixed(n) if i < n => {
                        self.compile_multi(expr, (n - i) as u8)?;
                        return Ok((n, false));
                    }
                    Want::Fixed(_) => {}
                }
            }
            self.expr_to_next_reg(expr)?;
        }
        match want {
            Want::Multi => Ok((exprs.len(), false)),
            Want::Fixed(n) => {
                if exprs.len() < n {
                    let dst = self.fs.free_reg;
                    let missing = n - exprs.len();
                    self.alloc_regs(missing)?;
                    self.emit(OpCode::LoadNil {
                        dst,
                        count: missing as u8,
                    });
                }
                Ok((n, false))
            }
        }
    }

    /// Compile a call or `...` producing `nresults` values (or `MULTI`) at
    /// the current free register.
    fn compile_multi(&mut self, expr: &Expr, nresults: u8) -> Result<u8, SyntaxError> {
        match expr {
            Expr::Vararg(_) => {
                let dst = self.alloc_reg()?;
                self.emit(OpCode::VarArg {
                    dst,
                    count: nresults,
                });
                if nresults != MULTI {
                    self.alloc_regs((nresults as usize).saturating_sub(1))?;
                }
                Ok(dst)
            }
            _ => self.compile_call(expr, CallKind::Normal(nresults)),
        }
    }

    /// Emit a call with the function at a fresh register `base` and its
    /// arguments after it. Results are left at `base`.
    fn compile_call(&mut self, expr: &Expr, kind: CallKind) -> Result<u8, SyntaxError> {
        let base = self.alloc_reg()?;
        let (args, line, extra) = match expr {
            Expr::FnCall { func, args, line } => {
                self.expr_to_reg(func, base)?;
                (args, *line, 0)
            }
            Expr::MethodCall {
                obj,
                method,
                args,
                line,
            } => {
                self.set_free_reg(base + 1);
                let obj = self.expr_to_any_reg(obj)?;
                let key = self.string_constant(method);
                self.set_line(*line);
                self.emit(OpCode::SelfMethod {
                    dst: base,
                    obj,
                    key,
                });
                self.set_free_reg(base + 2);
                (args, *line, 1)
            }
            other => return Err(self.error(other.line(), "function call expected")),
        };

        let (count, open) = match args {
            CallArgs::Exprs(list) => self.expr_list_to_regs(list, Want::Multi)?,
            CallArgs::Table(fields, table_line) => {
                let reg = self.alloc_reg()?;
                self.set_line(*table_line);
                self.compile_table(fields, reg)?;
                (1, false)
            }
            CallArgs::String(s, _) => {
                let dst = self.alloc_reg()?;
                let const_idx = self.string_constant(s);
                self.emit(OpCode::LoadConst { dst, const_idx });
                (1, false)
            }
        };
        let nargs = if open { MULTI } else { (count + extra) as u8 };

        self.set_line(line);
        match kind {
            CallKind::Normal(nresults) => {
                self.emit(OpCode::Call {
                    func: base,
                    nargs,
                    nresults,
                });
                let reserved = if nresults == MULTI { 1 } else { nresults };
                self.set_free_reg(base + reserved);
            }
            CallKind::Tail => {
                self.emit(OpCode::TailCall { func: base, nargs });
                self.set_free_reg(base + 1);
            }
        }
        Ok(base)
    }

    /// Build a table constructor into `dst`, which must be the newest
    /// register. Positional items are staged above it and flushed in batches.
    fn compile_table(&mut self, fields: &[Field], dst: u8) -> Result<(), SyntaxError> {
        let positional = fields.iter().filter(|f| matches!(f, Field::Positional(_))).count();
        let keyed = fields.len() - positional;
        self.emit(OpCode::NewTable {
            dst,
            array_hint: positional.min(u16::MAX as usize) as u16,
            hash_hint: keyed.min(u16::MAX as usize) as u16,
        });

        let mut pending: u32 = 0;
        let mut offset: u32 = 0;
        let last = fields.len().saturating_sub(1);
        for (i, field) in fields.iter().enumerate() {
            match field {
                Field::Positional(expr) if i == last && expr.is_multi() => {
                    self.compile_multi(expr, MULTI)?;
                    self.emit(OpCode::SetList {
                        table: dst,
                        count: MULTI,
                        offset,
                    });
                    pending = 0;
                }
                Field::Positional(expr) => {
                    self.expr_to_next_reg(expr)?;
                    pending += 1;
                    if pending == FIELDS_PER_FLUSH {
                        self.emit(OpCode::SetList {
                            table: dst,
                            count: pending as u8,
                            offset,
                        });
                        offset += pending;
                        pending = 0;
                        self.set_free_reg(dst + 1);
                    }
                }
                Field::Named(name, value) => {
                    let saved = self.fs.free_reg;
                    let src = self.expr_to_any_reg(value)?;
                    let key = self.string_constant(name);
                    self.emit(OpCode::SetField {
                        table: dst,
                        key,
                        src,
                    });
                    self.set_free_reg(saved);
                }
                Field::Index(key, value) => {
                    let saved = self.fs.free_reg;
                    if let Expr::LuaString(s, _) = key {
                        let src = self.expr_to_any_reg(value)?;
                        let key = self.string_constant(s);
                        self.emit(OpCode::SetField {
                            table: dst,
                            key,
                            src,
                        });
                    } else {
                        let key = self.expr_to_any_reg(key)?;
                        let src = self.expr_to_any_reg(value)?;
                        self.emit(OpCode::SetTable {
                            table: dst,
                            key,
                            src,
                        });
                    }
                    self.set_free_reg(saved);
                }
            }
        }
        if pending > 0 {
            self.emit(OpCode::SetList {
                table: dst,
                count: pending as u8,
                offset,
            });
        }
        self.set_free_reg(dst + 1);
        Ok(())
    }
}
