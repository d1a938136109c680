//! The bytecode dispatch loop.
//!
//! Lua-to-Lua calls push a [`CallFrame`](crate::thread::CallFrame) and keep
//! looping instead of recursing on the host stack, which is what lets a
//! coroutine suspend from any call depth.

use std::rc::Rc;

use lua_core::{Constant, OpCode, Proto, UpvalueSource, MULTI};

use crate::closure::{new_upvalue, LuaClosure, LuaFunction};
use crate::error::LuaError;
use crate::ops::{ArithOp, CompareOp};
use crate::table::LuaTable;
use crate::thread::{Called, Exit, Thread};
use crate::value::LuaValue;

fn constant(proto: &Proto, idx: u32) -> LuaValue {
    match proto.constants.get(idx as usize) {
        Some(Constant::Number(n)) => LuaValue::Number(*n),
        Some(Constant::Str(s)) => LuaValue::LuaString(s.clone()),
        None => LuaValue::Nil,
    }
}

fn for_number(v: &LuaValue, what: &str) -> Result<f64, LuaError> {
    match v {
        LuaValue::Number(n) => Ok(*n),
        _ => Err(LuaError::msg(format!("'for' {what} must be a number"))),
    }
}

impl Thread {
    /// Execute instructions until the frame at depth `entry` returns or the
    /// coroutine yields.
    pub(crate) fn dispatch(&mut self, entry: usize) -> Result<Exit, LuaError> {
        'frames: loop {
            let Some(frame) = self.frames.last() else {
                return Ok(Exit::Returned);
            };
            let closure = frame.closure.clone();
            let base = frame.base;
            let fi = self.frames.len() - 1;
            let proto = &*closure.proto;

            macro_rules! r {
                ($reg:expr) => {
                    self.stack[base + $reg as usize]
                };
            }

            macro_rules! jump {
                ($offset:expr) => {{
                    let pc = self.frames[fi].pc as i64 + $offset as i64;
                    self.frames[fi].pc = pc as usize;
                }};
            }

            macro_rules! arith {
                ($op:expr, $dst:expr, $lhs:expr, $rhs:expr) => {{
                    let v = match (&r!($lhs), &r!($rhs)) {
                        (LuaValue::Number(a), LuaValue::Number(b)) if !$op.is_bitwise() => {
                            LuaValue::Number($op.apply(*a, *b))
                        }
                        (a, b) => {
                            let (a, b) = (a.clone(), b.clone());
                            self.arith($op, &a, &b)?
                        }
                    };
                    r!($dst) = v;
                }};
            }

            loop {
                let pc = self.frames[fi].pc;
                let Some(&op) = proto.instructions.get(pc) else {
                    return Err(LuaError::msg("program counter out of range"));
                };
                self.frames[fi].pc = pc + 1;

                match op {
                    OpCode::LoadConst { dst, const_idx } => {
                        r!(dst) = constant(proto, const_idx);
                    }
                    OpCode::LoadNil { dst, count } => {
                        for i in 0..count {
                            r!(dst + i) = LuaValue::Nil;
                        }
                    }
                    OpCode::LoadBool { dst, value } => {
                        r!(dst) = LuaValue::Boolean(value);
                    }
                    OpCode::Move { dst, src } => {
                        let v = r!(src).clone();
                        r!(dst) = v;
                    }

                    // ── Upvalues and cells ────────────────────────────────────
                    OpCode::GetUpvalue { dst, idx } => {
                        let v = closure.upvalues[idx as usize].borrow().clone();
                        r!(dst) = v;
                    }
                    OpCode::SetUpvalue { idx, src } => {
                        let v = r!(src).clone();
                        *closure.upvalues[idx as usize].borrow_mut() = v;
                    }
                    OpCode::GetTabUp { dst, upval, key } => {
                        let env = closure.upvalues[upval as usize].borrow().clone();
                        let v = self.index(&env, &constant(proto, key))?;
                        r!(dst) = v;
                    }
                    OpCode::SetTabUp { upval, key, src } => {
                        let env = closure.upvalues[upval as usize].borrow().clone();
                        let v = r!(src).clone();
                        self.set_index(&env, constant(proto, key), v)?;
                    }
                    OpCode::NewCell { cell, src } => {
                        let fresh = new_upvalue(r!(src).clone());
                        let cells = &mut self.frames[fi].cells;
                        let cell = cell as usize;
                        if cell < cells.len() {
                            cells[cell] = fresh;
                        } else {
                            cells.resize_with(cell, || new_upvalue(LuaValue::Nil));
                            cells.push(fresh);
                        }
                    }
                    OpCode::GetCell { dst, cell } => {
                        let v = self.frames[fi]
                            .cells
                            .get(cell as usize)
                            .map(|c| c.borrow().clone())
                            .unwrap_or_default();
                        r!(dst) = v;
                    }
                    OpCode::SetCell { cell, src } => {
                        let v = r!(src).clone();
                        if let Some(c) = self.frames[fi].cells.get(cell as usize) {
                            *c.borrow_mut() = v;
                        }
                    }

                    // ── Tables ────────────────────────────────────────────────
                    OpCode::NewTable { dst, array_hint, hash_hint } => {
                        let t = LuaTable::with_capacity(array_hint as usize, hash_hint as usize);
                        r!(dst) = LuaValue::Table(t);
                    }
                    OpCode::GetTable { dst, table, key } => {
                        let v = match (&r!(table), &r!(key)) {
                            (LuaValue::Table(t), k) if t.metatable().is_none() => t.get(k),
                            (t, k) => {
                                let (t, k) = (t.clone(), k.clone());
                                self.index(&t, &k)?
                            }
                        };
                        r!(dst) = v;
                    }
                    OpCode::SetTable { table, key, src } => {
                        let (t, k, v) = (r!(table).clone(), r!(key).clone(), r!(src).clone());
                        self.set_index(&t, k, v)?;
                    }
                    OpCode::GetField { dst, table, key } => {
                        let t = r!(table).clone();
                        let v = self.index(&t, &constant(proto, key))?;
                        r!(dst) = v;
                    }
                    OpCode::SetField { table, key, src } => {
                        let (t, v) = (r!(table).clone(), r!(src).clone());
                        self.set_index(&t, constant(proto, key), v)?;
                    }
                    OpCode::SelfMethod { dst, obj, key } => {
                        let o = r!(obj).clone();
                        let method = self.index(&o, &constant(proto, key))?;
                        r!(dst + 1) = o;
                        r!(dst) = method;
                    }
                    OpCode::SetList { table, count, offset } => {
                        let first = base + table as usize + 1;
                        let n = if count == MULTI {
                            self.top.saturating_sub(first)
                        } else {
                            count as usize
                        };
                        if let LuaValue::Table(t) = &r!(table) {
                            t.set_list(offset as usize + 1, self.stack[first..first + n].iter().cloned());
                        }
                        if count == MULTI {
                            self.restore_extent();
                        }
                    }

                    // ── Arithmetic ────────────────────────────────────────────
                    OpCode::Add { dst, lhs, rhs } => arith!(ArithOp::Add, dst, lhs, rhs),
                    OpCode::Sub { dst, lhs, rhs } => arith!(ArithOp::Sub, dst, lhs, rhs),
                    OpCode::Mul { dst, lhs, rhs } => arith!(ArithOp::Mul, dst, lhs, rhs),
                    OpCode::Div { dst, lhs, rhs } => arith!(ArithOp::Div, dst, lhs, rhs),
                    OpCode::Mod { dst, lhs, rhs } => arith!(ArithOp::Mod, dst, lhs, rhs),
                    OpCode::Pow { dst, lhs, rhs } => arith!(ArithOp::Pow, dst, lhs, rhs),
                    OpCode::IDiv { dst, lhs, rhs } => arith!(ArithOp::IDiv, dst, lhs, rhs),
                    OpCode::BAnd { dst, lhs, rhs } => arith!(ArithOp::BAnd, dst, lhs, rhs),
                    OpCode::BOr { dst, lhs, rhs } => arith!(ArithOp::BOr, dst, lhs, rhs),
                    OpCode::BXor { dst, lhs, rhs } => arith!(ArithOp::BXor, dst, lhs, rhs),
                    OpCode::Shl { dst, lhs, rhs } => arith!(ArithOp::Shl, dst, lhs, rhs),
                    OpCode::Shr { dst, lhs, rhs } => arith!(ArithOp::Shr, dst, lhs, rhs),
                    OpCode::Unm { dst, src } => {
                        let v = match &r!(src) {
                            LuaValue::Number(n) => LuaValue::Number(-n),
                            other => {
                                let other = other.clone();
                                self.arith(ArithOp::Unm, &other, &other)?
                            }
                        };
                        r!(dst) = v;
                    }
                    OpCode::BNot { dst, src } => {
                        let v = r!(src).clone();
                        r!(dst) = self.arith(ArithOp::BNot, &v, &v)?;
                    }

                    // ── Comparison ────────────────────────────────────────────
                    OpCode::Eq { dst, lhs, rhs } => {
                        let (a, b) = (r!(lhs).clone(), r!(rhs).clone());
                        r!(dst) = LuaValue::Boolean(self.equals(&a, &b)?);
                    }
                    OpCode::Lt { dst, lhs, rhs } => {
                        let v = match (&r!(lhs), &r!(rhs)) {
                            (LuaValue::Number(a), LuaValue::Number(b)) => a < b,
                            (a, b) => {
                                let (a, b) = (a.clone(), b.clone());
                                self.compare(CompareOp::Lt, &a, &b)?
                            }
                        };
                        r!(dst) = LuaValue::Boolean(v);
                    }
                    OpCode::Le { dst, lhs, rhs } => {
                        let v = match (&r!(lhs), &r!(rhs)) {
                            (LuaValue::Number(a), LuaValue::Number(b)) => a <= b,
                            (a, b) => {
                                let (a, b) = (a.clone(), b.clone());
                                self.compare(CompareOp::Le, &a, &b)?
                            }
                        };
                        r!(dst) = LuaValue::Boolean(v);
                    }

                    // ── Logical / misc ────────────────────────────────────────
                    OpCode::Not { dst, src } => {
                        let v = !r!(src).is_truthy();
                        r!(dst) = LuaValue::Boolean(v);
                    }
                    OpCode::Len { dst, src } => {
                        let v = r!(src).clone();
                        r!(dst) = self.length(&v)?;
                    }
                    OpCode::Concat { dst, lhs, rhs } => {
                        let (a, b) = (r!(lhs).clone(), r!(rhs).clone());
                        r!(dst) = self.concat(&a, &b)?;
                    }

                    // ── Control flow ──────────────────────────────────────────
                    OpCode::Jump { offset } => jump!(offset),
                    OpCode::JumpIfFalse { src, offset } => {
                        if !r!(src).is_truthy() {
                            jump!(offset);
                        }
                    }
                    OpCode::JumpIfTrue { src, offset } => {
                        if r!(src).is_truthy() {
                            jump!(offset);
                        }
                    }

                    // ── Calls ─────────────────────────────────────────────────
                    OpCode::Call { func, nargs, nresults } => {
                        let func = base + func as usize;
                        let nargs = if nargs == MULTI {
                            self.top.saturating_sub(func + 1)
                        } else {
                            nargs as usize
                        };
                        match self.precall(func, nargs, nresults, func, None)? {
                            Called::Lua => continue 'frames,
                            Called::Native => self.restore_extent(),
                            Called::Yield(values) => return Ok(Exit::Yielded(values)),
                        }
                    }
                    OpCode::TailCall { func, nargs } => {
                        let func = base + func as usize;
                        let nargs = if nargs == MULTI {
                            self.top.saturating_sub(func + 1)
                        } else {
                            nargs as usize
                        };
                        if let LuaValue::Function(LuaFunction::Lua(callee)) = &self.stack[func] {
                            let callee = callee.clone();
                            if !self.tail_call(callee, func, nargs)? {
                                if self.frames.len() <= entry {
                                    return Ok(Exit::Returned);
                                }
                                self.restore_extent();
                            }
                            continue 'frames;
                        }
                        match self.precall(func, nargs, MULTI, func, None)? {
                            Called::Lua => continue 'frames,
                            Called::Native => self.restore_extent(),
                            Called::Yield(values) => return Ok(Exit::Yielded(values)),
                        }
                    }
                    OpCode::Return { src, count } => {
                        let first = base + src as usize;
                        let n = if count == MULTI {
                            self.top.saturating_sub(first)
                        } else {
                            count as usize
                        };
                        let Some(frame) = self.frames.pop() else {
                            return Err(LuaError::msg("return without a frame"));
                        };
                        if frame.catch.is_some() {
                            self.stack[frame.ret_dst] = LuaValue::Boolean(true);
                            let wanted = match frame.nresults {
                                MULTI => MULTI,
                                k => k.saturating_sub(1),
                            };
                            self.move_results(first, n, frame.ret_dst + 1, wanted);
                        } else {
                            self.move_results(first, n, frame.ret_dst, frame.nresults);
                        }
                        if self.frames.len() <= entry {
                            return Ok(Exit::Returned);
                        }
                        self.restore_extent();
                        continue 'frames;
                    }

                    // ── Loops ─────────────────────────────────────────────────
                    OpCode::ForPrep { base: b, offset } => {
                        let init = for_number(&r!(b), "initial value")?;
                        let limit = for_number(&r!(b + 1), "limit")?;
                        let step = for_number(&r!(b + 2), "step")?;
                        if step == 0.0 {
                            return Err(LuaError::msg("'for' step is zero"));
                        }
                        if (step > 0.0 && init > limit) || (step < 0.0 && init < limit) {
                            jump!(offset);
                        } else {
                            r!(b) = LuaValue::Number(init);
                            r!(b + 1) = LuaValue::Number(limit);
                            r!(b + 2) = LuaValue::Number(step);
                            r!(b + 3) = LuaValue::Number(init);
                        }
                    }
                    OpCode::ForLoop { base: b, offset } => {
                        if let (LuaValue::Number(idx), LuaValue::Number(limit), LuaValue::Number(step)) =
                            (&r!(b), &r!(b + 1), &r!(b + 2))
                        {
                            let next = idx + step;
                            let more = if *step > 0.0 { next <= *limit } else { next >= *limit };
                            if more {
                                r!(b) = LuaValue::Number(next);
                                r!(b + 3) = LuaValue::Number(next);
                                jump!(offset);
                            }
                        }
                    }
                    OpCode::TForLoop { base: b, offset } => {
                        let control = r!(b + 3).clone();
                        if !control.is_nil() {
                            r!(b + 2) = control;
                            jump!(offset);
                        }
                    }

                    // ── Closures and varargs ──────────────────────────────────
                    OpCode::Closure { dst, proto_idx } => {
                        let Some(child) = proto.protos.get(proto_idx as usize).cloned() else {
                            return Err(LuaError::msg("missing function prototype"));
                        };
                        let frame = &self.frames[fi];
                        let upvalues = child
                            .upvalue_descs
                            .iter()
                            .map(|desc| {
                                let cell = match desc.source {
                                    UpvalueSource::Cell(i) => frame.cells.get(i as usize),
                                    UpvalueSource::Upvalue(i) => closure.upvalues.get(i as usize),
                                };
                                cell.cloned().unwrap_or_else(|| new_upvalue(LuaValue::Nil))
                            })
                            .collect();
                        let f = LuaClosure::new(child, upvalues);
                        r!(dst) = LuaValue::Function(LuaFunction::Lua(Rc::new(f)));
                    }
                    OpCode::VarArg { dst, count } => {
                        let start = base + dst as usize;
                        let n = self.frames[fi].varargs.len();
                        let wanted = if count == MULTI { n } else { count as usize };
                        if start + wanted > self.config().max_stack_slots {
                            return Err(LuaError::StackOverflow);
                        }
                        if self.stack.len() < start + wanted {
                            self.stack.resize(start + wanted, LuaValue::Nil);
                        }
                        for i in 0..wanted {
                            self.stack[start + i] =
                                self.frames[fi].varargs.get(i).cloned().unwrap_or_default();
                        }
                        if count == MULTI {
                            self.top = start + n;
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{LuaValue, Vm};

    fn run(src: &str) -> Vec<LuaValue> {
        Vm::new().exec(src, "test").unwrap()
    }

    fn run1(src: &str) -> LuaValue {
        run(src).into_iter().next().unwrap_or_default()
    }

    fn num(n: f64) -> LuaValue {
        LuaValue::Number(n)
    }

    #[test]
    fn returns_literals() {
        assert_eq!(run1("return 42"), num(42.0));
        assert_eq!(run1("return 'hi'"), LuaValue::from("hi"));
        assert_eq!(run1("return nil"), LuaValue::Nil);
        assert_eq!(run("return true, false"), vec![LuaValue::Boolean(true), LuaValue::Boolean(false)]);
    }

    #[test]
    fn arithmetic_and_precedence() {
        assert_eq!(run1("return 1 + 2 * 3"), num(7.0));
        assert_eq!(run1("return (1 + 2) * 3"), num(9.0));
        assert_eq!(run1("return 2 ^ 3 ^ 2"), num(512.0));
        assert_eq!(run1("return -2 ^ 2"), num(-4.0));
        assert_eq!(run1("return 7 // 2, 7 % -3"), num(3.0));
        assert_eq!(run("return 7 // 2, 7 % -3")[1], num(-2.0));
        assert_eq!(run1("return '10' + 5"), num(15.0));
    }

    #[test]
    fn comparisons_and_logic() {
        assert_eq!(run1("return 1 < 2 and 'yes' or 'no'"), LuaValue::from("yes"));
        assert_eq!(run1("return 3 >= 4"), LuaValue::Boolean(false));
        assert_eq!(run1("return 'a' < 'b'"), LuaValue::Boolean(true));
        assert_eq!(run1("return 1 == '1'"), LuaValue::Boolean(false));
        assert_eq!(run1("return not nil"), LuaValue::Boolean(true));
        assert_eq!(run1("return nil or false"), LuaValue::Boolean(false));
    }

    #[test]
    fn loops() {
        assert_eq!(run1("local s = 0 for i = 1, 10 do s = s + i end return s"), num(55.0));
        assert_eq!(run1("local s = 0 for i = 10, 1, -3 do s = s + i end return s"), num(22.0));
        assert_eq!(run1("local n = 0 while n < 5 do n = n + 1 end return n"), num(5.0));
        assert_eq!(run1("local n = 0 repeat local m = n n = m + 2 until m >= 4 return n"), num(6.0));
    }

    #[test]
    fn for_loop_rejects_zero_step() {
        let err = Vm::new().exec("for i = 1, 2, 0 do end", "test").unwrap_err();
        assert_eq!(err.to_string(), "test:1: 'for' step is zero");
    }

    #[test]
    fn varargs_expand_in_last_position() {
        assert_eq!(run1("local function f(...) return select('#', ...) end return f(1, nil, 3)"), num(3.0));
        assert_eq!(run("local function f(...) return ... end return f(1, 2)"), vec![num(1.0), num(2.0)]);
        assert_eq!(run1("local function f(...) local a, b = ... return b end return f(1, 2)"), num(2.0));
        assert_eq!(run1("local function f(...) return #{...} end return f(1, 2, 3, 4)"), num(4.0));
    }

    #[test]
    fn multiple_results_adjust() {
        let src = "local function two() return 1, 2 end
                   local t = {two(), two()}
                   local a, b, c = two()
                   return #t, c, (two())";
        assert_eq!(run(src), vec![num(3.0), LuaValue::Nil, num(1.0)]);
    }

    #[test]
    fn closures_capture_loop_variables_per_iteration() {
        let src = "local fs = {}
                   for i = 1, 3 do fs[i] = function() return i end end
                   return fs[1]() + fs[2]() + fs[3]()";
        assert_eq!(run1(src), num(6.0));
    }

    #[test]
    fn deep_recursion_uses_vm_frames() {
        let src = "local function depth(n) if n == 0 then return 0 end return 1 + depth(n - 1) end
                   return depth(10000)";
        assert_eq!(run1(src), num(10000.0));
    }

    #[test]
    fn tail_calls_do_not_grow_the_frame_stack() {
        let src = "local function loop(n) if n == 0 then return 'done' end return loop(n - 1) end
                   return loop(1000000)";
        assert_eq!(run1(src), LuaValue::from("done"));
    }

    #[test]
    fn goto_continue() {
        let src = "local s = 0
                   for i = 1, 5 do
                     if i % 2 == 0 then goto continue end
                     s = s + i
                     ::continue::
                   end
                   return s";
        assert_eq!(run1(src), num(9.0));
    }
}
