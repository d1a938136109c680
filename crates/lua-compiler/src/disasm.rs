use lua_core::{OpCode, Proto, UpvalueSource, MULTI};

/// Disassemble a [`Proto`] into a human-readable string.
///
/// Recursively disassembles any nested `protos[]` so you see the full picture.
pub fn disassemble(proto: &Proto) -> String {
    let mut out = String::new();
    disasm_proto(proto, &mut out);
    out
}

fn disasm_proto(proto: &Proto, out: &mut String) {
    let name = if proto.source.is_empty() { "?" } else { &*proto.source };
    let kind = if proto.line_defined == 0 {
        "main".to_string()
    } else {
        format!("function at line {}", proto.line_defined)
    };
    out.push_str(&format!(
        "== {name}:{kind} ==  (params={}, vararg={}, slots={}, cells={})\n",
        proto.param_count, proto.is_vararg, proto.max_stack, proto.num_cells
    ));

    if !proto.constants.is_empty() {
        out.push_str("constants:\n");
        for (i, c) in proto.constants.iter().enumerate() {
            out.push_str(&format!("  [K{i}]  {c}\n"));
        }
    }

    if !proto.upvalue_descs.is_empty() {
        out.push_str("upvalues:\n");
        for (i, uv) in proto.upvalue_descs.iter().enumerate() {
            let from = match uv.source {
                UpvalueSource::Cell(cell) => format!("cell {cell}"),
                UpvalueSource::Upvalue(idx) => format!("upvalue {idx}"),
            };
            out.push_str(&format!("  [U{i}]  {}  ({from})\n", uv.name));
        }
    }

    out.push_str("instructions:\n");
    for (i, op) in proto.instructions.iter().enumerate() {
        out.push_str(&format!(
            "  {i:04}  [{:>3}]  {:<9} {}\n",
            proto.line_at(i),
            op.name(),
            operands(i, op, proto)
        ));
    }

    for (i, sub) in proto.protos.iter().enumerate() {
        out.push('\n');
        out.push_str(&format!("-- sub-proto {i} --\n"));
        disasm_proto(sub, out);
    }
}

fn count(n: u8) -> String {
    if n == MULTI {
        "multi".to_string()
    } else {
        n.to_string()
    }
}

fn constant(proto: &Proto, idx: u32) -> String {
    proto
        .constants
        .get(idx as usize)
        .map(|c| format!("K{idx}({c})"))
        .unwrap_or_else(|| format!("K{idx}(?)"))
}

/// Absolute target of a relative jump at `pc`.
fn target(pc: usize, offset: i32) -> String {
    format!("-> {:04}", pc as i64 + 1 + offset as i64)
}

fn operands(pc: usize, op: &OpCode, proto: &Proto) -> String {
    match *op {
        OpCode::LoadConst { dst, const_idx } => format!("r{dst} {}", constant(proto, const_idx)),
        OpCode::LoadNil { dst, count } => format!("r{dst} x{count}"),
        OpCode::LoadBool { dst, value } => format!("r{dst} {value}"),
        OpCode::Move { dst, src } => format!("r{dst} r{src}"),

        OpCode::GetUpvalue { dst, idx } => format!("r{dst} U{idx}"),
        OpCode::SetUpvalue { idx, src } => format!("U{idx} r{src}"),
        OpCode::GetTabUp { dst, upval, key } => {
            format!("r{dst} U{upval}[{}]", constant(proto, key))
        }
        OpCode::SetTabUp { upval, key, src } => {
            format!("U{upval}[{}] r{src}", constant(proto, key))
        }
        OpCode::NewCell { cell, src } => format!("c{cell} r{src}"),
        OpCode::GetCell { dst, cell } => format!("r{dst} c{cell}"),
        OpCode::SetCell { cell, src } => format!("c{cell} r{src}"),

        OpCode::NewTable {
            dst,
            array_hint,
            hash_hint,
        } => format!("r{dst} array={array_hint} hash={hash_hint}"),
        OpCode::GetTable { dst, table, key } => format!("r{dst} r{table}[r{key}]"),
        OpCode::SetTable { table, key, src } => format!("r{table}[r{key}] r{src}"),
        OpCode::GetField { dst, table, key } => {
            format!("r{dst} r{table}[{}]", constant(proto, key))
        }
        OpCode::SetField { table, key, src } => {
            format!("r{table}[{}] r{src}", constant(proto, key))
        }
        OpCode::SelfMethod { dst, obj, key } => {
            format!("r{dst} r{obj}:{}", constant(proto, key))
        }
        OpCode::SetList {
            table,
            count: n,
            offset,
        } => format!("r{table} {} from {}", count(n), offset + 1),

        OpCode::Add { dst, lhs, rhs }
        | OpCode::Sub { dst, lhs, rhs }
        | OpCode::Mul { dst, lhs, rhs }
        | OpCode::Div { dst, lhs, rhs }
        | OpCode::Mod { dst, lhs, rhs }
        | OpCode::Pow { dst, lhs, rhs }
        | OpCode::IDiv { dst, lhs, rhs }
        | OpCode::BAnd { dst, lhs, rhs }
        | OpCode::BOr { dst, lhs, rhs }
        | OpCode::BXor { dst, lhs, rhs }
        | OpCode::Shl { dst, lhs, rhs }
        | OpCode::Shr { dst, lhs, rhs }
        | OpCode::Eq { dst, lhs, rhs }
        | OpCode::Lt { dst, lhs, rhs }
        | OpCode::Le { dst, lhs, rhs }
        | OpCode::Concat { dst, lhs, rhs } => format!("r{dst} r{lhs} r{rhs}"),

        OpCode::Unm { dst, src }
        | OpCode::BNot { dst, src }
        | OpCode::Not { dst, src }
        | OpCode::Len { dst, src } => format!("r{dst} r{src}"),

        OpCode::Jump { offset } => target(pc, offset),
        OpCode::JumpIfFalse { src, offset } | OpCode::JumpIfTrue { src, offset } => {
            format!("r{src} {}", target(pc, offset))
        }

        OpCode::Call {
            func,
            nargs,
            nresults,
        } => format!("r{func} args={} results={}", count(nargs), count(nresults)),
        OpCode::TailCall { func, nargs } => format!("r{func} args={}", count(nargs)),
        OpCode::Return { src, count: n } => format!("r{src} {}", count(n)),

        OpCode::ForPrep { base, offset }
        | OpCode::ForLoop { base, offset }
        | OpCode::TForLoop { base, offset } => format!("r{base} {}", target(pc, offset)),

        OpCode::Closure { dst, proto_idx } => format!("r{dst} P{proto_idx}"),
        OpCode::VarArg { dst, count: n } => format!("r{dst} {}", count(n)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listing_shows_constants_and_jumps() {
        let proto = crate::compile("local x = 1 while x < 3 do x = x + 1 end print(x)", "demo").unwrap();
        let text = disassemble(&proto);
        assert!(text.starts_with("== demo:main =="));
        assert!(text.contains("[K0]  1"));
        assert!(text.contains("JMPIFNOT"));
        assert!(text.contains("GETTABUP"));
        assert!(text.contains("\"print\""));
        assert!(text.contains("[U0]  _ENV"));
    }

    #[test]
    fn listing_recurses_into_nested_functions() {
        let proto = crate::compile("local a = 1\nreturn function() return a end", "demo").unwrap();
        let text = disassemble(&proto);
        assert!(text.contains("-- sub-proto 0 --"));
        assert!(text.contains("function at line 2"));
        assert!(text.contains("(cell 0)"));
    }
}
