use std::collections::HashMap;
use std::rc::Rc;

use lua_core::{Constant, OpCode, Proto, UpvalueDesc};

/// Key used to deduplicate constants: numbers by bit pattern, strings by content.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum ConstKey {
    Number(u64),
    Str(Rc<str>),
}

/// Mutable builder for a [`Proto`] during compilation.
#[derive(Debug)]
pub struct ProtoBuilder {
    proto: Proto,
    constant_index: HashMap<ConstKey, u32>,
}

impl ProtoBuilder {
    pub fn new(source: Rc<str>, line_defined: u32) -> Self {
        let mut proto = Proto::new(source);
        proto.line_defined = line_defined;
        Self {
            proto,
            constant_index: HashMap::new(),
        }
    }

    /// Append an instruction tagged with its source line; returns its index.
    pub fn emit(&mut self, op: OpCode, line: u32) -> usize {
        self.proto.instructions.push(op);
        self.proto.lines.push(line);
        self.proto.instructions.len() - 1
    }

    /// Index the next emitted instruction will get.
    pub fn pc(&self) -> usize {
        self.proto.instructions.len()
    }

    pub fn instruction_mut(&mut self, idx: usize) -> Option<&mut OpCode> {
        self.proto.instructions.get_mut(idx)
    }

    pub fn add_constant(&mut self, value: Constant) -> u32 {
        let key = match &value {
            Constant::Number(n) => ConstKey::Number(n.to_bits()),
            Constant::Str(s) => ConstKey::Str(s.clone()),
        };
        if let Some(&idx) = self.constant_index.get(&key) {
            return idx;
        }
        let idx = self.proto.constants.len() as u32;
        self.proto.constants.push(value);
        self.constant_index.insert(key, idx);
        idx
    }

    pub fn add_proto(&mut self, proto: Rc<Proto>) -> u32 {
        let idx = self.proto.protos.len() as u32;
        self.proto.protos.push(proto);
        idx
    }

    /// Grow the register window so that `slots` registers are available.
    pub fn ensure_stack(&mut self, slots: usize) {
        self.proto.max_stack = self.proto.max_stack.max(slots);
    }

    pub fn finish(
        mut self,
        param_count: u8,
        is_vararg: bool,
        num_cells: usize,
        upvalue_descs: Vec<UpvalueDesc>,
    ) -> Proto {
        self.proto.param_count = param_count;
        self.proto.is_vararg = is_vararg;
        self.proto.num_cells = num_cells;
        self.proto.upvalue_descs = upvalue_descs;
        self.proto.max_stack = self.proto.max_stack.max(param_count as usize);
        self.proto
    }
}
