use super::op::{EXT, OpCode, Operand};
use crate::lang::node::Span;
use crate::lang::value::Value;
use crate::regalloc::{LayoutError, RegisterId, RegisterLayout};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Constant-pool entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Constant {
    Nil,
    Bool(bool),
    I32(i32),
    I64(i64),
    U32(u32),
    U64(u64),
    F64(f64),
    Str(String),
    Function(u16),
}

impl Constant {
    pub fn to_value(&self) -> Value {
        match self {
            Constant::Nil => Value::Nil,
            Constant::Bool(b) => Value::Bool(*b),
            Constant::I32(n) => Value::I32(*n),
            Constant::I64(n) => Value::I64(*n),
            Constant::U32(n) => Value::U32(*n),
            Constant::U64(n) => Value::U64(*n),
            Constant::F64(n) => Value::F64(*n),
            Constant::Str(s) => Value::string(s),
            Constant::Function(index) => Value::Function(*index),
        }
    }
}

/// One encoded operand, as handed to `Chunk::emit`.
#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    Reg(RegisterId),
    Const(u16),
    Func(u16),
    Imm32(i32),
    Imm64(u64),
    Byte(u8),
    Args(Vec<RegisterId>),
    Captures(Vec<(bool, RegisterId)>),
}

impl Arg {
    fn needs_extended(&self) -> bool {
        match self {
            Arg::Reg(r) => r.is_extended(),
            Arg::Args(regs) => regs.iter().any(|r| r.is_extended()),
            Arg::Captures(caps) => caps.iter().any(|(_, r)| r.is_extended()),
            _ => false,
        }
    }
}

/// Position of a 16-bit jump placeholder awaiting its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JumpPatch {
    at: usize,
}

/// Source position of the instruction starting at `offset`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpanEntry {
    pub offset: u32,
    pub span: Span,
}

/// A single compiled instruction stream.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub code: Vec<u8>,
    pub constants: Vec<Constant>,
    pub spans: Vec<SpanEntry>,
}

impl Chunk {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    /// Intern a constant; `None` once the pool outgrows its u16 index.
    pub fn add_constant(&mut self, constant: Constant) -> Option<u16> {
        if let Some(i) = self.constants.iter().position(|c| *c == constant) {
            return Some(i as u16);
        }
        let index = u16::try_from(self.constants.len()).ok()?;
        self.constants.push(constant);
        Some(index)
    }

    /// Encode one instruction. The extended prefix is added when any register
    /// operand is above 255. Returns the offset of the first byte.
    pub fn emit(&mut self, op: OpCode, args: &[Arg], span: Span) -> usize {
        debug_assert_eq!(
            op.operands()
                .iter()
                .filter(|o| !matches!(o, Operand::Jump | Operand::Loop))
                .count(),
            args.len(),
            "operand count mismatch for {}",
            op.mnemonic()
        );
        let start = self.code.len();
        self.mark_span(start, span);

        let extended = args.iter().any(Arg::needs_extended);
        if extended {
            self.code.push(EXT);
        }
        self.code.push(op as u8);

        for arg in args {
            match arg {
                Arg::Reg(r) => self.push_reg(*r, extended),
                Arg::Const(i) | Arg::Func(i) => self.push_u16(*i),
                Arg::Imm32(n) => self.code.extend_from_slice(&n.to_be_bytes()),
                Arg::Imm64(n) => self.code.extend_from_slice(&n.to_be_bytes()),
                Arg::Byte(b) => self.code.push(*b),
                Arg::Args(regs) => {
                    self.code.push(regs.len() as u8);
                    for r in regs {
                        self.push_reg(*r, extended);
                    }
                }
                Arg::Captures(caps) => {
                    self.code.push(caps.len() as u8);
                    for (is_local, r) in caps {
                        self.code.push(*is_local as u8);
                        self.push_reg(*r, extended);
                    }
                }
            }
        }
        start
    }

    /// Emit a forward jump (`JUMP`, `JUMP_IF_NOT`, `TRY_BEGIN`) whose offset is
    /// the trailing operand, with a placeholder to patch later.
    pub fn emit_jump(&mut self, op: OpCode, regs: &[RegisterId], span: Span) -> JumpPatch {
        let args: Vec<Arg> = regs.iter().map(|r| Arg::Reg(*r)).collect();
        self.emit(op, &args, span);
        let at = self.code.len();
        self.push_u16(0xFFFF);
        JumpPatch { at }
    }

    /// Point a placeholder at the current end of code. `Err` carries the
    /// distance when it does not fit in 16 bits.
    pub fn patch_jump(&mut self, patch: JumpPatch) -> Result<(), usize> {
        let distance = self.code.len() - (patch.at + 2);
        let offset = u16::try_from(distance).map_err(|_| distance)?;
        let [hi, lo] = offset.to_be_bytes();
        self.code[patch.at] = hi;
        self.code[patch.at + 1] = lo;
        Ok(())
    }

    /// Emit `LOOP` back to `loop_start`. `Err` carries the distance when it
    /// does not fit in 16 bits.
    pub fn emit_loop(&mut self, loop_start: usize, span: Span) -> Result<(), usize> {
        // opcode + u16 offset
        let distance = self.code.len() + 3 - loop_start;
        let offset = u16::try_from(distance).map_err(|_| distance)?;
        self.emit(OpCode::Loop, &[], span);
        self.push_u16(offset);
        Ok(())
    }

    pub fn span_at(&self, offset: usize) -> Option<Span> {
        let idx = self
            .spans
            .partition_point(|e| e.offset as usize <= offset)
            .checked_sub(1)?;
        Some(self.spans[idx].span)
    }

    fn mark_span(&mut self, offset: usize, span: Span) {
        if span == Span::default() || self.spans.last().is_some_and(|e| e.span == span) {
            return;
        }
        self.spans.push(SpanEntry {
            offset: offset as u32,
            span,
        });
    }

    fn push_reg(&mut self, r: RegisterId, extended: bool) {
        if extended {
            self.push_u16(r.0);
        } else {
            self.code.push(r.0 as u8);
        }
    }

    fn push_u16(&mut self, n: u16) {
        self.code.extend_from_slice(&n.to_be_bytes());
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionProto {
    pub name: String,
    pub arity: u8,
    pub upvalue_count: u8,
    pub chunk: Chunk,
}

/// Which instruction stream a frame is executing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChunkRef {
    Main,
    Function(u16),
}

#[derive(Debug, Error)]
pub enum ProgramError {
    #[error("invalid program encoding: {0}")]
    Encoding(#[from] postcard::Error),

    #[error("invalid register layout: {0}")]
    Layout(#[from] LayoutError),
}

/// A compiled program: top-level code plus every function body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Program {
    pub layout: RegisterLayout,
    pub main: Chunk,
    pub functions: Vec<FunctionProto>,
}

impl Program {
    pub fn new(layout: RegisterLayout) -> Self {
        Program {
            layout,
            main: Chunk::new(),
            functions: Vec::new(),
        }
    }

    pub fn chunk(&self, which: ChunkRef) -> Option<&Chunk> {
        match which {
            ChunkRef::Main => Some(&self.main),
            ChunkRef::Function(i) => self.functions.get(i as usize).map(|f| &f.chunk),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, ProgramError> {
        Ok(postcard::to_allocvec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProgramError> {
        let program: Program = postcard::from_bytes(bytes)?;
        program.layout.validate()?;
        Ok(program)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_encoding() {
        let mut chunk = Chunk::new();
        chunk.emit(
            OpCode::Move,
            &[Arg::Reg(RegisterId(3)), Arg::Reg(RegisterId(200))],
            Span::default(),
        );
        assert_eq!(chunk.code, vec![OpCode::Move as u8, 3, 200]);
    }

    #[test]
    fn test_extended_encoding_widens_all_registers() {
        let mut chunk = Chunk::new();
        chunk.emit(
            OpCode::Move,
            &[Arg::Reg(RegisterId(3)), Arg::Reg(RegisterId(300))],
            Span::default(),
        );
        assert_eq!(chunk.code, vec![EXT, OpCode::Move as u8, 0, 3, 0x01, 0x2C]);
    }

    #[test]
    fn test_forward_jump_patch() {
        let mut chunk = Chunk::new();
        let patch = chunk.emit_jump(OpCode::Jump, &[], Span::default());
        chunk.emit(OpCode::LoadNil, &[Arg::Reg(RegisterId(0))], Span::default());
        chunk.patch_jump(patch).unwrap();
        assert_eq!(&chunk.code[..3], &[OpCode::Jump as u8, 0, 2]);
    }

    #[test]
    fn test_jump_too_far() {
        let mut chunk = Chunk::new();
        let patch = chunk.emit_jump(OpCode::Jump, &[], Span::default());
        chunk.code.extend(std::iter::repeat_n(0u8, 70_000));
        assert_eq!(chunk.patch_jump(patch), Err(70_000));
    }

    #[test]
    fn test_loop_offset_points_back_to_start() {
        let mut chunk = Chunk::new();
        chunk.emit(OpCode::LoadNil, &[Arg::Reg(RegisterId(0))], Span::default());
        let start = chunk.len();
        chunk.emit(OpCode::LoadNil, &[Arg::Reg(RegisterId(1))], Span::default());
        chunk.emit_loop(start, Span::default()).unwrap();
        // after LOOP, ip = 7; 7 - 5 = 2
        assert_eq!(&chunk.code[4..], &[OpCode::Loop as u8, 0, 5]);
    }

    #[test]
    fn test_constants_are_interned() {
        let mut chunk = Chunk::new();
        assert_eq!(chunk.add_constant(Constant::Str("a".into())), Some(0));
        assert_eq!(chunk.add_constant(Constant::I32(1)), Some(1));
        assert_eq!(chunk.add_constant(Constant::Str("a".into())), Some(0));
    }

    #[test]
    fn test_span_lookup() {
        let mut chunk = Chunk::new();
        chunk.emit(OpCode::LoadNil, &[Arg::Reg(RegisterId(0))], Span::new(1, 1));
        chunk.emit(OpCode::LoadNil, &[Arg::Reg(RegisterId(1))], Span::new(2, 5));
        assert_eq!(chunk.span_at(0), Some(Span::new(1, 1)));
        assert_eq!(chunk.span_at(3), Some(Span::new(2, 5)));
        assert_eq!(Chunk::new().span_at(0), None);
    }

    #[test]
    fn test_program_postcard_roundtrip() {
        let mut program = Program::new(RegisterLayout::default());
        program.main.emit(OpCode::Halt, &[], Span::default());
        program.functions.push(FunctionProto {
            name: "f".into(),
            arity: 1,
            upvalue_count: 0,
            chunk: Chunk::new(),
        });
        let bytes = program.to_bytes().unwrap();
        assert_eq!(Program::from_bytes(&bytes).unwrap(), program);
    }

    #[test]
    fn test_program_from_garbage() {
        assert!(Program::from_bytes(&[0xFF, 0xFF, 0xFF]).is_err());
    }
}
