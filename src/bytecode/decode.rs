use super::op::{EXT, OpCode, Operand};
use crate::regalloc::RegisterId;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("unknown opcode 0x{byte:02X} at {at:04}")]
    UnknownOpcode { byte: u8, at: usize },

    #[error("truncated instruction at {at:04}")]
    Truncated { at: usize },
}

/// Cursor over an instruction stream.
///
/// `next_op` consumes the optional `EXT` prefix and the opcode; the operand
/// readers that follow use the width it selected.
#[derive(Debug, Clone)]
pub struct Reader<'a> {
    code: &'a [u8],
    pub ip: usize,
    extended: bool,
}

impl<'a> Reader<'a> {
    pub fn new(code: &'a [u8], ip: usize) -> Self {
        Reader {
            code,
            ip,
            extended: false,
        }
    }

    pub fn at_end(&self) -> bool {
        self.ip >= self.code.len()
    }

    pub fn is_extended(&self) -> bool {
        self.extended
    }

    pub fn next_op(&mut self) -> Result<OpCode, DecodeError> {
        let at = self.ip;
        let mut byte = self.u8()?;
        self.extended = byte == EXT;
        if self.extended {
            byte = self.u8()?;
        }
        OpCode::from_byte(byte).ok_or(DecodeError::UnknownOpcode { byte, at })
    }

    pub fn reg(&mut self) -> Result<RegisterId, DecodeError> {
        if self.extended {
            self.u16().map(RegisterId)
        } else {
            self.u8().map(|b| RegisterId(b as u16))
        }
    }

    pub fn u8(&mut self) -> Result<u8, DecodeError> {
        let b = *self
            .code
            .get(self.ip)
            .ok_or(DecodeError::Truncated { at: self.ip })?;
        self.ip += 1;
        Ok(b)
    }

    pub fn u16(&mut self) -> Result<u16, DecodeError> {
        Ok(u16::from_be_bytes(self.bytes::<2>()?))
    }

    pub fn i32(&mut self) -> Result<i32, DecodeError> {
        Ok(i32::from_be_bytes(self.bytes::<4>()?))
    }

    pub fn u64(&mut self) -> Result<u64, DecodeError> {
        Ok(u64::from_be_bytes(self.bytes::<8>()?))
    }

    fn bytes<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let slice = self
            .code
            .get(self.ip..self.ip + N)
            .ok_or(DecodeError::Truncated { at: self.ip })?;
        let mut out = [0u8; N];
        out.copy_from_slice(slice);
        self.ip += N;
        Ok(out)
    }
}

/// A decoded operand value.
#[derive(Debug, Clone, PartialEq)]
pub enum OperandValue {
    Reg(RegisterId),
    Const(u16),
    Func(u16),
    Imm32(i32),
    Imm64(u64),
    /// Absolute target offset.
    Target(usize),
    Byte(u8),
    Args(Vec<RegisterId>),
    Captures(Vec<(bool, RegisterId)>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Instruction {
    pub offset: usize,
    pub op: OpCode,
    pub extended: bool,
    pub operands: Vec<OperandValue>,
    pub len: usize,
}

/// Decode the instruction starting at `offset` using the opcode's shape.
pub fn decode_at(code: &[u8], offset: usize) -> Result<Instruction, DecodeError> {
    let mut r = Reader::new(code, offset);
    let op = r.next_op()?;
    let mut operands = Vec::with_capacity(op.operands().len());

    for shape in op.operands() {
        let value = match shape {
            Operand::Reg => OperandValue::Reg(r.reg()?),
            Operand::Const => OperandValue::Const(r.u16()?),
            Operand::Func => OperandValue::Func(r.u16()?),
            Operand::Imm32 => OperandValue::Imm32(r.i32()?),
            Operand::Imm64 => OperandValue::Imm64(r.u64()?),
            Operand::Byte => OperandValue::Byte(r.u8()?),
            Operand::Jump => {
                let off = r.u16()? as usize;
                // the offset is always the last operand
                OperandValue::Target(r.ip + off)
            }
            Operand::Loop => {
                let off = r.u16()? as usize;
                let target = r
                    .ip
                    .checked_sub(off)
                    .ok_or(DecodeError::Truncated { at: offset })?;
                OperandValue::Target(target)
            }
            Operand::Args => {
                let n = r.u8()?;
                let regs = (0..n).map(|_| r.reg()).collect::<Result<Vec<_>, _>>()?;
                OperandValue::Args(regs)
            }
            Operand::Captures => {
                let n = r.u8()?;
                let mut caps = Vec::with_capacity(n as usize);
                for _ in 0..n {
                    let is_local = r.u8()? != 0;
                    caps.push((is_local, r.reg()?));
                }
                OperandValue::Captures(caps)
            }
        };
        operands.push(value);
    }

    Ok(Instruction {
        offset,
        op,
        extended: r.is_extended(),
        operands,
        len: r.ip - offset,
    })
}

/// Decode a whole stream.
pub fn decode_all(code: &[u8]) -> Result<Vec<Instruction>, DecodeError> {
    let mut out = Vec::new();
    let mut offset = 0;
    while offset < code.len() {
        let instr = decode_at(code, offset)?;
        offset += instr.len;
        out.push(instr);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::chunk::{Arg, Chunk};
    use crate::lang::node::Span;

    #[test]
    fn test_decode_standard_and_extended() {
        let mut chunk = Chunk::new();
        chunk.emit(
            OpCode::Add,
            &[
                Arg::Reg(RegisterId(1)),
                Arg::Reg(RegisterId(2)),
                Arg::Reg(RegisterId(3)),
            ],
            Span::default(),
        );
        chunk.emit(
            OpCode::Add,
            &[
                Arg::Reg(RegisterId(1)),
                Arg::Reg(RegisterId(2)),
                Arg::Reg(RegisterId(400)),
            ],
            Span::default(),
        );

        let instrs = decode_all(&chunk.code).unwrap();
        assert_eq!(instrs.len(), 2);
        assert!(!instrs[0].extended);
        assert_eq!(instrs[0].len, 4);
        assert!(instrs[1].extended);
        assert_eq!(instrs[1].len, 8);
        assert_eq!(instrs[1].operands[2], OperandValue::Reg(RegisterId(400)));
    }

    #[test]
    fn test_decode_jump_targets() {
        let mut chunk = Chunk::new();
        let patch = chunk.emit_jump(OpCode::JumpIfNot, &[RegisterId(0)], Span::default());
        chunk.emit(OpCode::LoadNil, &[Arg::Reg(RegisterId(1))], Span::default());
        chunk.patch_jump(patch).unwrap();
        chunk.emit_loop(0, Span::default()).unwrap();

        let instrs = decode_all(&chunk.code).unwrap();
        assert_eq!(instrs[0].operands[1], OperandValue::Target(6));
        assert_eq!(instrs[2].operands[0], OperandValue::Target(0));
    }

    #[test]
    fn test_decode_call_args() {
        let mut chunk = Chunk::new();
        chunk.emit(
            OpCode::Call,
            &[
                Arg::Reg(RegisterId(64)),
                Arg::Reg(RegisterId(65)),
                Arg::Args(vec![RegisterId(66), RegisterId(67)]),
            ],
            Span::default(),
        );
        let instr = decode_at(&chunk.code, 0).unwrap();
        assert_eq!(
            instr.operands[2],
            OperandValue::Args(vec![RegisterId(66), RegisterId(67)])
        );
    }

    #[test]
    fn test_unknown_opcode() {
        assert_eq!(
            decode_at(&[0xEE], 0),
            Err(DecodeError::UnknownOpcode { byte: 0xEE, at: 0 })
        );
    }

    #[test]
    fn test_truncated() {
        assert_eq!(
            decode_at(&[OpCode::Move as u8, 1], 0),
            Err(DecodeError::Truncated { at: 2 })
        );
    }
}
