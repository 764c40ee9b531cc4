use super::chunk::{Chunk, JumpPatch};
use super::compile_error::CompileError;
use crate::lang::node::Span;

/// Forward jumps that all land on one target not emitted yet, such as every
/// `break` of a loop.
#[derive(Debug, Default)]
pub struct JumpTable {
    patches: Vec<JumpPatch>,
}

impl JumpTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, patch: JumpPatch) {
        self.patches.push(patch);
    }

    pub fn len(&self) -> usize {
        self.patches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patches.is_empty()
    }

    /// Point every pending jump at the current end of `chunk`.
    pub fn patch_all(
        self,
        chunk: &mut Chunk,
        construct: &str,
        span: Span,
    ) -> Result<(), CompileError> {
        for patch in self.patches {
            chunk
                .patch_jump(patch)
                .map_err(|distance| CompileError::jump_too_far(construct, distance, span))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::chunk::Arg;
    use crate::bytecode::decode::{OperandValue, decode_all};
    use crate::bytecode::op::OpCode;
    use crate::regalloc::RegisterId;

    #[test]
    fn test_patch_all_hits_same_target() {
        let mut chunk = Chunk::new();
        let mut table = JumpTable::new();
        table.push(chunk.emit_jump(OpCode::Jump, &[], Span::default()));
        chunk.emit(OpCode::LoadNil, &[Arg::Reg(RegisterId(0))], Span::default());
        table.push(chunk.emit_jump(OpCode::Jump, &[], Span::default()));
        assert_eq!(table.len(), 2);

        table.patch_all(&mut chunk, "loop", Span::default()).unwrap();
        let end = chunk.len();
        let targets: Vec<_> = decode_all(&chunk.code)
            .unwrap()
            .into_iter()
            .filter(|i| i.op == OpCode::Jump)
            .map(|i| i.operands[0].clone())
            .collect();
        assert_eq!(targets, vec![OperandValue::Target(end), OperandValue::Target(end)]);
    }

    #[test]
    fn test_patch_too_far() {
        let mut chunk = Chunk::new();
        let mut table = JumpTable::new();
        table.push(chunk.emit_jump(OpCode::Jump, &[], Span::default()));
        chunk.code.resize(chunk.code.len() + 70_000, OpCode::Halt as u8);

        let err = table
            .patch_all(&mut chunk, "while loop", Span::new(2, 1))
            .unwrap_err();
        assert!(err.to_string().contains("jump target too far in while loop"));
    }
}
