use super::chunk::{Chunk, Program};
use super::decode::{DecodeError, Instruction, OperandValue, decode_all};
use crate::regalloc::RegisterLayout;
use std::fmt::Write;

/// Print disassembly of a compiled program
pub fn print_program(program: &Program) {
    print!("{}", disassemble_program(program));
}

pub fn disassemble_program(program: &Program) -> String {
    let mut out = String::from("=== BYTECODE PROGRAM ===\n\n");
    out.push_str(&disassemble_chunk("main", &program.main, &program.layout));

    for (i, f) in program.functions.iter().enumerate() {
        let label = if f.name.is_empty() {
            format!("fn[{}] <lambda>/{}", i, f.arity)
        } else {
            format!("fn[{}] {}/{}", i, f.name, f.arity)
        };
        out.push_str(&disassemble_chunk(&label, &f.chunk, &program.layout));
    }
    out
}

/// Render one chunk with a header, jump-target markers and constants.
pub fn disassemble_chunk(name: &str, chunk: &Chunk, layout: &RegisterLayout) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "════════════════════════════════════════");
    let _ = writeln!(out, " {}", name);
    let _ = writeln!(out, " {} bytes, {} constants", chunk.len(), chunk.constants.len());
    let _ = writeln!(out, "════════════════════════════════════════");

    let instrs = match decode_all(&chunk.code) {
        Ok(instrs) => instrs,
        Err(e) => {
            let _ = writeln!(out, "<{}>", e);
            return out;
        }
    };
    let targets = collect_jump_targets(&instrs);

    for instr in &instrs {
        if targets.contains(&instr.offset) {
            let _ = writeln!(out, "      ┌──────────────────────────────────");
        }
        let marker = if targets.contains(&instr.offset) { "► " } else { "  " };
        let _ = writeln!(
            out,
            "{:04} {}{}",
            instr.offset,
            marker,
            format_instruction(instr, chunk, layout)
        );
    }
    out.push('\n');
    out
}

fn collect_jump_targets(instrs: &[Instruction]) -> Vec<usize> {
    let mut targets = Vec::new();
    for instr in instrs {
        for operand in &instr.operands {
            if let OperandValue::Target(t) = operand {
                if !targets.contains(t) {
                    targets.push(*t);
                }
            }
        }
    }
    targets
}

pub fn format_instruction(instr: &Instruction, chunk: &Chunk, layout: &RegisterLayout) -> String {
    let mut text = String::new();
    if instr.extended {
        text.push_str("EXT ");
    }
    let _ = write!(text, "{:<16}", instr.op.mnemonic());

    let parts: Vec<String> = instr
        .operands
        .iter()
        .map(|operand| match operand {
            OperandValue::Reg(r) => layout.describe(*r),
            OperandValue::Const(k) => match chunk.constants.get(*k as usize) {
                Some(c) => format!("#{} ({:?})", k, c),
                None => format!("#{} (?)", k),
            },
            OperandValue::Func(f) => format!("fn[{}]", f),
            OperandValue::Imm32(n) => n.to_string(),
            OperandValue::Imm64(n) => format!("0x{:016X}", n),
            OperandValue::Target(t) => {
                let dir = if *t <= instr.offset { "↑" } else { "↓" };
                format!("{} (→ {:04})", dir, t)
            }
            OperandValue::Byte(b) => b.to_string(),
            OperandValue::Args(regs) => {
                let names: Vec<_> = regs.iter().map(|r| layout.describe(*r)).collect();
                format!("({})", names.join(", "))
            }
            OperandValue::Captures(caps) => {
                let names: Vec<_> = caps
                    .iter()
                    .map(|(local, r)| {
                        if *local {
                            format!("local {}", layout.describe(*r))
                        } else {
                            format!("upvalue {}", r.0)
                        }
                    })
                    .collect();
                format!("[{}]", names.join(", "))
            }
        })
        .collect();

    text.push_str(&parts.join(" "));
    text.trim_end().to_string()
}

/// Check that a chunk decodes cleanly end to end.
pub fn validate_chunk(chunk: &Chunk) -> Result<(), DecodeError> {
    decode_all(&chunk.code).map(|_| ())
}
