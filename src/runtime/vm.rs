use crate::bytecode::chunk::{ChunkRef, Program};
use crate::bytecode::compile::compile;
use crate::bytecode::compile_error::CompileError;
use crate::bytecode::decode::Reader;
use crate::bytecode::op::OpCode;
use crate::config::{CompilerConfig, VmConfig};
use crate::lang::diagnostic::{Diagnostic, DiagnosticKind, DiagnosticSink, LogSink};
use crate::lang::node;
use crate::lang::value::{Scalar, ScalarType, Value};
use crate::regalloc::RegisterId;
use crate::runtime::gc::{Collector, NoopCollector};
use crate::runtime::register_file::{RegisterFile, ReturnLink};
use crate::runtime::runtime_error::{
    RuntimeError, RuntimeErrorKind, division_by_zero, internal, operand_types, overflow,
    stack_overflow, type_error,
};
use crate::runtime::upvalue::{Closure, UpvalueRef};
use std::cmp::Ordering;
use std::io::{self, Write};
use std::rc::Rc;
use tracing::{debug, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmState {
    Running,
    Halted,
    CompileError,
    RuntimeError,
}

#[derive(Debug)]
pub enum InterpretResult {
    Ok,
    CompileError(CompileError),
    RuntimeError(RuntimeError),
}

/// An active `TRY_BEGIN`.
#[derive(Debug, Clone, Copy)]
struct TryFrame {
    handler: usize,
    chunk: ChunkRef,
    catch: RegisterId,
    /// Frame depth when the block was entered.
    depth: usize,
    /// Upvalues opened after this point are closed when the handler runs.
    upvalue_mark: usize,
}

enum Flow {
    Continue,
    Halt,
}

#[derive(Debug, Clone, Copy)]
enum Arith {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

#[derive(Debug, Clone, Copy)]
enum Cmp {
    Lt,
    Le,
    Gt,
    Ge,
}

pub struct Vm {
    registers: RegisterFile,
    config: VmConfig,
    state: VmState,
    chunk: ChunkRef,
    ip: usize,
    /// Start of the instruction being executed, for span lookup.
    instr_start: usize,
    try_frames: Vec<TryFrame>,
    /// Value raised by the last `THROW`, delivered to the catch register.
    thrown: Option<Value>,
    steps: usize,
    collector: Box<dyn Collector>,
    out: Box<dyn Write>,
    sink: Box<dyn DiagnosticSink>,
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

impl Vm {
    pub fn new() -> Self {
        Self::with_config(VmConfig::default())
    }

    pub fn with_config(config: VmConfig) -> Self {
        Vm {
            registers: RegisterFile::new(Default::default()),
            config,
            state: VmState::Halted,
            chunk: ChunkRef::Main,
            ip: 0,
            instr_start: 0,
            try_frames: Vec::new(),
            thrown: None,
            steps: 0,
            collector: Box::new(NoopCollector::default()),
            out: Box::new(io::stdout()),
            sink: Box::new(LogSink),
        }
    }

    pub fn with_output(mut self, out: Box<dyn Write>) -> Self {
        self.out = out;
        self
    }

    pub fn with_collector(mut self, collector: Box<dyn Collector>) -> Self {
        self.collector = collector;
        self
    }

    pub fn with_diagnostics(mut self, sink: Box<dyn DiagnosticSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn state(&self) -> VmState {
        self.state
    }

    pub fn registers(&self) -> &RegisterFile {
        &self.registers
    }

    pub fn registers_mut(&mut self) -> &mut RegisterFile {
        &mut self.registers
    }

    /// Current `(chunk, ip)` pair.
    pub fn position(&self) -> (ChunkRef, usize) {
        (self.chunk, self.ip)
    }

    pub fn reset_execution_state(&mut self, program: &Program) {
        self.registers = RegisterFile::new(program.layout.clone());
        self.chunk = ChunkRef::Main;
        self.ip = 0;
        self.instr_start = 0;
        self.try_frames.clear();
        self.thrown = None;
        self.steps = 0;
    }

    /// Compile and run an AST.
    pub fn interpret(&mut self, ast: &node::Program, config: &CompilerConfig) -> InterpretResult {
        let program = match compile(ast, config) {
            Ok(program) => program,
            Err(e) => {
                self.state = VmState::CompileError;
                self.sink.report(Diagnostic {
                    kind: DiagnosticKind::CompileError,
                    span: e.span(),
                    message: e.to_string(),
                    hint: e.hint(),
                });
                return InterpretResult::CompileError(e);
            }
        };
        match self.run(&program) {
            Ok(()) => InterpretResult::Ok,
            Err(e) => InterpretResult::RuntimeError(e),
        }
    }

    pub fn run(&mut self, program: &Program) -> Result<(), RuntimeError> {
        self.reset_execution_state(program);
        self.state = VmState::Running;

        let result = self.execute(program);
        if let Err(e) = &result {
            self.state = VmState::RuntimeError;
            self.sink.report(Diagnostic {
                kind: DiagnosticKind::RuntimeError,
                span: e.span,
                message: e.to_string(),
                hint: None,
            });
        } else {
            self.state = VmState::Halted;
        }
        self.out.flush().ok();
        result
    }

    /// Run one collection cycle over the current roots.
    pub fn collect_garbage(&mut self) {
        self.registers.reconcile_all();
        self.collector.pause();
        self.collector.collect(&self.registers);
        self.collector.resume();
    }

    // =========================================================================
    // Execution
    // =========================================================================

    fn check_limits(&mut self) -> Result<(), RuntimeError> {
        self.steps += 1;

        if let Some(max) = self.config.max_steps {
            if self.steps > max {
                return Err(RuntimeError::new(
                    RuntimeErrorKind::Limit,
                    format!("execution step limit exceeded ({})", max),
                ));
            }
        }

        Ok(())
    }

    fn execute(&mut self, program: &Program) -> Result<(), RuntimeError> {
        loop {
            match self.step(program) {
                Ok(Flow::Continue) => {}
                Ok(Flow::Halt) => return Ok(()),
                Err(e) => {
                    let span = program
                        .chunk(self.chunk)
                        .and_then(|c| c.span_at(self.instr_start));
                    let e = e.with_span(span);
                    if e.kind.is_recoverable() && self.unwind(&e) {
                        continue;
                    }
                    warn!(kind = e.kind.name(), "unhandled runtime error: {}", e.message);
                    return Err(self.with_call_stack(e));
                }
            }
        }
    }

    fn with_call_stack(&self, e: RuntimeError) -> RuntimeError {
        self.registers
            .frame_names()
            .iter()
            .fold(e, |e, name| e.with_context(name))
    }

    /// Transfer control to the innermost handler. Frames above the handler's
    /// depth are popped, closing their upvalues. Upvalues the try body opened
    /// in the handler's own frame are closed too, since the scope exits that
    /// would have closed them were skipped.
    fn unwind(&mut self, e: &RuntimeError) -> bool {
        let thrown = self.thrown.take();
        let Some(handler) = self.try_frames.pop() else {
            return false;
        };
        while self.registers.depth() > handler.depth {
            if self.registers.pop_frame().is_none() {
                break;
            }
        }
        let frame = self.registers.frame_index();
        self.registers
            .close_upvalues_after(frame, handler.upvalue_mark);
        let value = thrown.unwrap_or_else(|| e.to_value());
        debug!(
            handler = handler.handler,
            depth = handler.depth,
            "caught {}: {}",
            e.kind.name(),
            e.message
        );
        self.chunk = handler.chunk;
        self.ip = handler.handler;
        self.registers.set(handler.catch, value);
        true
    }

    fn step(&mut self, program: &Program) -> Result<Flow, RuntimeError> {
        self.check_limits()?;

        let chunk = program
            .chunk(self.chunk)
            .ok_or_else(|| internal(format!("no code for {:?}", self.chunk)))?;
        self.instr_start = self.ip;
        let mut r = Reader::new(&chunk.code, self.ip);

        // falling off the end returns nil
        if r.at_end() {
            return self.return_value(Value::Nil);
        }
        let op = r.next_op()?;
        if self.config.trace {
            trace!(
                chunk = ?self.chunk,
                ip = self.ip,
                depth = self.registers.depth(),
                op = op.mnemonic()
            );
        }

        match op {
            OpCode::Halt => return Ok(Flow::Halt),

            // Loads
            OpCode::LoadConst => {
                let dst = r.reg()?;
                let index = r.u16()?;
                let constant = chunk
                    .constants
                    .get(index as usize)
                    .ok_or_else(|| internal(format!("constant {} out of range", index)))?;
                self.registers.set(dst, constant.to_value());
            }
            OpCode::LoadNil => {
                let dst = r.reg()?;
                self.registers.set(dst, Value::Nil);
            }
            OpCode::LoadTrue => {
                let dst = r.reg()?;
                self.registers.set(dst, Value::Bool(true));
            }
            OpCode::LoadFalse => {
                let dst = r.reg()?;
                self.registers.set(dst, Value::Bool(false));
            }
            OpCode::LoadI32 => {
                let dst = r.reg()?;
                let n = r.i32()?;
                self.registers.set_typed(dst, Scalar::I32(n));
            }
            OpCode::LoadI64 => {
                let dst = r.reg()?;
                let n = r.u64()? as i64;
                self.registers.set_typed(dst, Scalar::I64(n));
            }
            OpCode::LoadF64 => {
                let dst = r.reg()?;
                let bits = r.u64()?;
                self.registers.set_typed(dst, Scalar::F64(f64::from_bits(bits)));
            }
            OpCode::Move => {
                let dst = r.reg()?;
                let src = r.reg()?;
                let value = self.registers.get(src);
                self.registers.set(dst, value);
            }

            // Generic arithmetic
            OpCode::Add | OpCode::Sub | OpCode::Mul | OpCode::Div | OpCode::Mod => {
                let (dst, a, b) = self.read_binary(&mut r)?;
                let kind = match op {
                    OpCode::Add => Arith::Add,
                    OpCode::Sub => Arith::Sub,
                    OpCode::Mul => Arith::Mul,
                    OpCode::Div => Arith::Div,
                    _ => Arith::Mod,
                };
                let result = arith(kind, &a, &b, op.mnemonic())?;
                self.registers.set(dst, result);
            }
            OpCode::Neg => {
                let dst = r.reg()?;
                let value = self.registers.get(r.reg()?);
                let result = match value {
                    Value::I32(n) => n
                        .checked_neg()
                        .map(Value::I32)
                        .ok_or_else(|| overflow("NEG", "i32"))?,
                    Value::I64(n) => n
                        .checked_neg()
                        .map(Value::I64)
                        .ok_or_else(|| overflow("NEG", "i64"))?,
                    Value::F64(n) => Value::F64(-n),
                    other => return Err(type_error("NEG", "signed number", other.type_name())),
                };
                self.registers.set(dst, result);
            }
            OpCode::Not => {
                let dst = r.reg()?;
                let b = self.read_bool(r.reg()?, op)?;
                self.registers.set_typed(dst, Scalar::Bool(!b));
            }
            OpCode::Eq | OpCode::Ne => {
                let (dst, a, b) = self.read_binary(&mut r)?;
                let equal = a == b;
                let result = if op == OpCode::Eq { equal } else { !equal };
                self.registers.set_typed(dst, Scalar::Bool(result));
            }
            OpCode::Lt | OpCode::Le | OpCode::Gt | OpCode::Ge => {
                let (dst, a, b) = self.read_binary(&mut r)?;
                let cmp = match op {
                    OpCode::Lt => Cmp::Lt,
                    OpCode::Le => Cmp::Le,
                    OpCode::Gt => Cmp::Gt,
                    _ => Cmp::Ge,
                };
                let result = compare(cmp, &a, &b, op.mnemonic())?;
                self.registers.set_typed(dst, Scalar::Bool(result));
            }

            // Typed fast path
            OpCode::AddI32
            | OpCode::SubI32
            | OpCode::MulI32
            | OpCode::DivI32
            | OpCode::ModI32
            | OpCode::AddI64
            | OpCode::SubI64
            | OpCode::MulI64
            | OpCode::DivI64
            | OpCode::ModI64
            | OpCode::AddU32
            | OpCode::SubU32
            | OpCode::MulU32
            | OpCode::DivU32
            | OpCode::ModU32
            | OpCode::AddU64
            | OpCode::SubU64
            | OpCode::MulU64
            | OpCode::DivU64
            | OpCode::ModU64
            | OpCode::AddF64
            | OpCode::SubF64
            | OpCode::MulF64
            | OpCode::DivF64
            | OpCode::ModF64 => self.typed_arith(&mut r, op)?,

            OpCode::LtI32
            | OpCode::LeI32
            | OpCode::GtI32
            | OpCode::GeI32
            | OpCode::LtI64
            | OpCode::LeI64
            | OpCode::GtI64
            | OpCode::GeI64
            | OpCode::LtF64
            | OpCode::LeF64
            | OpCode::GtF64
            | OpCode::GeF64 => self.typed_compare(&mut r, op)?,

            OpCode::IncI32 => {
                let reg = r.reg()?;
                let n = match self.typed_operand(reg, ScalarType::I32, op)? {
                    Scalar::I32(n) => n,
                    other => return Err(type_error(op.mnemonic(), "i32", other.ty().name())),
                };
                let next = n.checked_add(1).ok_or_else(|| overflow(op.mnemonic(), "i32"))?;
                self.registers.set_typed(reg, Scalar::I32(next));
            }

            // Control flow
            OpCode::Jump => {
                let offset = r.u16()? as usize;
                return self.jump_to(r.ip + offset, chunk.len());
            }
            OpCode::JumpIfNot => {
                let cond = r.reg()?;
                let offset = r.u16()? as usize;
                if !self.read_bool(cond, op)? {
                    return self.jump_to(r.ip + offset, chunk.len());
                }
            }
            OpCode::Loop => {
                let offset = r.u16()? as usize;
                let target = r
                    .ip
                    .checked_sub(offset)
                    .ok_or_else(|| internal(format!("LOOP before start of code at {}", self.ip)))?;
                return self.jump_to(target, chunk.len());
            }

            // Calls
            OpCode::Call => {
                let callee = r.reg()?;
                let result = r.reg()?;
                let argc = r.u8()?;
                let mut args = Vec::with_capacity(argc as usize);
                for _ in 0..argc {
                    let reg = r.reg()?;
                    args.push(self.registers.get(reg));
                }
                let link = ReturnLink {
                    chunk: self.chunk,
                    ip: r.ip,
                    result,
                };
                let callee = self.registers.get(callee);
                self.call(program, callee, args, link)?;
                return Ok(Flow::Continue);
            }
            OpCode::Return => {
                let value = self.registers.get(r.reg()?);
                return self.return_value(value);
            }
            OpCode::ReturnVoid => return self.return_value(Value::Nil),

            // Closures
            OpCode::Closure => {
                let dst = r.reg()?;
                let function = r.u16()?;
                let count = r.u8()?;
                let mut upvalues = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let is_local = r.u8()? != 0;
                    let reg = r.reg()?;
                    let uv = if is_local {
                        self.registers.capture(reg)
                    } else {
                        self.upvalue(reg.0 as usize)?
                    };
                    upvalues.push(uv);
                }
                let closure = Closure { function, upvalues };
                self.registers.set(dst, Value::Closure(Rc::new(closure)));
            }
            OpCode::GetUpvalue => {
                let dst = r.reg()?;
                let uv = self.upvalue(r.u8()? as usize)?;
                let value = self.registers.read_upvalue(&uv);
                self.registers.set(dst, value);
            }
            OpCode::SetUpvalue => {
                let uv = self.upvalue(r.u8()? as usize)?;
                let value = self.registers.get(r.reg()?);
                self.registers.write_upvalue(&uv, value);
            }
            OpCode::CloseUpvalue => {
                let reg = r.reg()?;
                self.registers.close_upvalue(reg);
            }

            // Errors
            OpCode::TryBegin => {
                let catch = r.reg()?;
                let offset = r.u16()? as usize;
                if self.try_frames.len() >= self.config.max_try_depth {
                    return Err(RuntimeError::new(
                        RuntimeErrorKind::Limit,
                        format!(
                            "too many nested try blocks (at most {})",
                            self.config.max_try_depth
                        ),
                    ));
                }
                self.try_frames.push(TryFrame {
                    handler: r.ip + offset,
                    chunk: self.chunk,
                    catch,
                    depth: self.registers.depth(),
                    upvalue_mark: self.registers.upvalue_mark(),
                });
            }
            OpCode::TryEnd => {
                self.try_frames
                    .pop()
                    .ok_or_else(|| internal("TRY_END without an active try block"))?;
            }
            OpCode::Throw => {
                let value = self.registers.get(r.reg()?);
                let err = match &value {
                    Value::Error(e) => RuntimeError::new(RuntimeErrorKind::Thrown, e.to_string()),
                    other => RuntimeError::new(RuntimeErrorKind::Thrown, other.to_string()),
                };
                self.thrown = Some(value);
                return Err(err);
            }

            // Runtime services
            OpCode::Print => {
                let value = self.registers.get(r.reg()?);
                writeln!(self.out, "{}", value)
                    .map_err(|e| internal(format!("print failed: {}", e)))?;
            }
            OpCode::GcPause => {
                self.registers.reconcile_all();
                self.collector.pause();
            }
            OpCode::GcResume => self.collector.resume(),
            OpCode::SwitchModule => {
                let module = r.u8()?;
                self.registers.switch_module(module);
            }
        }

        self.ip = r.ip;
        Ok(Flow::Continue)
    }

    fn jump_to(&mut self, target: usize, len: usize) -> Result<Flow, RuntimeError> {
        if target > len {
            return Err(internal(format!(
                "jump target {} outside code (length {})",
                target, len
            )));
        }
        self.ip = target;
        Ok(Flow::Continue)
    }

    fn call(
        &mut self,
        program: &Program,
        callee: Value,
        args: Vec<Value>,
        link: ReturnLink,
    ) -> Result<(), RuntimeError> {
        let (function, closure) = match callee {
            Value::Function(index) => (index, None),
            Value::Closure(c) => (c.function, Some(c)),
            other => return Err(type_error("CALL", "function", other.type_name())),
        };
        let proto = program
            .functions
            .get(function as usize)
            .ok_or_else(|| internal(format!("function {} out of range", function)))?;

        if args.len() != proto.arity as usize {
            return Err(RuntimeError::new(
                RuntimeErrorKind::Type,
                format!(
                    "'{}' expects {} arguments, got {}",
                    proto.name,
                    proto.arity,
                    args.len()
                ),
            ));
        }
        if self.registers.depth() >= self.config.max_frames {
            return Err(stack_overflow(self.config.max_frames));
        }

        let chunk = ChunkRef::Function(function);
        self.registers
            .push_frame(chunk, &proto.name, args, link, closure);
        self.chunk = chunk;
        self.ip = 0;
        Ok(())
    }

    /// Leave the current frame, writing `value` into the caller's result
    /// register. Returning from the root frame halts.
    fn return_value(&mut self, value: Value) -> Result<Flow, RuntimeError> {
        if self.registers.depth() == 1 {
            return Ok(Flow::Halt);
        }
        let frame = self
            .registers
            .pop_frame()
            .ok_or_else(|| internal("return with no active frame"))?;
        let link = frame
            .return_to
            .ok_or_else(|| internal(format!("frame '{}' has no return link", frame.name)))?;

        let depth = self.registers.depth();
        self.try_frames.retain(|t| t.depth <= depth);

        self.chunk = link.chunk;
        self.ip = link.ip;
        self.registers.set(link.result, value);
        Ok(Flow::Continue)
    }

    fn upvalue(&self, index: usize) -> Result<UpvalueRef, RuntimeError> {
        self.registers
            .current_frame()
            .closure
            .as_ref()
            .and_then(|c| c.upvalues.get(index))
            .cloned()
            .ok_or_else(|| internal(format!("upvalue {} not available", index)))
    }

    // =========================================================================
    // Operand helpers
    // =========================================================================

    fn read_binary(&mut self, r: &mut Reader) -> Result<(RegisterId, Value, Value), RuntimeError> {
        let dst = r.reg()?;
        let a = self.registers.get(r.reg()?);
        let b = self.registers.get(r.reg()?);
        Ok((dst, a, b))
    }

    fn typed_operand(
        &mut self,
        id: RegisterId,
        ty: ScalarType,
        op: OpCode,
    ) -> Result<Scalar, RuntimeError> {
        self.registers
            .get_typed(id, ty)
            .map_err(|actual| type_error(op.mnemonic(), ty.name(), actual))
    }

    fn read_bool(&mut self, id: RegisterId, op: OpCode) -> Result<bool, RuntimeError> {
        match self.typed_operand(id, ScalarType::Bool, op)? {
            Scalar::Bool(b) => Ok(b),
            other => Err(type_error(op.mnemonic(), "bool", other.ty().name())),
        }
    }

    fn typed_arith(&mut self, r: &mut Reader, op: OpCode) -> Result<(), RuntimeError> {
        let (kind, ty) = typed_arith_shape(op)
            .ok_or_else(|| internal(format!("{} is not typed arithmetic", op.mnemonic())))?;
        let dst = r.reg()?;
        let a = self.typed_operand(r.reg()?, ty, op)?;
        let b = self.typed_operand(r.reg()?, ty, op)?;
        let name = op.mnemonic();

        let result = match (a, b) {
            (Scalar::I32(x), Scalar::I32(y)) => Scalar::I32(int_arith(kind, x, y, name)?),
            (Scalar::I64(x), Scalar::I64(y)) => Scalar::I64(int_arith(kind, x, y, name)?),
            (Scalar::U32(x), Scalar::U32(y)) => Scalar::U32(int_arith(kind, x, y, name)?),
            (Scalar::U64(x), Scalar::U64(y)) => Scalar::U64(int_arith(kind, x, y, name)?),
            (Scalar::F64(x), Scalar::F64(y)) => Scalar::F64(float_arith(kind, x, y, name)?),
            _ => return Err(internal(format!("bad operands for {}", name))),
        };
        self.registers.set_typed(dst, result);
        Ok(())
    }

    fn typed_compare(&mut self, r: &mut Reader, op: OpCode) -> Result<(), RuntimeError> {
        let (cmp, ty) = typed_compare_shape(op)
            .ok_or_else(|| internal(format!("{} is not a typed comparison", op.mnemonic())))?;
        let dst = r.reg()?;
        let a = self.typed_operand(r.reg()?, ty, op)?;
        let b = self.typed_operand(r.reg()?, ty, op)?;
        let result = compare(cmp, &a.to_value(), &b.to_value(), op.mnemonic())?;
        self.registers.set_typed(dst, Scalar::Bool(result));
        Ok(())
    }
}

fn typed_arith_shape(op: OpCode) -> Option<(Arith, ScalarType)> {
    use OpCode::*;
    let shape = match op {
        AddI32 => (Arith::Add, ScalarType::I32),
        SubI32 => (Arith::Sub, ScalarType::I32),
        MulI32 => (Arith::Mul, ScalarType::I32),
        DivI32 => (Arith::Div, ScalarType::I32),
        ModI32 => (Arith::Mod, ScalarType::I32),
        AddI64 => (Arith::Add, ScalarType::I64),
        SubI64 => (Arith::Sub, ScalarType::I64),
        MulI64 => (Arith::Mul, ScalarType::I64),
        DivI64 => (Arith::Div, ScalarType::I64),
        ModI64 => (Arith::Mod, ScalarType::I64),
        AddU32 => (Arith::Add, ScalarType::U32),
        SubU32 => (Arith::Sub, ScalarType::U32),
        MulU32 => (Arith::Mul, ScalarType::U32),
        DivU32 => (Arith::Div, ScalarType::U32),
        ModU32 => (Arith::Mod, ScalarType::U32),
        AddU64 => (Arith::Add, ScalarType::U64),
        SubU64 => (Arith::Sub, ScalarType::U64),
        MulU64 => (Arith::Mul, ScalarType::U64),
        DivU64 => (Arith::Div, ScalarType::U64),
        ModU64 => (Arith::Mod, ScalarType::U64),
        AddF64 => (Arith::Add, ScalarType::F64),
        SubF64 => (Arith::Sub, ScalarType::F64),
        MulF64 => (Arith::Mul, ScalarType::F64),
        DivF64 => (Arith::Div, ScalarType::F64),
        ModF64 => (Arith::Mod, ScalarType::F64),
        _ => return None,
    };
    Some(shape)
}

fn typed_compare_shape(op: OpCode) -> Option<(Cmp, ScalarType)> {
    use OpCode::*;
    let shape = match op {
        LtI32 => (Cmp::Lt, ScalarType::I32),
        LeI32 => (Cmp::Le, ScalarType::I32),
        GtI32 => (Cmp::Gt, ScalarType::I32),
        GeI32 => (Cmp::Ge, ScalarType::I32),
        LtI64 => (Cmp::Lt, ScalarType::I64),
        LeI64 => (Cmp::Le, ScalarType::I64),
        GtI64 => (Cmp::Gt, ScalarType::I64),
        GeI64 => (Cmp::Ge, ScalarType::I64),
        LtF64 => (Cmp::Lt, ScalarType::F64),
        LeF64 => (Cmp::Le, ScalarType::F64),
        GtF64 => (Cmp::Gt, ScalarType::F64),
        GeF64 => (Cmp::Ge, ScalarType::F64),
        _ => return None,
    };
    Some(shape)
}

/// Checked integer arithmetic shared by the generic and typed paths.
trait IntArith: Copy + PartialEq {
    const ZERO: Self;
    const NAME: &'static str;

    fn apply(self, rhs: Self, kind: Arith) -> Option<Self>;
}

macro_rules! impl_int_arith {
    ($($t:ty => $name:literal),* $(,)?) => {
        $(
            impl IntArith for $t {
                const ZERO: Self = 0;
                const NAME: &'static str = $name;

                fn apply(self, rhs: Self, kind: Arith) -> Option<Self> {
                    match kind {
                        Arith::Add => self.checked_add(rhs),
                        Arith::Sub => self.checked_sub(rhs),
                        Arith::Mul => self.checked_mul(rhs),
                        Arith::Div => self.checked_div(rhs),
                        Arith::Mod => self.checked_rem(rhs),
                    }
                }
            }
        )*
    };
}

impl_int_arith! {
    i32 => "i32",
    i64 => "i64",
    u32 => "u32",
    u64 => "u64",
}

fn int_arith<T: IntArith>(kind: Arith, x: T, y: T, op: &str) -> Result<T, RuntimeError> {
    if matches!(kind, Arith::Div | Arith::Mod) && y == T::ZERO {
        return Err(division_by_zero(op));
    }
    // MIN / -1 lands here too
    x.apply(y, kind).ok_or_else(|| overflow(op, T::NAME))
}

fn float_arith(kind: Arith, x: f64, y: f64, op: &str) -> Result<f64, RuntimeError> {
    match kind {
        Arith::Add => Ok(x + y),
        Arith::Sub => Ok(x - y),
        Arith::Mul => Ok(x * y),
        Arith::Div | Arith::Mod if y == 0.0 => Err(division_by_zero(op)),
        Arith::Div => Ok(x / y),
        Arith::Mod => Ok(x % y),
    }
}

fn arith(kind: Arith, a: &Value, b: &Value, op: &str) -> Result<Value, RuntimeError> {
    match (a, b) {
        (Value::I32(x), Value::I32(y)) => int_arith(kind, *x, *y, op).map(Value::I32),
        (Value::I64(x), Value::I64(y)) => int_arith(kind, *x, *y, op).map(Value::I64),
        (Value::U32(x), Value::U32(y)) => int_arith(kind, *x, *y, op).map(Value::U32),
        (Value::U64(x), Value::U64(y)) => int_arith(kind, *x, *y, op).map(Value::U64),
        (Value::F64(x), Value::F64(y)) => float_arith(kind, *x, *y, op).map(Value::F64),
        (Value::Str(x), Value::Str(y)) if matches!(kind, Arith::Add) => {
            Ok(Value::string(&format!("{}{}", x, y)))
        }
        _ => Err(operand_types(op, a, b)),
    }
}

fn compare(cmp: Cmp, a: &Value, b: &Value, op: &str) -> Result<bool, RuntimeError> {
    let ordering = match (a, b) {
        (Value::I32(x), Value::I32(y)) => x.partial_cmp(y),
        (Value::I64(x), Value::I64(y)) => x.partial_cmp(y),
        (Value::U32(x), Value::U32(y)) => x.partial_cmp(y),
        (Value::U64(x), Value::U64(y)) => x.partial_cmp(y),
        (Value::F64(x), Value::F64(y)) => x.partial_cmp(y),
        (Value::Str(x), Value::Str(y)) => x.partial_cmp(y),
        _ => return Err(operand_types(op, a, b)),
    };
    // NaN compares false every way
    let Some(ordering) = ordering else {
        return Ok(false);
    };
    Ok(match cmp {
        Cmp::Lt => ordering == Ordering::Less,
        Cmp::Le => ordering != Ordering::Greater,
        Cmp::Gt => ordering == Ordering::Greater,
        Cmp::Ge => ordering != Ordering::Less,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::chunk::{Arg, Chunk, Constant, FunctionProto};
    use crate::lang::diagnostic::Diagnostics;
    use crate::lang::node::Span;
    use crate::regalloc::RegisterLayout;
    use crate::runtime::typed::Residency;
    use std::cell::RefCell;

    // ============================================================
    // Test Helpers
    // ============================================================

    fn r(n: u16) -> RegisterId {
        RegisterId(n)
    }

    fn reg(n: u16) -> Arg {
        Arg::Reg(RegisterId(n))
    }

    fn sp() -> Span {
        Span::default()
    }

    /// Shared output buffer for PRINT.
    #[derive(Clone, Default)]
    struct Capture(Rc<RefCell<Vec<u8>>>);

    impl Write for Capture {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.borrow_mut().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Capture {
        fn text(&self) -> String {
            String::from_utf8_lossy(&self.0.borrow()).into_owned()
        }
    }

    fn program(main: Chunk) -> Program {
        let mut program = Program::new(RegisterLayout::default());
        program.main = main;
        program
    }

    fn function(name: &str, arity: u8, chunk: Chunk) -> FunctionProto {
        FunctionProto {
            name: name.to_string(),
            arity,
            upvalue_count: 0,
            chunk,
        }
    }

    /// Run a program and return the VM for inspection.
    fn run_with(program: &Program, config: VmConfig) -> (Vm, Result<(), RuntimeError>) {
        let mut vm = Vm::with_config(config).with_diagnostics(Box::new(Diagnostics::new()));
        let result = vm.run(program);
        (vm, result)
    }

    fn run(program: &Program) -> (Vm, Result<(), RuntimeError>) {
        run_with(program, VmConfig::default())
    }

    /// Assert execution fails with a message containing the given substring
    fn assert_error(program: &Program, kind: RuntimeErrorKind, contains: &str) -> Vm {
        let (vm, result) = run(program);
        match result {
            Ok(()) => panic!("expected error containing '{}'", contains),
            Err(e) => {
                assert_eq!(e.kind, kind, "unexpected kind for: {}", e.message);
                assert!(
                    e.message.contains(contains),
                    "expected error containing '{}', got: {}",
                    contains,
                    e.message
                );
            }
        }
        assert_eq!(vm.state(), VmState::RuntimeError);
        vm
    }

    fn load_i32(chunk: &mut Chunk, dst: u16, n: i32) {
        chunk.emit(OpCode::LoadI32, &[reg(dst), Arg::Imm32(n)], sp());
    }

    fn binary(chunk: &mut Chunk, op: OpCode, dst: u16, a: u16, b: u16) {
        chunk.emit(op, &[reg(dst), reg(a), reg(b)], sp());
    }

    fn halt(chunk: &mut Chunk) {
        chunk.emit(OpCode::Halt, &[], sp());
    }

    // ============================================================
    // Arithmetic
    // ============================================================

    #[test]
    fn test_typed_add_defers_then_reconciles() {
        let mut c = Chunk::new();
        load_i32(&mut c, 0, 0);
        load_i32(&mut c, 1, 5);
        load_i32(&mut c, 2, 3);
        binary(&mut c, OpCode::AddI32, 0, 1, 2);
        halt(&mut c);

        let (mut vm, result) = run(&program(c));
        result.unwrap();
        assert_eq!(vm.state(), VmState::Halted);
        assert_eq!(
            vm.registers().typed().residency(r(0)),
            Residency::Dirty(Scalar::I32(8))
        );
        assert_eq!(vm.registers().peek(r(0)), Value::I32(8));
        assert_eq!(vm.registers_mut().get(r(0)), Value::I32(8));
        assert!(!vm.registers().typed().is_dirty(r(0)));
    }

    #[test]
    fn test_mul_overflow_leaves_destination() {
        let mut c = Chunk::new();
        load_i32(&mut c, 0, 77);
        load_i32(&mut c, 1, i32::MAX);
        load_i32(&mut c, 2, 2);
        binary(&mut c, OpCode::MulI32, 0, 1, 2);
        halt(&mut c);

        let mut vm = assert_error(
            &program(c),
            RuntimeErrorKind::Overflow,
            "integer overflow in MUL_I32_TYPED (i32, i32)",
        );
        assert_eq!(vm.registers_mut().get(r(0)), Value::I32(77));
    }

    #[test]
    fn test_add_overflow_leaves_destination() {
        let mut c = Chunk::new();
        load_i32(&mut c, 0, -5);
        load_i32(&mut c, 1, i32::MAX);
        load_i32(&mut c, 2, 1);
        binary(&mut c, OpCode::AddI32, 0, 1, 2);
        halt(&mut c);

        let mut vm = assert_error(
            &program(c),
            RuntimeErrorKind::Overflow,
            "integer overflow in ADD_I32_TYPED (i32, i32)",
        );
        assert_eq!(vm.registers().peek(r(0)), Value::I32(-5));
        assert_eq!(vm.registers_mut().get(r(0)), Value::I32(-5));
    }

    #[test]
    fn test_typed_operand_mismatch() {
        let mut c = Chunk::new();
        let k = c.add_constant(Constant::Str("x".into())).unwrap();
        c.emit(OpCode::LoadConst, &[reg(1), Arg::Const(k)], sp());
        load_i32(&mut c, 2, 1);
        binary(&mut c, OpCode::SubI32, 0, 1, 2);
        halt(&mut c);

        assert_error(
            &program(c),
            RuntimeErrorKind::Type,
            "SUB_I32_TYPED: expected i32, got string",
        );
    }

    #[test]
    fn test_division_by_zero() {
        let mut c = Chunk::new();
        load_i32(&mut c, 1, 10);
        load_i32(&mut c, 2, 0);
        binary(&mut c, OpCode::DivI32, 0, 1, 2);
        halt(&mut c);

        assert_error(
            &program(c),
            RuntimeErrorKind::DivisionByZero,
            "division by zero in DIV_I32_TYPED",
        );
    }

    #[test]
    fn test_min_div_minus_one_overflows() {
        let mut c = Chunk::new();
        load_i32(&mut c, 1, i32::MIN);
        load_i32(&mut c, 2, -1);
        binary(&mut c, OpCode::DivI32, 0, 1, 2);
        halt(&mut c);

        assert_error(&program(c), RuntimeErrorKind::Overflow, "DIV_I32_TYPED");
    }

    #[test]
    fn test_generic_add_and_concat() {
        let mut c = Chunk::new();
        let a = c.add_constant(Constant::Str("ab".into())).unwrap();
        let b = c.add_constant(Constant::Str("cd".into())).unwrap();
        c.emit(OpCode::LoadConst, &[reg(1), Arg::Const(a)], sp());
        c.emit(OpCode::LoadConst, &[reg(2), Arg::Const(b)], sp());
        binary(&mut c, OpCode::Add, 0, 1, 2);
        load_i32(&mut c, 3, 40);
        load_i32(&mut c, 4, 2);
        binary(&mut c, OpCode::Add, 5, 3, 4);
        halt(&mut c);

        let (mut vm, result) = run(&program(c));
        result.unwrap();
        assert_eq!(vm.registers_mut().get(r(0)), Value::string("abcd"));
        assert_eq!(vm.registers_mut().get(r(5)), Value::I32(42));
    }

    #[test]
    fn test_generic_add_type_error() {
        let mut c = Chunk::new();
        let k = c.add_constant(Constant::Str("x".into())).unwrap();
        c.emit(OpCode::LoadConst, &[reg(1), Arg::Const(k)], sp());
        load_i32(&mut c, 2, 1);
        binary(&mut c, OpCode::Add, 0, 1, 2);
        halt(&mut c);

        assert_error(
            &program(c),
            RuntimeErrorKind::Type,
            "unsupported operands string and i32",
        );
    }

    #[test]
    fn test_neg_and_not() {
        let mut c = Chunk::new();
        load_i32(&mut c, 1, 5);
        c.emit(OpCode::Neg, &[reg(0), reg(1)], sp());
        c.emit(OpCode::LoadFalse, &[reg(2)], sp());
        c.emit(OpCode::Not, &[reg(3), reg(2)], sp());
        halt(&mut c);

        let (mut vm, result) = run(&program(c));
        result.unwrap();
        assert_eq!(vm.registers_mut().get(r(0)), Value::I32(-5));
        assert_eq!(vm.registers_mut().get(r(3)), Value::Bool(true));
    }

    #[test]
    fn test_spill_registers_use_extended_form() {
        let mut c = Chunk::new();
        load_i32(&mut c, 300, 5);
        binary(&mut c, OpCode::AddI32, 301, 300, 300);
        halt(&mut c);
        assert_eq!(c.code[0], crate::bytecode::op::EXT);

        let (mut vm, result) = run(&program(c));
        result.unwrap();
        assert_eq!(vm.registers_mut().get(r(301)), Value::I32(10));
    }

    // ============================================================
    // Control flow
    // ============================================================

    #[test]
    fn test_jump_if_not_requires_bool() {
        let mut c = Chunk::new();
        load_i32(&mut c, 0, 1);
        let patch = c.emit_jump(OpCode::JumpIfNot, &[r(0)], sp());
        c.patch_jump(patch).unwrap();
        halt(&mut c);

        assert_error(
            &program(c),
            RuntimeErrorKind::Type,
            "JUMP_IF_NOT: expected bool, got i32",
        );
    }

    #[test]
    fn test_counting_loop() {
        let mut c = Chunk::new();
        load_i32(&mut c, 0, 0);
        load_i32(&mut c, 1, 5);
        let start = c.len();
        binary(&mut c, OpCode::LtI32, 2, 0, 1);
        let exit = c.emit_jump(OpCode::JumpIfNot, &[r(2)], sp());
        c.emit(OpCode::IncI32, &[reg(0)], sp());
        c.emit_loop(start, sp()).unwrap();
        c.patch_jump(exit).unwrap();
        halt(&mut c);

        let (mut vm, result) = run(&program(c));
        result.unwrap();
        assert_eq!(vm.registers_mut().get(r(0)), Value::I32(5));
    }

    #[test]
    fn test_step_limit() {
        let mut c = Chunk::new();
        let start = c.len();
        c.emit_loop(start, sp()).unwrap();

        let config = VmConfig {
            max_steps: Some(100),
            ..VmConfig::default()
        };
        let (_, result) = run_with(&program(c), config);
        let e = result.unwrap_err();
        assert_eq!(e.kind, RuntimeErrorKind::Limit);
        assert!(e.message.contains("step limit exceeded (100)"));
    }

    // ============================================================
    // Calls
    // ============================================================

    /// `fn double(x) { return x + x }` at index 0.
    fn double_fn() -> FunctionProto {
        let mut f = Chunk::new();
        binary(&mut f, OpCode::AddI32, 192, 64, 64);
        f.emit(OpCode::Return, &[reg(192)], sp());
        function("double", 1, f)
    }

    #[test]
    fn test_call_and_return() {
        let mut c = Chunk::new();
        let f = c.add_constant(Constant::Function(0)).unwrap();
        c.emit(OpCode::LoadConst, &[reg(0), Arg::Const(f)], sp());
        load_i32(&mut c, 1, 21);
        load_i32(&mut c, 192, 7);
        c.emit(
            OpCode::Call,
            &[reg(0), reg(2), Arg::Args(vec![r(1)])],
            sp(),
        );
        halt(&mut c);
        let halt_at = c.len() - 1;

        let mut p = program(c);
        p.functions.push(double_fn());
        let (mut vm, result) = run(&p);
        result.unwrap();

        assert_eq!(vm.registers_mut().get(r(2)), Value::I32(42));
        // caller temps survive the callee's use of the same slot
        assert_eq!(vm.registers_mut().get(r(192)), Value::I32(7));
        assert_eq!(vm.registers().depth(), 1);
        assert_eq!(vm.position(), (ChunkRef::Main, halt_at));
    }

    #[test]
    fn test_call_arity_mismatch() {
        let mut c = Chunk::new();
        let f = c.add_constant(Constant::Function(0)).unwrap();
        c.emit(OpCode::LoadConst, &[reg(0), Arg::Const(f)], sp());
        c.emit(OpCode::Call, &[reg(0), reg(1), Arg::Args(vec![])], sp());
        halt(&mut c);

        let mut p = program(c);
        p.functions.push(double_fn());
        let (_, result) = run(&p);
        let e = result.unwrap_err();
        assert!(e.message.contains("'double' expects 1 arguments, got 0"));
    }

    #[test]
    fn test_call_non_function() {
        let mut c = Chunk::new();
        load_i32(&mut c, 0, 3);
        c.emit(OpCode::Call, &[reg(0), reg(1), Arg::Args(vec![])], sp());
        halt(&mut c);

        assert_error(
            &program(c),
            RuntimeErrorKind::Type,
            "CALL: expected function, got i32",
        );
    }

    #[test]
    fn test_unbounded_recursion_overflows() {
        let mut f = Chunk::new();
        let k = f.add_constant(Constant::Function(0)).unwrap();
        f.emit(OpCode::LoadConst, &[reg(192), Arg::Const(k)], sp());
        f.emit(OpCode::Call, &[reg(192), reg(193), Arg::Args(vec![])], sp());
        f.emit(OpCode::Return, &[reg(193)], sp());

        let mut c = Chunk::new();
        let k = c.add_constant(Constant::Function(0)).unwrap();
        c.emit(OpCode::LoadConst, &[reg(0), Arg::Const(k)], sp());
        c.emit(OpCode::Call, &[reg(0), reg(1), Arg::Args(vec![])], sp());
        halt(&mut c);

        let mut p = program(c);
        p.functions.push(function("spin", 0, f));
        let config = VmConfig {
            max_frames: 8,
            ..VmConfig::default()
        };
        let (_, result) = run_with(&p, config);
        let e = result.unwrap_err();
        assert_eq!(e.kind, RuntimeErrorKind::StackOverflow);
        assert_eq!(e.call_stack.len(), 8);
        assert_eq!(e.call_stack[0], "<main>");
        assert_eq!(e.call_stack[7], "spin");
    }

    #[test]
    fn test_return_from_main_halts() {
        let mut c = Chunk::new();
        load_i32(&mut c, 0, 1);
        c.emit(OpCode::ReturnVoid, &[], sp());
        load_i32(&mut c, 0, 2);

        let (mut vm, result) = run(&program(c));
        result.unwrap();
        assert_eq!(vm.registers_mut().get(r(0)), Value::I32(1));
    }

    // ============================================================
    // Closures
    // ============================================================

    #[test]
    fn test_closure_sees_live_then_closed_value() {
        // fn get() { return captured }
        let mut f = Chunk::new();
        f.emit(OpCode::GetUpvalue, &[reg(192), Arg::Byte(0)], sp());
        f.emit(OpCode::Return, &[reg(192)], sp());
        let mut get = function("get", 0, f);
        get.upvalue_count = 1;

        let mut c = Chunk::new();
        load_i32(&mut c, 64, 10);
        c.emit(
            OpCode::Closure,
            &[reg(0), Arg::Func(0), Arg::Captures(vec![(true, r(64))])],
            sp(),
        );
        load_i32(&mut c, 64, 11);
        c.emit(OpCode::Call, &[reg(0), reg(1), Arg::Args(vec![])], sp());
        c.emit(OpCode::CloseUpvalue, &[reg(64)], sp());
        load_i32(&mut c, 64, 99);
        c.emit(OpCode::Call, &[reg(0), reg(2), Arg::Args(vec![])], sp());
        halt(&mut c);

        let mut p = program(c);
        p.functions.push(get);
        let (mut vm, result) = run(&p);
        result.unwrap();
        assert_eq!(vm.registers_mut().get(r(1)), Value::I32(11));
        assert_eq!(vm.registers_mut().get(r(2)), Value::I32(11));
        assert_eq!(vm.registers().open_upvalue_count(), 0);
    }

    #[test]
    fn test_set_upvalue_writes_through_to_owner() {
        // fn bump() { captured = captured + 1 }
        let mut f = Chunk::new();
        f.emit(OpCode::GetUpvalue, &[reg(192), Arg::Byte(0)], sp());
        load_i32(&mut f, 193, 1);
        binary(&mut f, OpCode::AddI32, 192, 192, 193);
        f.emit(OpCode::SetUpvalue, &[Arg::Byte(0), reg(192)], sp());
        f.emit(OpCode::ReturnVoid, &[], sp());
        let mut bump = function("bump", 0, f);
        bump.upvalue_count = 1;

        let mut c = Chunk::new();
        load_i32(&mut c, 64, 1);
        c.emit(
            OpCode::Closure,
            &[reg(0), Arg::Func(0), Arg::Captures(vec![(true, r(64))])],
            sp(),
        );
        c.emit(OpCode::Call, &[reg(0), reg(1), Arg::Args(vec![])], sp());
        c.emit(OpCode::Call, &[reg(0), reg(1), Arg::Args(vec![])], sp());
        halt(&mut c);

        let mut p = program(c);
        p.functions.push(bump);
        let (mut vm, result) = run(&p);
        result.unwrap();
        assert_eq!(vm.registers_mut().get(r(64)), Value::I32(3));
    }

    // ============================================================
    // Exceptions
    // ============================================================

    #[test]
    fn test_overflow_caught_by_try() {
        let mut c = Chunk::new();
        let handler = c.emit_jump(OpCode::TryBegin, &[r(5)], sp());
        load_i32(&mut c, 1, i32::MAX);
        load_i32(&mut c, 2, 1);
        binary(&mut c, OpCode::AddI32, 0, 1, 2);
        c.emit(OpCode::TryEnd, &[], sp());
        let end = c.emit_jump(OpCode::Jump, &[], sp());
        c.patch_jump(handler).unwrap();
        c.emit(OpCode::LoadTrue, &[reg(6)], sp());
        c.patch_jump(end).unwrap();
        halt(&mut c);

        let (mut vm, result) = run(&program(c));
        result.unwrap();
        assert_eq!(vm.registers_mut().get(r(6)), Value::Bool(true));
        match vm.registers_mut().get(r(5)) {
            Value::Error(e) => {
                assert_eq!(e.kind, "overflow");
                assert!(e.message.contains("ADD_I32_TYPED"));
            }
            other => panic!("expected error value, got {:?}", other),
        }
    }

    #[test]
    fn test_throw_unwinds_frames() {
        // fn fail() { throw "boom" }
        let mut f = Chunk::new();
        let k = f.add_constant(Constant::Str("boom".into())).unwrap();
        f.emit(OpCode::LoadConst, &[reg(192), Arg::Const(k)], sp());
        f.emit(OpCode::Throw, &[reg(192)], sp());

        let mut c = Chunk::new();
        let k = c.add_constant(Constant::Function(0)).unwrap();
        let handler = c.emit_jump(OpCode::TryBegin, &[r(3)], sp());
        c.emit(OpCode::LoadConst, &[reg(0), Arg::Const(k)], sp());
        c.emit(OpCode::Call, &[reg(0), reg(1), Arg::Args(vec![])], sp());
        c.emit(OpCode::TryEnd, &[], sp());
        c.patch_jump(handler).unwrap();
        halt(&mut c);

        let mut p = program(c);
        p.functions.push(function("fail", 0, f));
        let (mut vm, result) = run(&p);
        result.unwrap();
        assert_eq!(vm.registers().depth(), 1);
        assert_eq!(vm.registers_mut().get(r(3)), Value::string("boom"));
    }

    #[test]
    fn test_uncaught_throw() {
        let mut c = Chunk::new();
        let k = c.add_constant(Constant::Str("bad".into())).unwrap();
        c.emit(OpCode::LoadConst, &[reg(0), Arg::Const(k)], sp());
        c.emit(OpCode::Throw, &[reg(0)], sp());

        assert_error(&program(c), RuntimeErrorKind::Thrown, "bad");
    }

    #[test]
    fn test_try_depth_limit() {
        let mut c = Chunk::new();
        for _ in 0..3 {
            c.emit_jump(OpCode::TryBegin, &[r(0)], sp());
        }
        halt(&mut c);

        let config = VmConfig {
            max_try_depth: 2,
            ..VmConfig::default()
        };
        let (_, result) = run_with(&program(c), config);
        let e = result.unwrap_err();
        assert_eq!(e.kind, RuntimeErrorKind::Limit);
        assert!(e.message.contains("too many nested try blocks"));
    }

    #[test]
    fn test_error_span_from_chunk() {
        let mut c = Chunk::new();
        load_i32(&mut c, 1, 1);
        load_i32(&mut c, 2, 0);
        c.emit(
            OpCode::ModI32,
            &[reg(0), reg(1), reg(2)],
            Span::new(3, 7),
        );
        halt(&mut c);

        let (_, result) = run(&program(c));
        assert_eq!(result.unwrap_err().span, Some(Span::new(3, 7)));
    }

    // ============================================================
    // Runtime services
    // ============================================================

    #[test]
    fn test_print_output() {
        let mut c = Chunk::new();
        let k = c.add_constant(Constant::Str("hi".into())).unwrap();
        c.emit(OpCode::LoadConst, &[reg(0), Arg::Const(k)], sp());
        c.emit(OpCode::Print, &[reg(0)], sp());
        load_i32(&mut c, 1, 7);
        c.emit(OpCode::Print, &[reg(1)], sp());
        halt(&mut c);

        let out = Capture::default();
        let mut vm = Vm::new().with_output(Box::new(out.clone()));
        vm.run(&program(c)).unwrap();
        assert_eq!(out.text(), "hi\n7\n");
    }

    #[test]
    fn test_gc_pause_reconciles() {
        let mut c = Chunk::new();
        load_i32(&mut c, 0, 0);
        load_i32(&mut c, 1, 2);
        binary(&mut c, OpCode::AddI32, 0, 1, 1);
        c.emit(OpCode::GcPause, &[], sp());
        halt(&mut c);

        let (mut vm, result) = run(&program(c));
        result.unwrap();
        assert!(!vm.registers().typed().has_dirty());
        assert_eq!(vm.registers().peek(r(0)), Value::I32(4));
        vm.collect_garbage();
    }

    #[test]
    fn test_module_switch() {
        let mut c = Chunk::new();
        load_i32(&mut c, 240, 1);
        c.emit(OpCode::SwitchModule, &[Arg::Byte(1)], sp());
        load_i32(&mut c, 240, 2);
        c.emit(OpCode::SwitchModule, &[Arg::Byte(0)], sp());
        halt(&mut c);

        let (mut vm, result) = run(&program(c));
        result.unwrap();
        assert_eq!(vm.registers().active_module(), 0);
        assert_eq!(vm.registers_mut().get(r(240)), Value::I32(1));
    }
}
