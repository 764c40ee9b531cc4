//! Single-pass compiler from the front end's AST to register bytecode.
//!
//! The compiler walks the tree once. Registers come from a
//! [`LifetimeAllocator`] that lives as long as the compilation; each function
//! gets its own frame, temp and spill state. Names are bound in a
//! [`ScopeTree`] per function and released when their scope closes.

use super::chunk::{Arg, Chunk, Constant, FunctionProto, JumpPatch, Program};
use super::compile_error::CompileError;
use super::jump_table::JumpTable;
use super::op::OpCode;
use crate::config::CompilerConfig;
use crate::lang::node::{
    self, BinaryOp, Expr, ExprKind, FunctionDecl, Literal, Span, Stmt, StmtKind, UnaryOp,
};
use crate::lang::value::ScalarType;
use crate::regalloc::{
    AllocPolicy, Allocation, Bank, LifetimeAllocator, Local, Location, RegisterId, RegisterKind,
    ScopeId, ScopeKind, ScopeTree,
};
use tracing::debug;

/// Compile a whole program.
pub fn compile(program: &node::Program, config: &CompilerConfig) -> Result<Program, CompileError> {
    Compiler::new(config.clone()).compile_program(program)
}

/// How a name is reached from the function being compiled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Binding {
    Register(RegisterId),
    Upvalue(u8),
}

/// Where an expression's value ended up.
#[derive(Debug, Clone, Copy)]
struct Operand {
    reg: RegisterId,
    /// The register was allocated for this value and must be released.
    temp: bool,
}

/// One entry of a closure's capture list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct UpvalueDesc {
    /// Captures a register of the enclosing function, rather than one of its
    /// upvalues.
    is_local: bool,
    reg: RegisterId,
}

#[derive(Debug)]
struct LoopContext {
    /// Outermost scope owned by the loop; `break` leaves it.
    scope: ScopeId,
    /// Scope of the body; `continue` leaves it.
    body: ScopeId,
    breaks: JumpTable,
    continues: JumpTable,
    /// Backward target for `continue` when it is known up front.
    continue_to: Option<usize>,
    /// Try blocks open when the loop was entered.
    try_depth: usize,
}

#[derive(Debug)]
struct FunctionState {
    name: String,
    script: bool,
    chunk: Chunk,
    scopes: ScopeTree,
    upvalues: Vec<UpvalueDesc>,
    loops: Vec<LoopContext>,
    try_depth: usize,
}

impl FunctionState {
    fn new(name: &str, script: bool) -> Self {
        FunctionState {
            name: name.to_string(),
            script,
            chunk: Chunk::new(),
            scopes: ScopeTree::new(),
            upvalues: Vec::new(),
            loops: Vec::new(),
            try_depth: 0,
        }
    }

    /// Human-readable name for capacity errors.
    fn construct(&self) -> String {
        if self.script {
            "top-level code".to_string()
        } else {
            format!("function '{}'", self.name)
        }
    }
}

/// Compilation context. Holds no global state; one per compilation.
pub struct Compiler {
    config: CompilerConfig,
    alloc: LifetimeAllocator,
    current: FunctionState,
    enclosing: Vec<FunctionState>,
    functions: Vec<FunctionProto>,
    module: Option<u8>,
}

impl Compiler {
    pub fn new(config: CompilerConfig) -> Self {
        Compiler {
            alloc: LifetimeAllocator::new(config.layout.clone(), config.policy),
            config,
            current: FunctionState::new("<main>", true),
            enclosing: Vec::new(),
            functions: Vec::new(),
            module: None,
        }
    }

    pub fn compile_program(mut self, program: &node::Program) -> Result<Program, CompileError> {
        self.module = program.module;
        self.current.scopes.enter(ScopeKind::Function);

        if let Some(module) = program.module {
            self.emit(OpCode::SwitchModule, &[Arg::Byte(module)], Span::default());
        }
        for stmt in &program.body {
            self.stmt(stmt)?;
        }
        self.emit(OpCode::Halt, &[], Span::default());

        debug!(
            functions = self.functions.len(),
            bytes = self.current.chunk.len(),
            "program compiled"
        );
        Ok(Program {
            layout: self.config.layout,
            main: self.current.chunk,
            functions: self.functions,
        })
    }

    // =========================================================================
    // Emission helpers
    // =========================================================================

    fn emit(&mut self, op: OpCode, args: &[Arg], span: Span) -> usize {
        self.current.chunk.emit(op, args, span)
    }

    fn emit_jump(&mut self, op: OpCode, regs: &[RegisterId], span: Span) -> JumpPatch {
        self.current.chunk.emit_jump(op, regs, span)
    }

    fn patch(&mut self, patch: JumpPatch, construct: &str, span: Span) -> Result<(), CompileError> {
        self.current
            .chunk
            .patch_jump(patch)
            .map_err(|distance| CompileError::jump_too_far(construct, distance, span))
    }

    fn emit_loop(&mut self, start: usize, span: Span) -> Result<(), CompileError> {
        self.current
            .chunk
            .emit_loop(start, span)
            .map_err(|distance| CompileError::jump_too_far("loop body", distance, span))
    }

    fn here(&self) -> usize {
        self.current.chunk.len()
    }

    fn constant(&mut self, constant: Constant, span: Span) -> Result<u16, CompileError> {
        self.current
            .chunk
            .add_constant(constant)
            .ok_or(CompileError::TooManyConstants { span })
    }

    fn typed_policy(&self) -> bool {
        self.alloc.policy() == AllocPolicy::PreferTyped
    }

    // =========================================================================
    // Registers and scopes
    // =========================================================================

    fn allocate(
        &mut self,
        kind: RegisterKind,
        ty: Option<ScalarType>,
        name: Option<&str>,
        span: Span,
    ) -> Result<Allocation, CompileError> {
        let at = self.here();
        // Values without a scalar type never get a typed shadow.
        let policy = match ty {
            Some(_) => self.alloc.policy(),
            None => AllocPolicy::Standard,
        };
        self.alloc
            .allocate_with_policy(kind, ty, name, at, policy)
            .map_err(|_| CompileError::too_many_locals(self.current.construct(), span))
    }

    fn temp(&mut self, ty: Option<ScalarType>, span: Span) -> Result<RegisterId, CompileError> {
        Ok(self.allocate(RegisterKind::Temp, ty, None, span)?.id)
    }

    fn release(&mut self, operand: Operand) {
        if operand.temp {
            self.alloc.free_smart(operand.reg);
        }
    }

    /// Kind for a named binding in the current position. Only the outermost
    /// scope of top-level code is global (or module) storage.
    fn binding_kind(&self) -> RegisterKind {
        if self.current.script && self.current.scopes.depth() == 1 {
            match self.module {
                Some(_) => RegisterKind::Module,
                None => RegisterKind::Global,
            }
        } else {
            RegisterKind::Frame
        }
    }

    fn declare(&mut self, name: &str, alloc: Allocation, ty: Option<ScalarType>) {
        self.current.scopes.declare(Local {
            name: name.to_string(),
            reg: alloc.id,
            ty,
            repr: alloc.repr,
            captured: false,
        });
    }

    /// Close the innermost scope: captured locals get `CLOSE_UPVALUE`, then
    /// every register goes back to the allocator.
    fn end_scope(&mut self, span: Span) {
        for local in self.current.scopes.exit() {
            if local.captured {
                self.emit(OpCode::CloseUpvalue, &[Arg::Reg(local.reg)], span);
            }
            self.alloc.free_smart(local.reg);
        }
    }

    fn scoped_block(&mut self, body: &[Stmt], span: Span) -> Result<(), CompileError> {
        self.current.scopes.enter(ScopeKind::Block);
        for stmt in body {
            self.stmt(stmt)?;
        }
        self.end_scope(span);
        Ok(())
    }

    // =========================================================================
    // Name resolution
    // =========================================================================

    fn state_at(&mut self, level: usize) -> &mut FunctionState {
        if level < self.enclosing.len() {
            &mut self.enclosing[level]
        } else {
            &mut self.current
        }
    }

    fn resolve(&mut self, name: &str, span: Span) -> Result<Binding, CompileError> {
        let level = self.enclosing.len();
        self.resolve_at(level, name, span)?
            .ok_or_else(|| CompileError::undefined(name, span))
    }

    /// Resolve `name` as seen from function `level`. Registers of an
    /// enclosing function become upvalues unless they sit in the global or
    /// module bank, which every frame addresses directly.
    fn resolve_at(
        &mut self,
        level: usize,
        name: &str,
        span: Span,
    ) -> Result<Option<Binding>, CompileError> {
        if let Some(local) = self.state_at(level).scopes.resolve(name) {
            return Ok(Some(Binding::Register(local.reg)));
        }
        if level == 0 {
            return Ok(None);
        }

        let binding = match self.resolve_at(level - 1, name, span)? {
            None => return Ok(None),
            Some(Binding::Register(reg)) if self.is_shared(reg) => Binding::Register(reg),
            Some(Binding::Register(reg)) => {
                self.state_at(level - 1).scopes.mark_captured(name);
                Binding::Upvalue(self.add_upvalue(level, true, reg, span)?)
            }
            Some(Binding::Upvalue(index)) => {
                let reg = RegisterId(index as u16);
                Binding::Upvalue(self.add_upvalue(level, false, reg, span)?)
            }
        };
        Ok(Some(binding))
    }

    fn is_shared(&self, reg: RegisterId) -> bool {
        matches!(
            self.alloc.layout().locate(reg),
            Location::Global(_) | Location::Module(_)
        )
    }

    fn add_upvalue(
        &mut self,
        level: usize,
        is_local: bool,
        reg: RegisterId,
        span: Span,
    ) -> Result<u8, CompileError> {
        let state = self.state_at(level);
        let desc = UpvalueDesc { is_local, reg };
        if let Some(i) = state.upvalues.iter().position(|u| *u == desc) {
            return Ok(i as u8);
        }
        let index = u8::try_from(state.upvalues.len())
            .ok()
            .filter(|i| *i < u8::MAX)
            .ok_or_else(|| CompileError::TooManyUpvalues {
                name: state.name.clone(),
                span,
            })?;
        state.upvalues.push(desc);
        Ok(index)
    }

    // =========================================================================
    // Statements
    // =========================================================================

    fn stmt(&mut self, stmt: &Stmt) -> Result<(), CompileError> {
        let span = stmt.span;
        match &stmt.kind {
            StmtKind::Let { name, value } => {
                let kind = self.binding_kind();
                let alloc = self.allocate(kind, value.ty, Some(name.as_str()), span)?;
                self.expr_to(value, alloc.id)?;
                self.declare(name, alloc, value.ty);
            }
            StmtKind::Assign { name, value } => match self.resolve(name, span)? {
                Binding::Register(reg) => self.expr_to(value, reg)?,
                Binding::Upvalue(index) => {
                    let v = self.expr(value)?;
                    self.emit(OpCode::SetUpvalue, &[Arg::Byte(index), Arg::Reg(v.reg)], span);
                    self.release(v);
                }
            },
            StmtKind::Expr(e) => {
                let v = self.expr(e)?;
                self.release(v);
            }
            StmtKind::Print(e) => {
                let v = self.expr(e)?;
                self.emit(OpCode::Print, &[Arg::Reg(v.reg)], span);
                self.release(v);
            }
            StmtKind::Block(body) => self.scoped_block(body, span)?,
            StmtKind::If {
                cond,
                then_branch,
                else_branch,
            } => self.if_stmt(cond, then_branch, else_branch.as_deref(), span)?,
            StmtKind::While { cond, body } => self.while_stmt(cond, body, span)?,
            StmtKind::ForRange {
                var,
                start,
                end,
                body,
            } => self.for_range(var, start, end, body, span)?,
            StmtKind::Break => self.break_stmt(span)?,
            StmtKind::Continue => self.continue_stmt(span)?,
            StmtKind::Function(decl) => {
                // bound before the body so it can call itself
                let kind = self.binding_kind();
                let alloc = self.allocate(kind, None, Some(decl.name.as_str()), span)?;
                self.declare(&decl.name, alloc, None);
                self.function(decl, alloc.id, span)?;
            }
            StmtKind::Return(value) => match value {
                Some(e) => {
                    let v = self.expr(e)?;
                    self.emit(OpCode::Return, &[Arg::Reg(v.reg)], span);
                    self.release(v);
                }
                None => {
                    self.emit(OpCode::ReturnVoid, &[], span);
                }
            },
            StmtKind::Try {
                body,
                catch_name,
                handler,
            } => self.try_stmt(body, catch_name.as_deref(), handler, span)?,
            StmtKind::Throw(e) => {
                let v = self.expr(e)?;
                self.emit(OpCode::Throw, &[Arg::Reg(v.reg)], span);
                self.release(v);
            }
        }
        Ok(())
    }

    fn if_stmt(
        &mut self,
        cond: &Expr,
        then_branch: &[Stmt],
        else_branch: Option<&[Stmt]>,
        span: Span,
    ) -> Result<(), CompileError> {
        let c = self.expr(cond)?;
        let else_jump = self.emit_jump(OpCode::JumpIfNot, &[c.reg], span);
        self.release(c);

        self.scoped_block(then_branch, span)?;
        match else_branch {
            Some(els) => {
                let end = self.emit_jump(OpCode::Jump, &[], span);
                self.patch(else_jump, "if statement", span)?;
                self.scoped_block(els, span)?;
                self.patch(end, "if statement", span)?;
            }
            None => self.patch(else_jump, "if statement", span)?,
        }
        Ok(())
    }

    fn push_loop(&mut self, scope: ScopeId, body: ScopeId, continue_to: Option<usize>) {
        let try_depth = self.current.try_depth;
        self.current.loops.push(LoopContext {
            scope,
            body,
            breaks: JumpTable::new(),
            continues: JumpTable::new(),
            continue_to,
            try_depth,
        });
    }

    fn pop_loop(&mut self) -> Result<LoopContext, CompileError> {
        self.current
            .loops
            .pop()
            .ok_or_else(|| CompileError::internal("loop context underflow"))
    }

    fn while_stmt(&mut self, cond: &Expr, body: &[Stmt], span: Span) -> Result<(), CompileError> {
        let start = self.here();
        let c = self.expr(cond)?;
        let exit = self.emit_jump(OpCode::JumpIfNot, &[c.reg], span);
        self.release(c);

        let scope = self.current.scopes.enter(ScopeKind::Loop);
        self.push_loop(scope, scope, Some(start));
        for stmt in body {
            self.stmt(stmt)?;
        }
        self.end_scope(span);
        let ctx = self.pop_loop()?;

        self.emit_loop(start, span)?;
        self.patch(exit, "while loop", span)?;
        ctx.breaks
            .patch_all(&mut self.current.chunk, "while loop", span)
    }

    /// `for var in start..end`. The induction register is pinned to its
    /// typed representation until the loop exits.
    fn for_range(
        &mut self,
        var: &str,
        start: &Expr,
        end: &Expr,
        body: &[Stmt],
        span: Span,
    ) -> Result<(), CompileError> {
        let i32_ty = Some(ScalarType::I32);
        let outer = self.current.scopes.enter(ScopeKind::Loop);
        let kind = self.binding_kind();

        let induction = self.allocate(kind, i32_ty, Some(var), span)?;
        self.expr_to(start, induction.id)?;
        let limit = self.allocate(kind, i32_ty, None, span)?;
        self.expr_to(end, limit.id)?;
        self.declare(var, induction, i32_ty);
        let pinned = self.alloc.pin(induction.id);

        let loop_start = self.here();
        let cond = self.temp(Some(ScalarType::Bool), span)?;
        let lt = if self.typed_policy() {
            OpCode::LtI32
        } else {
            OpCode::Lt
        };
        self.emit(
            lt,
            &[Arg::Reg(cond), Arg::Reg(induction.id), Arg::Reg(limit.id)],
            span,
        );
        let exit = self.emit_jump(OpCode::JumpIfNot, &[cond], span);
        self.alloc.free_smart(cond);

        let body_scope = self.current.scopes.enter(ScopeKind::Block);
        self.push_loop(outer, body_scope, None);
        for stmt in body {
            self.stmt(stmt)?;
        }
        self.end_scope(span);
        let ctx = self.pop_loop()?;
        ctx.continues
            .patch_all(&mut self.current.chunk, "for loop", span)?;

        self.increment(induction.id, span)?;
        self.emit_loop(loop_start, span)?;
        self.patch(exit, "for loop", span)?;
        ctx.breaks
            .patch_all(&mut self.current.chunk, "for loop", span)?;

        // the pin holds the free back until the loop is fully closed
        self.end_scope(span);
        if pinned {
            self.alloc.unpin(induction.id);
        }
        self.alloc.free_smart(limit.id);
        Ok(())
    }

    fn increment(&mut self, reg: RegisterId, span: Span) -> Result<(), CompileError> {
        if self.typed_policy() {
            self.emit(OpCode::IncI32, &[Arg::Reg(reg)], span);
            return Ok(());
        }
        let one = self.temp(Some(ScalarType::I32), span)?;
        let k = self.constant(Constant::I32(1), span)?;
        self.emit(OpCode::LoadConst, &[Arg::Reg(one), Arg::Const(k)], span);
        self.emit(
            OpCode::Add,
            &[Arg::Reg(reg), Arg::Reg(reg), Arg::Reg(one)],
            span,
        );
        self.alloc.free_smart(one);
        Ok(())
    }

    /// Close captured locals and open try blocks between here and `scope`.
    fn leave_to(&mut self, scope: ScopeId, try_depth: usize, span: Span) {
        for reg in self.current.scopes.captured_until(scope) {
            self.emit(OpCode::CloseUpvalue, &[Arg::Reg(reg)], span);
        }
        for _ in try_depth..self.current.try_depth {
            self.emit(OpCode::TryEnd, &[], span);
        }
    }

    fn break_stmt(&mut self, span: Span) -> Result<(), CompileError> {
        let (scope, try_depth) = match self.current.loops.last() {
            Some(ctx) => (ctx.scope, ctx.try_depth),
            None => {
                return Err(CompileError::OutsideLoop {
                    keyword: "break",
                    span,
                });
            }
        };
        self.leave_to(scope, try_depth, span);
        let patch = self.emit_jump(OpCode::Jump, &[], span);
        if let Some(ctx) = self.current.loops.last_mut() {
            ctx.breaks.push(patch);
        }
        Ok(())
    }

    fn continue_stmt(&mut self, span: Span) -> Result<(), CompileError> {
        let (body, try_depth, continue_to) = match self.current.loops.last() {
            Some(ctx) => (ctx.body, ctx.try_depth, ctx.continue_to),
            None => {
                return Err(CompileError::OutsideLoop {
                    keyword: "continue",
                    span,
                });
            }
        };
        self.leave_to(body, try_depth, span);
        match continue_to {
            Some(start) => self.emit_loop(start, span)?,
            None => {
                let patch = self.emit_jump(OpCode::Jump, &[], span);
                if let Some(ctx) = self.current.loops.last_mut() {
                    ctx.continues.push(patch);
                }
            }
        }
        Ok(())
    }

    fn try_stmt(
        &mut self,
        body: &[Stmt],
        catch_name: Option<&str>,
        handler: &[Stmt],
        span: Span,
    ) -> Result<(), CompileError> {
        let kind = self.binding_kind();
        let catch = self.allocate(kind, None, catch_name, span)?;
        let handler_jump = self.emit_jump(OpCode::TryBegin, &[catch.id], span);

        self.current.try_depth += 1;
        let result = self.scoped_block(body, span);
        self.current.try_depth -= 1;
        result?;
        self.emit(OpCode::TryEnd, &[], span);
        let end = self.emit_jump(OpCode::Jump, &[], span);

        self.patch(handler_jump, "try block", span)?;
        self.current.scopes.enter(ScopeKind::Block);
        if let Some(name) = catch_name {
            self.declare(name, catch, None);
        }
        for stmt in handler {
            self.stmt(stmt)?;
        }
        self.end_scope(span);
        if catch_name.is_none() {
            self.alloc.free_smart(catch.id);
        }
        self.patch(end, "try block", span)
    }

    // =========================================================================
    // Functions
    // =========================================================================

    /// Compile `decl` into a new function and put its value in `dst`: a
    /// plain function constant, or a closure when it captures anything.
    fn function(
        &mut self,
        decl: &FunctionDecl,
        dst: RegisterId,
        span: Span,
    ) -> Result<(), CompileError> {
        let max = self
            .alloc
            .layout()
            .capacity(Bank::Frame)
            .min(u8::MAX as usize);
        if decl.params.len() > max {
            return Err(CompileError::TooManyParameters {
                name: decl.name.clone(),
                count: decl.params.len(),
                max,
                span,
            });
        }
        let index = u16::try_from(self.functions.len())
            .map_err(|_| CompileError::TooManyFunctions { span })?;
        self.functions.push(FunctionProto {
            name: decl.name.clone(),
            arity: decl.params.len() as u8,
            upvalue_count: 0,
            chunk: Chunk::new(),
        });

        let outer = std::mem::replace(&mut self.current, FunctionState::new(&decl.name, false));
        self.enclosing.push(outer);
        self.alloc.enter_function();
        if self.alloc.function_depth() != self.enclosing.len() {
            return Err(CompileError::internal("allocator and compiler disagree on nesting"));
        }

        let result = self.function_body(decl, span);

        let usage = self.alloc.exit_function();
        let inner = match self.enclosing.pop() {
            Some(outer) => std::mem::replace(&mut self.current, outer),
            None => return Err(CompileError::internal("function context underflow")),
        };
        result?;
        debug!(
            name = %decl.name,
            index,
            depth = self.enclosing.len() + 1,
            bytes = inner.chunk.len(),
            upvalues = inner.upvalues.len(),
            spill_slots = usage.map_or(0, |u| u.spill_slots),
            "function compiled"
        );

        let captures: Vec<(bool, RegisterId)> =
            inner.upvalues.iter().map(|u| (u.is_local, u.reg)).collect();
        self.functions[index as usize] = FunctionProto {
            name: decl.name.clone(),
            arity: decl.params.len() as u8,
            upvalue_count: captures.len() as u8,
            chunk: inner.chunk,
        };

        if captures.is_empty() {
            let k = self.constant(Constant::Function(index), span)?;
            self.emit(OpCode::LoadConst, &[Arg::Reg(dst), Arg::Const(k)], span);
        } else {
            self.emit(
                OpCode::Closure,
                &[Arg::Reg(dst), Arg::Func(index), Arg::Captures(captures)],
                span,
            );
        }
        Ok(())
    }

    fn function_body(&mut self, decl: &FunctionDecl, span: Span) -> Result<(), CompileError> {
        self.current.scopes.enter(ScopeKind::Function);

        // parameter i arrives in frame slot i
        let base = self.alloc.layout().start(Bank::Frame);
        for (i, param) in decl.params.iter().enumerate() {
            let id = RegisterId(base + i as u16);
            let alloc = self
                .alloc
                .reserve(id, param.ty, Some(param.name.as_str()))
                .ok_or_else(|| CompileError::internal(format!("parameter slot {} in use", id)))?;
            self.declare(&param.name, alloc, param.ty);
        }

        for stmt in &decl.body {
            self.stmt(stmt)?;
        }
        self.emit(OpCode::ReturnVoid, &[], span);
        Ok(())
    }

    // =========================================================================
    // Expressions
    // =========================================================================

    /// Compile `e` and report the register holding its value. Variables in
    /// reach are used in place; everything else gets a temporary.
    fn expr(&mut self, e: &Expr) -> Result<Operand, CompileError> {
        if let ExprKind::Variable(name) = &e.kind {
            if let Binding::Register(reg) = self.resolve(name, e.span)? {
                let at = self.here();
                self.alloc.mark_last_use(reg, at);
                return Ok(Operand { reg, temp: false });
            }
        }
        let reg = self.temp(e.ty, e.span)?;
        self.expr_to(e, reg)?;
        Ok(Operand { reg, temp: true })
    }

    /// Compile `e` so that its value lands in `dst`.
    fn expr_to(&mut self, e: &Expr, dst: RegisterId) -> Result<(), CompileError> {
        let span = e.span;
        match &e.kind {
            ExprKind::Literal(lit) => self.literal(lit, dst, span)?,
            ExprKind::Variable(name) => match self.resolve(name, span)? {
                Binding::Register(src) => {
                    if src != dst {
                        self.emit(OpCode::Move, &[Arg::Reg(dst), Arg::Reg(src)], span);
                    }
                }
                Binding::Upvalue(index) => {
                    self.emit(OpCode::GetUpvalue, &[Arg::Reg(dst), Arg::Byte(index)], span);
                }
            },
            ExprKind::Binary { op, lhs, rhs } if matches!(op, BinaryOp::And | BinaryOp::Or) => {
                self.logical(*op, lhs, rhs, dst, span)?
            }
            ExprKind::Binary { op, lhs, rhs } => {
                let a = self.expr(lhs)?;
                let b = self.expr(rhs)?;
                let opcode = self.binary_opcode(*op, lhs.ty, rhs.ty);
                self.emit(
                    opcode,
                    &[Arg::Reg(dst), Arg::Reg(a.reg), Arg::Reg(b.reg)],
                    span,
                );
                self.release(b);
                self.release(a);
            }
            ExprKind::Unary { op, operand } => {
                let v = self.expr(operand)?;
                let opcode = match op {
                    UnaryOp::Neg => OpCode::Neg,
                    UnaryOp::Not => OpCode::Not,
                };
                self.emit(opcode, &[Arg::Reg(dst), Arg::Reg(v.reg)], span);
                self.release(v);
            }
            ExprKind::Call { callee, args } => {
                if args.len() > u8::MAX as usize {
                    return Err(CompileError::TooManyArguments {
                        count: args.len(),
                        span,
                    });
                }
                let f = self.expr(callee)?;
                let mut values = Vec::with_capacity(args.len());
                for arg in args {
                    values.push(self.expr(arg)?);
                }
                let regs = values.iter().map(|v| v.reg).collect();
                self.emit(
                    OpCode::Call,
                    &[Arg::Reg(f.reg), Arg::Reg(dst), Arg::Args(regs)],
                    span,
                );
                for v in values.into_iter().rev() {
                    self.release(v);
                }
                self.release(f);
            }
            ExprKind::Lambda(decl) => self.function(decl, dst, span)?,
        }
        Ok(())
    }

    fn literal(&mut self, lit: &Literal, dst: RegisterId, span: Span) -> Result<(), CompileError> {
        let typed = self.typed_policy();
        let d = Arg::Reg(dst);
        match lit {
            Literal::Nil => {
                self.emit(OpCode::LoadNil, &[d], span);
            }
            Literal::Bool(true) => {
                self.emit(OpCode::LoadTrue, &[d], span);
            }
            Literal::Bool(false) => {
                self.emit(OpCode::LoadFalse, &[d], span);
            }
            Literal::I32(n) if typed => {
                self.emit(OpCode::LoadI32, &[d, Arg::Imm32(*n)], span);
            }
            Literal::I64(n) if typed => {
                self.emit(OpCode::LoadI64, &[d, Arg::Imm64(*n as u64)], span);
            }
            Literal::F64(x) if typed => {
                self.emit(OpCode::LoadF64, &[d, Arg::Imm64(x.to_bits())], span);
            }
            other => {
                let constant = match other {
                    Literal::I32(n) => Constant::I32(*n),
                    Literal::I64(n) => Constant::I64(*n),
                    Literal::U32(n) => Constant::U32(*n),
                    Literal::U64(n) => Constant::U64(*n),
                    Literal::F64(x) => Constant::F64(*x),
                    Literal::Str(s) => Constant::Str(s.clone()),
                    Literal::Bool(b) => Constant::Bool(*b),
                    Literal::Nil => Constant::Nil,
                };
                let k = self.constant(constant, span)?;
                self.emit(OpCode::LoadConst, &[d, Arg::Const(k)], span);
            }
        }
        Ok(())
    }

    /// Short-circuit `and`/`or`. Built in a fresh temporary so `dst` is not
    /// clobbered while the right side may still read it.
    fn logical(
        &mut self,
        op: BinaryOp,
        lhs: &Expr,
        rhs: &Expr,
        dst: RegisterId,
        span: Span,
    ) -> Result<(), CompileError> {
        let tmp = self.temp(Some(ScalarType::Bool), span)?;
        self.expr_to(lhs, tmp)?;
        if op == BinaryOp::And {
            let end = self.emit_jump(OpCode::JumpIfNot, &[tmp], span);
            self.expr_to(rhs, tmp)?;
            self.patch(end, "logical and", span)?;
        } else {
            let rhs_jump = self.emit_jump(OpCode::JumpIfNot, &[tmp], span);
            let end = self.emit_jump(OpCode::Jump, &[], span);
            self.patch(rhs_jump, "logical or", span)?;
            self.expr_to(rhs, tmp)?;
            self.patch(end, "logical or", span)?;
        }
        self.emit(OpCode::Move, &[Arg::Reg(dst), Arg::Reg(tmp)], span);
        self.alloc.free_smart(tmp);
        Ok(())
    }

    /// Typed opcode when both sides share a scalar type it covers, the
    /// generic one otherwise.
    fn binary_opcode(
        &self,
        op: BinaryOp,
        lhs: Option<ScalarType>,
        rhs: Option<ScalarType>,
    ) -> OpCode {
        if self.typed_policy() {
            if let (Some(a), Some(b)) = (lhs, rhs) {
                if let Some(typed) = typed_opcode(op, a).filter(|_| a == b) {
                    return typed;
                }
            }
        }
        match op {
            BinaryOp::Add => OpCode::Add,
            BinaryOp::Sub => OpCode::Sub,
            BinaryOp::Mul => OpCode::Mul,
            BinaryOp::Div => OpCode::Div,
            BinaryOp::Mod => OpCode::Mod,
            BinaryOp::Eq => OpCode::Eq,
            BinaryOp::Ne => OpCode::Ne,
            BinaryOp::Lt => OpCode::Lt,
            BinaryOp::Le => OpCode::Le,
            BinaryOp::Gt => OpCode::Gt,
            BinaryOp::Ge => OpCode::Ge,
            // handled by `logical`
            BinaryOp::And | BinaryOp::Or => OpCode::Eq,
        }
    }
}

fn typed_opcode(op: BinaryOp, ty: ScalarType) -> Option<OpCode> {
    use BinaryOp as B;
    use OpCode::*;
    use ScalarType as T;

    let code = match (op, ty) {
        (B::Add, T::I32) => AddI32,
        (B::Sub, T::I32) => SubI32,
        (B::Mul, T::I32) => MulI32,
        (B::Div, T::I32) => DivI32,
        (B::Mod, T::I32) => ModI32,
        (B::Add, T::I64) => AddI64,
        (B::Sub, T::I64) => SubI64,
        (B::Mul, T::I64) => MulI64,
        (B::Div, T::I64) => DivI64,
        (B::Mod, T::I64) => ModI64,
        (B::Add, T::U32) => AddU32,
        (B::Sub, T::U32) => SubU32,
        (B::Mul, T::U32) => MulU32,
        (B::Div, T::U32) => DivU32,
        (B::Mod, T::U32) => ModU32,
        (B::Add, T::U64) => AddU64,
        (B::Sub, T::U64) => SubU64,
        (B::Mul, T::U64) => MulU64,
        (B::Div, T::U64) => DivU64,
        (B::Mod, T::U64) => ModU64,
        (B::Add, T::F64) => AddF64,
        (B::Sub, T::F64) => SubF64,
        (B::Mul, T::F64) => MulF64,
        (B::Div, T::F64) => DivF64,
        (B::Mod, T::F64) => ModF64,
        (B::Lt, T::I32) => LtI32,
        (B::Le, T::I32) => LeI32,
        (B::Gt, T::I32) => GtI32,
        (B::Ge, T::I32) => GeI32,
        (B::Lt, T::I64) => LtI64,
        (B::Le, T::I64) => LeI64,
        (B::Gt, T::I64) => GtI64,
        (B::Ge, T::I64) => GeI64,
        (B::Lt, T::F64) => LtF64,
        (B::Le, T::F64) => LeF64,
        (B::Gt, T::F64) => GtF64,
        (B::Ge, T::F64) => GeF64,
        _ => return None,
    };
    Some(code)
}
