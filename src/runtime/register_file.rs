use super::spill::{SpillManager, SpillStore};
use super::typed::TypedRegisters;
use super::upvalue::{Closure, Upvalue, UpvalueRef};
use crate::bytecode::chunk::ChunkRef;
use crate::lang::value::{Scalar, ScalarType, Value};
use crate::regalloc::{Bank, Location, RegisterId, RegisterLayout};
use std::cell::RefCell;
use std::rc::Rc;
use tracing::debug;

/// Where execution resumes in the caller once a frame returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReturnLink {
    pub chunk: ChunkRef,
    pub ip: usize,
    pub result: RegisterId,
}

/// One activation record.
#[derive(Debug)]
pub struct CallFrame {
    /// Frame-relative window: register `FRAME + i` is `locals[i]`.
    pub locals: Vec<Value>,
    pub spill: SpillManager,
    /// Index of the calling frame.
    pub parent: Option<usize>,
    pub chunk: ChunkRef,
    pub name: String,
    pub return_to: Option<ReturnLink>,
    /// The caller's temp bank, restored on return.
    pub saved_temps: Vec<Value>,
    /// Upvalues of the closure being run, if the callee was a closure.
    pub closure: Option<Rc<Closure>>,
}

impl CallFrame {
    fn new(layout: &RegisterLayout, chunk: ChunkRef, name: &str) -> Self {
        CallFrame {
            locals: vec![Value::Nil; layout.capacity(Bank::Frame)],
            spill: SpillManager::new(layout.spill_start()),
            parent: None,
            chunk,
            name: name.to_string(),
            return_to: None,
            saved_temps: Vec::new(),
            closure: None,
        }
    }
}

/// All runtime register storage.
///
/// Frames form a stack: `callers[i]` is frame `i`, and `current` is frame
/// `callers.len()`. The root frame runs top-level code and is never popped.
#[derive(Debug)]
pub struct RegisterFile {
    layout: RegisterLayout,
    globals: Vec<Value>,
    temps: Vec<Value>,
    modules: Vec<Vec<Value>>,
    active_module: usize,
    current: CallFrame,
    callers: Vec<CallFrame>,
    typed: TypedRegisters,
    /// Open upvalues in creation order, each with its sequence number.
    open_upvalues: Vec<(usize, UpvalueRef)>,
    /// Upvalues opened so far; the next one gets this sequence number.
    opened: usize,
}

impl RegisterFile {
    pub fn new(layout: RegisterLayout) -> Self {
        RegisterFile {
            globals: vec![Value::Bool(false); layout.capacity(Bank::Global)],
            temps: vec![Value::Bool(false); layout.capacity(Bank::Temp)],
            modules: vec![vec![Value::Nil; layout.capacity(Bank::Module)]],
            active_module: 0,
            current: CallFrame::new(&layout, ChunkRef::Main, "<main>"),
            callers: Vec::new(),
            typed: TypedRegisters::new(layout.spill_start() as usize),
            open_upvalues: Vec::new(),
            opened: 0,
            layout,
        }
    }

    pub fn layout(&self) -> &RegisterLayout {
        &self.layout
    }

    /// Number of live frames, root included.
    pub fn depth(&self) -> usize {
        self.callers.len() + 1
    }

    pub fn frame_index(&self) -> usize {
        self.callers.len()
    }

    pub fn current_frame(&self) -> &CallFrame {
        &self.current
    }

    pub fn frame(&self, index: usize) -> Option<&CallFrame> {
        if index == self.callers.len() {
            Some(&self.current)
        } else {
            self.callers.get(index)
        }
    }

    /// Names of the live frames, outermost first.
    pub fn frame_names(&self) -> Vec<String> {
        self.callers
            .iter()
            .chain(std::iter::once(&self.current))
            .map(|f| f.name.clone())
            .collect()
    }

    pub fn typed(&self) -> &TypedRegisters {
        &self.typed
    }

    // =========================================================================
    // Boxed access
    // =========================================================================

    /// Boxed read. A dirty shadow is reconciled first.
    pub fn get(&mut self, id: RegisterId) -> Value {
        self.reconcile(id);
        self.load(id)
    }

    /// Boxed write. Any shadow is dropped.
    pub fn set(&mut self, id: RegisterId, value: Value) {
        self.typed.invalidate(id);
        self.store(id, value);
    }

    /// Current logical value without changing any state.
    pub fn peek(&self, id: RegisterId) -> Value {
        match self.typed.residency(id) {
            super::typed::Residency::Dirty(s) => s.to_value(),
            _ => self.load(id),
        }
    }

    fn load(&self, id: RegisterId) -> Value {
        match self.layout.locate(id) {
            Location::Global(slot) => self.globals[slot].clone(),
            Location::Frame(slot) => self.current.locals[slot].clone(),
            Location::Temp(slot) => self.temps[slot].clone(),
            Location::Module(slot) => self.modules[self.active_module][slot].clone(),
            Location::Spill(id) => self.current.spill.load(id),
        }
    }

    fn store(&mut self, id: RegisterId, value: Value) {
        match self.layout.locate(id) {
            Location::Global(slot) => self.globals[slot] = value,
            Location::Frame(slot) => self.current.locals[slot] = value,
            Location::Temp(slot) => self.temps[slot] = value,
            Location::Module(slot) => self.modules[self.active_module][slot] = value,
            Location::Spill(id) => self.current.spill.store(id, value),
        }
    }

    // =========================================================================
    // Typed access
    // =========================================================================

    /// Typed read. On a shadow miss the boxed value is checked and cached.
    /// `Err` carries the actual type name.
    pub fn get_typed(&mut self, id: RegisterId, ty: ScalarType) -> Result<Scalar, &'static str> {
        if let Some(s) = self.typed.get(id, ty) {
            return Ok(s);
        }
        let value = self.get(id);
        match Scalar::from_value(&value) {
            Some(s) if s.ty() == ty => {
                self.typed.cache(id, s);
                Ok(s)
            }
            _ => Err(value.type_name()),
        }
    }

    pub fn set_typed(&mut self, id: RegisterId, value: Scalar) {
        let write_through = self.is_captured(id);
        if let Some(boxed) = self.typed.store(id, value, write_through) {
            self.store(id, boxed);
        }
    }

    pub fn reconcile(&mut self, id: RegisterId) {
        if let Some(value) = self.typed.reconcile(id) {
            self.store(id, value);
        }
    }

    pub fn reconcile_all(&mut self) {
        for (id, value) in self.typed.reconcile_all() {
            self.store(id, value);
        }
    }

    // =========================================================================
    // Frames
    // =========================================================================

    /// Enter a call. Parameters fill the start of the fresh window; the
    /// caller's temps move into the new frame's saved shadow.
    pub fn push_frame(
        &mut self,
        chunk: ChunkRef,
        name: &str,
        args: Vec<Value>,
        link: ReturnLink,
        closure: Option<Rc<Closure>>,
    ) {
        self.reconcile_all();
        self.drop_window_shadows();

        let mut frame = CallFrame::new(&self.layout, chunk, name);
        for (slot, arg) in frame.locals.iter_mut().zip(args) {
            *slot = arg;
        }
        frame.parent = Some(self.callers.len());
        frame.return_to = Some(link);
        frame.closure = closure;
        let fresh_temps = vec![Value::Bool(false); self.temps.len()];
        frame.saved_temps = std::mem::replace(&mut self.temps, fresh_temps);

        let caller = std::mem::replace(&mut self.current, frame);
        self.callers.push(caller);
        debug!(depth = self.depth(), name, "frame pushed");
    }

    /// Leave the current frame. Upvalues into it are closed before the
    /// window goes away. `None` at the root frame.
    pub fn pop_frame(&mut self) -> Option<CallFrame> {
        if self.callers.is_empty() {
            return None;
        }
        self.close_upvalues_from(self.frame_index());
        self.reconcile_all();
        self.drop_window_shadows();

        let caller = self.callers.pop()?;
        let mut done = std::mem::replace(&mut self.current, caller);
        self.temps = std::mem::take(&mut done.saved_temps);
        debug!(depth = self.depth(), name = %done.name, "frame popped");
        Some(done)
    }

    fn drop_window_shadows(&mut self) {
        let start = self.layout.start(Bank::Frame);
        let end = self.layout.start(Bank::Module);
        self.typed.invalidate_range(start, end);
    }

    pub fn switch_module(&mut self, module: u8) {
        self.reconcile_all();
        let start = self.layout.start(Bank::Module);
        self.typed.invalidate_range(start, self.layout.spill_start());

        let index = module as usize;
        let capacity = self.layout.capacity(Bank::Module);
        while self.modules.len() <= index {
            self.modules.push(vec![Value::Nil; capacity]);
        }
        self.active_module = index;
    }

    pub fn active_module(&self) -> usize {
        self.active_module
    }

    // =========================================================================
    // Upvalues
    // =========================================================================

    /// Capture a register of the current frame, sharing an existing open
    /// upvalue for the same slot.
    pub fn capture(&mut self, reg: RegisterId) -> UpvalueRef {
        let frame = self.frame_index();
        if let Some((_, existing)) = self.open_upvalues.iter().find(|(_, uv)| {
            matches!(*uv.borrow(), Upvalue::Open { frame: f, reg: r } if f == frame && r == reg)
        }) {
            return existing.clone();
        }
        // a captured register must stay boxed-authoritative
        self.reconcile(reg);
        let uv = Rc::new(RefCell::new(Upvalue::Open { frame, reg }));
        self.open_upvalues.push((self.opened, uv.clone()));
        self.opened += 1;
        uv
    }

    pub fn is_captured(&self, reg: RegisterId) -> bool {
        let frame = self.frame_index();
        self.open_upvalues.iter().any(|(_, uv)| {
            matches!(*uv.borrow(), Upvalue::Open { frame: f, reg: r } if f == frame && r == reg)
        })
    }

    pub fn open_upvalue_count(&self) -> usize {
        self.open_upvalues.len()
    }

    /// Sequence number the next captured upvalue will get. Pass it to
    /// [`close_upvalues_after`](Self::close_upvalues_after) later.
    pub fn upvalue_mark(&self) -> usize {
        self.opened
    }

    pub fn read_upvalue(&mut self, uv: &UpvalueRef) -> Value {
        let state = uv.borrow().clone();
        match state {
            Upvalue::Closed(v) => v,
            Upvalue::Open { frame, reg } if frame == self.frame_index() => self.get(reg),
            Upvalue::Open { frame, reg } => self.peek_in_frame(frame, reg),
        }
    }

    pub fn write_upvalue(&mut self, uv: &UpvalueRef, value: Value) {
        let state = uv.borrow().clone();
        match state {
            Upvalue::Closed(_) => *uv.borrow_mut() = Upvalue::Closed(value),
            Upvalue::Open { frame, reg } if frame == self.frame_index() => self.set(reg, value),
            Upvalue::Open { frame, reg } => self.store_in_frame(frame, reg, value),
        }
    }

    /// Value of `reg` as seen by frame `frame`, which may be a caller.
    fn peek_in_frame(&self, frame: usize, reg: RegisterId) -> Value {
        if frame == self.frame_index() {
            return self.peek(reg);
        }
        match self.layout.locate(reg) {
            Location::Global(_) | Location::Module(_) => self.load(reg),
            Location::Frame(slot) => self
                .frame(frame)
                .map(|f| f.locals[slot].clone())
                .unwrap_or_default(),
            // a suspended frame's temps sit in its callee's saved shadow
            Location::Temp(slot) => self
                .frame(frame + 1)
                .and_then(|f| f.saved_temps.get(slot).cloned())
                .unwrap_or_default(),
            Location::Spill(id) => self.frame(frame).map(|f| f.spill.load(id)).unwrap_or_default(),
        }
    }

    fn store_in_frame(&mut self, frame: usize, reg: RegisterId, value: Value) {
        let callee = frame + 1;
        match self.layout.locate(reg) {
            Location::Global(_) | Location::Module(_) => self.set(reg, value),
            Location::Frame(slot) => {
                if let Some(f) = self.callers.get_mut(frame) {
                    f.locals[slot] = value;
                }
            }
            Location::Temp(slot) => {
                let target = if callee == self.callers.len() {
                    Some(&mut self.current)
                } else {
                    self.callers.get_mut(callee)
                };
                if let Some(cell) = target.and_then(|f| f.saved_temps.get_mut(slot)) {
                    *cell = value;
                }
            }
            Location::Spill(id) => {
                if let Some(f) = self.callers.get_mut(frame) {
                    f.spill.store(id, value);
                }
            }
        }
    }

    /// Close the open upvalue for `reg` in the current frame, if any.
    pub fn close_upvalue(&mut self, reg: RegisterId) {
        let frame = self.frame_index();
        self.close_where(|_, f, r| f == frame && r == reg);
    }

    /// Close every open upvalue into frame `frame` or deeper.
    pub fn close_upvalues_from(&mut self, frame: usize) {
        self.close_where(|_, f, _| f >= frame);
    }

    /// Close the upvalues into `frame` that were opened at or after `mark`.
    /// Used when an error skips the scope exits that would have closed them.
    pub fn close_upvalues_after(&mut self, frame: usize, mark: usize) {
        self.close_where(|seq, f, _| f == frame && seq >= mark);
    }

    fn close_where(&mut self, pred: impl Fn(usize, usize, RegisterId) -> bool) {
        let open = std::mem::take(&mut self.open_upvalues);
        let mut keep = Vec::with_capacity(open.len());
        for (seq, uv) in open {
            let state = uv.borrow().clone();
            match state {
                Upvalue::Open { frame, reg } if pred(seq, frame, reg) => {
                    let value = self.peek_in_frame(frame, reg);
                    *uv.borrow_mut() = Upvalue::Closed(value);
                }
                _ => keep.push((seq, uv)),
            }
        }
        self.open_upvalues = keep;
    }

    // =========================================================================
    // GC roots
    // =========================================================================

    /// Visit every root value: globals, each frame's window, spill area and
    /// saved temps, the temp bank, module registers, and open upvalues.
    /// Callers reconcile first; a dirty shadow here is a bug.
    pub fn visit_roots(&self, f: &mut dyn FnMut(&Value)) {
        debug_assert!(!self.typed.has_dirty(), "GC observed a dirty register");

        self.globals.iter().for_each(&mut *f);
        self.temps.iter().for_each(&mut *f);
        for block in &self.modules {
            block.iter().for_each(&mut *f);
        }
        for frame in self.callers.iter().chain(std::iter::once(&self.current)) {
            frame.locals.iter().for_each(&mut *f);
            frame.saved_temps.iter().for_each(&mut *f);
            frame.spill.visit(&mut |_, v| f(v));
        }
        for (_, uv) in &self.open_upvalues {
            if let Upvalue::Open { frame, reg } = *uv.borrow() {
                f(&self.peek_in_frame(frame, reg));
            }
        }
    }
}
