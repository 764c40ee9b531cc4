use crate::lang::value::Value;
use crate::regalloc::RegisterId;
use std::cell::RefCell;
use std::rc::Rc;

/// A captured variable.
#[derive(Debug, Clone, PartialEq)]
pub enum Upvalue {
    /// Still lives in a register of frame number `frame`.
    Open { frame: usize, reg: RegisterId },
    /// Copied out when its frame or scope ended.
    Closed(Value),
}

pub type UpvalueRef = Rc<RefCell<Upvalue>>;

/// A function value together with its captured variables.
#[derive(Debug)]
pub struct Closure {
    pub function: u16,
    pub upvalues: Vec<UpvalueRef>,
}
