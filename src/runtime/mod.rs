//! Execution side: the register file with its typed shadow, spill storage,
//! upvalues, collector hooks and the dispatch loop.

pub mod gc;
pub mod register_file;
pub mod runtime_error;
pub mod spill;
pub mod typed;
pub mod upvalue;
pub mod vm;

pub use runtime_error::{RuntimeError, RuntimeErrorKind};
pub use vm::{InterpretResult, Vm, VmState};
