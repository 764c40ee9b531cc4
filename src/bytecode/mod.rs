pub mod chunk;
pub mod compile;
pub mod compile_error;
pub mod decode;
pub mod disasm;
pub mod jump_table;
pub mod op;

pub use chunk::{Chunk, ChunkRef, Constant, FunctionProto, Program};
pub use compile::{Compiler, compile};
pub use compile_error::CompileError;
pub use op::OpCode;
