#![forbid(unsafe_code)]

//! Shared surface between the task-graph compiler and the bytecode executor:
//! the wire format, the capacity-bounded assembler, the disassembler, the
//! execution-context query surface and the recorded-operation stream format.

pub mod assembler;
pub mod bytecode;
pub mod context;
pub mod disasm;
pub mod record;

pub use assembler::{BytecodeAssembler, CompiledBytecode};
pub use bytecode::{Bytecode, BytecodeError, NO_DEPENDENCY};
