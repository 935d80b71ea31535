#![forbid(unsafe_code)]

//! Compiles a recorded task graph into replayable bytecode.
//!
//! One compilation pass: the graph builder replays the recorded operation
//! stream into a node arena, the dependency scheduler derives a
//! synchronization-respecting emission order, the assembler encodes each
//! scheduled operation (chunked when batching is enabled), and the peephole
//! finalizer guarantees the program ends host-synchronized.

pub mod graph;

mod batch;
mod compile;
mod error;
mod peephole;
mod schedule;

#[cfg(test)]
mod tests;

pub use compile::{CompileOptions, compile, compile_with_options};
pub use error::{CompileError, GraphError};
pub use graph::builder::build_graph;
