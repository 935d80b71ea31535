use taskvm_runtime::bytecode::BytecodeError;
use taskvm_runtime::context::ElementKind;
use thiserror::Error;

use crate::graph::NodeId;

/// Integrity violations encountered while replaying the record stream.
/// The builder fails fast; a partially built graph is never compiled.
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("truncated record stream at offset {offset}")]
    TruncatedRecord { offset: usize },

    #[error("no device context selected before {record} record")]
    NoContext { record: &'static str },

    #[error("no argument list open before {record} record")]
    NoOpenArgList { record: &'static str },

    #[error("argument list overflow: task declared {declared} argument slots")]
    TooManyArguments { declared: usize },

    #[error("task launched with {loaded} of {declared} declared arguments")]
    MissingArguments { declared: usize, loaded: usize },

    #[error("unknown object index {index}")]
    UnknownObject { index: usize },

    #[error("unknown constant index {index}")]
    UnknownConstant { index: usize },

    #[error("unknown task index {index}")]
    UnknownTask { index: usize },

    #[error("access-mode table for task {task} has no entry for argument {arg}")]
    MissingAccessMode { task: usize, arg: usize },

    #[error("no device mapping for logical task id {global_task_id}")]
    UnmappedTask { global_task_id: u32 },

    #[error("stream-in object {object} has no consumer: multiple contexts unsupported")]
    StreamInContextAmbiguous { object: usize },
}

#[derive(Debug, Error)]
pub enum CompileError {
    #[error("multiple contexts unsupported: graph references {count} device contexts")]
    MultipleContexts { count: usize },

    #[error(transparent)]
    Bytecode(#[from] BytecodeError),

    #[error("batched compilation requires a transfer descriptor for object {object}")]
    MissingTransferDescriptor { object: usize },

    #[error("empty transfer descriptor for object {object}")]
    EmptyTransfer { object: usize },

    #[error(
        "heterogeneous batch inputs: expected {expected:?} elements, \
         object {object} holds {found:?}"
    )]
    HeterogeneousBatch {
        object: usize,
        expected: ElementKind,
        found: ElementKind,
    },

    #[error(
        "mismatched batch input sizes: expected {expected} bytes, \
         object {object} holds {found} bytes"
    )]
    MismatchedBatchSize {
        object: usize,
        expected: u64,
        found: u64,
    },

    #[error("node {node:?} does not resolve to a host object slot")]
    UnresolvedObject { node: NodeId },

    #[error("dependency scheduler stalled: cyclic dependency among context operations")]
    SchedulerStalled,
}
