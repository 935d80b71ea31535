//! Top-level compilation driver.
//!
//! Ties the phases together: single-context validation, dependency analysis,
//! header emission, scheduled emission (whole-buffer or once per batch
//! chunk), the terminal synchronization rewrite and the end marker.

use tracing::{debug, trace};

use taskvm_runtime::assembler::{BytecodeAssembler, CompiledBytecode, DEFAULT_MAX_BYTECODE_SIZE};
use taskvm_runtime::context::ExecutionContext;

use crate::batch::BatchConfig;
use crate::error::CompileError;
use crate::graph::{Node, NodeId, TaskGraph};
use crate::peephole;
use crate::schedule;

#[derive(Clone, Copy, Debug)]
pub struct CompileOptions {
    /// Hard upper bound on the compiled program size in bytes.
    pub max_bytecode_size: usize,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            max_bytecode_size: DEFAULT_MAX_BYTECODE_SIZE,
        }
    }
}

/// Compile a task graph into an executable bytecode program.
///
/// A `batch_size` of zero (or less) compiles the whole buffers in one pass;
/// a positive value splits every transfer and launch into chunks of that
/// many bytes.
pub fn compile(
    graph: &TaskGraph,
    execution: &ExecutionContext,
    batch_size: i64,
) -> Result<CompiledBytecode, CompileError> {
    compile_with_options(graph, execution, batch_size, CompileOptions::default())
}

pub fn compile_with_options(
    graph: &TaskGraph,
    execution: &ExecutionContext,
    batch_size: i64,
    options: CompileOptions,
) -> Result<CompiledBytecode, CompileError> {
    let contexts = graph.contexts();
    if contexts.len() != 1 {
        return Err(CompileError::MultipleContexts {
            count: contexts.len(),
        });
    }
    let context_id = contexts
        .iter()
        .next()
        .map(|index| NodeId(index as u32))
        .ok_or(CompileError::MultipleContexts { count: 0 })?;
    let device_index = match graph.get(context_id) {
        Node::Context(ctx) => ctx.device_index as i32,
        _ => 0,
    };

    let analysis = schedule::analyze(graph);
    debug!(
        "compiling {ops} context op(s): {tasks} task(s), {lists} dependency list(s)",
        ops = analysis.node_ids.len(),
        tasks = analysis.num_tasks,
        lists = analysis.num_dep_lists,
    );

    let mut asm = BytecodeAssembler::with_capacity(options.max_bytecode_size);
    asm.setup(
        1,
        analysis.num_tasks as i32,
        analysis.num_dep_lists as i32,
    )?;
    asm.context(device_index)?;
    asm.begin()?;

    if batch_size > 0 {
        let config = BatchConfig::plan(graph, execution, batch_size)?;
        for chunk in config.chunks() {
            schedule::schedule_and_emit(&mut asm, graph, &analysis, Some(chunk))?;
        }
    } else {
        schedule::schedule_and_emit(&mut asm, graph, &analysis, None)?;
    }

    peephole::finalize_sync(&mut asm, analysis.num_dep_lists)?;
    asm.end()?;

    let compiled = asm.finish();
    debug!("compiled program: {} bytes", compiled.code_size());
    if tracing::enabled!(tracing::Level::TRACE) {
        trace!("program dump:\n{}", compiled.dump());
    }
    Ok(compiled)
}
