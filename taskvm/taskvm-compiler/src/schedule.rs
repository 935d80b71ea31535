//! Dependency analysis and list scheduling.
//!
//! The analysis derives, for every context op, the set of op ids that must
//! complete before it. The scheduler then repeatedly scans all unscheduled
//! ops in ascending id order and emits every op whose outstanding dependency
//! set is empty; the ascending scan is the tie-break that makes the output
//! reproducible byte for byte.

use bit_set::BitSet;
use itertools::Itertools;
use tracing::trace;

use taskvm_runtime::assembler::BytecodeAssembler;
use taskvm_runtime::bytecode::NO_DEPENDENCY;

use crate::error::CompileError;
use crate::graph::{Node, NodeId, OpKind, OpNode, TaskGraph};

pub(crate) struct DependencyAnalysis {
    /// Ids of all context ops, ascending.
    pub node_ids: Vec<NodeId>,
    /// Per-op dependency set over the node-id space, parallel to `node_ids`.
    pub deps: Vec<BitSet>,
    /// Dependency-list slot per op, `-1` when its dependency set is empty.
    pub dep_slots: Vec<i32>,
    /// Number of distinct non-empty dependency lists.
    pub num_dep_lists: usize,
    pub num_tasks: usize,
}

/// One chunk of a batched compilation; absent for whole-buffer programs.
#[derive(Clone, Copy)]
pub(crate) struct Chunk {
    pub offset: i64,
    pub size: i64,
    pub threads: i64,
}

pub(crate) fn analyze(graph: &TaskGraph) -> DependencyAnalysis {
    let ops = graph.context_ops();
    let node_ids: Vec<NodeId> = ops.iter().map(|index| NodeId(index as u32)).collect();

    let deps: Vec<BitSet> = node_ids
        .iter()
        .map(|id| dependency_set(graph, *id))
        .collect();

    let mut dep_slots = vec![NO_DEPENDENCY; deps.len()];
    let mut next_slot = 0;
    for (index, id) in node_ids.iter().enumerate() {
        if deps[index].is_empty() {
            continue;
        }
        // Version markers emit no bytecode and never own a wait list
        if matches!(
            graph.get(*id),
            Node::Op(OpNode {
                kind: OpKind::DependentRead { .. },
                ..
            })
        ) {
            continue;
        }
        dep_slots[index] = next_slot;
        next_slot += 1;
    }

    let num_tasks = node_ids
        .iter()
        .filter(|id| {
            matches!(
                graph.get(**id),
                Node::Op(OpNode {
                    kind: OpKind::Task(_),
                    ..
                })
            )
        })
        .count();

    let analysis = DependencyAnalysis {
        node_ids,
        deps,
        dep_slots,
        num_dep_lists: next_slot as usize,
        num_tasks,
    };

    if tracing::enabled!(tracing::Level::TRACE) {
        trace_dependency_matrix(graph, &analysis);
    }

    analysis
}

/// Union over the op's dependency-relevant inputs that are context ops:
/// a `DependentRead` input contributes its producing task's id, any other
/// context-op input contributes its own id.
fn dependency_set(graph: &TaskGraph, id: NodeId) -> BitSet {
    let mut deps = BitSet::with_capacity(graph.len());
    for input in graph.dependency_inputs(id) {
        match graph.get(input) {
            Node::Op(OpNode {
                kind: OpKind::DependentRead { producer, .. },
                ..
            }) => {
                if let Some(task) = producer {
                    deps.insert(task.index());
                }
            }
            Node::Op(_) => {
                deps.insert(input.index());
            }
            _ => {}
        }
    }
    deps
}

/// Emit every context op in dependency order, realizing dependency edges as
/// `ADD_DEP` entries after each emitted op. Passing a chunk switches the
/// transfers and launches to their `*_BATCH` forms.
pub(crate) fn schedule_and_emit(
    asm: &mut BytecodeAssembler,
    graph: &TaskGraph,
    analysis: &DependencyAnalysis,
    chunk: Option<Chunk>,
) -> Result<(), CompileError> {
    let count = analysis.node_ids.len();
    let mut scheduled = BitSet::with_capacity(count);
    let mut emitted = BitSet::with_capacity(graph.len());

    while scheduled.len() < count {
        let mut progressed = false;

        for index in 0..count {
            if scheduled.contains(index) {
                continue;
            }
            let mut outstanding = analysis.deps[index].clone();
            outstanding.difference_with(&emitted);
            if !outstanding.is_empty() {
                continue;
            }

            let id = analysis.node_ids[index];
            emit_op(asm, graph, id, analysis.dep_slots[index], chunk)?;

            for (other, other_deps) in analysis.deps.iter().enumerate() {
                if other == index {
                    continue;
                }
                if other_deps.contains(id.index())
                    && analysis.dep_slots[other] != NO_DEPENDENCY
                {
                    asm.add_dependency(analysis.dep_slots[other])?;
                }
            }

            scheduled.insert(index);
            emitted.insert(id.index());
            progressed = true;
        }

        if !progressed {
            return Err(CompileError::SchedulerStalled);
        }
    }
    Ok(())
}

fn emit_op(
    asm: &mut BytecodeAssembler,
    graph: &TaskGraph,
    id: NodeId,
    dep_slot: i32,
    chunk: Option<Chunk>,
) -> Result<(), CompileError> {
    let Node::Op(op) = graph.get(id) else {
        return Ok(());
    };
    let ctx = graph.device_index_of(id).unwrap_or_default() as i32;

    match &op.kind {
        OpKind::Allocate { target } => {
            let object = object_operand(graph, *target)?;
            asm.allocate(object, ctx)?;
        }
        OpKind::CopyIn { target } => {
            let object = object_operand(graph, *target)?;
            match chunk {
                Some(chunk) => asm.copy_in_batch(object, ctx, dep_slot, chunk.offset, chunk.size)?,
                None => asm.copy_in(object, ctx, dep_slot)?,
            }
        }
        OpKind::StreamIn { target } => {
            let object = object_operand(graph, *target)?;
            match chunk {
                Some(chunk) => {
                    asm.stream_in_batch(object, ctx, dep_slot, chunk.offset, chunk.size)?
                }
                None => asm.stream_in(object, ctx, dep_slot)?,
            }
        }
        OpKind::CopyOut { source } => {
            let object = object_operand(graph, *source)?;
            match chunk {
                Some(chunk) => {
                    asm.stream_out_batch(object, ctx, dep_slot, chunk.offset, chunk.size)?
                }
                None => asm.stream_out(object, ctx, dep_slot)?,
            }
        }
        OpKind::DependentRead { .. } => {
            // Version marker: no bytecode
        }
        OpKind::Task(task) => {
            let global_id = task.global_id as i32;
            let task_index = task.task_index as i32;
            let num_args = task.args.len() as i32;
            match chunk {
                Some(chunk) => asm.launch_batch(
                    global_id,
                    ctx,
                    task_index,
                    num_args,
                    dep_slot,
                    chunk.offset,
                    chunk.threads,
                )?,
                None => asm.launch(global_id, ctx, task_index, num_args, dep_slot)?,
            }
            for arg in &task.args {
                match graph.get(*arg) {
                    Node::Constant(index) => asm.constant_arg(*index as i32)?,
                    _ => asm.reference_arg(object_operand(graph, *arg)?)?,
                }
            }
        }
    }
    Ok(())
}

fn object_operand(graph: &TaskGraph, node: NodeId) -> Result<i32, CompileError> {
    graph
        .object_slot(node)
        .map(|slot| slot as i32)
        .ok_or(CompileError::UnresolvedObject { node })
}

fn trace_dependency_matrix(graph: &TaskGraph, analysis: &DependencyAnalysis) {
    trace!("dependency matrix:");
    for (index, id) in analysis.node_ids.iter().enumerate() {
        let kind = match graph.get(*id) {
            Node::Op(OpNode {
                kind: OpKind::Task(_),
                ..
            }) => "task",
            _ => "data",
        };
        let deps = analysis.deps[index].iter().map(|dep| dep.to_string()).join(" ");
        let deps = if deps.is_empty() { "<none>".into() } else { deps };
        trace!(
            "  {id:?} [{kind}] slot={slot} | {deps}",
            slot = analysis.dep_slots[index]
        );
    }
}
