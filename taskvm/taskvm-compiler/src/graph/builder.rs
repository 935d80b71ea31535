//! Replays a recorded operation stream into a [`TaskGraph`].
//!
//! The builder keeps a per-object version table: every object starts at its
//! pristine `Object` node and is rebound to a `DependentRead` marker each
//! time a task writes it, so later reads chain to the producing task instead
//! of the host copy.

use smallvec::SmallVec;
use tracing::{debug, warn};

use taskvm_runtime::context::{Access, ExecutionContext, ObjectFlags};
use taskvm_runtime::record::RecordTag;

use super::{ContextNode, Node, NodeId, OpKind, OpNode, TaskGraph, TaskOp};
use crate::error::GraphError;

/// Build the task graph for one recorded stream against an execution
/// context. Stream exhaustion and unrecognized record tags both terminate
/// the replay normally; malformed records abort it.
pub fn build_graph(
    execution: &ExecutionContext,
    stream: &[u8],
) -> Result<TaskGraph, GraphError> {
    GraphBuilder::new(execution).replay(stream)
}

struct GraphBuilder<'e> {
    execution: &'e ExecutionContext,
    graph: TaskGraph,
    constant_nodes: Vec<NodeId>,
    object_nodes: Vec<NodeId>,
    /// Current version of each object slot; starts at the raw `Object` node.
    versions: Vec<NodeId>,
    selection: Option<Selection<'e>>,
    pending: Option<PendingTask>,
}

/// Carries the effect of the latest `SelectContext` record.
struct Selection<'e> {
    context: NodeId,
    global_id: u32,
    task_index: usize,
    accesses: &'e [Access],
}

/// A task between `ArgListOpen` and `Launch`. The arena node is inserted at
/// launch so node-id order matches data-flow order; dependent reads created
/// during the argument scan are patched with the task id then.
struct PendingTask {
    context: NodeId,
    global_id: u32,
    task_index: usize,
    declared: usize,
    args: SmallVec<NodeId, 8>,
    dep_reads: SmallVec<NodeId, 4>,
}

impl<'e> GraphBuilder<'e> {
    fn new(execution: &'e ExecutionContext) -> Self {
        let mut graph = TaskGraph::new();

        let constant_nodes: Vec<NodeId> = (0..execution.constants().len())
            .map(|index| graph.add(Node::Constant(index)))
            .collect();
        let object_nodes: Vec<NodeId> = (0..execution.objects().len())
            .map(|index| graph.add(Node::Object(index)))
            .collect();
        let versions = object_nodes.clone();

        Self {
            execution,
            graph,
            constant_nodes,
            object_nodes,
            versions,
            selection: None,
            pending: None,
        }
    }

    fn replay(mut self, stream: &[u8]) -> Result<TaskGraph, GraphError> {
        let mut reader = RecordReader {
            buf: stream,
            pos: 0,
        };

        while let Some(raw) = reader.next_tag() {
            let Ok(tag) = RecordTag::try_from(raw) else {
                // Unrecognized record kind: treat as end-of-stream
                break;
            };
            match tag {
                RecordTag::SelectContext => self.select_context(&mut reader)?,
                RecordTag::ArgListOpen => self.arg_list_open(&mut reader)?,
                RecordTag::LoadRef => self.load_ref(&mut reader)?,
                RecordTag::LoadConst => self.load_const(&mut reader)?,
                RecordTag::Launch => self.launch()?,
            }
        }

        self.finalize_streams()?;

        debug!(nodes = self.graph.len(), "task graph built");
        Ok(self.graph)
    }

    fn select_context(&mut self, reader: &mut RecordReader) -> Result<(), GraphError> {
        let global_id = reader.i32()? as u32;
        let task_index = reader.i32()? as usize;

        let task = self
            .execution
            .task(task_index)
            .ok_or(GraphError::UnknownTask { index: task_index })?;
        let device_index = self
            .execution
            .device_index(global_id)
            .ok_or(GraphError::UnmappedTask {
                global_task_id: global_id,
            })?;

        let context = self
            .graph
            .add_unique(Node::Context(ContextNode::new(device_index)));

        self.selection = Some(Selection {
            context,
            global_id,
            task_index,
            accesses: &task.accesses,
        });
        Ok(())
    }

    fn arg_list_open(&mut self, reader: &mut RecordReader) -> Result<(), GraphError> {
        let declared = reader.i32()? as usize;
        let selection = self.selection.as_ref().ok_or(GraphError::NoContext {
            record: "ArgListOpen",
        })?;

        self.pending = Some(PendingTask {
            context: selection.context,
            global_id: selection.global_id,
            task_index: selection.task_index,
            declared,
            args: SmallVec::new(),
            dep_reads: SmallVec::new(),
        });
        Ok(())
    }

    fn load_ref(&mut self, reader: &mut RecordReader) -> Result<(), GraphError> {
        let index = reader.i32()? as usize;
        let object_node = *self
            .object_nodes
            .get(index)
            .ok_or(GraphError::UnknownObject { index })?;
        let flags = self
            .execution
            .object(index)
            .map(|desc| desc.flags)
            .unwrap_or_default();

        let selection = self
            .selection
            .as_ref()
            .ok_or(GraphError::NoContext { record: "LoadRef" })?;
        let context = selection.context;
        let accesses = selection.accesses;
        let task_index = selection.task_index;

        let pending = self
            .pending
            .as_mut()
            .ok_or(GraphError::NoOpenArgList { record: "LoadRef" })?;
        if pending.args.len() == pending.declared {
            return Err(GraphError::TooManyArguments {
                declared: pending.declared,
            });
        }
        let arg_index = pending.args.len();
        let access = accesses
            .get(arg_index)
            .copied()
            .ok_or(GraphError::MissingAccessMode {
                task: task_index,
                arg: arg_index,
            })?;

        let version = self.versions[index];
        let arg = if matches!(self.graph.get(version), Node::Op(_)) {
            // Produced earlier in this graph: consume the version directly
            version
        } else {
            let kind = if access == Access::Write {
                OpKind::Allocate {
                    target: object_node,
                }
            } else if flags.contains(ObjectFlags::STREAM_IN) {
                OpKind::StreamIn {
                    target: object_node,
                }
            } else {
                OpKind::CopyIn {
                    target: object_node,
                }
            };
            let id = self.graph.add(Node::Op(OpNode { context, kind }));
            self.graph.add_use(context, id);
            id
        };
        pending.args.push(arg);

        if access.is_write() {
            let dep_read = self.graph.add(Node::Op(OpNode {
                context,
                kind: OpKind::DependentRead {
                    source: object_node,
                    producer: None,
                },
            }));
            pending.dep_reads.push(dep_read);
            self.versions[index] = dep_read;
        } else {
            self.versions[index] = arg;
        }
        Ok(())
    }

    fn load_const(&mut self, reader: &mut RecordReader) -> Result<(), GraphError> {
        let index = reader.i32()? as usize;
        let constant_node = *self
            .constant_nodes
            .get(index)
            .ok_or(GraphError::UnknownConstant { index })?;

        let pending = self
            .pending
            .as_mut()
            .ok_or(GraphError::NoOpenArgList { record: "LoadConst" })?;
        if pending.args.len() == pending.declared {
            return Err(GraphError::TooManyArguments {
                declared: pending.declared,
            });
        }
        pending.args.push(constant_node);
        Ok(())
    }

    fn launch(&mut self) -> Result<(), GraphError> {
        let pending = self
            .pending
            .take()
            .ok_or(GraphError::NoOpenArgList { record: "Launch" })?;
        if pending.args.len() != pending.declared {
            return Err(GraphError::MissingArguments {
                declared: pending.declared,
                loaded: pending.args.len(),
            });
        }

        let task_id = self.graph.add(Node::Op(OpNode {
            context: pending.context,
            kind: OpKind::Task(TaskOp {
                global_id: pending.global_id,
                task_index: pending.task_index,
                args: pending.args,
            }),
        }));
        for dep_read in pending.dep_reads {
            if let Node::Op(OpNode {
                kind: OpKind::DependentRead { producer, .. },
                ..
            }) = self.graph.get_mut(dep_read)
            {
                *producer = Some(task_id);
            }
        }
        self.graph.add_use(pending.context, task_id);
        Ok(())
    }

    /// Trailing pass over the per-object state: copy out every stream-out
    /// object that was produced by a task in this graph, and stream in every
    /// stream-in object the recorded tasks never consumed.
    fn finalize_streams(&mut self) -> Result<(), GraphError> {
        for (index, desc) in self.execution.objects().iter().enumerate() {
            let version = self.versions[index];

            if desc.flags.contains(ObjectFlags::STREAM_OUT) {
                let producer_context = match self.graph.get(version) {
                    Node::Op(OpNode {
                        context,
                        kind: OpKind::DependentRead { .. },
                    }) => Some(*context),
                    _ => None,
                };
                match producer_context {
                    Some(context) => {
                        let copy_out = self.graph.add(Node::Op(OpNode {
                            context,
                            kind: OpKind::CopyOut { source: version },
                        }));
                        self.graph.add_use(context, copy_out);
                    }
                    None => {
                        // Never modified by this graph; the host copy is
                        // already current, so no copy-out is needed.
                        warn!(
                            object = index,
                            "stream-out requested for object not modified by this graph; \
                             no copy-out emitted"
                        );
                    }
                }
            } else if desc.flags.contains(ObjectFlags::STREAM_IN)
                && version == self.object_nodes[index]
            {
                let contexts = self.graph.contexts();
                if contexts.len() != 1 {
                    return Err(GraphError::StreamInContextAmbiguous { object: index });
                }
                let context = NodeId(
                    contexts
                        .iter()
                        .next()
                        .ok_or(GraphError::StreamInContextAmbiguous { object: index })?
                        as u32,
                );
                let stream_in = self.graph.add(Node::Op(OpNode {
                    context,
                    kind: OpKind::StreamIn {
                        target: self.object_nodes[index],
                    },
                }));
                self.graph.add_use(context, stream_in);
            }
        }
        Ok(())
    }
}

struct RecordReader<'b> {
    buf: &'b [u8],
    pos: usize,
}

impl RecordReader<'_> {
    fn next_tag(&mut self) -> Option<u8> {
        let byte = self.buf.get(self.pos).copied();
        if byte.is_some() {
            self.pos += 1;
        }
        byte
    }

    fn i32(&mut self) -> Result<i32, GraphError> {
        let end = self.pos + 4;
        let bytes = self
            .buf
            .get(self.pos..end)
            .ok_or(GraphError::TruncatedRecord { offset: self.pos })?;
        let mut out = [0u8; 4];
        out.copy_from_slice(bytes);
        self.pos = end;
        Ok(i32::from_le_bytes(out))
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use taskvm_runtime::context::{ElementKind, ObjectDesc, TaskDesc};
    use taskvm_runtime::record::GraphRecorder;

    use super::*;

    fn two_object_context(write_flags: ObjectFlags) -> ExecutionContext {
        let mut execution = ExecutionContext::new();
        execution.add_object(ObjectDesc::buffer(1024, ElementKind::F32));
        execution.add_object(ObjectDesc::buffer(1024, ElementKind::F32).with_flags(write_flags));
        execution.add_task(TaskDesc::new("scale", [Access::Read, Access::Write]));
        execution.map_task_device(0, 0);
        execution
    }

    fn record_single_task() -> Vec<u8> {
        let mut recorder = GraphRecorder::new();
        recorder
            .select_context(0, 0)
            .arg_list_open(2)
            .load_ref(0)
            .load_ref(1)
            .launch();
        recorder.finish()
    }

    #[test]
    fn versions_chain_through_dependent_reads() {
        let execution = two_object_context(ObjectFlags::STREAM_OUT);
        let graph = build_graph(&execution, &record_single_task()).unwrap();

        // object nodes 0..2, context 2, copy-in 3, allocate 4,
        // dependent read 5, task 6, trailing copy-out 7
        assert_eq!(graph.len(), 8);
        assert_matches!(
            graph.get(NodeId(3)),
            Node::Op(OpNode {
                kind: OpKind::CopyIn { .. },
                ..
            })
        );
        assert_matches!(
            graph.get(NodeId(4)),
            Node::Op(OpNode {
                kind: OpKind::Allocate { .. },
                ..
            })
        );
        assert_matches!(
            graph.get(NodeId(5)),
            Node::Op(OpNode {
                kind: OpKind::DependentRead {
                    producer: Some(NodeId(6)),
                    ..
                },
                ..
            })
        );
        assert_matches!(
            graph.get(NodeId(7)),
            Node::Op(OpNode {
                kind: OpKind::CopyOut {
                    source: NodeId(5)
                },
                ..
            })
        );
    }

    #[test]
    fn unmodified_stream_out_object_is_skipped() {
        let mut execution = ExecutionContext::new();
        execution.add_object(
            ObjectDesc::buffer(64, ElementKind::I32).with_flags(ObjectFlags::STREAM_OUT),
        );
        execution.add_task(TaskDesc::new("read-only", [Access::Read]));
        execution.map_task_device(0, 0);

        let mut recorder = GraphRecorder::new();
        recorder
            .select_context(0, 0)
            .arg_list_open(1)
            .load_ref(0)
            .launch();

        let graph = build_graph(&execution, recorder.bytes()).unwrap();
        let has_copy_out = graph.iter().any(|(_, node)| {
            matches!(
                node,
                Node::Op(OpNode {
                    kind: OpKind::CopyOut { .. },
                    ..
                })
            )
        });
        assert!(!has_copy_out);
    }

    #[test]
    fn unconsumed_stream_in_object_gets_trailing_stream_in() {
        let mut execution = two_object_context(ObjectFlags::STREAM_OUT);
        let extra =
            execution.add_object(ObjectDesc::buffer(64, ElementKind::F32).with_flags(
                ObjectFlags::STREAM_IN,
            ));
        let graph = build_graph(&execution, &record_single_task()).unwrap();

        let trailing = graph.iter().find_map(|(id, node)| match node {
            Node::Op(OpNode {
                kind: OpKind::StreamIn { target },
                ..
            }) if graph.object_slot(*target) == Some(extra) => Some(id),
            _ => None,
        });
        assert!(trailing.is_some());
    }

    #[test]
    fn unrecognized_tag_ends_replay() {
        let execution = two_object_context(ObjectFlags::empty());
        let mut stream = record_single_task();
        stream.push(0x7f);
        stream.extend_from_slice(&123i32.to_le_bytes());

        let graph = build_graph(&execution, &stream).unwrap();
        assert_eq!(graph.len(), 7);
    }

    #[test]
    fn unmapped_task_is_rejected() {
        let execution = two_object_context(ObjectFlags::empty());
        let mut recorder = GraphRecorder::new();
        recorder.select_context(99, 0);

        let err = build_graph(&execution, recorder.bytes()).unwrap_err();
        assert_matches!(err, GraphError::UnmappedTask { global_task_id: 99 });
    }

    #[test]
    fn load_ref_without_arg_list_is_rejected() {
        let execution = two_object_context(ObjectFlags::empty());
        let mut recorder = GraphRecorder::new();
        recorder.select_context(0, 0).load_ref(0);

        let err = build_graph(&execution, recorder.bytes()).unwrap_err();
        assert_matches!(err, GraphError::NoOpenArgList { .. });
    }
}
