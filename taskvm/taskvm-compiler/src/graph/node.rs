use std::fmt::{Debug, Formatter};

use smallvec::SmallVec;

/// Dense node id within one [`TaskGraph`](super::TaskGraph) arena,
/// assigned on insertion in monotonically increasing order.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct NodeId(pub u32);

impl NodeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl Debug for NodeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// A graph node. The `Op` family covers every operation owned by a device
/// context; `Constant` and `Object` are the pristine argument sources.
#[derive(Debug)]
pub enum Node {
    /// References a compile-time scalar argument slot.
    Constant(usize),
    /// References a host-side object slot.
    Object(usize),
    /// One per distinct device context; deduplicated on insertion.
    Context(ContextNode),
    Op(OpNode),
}

#[derive(Debug)]
pub struct ContextNode {
    pub device_index: u32,
    /// Operations owned by this context, in insertion order.
    pub uses: Vec<NodeId>,
}

impl ContextNode {
    pub fn new(device_index: u32) -> Self {
        Self {
            device_index,
            uses: Vec::new(),
        }
    }
}

/// An operation scoped to exactly one context.
#[derive(Debug)]
pub struct OpNode {
    pub context: NodeId,
    pub kind: OpKind,
}

#[derive(Debug)]
pub enum OpKind {
    /// Reserve device storage for an object, no data transfer.
    Allocate { target: NodeId },
    /// Host-to-device transfer performed once.
    CopyIn { target: NodeId },
    /// Host-to-device transfer performed on every execution.
    StreamIn { target: NodeId },
    /// Device-to-host transfer of a task-produced object version.
    CopyOut { source: NodeId },
    /// Version marker: the value of `source` as produced by `producer`.
    /// The producer is patched in when its task is launched; it stays `None`
    /// only if the record stream ended before the launch record.
    DependentRead {
        source: NodeId,
        producer: Option<NodeId>,
    },
    Task(TaskOp),
}

#[derive(Debug)]
pub struct TaskOp {
    /// Logical invocation id recorded by `SelectContext`; becomes the LAUNCH
    /// opcode's first operand.
    pub global_id: u32,
    pub task_index: usize,
    pub args: SmallVec<NodeId, 8>,
}
