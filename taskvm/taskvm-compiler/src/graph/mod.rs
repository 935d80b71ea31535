//! Indexed, append-only node arena for one task graph.

pub mod builder;
pub mod node;

use bit_set::BitSet;
use smallvec::SmallVec;

pub use node::{ContextNode, Node, NodeId, OpKind, OpNode, TaskOp};

/// The task graph: nodes indexed by dense id, created fresh per compilation.
/// There is no removal operation.
#[derive(Debug, Default)]
pub struct TaskGraph {
    nodes: Vec<Node>,
}

impl TaskGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a node, assigning the next id.
    pub fn add(&mut self, node: Node) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(node);
        id
    }

    /// Insert with structural dedup: two contexts on the same device index
    /// share one node. Non-context nodes always insert.
    pub fn add_unique(&mut self, node: Node) -> NodeId {
        if let Node::Context(context) = &node {
            let existing = self.nodes.iter().position(
                |n| matches!(n, Node::Context(c) if c.device_index == context.device_index),
            );
            if let Some(index) = existing {
                return NodeId(index as u32);
            }
        }
        self.add(node)
    }

    pub fn get(&self, id: NodeId) -> &Node {
        &self.nodes[id.index()]
    }

    pub(crate) fn get_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.index()]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &Node)> {
        self.nodes
            .iter()
            .enumerate()
            .map(|(index, node)| (NodeId(index as u32), node))
    }

    /// Ids of all nodes matching the predicate, in ascending order.
    /// The scheduler relies on the ascending iteration for determinism.
    pub fn filter(&self, predicate: impl Fn(&Node) -> bool) -> BitSet {
        let mut set = BitSet::with_capacity(self.nodes.len());
        for (index, node) in self.nodes.iter().enumerate() {
            if predicate(node) {
                set.insert(index);
            }
        }
        set
    }

    pub fn contexts(&self) -> BitSet {
        self.filter(|node| matches!(node, Node::Context(_)))
    }

    pub fn context_ops(&self) -> BitSet {
        self.filter(|node| matches!(node, Node::Op(_)))
    }

    /// Register `user` on the use list of a context node.
    pub fn add_use(&mut self, context: NodeId, user: NodeId) {
        if let Node::Context(ctx) = self.get_mut(context) {
            ctx.uses.push(user);
        }
    }

    /// The inputs of a node that participate in dependency analysis.
    ///
    /// A task's plain transfer arguments are ordered by the owning context
    /// itself, so only `DependentRead` arguments count as inputs; a
    /// dependent read's producing task is a back-reference, not an input.
    pub fn dependency_inputs(&self, id: NodeId) -> SmallVec<NodeId, 4> {
        match self.get(id) {
            Node::Op(op) => match &op.kind {
                OpKind::Allocate { target }
                | OpKind::CopyIn { target }
                | OpKind::StreamIn { target } => [*target].into_iter().collect(),
                OpKind::CopyOut { source } | OpKind::DependentRead { source, .. } => {
                    [*source].into_iter().collect()
                }
                OpKind::Task(task) => task
                    .args
                    .iter()
                    .copied()
                    .filter(|arg| {
                        matches!(
                            self.get(*arg),
                            Node::Op(OpNode {
                                kind: OpKind::DependentRead { .. },
                                ..
                            })
                        )
                    })
                    .collect(),
            },
            Node::Constant(_) | Node::Object(_) | Node::Context(_) => SmallVec::new(),
        }
    }

    /// Resolve a node to the host object slot it ultimately refers to.
    pub fn object_slot(&self, id: NodeId) -> Option<usize> {
        match self.get(id) {
            Node::Object(index) => Some(*index),
            Node::Op(op) => match &op.kind {
                OpKind::Allocate { target }
                | OpKind::CopyIn { target }
                | OpKind::StreamIn { target } => self.object_slot(*target),
                OpKind::CopyOut { source } | OpKind::DependentRead { source, .. } => {
                    self.object_slot(*source)
                }
                OpKind::Task(_) => None,
            },
            Node::Constant(_) | Node::Context(_) => None,
        }
    }

    /// Device index of the context owning the given op node.
    pub fn device_index_of(&self, op: NodeId) -> Option<u32> {
        match self.get(op) {
            Node::Op(node) => match self.get(node.context) {
                Node::Context(ctx) => Some(ctx.device_index),
                _ => None,
            },
            Node::Context(ctx) => Some(ctx.device_index),
            _ => None,
        }
    }
}
