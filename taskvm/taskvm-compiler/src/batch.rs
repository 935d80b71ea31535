//! Batch arithmetic for chunked compilation.
//!
//! When a batch size is requested, every transferable object the graph
//! touches must be a uniform buffer of the same byte length and element
//! type. The whole program is then re-emitted once per chunk, with the
//! transfers and launches carrying the chunk's byte offset and extent.

use tracing::debug;

use taskvm_runtime::context::{ElementKind, ExecutionContext};

use crate::error::CompileError;
use crate::graph::{Node, OpKind, TaskGraph};
use crate::schedule::Chunk;

#[derive(Debug)]
pub(crate) struct BatchConfig {
    batch_size: i64,
    total_chunks: i64,
    remainder: i64,
    element_bytes: i64,
}

impl BatchConfig {
    /// Validate the graph's transferable objects against the requested batch
    /// size and derive the chunk layout.
    pub fn plan(
        graph: &TaskGraph,
        execution: &ExecutionContext,
        batch_size: i64,
    ) -> Result<Self, CompileError> {
        let mut layout: Option<(u64, ElementKind)> = None;

        for (id, node) in graph.iter() {
            let Node::Op(op) = node else { continue };
            let uses_object = matches!(
                op.kind,
                OpKind::Allocate { .. }
                    | OpKind::CopyIn { .. }
                    | OpKind::StreamIn { .. }
                    | OpKind::CopyOut { .. }
            );
            if !uses_object {
                continue;
            }
            let slot = graph
                .object_slot(id)
                .ok_or(CompileError::UnresolvedObject { node: id })?;
            let desc = execution
                .object(slot)
                .ok_or(CompileError::UnresolvedObject { node: id })?;
            let transfer = desc
                .transfer
                .ok_or(CompileError::MissingTransferDescriptor { object: slot })?;
            if transfer.len_bytes == 0 {
                return Err(CompileError::EmptyTransfer { object: slot });
            }

            match layout {
                None => layout = Some((transfer.len_bytes, transfer.element)),
                Some((len_bytes, element)) => {
                    if transfer.element != element {
                        return Err(CompileError::HeterogeneousBatch {
                            object: slot,
                            expected: element,
                            found: transfer.element,
                        });
                    }
                    if transfer.len_bytes != len_bytes {
                        return Err(CompileError::MismatchedBatchSize {
                            object: slot,
                            expected: len_bytes,
                            found: transfer.len_bytes,
                        });
                    }
                }
            }
        }

        let (total_bytes, element) = match layout {
            Some(layout) => layout,
            // No transferable objects: one degenerate chunk covers nothing
            None => (0, ElementKind::U8),
        };
        let total_bytes = total_bytes as i64;

        let config = Self {
            batch_size,
            total_chunks: total_bytes / batch_size,
            remainder: total_bytes % batch_size,
            element_bytes: element.size_bytes() as i64,
        };
        debug!(
            "batch plan: {total_bytes} bytes in {chunks} full chunk(s) of \
             {batch_size}, remainder {remainder}",
            chunks = config.total_chunks,
            remainder = config.remainder,
        );
        Ok(config)
    }

    /// Chunks in emission order: full-size chunks first, then the remainder.
    pub fn chunks(&self) -> impl Iterator<Item = Chunk> + '_ {
        let full = (0..self.total_chunks).map(|index| Chunk {
            offset: index * self.batch_size,
            size: self.batch_size,
            threads: self.batch_size / self.element_bytes,
        });
        let tail = (self.remainder > 0).then(|| Chunk {
            offset: self.total_chunks * self.batch_size,
            size: self.remainder,
            threads: self.remainder / self.element_bytes,
        });
        full.chain(tail)
    }
}
