//! Terminal synchronization rewrite.
//!
//! A program must not complete before its device work does. If the final
//! emitted instruction is an outbound transfer, it is rewritten in place to
//! its blocking form; otherwise an explicit barrier over every dependency
//! list is appended.

use tracing::debug;

use taskvm_runtime::assembler::BytecodeAssembler;
use taskvm_runtime::bytecode::BytecodeError;

pub(crate) fn finalize_sync(
    asm: &mut BytecodeAssembler,
    num_dep_lists: usize,
) -> Result<(), BytecodeError> {
    if let Some((offset, tag)) = asm.last_instruction() {
        if let Some(blocking) = tag.blocking() {
            debug!("rewriting trailing {tag:?} at offset {offset} to {blocking:?}");
            asm.patch_tag(offset, blocking);
            return Ok(());
        }
    }
    debug!("appending barrier over {num_dep_lists} dependency list(s)");
    asm.barrier(num_dep_lists as i32)
}
