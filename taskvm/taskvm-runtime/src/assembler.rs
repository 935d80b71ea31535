//! Capacity-bounded bytecode assembly.
//!
//! The assembler owns one append-only buffer per compilation. The buffer has
//! a fixed maximum capacity decided at construction; any write that would
//! exceed it fails fast, since a partially written program must never reach
//! an executor.

use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

use crate::bytecode::{Bytecode, BytecodeError};

/// Default maximum compiled-program size in bytes.
pub const DEFAULT_MAX_BYTECODE_SIZE: usize = 4096;

pub struct BytecodeAssembler {
    code: Vec<u8>,
    capacity: usize,
    /// Buffer offset and tag of the most recently emitted instruction.
    /// The peephole finalizer consults this instead of recomputing tail
    /// offsets from operand-width arithmetic.
    last_instruction: Option<(usize, Bytecode)>,
}

impl BytecodeAssembler {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            code: Vec::with_capacity(capacity),
            capacity,
            last_instruction: None,
        }
    }

    /// Current write position, i.e. the code size so far.
    pub fn position(&self) -> usize {
        self.code.len()
    }

    pub fn last_instruction(&self) -> Option<(usize, Bytecode)> {
        self.last_instruction
    }

    /// Rewrite the tag byte of a previously emitted instruction in place.
    pub fn patch_tag(&mut self, offset: usize, tag: Bytecode) {
        debug_assert!(offset < self.code.len());
        self.code[offset] = tag.into();
        if let Some((last_offset, last_tag)) = &mut self.last_instruction {
            if *last_offset == offset {
                *last_tag = tag;
            }
        }
    }

    pub fn finish(self) -> CompiledBytecode {
        CompiledBytecode { code: self.code }
    }

    pub fn setup(
        &mut self,
        num_contexts: i32,
        num_tasks: i32,
        num_dep_lists: i32,
    ) -> Result<(), BytecodeError> {
        self.tag(Bytecode::Setup)?;
        self.put_i32(num_contexts)?;
        self.put_i32(num_tasks)?;
        self.put_i32(num_dep_lists)
    }

    pub fn context(&mut self, device_index: i32) -> Result<(), BytecodeError> {
        self.tag(Bytecode::Context)?;
        self.put_i32(device_index)
    }

    pub fn begin(&mut self) -> Result<(), BytecodeError> {
        self.tag(Bytecode::Begin)
    }

    pub fn end(&mut self) -> Result<(), BytecodeError> {
        self.tag(Bytecode::End)
    }

    pub fn allocate(&mut self, object: i32, ctx: i32) -> Result<(), BytecodeError> {
        self.tag(Bytecode::Allocate)?;
        self.put_i32(object)?;
        self.put_i32(ctx)
    }

    pub fn copy_in(&mut self, object: i32, ctx: i32, dep: i32) -> Result<(), BytecodeError> {
        self.transfer(Bytecode::CopyIn, object, ctx, dep)
    }

    pub fn stream_in(&mut self, object: i32, ctx: i32, dep: i32) -> Result<(), BytecodeError> {
        self.transfer(Bytecode::StreamIn, object, ctx, dep)
    }

    pub fn stream_out(&mut self, object: i32, ctx: i32, dep: i32) -> Result<(), BytecodeError> {
        self.transfer(Bytecode::StreamOut, object, ctx, dep)
    }

    pub fn copy_in_batch(
        &mut self,
        object: i32,
        ctx: i32,
        dep: i32,
        offset: i64,
        size: i64,
    ) -> Result<(), BytecodeError> {
        self.transfer_batch(Bytecode::CopyInBatch, object, ctx, dep, offset, size)
    }

    pub fn stream_in_batch(
        &mut self,
        object: i32,
        ctx: i32,
        dep: i32,
        offset: i64,
        size: i64,
    ) -> Result<(), BytecodeError> {
        self.transfer_batch(Bytecode::StreamInBatch, object, ctx, dep, offset, size)
    }

    pub fn stream_out_batch(
        &mut self,
        object: i32,
        ctx: i32,
        dep: i32,
        offset: i64,
        size: i64,
    ) -> Result<(), BytecodeError> {
        self.transfer_batch(Bytecode::StreamOutBatch, object, ctx, dep, offset, size)
    }

    pub fn launch(
        &mut self,
        global_task_id: i32,
        ctx: i32,
        task_index: i32,
        num_args: i32,
        dep: i32,
    ) -> Result<(), BytecodeError> {
        self.tag(Bytecode::Launch)?;
        self.put_i32(global_task_id)?;
        self.put_i32(ctx)?;
        self.put_i32(task_index)?;
        self.put_i32(num_args)?;
        self.put_i32(dep)
    }

    /// The batch `size` operand of a launch carries the chunk thread count.
    pub fn launch_batch(
        &mut self,
        global_task_id: i32,
        ctx: i32,
        task_index: i32,
        num_args: i32,
        dep: i32,
        offset: i64,
        threads: i64,
    ) -> Result<(), BytecodeError> {
        self.tag(Bytecode::LaunchBatch)?;
        self.put_i32(global_task_id)?;
        self.put_i32(ctx)?;
        self.put_i32(task_index)?;
        self.put_i32(num_args)?;
        self.put_i32(dep)?;
        self.put_i64(offset)?;
        self.put_i64(threads)
    }

    pub fn constant_arg(&mut self, index: i32) -> Result<(), BytecodeError> {
        self.tag(Bytecode::ConstantArg)?;
        self.put_i32(index)
    }

    pub fn reference_arg(&mut self, index: i32) -> Result<(), BytecodeError> {
        self.tag(Bytecode::ReferenceArg)?;
        self.put_i32(index)
    }

    pub fn add_dependency(&mut self, dep: i32) -> Result<(), BytecodeError> {
        self.tag(Bytecode::AddDep)?;
        self.put_i32(dep)
    }

    pub fn barrier(&mut self, dep: i32) -> Result<(), BytecodeError> {
        self.tag(Bytecode::Barrier)?;
        self.put_i32(dep)
    }

    fn transfer(
        &mut self,
        tag: Bytecode,
        object: i32,
        ctx: i32,
        dep: i32,
    ) -> Result<(), BytecodeError> {
        self.tag(tag)?;
        self.put_i32(object)?;
        self.put_i32(ctx)?;
        self.put_i32(dep)
    }

    fn transfer_batch(
        &mut self,
        tag: Bytecode,
        object: i32,
        ctx: i32,
        dep: i32,
        offset: i64,
        size: i64,
    ) -> Result<(), BytecodeError> {
        self.tag(tag)?;
        self.put_i32(object)?;
        self.put_i32(ctx)?;
        self.put_i32(dep)?;
        self.put_i64(offset)?;
        self.put_i64(size)
    }

    fn tag(&mut self, tag: Bytecode) -> Result<(), BytecodeError> {
        self.last_instruction = Some((self.code.len(), tag));
        self.put(&[tag.into()])
    }

    fn put_i32(&mut self, value: i32) -> Result<(), BytecodeError> {
        self.put(&value.to_le_bytes())
    }

    fn put_i64(&mut self, value: i64) -> Result<(), BytecodeError> {
        self.put(&value.to_le_bytes())
    }

    fn put(&mut self, bytes: &[u8]) -> Result<(), BytecodeError> {
        if self.code.len() + bytes.len() > self.capacity {
            return Err(BytecodeError::Overflow {
                capacity: self.capacity,
            });
        }
        self.code.extend_from_slice(bytes);
        Ok(())
    }
}

/// A finished program: the byte buffer plus its code size.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CompiledBytecode {
    code: Vec<u8>,
}

impl CompiledBytecode {
    pub fn bytes(&self) -> &[u8] {
        &self.code
    }

    pub fn code_size(&self) -> usize {
        self.code.len()
    }

    /// Hex rendering of the program, 16 bytes per line.
    pub fn dump(&self) -> String {
        const WIDTH: usize = 16;
        let mut out = String::new();
        for (line, chunk) in self.code.chunks(WIDTH).enumerate() {
            let _ = write!(out, "[{:#06x}]:", line * WIDTH);
            for (i, byte) in chunk.iter().enumerate() {
                if i % 2 == 0 {
                    out.push(' ');
                }
                let _ = write!(out, "{byte:02x}");
            }
            out.push('\n');
        }
        out
    }
}
