//! Decodes a compiled program back into typed instructions.
//!
//! This is the read side of the wire format: the executor's dispatch loop,
//! trace dumps and the test suite all go through it.

use crate::bytecode::{Bytecode, BytecodeError};

#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum Instruction {
    Setup {
        num_contexts: i32,
        num_tasks: i32,
        num_dep_lists: i32,
    },
    Context {
        device_index: i32,
    },
    Begin,
    End,
    Allocate {
        object: i32,
        ctx: i32,
    },
    CopyIn {
        object: i32,
        ctx: i32,
        dep: i32,
    },
    StreamIn {
        object: i32,
        ctx: i32,
        dep: i32,
    },
    StreamOut {
        object: i32,
        ctx: i32,
        dep: i32,
    },
    StreamOutBlocking {
        object: i32,
        ctx: i32,
        dep: i32,
    },
    Launch {
        global_task_id: i32,
        ctx: i32,
        task_index: i32,
        num_args: i32,
        dep: i32,
    },
    ConstantArg {
        index: i32,
    },
    ReferenceArg {
        index: i32,
    },
    AddDep {
        dep: i32,
    },
    Barrier {
        dep: i32,
    },
    CopyInBatch {
        object: i32,
        ctx: i32,
        dep: i32,
        offset: i64,
        size: i64,
    },
    StreamInBatch {
        object: i32,
        ctx: i32,
        dep: i32,
        offset: i64,
        size: i64,
    },
    StreamOutBatch {
        object: i32,
        ctx: i32,
        dep: i32,
        offset: i64,
        size: i64,
    },
    StreamOutBlockingBatch {
        object: i32,
        ctx: i32,
        dep: i32,
        offset: i64,
        size: i64,
    },
    LaunchBatch {
        global_task_id: i32,
        ctx: i32,
        task_index: i32,
        num_args: i32,
        dep: i32,
        offset: i64,
        threads: i64,
    },
}

pub fn disassemble(code: &[u8]) -> Result<Vec<Instruction>, BytecodeError> {
    let mut reader = Reader { code, pos: 0 };
    let mut instructions = Vec::new();
    while reader.pos < code.len() {
        instructions.push(reader.instruction()?);
    }
    Ok(instructions)
}

struct Reader<'b> {
    code: &'b [u8],
    pos: usize,
}

impl Reader<'_> {
    fn instruction(&mut self) -> Result<Instruction, BytecodeError> {
        let offset = self.pos;
        let raw = self.u8()?;
        let tag = Bytecode::try_from(raw)
            .map_err(|_| BytecodeError::UnknownTag { tag: raw, offset })?;

        let instruction = match tag {
            Bytecode::Setup => Instruction::Setup {
                num_contexts: self.i32()?,
                num_tasks: self.i32()?,
                num_dep_lists: self.i32()?,
            },
            Bytecode::Context => Instruction::Context {
                device_index: self.i32()?,
            },
            Bytecode::Begin => Instruction::Begin,
            Bytecode::End => Instruction::End,
            Bytecode::Allocate => Instruction::Allocate {
                object: self.i32()?,
                ctx: self.i32()?,
            },
            Bytecode::CopyIn => {
                let (object, ctx, dep) = self.transfer()?;
                Instruction::CopyIn { object, ctx, dep }
            }
            Bytecode::StreamIn => {
                let (object, ctx, dep) = self.transfer()?;
                Instruction::StreamIn { object, ctx, dep }
            }
            Bytecode::StreamOut => {
                let (object, ctx, dep) = self.transfer()?;
                Instruction::StreamOut { object, ctx, dep }
            }
            Bytecode::StreamOutBlocking => {
                let (object, ctx, dep) = self.transfer()?;
                Instruction::StreamOutBlocking { object, ctx, dep }
            }
            Bytecode::Launch => Instruction::Launch {
                global_task_id: self.i32()?,
                ctx: self.i32()?,
                task_index: self.i32()?,
                num_args: self.i32()?,
                dep: self.i32()?,
            },
            Bytecode::ConstantArg => Instruction::ConstantArg { index: self.i32()? },
            Bytecode::ReferenceArg => Instruction::ReferenceArg { index: self.i32()? },
            Bytecode::AddDep => Instruction::AddDep { dep: self.i32()? },
            Bytecode::Barrier => Instruction::Barrier { dep: self.i32()? },
            Bytecode::CopyInBatch => {
                let (object, ctx, dep, offset, size) = self.transfer_batch()?;
                Instruction::CopyInBatch {
                    object,
                    ctx,
                    dep,
                    offset,
                    size,
                }
            }
            Bytecode::StreamInBatch => {
                let (object, ctx, dep, offset, size) = self.transfer_batch()?;
                Instruction::StreamInBatch {
                    object,
                    ctx,
                    dep,
                    offset,
                    size,
                }
            }
            Bytecode::StreamOutBatch => {
                let (object, ctx, dep, offset, size) = self.transfer_batch()?;
                Instruction::StreamOutBatch {
                    object,
                    ctx,
                    dep,
                    offset,
                    size,
                }
            }
            Bytecode::StreamOutBlockingBatch => {
                let (object, ctx, dep, offset, size) = self.transfer_batch()?;
                Instruction::StreamOutBlockingBatch {
                    object,
                    ctx,
                    dep,
                    offset,
                    size,
                }
            }
            Bytecode::LaunchBatch => Instruction::LaunchBatch {
                global_task_id: self.i32()?,
                ctx: self.i32()?,
                task_index: self.i32()?,
                num_args: self.i32()?,
                dep: self.i32()?,
                offset: self.i64()?,
                threads: self.i64()?,
            },
        };
        Ok(instruction)
    }

    fn transfer(&mut self) -> Result<(i32, i32, i32), BytecodeError> {
        Ok((self.i32()?, self.i32()?, self.i32()?))
    }

    fn transfer_batch(&mut self) -> Result<(i32, i32, i32, i64, i64), BytecodeError> {
        Ok((self.i32()?, self.i32()?, self.i32()?, self.i64()?, self.i64()?))
    }

    fn u8(&mut self) -> Result<u8, BytecodeError> {
        let byte = *self
            .code
            .get(self.pos)
            .ok_or(BytecodeError::Truncated { offset: self.pos })?;
        self.pos += 1;
        Ok(byte)
    }

    fn i32(&mut self) -> Result<i32, BytecodeError> {
        Ok(i32::from_le_bytes(self.operand::<4>()?))
    }

    fn i64(&mut self) -> Result<i64, BytecodeError> {
        Ok(i64::from_le_bytes(self.operand::<8>()?))
    }

    fn operand<const N: usize>(&mut self) -> Result<[u8; N], BytecodeError> {
        let end = self.pos + N;
        let bytes = self
            .code
            .get(self.pos..end)
            .ok_or(BytecodeError::Truncated { offset: self.pos })?;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        self.pos = end;
        Ok(out)
    }
}
