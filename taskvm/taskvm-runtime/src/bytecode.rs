//! The bytecode wire format.
//!
//! A compiled program is a flat little-endian byte sequence: one tag byte per
//! instruction followed by fixed-width integer operands. The executor replays
//! the sequence many times without re-analyzing the task graph.

use num_enum::{IntoPrimitive, TryFromPrimitive};
use thiserror::Error;

/// Dependency-list operand value meaning "waits on nothing".
pub const NO_DEPENDENCY: i32 = -1;

/// Offset added to a plain transfer/launch tag to obtain its chunked form.
const BATCH_TAG_OFFSET: u8 = 0x10;

/// Instruction tags.
///
/// Batch variants carry the same operands as their plain form plus an
/// `i64 offset, i64 size` pair; they are assigned `plain + 0x10` so the two
/// families stay aligned.
#[derive(Clone, Copy, Eq, PartialEq, Debug, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Bytecode {
    /// i32 numContexts, i32 numTasks, i32 numDepLists
    Setup = 0x10,
    /// i32 deviceIndex
    Context = 0x11,
    Begin = 0x12,
    End = 0x13,
    /// i32 object, i32 ctx — reserve device storage, no transfer
    Allocate = 0x14,
    /// i32 object, i32 ctx, i32 depList
    CopyIn = 0x15,
    /// i32 object, i32 ctx, i32 depList
    StreamIn = 0x16,
    /// i32 object, i32 ctx, i32 depList
    StreamOut = 0x17,
    /// i32 object, i32 ctx, i32 depList
    StreamOutBlocking = 0x18,
    /// i32 globalTaskId, i32 ctx, i32 taskIndex, i32 numArgs, i32 depList
    Launch = 0x19,
    /// i32 constantIndex
    ConstantArg = 0x1a,
    /// i32 objectIndex
    ReferenceArg = 0x1b,
    /// i32 depList — extends the wait-list of the most recently emitted op
    AddDep = 0x1c,
    /// i32 depList
    Barrier = 0x1d,
    CopyInBatch = 0x25,
    StreamInBatch = 0x26,
    StreamOutBatch = 0x27,
    StreamOutBlockingBatch = 0x28,
    /// For launches the batch `size` operand carries the chunk thread count.
    LaunchBatch = 0x29,
}

impl Bytecode {
    /// The chunked form of a transfer or launch tag.
    pub fn batch(self) -> Self {
        match self {
            Self::CopyIn | Self::StreamIn | Self::StreamOut | Self::StreamOutBlocking
            | Self::Launch => {
                let tag: u8 = self.into();
                // Safe by construction of the tag table
                Self::try_from(tag + BATCH_TAG_OFFSET).unwrap_or(self)
            }
            other => other,
        }
    }

    /// The host-synchronizing counterpart of a non-blocking stream-out,
    /// if this tag has one.
    pub fn blocking(self) -> Option<Self> {
        match self {
            Self::StreamOut => Some(Self::StreamOutBlocking),
            Self::StreamOutBatch => Some(Self::StreamOutBlockingBatch),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum BytecodeError {
    #[error(
        "bytecode buffer overflow: the compiled program exceeds {capacity} bytes; \
         raise CompileOptions::max_bytecode_size"
    )]
    Overflow { capacity: usize },

    #[error("malformed bytecode: unknown tag {tag:#04x} at offset {offset}")]
    UnknownTag { tag: u8, offset: usize },

    #[error("malformed bytecode: truncated instruction at offset {offset}")]
    Truncated { offset: usize },
}
