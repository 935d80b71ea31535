//! The recorded-operation stream format.
//!
//! The front end records one task graph as a linear byte stream of tagged
//! records; the graph builder replays it. Tags are one byte, operands are
//! little-endian i32. An unrecognized tag terminates the replay, which lets
//! newer recorders append record kinds older compilers simply ignore.

use num_enum::{IntoPrimitive, TryFromPrimitive};

#[derive(Clone, Copy, Eq, PartialEq, Debug, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum RecordTag {
    /// i32 logicalTaskId, i32 taskIndex
    SelectContext = 0x01,
    /// i32 numArgs
    ArgListOpen = 0x02,
    /// i32 objectIndex
    LoadRef = 0x03,
    /// i32 constantIndex
    LoadConst = 0x04,
    Launch = 0x05,
}

/// Writes the record stream consumed by the graph builder.
#[derive(Default)]
pub struct GraphRecorder {
    buf: Vec<u8>,
}

impl GraphRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn select_context(&mut self, global_task_id: u32, task_index: usize) -> &mut Self {
        self.tag(RecordTag::SelectContext);
        self.i32(global_task_id as i32);
        self.i32(task_index as i32);
        self
    }

    pub fn arg_list_open(&mut self, num_args: usize) -> &mut Self {
        self.tag(RecordTag::ArgListOpen);
        self.i32(num_args as i32);
        self
    }

    pub fn load_ref(&mut self, object_index: usize) -> &mut Self {
        self.tag(RecordTag::LoadRef);
        self.i32(object_index as i32);
        self
    }

    pub fn load_const(&mut self, constant_index: usize) -> &mut Self {
        self.tag(RecordTag::LoadConst);
        self.i32(constant_index as i32);
        self
    }

    pub fn launch(&mut self) -> &mut Self {
        self.tag(RecordTag::Launch);
        self
    }

    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }

    fn tag(&mut self, tag: RecordTag) {
        self.buf.push(tag.into());
    }

    fn i32(&mut self, value: i32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }
}
