//! The execution-context query surface the compiler depends on.
//!
//! An execution context is assembled by the embedding runtime before
//! compilation: ordered constants, ordered objects with per-object stream
//! flags, ordered task descriptors with per-argument access modes, and the
//! mapping from logical task invocation ids to device indices. The compiler
//! treats all of it as read-only.

use fnv::FnvHashMap;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

bitflags::bitflags! {
    /// Per-object lifecycle flags, supplied by the object bookkeeping layer.
    #[derive(Clone, Copy, Eq, PartialEq, Default, Debug, Serialize, Deserialize)]
    pub struct ObjectFlags: u8 {
        /// The object must be re-transferred to the device on every execution.
        const STREAM_IN  = 0b0001;
        /// The object's device-side value must be transferred back to the host.
        const STREAM_OUT = 0b0010;
    }
}

/// How a task argument is accessed by the kernel.
///
/// Supplied per task by the (external) argument-access discovery pass.
#[derive(Clone, Copy, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub enum Access {
    Read,
    Write,
    ReadWrite,
}

impl Access {
    pub fn is_write(self) -> bool {
        matches!(self, Self::Write | Self::ReadWrite)
    }
}

/// Element type of a uniform buffer, used for batch thread arithmetic.
#[derive(Clone, Copy, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub enum ElementKind {
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
    U64,
    I64,
    F32,
    F64,
}

impl ElementKind {
    pub fn size_bytes(self) -> u64 {
        match self {
            Self::U8 | Self::I8 => 1,
            Self::U16 | Self::I16 => 2,
            Self::U32 | Self::I32 | Self::F32 => 4,
            Self::U64 | Self::I64 | Self::F64 => 8,
        }
    }
}

/// Byte length and element type of a transferable buffer. Objects without a
/// descriptor (opaque handles) cannot participate in batched compilation.
#[derive(Clone, Copy, Eq, PartialEq, Debug, Serialize, Deserialize)]
pub struct TransferDesc {
    pub len_bytes: u64,
    pub element: ElementKind,
}

#[derive(Clone, Default, Debug, Serialize, Deserialize)]
pub struct ObjectDesc {
    pub flags: ObjectFlags,
    pub transfer: Option<TransferDesc>,
}

impl ObjectDesc {
    pub fn buffer(len_bytes: u64, element: ElementKind) -> Self {
        Self {
            flags: ObjectFlags::empty(),
            transfer: Some(TransferDesc { len_bytes, element }),
        }
    }

    pub fn with_flags(mut self, flags: ObjectFlags) -> Self {
        self.flags = flags;
        self
    }
}

/// A compile-time scalar argument.
#[derive(Clone, Copy, PartialEq, Debug, Serialize, Deserialize)]
pub enum Scalar {
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    Bool(bool),
}

/// One schedulable task: a name for diagnostics plus the per-argument
/// access-mode table sourced from its compiled method signature.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskDesc {
    pub name: String,
    pub accesses: SmallVec<Access, 8>,
}

impl TaskDesc {
    pub fn new(name: impl Into<String>, accesses: impl IntoIterator<Item = Access>) -> Self {
        Self {
            name: name.into(),
            accesses: accesses.into_iter().collect(),
        }
    }
}

#[derive(Clone, Default, Debug, Serialize, Deserialize)]
pub struct ExecutionContext {
    constants: Vec<Scalar>,
    objects: Vec<ObjectDesc>,
    tasks: Vec<TaskDesc>,
    /// logical task invocation id -> device index
    device_map: FnvHashMap<u32, u32>,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_constant(&mut self, constant: Scalar) -> usize {
        self.constants.push(constant);
        self.constants.len() - 1
    }

    pub fn add_object(&mut self, object: ObjectDesc) -> usize {
        self.objects.push(object);
        self.objects.len() - 1
    }

    pub fn add_task(&mut self, task: TaskDesc) -> usize {
        self.tasks.push(task);
        self.tasks.len() - 1
    }

    pub fn map_task_device(&mut self, global_task_id: u32, device_index: u32) {
        self.device_map.insert(global_task_id, device_index);
    }

    pub fn constants(&self) -> &[Scalar] {
        &self.constants
    }

    pub fn objects(&self) -> &[ObjectDesc] {
        &self.objects
    }

    pub fn object(&self, index: usize) -> Option<&ObjectDesc> {
        self.objects.get(index)
    }

    pub fn tasks(&self) -> &[TaskDesc] {
        &self.tasks
    }

    pub fn task(&self, index: usize) -> Option<&TaskDesc> {
        self.tasks.get(index)
    }

    pub fn device_index(&self, global_task_id: u32) -> Option<u32> {
        self.device_map.get(&global_task_id).copied()
    }
}
