use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumIter, EnumString};

use crate::error::{Error, Result};
use crate::model::{row_major_strides, DataType, OutputId, Shape};

/// Named memory space with its own allocator and capacity
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    EnumIter,
    EnumString,
)]
#[strum(serialize_all = "snake_case")]
pub enum MemoryLocation {
    /// Function inputs, provided by the runtime
    Input,
    /// Function outputs, provided by the runtime
    Output,
    /// Read-only constant data shipped in the binary
    Rdata,
    /// Scratch memory for intermediates
    Data,
    /// Scratch memory shared across functions of a module
    SharedData,
    /// Device-local memory of an accelerator
    Device,
}

impl MemoryLocation {
    /// Code used in the binary mempool and IO descriptors
    pub fn code(&self) -> u8 {
        match self {
            MemoryLocation::Input => 0,
            MemoryLocation::Output => 1,
            MemoryLocation::Rdata => 2,
            MemoryLocation::Data => 3,
            MemoryLocation::SharedData => 4,
            MemoryLocation::Device => 5,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        let location = match code {
            0 => MemoryLocation::Input,
            1 => MemoryLocation::Output,
            2 => MemoryLocation::Rdata,
            3 => MemoryLocation::Data,
            4 => MemoryLocation::SharedData,
            5 => MemoryLocation::Device,
            _ => return None,
        };
        Some(location)
    }
}

/// Identifier of a logical buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BufferId(pub usize);

/// Identifier of a physical buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PhysicalId(pub usize);

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "b{}", self.0)
    }
}

impl fmt::Display for PhysicalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "p{}", self.0)
    }
}

/// Step-indexed live interval `[birth, birth + age)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lifetime {
    /// Step at which the producer runs
    pub birth: usize,
    /// Number of steps the content must stay valid
    pub age: usize,
}

impl Lifetime {
    pub fn new(birth: usize, age: usize) -> Self {
        Self { birth, age }
    }

    pub fn end(&self) -> usize {
        self.birth + self.age
    }

    /// Whether both intervals share at least one step
    pub fn overlaps(&self, other: &Lifetime) -> bool {
        self.birth < other.end() && other.birth < self.end()
    }

    /// Smallest interval covering both
    pub fn union(&self, other: &Lifetime) -> Lifetime {
        let birth = self.birth.min(other.birth);
        let end = self.end().max(other.end());
        Lifetime::new(birth, end - birth)
    }
}

/// Byte range inside a memory location
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemorySpan {
    pub start: usize,
    pub size: usize,
}

impl MemorySpan {
    pub fn new(start: usize, size: usize) -> Self {
        Self { start, size }
    }

    pub fn end(&self) -> usize {
        self.start + self.size
    }

    pub fn overlaps(&self, other: &MemorySpan) -> bool {
        self.start < other.end() && other.start < self.end()
    }
}

/// Alias edge: this buffer's storage is a view into `parent`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferAlias {
    pub parent: BufferId,
    pub offset_bytes: usize,
}

/// Live range and storage requirement of one operator output
#[derive(Debug, Clone)]
pub struct LogicalBuffer {
    pub id: BufferId,
    /// Output connector that produced the buffer
    pub owner: OutputId,
    pub name: String,
    pub data_type: DataType,
    pub shape: Shape,
    /// Shape of the storage this buffer is laid out in
    pub parent_shape: Shape,
    pub location: MemoryLocation,
    pub size_bytes: usize,
    pub alignment: usize,
    pub lifetime: Lifetime,
    pub alias: Option<BufferAlias>,
    /// Terminal alias root, filled in by the lifetime fixer
    pub root: Option<BufferId>,
    /// Byte offset into the root storage
    pub root_offset: usize,
    pub physical: Option<PhysicalId>,
}

impl LogicalBuffer {
    pub fn is_root(&self) -> bool {
        self.alias.is_none()
    }

    /// Whether the buffer is laid out densely in its own shape
    pub fn is_contiguous(&self) -> bool {
        self.parent_shape == self.shape
    }

    /// Element strides of the buffer inside its storage
    pub fn strides(&self) -> Vec<usize> {
        row_major_strides(&self.parent_shape)
    }
}

/// One independently allocated storage region
#[derive(Debug, Clone)]
pub struct PhysicalBuffer {
    pub id: PhysicalId,
    pub location: MemoryLocation,
    pub size_bytes: usize,
    pub alignment: usize,
    /// Union of the lifetimes of all members
    pub lifetime: Lifetime,
    /// Alias root backing this region
    pub root: BufferId,
    pub members: Vec<BufferId>,
    /// Placement, once the allocator has run
    pub allocation: Option<MemorySpan>,
}

/// Owner of all logical buffers of one schedule run
#[derive(Debug, Clone, Default)]
pub struct LogicalBufferStore {
    buffers: Vec<LogicalBuffer>,
    by_output: BTreeMap<OutputId, BufferId>,
}

impl LogicalBufferStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a buffer owned by `buffer.owner`; the id is assigned here
    pub fn insert(&mut self, mut buffer: LogicalBuffer) -> Result<BufferId> {
        if self.by_output.contains_key(&buffer.owner) {
            return Err(Error::DuplicateAllocation(buffer.name));
        }
        let id = BufferId(self.buffers.len());
        buffer.id = id;
        self.by_output.insert(buffer.owner, id);
        self.buffers.push(buffer);
        Ok(id)
    }

    /// Map another output onto an existing buffer
    pub fn bind(&mut self, output: OutputId, buffer: BufferId) -> Result<()> {
        self.get(buffer)?;
        if self.by_output.insert(output, buffer).is_some() {
            return Err(Error::DuplicateAllocation(output.to_string()));
        }
        Ok(())
    }

    pub fn get(&self, id: BufferId) -> Result<&LogicalBuffer> {
        self.buffers
            .get(id.0)
            .ok_or_else(|| Error::InvalidGraph(format!("Unknown buffer {}", id)))
    }

    pub fn get_mut(&mut self, id: BufferId) -> Result<&mut LogicalBuffer> {
        self.buffers
            .get_mut(id.0)
            .ok_or_else(|| Error::InvalidGraph(format!("Unknown buffer {}", id)))
    }

    pub fn buffer_of(&self, output: OutputId) -> Option<BufferId> {
        self.by_output.get(&output).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = &LogicalBuffer> {
        self.buffers.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut LogicalBuffer> {
        self.buffers.iter_mut()
    }

    /// Output to buffer mapping in output order
    pub fn bindings(&self) -> impl Iterator<Item = (OutputId, BufferId)> + '_ {
        self.by_output.iter().map(|(&output, &buffer)| (output, buffer))
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Whether any buffer currently names `id` as its alias parent
    pub fn has_children(&self, id: BufferId) -> bool {
        self.buffers
            .iter()
            .any(|buffer| buffer.alias.map(|alias| alias.parent) == Some(id))
    }

    /// Follow alias edges to the current root, returning it with the accumulated offset
    pub fn resolve(&self, id: BufferId) -> Result<(BufferId, usize)> {
        let mut current = id;
        let mut offset = 0;
        for _ in 0..=self.buffers.len() {
            match self.get(current)?.alias {
                Some(alias) => {
                    offset += alias.offset_bytes;
                    current = alias.parent;
                }
                None => return Ok((current, offset)),
            }
        }
        Err(Error::AliasCycle(id.to_string()))
    }

    pub fn into_buffers(self) -> Vec<LogicalBuffer> {
        self.buffers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifetime_overlap_is_half_open() {
        let a = Lifetime::new(0, 2);
        let b = Lifetime::new(2, 1);
        let c = Lifetime::new(1, 3);
        assert!(!a.overlaps(&b));
        assert!(a.overlaps(&c));
        assert!(c.overlaps(&b));
    }

    #[test]
    fn test_lifetime_union() {
        let merged = Lifetime::new(3, 2).union(&Lifetime::new(1, 1));
        assert_eq!(merged, Lifetime::new(1, 4));
        assert_eq!(merged.end(), 5);
    }

    #[test]
    fn test_memory_location_names() {
        assert_eq!(MemoryLocation::SharedData.to_string(), "shared_data");
        assert_eq!("rdata".parse::<MemoryLocation>().unwrap(), MemoryLocation::Rdata);
    }
}
