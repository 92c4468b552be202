//! Host memory blocks and the allocations carved out of them.

use std::fmt;
use std::io::{Read, Write};
use std::sync::Arc;

use asg_mem::{HostRegion, HostSlice, SubAllocator};
use asg_snapshot::{ReadBeExt, WriteBeExt};

/// The three independent block pools kept by [`crate::AsgGlobals`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockPool {
    /// Ring storage of non-virtio contexts.
    Ring,
    /// Buffers of non-virtio contexts.
    Buffer,
    /// Dedicated ring+buffer blocks of virtio-gpu contexts.
    Combined,
}

impl BlockPool {
    /// Pool order used on the snapshot stream.
    pub const ALL: [BlockPool; 3] = [BlockPool::Ring, BlockPool::Buffer, BlockPool::Combined];

    pub fn name(self) -> &'static str {
        match self {
            BlockPool::Ring => "ring",
            BlockPool::Buffer => "buffer",
            BlockPool::Combined => "combined",
        }
    }
}

impl fmt::Display for BlockPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Backing memory of a filled block.
#[derive(Debug)]
pub(crate) struct BlockMemory {
    pub(crate) region: Arc<HostRegion>,
    pub(crate) sub_alloc: SubAllocator,
}

/// One slot of a block pool. Slots are never removed, so block indices stay valid; an empty
/// slot has no memory and is refilled on demand.
#[derive(Debug, Default)]
pub(crate) struct Block {
    pub(crate) memory: Option<BlockMemory>,
    pub(crate) buffer_size: u64,
    pub(crate) offset_into_phys: u64,
    pub(crate) dedicated_context_handle: Option<u32>,
    pub(crate) uses_virtio_gpu_hostmem: bool,
    pub(crate) hostmem_id: u64,
    /// Backed by memory owned by someone else; never unmapped or freed here.
    pub(crate) external: bool,
}

impl Block {
    pub(crate) fn is_empty(&self) -> bool {
        self.memory.is_none()
    }

    pub(crate) fn info(&self) -> BlockInfo {
        BlockInfo {
            filled: !self.is_empty(),
            buffer_size: self.buffer_size,
            offset_into_phys: self.offset_into_phys,
            dedicated_context_handle: self.dedicated_context_handle,
            uses_virtio_gpu_hostmem: self.uses_virtio_gpu_hostmem,
            hostmem_id: self.hostmem_id,
            external: self.external,
            allocated_bytes: self.memory.as_ref().map_or(0, |memory| {
                memory.sub_alloc.allocated_pages() * memory.sub_alloc.page_size()
            }),
        }
    }
}

/// Read-only view of a pool slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockInfo {
    pub filled: bool,
    pub buffer_size: u64,
    pub offset_into_phys: u64,
    pub dedicated_context_handle: Option<u32>,
    pub uses_virtio_gpu_hostmem: bool,
    pub hostmem_id: u64,
    pub external: bool,
    pub allocated_bytes: u64,
}

/// Parameters for placing an allocation.
#[derive(Debug, Clone, Default)]
pub(crate) struct AllocationCreateInfo {
    pub(crate) virtio_gpu: bool,
    pub(crate) from_load: bool,
    pub(crate) size: u64,
    pub(crate) hostmem_id: u64,
    pub(crate) external: Option<Arc<HostRegion>>,
    pub(crate) dedicated_context_handle: Option<u32>,
}

/// A sub-range of a block handed to a context.
///
/// A default allocation refers to nothing; releasing it is a no-op. Views (`is_view`) alias
/// part of another allocation and are never released on their own.
#[derive(Debug, Clone, Default)]
pub struct Allocation {
    pub(crate) host: Option<HostSlice>,
    pub block_index: u64,
    pub offset_into_phys: u64,
    pub size: u64,
    pub dedicated_context_handle: Option<u32>,
    pub hostmem_id: u64,
    pub is_view: bool,
}

impl Allocation {
    pub fn host(&self) -> Option<&HostSlice> {
        self.host.as_ref()
    }

    pub fn is_allocated(&self) -> bool {
        self.host.is_some()
    }

    /// Write the position of the allocation. Host memory itself is saved with its block.
    pub(crate) fn save_descriptor<W: Write + ?Sized>(&self, w: &mut W) -> asg_snapshot::Result<()> {
        w.write_be64(self.block_index)?;
        w.write_be64(self.offset_into_phys)?;
        w.write_be64(self.size)?;
        w.write_flag(self.is_view)?;
        Ok(())
    }

    /// Read a descriptor; the host slice is resolved later against the reloaded pools.
    pub(crate) fn load_descriptor<R: Read + ?Sized>(r: &mut R) -> asg_snapshot::Result<Self> {
        Ok(Self {
            host: None,
            block_index: r.read_be64()?,
            offset_into_phys: r.read_be64()?,
            size: r.read_be64()?,
            dedicated_context_handle: None,
            hostmem_id: 0,
            is_view: r.read_flag()?,
        })
    }
}
