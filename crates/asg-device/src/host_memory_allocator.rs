//! Address-space context that backs guest-chosen physical ranges with fresh host memory.

use std::collections::BTreeMap;
use std::fmt;
use std::io::{Read, Write};
use std::sync::Arc;

use asg_mem::{align_up, HostRegion};
use asg_snapshot::{ReadBeExt, SnapshotError, WriteBeExt};
use tracing::{debug, warn};

use crate::context::AddressSpaceDeviceType;
use crate::error::{die, fatal, AbortReason, Result};
use crate::ops::{AddressSpaceControlOps, AddressSpaceHwFuncs};
use crate::ping::PingInfo;

/// Result written to `PingInfo::metadata` when a command fails.
pub const HOST_MEMORY_ALLOCATOR_FAILURE: u64 = u64::MAX;

/// Alignment of the host memory handed to the guest.
pub const HOST_PAGE_ALIGNMENT: u64 = if cfg!(all(target_os = "macos", target_arch = "aarch64")) {
    16 * 1024
} else {
    4 * 1024
};

const COPY_CHUNK: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostMemoryAllocatorCommand {
    /// Back `[phys_addr, phys_addr + size)` with host memory.
    Allocate,
    /// Release the range previously allocated at `phys_addr`.
    Unallocate,
}

impl HostMemoryAllocatorCommand {
    pub const fn as_raw(self) -> u64 {
        match self {
            HostMemoryAllocatorCommand::Allocate => 1,
            HostMemoryAllocatorCommand::Unallocate => 2,
        }
    }

    pub const fn from_raw(raw: u64) -> Option<Self> {
        match raw {
            1 => Some(HostMemoryAllocatorCommand::Allocate),
            2 => Some(HostMemoryAllocatorCommand::Unallocate),
            _ => None,
        }
    }
}

pub struct AddressSpaceHostMemoryAllocatorContext {
    ops: Arc<dyn AddressSpaceControlOps>,
    hw: Arc<dyn AddressSpaceHwFuncs>,
    regions: BTreeMap<u64, Arc<HostRegion>>,
}

impl fmt::Debug for AddressSpaceHostMemoryAllocatorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AddressSpaceHostMemoryAllocatorContext")
            .field("regions", &self.regions.len())
            .finish_non_exhaustive()
    }
}

impl AddressSpaceHostMemoryAllocatorContext {
    pub fn new(ops: Arc<dyn AddressSpaceControlOps>, hw: Arc<dyn AddressSpaceHwFuncs>) -> Self {
        Self {
            ops,
            hw,
            regions: BTreeMap::new(),
        }
    }

    pub fn device_type(&self) -> AddressSpaceDeviceType {
        AddressSpaceDeviceType::HostMemoryAllocator
    }

    pub fn allocation_count(&self) -> usize {
        self.regions.len()
    }

    pub fn region(&self, phys_addr: u64) -> Option<&Arc<HostRegion>> {
        self.regions.get(&phys_addr)
    }

    /// Handle one ping; `metadata` becomes 0 on success or [`HOST_MEMORY_ALLOCATOR_FAILURE`].
    pub fn perform(&mut self, info: &mut PingInfo) -> Result<()> {
        info.metadata = match HostMemoryAllocatorCommand::from_raw(info.metadata) {
            Some(HostMemoryAllocatorCommand::Allocate) => {
                match self.allocate_impl(info.phys_addr, info.size) {
                    Some(_) => 0,
                    None => HOST_MEMORY_ALLOCATOR_FAILURE,
                }
            }
            Some(HostMemoryAllocatorCommand::Unallocate) => self.unallocate(info.phys_addr)?,
            None => {
                warn!(command = info.metadata, "unknown host memory allocator command");
                HOST_MEMORY_ALLOCATOR_FAILURE
            }
        };
        Ok(())
    }

    fn allocate_impl(&mut self, phys_addr: u64, size: u64) -> Option<Arc<HostRegion>> {
        if self.regions.contains_key(&phys_addr) {
            warn!(phys_addr, "host memory already allocated at this address");
            return None;
        }
        let aligned_size = align_up(size, self.hw.guest_page_size());
        let region = match HostRegion::allocate(aligned_size, HOST_PAGE_ALIGNMENT) {
            Ok(region) => Arc::new(region),
            Err(err) => {
                warn!(phys_addr, size, error = %err, "failed to allocate host memory");
                return None;
            }
        };
        if !self.ops.add_memory_mapping(phys_addr, Arc::clone(&region)) {
            warn!(phys_addr, size = aligned_size, "failed to map host memory");
            return None;
        }
        debug!(phys_addr, size = aligned_size, "allocated host memory");
        self.regions.insert(phys_addr, Arc::clone(&region));
        Some(region)
    }

    fn unallocate(&mut self, phys_addr: u64) -> Result<u64> {
        let Some(region) = self.regions.get(&phys_addr) else {
            return Ok(HOST_MEMORY_ALLOCATOR_FAILURE);
        };
        if !self.ops.remove_memory_mapping(phys_addr, region.len()) {
            return Err(fatal(
                AbortReason::InternalConsistency,
                format!(
                    "failed to remove host memory mapping at {phys_addr:#x} ({:#x} bytes)",
                    region.len()
                ),
            ));
        }
        self.regions.remove(&phys_addr);
        debug!(phys_addr, "released host memory");
        Ok(0)
    }

    pub fn clear(&mut self) -> Result<()> {
        while let Some((&phys_addr, _)) = self.regions.first_key_value() {
            self.unallocate(phys_addr)?;
        }
        Ok(())
    }

    pub fn save<W: Write + ?Sized>(&self, w: &mut W) -> Result<()> {
        w.write_be32(self.regions.len() as u32)?;
        let mut chunk = vec![0u8; COPY_CHUNK];
        for (&phys_addr, region) in &self.regions {
            let size = region.len();
            w.write_be64(phys_addr)?;
            w.write_be64(size)?;
            let mut offset = 0u64;
            while offset < size {
                let len = (size - offset).min(COPY_CHUNK as u64) as usize;
                region.read(offset, &mut chunk[..len])?;
                w.write_all(&chunk[..len])?;
                offset += len as u64;
            }
        }
        Ok(())
    }

    /// Replace all allocations with those written by
    /// [`AddressSpaceHostMemoryAllocatorContext::save`].
    pub fn load<R: Read + ?Sized>(&mut self, r: &mut R) -> Result<()> {
        self.clear()?;

        let count = r.read_be32()?;
        let mut chunk = vec![0u8; COPY_CHUNK];
        for _ in 0..count {
            let phys_addr = r.read_be64()?;
            let size = r.read_be64()?;
            let region = self
                .allocate_impl(phys_addr, size)
                .ok_or(SnapshotError::Corrupt("cannot re-create saved host memory allocation"))?;
            if region.len() != size {
                return Err(SnapshotError::Corrupt("saved host memory size is not page aligned").into());
            }
            let mut offset = 0u64;
            while offset < size {
                let len = (size - offset).min(COPY_CHUNK as u64) as usize;
                r.read_exact(&mut chunk[..len])?;
                region.write(offset, &chunk[..len])?;
                offset += len as u64;
            }
        }
        Ok(())
    }
}

impl Drop for AddressSpaceHostMemoryAllocatorContext {
    fn drop(&mut self) {
        if let Err(err) = self.clear() {
            die(err);
        }
    }
}
