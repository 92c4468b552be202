//! Collaborator interfaces supplied by the virtual device layer.

use std::ptr::NonNull;
use std::sync::Arc;

use asg_mem::HostRegion;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegionError {
    #[error("no room for a {size:#x} byte region in the shared physical window")]
    Exhausted { size: u64 },

    #[error("shared physical window offset {offset:#x} is already in use")]
    Occupied { offset: u64 },

    #[error("no shared region is allocated at offset {offset:#x}")]
    NotAllocated { offset: u64 },
}

/// Reservations inside the guest-physical window owned by the address-space device.
///
/// Offsets are relative to [`AddressSpaceHwFuncs::phys_addr_start`].
pub trait AddressSpaceHwFuncs: Send + Sync {
    fn alloc_shared_host_region(&self, size: u64) -> Result<u64, RegionError>;

    /// Reserve `size` bytes at a caller-chosen `offset` (snapshot restore).
    fn alloc_shared_host_region_fixed(&self, size: u64, offset: u64) -> Result<(), RegionError>;

    fn free_shared_host_region(&self, offset: u64) -> Result<(), RegionError>;

    fn phys_addr_start(&self) -> u64;

    fn guest_page_size(&self) -> u64 {
        4096
    }
}

/// VM-level memory operations.
pub trait AddressSpaceControlOps: Send + Sync {
    /// Make `region` visible to the guest at `gpa`.
    fn add_memory_mapping(&self, gpa: u64, region: Arc<HostRegion>) -> bool;

    fn remove_memory_mapping(&self, gpa: u64, size: u64) -> bool;

    /// Drop a virtio-gpu host memory registration.
    fn hostmem_unregister(&self, hostmem_id: u64);

    /// Translate a guest physical address into a host pointer.
    fn host_ptr(&self, gpa: u64) -> Option<NonNull<u8>>;
}
