//! Host side of the address-space graphics (ASG) transport.
//!
//! A guest graphics context talks to the host through a tiny ping structure ([`PingInfo`]) and
//! a pair of shared-memory regions:
//! - the *ring*: a fixed-size control area ([`ring`]) holding the to-host ring, the
//!   large-transfer control blocks and the ring config header;
//! - the *buffer*: a larger per-context payload area.
//!
//! Both regions are sub-allocated out of large, page-aligned host memory blocks that are mapped
//! into the guest physical window ([`AsgGlobals`]). Virtio-gpu backed contexts instead get a
//! single *combined* allocation in a dedicated block backed by collaborator-owned memory, with
//! the ring and buffer exposed as views into it.
//!
//! Interpreting ring contents is the job of an external consumer ([`ConsumerInterface`]); this
//! crate only sequences its lifecycle, its sleep/wake signalling and snapshot/restore.

pub mod block;
pub mod config;
pub mod consumer;
pub mod context;
pub mod error;
pub mod globals;
pub mod host_memory_allocator;
pub mod ops;
pub mod ping;
pub mod ring;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use block::{Allocation, BlockInfo, BlockPool};
pub use config::{AsgConfig, ConfigError};
pub use consumer::{
    ConsumerCallbacks, ConsumerCommand, ConsumerHandle, ConsumerInterface, ConsumerMessages,
    UnavailableRead, CONSUMER_CHANNEL_CAPACITY, MAX_UNAVAILABLE_READS,
};
pub use context::{
    AddressSpaceDeviceType, AddressSpaceGraphicsContext, AsgCreateInfo, VirtioGpuCreateInfo,
    VirtioGpuInfo,
};
pub use error::{die, AbortReason, AsgError, FatalError, Result};
pub use globals::{AsgGlobals, ExternalMemory, LoadResources};
pub use host_memory_allocator::{
    AddressSpaceHostMemoryAllocatorContext, HostMemoryAllocatorCommand,
    HOST_MEMORY_ALLOCATOR_FAILURE,
};
pub use ops::{AddressSpaceControlOps, AddressSpaceHwFuncs, RegionError};
pub use ping::{AsgCommand, PingInfo};
pub use ring::{HostState, RingConfig, RingContext, ASG_RING_STORAGE_SIZE_BYTES};
