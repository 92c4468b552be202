//! Host-side address-space graphics (ASG) device.
//!
//! - [`device`]: contexts, block pools and the consumer protocol;
//! - [`mem`]: host memory regions and the page sub-allocator;
//! - [`snapshot`]: big-endian snapshot stream helpers.

pub use asg_device as device;
pub use asg_mem as mem;
pub use asg_snapshot as snapshot;

pub use asg_device::{
    AddressSpaceGraphicsContext, AddressSpaceHostMemoryAllocatorContext, AsgConfig, AsgCreateInfo,
    AsgError, AsgGlobals, ConsumerInterface, PingInfo, Result,
};
