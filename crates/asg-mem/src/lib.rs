//! Host memory backing for guest-visible ASG regions.
//!
//! - [`HostRegion`] is a page-aligned byte range that is either owned by this crate (allocated
//!   zeroed on the host heap) or borrowed from a collaborator (e.g. a virtio-gpu blob resource).
//! - [`HostSlice`] is a cheap, non-owning window into a region. It keeps the region alive via an
//!   `Arc`, so a slice never dangles even if the block that handed it out is torn down.
//! - [`SubAllocator`] carves page-granular ranges out of a fixed-size region. It tracks offsets
//!   only; turning an offset into bytes is the caller's job.

mod error;
mod region;
mod sub_alloc;

pub use crate::error::HostMemoryError;
pub use crate::region::{HostRegion, HostSlice};
pub use crate::sub_alloc::SubAllocator;

/// Round `value` up to the nearest multiple of `alignment`.
///
/// `alignment` must be > 0. Saturates instead of wrapping on pathological inputs.
pub fn align_up(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment > 0);

    let add = alignment - 1;
    match value.checked_add(add) {
        Some(v) => v / alignment * alignment,
        None => u64::MAX / alignment * alignment,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_up_rounds_to_multiple() {
        assert_eq!(align_up(0, 4096), 0);
        assert_eq!(align_up(1, 4096), 4096);
        assert_eq!(align_up(4096, 4096), 4096);
        assert_eq!(align_up(4097, 4096), 8192);
        assert_eq!(align_up(u64::MAX, 4096), u64::MAX / 4096 * 4096);
    }
}
