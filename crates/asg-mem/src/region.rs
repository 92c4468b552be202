use std::alloc::{self, Layout};
use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::AtomicU32;
use std::sync::Arc;

use crate::error::HostMemoryError;

/// A contiguous host memory range that may be mapped into the guest physical window.
///
/// # Concurrency
/// The bytes of a region are shared with the guest (and with consumer threads on the host), so
/// this type never hands out `&[u8]` / `&mut [u8]` into the backing store. All byte access goes
/// through the copy-based [`HostRegion::read`] / [`HostRegion::write`] helpers, and word-sized
/// control fields are accessed through [`HostRegion::atomic_u32`]. Ordering between payload
/// bytes and control words is established by the Release/Acquire discipline of the callers.
pub struct HostRegion {
    ptr: NonNull<u8>,
    len: usize,
    /// `Some` when this region owns its allocation.
    layout: Option<Layout>,
}

// SAFETY: the region is a raw byte range with no thread affinity. All accesses are either
// bounds-checked copies or atomics.
unsafe impl Send for HostRegion {}
unsafe impl Sync for HostRegion {}

impl HostRegion {
    /// Allocate a zeroed region of `len` bytes aligned to `align`.
    pub fn allocate(len: u64, align: u64) -> Result<Self, HostMemoryError> {
        if len == 0 {
            return Err(HostMemoryError::ZeroSize);
        }
        let len_usize = usize::try_from(len).map_err(|_| HostMemoryError::SizeTooLarge { len })?;
        let align_usize = usize::try_from(align)
            .map_err(|_| HostMemoryError::InvalidLayout { len, align })?;
        let layout = Layout::from_size_align(len_usize, align_usize)
            .map_err(|_| HostMemoryError::InvalidLayout { len, align })?;

        // SAFETY: `layout` has a non-zero size.
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).ok_or(HostMemoryError::OutOfMemory { len })?;

        Ok(Self {
            ptr,
            len: len_usize,
            layout: Some(layout),
        })
    }

    /// Wrap memory owned by someone else. Dropping the returned region does not free it.
    ///
    /// # Safety
    /// The caller must ensure:
    /// - `ptr` is valid for reads and writes of `len` bytes for as long as any clone of the
    ///   returned region (or a [`HostSlice`] into it) is alive.
    /// - `ptr` is at least 4-byte aligned if [`HostRegion::atomic_u32`] will be used.
    pub unsafe fn from_external(ptr: NonNull<u8>, len: usize) -> Self {
        Self {
            ptr,
            len,
            layout: None,
        }
    }

    pub fn len(&self) -> u64 {
        self.len as u64
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// `true` when the backing memory is borrowed and will not be freed on drop.
    pub fn is_external(&self) -> bool {
        self.layout.is_none()
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    fn check_range(&self, offset: u64, len: usize) -> Result<usize, HostMemoryError> {
        let err = HostMemoryError::OutOfRange {
            offset,
            len: len as u64,
            size: self.len as u64,
        };
        let start = usize::try_from(offset).map_err(|_| err.clone())?;
        let end = start.checked_add(len).ok_or_else(|| err.clone())?;
        if end > self.len {
            return Err(err);
        }
        Ok(start)
    }

    pub fn read(&self, offset: u64, dst: &mut [u8]) -> Result<(), HostMemoryError> {
        let start = self.check_range(offset, dst.len())?;
        // SAFETY: `start..start + dst.len()` is within the region (checked above), and `dst` is a
        // distinct Rust allocation so the ranges cannot overlap.
        unsafe {
            core::ptr::copy_nonoverlapping(self.ptr.as_ptr().add(start), dst.as_mut_ptr(), dst.len());
        }
        Ok(())
    }

    pub fn write(&self, offset: u64, src: &[u8]) -> Result<(), HostMemoryError> {
        let start = self.check_range(offset, src.len())?;
        // SAFETY: see `read`.
        unsafe {
            core::ptr::copy_nonoverlapping(src.as_ptr(), self.ptr.as_ptr().add(start), src.len());
        }
        Ok(())
    }

    /// View the 32-bit word at `offset` as an atomic.
    pub fn atomic_u32(&self, offset: u64) -> Result<&AtomicU32, HostMemoryError> {
        let start = self.check_range(offset, 4)?;
        // SAFETY: in bounds (checked above).
        let addr = unsafe { self.ptr.as_ptr().add(start) };
        if (addr as usize) % core::mem::align_of::<AtomicU32>() != 0 {
            return Err(HostMemoryError::Misaligned { offset });
        }
        // SAFETY: `addr` is in bounds, aligned for `AtomicU32`, and lives as long as `self`.
        // `AtomicU32` has the same in-memory representation as `u32`.
        Ok(unsafe { &*(addr as *const AtomicU32) })
    }

    /// Borrow `len` bytes starting at `offset` as a [`HostSlice`].
    pub fn slice(self: &Arc<Self>, offset: u64, len: u64) -> Result<HostSlice, HostMemoryError> {
        HostSlice::new(Arc::clone(self), offset, len)
    }
}

impl Drop for HostRegion {
    fn drop(&mut self) {
        if let Some(layout) = self.layout {
            // SAFETY: `ptr` was returned by `alloc_zeroed(layout)` and has not been freed.
            unsafe { alloc::dealloc(self.ptr.as_ptr(), layout) };
        }
    }
}

impl fmt::Debug for HostRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostRegion")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .field("external", &self.is_external())
            .finish()
    }
}

/// A window of `len` bytes at `offset` inside a [`HostRegion`].
#[derive(Clone)]
pub struct HostSlice {
    region: Arc<HostRegion>,
    offset: u64,
    len: u64,
}

impl HostSlice {
    pub fn new(region: Arc<HostRegion>, offset: u64, len: u64) -> Result<Self, HostMemoryError> {
        let end = offset.checked_add(len);
        if end.map_or(true, |end| end > region.len()) {
            return Err(HostMemoryError::OutOfRange {
                offset,
                len,
                size: region.len(),
            });
        }
        Ok(Self {
            region,
            offset,
            len,
        })
    }

    pub fn region(&self) -> &Arc<HostRegion> {
        &self.region
    }

    /// Byte offset of this slice from the start of its region.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_ptr(&self) -> *mut u8 {
        // `offset + len <= region.len()` was checked at construction.
        self.region.as_ptr().wrapping_add(self.offset as usize)
    }

    /// Narrow this slice to `len` bytes at `offset` (relative to the slice).
    pub fn subslice(&self, offset: u64, len: u64) -> Result<HostSlice, HostMemoryError> {
        let end = offset.checked_add(len);
        if end.map_or(true, |end| end > self.len) {
            return Err(HostMemoryError::OutOfRange {
                offset,
                len,
                size: self.len,
            });
        }
        HostSlice::new(Arc::clone(&self.region), self.offset + offset, len)
    }

    fn check(&self, offset: u64, len: usize) -> Result<u64, HostMemoryError> {
        let end = offset.checked_add(len as u64);
        if end.map_or(true, |end| end > self.len) {
            return Err(HostMemoryError::OutOfRange {
                offset,
                len: len as u64,
                size: self.len,
            });
        }
        Ok(self.offset + offset)
    }

    pub fn read(&self, offset: u64, dst: &mut [u8]) -> Result<(), HostMemoryError> {
        let abs = self.check(offset, dst.len())?;
        self.region.read(abs, dst)
    }

    pub fn write(&self, offset: u64, src: &[u8]) -> Result<(), HostMemoryError> {
        let abs = self.check(offset, src.len())?;
        self.region.write(abs, src)
    }

    pub fn atomic_u32(&self, offset: u64) -> Result<&AtomicU32, HostMemoryError> {
        let abs = self.check(offset, 4)?;
        self.region.atomic_u32(abs)
    }

    /// Copy the whole slice out.
    pub fn to_vec(&self) -> Result<Vec<u8>, HostMemoryError> {
        let len = usize::try_from(self.len).map_err(|_| HostMemoryError::SizeTooLarge { len: self.len })?;
        let mut out = vec![0u8; len];
        self.region.read(self.offset, &mut out)?;
        Ok(out)
    }
}

impl fmt::Debug for HostSlice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostSlice")
            .field("region", &self.region.as_ptr())
            .field("offset", &self.offset)
            .field("len", &self.len)
            .finish()
    }
}
