use std::collections::BTreeMap;
use std::fmt;
use std::io::{Read, Write};

use asg_snapshot::{ReadBeExt, SnapshotError, WriteBeExt};

use crate::align_up;

/// First-fit, page-granular allocator over a fixed byte range `[0, size)`.
///
/// Every allocation starts on a page boundary and its size is rounded up to a whole number of
/// pages. The allocator hands out offsets; it never touches the memory it describes.
#[derive(Clone)]
pub struct SubAllocator {
    size: u64,
    page_size: u64,
    /// One entry per page; `true` when the page belongs to a live allocation.
    used: Vec<bool>,
    /// First page of each live allocation -> number of pages.
    allocations: BTreeMap<u64, u64>,
}

impl SubAllocator {
    /// Create an allocator over `size` bytes. A trailing partial page is never handed out.
    ///
    /// `page_size` must be a non-zero power of two.
    pub fn new(size: u64, page_size: u64) -> Self {
        assert!(page_size.is_power_of_two(), "page size must be a power of two");
        let page_count = size / page_size;
        Self {
            size,
            page_size,
            used: vec![false; page_count as usize],
            allocations: BTreeMap::new(),
        }
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    pub fn page_count(&self) -> u64 {
        self.used.len() as u64
    }

    pub fn allocated_pages(&self) -> u64 {
        self.allocations.values().sum()
    }

    /// `true` iff no pages are currently allocated.
    pub fn is_empty(&self) -> bool {
        self.allocations.is_empty()
    }

    /// Allocate `size` bytes. Returns the byte offset of the allocation, or `None` when no run of
    /// free pages is large enough.
    pub fn alloc(&mut self, size: u64) -> Option<u64> {
        if size == 0 {
            return None;
        }
        let pages = align_up(size, self.page_size) / self.page_size;
        if pages > self.page_count() {
            return None;
        }

        let mut run_start = 0u64;
        let mut run_len = 0u64;
        for (page, used) in self.used.iter().enumerate() {
            if *used {
                run_len = 0;
                run_start = page as u64 + 1;
                continue;
            }
            run_len += 1;
            if run_len == pages {
                break;
            }
        }
        if run_len < pages {
            return None;
        }

        for used in &mut self.used[run_start as usize..(run_start + pages) as usize] {
            *used = true;
        }
        self.allocations.insert(run_start, pages);
        Some(run_start * self.page_size)
    }

    /// Release the allocation starting at `offset`. Returns `false` if `offset` is not the start
    /// of a live allocation (double free, or a pointer into the middle of one).
    pub fn free(&mut self, offset: u64) -> bool {
        if offset % self.page_size != 0 {
            return false;
        }
        let first = offset / self.page_size;
        let Some(pages) = self.allocations.remove(&first) else {
            return false;
        };
        for used in &mut self.used[first as usize..(first + pages) as usize] {
            *used = false;
        }
        true
    }

    pub fn free_all(&mut self) {
        self.allocations.clear();
        self.used.fill(false);
    }

    /// Size in bytes of the live allocation starting at `offset`.
    pub fn allocation_size(&self, offset: u64) -> Option<u64> {
        if offset % self.page_size != 0 {
            return None;
        }
        self.allocations
            .get(&(offset / self.page_size))
            .map(|pages| pages * self.page_size)
    }

    /// Iterate live allocations as `(offset, size)` in ascending offset order.
    pub fn allocations(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.allocations
            .iter()
            .map(|(first, pages)| (first * self.page_size, pages * self.page_size))
    }

    /// Write the allocation state. The region geometry is included so a load into a differently
    /// sized allocator is detected.
    pub fn save<W: Write + ?Sized>(&self, w: &mut W) -> asg_snapshot::Result<()> {
        w.write_be64(self.page_size)?;
        w.write_be64(self.page_count())?;
        w.write_be64(self.allocations.len() as u64)?;
        for (first, pages) in &self.allocations {
            w.write_be64(*first)?;
            w.write_be64(*pages)?;
        }
        Ok(())
    }

    /// Replace the allocation state with one previously written by [`SubAllocator::save`].
    ///
    /// On error the allocator is left empty.
    pub fn load<R: Read + ?Sized>(&mut self, r: &mut R) -> asg_snapshot::Result<()> {
        self.free_all();

        let page_size = r.read_be64()?;
        let page_count = r.read_be64()?;
        if page_size != self.page_size || page_count != self.page_count() {
            return Err(SnapshotError::Corrupt("sub-allocator geometry mismatch"));
        }

        let count = r.read_be64()?;
        if count > page_count {
            return Err(SnapshotError::Corrupt("sub-allocator allocation count too large"));
        }

        for _ in 0..count {
            let first = r.read_be64()?;
            let pages = r.read_be64()?;
            let end = first.checked_add(pages);
            if pages == 0 || end.map_or(true, |end| end > page_count) {
                self.free_all();
                return Err(SnapshotError::Corrupt("sub-allocator range out of bounds"));
            }
            let range = first as usize..(first + pages) as usize;
            if self.used[range.clone()].iter().any(|used| *used) {
                self.free_all();
                return Err(SnapshotError::Corrupt("sub-allocator ranges overlap"));
            }
            for used in &mut self.used[range] {
                *used = true;
            }
            self.allocations.insert(first, pages);
        }
        Ok(())
    }
}

impl fmt::Debug for SubAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubAllocator")
            .field("size", &self.size)
            .field("page_size", &self.page_size)
            .field("allocations", &self.allocations.len())
            .field("allocated_pages", &self.allocated_pages())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn allocations_are_page_aligned_and_rounded() {
        let mut a = SubAllocator::new(16 * 4096, 4096);
        assert_eq!(a.alloc(1), Some(0));
        assert_eq!(a.alloc(4097), Some(4096));
        assert_eq!(a.allocation_size(4096), Some(8192));
        assert_eq!(a.alloc(4096), Some(3 * 4096));
        assert_eq!(a.allocated_pages(), 4);
    }

    #[test]
    fn first_fit_reuses_freed_hole() {
        let mut a = SubAllocator::new(4 * 4096, 4096);
        let x = a.alloc(4096).unwrap();
        let y = a.alloc(4096).unwrap();
        let _z = a.alloc(4096).unwrap();
        assert!(a.free(y));
        assert_eq!(a.alloc(4096), Some(y));
        assert!(a.free(x));
        // Two pages do not fit in the one-page hole at 0; the tail page is also too small.
        assert_eq!(a.alloc(8192), None);
    }

    #[test]
    fn double_free_and_interior_free_fail() {
        let mut a = SubAllocator::new(4 * 4096, 4096);
        let x = a.alloc(8192).unwrap();
        assert!(!a.free(x + 4096));
        assert!(!a.free(x + 1));
        assert!(a.free(x));
        assert!(!a.free(x));
        assert!(a.is_empty());
    }

    #[test]
    fn oversized_and_zero_requests_fail() {
        let mut a = SubAllocator::new(2 * 4096, 4096);
        assert_eq!(a.alloc(0), None);
        assert_eq!(a.alloc(3 * 4096), None);
        assert!(a.is_empty());
    }

    #[test]
    fn partial_trailing_page_is_not_handed_out() {
        let mut a = SubAllocator::new(4096 + 100, 4096);
        assert_eq!(a.page_count(), 1);
        assert_eq!(a.alloc(4096), Some(0));
        assert_eq!(a.alloc(1), None);
    }

    #[test]
    fn save_load_preserves_allocation_map() {
        let mut a = SubAllocator::new(8 * 4096, 4096);
        let x = a.alloc(4096).unwrap();
        let y = a.alloc(3 * 4096).unwrap();
        a.free(x);

        let mut bytes = Vec::new();
        a.save(&mut bytes).unwrap();

        let mut b = SubAllocator::new(8 * 4096, 4096);
        b.load(&mut Cursor::new(bytes)).unwrap();
        assert_eq!(b.allocations().collect::<Vec<_>>(), vec![(y, 3 * 4096)]);
        // The restored map drives future placement.
        assert_eq!(b.alloc(4096), Some(0));
        assert_eq!(b.alloc(4096), Some(4 * 4096));
    }

    #[test]
    fn load_rejects_geometry_mismatch() {
        let a = SubAllocator::new(8 * 4096, 4096);
        let mut bytes = Vec::new();
        a.save(&mut bytes).unwrap();

        let mut b = SubAllocator::new(4 * 4096, 4096);
        let err = b.load(&mut Cursor::new(bytes)).unwrap_err();
        assert!(matches!(err, SnapshotError::Corrupt(_)));
    }

    #[test]
    fn load_rejects_overlapping_ranges() {
        let mut bytes = Vec::new();
        bytes.write_be64(4096).unwrap();
        bytes.write_be64(4).unwrap();
        bytes.write_be64(2).unwrap();
        bytes.write_be64(0).unwrap();
        bytes.write_be64(2).unwrap();
        bytes.write_be64(1).unwrap();
        bytes.write_be64(1).unwrap();

        let mut a = SubAllocator::new(4 * 4096, 4096);
        let err = a.load(&mut Cursor::new(bytes)).unwrap_err();
        assert!(matches!(err, SnapshotError::Corrupt("sub-allocator ranges overlap")));
        assert!(a.is_empty());
    }
}
