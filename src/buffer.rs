use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;

use crate::error::{Error, Result};

/// Platform page size. Cached after the first sysconf call.
pub fn page_size() -> usize {
    use std::sync::OnceLock;
    static PAGE: OnceLock<usize> = OnceLock::new();
    *PAGE.get_or_init(|| {
        #[cfg(unix)]
        {
            let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
            if sz > 0 {
                return sz as usize;
            }
        }
        4096
    })
}

/// Page-aligned send buffer. The zero-copy transmit path pins these pages, so
/// the region must stay at a stable address and must not be freed while a
/// deferred send against it is unresolved.
pub struct AlignedBuf {
    ptr: NonNull<u8>,
    len: usize,
    layout: Layout,
}

// The buffer moves to a worker thread and is never aliased across threads.
unsafe impl Send for AlignedBuf {}

impl AlignedBuf {
    /// Allocate a zeroed, page-aligned region whose length is the smallest
    /// page multiple >= `min_size`.
    pub fn new(min_size: usize) -> Result<Self> {
        let page = page_size();
        let len = min_size.div_ceil(page) * page;
        let layout = Layout::from_size_align(len, page)
            .map_err(|_| Error::AllocationFailed { size: min_size })?;
        let ptr = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).ok_or(Error::AllocationFailed { size: len })?;
        Ok(Self { ptr, len, layout })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    /// Intentionally abandon the allocation. Used when a deferred send could
    /// not be confirmed: the kernel may still DMA from these pages, so
    /// returning them to the allocator would be unsound.
    pub fn leak(self) {
        std::mem::forget(self);
    }
}

impl Deref for AlignedBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl DerefMut for AlignedBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for AlignedBuf {
    fn drop(&mut self) {
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

impl std::fmt::Debug for AlignedBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlignedBuf")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_rounding() {
        let page = page_size();
        let buf = AlignedBuf::new(1).unwrap();
        assert_eq!(buf.len(), page);

        let buf = AlignedBuf::new(page + 1).unwrap();
        assert_eq!(buf.len(), 2 * page);

        let buf = AlignedBuf::new(page).unwrap();
        assert_eq!(buf.len(), page);
    }

    #[test]
    fn test_alignment() {
        let buf = AlignedBuf::new(1032).unwrap();
        assert_eq!(buf.as_ptr() as usize % page_size(), 0);
    }

    #[test]
    fn test_zeroed_and_writable() {
        let mut buf = AlignedBuf::new(64).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
        buf[..4].copy_from_slice(b"abcd");
        assert_eq!(&buf[..4], b"abcd");
    }
}
