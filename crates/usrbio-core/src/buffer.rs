//! Raw views into a shared buffer region.
//!
//! The engine validates every range against its region before a
//! `BufferRef` is handed to a backend, and keeps the region mapped until
//! the request's completion is harvested. Backends dereference the
//! pointer on their own threads.

use std::ptr::NonNull;

/// A validated `[ptr, ptr + len)` range inside a registered region.
#[derive(Debug, Clone, Copy)]
pub struct BufferRef {
    ptr: NonNull<u8>,
    len: usize,
}

// Safety: a BufferRef is only created for memory that outlives the request
// and whose range no other in-flight request may race on (the region's span
// table rejects conflicting overlaps).
unsafe impl Send for BufferRef {}
unsafe impl Sync for BufferRef {}

impl BufferRef {
    /// # Safety
    /// `ptr..ptr+len` must stay valid for the lifetime of the request that
    /// carries this reference.
    pub unsafe fn new(ptr: NonNull<u8>, len: usize) -> Self {
        Self { ptr, len }
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The sub-range starting `skip` bytes in (used to resume short transfers).
    pub fn advance(&self, skip: usize) -> Self {
        let skip = skip.min(self.len);
        // Safety: skip <= len keeps the pointer inside the original range.
        let ptr = unsafe { NonNull::new_unchecked(self.ptr.as_ptr().add(skip)) };
        Self { ptr, len: self.len - skip }
    }

    /// # Safety
    /// No other thread may write this range while the slice is alive.
    pub unsafe fn as_slice<'a>(&self) -> &'a [u8] {
        std::slice::from_raw_parts(self.ptr.as_ptr(), self.len)
    }

    /// # Safety
    /// No other thread may access this range while the slice is alive.
    pub unsafe fn as_mut_slice<'a>(&self) -> &'a mut [u8] {
        std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len)
    }
}
