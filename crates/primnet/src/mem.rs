use std::alloc::{self, Layout};
use std::fmt;
use std::ptr::NonNull;
use std::slice;

use crate::engine::EngineError;

/// Alignment used for conversion scratch buffers; wide enough for the
/// vectorized loads the compute layouts assume.
pub const SCRATCH_ALIGN: usize = 64;

/// Zeroed, alignment-constrained backing storage for an internal tensor.
///
/// Ownership moves into the tensor handle on `bind`; the storage is released
/// when the owning kernel is dropped.
pub struct AlignedBuffer {
    ptr: NonNull<u8>,
    len: usize,
    align: usize,
}

impl AlignedBuffer {
    /// Allocates `len` zeroed bytes at the requested alignment.
    pub fn zeroed(len: usize, align: usize) -> Result<Self, EngineError> {
        if len == 0 {
            return Err(EngineError::invalid("zero-length scratch buffer"));
        }
        let layout = Layout::from_size_align(len, align)
            .map_err(|err| EngineError::invalid(format!("scratch buffer layout: {err}")))?;
        // SAFETY: layout has non-zero size.
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).ok_or_else(|| {
            EngineError::resource(format!("allocation of {len} scratch bytes failed"))
        })?;
        Ok(Self { ptr, len, align })
    }

    pub fn byte_len(&self) -> usize {
        self.len
    }

    pub fn align(&self) -> usize {
        self.align
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: the allocation is live, zero-initialized, and `len` bytes long.
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: the allocation is live, `len` bytes long, and exclusively borrowed.
        unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for AlignedBuffer {
    fn drop(&mut self) {
        // SAFETY: allocated in `zeroed` with this exact size and alignment.
        unsafe {
            alloc::dealloc(
                self.ptr.as_ptr(),
                Layout::from_size_align_unchecked(self.len, self.align),
            );
        }
    }
}

// SAFETY: the buffer exclusively owns its allocation; access from a shared
// reference is read-only.
unsafe impl Send for AlignedBuffer {}
unsafe impl Sync for AlignedBuffer {}

impl fmt::Debug for AlignedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AlignedBuffer")
            .field("len", &self.len)
            .field("align", &self.align)
            .finish()
    }
}
