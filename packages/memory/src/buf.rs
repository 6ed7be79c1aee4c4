//! Aligned raw buffers.
//!
//! Provider-reported layouts carry alignments that `Vec<u8>` cannot
//! honor, so object storage goes through [`AlignedBuf`]: a zeroed heap
//! allocation with the exact size and alignment the provider asked for.
//! This is the only module in the crate that touches raw allocation.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;

use crate::error::{MemoryError, Result};
use crate::provider::SizeAlignment;

/// A heap allocation with provider-specified size and alignment.
///
/// The buffer is zeroed on creation and freed on drop. Contents are plain
/// bytes; constructors and destructors run over them from the outside.
pub struct AlignedBuf {
    ptr: NonNull<u8>,
    layout: Layout,
}

impl AlignedBuf {
    /// Allocate a zeroed buffer for `size_alignment`.
    pub fn new(size_alignment: SizeAlignment) -> Result<Self> {
        let SizeAlignment { size, alignment } = size_alignment;
        let layout = Layout::from_size_align(size, alignment)
            .map_err(|_| MemoryError::InvalidLayout { size, alignment })?;
        if layout.size() == 0 {
            return Ok(Self {
                ptr: NonNull::dangling(),
                layout,
            });
        }
        // SAFETY: layout is valid and non-zero sized.
        let raw = unsafe { alloc_zeroed(layout) };
        let ptr =
            NonNull::new(raw).ok_or(MemoryError::AllocationFailed { size, alignment })?;
        Ok(Self { ptr, layout })
    }

    pub fn len(&self) -> usize {
        self.layout.size()
    }

    pub fn is_empty(&self) -> bool {
        self.layout.size() == 0
    }

    pub fn alignment(&self) -> usize {
        self.layout.align()
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr covers exactly layout.size() initialized bytes for
        // the lifetime of self.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.layout.size()) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as as_slice, and &mut self guarantees exclusive access.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.layout.size()) }
    }
}

impl Drop for AlignedBuf {
    fn drop(&mut self) {
        if self.layout.size() != 0 {
            // SAFETY: ptr was returned by alloc_zeroed with this layout.
            unsafe { dealloc(self.ptr.as_ptr(), self.layout) };
        }
    }
}

// SAFETY: the allocation is exclusively owned and carries no thread
// affinity; access from other threads goes through &/&mut as usual.
unsafe impl Send for AlignedBuf {}
unsafe impl Sync for AlignedBuf {}

impl std::fmt::Debug for AlignedBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlignedBuf")
            .field("size", &self.layout.size())
            .field("alignment", &self.layout.align())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_zeroed_with_alignment() {
        let mut buffer = AlignedBuf::new(SizeAlignment::new(48, 16)).unwrap();
        assert_eq!(buffer.len(), 48);
        assert_eq!(buffer.alignment(), 16);
        assert_eq!(buffer.as_slice().as_ptr() as usize % 16, 0);
        assert!(buffer.as_slice().iter().all(|b| *b == 0));

        buffer.as_mut_slice()[0] = 0xab;
        assert_eq!(buffer.as_slice()[0], 0xab);
    }

    #[test]
    fn zero_sized_buffer_is_fine() {
        let buffer = AlignedBuf::new(SizeAlignment::new(0, 8)).unwrap();
        assert!(buffer.is_empty());
        assert_eq!(buffer.as_slice().len(), 0);
    }

    #[test]
    fn rejects_non_power_of_two_alignment() {
        let err = AlignedBuf::new(SizeAlignment::new(16, 3)).unwrap_err();
        assert!(matches!(err, MemoryError::InvalidLayout { .. }));
    }
}
