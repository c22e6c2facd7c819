//! Aligned buffer for Direct I/O.
//!
//! When using O_DIRECT on Linux, the buffer address, the transfer length, and
//! the file offset must all be multiples of the logical block size (512 or
//! 4096 bytes). `Vec<u8>` only guarantees byte alignment, so this module
//! allocates through `std::alloc` with an explicit [`Layout`].
//!
//! Buffers may additionally be pinned with `mlock(2)` so the pages stay
//! resident while a transfer is in flight. Pinning counts against
//! `RLIMIT_MEMLOCK`; exceeding it fails the allocation instead of silently
//! returning pageable memory.

#![allow(unsafe_code)]

use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::fmt;
use std::ptr::NonNull;

use crate::AllocationError;

/// Block alignment requirement for Direct I/O (4 KiB).
pub const BLOCK_ALIGNMENT: usize = 4096;

/// Smallest alignment accepted for unbuffered I/O (one 512-byte sector).
pub const MIN_ALIGNMENT: usize = 512;

/// A zeroed, heap-allocated buffer with guaranteed address alignment.
///
/// `len()` is the length requested by the caller; `capacity()` is that
/// length rounded up to the alignment, so both the base address and the
/// capacity are multiples of `alignment()`.
pub struct AlignedBuffer {
    ptr: NonNull<u8>,
    len: usize,
    capacity: usize,
    alignment: usize,
    pinned: bool,
}

// SAFETY: The buffer exclusively owns its allocation; no aliases escape
// except through borrows tied to `&self` / `&mut self`.
unsafe impl Send for AlignedBuffer {}
// SAFETY: Shared access only hands out `&[u8]`.
unsafe impl Sync for AlignedBuffer {}

impl AlignedBuffer {
    /// Allocates a zeroed buffer of `len` bytes aligned to `alignment`.
    pub fn new(len: usize, alignment: usize) -> Result<Self, AllocationError> {
        if alignment < MIN_ALIGNMENT || !alignment.is_power_of_two() {
            return Err(AllocationError::InvalidAlignment {
                alignment,
                minimum: MIN_ALIGNMENT,
            });
        }
        if len == 0 {
            return Err(AllocationError::InvalidLength { length: len });
        }

        let capacity = len
            .checked_add(alignment - 1)
            .map(|v| v & !(alignment - 1))
            .ok_or(AllocationError::InvalidLength { length: len })?;
        let layout = Layout::from_size_align(capacity, alignment)
            .map_err(|_| AllocationError::InvalidLength { length: len })?;

        // SAFETY: `layout` has a non-zero size (capacity >= alignment > 0).
        let raw = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).ok_or(AllocationError::OutOfMemory { capacity })?;

        Ok(Self {
            ptr,
            len,
            capacity,
            alignment,
            pinned: false,
        })
    }

    /// Allocates an aligned buffer holding a copy of `data`.
    ///
    /// Bytes between `data.len()` and the aligned capacity are zero.
    pub fn from_data(data: &[u8], alignment: usize) -> Result<Self, AllocationError> {
        let mut buf = Self::new(data.len(), alignment)?;
        buf.as_mut_slice().copy_from_slice(data);
        Ok(buf)
    }

    /// An empty placeholder that owns no memory.
    pub(crate) fn empty() -> Self {
        Self {
            ptr: NonNull::dangling(),
            len: 0,
            capacity: 0,
            alignment: MIN_ALIGNMENT,
            pinned: false,
        }
    }

    /// Locks the buffer's pages in physical memory.
    ///
    /// Pinning an already-pinned buffer is a no-op.
    pub fn pin(&mut self) -> Result<(), AllocationError> {
        if self.pinned || self.capacity == 0 {
            return Ok(());
        }
        lock_pages(self.ptr, self.capacity)?;
        self.pinned = true;
        Ok(())
    }

    /// Returns the requested length.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the buffer holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns the allocated size, a multiple of the alignment.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns the alignment the buffer was allocated with.
    pub fn alignment(&self) -> usize {
        self.alignment
    }

    /// Returns true if the pages are locked in memory.
    pub fn is_pinned(&self) -> bool {
        self.pinned
    }

    /// Returns the base address.
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    /// Returns the buffer contents as a slice.
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: `ptr` is valid for `len` initialized (zeroed) bytes, or is
        // dangling with `len == 0`.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    /// Returns the buffer contents as a mutable slice.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: As above, and `&mut self` guarantees exclusive access.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    /// Returns the full aligned capacity as a mutable slice.
    ///
    /// Direct I/O transfers whole blocks, so reads of a length that is not a
    /// multiple of the alignment land in this tail.
    pub fn as_mut_capacity(&mut self) -> &mut [u8] {
        // SAFETY: The allocation is `capacity` bytes and fully zero-initialized.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.capacity) }
    }
}

impl Drop for AlignedBuffer {
    fn drop(&mut self) {
        if self.capacity == 0 {
            return;
        }
        if self.pinned {
            unlock_pages(self.ptr, self.capacity);
        }
        // The same layout was validated in `new`.
        if let Ok(layout) = Layout::from_size_align(self.capacity, self.alignment) {
            // SAFETY: `ptr` came from `alloc_zeroed` with exactly this layout.
            unsafe { dealloc(self.ptr.as_ptr(), layout) };
        }
    }
}

impl fmt::Debug for AlignedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AlignedBuffer")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .field("capacity", &self.capacity)
            .field("alignment", &self.alignment)
            .field("pinned", &self.pinned)
            .finish()
    }
}

impl AsRef<[u8]> for AlignedBuffer {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl AsMut<[u8]> for AlignedBuffer {
    fn as_mut(&mut self) -> &mut [u8] {
        self.as_mut_slice()
    }
}

#[cfg(unix)]
fn lock_pages(ptr: NonNull<u8>, capacity: usize) -> Result<(), AllocationError> {
    // SAFETY: The range is a live allocation owned by the caller.
    let rc = unsafe { libc::mlock(ptr.as_ptr().cast(), capacity) };
    if rc == 0 {
        Ok(())
    } else {
        let code = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
        Err(AllocationError::PinLimit { capacity, code })
    }
}

#[cfg(not(unix))]
fn lock_pages(_ptr: NonNull<u8>, _capacity: usize) -> Result<(), AllocationError> {
    Err(AllocationError::PinUnsupported)
}

#[cfg(unix)]
fn unlock_pages(ptr: NonNull<u8>, capacity: usize) {
    // SAFETY: The range was locked by `lock_pages` and is still allocated.
    let rc = unsafe { libc::munlock(ptr.as_ptr().cast(), capacity) };
    if rc != 0 {
        tracing::warn!(
            capacity,
            error = %std::io::Error::last_os_error(),
            "munlock failed while freeing pinned buffer"
        );
    }
}

#[cfg(not(unix))]
fn unlock_pages(_ptr: NonNull<u8>, _capacity: usize) {}

/// Rounds `value` up to the nearest multiple of `alignment`.
pub fn round_up(value: usize, alignment: usize) -> usize {
    debug_assert!(alignment > 0, "alignment must be positive");
    debug_assert!(
        alignment.is_power_of_two(),
        "alignment must be a power of two"
    );
    (value + alignment - 1) & !(alignment - 1)
}

/// Returns true if `value` is a multiple of `alignment`.
pub fn is_aligned(value: u64, alignment: usize) -> bool {
    alignment.is_power_of_two() && value & (alignment as u64 - 1) == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use test_case::test_case;

    #[test]
    fn round_up_basic() {
        assert_eq!(round_up(0, 4096), 0);
        assert_eq!(round_up(1, 4096), 4096);
        assert_eq!(round_up(4096, 4096), 4096);
        assert_eq!(round_up(4097, 4096), 8192);
    }

    #[test]
    fn aligned_buffer_from_data() {
        let data = vec![1u8; 100];
        let buf = AlignedBuffer::from_data(&data, 4096).unwrap();
        assert_eq!(buf.len(), 100);
        assert_eq!(buf.capacity(), 4096);
        assert_eq!(buf.as_slice(), data.as_slice());
    }

    #[test]
    fn new_buffer_is_zeroed() {
        let mut buf = AlignedBuffer::new(10_000, 512).unwrap();
        assert_eq!(buf.capacity(), 10_240);
        assert!(buf.as_mut_capacity().iter().all(|&b| b == 0));
    }

    #[test_case(0; "zero")]
    #[test_case(100; "not a power of two")]
    #[test_case(256; "below sector size")]
    fn rejects_bad_alignment(alignment: usize) {
        let err = AlignedBuffer::new(4096, alignment).unwrap_err();
        assert!(matches!(err, AllocationError::InvalidAlignment { .. }));
    }

    #[test]
    fn rejects_zero_length() {
        let err = AlignedBuffer::new(0, 4096).unwrap_err();
        assert_eq!(err, AllocationError::InvalidLength { length: 0 });
    }

    #[test]
    fn rejects_overflowing_length() {
        let err = AlignedBuffer::new(usize::MAX - 10, 4096).unwrap_err();
        assert!(matches!(err, AllocationError::InvalidLength { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn pin_small_buffer() {
        let mut buf = AlignedBuffer::new(4096, 4096).unwrap();
        // Tiny mlock requests fit within the default RLIMIT_MEMLOCK, but a
        // locked-down sandbox may still refuse; either way no panic.
        match buf.pin() {
            Ok(()) => assert!(buf.is_pinned()),
            Err(e) => assert!(matches!(e, AllocationError::PinLimit { .. })),
        }
    }

    #[test]
    fn is_aligned_checks_multiples() {
        assert!(is_aligned(0, 512));
        assert!(is_aligned(8192, 4096));
        assert!(!is_aligned(4100, 4096));
    }

    proptest! {
        #[test]
        fn allocation_satisfies_alignment(len in 1usize..65_536, shift in 9u32..14) {
            let alignment = 1usize << shift;
            let buf = AlignedBuffer::new(len, alignment).unwrap();
            prop_assert_eq!(buf.as_ptr() as usize % alignment, 0);
            prop_assert_eq!(buf.capacity() % alignment, 0);
            prop_assert!(buf.capacity() >= len);
            prop_assert!(buf.capacity() - len < alignment);
            prop_assert_eq!(buf.len(), len);
        }
    }
}
