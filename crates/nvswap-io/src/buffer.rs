//! Shared buffers and the buffer manager.
//!
//! A [`SharedBuffer`] is a reference-counted slot around an [`AlignedBuffer`].
//! Callers keep one clone, the engine takes another for the duration of a
//! transfer. Exclusive use is tracked with a `busy` flag: a caller's
//! [`BufferGuard`] and an engine's [`BufferLease`] both hold it, so at most
//! one of them can touch the bytes at a time and a second claim fails fast
//! with [`AllocationError::InUse`] instead of racing.
//!
//! Release is explicit and happens once. Releasing frees the memory
//! immediately; the slot stays behind so that late accesses report
//! [`AllocationError::AlreadyReleased`] rather than touching freed memory.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;

use crate::{AlignedBuffer, AllocationError};

#[derive(Debug)]
struct BufferSlot {
    id: u64,
    len: usize,
    alignment: usize,
    pinned: bool,
    busy: AtomicBool,
    released: AtomicBool,
    data: Mutex<AlignedBuffer>,
}

impl BufferSlot {
    fn claim(&self) -> Result<(), AllocationError> {
        if self.released.load(Ordering::Acquire) {
            return Err(AllocationError::AlreadyReleased { buffer: self.id });
        }
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| AllocationError::InUse { buffer: self.id })?;
        // Re-check: a release may have slipped in between the two loads.
        if self.released.load(Ordering::Acquire) {
            self.busy.store(false, Ordering::Release);
            return Err(AllocationError::AlreadyReleased { buffer: self.id });
        }
        Ok(())
    }

    fn unclaim(&self) {
        self.busy.store(false, Ordering::Release);
    }

    fn data(&self) -> MutexGuard<'_, AlignedBuffer> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A buffer shared between a caller and the engine.
///
/// Cloning is cheap and yields another reference to the same memory.
#[derive(Debug, Clone)]
pub struct SharedBuffer {
    slot: Arc<BufferSlot>,
}

impl SharedBuffer {
    fn new(id: u64, buffer: AlignedBuffer) -> Self {
        Self {
            slot: Arc::new(BufferSlot {
                id,
                len: buffer.len(),
                alignment: buffer.alignment(),
                pinned: buffer.is_pinned(),
                busy: AtomicBool::new(false),
                released: AtomicBool::new(false),
                data: Mutex::new(buffer),
            }),
        }
    }

    /// Returns the identifier assigned by the manager.
    pub fn id(&self) -> u64 {
        self.slot.id
    }

    /// Returns the usable length in bytes.
    pub fn len(&self) -> usize {
        self.slot.len
    }

    /// Returns true if the buffer has no usable bytes.
    pub fn is_empty(&self) -> bool {
        self.slot.len == 0
    }

    /// Returns the alignment of the base address.
    pub fn alignment(&self) -> usize {
        self.slot.alignment
    }

    /// Returns true if the pages were locked at allocation.
    pub fn is_pinned(&self) -> bool {
        self.slot.pinned
    }

    /// Returns true while a guard or an in-flight operation holds the buffer.
    pub fn is_busy(&self) -> bool {
        self.slot.busy.load(Ordering::Acquire)
    }

    /// Returns true once the buffer has been released.
    pub fn is_released(&self) -> bool {
        self.slot.released.load(Ordering::Acquire)
    }

    /// Returns true if both values refer to the same slot.
    pub fn ptr_eq(&self, other: &SharedBuffer) -> bool {
        Arc::ptr_eq(&self.slot, &other.slot)
    }

    /// Claims the buffer for direct access by the caller.
    ///
    /// Fails with [`AllocationError::InUse`] while an operation is in flight
    /// on it. Do not hold the guard across a wait on an operation that
    /// targets the same buffer: the submission would have been rejected.
    pub fn lock(&self) -> Result<BufferGuard<'_>, AllocationError> {
        self.slot.claim()?;
        Ok(BufferGuard {
            slot: &self.slot,
            data: self.slot.data(),
        })
    }

    /// Claims the buffer on behalf of an operation.
    pub fn lease(&self) -> Result<BufferLease, AllocationError> {
        self.slot.claim()?;
        Ok(BufferLease {
            slot: Arc::clone(&self.slot),
        })
    }

    /// Copies `data` into the start of the buffer.
    pub fn copy_from_slice(&self, data: &[u8]) -> Result<(), AllocationError> {
        if data.len() > self.len() {
            return Err(AllocationError::InvalidLength { length: data.len() });
        }
        let mut guard = self.lock()?;
        guard.as_mut_slice()[..data.len()].copy_from_slice(data);
        Ok(())
    }

    /// Copies the buffer contents out into an immutable `Bytes`.
    pub fn snapshot(&self) -> Result<Bytes, AllocationError> {
        let guard = self.lock()?;
        Ok(Bytes::copy_from_slice(guard.as_slice()))
    }

    fn release(&self) -> Result<(), AllocationError> {
        self.slot.claim()?;
        self.slot.released.store(true, Ordering::Release);
        let freed = std::mem::replace(&mut *self.slot.data(), AlignedBuffer::empty());
        self.slot.unclaim();
        drop(freed);
        Ok(())
    }
}

/// Caller-side exclusive access to a [`SharedBuffer`].
#[derive(Debug)]
pub struct BufferGuard<'a> {
    slot: &'a BufferSlot,
    data: MutexGuard<'a, AlignedBuffer>,
}

impl Deref for BufferGuard<'_> {
    type Target = AlignedBuffer;

    fn deref(&self) -> &AlignedBuffer {
        &self.data
    }
}

impl DerefMut for BufferGuard<'_> {
    fn deref_mut(&mut self) -> &mut AlignedBuffer {
        &mut self.data
    }
}

impl Drop for BufferGuard<'_> {
    fn drop(&mut self) {
        self.slot.unclaim();
    }
}

/// Engine-side claim on a [`SharedBuffer`], held from submission until the
/// operation completes. Dropping the lease makes the buffer available again.
#[derive(Debug)]
pub struct BufferLease {
    slot: Arc<BufferSlot>,
}

impl BufferLease {
    /// Returns the identifier of the leased buffer.
    pub fn buffer_id(&self) -> u64 {
        self.slot.id
    }

    /// Returns the usable length of the leased buffer.
    pub fn len(&self) -> usize {
        self.slot.len
    }

    /// Returns true if the leased buffer has no usable bytes.
    pub fn is_empty(&self) -> bool {
        self.slot.len == 0
    }

    /// Locks the memory for the transfer.
    pub fn data(&self) -> MutexGuard<'_, AlignedBuffer> {
        self.slot.data()
    }
}

impl Drop for BufferLease {
    fn drop(&mut self) {
        self.slot.unclaim();
    }
}

/// Allocates and tracks [`SharedBuffer`]s.
///
/// Every engine handle owns one manager; buffers it hands out are released
/// together by [`BufferManager::release_all`] when the handle closes. A
/// manager is plain state, not a process-wide registry, so independent
/// engines never share one.
#[derive(Debug)]
pub struct BufferManager {
    pin: bool,
    next_id: AtomicU64,
    live: Mutex<Vec<SharedBuffer>>,
}

impl BufferManager {
    /// Creates a manager. With `pin` set, every allocation is locked in
    /// memory and fails if the kernel refuses.
    pub fn new(pin: bool) -> Self {
        Self {
            pin,
            next_id: AtomicU64::new(1),
            live: Mutex::new(Vec::new()),
        }
    }

    /// Returns true if allocations are pinned.
    pub fn pins(&self) -> bool {
        self.pin
    }

    /// Allocates a zeroed buffer of `length` bytes aligned to `alignment`.
    pub fn allocate(&self, length: usize, alignment: usize) -> Result<SharedBuffer, AllocationError> {
        let mut buffer = AlignedBuffer::new(length, alignment)?;
        if self.pin {
            buffer.pin()?;
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let shared = SharedBuffer::new(id, buffer);

        tracing::debug!(buffer = id, length, alignment, pinned = self.pin, "allocated buffer");
        self.live_list().push(shared.clone());
        Ok(shared)
    }

    /// Releases a buffer allocated by this manager.
    ///
    /// Releasing twice is a caller bug and reports
    /// [`AllocationError::AlreadyReleased`]; releasing while an operation
    /// holds the buffer reports [`AllocationError::InUse`].
    pub fn release(&self, buffer: &SharedBuffer) -> Result<(), AllocationError> {
        buffer.release()?;
        self.live_list().retain(|b| !b.ptr_eq(buffer));
        tracing::debug!(buffer = buffer.id(), "released buffer");
        Ok(())
    }

    /// Releases every buffer still tracked. Buffers that are busy stay
    /// tracked and are counted in the returned tuple's second element.
    pub fn release_all(&self) -> (usize, usize) {
        let buffers = std::mem::take(&mut *self.live_list());
        let mut released = 0;
        let mut kept = Vec::new();

        for buffer in buffers {
            match buffer.release() {
                Ok(()) => released += 1,
                Err(AllocationError::AlreadyReleased { .. }) => {}
                Err(e) => {
                    tracing::warn!(buffer = buffer.id(), error = %e, "buffer not released");
                    kept.push(buffer);
                }
            }
        }

        let busy = kept.len();
        self.live_list().extend(kept);
        (released, busy)
    }

    /// Returns the number of buffers allocated and not yet released.
    pub fn live_count(&self) -> usize {
        self.live_list().len()
    }

    fn live_list(&self) -> MutexGuard<'_, Vec<SharedBuffer>> {
        self.live.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for BufferManager {
    fn default() -> Self {
        Self::new(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_and_release() {
        let manager = BufferManager::new(false);
        let buf = manager.allocate(8192, 4096).unwrap();
        assert_eq!(buf.len(), 8192);
        assert_eq!(manager.live_count(), 1);

        manager.release(&buf).unwrap();
        assert!(buf.is_released());
        assert_eq!(manager.live_count(), 0);
    }

    #[test]
    fn double_release_is_reported() {
        let manager = BufferManager::new(false);
        let buf = manager.allocate(4096, 4096).unwrap();
        manager.release(&buf).unwrap();

        let err = manager.release(&buf).unwrap_err();
        assert_eq!(err, AllocationError::AlreadyReleased { buffer: buf.id() });
    }

    #[test]
    fn lease_blocks_second_claim() {
        let manager = BufferManager::new(false);
        let buf = manager.allocate(4096, 4096).unwrap();

        let lease = buf.lease().unwrap();
        assert!(buf.is_busy());
        assert!(matches!(buf.lease(), Err(AllocationError::InUse { .. })));
        assert!(matches!(buf.lock(), Err(AllocationError::InUse { .. })));
        assert!(matches!(manager.release(&buf), Err(AllocationError::InUse { .. })));

        drop(lease);
        assert!(!buf.is_busy());
        assert!(buf.lock().is_ok());
    }

    #[test]
    fn guard_writes_are_visible() {
        let manager = BufferManager::new(false);
        let buf = manager.allocate(16, 512).unwrap();
        {
            let mut guard = buf.lock().unwrap();
            guard.as_mut_slice().copy_from_slice(b"0123456789abcdef");
        }
        assert_eq!(&buf.snapshot().unwrap()[..], b"0123456789abcdef");
    }

    #[test]
    fn access_after_release_fails() {
        let manager = BufferManager::new(false);
        let buf = manager.allocate(4096, 4096).unwrap();
        manager.release(&buf).unwrap();

        assert!(matches!(buf.lock(), Err(AllocationError::AlreadyReleased { .. })));
        assert!(matches!(buf.snapshot(), Err(AllocationError::AlreadyReleased { .. })));
    }

    #[test]
    fn release_all_skips_busy_buffers() {
        let manager = BufferManager::new(false);
        let a = manager.allocate(4096, 4096).unwrap();
        let b = manager.allocate(4096, 4096).unwrap();
        let lease = b.lease().unwrap();

        let (released, busy) = manager.release_all();
        assert_eq!((released, busy), (1, 1));
        assert!(a.is_released());
        assert!(!b.is_released());

        drop(lease);
        assert_eq!(manager.release_all(), (1, 0));
        assert_eq!(manager.live_count(), 0);
    }

    #[test]
    fn copy_from_slice_rejects_oversize() {
        let manager = BufferManager::new(false);
        let buf = manager.allocate(8, 512).unwrap();
        let err = buf.copy_from_slice(&[0u8; 9]).unwrap_err();
        assert_eq!(err, AllocationError::InvalidLength { length: 9 });
    }
}
