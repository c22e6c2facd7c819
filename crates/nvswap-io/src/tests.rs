//! Integration tests for buffers and backends together.

use crate::{AlignedBuffer, BLOCK_ALIGNMENT, BufferManager, IoBackend, OpenFlags, SyncBackend};

#[test]
fn aligned_buffer_roundtrip() {
    let data = b"test data for alignment";
    let buf = AlignedBuffer::from_data(data, BLOCK_ALIGNMENT).unwrap();

    assert_eq!(buf.capacity(), BLOCK_ALIGNMENT);
    assert_eq!(buf.as_slice(), data);
}

#[test]
fn managed_buffer_full_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("lifecycle.dat");
    let backend = SyncBackend::new();
    let manager = BufferManager::new(false);

    let src = manager.allocate(2 * BLOCK_ALIGNMENT, BLOCK_ALIGNMENT).unwrap();
    {
        let mut guard = src.lock().unwrap();
        for (i, b) in guard.as_mut_slice().iter_mut().enumerate() {
            *b = (i % 251) as u8;
        }
    }

    let lease = src.lease().unwrap();
    let handle = backend
        .open(&path, OpenFlags::write_create().with_direct(true))
        .unwrap();
    let written = backend.write_at(&handle, 0, lease.data().as_slice()).unwrap();
    assert_eq!(written, 2 * BLOCK_ALIGNMENT);
    backend.fsync(&handle).unwrap();
    assert_eq!(backend.file_size(&handle).unwrap(), 2 * BLOCK_ALIGNMENT as u64);
    backend.close(handle).unwrap();
    drop(lease);

    let dst = manager.allocate(2 * BLOCK_ALIGNMENT, BLOCK_ALIGNMENT).unwrap();
    let lease = dst.lease().unwrap();
    let handle = backend
        .open(&path, OpenFlags::read_only().with_direct(true))
        .unwrap();
    let read = backend
        .read_at(&handle, 0, lease.data().as_mut_slice())
        .unwrap();
    assert_eq!(read, 2 * BLOCK_ALIGNMENT);
    drop(lease);

    assert_eq!(src.snapshot().unwrap(), dst.snapshot().unwrap());
    assert_eq!(manager.release_all(), (2, 0));
}

#[test]
fn read_at_boundaries() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("boundaries.dat");
    let backend = SyncBackend::new();

    let data: Vec<u8> = (0..=255).collect();
    std::fs::write(&path, &data).unwrap();

    let handle = backend.open(&path, OpenFlags::read_only()).unwrap();

    let mut buf = [0u8; 10];
    let n = backend.read_at(&handle, 100, &mut buf).unwrap();
    assert_eq!(n, 10);
    assert_eq!(&buf, &[100, 101, 102, 103, 104, 105, 106, 107, 108, 109]);

    // Read near end (partial read)
    let n = backend.read_at(&handle, 250, &mut buf).unwrap();
    assert_eq!(n, 6);
    assert_eq!(&buf[..6], &[250, 251, 252, 253, 254, 255]);

    // Read past end
    let n = backend.read_at(&handle, 4096, &mut buf).unwrap();
    assert_eq!(n, 0);

    backend.close(handle).unwrap();
}
