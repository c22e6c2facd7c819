//! Operation descriptors and completion records.

use std::fmt;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use nvswap_io::BufferLease;

/// Identifier of one submitted operation, unique within its handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OpId(u64);

impl OpId {
    pub(crate) fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw identifier.
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op-{}", self.0)
    }
}

/// Transfer direction relative to storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Storage to buffer.
    Read,
    /// Buffer to storage.
    Write,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Read => f.write_str("read"),
            Direction::Write => f.write_str("write"),
        }
    }
}

/// Resolves `path` to the name its file is known by, so that spellings
/// through `..`, `.`, relative segments, or symlinked directories compare
/// equal.
///
/// An existing file is canonicalized whole. A file that does not exist yet
/// is named by its canonical parent directory plus its file name.
pub(crate) fn file_identity(path: &Path) -> PathBuf {
    if let Ok(full) = path.canonicalize() {
        return full;
    }
    let parent = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    match (parent.canonicalize(), path.file_name()) {
        (Ok(dir), Some(name)) => dir.join(name),
        _ => std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf()),
    }
}

/// The file region an operation touches, kept while it is in flight so that
/// later operations on overlapping bytes wait for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Footprint {
    pub(crate) direction: Direction,
    /// Resolved by [`file_identity`].
    pub(crate) file: PathBuf,
    pub(crate) range: Range<u64>,
}

impl Footprint {
    /// Two operations must run in submission order if they touch a common
    /// byte of the same file and at least one of them writes.
    pub(crate) fn conflicts_with(&self, other: &Footprint) -> bool {
        if self.direction == Direction::Read && other.direction == Direction::Read {
            return false;
        }
        self.file == other.file
            && self.range.start < other.range.end
            && other.range.start < self.range.end
    }
}

/// One pending transfer.
///
/// The descriptor holds a lease on its buffer from submission until it is
/// completed, so the buffer cannot be handed to a second operation or
/// released while the transfer might still touch it.
#[derive(Debug)]
pub struct OperationDescriptor {
    pub(crate) id: OpId,
    pub(crate) path: PathBuf,
    pub(crate) footprint: Footprint,
    pub(crate) offset: u64,
    pub(crate) length: usize,
    pub(crate) lease: BufferLease,
    pub(crate) submitted_at: Instant,
}

impl OperationDescriptor {
    pub(crate) fn new(
        id: OpId,
        direction: Direction,
        path: PathBuf,
        offset: u64,
        length: usize,
        lease: BufferLease,
    ) -> Self {
        let end = offset.saturating_add(length as u64);
        Self {
            id,
            footprint: Footprint {
                direction,
                file: file_identity(&path),
                range: offset..end,
            },
            path,
            offset,
            length,
            lease,
            submitted_at: Instant::now(),
        }
    }

    /// Returns the operation identifier.
    pub fn id(&self) -> OpId {
        self.id
    }

    /// Returns the transfer direction.
    pub fn direction(&self) -> Direction {
        self.footprint.direction
    }

    /// Returns the target file as submitted.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the starting byte offset in the file.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Returns the number of bytes to transfer.
    pub fn length(&self) -> usize {
        self.length
    }

    /// Returns when the operation was submitted.
    pub fn submitted_at(&self) -> Instant {
        self.submitted_at
    }
}

/// Record of a successful transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub op: OpId,
    pub direction: Direction,
    pub path: PathBuf,
    pub offset: u64,
    /// Bytes moved; always the requested length on success.
    pub bytes: usize,
    /// True if any part of the transfer bypassed the page cache.
    pub direct: bool,
    /// Time from submission to completion.
    pub elapsed: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn fp(direction: Direction, path: &str, range: Range<u64>) -> Footprint {
        Footprint {
            direction,
            file: PathBuf::from(path),
            range,
        }
    }

    #[test_case(Direction::Write, Direction::Write, 0..4096, 4095..8192, true; "write write overlap")]
    #[test_case(Direction::Write, Direction::Read, 0..4096, 0..10, true; "write read overlap")]
    #[test_case(Direction::Read, Direction::Write, 100..200, 150..151, true; "read write overlap")]
    #[test_case(Direction::Read, Direction::Read, 0..4096, 0..4096, false; "reads never conflict")]
    #[test_case(Direction::Write, Direction::Write, 0..4096, 4096..8192, false; "adjacent ranges")]
    #[test_case(Direction::Write, Direction::Write, 0..0, 0..4096, false; "empty range")]
    fn footprint_conflicts(a: Direction, b: Direction, ra: Range<u64>, rb: Range<u64>, expect: bool) {
        let x = fp(a, "/tmp/f", ra);
        let y = fp(b, "/tmp/f", rb);
        assert_eq!(x.conflicts_with(&y), expect);
        assert_eq!(y.conflicts_with(&x), expect);
    }

    #[test]
    fn different_files_never_conflict() {
        let x = fp(Direction::Write, "/tmp/a", 0..4096);
        let y = fp(Direction::Write, "/tmp/b", 0..4096);
        assert!(!x.conflicts_with(&y));
    }

    #[test]
    fn dot_dot_spelling_names_the_same_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        let direct = dir.path().join("f.bin");
        let detour = dir.path().join("sub").join("..").join("f.bin");

        // Not created yet.
        assert_eq!(file_identity(&direct), file_identity(&detour));

        std::fs::write(&direct, b"x").unwrap();
        assert_eq!(file_identity(&direct), file_identity(&detour));
        assert_ne!(file_identity(&direct), file_identity(&dir.path().join("g.bin")));
    }

    #[cfg(unix)]
    #[test]
    fn symlinked_directory_names_the_same_file() {
        let dir = tempfile::tempdir().unwrap();
        let real = dir.path().join("real");
        std::fs::create_dir(&real).unwrap();
        std::os::unix::fs::symlink(&real, dir.path().join("link")).unwrap();

        let a = fp(Direction::Write, "", 0..4096);
        let x = Footprint {
            file: file_identity(&real.join("f.bin")),
            ..a.clone()
        };
        let y = Footprint {
            file: file_identity(&dir.path().join("link").join("f.bin")),
            ..a
        };
        assert!(x.conflicts_with(&y));
    }

    #[test]
    fn op_id_display() {
        assert_eq!(OpId::new(42).to_string(), "op-42");
        assert_eq!(Direction::Write.to_string(), "write");
    }
}
