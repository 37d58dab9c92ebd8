use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::Mutex;

use crate::error::{Result, SluiceError};

/// Ranged read access to one file being uploaded.
///
/// The single seam shared by the hash workers and the chunk uploader, so
/// both stream the same bytes over the same chunk boundaries. Ranges are
/// immutable once a chunk plan exists; implementations only need
/// interior mutability for the read cursor.
pub trait ChunkSource: Send + Sync {
    /// Total length in bytes.
    fn len(&self) -> u64;

    /// Read exactly the bytes in `[start, end)`.
    fn read_range(&self, start: u64, end: u64) -> Result<Vec<u8>>;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// [`ChunkSource`] over a file on disk.
pub struct FsSource {
    file: Mutex<File>,
    len: u64,
}

impl FsSource {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(SluiceError::Io)?;
        let len = file.metadata().map_err(SluiceError::Io)?.len();
        Ok(Self {
            file: Mutex::new(file),
            len,
        })
    }
}

impl ChunkSource for FsSource {
    fn len(&self) -> u64 {
        self.len
    }

    fn read_range(&self, start: u64, end: u64) -> Result<Vec<u8>> {
        debug_assert!(start <= end, "invalid range");
        let mut file = match self.file.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        file.seek(SeekFrom::Start(start)).map_err(SluiceError::Io)?;
        let len = (end - start) as usize;
        let mut buf = vec![0u8; len];
        file.read_exact(&mut buf).map_err(SluiceError::Io)?;
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_fixture(content: &[u8]) -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fixture.bin");
        let mut f = File::create(&path).unwrap();
        f.write_all(content).unwrap();
        (dir, path)
    }

    #[test]
    fn reads_ranges_in_any_order() {
        let data: Vec<u8> = (0..=255u8).collect();
        let (_dir, path) = write_fixture(&data);
        let source = FsSource::open(&path).unwrap();

        assert_eq!(source.len(), 256);
        assert_eq!(source.read_range(10, 20).unwrap(), &data[10..20]);
        assert_eq!(source.read_range(0, 5).unwrap(), &data[0..5]);
        assert_eq!(source.read_range(250, 256).unwrap(), &data[250..256]);
    }

    #[test]
    fn empty_range_reads_nothing() {
        let (_dir, path) = write_fixture(b"abc");
        let source = FsSource::open(&path).unwrap();
        assert_eq!(source.read_range(1, 1).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn past_eof_range_fails() {
        let (_dir, path) = write_fixture(b"abc");
        let source = FsSource::open(&path).unwrap();
        assert!(source.read_range(0, 100).is_err());
    }

    #[test]
    fn empty_file() {
        let (_dir, path) = write_fixture(b"");
        let source = FsSource::open(&path).unwrap();
        assert!(source.is_empty());
        assert_eq!(source.read_range(0, 0).unwrap(), Vec::<u8>::new());
    }
}
