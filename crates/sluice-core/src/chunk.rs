/// One contiguous byte range of a file, the unit of upload.
///
/// Chunks are created once at splitting time; only `uploaded` and
/// `progress` mutate afterwards, always from the task that owns the file.
#[derive(Debug, Clone)]
pub struct Chunk {
    /// Zero-based chunk index.
    pub index: usize,
    /// Start byte offset (inclusive).
    pub start: u64,
    /// End byte offset (exclusive).
    pub end: u64,
    /// Whether the remote store has confirmed this chunk.
    pub uploaded: bool,
    /// Transfer progress for this chunk, 0-100.
    pub progress: u8,
}

impl Chunk {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// Split a file into fixed-size chunks.
///
/// Returns `ceil(file_size / chunk_size)` chunks with contiguous,
/// non-overlapping ranges whose union is exactly `[0, file_size)`. The
/// last chunk may be shorter than `chunk_size`. An empty file yields a
/// single empty chunk so that every file has at least one upload unit.
pub fn split_chunks(file_size: u64, chunk_size: u64) -> Vec<Chunk> {
    assert!(chunk_size > 0, "chunk_size must be non-zero");

    if file_size == 0 {
        return vec![Chunk {
            index: 0,
            start: 0,
            end: 0,
            uploaded: false,
            progress: 0,
        }];
    }

    let count = file_size.div_ceil(chunk_size);
    (0..count)
        .map(|i| {
            let start = i * chunk_size;
            let end = ((i + 1) * chunk_size).min(file_size);
            Chunk {
                index: i as usize,
                start,
                end,
                uploaded: false,
                progress: 0,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_covers(chunks: &[Chunk], file_size: u64) {
        let mut expected_start = 0;
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.index, i);
            assert_eq!(chunk.start, expected_start, "chunks must be contiguous");
            assert!(chunk.end >= chunk.start);
            expected_start = chunk.end;
        }
        assert_eq!(chunks.last().map(|c| c.end), Some(file_size));
    }

    #[test]
    fn exact_multiple() {
        let chunks = split_chunks(8 * 1024, 1024);
        assert_eq!(chunks.len(), 8);
        assert_covers(&chunks, 8 * 1024);
        assert!(chunks.iter().all(|c| c.len() == 1024));
    }

    #[test]
    fn short_last_chunk() {
        let chunks = split_chunks(10, 4);
        assert_eq!(chunks.len(), 3);
        assert_covers(&chunks, 10);
        assert_eq!(chunks[2].len(), 2);
    }

    #[test]
    fn single_chunk_when_smaller_than_chunk_size() {
        let chunks = split_chunks(100, 4096);
        assert_eq!(chunks.len(), 1);
        assert_covers(&chunks, 100);
    }

    #[test]
    fn empty_file_yields_one_empty_chunk() {
        let chunks = split_chunks(0, 1024);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].start, 0);
        assert_eq!(chunks[0].end, 0);
        assert!(chunks[0].is_empty());
    }

    #[test]
    fn count_matches_ceiling_division() {
        for (size, chunk_size) in [(1u64, 1u64), (1, 2), (7, 3), (4096, 1000), (1 << 24, 1 << 20)]
        {
            let chunks = split_chunks(size, chunk_size);
            assert_eq!(chunks.len() as u64, size.div_ceil(chunk_size));
            assert_covers(&chunks, size);
        }
    }

    #[test]
    fn union_length_equals_file_size() {
        let chunks = split_chunks(10_000_001, 65_536);
        let total: u64 = chunks.iter().map(|c| c.len()).sum();
        assert_eq!(total, 10_000_001);
    }

    #[test]
    #[should_panic(expected = "chunk_size must be non-zero")]
    fn zero_chunk_size_panics() {
        split_chunks(10, 0);
    }
}
