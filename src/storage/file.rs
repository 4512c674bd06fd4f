use crate::metainfo::Metainfo;
use std::ops::Range;
use std::path::PathBuf;

/// A file of the torrent, placed at `offset` within the concatenated
/// content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub path: PathBuf,
    pub length: u64,
    pub offset: u64,
}

/// One contiguous run of a byte range that falls inside a single file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileSegment {
    pub file_index: usize,
    pub file_offset: u64,
    pub length: u64,
}

impl FileEntry {
    pub fn new(path: PathBuf, length: u64, offset: u64) -> Self {
        Self {
            path,
            length,
            offset,
        }
    }

    /// Lays out the files of a torrent in content order.
    pub fn from_metainfo(metainfo: &Metainfo) -> Vec<Self> {
        metainfo
            .info
            .files
            .iter()
            .map(|f| FileEntry::new(f.path.clone(), f.length, f.offset))
            .collect()
    }

    pub fn byte_range(&self) -> Range<u64> {
        self.offset..self.offset + self.length
    }
}

/// Maps `len` bytes starting at absolute `offset` onto the files that hold
/// them, in order.
///
/// Zero-length files never produce a segment. If the range runs past the
/// last file the returned segments cover less than `len` bytes; callers
/// compare the total against what they asked for.
///
/// # Examples
///
/// ```
/// use swarmbit::storage::{map_range, FileEntry};
/// use std::path::PathBuf;
///
/// let files = vec![
///     FileEntry::new(PathBuf::from("a"), 10, 0),
///     FileEntry::new(PathBuf::from("b"), 10, 10),
/// ];
/// let segments = map_range(&files, 8, 4);
/// assert_eq!(segments.len(), 2);
/// assert_eq!((segments[0].file_index, segments[0].file_offset, segments[0].length), (0, 8, 2));
/// assert_eq!((segments[1].file_index, segments[1].file_offset, segments[1].length), (1, 0, 2));
/// ```
pub fn map_range(files: &[FileEntry], offset: u64, len: u64) -> Vec<FileSegment> {
    let mut segments = Vec::new();
    let mut remaining = len;
    let mut current = offset;

    // Files are sorted by offset, so skip straight to the first candidate.
    let first = files.partition_point(|f| f.offset + f.length <= current);

    for (file_index, file) in files.iter().enumerate().skip(first) {
        if remaining == 0 {
            break;
        }

        let range = file.byte_range();
        if !range.contains(&current) {
            continue;
        }

        let take = remaining.min(range.end - current);
        segments.push(FileSegment {
            file_index,
            file_offset: current - file.offset,
            length: take,
        });

        current += take;
        remaining -= take;
    }

    segments
}
