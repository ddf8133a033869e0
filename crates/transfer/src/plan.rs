//! Deterministic partitioning of a file into byte ranges.

use std::fmt;
use std::io::Read;
use std::path::Path;

use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};

use crate::TransferError;
use crate::digest::{SLICE_SIZE, md5_hex};

/// An inclusive byte range `[start, end]` of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    /// Number of bytes covered.
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// A range always covers at least one byte.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Metadata key, `"{start}-{end}"`.
    pub fn key(&self) -> String {
        format!("{}-{}", self.start, self.end)
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

/// Splits `[0, total_size)` into consecutive ranges of `block_size` bytes,
/// the last one truncated. Returns an empty plan if either argument is 0.
pub fn plan_download(total_size: u64, block_size: u64) -> Vec<ByteRange> {
    if total_size == 0 || block_size == 0 {
        return Vec::new();
    }
    let mut ranges = Vec::with_capacity(total_size.div_ceil(block_size) as usize);
    let mut start = 0u64;
    while start < total_size {
        let end = start.saturating_add(block_size - 1).min(total_size - 1);
        ranges.push(ByteRange::new(start, end));
        start = end + 1;
    }
    ranges
}

/// Digests needed by the upload handshake, computed in a single pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadDigests {
    /// File size in bytes.
    pub size: u64,
    /// md5 of each fixed-size block, in order.
    pub block_digests: Vec<String>,
    /// md5 of the whole file (raw, not obfuscated).
    pub content_md5: String,
    /// md5 of the first 256 KiB.
    pub slice_md5: String,
}

/// Streams `path` once and hashes every `block_size` block, the whole file
/// and its head slice.
pub fn plan_upload(path: &Path, block_size: u64) -> Result<UploadDigests, TransferError> {
    if block_size == 0 {
        return Err(TransferError::Config("block size must be positive".into()));
    }
    let mut file = std::fs::File::open(path)?;
    let mut whole = Md5::new();
    let mut slice = Md5::new();
    let mut sliced = 0usize;
    let mut size = 0u64;
    let mut block_digests = Vec::new();
    let mut buf = vec![0u8; block_size as usize];

    loop {
        let n = read_full(&mut file, &mut buf)?;
        if n == 0 {
            break;
        }
        let block = &buf[..n];
        whole.update(block);
        if sliced < SLICE_SIZE {
            let take = (SLICE_SIZE - sliced).min(n);
            slice.update(&block[..take]);
            sliced += take;
        }
        block_digests.push(md5_hex(block));
        size += n as u64;
        if n < buf.len() {
            break;
        }
    }

    Ok(UploadDigests {
        size,
        block_digests,
        content_md5: hex::encode(whole.finalize()),
        slice_md5: hex::encode(slice.finalize()),
    })
}

/// Fills `buf` unless EOF comes first; returns the bytes read.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MIB, UPLOAD_BLOCK_SIZE};

    #[test]
    fn ten_mib_in_four_mib_blocks() {
        let ranges = plan_download(10 * MIB, 4 * MIB);
        assert_eq!(
            ranges,
            vec![
                ByteRange::new(0, 4_194_303),
                ByteRange::new(4_194_304, 8_388_607),
                ByteRange::new(8_388_608, 10_485_759),
            ]
        );
        assert_eq!(ranges[2].key(), "8388608-10485759");
    }

    #[test]
    fn ranges_cover_exactly_without_overlap() {
        for total in [1u64, 2, 7, 99, 100, 101, 4096, 10_000] {
            for block in [1u64, 3, 64, 100, 4096, 20_000] {
                let ranges = plan_download(total, block);
                assert_eq!(ranges.first().map(|r| r.start), Some(0));
                assert_eq!(ranges.last().map(|r| r.end), Some(total - 1));
                for pair in ranges.windows(2) {
                    assert_eq!(pair[0].end + 1, pair[1].start);
                }
                let covered: u64 = ranges.iter().map(ByteRange::len).sum();
                assert_eq!(covered, total);
                assert!(ranges.iter().all(|r| r.len() <= block));
            }
        }
    }

    #[test]
    fn zero_inputs_plan_nothing() {
        assert!(plan_download(0, 4).is_empty());
        assert!(plan_download(4, 0).is_empty());
    }

    #[test]
    fn planning_is_deterministic() {
        assert_eq!(plan_download(12_345, 1000), plan_download(12_345, 1000));
    }

    #[test]
    fn five_mib_upload_has_two_blocks() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("five.bin");
        let data: Vec<u8> = (0..5 * MIB).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, &data).unwrap();

        let digests = plan_upload(&path, UPLOAD_BLOCK_SIZE).unwrap();
        let split = UPLOAD_BLOCK_SIZE as usize;
        assert_eq!(digests.size, 5 * MIB);
        assert_eq!(
            digests.block_digests,
            vec![md5_hex(&data[..split]), md5_hex(&data[split..])]
        );
        assert_eq!(digests.content_md5, md5_hex(&data));
        assert_eq!(digests.slice_md5, md5_hex(&data[..SLICE_SIZE]));
    }

    #[test]
    fn small_file_slice_is_whole_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("small.txt");
        std::fs::write(&path, b"tiny").unwrap();

        let digests = plan_upload(&path, UPLOAD_BLOCK_SIZE).unwrap();
        assert_eq!(digests.block_digests.len(), 1);
        assert_eq!(digests.slice_md5, md5_hex(b"tiny"));
        assert_eq!(digests.content_md5, md5_hex(b"tiny"));
    }

    #[test]
    fn exact_multiple_has_no_trailing_block() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("even.bin");
        std::fs::write(&path, vec![1u8; 64]).unwrap();

        let digests = plan_upload(&path, 16).unwrap();
        assert_eq!(digests.block_digests.len(), 4);
        assert_eq!(plan_download(digests.size, 16).len(), 4);
    }
}
