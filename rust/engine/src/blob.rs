//! Positional IO over candidate blobs.
//!
//! Candidates live in unlinked temporary files and are always addressed by
//! absolute offset, so shared descriptors never race on a file cursor.
//! Short reads are IO errors: the engine cannot proceed without reliable
//! storage for speculative candidates.

use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;

const COPY_CHUNK: usize = 64 * 1024;

/// Create a fresh unlinked blob.
pub(crate) fn create() -> io::Result<File> {
    tempfile::tempfile()
}

/// Length of a blob in bytes.
pub(crate) fn len(file: &File) -> io::Result<u64> {
    Ok(file.metadata()?.len())
}

/// Read exactly `count` bytes at `offset`.
pub(crate) fn read_range(src: &File, offset: u64, count: u64) -> io::Result<Vec<u8>> {
    let mut buf = vec![0u8; usize::try_from(count).map_err(io::Error::other)?];
    src.read_exact_at(&mut buf, offset)?;
    Ok(buf)
}

/// Copy `count` bytes from `src` at `src_offset` to `dst` at `dst_offset`.
pub(crate) fn copy_range(
    src: &File,
    src_offset: u64,
    dst: &File,
    dst_offset: u64,
    count: u64,
) -> io::Result<()> {
    let mut buf = vec![0u8; COPY_CHUNK.min(usize::try_from(count).unwrap_or(COPY_CHUNK))];
    let mut copied = 0u64;
    while copied < count {
        let step = usize::try_from((count - copied).min(COPY_CHUNK as u64))
            .map_err(io::Error::other)?;
        src.read_exact_at(&mut buf[..step], src_offset + copied)?;
        dst.write_all_at(&buf[..step], dst_offset + copied)?;
        copied += step as u64;
    }
    Ok(())
}

/// Write `count` copies of `byte` at `offset`.
pub(crate) fn write_fill(dst: &File, offset: u64, count: u64, byte: u8) -> io::Result<()> {
    let buf = vec![byte; COPY_CHUNK.min(usize::try_from(count).unwrap_or(COPY_CHUNK))];
    let mut written = 0u64;
    while written < count {
        let step = usize::try_from((count - written).min(COPY_CHUNK as u64))
            .map_err(io::Error::other)?;
        dst.write_all_at(&buf[..step], offset + written)?;
        written += step as u64;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copy_and_fill_round_trip() {
        let src = create().expect("create");
        src.write_all_at(b"0123456789", 0).expect("write");

        let dst = create().expect("create");
        copy_range(&src, 2, &dst, 0, 5).expect("copy");
        write_fill(&dst, 5, 3, b'x').expect("fill");

        assert_eq!(read_range(&dst, 0, 8).expect("read"), b"23456xxx");
        assert_eq!(len(&dst).expect("len"), 8);
    }

    #[test]
    fn short_read_is_an_error() {
        let src = create().expect("create");
        src.write_all_at(b"abc", 0).expect("write");
        assert!(read_range(&src, 0, 10).is_err());
    }
}
