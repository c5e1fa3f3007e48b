//! Upstream source abstraction.
//!
//! The cache consumes any byte stream exposing blocking reads, absolute
//! seeks, and a known total size. Capabilities are queried once at open and
//! cached; the filter never re-probes the source.

use membuf_error::Result;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

/// Blocking, byte-addressable upstream stream.
///
/// `read` follows `std::io::Read` semantics: `Ok(0)` means end of stream.
/// The cache treats a zero-byte read before the reported size as a fatal
/// source error, so implementations must not return transient short zeros.
pub trait SourceStream: Send {
    /// Read up to `buf.len()` bytes at the current position.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Seek to an absolute position.
    fn seek(&mut self, pos: u64) -> Result<()>;

    /// Current position. Authoritative after a seek, successful or not.
    fn tell(&self) -> u64;

    /// Total stream length in bytes; 0 means unknown.
    fn size(&self) -> u64;

    /// Whether `seek` is usable at all.
    fn can_seek(&self) -> bool;

    /// Whether seeking is cheap (local media rather than network).
    fn can_fast_seek(&self) -> bool {
        false
    }

    /// Marker for filter-chain detection: true when this stream is itself
    /// a prebuffer cache, so a second layer can refuse to stack.
    fn is_prebuffered(&self) -> bool {
        false
    }
}

/// Read-only file-backed source tracking its own cursor.
#[derive(Debug)]
pub struct FileSource {
    file: File,
    pos: u64,
    len: u64,
}

impl FileSource {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        let len = file.metadata()?.len();
        Ok(Self { file, pos: 0, len })
    }
}

impl SourceStream for FileSource {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let n = self.file.read(buf)?;
        self.pos += n as u64;
        Ok(n)
    }

    fn seek(&mut self, pos: u64) -> Result<()> {
        self.pos = self.file.seek(SeekFrom::Start(pos))?;
        Ok(())
    }

    fn tell(&self) -> u64 {
        self.pos
    }

    fn size(&self) -> u64 {
        self.len
    }

    fn can_seek(&self) -> bool {
        true
    }

    fn can_fast_seek(&self) -> bool {
        true
    }
}
