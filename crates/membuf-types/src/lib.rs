#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Default block capacity in bytes.
pub const BLOCK_SIZE: usize = 4 * 1024 * 1024;

/// Default maximum bytes pulled from the source per worker step.
pub const READ_CHUNK: usize = 16 * 1024;

/// Default forward-seek distance still served by waiting for the
/// producer instead of rewinding the source.
pub const SHORT_SEEK_WINDOW: u64 = 64 * 1024;

/// 0-based index of a cache block (`floor(position / block_size)`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockIndex(pub u64);

impl BlockIndex {
    /// Index usable as a `Vec` slot, or `None` if it does not fit `usize`.
    #[must_use]
    pub fn slot(self) -> Option<usize> {
        usize::try_from(self.0).ok()
    }
}

impl fmt::Display for BlockIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GeometryError {
    #[error("block size must be > 0")]
    ZeroBlockSize,
    #[error("stream size must be > 0")]
    ZeroStreamSize,
}

/// Block layout of a stream of known size.
///
/// Every block has `block_size` capacity except the last, which holds the
/// residual `((stream_size - 1) % block_size) + 1` bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockGeometry {
    block_size: usize,
    stream_size: u64,
}

impl BlockGeometry {
    pub fn new(block_size: usize, stream_size: u64) -> Result<Self, GeometryError> {
        if block_size == 0 {
            return Err(GeometryError::ZeroBlockSize);
        }
        if stream_size == 0 {
            return Err(GeometryError::ZeroStreamSize);
        }
        Ok(Self {
            block_size,
            stream_size,
        })
    }

    #[must_use]
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    #[must_use]
    pub fn stream_size(&self) -> u64 {
        self.stream_size
    }

    fn block_size_u64(&self) -> u64 {
        u64::try_from(self.block_size).unwrap_or(u64::MAX)
    }

    /// Split a stream position into `(block index, offset within block)`.
    #[must_use]
    pub fn locate(&self, pos: u64) -> (BlockIndex, usize) {
        let bs = self.block_size_u64();
        let index = BlockIndex(pos / bs);
        let offset = usize::try_from(pos % bs).unwrap_or(usize::MAX);
        (index, offset)
    }

    /// First stream position covered by `index`.
    #[must_use]
    pub fn block_base(&self, index: BlockIndex) -> u64 {
        index.0.saturating_mul(self.block_size_u64())
    }

    /// Index of the block holding the final byte.
    #[must_use]
    pub fn last_index(&self) -> BlockIndex {
        BlockIndex((self.stream_size - 1) / self.block_size_u64())
    }

    /// Number of blocks needed to cover the stream.
    #[must_use]
    pub fn block_count(&self) -> u64 {
        self.last_index().0 + 1
    }

    /// Capacity of the block at `index`: `block_size` for all but the last.
    #[must_use]
    pub fn block_capacity(&self, index: BlockIndex) -> usize {
        if index == self.last_index() {
            let residual = (self.stream_size - 1) % self.block_size_u64();
            usize::try_from(residual).unwrap_or(self.block_size - 1) + 1
        } else {
            self.block_size
        }
    }
}
