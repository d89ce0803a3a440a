//! Block partition of a remote resource.
//!
//! The logical range `[0, size)` is cut into equal blocks (the last one may
//! be short). Each block is fetched at most once per session. Blocks the
//! owner declared irrelevant are kept as placeholders that only remember
//! their length and read back as zeros.

use super::{IoSource, SeekOrigin};
use crate::error::{IoError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Block {
    Unfetched,
    /// Known length, content treated as all zero, never fetched.
    Placeholder(usize),
    Materialized(Vec<u8>),
}

impl Block {
    pub fn is_unfetched(&self) -> bool {
        matches!(self, Block::Unfetched)
    }

    pub fn is_placeholder(&self) -> bool {
        matches!(self, Block::Placeholder(_))
    }

    pub fn is_materialized(&self) -> bool {
        matches!(self, Block::Materialized(_))
    }

    pub fn len(&self) -> usize {
        match self {
            Block::Unfetched => 0,
            Block::Placeholder(len) => *len,
            Block::Materialized(data) => data.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Span of a replacement that differs from the cached content.
///
/// `from..to` is in the coordinates of the cached resource, `len` is the
/// number of replacement bytes starting at `from` that must be pushed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiffRange {
    pub from: u64,
    pub to: u64,
    pub len: u64,
}

impl DiffRange {
    pub fn is_empty(&self) -> bool {
        self.from == self.to && self.len == 0
    }
}

#[derive(Debug)]
pub struct BlockCache {
    block_size: usize,
    size: u64,
    blocks: Vec<Block>,
}

impl BlockCache {
    /// A partition of `size` bytes with every block unfetched.
    pub fn new(size: u64, block_size: usize) -> Self {
        assert!(block_size > 0, "block size must be positive");
        let count = size.div_ceil(block_size as u64) as usize;
        Self {
            block_size,
            size,
            blocks: vec![Block::Unfetched; count],
        }
    }

    /// A partition with every block materialized from `data`.
    pub fn from_bytes(data: &[u8], block_size: usize) -> Self {
        assert!(block_size > 0, "block size must be positive");
        Self {
            block_size,
            size: data.len() as u64,
            blocks: data
                .chunks(block_size)
                .map(|chunk| Block::Materialized(chunk.to_vec()))
                .collect(),
        }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    /// Length of block `index` within `[0, size)`.
    pub fn extent(&self, index: usize) -> usize {
        let start = index as u64 * self.block_size as u64;
        (self.size.saturating_sub(start)).min(self.block_size as u64) as usize
    }

    /// Blocks covering `count > 0` bytes starting at `offset`.
    pub fn block_span(&self, offset: u64, count: u64) -> (usize, usize) {
        let bs = self.block_size as u64;
        let low = offset / bs;
        let high = (offset + count.max(1) - 1) / bs;
        (low as usize, high as usize)
    }

    /// Make sure blocks `low..=high` are no longer unfetched.
    ///
    /// Resolved blocks at both ends are skipped, the rest is requested with
    /// a single call to `fetch`. A reply that does not cover every requested
    /// block is rejected and leaves the cache untouched. Returns the number
    /// of bytes fetched.
    pub fn populate<F>(&mut self, mut low: usize, mut high: usize, fetch: F) -> Result<usize>
    where
        F: FnOnce(usize, usize) -> Result<Vec<u8>>,
    {
        if self.blocks.is_empty() {
            return Ok(0);
        }
        high = high.min(self.blocks.len() - 1);
        while !self.blocks[low].is_unfetched() && low < high {
            low += 1;
        }
        while !self.blocks[high].is_unfetched() && high > low {
            high -= 1;
        }
        if !self.blocks[high].is_unfetched() {
            return Ok(0);
        }

        let data = fetch(low, high)?;
        // a server ignoring the range sends the whole body
        let first = if data.len() as u64 == self.size { 0 } else { low };
        let expected = self.span_len(first, high);
        if (data.len() as u64) < expected {
            return Err(IoError::IncompleteData(format!(
                "reply of {} bytes for blocks {low}..={high}, {expected} expected",
                data.len()
            )));
        }

        for (index, chunk) in (first..).zip(data.chunks(self.block_size)) {
            if index >= self.blocks.len() || chunk.len() != self.extent(index) {
                break;
            }
            if self.blocks[index].is_unfetched() {
                self.blocks[index] = Block::Materialized(chunk.to_vec());
            }
        }
        Ok(data.len())
    }

    /// Bytes covered by blocks `low..=high`.
    fn span_len(&self, low: usize, high: usize) -> u64 {
        let bs = self.block_size as u64;
        let start = low as u64 * bs;
        let end = ((high as u64 + 1) * bs).min(self.size);
        end.saturating_sub(start)
    }

    /// Turn every unfetched block into a placeholder of its own length.
    pub fn mark_placeholders(&mut self) -> usize {
        let mut marked = 0;
        for index in 0..self.blocks.len() {
            if self.blocks[index].is_unfetched() {
                self.blocks[index] = Block::Placeholder(self.extent(index));
                marked += 1;
            }
        }
        marked
    }

    /// Copy bytes starting at `offset` into `buf`. Placeholder blocks read
    /// as zeros; reaching an unfetched block is an error. Returns the number
    /// of bytes copied.
    pub fn copy_out(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let available = self.size.saturating_sub(offset).min(buf.len() as u64) as usize;
        let bs = self.block_size as u64;
        let mut copied = 0;
        while copied < available {
            let position = offset + copied as u64;
            let index = (position / bs) as usize;
            let start = (position % bs) as usize;
            let take = (self.extent(index) - start).min(available - copied);
            let dest = &mut buf[copied..copied + take];
            match &self.blocks[index] {
                Block::Materialized(data) => dest.copy_from_slice(&data[start..start + take]),
                Block::Placeholder(_) => dest.fill(0),
                Block::Unfetched => {
                    return Err(IoError::IncompleteData(format!(
                        "block {index} was never fetched"
                    )));
                }
            }
            copied += take;
        }
        Ok(copied)
    }

    /// The whole content as one buffer, zeros where nothing is materialized.
    pub fn flatten(&self) -> Vec<u8> {
        let mut flat = Vec::with_capacity(self.size as usize);
        for (index, block) in self.blocks.iter().enumerate() {
            match block {
                Block::Materialized(data) => flat.extend_from_slice(data),
                Block::Placeholder(_) | Block::Unfetched => {
                    flat.resize(flat.len() + self.extent(index), 0)
                }
            }
        }
        flat
    }

    /// Overwrite cached bytes at `offset` with `data`. Bytes beyond `size`
    /// are ignored. An unfetched block only becomes materialized when `data`
    /// covers all of it; otherwise it stays unfetched and is read back from
    /// the resource on demand.
    pub fn apply(&mut self, offset: u64, data: &[u8]) {
        let end = (offset + data.len() as u64).min(self.size);
        let bs = self.block_size as u64;
        let mut position = offset;
        while position < end {
            let index = (position / bs) as usize;
            let start = (position % bs) as usize;
            let extent = self.extent(index);
            let take = (extent - start).min((end - position) as usize);
            let from = (position - offset) as usize;
            let chunk = &data[from..from + take];

            match &mut self.blocks[index] {
                Block::Materialized(bytes) => {
                    bytes.resize(extent, 0);
                    bytes[start..start + take].copy_from_slice(chunk);
                }
                Block::Placeholder(_) => {
                    let mut bytes = vec![0u8; extent];
                    bytes[start..start + take].copy_from_slice(chunk);
                    self.blocks[index] = Block::Materialized(bytes);
                }
                Block::Unfetched if take == extent => {
                    self.blocks[index] = Block::Materialized(chunk.to_vec());
                }
                Block::Unfetched => {}
            }
            position += take as u64;
        }
    }

    /// Find the span of `replacement` that differs from the cached content.
    ///
    /// Matches bytes from the head, then from the tail, block by block.
    /// Placeholder blocks match zeros only, unfetched blocks match nothing.
    pub fn diff_range(&self, replacement: &mut dyn IoSource) -> Result<DiffRange> {
        let replacement_size = replacement.size()?;
        let common = self.size.min(replacement_size);
        let mut buf = vec![0u8; self.block_size];

        replacement.seek(0, SeekOrigin::Begin)?;
        let mut left = 0u64;
        for (index, block) in self.blocks.iter().enumerate() {
            let extent = self.extent(index);
            let read = replacement.read(&mut buf[..extent])?;
            let matched = match block {
                Block::Materialized(data) => buf[..read]
                    .iter()
                    .zip(data)
                    .take_while(|(a, b)| a == b)
                    .count(),
                Block::Placeholder(_) => buf[..read].iter().take_while(|b| **b == 0).count(),
                Block::Unfetched => 0,
            };
            left += matched as u64;
            if matched < extent {
                break;
            }
        }

        let mut right = 0u64;
        let limit = common - left;
        for (index, block) in self.blocks.iter().enumerate().rev() {
            if right >= limit {
                break;
            }
            let extent = self.extent(index);
            let back = right + extent as u64;
            if back > replacement_size {
                break;
            }
            replacement.seek((replacement_size - back) as i64, SeekOrigin::Begin)?;
            let read = replacement.read(&mut buf[..extent])?;
            let matched = match block {
                Block::Materialized(data) => buf[..read]
                    .iter()
                    .rev()
                    .zip(data.iter().rev())
                    .take_while(|(a, b)| a == b)
                    .count(),
                Block::Placeholder(_) => buf[..read].iter().rev().take_while(|b| **b == 0).count(),
                Block::Unfetched => 0,
            };
            right += matched as u64;
            if matched < extent {
                break;
            }
        }
        let right = right.min(limit);

        Ok(DiffRange {
            from: left,
            to: self.size - right,
            len: replacement_size - left - right,
        })
    }
}
