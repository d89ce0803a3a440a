//! Growable byte storage with an explicit allocation policy.
//!
//! The first allocation is rounded up to whole 32 KiB blocks. Each later
//! growth doubles the allocation, but never by more than 4 MiB per step,
//! and again rounds up to a whole number of steps. Writing `k` bytes in
//! small pieces therefore costs `O(log k)` reallocations.

use crate::error::{IoError, Result};

/// Granularity of the first allocation.
pub const INITIAL_BLOCK: usize = 32 * 1024;

/// Upper bound for a single growth step.
pub const MAX_GROWTH_STEP: usize = 4 * 1024 * 1024;

#[derive(Debug, Default)]
pub struct ByteBuffer {
    data: Vec<u8>,
    /// Allocation granted by the growth policy, `>= data.len()`.
    capacity: usize,
    reallocations: usize,
}

impl ByteBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap existing bytes without copying. No growth has happened yet, so
    /// the next `reserve` beyond `len` performs the initial block allocation.
    pub fn from_vec(data: Vec<u8>) -> Self {
        let capacity = data.len();
        Self {
            data,
            capacity,
            reallocations: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of times the policy had to acquire a larger allocation.
    pub fn reallocations(&self) -> usize {
        self.reallocations
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }

    /// Make room for `need` bytes in total. Growing the logical length is
    /// left to the caller.
    pub fn reserve(&mut self, need: usize) -> Result<()> {
        if need <= self.capacity && self.reallocations > 0 {
            return Ok(());
        }

        let want = if self.reallocations == 0 {
            (INITIAL_BLOCK * (1 + need / INITIAL_BLOCK)).max(self.data.len())
        } else {
            let step = (2 * self.capacity).min(MAX_GROWTH_STEP);
            step * (1 + need / step)
        };

        self.data
            .try_reserve_exact(want - self.data.len())
            .map_err(|source| IoError::AllocationFailed {
                requested: want,
                source,
            })?;
        self.capacity = want;
        self.reallocations += 1;
        Ok(())
    }

    /// Copy `bytes` to `offset`, growing the buffer (zero-filling any gap)
    /// as needed.
    pub fn write_at(&mut self, offset: usize, bytes: &[u8]) -> Result<()> {
        let end = offset + bytes.len();
        self.reserve(end)?;
        if end > self.data.len() {
            self.data.resize(end, 0);
        }
        self.data[offset..end].copy_from_slice(bytes);
        Ok(())
    }

    /// Shrink the logical length. Never reallocates.
    pub fn truncate(&mut self, len: usize) {
        self.data.truncate(len);
    }

    /// Take the storage out, leaving an empty buffer behind.
    pub fn take(&mut self) -> ByteBuffer {
        std::mem::take(self)
    }
}
