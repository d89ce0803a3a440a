use std::io::ErrorKind;

use log::{debug, trace, warn};

use super::blocks::BlockCache;
use super::protocol::{FetchRange, ProtocolBackend};
use super::{IoSource, SeekOrigin};
use crate::error::{IoError, Result};

/// Random access over a remote resource that is only reachable through
/// coarse range requests.
///
/// Blocks are fetched just in time and kept for the lifetime of the source.
/// Writing a replacement pushes back only the span that differs from what
/// is cached.
pub struct RemoteSource<P: ProtocolBackend> {
    path: String,
    backend: P,
    block_size: usize,
    cache: Option<BlockCache>,
    position: u64,
    eof: bool,
    /// Contiguous copy of all blocks, built on `mmap`.
    flat: Option<Vec<u8>>,
    total_requested: u64,
    fetch_count: usize,
}

impl<P: ProtocolBackend> RemoteSource<P> {
    pub fn new(path: impl Into<String>, backend: P, block_size: usize) -> Self {
        assert!(block_size > 0, "block size must be positive");
        Self {
            path: path.into(),
            backend,
            block_size,
            cache: None,
            position: 0,
            eof: false,
            flat: None,
            total_requested: 0,
            fetch_count: 0,
        }
    }

    pub fn backend(&self) -> &P {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut P {
        &mut self.backend
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// The block partition, once the source has been opened.
    pub fn cache(&self) -> Option<&BlockCache> {
        self.cache.as_ref()
    }

    /// Bytes requested by callers so far.
    pub fn total_requested(&self) -> u64 {
        self.total_requested
    }

    /// Range requests issued to the backend so far.
    pub fn fetch_count(&self) -> usize {
        self.fetch_count
    }

    fn cache_ref(&self) -> &BlockCache {
        self.cache
            .as_ref()
            .unwrap_or_else(|| panic!("{}: operation on a closed remote source", self.path))
    }

    fn fetch_whole(&mut self) -> Result<Vec<u8>> {
        let data = self.backend.fetch_range(FetchRange::Whole, self.block_size)?;
        self.fetch_count += 1;
        if data.is_empty() {
            return Err(IoError::RemoteDataEmpty {
                url: self.path.clone(),
            });
        }
        Ok(data)
    }

    fn populate(&mut self, low: usize, high: usize) -> Result<()> {
        let Some(cache) = self.cache.as_mut() else {
            panic!("{}: operation on a closed remote source", self.path);
        };
        let backend = &mut self.backend;
        let path = &self.path;
        let block_size = self.block_size;
        let mut fetched = false;

        let populated = cache.populate(low, high, |low, high| {
            trace!("{path}: fetching blocks {low}..={high}");
            let data = backend.fetch_range(FetchRange::Blocks { low, high }, block_size)?;
            fetched = true;
            if data.is_empty() {
                return Err(IoError::RemoteDataEmpty { url: path.clone() });
            }
            Ok(data)
        });
        if fetched {
            self.fetch_count += 1;
        }
        if let Err(err) = populated {
            warn!("{}: {err}", self.path);
            return Err(err);
        }
        Ok(())
    }
}

impl<P: ProtocolBackend> IoSource for RemoteSource<P> {
    fn open(&mut self) -> Result<()> {
        self.close()?;
        if self.cache.is_some() {
            return Ok(());
        }

        let cache = match self.backend.length()? {
            None => {
                // without a length nothing can be fetched lazily
                let data = self.fetch_whole()?;
                BlockCache::from_bytes(&data, self.block_size)
            }
            Some(0) => {
                return Err(IoError::OpenFailed {
                    path: self.path.clone(),
                    mode: "rb".to_string(),
                    source: std::io::Error::new(ErrorKind::InvalidData, "the remote file is empty"),
                });
            }
            Some(length) => BlockCache::new(length, self.block_size),
        };
        debug!(
            "{}: opened, {} bytes in {} blocks of {}",
            self.path,
            cache.size(),
            cache.block_count(),
            self.block_size
        );
        self.cache = Some(cache);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if self.cache.is_some() {
            self.position = 0;
            self.eof = false;
        }
        self.flat = None;
        trace!("{}: closed, {} bytes requested", self.path, self.total_requested);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.cache.is_some()
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let size = self.cache_ref().size();
        if self.eof || buf.is_empty() {
            return Ok(0);
        }
        self.total_requested += buf.len() as u64;

        let allow = (size - self.position).min(buf.len() as u64);
        if allow == 0 {
            self.eof = true;
            return Ok(0);
        }
        let (low, high) = self.cache_ref().block_span(self.position, allow);
        self.populate(low, high)?;

        let copied = self
            .cache_ref()
            .copy_out(self.position, &mut buf[..allow as usize])?;
        self.position += copied as u64;
        self.eof = self.position == size;
        Ok(copied)
    }

    fn getb(&mut self) -> Result<Option<u8>> {
        let cache = self.cache_ref();
        if self.position == cache.size() {
            self.eof = true;
            return Ok(None);
        }
        let block = (self.position / self.block_size as u64) as usize;
        self.populate(block, block)?;

        let mut byte = [0u8; 1];
        self.cache_ref().copy_out(self.position, &mut byte)?;
        self.position += 1;
        Ok(Some(byte[0]))
    }

    fn write(&mut self, _data: &[u8]) -> Result<usize> {
        Err(IoError::unsupported("partial write", &self.path))
    }

    fn putb(&mut self, _byte: u8) -> Result<()> {
        Err(IoError::unsupported("partial write", &self.path))
    }

    /// Push the part of `src` that differs from the cached content back to
    /// the remote resource. Returns the size of `src`.
    fn write_from(&mut self, src: &mut dyn IoSource) -> Result<u64> {
        if !src.is_open() {
            return Ok(0);
        }
        let cache = self.cache_ref();
        let cached_size = cache.size();
        let diff = cache.diff_range(src)?;
        let replacement_size = src.size()?;

        if !diff.is_empty() {
            let mut data = vec![0u8; diff.len as usize];
            src.seek(diff.from as i64, SeekOrigin::Begin)?;
            src.read_or_fail(&mut data)?;
            debug!(
                "{}: pushing {} bytes over {}..{}",
                self.path, diff.len, diff.from, diff.to
            );
            self.backend.push_range(&data, diff.from, diff.to)?;
            self.flat = None;

            if replacement_size == cached_size {
                if let Some(cache) = self.cache.as_mut() {
                    cache.apply(diff.from, &data);
                }
            } else {
                // the cached partition no longer matches the resource
                debug!("{}: size changed, reopen to continue", self.path);
                self.cache = None;
                self.position = 0;
                self.eof = false;
            }
        }
        Ok(replacement_size)
    }

    /// Out-of-range targets are clamped to the end and raise `at_end`
    /// instead of failing, since callers routinely probe past the end.
    fn seek(&mut self, offset: i64, origin: SeekOrigin) -> Result<()> {
        let size = self.cache_ref().size() as i64;
        let target = match origin {
            SeekOrigin::Begin => offset,
            SeekOrigin::Current => self.position as i64 + offset,
            SeekOrigin::End => size + offset,
        };
        if (0..=size).contains(&target) {
            self.position = target as u64;
            self.eof = false;
        } else {
            self.position = size as u64;
            self.eof = true;
        }
        Ok(())
    }

    fn tell(&self) -> u64 {
        self.position
    }

    fn size(&self) -> Result<u64> {
        Ok(self.cache.as_ref().map_or(0, BlockCache::size))
    }

    fn path(&self) -> &str {
        &self.path
    }

    fn at_end(&self) -> bool {
        self.eof
    }

    fn has_error(&self) -> bool {
        false
    }

    /// Concatenate all blocks into one buffer. Does not fetch anything.
    fn mmap(&mut self, _writable: bool) -> Result<&mut [u8]> {
        let Some(cache) = self.cache.as_ref() else {
            panic!("{}: operation on a closed remote source", self.path);
        };
        Ok(self.flat.get_or_insert_with(|| cache.flatten()).as_mut_slice())
    }

    fn unmap(&mut self) -> Result<()> {
        self.flat = None;
        Ok(())
    }

    fn transfer(&mut self, source: &mut dyn IoSource) -> Result<()> {
        source.open()?;
        let pushed = self.write_from(source);
        source.close()?;
        pushed.map(|_| ())
    }

    fn populate_fake_data(&mut self) {
        let Some(cache) = self.cache.as_mut() else {
            panic!("{}: operation on a closed remote source", self.path);
        };
        let marked = cache.mark_placeholders();
        trace!("{}: {marked} blocks marked as placeholders", self.path);
    }
}
