mod blocks;
mod buffer;
mod http;
mod local;
mod memory;
mod protocol;
mod remote;
mod staging;

pub use blocks::{Block, BlockCache, DiffRange};
pub use buffer::ByteBuffer;
pub use http::HttpBackend;
pub use local::{FileSource, OpenMode, read_whole_file, write_whole_file};
pub use memory::MemorySource;
pub use protocol::{FetchRange, Protocol, ProtocolBackend};
pub use remote::RemoteSource;
pub use staging::{GEN_FILE_EXT, StagingSource, TEMP_FILE_EXT};

use crate::config::RemoteConfig;
use crate::error::{IoError, Result};

/// Chunk size used when streaming one source into another.
pub const TRANSFER_CHUNK: usize = 4096;

/// Reference point for [`IoSource::seek`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekOrigin {
    Begin,
    Current,
    End,
}

/// Byte-addressable access to a file, a memory buffer or a remote resource.
///
/// Every backend keeps a cursor in `[0, size]` and raises [`at_end`] when a
/// read or seek tries to move past the end. Using a closed source is a
/// programming error and panics.
///
/// [`at_end`]: IoSource::at_end
pub trait IoSource {
    /// (Re)open the source in its default mode, resetting the cursor.
    fn open(&mut self) -> Result<()>;

    fn close(&mut self) -> Result<()>;

    fn is_open(&self) -> bool;

    /// Read up to `buf.len()` bytes at the cursor. A short count means the
    /// end of the data was reached.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Read one byte, `None` at the end of the data.
    fn getb(&mut self) -> Result<Option<u8>>;

    /// Write `data` at the cursor and return the number of bytes written.
    fn write(&mut self, data: &[u8]) -> Result<usize>;

    fn putb(&mut self, byte: u8) -> Result<()>;

    /// Stream the remainder of `src` into this source in
    /// [`TRANSFER_CHUNK`] pieces. Stops early when a chunk cannot be fully
    /// absorbed, rewinding `src` by the shortfall.
    fn write_from(&mut self, src: &mut dyn IoSource) -> Result<u64> {
        if !src.is_open() {
            return Ok(0);
        }

        let mut buf = [0u8; TRANSFER_CHUNK];
        let mut total = 0u64;
        loop {
            let read = src.read(&mut buf)?;
            if read == 0 {
                break;
            }
            let written = self.write(&buf[..read])?;
            total += written as u64;
            if written != read {
                src.seek(written as i64 - read as i64, SeekOrigin::Current)?;
                break;
            }
        }
        Ok(total)
    }

    fn seek(&mut self, offset: i64, origin: SeekOrigin) -> Result<()>;

    fn tell(&self) -> u64;

    fn size(&self) -> Result<u64>;

    fn path(&self) -> &str;

    fn at_end(&self) -> bool;

    fn has_error(&self) -> bool;

    /// A contiguous view of the whole content, valid until the next
    /// `unmap`, `close` or mutable use of the source.
    fn mmap(&mut self, writable: bool) -> Result<&mut [u8]>;

    fn unmap(&mut self) -> Result<()>;

    /// Replace the whole content of this source with the content of
    /// `source`. The donor is left closed or empty.
    fn transfer(&mut self, source: &mut dyn IoSource) -> Result<()>;

    /// Declare all content that has not been fetched yet as irrelevant.
    /// Only meaningful for remote sources.
    fn populate_fake_data(&mut self) {}

    fn as_file_mut(&mut self) -> Option<&mut FileSource> {
        None
    }

    fn as_memory_mut(&mut self) -> Option<&mut MemorySource> {
        None
    }

    /// Read `count` bytes into a fresh buffer.
    ///
    /// Fails when `count` exceeds the size of the source or nothing could
    /// be read. The result is shorter than `count` only at the end of data.
    fn read_vec(&mut self, count: usize) -> Result<Vec<u8>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let size = self.size()?;
        if count as u64 > size {
            return Err(IoError::read_failed(
                self.path(),
                format!("requested {count} bytes from a source of {size} bytes"),
            ));
        }
        let mut buf = vec![0u8; count];
        let read = self.read(&mut buf)?;
        if read == 0 {
            return Err(IoError::read_failed(self.path(), "no data could be read"));
        }
        buf.truncate(read);
        Ok(buf)
    }

    /// Fill `buf` completely or fail.
    fn read_or_fail(&mut self, buf: &mut [u8]) -> Result<()> {
        let read = self.read(buf)?;
        if read != buf.len() || self.has_error() {
            return Err(IoError::read_failed(
                self.path(),
                format!("expected {} bytes, got {read}", buf.len()),
            ));
        }
        Ok(())
    }
}

/// Build the backend matching `path`. Local files are returned closed,
/// remote sources are not yet connected, and staged inputs (standard input
/// or a `data:` URI) are drained into a temporary file immediately.
pub fn create_source(path: &str, config: &RemoteConfig) -> Result<Box<dyn IoSource>> {
    let protocol = Protocol::detect(path);
    match protocol {
        Protocol::File => Ok(Box::new(FileSource::new(path))),
        Protocol::Http | Protocol::Https => {
            let backend = HttpBackend::new(path, config.clone())?;
            Ok(Box::new(RemoteSource::new(
                path,
                backend,
                config.block_size_for(protocol),
            )))
        }
        Protocol::Stdin | Protocol::DataUri => Ok(Box::new(StagingSource::new(path)?)),
        Protocol::Ftp | Protocol::Sftp => Err(IoError::unsupported("remote access", path)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Destination that refuses to take more than `limit` bytes in total.
    struct Limited {
        inner: MemorySource,
        limit: usize,
    }

    impl IoSource for Limited {
        fn open(&mut self) -> Result<()> {
            self.inner.open()
        }
        fn close(&mut self) -> Result<()> {
            self.inner.close()
        }
        fn is_open(&self) -> bool {
            true
        }
        fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
            self.inner.read(buf)
        }
        fn getb(&mut self) -> Result<Option<u8>> {
            self.inner.getb()
        }
        fn write(&mut self, data: &[u8]) -> Result<usize> {
            let room = self.limit.saturating_sub(self.inner.tell() as usize);
            let take = room.min(data.len());
            self.inner.write(&data[..take])
        }
        fn putb(&mut self, byte: u8) -> Result<()> {
            self.inner.putb(byte)
        }
        fn seek(&mut self, offset: i64, origin: SeekOrigin) -> Result<()> {
            self.inner.seek(offset, origin)
        }
        fn tell(&self) -> u64 {
            self.inner.tell()
        }
        fn size(&self) -> Result<u64> {
            self.inner.size()
        }
        fn path(&self) -> &str {
            "limited"
        }
        fn at_end(&self) -> bool {
            self.inner.at_end()
        }
        fn has_error(&self) -> bool {
            false
        }
        fn mmap(&mut self, writable: bool) -> Result<&mut [u8]> {
            self.inner.mmap(writable)
        }
        fn unmap(&mut self) -> Result<()> {
            Ok(())
        }
        fn transfer(&mut self, source: &mut dyn IoSource) -> Result<()> {
            self.inner.transfer(source)
        }
    }

    #[test]
    fn write_from_rewinds_source_on_shortfall() {
        let data: Vec<u8> = (0..10_000u32).map(|i| i as u8).collect();
        let mut src = MemorySource::from_vec(data.clone());
        let mut dst = Limited {
            inner: MemorySource::new(),
            limit: 5000,
        };

        let copied = dst.write_from(&mut src).unwrap();
        assert_eq!(copied, 5000);
        // second chunk was cut short, source is rewound to the first unwritten byte
        assert_eq!(src.tell(), 5000);
        assert_eq!(dst.inner.as_slice(), &data[..5000]);
    }

    #[test]
    fn write_from_closed_source_copies_nothing() {
        let mut src = FileSource::new("does-not-matter");
        let mut dst = MemorySource::new();
        assert_eq!(dst.write_from(&mut src).unwrap(), 0);
    }

    #[test]
    fn read_vec_bounds() {
        let mut src = MemorySource::from_vec(vec![1, 2, 3, 4]);
        assert!(matches!(src.read_vec(5), Err(IoError::ReadFailed { .. })));
        assert_eq!(src.read_vec(3).unwrap(), vec![1, 2, 3]);
        assert_eq!(src.read_vec(3).unwrap(), vec![4]);
        assert!(src.at_end());
        assert!(matches!(src.read_vec(1), Err(IoError::ReadFailed { .. })));
    }

    #[test]
    fn read_or_fail_rejects_short_reads() {
        let mut src = MemorySource::from_vec(vec![1, 2, 3]);
        let mut buf = [0u8; 2];
        src.read_or_fail(&mut buf).unwrap();
        assert_eq!(buf, [1, 2]);
        assert!(src.read_or_fail(&mut buf).is_err());
    }

    #[test]
    fn create_source_dispatches_on_protocol() {
        let config = RemoteConfig::new();
        let source = create_source("photo.jpg", &config).unwrap();
        assert_eq!(source.path(), "photo.jpg");
        assert!(!source.is_open());

        let source = create_source("http://example.com/photo.jpg", &config).unwrap();
        assert!(!source.is_open());

        assert!(matches!(
            create_source("ftp://example.com/photo.jpg", &config),
            Err(IoError::UnsupportedOperation { .. })
        ));
    }
}
