use super::buffer::ByteBuffer;
use super::{IoSource, SeekOrigin};
use crate::error::{IoError, Result};

const MEMORY_PATH: &str = "MemIo";

/// Source backed by an owned [`ByteBuffer`].
///
/// Always open. Never raises the error flag; the end of data is reported
/// through short reads and [`IoSource::at_end`] only.
#[derive(Debug, Default)]
pub struct MemorySource {
    buffer: ByteBuffer,
    position: usize,
    eof: bool,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_vec(data: Vec<u8>) -> Self {
        Self {
            buffer: ByteBuffer::from_vec(data),
            position: 0,
            eof: false,
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        self.buffer.as_slice()
    }

    pub fn capacity(&self) -> usize {
        self.buffer.capacity()
    }

    pub fn reallocations(&self) -> usize {
        self.buffer.reallocations()
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buffer.into_vec()
    }

    /// Move the storage of `donor` into this source without copying.
    fn adopt(&mut self, donor: &mut MemorySource) {
        self.buffer = donor.buffer.take();
        self.position = 0;
        self.eof = false;
        donor.position = 0;
        donor.eof = false;
    }
}

impl IoSource for MemorySource {
    fn open(&mut self) -> Result<()> {
        self.position = 0;
        self.eof = false;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }

    fn is_open(&self) -> bool {
        true
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let avail = self.buffer.len().saturating_sub(self.position);
        let allow = buf.len().min(avail);
        buf[..allow].copy_from_slice(&self.buffer.as_slice()[self.position..self.position + allow]);
        self.position += allow;
        if buf.len() > avail {
            self.eof = true;
        }
        Ok(allow)
    }

    fn getb(&mut self) -> Result<Option<u8>> {
        match self.buffer.as_slice().get(self.position) {
            Some(&byte) => {
                self.position += 1;
                Ok(Some(byte))
            }
            None => {
                self.eof = true;
                Ok(None)
            }
        }
    }

    fn write(&mut self, data: &[u8]) -> Result<usize> {
        self.buffer.write_at(self.position, data)?;
        self.position += data.len();
        Ok(data.len())
    }

    fn putb(&mut self, byte: u8) -> Result<()> {
        self.write(&[byte]).map(|_| ())
    }

    fn seek(&mut self, offset: i64, origin: SeekOrigin) -> Result<()> {
        let base = match origin {
            SeekOrigin::Begin => 0,
            SeekOrigin::Current => self.position as i64,
            SeekOrigin::End => self.buffer.len() as i64,
        };
        let target = base + offset;
        let failed = || IoError::SeekFailed {
            path: MEMORY_PATH.to_string(),
            offset,
            origin,
        };

        if target < 0 {
            return Err(failed());
        }
        if target > self.buffer.len() as i64 {
            self.eof = true;
            return Err(failed());
        }
        self.position = target as usize;
        self.eof = false;
        Ok(())
    }

    fn tell(&self) -> u64 {
        self.position as u64
    }

    fn size(&self) -> Result<u64> {
        Ok(self.buffer.len() as u64)
    }

    fn path(&self) -> &str {
        MEMORY_PATH
    }

    fn at_end(&self) -> bool {
        self.eof
    }

    fn has_error(&self) -> bool {
        false
    }

    fn mmap(&mut self, _writable: bool) -> Result<&mut [u8]> {
        Ok(self.buffer.as_mut_slice())
    }

    fn unmap(&mut self) -> Result<()> {
        Ok(())
    }

    fn transfer(&mut self, source: &mut dyn IoSource) -> Result<()> {
        if let Some(donor) = source.as_memory_mut() {
            self.adopt(donor);
            return Ok(());
        }

        source.open()?;
        self.buffer = ByteBuffer::new();
        self.position = 0;
        self.eof = false;
        let copied = self.write_from(source);
        source.close()?;
        copied?;
        if source.has_error() {
            return Err(IoError::transfer_failed(
                MEMORY_PATH,
                format!("error while reading {}", source.path()),
            ));
        }
        Ok(())
    }

    fn as_memory_mut(&mut self) -> Option<&mut MemorySource> {
        Some(self)
    }
}
