//! Random access over inputs that cannot seek.
//!
//! Standard input and inline `data:` payloads are drained into a temporary
//! file up front. The file keeps [`TEMP_FILE_EXT`] until the first transfer
//! commits an edited result, at which point it is renamed to
//! [`GEN_FILE_EXT`]. An uncommitted file is removed on drop.

use std::fs::{self, File};
use std::io::{ErrorKind, IsTerminal, Read};
use std::path::Path;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use log::{debug, warn};
use uuid::Uuid;

use super::local::FileSource;
use super::protocol::Protocol;
use super::{IoSource, SeekOrigin};
use crate::error::{IoError, Result};

/// Suffix of staged files nothing has been committed to.
pub const TEMP_FILE_EXT: &str = ".sourceio_temp";
/// Suffix of staged files after the first commit.
pub const GEN_FILE_EXT: &str = ".sourceio";

const DATA_URI_MARKER: &str = "base64,";

pub struct StagingSource {
    file: FileSource,
    staged_path: String,
    is_temp: bool,
}

impl StagingSource {
    /// Stage `path` (`-` or a `data:` URI) in the current directory.
    pub fn new(path: &str) -> Result<Self> {
        Self::new_in(".", path)
    }

    pub fn new_in(dir: impl AsRef<Path>, path: &str) -> Result<Self> {
        match Protocol::detect(path) {
            Protocol::Stdin => {
                let stdin = std::io::stdin();
                if stdin.is_terminal() {
                    return Err(IoError::read_failed("-", "standard input is a terminal"));
                }
                Self::from_reader(dir, stdin.lock())
            }
            Protocol::DataUri => {
                let data = decode_data_uri(path)?;
                Self::from_reader(dir, data.as_slice())
            }
            _ => Err(IoError::unsupported("staging", path)),
        }
    }

    /// Drain `reader` into a fresh temporary file under `dir`.
    pub fn from_reader(dir: impl AsRef<Path>, mut reader: impl Read) -> Result<Self> {
        let name = format!("{}{TEMP_FILE_EXT}", Uuid::new_v4().simple());
        let staged_path = dir.as_ref().join(name).to_string_lossy().into_owned();

        let mut out = File::create(&staged_path).map_err(|source| IoError::OpenFailed {
            path: staged_path.clone(),
            mode: "wb".to_string(),
            source,
        })?;
        let copied = std::io::copy(&mut reader, &mut out);
        drop(out);
        let copied = match copied {
            Ok(copied) => copied,
            Err(source) => {
                remove_staged(&staged_path);
                return Err(IoError::WriteFailed {
                    path: staged_path,
                    source,
                });
            }
        };
        debug!("{staged_path}: staged {copied} bytes");

        Ok(Self {
            file: FileSource::new(&staged_path),
            staged_path,
            is_temp: true,
        })
    }

    pub fn staged_path(&self) -> &str {
        &self.staged_path
    }

    pub fn is_committed(&self) -> bool {
        !self.is_temp
    }

    fn commit(&mut self) -> Result<()> {
        let committed = committed_path(&self.staged_path);
        self.file.close()?;
        fs::rename(&self.staged_path, &committed).map_err(|err| {
            IoError::transfer_failed(&committed, format!("rename from {}: {err}", self.staged_path))
        })?;
        self.file.set_path(&committed)?;
        debug!("{}: committed as {committed}", self.staged_path);
        self.staged_path = committed;
        self.is_temp = false;
        Ok(())
    }
}

impl IoSource for StagingSource {
    fn open(&mut self) -> Result<()> {
        self.file.open()
    }

    fn close(&mut self) -> Result<()> {
        self.file.close()
    }

    fn is_open(&self) -> bool {
        self.file.is_open()
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.file.read(buf)
    }

    fn getb(&mut self) -> Result<Option<u8>> {
        self.file.getb()
    }

    fn write(&mut self, data: &[u8]) -> Result<usize> {
        self.file.write(data)
    }

    fn putb(&mut self, byte: u8) -> Result<()> {
        self.file.putb(byte)
    }

    fn write_from(&mut self, src: &mut dyn IoSource) -> Result<u64> {
        self.file.write_from(src)
    }

    fn seek(&mut self, offset: i64, origin: SeekOrigin) -> Result<()> {
        self.file.seek(offset, origin)
    }

    fn tell(&self) -> u64 {
        self.file.tell()
    }

    fn size(&self) -> Result<u64> {
        self.file.size()
    }

    fn path(&self) -> &str {
        self.file.path()
    }

    fn at_end(&self) -> bool {
        self.file.at_end()
    }

    fn has_error(&self) -> bool {
        self.file.has_error()
    }

    fn mmap(&mut self, writable: bool) -> Result<&mut [u8]> {
        self.file.mmap(writable)
    }

    fn unmap(&mut self) -> Result<()> {
        self.file.unmap()
    }

    fn transfer(&mut self, source: &mut dyn IoSource) -> Result<()> {
        if self.is_temp {
            let was_open = self.file.is_open();
            let committed = self.commit();
            if was_open {
                self.file.open()?;
            }
            committed?;
        }
        self.file.transfer(source)
    }

    fn as_file_mut(&mut self) -> Option<&mut FileSource> {
        Some(&mut self.file)
    }
}

impl Drop for StagingSource {
    fn drop(&mut self) {
        if self.is_temp {
            if let Err(err) = self.file.close() {
                warn!("{}: close failed: {err}", self.staged_path);
            }
            remove_staged(&self.staged_path);
        }
    }
}

fn remove_staged(path: &str) {
    match fs::remove_file(path) {
        Ok(()) => debug!("{path}: removed"),
        // already moved away by a transfer
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => warn!("{path}: unable to remove the staged file: {err}"),
    }
}

fn committed_path(staged: &str) -> String {
    match staged.strip_suffix(TEMP_FILE_EXT) {
        Some(base) => format!("{base}{GEN_FILE_EXT}"),
        None => format!("{staged}{GEN_FILE_EXT}"),
    }
}

fn decode_data_uri(uri: &str) -> Result<Vec<u8>> {
    let start = uri
        .find(DATA_URI_MARKER)
        .ok_or_else(|| IoError::read_failed("data:", "no base64 data"))?;
    let data = BASE64
        .decode(&uri[start + DATA_URI_MARKER.len()..])
        .map_err(|e| IoError::read_failed("data:", format!("unable to decode base64: {e}")))?;
    if data.is_empty() {
        return Err(IoError::read_failed("data:", "empty base64 payload"));
    }
    Ok(data)
}
