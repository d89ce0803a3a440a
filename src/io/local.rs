use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::str::FromStr;

use log::{debug, warn};
use memmap2::{MmapMut, MmapOptions};

use super::{IoSource, SeekOrigin};
use crate::error::{IoError, Result};

/// Whether this target has real OS memory mapping. Elsewhere `mmap` reads the
/// file into memory and writes it back on `unmap`.
const NATIVE_MMAP: bool = cfg!(any(unix, windows));

/// How the underlying file handle was opened, in `fopen` terms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// `rb`
    Read,
    /// `r+b`
    ReadWrite,
    /// `wb`, truncates
    Write,
    /// `w+b`, truncates
    WriteRead,
    /// `ab`
    Append,
    /// `a+b`
    AppendRead,
}

impl OpenMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpenMode::Read => "rb",
            OpenMode::ReadWrite => "r+b",
            OpenMode::Write => "wb",
            OpenMode::WriteRead => "w+b",
            OpenMode::Append => "ab",
            OpenMode::AppendRead => "a+b",
        }
    }

    pub fn can_read(&self) -> bool {
        !matches!(self, OpenMode::Write | OpenMode::Append)
    }

    pub fn can_write(&self) -> bool {
        !matches!(self, OpenMode::Read)
    }

    fn truncates(&self) -> bool {
        matches!(self, OpenMode::Write | OpenMode::WriteRead)
    }

    fn options(&self) -> OpenOptions {
        let mut options = OpenOptions::new();
        match self {
            OpenMode::Read => options.read(true),
            OpenMode::ReadWrite => options.read(true).write(true),
            OpenMode::Write => options.write(true).create(true).truncate(true),
            OpenMode::WriteRead => options.read(true).write(true).create(true).truncate(true),
            OpenMode::Append => options.append(true).create(true),
            OpenMode::AppendRead => options.read(true).append(true).create(true),
        };
        options
    }
}

impl FromStr for OpenMode {
    type Err = IoError;

    fn from_str(s: &str) -> Result<Self> {
        let plus = s.contains('+');
        match (s.chars().next(), plus) {
            (Some('r'), false) => Ok(OpenMode::Read),
            (Some('r'), true) => Ok(OpenMode::ReadWrite),
            (Some('w'), false) => Ok(OpenMode::Write),
            (Some('w'), true) => Ok(OpenMode::WriteRead),
            (Some('a'), false) => Ok(OpenMode::Append),
            (Some('a'), true) => Ok(OpenMode::AppendRead),
            _ => Err(IoError::unsupported("open mode", s)),
        }
    }
}

/// Last kind of access performed on the handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AccessMode {
    Read,
    Write,
    Seek,
}

enum Mapping {
    Native(MmapMut),
    Owned(Vec<u8>),
}

struct MappedRegion {
    mapping: Mapping,
    writable: bool,
}

impl MappedRegion {
    fn as_mut_slice(&mut self) -> &mut [u8] {
        match &mut self.mapping {
            Mapping::Native(map) => &mut map[..],
            Mapping::Owned(buf) => &mut buf[..],
        }
    }
}

/// Local file source.
///
/// Tracks the last access kind so that the handle is only reopened when the
/// current open mode cannot serve the next read or write.
pub struct FileSource {
    path: String,
    file: Option<File>,
    open_mode: OpenMode,
    access: AccessMode,
    mapping: Option<MappedRegion>,
    eof: bool,
    error: bool,
}

impl FileSource {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            file: None,
            open_mode: OpenMode::Read,
            access: AccessMode::Seek,
            mapping: None,
            eof: false,
            error: false,
        }
    }

    pub fn open_mode(&self) -> OpenMode {
        self.open_mode
    }

    /// Open the file in `mode`, closing any existing handle first.
    pub fn open_with(&mut self, mode: OpenMode) -> Result<()> {
        self.close()?;
        let file = mode
            .options()
            .open(&self.path)
            .map_err(|source| IoError::OpenFailed {
                path: self.path.clone(),
                mode: mode.as_str().to_string(),
                source,
            })?;
        self.file = Some(file);
        self.open_mode = mode;
        self.access = AccessMode::Seek;
        self.eof = false;
        self.error = false;
        Ok(())
    }

    /// Point this source at another path. The current handle is closed.
    pub fn set_path(&mut self, path: impl Into<String>) -> Result<()> {
        self.close()?;
        self.path = path.into();
        Ok(())
    }

    fn handle(&self) -> &File {
        self.file
            .as_ref()
            .unwrap_or_else(|| panic!("{}: operation on a closed file source", self.path))
    }

    fn handle_mut(&mut self) -> &mut File {
        self.file
            .as_mut()
            .unwrap_or_else(|| panic!("{}: operation on a closed file source", self.path))
    }

    fn switch_mode(&mut self, target: AccessMode) -> Result<()> {
        let previous = self.access;
        if previous == target {
            return Ok(());
        }
        self.access = target;

        let reopen = match target {
            AccessMode::Read => !self.open_mode.can_read(),
            AccessMode::Write => !self.open_mode.can_write(),
            AccessMode::Seek => false,
        };

        if !reopen {
            // nothing to flush when leaving a seek
            if previous == AccessMode::Seek {
                return Ok(());
            }
            return self.handle_mut().flush().map_err(IoError::Io);
        }

        self.reopen_at_offset(OpenMode::ReadWrite)
    }

    /// Reopen the current path in `mode`, keeping the stream offset.
    fn reopen_at_offset(&mut self, mode: OpenMode) -> Result<()> {
        let offset = self.handle_mut().stream_position()?;
        self.file = None;
        debug!("{}: reopening as {} at offset {offset}", self.path, mode.as_str());
        let mut file = mode
            .options()
            .open(&self.path)
            .map_err(|source| IoError::OpenFailed {
                path: self.path.clone(),
                mode: mode.as_str().to_string(),
                source,
            })?;
        file.seek(SeekFrom::Start(offset))?;
        self.file = Some(file);
        self.open_mode = mode;
        Ok(())
    }

    /// Map the whole file. Without `native` (or for an empty file) the
    /// content is read into an owned buffer that `unmap` writes back.
    fn map_region(&mut self, writable: bool, native: bool) -> Result<&mut [u8]> {
        self.unmap()?;
        let len = self.size()? as usize;
        if writable {
            self.switch_mode(AccessMode::Write)?;
        }
        // write-only handles can be neither mapped nor read back
        if !self.open_mode.can_read() {
            self.reopen_at_offset(OpenMode::ReadWrite)?;
        }

        let mapping = if native && len > 0 {
            let file = self.handle();
            // SAFETY: the mapping is owned by this source and dropped on
            // unmap/close; callers must not resize the file while mapped.
            let map = unsafe {
                if writable {
                    MmapMut::map_mut(file)
                } else {
                    MmapOptions::new().map_copy(file)
                }
            }?;
            Mapping::Native(map)
        } else {
            self.seek(0, SeekOrigin::Begin)?;
            let mut buf = vec![0u8; len];
            self.read_or_fail(&mut buf)?;
            Mapping::Owned(buf)
        };

        let region = self.mapping.insert(MappedRegion { mapping, writable });
        Ok(region.as_mut_slice())
    }

    /// Atomically put the donor's file in place of ours and restore our
    /// original permission bits.
    fn replace_with_file(&mut self, donor: &mut FileSource) -> Result<()> {
        donor.close()?;

        // probe that the target can be written to, creating it if needed
        if let Err(err) = self.open_with(OpenMode::AppendRead) {
            if let Err(remove_err) = fs::remove_file(&donor.path) {
                warn!("{}: unable to remove {remove_err}", donor.path);
            }
            return Err(err);
        }
        self.close()?;

        let original = fs::metadata(&self.path).map(|meta| meta.permissions());

        // rename replaces an existing target atomically, except on windows
        if cfg!(windows) && Path::new(&self.path).exists() {
            fs::remove_file(&self.path)
                .map_err(|err| IoError::transfer_failed(&self.path, err.to_string()))?;
        }
        fs::rename(&donor.path, &self.path).map_err(|err| {
            IoError::transfer_failed(&self.path, format!("rename from {}: {err}", donor.path))
        })?;
        debug!("{}: replaced by {}", self.path, donor.path);

        let Ok(original) = original else {
            return Ok(());
        };
        match fs::metadata(&self.path) {
            Ok(meta) if meta.permissions() != original => {
                if let Err(err) = fs::set_permissions(&self.path, original) {
                    warn!("{}: unable to restore permissions: {err}", self.path);
                }
            }
            Ok(_) => {}
            Err(err) => warn!("{}: unable to stat: {err}", self.path),
        }
        Ok(())
    }

    fn seek_failed(&self, offset: i64, origin: SeekOrigin) -> IoError {
        IoError::SeekFailed {
            path: self.path.clone(),
            offset,
            origin,
        }
    }

    fn copy_from(&mut self, source: &mut dyn IoSource) -> Result<()> {
        self.open_with(OpenMode::WriteRead)?;
        source.open()?;
        let copied = self.write_from(source);
        source.close()?;
        let copied = copied?;
        debug!("{}: copied {copied} bytes from {}", self.path, source.path());
        Ok(())
    }
}

impl IoSource for FileSource {
    fn open(&mut self) -> Result<()> {
        self.open_with(OpenMode::Read)
    }

    fn close(&mut self) -> Result<()> {
        let unmapped = self.unmap();
        if let Some(mut file) = self.file.take() {
            file.flush()?;
        }
        unmapped
    }

    fn is_open(&self) -> bool {
        self.file.is_some()
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.switch_mode(AccessMode::Read)?;
        let mut total = 0;
        while total < buf.len() {
            match self.handle_mut().read(&mut buf[total..]) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => {
                    self.error = true;
                    return Err(IoError::read_failed(&self.path, err.to_string()));
                }
            }
        }
        if total < buf.len() {
            self.eof = true;
        }
        Ok(total)
    }

    fn getb(&mut self) -> Result<Option<u8>> {
        let mut byte = [0u8; 1];
        match self.read(&mut byte)? {
            0 => Ok(None),
            _ => Ok(Some(byte[0])),
        }
    }

    fn write(&mut self, data: &[u8]) -> Result<usize> {
        self.switch_mode(AccessMode::Write)?;
        if let Err(source) = self.handle_mut().write_all(data) {
            self.error = true;
            return Err(IoError::WriteFailed {
                path: self.path.clone(),
                source,
            });
        }
        Ok(data.len())
    }

    fn putb(&mut self, byte: u8) -> Result<()> {
        self.write(&[byte]).map(|_| ())
    }

    fn seek(&mut self, offset: i64, origin: SeekOrigin) -> Result<()> {
        self.switch_mode(AccessMode::Seek)?;
        let size = self.size()? as i64;
        let base = match origin {
            SeekOrigin::Begin => 0,
            SeekOrigin::Current => self.tell() as i64,
            SeekOrigin::End => size,
        };
        let target = base + offset;

        if target < 0 {
            return Err(self.seek_failed(offset, origin));
        }
        if target > size {
            self.eof = true;
            return Err(self.seek_failed(offset, origin));
        }
        if let Err(err) = self.handle_mut().seek(SeekFrom::Start(target as u64)) {
            warn!("{}: seek failed: {err}", self.path);
            return Err(self.seek_failed(offset, origin));
        }
        self.eof = false;
        Ok(())
    }

    fn tell(&self) -> u64 {
        let mut file = self.handle();
        match file.stream_position() {
            Ok(position) => position,
            Err(err) => {
                warn!("{}: unable to query position: {err}", self.path);
                0
            }
        }
    }

    fn size(&self) -> Result<u64> {
        if let Some(mut file) = self.file.as_ref() {
            if self.open_mode.can_write() {
                file.flush()?;
            }
            return Ok(file.metadata()?.len());
        }
        Ok(fs::metadata(&self.path)?.len())
    }

    fn path(&self) -> &str {
        &self.path
    }

    fn at_end(&self) -> bool {
        self.eof
    }

    fn has_error(&self) -> bool {
        self.error
    }

    fn mmap(&mut self, writable: bool) -> Result<&mut [u8]> {
        self.map_region(writable, NATIVE_MMAP)
    }

    fn unmap(&mut self) -> Result<()> {
        let Some(region) = self.mapping.take() else {
            return Ok(());
        };
        if region.writable {
            match region.mapping {
                Mapping::Native(map) => map.flush()?,
                Mapping::Owned(buf) => {
                    self.seek(0, SeekOrigin::Begin)?;
                    self.write(&buf)?;
                }
            }
            if self.file.is_some() {
                self.switch_mode(AccessMode::Read)?;
            }
        }
        Ok(())
    }

    fn transfer(&mut self, source: &mut dyn IoSource) -> Result<()> {
        let was_open = self.file.is_some();
        let last_mode = self.open_mode;

        match source.as_file_mut() {
            Some(donor) => self.replace_with_file(donor)?,
            None => self.copy_from(source)?,
        }

        if was_open {
            let mode = if last_mode.truncates() {
                OpenMode::ReadWrite
            } else {
                last_mode
            };
            self.open_with(mode)?;
        } else {
            self.close()?;
        }

        if self.error || source.has_error() {
            return Err(IoError::transfer_failed(
                &self.path,
                format!("error while transferring from {}", source.path()),
            ));
        }
        Ok(())
    }

    fn as_file_mut(&mut self) -> Option<&mut FileSource> {
        Some(self)
    }
}

impl Drop for FileSource {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!("{}: close failed: {err}", self.path);
        }
    }
}

/// Read a whole file into memory.
pub fn read_whole_file(path: impl AsRef<Path>) -> Result<Vec<u8>> {
    let mut file = FileSource::new(path.as_ref().to_string_lossy());
    file.open_with(OpenMode::Read)?;
    let size = file.size()? as usize;
    let mut buf = vec![0u8; size];
    file.read_or_fail(&mut buf)?;
    Ok(buf)
}

/// Write `data` to `path`, truncating any existing content.
pub fn write_whole_file(data: &[u8], path: impl AsRef<Path>) -> Result<usize> {
    let mut file = FileSource::new(path.as_ref().to_string_lossy());
    file.open_with(OpenMode::Write)?;
    file.write(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::MemorySource;
    use rstest::rstest;
    use tempfile::TempDir;

    fn scratch(dir: &TempDir, name: &str, content: &[u8]) -> String {
        let path = dir.path().join(name);
        fs::write(&path, content).unwrap();
        path.to_string_lossy().into_owned()
    }

    #[rstest]
    #[case("rb", OpenMode::Read)]
    #[case("r", OpenMode::Read)]
    #[case("r+b", OpenMode::ReadWrite)]
    #[case("rb+", OpenMode::ReadWrite)]
    #[case("wb", OpenMode::Write)]
    #[case("w+b", OpenMode::WriteRead)]
    #[case("ab", OpenMode::Append)]
    #[case("a+b", OpenMode::AppendRead)]
    fn parses_open_modes(#[case] text: &str, #[case] mode: OpenMode) {
        assert_eq!(text.parse::<OpenMode>().unwrap(), mode);
    }

    #[test]
    fn rejects_unknown_open_mode() {
        assert!("x".parse::<OpenMode>().is_err());
        assert!("".parse::<OpenMode>().is_err());
    }

    #[test]
    fn open_missing_file_fails() {
        let dir = TempDir::new().unwrap();
        let mut file = FileSource::new(dir.path().join("missing").to_string_lossy());
        assert!(matches!(file.open(), Err(IoError::OpenFailed { .. })));
        assert!(!file.is_open());
    }

    #[test]
    fn write_then_read_back() {
        let dir = TempDir::new().unwrap();
        let path = scratch(&dir, "a.bin", b"0123456789");
        let mut file = FileSource::new(&path);
        file.open_with(OpenMode::ReadWrite).unwrap();

        file.seek(4, SeekOrigin::Begin).unwrap();
        assert_eq!(file.write(b"abc").unwrap(), 3);
        file.seek(4, SeekOrigin::Begin).unwrap();
        let mut buf = [0u8; 3];
        assert_eq!(file.read(&mut buf).unwrap(), 3);
        assert_eq!(&buf, b"abc");
        assert_eq!(file.tell(), 7);
        file.close().unwrap();

        assert_eq!(fs::read(&path).unwrap(), b"0123abc789");
    }

    #[test]
    fn write_on_read_only_handle_reopens() {
        let dir = TempDir::new().unwrap();
        let path = scratch(&dir, "a.bin", b"hello world");
        let mut file = FileSource::new(&path);
        file.open().unwrap();

        let mut buf = [0u8; 6];
        file.read(&mut buf).unwrap();
        file.write(b"W").unwrap();
        assert_eq!(file.open_mode(), OpenMode::ReadWrite);
        assert_eq!(file.tell(), 7);
        file.close().unwrap();

        assert_eq!(fs::read(&path).unwrap(), b"hello World");
    }

    #[test]
    fn seek_bounds() {
        let dir = TempDir::new().unwrap();
        let path = scratch(&dir, "a.bin", &[0u8; 16]);
        let mut file = FileSource::new(&path);
        file.open().unwrap();

        assert!(matches!(
            file.seek(-17, SeekOrigin::End),
            Err(IoError::SeekFailed { .. })
        ));
        assert!(file.seek(17, SeekOrigin::Begin).is_err());
        assert!(file.at_end());
        file.seek(-6, SeekOrigin::End).unwrap();
        assert_eq!(file.tell(), 10);
        assert!(!file.at_end());
    }

    #[test]
    fn short_read_sets_at_end() {
        let dir = TempDir::new().unwrap();
        let path = scratch(&dir, "a.bin", b"abc");
        let mut file = FileSource::new(&path);
        file.open().unwrap();

        let mut buf = [0u8; 10];
        assert_eq!(file.read(&mut buf).unwrap(), 3);
        assert!(file.at_end());
        assert_eq!(file.getb().unwrap(), None);
        file.seek(1, SeekOrigin::Begin).unwrap();
        assert_eq!(file.getb().unwrap(), Some(b'b'));
    }

    #[test]
    fn read_vec_rejects_oversized_requests() {
        let dir = TempDir::new().unwrap();
        let path = scratch(&dir, "a.bin", b"abc");
        let mut file = FileSource::new(&path);
        file.open().unwrap();
        assert!(matches!(file.read_vec(4), Err(IoError::ReadFailed { .. })));
        assert_eq!(file.read_vec(2).unwrap(), b"ab");
    }

    #[test]
    fn writable_mmap_reaches_the_file() {
        let dir = TempDir::new().unwrap();
        let path = scratch(&dir, "a.bin", b"abcdef");
        let mut file = FileSource::new(&path);
        file.open_with(OpenMode::ReadWrite).unwrap();

        let view = file.mmap(true).unwrap();
        assert_eq!(view, b"abcdef");
        view[0] = b'X';
        file.unmap().unwrap();
        file.close().unwrap();

        assert_eq!(fs::read(&path).unwrap(), b"Xbcdef");
    }

    #[test]
    fn read_only_mmap_leaves_the_file_alone() {
        let dir = TempDir::new().unwrap();
        let path = scratch(&dir, "a.bin", b"abcdef");
        let mut file = FileSource::new(&path);
        file.open().unwrap();

        let view = file.mmap(false).unwrap();
        view[0] = b'X';
        file.close().unwrap();

        assert_eq!(fs::read(&path).unwrap(), b"abcdef");
    }

    #[test]
    fn mmap_of_empty_file() {
        let dir = TempDir::new().unwrap();
        let path = scratch(&dir, "empty.bin", b"");
        let mut file = FileSource::new(&path);
        file.open().unwrap();
        assert!(file.mmap(false).unwrap().is_empty());
    }

    #[rstest]
    #[case::native(true)]
    #[case::owned_buffer(false)]
    fn writable_mapping_reaches_the_file(#[case] native: bool) {
        let dir = TempDir::new().unwrap();
        let path = scratch(&dir, "mapped.bin", b"abcdefgh");
        let mut file = FileSource::new(&path);
        file.open().unwrap();

        let view = file.map_region(true, native).unwrap();
        assert_eq!(view, b"abcdefgh");
        view[2..4].copy_from_slice(b"XY");
        file.unmap().unwrap();
        file.close().unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"abXYefgh");
    }

    #[test]
    fn read_only_owned_mapping_leaves_the_file() {
        let dir = TempDir::new().unwrap();
        let path = scratch(&dir, "mapped.bin", b"abcd");
        let mut file = FileSource::new(&path);
        file.open().unwrap();

        file.map_region(false, false).unwrap()[0] = b'z';
        file.unmap().unwrap();
        file.close().unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"abcd");
    }

    #[rstest]
    #[case(OpenMode::Write)]
    #[case(OpenMode::Append)]
    fn writable_mapping_of_write_only_handle(#[case] mode: OpenMode) {
        let dir = TempDir::new().unwrap();
        let path = scratch(&dir, "mapped.bin", b"");
        let mut file = FileSource::new(&path);
        file.open_with(mode).unwrap();
        file.write(b"0123").unwrap();

        let view = file.mmap(true).unwrap();
        assert_eq!(view, b"0123");
        view[0] = b'9';
        file.unmap().unwrap();
        assert_eq!(file.open_mode(), OpenMode::ReadWrite);
        file.close().unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"9123");
    }

    #[test]
    fn transfer_from_file_renames_donor() {
        let dir = TempDir::new().unwrap();
        let target_path = scratch(&dir, "target.jpg", b"old content");
        let donor_path = scratch(&dir, "target.jpg.tmp", b"new content!");

        let mut target = FileSource::new(&target_path);
        target.open().unwrap();
        let mut donor = FileSource::new(&donor_path);
        donor.open().unwrap();

        target.transfer(&mut donor).unwrap();
        assert!(!donor.is_open());
        assert!(!Path::new(&donor_path).exists());
        // reopened in the previous mode
        assert!(target.is_open());
        assert_eq!(target.read_vec(12).unwrap(), b"new content!");
    }

    #[cfg(unix)]
    #[test]
    fn transfer_from_file_keeps_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let target_path = scratch(&dir, "target.jpg", b"old");
        let donor_path = scratch(&dir, "donor.tmp", b"new");
        fs::set_permissions(&target_path, fs::Permissions::from_mode(0o640)).unwrap();
        fs::set_permissions(&donor_path, fs::Permissions::from_mode(0o600)).unwrap();

        let mut target = FileSource::new(&target_path);
        let mut donor = FileSource::new(&donor_path);
        target.transfer(&mut donor).unwrap();

        let mode = fs::metadata(&target_path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o640);
        assert_eq!(fs::read(&target_path).unwrap(), b"new");
        assert!(!target.is_open());
    }

    #[test]
    fn transfer_from_memory_copies() {
        let dir = TempDir::new().unwrap();
        let target_path = scratch(&dir, "target.bin", b"a much longer old content");
        let mut target = FileSource::new(&target_path);
        let mut donor = MemorySource::from_vec(b"short".to_vec());

        target.transfer(&mut donor).unwrap();
        assert_eq!(fs::read(&target_path).unwrap(), b"short");
    }

    #[test]
    fn whole_file_helpers() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("whole.bin");
        assert_eq!(write_whole_file(b"twelve bytes", &path).unwrap(), 12);
        assert_eq!(read_whole_file(&path).unwrap(), b"twelve bytes");
        assert!(matches!(
            read_whole_file(dir.path().join("nope")),
            Err(IoError::OpenFailed { .. })
        ));
    }
}
