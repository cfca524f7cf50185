//! Low-level stream plumbing: seekable stream traits, the in-memory
//! [`MemoryStream`], and the [`FileManager`] capability through which all
//! file-system access flows.
//!
//! The engine never touches `std::fs` directly outside this module. Hosts
//! with exotic storage (archives, network mounts, test fixtures) implement
//! [`FileManager`] and hand it to the context; everything above this layer
//! only sees `Read + Seek` / `Write + Seek` objects.

use std::cell::RefCell;
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::rc::Rc;

use crate::error::Result;

/// A readable, seekable byte source.
pub trait InputStream: Read + Seek {}
impl<T: Read + Seek> InputStream for T {}

/// A writable, seekable byte sink.
pub trait OutputStream: Write + Seek {}
impl<T: Write + Seek> OutputStream for T {}

// --- IN-MEMORY STREAMS ---

/// A growable in-memory stream over a shared buffer.
///
/// The buffer is reference-counted so the owning [`BinaryFile`] can extract
/// the written bytes after a writer is done with the stream (encoded-file
/// commits, encoded-scope splicing).
///
/// Seeking past the end is allowed; a subsequent write zero-fills the gap,
/// which is what lets serializable types write fields out of order through
/// `do_at`.
///
/// [`BinaryFile`]: crate::file::BinaryFile
#[derive(Debug, Clone)]
pub struct MemoryStream {
    buf: Rc<RefCell<Vec<u8>>>,
    pos: u64,
}

impl MemoryStream {
    /// Wraps a shared buffer.
    pub fn new(buf: Rc<RefCell<Vec<u8>>>) -> Self {
        Self { buf, pos: 0 }
    }

    /// Creates a stream over a fresh buffer seeded with `bytes`.
    pub fn from_vec(bytes: Vec<u8>) -> Self {
        Self::new(Rc::new(RefCell::new(bytes)))
    }

    /// Returns the shared buffer handle.
    pub fn buffer(&self) -> Rc<RefCell<Vec<u8>>> {
        self.buf.clone()
    }
}

impl Read for MemoryStream {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        let buf = self.buf.borrow();
        let len = buf.len() as u64;
        if self.pos >= len {
            return Ok(0);
        }
        let start = self.pos as usize;
        let n = out.len().min((len - self.pos) as usize);
        out[..n].copy_from_slice(&buf[start..start + n]);
        drop(buf);
        self.pos += n as u64;
        Ok(n)
    }
}

impl Write for MemoryStream {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let mut buf = self.buf.borrow_mut();
        let start = self.pos as usize;
        let end = start + data.len();
        if buf.len() < start {
            buf.resize(start, 0);
        }
        if buf.len() < end {
            buf.resize(end, 0);
        }
        buf[start..end].copy_from_slice(data);
        drop(buf);
        self.pos = end as u64;
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Seek for MemoryStream {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let len = self.buf.borrow().len() as i64;
        let target = match pos {
            SeekFrom::Start(p) => p as i64,
            SeekFrom::End(d) => len + d,
            SeekFrom::Current(d) => self.pos as i64 + d,
        };
        if target < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek before start of stream",
            ));
        }
        self.pos = target as u64;
        Ok(self.pos)
    }
}

// --- MEMORY-MAPPED STREAM ---

/// A read-only stream over a memory-mapped file.
///
/// Opening is O(1) regardless of file size; the OS pages bytes in on demand.
/// The map is shared, so cloned streams cost nothing.
#[cfg(feature = "mmap")]
#[derive(Debug, Clone)]
pub struct MmapStream {
    map: std::sync::Arc<memmap2::Mmap>,
    pos: u64,
}

#[cfg(feature = "mmap")]
impl MmapStream {
    /// Maps the file at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        // Mapping assumes the file is not modified externally while open.
        #[allow(unsafe_code)]
        let map = unsafe { memmap2::Mmap::map(&file)? };
        Ok(Self {
            map: std::sync::Arc::new(map),
            pos: 0,
        })
    }
}

#[cfg(feature = "mmap")]
impl Read for MmapStream {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        let len = self.map.len() as u64;
        if self.pos >= len {
            return Ok(0);
        }
        let start = self.pos as usize;
        let n = out.len().min((len - self.pos) as usize);
        out[..n].copy_from_slice(&self.map[start..start + n]);
        self.pos += n as u64;
        Ok(n)
    }
}

#[cfg(feature = "mmap")]
impl Seek for MmapStream {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let len = self.map.len() as i64;
        let target = match pos {
            SeekFrom::Start(p) => p as i64,
            SeekFrom::End(d) => len + d,
            SeekFrom::Current(d) => self.pos as i64 + d,
        };
        if target < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek before start of stream",
            ));
        }
        self.pos = target as u64;
        Ok(self.pos)
    }
}

// --- FILE MANAGER ---

/// File-system access capability.
///
/// The context owns one of these; files ask it for streams when their lazy
/// reader or writer is first needed. `fill_cache_for_read` is a prefetch
/// hint and may be a no-op.
pub trait FileManager {
    /// Returns true if a file exists at `path`.
    fn file_exists(&self, path: &Path) -> bool;

    /// Returns true if a directory exists at `path`.
    fn directory_exists(&self, path: &Path) -> bool;

    /// Returns the byte length of the file at `path` without opening a
    /// full stream.
    fn file_length(&self, path: &Path) -> Result<u64>;

    /// Opens a read stream over `path`.
    fn read_stream(&self, path: &Path) -> Result<Box<dyn InputStream>>;

    /// Opens a write stream over `path`. With `recreate` the file is
    /// truncated first; otherwise existing bytes outside the written ranges
    /// survive (in-place patching).
    fn write_stream(&self, path: &Path, recreate: bool) -> Result<Box<dyn OutputStream>>;

    /// Copies `from` to `to`, replacing any existing file (backups).
    fn copy_file(&self, from: &Path, to: &Path) -> Result<()>;

    /// Hints that up to `length` upcoming bytes will be read.
    fn fill_cache_for_read(&self, _length: u64) {}
}

/// The default [`FileManager`] over the local file system.
///
/// Read streams are memory-mapped when the `mmap` feature is enabled
/// (default) and the file is non-empty; buffered file reads otherwise.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalFileManager;

impl FileManager for LocalFileManager {
    fn file_exists(&self, path: &Path) -> bool {
        path.is_file()
    }

    fn directory_exists(&self, path: &Path) -> bool {
        path.is_dir()
    }

    fn file_length(&self, path: &Path) -> Result<u64> {
        Ok(std::fs::metadata(path)?.len())
    }

    fn read_stream(&self, path: &Path) -> Result<Box<dyn InputStream>> {
        #[cfg(feature = "mmap")]
        {
            // mmap of an empty file fails on some platforms; fall through to
            // the buffered path for those.
            if self.file_length(path)? > 0 {
                return Ok(Box::new(MmapStream::open(path)?));
            }
        }
        Ok(Box::new(BufReader::new(File::open(path)?)))
    }

    fn write_stream(&self, path: &Path, recreate: bool) -> Result<Box<dyn OutputStream>> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(recreate)
            .open(path)?;
        Ok(Box::new(BufWriter::new(file)))
    }

    fn copy_file(&self, from: &Path, to: &Path) -> Result<()> {
        std::fs::copy(from, to)?;
        Ok(())
    }
}

/// Sibling path used for pre-write backups: `rom.gba` -> `rom.gba.bak`.
pub(crate) fn backup_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".bak");
    PathBuf::from(name)
}
