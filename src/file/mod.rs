//! The file family: identity, backing streams, pointer resolution.
//!
//! One [`BinaryFile`] struct covers the four backing kinds (linear on-disk,
//! encoded on-disk, memory-mapped, in-memory stream) behind a kind enum;
//! behavior that genuinely differs per kind — stream creation, write commit,
//! pointer resolution — branches on it, everything else is shared state.
//!
//! Files are registered with a [`Context`](crate::context::Context) and
//! handed around as `Rc<BinaryFile>`; pointers hold such a handle, never an
//! index. Readers and writers are created lazily on first use and live
//! inside the file, the serializer only borrows them.

mod readmap;
mod region;

pub use readmap::FileReadMap;
pub use region::Region;

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::io::Write;
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::context::Context;
use crate::encoder::Encoder;
use crate::endian::Endian;
use crate::error::{BinrevError, Result};
use crate::io::{FileManager, MemoryStream, backup_path};
use crate::pointer::{Pointer, PointerSize};
use crate::reader::Reader;
use crate::writer::Writer;

static NEXT_FILE_ID: AtomicU64 = AtomicU64::new(0);

/// Stable identity of a file within a process.
///
/// Pointers and cache keys compare files by this rather than by path, so a
/// removed-and-reregistered file never aliases stale cache entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileId(u64);

impl FileId {
    fn next() -> Self {
        Self(NEXT_FILE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Backing source of a file.
enum FileKind {
    /// Plain on-disk bytes.
    Physical,
    /// On-disk bytes decoded through an encoder before exposure.
    Encoded { encoder: Box<dyn Encoder> },
    /// In-memory buffer (scratch streams, encoded scopes).
    Memory { buf: Rc<RefCell<Vec<u8>>> },
}

impl FileKind {
    fn label(&self) -> &'static str {
        match self {
            Self::Physical => "physical",
            Self::Encoded { .. } => "encoded",
            Self::Memory { .. } => "memory",
        }
    }
}

/// One addressable byte range in the serialization universe.
pub struct BinaryFile {
    id: FileId,
    name: String,
    alias: Option<String>,
    kind: FileKind,
    endian: Endian,
    base_address: u64,
    is_memory_mapped: bool,
    memory_mapped_priority: i32,
    allow_local_pointers: bool,
    ignore_cache_on_read: bool,
    save_pointers_to_memory_map: bool,
    backup_on_write: bool,
    recreate_on_write: bool,
    pointer_size_override: Cell<Option<PointerSize>>,
    length: Cell<Option<u64>>,
    resolved_path: RefCell<Option<PathBuf>>,
    read_map_requested: Cell<bool>,
    read_map: RefCell<Option<FileReadMap>>,
    regions: RefCell<Vec<Region>>,
    labels: RefCell<HashMap<u64, String>>,
    override_pointers: RefCell<HashMap<u64, Pointer>>,
    allowed_invalid: RefCell<HashSet<u64>>,
    reader: RefCell<Option<Reader>>,
    writer: RefCell<Option<Writer>>,
    scratch: RefCell<Option<Rc<RefCell<Vec<u8>>>>>,
}

impl fmt::Debug for BinaryFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BinaryFile")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("kind", &self.kind.label())
            .field("base_address", &self.base_address)
            .finish_non_exhaustive()
    }
}

impl BinaryFile {
    fn base(name: String, kind: FileKind) -> Self {
        Self {
            id: FileId::next(),
            name,
            alias: None,
            kind,
            endian: Endian::Little,
            base_address: 0,
            is_memory_mapped: false,
            memory_mapped_priority: 0,
            allow_local_pointers: false,
            ignore_cache_on_read: false,
            save_pointers_to_memory_map: false,
            backup_on_write: false,
            recreate_on_write: true,
            pointer_size_override: Cell::new(None),
            length: Cell::new(None),
            resolved_path: RefCell::new(None),
            read_map_requested: Cell::new(false),
            read_map: RefCell::new(None),
            regions: RefCell::new(Vec::new()),
            labels: RefCell::new(HashMap::new()),
            override_pointers: RefCell::new(HashMap::new()),
            allowed_invalid: RefCell::new(HashSet::new()),
            reader: RefCell::new(None),
            writer: RefCell::new(None),
            scratch: RefCell::new(None),
        }
    }

    // --- CONSTRUCTORS ---

    /// A plain on-disk file at base address 0, not memory-mapped.
    /// `name` is the context-relative path and the registry key.
    pub fn linear(name: impl Into<String>) -> Self {
        Self::base(name.into(), FileKind::Physical)
    }

    /// An on-disk file whose content passes through `encoder` on open and
    /// commit. Its length is only known after the first decode.
    pub fn encoded(name: impl Into<String>, encoder: Box<dyn Encoder>) -> Self {
        Self::base(name.into(), FileKind::Encoded { encoder })
    }

    /// A memory-mapped on-disk file: a non-zero base address, participates
    /// in cross-file pointer resolution, patched in place on write.
    pub fn memory_mapped(name: impl Into<String>, base_address: u64) -> Self {
        let mut file = Self::base(name.into(), FileKind::Physical);
        file.base_address = base_address;
        file.is_memory_mapped = true;
        file.recreate_on_write = false;
        file
    }

    /// A transient in-memory file over `bytes`.
    pub fn stream(name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self::base(
            name.into(),
            FileKind::Memory {
                buf: Rc::new(RefCell::new(bytes)),
            },
        )
    }

    /// An empty in-memory file, typically a write target.
    pub fn stream_empty(name: impl Into<String>) -> Self {
        Self::stream(name, Vec::new())
    }

    // --- BUILDER KNOBS ---

    /// Sets the default endianness of readers and writers over this file.
    pub fn with_endian(mut self, endian: Endian) -> Self {
        self.endian = endian;
        self
    }

    /// Registers a secondary lookup key.
    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    /// Memory-map resolution priority; higher wins, ties by insertion order.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.memory_mapped_priority = priority;
        self
    }

    /// Forces the serialized pointer width instead of deriving it from the
    /// address range.
    pub fn with_pointer_size(self, size: PointerSize) -> Self {
        self.pointer_size_override.set(Some(size));
        self
    }

    /// Enables read-coverage tracking. The map itself is allocated on first
    /// use, once the stream length is known.
    pub fn with_read_map(self) -> Self {
        self.read_map_requested.set(true);
        self
    }

    /// Copies the on-disk file to a `.bak` sibling before the first write.
    pub fn with_backup(mut self) -> Self {
        self.backup_on_write = true;
        self
    }

    /// Bypasses the object cache when reading through this file.
    pub fn with_ignore_cache(mut self) -> Self {
        self.ignore_cache_on_read = true;
        self
    }

    /// Resolves pointers read from this file against the file itself rather
    /// than the memory map (in-memory streams only).
    pub fn with_local_pointers(mut self) -> Self {
        self.allow_local_pointers = true;
        self
    }

    /// Records every pointer successfully resolved from this file with the
    /// context, for later export.
    pub fn with_pointer_recording(mut self) -> Self {
        self.save_pointers_to_memory_map = true;
        self
    }

    /// Controls whether the first write truncates the on-disk file.
    pub fn with_recreate_on_write(mut self, recreate: bool) -> Self {
        self.recreate_on_write = recreate;
        self
    }

    // --- ACCESSORS ---

    /// Process-stable identity.
    pub fn id(&self) -> FileId {
        self.id
    }

    /// Registry key (context-relative path or synthetic stream name).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Secondary lookup key, if any.
    pub fn alias(&self) -> Option<&str> {
        self.alias.as_deref()
    }

    /// Default endianness.
    pub fn endian(&self) -> Endian {
        self.endian
    }

    /// Base address added to file offsets to form absolute offsets.
    pub fn base_address(&self) -> u64 {
        self.base_address
    }

    /// True for files participating in cross-file pointer resolution.
    pub fn is_memory_mapped(&self) -> bool {
        self.is_memory_mapped
    }

    /// Memory-map resolution priority.
    pub fn memory_mapped_priority(&self) -> i32 {
        self.memory_mapped_priority
    }

    /// True when pointers in this file resolve locally.
    pub fn allow_local_pointers(&self) -> bool {
        self.allow_local_pointers
    }

    /// True when the object cache is bypassed on read.
    pub fn ignore_cache_on_read(&self) -> bool {
        self.ignore_cache_on_read
    }

    /// True when resolved pointers are recorded with the context.
    pub fn save_pointers_to_memory_map(&self) -> bool {
        self.save_pointers_to_memory_map
    }

    /// Pointer to the first byte (`base_address`).
    pub fn start_pointer(file: &Rc<BinaryFile>) -> Pointer {
        Pointer::new(file.base_address, file.clone())
    }

    /// Byte length. For physical files this stats the file system; for
    /// encoded files it forces the first decode; for in-memory files it is
    /// the live buffer length.
    pub fn length(&self, ctx: &Context) -> Result<u64> {
        if let FileKind::Memory { buf } = &self.kind {
            return Ok(buf.borrow().len() as u64);
        }
        if let Some(len) = self.length.get() {
            return Ok(len);
        }
        match &self.kind {
            FileKind::Physical => {
                let len = ctx.file_manager().file_length(&self.resolve_path(ctx)?)?;
                self.length.set(Some(len));
                Ok(len)
            }
            FileKind::Encoded { .. } => {
                self.ensure_reader(ctx)?;
                self.length
                    .get()
                    .ok_or_else(|| BinrevError::Internal("encoded length unset after open".into()))
            }
            FileKind::Memory { buf } => Ok(buf.borrow().len() as u64),
        }
    }

    /// Serialized pointer width: the explicit override, or 64-bit when the
    /// address range extends past `u32::MAX`.
    pub fn pointer_size(&self, ctx: &Context) -> Result<PointerSize> {
        if let Some(size) = self.pointer_size_override.get() {
            return Ok(size);
        }
        let end = self.base_address.wrapping_add(self.length(ctx)?);
        Ok(if end > u64::from(u32::MAX) {
            PointerSize::U64
        } else {
            PointerSize::U32
        })
    }

    fn resolve_path(&self, ctx: &Context) -> Result<PathBuf> {
        if let Some(path) = self.resolved_path.borrow().as_ref() {
            return Ok(path.clone());
        }
        let path = ctx.absolute_path(&self.name);
        *self.resolved_path.borrow_mut() = Some(path.clone());
        Ok(path)
    }

    // --- POINTER RESOLUTION ---

    /// True if the absolute offset falls inside `[base, base + length)`.
    pub fn contains(&self, ctx: &Context, absolute: u64) -> Result<bool> {
        let len = self.length(ctx)?;
        Ok(absolute >= self.base_address && absolute < self.base_address.wrapping_add(len))
    }

    /// Resolves a raw serialized pointer value read from `file` to the file
    /// that owns the target address, or `None` when nothing claims it.
    ///
    /// Local-pointer streams check themselves; memory-mapped files (and
    /// ordinary streams) walk the context memory map in priority order;
    /// plain linear files only ever point into themselves.
    pub fn resolve_pointer(
        file: &Rc<BinaryFile>,
        ctx: &Context,
        value: u64,
        anchor: Option<&Pointer>,
    ) -> Result<Option<Rc<BinaryFile>>> {
        let anchor_abs = anchor.map(|a| a.absolute()).unwrap_or(0);
        let target = value.wrapping_add(anchor_abs);

        if file.allow_local_pointers {
            return Ok(file.contains(ctx, target)?.then(|| file.clone()));
        }
        if file.is_memory_mapped || matches!(file.kind, FileKind::Memory { .. }) {
            for candidate in ctx.memory_map() {
                if candidate.contains(ctx, target)? {
                    return Ok(Some(candidate));
                }
            }
            return Ok(None);
        }
        Ok(file.contains(ctx, target)?.then(|| file.clone()))
    }

    /// Whitelists a raw pointer value that `allow_invalid_pointer` should
    /// accept (sentinel values some formats use for "none").
    pub fn add_allowed_invalid_pointer(&self, value: u64) {
        self.allowed_invalid.borrow_mut().insert(value);
    }

    /// True when an unresolvable value should be tolerated as a null pointer
    /// instead of raising `InvalidPointer`.
    pub fn allow_invalid_pointer(&self, value: u64, _anchor: Option<&Pointer>) -> bool {
        self.allowed_invalid.borrow().contains(&value)
    }

    /// Replaces whatever pointer would be computed for the field at
    /// `file_offset` with `target`.
    pub fn add_override_pointer(&self, file_offset: u64, target: Pointer) {
        self.override_pointers
            .borrow_mut()
            .insert(file_offset, target);
    }

    /// The override for the pointer field at `file_offset`, if any.
    pub fn override_pointer(&self, file_offset: u64) -> Option<Pointer> {
        self.override_pointers.borrow().get(&file_offset).cloned()
    }

    // --- REGIONS & LABELS ---

    /// Adds a named address interval (file offsets).
    pub fn add_region(&self, region: Region) {
        region::insert_sorted(&mut self.regions.borrow_mut(), region);
    }

    /// The region containing `file_offset`, if any.
    pub fn region_at(&self, file_offset: u64) -> Option<Region> {
        region::find_at(&self.regions.borrow(), file_offset).cloned()
    }

    /// Names a single offset.
    pub fn add_label(&self, file_offset: u64, label: impl Into<String>) {
        self.labels.borrow_mut().insert(file_offset, label.into());
    }

    /// The label at `file_offset`, if any.
    pub fn label_at(&self, file_offset: u64) -> Option<String> {
        self.labels.borrow().get(&file_offset).cloned()
    }

    // --- READ MAP ---

    /// Marks `count` bytes at `file_offset` as read. No-op until the map is
    /// allocated on first reader use.
    pub(crate) fn mark_read(&self, file_offset: u64, count: u64) {
        if let Some(map) = self.read_map.borrow_mut().as_mut() {
            map.mark(file_offset, count);
        }
    }

    /// `(read, total)` byte counts, when coverage tracking is on and the
    /// file has been opened.
    pub fn read_coverage(&self) -> Option<(u64, u64)> {
        self.read_map
            .borrow()
            .as_ref()
            .map(|m| (m.read_count(), m.len()))
    }

    /// Writes the 0xFF/0x00 coverage image, one byte per file byte.
    pub fn export_read_map(&self, out: &mut dyn Write) -> Result<()> {
        let map = self.read_map.borrow();
        let map = map
            .as_ref()
            .ok_or_else(|| BinrevError::Unsupported("file has no read map".into()))?;
        map.export(out)
    }

    // --- READER / WRITER LIFECYCLE ---

    /// Opens the reader if it is not open yet. Encoded files decode here;
    /// the read map is allocated here once the length is known.
    pub(crate) fn ensure_reader(&self, ctx: &Context) -> Result<()> {
        if self.reader.borrow().is_some() {
            return Ok(());
        }
        let stream: Box<dyn crate::io::InputStream> = match &self.kind {
            FileKind::Physical => ctx.file_manager().read_stream(&self.resolve_path(ctx)?)?,
            FileKind::Encoded { encoder } => {
                let mut raw = ctx.file_manager().read_stream(&self.resolve_path(ctx)?)?;
                let decoded = encoder.decode(&mut *raw)?;
                Box::new(MemoryStream::from_vec(decoded))
            }
            FileKind::Memory { buf } => Box::new(MemoryStream::new(buf.clone())),
        };
        let reader = Reader::new(stream, self.endian)?;
        if !matches!(self.kind, FileKind::Memory { .. }) {
            self.length.set(Some(reader.length()));
        }
        if self.read_map_requested.get() && self.read_map.borrow().is_none() {
            *self.read_map.borrow_mut() = Some(FileReadMap::new(reader.length()));
        }
        *self.reader.borrow_mut() = Some(reader);
        Ok(())
    }

    /// Opens the writer if it is not open yet, taking the backup first when
    /// the policy asks for one. Encoded files write into a scratch buffer
    /// seeded with the decoded on-disk content.
    pub(crate) fn ensure_writer(&self, ctx: &Context) -> Result<()> {
        if self.writer.borrow().is_some() {
            return Ok(());
        }
        let backup = self.backup_on_write || ctx.settings().backup_on_write;
        let stream: Box<dyn crate::io::OutputStream> = match &self.kind {
            FileKind::Physical => {
                let path = self.resolve_path(ctx)?;
                if backup && ctx.file_manager().file_exists(&path) {
                    ctx.file_manager().copy_file(&path, &backup_path(&path))?;
                }
                ctx.file_manager()
                    .write_stream(&path, self.recreate_on_write)?
            }
            FileKind::Encoded { encoder } => {
                let path = self.resolve_path(ctx)?;
                let buf = if ctx.file_manager().file_exists(&path) {
                    if backup {
                        ctx.file_manager().copy_file(&path, &backup_path(&path))?;
                    }
                    let mut raw = ctx.file_manager().read_stream(&path)?;
                    Rc::new(RefCell::new(encoder.decode(&mut *raw)?))
                } else {
                    Rc::new(RefCell::new(Vec::new()))
                };
                *self.scratch.borrow_mut() = Some(buf.clone());
                Box::new(MemoryStream::new(buf))
            }
            FileKind::Memory { buf } => Box::new(MemoryStream::new(buf.clone())),
        };
        *self.writer.borrow_mut() = Some(Writer::new(stream, self.endian)?);
        Ok(())
    }

    /// Runs `f` against the open reader.
    pub(crate) fn with_reader<R>(&self, f: impl FnOnce(&mut Reader) -> Result<R>) -> Result<R> {
        let mut slot = self.reader.borrow_mut();
        let reader = slot
            .as_mut()
            .ok_or_else(|| BinrevError::Internal(format!("no open reader for {}", self.name)))?;
        f(reader)
    }

    /// Runs `f` against the open writer.
    pub(crate) fn with_writer<R>(&self, f: impl FnOnce(&mut Writer) -> Result<R>) -> Result<R> {
        let mut slot = self.writer.borrow_mut();
        let writer = slot
            .as_mut()
            .ok_or_else(|| BinrevError::Internal(format!("no open writer for {}", self.name)))?;
        f(writer)
    }

    /// The shared buffer of an in-memory file, if this is one.
    pub(crate) fn memory_buffer(&self) -> Option<Rc<RefCell<Vec<u8>>>> {
        match &self.kind {
            FileKind::Memory { buf } => Some(buf.clone()),
            _ => None,
        }
    }

    /// Drops the reader. The next read reopens lazily.
    pub fn end_read(&self) {
        *self.reader.borrow_mut() = None;
    }

    /// Commits and drops the writer: flush, and for encoded files re-encode
    /// the scratch buffer and stream it to disk.
    pub fn end_write(&self, fm: &dyn FileManager) -> Result<()> {
        let writer = self.writer.borrow_mut().take();
        let Some(mut writer) = writer else {
            return Ok(());
        };
        writer.flush()?;
        drop(writer);
        if let (FileKind::Encoded { encoder }, Some(buf)) =
            (&self.kind, self.scratch.borrow_mut().take())
        {
            let path = self
                .resolved_path
                .borrow()
                .clone()
                .ok_or_else(|| BinrevError::Internal("encoded file path unresolved".into()))?;
            let image = encoder.encode(&buf.borrow())?;
            let mut out = fm.write_stream(&path, true)?;
            out.write_all(&image)?;
            out.flush()?;
        }
        Ok(())
    }

    /// Releases the file: commits any writer, drops the reader, and clears
    /// the pointer tables (which may hold handles back into the registry).
    pub(crate) fn release(&self, fm: &dyn FileManager) -> Result<()> {
        let result = self.end_write(fm);
        self.end_read();
        self.override_pointers.borrow_mut().clear();
        result
    }
}
