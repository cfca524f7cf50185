//! The serialization universe: file registry, memory map, object cache,
//! settings, logging.
//!
//! One context backs one logical serialization task. It owns the registered
//! files, the object cache shared by every serializer driving it, and the
//! capabilities (file manager, logger) everything else borrows. Contexts are
//! explicitly closed — which commits writers and releases every file — and
//! closing again is a no-op; `Drop` closes as a fallback, swallowing errors.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use crate::error::{BinrevError, Result};
use crate::file::BinaryFile;
use crate::io::{FileManager, LocalFileManager};
use crate::pointer::{CacheKey, Pointer};
use crate::serializer::Obj;

/// Tunables shared by every serializer over a context.
#[derive(Debug, Clone, Copy)]
pub struct ContextSettings {
    /// Text encoding used when a string operation does not name one.
    pub default_encoding: &'static encoding_rs::Encoding,
    /// Enables the per-field serializer transcript. Warnings are emitted
    /// regardless.
    pub log: bool,
    /// Default backup-before-write policy; individual files can opt in on
    /// their own.
    pub backup_on_write: bool,
}

impl Default for ContextSettings {
    fn default() -> Self {
        Self {
            default_encoding: encoding_rs::UTF_8,
            log: false,
            backup_on_write: false,
        }
    }
}

// --- LOGGING ---

/// Sink for the serializer transcript and engine warnings.
///
/// The default forwards to `tracing`; tests install a collecting logger to
/// assert on warnings.
pub trait SerializerLogger {
    /// One transcript line (already formatted).
    fn log(&self, line: &str);

    /// A recoverable anomaly: checksum mismatch, malformed bool,
    /// under-consumed encoded block, tolerated invalid pointer.
    fn warn(&self, line: &str);
}

/// Routes transcript lines to `tracing::trace!` and warnings to
/// `tracing::warn!` under the `binrev` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogger;

impl SerializerLogger for TracingLogger {
    fn log(&self, line: &str) {
        tracing::trace!(target: "binrev", "{line}");
    }

    fn warn(&self, line: &str) {
        tracing::warn!(target: "binrev", "{line}");
    }
}

/// Captures everything in memory; the handles survive the context so tests
/// can inspect the output afterwards.
#[derive(Debug, Default, Clone)]
pub struct CollectingLogger {
    lines: Rc<RefCell<Vec<String>>>,
    warnings: Rc<RefCell<Vec<String>>>,
}

impl CollectingLogger {
    /// An empty collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared handle to the transcript lines.
    pub fn lines(&self) -> Rc<RefCell<Vec<String>>> {
        self.lines.clone()
    }

    /// Shared handle to the warnings.
    pub fn warnings(&self) -> Rc<RefCell<Vec<String>>> {
        self.warnings.clone()
    }
}

impl SerializerLogger for CollectingLogger {
    fn log(&self, line: &str) {
        self.lines.borrow_mut().push(line.to_string());
    }

    fn warn(&self, line: &str) {
        self.warnings.borrow_mut().push(line.to_string());
    }
}

// --- OBJECT CACHE ---

struct CacheEntry {
    object: Rc<dyn Any>,
    size: u64,
}

/// Absolute pointer -> first constructed instance, plus its measured size.
#[derive(Default)]
struct ObjectCache {
    entries: HashMap<CacheKey, CacheEntry>,
}

impl ObjectCache {
    fn get<T: 'static>(&self, key: CacheKey) -> Option<(Obj<T>, u64)> {
        let entry = self.entries.get(&key)?;
        let obj = entry.object.clone().downcast::<RefCell<T>>().ok()?;
        Some((obj, entry.size))
    }

    fn insert<T: 'static>(&mut self, key: CacheKey, object: Obj<T>) {
        self.entries.insert(
            key,
            CacheEntry {
                object: object as Rc<dyn Any>,
                size: 0,
            },
        );
    }

    fn set_size(&mut self, key: CacheKey, size: u64) {
        if let Some(entry) = self.entries.get_mut(&key) {
            entry.size = size;
        }
    }
}

// --- CONTEXT ---

/// Process-local universe of one serialization task.
pub struct Context {
    base_path: PathBuf,
    settings: ContextSettings,
    file_manager: Box<dyn FileManager>,
    logger: Box<dyn SerializerLogger>,
    files: RefCell<Vec<Rc<BinaryFile>>>,
    memory_map: RefCell<Vec<Rc<BinaryFile>>>,
    cache: RefCell<ObjectCache>,
    recorded_pointers: RefCell<Vec<Pointer>>,
    closed: Cell<bool>,
}

impl Context {
    /// A context rooted at `base_path` with the local file system, the
    /// tracing logger, and default settings.
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self::with_parts(
            base_path,
            ContextSettings::default(),
            Box::new(LocalFileManager),
            Box::new(TracingLogger),
        )
    }

    /// Full-control constructor for hosts and tests.
    pub fn with_parts(
        base_path: impl Into<PathBuf>,
        settings: ContextSettings,
        file_manager: Box<dyn FileManager>,
        logger: Box<dyn SerializerLogger>,
    ) -> Self {
        Self {
            base_path: base_path.into(),
            settings,
            file_manager,
            logger,
            files: RefCell::new(Vec::new()),
            memory_map: RefCell::new(Vec::new()),
            cache: RefCell::new(ObjectCache::default()),
            recorded_pointers: RefCell::new(Vec::new()),
            closed: Cell::new(false),
        }
    }

    /// The settings shared by every serializer over this context.
    pub fn settings(&self) -> &ContextSettings {
        &self.settings
    }

    /// The file-system capability.
    pub fn file_manager(&self) -> &dyn FileManager {
        self.file_manager.as_ref()
    }

    /// The transcript/warning sink.
    pub fn logger(&self) -> &dyn SerializerLogger {
        self.logger.as_ref()
    }

    /// Fails with `Disposed` once the context has been closed.
    pub fn ensure_open(&self) -> Result<()> {
        if self.closed.get() {
            return Err(BinrevError::Disposed);
        }
        Ok(())
    }

    // --- PATHS ---

    /// Canonical form of a registry key: forward slashes, no leading `./`.
    pub fn normalize_path(path: &str) -> String {
        let normalized = path.replace('\\', "/");
        normalized
            .strip_prefix("./")
            .map(str::to_string)
            .unwrap_or(normalized)
    }

    /// Resolves a context-relative path against the base directory.
    pub fn absolute_path(&self, relative: &str) -> PathBuf {
        let relative = Self::normalize_path(relative);
        if Path::new(&relative).is_absolute() {
            PathBuf::from(relative)
        } else {
            self.base_path.join(relative)
        }
    }

    /// The directory context-relative paths resolve against.
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    // --- FILE REGISTRY ---

    /// Registers a file and returns its shared handle. The normalized name
    /// (and alias, if any) become lookup keys; a taken key is
    /// `DuplicateFile`. Memory-mapped files also enter the memory map,
    /// sorted by priority descending with ties in insertion order.
    pub fn add_file(&self, file: BinaryFile) -> Result<Rc<BinaryFile>> {
        self.ensure_open()?;
        let key = Self::normalize_path(file.name());
        let files = self.files.borrow();
        for existing in files.iter() {
            let clash = Self::normalize_path(existing.name()) == key
                || existing.alias().is_some_and(|a| a == key)
                || file
                    .alias()
                    .is_some_and(|a| Self::normalize_path(existing.name()) == a);
            if clash {
                return Err(BinrevError::DuplicateFile(key));
            }
        }
        drop(files);

        let file = Rc::new(file);
        self.files.borrow_mut().push(file.clone());
        if file.is_memory_mapped() {
            let mut map = self.memory_map.borrow_mut();
            let idx = map
                .partition_point(|f| f.memory_mapped_priority() >= file.memory_mapped_priority());
            map.insert(idx, file.clone());
        }
        Ok(file)
    }

    /// Deregisters a file, committing its writer and dropping its reader.
    pub fn remove_file(&self, file: &Rc<BinaryFile>) -> Result<()> {
        let mut files = self.files.borrow_mut();
        let idx = files
            .iter()
            .position(|f| f.id() == file.id())
            .ok_or_else(|| BinrevError::UnknownFile(file.name().to_string()))?;
        files.remove(idx);
        drop(files);
        self.memory_map.borrow_mut().retain(|f| f.id() != file.id());
        file.release(self.file_manager.as_ref())
    }

    /// Looks a file up by normalized name or alias.
    pub fn get_file(&self, key: &str) -> Result<Rc<BinaryFile>> {
        let key = Self::normalize_path(key);
        self.files
            .borrow()
            .iter()
            .find(|f| Self::normalize_path(f.name()) == key || f.alias().is_some_and(|a| a == key))
            .cloned()
            .ok_or(BinrevError::UnknownFile(key))
    }

    /// Pointer to the first byte of a registered file.
    pub fn start_pointer(&self, key: &str) -> Result<Pointer> {
        let file = self.get_file(key)?;
        Ok(BinaryFile::start_pointer(&file))
    }

    /// Snapshot of the memory map: every memory-mapped file, priority
    /// descending, ties in insertion order.
    pub fn memory_map(&self) -> Vec<Rc<BinaryFile>> {
        self.memory_map.borrow().clone()
    }

    // --- OBJECT CACHE ---

    /// The cached instance and its measured size at an absolute pointer.
    pub fn cached_object<T: 'static>(&self, pointer: &Pointer) -> Option<(Obj<T>, u64)> {
        self.cache.borrow().get(pointer.cache_key())
    }

    /// Inserts an instance at an absolute pointer. The size starts at zero
    /// and is recorded by the serializer once the body has run.
    pub fn cache_object<T: 'static>(&self, pointer: &Pointer, object: Obj<T>) {
        self.cache.borrow_mut().insert(pointer.cache_key(), object);
    }

    pub(crate) fn set_cached_size(&self, pointer: &Pointer, size: u64) {
        self.cache.borrow_mut().set_size(pointer.cache_key(), size);
    }

    /// Drops every cached instance.
    pub fn clear_cache(&self) {
        self.cache.borrow_mut().entries.clear();
    }

    // --- POINTER RECORDING ---

    pub(crate) fn record_pointer(&self, pointer: Pointer) {
        self.recorded_pointers.borrow_mut().push(pointer);
    }

    /// Every pointer resolved through files that opted into recording.
    pub fn recorded_pointers(&self) -> Vec<Pointer> {
        self.recorded_pointers.borrow().clone()
    }

    // --- LIFECYCLE ---

    /// Releases every file in registration order (writers commit before
    /// readers drop) and clears the cache. Idempotent; afterwards every
    /// operation fails with `Disposed`.
    pub fn close(&self) -> Result<()> {
        if self.closed.get() {
            return Ok(());
        }
        self.closed.set(true);
        let files = std::mem::take(&mut *self.files.borrow_mut());
        self.memory_map.borrow_mut().clear();
        let mut first_error = None;
        for file in files {
            if let Err(e) = file.release(self.file_manager.as_ref()) {
                first_error.get_or_insert(e);
            }
        }
        self.clear_cache();
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
