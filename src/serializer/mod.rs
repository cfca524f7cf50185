//! The declarative serialization API.
//!
//! A serializable type writes exactly one [`Serializable::serialize`] body;
//! the same body reads or writes depending on which [`SerializerObject`]
//! implementation drives it. [`BinaryDeserializer`] is the read direction,
//! [`BinarySerializer`] the write direction; everything user code touches is
//! the shared trait.
//!
//! ## Shape of a serializable type
//!
//! ```rust,ignore
//! #[derive(Default)]
//! struct LevelHeader {
//!     version: u16,
//!     flags: u8,
//!     name: String,
//!     tiles: TypedPointer<TileBlock>,
//! }
//!
//! impl Serializable for LevelHeader {
//!     fn serialize<S: SerializerObject>(&mut self, s: &mut S) -> Result<()> {
//!         self.version = s.serialize(self.version, Some("version"))?;
//!         self.flags = s.serialize(self.flags, Some("flags"))?;
//!         self.name = s.serialize_string(&self.name, Some(16), None, Some("name"))?;
//!         self.tiles = s.serialize_typed_pointer_with(
//!             std::mem::take(&mut self.tiles),
//!             PointerArgs::default(),
//!             true,
//!             None,
//!             Some("tiles"),
//!         )?;
//!         Ok(())
//!     }
//! }
//! ```
//!
//! Field operations are totally ordered by the body's program order; scopes
//! (`do_at`, `do_endian`, `do_encoded`, XOR/checksum) restore what they
//! changed even when the body fails.

mod read;
mod write;

pub use read::BinaryDeserializer;
pub use write::BinarySerializer;

use std::any::TypeId;
use std::cell::RefCell;
use std::rc::Rc;

use crate::context::Context;
use crate::encoder::Encoder;
use crate::endian::Endian;
use crate::error::{BinrevError, Result};
use crate::file::BinaryFile;
use crate::filters::{ChecksumCalculator, XorCalculator};
use crate::pointer::{Pointer, PointerSize, TypedPointer};
use crate::primitives::{Primitive, PrimitiveValue};

/// Shared handle to a serialized instance.
///
/// Instances live in the context's object cache and can be referenced from
/// several places in a graph (including cyclically), so they are
/// reference-counted with interior mutability. The engine is single-threaded
/// by contract; `Rc<RefCell<..>>` is the whole story.
pub type Obj<T> = Rc<RefCell<T>>;

/// Wraps a value into a shared instance handle.
pub fn obj<T>(value: T) -> Obj<T> {
    Rc::new(RefCell::new(value))
}

/// A type with an externally-defined binary layout.
///
/// `init` runs at placement, before the body, so self-referential graphs can
/// observe the partially-initialized instance through the cache. The engine
/// measures the serialized size itself; types do not report one.
pub trait Serializable: Default + 'static {
    /// Called once the instance is placed at its pointer, before the body.
    fn init(&mut self, _pointer: &Pointer) {}

    /// The one body that defines both the read and the write format.
    fn serialize<S: SerializerObject>(&mut self, s: &mut S) -> Result<()>;

    /// When true, per-field transcript lines inside this object are replaced
    /// by one [`short_log`](Serializable::short_log) summary line.
    fn is_short_log(&self) -> bool {
        false
    }

    /// The summary used when [`is_short_log`](Serializable::is_short_log)
    /// is set.
    fn short_log(&self) -> String {
        String::new()
    }
}

/// Options for pointer-field operations.
#[derive(Debug, Clone, Copy, Default)]
pub struct PointerArgs<'a> {
    /// The serialized value is relative to this pointer's absolute offset.
    pub anchor: Option<&'a Pointer>,
    /// Tolerate an unresolvable non-zero value as null instead of raising
    /// `InvalidPointer`.
    pub allow_invalid: bool,
    /// Per-field width override; defaults to the file's pointer size.
    pub size: Option<PointerSize>,
}

impl<'a> PointerArgs<'a> {
    /// Args with an anchor and everything else default.
    pub fn anchored(anchor: &'a Pointer) -> Self {
        Self {
            anchor: Some(anchor),
            ..Self::default()
        }
    }
}

/// Options for encoded-block scopes.
#[derive(Debug, Clone, Copy, Default)]
pub struct EncodedArgs<'a> {
    /// Endianness of the decoded stream; defaults to the outer file's.
    pub endian: Option<Endian>,
    /// Resolve pointers read inside the block against the block itself.
    pub allow_local_pointers: bool,
    /// Registry key for the transient stream file; defaults to a key derived
    /// from the outer pointer, stable per call site.
    pub key: Option<&'a str>,
}

/// Bit-level cursor handed to `serialize_bit_values` closures.
///
/// Fields are packed LSB-first at a monotonically advancing bit position.
/// On read, `bits` extracts; on write, it packs the supplied value. Either
/// way it returns the field's value, so the closure body reads the same in
/// both directions.
#[derive(Debug)]
pub struct BitValueSerializer {
    reading: bool,
    value: u64,
    pos: u32,
    width: u32,
}

impl BitValueSerializer {
    pub(crate) fn for_read(value: u64, width: u32) -> Self {
        Self {
            reading: true,
            value,
            pos: 0,
            width,
        }
    }

    pub(crate) fn for_write(width: u32) -> Self {
        Self {
            reading: false,
            value: 0,
            pos: 0,
            width,
        }
    }

    pub(crate) fn into_bits(self) -> u64 {
        self.value
    }

    /// One unsigned field of `width` bits at the current bit position.
    pub fn bits(&mut self, value: u32, width: u32, _name: Option<&str>) -> Result<u32> {
        if width == 0 || width > 32 || self.pos + width > self.width {
            return Err(BinrevError::Unsupported(format!(
                "bit field of width {width} at position {} exceeds a {}-bit value",
                self.pos, self.width
            )));
        }
        let mask = if width == 32 {
            u64::from(u32::MAX)
        } else {
            (1u64 << width) - 1
        };
        let out = if self.reading {
            ((self.value >> self.pos) & mask) as u32
        } else {
            self.value |= (u64::from(value) & mask) << self.pos;
            (u64::from(value) & mask) as u32
        };
        self.pos += width;
        Ok(out)
    }
}

/// The declarative serialization contract, implemented once per direction.
///
/// Methods taking a `value` consume it on the write path and ignore it on
/// the read path (returning what the stream said instead), so assignment
/// through the return value is the universal idiom:
///
/// ```rust,ignore
/// self.count = s.serialize(self.count, Some("count"))?;
/// ```
pub trait SerializerObject: Sized {
    /// The context this serializer drives.
    fn context(&self) -> &Rc<Context>;

    /// True for the read direction.
    fn is_reader(&self) -> bool;

    /// The file the cursor currently sits in.
    fn current_file(&self) -> Option<Rc<BinaryFile>>;

    /// Cursor position as a file offset into the current file.
    fn position(&self) -> Result<u64>;

    /// Object nesting depth (drives transcript indentation).
    fn depth(&self) -> usize;

    /// Cursor position as an absolute pointer.
    fn current_pointer(&self) -> Option<Pointer> {
        let file = self.current_file()?;
        let pos = self.position().ok()?;
        Some(Pointer::new(file.base_address().wrapping_add(pos), file))
    }

    /// Moves the cursor, switching files if the pointer lives elsewhere
    /// (the target file's reader or writer is created lazily). A `None`
    /// pointer is a no-op.
    fn goto(&mut self, target: Option<&Pointer>) -> Result<()>;

    /// Advances the cursor without touching bytes.
    fn skip(&mut self, count: u64) -> Result<()>;

    /// Active endianness of the current file's reader or writer.
    fn endian(&self) -> Result<Endian>;

    /// Switches the active endianness. Prefer [`do_endian`] for anything
    /// scoped.
    ///
    /// [`do_endian`]: SerializerObject::do_endian
    fn set_endian(&mut self, endian: Endian) -> Result<()>;

    // --- PRIMITIVES ---

    /// One wire primitive.
    fn serialize<T: Primitive>(&mut self, value: T, name: Option<&str>) -> Result<T>;

    /// One byte where 0xFF means "none".
    fn serialize_nullable_u8(
        &mut self,
        value: Option<u8>,
        name: Option<&str>,
    ) -> Result<Option<u8>>;

    /// One primitive that should equal `expected`; a read mismatch is a
    /// warning, and the read value wins.
    fn serialize_checksum<T: Primitive>(&mut self, expected: T, name: Option<&str>) -> Result<T>;

    /// A raw block of exactly `count` bytes (bulk path; one coverage update).
    fn serialize_bytes(&mut self, value: Vec<u8>, count: u64, name: Option<&str>)
    -> Result<Vec<u8>>;

    /// A string: fixed byte `length` (NUL-padded) when given, NUL-terminated
    /// otherwise. `encoding` defaults to the context's.
    fn serialize_string(
        &mut self,
        value: &str,
        length: Option<u64>,
        encoding: Option<&'static encoding_rs::Encoding>,
        name: Option<&str>,
    ) -> Result<String>;

    // --- OBJECTS ---

    /// A nested object at the current position, with a pre-body hook.
    ///
    /// The read path consults the object cache first: a hit skips the bytes
    /// (advancing by the instance's measured size) and returns the cached
    /// instance, unless the file opts out with `ignore_cache_on_read`.
    fn serialize_object_with<T: Serializable>(
        &mut self,
        value: Option<Obj<T>>,
        on_pre_serialize: Option<&dyn Fn(&mut T)>,
        name: Option<&str>,
    ) -> Result<Obj<T>>;

    /// [`serialize_object_with`](SerializerObject::serialize_object_with)
    /// without a hook.
    fn serialize_object<T: Serializable>(
        &mut self,
        value: Option<Obj<T>>,
        name: Option<&str>,
    ) -> Result<Obj<T>> {
        self.serialize_object_with(value, None, name)
    }

    // --- POINTERS ---

    /// A raw pointer field at the file's pointer width. Zero is null; an
    /// unresolvable non-zero value raises `InvalidPointer` unless
    /// `args.allow_invalid` or the file whitelists it.
    fn serialize_pointer(
        &mut self,
        value: Option<&Pointer>,
        args: PointerArgs<'_>,
        name: Option<&str>,
    ) -> Result<Option<Pointer>>;

    /// A pointer field plus optional eager serialization of its target (with
    /// cursor save/restore around the jump).
    fn serialize_typed_pointer_with<T: Serializable>(
        &mut self,
        value: TypedPointer<T>,
        args: PointerArgs<'_>,
        resolve: bool,
        on_pre_serialize: Option<&dyn Fn(&mut T)>,
        name: Option<&str>,
    ) -> Result<TypedPointer<T>>;

    /// A lazy typed pointer: target left for a later
    /// [`TypedPointer::resolve`].
    fn serialize_typed_pointer<T: Serializable>(
        &mut self,
        value: TypedPointer<T>,
        args: PointerArgs<'_>,
        name: Option<&str>,
    ) -> Result<TypedPointer<T>> {
        self.serialize_typed_pointer_with(value, args, false, None, name)
    }

    // --- BIT FIELDS ---

    /// One integer primitive unpacked into (read) or packed from (write)
    /// LSB-first bit fields declared by the closure.
    ///
    /// The closure generic is named (rather than `impl Trait`) so call sites
    /// can turbofish the accumulator: `s.serialize_bit_values::<u16, _>(..)`.
    fn serialize_bit_values<T: Primitive, F: FnOnce(&mut BitValueSerializer) -> Result<()>>(
        &mut self,
        f: F,
    ) -> Result<()>;

    // --- ARRAYS ---

    /// `count` primitives. `Vec<u8>` takes the bulk byte path.
    fn serialize_array<T: Primitive>(
        &mut self,
        mut value: Vec<T>,
        count: u64,
        name: Option<&str>,
    ) -> Result<Vec<T>> {
        if TypeId::of::<T>() == TypeId::of::<u8>() {
            // Same-type round trip through Any; the discriminant check above
            // guarantees both downcasts.
            let boxed: Box<dyn std::any::Any> = Box::new(value);
            let bytes = boxed
                .downcast::<Vec<u8>>()
                .map_err(|_| BinrevError::Internal("byte array downcast".into()))?;
            let out = self.serialize_bytes(*bytes, count, name)?;
            let boxed: Box<dyn std::any::Any> = Box::new(out);
            let out = boxed
                .downcast::<Vec<T>>()
                .map_err(|_| BinrevError::Internal("byte array upcast".into()))?;
            return Ok(*out);
        }
        value.resize(count as usize, T::default());
        for (i, slot) in value.iter_mut().enumerate() {
            let elem_name = indexed_name(self, name, i);
            *slot = self.serialize(*slot, elem_name.as_deref())?;
        }
        Ok(value)
    }

    /// `count` nested objects.
    fn serialize_object_array<T: Serializable>(
        &mut self,
        mut value: Vec<Obj<T>>,
        count: u64,
        name: Option<&str>,
    ) -> Result<Vec<Obj<T>>> {
        value.resize_with(count as usize, || obj(T::default()));
        for (i, slot) in value.iter_mut().enumerate() {
            let elem_name = indexed_name(self, name, i);
            let current = slot.clone();
            *slot = self.serialize_object_with(Some(current), None, elem_name.as_deref())?;
        }
        Ok(value)
    }

    /// `count` raw pointer fields.
    fn serialize_pointer_array(
        &mut self,
        mut value: Vec<Option<Pointer>>,
        count: u64,
        args: PointerArgs<'_>,
        name: Option<&str>,
    ) -> Result<Vec<Option<Pointer>>> {
        value.resize(count as usize, None);
        for (i, slot) in value.iter_mut().enumerate() {
            let elem_name = indexed_name(self, name, i);
            let current = slot.clone();
            *slot = self.serialize_pointer(current.as_ref(), args, elem_name.as_deref())?;
        }
        Ok(value)
    }

    /// `count` typed pointer fields, optionally resolving each target.
    fn serialize_typed_pointer_array<T: Serializable>(
        &mut self,
        mut value: Vec<TypedPointer<T>>,
        count: u64,
        args: PointerArgs<'_>,
        resolve: bool,
        name: Option<&str>,
    ) -> Result<Vec<TypedPointer<T>>> {
        value.resize_with(count as usize, TypedPointer::default);
        for (i, slot) in value.iter_mut().enumerate() {
            let elem_name = indexed_name(self, name, i);
            let current = std::mem::take(slot);
            *slot =
                self.serialize_typed_pointer_with(current, args, resolve, None, elem_name.as_deref())?;
        }
        Ok(value)
    }

    /// `count` strings, each fixed-length or NUL-terminated.
    fn serialize_string_array(
        &mut self,
        mut value: Vec<String>,
        count: u64,
        length: Option<u64>,
        encoding: Option<&'static encoding_rs::Encoding>,
        name: Option<&str>,
    ) -> Result<Vec<String>> {
        value.resize(count as usize, String::new());
        for (i, slot) in value.iter_mut().enumerate() {
            let elem_name = indexed_name(self, name, i);
            let current = std::mem::take(slot);
            *slot = self.serialize_string(&current, length, encoding, elem_name.as_deref())?;
        }
        Ok(value)
    }

    /// A length prefix of integer type `U` tied to `value.len()`: writes the
    /// current length, reads and resizes the buffer to the stored one. The
    /// elements themselves are serialized separately, after this call.
    fn serialize_array_size<T: Default + Clone, U: Primitive>(
        &mut self,
        mut value: Vec<T>,
        name: Option<&str>,
    ) -> Result<Vec<T>> {
        let current = value.len() as u64;
        let prefix = PrimitiveValue::from_bits(U::KIND, current).ok_or_else(|| {
            BinrevError::Unsupported(format!(
                "array length {current} does not fit a {} prefix",
                U::KIND.name()
            ))
        })?;
        let prefix = U::from_value(prefix)
            .ok_or_else(|| BinrevError::Internal("prefix kind mismatch".into()))?;
        let stored = self.serialize(prefix, name)?;
        let stored = stored
            .into_value()
            .to_bits()
            .ok_or_else(|| BinrevError::Unsupported("array size prefix must be an integer".into()))?;
        if self.is_reader() {
            value.resize(stored as usize, T::default());
        }
        Ok(value)
    }

    // --- SCOPES ---

    /// Jumps to `target`, runs the body, and restores the pre-scope file and
    /// position — also on failure. A `None` target skips the body entirely.
    fn do_at<R>(
        &mut self,
        target: Option<&Pointer>,
        body: impl FnOnce(&mut Self) -> Result<R>,
    ) -> Result<Option<R>> {
        let Some(target) = target else {
            return Ok(None);
        };
        let saved_file = self.current_file();
        let saved_offset = match &saved_file {
            Some(_) => Some(self.position()?),
            None => None,
        };
        self.goto(Some(target))?;
        let result = body(self);
        let restored = match (saved_file, saved_offset) {
            (Some(file), Some(offset)) => {
                let back = Pointer::new(file.base_address().wrapping_add(offset), file);
                self.goto(Some(&back))
            }
            _ => Ok(()),
        };
        match (result, restored) {
            (Err(e), _) => Err(e),
            (Ok(_), Err(e)) => Err(e),
            (Ok(v), Ok(())) => Ok(Some(v)),
        }
    }

    /// Like [`do_at`](SerializerObject::do_at) with a target that is known
    /// to exist.
    fn do_at_required<R>(
        &mut self,
        target: &Pointer,
        body: impl FnOnce(&mut Self) -> Result<R>,
    ) -> Result<R> {
        self.do_at(Some(target), body)?
            .ok_or_else(|| BinrevError::Internal("scope with a present target returned none".into()))
    }

    /// Swaps the active endianness around the body, restoring it on exit
    /// even when the body fails.
    fn do_endian<R>(
        &mut self,
        endian: Endian,
        body: impl FnOnce(&mut Self) -> Result<R>,
    ) -> Result<R>;

    /// Decodes the rest of the active stream into a transient in-memory
    /// file, runs the body against it from the start, then deregisters it.
    ///
    /// Reading warns when the body consumes fewer bytes than were decoded;
    /// the outer cursor ends up past the encoded block either way. Writing
    /// runs the body against a scratch stream, then re-encodes and splices
    /// the result at the outer position.
    fn do_encoded<R>(
        &mut self,
        encoder: &dyn Encoder,
        args: EncodedArgs<'_>,
        body: impl FnOnce(&mut Self) -> Result<R>,
    ) -> Result<R>;

    // --- FILTERS ---

    /// Installs an XOR filter on the current file's stream (nested scopes
    /// replace and later restore).
    fn begin_xor(&mut self, calc: Box<dyn XorCalculator>) -> Result<()>;

    /// Removes the active XOR filter, restoring any previous one.
    fn end_xor(&mut self) -> Result<()>;

    /// Starts accumulating a checksum over the logical byte stream.
    fn begin_checksum(&mut self, calc: Box<dyn ChecksumCalculator>) -> Result<()>;

    /// Stops accumulating and returns the checksum value.
    fn end_checksum(&mut self) -> Result<u64>;

    // --- DIAGNOSTICS ---

    /// True when the per-field transcript is on.
    fn log_enabled(&self) -> bool {
        self.context().settings().log
    }

    /// Emits a user line into the transcript at the current indent.
    fn log(&mut self, msg: &str);

    /// Emits a warning (always forwarded, transcript on or off).
    fn warn(&self, msg: &str) {
        self.context().logger().warn(msg);
    }

    /// Hints the file manager that `length` bytes are about to be read.
    fn fill_cache_for_read(&self, length: u64) {
        self.context().file_manager().fill_cache_for_read(length);
    }
}

fn indexed_name<S: SerializerObject>(s: &S, name: Option<&str>, index: usize) -> Option<String> {
    if s.log_enabled() {
        name.map(|n| format!("{n}[{index}]"))
    } else {
        None
    }
}

/// Last path segment of a type name, for object transcript lines.
pub(crate) fn short_type_name<T>() -> &'static str {
    let full = std::any::type_name::<T>();
    full.rsplit("::").next().unwrap_or(full)
}

/// One transcript line: role, pointer, indentation, payload.
pub(crate) fn transcript_line(
    role: &str,
    pointer: Option<&Pointer>,
    depth: usize,
    body: &str,
) -> String {
    match pointer {
        Some(p) => format!("({role}) {p}:  {:indent$}{body}", "", indent = depth * 2),
        None => format!("({role}) <no file>:  {:indent$}{body}", "", indent = depth * 2),
    }
}
