//! Typed absolute addresses.
//!
//! A [`Pointer`] is a value type: an absolute offset, the file it lives in,
//! and an optional anchor the serialized form is relative to. Equality and
//! hashing deliberately ignore the anchor, so two pointers to the same byte
//! are the same object-cache key no matter how they were reached.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops::{Add, Sub};
use std::rc::Rc;

use crate::error::{BinrevError, Result};
use crate::file::{BinaryFile, FileId};
use crate::serializer::{Obj, Serializable, SerializerObject};

/// Object-cache key: file identity plus absolute offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct CacheKey {
    pub(crate) file: FileId,
    pub(crate) offset: u64,
}

/// An absolute address inside a registered file.
#[derive(Clone)]
pub struct Pointer {
    absolute: u64,
    file: Rc<BinaryFile>,
    anchor: Option<Box<Pointer>>,
}

impl Pointer {
    /// Creates a pointer at an absolute offset into `file`.
    pub fn new(absolute: u64, file: Rc<BinaryFile>) -> Self {
        Self {
            absolute,
            file,
            anchor: None,
        }
    }

    /// The absolute offset (file base address included).
    pub fn absolute(&self) -> u64 {
        self.absolute
    }

    /// The file this pointer addresses into.
    pub fn file(&self) -> &Rc<BinaryFile> {
        &self.file
    }

    /// Offset relative to the file start.
    pub fn file_offset(&self) -> u64 {
        self.absolute.wrapping_sub(self.file.base_address())
    }

    /// The anchor this pointer's serialized value is relative to, if any.
    pub fn anchor(&self) -> Option<&Pointer> {
        self.anchor.as_deref()
    }

    /// Returns the same target with a different anchor.
    pub fn with_anchor(&self, anchor: Pointer) -> Self {
        Self {
            absolute: self.absolute,
            file: self.file.clone(),
            anchor: Some(Box::new(anchor)),
        }
    }

    /// The value stored on the wire: absolute offset minus the anchor's
    /// absolute offset (or minus zero without an anchor).
    pub fn serialized_value(&self) -> u64 {
        let anchor = self.anchor.as_ref().map(|a| a.absolute).unwrap_or(0);
        self.absolute.wrapping_sub(anchor)
    }

    /// Signed distance to another pointer in the same file.
    pub fn distance_to(&self, other: &Pointer) -> Result<i64> {
        if self.file.id() != other.file.id() {
            return Err(BinrevError::Pointer(format!(
                "cannot subtract pointers across files ({} vs {})",
                self.file.name(),
                other.file.name()
            )));
        }
        Ok(other.absolute.wrapping_sub(self.absolute) as i64)
    }

    pub(crate) fn cache_key(&self) -> CacheKey {
        CacheKey {
            file: self.file.id(),
            offset: self.absolute,
        }
    }
}

impl Add<u64> for Pointer {
    type Output = Pointer;

    fn add(mut self, rhs: u64) -> Pointer {
        self.absolute = self.absolute.wrapping_add(rhs);
        self
    }
}

impl Sub<u64> for Pointer {
    type Output = Pointer;

    fn sub(mut self, rhs: u64) -> Pointer {
        self.absolute = self.absolute.wrapping_sub(rhs);
        self
    }
}

impl Add<u64> for &Pointer {
    type Output = Pointer;

    fn add(self, rhs: u64) -> Pointer {
        self.clone() + rhs
    }
}

impl Sub<u64> for &Pointer {
    type Output = Pointer;

    fn sub(self, rhs: u64) -> Pointer {
        self.clone() - rhs
    }
}

impl PartialEq for Pointer {
    fn eq(&self, other: &Self) -> bool {
        self.absolute == other.absolute && self.file.id() == other.file.id()
    }
}

impl Eq for Pointer {}

impl Hash for Pointer {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.absolute.hash(state);
        self.file.id().hash(state);
    }
}

impl fmt::Display for Pointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.absolute <= u64::from(u32::MAX) {
            write!(f, "{}|0x{:08X}", self.file.name(), self.absolute)
        } else {
            write!(f, "{}|0x{:016X}", self.file.name(), self.absolute)
        }
    }
}

impl fmt::Debug for Pointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pointer({self})")
    }
}

/// Width of a serialized pointer field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointerSize {
    /// 32-bit offsets.
    U32,
    /// 64-bit offsets.
    U64,
}

impl PointerSize {
    /// Serialized width in bytes.
    pub fn byte_len(self) -> u64 {
        match self {
            Self::U32 => 4,
            Self::U64 => 8,
        }
    }
}

/// A pointer plus its lazily-resolved target.
///
/// Created by `serialize_typed_pointer`; the target is populated either
/// eagerly (`resolve = true`) or by a later [`resolve`](TypedPointer::resolve)
/// call, typically once enough of the surrounding structure is known.
pub struct TypedPointer<T> {
    /// The resolved address, `None` when the wire value was zero.
    pub pointer: Option<Pointer>,
    /// The target instance once resolved.
    pub value: Option<Obj<T>>,
}

impl<T> TypedPointer<T> {
    /// A typed pointer at `pointer` with no resolved target yet.
    pub fn new(pointer: Option<Pointer>) -> Self {
        Self {
            pointer,
            value: None,
        }
    }

    /// Attaches a target instance (write-path construction).
    pub fn with_value(mut self, value: Obj<T>) -> Self {
        self.value = Some(value);
        self
    }

    /// True when the wire value was zero.
    pub fn is_null(&self) -> bool {
        self.pointer.is_none()
    }
}

impl<T: Serializable> TypedPointer<T> {
    /// Serializes the target at the pointed-to address, saving and restoring
    /// the cursor. Reading populates [`value`](TypedPointer::value); writing
    /// emits the attached instance (once per address per session).
    pub fn resolve<S: SerializerObject>(&mut self, s: &mut S) -> Result<()> {
        let Some(pointer) = self.pointer.clone() else {
            return Ok(());
        };
        let existing = self.value.clone();
        if let Some(obj) =
            s.do_at(Some(&pointer), move |s2| {
                s2.serialize_object_with(existing, None, None)
            })?
        {
            self.value = Some(obj);
        }
        Ok(())
    }
}

impl<T> Default for TypedPointer<T> {
    fn default() -> Self {
        Self {
            pointer: None,
            value: None,
        }
    }
}

impl<T> Clone for TypedPointer<T> {
    fn clone(&self) -> Self {
        Self {
            pointer: self.pointer.clone(),
            value: self.value.clone(),
        }
    }
}

impl<T> fmt::Debug for TypedPointer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.pointer {
            Some(p) => write!(
                f,
                "TypedPointer({p}, {})",
                if self.value.is_some() {
                    "resolved"
                } else {
                    "unresolved"
                }
            ),
            None => write!(f, "TypedPointer(null)"),
        }
    }
}
