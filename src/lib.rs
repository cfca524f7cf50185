//! # binrev
//!
//! A bidirectional, declarative engine for reading and writing structured
//! binary data in reverse-engineering workflows: memory-mapped ROMs, linear
//! files, encoded blocks, and in-memory scratch streams, tied together by
//! cross-file pointers under one addressable universe.
//!
//! ## The model
//!
//! A type with an externally-defined binary layout implements
//! [`Serializable`] with exactly one imperative `serialize` body. That body
//! runs against either serializer direction:
//!
//! * [`BinaryDeserializer`] reads — every field operation decodes bytes,
//!   updates the file's read-coverage map, and returns the decoded value;
//! * [`BinarySerializer`] writes — the same operations consume the passed
//!   values and emit bytes.
//!
//! Because both directions share the [`SerializerObject`] trait, the layout
//! is described once and cannot drift between read and write.
//!
//! ## The universe
//!
//! A [`Context`] registers [`BinaryFile`]s: plain linear files, encoded
//! files (decoded through an [`Encoder`] on open), memory-mapped files with
//! non-zero base addresses, and transient in-memory streams. Pointers read
//! from any file resolve across the whole memory map, so a 32-bit value in
//! one ROM can address a structure in another.
//!
//! [`Pointer`]s are value types carrying their file handle; equal
//! `(file, offset)` pairs are equal keys into the context's object cache,
//! which is what deduplicates shared structures and breaks cycles in
//! recursive graphs.
//!
//! ## Scopes
//!
//! Aspects of the stream are reshaped locally and restored on exit, even on
//! error: `do_at` (position + file), `do_endian` (byte order), `do_encoded`
//! (a compressed/obfuscated block exposed as its own transient file),
//! `begin_xor`/`end_xor` and `begin_checksum`/`end_checksum` (per-byte
//! filters).
//!
//! ## Example
//!
//! ```rust,ignore
//! use binrev::{BinaryFile, Context, Serializable, SerializerObject};
//! use std::rc::Rc;
//!
//! #[derive(Default)]
//! struct Header {
//!     magic: u32,
//!     entry_count: u16,
//! }
//!
//! impl Serializable for Header {
//!     fn serialize<S: SerializerObject>(&mut self, s: &mut S) -> binrev::Result<()> {
//!         self.magic = s.serialize(self.magic, Some("magic"))?;
//!         self.entry_count = s.serialize(self.entry_count, Some("entry_count"))?;
//!         Ok(())
//!     }
//! }
//!
//! let ctx = Rc::new(Context::new("roms"));
//! ctx.add_file(BinaryFile::memory_mapped("game.gba", 0x0800_0000).with_read_map())?;
//! let header = binrev::read_file::<Header>(&ctx, "game.gba")?;
//! # binrev::Result::Ok(())
//! ```
//!
//! ## Safety and error handling
//!
//! * No `unwrap()` or `panic!()` in the library (enforced by clippy lints).
//! * All failures surface as [`BinrevError`]; format anomalies that RE work
//!   routinely tolerates (checksum mismatches, malformed bools,
//!   under-consumed encoded blocks) are warnings through the context logger
//!   instead.
//! * `unsafe` appears once, for memory-mapping read streams.

#![deny(unsafe_code)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::panic)]
#![warn(missing_docs)]

pub mod api;
pub mod context;
pub mod encoder;
pub mod endian;
pub mod error;
pub mod file;
pub mod filters;
pub mod io;
pub mod pointer;
pub mod primitives;
pub mod reader;
pub mod serializer;
pub mod writer;

// --- RE-EXPORTS ---

pub use api::{read_file, read_object, write_file, write_object};
pub use context::{CollectingLogger, Context, ContextSettings, SerializerLogger, TracingLogger};
pub use encoder::Encoder;
#[cfg(feature = "lz4")]
pub use encoder::Lz4Encoder;
pub use encoder::XorEncoder;
pub use endian::Endian;
pub use error::{BinrevError, Result};
pub use file::{BinaryFile, FileReadMap, Region};
pub use filters::{
    Checksum8, Checksum16, ChecksumCalculator, Xor8, XorCalculator, XorRepeating,
    XxHash64Checksum,
};
pub use io::{FileManager, LocalFileManager};
pub use pointer::{Pointer, PointerSize, TypedPointer};
pub use primitives::{I24, Primitive, U24};
pub use serializer::{
    BinaryDeserializer, BinarySerializer, BitValueSerializer, EncodedArgs, Obj, PointerArgs,
    Serializable, SerializerObject, obj,
};
