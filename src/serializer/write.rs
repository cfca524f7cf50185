//! The write direction of the serializer contract.
//!
//! Mirrors the read side against each file's lazily-opened writer. The one
//! asymmetry beyond direction: instead of the read cache, a per-session map
//! of already-written targets guards against re-emitting (and, for cyclic
//! graphs, infinitely re-emitting) the object at an address that was already
//! serialized through a resolved pointer.

use std::collections::HashMap;
use std::rc::Rc;

use super::{
    BitValueSerializer, EncodedArgs, Obj, PointerArgs, Serializable, SerializerObject, obj,
    short_type_name, transcript_line,
};
use crate::context::Context;
use crate::encoder::Encoder;
use crate::endian::Endian;
use crate::error::{BinrevError, Result};
use crate::file::BinaryFile;
use crate::filters::{ChecksumCalculator, XorCalculator};
use crate::pointer::{CacheKey, Pointer, PointerSize, TypedPointer};
use crate::primitives::{Primitive, PrimitiveValue};

/// Write implementation of [`SerializerObject`].
pub struct BinarySerializer {
    ctx: Rc<Context>,
    current_file: Option<Rc<BinaryFile>>,
    depth: usize,
    short_log_depth: Option<usize>,
    written: HashMap<CacheKey, u64>,
}

impl BinarySerializer {
    /// A serializer with no current file; the first `goto` picks one.
    pub fn new(ctx: Rc<Context>) -> Self {
        Self {
            ctx,
            current_file: None,
            depth: 0,
            short_log_depth: None,
            written: HashMap::new(),
        }
    }

    fn file(&self) -> Result<Rc<BinaryFile>> {
        self.current_file
            .clone()
            .ok_or_else(|| BinrevError::Internal("no active file".into()))
    }

    fn switch_to_file(&mut self, file: &Rc<BinaryFile>) -> Result<()> {
        file.ensure_writer(&self.ctx)?;
        self.current_file = Some(file.clone());
        Ok(())
    }

    fn write_value(&mut self, value: PrimitiveValue) -> Result<()> {
        self.file()?.with_writer(|w| match value {
            PrimitiveValue::Bool(v) => w.write_u8(u8::from(v)),
            PrimitiveValue::U8(v) => w.write_u8(v),
            PrimitiveValue::I8(v) => w.write_i8(v),
            PrimitiveValue::U16(v) => w.write_u16(v),
            PrimitiveValue::I16(v) => w.write_i16(v),
            PrimitiveValue::U24(v) => w.write_u24(v & 0x00FF_FFFF),
            PrimitiveValue::I24(v) => w.write_i24(v),
            PrimitiveValue::U32(v) => w.write_u32(v),
            PrimitiveValue::I32(v) => w.write_i32(v),
            PrimitiveValue::U64(v) => w.write_u64(v),
            PrimitiveValue::I64(v) => w.write_i64(v),
            PrimitiveValue::F32(v) => w.write_f32(v),
            PrimitiveValue::F64(v) => w.write_f64(v),
        })
    }

    fn log_allowed(&self) -> bool {
        self.ctx.settings().log && self.short_log_depth.is_none()
    }

    fn emit(&self, pointer: Option<&Pointer>, body: &str) {
        let mut body = body.to_string();
        if let Some(p) = pointer {
            if let Some(label) = p.file().label_at(p.file_offset()) {
                body.push_str(" // ");
                body.push_str(&label);
            } else if let Some(region) = p.file().region_at(p.file_offset()) {
                body.push_str(" // ");
                body.push_str(region.name());
            }
        }
        self.ctx
            .logger()
            .log(&transcript_line("WRITE", pointer, self.depth, &body));
    }

    fn log_field(
        &self,
        pointer: Option<&Pointer>,
        kind: &str,
        name: Option<&str>,
        value: &dyn std::fmt::Display,
    ) {
        if self.log_allowed() {
            self.emit(
                pointer,
                &format!("({kind}) {}: {value}", name.unwrap_or("<no name>")),
            );
        }
    }
}

impl SerializerObject for BinarySerializer {
    fn context(&self) -> &Rc<Context> {
        &self.ctx
    }

    fn is_reader(&self) -> bool {
        false
    }

    fn current_file(&self) -> Option<Rc<BinaryFile>> {
        self.current_file.clone()
    }

    fn position(&self) -> Result<u64> {
        self.file()?.with_writer(|w| Ok(w.position()))
    }

    fn depth(&self) -> usize {
        self.depth
    }

    fn goto(&mut self, target: Option<&Pointer>) -> Result<()> {
        let Some(target) = target else {
            return Ok(());
        };
        self.ctx.ensure_open()?;
        let file = target.file().clone();
        if !self
            .current_file
            .as_ref()
            .is_some_and(|f| Rc::ptr_eq(f, &file))
        {
            self.switch_to_file(&file)?;
        }
        let offset = target.file_offset();
        file.with_writer(|w| w.set_position(offset))
    }

    fn skip(&mut self, count: u64) -> Result<()> {
        self.file()?.with_writer(|w| w.skip(count))
    }

    fn endian(&self) -> Result<Endian> {
        self.file()?.with_writer(|w| Ok(w.endian()))
    }

    fn set_endian(&mut self, endian: Endian) -> Result<()> {
        self.file()?.with_writer(|w| {
            w.set_endian(endian);
            Ok(())
        })
    }

    // --- PRIMITIVES ---

    fn serialize<T: Primitive>(&mut self, value: T, name: Option<&str>) -> Result<T> {
        self.ctx.ensure_open()?;
        let site = self.current_pointer();
        let wire = value.into_value();
        self.write_value(wire)?;
        self.log_field(site.as_ref(), T::KIND.name(), name, &wire);
        Ok(value)
    }

    fn serialize_nullable_u8(
        &mut self,
        value: Option<u8>,
        name: Option<&str>,
    ) -> Result<Option<u8>> {
        self.ctx.ensure_open()?;
        let site = self.current_pointer();
        let raw = value.unwrap_or(0xFF);
        self.file()?.with_writer(|w| w.write_u8(raw))?;
        match value {
            Some(v) => self.log_field(site.as_ref(), "u8?", name, &v),
            None => self.log_field(site.as_ref(), "u8?", name, &"null"),
        }
        Ok(value)
    }

    fn serialize_checksum<T: Primitive>(&mut self, expected: T, name: Option<&str>) -> Result<T> {
        self.ctx.ensure_open()?;
        let site = self.current_pointer();
        let wire = expected.into_value();
        self.write_value(wire)?;
        self.log_field(site.as_ref(), T::KIND.name(), name.or(Some("checksum")), &wire);
        Ok(expected)
    }

    fn serialize_bytes(
        &mut self,
        mut value: Vec<u8>,
        count: u64,
        name: Option<&str>,
    ) -> Result<Vec<u8>> {
        self.ctx.ensure_open()?;
        let site = self.current_pointer();
        value.resize(count as usize, 0);
        self.file()?.with_writer(|w| w.write_bytes(&value))?;
        self.log_field(site.as_ref(), "bytes", name, &format_args!("[{count}]"));
        Ok(value)
    }

    fn serialize_string(
        &mut self,
        value: &str,
        length: Option<u64>,
        encoding: Option<&'static encoding_rs::Encoding>,
        name: Option<&str>,
    ) -> Result<String> {
        self.ctx.ensure_open()?;
        let encoding = encoding.unwrap_or(self.ctx.settings().default_encoding);
        let site = self.current_pointer();
        self.file()?.with_writer(|w| match length {
            Some(len) => w.write_fixed_string(value, len as usize, encoding),
            None => w.write_null_terminated_string(value, encoding),
        })?;
        self.log_field(site.as_ref(), "string", name, &format_args!("{value:?}"));
        Ok(value.to_string())
    }

    // --- OBJECTS ---

    fn serialize_object_with<T: Serializable>(
        &mut self,
        value: Option<Obj<T>>,
        on_pre_serialize: Option<&dyn Fn(&mut T)>,
        name: Option<&str>,
    ) -> Result<Obj<T>> {
        self.ctx.ensure_open()?;
        let pointer = self
            .current_pointer()
            .ok_or_else(|| BinrevError::Internal("no active file for object".into()))?;
        let instance = value.unwrap_or_else(|| obj(T::default()));

        // Already emitted at this address in this session: skip the bytes,
        // exactly like the read-side cache hit.
        let key = pointer.cache_key();
        if let Some(size) = self.written.get(&key).copied() {
            self.skip(size)?;
            self.log_field(
                Some(&pointer),
                short_type_name::<T>(),
                name,
                &"(already written)",
            );
            return Ok(instance);
        }
        self.written.insert(key, 0);

        instance.borrow_mut().init(&pointer);
        if let Some(pre) = on_pre_serialize {
            pre(&mut instance.borrow_mut());
        }

        let is_short = instance.borrow().is_short_log();
        let suppress_here = is_short && self.short_log_depth.is_none();
        if !is_short && self.log_allowed() {
            self.emit(
                Some(&pointer),
                &format!(
                    "({}) {}",
                    short_type_name::<T>(),
                    name.unwrap_or("<no name>")
                ),
            );
        }
        if suppress_here {
            self.short_log_depth = Some(self.depth);
        }

        self.depth += 1;
        let result = instance.borrow_mut().serialize(self);
        self.depth -= 1;

        if suppress_here {
            self.short_log_depth = None;
        }
        result?;

        let end = self
            .current_pointer()
            .map(|p| p.absolute())
            .unwrap_or(pointer.absolute());
        self.written
            .insert(key, end.saturating_sub(pointer.absolute()));

        if is_short {
            self.log_field(
                Some(&pointer),
                short_type_name::<T>(),
                name,
                &instance.borrow().short_log(),
            );
        }
        Ok(instance)
    }

    // --- POINTERS ---

    fn serialize_pointer(
        &mut self,
        value: Option<&Pointer>,
        args: PointerArgs<'_>,
        name: Option<&str>,
    ) -> Result<Option<Pointer>> {
        self.ctx.ensure_open()?;
        let file = self.file()?;
        let site = self.current_pointer();
        let size = match args.size {
            Some(s) => s,
            None => file.pointer_size(&self.ctx)?,
        };
        let raw = match value {
            None => 0,
            Some(p) => {
                let anchor_abs = p
                    .anchor()
                    .map(|a| a.absolute())
                    .or_else(|| args.anchor.map(|a| a.absolute()))
                    .unwrap_or(0);
                p.absolute().wrapping_sub(anchor_abs)
            }
        };
        match size {
            PointerSize::U32 => {
                if raw > u64::from(u32::MAX) {
                    return Err(BinrevError::Pointer(format!(
                        "0x{raw:X} does not fit a 32-bit pointer field at {}",
                        site.as_ref()
                            .map(|p| p.to_string())
                            .unwrap_or_else(|| "<no file>".into())
                    )));
                }
                self.file()?.with_writer(|w| w.write_u32(raw as u32))?;
            }
            PointerSize::U64 => {
                self.file()?.with_writer(|w| w.write_u64(raw))?;
            }
        }
        match value {
            Some(p) => self.log_field(site.as_ref(), "ptr", name, p),
            None => self.log_field(site.as_ref(), "ptr", name, &"null"),
        }
        Ok(value.cloned())
    }

    fn serialize_typed_pointer_with<T: Serializable>(
        &mut self,
        value: TypedPointer<T>,
        args: PointerArgs<'_>,
        resolve: bool,
        on_pre_serialize: Option<&dyn Fn(&mut T)>,
        name: Option<&str>,
    ) -> Result<TypedPointer<T>> {
        self.serialize_pointer(value.pointer.as_ref(), args, name)?;
        if resolve && let Some(target) = value.pointer.clone() {
            let existing = value.value.clone();
            self.do_at(Some(&target), move |s| {
                s.serialize_object_with(existing, on_pre_serialize, name)
            })?;
        }
        Ok(value)
    }

    // --- BIT FIELDS ---

    fn serialize_bit_values<T: Primitive, F: FnOnce(&mut BitValueSerializer) -> Result<()>>(
        &mut self,
        f: F,
    ) -> Result<()> {
        self.ctx.ensure_open()?;
        let width = T::KIND.bit_width().ok_or_else(|| {
            BinrevError::Unsupported(format!(
                "{} cannot back a bit-field accumulator",
                T::KIND.name()
            ))
        })?;
        let site = self.current_pointer();
        let mut cursor = BitValueSerializer::for_write(width);
        f(&mut cursor)?;
        let wire = PrimitiveValue::from_bits(T::KIND, cursor.into_bits())
            .ok_or_else(|| BinrevError::Internal("packed bits exceed accumulator".into()))?;
        self.write_value(wire)?;
        self.log_field(site.as_ref(), T::KIND.name(), Some("bit values"), &wire);
        Ok(())
    }

    // --- SCOPES ---

    fn do_endian<R>(
        &mut self,
        endian: Endian,
        body: impl FnOnce(&mut Self) -> Result<R>,
    ) -> Result<R> {
        let file = self.file()?;
        let previous = file.with_writer(|w| {
            let prev = w.endian();
            w.set_endian(endian);
            Ok(prev)
        })?;
        let result = body(self);
        let restored = file.with_writer(|w| {
            w.set_endian(previous);
            Ok(())
        });
        match (result, restored) {
            (Err(e), _) => Err(e),
            (Ok(_), Err(e)) => Err(e),
            (Ok(v), Ok(())) => Ok(v),
        }
    }

    fn do_encoded<R>(
        &mut self,
        encoder: &dyn Encoder,
        args: EncodedArgs<'_>,
        body: impl FnOnce(&mut Self) -> Result<R>,
    ) -> Result<R> {
        self.ctx.ensure_open()?;
        let outer_file = self.file()?;
        let outer_ptr = self
            .current_pointer()
            .ok_or_else(|| BinrevError::Internal("no active file for encoded scope".into()))?;

        let key = match args.key {
            Some(k) => k.to_string(),
            None => format!(
                "{}_0x{:X}_{}",
                outer_file.name(),
                outer_ptr.file_offset(),
                encoder.name()
            ),
        };
        let mut stream_file = BinaryFile::stream_empty(key)
            .with_endian(args.endian.unwrap_or(outer_file.endian()));
        if args.allow_local_pointers {
            stream_file = stream_file.with_local_pointers();
        }
        let stream_file = self.ctx.add_file(stream_file)?;
        let start = BinaryFile::start_pointer(&stream_file);

        let result = self.do_at(Some(&start), body);
        let scratch = stream_file
            .memory_buffer()
            .map(|buf| buf.borrow().clone())
            .ok_or_else(|| BinrevError::Internal("encoded scope lost its stream".into()));
        let removed = self.ctx.remove_file(&stream_file);

        let out = result?
            .ok_or_else(|| BinrevError::Internal("encoded scope returned no value".into()))?;
        removed?;
        let encoded = encoder.encode(&scratch?)?;

        // do_at restored the outer cursor; splicing the encoded image here
        // advances it past the block, matching the read path.
        self.file()?.with_writer(|w| w.write_bytes(&encoded))?;
        Ok(out)
    }

    // --- FILTERS ---

    fn begin_xor(&mut self, calc: Box<dyn XorCalculator>) -> Result<()> {
        self.file()?.with_writer(|w| {
            w.begin_xor(calc);
            Ok(())
        })
    }

    fn end_xor(&mut self) -> Result<()> {
        self.file()?.with_writer(|w| w.end_xor())
    }

    fn begin_checksum(&mut self, calc: Box<dyn ChecksumCalculator>) -> Result<()> {
        self.file()?.with_writer(|w| {
            w.begin_checksum(calc);
            Ok(())
        })
    }

    fn end_checksum(&mut self) -> Result<u64> {
        self.file()?.with_writer(|w| w.end_checksum())
    }

    // --- DIAGNOSTICS ---

    fn log(&mut self, msg: &str) {
        if self.log_allowed() {
            let site = self.current_pointer();
            self.emit(site.as_ref(), msg);
        }
    }
}
