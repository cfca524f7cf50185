//! The read direction of the serializer contract.
//!
//! Drives one cursor over the context: byte operations go to the current
//! file's lazily-opened reader, every consumed range lands in that file's
//! coverage map, and object construction round-trips through the context
//! cache so shared and cyclic graphs come back as shared instances.

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
use crate::pointer::{Pointer, PointerSize, TypedPointer};
use crate::primitives::{Primitive, PrimitiveKind, PrimitiveValue};
use crate::reader::Reader;

/// Read implementation of [`SerializerObject`].
pub struct BinaryDeserializer {
    ctx: Rc<Context>,
    current_file: Option<Rc<BinaryFile>>,
    depth: usize,
    short_log_depth: Option<usize>,
}

impl BinaryDeserializer {
    /// A deserializer with no current file; the first `goto` picks one.
    pub fn new(ctx: Rc<Context>) -> Self {
        Self {
            ctx,
            current_file: None,
            depth: 0,
            short_log_depth: None,
        }
    }

    fn file(&self) -> Result<Rc<BinaryFile>> {
        self.current_file
            .clone()
            .ok_or_else(|| BinrevError::Internal("no active file".into()))
    }

    fn switch_to_file(&mut self, file: &Rc<BinaryFile>) -> Result<()> {
        file.ensure_reader(&self.ctx)?;
        self.current_file = Some(file.clone());
        Ok(())
    }

    /// Runs a reader operation and marks the consumed range in the file's
    /// coverage map.
    fn tracked<R>(&self, f: impl FnOnce(&mut Reader) -> Result<R>) -> Result<R> {
        let file = self.file()?;
        let (out, start, end) = file.with_reader(|r| {
            let start = r.position();
            let out = f(r)?;
            Ok((out, start, r.position()))
        })?;
        file.mark_read(start, end.saturating_sub(start));
        Ok(out)
    }

    fn read_value(&mut self, kind: PrimitiveKind) -> Result<PrimitiveValue> {
        Ok(match kind {
            PrimitiveKind::Bool => {
                let site = self.current_pointer();
                let b = self.tracked(|r| r.read_u8())?;
                if b > 1 {
                    self.warn(&format!(
                        "Malformed bool 0x{b:02X} at {}",
                        display_site(site.as_ref())
                    ));
                }
                PrimitiveValue::Bool(b != 0)
            }
            PrimitiveKind::U8 => PrimitiveValue::U8(self.tracked(|r| r.read_u8())?),
            PrimitiveKind::I8 => PrimitiveValue::I8(self.tracked(|r| r.read_i8())?),
            PrimitiveKind::U16 => PrimitiveValue::U16(self.tracked(|r| r.read_u16())?),
            PrimitiveKind::I16 => PrimitiveValue::I16(self.tracked(|r| r.read_i16())?),
            PrimitiveKind::U24 => PrimitiveValue::U24(self.tracked(|r| r.read_u24())?),
            PrimitiveKind::I24 => PrimitiveValue::I24(self.tracked(|r| r.read_i24())?),
            PrimitiveKind::U32 => PrimitiveValue::U32(self.tracked(|r| r.read_u32())?),
            PrimitiveKind::I32 => PrimitiveValue::I32(self.tracked(|r| r.read_i32())?),
            PrimitiveKind::U64 => PrimitiveValue::U64(self.tracked(|r| r.read_u64())?),
            PrimitiveKind::I64 => PrimitiveValue::I64(self.tracked(|r| r.read_i64())?),
            PrimitiveKind::F32 => PrimitiveValue::F32(self.tracked(|r| r.read_f32())?),
            PrimitiveKind::F64 => PrimitiveValue::F64(self.tracked(|r| r.read_f64())?),
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
            .log(&transcript_line("READ", pointer, self.depth, &body));
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

fn display_site(pointer: Option<&Pointer>) -> String {
    pointer
        .map(|p| p.to_string())
        .unwrap_or_else(|| "<no file>".to_string())
}

impl SerializerObject for BinaryDeserializer {
    fn context(&self) -> &Rc<Context> {
        &self.ctx
    }

    fn is_reader(&self) -> bool {
        true
    }

    fn current_file(&self) -> Option<Rc<BinaryFile>> {
        self.current_file.clone()
    }

    fn position(&self) -> Result<u64> {
        self.file()?.with_reader(|r| Ok(r.position()))
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
        file.with_reader(|r| r.set_position(offset))
    }

    fn skip(&mut self, count: u64) -> Result<()> {
        self.file()?.with_reader(|r| r.skip(count))
    }

    fn endian(&self) -> Result<Endian> {
        self.file()?.with_reader(|r| Ok(r.endian()))
    }

    fn set_endian(&mut self, endian: Endian) -> Result<()> {
        self.file()?.with_reader(|r| {
            r.set_endian(endian);
            Ok(())
        })
    }

    // --- PRIMITIVES ---

    fn serialize<T: Primitive>(&mut self, _value: T, name: Option<&str>) -> Result<T> {
        self.ctx.ensure_open()?;
        let site = self.current_pointer();
        let value = self.read_value(T::KIND)?;
        self.log_field(site.as_ref(), T::KIND.name(), name, &value);
        T::from_value(value)
            .ok_or_else(|| BinrevError::Internal("primitive kind mismatch".into()))
    }

    fn serialize_nullable_u8(
        &mut self,
        _value: Option<u8>,
        name: Option<&str>,
    ) -> Result<Option<u8>> {
        self.ctx.ensure_open()?;
        let site = self.current_pointer();
        let raw = self.tracked(|r| r.read_u8())?;
        let out = (raw != 0xFF).then_some(raw);
        match out {
            Some(v) => self.log_field(site.as_ref(), "u8?", name, &v),
            None => self.log_field(site.as_ref(), "u8?", name, &"null"),
        }
        Ok(out)
    }

    fn serialize_checksum<T: Primitive>(&mut self, expected: T, name: Option<&str>) -> Result<T> {
        self.ctx.ensure_open()?;
        let site = self.current_pointer();
        let value = self.read_value(T::KIND)?;
        self.log_field(site.as_ref(), T::KIND.name(), name.or(Some("checksum")), &value);
        let value = T::from_value(value)
            .ok_or_else(|| BinrevError::Internal("primitive kind mismatch".into()))?;
        if value != expected {
            self.warn(&format!(
                "Checksum mismatch at {}: expected {expected:?}, got {value:?}",
                display_site(site.as_ref())
            ));
        }
        Ok(value)
    }

    fn serialize_bytes(
        &mut self,
        _value: Vec<u8>,
        count: u64,
        name: Option<&str>,
    ) -> Result<Vec<u8>> {
        self.ctx.ensure_open()?;
        let site = self.current_pointer();
        let out = self.tracked(|r| r.read_bytes(count as usize))?;
        self.log_field(site.as_ref(), "bytes", name, &format_args!("[{count}]"));
        Ok(out)
    }

    fn serialize_string(
        &mut self,
        _value: &str,
        length: Option<u64>,
        encoding: Option<&'static encoding_rs::Encoding>,
        name: Option<&str>,
    ) -> Result<String> {
        self.ctx.ensure_open()?;
        let encoding = encoding.unwrap_or(self.ctx.settings().default_encoding);
        let site = self.current_pointer();
        let out = match length {
            Some(len) => self.tracked(|r| r.read_fixed_string(len as usize, encoding))?,
            None => self.tracked(|r| r.read_null_terminated_string(encoding))?,
        };
        self.log_field(site.as_ref(), "string", name, &format_args!("{out:?}"));
        Ok(out)
    }

    // --- OBJECTS ---

    fn serialize_object_with<T: Serializable>(
        &mut self,
        _value: Option<Obj<T>>,
        on_pre_serialize: Option<&dyn Fn(&mut T)>,
        name: Option<&str>,
    ) -> Result<Obj<T>> {
        self.ctx.ensure_open()?;
        let pointer = self
            .current_pointer()
            .ok_or_else(|| BinrevError::Internal("no active file for object".into()))?;
        let file = pointer.file().clone();

        // Cache hit: skip the bytes, hand back the shared instance.
        if !file.ignore_cache_on_read()
            && let Some((cached, size)) = self.ctx.cached_object::<T>(&pointer)
        {
            self.skip(size)?;
            self.log_field(
                Some(&pointer),
                short_type_name::<T>(),
                name,
                &"(from cache)",
            );
            return Ok(cached);
        }

        let instance = obj(T::default());
        instance.borrow_mut().init(&pointer);
        // Inserted before the body runs so cyclic back-references resolve to
        // this (partially initialized) instance instead of recursing.
        self.ctx.cache_object(&pointer, instance.clone());
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
        self.ctx
            .set_cached_size(&pointer, end.saturating_sub(pointer.absolute()));

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
        _value: Option<&Pointer>,
        args: PointerArgs<'_>,
        name: Option<&str>,
    ) -> Result<Option<Pointer>> {
        self.ctx.ensure_open()?;
        let file = self.file()?;
        let site = self.current_pointer();
        let field_offset = self.position()?;
        let size = match args.size {
            Some(s) => s,
            None => file.pointer_size(&self.ctx)?,
        };
        let raw = match size {
            PointerSize::U32 => u64::from(self.tracked(|r| r.read_u32())?),
            PointerSize::U64 => self.tracked(|r| r.read_u64())?,
        };

        if let Some(replacement) = file.override_pointer(field_offset) {
            self.log_field(site.as_ref(), "ptr", name, &format_args!("{replacement} (override)"));
            return Ok(Some(replacement));
        }
        if raw == 0 {
            self.log_field(site.as_ref(), "ptr", name, &"null");
            return Ok(None);
        }

        match BinaryFile::resolve_pointer(&file, &self.ctx, raw, args.anchor)? {
            Some(target_file) => {
                let anchor_abs = args.anchor.map(|a| a.absolute()).unwrap_or(0);
                let mut pointer = Pointer::new(raw.wrapping_add(anchor_abs), target_file);
                if let Some(anchor) = args.anchor {
                    pointer = pointer.with_anchor(anchor.clone());
                }
                if file.save_pointers_to_memory_map() {
                    self.ctx.record_pointer(pointer.clone());
                }
                self.log_field(site.as_ref(), "ptr", name, &pointer);
                Ok(Some(pointer))
            }
            None => {
                if args.allow_invalid || file.allow_invalid_pointer(raw, args.anchor) {
                    self.warn(&format!(
                        "Unresolved pointer 0x{raw:X} at {} taken as null",
                        display_site(site.as_ref())
                    ));
                    self.log_field(site.as_ref(), "ptr", name, &"null (invalid)");
                    Ok(None)
                } else {
                    Err(BinrevError::InvalidPointer {
                        value: raw,
                        site: display_site(site.as_ref()),
                    })
                }
            }
        }
    }

    fn serialize_typed_pointer_with<T: Serializable>(
        &mut self,
        _value: TypedPointer<T>,
        args: PointerArgs<'_>,
        resolve: bool,
        on_pre_serialize: Option<&dyn Fn(&mut T)>,
        name: Option<&str>,
    ) -> Result<TypedPointer<T>> {
        let pointer = self.serialize_pointer(None, args, name)?;
        let mut out = TypedPointer::new(pointer);
        if resolve && let Some(target) = out.pointer.clone() {
            out.value = self.do_at(Some(&target), |s| {
                s.serialize_object_with(None, on_pre_serialize, name)
            })?;
        }
        Ok(out)
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
        let value = self.read_value(T::KIND)?;
        self.log_field(site.as_ref(), T::KIND.name(), Some("bit values"), &value);
        let bits = value
            .to_bits()
            .ok_or_else(|| BinrevError::Internal("integer kind without bits".into()))?;
        let mut cursor = BitValueSerializer::for_read(bits, width);
        f(&mut cursor)
    }

    // --- SCOPES ---

    fn do_endian<R>(
        &mut self,
        endian: Endian,
        body: impl FnOnce(&mut Self) -> Result<R>,
    ) -> Result<R> {
        let file = self.file()?;
        let previous = file.with_reader(|r| {
            let prev = r.endian();
            r.set_endian(endian);
            Ok(prev)
        })?;
        let result = body(self);
        let restored = file.with_reader(|r| {
            r.set_endian(previous);
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

        // Decoding consumes the encoded block, so the outer cursor already
        // sits past it; do_at below saves exactly that position.
        let decoded = self.tracked(|r| r.decode_block(encoder))?;
        let decoded_len = decoded.len() as u64;

        let key = match args.key {
            Some(k) => k.to_string(),
            None => format!(
                "{}_0x{:X}_{}",
                outer_file.name(),
                outer_ptr.file_offset(),
                encoder.name()
            ),
        };
        let mut stream_file = BinaryFile::stream(key, decoded)
            .with_endian(args.endian.unwrap_or(outer_file.endian()));
        if args.allow_local_pointers {
            stream_file = stream_file.with_local_pointers();
        }
        let stream_file = self.ctx.add_file(stream_file)?;
        let start = BinaryFile::start_pointer(&stream_file);

        let sf = stream_file.clone();
        let result = self.do_at(Some(&start), move |s| {
            let out = body(s)?;
            let consumed = s.position()?;
            if consumed < decoded_len {
                s.warn(&format!(
                    "Under-consumed encoded block {}: {consumed} of {decoded_len} bytes",
                    sf.name()
                ));
            }
            Ok(out)
        });
        let removed = self.ctx.remove_file(&stream_file);
        let out = result?;
        removed?;
        out.ok_or_else(|| BinrevError::Internal("encoded scope returned no value".into()))
    }

    // --- FILTERS ---

    fn begin_xor(&mut self, calc: Box<dyn XorCalculator>) -> Result<()> {
        self.file()?.with_reader(|r| {
            r.begin_xor(calc);
            Ok(())
        })
    }

    fn end_xor(&mut self) -> Result<()> {
        self.file()?.with_reader(|r| r.end_xor())
    }

    fn begin_checksum(&mut self, calc: Box<dyn ChecksumCalculator>) -> Result<()> {
        self.file()?.with_reader(|r| {
            r.begin_checksum(calc);
            Ok(())
        })
    }

    fn end_checksum(&mut self) -> Result<u64> {
        self.file()?.with_reader(|r| r.end_checksum())
    }

    // --- DIAGNOSTICS ---

    fn log(&mut self, msg: &str) {
        if self.log_allowed() {
            let site = self.current_pointer();
            self.emit(site.as_ref(), msg);
        }
    }
}
