#![allow(missing_docs)]

//! Primitive round-trips: every width, both endiannesses, strings, filters,
//! bit fields, checksums.

use std::rc::Rc;

use binrev::{
    BinaryDeserializer, BinaryFile, BinarySerializer, Checksum8, CollectingLogger, Context,
    ContextSettings, Endian, LocalFileManager, SerializerObject, Xor8,
};

fn memory_ctx(bytes: Vec<u8>) -> binrev::Result<(Rc<Context>, CollectingLogger)> {
    let logger = CollectingLogger::new();
    let ctx = Rc::new(Context::with_parts(
        ".",
        ContextSettings::default(),
        Box::new(LocalFileManager),
        Box::new(logger.clone()),
    ));
    ctx.add_file(BinaryFile::stream("mem", bytes))?;
    Ok((ctx, logger))
}

/// Mixed-width write sequence read back verbatim; on-disk length is the sum
/// of the field widths.
#[test]
fn mixed_primitives_roundtrip_on_disk() -> binrev::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("out.bin");

    {
        let ctx = Rc::new(Context::new(dir.path()));
        let file = ctx.add_file(BinaryFile::linear("out.bin"))?;
        let mut s = BinarySerializer::new(ctx.clone());
        s.goto(Some(&BinaryFile::start_pointer(&file)))?;

        s.serialize(0x01u8, Some("a"))?;
        s.serialize(0x0203u16, Some("b"))?;
        s.do_endian(Endian::Big, |s| s.serialize(0x0405_0607u32, Some("c")))?;
        s.serialize_string("hi", None, None, Some("d"))?;
        ctx.close()?;
    }

    assert_eq!(std::fs::metadata(&path)?.len(), 1 + 2 + 4 + 3);

    let ctx = Rc::new(Context::new(dir.path()));
    let file = ctx.add_file(BinaryFile::linear("out.bin"))?;
    let mut s = BinaryDeserializer::new(ctx.clone());
    s.goto(Some(&BinaryFile::start_pointer(&file)))?;

    assert_eq!(s.serialize(0u8, Some("a"))?, 0x01);
    assert_eq!(s.serialize(0u16, Some("b"))?, 0x0203);
    assert_eq!(
        s.do_endian(Endian::Big, |s| s.serialize(0u32, Some("c")))?,
        0x0405_0607
    );
    assert_eq!(s.serialize_string("", None, None, Some("d"))?, "hi");
    Ok(())
}

#[test]
fn every_width_roundtrips_big_endian() -> binrev::Result<()> {
    let (ctx, _) = memory_ctx(Vec::new())?;
    let file = ctx.get_file("mem")?;
    let start = BinaryFile::start_pointer(&file);

    let mut w = BinarySerializer::new(ctx.clone());
    w.goto(Some(&start))?;
    w.set_endian(Endian::Big)?;
    w.serialize(-5i8, None)?;
    w.serialize(-1234i16, None)?;
    w.serialize(binrev::U24(0x00AB_CDEF), None)?;
    w.serialize(binrev::I24(-1), None)?;
    w.serialize(-7i32, None)?;
    w.serialize(0x1122_3344_5566_7788u64, None)?;
    w.serialize(-9i64, None)?;
    w.serialize(1.5f32, None)?;
    w.serialize(-2.25f64, None)?;
    w.serialize(true, None)?;

    let mut r = BinaryDeserializer::new(ctx.clone());
    r.goto(Some(&start))?;
    r.set_endian(Endian::Big)?;
    assert_eq!(r.serialize(0i8, None)?, -5);
    assert_eq!(r.serialize(0i16, None)?, -1234);
    assert_eq!(r.serialize(binrev::U24(0), None)?, binrev::U24(0x00AB_CDEF));
    assert_eq!(r.serialize(binrev::I24(0), None)?, binrev::I24(-1));
    assert_eq!(r.serialize(0i32, None)?, -7);
    assert_eq!(r.serialize(0u64, None)?, 0x1122_3344_5566_7788);
    assert_eq!(r.serialize(0i64, None)?, -9);
    assert_eq!(r.serialize(0.0f32, None)?, 1.5);
    assert_eq!(r.serialize(0.0f64, None)?, -2.25);
    assert!(r.serialize(false, None)?);
    Ok(())
}

/// Raw file bytes are the XORed image; reading through the same filter
/// recovers the logical values.
#[test]
fn xor_scope_obfuscates_raw_bytes() -> binrev::Result<()> {
    let dir = tempfile::tempdir()?;

    {
        let ctx = Rc::new(Context::new(dir.path()));
        let file = ctx.add_file(BinaryFile::linear("enc.bin"))?;
        let mut s = BinarySerializer::new(ctx.clone());
        s.goto(Some(&BinaryFile::start_pointer(&file)))?;
        s.begin_xor(Box::new(Xor8::new(0x5A)))?;
        s.serialize_bytes(vec![0, 1, 2], 3, None)?;
        s.end_xor()?;
        ctx.close()?;
    }

    assert_eq!(std::fs::read(dir.path().join("enc.bin"))?, [0x5A, 0x5B, 0x58]);

    let ctx = Rc::new(Context::new(dir.path()));
    let file = ctx.add_file(BinaryFile::linear("enc.bin"))?;
    let mut s = BinaryDeserializer::new(ctx.clone());
    s.goto(Some(&BinaryFile::start_pointer(&file)))?;
    s.begin_xor(Box::new(Xor8::new(0x5A)))?;
    assert_eq!(s.serialize_bytes(Vec::new(), 3, None)?, vec![0, 1, 2]);
    s.end_xor()?;
    Ok(())
}

/// The checksum tap observes logical bytes on both sides of an XOR filter.
#[test]
fn checksum_tap_sees_decrypted_stream() -> binrev::Result<()> {
    let (ctx, logger) = memory_ctx(Vec::new())?;
    let file = ctx.get_file("mem")?;
    let start = BinaryFile::start_pointer(&file);

    let mut w = BinarySerializer::new(ctx.clone());
    w.goto(Some(&start))?;
    w.begin_checksum(Box::new(Checksum8::new()))?;
    w.begin_xor(Box::new(Xor8::new(0x77)))?;
    w.serialize_bytes(vec![1, 2, 3, 4], 4, None)?;
    w.end_xor()?;
    let written_sum = w.end_checksum()?;
    assert_eq!(written_sum, 10);
    w.serialize_checksum(written_sum as u8, Some("sum"))?;

    let mut r = BinaryDeserializer::new(ctx.clone());
    r.goto(Some(&start))?;
    r.begin_checksum(Box::new(Checksum8::new()))?;
    r.begin_xor(Box::new(Xor8::new(0x77)))?;
    assert_eq!(r.serialize_bytes(Vec::new(), 4, None)?, vec![1, 2, 3, 4]);
    r.end_xor()?;
    let read_sum = r.end_checksum()?;
    assert_eq!(read_sum, 10);

    r.serialize_checksum(read_sum as u8, Some("sum"))?;
    assert!(logger.warnings().borrow().is_empty());
    Ok(())
}

#[test]
fn checksum_mismatch_warns_and_returns_stored_value() -> binrev::Result<()> {
    let (ctx, logger) = memory_ctx(vec![0x2A])?;
    let mut r = BinaryDeserializer::new(ctx.clone());
    r.goto(Some(&ctx.start_pointer("mem")?))?;
    let stored = r.serialize_checksum(0x99u8, Some("sum"))?;
    assert_eq!(stored, 0x2A);
    let warnings = logger.warnings();
    let warnings = warnings.borrow();
    assert_eq!(warnings.len(), 1);
    assert!(warnings[0].contains("Checksum mismatch"));
    Ok(())
}

/// Bytes outside {0, 1} decode as true with a warning.
#[test]
fn malformed_bool_warns() -> binrev::Result<()> {
    let (ctx, logger) = memory_ctx(vec![0x02, 0x00, 0x01])?;
    let mut r = BinaryDeserializer::new(ctx.clone());
    r.goto(Some(&ctx.start_pointer("mem")?))?;
    assert!(r.serialize(false, Some("weird"))?);
    assert!(!r.serialize(false, None)?);
    assert!(r.serialize(false, None)?);
    let warnings = logger.warnings();
    let warnings = warnings.borrow();
    assert_eq!(warnings.len(), 1);
    assert!(warnings[0].contains("Malformed bool 0x02"));
    Ok(())
}

#[test]
fn nullable_byte_uses_ff_sentinel() -> binrev::Result<()> {
    let (ctx, _) = memory_ctx(Vec::new())?;
    let start = ctx.start_pointer("mem")?;

    let mut w = BinarySerializer::new(ctx.clone());
    w.goto(Some(&start))?;
    w.serialize_nullable_u8(Some(7), None)?;
    w.serialize_nullable_u8(None, None)?;

    let mut r = BinaryDeserializer::new(ctx.clone());
    r.goto(Some(&start))?;
    assert_eq!(r.serialize_nullable_u8(None, None)?, Some(7));
    assert_eq!(r.serialize_nullable_u8(None, None)?, None);
    Ok(())
}

#[test]
fn fixed_strings_pad_and_strip_nuls() -> binrev::Result<()> {
    let (ctx, _) = memory_ctx(Vec::new())?;
    let start = ctx.start_pointer("mem")?;

    let mut w = BinarySerializer::new(ctx.clone());
    w.goto(Some(&start))?;
    w.serialize_string("hi", Some(5), None, None)?;
    w.serialize(0xEEu8, None)?;

    let mut r = BinaryDeserializer::new(ctx.clone());
    r.goto(Some(&start))?;
    assert_eq!(r.serialize_string("", Some(5), None, None)?, "hi");
    assert_eq!(r.position()?, 5);
    assert_eq!(r.serialize(0u8, None)?, 0xEE);
    Ok(())
}

/// Writing widths [3, 5, 8] then reading the same decomposition returns the
/// inputs modulo their widths.
#[test]
fn bit_fields_pack_lsb_first() -> binrev::Result<()> {
    let (ctx, _) = memory_ctx(Vec::new())?;
    let start = ctx.start_pointer("mem")?;

    let mut w = BinarySerializer::new(ctx.clone());
    w.goto(Some(&start))?;
    w.serialize_bit_values::<u16, _>(|b| {
        b.bits(0b101, 3, Some("mode"))?;
        b.bits(0b10011, 5, Some("index"))?;
        b.bits(0xAB, 8, Some("id"))?;
        Ok(())
    })?;

    // 0xAB << 8 | 0b10011 << 3 | 0b101
    let mut r = BinaryDeserializer::new(ctx.clone());
    r.goto(Some(&start))?;
    assert_eq!(r.serialize(0u16, None)?, 0xAB00 | (0b10011 << 3) | 0b101);

    let mut r = BinaryDeserializer::new(ctx.clone());
    r.goto(Some(&start))?;
    r.serialize_bit_values::<u16, _>(|b| {
        assert_eq!(b.bits(0, 3, Some("mode"))?, 0b101);
        assert_eq!(b.bits(0, 5, Some("index"))?, 0b10011);
        assert_eq!(b.bits(0, 8, Some("id"))?, 0xAB);
        Ok(())
    })?;
    Ok(())
}

#[test]
fn bit_fields_reject_overflowing_widths() -> binrev::Result<()> {
    let (ctx, _) = memory_ctx(vec![0, 0])?;
    let mut r = BinaryDeserializer::new(ctx.clone());
    r.goto(Some(&ctx.start_pointer("mem")?))?;
    let result = r.serialize_bit_values::<u8, _>(|b| {
        b.bits(0, 6, None)?;
        b.bits(0, 3, None)?;
        Ok(())
    });
    assert!(matches!(result, Err(binrev::BinrevError::Unsupported(_))));
    Ok(())
}

#[test]
fn reading_past_the_end_is_end_of_input() -> binrev::Result<()> {
    let (ctx, _) = memory_ctx(vec![1, 2])?;
    let mut r = BinaryDeserializer::new(ctx.clone());
    r.goto(Some(&ctx.start_pointer("mem")?))?;
    assert!(matches!(
        r.serialize(0u32, None),
        Err(binrev::BinrevError::EndOfInput { .. })
    ));
    Ok(())
}
