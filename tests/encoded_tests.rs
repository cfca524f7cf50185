#![allow(missing_docs)]

//! Encoded blocks and encoded files: decode-on-open, scratch-stream writes,
//! re-encode on commit, under-consumption warnings.

use std::rc::Rc;

use binrev::{
    BinaryDeserializer, BinaryFile, BinarySerializer, CollectingLogger, Context, ContextSettings,
    Encoder, EncodedArgs, LocalFileManager, SerializerObject, XorEncoder,
};
#[cfg(feature = "lz4")]
use binrev::Lz4Encoder;

fn collecting_ctx(base: &std::path::Path) -> (Rc<Context>, CollectingLogger) {
    let logger = CollectingLogger::new();
    let ctx = Rc::new(Context::with_parts(
        base,
        ContextSettings::default(),
        Box::new(LocalFileManager),
        Box::new(logger.clone()),
    ));
    (ctx, logger)
}

/// A body that consumes fewer bytes than the block decoded warns, and the
/// outer cursor still ends up past the encoded block.
#[cfg(feature = "lz4")]
#[test]
fn under_consumed_encoded_block_warns() -> binrev::Result<()> {
    let logical: Vec<u8> = (0u8..32).collect();
    let encoded = Lz4Encoder.encode(&logical)?;
    let encoded_len = encoded.len() as u64;

    let (ctx, logger) = collecting_ctx(std::path::Path::new("."));
    ctx.add_file(BinaryFile::stream("mem", encoded))?;

    let mut s = BinaryDeserializer::new(ctx.clone());
    s.goto(Some(&ctx.start_pointer("mem")?))?;
    let head = s.do_encoded(&Lz4Encoder, EncodedArgs::default(), |s| {
        s.serialize_bytes(Vec::new(), 30, Some("head"))
    })?;
    assert_eq!(head, (0u8..30).collect::<Vec<u8>>());

    assert_eq!(s.position()?, encoded_len);
    let warnings = logger.warnings();
    let warnings = warnings.borrow();
    assert_eq!(warnings.len(), 1);
    assert!(warnings[0].contains("Under-consumed encoded block"));
    Ok(())
}

/// Write path: the body fills a scratch stream, the scope splices the
/// re-encoded image, and the read path decodes it back.
#[cfg(feature = "lz4")]
#[test]
fn encoded_scope_roundtrips() -> binrev::Result<()> {
    let ctx = Rc::new(Context::new("."));
    ctx.add_file(BinaryFile::stream("mem", Vec::new()))?;
    let start = ctx.start_pointer("mem")?;

    let mut w = BinarySerializer::new(ctx.clone());
    w.goto(Some(&start))?;
    w.serialize(0xBEEF_u16, Some("tag"))?;
    w.do_encoded(&Lz4Encoder, EncodedArgs::default(), |s| {
        for i in 0u8..32 {
            s.serialize(i.wrapping_mul(3), None)?;
        }
        Ok(())
    })?;

    let mut r = BinaryDeserializer::new(ctx.clone());
    r.goto(Some(&start))?;
    assert_eq!(r.serialize(0u16, Some("tag"))?, 0xBEEF);
    let data = r.do_encoded(&Lz4Encoder, EncodedArgs::default(), |s| {
        s.serialize_bytes(Vec::new(), 32, None)
    })?;
    let expected: Vec<u8> = (0u8..32).map(|i| i.wrapping_mul(3)).collect();
    assert_eq!(data, expected);
    Ok(())
}

/// Whole-stream XOR as the block transform.
#[test]
fn xor_encoded_scope_roundtrips() -> binrev::Result<()> {
    let encoder = XorEncoder::new(0x3C);
    let encoded = encoder.encode(&[10, 20, 30, 40])?;

    let ctx = Rc::new(Context::new("."));
    ctx.add_file(BinaryFile::stream("mem", encoded))?;

    let mut s = BinaryDeserializer::new(ctx.clone());
    s.goto(Some(&ctx.start_pointer("mem")?))?;
    let data = s.do_encoded(&encoder, EncodedArgs::default(), |s| {
        s.serialize_bytes(Vec::new(), 4, None)
    })?;
    assert_eq!(data, vec![10, 20, 30, 40]);
    Ok(())
}

/// The transient stream file is registered for the scope and gone after.
#[test]
fn encoded_scope_stream_file_is_transient() -> binrev::Result<()> {
    let encoder = XorEncoder::new(0x01);
    let encoded = encoder.encode(&[1, 2, 3, 4])?;

    let ctx = Rc::new(Context::new("."));
    ctx.add_file(BinaryFile::stream("mem", encoded))?;

    let mut s = BinaryDeserializer::new(ctx.clone());
    s.goto(Some(&ctx.start_pointer("mem")?))?;
    let key = s.do_encoded(
        &encoder,
        EncodedArgs {
            key: Some("mem_block"),
            ..EncodedArgs::default()
        },
        |s| {
            assert!(s.context().get_file("mem_block").is_ok());
            s.serialize_bytes(Vec::new(), 4, None)?;
            Ok(s.current_file().map(|f| f.name().to_string()))
        },
    )?;
    assert_eq!(key.as_deref(), Some("mem_block"));
    assert!(matches!(
        ctx.get_file("mem_block"),
        Err(binrev::BinrevError::UnknownFile(_))
    ));
    Ok(())
}

/// An encoded physical file exposes logical bytes to readers and re-encodes
/// the whole image on commit.
#[test]
fn encoded_file_commits_the_encoded_image() -> binrev::Result<()> {
    let dir = tempfile::tempdir()?;

    {
        let ctx = Rc::new(Context::new(dir.path()));
        let file = ctx.add_file(BinaryFile::encoded(
            "save.dat",
            Box::new(XorEncoder::new(0x55)),
        ))?;
        let mut w = BinarySerializer::new(ctx.clone());
        w.goto(Some(&BinaryFile::start_pointer(&file)))?;
        w.serialize(0x1122_3344u32, Some("header"))?;
        w.serialize_string("sav", None, None, Some("tag"))?;
        ctx.close()?;
    }

    // On disk: the XORed image, not the logical bytes.
    let raw = std::fs::read(dir.path().join("save.dat"))?;
    assert_eq!(raw.len(), 8);
    assert_eq!(raw[0], 0x44 ^ 0x55);

    let ctx = Rc::new(Context::new(dir.path()));
    let file = ctx.add_file(BinaryFile::encoded(
        "save.dat",
        Box::new(XorEncoder::new(0x55)),
    ))?;
    let mut r = BinaryDeserializer::new(ctx.clone());
    r.goto(Some(&BinaryFile::start_pointer(&file)))?;
    assert_eq!(r.serialize(0u32, Some("header"))?, 0x1122_3344);
    assert_eq!(r.serialize_string("", None, None, Some("tag"))?, "sav");
    assert_eq!(file.length(&ctx)?, 8);
    Ok(())
}

/// Pointers parsed inside a local-pointer block resolve against the block.
#[test]
fn local_pointers_inside_an_encoded_block() -> binrev::Result<()> {
    let mut logical = vec![0u8; 0x10];
    logical[0..4].copy_from_slice(&8u32.to_le_bytes());
    logical[8] = 0x99;
    let encoder = XorEncoder::new(0xA5);
    let encoded = encoder.encode(&logical)?;

    let ctx = Rc::new(Context::new("."));
    ctx.add_file(BinaryFile::stream("mem", encoded))?;

    let mut s = BinaryDeserializer::new(ctx.clone());
    s.goto(Some(&ctx.start_pointer("mem")?))?;
    let args = EncodedArgs {
        allow_local_pointers: true,
        ..EncodedArgs::default()
    };
    let value = s.do_encoded(&encoder, args, |s| {
        let p = s
            .serialize_pointer(None, binrev::PointerArgs::default(), Some("entry"))?
            .expect("local pointer should resolve");
        let value = s.do_at_required(&p, |s| s.serialize(0u8, Some("value")))?;
        s.serialize_bytes(Vec::new(), 12, None)?;
        Ok(value)
    })?;
    assert_eq!(value, 0x99);
    Ok(())
}
