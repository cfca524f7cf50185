#![allow(missing_docs)]

//! Context lifecycle, registry invariants, coverage tracking, scope
//! restoration, and the transcript contract.

use std::rc::Rc;

use binrev::{
    BinaryDeserializer, BinaryFile, CollectingLogger, Context, ContextSettings, Endian,
    LocalFileManager, Region, Serializable, SerializerObject,
};

fn collecting_ctx(log: bool) -> (Rc<Context>, CollectingLogger) {
    let logger = CollectingLogger::new();
    let settings = ContextSettings {
        log,
        ..ContextSettings::default()
    };
    let ctx = Rc::new(Context::with_parts(
        ".",
        settings,
        Box::new(LocalFileManager),
        Box::new(logger.clone()),
    ));
    (ctx, logger)
}

// --- REGISTRY ---

#[test]
fn duplicate_keys_are_rejected() -> binrev::Result<()> {
    let ctx = Context::new(".");
    ctx.add_file(BinaryFile::stream("a.bin", vec![0]))?;
    assert!(matches!(
        ctx.add_file(BinaryFile::stream("a.bin", vec![1])),
        Err(binrev::BinrevError::DuplicateFile(_))
    ));
    // Aliases occupy keys too.
    ctx.add_file(BinaryFile::stream("b.bin", vec![0]).with_alias("rom"))?;
    assert!(matches!(
        ctx.add_file(BinaryFile::stream("rom", vec![0])),
        Err(binrev::BinrevError::DuplicateFile(_))
    ));
    Ok(())
}

#[test]
fn lookup_by_name_alias_and_normalized_path() -> binrev::Result<()> {
    let ctx = Context::new(".");
    let file = ctx.add_file(BinaryFile::stream("data/level.bin", vec![0]).with_alias("level"))?;
    assert_eq!(ctx.get_file("data/level.bin")?.id(), file.id());
    assert_eq!(ctx.get_file("level")?.id(), file.id());
    assert_eq!(ctx.get_file("data\\level.bin")?.id(), file.id());
    assert_eq!(ctx.get_file("./data/level.bin")?.id(), file.id());
    assert!(matches!(
        ctx.get_file("missing.bin"),
        Err(binrev::BinrevError::UnknownFile(_))
    ));
    Ok(())
}

#[test]
fn operations_after_close_are_disposed() -> binrev::Result<()> {
    let ctx = Rc::new(Context::new("."));
    ctx.add_file(BinaryFile::stream("mem", vec![1, 2, 3, 4]))?;
    let start = ctx.start_pointer("mem")?;
    let mut s = BinaryDeserializer::new(ctx.clone());
    s.goto(Some(&start))?;
    ctx.close()?;
    ctx.close()?; // idempotent

    assert!(matches!(
        s.serialize(0u8, None),
        Err(binrev::BinrevError::Disposed)
    ));
    assert!(matches!(
        ctx.add_file(BinaryFile::stream("other", vec![])),
        Err(binrev::BinrevError::Disposed)
    ));
    Ok(())
}

// --- COVERAGE ---

/// The read map counts distinct bytes, survives re-reads, and exports the
/// 0xFF/0x00 image.
#[test]
fn read_map_tracks_distinct_bytes() -> binrev::Result<()> {
    let ctx = Rc::new(Context::new("."));
    let file = ctx.add_file(BinaryFile::stream("mem", vec![0u8; 16]).with_read_map())?;
    let start = ctx.start_pointer("mem")?;

    let mut s = BinaryDeserializer::new(ctx.clone());
    s.goto(Some(&start))?;
    s.serialize(0u32, None)?;
    s.goto(Some(&(&start + 8)))?;
    s.serialize(0u16, None)?;
    // Re-reading counts once.
    s.goto(Some(&start))?;
    s.serialize(0u32, None)?;

    assert_eq!(file.read_coverage(), Some((6, 16)));

    let mut image = Vec::new();
    file.export_read_map(&mut image)?;
    let mut expected = vec![0u8; 16];
    expected[0..4].fill(0xFF);
    expected[8..10].fill(0xFF);
    assert_eq!(image, expected);
    Ok(())
}

// --- SCOPE RESTORATION ---

#[test]
fn do_at_restores_position_and_file() -> binrev::Result<()> {
    let ctx = Rc::new(Context::new("."));
    ctx.add_file(BinaryFile::stream("a", vec![0u8; 8]))?;
    ctx.add_file(BinaryFile::stream("b", vec![0u8; 8]))?;
    let a = ctx.start_pointer("a")?;
    let b = ctx.start_pointer("b")?;

    let mut s = BinaryDeserializer::new(ctx.clone());
    s.goto(Some(&(&a + 3)))?;

    let touched = s.do_at(Some(&(&b + 5)), |s| {
        assert_eq!(s.current_file().map(|f| f.name().to_string()), Some("b".into()));
        assert_eq!(s.position()?, 5);
        s.serialize(0u8, None)
    })?;
    assert!(touched.is_some());

    assert_eq!(s.current_file().map(|f| f.name().to_string()), Some("a".into()));
    assert_eq!(s.position()?, 3);

    // A null target skips the body entirely.
    let skipped: Option<u8> = s.do_at(None, |_| unreachable!("body must not run"))?;
    assert!(skipped.is_none());
    Ok(())
}

#[test]
fn do_endian_restores_on_error() -> binrev::Result<()> {
    let ctx = Rc::new(Context::new("."));
    ctx.add_file(BinaryFile::stream("mem", vec![0u8; 4]))?;
    let mut s = BinaryDeserializer::new(ctx.clone());
    s.goto(Some(&ctx.start_pointer("mem")?))?;
    assert_eq!(s.endian()?, Endian::Little);

    let result: binrev::Result<()> = s.do_endian(Endian::Big, |s| {
        assert_eq!(s.endian()?, Endian::Big);
        Err(binrev::BinrevError::Internal("boom".into()))
    });
    assert!(result.is_err());
    assert_eq!(s.endian()?, Endian::Little);
    Ok(())
}

// --- TRANSCRIPT ---

#[derive(Default)]
struct Vec2 {
    x: i16,
    y: i16,
}

impl Serializable for Vec2 {
    fn serialize<S: SerializerObject>(&mut self, s: &mut S) -> binrev::Result<()> {
        self.x = s.serialize(self.x, Some("x"))?;
        self.y = s.serialize(self.y, Some("y"))?;
        Ok(())
    }

    fn is_short_log(&self) -> bool {
        true
    }

    fn short_log(&self) -> String {
        format!("({}, {})", self.x, self.y)
    }
}

#[derive(Default)]
struct Header {
    magic: u32,
    origin: Vec2,
}

impl Serializable for Header {
    fn serialize<S: SerializerObject>(&mut self, s: &mut S) -> binrev::Result<()> {
        self.magic = s.serialize(self.magic, Some("magic"))?;
        self.origin = {
            let origin = s.serialize_object::<Vec2>(None, Some("origin"))?;
            let o = origin.borrow();
            Vec2 { x: o.x, y: o.y }
        };
        Ok(())
    }
}

/// One line per field, role + pointer + indent; short-log objects collapse
/// to a single summary line.
#[test]
fn transcript_lines_follow_the_contract() -> binrev::Result<()> {
    let (ctx, logger) = collecting_ctx(true);
    let mut bytes = vec![0u8; 8];
    bytes[0..4].copy_from_slice(&0x1234u32.to_le_bytes());
    bytes[4..6].copy_from_slice(&3i16.to_le_bytes());
    bytes[6..8].copy_from_slice(&(-4i16).to_le_bytes());
    ctx.add_file(BinaryFile::stream("mem", bytes))?;

    binrev::read_file::<Header>(&ctx, "mem")?;

    let lines = logger.lines();
    let lines = lines.borrow();
    assert!(lines.iter().all(|l| l.starts_with("(READ) mem|")));
    assert!(lines.iter().any(|l| l.contains("(u32) magic: 0x1234")));
    // The nested field line is indented one level deeper than the header's.
    assert!(lines.iter().any(|l| l.contains("  (u32) magic")));
    // Vec2 is short-logged: a single summary line, no x/y field lines.
    assert!(lines.iter().any(|l| l.contains("(Vec2) origin: (3, -4)")));
    assert!(!lines.iter().any(|l| l.contains("(i16) x")));
    Ok(())
}

#[test]
fn labels_decorate_transcript_lines() -> binrev::Result<()> {
    let (ctx, logger) = collecting_ctx(true);
    let file = ctx.add_file(BinaryFile::stream("mem", vec![7, 0, 0, 0]))?;
    file.add_label(0, "entry_count");

    let mut s = BinaryDeserializer::new(ctx.clone());
    s.goto(Some(&ctx.start_pointer("mem")?))?;
    s.serialize(0u32, Some("count"))?;

    let lines = logger.lines();
    let lines = lines.borrow();
    assert!(lines.iter().any(|l| l.contains("// entry_count")));
    Ok(())
}

// --- REGIONS ---

#[test]
fn regions_are_binary_searchable() {
    let file = BinaryFile::stream("mem", vec![0u8; 0x100]);
    file.add_region(Region::new("header", 0, 0x10));
    file.add_region(Region::new("palette", 0x40, 0x20));
    file.add_region(Region::new("tiles", 0x60, 0x80));

    assert_eq!(file.region_at(0x00).map(|r| r.name().to_string()), Some("header".into()));
    assert_eq!(file.region_at(0x0F).map(|r| r.name().to_string()), Some("header".into()));
    assert_eq!(file.region_at(0x10), None);
    assert_eq!(file.region_at(0x45).map(|r| r.name().to_string()), Some("palette".into()));
    assert_eq!(file.region_at(0x60).map(|r| r.name().to_string()), Some("tiles".into()));
    assert_eq!(file.region_at(0xDF).map(|r| r.name().to_string()), Some("tiles".into()));
    assert_eq!(file.region_at(0xE0), None);
}

#[test]
fn normalize_path_canonicalizes_separators() {
    assert_eq!(Context::normalize_path("a\\b\\c.bin"), "a/b/c.bin");
    assert_eq!(Context::normalize_path("./a/b.bin"), "a/b.bin");
    assert_eq!(Context::normalize_path("plain.bin"), "plain.bin");
}
