//! Byte-level write primitives, mirroring [`Reader`](crate::reader::Reader).
//!
//! The filter chain runs in reverse on this side: the checksum tap sees the
//! logical bytes first, then the XOR filter obfuscates, then the raw bytes
//! hit the stream. That keeps a checksum computed while writing equal to the
//! one computed while reading the same range back.

use crate::endian::{self, Endian};
use crate::error::{BinrevError, Result};
use crate::filters::{ChecksumCalculator, XorCalculator};
use crate::io::OutputStream;
use std::io::{Seek, SeekFrom, Write};

/// Endian-aware, filterable writer over a seekable stream.
pub struct Writer {
    stream: Box<dyn OutputStream>,
    pos: u64,
    length: u64,
    endian: Endian,
    xor: Option<Box<dyn XorCalculator>>,
    xor_stack: Vec<Option<Box<dyn XorCalculator>>>,
    checksum: Option<Box<dyn ChecksumCalculator>>,
    checksum_stack: Vec<Option<Box<dyn ChecksumCalculator>>>,
}

impl std::fmt::Debug for Writer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Writer")
            .field("pos", &self.pos)
            .field("length", &self.length)
            .field("endian", &self.endian)
            .finish_non_exhaustive()
    }
}

impl Writer {
    /// Wraps a stream, measuring the existing length up front (nonzero when
    /// patching a file in place).
    pub fn new(mut stream: Box<dyn OutputStream>, endian: Endian) -> Result<Self> {
        let length = stream.seek(SeekFrom::End(0))?;
        stream.seek(SeekFrom::Start(0))?;
        Ok(Self {
            stream,
            pos: 0,
            length,
            endian,
            xor: None,
            xor_stack: Vec::new(),
            checksum: None,
            checksum_stack: Vec::new(),
        })
    }

    /// Current stream position.
    pub fn position(&self) -> u64 {
        self.pos
    }

    /// High-water length: the larger of the pre-existing stream length and
    /// the furthest byte written.
    pub fn length(&self) -> u64 {
        self.length
    }

    /// Seeks to an absolute position.
    pub fn set_position(&mut self, pos: u64) -> Result<()> {
        if pos != self.pos {
            self.stream.seek(SeekFrom::Start(pos))?;
            self.pos = pos;
        }
        Ok(())
    }

    /// Advances the position without writing.
    pub fn skip(&mut self, count: u64) -> Result<()> {
        self.set_position(self.pos + count)
    }

    /// Active endianness.
    pub fn endian(&self) -> Endian {
        self.endian
    }

    /// Switches endianness for subsequent multi-byte writes.
    pub fn set_endian(&mut self, endian: Endian) {
        self.endian = endian;
    }

    /// Flushes buffered bytes to the underlying stream.
    pub fn flush(&mut self) -> Result<()> {
        self.stream.flush()?;
        Ok(())
    }

    // --- FILTER SCOPES ---

    /// Installs an XOR filter, saving the previous one.
    pub fn begin_xor(&mut self, calc: Box<dyn XorCalculator>) {
        self.xor_stack.push(self.xor.take());
        self.xor = Some(calc);
    }

    /// Removes the active XOR filter and restores the previous one.
    pub fn end_xor(&mut self) -> Result<()> {
        if self.xor.is_none() {
            return Err(BinrevError::Internal("no active XOR filter".into()));
        }
        self.xor = self.xor_stack.pop().flatten();
        Ok(())
    }

    /// Installs a checksum tap, saving the previous one.
    pub fn begin_checksum(&mut self, calc: Box<dyn ChecksumCalculator>) {
        self.checksum_stack.push(self.checksum.take());
        self.checksum = Some(calc);
    }

    /// Finishes the active checksum and returns the accumulated value.
    pub fn end_checksum(&mut self) -> Result<u64> {
        let calc = self
            .checksum
            .take()
            .ok_or_else(|| BinrevError::Internal("no active checksum".into()))?;
        self.checksum = self.checksum_stack.pop().flatten();
        Ok(calc.value())
    }

    // --- RAW WRITES ---

    /// Writes a block through the filter chain (checksum tap on the logical
    /// bytes, then XOR, then the stream).
    pub fn write_bytes(&mut self, data: &[u8]) -> Result<()> {
        if let Some(checksum) = &mut self.checksum {
            checksum.process(data);
        }
        if let Some(xor) = &mut self.xor {
            let mut obfuscated = data.to_vec();
            for b in obfuscated.iter_mut() {
                *b = xor.process_byte(*b);
            }
            self.stream.write_all(&obfuscated)?;
        } else {
            self.stream.write_all(data)?;
        }
        self.pos += data.len() as u64;
        if self.pos > self.length {
            self.length = self.pos;
        }
        Ok(())
    }

    // --- PRIMITIVES ---

    /// Writes one byte.
    pub fn write_u8(&mut self, value: u8) -> Result<()> {
        self.write_bytes(&[value])
    }

    /// Writes one signed byte.
    pub fn write_i8(&mut self, value: i8) -> Result<()> {
        self.write_u8(value as u8)
    }

    // --- STRINGS ---

    /// Encodes and writes `value` followed by a NUL terminator.
    pub fn write_null_terminated_string(
        &mut self,
        value: &str,
        encoding: &'static encoding_rs::Encoding,
    ) -> Result<()> {
        let bytes = encode_text(value, encoding)?;
        self.write_bytes(&bytes)?;
        self.write_u8(0)
    }

    /// Encodes and writes `value` into exactly `length` bytes, truncating or
    /// NUL-padding as needed.
    pub fn write_fixed_string(
        &mut self,
        value: &str,
        length: usize,
        encoding: &'static encoding_rs::Encoding,
    ) -> Result<()> {
        let mut bytes = encode_text(value, encoding)?;
        bytes.resize(length, 0);
        self.write_bytes(&bytes)
    }
}

macro_rules! writer_primitives {
    ($($fn_name:ident / $endian_fn:ident => $t:ty : $len:expr),* $(,)?) => {
        impl Writer {
            $(
                /// Writes one value at the active endianness.
                pub fn $fn_name(&mut self, value: $t) -> Result<()> {
                    let mut buf = [0u8; $len];
                    endian::$endian_fn(self.endian, &mut buf, value);
                    self.write_bytes(&buf)
                }
            )*
        }
    };
}

writer_primitives!(
    write_u16 / write_u16 => u16 : 2,
    write_i16 / write_i16 => i16 : 2,
    write_u24 / write_u24 => u32 : 3,
    write_i24 / write_i24 => i32 : 3,
    write_u32 / write_u32 => u32 : 4,
    write_i32 / write_i32 => i32 : 4,
    write_u64 / write_u64 => u64 : 8,
    write_i64 / write_i64 => i64 : 8,
    write_f32 / write_f32 => f32 : 4,
    write_f64 / write_f64 => f64 : 8,
);

pub(crate) fn encode_text(
    value: &str,
    encoding: &'static encoding_rs::Encoding,
) -> Result<Vec<u8>> {
    let (bytes, _, had_errors) = encoding.encode(value);
    if had_errors {
        return Err(BinrevError::Encoding(format!(
            "string not representable in {}",
            encoding.name()
        )));
    }
    Ok(bytes.into_owned())
}
