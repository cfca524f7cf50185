//! Byte-level read primitives.
//!
//! A [`Reader`] wraps a seekable stream and layers three things on top:
//! a mutable endianness flag, the XOR/checksum filter chain, and a shadowed
//! position so hot paths never issue a seek syscall just to know where they
//! are.
//!
//! One reader exists per open file; the serializer borrows whichever belongs
//! to its current file.

use crate::encoder::Encoder;
use crate::endian::{self, Endian};
use crate::error::{BinrevError, Result};
use crate::filters::{ChecksumCalculator, XorCalculator};
use crate::io::InputStream;
use std::io::{Read, Seek, SeekFrom};

/// Endian-aware, filterable reader over a seekable stream.
pub struct Reader {
    stream: Box<dyn InputStream>,
    pos: u64,
    length: u64,
    endian: Endian,
    xor: Option<Box<dyn XorCalculator>>,
    xor_stack: Vec<Option<Box<dyn XorCalculator>>>,
    checksum: Option<Box<dyn ChecksumCalculator>>,
    checksum_stack: Vec<Option<Box<dyn ChecksumCalculator>>>,
}

impl std::fmt::Debug for Reader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reader")
            .field("pos", &self.pos)
            .field("length", &self.length)
            .field("endian", &self.endian)
            .finish_non_exhaustive()
    }
}

impl Reader {
    /// Wraps a stream, measuring its length up front.
    pub fn new(mut stream: Box<dyn InputStream>, endian: Endian) -> Result<Self> {
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

    /// Total stream length in bytes.
    pub fn length(&self) -> u64 {
        self.length
    }

    /// Seeks to an absolute position. Seeking past the end is allowed; the
    /// next read will fail with `EndOfInput`.
    pub fn set_position(&mut self, pos: u64) -> Result<()> {
        if pos != self.pos {
            self.stream.seek(SeekFrom::Start(pos))?;
            self.pos = pos;
        }
        Ok(())
    }

    /// Advances the position without reading (cache-hit skips).
    pub fn skip(&mut self, count: u64) -> Result<()> {
        self.set_position(self.pos + count)
    }

    /// Active endianness.
    pub fn endian(&self) -> Endian {
        self.endian
    }

    /// Switches endianness for subsequent multi-byte reads.
    pub fn set_endian(&mut self, endian: Endian) {
        self.endian = endian;
    }

    // --- FILTER SCOPES ---

    /// Installs an XOR filter, saving the previous one for [`end_xor`].
    ///
    /// [`end_xor`]: Reader::end_xor
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

    /// Finishes the active checksum, restoring the previous one, and returns
    /// the accumulated value.
    pub fn end_checksum(&mut self) -> Result<u64> {
        let calc = self
            .checksum
            .take()
            .ok_or_else(|| BinrevError::Internal("no active checksum".into()))?;
        self.checksum = self.checksum_stack.pop().flatten();
        Ok(calc.value())
    }

    // --- RAW READS ---

    /// Reads exactly `buf.len()` bytes through the filter chain
    /// (XOR first, then the checksum tap).
    pub fn fill(&mut self, buf: &mut [u8]) -> Result<()> {
        self.stream.read_exact(buf).map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                BinrevError::EndOfInput { position: self.pos }
            } else {
                BinrevError::from(e)
            }
        })?;
        self.pos += buf.len() as u64;
        if let Some(xor) = &mut self.xor {
            for b in buf.iter_mut() {
                *b = xor.process_byte(*b);
            }
        }
        if let Some(checksum) = &mut self.checksum {
            checksum.process(buf);
        }
        Ok(())
    }

    /// Reads `count` bytes into a fresh buffer.
    pub fn read_bytes(&mut self, count: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; count];
        self.fill(&mut buf)?;
        Ok(buf)
    }

    // --- PRIMITIVES ---

    /// Reads one byte.
    pub fn read_u8(&mut self) -> Result<u8> {
        let mut b = [0u8; 1];
        self.fill(&mut b)?;
        Ok(b[0])
    }

    /// Reads one signed byte.
    pub fn read_i8(&mut self) -> Result<i8> {
        self.read_u8().map(|v| v as i8)
    }

    /// Runs the decoder against the underlying stream at the current
    /// position, bypassing the filter chain, and re-syncs the shadowed
    /// position to wherever the decoder stopped.
    pub fn decode_block(&mut self, encoder: &dyn Encoder) -> Result<Vec<u8>> {
        self.stream.seek(SeekFrom::Start(self.pos))?;
        let out = encoder.decode(&mut *self.stream)?;
        self.pos = self.stream.stream_position()?;
        Ok(out)
    }

    // --- STRINGS ---

    /// Reads bytes up to (and consuming) a NUL terminator, then decodes.
    pub fn read_null_terminated_string(
        &mut self,
        encoding: &'static encoding_rs::Encoding,
    ) -> Result<String> {
        let mut bytes = Vec::new();
        loop {
            let b = self.read_u8()?;
            if b == 0 {
                break;
            }
            bytes.push(b);
        }
        decode_text(&bytes, encoding)
    }

    /// Reads exactly `length` bytes, strips trailing NUL padding, decodes.
    pub fn read_fixed_string(
        &mut self,
        length: usize,
        encoding: &'static encoding_rs::Encoding,
    ) -> Result<String> {
        let mut bytes = self.read_bytes(length)?;
        while bytes.last() == Some(&0) {
            bytes.pop();
        }
        decode_text(&bytes, encoding)
    }
}

macro_rules! reader_primitives {
    ($($fn_name:ident / $endian_fn:ident => $t:ty : $len:expr),* $(,)?) => {
        impl Reader {
            $(
                /// Reads one value at the active endianness.
                pub fn $fn_name(&mut self) -> Result<$t> {
                    let mut buf = [0u8; $len];
                    self.fill(&mut buf)?;
                    Ok(endian::$endian_fn(self.endian, &buf))
                }
            )*
        }
    };
}

reader_primitives!(
    read_u16 / read_u16 => u16 : 2,
    read_i16 / read_i16 => i16 : 2,
    read_u24 / read_u24 => u32 : 3,
    read_i24 / read_i24 => i32 : 3,
    read_u32 / read_u32 => u32 : 4,
    read_i32 / read_i32 => i32 : 4,
    read_u64 / read_u64 => u64 : 8,
    read_i64 / read_i64 => i64 : 8,
    read_f32 / read_f32 => f32 : 4,
    read_f64 / read_f64 => f64 : 8,
);

pub(crate) fn decode_text(
    bytes: &[u8],
    encoding: &'static encoding_rs::Encoding,
) -> Result<String> {
    let (text, _, had_errors) = encoding.decode(bytes);
    if had_errors {
        return Err(BinrevError::Encoding(format!(
            "invalid {} byte sequence",
            encoding.name()
        )));
    }
    Ok(text.into_owned())
}
