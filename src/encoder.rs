//! Pluggable stream encoders.
//!
//! An [`Encoder`] maps between the on-disk representation of a byte range
//! and its logical content: compression, whole-stream XOR, or any other
//! reversible transform. Encoded files decode through one on open; encoded
//! scopes (`do_encoded`) decode a block mid-stream, serialize against the
//! decoded image, and re-encode on the write path.
//!
//! `decode` must consume *exactly* the encoded bytes and leave the input
//! positioned after the block, because the outer cursor continues from
//! wherever the decoder stopped.

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{BinrevError, Result};
use crate::io::InputStream;

/// Interface for reversible stream transforms.
pub trait Encoder {
    /// Short name used to derive stream-file keys (`"lz4"`, `"xor"`).
    fn name(&self) -> &'static str;

    /// Decodes from the stream's current position. Must consume exactly the
    /// encoded block and no more.
    fn decode(&self, input: &mut dyn InputStream) -> Result<Vec<u8>>;

    /// Encodes a logical buffer into its on-disk representation.
    fn encode(&self, data: &[u8]) -> Result<Vec<u8>>;
}

// --- LZ4 (Optional) ---

/// LZ4 block compression behind a small self-delimiting container:
/// `[u32 LE decoded_len] [u32 LE encoded_len] [lz4 block]`.
///
/// The explicit encoded length is what lets `decode` stop at the block
/// boundary without scanning.
#[cfg(feature = "lz4")]
#[derive(Debug, Clone, Copy, Default)]
pub struct Lz4Encoder;

#[cfg(feature = "lz4")]
impl Encoder for Lz4Encoder {
    fn name(&self) -> &'static str {
        "lz4"
    }

    fn decode(&self, input: &mut dyn InputStream) -> Result<Vec<u8>> {
        let mut header = [0u8; 8];
        input.read_exact(&mut header)?;
        let decoded_len = LittleEndian::read_u32(&header[0..4]) as usize;
        let encoded_len = LittleEndian::read_u32(&header[4..8]) as usize;

        let mut block = vec![0u8; encoded_len];
        input.read_exact(&mut block)?;

        let out = lz4_flex::decompress(&block, decoded_len)
            .map_err(|e| BinrevError::Encoder(e.to_string()))?;
        if out.len() != decoded_len {
            return Err(BinrevError::Encoder(format!(
                "LZ4 length mismatch: header says {decoded_len}, got {}",
                out.len()
            )));
        }
        Ok(out)
    }

    fn encode(&self, data: &[u8]) -> Result<Vec<u8>> {
        let block = lz4_flex::compress(data);
        let mut out = Vec::with_capacity(8 + block.len());
        let mut header = [0u8; 8];
        LittleEndian::write_u32(&mut header[0..4], data.len() as u32);
        LittleEndian::write_u32(&mut header[4..8], block.len() as u32);
        out.extend_from_slice(&header);
        out.extend_from_slice(&block);
        Ok(out)
    }
}

// --- WHOLE-STREAM XOR ---

/// XOR of every remaining byte against a repeating key.
///
/// Consumes the input to its end; typical for obfuscated containers where
/// the encoded region runs to EOF.
#[derive(Debug, Clone)]
pub struct XorEncoder {
    key: Vec<u8>,
}

impl XorEncoder {
    /// Creates an encoder with a single-byte key.
    pub fn new(key: u8) -> Self {
        Self { key: vec![key] }
    }

    /// Creates an encoder cycling through a multi-byte key.
    pub fn with_key(key: Vec<u8>) -> Self {
        Self { key }
    }

    fn apply(&self, data: &mut [u8]) {
        if self.key.is_empty() {
            return;
        }
        for (i, b) in data.iter_mut().enumerate() {
            *b ^= self.key[i % self.key.len()];
        }
    }
}

impl Encoder for XorEncoder {
    fn name(&self) -> &'static str {
        "xor"
    }

    fn decode(&self, input: &mut dyn InputStream) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        input.read_to_end(&mut out)?;
        self.apply(&mut out);
        Ok(out)
    }

    fn encode(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut out = data.to_vec();
        self.apply(&mut out);
        Ok(out)
    }
}
