//! Runtime byte-order selection.
//!
//! Every reader and writer carries a mutable [`Endian`] flag; the conversion
//! itself is delegated to `byteorder` so the per-width bit fiddling lives in
//! one place.

use byteorder::{BigEndian, ByteOrder, LittleEndian};

/// Byte order of multi-byte integers in a stream.
///
/// Files declare a default; `do_endian` scopes override it locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Endian {
    /// Least significant byte first. The default for the console formats
    /// this engine was built around.
    #[default]
    Little,
    /// Most significant byte first.
    Big,
}

impl Endian {
    /// Returns true for [`Endian::Little`].
    pub fn is_little(self) -> bool {
        matches!(self, Self::Little)
    }
}

macro_rules! endian_fns {
    ($($read:ident / $write:ident => $t:ty),* $(,)?) => {
        $(
            pub(crate) fn $read(e: Endian, buf: &[u8]) -> $t {
                match e {
                    Endian::Little => LittleEndian::$read(buf),
                    Endian::Big => BigEndian::$read(buf),
                }
            }

            pub(crate) fn $write(e: Endian, buf: &mut [u8], value: $t) {
                match e {
                    Endian::Little => LittleEndian::$write(buf, value),
                    Endian::Big => BigEndian::$write(buf, value),
                }
            }
        )*
    };
}

endian_fns!(
    read_u16 / write_u16 => u16,
    read_u24 / write_u24 => u32,
    read_u32 / write_u32 => u32,
    read_u64 / write_u64 => u64,
    read_i16 / write_i16 => i16,
    read_i24 / write_i24 => i32,
    read_i32 / write_i32 => i32,
    read_i64 / write_i64 => i64,
    read_f32 / write_f32 => f32,
    read_f64 / write_f64 => f64,
);
