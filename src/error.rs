//! Centralized error handling for binrev.
//!
//! All failure conditions are propagated through the [`Result`] type; the
//! library contains no panic paths (`#![deny(clippy::unwrap_used)]`,
//! `#![deny(clippy::panic)]`). Errors are `Clone` so they can be stored for
//! later analysis; the wrapped `io::Error` sits behind an `Arc` to keep
//! cloning cheap.
//!
//! Recoverable format anomalies (checksum mismatches, malformed booleans,
//! under-consumed encoded blocks) are *warnings*, not errors: they go through
//! the context logger and never abort a serialization.

use std::fmt;
use std::io;
use std::sync::Arc;

/// A specialized `Result` type for binrev operations.
pub type Result<T> = std::result::Result<T, BinrevError>;

/// The master error enum covering all failure domains in binrev.
///
/// ## Variants
///
/// - **Io:** Low-level file system failures.
/// - **EndOfInput:** A read past the end of a stream.
/// - **InvalidPointer:** A non-zero serialized pointer value that no file in
///   the context claims and that no whitelist authorizes.
/// - **Pointer:** Pointer arithmetic or anchor misuse (e.g. subtracting
///   pointers from different files).
/// - **DuplicateFile / UnknownFile:** Context registry violations.
/// - **Disposed:** An operation after the context was closed.
/// - **Encoding:** Text encode/decode failure.
/// - **Encoder:** A stream encoder (LZ4, XOR, ...) failed to transform data.
/// - **Unsupported:** An operation outside the supported envelope, such as a
///   bit-field width past the accumulator or an array size that does not fit
///   its prefix type.
/// - **Internal:** Logic errors in the engine itself; report as bugs.
#[derive(Debug, Clone)]
pub enum BinrevError {
    /// Low-level I/O failure, wrapped in `Arc` to keep the error `Clone`.
    Io(Arc<io::Error>),
    /// Read past the end of the stream, at the given file offset.
    EndOfInput {
        /// Offset at which the short read happened.
        position: u64,
    },
    /// A serialized pointer value that resolves to no registered file.
    InvalidPointer {
        /// The raw serialized value (anchor not yet applied).
        value: u64,
        /// Where the pointer field itself was read from.
        site: String,
    },
    /// Pointer arithmetic or anchor misuse.
    Pointer(String),
    /// A file was registered under a key that is already taken.
    DuplicateFile(String),
    /// A file lookup for a key that was never registered.
    UnknownFile(String),
    /// The context (or the file) has been closed.
    Disposed,
    /// Text encode/decode failure.
    Encoding(String),
    /// A stream encoder failed to encode or decode.
    Encoder(String),
    /// The operation is outside the supported envelope.
    Unsupported(String),
    /// Logic error in the engine. Should not occur in production.
    Internal(String),
}

impl fmt::Display for BinrevError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O Error: {e}"),
            Self::EndOfInput { position } => {
                write!(f, "End of input at 0x{position:X}")
            }
            Self::InvalidPointer { value, site } => {
                write!(f, "Invalid pointer 0x{value:X} at {site}")
            }
            Self::Pointer(s) => write!(f, "Pointer Error: {s}"),
            Self::DuplicateFile(s) => write!(f, "Duplicate file: {s}"),
            Self::UnknownFile(s) => write!(f, "Unknown file: {s}"),
            Self::Disposed => write!(f, "Context has been closed"),
            Self::Encoding(s) => write!(f, "Encoding Error: {s}"),
            Self::Encoder(s) => write!(f, "Encoder Error: {s}"),
            Self::Unsupported(s) => write!(f, "Unsupported: {s}"),
            Self::Internal(s) => write!(f, "Internal Logic Error: {s}"),
        }
    }
}

impl std::error::Error for BinrevError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for BinrevError {
    fn from(err: io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}
