//! Big-endian snapshot stream primitives.
//!
//! Every multi-byte integer in an ASG snapshot is written big-endian through fixed-width
//! put/get helpers. Optional data is always preceded by a 32-bit `0`/`1` presence marker and
//! strings are length-prefixed with a 32-bit byte count.
//!
//! The helpers are extension traits over [`std::io::Write`] / [`std::io::Read`] so callers can
//! snapshot into a `Vec<u8>`, a `Cursor`, or a file without an intermediate stream type.

mod error;
mod io;

pub use crate::error::{Result, SnapshotError};
pub use crate::io::{ReadBeExt, WriteBeExt, MAX_STRING_LEN};
