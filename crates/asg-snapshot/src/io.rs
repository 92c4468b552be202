use std::io::{Read, Write};

use crate::error::{Result, SnapshotError};

/// Upper bound for length-prefixed strings. Context names are short identifiers; anything larger
/// is a corrupt stream.
pub const MAX_STRING_LEN: usize = 64 * 1024;

pub trait WriteBeExt: Write {
    fn write_be32(&mut self, v: u32) -> Result<()> {
        self.write_all(&v.to_be_bytes())?;
        Ok(())
    }

    fn write_be64(&mut self, v: u64) -> Result<()> {
        self.write_all(&v.to_be_bytes())?;
        Ok(())
    }

    /// Writes a `0`/`1` marker as a 32-bit value.
    fn write_flag(&mut self, v: bool) -> Result<()> {
        self.write_be32(u32::from(v))
    }

    fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.write_all(bytes)?;
        Ok(())
    }

    fn write_string(&mut self, s: &str) -> Result<()> {
        let len: u32 = s
            .len()
            .try_into()
            .map_err(|_| SnapshotError::Corrupt("string length does not fit in u32"))?;
        self.write_be32(len)?;
        self.write_bytes(s.as_bytes())
    }

    /// Writes a presence marker followed by the value, if any.
    fn write_optional_be32(&mut self, v: Option<u32>) -> Result<()> {
        match v {
            Some(v) => {
                self.write_flag(true)?;
                self.write_be32(v)
            }
            None => self.write_flag(false),
        }
    }
}

impl<T: Write + ?Sized> WriteBeExt for T {}

pub trait ReadBeExt: Read {
    fn read_be32(&mut self) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.read_exact(&mut buf)?;
        Ok(u32::from_be_bytes(buf))
    }

    fn read_be64(&mut self) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.read_exact(&mut buf)?;
        Ok(u64::from_be_bytes(buf))
    }

    /// Reads a 32-bit `0`/`1` marker. Any other value means the stream is out of sync.
    fn read_flag(&mut self) -> Result<bool> {
        match self.read_be32()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(SnapshotError::InvalidFlag(other)),
        }
    }

    fn read_optional_be32(&mut self) -> Result<Option<u32>> {
        if self.read_flag()? {
            Ok(Some(self.read_be32()?))
        } else {
            Ok(None)
        }
    }

    fn read_string(&mut self) -> Result<String> {
        let len = self.read_be32()? as usize;
        if len > MAX_STRING_LEN {
            return Err(SnapshotError::Corrupt("string too long"));
        }
        let bytes = self.read_exact_vec(len)?;
        Ok(String::from_utf8(bytes)?)
    }

    fn read_exact_vec(&mut self, len: usize) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        buf.try_reserve_exact(len)
            .map_err(|_| SnapshotError::OutOfMemory { len })?;
        buf.resize(len, 0);
        self.read_exact(&mut buf)?;
        Ok(buf)
    }
}

impl<T: Read + ?Sized> ReadBeExt for T {}
