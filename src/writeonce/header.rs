//! The fixed-size file header.
//!
//! All multi-byte fields are little-endian. The magic constant doubles as an
//! endianness check: a file written on a big-endian host without byte
//! swapping fails the magic comparison.

use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::errfmt;
use crate::error::{Error, Result};

/// Identifies a write-once table file.
pub const MAGIC: u64 = 0x6c6261742e692e70;

/// The format version written by this crate.
pub const MAJOR_VERSION: u8 = 4;
pub const MINOR_VERSION: u8 = 0;

/// The oldest major version this crate can read.
pub const MAJOR_VERSION_MIN: u8 = 2;

/// Serialized header size in bytes.
pub const HEADER_SIZE: usize = 24;

/// Rows were inserted in non-decreasing key order.
pub const FLAG_ASCENDING: u16 = 0x0001;
/// Rows were inserted in non-increasing key order.
pub const FLAG_DESCENDING: u16 = 0x0002;

/// Block compression method. The header reserves a byte for this; only
/// `None` is implemented, and readers refuse anything else.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Compression {
    None,
}

impl Compression {
    pub fn to_u8(self) -> u8 {
        match self {
            Compression::None => 0,
        }
    }

    pub fn from_u8(byte: u8) -> Result<Self> {
        match byte {
            0 => Ok(Compression::None),
            n => Err(Error::Codec(format!(
                "unsupported compression method {n}, decompression is not implemented"
            ))),
        }
    }
}

/// The decoded file header.
#[derive(Clone, Debug, PartialEq)]
pub struct TableHeader {
    pub major_version: u8,
    pub minor_version: u8,
    pub flags: u16,
    pub compression: u8,
    pub compression_level: u8,
    /// Absolute byte offset of the hash index region.
    pub index_offset: u64,
}

impl TableHeader {
    /// A version-4 header for a file being written. `index_offset` is
    /// patched once the index region position is known.
    pub fn new(flags: u16, compression: Compression, compression_level: u8) -> Self {
        Self {
            major_version: MAJOR_VERSION,
            minor_version: MINOR_VERSION,
            flags,
            compression: compression.to_u8(),
            compression_level,
            index_offset: 0,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_SIZE);
        buf.write_u64::<LittleEndian>(MAGIC).unwrap();
        buf.write_u8(self.major_version).unwrap();
        buf.write_u8(self.minor_version).unwrap();
        buf.write_u16::<LittleEndian>(self.flags).unwrap();
        buf.write_u8(self.compression).unwrap();
        buf.write_u8(self.compression_level).unwrap();
        buf.write_u16::<LittleEndian>(0).unwrap(); // reserved
        buf.write_u64::<LittleEndian>(self.index_offset).unwrap();
        buf
    }

    /// Decodes and validates a header read from `path`.
    pub fn decode(buf: &[u8], path: &std::path::Path) -> Result<Self> {
        if buf.len() < HEADER_SIZE {
            return errfmt!("{}: file shorter than the table header", path.display());
        }

        let mut cursor = Cursor::new(buf);
        let magic = cursor.read_u64::<LittleEndian>()?;
        if magic != MAGIC {
            return errfmt!("{}: bad magic {magic:#018x}", path.display());
        }

        let major_version = cursor.read_u8()?;
        if !(MAJOR_VERSION_MIN..=MAJOR_VERSION).contains(&major_version) {
            return errfmt!(
                "{}: unsupported major version {major_version}",
                path.display()
            );
        }

        let minor_version = cursor.read_u8()?;
        let flags = cursor.read_u16::<LittleEndian>()?;
        let compression = cursor.read_u8()?;
        let compression_level = cursor.read_u8()?;
        let _reserved = cursor.read_u16::<LittleEndian>()?;
        let index_offset = cursor.read_u64::<LittleEndian>()?;

        // Fails on reserved compression bytes before any block is touched.
        Compression::from_u8(compression)?;

        Ok(Self {
            major_version,
            minor_version,
            flags,
            compression,
            compression_level,
            index_offset,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn path() -> &'static Path {
        Path::new("test.tab")
    }

    #[test]
    fn test_roundtrip() {
        let mut header = TableHeader::new(FLAG_ASCENDING, Compression::None, 0);
        header.index_offset = 0x1234_5678_9abc;

        let buf = header.encode();
        assert_eq!(buf.len(), HEADER_SIZE);

        let decoded = TableHeader::decode(&buf, path()).expect("decode failed");
        assert_eq!(decoded, header);
    }

    #[test]
    fn test_bad_magic() {
        let mut buf = TableHeader::new(0, Compression::None, 0).encode();
        buf[0] ^= 0xff;
        assert!(matches!(
            TableHeader::decode(&buf, path()),
            Err(Error::Format(_))
        ));
    }

    #[test]
    fn test_version_range() {
        for (major, ok) in [(1u8, false), (2, true), (3, true), (4, true), (5, false)] {
            let mut buf = TableHeader::new(0, Compression::None, 0).encode();
            buf[8] = major;
            let result = TableHeader::decode(&buf, path());
            assert_eq!(result.is_ok(), ok, "major version {major}");
        }
    }

    #[test]
    fn test_reserved_compression() {
        let mut buf = TableHeader::new(0, Compression::None, 0).encode();
        buf[12] = 2;
        assert!(matches!(
            TableHeader::decode(&buf, path()),
            Err(Error::Codec(_))
        ));
    }

    #[test]
    fn test_truncated() {
        let buf = TableHeader::new(0, Compression::None, 0).encode();
        assert!(matches!(
            TableHeader::decode(&buf[..HEADER_SIZE - 1], path()),
            Err(Error::Format(_))
        ));
    }
}
