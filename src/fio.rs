//! Positional I/O over a file handle.
//!
//! There is no internal cursor: every call names its absolute offset, so a
//! single handle can serve interleaved reads from the sort comparator and
//! sequential writes from the block emitter. Short transfers are errors.

use std::fs::File;
use std::os::unix::fs::FileExt;

use crate::error::{Error, Result};

pub struct Fio<'a> {
    file: &'a File,
}

impl<'a> Fio<'a> {
    pub fn new(file: &'a File) -> Self {
        Self { file }
    }

    /// Fills `buf` from the given offset, or fails.
    pub fn read(&self, buf: &mut [u8], offset: u64) -> Result<()> {
        self.file
            .read_exact_at(buf, offset)
            .map_err(|e| Error::Io(format!("pread {} bytes at {offset}: {e}", buf.len())))
    }

    /// Writes all of `buf` at the given offset, or fails.
    pub fn write(&self, buf: &[u8], offset: u64) -> Result<()> {
        self.file
            .write_all_at(buf, offset)
            .map_err(|e| Error::Io(format!("pwrite {} bytes at {offset}: {e}", buf.len())))
    }
}
