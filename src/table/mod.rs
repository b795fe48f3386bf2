//! The abstract table interface consumed by the query layer, together with
//! the backend registry that maps backend names to implementations.
//!
//! A table handle is either in builder mode (accepts `insert_row`, becomes
//! readable after `sync`) or reader mode (scans and point lookups). Which
//! mode a handle starts in is decided by the [`OpenMode`] passed to
//! [`open`].

use std::io::SeekFrom;
use std::path::Path;

use crate::error::Result;
use crate::errusage;
use crate::writeonce::WriteOnceBackend;

/// Per-handle behavior toggles.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TableFlag {
    /// Skip the fsync after the destination file is renamed into place.
    NoFsync,
    /// Payload codecs should not delta-encode offsets. The table layer only
    /// records this; it is consumed by code above this crate.
    NoRelative,
}

/// How to open a table path.
#[derive(Clone, Debug)]
pub enum OpenMode {
    /// Create (or replace) the table at the path; the handle starts in
    /// builder mode and must be `sync`ed to produce a readable file.
    Create(TableOptions),
    /// Open an existing table read-only.
    Read,
    /// Open an existing table read-write. A file whose hash index was never
    /// populated is repaired during the open.
    ReadWrite,
}

/// Options for table creation.
#[derive(Clone, Debug)]
pub struct TableOptions {
    /// Block compression method. Only `None` can currently be written.
    pub compression: crate::writeonce::Compression,

    /// Compression level hint, recorded in the header and ignored while the
    /// compression method is `None`.
    pub compression_level: u8,

    /// Permission bits for the destination file, masked by the process
    /// umask at commit (default: 0o666).
    pub file_mode: u32,
}

impl Default for TableOptions {
    fn default() -> Self {
        Self {
            compression: crate::writeonce::Compression::None,
            compression_level: 0,
            file_mode: 0o666,
        }
    }
}

impl TableOptions {
    /// Set the compression method.
    pub fn compression(mut self, compression: crate::writeonce::Compression) -> Self {
        self.compression = compression;
        self
    }

    /// Set the compression level hint.
    pub fn compression_level(mut self, level: u8) -> Self {
        self.compression_level = level;
        self
    }

    /// Set the destination file permission bits.
    pub fn file_mode(mut self, mode: u32) -> Self {
        self.file_mode = mode;
        self
    }
}

/// A sorted key/value table.
///
/// Cursor-bearing operations (`seek`, `read_row`, `seek_to_key`, `offset`)
/// are only valid on reader-mode handles; `insert_row` only on builder-mode
/// handles. Misuse is a `Usage` error, never a panic.
pub trait Table {
    /// Finalizes a builder-mode handle: sorts, writes, and commits the file,
    /// then turns this handle into a reader over it. A no-op on handles that
    /// are already readable.
    fn sync(&mut self) -> Result<()>;

    /// Sets a behavior flag on the handle.
    fn set_flag(&mut self, flag: TableFlag) -> Result<()>;

    /// Whether the rows were inserted in ascending key order. False on
    /// builder-mode handles.
    fn is_sorted(&self) -> bool;

    /// Queues one key/value pair for the build.
    fn insert_row(&mut self, key: &[u8], value: &[u8]) -> Result<()>;

    /// Moves the cursor. `Start` is relative to the end of the header,
    /// `Current` to the cursor, and `End` (non-positive offsets only) to the
    /// end of the row data. Seeking outside the row data is an error.
    fn seek(&mut self, pos: SeekFrom) -> Result<()>;

    /// Moves the cursor to the first row.
    fn seek_to_first(&mut self) -> Result<()> {
        self.seek(SeekFrom::Start(0))
    }

    /// Positions the cursor on the row with exactly this key, if present.
    /// Returns false when the key is not in the table.
    fn seek_to_key(&mut self, key: &[u8]) -> Result<bool>;

    /// The cursor position, relative to the end of the header.
    fn offset(&self) -> Result<u64>;

    /// Reads the row at the cursor and advances past it. Returns `None` at
    /// the end of the table.
    fn read_row(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>>;
}

/// A table backend: a family of table implementations selected by name.
pub trait Backend {
    fn name(&self) -> &'static str;

    fn open(&self, path: &Path, mode: OpenMode) -> Result<Box<dyn Table>>;
}

/// Looks up a backend by name.
pub fn backend(name: &str) -> Option<&'static dyn Backend> {
    match name {
        "write-once" => Some(&WriteOnceBackend),
        _ => None,
    }
}

/// Opens a table through the named backend.
pub fn open(backend_name: &str, path: impl AsRef<Path>, mode: OpenMode) -> Result<Box<dyn Table>> {
    match backend(backend_name) {
        Some(b) => b.open(path.as_ref(), mode),
        None => errusage!("unknown table backend {backend_name:?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_lookup() {
        assert_eq!(backend("write-once").map(|b| b.name()), Some("write-once"));
        assert!(backend("leveldb").is_none());
    }

    #[test]
    fn test_open_unknown_backend() {
        let result = open("no-such-backend", "/tmp/nowhere", OpenMode::Read);
        assert!(matches!(result, Err(crate::error::Error::Usage(_))));
    }

    #[test]
    fn test_default_options() {
        let options = TableOptions::default();
        assert_eq!(options.compression, crate::writeonce::Compression::None);
        assert_eq!(options.compression_level, 0);
        assert_eq!(options.file_mode, 0o666);
    }

    #[test]
    fn test_options_builder() {
        let options = TableOptions::default().compression_level(3).file_mode(0o640);
        assert_eq!(options.compression_level, 3);
        assert_eq!(options.file_mode, 0o640);
    }
}
