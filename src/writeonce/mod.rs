//! The write-once table backend: an immutable, sorted, on-disk key/value
//! file built in a single pass and memory-mapped for reads.
//!
//! ## File Layout
//!
//! ```text
//! +----------------------+
//! | Header (24 bytes)    |
//! +----------------------+
//! | Block 1 (records)    |
//! +----------------------+
//! | ...                  |
//! +----------------------+
//! | Block N (records)    |
//! +----------------------+
//! | Terminator (0x00)    |
//! +----------------------+
//! | Block index          |
//! +----------------------+
//! | Hash index           |  <- header.index_offset
//! +----------------------+
//! ```
//!
//! Each record is `varint(size) | key | 0x00 | value` where `size` covers the
//! key, its terminator, and the value. Blocks bound how many raw key/value
//! bytes sit between block-index entries; the hash index maps key hashes to
//! record offsets for point lookups.
//!
//! [`WriteOnceTable`] is a state machine: created in builder mode, it only
//! accepts `insert_row` until `sync()` runs the build, after which the same
//! handle reads the committed file.

mod index;

pub mod block;
pub mod builder;
pub mod hash;
pub mod header;
pub mod reader;

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::errusage;
use crate::table::{Backend, OpenMode, Table, TableFlag};

pub use builder::Builder;
pub use header::Compression;
pub use reader::Reader;

/// Upper bound on the raw key and value bytes accumulated into one block.
pub const BLOCK_SIZE_MAX: usize = 32 * 1024 - 1;

/// Entries larger than this are not stored in blocks and are skipped by the
/// build.
pub const ENTRY_SIZE_MAX: usize = BLOCK_SIZE_MAX / 2;

/// Key bytes kept inline with each sort entry.
pub(crate) const KEY_PREFIX_LEN: usize = 24;

/// The write-once backend registered under the name `"write-once"`.
pub struct WriteOnceBackend;

impl Backend for WriteOnceBackend {
    fn name(&self) -> &'static str {
        "write-once"
    }

    fn open(&self, path: &Path, mode: OpenMode) -> Result<Box<dyn Table>> {
        Ok(Box::new(WriteOnceTable::open(path, mode)?))
    }
}

/// One write-once table handle: a builder until `sync`, a reader after.
pub struct WriteOnceTable {
    path: PathBuf,
    mode: Mode,
    no_relative: bool,
}

enum Mode {
    Build(Builder),
    Read(Reader),
}

impl WriteOnceTable {
    pub fn open(path: &Path, mode: OpenMode) -> Result<Self> {
        let mode = match mode {
            OpenMode::Create(options) => Mode::Build(Builder::new(path, options)?),
            OpenMode::Read => Mode::Read(Reader::open(path, false)?),
            OpenMode::ReadWrite => Mode::Read(Reader::open(path, true)?),
        };
        Ok(Self {
            path: path.to_path_buf(),
            mode,
            no_relative: false,
        })
    }

    /// Whether offset payloads should skip delta encoding. Read by the
    /// payload codecs layered above this crate.
    pub fn no_relative(&self) -> bool {
        self.no_relative
    }

    fn reader(&self) -> Result<&Reader> {
        match &self.mode {
            Mode::Read(reader) => Ok(reader),
            Mode::Build(_) => errusage!("{} is not readable until sync", self.path.display()),
        }
    }

    fn reader_mut(&mut self) -> Result<&mut Reader> {
        match &mut self.mode {
            Mode::Read(reader) => Ok(reader),
            Mode::Build(_) => errusage!("{} is not readable until sync", self.path.display()),
        }
    }
}

impl Table for WriteOnceTable {
    fn sync(&mut self) -> Result<()> {
        if let Mode::Build(builder) = &mut self.mode {
            builder.build()?;
            self.mode = Mode::Read(Reader::open(&self.path, false)?);
        }
        Ok(())
    }

    fn set_flag(&mut self, flag: TableFlag) -> Result<()> {
        match flag {
            TableFlag::NoFsync => {
                if let Mode::Build(builder) = &mut self.mode {
                    builder.no_fsync(true);
                }
            }
            TableFlag::NoRelative => self.no_relative = true,
        }
        Ok(())
    }

    fn is_sorted(&self) -> bool {
        match &self.mode {
            Mode::Read(reader) => reader.is_sorted(),
            Mode::Build(_) => false,
        }
    }

    fn insert_row(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        match &mut self.mode {
            Mode::Build(builder) => builder.add(key, value),
            Mode::Read(_) => errusage!("insert into read-only table {}", self.path.display()),
        }
    }

    fn seek(&mut self, pos: SeekFrom) -> Result<()> {
        self.reader_mut()?.seek(pos)
    }

    fn seek_to_key(&mut self, key: &[u8]) -> Result<bool> {
        self.reader_mut()?.seek_to_key(key)
    }

    fn offset(&self) -> Result<u64> {
        Ok(self.reader()?.offset())
    }

    fn read_row(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        self.reader_mut()?.read_row()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::table::{open, TableOptions};
    use rand::seq::SliceRandom;
    use rand::SeedableRng;
    use tempfile::TempDir;

    fn create(path: &Path) -> Box<dyn Table> {
        open(
            "write-once",
            path,
            OpenMode::Create(TableOptions::default()),
        )
        .expect("failed to create table")
    }

    fn scan_all(table: &mut dyn Table) -> Vec<(Vec<u8>, Vec<u8>)> {
        table.seek_to_first().expect("seek_to_first failed");
        let mut rows = Vec::new();
        while let Some(row) = table.read_row().expect("read_row failed") {
            rows.push(row);
        }
        rows
    }

    #[test]
    fn test_can_write_then_read() {
        let dir = TempDir::new().expect("failed to create temp dir");
        let path = dir.path().join("table_00");

        let mut table = create(&path);
        table.insert_row(b"a", b"xxx").expect("insert failed");
        table.insert_row(b"b", b"yyy").expect("insert failed");
        table.insert_row(b"c", b"zzz").expect("insert failed");
        table.insert_row(b"d", b"www").expect("insert failed");
        table.sync().expect("sync failed");
        drop(table);

        let mut table = open("write-once", &path, OpenMode::Read).expect("failed to open table");
        assert!(table.is_sorted());
        assert!(table.seek_to_key(b"a").expect("seek_to_key failed"));
        assert!(!table.seek_to_key(b"D").expect("seek_to_key failed"));
        assert!(table.seek_to_key(b"c").expect("seek_to_key failed"));
        assert!(!table.seek_to_key(b"A").expect("seek_to_key failed"));
        assert!(!table.seek_to_key(b"C").expect("seek_to_key failed"));
        assert!(!table.seek_to_key(b"B").expect("seek_to_key failed"));
        assert!(table.seek_to_key(b"d").expect("seek_to_key failed"));
        assert!(table.seek_to_key(b"b").expect("seek_to_key failed"));
    }

    #[test]
    fn test_can_write_then_read_many() {
        let dir = TempDir::new().expect("failed to create temp dir");
        let path = dir.path().join("table_00");

        let mut table = create(&path);
        for a in b'a'..=b'z' {
            for b in b'a'..=b'z' {
                table.insert_row(&[a, b], b"xxx").expect("insert failed");
            }
        }
        table.sync().expect("sync failed");
        drop(table);

        let mut table = open("write-once", &path, OpenMode::Read).expect("failed to open table");
        assert!(table.is_sorted());
        for a in b'a'..=b'z' {
            for b in b'a'..=b'z' {
                assert!(
                    table.seek_to_key(&[a, b]).expect("seek_to_key failed"),
                    "missing key {}{}",
                    a as char,
                    b as char
                );
            }
        }
    }

    #[test]
    fn test_can_write_then_read_unsorted() {
        let dir = TempDir::new().expect("failed to create temp dir");
        let path = dir.path().join("table_00");

        let mut table = create(&path);
        table.insert_row(b"a", b"xxx").expect("insert failed");
        table.insert_row(b"c", b"zzz").expect("insert failed");
        table.insert_row(b"d", b"www").expect("insert failed");
        table.insert_row(b"b", b"yyy").expect("insert failed");
        table.sync().expect("sync failed");
        drop(table);

        let mut table = open("write-once", &path, OpenMode::Read).expect("failed to open table");
        assert!(!table.is_sorted());
        assert!(table.seek_to_key(b"a").expect("seek_to_key failed"));
        assert!(!table.seek_to_key(b"D").expect("seek_to_key failed"));
        assert!(table.seek_to_key(b"c").expect("seek_to_key failed"));
        assert!(!table.seek_to_key(b"A").expect("seek_to_key failed"));
        assert!(!table.seek_to_key(b"C").expect("seek_to_key failed"));
        assert!(!table.seek_to_key(b"B").expect("seek_to_key failed"));
        assert!(table.seek_to_key(b"d").expect("seek_to_key failed"));
        assert!(table.seek_to_key(b"b").expect("seek_to_key failed"));

        // The file itself is emitted in sorted order regardless.
        let rows = scan_all(table.as_mut());
        let keys: Vec<_> = rows.iter().map(|(k, _)| k.clone()).collect();
        assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec(), b"d".to_vec()]);
    }

    #[test]
    fn test_empty_table_ok() {
        let dir = TempDir::new().expect("failed to create temp dir");
        let path = dir.path().join("table_00");

        let mut table = create(&path);
        table.sync().expect("sync failed");
        drop(table);

        let mut table = open("write-once", &path, OpenMode::Read).expect("failed to open table");
        assert!(table.read_row().expect("read_row failed").is_none());
    }

    #[test]
    fn test_unsynced_table_not_written() {
        let dir = TempDir::new().expect("failed to create temp dir");
        let path = dir.path().join("table_00");

        let table = create(&path);
        drop(table);

        assert!(matches!(
            open("write-once", &path, OpenMode::Read),
            Err(Error::Io(_))
        ));
    }

    #[test]
    fn test_large_entry_skipped() {
        let dir = TempDir::new().expect("failed to create temp dir");
        let path = dir.path().join("table_00");

        let large_value = vec![b'x'; ENTRY_SIZE_MAX];
        let mut table = create(&path);
        table.insert_row(b"big", &large_value).expect("insert failed");
        table.insert_row(b"small", b"yyy").expect("insert failed");
        table.sync().expect("sync failed");

        assert!(!table.seek_to_key(b"big").expect("seek_to_key failed"));
        assert!(table.seek_to_key(b"small").expect("seek_to_key failed"));
        let rows = scan_all(table.as_mut());
        assert_eq!(rows, vec![(b"small".to_vec(), b"yyy".to_vec())]);
    }

    #[test]
    fn test_duplicate_keys_keep_insertion_order() {
        let dir = TempDir::new().expect("failed to create temp dir");
        let path = dir.path().join("table_00");

        let mut table = create(&path);
        table.insert_row(b"dup", b"first").expect("insert failed");
        table.insert_row(b"aaa", b"other").expect("insert failed");
        table.insert_row(b"dup", b"second").expect("insert failed");
        table.insert_row(b"zzz", b"other").expect("insert failed");
        table.insert_row(b"dup", b"third").expect("insert failed");
        table.sync().expect("sync failed");

        let rows = scan_all(table.as_mut());
        assert_eq!(
            rows,
            vec![
                (b"aaa".to_vec(), b"other".to_vec()),
                (b"dup".to_vec(), b"first".to_vec()),
                (b"dup".to_vec(), b"second".to_vec()),
                (b"dup".to_vec(), b"third".to_vec()),
                (b"zzz".to_vec(), b"other".to_vec()),
            ]
        );

        // A point lookup lands on one of the duplicates.
        assert!(table.seek_to_key(b"dup").expect("seek_to_key failed"));
        let (key, _) = table.read_row().expect("read_row failed").expect("no row");
        assert_eq!(key, b"dup");
    }

    #[test]
    fn test_shuffled_roundtrip() {
        let dir = TempDir::new().expect("failed to create temp dir");
        let path = dir.path().join("table_00");

        // Key lengths straddle the 24-byte inline prefix, so sorting must
        // fall back to the spill file for the long ones.
        let mut pairs: Vec<(Vec<u8>, Vec<u8>)> = (0..500u32)
            .map(|i| {
                let key = if i % 3 == 0 {
                    format!("k{i:04}").into_bytes()
                } else {
                    format!("shared-long-prefix-{:040}", i).into_bytes()
                };
                (key, format!("value-{i}").into_bytes())
            })
            .collect();

        let mut rng = rand::rngs::StdRng::seed_from_u64(42);
        pairs.shuffle(&mut rng);

        let mut table = create(&path);
        for (key, value) in &pairs {
            table.insert_row(key, value).expect("insert failed");
        }
        table.sync().expect("sync failed");

        let mut expected = pairs.clone();
        expected.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(scan_all(table.as_mut()), expected);

        for (key, value) in &pairs {
            assert!(
                table.seek_to_key(key).expect("seek_to_key failed"),
                "missing key {:?}",
                String::from_utf8_lossy(key)
            );
            let (found_key, found_value) =
                table.read_row().expect("read_row failed").expect("no row");
            assert_eq!(&found_key, key);
            assert_eq!(&found_value, value);
        }

        assert!(!table.seek_to_key(b"k9999").expect("seek_to_key failed"));
        assert!(!table
            .seek_to_key(b"shared-long-prefix-unknown")
            .expect("seek_to_key failed"));
    }

    #[test]
    fn test_sync_transitions_handle() {
        let dir = TempDir::new().expect("failed to create temp dir");
        let path = dir.path().join("table_00");

        let mut table = create(&path);
        assert!(!table.is_sorted());
        assert!(matches!(table.read_row(), Err(Error::Usage(_))));
        assert!(matches!(table.offset(), Err(Error::Usage(_))));

        table.insert_row(b"a", b"xxx").expect("insert failed");
        table.sync().expect("sync failed");

        // The handle now reads without a reopen; a second sync is a no-op.
        assert!(table.is_sorted());
        assert!(table.seek_to_key(b"a").expect("seek_to_key failed"));
        table.sync().expect("sync failed");

        assert!(matches!(table.insert_row(b"b", b"yyy"), Err(Error::Usage(_))));
    }

    #[test]
    fn test_set_flags() {
        let dir = TempDir::new().expect("failed to create temp dir");
        let path = dir.path().join("table_00");

        let mut table = create(&path);
        table.set_flag(TableFlag::NoFsync).expect("set_flag failed");
        table
            .set_flag(TableFlag::NoRelative)
            .expect("set_flag failed");
        table.insert_row(b"a", b"xxx").expect("insert failed");
        table.sync().expect("sync failed");
        assert!(table.seek_to_key(b"a").expect("seek_to_key failed"));
    }

    #[test]
    fn test_offset_tracks_cursor() {
        let dir = TempDir::new().expect("failed to create temp dir");
        let path = dir.path().join("table_00");

        let mut table = create(&path);
        table.insert_row(b"a", b"xxx").expect("insert failed");
        table.insert_row(b"b", b"yyyy").expect("insert failed");
        table.sync().expect("sync failed");

        table.seek_to_first().expect("seek_to_first failed");
        assert_eq!(table.offset().expect("offset failed"), 0);
        table.read_row().expect("read_row failed");
        // varint(5) + "a" + NUL + "xxx"
        assert_eq!(table.offset().expect("offset failed"), 6);
        table.read_row().expect("read_row failed");
        assert_eq!(table.offset().expect("offset failed"), 13);
    }
}
