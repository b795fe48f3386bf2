//! The build pipeline: ingest unordered pairs onto a spill file, stable-sort
//! their descriptors, then emit the sorted, blocked output file and rename
//! it into place.
//!
//! Ingested bytes go straight to an anonymous spill file next to the
//! destination; RAM holds one fixed-width [`Entry`] per pair. Sorting
//! compares the 24-byte inline key prefixes and only falls back to positional
//! reads on the spill file when both prefixes are full and equal, so most
//! comparisons never touch the disk.

use std::cell::{Cell, RefCell};
use std::cmp::Ordering;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, WriteBytesExt};
use log::debug;
use tempfile::NamedTempFile;

use crate::encoding::varint;
use crate::error::{Error, Result};
use crate::fio::Fio;
use crate::table::TableOptions;
use crate::{errfmt, errusage};

use super::block::BlockBuilder;
use super::hash::key_hash;
use super::header::{TableHeader, FLAG_ASCENDING, FLAG_DESCENDING, HEADER_SIZE, MAJOR_VERSION};
use super::index::BlockIndex;
use super::{ENTRY_SIZE_MAX, KEY_PREFIX_LEN};

/// One ingested pair: where its raw bytes sit on the spill file, plus the
/// leading key bytes so most comparisons never leave RAM.
struct Entry {
    offset: u64,
    key_size: u32,
    value_size: u32,
    prefix: [u8; KEY_PREFIX_LEN],
}

impl Entry {
    fn prefix_bytes(&self) -> &[u8] {
        &self.prefix[..(self.key_size as usize).min(KEY_PREFIX_LEN)]
    }
}

/// Builds one write-once table file.
///
/// Single-shot: `add` queues pairs, `build` produces the file. Dropping an
/// unbuilt builder leaves nothing behind at the destination path.
pub struct Builder {
    path: PathBuf,
    options: TableOptions,
    no_fsync: bool,

    /// Raw ingested pairs, concatenated in arrival order. Reads during the
    /// sort and the block emission are positional.
    spill: File,
    /// Buffered ingest half of the spill file. Taken at `build`; `None`
    /// afterwards.
    spill_out: Option<BufWriter<File>>,
    spill_len: u64,

    entries: Vec<Entry>,
    key_size_max: u32,

    /// Sortedness of the ingest stream, written into the header at commit.
    /// Starts with both bits set; each `add` clears the bits the new key
    /// violates.
    flags: u16,
    prev_key: Option<Vec<u8>>,
}

impl Builder {
    pub fn new(path: &Path, options: TableOptions) -> Result<Self> {
        let dir = spill_dir(path);
        let spill = tempfile::tempfile_in(dir)
            .map_err(|e| Error::Io(format!("spill file in {}: {e}", dir.display())))?;
        let spill_out = BufWriter::new(spill.try_clone().map_err(Error::from)?);

        Ok(Self {
            path: path.to_path_buf(),
            options,
            no_fsync: false,
            spill,
            spill_out: Some(spill_out),
            spill_len: 0,
            entries: Vec::new(),
            key_size_max: 0,
            flags: FLAG_ASCENDING | FLAG_DESCENDING,
            prev_key: None,
        })
    }

    pub fn no_fsync(&mut self, value: bool) {
        self.no_fsync = value;
    }

    /// Queues one pair for the build.
    pub fn add(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        if u32::try_from(key.len()).is_err() {
            return errusage!("key of {} bytes is too long", key.len());
        }
        if u32::try_from(value.len()).is_err() {
            return errusage!("value of {} bytes is too long", value.len());
        }
        if key.contains(&0) {
            return errusage!("key contains a NUL byte");
        }

        let spill_out = match self.spill_out.as_mut() {
            Some(out) => out,
            None => return errusage!("insert into an already built table"),
        };
        spill_out.write_all(key).map_err(Error::from)?;
        spill_out.write_all(value).map_err(Error::from)?;

        let mut prefix = [0u8; KEY_PREFIX_LEN];
        let count = key.len().min(KEY_PREFIX_LEN);
        prefix[..count].copy_from_slice(&key[..count]);
        self.entries.push(Entry {
            offset: self.spill_len,
            key_size: key.len() as u32,
            value_size: value.len() as u32,
            prefix,
        });

        self.spill_len += (key.len() + value.len()) as u64;
        self.key_size_max = self.key_size_max.max(key.len() as u32);

        match &mut self.prev_key {
            Some(prev) => {
                if self.flags != 0 {
                    match prev.as_slice().cmp(key) {
                        Ordering::Less => self.flags &= FLAG_ASCENDING,
                        Ordering::Greater => self.flags &= FLAG_DESCENDING,
                        Ordering::Equal => {}
                    }
                }
                prev.clear();
                prev.extend_from_slice(key);
            }
            None => self.prev_key = Some(key.to_vec()),
        }

        Ok(())
    }

    /// Runs the full pipeline: flush, sort, emit, commit. On any failure the
    /// temporary output is unlinked and the destination path is untouched.
    pub fn build(&mut self) -> Result<()> {
        let mut spill_out = match self.spill_out.take() {
            Some(out) => out,
            None => return errusage!("table already built"),
        };
        spill_out.flush().map_err(Error::from)?;
        drop(spill_out);

        self.sort_entries()?;

        let temp = self.create_output()?;
        self.write_final_data(&temp)?;
        self.commit(temp)
    }

    fn sort_entries(&mut self) -> Result<()> {
        let comparator = SpillComparator::new(&self.spill, self.key_size_max as usize);

        // Stable: duplicate keys keep their insertion order, and the
        // merge-based algorithm touches the spill file in longer runs than a
        // partition sort would.
        self.entries
            .sort_by(|lhs, rhs| comparator.compare(lhs, rhs));

        if let Some(err) = comparator.error.into_inner() {
            return Err(err);
        }
        debug!(
            "sorted {} entries with {} spill reads",
            self.entries.len(),
            comparator.reads.get()
        );
        Ok(())
    }

    /// Creates the temporary output next to the destination and writes the
    /// header skeleton. `index_offset` is patched during `write_final_data`.
    fn create_output(&self) -> Result<NamedTempFile> {
        let name = match self.path.file_name() {
            Some(name) => name.to_string_lossy().into_owned(),
            None => return errusage!("invalid table path {}", self.path.display()),
        };

        let temp = tempfile::Builder::new()
            .prefix(&format!("{name}.tmp.{}.", std::process::id()))
            .rand_bytes(6)
            .tempfile_in(spill_dir(&self.path))
            .map_err(|e| Error::Io(format!("create temporary for {}: {e}", self.path.display())))?;

        let header = TableHeader::new(
            self.flags,
            self.options.compression,
            self.options.compression_level,
        );
        Fio::new(temp.as_file()).write(&header.encode(), 0)?;

        Ok(temp)
    }

    /// Emits sorted blocks, the data terminator, the block index, and the
    /// populated hash index, then patches `index_offset` into the header.
    fn write_final_data(&self, temp: &NamedTempFile) -> Result<()> {
        let out = Fio::new(temp.as_file());
        let spill = Fio::new(&self.spill);

        let mut block = BlockBuilder::new();
        let mut block_index = BlockIndex::new();
        let mut scratch = Vec::new();
        let mut raw = Vec::new();
        let mut last_key = Vec::new();

        // (key hash, record offset) for every emitted record; reduced modulo
        // the slot count once it is known.
        let mut slot_pairs: Vec<(u64, u64)> = Vec::with_capacity(self.entries.len());

        let mut pos = HEADER_SIZE as u64;
        let mut large_count = 0usize;

        for entry in &self.entries {
            let size = entry.key_size as usize + entry.value_size as usize;
            if size > ENTRY_SIZE_MAX {
                // TODO: store large entries in dedicated blocks.
                large_count += 1;
                continue;
            }

            raw.resize(size, 0);
            spill.read(&mut raw, entry.offset)?;
            let (key, value) = raw.split_at(entry.key_size as usize);

            if !block.add(key, value) {
                write_block(&out, &block, &mut block_index, &mut scratch, &mut pos, &last_key)?;
                block.clear();
                if !block.add(key, value) {
                    return errfmt!("a {size}-byte record does not fit an empty block");
                }
            }

            let record_size = (key.len() + 1 + value.len()) as u64;
            let record_len = varint::encoded_len(record_size) as u64 + record_size;
            let record_offset = pos + block.encoded_len() as u64 - record_len;
            slot_pairs.push((key_hash(MAJOR_VERSION, key), record_offset));

            last_key.clear();
            last_key.extend_from_slice(key);
        }

        write_block(&out, &block, &mut block_index, &mut scratch, &mut pos, &last_key)?;

        // Terminator so a sequential scan stops before the block index.
        out.write(&[0], pos)?;
        pos += 1;

        block_index.marshal(&mut scratch);
        out.write(&scratch, pos)?;
        pos += scratch.len() as u64;

        let index_offset = pos;
        out.write(&marshal_hash_index(&slot_pairs), index_offset)?;

        let mut header = TableHeader::new(
            self.flags,
            self.options.compression,
            self.options.compression_level,
        );
        header.index_offset = index_offset;
        out.write(&header.encode(), 0)?;

        debug!(
            "wrote {} records in {} blocks, skipped {large_count} large entries",
            slot_pairs.len(),
            block_index.block_count()
        );
        Ok(())
    }

    /// Fixes the file mode against the current umask, renames the temporary
    /// into place, and fsyncs unless disabled.
    fn commit(&self, temp: NamedTempFile) -> Result<()> {
        let mask = unsafe {
            let mask = libc::umask(0);
            libc::umask(mask);
            mask
        };
        let mode = self.options.file_mode & !(mask as u32);
        temp.as_file()
            .set_permissions(std::fs::Permissions::from_mode(mode))
            .map_err(Error::from)?;

        let file = temp
            .persist(&self.path)
            .map_err(|e| Error::Io(format!("rename into {}: {}", self.path.display(), e.error)))?;

        if !self.no_fsync {
            file.sync_all()
                .map_err(|e| Error::Io(format!("fsync {}: {e}", self.path.display())))?;
        }
        Ok(())
    }
}

/// Marshals and writes the current block, recording it in the block index.
/// An empty block writes nothing.
fn write_block(
    out: &Fio,
    block: &BlockBuilder,
    block_index: &mut BlockIndex,
    scratch: &mut Vec<u8>,
    pos: &mut u64,
    last_key: &[u8],
) -> Result<()> {
    if block.is_empty() {
        return Ok(());
    }
    block.marshal(scratch);

    block_index.add(scratch.len() as u32, last_key);
    out.write(scratch, *pos)?;
    *pos += scratch.len() as u64;
    Ok(())
}

/// Builds the open-addressed slot array in memory and serializes it. Version
/// 4 output always uses 8-byte slots; `2n + 1` slots guarantee enough empties
/// for probe loops to terminate.
fn marshal_hash_index(slot_pairs: &[(u64, u64)]) -> Vec<u8> {
    let index_size = slot_pairs.len() as u64 * 2 + 1;
    let mut slots = vec![0u64; index_size as usize];

    for &(hash, offset) in slot_pairs {
        let mut slot = (hash % index_size) as usize;
        while slots[slot] != 0 {
            slot += 1;
            if slot == slots.len() {
                slot = 0;
            }
        }
        slots[slot] = offset;
    }

    let mut bytes = Vec::with_capacity(slots.len() * 8);
    for &slot in &slots {
        bytes.write_u64::<LittleEndian>(slot).unwrap();
    }
    bytes
}

fn spill_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(dir) if dir != Path::new("") => dir,
        _ => Path::new("."),
    }
}

/// Total order over entries backed by the spill file. Reads inside the
/// comparator are intentional; the first I/O failure is latched and surfaced
/// after the sort finishes.
struct SpillComparator<'a> {
    spill: Fio<'a>,
    buffers: RefCell<(Vec<u8>, Vec<u8>)>,
    reads: Cell<u64>,
    error: RefCell<Option<Error>>,
}

impl<'a> SpillComparator<'a> {
    fn new(spill: &'a File, key_size_max: usize) -> Self {
        Self {
            spill: Fio::new(spill),
            buffers: RefCell::new((vec![0; key_size_max], vec![0; key_size_max])),
            reads: Cell::new(0),
            error: RefCell::new(None),
        }
    }

    fn compare(&self, lhs: &Entry, rhs: &Entry) -> Ordering {
        let lhs_prefix = lhs.prefix_bytes();
        let rhs_prefix = rhs.prefix_bytes();

        match lhs_prefix.cmp(rhs_prefix) {
            Ordering::Equal
                if lhs_prefix.len() == KEY_PREFIX_LEN && rhs_prefix.len() == KEY_PREFIX_LEN =>
            {
                self.compare_full(lhs, rhs)
            }
            // Equal prefixes shorter than the inline width mean the keys
            // themselves are equal.
            ordering => ordering,
        }
    }

    fn compare_full(&self, lhs: &Entry, rhs: &Entry) -> Ordering {
        if self.error.borrow().is_some() {
            return Ordering::Equal;
        }

        let (lhs_buf, rhs_buf) = &mut *self.buffers.borrow_mut();
        lhs_buf.resize(lhs.key_size as usize, 0);
        rhs_buf.resize(rhs.key_size as usize, 0);

        let read = self
            .spill
            .read(lhs_buf, lhs.offset)
            .and_then(|()| self.spill.read(rhs_buf, rhs.offset));
        if let Err(err) = read {
            // The ordering no longer matters; the sort result is discarded.
            *self.error.borrow_mut() = Some(err);
            return Ordering::Equal;
        }

        self.reads.set(self.reads.get() + 2);
        (*lhs_buf).cmp(rhs_buf)
    }
}
