//! The memory-mapped reader: sequential scans, hash-index point lookups, and
//! the read-write repair path that populates a zeroed hash index.

use std::cmp::Ordering;
use std::fs::OpenOptions;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use byteorder::{ByteOrder, LittleEndian};
use log::debug;
use memmap2::{Advice, Mmap, MmapMut, UncheckedAdvice};

use crate::encoding::varint;
use crate::error::{Error, Result};
use crate::{errfmt, errusage};

use super::hash::{key_hash, Probe, SlotWidth};
use super::header::{TableHeader, FLAG_ASCENDING, FLAG_DESCENDING, HEADER_SIZE};

/// Flushes of the rebuild key buffer happen every this many entries.
const KEY_BUFFER_MAX: usize = 16 * 1024 * 1024;

enum Map {
    Ro(Mmap),
    Rw(MmapMut),
}

impl Map {
    fn bytes(&self) -> &[u8] {
        match self {
            Map::Ro(map) => map,
            Map::Rw(map) => map,
        }
    }

    fn bytes_mut(&mut self) -> Option<&mut [u8]> {
        match self {
            Map::Ro(_) => None,
            Map::Rw(map) => Some(map),
        }
    }

    fn advise_range(&self, advice: Advice, offset: usize, len: usize) -> std::io::Result<()> {
        match self {
            Map::Ro(map) => map.advise_range(advice, offset, len),
            Map::Rw(map) => map.advise_range(advice, offset, len),
        }
    }

    fn advise_dontneed(&self, offset: usize, len: usize) -> std::io::Result<()> {
        // Shared file-backed mapping: discarded pages refault from disk.
        unsafe {
            match self {
                Map::Ro(map) => map.unchecked_advise_range(UncheckedAdvice::DontNeed, offset, len),
                Map::Rw(map) => map.unchecked_advise_range(UncheckedAdvice::DontNeed, offset, len),
            }
        }
    }
}

/// A reader over one finalized table file.
pub struct Reader {
    path: PathBuf,
    map: Map,
    header: TableHeader,
    index_size: u64,
    slot_width: SlotWidth,
    /// Cursor: absolute file offset of the next row.
    offset: u64,
    madvised_index: bool,
}

impl Reader {
    /// Opens and validates a table file. A read-write open additionally
    /// repairs a hash index that was never populated.
    pub fn open(path: &Path, write: bool) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(write)
            .open(path)
            .map_err(|e| Error::Io(format!("open {}: {e}", path.display())))?;

        let len = file.metadata().map_err(Error::from)?.len();
        if len <= HEADER_SIZE as u64 {
            return errfmt!("{}: {len} bytes is too small for a table", path.display());
        }

        let map = if write {
            Map::Rw(
                unsafe { MmapMut::map_mut(&file) }
                    .map_err(|e| Error::Io(format!("mmap {}: {e}", path.display())))?,
            )
        } else {
            Map::Ro(
                unsafe { Mmap::map(&file) }
                    .map_err(|e| Error::Io(format!("mmap {}: {e}", path.display())))?,
            )
        };

        let header = TableHeader::decode(&map.bytes()[..HEADER_SIZE], path)?;
        if header.index_offset < HEADER_SIZE as u64 || header.index_offset > len {
            return errfmt!(
                "{}: index offset {} outside the file",
                path.display(),
                header.index_offset
            );
        }

        let slot_width = SlotWidth::for_file(header.major_version, header.index_offset);
        let index_size = (len - header.index_offset) / slot_width.bytes() as u64;

        let mut reader = Self {
            path: path.to_path_buf(),
            map,
            header,
            index_size,
            slot_width,
            offset: HEADER_SIZE as u64,
            madvised_index: false,
        };

        if write && reader.rows_present() && reader.index_unpopulated() {
            reader.build_index()?;
        }

        Ok(reader)
    }

    /// Whether the rows were inserted in ascending key order.
    pub fn is_sorted(&self) -> bool {
        self.header.flags & FLAG_ASCENDING != 0
    }

    /// The cursor, relative to the end of the header.
    pub fn offset(&self) -> u64 {
        self.offset - HEADER_SIZE as u64
    }

    /// Moves the cursor. `Start` is relative to the end of the header,
    /// `End` (non-positive offsets) to the end of the row data.
    pub fn seek(&mut self, pos: SeekFrom) -> Result<()> {
        let index_offset = self.header.index_offset;
        let new_offset = match pos {
            SeekFrom::Start(n) => (HEADER_SIZE as u64).checked_add(n),
            SeekFrom::Current(d) => self.offset.checked_add_signed(d),
            SeekFrom::End(d) if d <= 0 => index_offset.checked_add_signed(d),
            SeekFrom::End(_) => return errusage!("attempt to seek past end of table"),
        };

        match new_offset {
            Some(offset) if (HEADER_SIZE as u64..=index_offset).contains(&offset) => {
                self.offset = offset;
                Ok(())
            }
            _ => errusage!("seek to {pos:?} is outside the table"),
        }
    }

    /// Reads the row at the cursor and advances past it. `None` at the end
    /// of the row data.
    pub fn read_row(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let bytes = self.map.bytes();
        let data_end = self.header.index_offset as usize;
        let pos = self.offset as usize;

        if pos >= data_end || bytes[pos] == 0 {
            return Ok(None);
        }

        let (record_size, varint_len) = varint::decode(&bytes[pos..data_end])?;
        let record_start = pos + varint_len;
        let record_end = record_start.saturating_add(record_size as usize);
        if record_end > data_end {
            return errfmt!(
                "{}: record at offset {pos} overruns the data region",
                self.path.display()
            );
        }

        let record = &bytes[record_start..record_end];
        let key_len = match record.iter().position(|&b| b == 0) {
            Some(len) => len,
            None => {
                return errfmt!(
                    "{}: record at offset {pos} has no key terminator",
                    self.path.display()
                )
            }
        };

        let key = record[..key_len].to_vec();
        let value = record[key_len + 1..].to_vec();
        self.offset = record_end as u64;
        Ok(Some((key, value)))
    }

    /// Positions the cursor on the row holding exactly `key`. Returns false
    /// if the key is not present.
    pub fn seek_to_key(&mut self, key: &[u8]) -> Result<bool> {
        if self.index_size == 0 {
            return Ok(false);
        }
        if !self.madvised_index {
            self.madvise_index()?;
        }

        let hash = key_hash(self.header.major_version, key);
        let mut probe = Probe::new(self.header.major_version, hash, self.index_size);

        // With the ascending bit set, key comparisons narrow the offset range
        // a match can live in; candidates outside it are collisions.
        let ascending = self.header.flags & FLAG_ASCENDING != 0;
        let mut min_offset = 0u64;
        let mut max_offset = self.header.index_offset;

        // A populated index always holds empty slots, so the probe loop
        // terminates; the cap keeps corrupt files from hanging it.
        for _ in 0..self.index_size {
            let candidate = self.slot(probe.slot());
            if candidate == 0 {
                return Ok(false);
            }

            let in_data = (HEADER_SIZE as u64) <= candidate && candidate < self.header.index_offset;
            if in_data && candidate >= min_offset && candidate <= max_offset {
                match self.compare_key_at(key, candidate)? {
                    Ordering::Equal => {
                        self.offset = candidate;
                        return Ok(true);
                    }
                    Ordering::Less => {
                        if ascending {
                            max_offset = candidate;
                        }
                    }
                    Ordering::Greater => {
                        if ascending {
                            min_offset = candidate;
                        }
                    }
                }
            }

            probe.advance();
        }

        Ok(false)
    }

    /// Compares `key` against the stored key of the record at `offset`.
    fn compare_key_at(&self, key: &[u8], offset: u64) -> Result<Ordering> {
        let bytes = self.map.bytes();
        let data_end = self.header.index_offset as usize;
        let mut pos = offset as usize;

        // Skip the record size varint; the key follows.
        loop {
            if pos >= data_end {
                return errfmt!(
                    "{}: record at offset {offset} overruns the data region",
                    self.path.display()
                );
            }
            let byte = bytes[pos];
            pos += 1;
            if byte & 0x80 == 0 {
                break;
            }
        }

        let mut i = 0;
        loop {
            if pos + i >= data_end {
                return errfmt!(
                    "{}: record at offset {offset} has no key terminator",
                    self.path.display()
                );
            }
            let stored = bytes[pos + i];
            if i == key.len() {
                return Ok(if stored == 0 {
                    Ordering::Equal
                } else {
                    Ordering::Less
                });
            }
            if stored == 0 {
                return Ok(Ordering::Greater);
            }
            match key[i].cmp(&stored) {
                Ordering::Equal => i += 1,
                ordering => return Ok(ordering),
            }
        }
    }

    /// Scans the row data and populates an all-zero hash index in place,
    /// recording the observed sortedness in the header flags.
    fn build_index(&mut self) -> Result<()> {
        if self.index_size == 0 {
            return errfmt!("{}: no hash index region to rebuild", self.path.display());
        }
        self.seek(SeekFrom::Start(0))?;

        let data_len = self.header.index_offset as usize;
        self.map
            .advise_range(Advice::Sequential, 0, data_len)
            .map_err(Error::from)?;

        let mut key_buffer: Vec<(u64, u64)> = Vec::new();
        let mut flags = FLAG_ASCENDING | FLAG_DESCENDING;
        let mut prev_key: Option<Vec<u8>> = None;
        let mut row_count = 0u64;

        loop {
            let record_offset = self.offset;
            let (key, _value) = match self.read_row()? {
                Some(row) => row,
                None => break,
            };
            row_count += 1;

            if flags != 0 {
                if let Some(prev) = &prev_key {
                    match prev.as_slice().cmp(&key) {
                        Ordering::Less => flags &= FLAG_ASCENDING,
                        Ordering::Greater => flags &= FLAG_DESCENDING,
                        Ordering::Equal => {}
                    }
                }
            }

            let slot = key_hash(self.header.major_version, &key) % self.index_size;
            key_buffer.push((slot, record_offset));
            prev_key = Some(key);

            if key_buffer.len() >= KEY_BUFFER_MAX {
                // The scan never revisits consumed pages; let them go.
                let consumed = (record_offset as usize) & !0xfff;
                if consumed != 0 {
                    self.map.advise_dontneed(0, consumed).map_err(Error::from)?;
                }
                self.flush_key_buffer(&mut key_buffer)?;
            }
        }
        self.flush_key_buffer(&mut key_buffer)?;

        self.set_flags(flags)?;
        if let Map::Rw(map) = &self.map {
            map.flush()
                .map_err(|e| Error::Io(format!("msync {}: {e}", self.path.display())))?;
        }

        debug!(
            "rebuilt hash index of {}: {row_count} rows, {} slots",
            self.path.display(),
            self.index_size
        );
        self.seek(SeekFrom::Start(0))
    }

    /// Drains `(slot, offset)` pairs into the index, resolving collisions by
    /// forward scan to the first empty slot.
    fn flush_key_buffer(&mut self, key_buffer: &mut Vec<(u64, u64)>) -> Result<()> {
        if !self.madvised_index {
            self.madvise_index()?;
        }

        key_buffer.sort_unstable();
        for &(slot, offset) in key_buffer.iter() {
            let mut slot = slot;
            while self.slot(slot) != 0 {
                slot += 1;
                if slot == self.index_size {
                    slot = 0;
                }
            }
            self.set_slot(slot, offset)?;
        }

        key_buffer.clear();
        Ok(())
    }

    fn madvise_index(&mut self) -> Result<()> {
        // Page-align the start; the region runs to the end of the file.
        let base = (self.header.index_offset as usize) & !0xfff;
        let len = self.map.bytes().len() - base;
        self.map
            .advise_range(Advice::WillNeed, base, len)
            .map_err(Error::from)?;
        self.madvised_index = true;
        Ok(())
    }

    fn rows_present(&self) -> bool {
        let bytes = self.map.bytes();
        (HEADER_SIZE as u64) < self.header.index_offset && bytes[HEADER_SIZE] != 0
    }

    fn index_unpopulated(&self) -> bool {
        self.map.bytes()[self.header.index_offset as usize..]
            .iter()
            .all(|&b| b == 0)
    }

    fn slot(&self, index: u64) -> u64 {
        let base = self.header.index_offset as usize + index as usize * self.slot_width.bytes();
        let bytes = self.map.bytes();
        match self.slot_width {
            SlotWidth::U16 => u64::from(LittleEndian::read_u16(&bytes[base..base + 2])),
            SlotWidth::U32 => u64::from(LittleEndian::read_u32(&bytes[base..base + 4])),
            SlotWidth::U64 => LittleEndian::read_u64(&bytes[base..base + 8]),
        }
    }

    fn set_slot(&mut self, index: u64, value: u64) -> Result<()> {
        let width = self.slot_width;
        let base = self.header.index_offset as usize + index as usize * width.bytes();
        let bytes = match self.map.bytes_mut() {
            Some(bytes) => bytes,
            None => return errusage!("hash index write on a read-only table"),
        };
        match width {
            SlotWidth::U16 => LittleEndian::write_u16(&mut bytes[base..base + 2], value as u16),
            SlotWidth::U32 => LittleEndian::write_u32(&mut bytes[base..base + 4], value as u32),
            SlotWidth::U64 => LittleEndian::write_u64(&mut bytes[base..base + 8], value),
        }
        Ok(())
    }

    fn set_flags(&mut self, flags: u16) -> Result<()> {
        let bytes = match self.map.bytes_mut() {
            Some(bytes) => bytes,
            None => return errusage!("flags write on a read-only table"),
        };
        // The flags field sits after the magic and the two version bytes.
        LittleEndian::write_u16(&mut bytes[10..12], flags);
        self.header.flags = flags;
        Ok(())
    }
}
