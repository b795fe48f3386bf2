//! The block index: one `(block byte size, last key)` descriptor per emitted
//! block, appended after the data terminator.
//!
//! Layout: `varint(count)`, then `count` little-endian u32 block sizes, then
//! `count` u32 key lengths, then the concatenated last-key bytes.

use byteorder::{LittleEndian, WriteBytesExt};

use crate::encoding::varint;

pub struct BlockIndex {
    block_sizes: Vec<u32>,

    key_sizes: Vec<u32>,
    key_data: Vec<u8>,
}

impl BlockIndex {
    pub fn new() -> Self {
        Self {
            block_sizes: Vec::new(),
            key_sizes: Vec::new(),
            key_data: Vec::new(),
        }
    }

    pub fn add(&mut self, block_size: u32, last_key: &[u8]) {
        self.block_sizes.push(block_size);
        self.key_sizes.push(last_key.len() as u32);
        self.key_data.extend_from_slice(last_key);
    }

    pub fn block_count(&self) -> usize {
        self.block_sizes.len()
    }

    /// Replaces `out` with the marshaled index. An empty index marshals to
    /// zero bytes.
    pub fn marshal(&self, out: &mut Vec<u8>) {
        out.clear();
        if self.block_sizes.is_empty() {
            return;
        }

        let count = self.block_sizes.len();
        out.reserve(varint::encoded_len(count as u64) + 8 * count + self.key_data.len());

        varint::encode(out, count as u64);
        for &size in &self.block_sizes {
            out.write_u32::<LittleEndian>(size).unwrap();
        }
        for &key_size in &self.key_sizes {
            out.write_u32::<LittleEndian>(key_size).unwrap();
        }
        out.extend_from_slice(&self.key_data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_marshal_layout() {
        let mut index = BlockIndex::new();
        index.add(300, b"bandana");
        index.add(17, b"cherry");

        let mut buf = Vec::new();
        index.marshal(&mut buf);

        let mut expected = vec![2u8]; // count
        expected.extend_from_slice(&300u32.to_le_bytes());
        expected.extend_from_slice(&17u32.to_le_bytes());
        expected.extend_from_slice(&7u32.to_le_bytes());
        expected.extend_from_slice(&6u32.to_le_bytes());
        expected.extend_from_slice(b"bandanacherry");

        assert_eq!(buf, expected);
        assert_eq!(index.block_count(), 2);
    }

    #[test]
    fn test_empty_marshals_to_nothing() {
        let index = BlockIndex::new();
        let mut buf = vec![0xaa];
        index.marshal(&mut buf);
        assert!(buf.is_empty());
    }
}
