//! Accumulates sorted key/value pairs into a size-bounded block and marshals
//! them to the on-disk record stream.
//!
//! Keys and values are staged in separate buffers alongside their size
//! vectors; `marshal` interleaves them into self-delimiting records:
//!
//! ```text
//! varint(key_len + 1 + value_len) | key bytes | 0x00 | value bytes
//! ```
//!
//! The size bound applies to raw key and value bytes, so a marshaled block
//! is slightly larger than the bound by the record framing.

use crate::encoding::varint;

use super::BLOCK_SIZE_MAX;

pub struct BlockBuilder {
    key_sizes: Vec<u32>,
    key_data: Vec<u8>,

    value_sizes: Vec<u32>,
    value_data: Vec<u8>,

    // Size of the block once marshaled, maintained on every add.
    encoded_len: usize,
}

impl BlockBuilder {
    pub fn new() -> Self {
        Self {
            key_sizes: Vec::new(),
            key_data: Vec::new(),
            value_sizes: Vec::new(),
            value_data: Vec::new(),
            encoded_len: 0,
        }
    }

    /// Appends the pair if it fits, leaving the block untouched otherwise.
    pub fn add(&mut self, key: &[u8], value: &[u8]) -> bool {
        let key_total = self.key_data.len() + key.len();
        let value_total = self.value_data.len() + value.len();
        if key_total + value_total > BLOCK_SIZE_MAX {
            return false;
        }

        self.key_sizes.push(key.len() as u32);
        self.key_data.extend_from_slice(key);

        self.value_sizes.push(value.len() as u32);
        self.value_data.extend_from_slice(value);

        let record_size = (key.len() + 1 + value.len()) as u64;
        self.encoded_len += varint::encoded_len(record_size) + record_size as usize;

        true
    }

    pub fn clear(&mut self) {
        self.key_sizes.clear();
        self.key_data.clear();
        self.value_sizes.clear();
        self.value_data.clear();
        self.encoded_len = 0;
    }

    pub fn entry_count(&self) -> usize {
        self.key_sizes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.key_sizes.is_empty()
    }

    /// The number of bytes `marshal` will produce.
    pub fn encoded_len(&self) -> usize {
        self.encoded_len
    }

    /// Replaces `out` with the marshaled block. An empty block marshals to
    /// zero bytes.
    pub fn marshal(&self, out: &mut Vec<u8>) {
        out.clear();
        out.reserve(self.encoded_len);

        let mut key_pos = 0;
        let mut value_pos = 0;
        for (&key_size, &value_size) in self.key_sizes.iter().zip(&self.value_sizes) {
            let key = &self.key_data[key_pos..key_pos + key_size as usize];
            let value = &self.value_data[value_pos..value_pos + value_size as usize];
            key_pos += key_size as usize;
            value_pos += value_size as usize;

            varint::encode(out, (key.len() + 1 + value.len()) as u64);
            out.extend_from_slice(key);
            out.push(0);
            out.extend_from_slice(value);
        }

        debug_assert_eq!(out.len(), self.encoded_len);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_marshal_layout() {
        let mut block = BlockBuilder::new();
        assert!(block.add(b"apple", b"fruit"));
        assert!(block.add(b"band", b"music"));

        let mut buf = Vec::new();
        block.marshal(&mut buf);

        let mut expected = Vec::new();
        expected.push(11); // 5 + 1 + 5
        expected.extend_from_slice(b"apple");
        expected.push(0);
        expected.extend_from_slice(b"fruit");
        expected.push(10); // 4 + 1 + 5
        expected.extend_from_slice(b"band");
        expected.push(0);
        expected.extend_from_slice(b"music");

        assert_eq!(buf, expected);
        assert_eq!(buf.len(), block.encoded_len());
    }

    #[test]
    fn test_empty_marshals_to_nothing() {
        let block = BlockBuilder::new();
        let mut buf = vec![0xaa];
        block.marshal(&mut buf);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_refuses_when_full() {
        let mut block = BlockBuilder::new();
        let value = vec![0u8; BLOCK_SIZE_MAX - 8];
        assert!(block.add(b"key", &value));
        assert_eq!(block.entry_count(), 1);
        let before = block.encoded_len();

        // Would exceed the raw-byte bound; the block must not change.
        assert!(!block.add(b"key2", b"tiny value"));
        assert_eq!(block.entry_count(), 1);
        assert_eq!(block.encoded_len(), before);
    }

    #[test]
    fn test_clear() {
        let mut block = BlockBuilder::new();
        assert!(block.add(b"a", b"xxx"));
        block.clear();
        assert!(block.is_empty());
        assert_eq!(block.encoded_len(), 0);

        let mut buf = Vec::new();
        block.marshal(&mut buf);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_empty_key_record() {
        let mut block = BlockBuilder::new();
        assert!(block.add(b"", b"v"));
        let mut buf = Vec::new();
        block.marshal(&mut buf);
        assert_eq!(buf, vec![2, 0, b'v']);
    }
}
