//! Index node blocks: a count followed by `{key, sector}` entries.
//! The key of entry 0 is never consulted.

use byteorder::{ByteOrder, LittleEndian};

const HEADER: usize = 8;
const ENTRY: usize = 16;

/// Index entries that fit in a node of `block_size` bytes
pub fn capacity(block_size: usize) -> usize {
    (block_size - HEADER) / ENTRY
}

pub struct Node<B> {
    buf: B,
}

impl<B: AsRef<[u8]>> Node<B> {
    pub fn new(buf: B) -> Self {
        Self { buf }
    }

    fn data(&self) -> &[u8] {
        self.buf.as_ref()
    }

    pub fn count(&self) -> usize {
        LittleEndian::read_u32(&self.data()[0..4]) as usize
    }

    fn entry_at(index: usize) -> usize {
        HEADER + index * ENTRY
    }

    pub fn key(&self, index: usize) -> u64 {
        LittleEndian::read_u64(&self.data()[Self::entry_at(index)..])
    }

    pub fn sector(&self, index: usize) -> u64 {
        LittleEndian::read_u64(&self.data()[Self::entry_at(index) + 8..])
    }

    /// Index just past the child whose range holds `chunk`
    pub fn probe_next(&self, chunk: u64) -> usize {
        let count = self.count();
        let mut next = 1;
        while next < count && self.key(next) <= chunk {
            next += 1;
        }
        next
    }
}

impl<B: AsRef<[u8]> + AsMut<[u8]>> Node<B> {
    fn data_mut(&mut self) -> &mut [u8] {
        self.buf.as_mut()
    }

    pub fn init(&mut self) {
        self.data_mut().fill(0);
    }

    pub fn set_count(&mut self, count: usize) {
        LittleEndian::write_u32(&mut self.data_mut()[0..4], count as u32);
    }

    pub fn set_entry(&mut self, index: usize, key: u64, sector: u64) {
        let at = Self::entry_at(index);
        let data = self.data_mut();
        LittleEndian::write_u64(&mut data[at..at + 8], key);
        LittleEndian::write_u64(&mut data[at + 8..at + 16], sector);
    }

    pub fn set_key(&mut self, index: usize, key: u64) {
        let at = Self::entry_at(index);
        LittleEndian::write_u64(&mut self.data_mut()[at..at + 8], key);
    }

    /// Insert a child pointer before entry `at`
    pub fn insert_child(&mut self, at: usize, sector: u64, key: u64) {
        let count = self.count();
        let from = Self::entry_at(at);
        let to = Self::entry_at(count);
        self.data_mut().copy_within(from..to, from + ENTRY);
        self.set_entry(at, key, sector);
        self.set_count(count + 1);
    }

    /// Remove entry `at`, shifting the later entries down
    pub fn remove(&mut self, at: usize) {
        let count = self.count();
        let from = Self::entry_at(at + 1);
        let to = Self::entry_at(count);
        self.data_mut().copy_within(from..to, Self::entry_at(at));
        self.set_count(count - 1);
    }

    /// Move entries from `half` onward into the empty node `other`
    pub fn split_into(&mut self, other: &mut [u8], half: usize) {
        let count = self.count();
        let from = Self::entry_at(half);
        let to = Self::entry_at(count);
        other[HEADER..HEADER + (to - from)].copy_from_slice(&self.data()[from..to]);
        Node::new(&mut *other).set_count(count - half);
        self.set_count(half);
    }

    /// Append all entries of `other`
    pub fn merge(&mut self, other: &[u8]) {
        let other = Node::new(other);
        let count = self.count();
        let ncount = other.count();
        let dst = Self::entry_at(count);
        let len = ncount * ENTRY;
        self.data_mut()[dst..dst + len]
            .copy_from_slice(&other.data()[HEADER..HEADER + len]);
        self.set_count(count + ncount);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node_with(keys: &[u64]) -> Vec<u8> {
        let mut block = vec![0u8; 4096];
        let mut node = Node::new(&mut block[..]);
        for (i, &key) in keys.iter().enumerate() {
            node.set_entry(i, key, 1000 + i as u64);
        }
        node.set_count(keys.len());
        block
    }

    #[test]
    fn test_probe_picks_covering_child() {
        let block = node_with(&[0, 100, 200]);
        let node = Node::new(&block[..]);
        assert_eq!(node.probe_next(5), 1);
        assert_eq!(node.probe_next(100), 2);
        assert_eq!(node.probe_next(199), 2);
        assert_eq!(node.probe_next(10_000), 3);
    }

    #[test]
    fn test_insert_remove() {
        let mut block = node_with(&[0, 100, 200]);
        let mut node = Node::new(&mut block[..]);
        node.insert_child(2, 77, 150);
        assert_eq!(node.count(), 4);
        assert_eq!((node.key(2), node.sector(2)), (150, 77));
        assert_eq!(node.key(3), 200);
        node.remove(1);
        assert_eq!(node.count(), 3);
        assert_eq!(node.key(1), 150);
    }

    #[test]
    fn test_split_and_merge() {
        let mut block = node_with(&[0, 10, 20, 30, 40]);
        let mut other = vec![0u8; 4096];
        let mut node = Node::new(&mut block[..]);
        node.split_into(&mut other, 2);
        assert_eq!(node.count(), 2);
        let right = Node::new(&other[..]);
        assert_eq!(right.count(), 3);
        assert_eq!(right.key(0), 20);
        node.merge(&other);
        assert_eq!(node.count(), 5);
        assert_eq!(node.key(4), 40);
        assert_eq!(node.sector(4), 1004);
        assert_eq!(capacity(4096), 255);
    }
}
