//! Mock Memory Source
//!
//! Sparse synthetic memory images for testing heap walkers and World
//! queries without a live target.

use byteorder::{ByteOrder, LE};

use super::{MemoryRegion, MemorySource};
use crate::error::{Error, Result};

/// A mock memory source made of separate byte blocks
pub struct MockMemorySource {
    /// Blocks of memory as (base address, bytes), non overlapping
    pub blocks: Vec<(u64, Vec<u8>)>,
    /// Memory regions reported to callers
    pub regions: Vec<MemoryRegion>,
}

impl MockMemorySource {
    /// Create a new mock with data at given base address
    pub fn new(data: Vec<u8>, base_address: u64) -> Self {
        let end = base_address + data.len() as u64;
        Self {
            blocks: vec![(base_address, data)],
            regions: vec![MemoryRegion::new(base_address, end, "rw-p")],
        }
    }

    pub fn empty() -> Self {
        Self {
            blocks: Vec::new(),
            regions: Vec::new(),
        }
    }

    /// Add a zero filled block with a matching `rw-p` region
    pub fn with_block(mut self, base_address: u64, size: usize) -> Self {
        self.blocks.push((base_address, vec![0; size]));
        self.regions.push(MemoryRegion::new(
            base_address,
            base_address + size as u64,
            "rw-p",
        ));
        self
    }

    /// Replace the reported regions, blocks are left untouched
    pub fn with_regions(mut self, regions: Vec<MemoryRegion>) -> Self {
        self.regions = regions;
        self
    }

    fn block_mut(&mut self, address: u64, size: usize) -> Option<&mut [u8]> {
        self.blocks.iter_mut().find_map(|(base, data)| {
            let offset = address.checked_sub(*base)? as usize;
            data.get_mut(offset..offset + size)
        })
    }

    pub fn write_bytes(&mut self, address: u64, bytes: &[u8]) {
        match self.block_mut(address, bytes.len()) {
            Some(slot) => slot.copy_from_slice(bytes),
            None => panic!("mock write of {} bytes at {:#x} is unmapped", bytes.len(), address),
        }
    }

    pub fn write_u32(&mut self, address: u64, value: u32) {
        let mut buf = [0u8; 4];
        LE::write_u32(&mut buf, value);
        self.write_bytes(address, &buf);
    }

    pub fn write_u64(&mut self, address: u64, value: u64) {
        let mut buf = [0u8; 8];
        LE::write_u64(&mut buf, value);
        self.write_bytes(address, &buf);
    }

    /// Write a machine word of 4 or 8 bytes
    pub fn write_word(&mut self, address: u64, width: usize, value: u64) {
        match width {
            4 => self.write_u32(address, value as u32),
            _ => self.write_u64(address, value),
        }
    }
}

impl MemorySource for MockMemorySource {
    fn read_bytes(&self, address: u64, size: usize) -> Result<Vec<u8>> {
        let (base, data) = self
            .blocks
            .iter()
            .find(|(base, data)| address >= *base && address < base + data.len() as u64)
            .ok_or_else(|| Error::Read {
                address,
                size,
                reason: "unmapped".to_string(),
            })?;

        let offset = (address - base) as usize;
        let got = (data.len() - offset).min(size);
        if got < size {
            return Err(Error::ShortRead {
                address,
                wanted: size,
                got,
            });
        }

        Ok(data[offset..offset + size].to_vec())
    }

    fn regions(&self) -> &[MemoryRegion] {
        &self.regions
    }

    fn is_live(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_source_read_bytes() {
        let data = vec![0x41, 0x42, 0x43, 0x44]; // "ABCD"
        let source = MockMemorySource::new(data, 0x1000);

        let result = source.read_bytes(0x1000, 4).unwrap();
        assert_eq!(result, vec![0x41, 0x42, 0x43, 0x44]);

        let partial = source.read_bytes(0x1001, 2).unwrap();
        assert_eq!(partial, vec![0x42, 0x43]);
    }

    #[test]
    fn test_mock_source_read_words() {
        let data = vec![0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08];
        let source = MockMemorySource::new(data, 0x1000);

        assert_eq!(source.read_u64(0x1000).unwrap(), 0x0807060504030201);
        assert_eq!(source.read_u32(0x1000).unwrap(), 0x04030201);
        assert_eq!(source.read_word(0x1004, 4).unwrap(), 0x08070605);
        assert!(source.read_word(0x1000, 2).is_err());
    }

    #[test]
    fn test_mock_source_short_read() {
        let source = MockMemorySource::new(vec![0x41, 0x42, 0x43, 0x44], 0x1000);

        match source.read_bytes(0x1002, 10) {
            Err(Error::ShortRead { wanted, got, .. }) => {
                assert_eq!(wanted, 10);
                assert_eq!(got, 2);
            }
            other => panic!("unexpected {:?}", other),
        }

        assert!(matches!(
            source.read_bytes(0x500, 4),
            Err(Error::Read { .. })
        ));
    }

    #[test]
    fn test_mock_source_blocks() {
        let mut source = MockMemorySource::empty()
            .with_block(0x1000, 0x100)
            .with_block(0x8000, 0x100);
        source.write_word(0x8010, 4, 0xdeadbeef);
        source.write_u64(0x1008, 0x1122334455667788);

        assert_eq!(source.read_u32(0x8010).unwrap(), 0xdeadbeef);
        assert_eq!(source.read_u64(0x1008).unwrap(), 0x1122334455667788);
        assert_eq!(source.regions().len(), 2);
        assert!(source.read_u32(0x2000).is_err());
    }

    #[test]
    fn test_mock_source_find_region() {
        let source = MockMemorySource::new(vec![0; 0x2000], 0x1000).with_regions(vec![
            MemoryRegion::new(0x1000, 0x2000, "r--p"),
            MemoryRegion::new(0x2000, 0x3000, "-w-p"),
        ]);

        assert_eq!(source.find_region(0x1500).unwrap().start, 0x1000);
        assert_eq!(source.find_region(0x2500).unwrap().start, 0x2000);
        assert!(source.find_region(0x5000).is_none());

        assert!(source.is_readable(0x1500));
        assert!(!source.is_readable(0x2500));
        assert!(!source.is_live());
    }
}
