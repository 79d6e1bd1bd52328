//! Dump File Memory Source
//!
//! Memory source implementation for reading from dump files (MDMP and raw
//! dumps described by a maps file).

use anyhow::{bail, Context, Result};
use byteorder::{ByteOrder, LE};
use memmap2::Mmap;
use std::fs::File;
use std::path::{Path, PathBuf};

use wildmap::source::parse_maps;
use wildmap::{MemoryRegion, MemorySource};

/// Bytes of one region inside the file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Block {
    start: u64,
    end: u64,
    file_offset: u64,
}

/// Memory dump file source
pub struct DumpFile {
    /// Memory-mapped dump file
    mmap: Mmap,
    /// Virtual address regions parsed from dump or maps file
    regions: Vec<MemoryRegion>,
    blocks: Vec<Block>,
    /// Path to the dump file
    pub path: PathBuf,
}

impl DumpFile {
    /// MDMP signature "MDMP" in little-endian
    const MDMP_SIGNATURE: u32 = 0x504D444D;

    /// MDMP stream types
    const MEMORY_64_LIST_STREAM: u32 = 9;

    /// Open a memory dump file
    ///
    /// Supports:
    /// - Minidump (MDMP) format, auto-detected by the "MDMP" signature
    /// - Raw dumps with a `.maps` file next to them
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mmap = map_file(&path)?;

        if mmap.len() >= 4 && LE::read_u32(&mmap[0..4]) == Self::MDMP_SIGNATURE {
            tracing::info!("Detected Minidump (MDMP) format");
            let blocks = parse_mdmp(&mmap)?;
            return Ok(Self::from_blocks(mmap, blocks, path));
        }

        let maps_path = path.with_extension("maps");
        if !maps_path.exists() {
            bail!(
                "{} is not a minidump and has no {} next to it, pass --maps",
                path.display(),
                maps_path.display()
            );
        }
        Self::with_maps(mmap, path, &maps_path)
    }

    /// Open a dump with an explicit maps file
    pub fn open_with_maps<P: AsRef<Path>, Q: AsRef<Path>>(dump_path: P, maps_path: Q) -> Result<Self> {
        let dump_path = dump_path.as_ref().to_path_buf();
        let mmap = map_file(&dump_path)?;

        if mmap.len() >= 4 && LE::read_u32(&mmap[0..4]) == Self::MDMP_SIGNATURE {
            let blocks = parse_mdmp(&mmap)?;
            return Ok(Self::from_blocks(mmap, blocks, dump_path));
        }
        Self::with_maps(mmap, dump_path, maps_path.as_ref())
    }

    fn from_blocks(mmap: Mmap, blocks: Vec<Block>, path: PathBuf) -> Self {
        let regions = blocks
            .iter()
            .map(|b| {
                let mut region = MemoryRegion::new(b.start, b.end, "rw-p");
                region.offset = b.file_offset;
                region
            })
            .collect();

        DumpFile {
            mmap,
            regions,
            blocks,
            path,
        }
    }

    /// Raw dump described by a maps file
    ///
    /// The `0xSTART 0xEND SIZE OFFSET` listing gives file offsets. A
    /// /proc style table means the file is laid out linearly by address.
    fn with_maps(mmap: Mmap, path: PathBuf, maps_path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(maps_path)
            .with_context(|| format!("Failed to open maps file: {:?}", maps_path))?;
        let regions = parse_maps(&text);
        let listing = text
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty() && !line.starts_with('#'))
            .map_or(false, |line| line.starts_with("0x"));

        let blocks = regions
            .iter()
            .map(|r| Block {
                start: r.start,
                end: r.end,
                file_offset: if listing { r.offset } else { r.start },
            })
            .collect();

        tracing::info!(
            dump = %path.display(),
            mb = mmap.len() / 1_000_000,
            regions = regions.len(),
            "Opened dump file"
        );

        Ok(DumpFile {
            mmap,
            regions,
            blocks,
            path,
        })
    }

    /// Size of the dump file in bytes
    pub fn file_size(&self) -> usize {
        self.mmap.len()
    }

    /// Convert virtual address to file offset
    fn va_to_offset(&self, va: u64) -> Option<(usize, u64)> {
        let block = self.blocks.iter().find(|b| va >= b.start && va < b.end)?;
        let offset = block.file_offset + (va - block.start);
        Some((offset as usize, block.end - va))
    }
}

fn map_file(path: &Path) -> Result<Mmap> {
    let file = File::open(path).with_context(|| format!("Failed to open dump file: {:?}", path))?;

    // SAFETY: the dump is opened read only and not expected to change while mapped
    let mmap = unsafe { Mmap::map(&file) }
        .with_context(|| format!("Failed to mmap dump file: {:?}", path))?;
    Ok(mmap)
}

/// Memory ranges of the Memory64List stream
fn parse_mdmp(data: &[u8]) -> Result<Vec<Block>> {
    if data.len() < 32 {
        bail!("MDMP file too small for header");
    }

    let num_streams = LE::read_u32(&data[0x08..0x0C]) as usize;
    let stream_dir_rva = LE::read_u32(&data[0x0C..0x10]) as usize;

    tracing::debug!(
        streams = num_streams,
        directory = format_args!("{:#x}", stream_dir_rva),
        "MDMP header"
    );

    for i in 0..num_streams {
        let entry_offset = stream_dir_rva + i * 12;
        if entry_offset + 12 > data.len() {
            break;
        }

        let stream_type = LE::read_u32(&data[entry_offset..entry_offset + 4]);
        let rva = LE::read_u32(&data[entry_offset + 8..entry_offset + 12]) as usize;
        if stream_type != DumpFile::MEMORY_64_LIST_STREAM {
            continue;
        }

        if rva + 16 > data.len() {
            bail!("Memory64ListStream header out of bounds");
        }

        let num_ranges = LE::read_u64(&data[rva..rva + 8]) as usize;
        let mut file_offset = LE::read_u64(&data[rva + 8..rva + 16]);

        let mut blocks = Vec::with_capacity(num_ranges.min(data.len() / 16));
        for j in 0..num_ranges {
            let desc_offset = rva + 16 + j * 16;
            if desc_offset + 16 > data.len() {
                break;
            }

            let start = LE::read_u64(&data[desc_offset..desc_offset + 8]);
            let size = LE::read_u64(&data[desc_offset + 8..desc_offset + 16]);

            blocks.push(Block {
                start,
                end: start + size,
                file_offset,
            });
            file_offset += size;
        }

        tracing::info!(ranges = blocks.len(), "Parsed memory ranges from MDMP");
        return Ok(blocks);
    }

    bail!("No Memory64ListStream found in MDMP - dump may be incomplete")
}

impl MemorySource for DumpFile {
    fn read_bytes(&self, address: u64, size: usize) -> wildmap::Result<Vec<u8>> {
        let (offset, room) = self.va_to_offset(address).ok_or_else(|| wildmap::Error::Read {
            address,
            size,
            reason: "out of dump range".to_string(),
        })?;

        let available = (self.mmap.len().saturating_sub(offset) as u64).min(room) as usize;
        if available < size {
            return Err(wildmap::Error::ShortRead {
                address,
                wanted: size,
                got: available,
            });
        }

        Ok(self.mmap[offset..offset + size].to_vec())
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
    use std::io::Write;

    fn minidump(ranges: &[(u64, &[u8])]) -> Vec<u8> {
        let mut out = vec![0u8; 32];
        LE::write_u32(&mut out[0..4], DumpFile::MDMP_SIGNATURE);
        LE::write_u32(&mut out[0x08..0x0C], 1);
        LE::write_u32(&mut out[0x0C..0x10], 0x20);

        let list = 0x2C;
        let data = list + 16 + ranges.len() * 16;
        let mut entry = [0u8; 12];
        LE::write_u32(&mut entry[0..4], DumpFile::MEMORY_64_LIST_STREAM);
        LE::write_u32(&mut entry[8..12], list as u32);
        out.extend_from_slice(&entry);

        let mut header = [0u8; 16];
        LE::write_u64(&mut header[0..8], ranges.len() as u64);
        LE::write_u64(&mut header[8..16], data as u64);
        out.extend_from_slice(&header);
        for (start, bytes) in ranges {
            let mut desc = [0u8; 16];
            LE::write_u64(&mut desc[0..8], *start);
            LE::write_u64(&mut desc[8..16], bytes.len() as u64);
            out.extend_from_slice(&desc);
        }
        for (_, bytes) in ranges {
            out.extend_from_slice(bytes);
        }
        out
    }

    #[test]
    fn test_minidump_ranges() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("core.dmp");
        std::fs::write(&path, minidump(&[(0x1000, b"ABCD"), (0x8000, b"wxyz")])).unwrap();

        let dump = DumpFile::open(&path).unwrap();
        assert_eq!(dump.regions().len(), 2);
        assert_eq!(dump.read_bytes(0x1001, 2).unwrap(), b"BC".to_vec());
        assert_eq!(dump.read_u32(0x8000).unwrap(), u32::from_le_bytes(*b"wxyz"));
        assert!(matches!(
            dump.read_bytes(0x1002, 4),
            Err(wildmap::Error::ShortRead { got: 2, .. })
        ));
        assert!(dump.read_bytes(0x2000, 1).is_err());
    }

    #[test]
    fn test_raw_dump_with_listing() {
        let dir = tempfile::tempdir().unwrap();
        let dump_path = dir.path().join("raw.bin");
        let maps_path = dir.path().join("raw.maps");

        std::fs::write(&dump_path, b"....hello world").unwrap();
        let mut maps = File::create(&maps_path).unwrap();
        writeln!(maps, "# start end size offset").unwrap();
        writeln!(maps, "0x7f0000 0x7f000b 0xb 0x4").unwrap();

        let dump = DumpFile::open(&dump_path).unwrap();
        assert_eq!(dump.read_bytes(0x7f0006, 5).unwrap(), b"world".to_vec());
        assert_eq!(dump.file_size(), 15);
    }

    #[test]
    fn test_raw_dump_needs_maps() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("raw.bin");
        std::fs::write(&path, b"not a minidump").unwrap();
        assert!(DumpFile::open(&path).is_err());
    }
}
