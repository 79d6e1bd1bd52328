//! Process mapping table readers
//!
//! Two text formats are understood:
//! - `/proc/<pid>/maps`: `7f00-7f10 r-xp 00000000 08:01 1234 /usr/lib/libc.so.6`
//! - a two column dump listing: `0x7f00 0x7f10 0x10 0x0`

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use tracing::debug;

use super::traits::ProcessMapReader;
use super::MemoryRegion;
use crate::error::Result;

/// Where a mapping table comes from
#[derive(Debug, Clone)]
pub enum ProcMaps {
    Pid(u32),
    File(PathBuf),
}

impl ProcMaps {
    pub fn pid(pid: u32) -> Self {
        ProcMaps::Pid(pid)
    }

    pub fn file(path: impl AsRef<Path>) -> Self {
        ProcMaps::File(path.as_ref().to_path_buf())
    }

    fn path(&self) -> PathBuf {
        match self {
            ProcMaps::Pid(pid) => PathBuf::from(format!("/proc/{}/maps", pid)),
            ProcMaps::File(path) => path.clone(),
        }
    }
}

impl ProcessMapReader for ProcMaps {
    fn read_maps(&self) -> Result<Vec<MemoryRegion>> {
        let path = self.path();
        let reader = BufReader::new(File::open(&path)?);

        let mut regions = Vec::new();
        for line in reader.lines() {
            if let Some(region) = parse_line(&line?) {
                regions.push(region);
            }
        }

        debug!(path = %path.display(), count = regions.len(), "read mapping table");
        Ok(regions)
    }
}

/// Parse a whole mapping table, skipping lines that fit neither format
pub fn parse_maps(text: &str) -> Vec<MemoryRegion> {
    text.lines().filter_map(parse_line).collect()
}

/// Parse one line in either supported format
pub fn parse_line(line: &str) -> Option<MemoryRegion> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }

    if line.starts_with("0x") {
        parse_listing(line)
    } else {
        parse_proc(line)
    }
}

// 0xSTART 0xEND SIZE OFFSET
fn parse_listing(line: &str) -> Option<MemoryRegion> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() < 2 {
        return None;
    }

    let start = parse_hex(parts[0])?;
    let end = parse_hex(parts[1])?;
    if end < start {
        return None;
    }
    let offset = parts.get(3).and_then(|s| parse_hex(s)).unwrap_or(0);

    let mut region = MemoryRegion::new(start, end, "rw-p");
    region.offset = offset;
    Some(region)
}

fn parse_proc(line: &str) -> Option<MemoryRegion> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() < 5 {
        return None;
    }

    let (start, end) = parts[0].split_once('-')?;
    let start = u64::from_str_radix(start, 16).ok()?;
    let end = u64::from_str_radix(end, 16).ok()?;
    if end < start {
        return None;
    }

    let offset = u64::from_str_radix(parts[2], 16).ok()?;
    let inode = parts[4].parse::<u64>().ok()?;
    let path = if parts.len() > 5 {
        Some(parts[5..].join(" "))
    } else {
        None
    };

    Some(MemoryRegion {
        start,
        end,
        perms: parts[1].to_string(),
        offset,
        inode,
        path,
    })
}

fn parse_hex(text: &str) -> Option<u64> {
    let digits = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
        .unwrap_or(text);
    u64::from_str_radix(digits, 16).ok()
}
