//! Memory Region Types
//!
//! Rows of a process mapping table as read from /proc/pid/maps or a saved
//! copy of it.

use serde::{Deserialize, Serialize};
use std::ops::BitOr;

use crate::maps::Range;

/// Permission flags of a mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Perms(u8);

impl Perms {
    pub const NONE: Perms = Perms(0);
    pub const READ: Perms = Perms(1);
    pub const WRITE: Perms = Perms(2);
    pub const EXEC: Perms = Perms(4);
    pub const SHARED: Perms = Perms(8);

    /// Parse the `rwxp` column of a maps line
    pub fn parse(text: &str) -> Perms {
        let bytes = text.as_bytes();
        let mut flags = Perms::NONE;
        if bytes.first() == Some(&b'r') {
            flags = flags | Perms::READ;
        }
        if bytes.get(1) == Some(&b'w') {
            flags = flags | Perms::WRITE;
        }
        if bytes.get(2) == Some(&b'x') {
            flags = flags | Perms::EXEC;
        }
        if bytes.get(3) == Some(&b's') {
            flags = flags | Perms::SHARED;
        }
        flags
    }

    pub fn has(self, other: Perms) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn bits(self) -> u8 {
        self.0
    }
}

impl BitOr for Perms {
    type Output = Perms;

    fn bitor(self, rhs: Perms) -> Perms {
        Perms(self.0 | rhs.0)
    }
}

/// What backs a mapping
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Entity {
    Anonymous,
    Mapped {
        inode: u64,
        offset: u64,
        path: String,
    },
    Stack,
    Heap,
    /// Kernel provided areas such as `[vdso]`
    Special(String),
}

/// A memory region from /proc/pid/maps
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryRegion {
    pub start: u64,
    pub end: u64,
    pub perms: String,
    pub offset: u64,
    #[serde(default)]
    pub inode: u64,
    pub path: Option<String>,
}

impl MemoryRegion {
    /// Anonymous region with the given permissions
    pub fn new(start: u64, end: u64, perms: &str) -> Self {
        Self {
            start,
            end,
            perms: perms.to_string(),
            offset: 0,
            inode: 0,
            path: None,
        }
    }

    /// Same region backed by a file
    pub fn with_path(mut self, path: &str, offset: u64, inode: u64) -> Self {
        self.path = Some(path.to_string());
        self.offset = offset;
        self.inode = inode;
        self
    }

    pub fn size(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn range(&self) -> Range {
        Range::bounded(self.start, self.end.max(self.start)).unwrap_or(Range::point(self.start))
    }

    pub fn contains(&self, address: u64) -> bool {
        address >= self.start && address < self.end
    }

    pub fn flags(&self) -> Perms {
        Perms::parse(&self.perms)
    }

    pub fn is_readable(&self) -> bool {
        self.flags().has(Perms::READ)
    }

    pub fn is_writable(&self) -> bool {
        self.flags().has(Perms::WRITE)
    }

    pub fn is_executable(&self) -> bool {
        self.flags().has(Perms::EXEC)
    }

    pub fn is_shared(&self) -> bool {
        self.flags().has(Perms::SHARED)
    }

    pub fn entity(&self) -> Entity {
        match self.path.as_deref() {
            None | Some("") => Entity::Anonymous,
            Some("[stack]") => Entity::Stack,
            Some("[heap]") => Entity::Heap,
            Some(name) if name.starts_with("[stack:") => Entity::Stack,
            Some(name) if name.starts_with('[') => Entity::Special(name.to_string()),
            Some(path) => Entity::Mapped {
                inode: self.inode,
                offset: self.offset,
                path: path.to_string(),
            },
        }
    }

    /// Backed by a file on disk
    pub fn is_file(&self) -> bool {
        matches!(self.entity(), Entity::Mapped { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_region_size() {
        let region = MemoryRegion::new(0x1000, 0x2000, "rw-p");
        assert_eq!(region.size(), 0x1000);
        assert_eq!(region.range(), Range::bounded(0x1000, 0x2000).unwrap());
    }

    #[test]
    fn test_perms() {
        let region = MemoryRegion::new(0, 0x1000, "r-xs");
        assert!(region.is_readable());
        assert!(!region.is_writable());
        assert!(region.is_executable());
        assert!(region.is_shared());
        assert_eq!(region.flags().bits(), 1 | 4 | 8);

        let none = MemoryRegion::new(0, 0x1000, "---p");
        assert_eq!(none.flags(), Perms::NONE);
        assert!(!none.is_readable());
    }

    #[test]
    fn test_entity() {
        assert_eq!(MemoryRegion::new(0, 1, "rw-p").entity(), Entity::Anonymous);

        let stack = MemoryRegion::new(0, 1, "rw-p").with_path("[stack]", 0, 0);
        assert_eq!(stack.entity(), Entity::Stack);

        let vdso = MemoryRegion::new(0, 1, "r-xp").with_path("[vdso]", 0, 0);
        assert_eq!(vdso.entity(), Entity::Special("[vdso]".to_string()));

        let lib = MemoryRegion::new(0, 1, "r-xp").with_path("/usr/lib/libc.so.6", 0x28000, 42);
        assert_eq!(
            lib.entity(),
            Entity::Mapped {
                inode: 42,
                offset: 0x28000,
                path: "/usr/lib/libc.so.6".to_string()
            }
        );
        assert!(lib.is_file());
    }
}
