//! Collaborator traits
//!
//! Everything the engine learns about a target goes through these: raw
//! bytes, the mapping table, struct layouts and symbol addresses.

use byteorder::{ByteOrder, LE};

use super::symbols::StructLayout;
use super::MemoryRegion;
use crate::error::{Error, Result};

/// Trait for reading memory from various sources (live process, dump file, etc.)
///
/// A read that cannot deliver every requested byte must fail with
/// [`Error::ShortRead`] or [`Error::Read`], never pad.
pub trait MemorySource: Send + Sync {
    /// Read bytes from a virtual address
    fn read_bytes(&self, address: u64, size: usize) -> Result<Vec<u8>>;

    /// Get the list of memory regions
    fn regions(&self) -> &[MemoryRegion];

    /// Check if this is a live (writable) source
    fn is_live(&self) -> bool;

    /// Read a u64 from memory
    fn read_u64(&self, address: u64) -> Result<u64> {
        let bytes = self.read_bytes(address, 8)?;
        Ok(LE::read_u64(&bytes))
    }

    /// Read a u32 from memory
    fn read_u32(&self, address: u64) -> Result<u32> {
        let bytes = self.read_bytes(address, 4)?;
        Ok(LE::read_u32(&bytes))
    }

    fn read_i32(&self, address: u64) -> Result<i32> {
        let bytes = self.read_bytes(address, 4)?;
        Ok(LE::read_i32(&bytes))
    }

    /// Read an unsigned machine word of 4 or 8 bytes
    fn read_word(&self, address: u64, width: usize) -> Result<u64> {
        match width {
            4 => self.read_u32(address).map(u64::from),
            8 => self.read_u64(address),
            _ => Err(Error::Read {
                address,
                size: width,
                reason: "unsupported word width".to_string(),
            }),
        }
    }

    /// Find a region containing the given address
    fn find_region(&self, address: u64) -> Option<&MemoryRegion> {
        self.regions().iter().find(|r| r.contains(address))
    }

    /// Check if an address is readable
    fn is_readable(&self, address: u64) -> bool {
        self.find_region(address)
            .map(|r| r.is_readable())
            .unwrap_or(false)
    }
}

/// Struct layouts and symbol addresses of the target
pub trait SymbolAccessor: Send + Sync {
    /// Layout of a named struct type
    fn resolve(&self, type_name: &str) -> Option<StructLayout>;

    /// Address of a named symbol
    fn addr(&self, symbol: &str) -> Option<u64>;

    fn require(&self, type_name: &str) -> Result<StructLayout> {
        self.resolve(type_name)
            .ok_or_else(|| Error::Symbol(format!("type {}", type_name)))
    }

    fn require_addr(&self, symbol: &str) -> Result<u64> {
        self.addr(symbol)
            .ok_or_else(|| Error::Symbol(format!("symbol {}", symbol)))
    }
}

/// Cheap check made before following a pointer read from the target
pub trait AddressValidator {
    fn is_plausible(&self, address: u64) -> bool;
}

/// Source of the process mapping table
pub trait ProcessMapReader {
    fn read_maps(&self) -> Result<Vec<MemoryRegion>>;
}
