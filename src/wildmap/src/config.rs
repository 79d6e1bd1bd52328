//! Analysis settings handed to a session

use serde::{Deserialize, Serialize};

/// Validity model of pointers read from the target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressModel {
    /// Any address inside a known region
    #[default]
    Basic,
    /// Known regions, and canonical 48 bit x86_64 addresses only
    Amd64,
}

impl std::str::FromStr for AddressModel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "basic" => Ok(AddressModel::Basic),
            "amd64" | "x86_64" => Ok(AddressModel::Amd64),
            other => Err(format!("unknown address model: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    pub page_size: u64,
    pub word_size: usize,
    /// Gaps up to this size are merged when building the address set
    pub granularity: u64,
    pub address_model: AddressModel,
    /// Heap implementations to try, in order
    pub allocators: Vec<String>,
    /// How far a fragment may be extended to the left
    pub left_extend: u64,
    /// Largest chunk accepted while probing backwards
    pub max_chunk: u64,
    /// Smallest unclaimed place scanned for mmapped chunks
    pub mmap_scan: u64,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            page_size: 4096,
            word_size: 8,
            granularity: 64 * 1024,
            address_model: AddressModel::Basic,
            allocators: vec!["glibc".to_string()],
            left_extend: 1024 * 1024,
            max_chunk: 1024 * 1024,
            mmap_scan: 64 * 1024,
        }
    }
}
