//! Command handlers for wildmap CLI
//!
//! Each subcommand group has its own module with handler functions. They
//! share [`open`], which turns the global options into a [`Session`].

pub mod configure;
pub mod heap;
pub mod info;
pub mod world;

use anyhow::{bail, Context, Result};
use serde::Serialize;

use wildmap::source::ProcMaps;
use wildmap::{Interrupt, MemoryRegion, MemorySource, Process, ProcessMapReader, Session};

use crate::cli::TargetArgs;
use crate::config::Config;
use crate::memory::{self, DumpFile, LiveProcess};

/// An analysed target with what the CLI knows about its origin
pub struct Opened {
    pub session: Session,
    /// One line naming the process or dump
    pub origin: String,
    /// Mapping table used to build the world
    pub maps: Vec<MemoryRegion>,
}

/// Attach to the process or open the dump named by the global options
pub fn open(target: &TargetArgs) -> Result<Opened> {
    let config = Config::load()?;
    let mut analysis = config.analysis();

    let symbols_path = target.symbols.as_deref().or(config.symbols.as_deref());
    let symbols = memory::load_symbols(symbols_path, analysis.word_size)?;
    if let Some(word) = symbols.word {
        analysis.word_size = word;
    }

    let (source, origin, process): (Box<dyn MemorySource>, String, Process) = match (target.pid, &target.dump) {
        (Some(pid), _) => {
            let live = LiveProcess::attach(pid)?;
            let process = Process {
                maps: Some(live.maps.clone()),
                threads: live.threads(),
            };
            let origin = format!("pid {} ({}) {}", live.pid, live.name, live.exe_path.display());
            (Box::new(live) as Box<dyn MemorySource>, origin, process)
        }
        (None, Some(path)) => {
            let (dump, maps) = match &target.maps {
                Some(maps_path) => {
                    let maps = ProcMaps::file(maps_path)
                        .read_maps()
                        .with_context(|| format!("Failed to read maps from {}", maps_path.display()))?;
                    (DumpFile::open_with_maps(path, maps_path)?, Some(maps))
                }
                None => (DumpFile::open(path)?, None),
            };
            let origin = format!("dump {} ({} bytes)", dump.path.display(), dump.file_size());
            let process = Process {
                maps,
                threads: Vec::new(),
            };
            (Box::new(dump) as Box<dyn MemorySource>, origin, process)
        }
        (None, None) => bail!("No target given. Use --pid <PID> or --dump <FILE>"),
    };

    let maps = process
        .maps
        .clone()
        .unwrap_or_else(|| source.regions().to_vec());

    let session = Session::open_with(source, Box::new(symbols), analysis, process, Interrupt::new())
        .context("Failed to analyse target")?;

    Ok(Opened {
        session,
        origin,
        maps,
    })
}

/// Parse a hex address, the 0x prefix is optional
pub fn parse_address(text: &str) -> Result<u64> {
    let digits = text
        .trim()
        .trim_start_matches("0x")
        .trim_start_matches("0X")
        .replace('_', "");
    u64::from_str_radix(&digits, 16).with_context(|| format!("Invalid hex address: {}", text))
}

/// Parse a size, hex with a 0x prefix or decimal
pub fn parse_size(text: &str) -> Result<u64> {
    let text = text.trim();
    if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).with_context(|| format!("Invalid hex size: {}", text))
    } else {
        text.parse::<u64>()
            .with_context(|| format!("Invalid size: {}", text))
    }
}

/// Parse hex bytes, spaces between bytes are optional
pub fn parse_hex_bytes(text: &str) -> Result<Vec<u8>> {
    let digits: String = text.split_whitespace().collect();
    if digits.len() % 2 != 0 {
        bail!("Odd number of hex digits in {:?}", text);
    }

    digits
        .as_bytes()
        .chunks(2)
        .map(|pair| {
            let pair = std::str::from_utf8(pair).context("Invalid hex pattern")?;
            u8::from_str_radix(pair, 16).with_context(|| format!("Invalid hex byte: {}", pair))
        })
        .collect()
}

/// Print `value` as pretty JSON
pub fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_address() {
        assert_eq!(parse_address("0x7f00_0000").unwrap(), 0x7f00_0000);
        assert_eq!(parse_address("deadbeef").unwrap(), 0xdeadbeef);
        assert!(parse_address("0xzz").is_err());
    }

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("0x20").unwrap(), 32);
        assert_eq!(parse_size("20").unwrap(), 20);
        assert!(parse_size("-1").is_err());
    }

    #[test]
    fn test_parse_hex_bytes() {
        assert_eq!(parse_hex_bytes("de ad be ef").unwrap(), vec![0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(parse_hex_bytes("cafe").unwrap(), vec![0xca, 0xfe]);
        assert!(parse_hex_bytes("abc").is_err());
        assert!(parse_hex_bytes("zz").is_err());
    }

    #[test]
    fn test_open_without_target() {
        assert!(open(&TargetArgs::default()).is_err());
    }
}
