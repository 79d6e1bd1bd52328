//! Core CLI definitions

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use wildmap::AddressModel;

use super::heap::HeapCommand;

#[derive(Parser)]
#[command(name = "wildmap")]
#[command(about = "Address space and heap layout of process dumps", long_about = None)]
pub struct Cli {
    /// Attach to a running process
    #[arg(short, long, global = true, conflicts_with = "dump")]
    pub pid: Option<u32>,

    /// Memory dump file (minidump, or raw with a .maps file next to it)
    #[arg(short, long, global = true)]
    pub dump: Option<PathBuf>,

    /// Mapping table of the dump (/proc format or `0xSTART 0xEND SIZE OFFSET`)
    #[arg(short, long, global = true)]
    pub maps: Option<PathBuf>,

    /// Symbol file (TOML), overrides the configured one
    #[arg(short, long, global = true)]
    pub symbols: Option<PathBuf>,

    /// Raise log verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Print results as JSON
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Where the analysed bytes come from
#[derive(Debug, Clone, Default)]
pub struct TargetArgs {
    pub pid: Option<u32>,
    pub dump: Option<PathBuf>,
    pub maps: Option<PathBuf>,
    pub symbols: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show the target and what was found in it
    #[command(visible_alias = "i")]
    Info,

    /// Show the mapping table
    Maps,

    /// List registered rings
    Rings,

    /// Show the spans of a ring, e.g. `heap`, `core.1` or `3.17`
    Ring {
        /// Provider path
        path: String,
    },

    /// Classify the address space
    #[command(visible_alias = "w")]
    World {
        /// Bytes nobody owns
        #[arg(long)]
        unused: bool,

        /// Overlapping owners
        #[arg(long)]
        conflict: bool,

        /// Owned ranges without bytes
        #[arg(long = "virtual")]
        virtual_: bool,
    },

    /// List runs of readable bytes
    Physical {
        /// Leave out bytes claimed by heaps
        #[arg(long)]
        no_heap: bool,
    },

    /// Heap operations (status, lookup, chunks)
    #[command(visible_alias = "h")]
    Heap {
        #[command(subcommand)]
        command: HeapCommand,
    },

    /// Find a byte pattern in readable memory
    Search {
        /// Pattern as hex (e.g. "deadbeef" or "de ad be ef")
        pattern: String,
    },

    /// Write memory to `_<start>.chunk` files
    Save {
        /// Output directory
        dir: PathBuf,

        /// First address (hex)
        #[arg(long)]
        lo: Option<String>,

        /// End address, exclusive (hex)
        #[arg(long)]
        hi: Option<String>,

        /// Fill gaps with zeroes instead of starting a new file
        #[arg(long)]
        pad: bool,
    },

    /// Configure default settings
    #[command(visible_alias = "c")]
    Configure {
        /// Show current configuration
        #[arg(long)]
        show: bool,

        #[arg(long)]
        page_size: Option<u64>,

        #[arg(long)]
        word_size: Option<usize>,

        /// Gap merged between plausible address ranges
        #[arg(long)]
        granularity: Option<u64>,

        /// Default symbol file
        #[arg(long)]
        symbols_file: Option<PathBuf>,

        /// Heap implementations to try, in order (repeatable)
        #[arg(long)]
        allocator: Vec<String>,

        /// Address model (basic, amd64)
        #[arg(long)]
        address_model: Option<AddressModel>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::HeapCommand;

    #[test]
    fn test_global_options_after_subcommand() {
        let cli = Cli::try_parse_from(["wildmap", "heap", "lookup", "0x1000", "--dump", "core.dmp", "-vv"]).unwrap();
        assert_eq!(cli.dump, Some(PathBuf::from("core.dmp")));
        assert_eq!(cli.verbose, 2);
        assert!(matches!(
            cli.command,
            Commands::Heap {
                command: HeapCommand::Lookup { .. }
            }
        ));
    }

    #[test]
    fn test_pid_and_dump_conflict() {
        assert!(Cli::try_parse_from(["wildmap", "--pid", "1", "--dump", "x", "info"]).is_err());
    }

    #[test]
    fn test_configure_allocators() {
        let cli = Cli::try_parse_from([
            "wildmap",
            "configure",
            "--allocator",
            "lfalloc",
            "--allocator",
            "glibc",
            "--address-model",
            "amd64",
        ])
        .unwrap();
        match cli.command {
            Commands::Configure {
                allocator,
                address_model,
                ..
            } => {
                assert_eq!(allocator, vec!["lfalloc", "glibc"]);
                assert_eq!(address_model, Some(AddressModel::Amd64));
            }
            _ => panic!("expected configure"),
        }
    }

    #[test]
    fn test_world_virtual_flag() {
        let cli = Cli::try_parse_from(["wildmap", "world", "--virtual"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::World {
                virtual_: true,
                unused: false,
                conflict: false
            }
        ));
    }
}
