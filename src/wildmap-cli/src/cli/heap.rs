//! Heap command CLI definitions

use clap::Subcommand;

#[derive(Subcommand)]
pub enum HeapCommand {
    /// Show discovery status of each heap implementation
    Status,

    /// Show how an address relates to the heaps
    Lookup {
        /// Address (hex, with or without 0x)
        address: String,
    },

    /// List chunks in use
    Chunks {
        /// Requested size to match (repeatable, hex or decimal)
        #[arg(long)]
        size: Vec<String>,

        /// Smallest requested size
        #[arg(long, conflicts_with = "size")]
        min: Option<String>,

        /// Largest requested size, exclusive
        #[arg(long, conflicts_with = "size")]
        max: Option<String>,

        /// Only blocks served by their own mapping
        #[arg(long, conflicts_with = "small")]
        huge: bool,

        /// Skip blocks served by their own mapping
        #[arg(long)]
        small: bool,

        /// Maximum number of chunks to show
        #[arg(short, long, default_value = "100")]
        limit: usize,
    },
}
