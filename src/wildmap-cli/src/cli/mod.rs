//! CLI argument definitions for wildmap
//!
//! This module contains all clap-derived structs and enums for CLI parsing.

mod core;
mod heap;

pub use core::{Cli, Commands, TargetArgs};
pub use heap::HeapCommand;
