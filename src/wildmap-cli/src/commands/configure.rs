//! Configuration command handlers
//!
//! Handles the `configure` subcommand for setting up wildmap defaults.

use crate::config::Config;
use anyhow::{bail, Result};
use std::path::PathBuf;

use wildmap::{AddressModel, Allocator};

/// Settings given on the command line, unset fields stay as they are
#[derive(Debug, Default)]
pub struct Update {
    pub page_size: Option<u64>,
    pub word_size: Option<usize>,
    pub granularity: Option<u64>,
    pub symbols: Option<PathBuf>,
    pub allocators: Vec<String>,
    pub address_model: Option<AddressModel>,
}

impl Update {
    fn is_empty(&self) -> bool {
        self.page_size.is_none()
            && self.word_size.is_none()
            && self.granularity.is_none()
            && self.symbols.is_none()
            && self.allocators.is_empty()
            && self.address_model.is_none()
    }
}

/// Handle the configure command
pub fn handle(show: bool, update: Update) -> Result<()> {
    let mut config = Config::load()?;

    if show {
        show_config(&config)?;
        return Ok(());
    }

    if update.is_empty() {
        show_usage();
        return Ok(());
    }

    apply(&mut config, update)?;
    config.save()?;

    println!("Configuration updated");
    if let Ok(path) = Config::config_path() {
        println!("Config saved to: {}", path.display());
    }

    Ok(())
}

/// Check and merge an update into `config`
fn apply(config: &mut Config, update: Update) -> Result<()> {
    if let Some(page) = update.page_size {
        if !page.is_power_of_two() {
            bail!("Page size must be a power of two, got {}", page);
        }
        config.page_size = page;
    }

    if let Some(word) = update.word_size {
        if word != 4 && word != 8 {
            bail!("Word size must be 4 or 8, got {}", word);
        }
        config.word_size = word;
    }

    if let Some(gran) = update.granularity {
        config.granularity = gran;
    }

    if let Some(path) = update.symbols {
        config.symbols = Some(path);
    }

    if !update.allocators.is_empty() {
        for name in &update.allocators {
            name.parse::<Allocator>()?;
        }
        config.allocators = update.allocators;
    }

    if let Some(model) = update.address_model {
        config.address_model = model;
    }

    Ok(())
}

/// Display current configuration
fn show_config(config: &Config) -> Result<()> {
    match &config.symbols {
        Some(path) => println!("Symbols:       {}", path.display()),
        None => println!("Symbols:       (none)"),
    }
    println!("Page size:     {}", config.page_size);
    println!("Word size:     {}", config.word_size);
    println!("Granularity:   {:#x}", config.granularity);
    println!("Allocators:    {}", config.allocators.join(", "));
    println!("Address model: {:?}", config.address_model);

    if let Ok(path) = Config::config_path() {
        println!("Config file:   {}", path.display());
    }

    Ok(())
}

/// Show usage help for the configure command
fn show_usage() {
    println!("Usage: wildmap configure --symbols-file app.toml --allocator glibc");
    println!("   or: wildmap configure --page-size 4096 --word-size 8");
    println!("   or: wildmap configure --show");
    println!();
    println!("Note: heaps are only found when their allocator's symbols are known.");
    println!("      Export main_arena and mp_ (glibc) into the symbols file.");
}
