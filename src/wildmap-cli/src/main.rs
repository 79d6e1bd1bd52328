mod cli;
mod commands;
mod config;
mod memory;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use cli::*;

fn init_tracing(verbose: u8) {
    let filter = match verbose {
        0 => EnvFilter::try_from_env("WILDMAP_LOG")
            .or_else(|_| EnvFilter::try_from_default_env())
            .unwrap_or_else(|_| "wildmap=info".into()),
        1 => "wildmap=debug".into(),
        _ => "wildmap=trace".into(),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let target = TargetArgs {
        pid: cli.pid,
        dump: cli.dump.clone(),
        maps: cli.maps.clone(),
        symbols: cli.symbols.clone(),
    };
    let json = cli.json;

    match cli.command {
        Commands::Configure {
            show,
            page_size,
            word_size,
            granularity,
            symbols_file,
            allocator,
            address_model,
        } => {
            commands::configure::handle(
                show,
                commands::configure::Update {
                    page_size,
                    word_size,
                    granularity,
                    symbols: symbols_file,
                    allocators: allocator,
                    address_model,
                },
            )?;
        }

        Commands::Info => {
            let opened = commands::open(&target)?;
            commands::info::info(&opened, json)?;
        }

        Commands::Maps => {
            let opened = commands::open(&target)?;
            commands::info::maps(&opened, json)?;
        }

        Commands::Rings => {
            let opened = commands::open(&target)?;
            commands::world::rings(&opened.session, json)?;
        }

        Commands::Ring { path } => {
            let opened = commands::open(&target)?;
            commands::world::ring(&opened.session, &path, json)?;
        }

        Commands::World {
            unused,
            conflict,
            virtual_,
        } => {
            let opened = commands::open(&target)?;
            commands::world::classify(&opened.session, unused, conflict, virtual_, json)?;
        }

        Commands::Physical { no_heap } => {
            let opened = commands::open(&target)?;
            commands::world::physical(&opened.session, no_heap, json)?;
        }

        Commands::Heap { command } => {
            let opened = commands::open(&target)?;
            match command {
                HeapCommand::Status => commands::heap::status(&opened.session, json)?,
                HeapCommand::Lookup { address } => {
                    commands::heap::lookup(&opened.session, &address, json)?
                }
                HeapCommand::Chunks {
                    size,
                    min,
                    max,
                    huge,
                    small,
                    limit,
                } => {
                    let query = commands::heap::query(&size, min.as_deref(), max.as_deref(), huge, small)?;
                    commands::heap::chunks(&opened.session, &query, limit, json)?
                }
            }
        }

        Commands::Search { pattern } => {
            let opened = commands::open(&target)?;
            commands::world::search(&opened.session, &pattern, json)?;
        }

        Commands::Save { dir, lo, hi, pad } => {
            let opened = commands::open(&target)?;
            commands::world::save(&opened.session, &dir, lo.as_deref(), hi.as_deref(), pad, json)?;
        }
    }

    Ok(())
}
