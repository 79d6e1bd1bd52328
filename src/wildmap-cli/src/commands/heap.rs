//! Heap command handlers

use anyhow::{bail, Result};
use serde::Serialize;

use wildmap::{ChunkInfo, ChunkQuery, Lookup, Session, SizePred};

use super::info::status_text;
use super::{parse_address, parse_size, print_json};

#[derive(Serialize)]
struct StatusRow {
    heap: &'static str,
    status: String,
    elapsed_ms: u128,
    ring: Option<usize>,
    counters: Vec<(&'static str, u64)>,
}

#[derive(Serialize)]
struct LookupRow {
    heap: &'static str,
    address: u64,
    #[serde(flatten)]
    found: Lookup,
}

#[derive(Serialize)]
struct ChunkRow {
    heap: &'static str,
    #[serde(flatten)]
    chunk: ChunkInfo,
}

/// Handle the heap status command
pub fn status(session: &Session, json: bool) -> Result<()> {
    let rows: Vec<StatusRow> = session
        .heaps()
        .entries()
        .iter()
        .map(|entry| StatusRow {
            heap: entry.kind.name(),
            status: status_text(&entry.status),
            elapsed_ms: entry.elapsed.as_millis(),
            ring: entry.heap().map(|heap| heap.ring()),
            counters: entry.heap().map(|heap| heap.stats()).unwrap_or_default(),
        })
        .collect();

    if json {
        return print_json(&rows);
    }

    for row in &rows {
        println!("{:8} {} ({} ms)", row.heap, row.status, row.elapsed_ms);
        if let Some(ring) = row.ring {
            println!("  ring: {}", ring);
        }
        for (name, value) in &row.counters {
            println!("  {}: {}", name, value);
        }
    }
    Ok(())
}

/// Handle the heap lookup command
pub fn lookup(session: &Session, address: &str, json: bool) -> Result<()> {
    let at = parse_address(address)?;
    let rows: Vec<LookupRow> = session
        .lookup(at)?
        .into_iter()
        .map(|(heap, found)| LookupRow {
            heap,
            address: at,
            found,
        })
        .collect();

    if json {
        return print_json(&rows);
    }

    if rows.is_empty() {
        println!("{:#x}: no heap was discovered", at);
        return Ok(());
    }

    for row in &rows {
        println!("{:#x}: {}", at, lookup_text(row.heap, &row.found));
    }
    Ok(())
}

/// Build a chunk query from the command line filters
pub fn query(
    sizes: &[String],
    min: Option<&str>,
    max: Option<&str>,
    huge: bool,
    small: bool,
) -> Result<ChunkQuery> {
    let size = if !sizes.is_empty() {
        SizePred::OneOf(sizes.iter().map(|s| parse_size(s)).collect::<Result<_>>()?)
    } else if min.is_some() || max.is_some() {
        let lo = min.map(parse_size).transpose()?.unwrap_or(0);
        let hi = max.map(parse_size).transpose()?;
        if hi.is_some_and(|hi| hi < lo) {
            bail!("--max is below --min");
        }
        SizePred::Range(lo, hi)
    } else {
        SizePred::Any
    };

    let huge = match (huge, small) {
        (true, _) => Some(true),
        (_, true) => Some(false),
        _ => None,
    };

    Ok(ChunkQuery {
        size,
        huge,
        ..ChunkQuery::default()
    })
}

/// Handle the heap chunks command
pub fn chunks(session: &Session, query: &ChunkQuery, limit: usize, json: bool) -> Result<()> {
    let mut rows = Vec::new();
    for item in session.chunks(query).take(limit) {
        let (heap, chunk) = item?;
        rows.push(ChunkRow { heap, chunk });
    }

    if json {
        return print_json(&rows);
    }

    for row in &rows {
        println!(
            "{:8} {:#018x} {:>10} {}",
            row.heap, row.chunk.at, row.chunk.size, row.chunk.relation
        );
    }
    if rows.len() == limit {
        println!("(stopped at {} chunks, raise --limit for more)", limit);
    } else {
        println!("{} chunks", rows.len());
    }
    Ok(())
}

fn lookup_text(heap: &str, found: &Lookup) -> String {
    let mut text = format!("{} {}", heap, found.relation);
    if let Some(aligned) = found.aligned {
        text.push_str(&format!(" chunk {:#x}", aligned));
    }
    if let Some(offset) = found.offset {
        text.push_str(&format!(" offset {}", offset));
    }
    if let Some(size) = found.size {
        text.push_str(&format!(" size {:#x}", size));
    }
    if let Some(gran) = found.granularity {
        text.push_str(&format!(" step {:#x}", gran));
    }
    text
}
