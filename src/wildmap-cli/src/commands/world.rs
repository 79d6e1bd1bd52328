//! Address space command handlers
//!
//! Handlers for listing rings, classifying the world, and searching and
//! saving readable memory.

use anyhow::{Context, Result};
use serde::Serialize;
use std::path::Path;

use wildmap::maps::Exten;
use wildmap::world::{Located, Record, Usage};
use wildmap::{Provider, Range, Session, Span};

use super::{parse_address, parse_hex_bytes, print_json};

#[derive(Serialize)]
struct RingRow<'a> {
    seq: usize,
    provider: Provider,
    owner: &'a str,
    spans: usize,
    bytes: u64,
}

#[derive(Serialize)]
struct SpanRow {
    seq: Option<u32>,
    range: Range,
    what: String,
    /// Bytes of the span with readable memory behind them
    backed: u64,
}

impl SpanRow {
    fn new(span: &Span, backed: u64) -> Self {
        Self {
            seq: span.seq(),
            range: span.range(),
            what: span
                .exten()
                .map(|ext| ext.describe())
                .unwrap_or_default(),
            backed,
        }
    }
}

#[derive(Serialize)]
struct RunRow {
    range: Range,
    sources: Vec<String>,
}

#[derive(Serialize)]
struct SearchHit {
    address: u64,
    span: String,
}

fn ring_row(record: &Record) -> RingRow<'_> {
    RingRow {
        seq: record.seq(),
        provider: record.provider(),
        owner: record.owner(),
        spans: record.ring().len(),
        bytes: record.ring().bytes(),
    }
}

/// Handle the rings command
pub fn rings(session: &Session, json: bool) -> Result<()> {
    let rows: Vec<RingRow<'_>> = session.world().records().iter().map(ring_row).collect();
    if json {
        return print_json(&rows);
    }

    println!("{:>4}  {:10} {:12} {:>8} {:>14}", "seq", "provider", "owner", "spans", "bytes");
    for row in &rows {
        println!(
            "{:>4}  {:10} {:12} {:>8} {:>14}",
            row.seq,
            row.provider.to_string(),
            row.owner,
            row.spans,
            row.bytes
        );
    }
    Ok(())
}

/// Handle the ring command
pub fn ring(session: &Session, path: &str, json: bool) -> Result<()> {
    let world = session.world();
    let located = world
        .by_path(path)
        .with_context(|| format!("No ring or span at {:?}", path))?;

    let rows: Vec<SpanRow> = match located {
        Located::Ring(record) => world
            .coverage(record.seq())?
            .into_iter()
            .map(|(span, backed)| SpanRow::new(span, backed))
            .collect(),
        Located::Span(record, span) => {
            let backed = world
                .coverage(record.seq())?
                .into_iter()
                .find(|(s, _)| s.seq() == span.seq())
                .map_or(0, |(_, backed)| backed);
            vec![SpanRow::new(span, backed)]
        }
    };

    if json {
        return print_json(&rows);
    }

    for row in &rows {
        let seq = row.seq.map_or_else(|| "-".to_string(), |seq| seq.to_string());
        println!("{:>6}  {}  {}  backed {}", seq, row.range, row.what, row.backed);
    }
    println!("{} spans", rows.len());
    Ok(())
}

/// Handle the world command, no flag selects every kind
pub fn classify(session: &Session, unused: bool, conflict: bool, virtual_: bool, json: bool) -> Result<()> {
    let all = !(unused || conflict || virtual_);
    let usages: Vec<Usage> = session
        .world()
        .classify(unused || all, conflict || all, virtual_ || all)
        .collect();

    if json {
        return print_json(&usages);
    }

    for usage in &usages {
        let owners: Vec<String> = usage
            .logical
            .iter()
            .chain(usage.physical.iter())
            .map(|owner| format!("{}.{} {}", owner.provider, owner.ring, owner.what))
            .collect();
        println!("{:8} {}  {}", format!("{:?}", usage.kind).to_lowercase(), usage.range, owners.join(" | "));
    }
    println!("{} places", usages.len());
    Ok(())
}

/// Handle the physical command
pub fn physical(session: &Session, no_heap: bool, json: bool) -> Result<()> {
    let world = session.world();
    let exclude: Vec<usize> = if no_heap {
        world.by_provider(Provider::Heap).map(Record::seq).collect()
    } else {
        Vec::new()
    };

    let runs: Vec<RunRow> = world
        .physical(Range::WILD, &exclude, true)
        .map(|(range, hits)| RunRow {
            range,
            sources: hits.iter().map(|hit| hit.span.describe()).collect(),
        })
        .collect();

    if json {
        return print_json(&runs);
    }

    let mut total = 0u64;
    for run in &runs {
        total += run.range.len().unwrap_or(0);
        println!("{}  {}", run.range, run.sources.join(", "));
    }
    println!("{} runs, {} bytes", runs.len(), total);
    Ok(())
}

/// Handle the search command
pub fn search(session: &Session, pattern: &str, json: bool) -> Result<()> {
    let blob = parse_hex_bytes(pattern)?;
    let found = session.world().search(session.source(), &blob)?;

    let hits: Vec<SearchHit> = found
        .iter()
        .map(|(address, span)| SearchHit {
            address: *address,
            span: span.to_string(),
        })
        .collect();

    if json {
        return print_json(&hits);
    }

    for hit in &hits {
        println!("{:#018x}  {}", hit.address, hit.span);
    }
    println!("{} hits for {} bytes", hits.len(), blob.len());
    Ok(())
}

/// Handle the save command
pub fn save(
    session: &Session,
    dir: &Path,
    lo: Option<&str>,
    hi: Option<&str>,
    pad: bool,
    json: bool,
) -> Result<()> {
    let lo = lo.map(parse_address).transpose()?;
    let hi = hi.map(parse_address).transpose()?;
    let range = Range::new(lo, hi)?;

    let stats = session
        .world()
        .save(session.source(), range, dir, pad)
        .with_context(|| format!("Failed to save memory to {}", dir.display()))?;

    if json {
        return print_json(&stats);
    }

    println!(
        "Saved {} bytes of {} into {} files in {} ({} bytes padded)",
        stats.written,
        range,
        stats.files,
        dir.display(),
        stats.padded
    );
    Ok(())
}
