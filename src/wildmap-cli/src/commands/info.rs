//! Target overview command handlers

use anyhow::Result;
use serde::Serialize;

use wildmap::heap::Status;
use wildmap::MemoryRegion;

use super::{print_json, Opened};

#[derive(Serialize)]
struct HeapSummary {
    name: &'static str,
    #[serde(flatten)]
    status: Status,
}

#[derive(Serialize)]
struct Summary<'a> {
    origin: &'a str,
    live: bool,
    regions: usize,
    rings: usize,
    plausible_ranges: usize,
    plausible_bytes: u64,
    heaps: Vec<HeapSummary>,
}

/// Handle the info command
pub fn info(opened: &Opened, json: bool) -> Result<()> {
    let session = &opened.session;
    let summary = Summary {
        origin: &opened.origin,
        live: session.source().is_live(),
        regions: opened.maps.len(),
        rings: session.world().records().len(),
        plausible_ranges: session.addrs().len(),
        plausible_bytes: session.addrs().bytes(),
        heaps: session
            .heaps()
            .entries()
            .iter()
            .map(|entry| HeapSummary {
                name: entry.kind.name(),
                status: entry.status.clone(),
            })
            .collect(),
    };

    if json {
        return print_json(&summary);
    }

    println!("Target:    {}", summary.origin);
    println!("Live:      {}", summary.live);
    println!("Regions:   {}", summary.regions);
    println!("Rings:     {}", summary.rings);
    println!(
        "Plausible: {} ranges, {} MB",
        summary.plausible_ranges,
        summary.plausible_bytes / 1_000_000
    );
    for heap in &summary.heaps {
        println!("Heap {:8} {}", heap.name, status_text(&heap.status));
    }
    Ok(())
}

/// Handle the maps command
pub fn maps(opened: &Opened, json: bool) -> Result<()> {
    if json {
        return print_json(&opened.maps);
    }

    for region in &opened.maps {
        println!("{}", region_line(region));
    }
    println!("{} regions", opened.maps.len());
    Ok(())
}

pub(crate) fn status_text(status: &Status) -> String {
    match status {
        Status::Pending => "pending".to_string(),
        Status::Ready => "ready".to_string(),
        Status::Failed(reason) => format!("failed: {}", reason),
    }
}

fn region_line(region: &MemoryRegion) -> String {
    format!(
        "{:016x}-{:016x} {:4} {:8x} {:>10} {}",
        region.start,
        region.end,
        region.perms,
        region.offset,
        region.size(),
        region.path.as_deref().unwrap_or("")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_region_line() {
        let region = MemoryRegion::new(0x400000, 0x401000, "r-xp").with_path("/bin/cat", 0, 42);
        let line = region_line(&region);
        assert!(line.starts_with("0000000000400000-0000000000401000 r-xp"));
        assert!(line.ends_with("4096 /bin/cat"));
    }

    #[test]
    fn test_status_text() {
        assert_eq!(status_text(&Status::Ready), "ready");
        assert_eq!(
            status_text(&Status::Failed("no main_arena".to_string())),
            "failed: no main_arena"
        );
    }
}
