//! World registry: the rings of every provider and queries across them

mod addrs;
mod providers;

pub use addrs::AddressSet;
pub use providers::{core_ring, exec_ring, mappings_ring, memory_ring, stack_ring, Thread};

use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::str::FromStr;

use memchr::memmem;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::AddressModel;
use crate::error::{Error, Result};
use crate::maps::{
    Class, Diff, Exten, Extension, Glide, Hit, OneBy, Options, Pred, Provenance, Range, Ring,
    Span, Walk,
};
use crate::source::MemorySource;

const BLOCK: u64 = 1024 * 1024;

/// Source of a ring
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    /// Bytes of a dump file
    Core,
    /// Bytes of a live process
    Memory,
    /// Executable images
    Exec,
    /// Rows of the process mapping table
    Mappings,
    Stack,
    Heap,
}

impl Provider {
    pub fn name(self) -> &'static str {
        match self {
            Provider::Core => "blobs",
            Provider::Memory => "memory",
            Provider::Exec => "exun",
            Provider::Mappings => "mmaps",
            Provider::Stack => "stack",
            Provider::Heap => "heap",
        }
    }

    /// At most one ring may be registered under a reserved provider
    pub fn is_reserved(self) -> bool {
        matches!(
            self,
            Provider::Core | Provider::Memory | Provider::Exec | Provider::Mappings
        )
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Provider {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "blobs" | "core" => Ok(Provider::Core),
            "memory" | "mem" => Ok(Provider::Memory),
            "exun" | "exec" => Ok(Provider::Exec),
            "mmaps" | "maps" | "mappings" => Ok(Provider::Mappings),
            "stack" => Ok(Provider::Stack),
            "heap" => Ok(Provider::Heap),
            other => Err(Error::Path(format!("unknown provider {}", other))),
        }
    }
}

/// A ring registered in the world
#[derive(Debug)]
pub struct Record {
    seq: usize,
    owner: String,
    provider: Provider,
    ring: Ring,
}

impl Record {
    pub fn seq(&self) -> usize {
        self.seq
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn provider(&self) -> Provider {
        self.provider
    }

    pub fn ring(&self) -> &Ring {
        &self.ring
    }
}

/// Result of resolving a `provider.N[.S]` path
#[derive(Debug, Clone, Copy)]
pub enum Located<'a> {
    Ring(&'a Record),
    Span(&'a Record, &'a Span),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UsageKind {
    /// Two or more logical owners overlap
    Conflict,
    /// Backed by bytes that nobody owns
    Unused,
    /// Owned but without bytes behind it
    Virtual,
}

/// Span seen by a classification, detached from the world borrow
#[derive(Debug, Clone, Serialize)]
pub struct Owner {
    pub ring: usize,
    pub provider: Provider,
    pub span: Option<u32>,
    pub range: Range,
    pub what: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Usage {
    pub kind: UsageKind,
    pub range: Range,
    pub physical: Vec<Owner>,
    pub logical: Vec<Owner>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SaveStats {
    pub files: usize,
    pub written: u64,
    pub padded: u64,
}

/// Span backed by readable bytes
pub fn is_physical(span: &Span) -> bool {
    match span.exten() {
        Some(Extension::Provenance(prov)) => prov.is_physical(),
        _ => false,
    }
}

/// Span naming an owner of the bytes it covers
pub fn is_logical(span: &Span) -> bool {
    match span.exten() {
        Some(Extension::Provenance(prov)) => prov.is_logical(),
        _ => true,
    }
}

// dump bytes win over executable images
fn score(hit: &Hit<'_>) -> i64 {
    match hit.span.exten().and_then(Extension::provenance) {
        Some(Provenance::Core) | Some(Provenance::Memory) => 1,
        _ => 2,
    }
}

#[derive(Debug, Default)]
pub struct World {
    model: AddressModel,
    records: Vec<Record>,
    next: usize,
}

impl World {
    pub fn new(model: AddressModel) -> Self {
        Self {
            model,
            records: Vec::new(),
            next: 1,
        }
    }

    pub fn model(&self) -> AddressModel {
        self.model
    }

    /// Register a ring, returns its registration seq
    ///
    /// With `unique` the owner may hold a single ring of this provider.
    pub fn push(&mut self, owner: &str, ring: Ring, provider: Provider, unique: bool) -> Result<usize> {
        if provider.is_reserved() && self.by_provider(provider).next().is_some() {
            return Err(Error::Provider(format!(
                "provider {} is already registered",
                provider
            )));
        }
        if unique && self.by_provider(provider).any(|r| r.owner == owner) {
            return Err(Error::Provider(format!(
                "{} already holds a {} ring",
                owner, provider
            )));
        }

        let seq = self.next.max(1);
        self.next = seq + 1;

        debug!(
            seq,
            owner,
            provider = provider.name(),
            spans = ring.len(),
            bytes = ring.bytes(),
            "ring registered"
        );

        self.records.push(Record {
            seq,
            owner: owner.to_string(),
            provider,
            ring,
        });
        Ok(seq)
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn record(&self, seq: usize) -> Option<&Record> {
        self.records.iter().find(|r| r.seq == seq)
    }

    pub fn ring(&self, seq: usize) -> Option<&Ring> {
        self.record(seq).map(|r| &r.ring)
    }

    pub fn ring_mut(&mut self, seq: usize) -> Option<&mut Ring> {
        self.records
            .iter_mut()
            .find(|r| r.seq == seq)
            .map(|r| &mut r.ring)
    }

    pub fn by_provider(&self, provider: Provider) -> impl Iterator<Item = &Record> + '_ {
        self.records.iter().filter(move |r| r.provider == provider)
    }

    fn rings_of(&self, providers: &[Provider]) -> Vec<&Ring> {
        self.records
            .iter()
            .filter(|r| providers.contains(&r.provider))
            .map(|r| &r.ring)
            .collect()
    }

    fn walk_phys(&self, bins: bool) -> Walk<'_> {
        let mut providers = vec![Provider::Core, Provider::Memory];
        if bins {
            providers.push(Provider::Exec);
        }
        Walk::new(self.rings_of(&providers))
    }

    /// Resolve `seq[.span]` or `provider[.seq[.span]]`
    pub fn by_path(&self, path: &str) -> Result<Located<'_>> {
        let bad = || Error::Path(path.to_string());
        let mut parts = path.split('.');
        let head = parts.next().filter(|s| !s.is_empty()).ok_or_else(bad)?;

        let number = |part: Option<&str>| -> Result<Option<u64>> {
            part.map(|s| s.parse::<u64>().map_err(|_| bad()))
                .transpose()
        };

        let (record, span) = match head.parse::<usize>() {
            Ok(seq) => {
                let record = self.record(seq).ok_or_else(bad)?;
                (record, number(parts.next())?)
            }
            Err(_) => {
                let provider = head.parse::<Provider>()?;
                let mut found = self.by_provider(provider);
                let record = match number(parts.next())? {
                    Some(seq) => found.find(|r| r.seq as u64 == seq).ok_or_else(bad)?,
                    None => {
                        let first = found.next().ok_or_else(bad)?;
                        if found.next().is_some() {
                            return Err(Error::Path(format!(
                                "too many rings found with {}",
                                path
                            )));
                        }
                        first
                    }
                };
                (record, number(parts.next())?)
            }
        };

        if parts.next().is_some() {
            return Err(bad());
        }

        match span {
            None => Ok(Located::Ring(record)),
            Some(seq) => {
                let seq = u32::try_from(seq).map_err(|_| bad())?;
                let span = record.ring.by_seq(seq).ok_or_else(bad)?;
                Ok(Located::Span(record, span))
            }
        }
    }

    /// Union runs of byte backed spans, minus the spans of `exclude` rings
    pub fn physical<'a>(
        &'a self,
        range: Range,
        exclude: &[usize],
        bins: bool,
    ) -> Box<dyn Iterator<Item = (Range, Vec<Hit<'a>>)> + 'a> {
        let walk = self.walk_phys(bins);

        if exclude.is_empty() {
            Box::new(walk.group(range, Some(is_physical as Pred), Options::union()))
        } else {
            let two = Walk::new(exclude.iter().filter_map(|&seq| self.ring(seq)));
            let diff = Diff::new(walk, two).filter(Some(is_physical as Pred), None);
            Box::new(
                diff.run(range, false, Class::ONE)
                    .map(|item| (item.range, item.one)),
            )
        }
    }

    fn owner(&self, hit: &Hit<'_>) -> Owner {
        let record = &self.records[hit.ring];
        Owner {
            ring: record.seq,
            provider: record.provider,
            span: hit.span.seq(),
            range: hit.span.range(),
            what: hit
                .span
                .exten()
                .map(|ext| ext.describe())
                .unwrap_or_default(),
        }
    }

    /// Classify every place where ownership of the address space changes
    pub fn classify(
        &self,
        unused: bool,
        conflict: bool,
        virtual_: bool,
    ) -> impl Iterator<Item = Usage> + '_ {
        let walk = Walk::new(self.records.iter().map(|r| &r.ring));

        walk.change(Range::WILD, None, Options::union())
            .filter_map(move |(range, hits)| {
                let phys: Vec<&Hit<'_>> = hits.iter().filter(|h| is_physical(h.span)).collect();
                let logic: Vec<&Hit<'_>> = hits.iter().filter(|h| is_logical(h.span)).collect();

                let kind = if logic.len() > 1 {
                    conflict.then_some(UsageKind::Conflict)
                } else if logic.is_empty() && !phys.is_empty() {
                    unused.then_some(UsageKind::Unused)
                } else if !logic.is_empty() && phys.is_empty() {
                    virtual_.then_some(UsageKind::Virtual)
                } else {
                    None
                }?;

                Some(Usage {
                    kind,
                    range,
                    physical: phys.into_iter().map(|h| self.owner(h)).collect(),
                    logical: logic.into_iter().map(|h| self.owner(h)).collect(),
                })
            })
    }

    /// Plausible address predicate over byte backed and image rings
    pub fn addrs(&self, maps: bool, granularity: u64) -> AddressSet {
        let mut providers = vec![Provider::Core, Provider::Memory, Provider::Exec];
        if maps {
            providers.push(Provider::Mappings);
        }

        let walk = Walk::new(self.rings_of(&providers));
        let ranges = walk
            .group(Range::WILD, None, Options::union())
            .map(|(range, _)| range);
        AddressSet::new(ranges, self.model, granularity)
    }

    /// Every registered span containing `at`
    pub fn lookup(&self, at: u64) -> Vec<(usize, Provider, &Span)> {
        self.records
            .iter()
            .filter_map(|r| {
                r.ring
                    .lookup(at, true)
                    .map(|(_, span)| (r.seq, r.provider, span))
            })
            .collect()
    }

    /// Bytes of each span of a ring that are backed by physical bytes
    pub fn coverage(&self, seq: usize) -> Result<Vec<(&Span, u64)>> {
        let ring = self
            .ring(seq)
            .ok_or_else(|| Error::Path(format!("no ring with seq {}", seq)))?;

        let diff = Diff::new(Walk::new([ring]), self.walk_phys(true))
            .filter(None, Some(is_physical as Pred));

        let mut covered: HashMap<usize, u64> = HashMap::new();
        for (hit, places) in OneBy::from_diff(diff).run(Range::WILD, true) {
            let bytes: u64 = places.iter().filter_map(|r| r.len()).sum();
            *covered.entry(hit.index).or_default() += bytes;
        }

        Ok(ring
            .iter()
            .enumerate()
            .map(|(k, span)| (span, covered.get(&k).copied().unwrap_or(0)))
            .collect())
    }

    /// Every non overlapping occurrence of `blob` in physical spans
    pub fn search(&self, memory: &dyn MemorySource, blob: &[u8]) -> Result<Vec<(u64, &Span)>> {
        let mut found = Vec::new();
        if blob.is_empty() {
            return Ok(found);
        }

        let finder = memmem::Finder::new(blob);
        let tail = blob.len() as u64 - 1;

        for hit in self.walk_phys(true).order(Range::WILD, Some(is_physical as Pred)) {
            let (lo, hi) = match (hit.span.lo(), hit.span.hi()) {
                (Some(lo), Some(hi)) => (lo, hi),
                _ => continue,
            };

            let mut at = lo;
            let mut skip = lo;
            while at < hi {
                let size = (hi - at).min(BLOCK + tail);
                let data = match memory.read_bytes(at, size as usize) {
                    Ok(data) => data,
                    Err(err) => {
                        warn!(span = %hit.span, "search skips unreadable span: {}", err);
                        break;
                    }
                };

                for offset in finder.find_iter(&data) {
                    let start = at + offset as u64;
                    if start >= skip && start < at + BLOCK {
                        found.push((start, hit.span));
                        skip = start + blob.len() as u64;
                    }
                }
                at += BLOCK;
            }
        }

        debug!(pattern = blob.len(), found = found.len(), "search done");
        Ok(found)
    }

    /// Write the bytes of `range` into `_<start>.chunk` files, one per
    /// contiguous run, or bridge gaps with zeroes when `pad` is set
    pub fn save(
        &self,
        memory: &dyn MemorySource,
        range: Range,
        dir: &Path,
        pad: bool,
    ) -> Result<SaveStats> {
        std::fs::create_dir_all(dir)?;

        let mut stats = SaveStats::default();
        let mut out: Option<BufWriter<File>> = None;

        let glide = Glide::new(self.walk_phys(true));
        for (place, hit) in glide.run(range, Some(is_physical as Pred), score) {
            let (lo, hi) = match (place.lo(), place.hi()) {
                (Some(lo), Some(hi)) if hit.is_some() || pad => (lo, hi),
                _ => {
                    close(&mut out)?;
                    continue;
                }
            };

            if out.is_none() {
                let path = dir.join(format!("_{:016x}.chunk", lo));
                out = Some(BufWriter::new(File::create(path)?));
                stats.files += 1;
            }
            let writer = match out.as_mut() {
                Some(writer) => writer,
                None => continue,
            };

            let mut at = lo;
            while at < hi {
                let size = (hi - at).min(BLOCK) as usize;
                if hit.is_some() {
                    writer.write_all(&memory.read_bytes(at, size)?)?;
                    stats.written += size as u64;
                } else {
                    writer.write_all(&vec![0u8; size])?;
                    stats.padded += size as u64;
                }
                at += size as u64;
            }
        }
        close(&mut out)?;

        info!(
            files = stats.files,
            written = stats.written,
            padded = stats.padded,
            "region saved"
        );
        Ok(stats)
    }
}

fn close(out: &mut Option<BufWriter<File>>) -> Result<()> {
    if let Some(mut writer) = out.take() {
        writer.flush()?;
    }
    Ok(())
}
