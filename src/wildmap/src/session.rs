//! One analysed target
//!
//! A [`Session`] owns the target's readers, the [`World`] built from them
//! and the heaps discovered in it. Everything a query needs is reached
//! through the session, nothing is kept in globals.

use tracing::{debug, info};

use crate::config::AnalysisConfig;
use crate::error::Result;
use crate::heap::{ChunkInfo, ChunkQuery, HeapManager, Interrupt, Lookup, Target};
use crate::source::{MemoryRegion, MemorySource, SymbolAccessor};
use crate::world::{
    core_ring, exec_ring, mappings_ring, memory_ring, stack_ring, AddressSet, Provider, Thread, World,
};

/// What is known about the process besides its bytes
#[derive(Debug, Clone, Default)]
pub struct Process {
    /// Mapping table, the source's regions are used when unset
    pub maps: Option<Vec<MemoryRegion>>,
    pub threads: Vec<Thread>,
}

pub struct Session {
    source: Box<dyn MemorySource>,
    symbols: Box<dyn SymbolAccessor>,
    config: AnalysisConfig,
    world: World,
    addrs: AddressSet,
    heaps: HeapManager,
    interrupt: Interrupt,
}

impl Session {
    pub fn open(
        source: Box<dyn MemorySource>,
        symbols: Box<dyn SymbolAccessor>,
        config: AnalysisConfig,
    ) -> Result<Self> {
        Self::open_with(source, symbols, config, Process::default(), Interrupt::new())
    }

    /// Build the world and discover heaps
    ///
    /// `interrupt` may be raised from another thread to stop discovery.
    pub fn open_with(
        source: Box<dyn MemorySource>,
        symbols: Box<dyn SymbolAccessor>,
        config: AnalysisConfig,
        process: Process,
        interrupt: Interrupt,
    ) -> Result<Self> {
        let mut heaps = HeapManager::from_names(&config.allocators)?;
        let mut world = World::new(config.address_model);

        let regions = source.regions();
        if source.is_live() {
            world.push("memory", memory_ring(regions)?, Provider::Memory, true)?;
        } else {
            world.push("core", core_ring(regions)?, Provider::Core, true)?;
        }

        let maps = process.maps.as_deref().unwrap_or(regions);
        world.push("mappings", mappings_ring(maps)?, Provider::Mappings, true)?;
        world.push("exec", exec_ring(maps)?, Provider::Exec, true)?;

        let stacks = stack_ring(&world, &process.threads)?;
        debug!(stacks = stacks.len(), threads = process.threads.len(), "thread stacks");
        world.push("stack", stacks, Provider::Stack, true)?;

        let addrs = world.addrs(false, config.granularity);
        info!(
            live = source.is_live(),
            ranges = addrs.len(),
            bytes = addrs.bytes(),
            "address set built"
        );

        let target = Target {
            reader: source.as_ref(),
            symbols: symbols.as_ref(),
            validator: &addrs,
            config: &config,
            interrupt: &interrupt,
        };
        heaps.discover(&target, &mut world)?;

        Ok(Self {
            source,
            symbols,
            config,
            world,
            addrs,
            heaps,
            interrupt,
        })
    }

    fn target(&self) -> Target<'_> {
        Target {
            reader: self.source.as_ref(),
            symbols: self.symbols.as_ref(),
            validator: &self.addrs,
            config: &self.config,
            interrupt: &self.interrupt,
        }
    }

    pub fn world(&self) -> &World {
        &self.world
    }

    pub fn heaps(&self) -> &HeapManager {
        &self.heaps
    }

    pub fn config(&self) -> &AnalysisConfig {
        &self.config
    }

    pub fn source(&self) -> &dyn MemorySource {
        self.source.as_ref()
    }

    pub fn addrs(&self) -> &AddressSet {
        &self.addrs
    }

    /// Relation of `at` to every heap that knows it
    pub fn lookup(&self, at: u64) -> Result<Vec<(&'static str, Lookup)>> {
        self.heaps.lookup(&self.target(), &self.world, at)
    }

    pub fn chunks<'a>(
        &'a self,
        query: &'a ChunkQuery,
    ) -> impl Iterator<Item = Result<(&'static str, ChunkInfo)>> + 'a {
        self.heaps.chunks(self.target(), &self.world, query)
    }

    /// Handle that stops running walks once raised
    pub fn interrupt_handle(&self) -> Interrupt {
        self.interrupt.clone()
    }
}
