//! Live Process Memory Source
//!
//! Reads a running process through `process_memory` and its mapping table
//! from /proc.

use anyhow::{bail, Context, Result};
use process_memory::{CopyAddress, ProcessHandle, TryIntoProcessHandle};
use std::path::PathBuf;
use sysinfo::{Pid, System};

use wildmap::source::ProcMaps;
use wildmap::{MemoryRegion, MemorySource, ProcessMapReader, Thread};

/// An attached process
pub struct LiveProcess {
    pub pid: u32,
    pub name: String,
    pub handle: ProcessHandle,
    pub exe_path: PathBuf,
    pub maps: Vec<MemoryRegion>,
}

// SAFETY: the handle is a pid on Linux and carries no thread affinity.
unsafe impl Send for LiveProcess {}
unsafe impl Sync for LiveProcess {}

impl MemorySource for LiveProcess {
    fn read_bytes(&self, address: u64, size: usize) -> wildmap::Result<Vec<u8>> {
        let mut buffer = vec![0u8; size];
        self.handle
            .copy_address(address as usize, &mut buffer)
            .map_err(|err| wildmap::Error::Read {
                address,
                size,
                reason: err.to_string(),
            })?;
        Ok(buffer)
    }

    fn regions(&self) -> &[MemoryRegion] {
        &self.maps
    }

    fn is_live(&self) -> bool {
        true
    }
}

impl LiveProcess {
    /// Attach to a running process
    pub fn attach(pid: u32) -> Result<Self> {
        let name = process_name(pid)?;
        let handle = (pid as process_memory::Pid)
            .try_into_process_handle()
            .context("Failed to attach to process. Try running with sudo.")?;

        let maps = ProcMaps::pid(pid)
            .read_maps()
            .with_context(|| format!("Failed to read /proc/{}/maps. Do you have permission?", pid))?;

        let exe_path = std::fs::read_link(format!("/proc/{}/exe", pid))
            .unwrap_or_else(|_| PathBuf::from("unknown"));

        tracing::info!(pid, name = %name, regions = maps.len(), "attached to process");

        Ok(LiveProcess {
            pid,
            name,
            handle,
            exe_path,
            maps,
        })
    }

    /// Threads and their stack pointers, where the kernel reports them
    pub fn threads(&self) -> Vec<Thread> {
        let tasks = match std::fs::read_dir(format!("/proc/{}/task", self.pid)) {
            Ok(tasks) => tasks,
            Err(err) => {
                tracing::debug!("cannot list threads: {}", err);
                return Vec::new();
            }
        };

        let mut threads: Vec<Thread> = tasks
            .filter_map(|entry| entry.ok()?.file_name().to_str()?.parse::<u32>().ok())
            .filter_map(|tid| {
                let stat = std::fs::read_to_string(format!("/proc/{}/task/{}/stat", self.pid, tid)).ok()?;
                let sp = stack_pointer(&stat)?;
                Some(Thread { id: tid, sp })
            })
            .collect();
        threads.sort_by_key(|t| t.id);
        threads
    }
}

/// Name of a running process
pub fn process_name(pid: u32) -> Result<String> {
    let mut system = System::new();
    system.refresh_processes(sysinfo::ProcessesToUpdate::Some(&[Pid::from_u32(pid)]), true);

    match system.process(Pid::from_u32(pid)) {
        Some(process) => Ok(process.name().to_string_lossy().to_string()),
        None => bail!("Process {} not found. Is it running?", pid),
    }
}

/// `kstkesp` of a `/proc/<pid>/task/<tid>/stat` line, zero means unknown
fn stack_pointer(stat: &str) -> Option<u64> {
    // the command name may contain spaces, fields restart after ')'
    let rest = &stat[stat.rfind(')')? + 1..];
    let sp = rest.split_whitespace().nth(26)?.parse::<u64>().ok()?;
    (sp != 0).then_some(sp)
}
