//! Process resolver for attaching local processes as containers
//!
//! A tracer identifies a container by its namespaces: the mount namespace
//! tags streamed events and the network namespace selects where socket
//! iterators are read. Both are the inode numbers of the links under
//! `/proc/<pid>/ns`.

use anyhow::{anyhow, Context, Result};
use log::debug;
use probekit::container::Container;
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

/// Procfs mount of the host
const PROC_ROOT: &str = "/proc";

pub struct ProcResolver {
    proc_root: PathBuf,
}

impl ProcResolver {
    pub fn new() -> Self {
        Self {
            proc_root: PathBuf::from(PROC_ROOT),
        }
    }

    /// Create a resolver over another procfs mount (for testing)
    pub fn with_root(proc_root: PathBuf) -> Self {
        Self { proc_root }
    }

    /// Resolve `pid` into a container named after its command
    pub fn resolve(&self, pid: u32) -> Result<Container> {
        let dir = self.proc_root.join(pid.to_string());
        if !dir.exists() {
            return Err(anyhow!("Process {} not found under {}", pid, self.proc_root.display()));
        }

        let netns = ns_inode(&dir, "net")?;
        let mntns = ns_inode(&dir, "mnt")?;
        let comm = fs::read_to_string(dir.join("comm"))
            .map(|c| c.trim().to_string())
            .unwrap_or_default();

        debug!("pid {} ({}): netns={} mntns={}", pid, comm, netns, mntns);

        let mut container = Container::new(format!("pid-{}", pid), pid, netns).with_mntns(mntns);
        if !comm.is_empty() {
            container = container.with_name(comm);
        }
        Ok(container)
    }
}

impl Default for ProcResolver {
    fn default() -> Self {
        Self::new()
    }
}

fn ns_inode(dir: &Path, ns: &str) -> Result<u64> {
    let path = dir.join("ns").join(ns);
    let metadata =
        fs::metadata(&path).with_context(|| format!("Failed to stat {}", path.display()))?;
    Ok(metadata.ino())
}
