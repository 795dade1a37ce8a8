//! Network namespace switching for per-namespace iterators
//!
//! `setns(2)` only moves the calling thread, so the switch is done on a
//! short-lived thread spawned per call. That thread restores its original
//! namespace when the body returns or unwinds and then exits.

use crate::{ProbekitError, Result};
use std::fs;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
#[cfg(target_os = "linux")]
use tracing::{debug, warn};

/// Procfs mount used to find namespaces
const PROC_ROOT: &str = "/proc";

pub trait NetnsRunner: Send + Sync {
    /// Runs `f` inside the network namespace of `pid`.
    ///
    /// Returns [`ProbekitError::ProcessGone`] when `pid` no longer exists.
    fn run_in(&self, pid: u32, f: &mut (dyn FnMut() -> Result<()> + Send)) -> Result<()>;
}

pub struct HostNetns {
    proc_root: PathBuf,
}

impl HostNetns {
    pub fn new() -> Self {
        Self {
            proc_root: PathBuf::from(PROC_ROOT),
        }
    }

    /// Uses another procfs mount, e.g. the host's when running in a container
    pub fn with_root(proc_root: PathBuf) -> Self {
        Self { proc_root }
    }

    fn netns_path(&self, pid: u32) -> PathBuf {
        self.proc_root.join(pid.to_string()).join("ns").join("net")
    }

    /// Network namespace inode of `pid`
    pub fn netns_id(&self, pid: u32) -> Result<u64> {
        let path = self.netns_path(pid);
        fs::metadata(&path)
            .map(|m| m.ino())
            .map_err(|e| open_error(pid, &path, e))
    }
}

impl Default for HostNetns {
    fn default() -> Self {
        Self::new()
    }
}

fn open_error(pid: u32, path: &Path, e: io::Error) -> ProbekitError {
    if e.kind() == io::ErrorKind::NotFound {
        ProbekitError::ProcessGone(pid)
    } else {
        ProbekitError::NetnsEnterFailed {
            pid,
            reason: format!("{}: {}", path.display(), e),
        }
    }
}

#[cfg(target_os = "linux")]
fn setns(fd: std::os::fd::RawFd) -> io::Result<()> {
    // SAFETY: fd is an open namespace file for the duration of the call
    if unsafe { libc::setns(fd, libc::CLONE_NEWNET) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Moves the thread back to its saved namespace when dropped
#[cfg(target_os = "linux")]
struct RestoreNetns {
    original: fs::File,
    pid: u32,
}

#[cfg(target_os = "linux")]
impl Drop for RestoreNetns {
    fn drop(&mut self) {
        use std::os::fd::AsRawFd;

        if let Err(e) = setns(self.original.as_raw_fd()) {
            warn!(
                "Failed to leave network namespace of pid {}: {}",
                self.pid, e
            );
        }
    }
}

#[cfg(target_os = "linux")]
impl HostNetns {
    fn enter_and_run(
        &self,
        pid: u32,
        target: &fs::File,
        f: &mut (dyn FnMut() -> Result<()> + Send),
    ) -> Result<()> {
        use std::os::fd::AsRawFd;

        let own_path = self.proc_root.join("thread-self").join("ns").join("net");
        let original = fs::File::open(&own_path).map_err(|e| ProbekitError::NetnsEnterFailed {
            pid,
            reason: format!("saving current namespace: {}", e),
        })?;

        setns(target.as_raw_fd()).map_err(|e| ProbekitError::NetnsEnterFailed {
            pid,
            reason: e.to_string(),
        })?;
        let _restore = RestoreNetns { original, pid };
        debug!("Entered network namespace of pid {}", pid);

        f()
    }
}

#[cfg(target_os = "linux")]
impl NetnsRunner for HostNetns {
    fn run_in(&self, pid: u32, f: &mut (dyn FnMut() -> Result<()> + Send)) -> Result<()> {
        let target_path = self.netns_path(pid);
        let target = fs::File::open(&target_path).map_err(|e| open_error(pid, &target_path, e))?;

        // The namespace switch happens on a thread of its own which exits
        // afterwards, so no pooled thread is ever left inside the container.
        std::thread::scope(|scope| {
            let worker = std::thread::Builder::new()
                .name(format!("netns-{}", pid))
                .spawn_scoped(scope, || self.enter_and_run(pid, &target, f))
                .map_err(|e| ProbekitError::NetnsEnterFailed {
                    pid,
                    reason: format!("spawning namespace thread: {}", e),
                })?;

            worker.join().map_err(|_| ProbekitError::NetnsEnterFailed {
                pid,
                reason: "namespace thread panicked".to_string(),
            })?
        })
    }
}

#[cfg(not(target_os = "linux"))]
impl NetnsRunner for HostNetns {
    fn run_in(&self, _pid: u32, _f: &mut (dyn FnMut() -> Result<()> + Send)) -> Result<()> {
        Err(ProbekitError::UnsupportedFeature(
            "network namespaces".to_string(),
        ))
    }
}
