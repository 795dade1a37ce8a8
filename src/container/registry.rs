//! Containers attached to a tracer and the network tracers they feed
//!
//! Containers can be attached before the tracer runs and while it runs, so
//! the set is shared with the snapshot path. The lock is only held to add,
//! remove or copy entries; namespace work happens on a copy.

use super::types::Container;
use crate::ebpf::kernel::NetworkTracer;
use crate::Result;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

pub struct ContainerRegistry {
    containers: Mutex<BTreeMap<String, Container>>,
    /// One per socket filter program, fixed once the tracer is created
    network_tracers: BTreeMap<String, Arc<dyn NetworkTracer>>,
    closed: AtomicBool,
}

impl ContainerRegistry {
    pub fn new(network_tracers: BTreeMap<String, Arc<dyn NetworkTracer>>) -> Self {
        Self {
            containers: Mutex::new(BTreeMap::new()),
            network_tracers,
            closed: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, Container>> {
        self.containers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Tracks `container` and attaches its pid to every network tracer.
    ///
    /// Stops at the first tracer error; tracers attached before it stay
    /// attached.
    pub fn attach(&self, container: Container) -> Result<()> {
        let pid = container.pid;
        debug!("Attaching container {} (pid {})", container.id, pid);
        self.lock().insert(container.id.clone(), container);

        for tracer in self.network_tracers.values() {
            tracer.attach(pid)?;
        }
        Ok(())
    }

    pub fn detach(&self, container: &Container) -> Result<()> {
        debug!("Detaching container {} (pid {})", container.id, container.pid);
        self.lock().remove(&container.id);

        for tracer in self.network_tracers.values() {
            tracer.detach(container.pid)?;
        }
        Ok(())
    }

    /// Copy of the tracked containers, ordered by id
    pub fn snapshot(&self) -> Vec<Container> {
        self.lock().values().cloned().collect()
    }

    pub fn get(&self, id: &str) -> Option<Container> {
        self.lock().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn network_tracers(&self) -> &BTreeMap<String, Arc<dyn NetworkTracer>> {
        &self.network_tracers
    }

    /// Disposes every network tracer, once
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for (program, tracer) in &self.network_tracers {
            debug!("Closing network tracer for {}", program);
            tracer.close();
        }
    }
}

impl Default for ContainerRegistry {
    fn default() -> Self {
        Self::new(BTreeMap::new())
    }
}
