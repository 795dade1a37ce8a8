//! Kernel-facing primitives behind traits
//!
//! The tracer only ever talks to the kernel through these traits: one
//! implementation drives the real kernel (the agent's aya backend), tests
//! use in-memory fakes.

use super::attach::{AttachTarget, IterScope};
use super::collection::{CollectionSpec, ProgramSpec};
use super::maps::{ExternalMap, MapReplacements};
use crate::Result;
use bytes::Bytes;
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

pub trait Kernel: Send + Sync {
    /// Whether ring buffer maps can be created on this kernel
    fn probe_ring_buffer(&self) -> bool;

    /// Parses a program bundle into an editable spec
    fn load_spec(&self, object: Bytes) -> Result<CollectionSpec>;

    /// Creates maps and loads programs
    fn load_collection(
        &self,
        spec: &CollectionSpec,
        options: CollectionOptions,
    ) -> Result<Box<dyn Collection>>;
}

#[derive(Debug, Clone, Default)]
pub struct CollectionOptions {
    pub map_replacements: MapReplacements,
}

/// A loaded set of programs and maps
pub trait Collection: Send {
    /// Attaches `program` to a hook that produces a plain link
    fn attach(&mut self, program: &str, target: &AttachTarget) -> Result<Box<dyn Link>>;

    /// Creates an iterator link that is read on demand
    fn attach_iter(&mut self, program: &str, scope: IterScope) -> Result<Arc<dyn IterLink>>;

    /// Handle to a loaded program, used by network tracers
    fn program(&self, name: &str) -> Result<ProgramHandle>;

    /// Opens a reader on a ring buffer or perf event array map
    fn open_reader(&mut self, map: &str) -> Result<Arc<dyn RecordReader>>;

    /// Releases every program and map
    fn close(&mut self);
}

pub trait Link: Send {
    fn close(&mut self) -> Result<()>;
}

/// Iterator link, read whole in one go
pub trait IterLink: Send + Sync {
    /// Runs the iterator once and returns everything it wrote
    fn read_all(&self) -> Result<Vec<u8>>;

    fn close(&self) -> Result<()>;
}

/// One record taken off a delivery buffer
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawRecord {
    pub sample: Bytes,
    /// Records dropped by the kernel before this one (perf arrays only)
    pub lost_samples: u64,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReadError {
    #[error("reader closed")]
    Closed,

    #[error("{0}")]
    Other(String),
}

/// Blocking reader over a ring buffer or perf event array.
///
/// `read` may be pending on one thread while `close` is called from another;
/// the pending read then returns [`ReadError::Closed`].
pub trait RecordReader: Send + Sync {
    fn read(&self) -> std::result::Result<RawRecord, ReadError>;

    fn close(&self);
}

/// Opaque reference to a loaded program
#[derive(Clone)]
pub struct ProgramHandle {
    name: String,
    inner: Arc<dyn Any + Send + Sync>,
}

impl ProgramHandle {
    pub fn new(name: impl Into<String>, inner: Arc<dyn Any + Send + Sync>) -> Self {
        Self {
            name: name.into(),
            inner,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.inner.downcast_ref::<T>()
    }
}

impl fmt::Debug for ProgramHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgramHandle")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Per-program tracer for socket filters, attached per process
pub trait NetworkTracer: Send + Sync {
    fn attach_program(&self, program: &ProgramHandle) -> Result<()>;

    fn attach(&self, pid: u32) -> Result<()>;

    fn detach(&self, pid: u32) -> Result<()>;

    fn close(&self);
}

pub trait NetworkTracerFactory: Send + Sync {
    fn create(&self, program: &ProgramSpec) -> Result<Arc<dyn NetworkTracer>>;
}

/// Socket-enrichment subsystem, opaque apart from the map it shares
pub trait SocketEnricher: Send {
    fn sockets_map(&self) -> Arc<dyn ExternalMap>;

    fn close(&mut self);
}

pub trait SocketEnricherFactory: Send + Sync {
    fn create(&self) -> Result<Box<dyn SocketEnricher>>;
}
