//! Streaming delivery buffers
//!
//! Probes declare their output map with the tracer map marker. On kernels
//! with ring buffer support the map is used as declared; otherwise it is
//! turned into a perf event array before load. Reading is the same for both
//! through [`RecordReader`].

use super::collection::CollectionSpec;
use super::kernel::{Kernel, ReadError, RecordReader};
use super::maps::MapKind;
use crate::metrics::TracerMetrics;
use crate::Result;
use bytes::Bytes;
use probekit_common::reserved;
use std::sync::OnceLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// How to decide whether ring buffers can be used
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RingBufferPolicy {
    /// Create a throwaway ring buffer map once per process
    #[default]
    Probe,
    Available,
    Unavailable,
}

static RING_BUFFER_SUPPORT: OnceLock<bool> = OnceLock::new();

impl RingBufferPolicy {
    pub fn resolve(self, kernel: &dyn Kernel) -> bool {
        match self {
            RingBufferPolicy::Available => true,
            RingBufferPolicy::Unavailable => false,
            RingBufferPolicy::Probe => *RING_BUFFER_SUPPORT.get_or_init(|| {
                let available = kernel.probe_ring_buffer();
                debug!("Ring buffer support: {}", available);
                available
            }),
        }
    }
}

impl std::str::FromStr for RingBufferPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "auto" | "probe" => Ok(RingBufferPolicy::Probe),
            "on" | "true" => Ok(RingBufferPolicy::Available),
            "off" | "false" => Ok(RingBufferPolicy::Unavailable),
            other => Err(format!("expected auto, on or off, got {:?}", other)),
        }
    }
}

/// Whether `map` was declared through the tracer map marker
pub fn created_by_tracer_map_marker(spec: &CollectionSpec, map: &str) -> bool {
    spec.has_ident(&format!("{}{}", reserved::TRACER_MAP_PREFIX, map))
}

/// Adjusts the tracer map definition to what the kernel supports.
///
/// With ring buffers the scratch heap is shrunk instead of removed, since
/// programs still reference it from dead code and would fail verification.
pub fn prepare_buffer_map(spec: &mut CollectionSpec, map: &str, ring_buffer: bool) -> Result<()> {
    if ring_buffer {
        if let Some(heap) = spec.maps.get_mut(reserved::HEAP_MAP) {
            heap.kind = MapKind::Hash;
            heap.value_size = 4;
        }
        return Ok(());
    }

    debug!("Ring buffers are not available, defaulting to perf ones");
    let buffer = spec.map_mut(map)?;
    buffer.kind = MapKind::PerfEventArray;
    buffer.key_size = 4;
    buffer.value_size = 4;
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEnd {
    /// The reader was closed, normal teardown
    Closed,
    Cancelled,
    Failed(String),
}

/// Reads records until the reader is closed, the token is cancelled or a
/// read fails. Records reporting lost samples are skipped.
pub fn stream_records<F>(
    reader: &dyn RecordReader,
    cancel: &CancellationToken,
    metrics: &TracerMetrics,
    mut on_sample: F,
) -> StreamEnd
where
    F: FnMut(Bytes),
{
    loop {
        if cancel.is_cancelled() {
            return StreamEnd::Cancelled;
        }

        let record = match reader.read() {
            Ok(record) => record,
            Err(ReadError::Closed) => {
                debug!("Buffer reader closed, stopping");
                return StreamEnd::Closed;
            }
            Err(ReadError::Other(e)) => {
                error!("Reading buffer: {}", e);
                metrics.record_read_error();
                return StreamEnd::Failed(e);
            }
        };

        if cancel.is_cancelled() {
            return StreamEnd::Cancelled;
        }

        if record.lost_samples != 0 {
            warn!("Lost {} samples", record.lost_samples);
            metrics.record_lost_samples(record.lost_samples);
            continue;
        }

        on_sample(record.sample);
    }
}
