//! Readers over the two buffer map kinds
//!
//! Records are pulled off the map by tasks on the tokio runtime and queued
//! on a channel. `read` blocks the calling thread on that channel, and
//! `close` cancels both the tasks and any pending read.

use aya::maps::perf::AsyncPerfEventArray;
use aya::maps::{MapData, RingBuf};
use aya::util::online_cpus;
use bytes::{Bytes, BytesMut};
use log::{debug, warn};
use probekit::ebpf::kernel::{RawRecord, ReadError, RecordReader};
use probekit::{ProbekitError, Result};
use tokio::io::unix::AsyncFd;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

/// Pages per CPU for perf buffers
const PERF_PAGES: usize = 64;

/// Records read from one perf buffer per call
const PERF_BATCH: usize = 16;

/// Records queued between the map tasks and `read`
const RECORD_QUEUE: usize = 4096;

type Delivery = std::result::Result<RawRecord, ReadError>;

/// Blocking end of the record channel
pub struct ChannelReader {
    handle: Handle,
    records: Mutex<mpsc::Receiver<Delivery>>,
    cancel: CancellationToken,
}

impl ChannelReader {
    fn new(handle: Handle, records: mpsc::Receiver<Delivery>, cancel: CancellationToken) -> Self {
        Self {
            handle,
            records: Mutex::new(records),
            cancel,
        }
    }

    /// Reader over a BPF ring buffer, woken by the map's epoll readiness
    pub fn ring_buffer(ring: RingBuf<MapData>) -> Result<Self> {
        let handle = current_handle("ring buffer")?;
        let _runtime = handle.enter();
        let ring = AsyncFd::new(ring).map_err(|e| ProbekitError::ReaderFailed {
            map: "ring buffer".to_string(),
            reason: e.to_string(),
        })?;

        let (tx, rx) = mpsc::channel(RECORD_QUEUE);
        let cancel = CancellationToken::new();
        handle.spawn(pump_ring_buffer(ring, tx, cancel.clone()));

        Ok(Self::new(handle.clone(), rx, cancel))
    }

    /// Reader over a perf event array, one task per online CPU
    pub fn perf_array(mut array: AsyncPerfEventArray<MapData>) -> Result<Self> {
        let handle = current_handle("perf event array")?;
        let _runtime = handle.enter();
        let cpus = online_cpus().map_err(|(msg, e)| ProbekitError::ReaderFailed {
            map: "perf event array".to_string(),
            reason: format!("{}: {}", msg, e),
        })?;

        let (tx, rx) = mpsc::channel(RECORD_QUEUE);
        let cancel = CancellationToken::new();
        for &cpu in &cpus {
            let buffer =
                array
                    .open(cpu, Some(PERF_PAGES))
                    .map_err(|e| ProbekitError::ReaderFailed {
                        map: "perf event array".to_string(),
                        reason: format!("opening buffer for CPU {}: {}", cpu, e),
                    })?;
            handle.spawn(pump_perf_buffer(cpu, buffer, tx.clone(), cancel.clone()));
        }
        debug!("Opened {} perf buffers", cpus.len());

        Ok(Self::new(handle.clone(), rx, cancel))
    }
}

fn current_handle(map: &str) -> Result<Handle> {
    Handle::try_current().map_err(|e| ProbekitError::ReaderFailed {
        map: map.to_string(),
        reason: e.to_string(),
    })
}

/// Queues `delivery` unless the reader is closed first.
///
/// Returns false once nobody is listening any more.
async fn forward(
    tx: &mpsc::Sender<Delivery>,
    cancel: &CancellationToken,
    delivery: Delivery,
) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        sent = tx.send(delivery) => sent.is_ok(),
    }
}

async fn pump_ring_buffer(
    mut ring: AsyncFd<RingBuf<MapData>>,
    tx: mpsc::Sender<Delivery>,
    cancel: CancellationToken,
) {
    loop {
        let mut batch = Vec::new();
        {
            let mut guard = tokio::select! {
                _ = cancel.cancelled() => return,
                guard = ring.readable_mut() => match guard {
                    Ok(guard) => guard,
                    Err(e) => {
                        forward(&tx, &cancel, Err(ReadError::Other(e.to_string()))).await;
                        return;
                    }
                },
            };

            while let Some(item) = guard.get_inner_mut().next() {
                batch.push(Bytes::copy_from_slice(&item));
            }
            guard.clear_ready();
        }

        for sample in batch {
            let record = RawRecord {
                sample,
                lost_samples: 0,
            };
            if !forward(&tx, &cancel, Ok(record)).await {
                return;
            }
        }
    }
}

async fn pump_perf_buffer(
    cpu: u32,
    mut buffer: aya::maps::perf::AsyncPerfEventArrayBuffer<MapData>,
    tx: mpsc::Sender<Delivery>,
    cancel: CancellationToken,
) {
    let mut scratch: Vec<BytesMut> = (0..PERF_BATCH).map(|_| BytesMut::with_capacity(256)).collect();

    loop {
        let events = tokio::select! {
            _ = cancel.cancelled() => return,
            events = buffer.read_events(&mut scratch) => events,
        };
        let events = match events {
            Ok(events) => events,
            Err(e) => {
                warn!("Reading perf buffer of CPU {} failed: {}", cpu, e);
                forward(&tx, &cancel, Err(ReadError::Other(e.to_string()))).await;
                return;
            }
        };

        if events.lost > 0 {
            let lost = RawRecord {
                sample: Bytes::new(),
                lost_samples: events.lost as u64,
            };
            if !forward(&tx, &cancel, Ok(lost)).await {
                return;
            }
        }
        for buf in scratch.iter().take(events.read) {
            let record = RawRecord {
                sample: Bytes::copy_from_slice(buf),
                lost_samples: 0,
            };
            if !forward(&tx, &cancel, Ok(record)).await {
                return;
            }
        }
    }
}

impl RecordReader for ChannelReader {
    fn read(&self) -> std::result::Result<RawRecord, ReadError> {
        if self.cancel.is_cancelled() {
            return Err(ReadError::Closed);
        }
        self.handle.block_on(async {
            let mut records = self.records.lock().await;
            tokio::select! {
                _ = self.cancel.cancelled() => Err(ReadError::Closed),
                delivery = records.recv() => delivery.unwrap_or(Err(ReadError::Closed)),
            }
        })
    }

    fn close(&self) {
        self.cancel.cancel();
    }
}

impl Drop for ChannelReader {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
