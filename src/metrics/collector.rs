use crate::Result;
use prometheus::{IntCounter, IntCounterVec, Opts, Registry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    Stream,
    Snapshot,
}

impl DeliveryMode {
    pub const fn as_str(&self) -> &'static str {
        match self {
            DeliveryMode::Stream => "stream",
            DeliveryMode::Snapshot => "snapshot",
        }
    }
}

impl std::fmt::Display for DeliveryMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Counters of one tracer, kept in a registry of their own so several
/// tracers can live in the same process.
#[derive(Clone)]
pub struct TracerMetrics {
    registry: Registry,
    events_total: IntCounterVec,
    lost_samples_total: IntCounter,
    read_errors_total: IntCounter,
    snapshot_runs_total: IntCounter,
}

impl TracerMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let events_total = IntCounterVec::new(
            Opts::new("probekit_events_total", "Decoded events delivered"),
            &["mode"],
        )?;
        let lost_samples_total = IntCounter::new(
            "probekit_lost_samples_total",
            "Samples dropped by the kernel before they could be read",
        )?;
        let read_errors_total = IntCounter::new(
            "probekit_read_errors_total",
            "Buffer read errors that stopped streaming",
        )?;
        let snapshot_runs_total = IntCounter::new(
            "probekit_snapshot_runs_total",
            "Completed snapshot runs",
        )?;

        registry.register(Box::new(events_total.clone()))?;
        registry.register(Box::new(lost_samples_total.clone()))?;
        registry.register(Box::new(read_errors_total.clone()))?;
        registry.register(Box::new(snapshot_runs_total.clone()))?;

        Ok(Self {
            registry,
            events_total,
            lost_samples_total,
            read_errors_total,
            snapshot_runs_total,
        })
    }

    pub fn record_events(&self, mode: DeliveryMode, count: u64) {
        self.events_total
            .with_label_values(&[mode.as_str()])
            .inc_by(count);
    }

    pub fn record_lost_samples(&self, count: u64) {
        self.lost_samples_total.inc_by(count);
    }

    pub fn record_read_error(&self) {
        self.read_errors_total.inc();
    }

    pub fn record_snapshot_run(&self) {
        self.snapshot_runs_total.inc();
    }

    pub fn events(&self, mode: DeliveryMode) -> u64 {
        self.events_total.with_label_values(&[mode.as_str()]).get()
    }

    pub fn lost_samples(&self) -> u64 {
        self.lost_samples_total.get()
    }

    pub fn read_errors(&self) -> u64 {
        self.read_errors_total.get()
    }

    pub fn snapshot_runs(&self) -> u64 {
        self.snapshot_runs_total.get()
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}
