//! # Tracer
//!
//! Runs one program bundle: loads it, attaches every program, and delivers
//! decoded events either continuously (tracers) or once (snapshotters).
//!
//! ## Lifecycle
//!
//! ```text
//! new ──> attach_container* ──> run ──> close
//!          (any time)            │
//!                                ├─ install: load, rewrite, attach
//!                                ├─ streaming task (ring buffer / perf array)
//!                                └─ snapshot (iterators), or wait for done
//! ```
//!
//! Every method except the handler setters takes `&self`, so a tracer can
//! be shared and closed from another task while it runs. `close` stops the
//! streaming task by cancelling it and closing its reader, then releases
//! kernel resources in a fixed order.

use crate::clock::BootClock;
use crate::container::{Container, ContainerRegistry, NetnsRunner};
use crate::ebpf::attach::{attach_program, Attached};
use crate::ebpf::btf::KernelTypes;
use crate::ebpf::buffer::{
    created_by_tracer_map_marker, prepare_buffer_map, stream_records, RingBufferPolicy,
};
use crate::ebpf::collection::{CollectionSpec, ConstValue, ProgramKind};
use crate::ebpf::decode::EventDecoder;
use crate::ebpf::events::{Event, EventFactory};
use crate::ebpf::kernel::{
    Collection, CollectionOptions, Kernel, Link, NetworkTracer, NetworkTracerFactory,
    RecordReader, SocketEnricher, SocketEnricherFactory,
};
use crate::ebpf::loader::{InfoProvider, ProbeInfo};
use crate::ebpf::maps::{ExternalMap, MapReplacements};
use crate::ebpf::plan::DecodePlan;
use crate::ebpf::snapshot::{run_snapshot, SnapshotLink};
use crate::metrics::{DeliveryMode, TracerMetrics};
use crate::{ProbekitError, Result};
use probekit_common::reserved;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub type EventHandler = Arc<dyn Fn(Event) + Send + Sync>;
pub type EventArrayHandler = Arc<dyn Fn(Vec<Event>) + Send + Sync>;

/// Host services a tracer depends on
#[derive(Clone)]
pub struct Environment {
    pub kernel: Arc<dyn Kernel>,
    pub kernel_types: Arc<dyn KernelTypes>,
    pub network_tracers: Arc<dyn NetworkTracerFactory>,
    pub socket_enricher: Arc<dyn SocketEnricherFactory>,
    pub clock: Arc<dyn BootClock>,
    pub netns: Arc<dyn NetnsRunner>,
}

#[derive(Clone, Default)]
pub struct TracerConfig {
    /// User parameters by key, turned into runtime constants
    pub params: BTreeMap<String, String>,
    pub ring_buffer: RingBufferPolicy,
    /// Mount namespace filter shared with the probe when it declares one
    pub mntns_map: Option<Arc<dyn ExternalMap>>,
}

/// Cancellation and deadline of one run
#[derive(Debug, Clone, Default)]
pub struct RunContext {
    pub cancel: CancellationToken,
    pub timeout: Option<Duration>,
}

impl RunContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub async fn wait_for_timeout_or_done(&self) {
        match self.timeout {
            Some(timeout) => {
                tokio::select! {
                    _ = self.cancel.cancelled() => debug!("Run cancelled"),
                    _ = tokio::time::sleep(timeout) => debug!("Run timed out after {:?}", timeout),
                }
            }
            None => self.cancel.cancelled().await,
        }
    }
}

/// Kernel resources owned by an installed tracer
#[derive(Default)]
struct Resources {
    collection: Option<Box<dyn Collection>>,
    links: Vec<Box<dyn Link>>,
    snapshot_links: Vec<SnapshotLink>,
    reader: Option<Arc<dyn RecordReader>>,
    socket_enricher: Option<Box<dyn SocketEnricher>>,
    stream_cancel: Option<CancellationToken>,
    plan: Option<Arc<DecodePlan>>,
    closed: bool,
}

pub struct Tracer {
    env: Environment,
    config: TracerConfig,
    info: ProbeInfo,
    factory: Arc<EventFactory>,
    spec: Mutex<CollectionSpec>,
    registry: Arc<ContainerRegistry>,
    resources: Mutex<Resources>,
    metrics: TracerMetrics,
    event_handler: Option<EventHandler>,
    event_array_handler: Option<EventArrayHandler>,
}

impl Tracer {
    /// Loads the bundle spec and creates one network tracer per socket
    /// filter program, so containers can be attached before `run`.
    pub async fn new(
        provider: &dyn InfoProvider,
        env: Environment,
        config: TracerConfig,
    ) -> Result<Self> {
        let info = provider.probe_info().await?;
        let spec = env.kernel.load_spec(info.object.clone())?;

        let mut network_tracers: BTreeMap<String, Arc<dyn NetworkTracer>> = BTreeMap::new();
        let socket_programs = spec
            .programs_of_kind(ProgramKind::SocketFilter)
            .filter(|p| p.section_name.starts_with("socket"));
        for program in socket_programs {
            match env.network_tracers.create(program) {
                Ok(tracer) => {
                    network_tracers.insert(program.name.clone(), tracer);
                }
                Err(e) => {
                    for tracer in network_tracers.values() {
                        tracer.close();
                    }
                    return Err(ProbekitError::NetworkTracerFailed(format!(
                        "creating network tracer for {}: {}",
                        program.name, e
                    )));
                }
            }
        }

        let metrics = TracerMetrics::new()?;
        debug!(
            "Created tracer for {} with {} programs and {} network tracers",
            info.metadata.name,
            spec.programs.len(),
            network_tracers.len()
        );

        Ok(Self {
            factory: Arc::new(info.factory.clone()),
            env,
            config,
            info,
            spec: Mutex::new(spec),
            registry: Arc::new(ContainerRegistry::new(network_tracers)),
            resources: Mutex::new(Resources::default()),
            metrics,
            event_handler: None,
            event_array_handler: None,
        })
    }

    pub fn set_event_handler(&mut self, handler: impl Fn(Event) + Send + Sync + 'static) {
        self.event_handler = Some(Arc::new(handler));
    }

    pub fn set_event_array_handler(&mut self, handler: impl Fn(Vec<Event>) + Send + Sync + 'static) {
        self.event_array_handler = Some(Arc::new(handler));
    }

    pub fn set_mntns_map(&mut self, map: Arc<dyn ExternalMap>) {
        self.config.mntns_map = Some(map);
    }

    pub fn info(&self) -> &ProbeInfo {
        &self.info
    }

    pub fn metrics(&self) -> &TracerMetrics {
        &self.metrics
    }

    pub fn registry(&self) -> &Arc<ContainerRegistry> {
        &self.registry
    }

    /// The decode plan, once installed
    pub fn plan(&self) -> Option<Arc<DecodePlan>> {
        self.resources().plan.clone()
    }

    pub fn attach_container(&self, container: Container) -> Result<()> {
        self.registry.attach(container)
    }

    pub fn detach_container(&self, container: &Container) -> Result<()> {
        self.registry.detach(container)
    }

    fn resources(&self) -> MutexGuard<'_, Resources> {
        self.resources
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Installs the bundle, then delivers events.
    ///
    /// Streaming runs in a background task until `close`. When the bundle
    /// has iterators, the snapshot is taken and delivered before returning;
    /// otherwise this waits for `ctx` to time out or be cancelled. An
    /// install failure tears everything down.
    pub async fn run(&self, ctx: &RunContext) -> Result<()> {
        {
            let res = self.resources();
            if res.closed {
                return Err(ProbekitError::ConfigError("tracer is closed".to_string()));
            }
            if res.collection.is_some() {
                return Err(ProbekitError::ConfigError("tracer already running".to_string()));
            }
        }

        if let Err(e) = self.install() {
            self.close();
            return Err(e);
        }

        let (reader, snapshot_links, plan) = {
            let res = self.resources();
            (res.reader.clone(), res.snapshot_links.clone(), res.plan.clone())
        };
        let plan = plan.ok_or_else(|| ProbekitError::ConfigError("tracer not installed".to_string()))?;
        let decoder = EventDecoder::new(plan, self.factory.clone(), self.env.clock.clone());

        if let Some(reader) = reader {
            self.spawn_stream(reader, decoder.clone());
        }

        if !snapshot_links.is_empty() {
            return self.run_snapshot(snapshot_links, decoder).await;
        }

        ctx.wait_for_timeout_or_done().await;
        Ok(())
    }

    fn install(&self) -> Result<()> {
        let mut guard = self.resources();
        let res = &mut *guard;
        let mut spec = self.spec.lock().unwrap_or_else(PoisonError::into_inner);
        let metadata = &self.info.metadata;

        let tracer_map = match metadata.tracer() {
            Some((name, tracer)) => {
                if !spec.maps.contains_key(&tracer.map_name) {
                    return Err(ProbekitError::MapNotFound(format!(
                        "{} (tracer {})",
                        tracer.map_name, name
                    )));
                }
                Some(tracer.map_name.clone())
            }
            None => None,
        };

        let mut consts = metadata.constants(&self.config.params)?;
        let mut replacements = MapReplacements::new();

        if spec.maps.contains_key(reserved::SOCKETS_MAP) {
            let enricher = self
                .env
                .socket_enricher
                .create()
                .map_err(|e| ProbekitError::SocketEnricherFailed(e.to_string()))?;
            replacements.insert(reserved::SOCKETS_MAP, enricher.sockets_map());
            res.socket_enricher = Some(enricher);
        }
        if spec.maps.contains_key(reserved::MNTNS_FILTER_MAP) {
            if let Some(map) = &self.config.mntns_map {
                replacements.insert(reserved::MNTNS_FILTER_MAP, map.clone());
                consts.insert(reserved::FILTER_BY_MNTNS.to_string(), ConstValue::Bool(true));
            }
        }

        spec.rewrite_constants(&consts)?;

        if let Some(map) = &tracer_map {
            if created_by_tracer_map_marker(&spec, map) {
                let ring_buffer = self.config.ring_buffer.resolve(self.env.kernel.as_ref());
                prepare_buffer_map(&mut spec, map, ring_buffer)?;
            }
        }

        let collection = res.collection.insert(self.env.kernel.load_collection(
            &spec,
            CollectionOptions {
                map_replacements: replacements,
            },
        )?);

        if let Some(map) = &tracer_map {
            res.reader = Some(collection.open_reader(map)?);
        }

        for program in spec.programs.values() {
            match attach_program(collection.as_mut(), program, self.registry.network_tracers())? {
                Attached::Link(link) => res.links.push(link),
                Attached::Iter(scope, link) => res.snapshot_links.push(SnapshotLink {
                    program: program.name.clone(),
                    scope,
                    link,
                }),
                Attached::Socket => {}
            }
        }

        let (plan, _) = self.info.compile_plan(self.env.kernel_types.as_ref())?;
        res.plan = Some(Arc::new(plan));

        info!(
            "Installed {}: {} links, {} iterators, streaming: {}",
            metadata.name,
            res.links.len(),
            res.snapshot_links.len(),
            res.reader.is_some()
        );
        Ok(())
    }

    fn spawn_stream(&self, reader: Arc<dyn RecordReader>, decoder: EventDecoder) {
        let cancel = CancellationToken::new();
        self.resources().stream_cancel = Some(cancel.clone());

        let handler = self.event_handler.clone();
        if handler.is_none() {
            warn!("No event handler set, streamed events are dropped");
        }
        let metrics = self.metrics.clone();

        tokio::task::spawn_blocking(move || {
            let end = stream_records(reader.as_ref(), &cancel, &metrics, |sample| {
                let event = decoder.decode(sample);
                metrics.record_events(DeliveryMode::Stream, 1);
                if let Some(handler) = &handler {
                    handler(event);
                }
            });
            debug!("Streaming stopped: {:?}", end);
        });
    }

    async fn run_snapshot(&self, links: Vec<SnapshotLink>, decoder: EventDecoder) -> Result<()> {
        let containers = self.registry.snapshot();
        let netns = self.env.netns.clone();

        let events = tokio::task::spawn_blocking(move || {
            run_snapshot(&links, &containers, netns.as_ref(), &decoder)
        })
        .await
        .map_err(|e| ProbekitError::IteratorFailed(format!("snapshot task: {}", e)))??;

        self.metrics.record_snapshot_run();
        self.metrics
            .record_events(DeliveryMode::Snapshot, events.len() as u64);
        debug!("Snapshot produced {} events", events.len());

        match &self.event_array_handler {
            Some(handler) => handler(events),
            None => warn!("No event array handler set, {} events dropped", events.len()),
        }
        Ok(())
    }

    /// Releases everything: collection, links, streaming reader, socket
    /// enricher, network tracers. Safe to call more than once.
    pub fn close(&self) {
        let mut guard = self.resources();
        let res = &mut *guard;
        if res.closed {
            return;
        }
        res.closed = true;

        if let Some(cancel) = res.stream_cancel.take() {
            cancel.cancel();
        }
        if let Some(mut collection) = res.collection.take() {
            collection.close();
        }
        for mut link in res.links.drain(..) {
            if let Err(e) = link.close() {
                warn!("Closing link: {}", e);
            }
        }
        for snapshot in res.snapshot_links.drain(..) {
            if let Err(e) = snapshot.link.close() {
                warn!("Closing iterator {}: {}", snapshot.program, e);
            }
        }
        if let Some(reader) = res.reader.take() {
            reader.close();
        }
        if let Some(mut enricher) = res.socket_enricher.take() {
            enricher.close();
        }
        drop(guard);

        self.registry.close();
        debug!("Closed tracer for {}", self.info.metadata.name);
    }
}

impl Drop for Tracer {
    fn drop(&mut self) {
        self.close();
    }
}
