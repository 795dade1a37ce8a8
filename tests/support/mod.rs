//! In-memory kernel used by the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use probekit::clock::FixedBootClock;
use probekit::container::NetnsRunner;
use probekit::ebpf::attach::{AttachTarget, IterScope};
use probekit::ebpf::btf::{Enum, EnumValue, Int, Member, NoKernelTypes, Struct, Type, TypeCatalog, Typedef};
use probekit::ebpf::collection::{CollectionSpec, Constant, ProgramSpec};
use probekit::ebpf::kernel::{
    Collection, CollectionOptions, IterLink, Kernel, Link, NetworkTracer, NetworkTracerFactory,
    ProgramHandle, RawRecord, ReadError, RecordReader, SocketEnricher, SocketEnricherFactory,
};
use probekit::ebpf::loader::{InfoProvider, ProbeInfo};
use probekit::ebpf::maps::{ExternalMap, MapKind, MapSpec};
use probekit::metadata::BundleMetadata;
use probekit::{Environment, ProbekitError, Result};
use probekit_common::{reserved, type_names};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};

pub const RECORD_SIZE: usize = 16;

/// Ordered log of teardown calls shared by every fake
#[derive(Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<String>>>);

impl CallLog {
    pub fn push(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn closes(&self) -> Vec<String> {
        self.entries()
            .into_iter()
            .filter(|e| e.starts_with("close"))
            .collect()
    }
}

pub fn record(mntns: u64, state: u32) -> Vec<u8> {
    let mut data = vec![0u8; RECORD_SIZE];
    data[0..8].copy_from_slice(&mntns.to_ne_bytes());
    data[8..12].copy_from_slice(&state.to_ne_bytes());
    data
}

pub fn event_type() -> Struct {
    Struct {
        name: "event".to_string(),
        size: RECORD_SIZE as u32,
        members: vec![
            Member {
                name: "mntns_id".to_string(),
                offset: 0,
                ty: Type::Typedef(Typedef {
                    name: type_names::MNTNS_ID.to_string(),
                    target: Box::new(Type::Int(Int {
                        name: "u64".to_string(),
                        size: 8,
                        signed: false,
                    })),
                }),
            },
            Member {
                name: "state".to_string(),
                offset: 8,
                ty: Type::Enum(Enum {
                    name: "conn_state".to_string(),
                    size: 4,
                    signed: false,
                    values: vec![
                        EnumValue {
                            name: "OPEN".to_string(),
                            value: 1,
                        },
                        EnumValue {
                            name: "CLOSED".to_string(),
                            value: 2,
                        },
                    ],
                }),
            },
        ],
    }
}

pub fn tracer_metadata(params: &[(&str, &str)]) -> String {
    let mut yaml = String::from(
        "name: conntrace\ntracers:\n  conns:\n    mapName: events\n    structName: event\n",
    );
    if !params.is_empty() {
        yaml.push_str("ebpfParams:\n");
        for (variable, key) in params {
            yaml.push_str(&format!("  {}:\n    key: {}\n    type: uint32\n", variable, key));
        }
    }
    yaml
}

pub const SNAPSHOT_METADATA: &str = "name: sockets\nsnapshotters:\n  sockets:\n    structName: event\n";

pub struct StaticProvider {
    pub info: ProbeInfo,
}

impl StaticProvider {
    pub fn new(metadata: &str) -> Self {
        let metadata = BundleMetadata::from_yaml(metadata.as_bytes()).unwrap();
        let types = TypeCatalog {
            types: vec![Type::Struct(event_type())],
        };
        Self {
            info: ProbeInfo::new(Bytes::from_static(b"\x7fELF"), metadata, types).unwrap(),
        }
    }
}

#[async_trait]
impl InfoProvider for StaticProvider {
    async fn probe_info(&self) -> Result<ProbeInfo> {
        Ok(self.info.clone())
    }
}

/// Spec of a bundle streaming through the `events` map
pub fn streaming_spec(marker: bool) -> CollectionSpec {
    let mut spec = CollectionSpec::new(Bytes::from_static(b"\x7fELF"));
    let mut events = MapSpec::new("events", MapKind::RingBuf);
    events.max_entries = 256 * 1024;
    spec.add_map(events);

    let mut heap = MapSpec::new(reserved::HEAP_MAP, MapKind::PerCpuArray);
    heap.key_size = 4;
    heap.value_size = RECORD_SIZE as u32;
    heap.max_entries = 1;
    spec.add_map(heap);

    if marker {
        spec.idents.insert(format!("{}events", reserved::TRACER_MAP_PREFIX));
    }
    spec.add_program(ProgramSpec::from_section("trace_connect", "kprobe/tcp_connect"));
    spec.add_program(ProgramSpec::from_section(
        "trace_close",
        "tracepoint/sock/inet_sock_set_state",
    ));
    spec
}

/// Blocking reader fed by the test
pub struct FakeReader {
    queue: Mutex<VecDeque<RawRecord>>,
    ready: Condvar,
    closed: AtomicBool,
    reading: AtomicBool,
    stopped: AtomicBool,
    log: CallLog,
}

impl FakeReader {
    pub fn new(log: CallLog) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            ready: Condvar::new(),
            closed: AtomicBool::new(false),
            reading: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            log,
        }
    }

    pub fn push(&self, sample: Vec<u8>, lost_samples: u64) {
        self.queue.lock().unwrap().push_back(RawRecord {
            sample: Bytes::from(sample),
            lost_samples,
        });
        self.ready.notify_all();
    }

    /// Whether a read has started
    pub fn reading(&self) -> bool {
        self.reading.load(Ordering::SeqCst)
    }

    /// Whether a read returned `Closed`
    pub fn stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl RecordReader for FakeReader {
    fn read(&self) -> std::result::Result<RawRecord, ReadError> {
        self.reading.store(true, Ordering::SeqCst);
        let mut queue = self.queue.lock().unwrap();
        loop {
            if self.closed.load(Ordering::SeqCst) {
                self.stopped.store(true, Ordering::SeqCst);
                return Err(ReadError::Closed);
            }
            if let Some(record) = queue.pop_front() {
                return Ok(record);
            }
            queue = self.ready.wait(queue).unwrap();
        }
    }

    fn close(&self) {
        let _queue = self.queue.lock().unwrap();
        self.closed.store(true, Ordering::SeqCst);
        self.ready.notify_all();
        self.log.push("close reader");
    }
}

pub struct FakeLink {
    name: String,
    log: CallLog,
}

impl Link for FakeLink {
    fn close(&mut self) -> Result<()> {
        self.log.push(format!("close link {}", self.name));
        Ok(())
    }
}

pub struct FakeIterLink {
    name: String,
    output: Vec<u8>,
    log: CallLog,
}

impl IterLink for FakeIterLink {
    fn read_all(&self) -> Result<Vec<u8>> {
        self.log.push(format!("read iter {}", self.name));
        Ok(self.output.clone())
    }

    fn close(&self) -> Result<()> {
        self.log.push(format!("close iter {}", self.name));
        Ok(())
    }
}

/// A collection load as seen by the kernel
#[derive(Clone)]
pub struct LoadRequest {
    pub spec: CollectionSpec,
    pub replacements: Vec<String>,
}

pub struct FakeKernel {
    pub spec: CollectionSpec,
    pub reader: Arc<FakeReader>,
    pub iter_output: BTreeMap<String, Vec<u8>>,
    pub loads: Mutex<Vec<LoadRequest>>,
    pub attached: Arc<Mutex<Vec<(String, AttachTarget)>>>,
    pub log: CallLog,
}

impl FakeKernel {
    pub fn new(spec: CollectionSpec, log: CallLog) -> Self {
        Self {
            spec,
            reader: Arc::new(FakeReader::new(log.clone())),
            iter_output: BTreeMap::new(),
            loads: Mutex::new(Vec::new()),
            attached: Arc::new(Mutex::new(Vec::new())),
            log,
        }
    }

    pub fn last_load(&self) -> LoadRequest {
        self.loads.lock().unwrap().last().cloned().expect("collection loaded")
    }
}

impl Kernel for FakeKernel {
    fn probe_ring_buffer(&self) -> bool {
        true
    }

    fn load_spec(&self, _object: Bytes) -> Result<CollectionSpec> {
        Ok(self.spec.clone())
    }

    fn load_collection(
        &self,
        spec: &CollectionSpec,
        options: CollectionOptions,
    ) -> Result<Box<dyn Collection>> {
        self.loads.lock().unwrap().push(LoadRequest {
            spec: spec.clone(),
            replacements: options.map_replacements.names().map(String::from).collect(),
        });
        Ok(Box::new(FakeCollection {
            programs: spec.programs.keys().cloned().collect(),
            maps: spec.maps.keys().cloned().collect(),
            reader: self.reader.clone(),
            iter_output: self.iter_output.clone(),
            attached: self.attached.clone(),
            log: self.log.clone(),
        }))
    }
}

pub struct FakeCollection {
    programs: BTreeSet<String>,
    maps: BTreeSet<String>,
    reader: Arc<FakeReader>,
    iter_output: BTreeMap<String, Vec<u8>>,
    attached: Arc<Mutex<Vec<(String, AttachTarget)>>>,
    log: CallLog,
}

impl FakeCollection {
    fn check_program(&self, program: &str) -> Result<()> {
        if self.programs.contains(program) {
            Ok(())
        } else {
            Err(ProbekitError::ProgramNotFound(program.to_string()))
        }
    }
}

impl Collection for FakeCollection {
    fn attach(&mut self, program: &str, target: &AttachTarget) -> Result<Box<dyn Link>> {
        self.check_program(program)?;
        self.attached
            .lock()
            .unwrap()
            .push((program.to_string(), target.clone()));
        Ok(Box::new(FakeLink {
            name: program.to_string(),
            log: self.log.clone(),
        }))
    }

    fn attach_iter(&mut self, program: &str, _scope: IterScope) -> Result<Arc<dyn IterLink>> {
        self.check_program(program)?;
        Ok(Arc::new(FakeIterLink {
            name: program.to_string(),
            output: self.iter_output.get(program).cloned().unwrap_or_default(),
            log: self.log.clone(),
        }))
    }

    fn program(&self, name: &str) -> Result<ProgramHandle> {
        self.check_program(name)?;
        Ok(ProgramHandle::new(name, Arc::new(name.to_string())))
    }

    fn open_reader(&mut self, map: &str) -> Result<Arc<dyn RecordReader>> {
        if !self.maps.contains(map) {
            return Err(ProbekitError::MapNotFound(map.to_string()));
        }
        Ok(self.reader.clone())
    }

    fn close(&mut self) {
        self.log.push("close collection");
    }
}

pub struct FakeNetworkTracer {
    name: String,
    pub programs: Mutex<Vec<String>>,
    pub pids: Mutex<Vec<(String, u32)>>,
    log: CallLog,
}

impl NetworkTracer for FakeNetworkTracer {
    fn attach_program(&self, program: &ProgramHandle) -> Result<()> {
        self.programs.lock().unwrap().push(program.name().to_string());
        Ok(())
    }

    fn attach(&self, pid: u32) -> Result<()> {
        self.pids.lock().unwrap().push(("attach".to_string(), pid));
        Ok(())
    }

    fn detach(&self, pid: u32) -> Result<()> {
        self.pids.lock().unwrap().push(("detach".to_string(), pid));
        Ok(())
    }

    fn close(&self) {
        self.log.push(format!("close network tracer {}", self.name));
    }
}

#[derive(Default)]
pub struct FakeNetworkTracers {
    pub created: Mutex<Vec<Arc<FakeNetworkTracer>>>,
    pub log: CallLog,
}

impl NetworkTracerFactory for FakeNetworkTracers {
    fn create(&self, program: &ProgramSpec) -> Result<Arc<dyn NetworkTracer>> {
        let tracer = Arc::new(FakeNetworkTracer {
            name: program.name.clone(),
            programs: Mutex::new(Vec::new()),
            pids: Mutex::new(Vec::new()),
            log: self.log.clone(),
        });
        self.created.lock().unwrap().push(tracer.clone());
        Ok(tracer)
    }
}

pub struct FixedMap {
    pub name: &'static str,
    pub fd: i32,
}

impl ExternalMap for FixedMap {
    fn name(&self) -> &str {
        self.name
    }

    fn fd(&self) -> i32 {
        self.fd
    }
}

pub struct FakeEnricher {
    log: CallLog,
}

impl SocketEnricher for FakeEnricher {
    fn sockets_map(&self) -> Arc<dyn ExternalMap> {
        Arc::new(FixedMap {
            name: "sockets",
            fd: 42,
        })
    }

    fn close(&mut self) {
        self.log.push("close enricher");
    }
}

pub struct FakeEnrichers {
    pub fail: bool,
    pub log: CallLog,
}

impl SocketEnricherFactory for FakeEnrichers {
    fn create(&self) -> Result<Box<dyn SocketEnricher>> {
        if self.fail {
            return Err(ProbekitError::UnsupportedFeature("BTF".to_string()));
        }
        Ok(Box::new(FakeEnricher {
            log: self.log.clone(),
        }))
    }
}

/// Records which pids were entered; pids in `gone` behave like exited
/// processes
#[derive(Default)]
pub struct FakeNetns {
    pub gone: BTreeSet<u32>,
    pub entered: Mutex<Vec<u32>>,
}

impl NetnsRunner for FakeNetns {
    fn run_in(&self, pid: u32, f: &mut (dyn FnMut() -> Result<()> + Send)) -> Result<()> {
        self.entered.lock().unwrap().push(pid);
        if self.gone.contains(&pid) {
            return Err(ProbekitError::ProcessGone(pid));
        }
        f()
    }
}

pub struct Harness {
    pub kernel: Arc<FakeKernel>,
    pub network_tracers: Arc<FakeNetworkTracers>,
    pub netns: Arc<FakeNetns>,
    pub log: CallLog,
}

impl Harness {
    pub fn new(spec: CollectionSpec) -> Self {
        Self::with(spec, BTreeMap::new(), FakeNetns::default())
    }

    pub fn with(
        spec: CollectionSpec,
        iter_output: BTreeMap<String, Vec<u8>>,
        netns: FakeNetns,
    ) -> Self {
        let log = CallLog::default();
        let mut kernel = FakeKernel::new(spec, log.clone());
        kernel.iter_output = iter_output;
        Self {
            kernel: Arc::new(kernel),
            network_tracers: Arc::new(FakeNetworkTracers {
                created: Mutex::new(Vec::new()),
                log: log.clone(),
            }),
            netns: Arc::new(netns),
            log,
        }
    }

    pub fn environment(&self) -> Environment {
        self.environment_with_enricher(false)
    }

    pub fn environment_with_enricher(&self, fail: bool) -> Environment {
        Environment {
            kernel: self.kernel.clone(),
            kernel_types: Arc::new(NoKernelTypes),
            network_tracers: self.network_tracers.clone(),
            socket_enricher: Arc::new(FakeEnrichers {
                fail,
                log: self.log.clone(),
            }),
            clock: Arc::new(FixedBootClock::default()),
            netns: self.netns.clone(),
        }
    }
}

pub fn add_constant(spec: &mut CollectionSpec, name: &str, size: usize) {
    spec.constants.insert(name.to_string(), Constant::new(size));
}
