//! Kernel backend on top of aya
//!
//! Bundle objects are parsed twice: `object` gives program sections,
//! read-only constants and symbol names, aya's own parser gives map
//! definitions. Loading goes through [`EbpfLoader`], which can only set
//! globals and map sizes, so spec edits beyond that are refused.

use crate::readers::ChannelReader;
use aya::maps::perf::AsyncPerfEventArray;
use aya::maps::{Map, RingBuf};
use aya::programs::{
    FEntry, FExit, KProbe, Program, ProgramError, RawTracePoint, SocketFilter, TracePoint,
};
use aya::{Btf, Ebpf, EbpfLoader};
use aya_log::EbpfLogger;
use bytes::Bytes;
use log::{debug, info, warn};
use object::{Object, ObjectSection, ObjectSymbol, SymbolKind};
use probekit::ebpf::attach::{AttachTarget, IterScope};
use probekit::ebpf::collection::{CollectionSpec, Constant, ProgramKind, ProgramSpec};
use probekit::ebpf::kernel::{
    Collection, CollectionOptions, IterLink, Kernel, Link, ProgramHandle, RecordReader,
};
use probekit::ebpf::maps::{MapKind, MapSpec};
use probekit::{ProbekitError, Result};
use probekit_common::reserved;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

/// First kernel with BPF ring buffers
const RING_BUFFER_KERNEL: (u32, u32) = (5, 8);

pub struct AyaKernel {
    release: Option<(u32, u32)>,
}

impl AyaKernel {
    /// Runs pre-flight checks and reads the kernel release
    pub fn new() -> anyhow::Result<Self> {
        run_preflight_checks()?;
        Ok(Self {
            release: kernel_version().ok(),
        })
    }
}

/// Creates and drops a minimal ring buffer map
fn create_ring_map() -> std::io::Result<()> {
    const BPF_MAP_CREATE: libc::c_long = 0;
    const BPF_MAP_TYPE_RINGBUF: u32 = 27;

    // SAFETY: sysconf only reads a system constant
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    // map_type, key_size, value_size, max_entries, rest zeroed
    let mut attr = [0u32; 32];
    attr[0] = BPF_MAP_TYPE_RINGBUF;
    attr[3] = page_size.max(4096) as u32;

    // SAFETY: attr outlives the call and its length is passed alongside it;
    // the kernel only reads from it for BPF_MAP_CREATE.
    let fd = unsafe {
        libc::syscall(
            libc::SYS_bpf,
            BPF_MAP_CREATE,
            attr.as_ptr(),
            std::mem::size_of_val(&attr),
        )
    };
    if fd < 0 {
        return Err(std::io::Error::last_os_error());
    }
    // SAFETY: fd was just returned by the kernel and is owned by nobody else
    unsafe { libc::close(fd as libc::c_int) };
    Ok(())
}

fn ring_buffer_by_release(release: Option<(u32, u32)>) -> bool {
    match release {
        Some(release) => release >= RING_BUFFER_KERNEL,
        None => {
            warn!("Unknown kernel release, assuming no ring buffer support");
            false
        }
    }
}

impl Kernel for AyaKernel {
    fn probe_ring_buffer(&self) -> bool {
        match create_ring_map() {
            Ok(()) => true,
            Err(e) if e.raw_os_error() == Some(libc::EPERM) => {
                debug!("Ring buffer probe not permitted, using kernel release");
                ring_buffer_by_release(self.release)
            }
            Err(e) => {
                debug!("Ring buffer map creation failed: {}", e);
                warn!(
                    "No BPF ring buffer support; bundles that stream through a ring buffer \
                     cannot be switched to a perf event array by this loader"
                );
                false
            }
        }
    }

    fn load_spec(&self, object: Bytes) -> Result<CollectionSpec> {
        parse_spec(object)
    }

    fn load_collection(
        &self,
        spec: &CollectionSpec,
        options: CollectionOptions,
    ) -> Result<Box<dyn Collection>> {
        if !options.map_replacements.is_empty() {
            let names: Vec<_> = options.map_replacements.names().collect();
            return Err(ProbekitError::UnsupportedFeature(format!(
                "replacing maps {:?}",
                names
            )));
        }

        let declared = parse_maps(&spec.object)?;
        let globals: Vec<(&str, Vec<u8>)> = spec
            .constants
            .iter()
            .filter_map(|(name, c)| c.value.as_ref().map(|v| (name.as_str(), v.to_ne_bytes())))
            .collect();

        let mut loader = EbpfLoader::new();
        for (name, map) in &spec.maps {
            let Some(original) = declared.get(name) else {
                continue;
            };
            if !keeps_declared_kind(name, original.kind, map.kind)? {
                continue;
            }
            if map.max_entries != original.max_entries {
                loader.set_max_entries(name, map.max_entries);
            }
        }
        for (name, value) in &globals {
            debug!("Setting constant {} ({} bytes)", name, value.len());
            loader.set_global(name, value.as_slice(), true);
        }

        let mut ebpf = loader
            .load(&spec.object)
            .map_err(|e| ProbekitError::CollectionLoadFailed(e.to_string()))?;

        if let Err(e) = EbpfLogger::init(&mut ebpf) {
            debug!("No eBPF logger: {}", e);
        }

        // Network tracers get program fds through `&self`, so socket
        // filters are loaded up front.
        for program in spec.programs_of_kind(ProgramKind::SocketFilter) {
            let filter: &mut SocketFilter = program_mut(&mut ebpf, &program.name)?;
            filter.load().map_err(|e| attach_error(&program.name, e))?;
        }

        info!(
            "Loaded {} programs and {} maps",
            spec.programs.len(),
            spec.maps.len()
        );
        Ok(Box::new(AyaCollection { ebpf: Some(ebpf) }))
    }
}

/// Whether the loaded map can take the sizes of `requested`.
///
/// aya cannot change a map's type at load time. The heap map keeps its
/// declared type, since only its size matters. Any other change is refused,
/// including the perf event array fallback for ring buffer tracer maps.
fn keeps_declared_kind(name: &str, declared: MapKind, requested: MapKind) -> Result<bool> {
    if declared == requested {
        return Ok(true);
    }
    if name == reserved::HEAP_MAP {
        debug!("Keeping {} as {}", name, declared);
        return Ok(false);
    }
    if declared == MapKind::RingBuf && requested == MapKind::PerfEventArray {
        warn!(
            "Map {} needs the perf event array fallback, which this loader does not support; \
             run on a kernel with BPF ring buffers (5.8+)",
            name
        );
    }
    Err(ProbekitError::UnsupportedFeature(format!(
        "changing map {} from {} to {}",
        name, declared, requested
    )))
}

fn map_kind(map_type: u32) -> MapKind {
    match map_type {
        1 => MapKind::Hash,
        2 => MapKind::Array,
        4 => MapKind::PerfEventArray,
        6 => MapKind::PerCpuArray,
        9 => MapKind::LruHash,
        27 => MapKind::RingBuf,
        other => MapKind::Other(other),
    }
}

fn parse_error(e: impl std::fmt::Display) -> ProbekitError {
    ProbekitError::CollectionLoadFailed(format!("parsing object: {}", e))
}

/// Map definitions as declared in the object
fn parse_maps(data: &[u8]) -> Result<BTreeMap<String, MapSpec>> {
    let obj = aya_obj::Object::parse(data).map_err(parse_error)?;

    let mut maps = BTreeMap::new();
    for (name, map) in &obj.maps {
        // .rodata, .bss and .data back globals, not user maps
        if name.starts_with('.') {
            continue;
        }
        let mut spec = MapSpec::new(name.clone(), map_kind(map.map_type()));
        spec.key_size = map.key_size();
        spec.value_size = map.value_size();
        spec.max_entries = map.max_entries();
        maps.insert(name.clone(), spec);
    }
    Ok(maps)
}

fn parse_spec(data: Bytes) -> Result<CollectionSpec> {
    let mut spec = CollectionSpec::new(data.clone());
    let file = object::File::parse(&*data).map_err(parse_error)?;

    for symbol in file.symbols() {
        let Ok(name) = symbol.name() else {
            continue;
        };
        if name.is_empty() {
            continue;
        }
        spec.idents.insert(name.to_string());

        let Some(section) = symbol
            .section_index()
            .and_then(|index| file.section_by_index(index).ok())
        else {
            continue;
        };
        let Ok(section_name) = section.name() else {
            continue;
        };

        match symbol.kind() {
            SymbolKind::Text if symbol.is_global() && section_name != ".text" => {
                spec.add_program(ProgramSpec::from_section(name, section_name));
            }
            SymbolKind::Data if section_name.starts_with(".rodata") => {
                spec.constants
                    .insert(name.to_string(), Constant::new(symbol.size() as usize));
            }
            _ => {}
        }
    }

    for map in parse_maps(&data)?.into_values() {
        spec.add_map(map);
    }

    debug!(
        "Parsed object: {} programs, {} maps, {} constants",
        spec.programs.len(),
        spec.maps.len(),
        spec.constants.len()
    );
    Ok(spec)
}

fn attach_error(program: &str, e: ProgramError) -> ProbekitError {
    ProbekitError::AttachFailed {
        program: program.to_string(),
        reason: e.to_string(),
    }
}

fn program_mut<'a, T>(ebpf: &'a mut Ebpf, name: &str) -> Result<&'a mut T>
where
    &'a mut T: TryFrom<&'a mut Program, Error = ProgramError>,
{
    let program = ebpf
        .program_mut(name)
        .ok_or_else(|| ProbekitError::ProgramNotFound(name.to_string()))?;
    program.try_into().map_err(|e| attach_error(name, e))
}

/// Link detached when dropped
struct OwnedLink<T: Send>(Option<T>);

impl<T: Send> Link for OwnedLink<T> {
    fn close(&mut self) -> Result<()> {
        self.0.take();
        Ok(())
    }
}

pub struct AyaCollection {
    ebpf: Option<Ebpf>,
}

impl AyaCollection {
    fn ebpf(&mut self) -> Result<&mut Ebpf> {
        self.ebpf
            .as_mut()
            .ok_or_else(|| ProbekitError::CollectionLoadFailed("collection closed".to_string()))
    }
}

impl Collection for AyaCollection {
    fn attach(&mut self, program: &str, target: &AttachTarget) -> Result<Box<dyn Link>> {
        let ebpf = self.ebpf()?;
        let err = |e: ProgramError| attach_error(program, e);

        let link: Box<dyn Link> = match target {
            AttachTarget::Kprobe { symbol } | AttachTarget::Kretprobe { symbol } => {
                let p: &mut KProbe = program_mut(ebpf, program)?;
                p.load().map_err(err)?;
                let id = p.attach(symbol, 0).map_err(err)?;
                Box::new(OwnedLink(Some(p.take_link(id).map_err(err)?)))
            }
            AttachTarget::Tracepoint { category, name } => {
                let p: &mut TracePoint = program_mut(ebpf, program)?;
                p.load().map_err(err)?;
                let id = p.attach(category, name).map_err(err)?;
                Box::new(OwnedLink(Some(p.take_link(id).map_err(err)?)))
            }
            AttachTarget::RawTracepoint { name } => {
                let p: &mut RawTracePoint = program_mut(ebpf, program)?;
                p.load().map_err(err)?;
                let id = p.attach(name).map_err(err)?;
                Box::new(OwnedLink(Some(p.take_link(id).map_err(err)?)))
            }
            AttachTarget::Fentry { function } => {
                let btf = Btf::from_sys_fs().map_err(|e| ProbekitError::AttachFailed {
                    program: program.to_string(),
                    reason: format!("kernel BTF: {}", e),
                })?;
                let p: &mut FEntry = program_mut(ebpf, program)?;
                p.load(function, &btf).map_err(err)?;
                let id = p.attach().map_err(err)?;
                Box::new(OwnedLink(Some(p.take_link(id).map_err(err)?)))
            }
            AttachTarget::Fexit { function } => {
                let btf = Btf::from_sys_fs().map_err(|e| ProbekitError::AttachFailed {
                    program: program.to_string(),
                    reason: format!("kernel BTF: {}", e),
                })?;
                let p: &mut FExit = program_mut(ebpf, program)?;
                p.load(function, &btf).map_err(err)?;
                let id = p.attach().map_err(err)?;
                Box::new(OwnedLink(Some(p.take_link(id).map_err(err)?)))
            }
        };

        debug!("Attached {} to {}", program, target);
        Ok(link)
    }

    fn attach_iter(&mut self, program: &str, scope: IterScope) -> Result<Arc<dyn IterLink>> {
        Err(ProbekitError::UnsupportedFeature(format!(
            "{} iterator program {}",
            scope, program
        )))
    }

    fn program(&self, name: &str) -> Result<ProgramHandle> {
        let ebpf = self
            .ebpf
            .as_ref()
            .ok_or_else(|| ProbekitError::CollectionLoadFailed("collection closed".to_string()))?;
        let program = ebpf
            .program(name)
            .ok_or_else(|| ProbekitError::ProgramNotFound(name.to_string()))?;
        let filter: &SocketFilter = program.try_into().map_err(|e| attach_error(name, e))?;
        let fd = filter
            .fd()
            .map_err(|e| attach_error(name, e))?
            .try_clone()
            .map_err(|e| ProbekitError::AttachFailed {
                program: name.to_string(),
                reason: e.to_string(),
            })?;
        Ok(ProgramHandle::new(name, Arc::new(fd)))
    }

    fn open_reader(&mut self, map: &str) -> Result<Arc<dyn RecordReader>> {
        let data = self
            .ebpf()?
            .take_map(map)
            .ok_or_else(|| ProbekitError::MapNotFound(map.to_string()))?;
        let reader_error = |reason: String| ProbekitError::ReaderFailed {
            map: map.to_string(),
            reason,
        };

        if matches!(data, Map::RingBuf(_)) {
            let ring = RingBuf::try_from(data).map_err(|e| reader_error(e.to_string()))?;
            return Ok(Arc::new(ChannelReader::ring_buffer(ring)?));
        }
        if matches!(data, Map::PerfEventArray(_)) {
            let array =
                AsyncPerfEventArray::try_from(data).map_err(|e| reader_error(e.to_string()))?;
            return Ok(Arc::new(ChannelReader::perf_array(array)?));
        }
        Err(reader_error("not a ring buffer or perf event array".to_string()))
    }

    fn close(&mut self) {
        if self.ebpf.take().is_some() {
            debug!("Unloaded collection");
        }
    }
}

/// Run pre-flight checks to validate the system can run eBPF programs
fn run_preflight_checks() -> anyhow::Result<()> {
    info!("Running pre-flight checks...");

    let (major, minor) = kernel_version()?;
    if (major, minor) < (5, 2) {
        anyhow::bail!(
            "Kernel {}.{} is too old. Bundles need 5.2+ (5.8+ for ring buffers)",
            major,
            minor
        );
    }
    info!("Kernel version: {}.{}", major, minor);

    check_btf();
    check_capabilities();

    info!("Pre-flight checks passed");
    Ok(())
}

/// Kernel major and minor version from `uname -r`
fn kernel_version() -> anyhow::Result<(u32, u32)> {
    use anyhow::{anyhow, Context};

    let output = std::process::Command::new("uname")
        .arg("-r")
        .output()
        .context("Failed to get kernel version")?;
    let version_str = String::from_utf8(output.stdout)?;
    parse_release(&version_str).ok_or_else(|| anyhow!("Could not parse kernel version: {}", version_str))
}

fn parse_release(release: &str) -> Option<(u32, u32)> {
    let mut parts = release.trim().split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.split('-').next()?.parse().ok()?;
    Some((major, minor))
}

/// Check if BTF (BPF Type Format) is available
fn check_btf() {
    if !Path::new("/sys/kernel/btf/vmlinux").exists() {
        warn!("BTF not found at /sys/kernel/btf/vmlinux");
        warn!("Kernel enums cannot be resolved and fentry/fexit programs will not attach");
        return;
    }
    info!("BTF available");
}

/// Check if process has necessary capabilities to load eBPF programs
fn check_capabilities() {
    // SAFETY: geteuid has no preconditions and cannot fail
    let euid = unsafe { libc::geteuid() };

    if euid != 0 {
        warn!(
            "Not running as root (euid={}). Ensure CAP_BPF and CAP_PERFMON are granted.",
            euid
        );
    } else {
        info!("Running with root privileges");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_release() {
        assert_eq!(parse_release("6.8.0-45-generic\n"), Some((6, 8)));
        assert_eq!(parse_release("5.15.153.1-microsoft-standard-WSL2"), Some((5, 15)));
        assert_eq!(parse_release("5.4-rc1"), Some((5, 4)));
        assert_eq!(parse_release("garbage"), None);
    }

    #[test]
    fn test_ring_buffer_by_release() {
        assert!(ring_buffer_by_release(Some((5, 8))));
        assert!(ring_buffer_by_release(Some((6, 1))));
        assert!(!ring_buffer_by_release(Some((5, 4))));
        assert!(!ring_buffer_by_release(None));
    }

    #[test]
    fn test_map_kinds() {
        assert_eq!(map_kind(27), MapKind::RingBuf);
        assert_eq!(map_kind(4), MapKind::PerfEventArray);
        assert_eq!(map_kind(6), MapKind::PerCpuArray);
        assert_eq!(map_kind(30), MapKind::Other(30));
    }

    #[test]
    fn test_map_kind_changes() {
        assert!(keeps_declared_kind("events", MapKind::RingBuf, MapKind::RingBuf).unwrap());
        assert!(
            !keeps_declared_kind(reserved::HEAP_MAP, MapKind::Array, MapKind::PerCpuArray).unwrap()
        );
        assert!(matches!(
            keeps_declared_kind("events", MapKind::RingBuf, MapKind::PerfEventArray),
            Err(ProbekitError::UnsupportedFeature(_))
        ));
    }

    #[test]
    fn test_invalid_object() {
        let err = parse_spec(Bytes::from_static(b"not an elf")).unwrap_err();
        assert!(matches!(err, ProbekitError::CollectionLoadFailed(_)));
    }
}
