//! Editable description of a program bundle before it is loaded
//!
//! Loaders fill a [`CollectionSpec`] from the bundle's object file. The
//! tracer then adjusts map definitions and runtime constants in place and
//! hands the spec to [`Kernel::load_collection`](super::kernel::Kernel).

use super::maps::MapSpec;
use crate::{ProbekitError, Result};
use bytes::Bytes;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgramKind {
    Kprobe,
    TracePoint,
    RawTracepoint,
    SocketFilter,
    /// BTF-enabled programs: iterators, fentry and fexit
    Tracing,
    Xdp,
    SchedClassifier,
    Lsm,
    Unknown,
}

impl ProgramKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            ProgramKind::Kprobe => "kprobe",
            ProgramKind::TracePoint => "tracepoint",
            ProgramKind::RawTracepoint => "raw_tracepoint",
            ProgramKind::SocketFilter => "socket_filter",
            ProgramKind::Tracing => "tracing",
            ProgramKind::Xdp => "xdp",
            ProgramKind::SchedClassifier => "sched_cls",
            ProgramKind::Lsm => "lsm",
            ProgramKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ProgramKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Section prefixes and the program kind they declare. Longer prefixes
/// sharing a stem come first.
const SECTION_KINDS: &[(&str, ProgramKind)] = &[
    ("kretprobe/", ProgramKind::Kprobe),
    ("kprobe/", ProgramKind::Kprobe),
    ("tracepoint/", ProgramKind::TracePoint),
    ("tp/", ProgramKind::TracePoint),
    ("raw_tracepoint/", ProgramKind::RawTracepoint),
    ("raw_tp/", ProgramKind::RawTracepoint),
    ("iter/", ProgramKind::Tracing),
    ("fentry/", ProgramKind::Tracing),
    ("fexit/", ProgramKind::Tracing),
    ("socket", ProgramKind::SocketFilter),
    ("xdp", ProgramKind::Xdp),
    ("classifier", ProgramKind::SchedClassifier),
    ("tc", ProgramKind::SchedClassifier),
    ("lsm/", ProgramKind::Lsm),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramSpec {
    pub name: String,
    pub kind: ProgramKind,
    /// Full ELF section name, e.g. `kretprobe/tcp_connect`
    pub section_name: String,
    /// Section name without its kind prefix, e.g. `tcp_connect`
    pub attach_to: String,
}

impl ProgramSpec {
    /// Derives kind and attach target from the ELF section naming convention.
    ///
    /// ```
    /// use probekit::ebpf::collection::{ProgramKind, ProgramSpec};
    ///
    /// let prog = ProgramSpec::from_section("trace_exec", "tracepoint/sched/sched_process_exec");
    /// assert_eq!(prog.kind, ProgramKind::TracePoint);
    /// assert_eq!(prog.attach_to, "sched/sched_process_exec");
    /// ```
    pub fn from_section(name: impl Into<String>, section: &str) -> Self {
        let (kind, attach_to) = SECTION_KINDS
            .iter()
            .find(|(prefix, _)| section.starts_with(prefix))
            .map(|(prefix, kind)| {
                let attach_to = section[prefix.len()..].trim_start_matches('/');
                (*kind, attach_to.to_string())
            })
            .unwrap_or((ProgramKind::Unknown, String::new()));

        Self {
            name: name.into(),
            kind,
            section_name: section.to_string(),
            attach_to,
        }
    }
}

/// Value of a runtime constant in the bundle's read-only data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstValue {
    Bool(bool),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
}

impl ConstValue {
    pub const fn size(&self) -> usize {
        match self {
            ConstValue::Bool(_) | ConstValue::U8(_) | ConstValue::I8(_) => 1,
            ConstValue::U16(_) | ConstValue::I16(_) => 2,
            ConstValue::U32(_) | ConstValue::I32(_) => 4,
            ConstValue::U64(_) | ConstValue::I64(_) => 8,
        }
    }

    /// Native-endian encoding as stored in the object's data section
    pub fn to_ne_bytes(&self) -> Vec<u8> {
        match *self {
            ConstValue::Bool(v) => vec![u8::from(v)],
            ConstValue::U8(v) => v.to_ne_bytes().to_vec(),
            ConstValue::U16(v) => v.to_ne_bytes().to_vec(),
            ConstValue::U32(v) => v.to_ne_bytes().to_vec(),
            ConstValue::U64(v) => v.to_ne_bytes().to_vec(),
            ConstValue::I8(v) => v.to_ne_bytes().to_vec(),
            ConstValue::I16(v) => v.to_ne_bytes().to_vec(),
            ConstValue::I32(v) => v.to_ne_bytes().to_vec(),
            ConstValue::I64(v) => v.to_ne_bytes().to_vec(),
        }
    }
}

impl fmt::Display for ConstValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConstValue::Bool(v) => write!(f, "{}", v),
            ConstValue::U8(v) => write!(f, "{}", v),
            ConstValue::U16(v) => write!(f, "{}", v),
            ConstValue::U32(v) => write!(f, "{}", v),
            ConstValue::U64(v) => write!(f, "{}", v),
            ConstValue::I8(v) => write!(f, "{}", v),
            ConstValue::I16(v) => write!(f, "{}", v),
            ConstValue::I32(v) => write!(f, "{}", v),
            ConstValue::I64(v) => write!(f, "{}", v),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Constant {
    /// Size in bytes of the variable in the object
    pub size: usize,
    /// Value to write before loading; `None` keeps the compiled-in value
    pub value: Option<ConstValue>,
}

impl Constant {
    pub fn new(size: usize) -> Self {
        Self { size, value: None }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CollectionSpec {
    /// The object file the spec was read from
    pub object: Bytes,
    pub programs: BTreeMap<String, ProgramSpec>,
    pub maps: BTreeMap<String, MapSpec>,
    pub constants: BTreeMap<String, Constant>,
    /// Global identifiers declared by the object, including marker variables
    pub idents: BTreeSet<String>,
}

impl CollectionSpec {
    pub fn new(object: Bytes) -> Self {
        Self {
            object,
            ..Self::default()
        }
    }

    pub fn add_program(&mut self, program: ProgramSpec) {
        self.programs.insert(program.name.clone(), program);
    }

    pub fn add_map(&mut self, map: MapSpec) {
        self.maps.insert(map.name.clone(), map);
    }

    pub fn map_mut(&mut self, name: &str) -> Result<&mut MapSpec> {
        self.maps
            .get_mut(name)
            .ok_or_else(|| ProbekitError::MapNotFound(name.to_string()))
    }

    pub fn has_ident(&self, name: &str) -> bool {
        self.idents.contains(name)
    }

    /// Programs of the given kind, in name order
    pub fn programs_of_kind(&self, kind: ProgramKind) -> impl Iterator<Item = &ProgramSpec> {
        self.programs.values().filter(move |p| p.kind == kind)
    }

    /// Sets runtime constants before load.
    ///
    /// Every name must be declared by the object with a matching size;
    /// otherwise nothing is changed and an error naming the offenders is
    /// returned.
    pub fn rewrite_constants(&mut self, values: &BTreeMap<String, ConstValue>) -> Result<()> {
        let missing: Vec<&str> = values
            .keys()
            .filter(|name| !self.constants.contains_key(name.as_str()))
            .map(String::as_str)
            .collect();
        if !missing.is_empty() {
            return Err(ProbekitError::ConstantRewriteFailed(format!(
                "some constants are missing from .rodata: {}",
                missing.join(", ")
            )));
        }

        for (name, value) in values {
            if let Some(constant) = self.constants.get(name) {
                if constant.size != value.size() {
                    return Err(ProbekitError::ConstantRewriteFailed(format!(
                        "constant {} has size {}, value {} has size {}",
                        name,
                        constant.size,
                        value,
                        value.size()
                    )));
                }
            }
        }

        for (name, value) in values {
            if let Some(constant) = self.constants.get_mut(name) {
                constant.value = Some(*value);
            }
        }
        Ok(())
    }
}
