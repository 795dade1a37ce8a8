//! Program attachment
//!
//! Where a program goes is decided by its kind and its section name; see
//! [`resolve`] for the table. The actual hook is created by the
//! [`Collection`] so the dispatch itself has no kernel dependency.

use super::collection::{ProgramKind, ProgramSpec};
use super::kernel::{Collection, IterLink, Link, NetworkTracer};
use crate::{ProbekitError, Result};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// What an iterator program walks, and so where it has to run
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum IterScope {
    /// All tasks, run from the host namespaces
    Task,
    /// TCP sockets, run once per network namespace
    Tcp,
    /// UDP sockets, run once per network namespace
    Udp,
}

impl IterScope {
    pub fn from_attach_to(attach_to: &str) -> Option<Self> {
        match attach_to {
            "task" => Some(IterScope::Task),
            "tcp" => Some(IterScope::Tcp),
            "udp" => Some(IterScope::Udp),
            _ => None,
        }
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            IterScope::Task => "task",
            IterScope::Tcp => "tcp",
            IterScope::Udp => "udp",
        }
    }

    pub const fn per_netns(&self) -> bool {
        matches!(self, IterScope::Tcp | IterScope::Udp)
    }
}

impl fmt::Display for IterScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Kernel hook producing a plain link
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachTarget {
    Kprobe { symbol: String },
    Kretprobe { symbol: String },
    Tracepoint { category: String, name: String },
    RawTracepoint { name: String },
    Fentry { function: String },
    Fexit { function: String },
}

impl fmt::Display for AttachTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttachTarget::Kprobe { symbol } => write!(f, "kprobe {}", symbol),
            AttachTarget::Kretprobe { symbol } => write!(f, "kretprobe {}", symbol),
            AttachTarget::Tracepoint { category, name } => {
                write!(f, "tracepoint {}/{}", category, name)
            }
            AttachTarget::RawTracepoint { name } => write!(f, "raw tracepoint {}", name),
            AttachTarget::Fentry { function } => write!(f, "fentry {}", function),
            AttachTarget::Fexit { function } => write!(f, "fexit {}", function),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachPlan {
    Link(AttachTarget),
    Iter(IterScope),
    /// Handed to the program's network tracer, no link of its own
    Socket,
}

/// Resolves where `program` attaches.
///
/// | Kind          | Section       | Result                          |
/// |---------------|---------------|---------------------------------|
/// | Kprobe        | `kprobe/`     | kprobe on `attach_to`           |
/// | Kprobe        | `kretprobe/`  | kretprobe on `attach_to`        |
/// | TracePoint    | any           | `category/name` from `attach_to`|
/// | SocketFilter  | `socket`      | network tracer                  |
/// | Tracing       | `iter/`       | iterator, task, tcp or udp      |
/// | Tracing       | `fentry/`     | fentry                          |
/// | Tracing       | `fexit/`      | fexit                           |
/// | RawTracepoint | any           | raw tracepoint on `attach_to`   |
pub fn resolve(program: &ProgramSpec) -> Result<AttachPlan> {
    let section = program.section_name.as_str();
    let attach_to = program.attach_to.clone();

    let plan = match program.kind {
        ProgramKind::Kprobe if section.starts_with("kprobe/") => {
            AttachPlan::Link(AttachTarget::Kprobe { symbol: attach_to })
        }
        ProgramKind::Kprobe if section.starts_with("kretprobe/") => {
            AttachPlan::Link(AttachTarget::Kretprobe { symbol: attach_to })
        }
        ProgramKind::TracePoint => {
            let parts: Vec<&str> = attach_to.split('/').collect();
            match parts.as_slice() {
                [category, name] if !category.is_empty() && !name.is_empty() => {
                    AttachPlan::Link(AttachTarget::Tracepoint {
                        category: category.to_string(),
                        name: name.to_string(),
                    })
                }
                _ => return Err(ProbekitError::MalformedTracepoint(attach_to)),
            }
        }
        ProgramKind::SocketFilter if section.starts_with("socket") => AttachPlan::Socket,
        ProgramKind::Tracing if section.starts_with("iter/") => {
            match IterScope::from_attach_to(&attach_to) {
                Some(scope) => AttachPlan::Iter(scope),
                None => return Err(ProbekitError::UnsupportedIter(attach_to)),
            }
        }
        ProgramKind::Tracing if section.starts_with("fentry/") => {
            AttachPlan::Link(AttachTarget::Fentry { function: attach_to })
        }
        ProgramKind::Tracing if section.starts_with("fexit/") => {
            AttachPlan::Link(AttachTarget::Fexit { function: attach_to })
        }
        ProgramKind::RawTracepoint => {
            AttachPlan::Link(AttachTarget::RawTracepoint { name: attach_to })
        }
        kind => {
            return Err(ProbekitError::UnsupportedProgram {
                name: program.name.clone(),
                kind: kind.to_string(),
                section: program.section_name.clone(),
            })
        }
    };
    Ok(plan)
}

/// Live result of attaching one program
pub enum Attached {
    Link(Box<dyn Link>),
    Iter(IterScope, Arc<dyn IterLink>),
    Socket,
}

impl fmt::Debug for Attached {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Attached::Link(_) => write!(f, "Link"),
            Attached::Iter(scope, _) => write!(f, "Iter({})", scope),
            Attached::Socket => write!(f, "Socket"),
        }
    }
}

/// Attaches one program to the hook its kind and section name call for
pub fn attach_program(
    collection: &mut dyn Collection,
    program: &ProgramSpec,
    network_tracers: &BTreeMap<String, Arc<dyn NetworkTracer>>,
) -> Result<Attached> {
    match resolve(program)? {
        AttachPlan::Link(target) => {
            debug!("Attaching {} program {:?} to {}", program.kind, program.name, target);
            collection.attach(&program.name, &target).map(Attached::Link)
        }
        AttachPlan::Iter(scope) => {
            debug!("Attaching iter {:?} to {}", program.name, scope);
            collection
                .attach_iter(&program.name, scope)
                .map(|link| Attached::Iter(scope, link))
        }
        AttachPlan::Socket => {
            debug!("Attaching socket filter {:?}", program.name);
            let tracer = network_tracers.get(&program.name).ok_or_else(|| {
                ProbekitError::NetworkTracerFailed(format!(
                    "no network tracer for program {:?}",
                    program.name
                ))
            })?;
            let handle = collection.program(&program.name)?;
            tracer.attach_program(&handle)?;
            Ok(Attached::Socket)
        }
    }
}
