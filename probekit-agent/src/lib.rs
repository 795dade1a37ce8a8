//! Node agent for probekit
//!
//! Responsibilities:
//! - Load program bundles into the kernel through aya
//! - Read ring buffers and perf buffers for streamed records
//! - Resolve kernel enums from vmlinux BTF
//! - Turn local processes into containers for namespace tracking

pub mod host;
pub mod procfs;

#[cfg(target_os = "linux")]
pub mod kernel_types;
#[cfg(target_os = "linux")]
pub mod probe_loader;
#[cfg(target_os = "linux")]
pub mod readers;
