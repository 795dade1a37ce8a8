//! Shared types between probe bundles (kernel) and the probekit runtime
//!
//! Everything here is part of the contract with the producing side:
//! - `#[repr(C)]` endpoint layouts that probes embed in their event records
//! - type names the runtime recognizes in the bundle's type description
//! - reserved map and constant names the runtime rewrites before load

#![cfg_attr(not(feature = "userspace"), no_std)]

/// L3 endpoint as written by probes
///
/// Layout (20 bytes total):
/// - addr: IPv4 address in the first 4 bytes, or a full IPv6 address
/// - version: 4 or 6
/// - _pad: reserved, keeps the C and Rust layouts identical
#[repr(C)]
#[derive(Clone, Copy, Debug)]
#[cfg_attr(feature = "userspace", derive(PartialEq, Eq))]
pub struct L3EndpointRaw {
    pub addr: [u8; 16],
    pub version: u8,
    pub _pad: [u8; 3],
}

/// L4 endpoint as written by probes
///
/// Layout (24 bytes total): an [`L3EndpointRaw`] followed by the port and the
/// IP protocol number, both in host byte order.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
#[cfg_attr(feature = "userspace", derive(PartialEq, Eq))]
pub struct L4EndpointRaw {
    pub l3: L3EndpointRaw,
    pub port: u16,
    pub proto: u16,
}

pub const L3_ENDPOINT_SIZE: usize = core::mem::size_of::<L3EndpointRaw>();
pub const L4_ENDPOINT_SIZE: usize = core::mem::size_of::<L4EndpointRaw>();

/// Byte offsets inside the endpoint layouts
pub mod offsets {
    use super::{L3EndpointRaw, L4EndpointRaw};
    use core::mem::offset_of;

    pub const L3_ADDR: usize = offset_of!(L3EndpointRaw, addr);
    pub const L3_VERSION: usize = offset_of!(L3EndpointRaw, version);
    pub const L4_PORT: usize = offset_of!(L4EndpointRaw, port);
    pub const L4_PROTO: usize = offset_of!(L4EndpointRaw, proto);
}

/// Type names recognized in the event record's type description
pub mod type_names {
    pub const MNTNS_ID: &str = "pk_mntns_id";
    pub const TIMESTAMP: &str = "pk_timestamp";
    pub const L3_ENDPOINT: &str = "pk_l3endpoint_t";
    pub const L4_ENDPOINT: &str = "pk_l4endpoint_t";
}

/// Reserved map and constant names
pub mod reserved {
    /// Prefix of the identifier emitted by the tracer map declaration macro.
    /// `pk_map_tracer_events` marks the map `events` as the streaming buffer.
    pub const TRACER_MAP_PREFIX: &str = "pk_map_tracer_";
    /// Per-CPU scratch map used by probes when no ring buffer is available
    pub const HEAP_MAP: &str = "pk_heap";
    /// Mount namespace filter map, replaced by an externally supplied one
    pub const MNTNS_FILTER_MAP: &str = "pk_mntns_filter_map";
    /// Constant enabling the mount namespace filter inside the probe
    pub const FILTER_BY_MNTNS: &str = "pk_filter_by_mntns";
    /// Socket enrichment map, replaced by the enricher's own map
    pub const SOCKETS_MAP: &str = "pk_sockets";
}

/// IP protocol constants
pub mod protocol {
    pub const ICMP: u16 = 1;
    pub const TCP: u16 = 6;
    pub const UDP: u16 = 17;
    pub const ICMPV6: u16 = 58;
}

const _: () = {
    assert!(L3_ENDPOINT_SIZE == 20, "L3EndpointRaw must be exactly 20 bytes");
    assert!(L4_ENDPOINT_SIZE == 24, "L4EndpointRaw must be exactly 24 bytes");
    assert!(offsets::L3_VERSION == 16);
    assert!(offsets::L4_PORT == 20);
    assert!(offsets::L4_PROTO == 22);
};
