use bytes::Bytes;
use probekit_common::protocol;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::time::SystemTime;

/// A decoded probe record
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Event {
    /// Mount namespace id, 0 when the record carries none
    pub mntns_id: u64,
    /// Network namespace the record was collected in (snapshots only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub netns_id: Option<u64>,
    pub l3_endpoints: Vec<L3Endpoint>,
    pub l4_endpoints: Vec<L4Endpoint>,
    pub timestamps: Vec<SystemTime>,
    /// Enum members rendered as strings, keyed by member name
    pub fields: BTreeMap<String, String>,
    /// The record exactly as produced by the probe
    #[serde(skip)]
    pub raw: Bytes,
}

impl Event {
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct L3Endpoint {
    pub name: String,
    pub addr: String,
    pub version: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct L4Endpoint {
    pub name: String,
    pub addr: String,
    pub version: u8,
    pub port: u16,
    pub proto: u16,
}

impl L4Endpoint {
    pub fn protocol(&self) -> Protocol {
        Protocol::from(self.proto)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
    Icmp,
    Icmpv6,
    Other(u16),
}

impl From<u16> for Protocol {
    fn from(proto: u16) -> Self {
        match proto {
            protocol::TCP => Protocol::Tcp,
            protocol::UDP => Protocol::Udp,
            protocol::ICMP => Protocol::Icmp,
            protocol::ICMPV6 => Protocol::Icmpv6,
            other => Protocol::Other(other),
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "TCP"),
            Protocol::Udp => write!(f, "UDP"),
            Protocol::Icmp => write!(f, "ICMP"),
            Protocol::Icmpv6 => write!(f, "ICMPv6"),
            Protocol::Other(proto) => write!(f, "Protocol({})", proto),
        }
    }
}

/// Creates events and knows which named fields consumers can receive
///
/// The binding is supplied with the bundle: enum members are only rendered
/// into fields the factory declares.
#[derive(Debug, Clone, Default)]
pub struct EventFactory {
    fields: BTreeSet<String>,
}

impl EventFactory {
    pub fn new<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fields: fields.into_iter().map(Into::into).collect(),
        }
    }

    pub fn new_event(&self) -> Event {
        Event::default()
    }

    pub fn binds(&self, field: &str) -> bool {
        self.fields.contains(field)
    }

    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(String::as_str)
    }
}
