use super::events::{Event, EventFactory, L3Endpoint, L4Endpoint};
use super::plan::{read_array, DecodePlan, EndpointField, EndpointKind};
use crate::clock::BootClock;
use bytes::Bytes;
use probekit_common::offsets;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use tracing::warn;

/// A compiled plan bundled with what decoding needs, shared by the
/// streaming task and the snapshot runner
#[derive(Clone)]
pub struct EventDecoder {
    plan: Arc<DecodePlan>,
    factory: Arc<EventFactory>,
    clock: Arc<dyn BootClock>,
}

impl EventDecoder {
    pub fn new(plan: Arc<DecodePlan>, factory: Arc<EventFactory>, clock: Arc<dyn BootClock>) -> Self {
        Self {
            plan,
            factory,
            clock,
        }
    }

    pub fn plan(&self) -> &Arc<DecodePlan> {
        &self.plan
    }

    pub fn decode(&self, sample: Bytes) -> Event {
        decode(&self.plan, sample, &self.factory, self.clock.as_ref())
    }
}

/// Decodes one record with a compiled plan.
///
/// Never fails: fields that cannot be read from `sample` are left out and
/// logged. The sample is kept as the event's raw payload.
pub fn decode(
    plan: &DecodePlan,
    sample: Bytes,
    factory: &EventFactory,
    clock: &dyn BootClock,
) -> Event {
    let mut event = factory.new_event();
    let data = sample.as_ref();

    if let Some(offset) = plan.mntns_id {
        match read_array::<8>(data, offset) {
            Some(raw) => event.mntns_id = u64::from_ne_bytes(raw),
            None => warn!("Mount namespace id at offset {} is out of the sample", offset),
        }
    }

    for field in &plan.endpoints {
        match field.kind {
            EndpointKind::L3 => {
                if let Some((addr, version)) = read_l3(field, data, field.offset) {
                    event.l3_endpoints.push(L3Endpoint {
                        name: field.name.clone(),
                        addr,
                        version,
                    });
                }
            }
            EndpointKind::L4 => {
                let port = read_array::<2>(data, field.offset + offsets::L4_PORT);
                let proto = read_array::<2>(data, field.offset + offsets::L4_PROTO);
                let (Some(port), Some(proto)) = (port, proto) else {
                    warn!("Endpoint {} is out of the sample", field.name);
                    continue;
                };
                if let Some((addr, version)) = read_l3(field, data, field.offset) {
                    event.l4_endpoints.push(L4Endpoint {
                        name: field.name.clone(),
                        addr,
                        version,
                        port: u16::from_ne_bytes(port),
                        proto: u16::from_ne_bytes(proto),
                    });
                }
            }
        }
    }

    for &offset in &plan.timestamps {
        match read_array::<8>(data, offset) {
            Some(raw) => event
                .timestamps
                .push(clock.wall_clock(u64::from_ne_bytes(raw))),
            None => warn!("Timestamp at offset {} is out of the sample", offset),
        }
    }

    for field in &plan.enums {
        match field.reader.read(data, field.offset) {
            Some(value) => {
                event
                    .fields
                    .insert(field.name.clone(), field.label(value).to_string());
            }
            None => warn!("Enum {} is out of the sample", field.name),
        }
    }

    event.raw = sample;
    event
}

/// Address text and version of an L3 endpoint starting at `offset`
fn read_l3(field: &EndpointField, data: &[u8], offset: usize) -> Option<(String, u8)> {
    let addr = read_array::<16>(data, offset + offsets::L3_ADDR);
    let version = read_array::<1>(data, offset + offsets::L3_VERSION);
    let (Some(addr), Some([version])) = (addr, version) else {
        warn!("Endpoint {} is out of the sample", field.name);
        return None;
    };

    match version {
        4 => {
            let v4 = Ipv4Addr::new(addr[0], addr[1], addr[2], addr[3]);
            Some((v4.to_string(), version))
        }
        6 => Some((Ipv6Addr::from(addr).to_string(), version)),
        other => {
            warn!("Endpoint {}: bad IP version received: {}", field.name, other);
            None
        }
    }
}
