//! Host services this agent does not provide
//!
//! Bundles using socket filter programs or the sockets map need a network
//! tracer or socket enricher from the embedding runtime. The agent reports
//! them as unsupported so the tracer fails before loading anything.

use probekit::ebpf::collection::ProgramSpec;
use probekit::ebpf::kernel::{
    NetworkTracer, NetworkTracerFactory, SocketEnricher, SocketEnricherFactory,
};
use probekit::{ProbekitError, Result};
use std::sync::Arc;

pub struct NoNetworkTracers;

impl NetworkTracerFactory for NoNetworkTracers {
    fn create(&self, program: &ProgramSpec) -> Result<Arc<dyn NetworkTracer>> {
        Err(ProbekitError::UnsupportedFeature(format!(
            "socket filter program {} needs a network tracer",
            program.name
        )))
    }
}

pub struct NoSocketEnricher;

impl SocketEnricherFactory for NoSocketEnricher {
    fn create(&self) -> Result<Box<dyn SocketEnricher>> {
        Err(ProbekitError::UnsupportedFeature(
            "socket enrichment".to_string(),
        ))
    }
}
