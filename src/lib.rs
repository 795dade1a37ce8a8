pub mod cli;
pub mod clock;
pub mod container;
pub mod ebpf;
pub mod error;
pub mod metadata;
pub mod metrics;
pub mod tracer;

pub use error::{ProbekitError, Result};
pub use tracer::{Environment, RunContext, Tracer, TracerConfig};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
