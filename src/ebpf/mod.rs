pub mod attach;
pub mod btf;
pub mod buffer;
pub mod collection;
pub mod decode;
pub mod events;
pub mod kernel;
pub mod loader;
pub mod maps;
pub mod plan;
pub mod snapshot;

pub use attach::{AttachTarget, IterScope};
pub use buffer::RingBufferPolicy;
pub use collection::{CollectionSpec, ConstValue, ProgramKind, ProgramSpec};
pub use decode::{decode, EventDecoder};
pub use events::{Event, EventFactory};
pub use kernel::{
    Collection, IterLink, Kernel, Link, NetworkTracer, NetworkTracerFactory, RecordReader,
    SocketEnricher, SocketEnricherFactory,
};
pub use loader::{BundleLoader, InfoProvider, ProbeInfo};
pub use plan::{compile, CompileWarning, DecodePlan};
