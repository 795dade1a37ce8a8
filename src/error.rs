use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProbekitError {
    #[error("Failed to load program bundle: {0}")]
    BundleLoadFailed(String),

    #[error("Failed to load eBPF collection: {0}")]
    CollectionLoadFailed(String),

    #[error("Rewriting constants: {0}")]
    ConstantRewriteFailed(String),

    #[error("Unsupported program {name:?} of type {kind} (section {section:?})")]
    UnsupportedProgram {
        name: String,
        kind: String,
        section: String,
    },

    #[error("Malformed tracepoint target {0:?}: expected <category>/<name>")]
    MalformedTracepoint(String),

    #[error("Unsupported iter type {0:?}")]
    UnsupportedIter(String),

    #[error("Attaching eBPF program {program:?}: {reason}")]
    AttachFailed { program: String, reason: String },

    #[error("Map {0:?} not found")]
    MapNotFound(String),

    #[error("Program {0:?} not found")]
    ProgramNotFound(String),

    #[error("Event type {0:?} not found in type description")]
    EventTypeNotFound(String),

    #[error("Bundle metadata declares neither tracers nor snapshotters")]
    NoEventSource,

    #[error("Creating socket enricher: {0}")]
    SocketEnricherFailed(String),

    #[error("Network tracer error: {0}")]
    NetworkTracerFailed(String),

    #[error("Creating buffer reader for map {map:?}: {reason}")]
    ReaderFailed { map: String, reason: String },

    #[error("Reading iterator: {0}")]
    IteratorFailed(String),

    #[error("Entering network namespace of pid {pid}: {reason}")]
    NetnsEnterFailed { pid: u32, reason: String },

    #[error("Process {0} no longer exists")]
    ProcessGone(u32),

    #[error("Invalid value {value:?} for parameter {key:?}: {reason}")]
    InvalidParam {
        key: String,
        value: String,
        reason: String,
    },

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Unsupported feature on this system: {0}")]
    UnsupportedFeature(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Metadata error: {0}")]
    MetadataError(#[from] serde_yaml::Error),

    #[error("Type description error: {0}")]
    TypeDescriptionError(#[from] serde_json::Error),

    #[error("Metrics error: {0}")]
    MetricsError(#[from] prometheus::Error),
}

pub type Result<T> = std::result::Result<T, ProbekitError>;
