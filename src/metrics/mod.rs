pub mod collector;
pub mod exporter;

pub use collector::{DeliveryMode, TracerMetrics};
pub use exporter::PrometheusExporter;
