use crate::metrics::collector::TracerMetrics;
use crate::Result;
use prometheus::{Encoder, TextEncoder};
use tracing::debug;

pub struct PrometheusExporter {
    metrics: TracerMetrics,
}

impl PrometheusExporter {
    pub fn new(metrics: TracerMetrics) -> Self {
        Self { metrics }
    }

    /// Renders every counter in the text exposition format
    pub fn format_metrics(&self) -> Result<String> {
        let families = self.metrics.registry().gather();
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&families, &mut buffer)?;
        debug!("Encoded {} metric families", families.len());

        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}
