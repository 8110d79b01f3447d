//! Pipeline metrics
//!
//! Counters and histograms are recorded through the `metrics` facade; when no
//! recorder is installed they are no-ops. The CLI installs a Prometheus
//! recorder only when a snapshot file is requested.

use metrics::{counter, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::fs;
use std::path::Path;
use tracing::warn;

use crate::error::Result;
use crate::pipeline::processing::reference::Status;

/// Install the global Prometheus recorder. Returns `None` if one is already
/// installed.
pub fn install_recorder() -> Option<PrometheusHandle> {
    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => Some(handle),
        Err(e) => {
            warn!("Prometheus recorder install failed (possibly already installed): {}", e);
            None
        }
    }
}

/// Write the current metric values in Prometheus text format
pub fn write_snapshot(handle: &PrometheusHandle, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    fs::write(path, handle.render())?;
    Ok(())
}

/// Metrics for the extraction-and-evaluation pipeline
pub struct PipelineMetrics;

impl PipelineMetrics {
    /// Record a document that produced a row
    pub fn record_document_processed(tests_extracted: usize, duration_secs: f64) {
        counter!("lab_documents_processed_total").increment(1);
        counter!("lab_tests_extracted_total").increment(tests_extracted as u64);
        histogram!("lab_tests_per_document").record(tests_extracted as f64);
        histogram!("lab_document_duration_seconds").record(duration_secs);
    }

    /// Record a skipped document, labelled by error kind
    pub fn record_document_skipped(reason: &'static str) {
        counter!("lab_documents_skipped_total", "reason" => reason).increment(1);
    }

    pub fn record_status(status: &Status) {
        counter!("lab_results_total", "status" => status.label()).increment(1);
    }

    pub fn record_batch(documents: usize, duration_secs: f64) {
        counter!("lab_batches_total").increment(1);
        histogram!("lab_batch_documents").record(documents as f64);
        histogram!("lab_batch_duration_seconds").record(duration_secs);
    }
}
