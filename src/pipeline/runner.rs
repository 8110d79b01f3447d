use chrono::NaiveDate;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinError;
use tokio::time::error::Elapsed;
use tokio::time::timeout;
use tracing::{error, info, info_span, warn, Instrument, Span};
use uuid::Uuid;

use super::ingestion::{discover_documents, source_file_name};
use super::processing::aggregate::{AggregatedRecord, Batch, SkipRecord};
use super::processing::reference::GenderPolicy;
use super::{DocumentPipeline, Tables};
use crate::config::ProcessingConfig;
use crate::error::{LabError, Result};
use crate::metrics::PipelineMetrics;

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub workers: usize,
    pub document_timeout: Duration,
    pub processing_date: NaiveDate,
    pub gender_policy: GenderPolicy,
}

impl RunOptions {
    pub fn from_config(config: &ProcessingConfig) -> Self {
        Self {
            workers: config.workers.max(1),
            document_timeout: Duration::from_secs(config.document_timeout_secs),
            processing_date: config.processing_date(),
            gender_policy: config.gender_policy,
        }
    }
}

/// Result of a complete batch run
#[derive(Debug)]
pub struct BatchOutcome {
    pub run_id: Uuid,
    pub documents: usize,
    pub batch: Batch,
    pub skipped: Vec<SkipRecord>,
    pub duration: Duration,
}

enum DocumentOutcome {
    Processed(AggregatedRecord),
    Skipped(SkipRecord),
}

/// Bounded worker pool over a document list.
///
/// Each document runs on the blocking pool under its own deadline and
/// reports to a single collector; a failing document becomes a skip and
/// never aborts the batch.
pub struct BatchRunner {
    tables: Arc<Tables>,
    options: RunOptions,
}

impl BatchRunner {
    pub fn new(tables: Arc<Tables>, options: RunOptions) -> Self {
        Self { tables, options }
    }

    /// Process every supported document in `input_dir`. Only an unavailable
    /// input directory fails the whole run.
    pub async fn run_dir(&self, input_dir: &Path) -> Result<BatchOutcome> {
        let paths = discover_documents(input_dir)?;
        info!(
            "📂 Found {} documents in {}",
            paths.len(),
            input_dir.display()
        );
        self.run_paths(paths).await
    }

    pub async fn run_paths(&self, paths: Vec<PathBuf>) -> Result<BatchOutcome> {
        let run_id = Uuid::new_v4();
        let span = info_span!("batch", run_id = %run_id);
        self.run_inner(run_id, paths).instrument(span).await
    }

    async fn run_inner(&self, run_id: Uuid, paths: Vec<PathBuf>) -> Result<BatchOutcome> {
        let started = Instant::now();
        let documents = paths.len();
        let workers = self.options.workers.max(1);
        info!("🚀 Starting batch of {} documents with {} workers", documents, workers);

        let semaphore = Arc::new(Semaphore::new(workers));
        let (tx, mut rx) = mpsc::channel::<DocumentOutcome>(workers * 2);

        let collector = tokio::spawn(async move {
            let mut batch = Batch::default();
            let mut skipped = Vec::new();
            while let Some(outcome) = rx.recv().await {
                match outcome {
                    DocumentOutcome::Processed(record) => batch.push(record),
                    DocumentOutcome::Skipped(skip) => skipped.push(skip),
                }
            }
            (batch, skipped)
        });

        let mut handles = Vec::with_capacity(documents);
        for path in paths {
            let tx = tx.clone();
            let semaphore = Arc::clone(&semaphore);
            let tables = Arc::clone(&self.tables);
            let options = self.options.clone();

            let task = async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return;
                };
                let outcome = process_document(tables, path, options).await;
                if tx.send(outcome).await.is_err() {
                    error!("Collector stopped before all documents reported");
                }
            };
            handles.push(tokio::spawn(task.in_current_span()));
        }
        drop(tx);

        for handle in handles {
            if let Err(e) = handle.await {
                error!("Document task failed: {}", e);
            }
        }

        let (mut batch, mut skipped) = collector
            .await
            .map_err(|e| LabError::Task(format!("collector task failed: {}", e)))?;
        batch.sort_by_source();
        skipped.sort_by(|a, b| a.source_file.cmp(&b.source_file));

        let duration = started.elapsed();
        PipelineMetrics::record_batch(documents, duration.as_secs_f64());
        info!(
            "✅ Processed {} documents ({} rows, {} skipped) in {:.2}s",
            documents,
            batch.len(),
            skipped.len(),
            duration.as_secs_f64()
        );

        Ok(BatchOutcome {
            run_id,
            documents,
            batch,
            skipped,
            duration,
        })
    }
}

async fn process_document(tables: Arc<Tables>, path: PathBuf, options: RunOptions) -> DocumentOutcome {
    let source_file = source_file_name(&path);
    let started = Instant::now();
    let span = Span::current();

    let work_path = path.clone();
    let work = tokio::task::spawn_blocking(move || {
        let _entered = span.enter();
        DocumentPipeline::new(&tables, options.processing_date, options.gender_policy)
            .process_path(&work_path)
    });

    // a timed-out blocking task keeps running; its result is discarded
    let settled = timeout(options.document_timeout, work).await;
    match settle(&path, options.document_timeout, settled) {
        Ok(record) => {
            let secs = started.elapsed().as_secs_f64();
            PipelineMetrics::record_document_processed(record.results.len(), secs);
            for result in &record.results {
                PipelineMetrics::record_status(&result.status);
            }
            info!(file = %source_file, tests = record.results.len(), "📄 Processed document");
            DocumentOutcome::Processed(record)
        }
        Err(e) => {
            PipelineMetrics::record_document_skipped(e.kind());
            warn!(file = %source_file, reason = e.kind(), "Skipping document: {}", e);
            DocumentOutcome::Skipped(SkipRecord::from_error(&source_file, &e))
        }
    }
}

/// Fold the deadline and join layers around a document's work into the
/// document's own result.
fn settle<T>(
    path: &Path,
    deadline: Duration,
    settled: std::result::Result<std::result::Result<Result<T>, JoinError>, Elapsed>,
) -> Result<T> {
    match settled {
        Ok(Ok(result)) => result,
        Ok(Err(join_error)) => Err(LabError::DocumentRead {
            path: path.to_path_buf(),
            reason: format!("processing aborted: {}", join_error),
        }),
        Err(_) => Err(LabError::DocumentTimeout {
            source_file: source_file_name(path),
            seconds: deadline.as_secs(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report_path() -> PathBuf {
        PathBuf::from("input/laudo.txt")
    }

    #[tokio::test]
    async fn panicking_work_becomes_a_read_skip() {
        let work = tokio::task::spawn_blocking(|| -> Result<u32> { panic!("extractor blew up") });
        let settled = timeout(Duration::from_secs(5), work).await;

        let err = settle(&report_path(), Duration::from_secs(5), settled).unwrap_err();
        assert_eq!(err.kind(), "document_read");
        match err {
            LabError::DocumentRead { path, reason } => {
                assert_eq!(path, report_path());
                assert!(reason.starts_with("processing aborted"), "{reason}");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn elapsed_deadline_becomes_a_timeout_skip() {
        let never = std::future::pending::<std::result::Result<Result<u32>, JoinError>>();
        let settled = timeout(Duration::ZERO, never).await;

        let err = settle(&report_path(), Duration::from_secs(7), settled).unwrap_err();
        assert_eq!(err.kind(), "timeout");
        assert!(matches!(
            err,
            LabError::DocumentTimeout { ref source_file, seconds: 7 } if source_file == "laudo.txt"
        ));
        let skip = SkipRecord::from_error("laudo.txt", &err);
        assert_eq!(skip.reason, "timeout");
    }

    #[tokio::test]
    async fn finished_work_passes_through() {
        let work = tokio::task::spawn_blocking(|| -> Result<u32> { Ok(3) });
        let settled = timeout(Duration::from_secs(5), work).await;
        assert_eq!(settle(&report_path(), Duration::from_secs(5), settled).unwrap(), 3);

        let work = tokio::task::spawn_blocking(|| -> Result<u32> {
            Err(LabError::PatientParse {
                source_file: "laudo.txt".into(),
            })
        });
        let settled = timeout(Duration::from_secs(5), work).await;
        let err = settle(&report_path(), Duration::from_secs(5), settled).unwrap_err();
        assert_eq!(err.kind(), "patient_parse");
    }
}
